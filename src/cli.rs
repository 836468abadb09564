use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "log-collector", about = "Device log collection pipeline")]
pub struct Args {
    /// Address to bind the HTTP listener on.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port for the HTTP listener.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Override the worker count from the environment.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Print the OpenAPI document as JSON and exit.
    #[arg(long, default_value_t = false)]
    pub print_openapi: bool,
}
