use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const MAX_DEVICE_ID_LEN: usize = 50;
pub const MAX_MESSAGE_LEN: usize = 1000;
pub const MAX_BATCH_LEN: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        for level in [
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warning,
            LogLevel::Error,
            LogLevel::Critical,
        ] {
            if trimmed.eq_ignore_ascii_case(level.as_str()) {
                return Some(level);
            }
        }
        None
    }
}

/// The canonical record flowing through queue and store. Timestamps are always
/// resolved by the time a record is enqueued.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct LogRecord {
    pub device_id: String,
    pub log_level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_data: Option<JsonValue>,
}

/// Wire shape accepted from clients. Levels arrive as strings and timestamps
/// in whatever form the device firmware emits; `validate` narrows both.
#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
pub struct LogSubmission {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub log_level: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<TimestampInput>,
    #[serde(default)]
    pub log_data: Option<JsonValue>,
}

#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
#[serde(untagged)]
pub enum TimestampInput {
    Rfc3339(String),
    EpochMillis(i64),
    EpochSeconds(f64),
}

impl TimestampInput {
    fn resolve(&self) -> Option<DateTime<Utc>> {
        match self {
            TimestampInput::Rfc3339(raw) => DateTime::parse_from_rfc3339(raw.trim())
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            TimestampInput::EpochMillis(ms) => millis_to_dt(*ms),
            TimestampInput::EpochSeconds(secs) => {
                if !secs.is_finite() {
                    return None;
                }
                millis_to_dt((*secs * 1000.0) as i64)
            }
        }
    }
}

fn millis_to_dt(ms: i64) -> Option<DateTime<Utc>> {
    let secs = ms.div_euclid(1000);
    let nanos = (ms.rem_euclid(1000) * 1_000_000) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

impl LogSubmission {
    /// Validate bounds and produce the strict record, assigning `now` when the
    /// client supplied no timestamp.
    pub fn validate(self, now: DateTime<Utc>) -> Result<LogRecord, String> {
        let device_id = self.device_id.trim().to_string();
        if device_id.is_empty() {
            return Err("device_id cannot be blank".to_string());
        }
        if device_id.len() > MAX_DEVICE_ID_LEN {
            return Err(format!(
                "device_id exceeds {MAX_DEVICE_ID_LEN} characters"
            ));
        }

        let Some(log_level) = LogLevel::parse(&self.log_level) else {
            return Err(format!(
                "log_level must be one of DEBUG, INFO, WARNING, ERROR, CRITICAL (got {:?})",
                self.log_level
            ));
        };

        if self.message.trim().is_empty() {
            return Err("message cannot be blank".to_string());
        }
        if self.message.len() > MAX_MESSAGE_LEN {
            return Err(format!("message exceeds {MAX_MESSAGE_LEN} characters"));
        }

        let timestamp = match &self.timestamp {
            Some(input) => input
                .resolve()
                .ok_or_else(|| "timestamp is not a valid RFC3339 string or epoch value".to_string())?,
            None => now,
        };

        Ok(LogRecord {
            device_id,
            log_level,
            message: self.message,
            timestamp,
            log_data: self.log_data,
        })
    }
}
