use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bookkeeping for one delivered-but-unacknowledged entry. An entry appears
/// here from the moment `read_group` hands it to a consumer until that
/// consumer (or a claimant) acks it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEntry {
    pub ingest_id: u64,
    pub consumer: String,
    pub delivery_count: u32,
    pub first_delivered_at: DateTime<Utc>,
    pub last_delivered_at: DateTime<Utc>,
}

/// Per-consumer view returned by the pending summary.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct ConsumerPending {
    pub consumer: String,
    pub count: u64,
    pub oldest_idle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupState {
    pub name: String,
    pub last_delivered_id: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

impl GroupState {
    pub fn new(name: &str, start_after: u64) -> Self {
        Self {
            name: name.to_string(),
            last_delivered_id: start_after,
            pending: BTreeMap::new(),
        }
    }

    pub fn pending_len(&self) -> u64 {
        self.pending.len() as u64
    }

    /// Mark `ids` delivered to `consumer`, advancing the group cursor. Ids are
    /// expected in ascending order (the stream hands them out that way).
    pub fn deliver(&mut self, consumer: &str, ids: &[u64], now: DateTime<Utc>) {
        for &id in ids {
            self.pending.insert(
                id,
                PendingEntry {
                    ingest_id: id,
                    consumer: consumer.to_string(),
                    delivery_count: 1,
                    first_delivered_at: now,
                    last_delivered_at: now,
                },
            );
            if id > self.last_delivered_id {
                self.last_delivered_id = id;
            }
        }
    }

    /// Remove acknowledged entries. Unknown ids are no-ops; returns how many
    /// entries were actually removed.
    pub fn ack(&mut self, ids: &[u64]) -> u64 {
        let mut removed = 0;
        for id in ids {
            if self.pending.remove(id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Transfer pending entries to `new_consumer`. With `ids = Some(..)` only
    /// those ids are considered; with `None` every pending entry is scanned.
    /// Only entries idle for at least `min_idle_ms` move; each transfer bumps
    /// the delivery count. Returns the transferred ids in ascending order.
    pub fn claim(
        &mut self,
        new_consumer: &str,
        min_idle_ms: u64,
        ids: Option<&[u64]>,
        now: DateTime<Utc>,
    ) -> Vec<u64> {
        let candidates: Vec<u64> = match ids {
            Some(ids) => {
                let mut ids = ids.to_vec();
                ids.sort_unstable();
                ids
            }
            None => self.pending.keys().copied().collect(),
        };

        let mut claimed = Vec::new();
        for id in candidates {
            let Some(entry) = self.pending.get_mut(&id) else {
                continue;
            };
            let idle_ms = (now - entry.last_delivered_at).num_milliseconds().max(0) as u64;
            if idle_ms < min_idle_ms {
                continue;
            }
            entry.consumer = new_consumer.to_string();
            entry.delivery_count += 1;
            entry.last_delivered_at = now;
            claimed.push(id);
        }
        claimed
    }

    /// Ids currently pending for one consumer, ascending.
    pub fn pending_ids_for(&self, consumer: &str) -> Vec<u64> {
        self.pending
            .values()
            .filter(|entry| entry.consumer == consumer)
            .map(|entry| entry.ingest_id)
            .collect()
    }

    pub fn summary(&self, now: DateTime<Utc>) -> Vec<ConsumerPending> {
        let mut per_consumer: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
        for entry in self.pending.values() {
            let idle_ms = (now - entry.last_delivered_at).num_milliseconds().max(0) as u64;
            let slot = per_consumer.entry(entry.consumer.as_str()).or_insert((0, 0));
            slot.0 += 1;
            slot.1 = slot.1.max(idle_ms);
        }
        per_consumer
            .into_iter()
            .map(|(consumer, (count, oldest_idle_ms))| ConsumerPending {
                consumer: consumer.to_string(),
                count,
                oldest_idle_ms,
            })
            .collect()
    }

    /// Highest id that may be trimmed away without losing state: everything
    /// below the lowest pending entry and at or below the cursor is acked.
    pub fn trim_floor(&self) -> u64 {
        match self.pending.keys().next() {
            Some(lowest_pending) => *lowest_pending,
            None => self.last_delivered_id.saturating_add(1),
        }
    }

    /// Drop pending entries below the stream's retained floor. This only
    /// happens when segments were deleted out from under a pending entry by
    /// an earlier crash; the records are gone, so the entries must go too.
    pub fn drop_below(&mut self, first_id: u64) -> u64 {
        let keep = self.pending.split_off(&first_id);
        let dropped = self.pending.len() as u64;
        self.pending = keep;
        dropped
    }

    pub fn delivery_count(&self, id: u64) -> Option<u32> {
        self.pending.get(&id).map(|entry| entry.delivery_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn deliver_advances_cursor_and_tracks_pending() {
        let mut group = GroupState::new("log_workers", 0);
        group.deliver("c1", &[1, 2, 3], now());
        assert_eq!(group.last_delivered_id, 3);
        assert_eq!(group.pending_len(), 3);
        assert_eq!(group.pending_ids_for("c1"), vec![1, 2, 3]);
    }

    #[test]
    fn ack_removes_only_known_ids() {
        let mut group = GroupState::new("log_workers", 0);
        group.deliver("c1", &[1, 2], now());
        assert_eq!(group.ack(&[1, 9]), 1);
        assert_eq!(group.pending_len(), 1);
        // Acking twice is a no-op.
        assert_eq!(group.ack(&[1]), 0);
    }

    #[test]
    fn claim_respects_idle_threshold() {
        let mut group = GroupState::new("log_workers", 0);
        let t0 = now();
        group.deliver("dead", &[1, 2], t0);
        // Nothing idle long enough yet.
        let claimed = group.claim("alive", 60_000, None, t0 + Duration::seconds(1));
        assert!(claimed.is_empty());

        let later = t0 + Duration::seconds(120);
        let claimed = group.claim("alive", 60_000, None, later);
        assert_eq!(claimed, vec![1, 2]);
        assert_eq!(group.pending_ids_for("alive"), vec![1, 2]);
        assert_eq!(group.pending_ids_for("dead"), Vec::<u64>::new());
        assert_eq!(group.delivery_count(1), Some(2));
    }

    #[test]
    fn claim_with_explicit_ids_skips_unknown() {
        let mut group = GroupState::new("log_workers", 0);
        let t0 = now();
        group.deliver("dead", &[5], t0);
        let claimed = group.claim("alive", 0, Some(&[5, 6]), t0);
        assert_eq!(claimed, vec![5]);
    }

    #[test]
    fn claim_resets_idle_clock() {
        let mut group = GroupState::new("log_workers", 0);
        let t0 = now();
        group.deliver("c1", &[1], t0);
        let t1 = t0 + Duration::seconds(120);
        assert_eq!(group.claim("c2", 60_000, None, t1), vec![1]);
        // Freshly claimed: idle restarts, a second sweep finds nothing.
        assert!(group.claim("c3", 60_000, None, t1 + Duration::seconds(1)).is_empty());
    }

    #[test]
    fn summary_reports_per_consumer_idle() {
        let mut group = GroupState::new("log_workers", 0);
        let t0 = now();
        group.deliver("c1", &[1, 2], t0 - Duration::seconds(30));
        group.deliver("c2", &[3], t0);
        let summary = group.summary(t0);
        assert_eq!(summary.len(), 2);
        let c1 = summary.iter().find(|s| s.consumer == "c1").unwrap();
        assert_eq!(c1.count, 2);
        assert!(c1.oldest_idle_ms >= 29_000);
    }

    #[test]
    fn trim_floor_never_exposes_pending_entries() {
        let mut group = GroupState::new("log_workers", 0);
        group.deliver("c1", &[4, 5, 6], now());
        group.ack(&[5]);
        // 4 is still pending, so nothing at or above 4 may be trimmed.
        assert_eq!(group.trim_floor(), 4);
        group.ack(&[4, 6]);
        assert_eq!(group.trim_floor(), 7);
    }
}
