//! Retention selection.
//!
//! Per host, the newest `keep_min_count` snapshots always survive. Of the
//! rest, anything at least `max_age_days` old expires. `max_size_mb` is
//! carried in the policy but not enforced.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use super::types::SnapshotRecord;
use crate::config::RetentionPolicy;

/// Records that should be removed under `policy` at time `now`.
pub fn select_expired<'a>(
    records: &'a [SnapshotRecord],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<&'a SnapshotRecord> {
    let max_age = Duration::days(i64::from(policy.max_age_days));

    let mut by_host: HashMap<&str, Vec<&SnapshotRecord>> = HashMap::new();
    for record in records {
        by_host.entry(record.host_id.as_str()).or_default().push(record);
    }

    let mut expired = Vec::new();
    for mut host_records in by_host.into_values() {
        host_records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        expired.extend(
            host_records
                .into_iter()
                .skip(policy.keep_min_count)
                .filter(|r| now - r.timestamp >= max_age),
        );
    }
    expired.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    expired
}
