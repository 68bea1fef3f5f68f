//! Rolling spend totals
//!
//! The daily window runs from UTC midnight; the hourly window is the last
//! 3600 seconds. Records older than 24 hours can no longer affect either
//! window and are pruned on every write.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use agentvault_common::error::WalletResult;
use agentvault_common::storage;
use agentvault_common::version::STATE_FORMAT_VERSION;

use crate::{files, lock_or_recover};

const RETENTION_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendRecord {
    pub amount: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub txid: Option<String>,
}

/// Totals at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimitUsage {
    pub daily_total: u64,
    pub hourly_total: u64,
    pub daily_count: u32,
    pub last_spend: Option<DateTime<Utc>>,
}

/// Spends committed to but not yet recorded, such as queued approvals
///
/// They count against every cap until they are executed or dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub amount: u64,
    pub count: u32,
}

impl Reservation {
    pub fn add(&mut self, amount: u64) {
        self.amount = self.amount.saturating_add(amount);
        self.count = self.count.saturating_add(1);
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SpendDocument {
    version: u32,
    records: Vec<SpendRecord>,
}

fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

pub struct LimitTracker {
    path: PathBuf,
    records: Mutex<Vec<SpendRecord>>,
}

impl LimitTracker {
    pub fn open(data_dir: &Path) -> WalletResult<Self> {
        let path = data_dir.join(files::SPEND_RECORDS);
        let records = storage::read_json::<SpendDocument>(&path)?
            .map(|doc| doc.records)
            .unwrap_or_default();
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn record(&self, amount: u64, txid: Option<&str>) -> WalletResult<()> {
        self.record_at(amount, txid, Utc::now())
    }

    pub fn record_at(&self, amount: u64, txid: Option<&str>, at: DateTime<Utc>) -> WalletResult<()> {
        let mut records = lock_or_recover(&self.records);
        records.push(SpendRecord {
            amount,
            timestamp: at,
            txid: txid.map(str::to_string),
        });
        let cutoff = at - ChronoDuration::hours(RETENTION_HOURS);
        records.retain(|r| r.timestamp > cutoff);

        let doc = SpendDocument {
            version: STATE_FORMAT_VERSION,
            records: records.clone(),
        };
        storage::write_json_private(&self.path, &doc)
    }

    pub fn usage(&self) -> LimitUsage {
        self.usage_at(Utc::now())
    }

    pub fn usage_at(&self, now: DateTime<Utc>) -> LimitUsage {
        let records = lock_or_recover(&self.records);
        let day_start = start_of_utc_day(now);
        let hour_start = now - ChronoDuration::hours(1);

        let mut usage = LimitUsage::default();
        for r in records.iter().filter(|r| r.timestamp <= now) {
            if r.timestamp >= day_start {
                usage.daily_total = usage.daily_total.saturating_add(r.amount);
                usage.daily_count += 1;
            }
            if r.timestamp > hour_start {
                usage.hourly_total = usage.hourly_total.saturating_add(r.amount);
            }
            if usage.last_spend.map(|last| r.timestamp > last).unwrap_or(true) {
                usage.last_spend = Some(r.timestamp);
            }
        }
        usage
    }

    pub fn records(&self) -> Vec<SpendRecord> {
        lock_or_recover(&self.records).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn day_window_resets_at_utc_midnight() {
        let dir = tempdir().unwrap();
        let tracker = LimitTracker::open(dir.path()).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 3, 1, 23, 50, 0).unwrap();
        tracker.record_at(700, None, late).unwrap();

        let before_midnight = Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 0).unwrap();
        assert_eq!(tracker.usage_at(before_midnight).daily_total, 700);

        let after_midnight = Utc.with_ymd_and_hms(2024, 3, 2, 0, 5, 0).unwrap();
        let usage = tracker.usage_at(after_midnight);
        assert_eq!(usage.daily_total, 0);
        // Still inside the rolling hour
        assert_eq!(usage.hourly_total, 700);
    }

    #[test]
    fn old_records_are_pruned_and_persisted() {
        let dir = tempdir().unwrap();
        let tracker = LimitTracker::open(dir.path()).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        tracker.record_at(1, Some("a"), start).unwrap();
        tracker
            .record_at(2, Some("b"), start + ChronoDuration::hours(25))
            .unwrap();

        let reopened = LimitTracker::open(dir.path()).unwrap();
        let records = reopened.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].txid.as_deref(), Some("b"));
    }
}
