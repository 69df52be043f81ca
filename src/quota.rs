use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::QuotaError;

pub const DEFAULT_DAILY_LIMIT_BYTES: u64 = 15 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub date: NaiveDate,
    pub bytes_used: u64,
}

impl QuotaRecord {
    fn usage_on(&self, day: NaiveDate) -> u64 {
        if self.date == day { self.bytes_used } else { 0 }
    }

    fn add(&mut self, day: NaiveDate, bytes: u64) -> u64 {
        if self.date != day {
            *self = QuotaRecord {
                date: day,
                bytes_used: 0,
            };
        }
        self.bytes_used = self.bytes_used.saturating_add(bytes);
        self.bytes_used
    }
}

type QuotaMap = HashMap<String, QuotaRecord>;

/// Backing storage for per-user daily usage.
///
/// `increment` must apply the day rollover and the addition as one atomic
/// step: two callers adding to the same user never lose an update.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Bytes used by `user_id` on `day`; a record from another day counts as zero.
    async fn usage_on(&self, user_id: &str, day: NaiveDate) -> Result<u64, QuotaError>;

    /// Adds `bytes` to the usage of `user_id` on `day` and returns the new total.
    async fn increment(&self, user_id: &str, day: NaiveDate, bytes: u64)
    -> Result<u64, QuotaError>;
}

#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    records: Mutex<QuotaMap>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn usage_on(&self, user_id: &str, day: NaiveDate) -> Result<u64, QuotaError> {
        let records = self.records.lock().await;
        Ok(records
            .get(user_id)
            .map(|record| record.usage_on(day))
            .unwrap_or_default())
    }

    async fn increment(
        &self,
        user_id: &str,
        day: NaiveDate,
        bytes: u64,
    ) -> Result<u64, QuotaError> {
        let mut records = self.records.lock().await;
        let record = records.entry(user_id.to_string()).or_insert(QuotaRecord {
            date: day,
            bytes_used: 0,
        });
        Ok(record.add(day, bytes))
    }
}

/// Quota records kept in a JSON file (`{user: {date, bytes_used}}`).
///
/// The file is read once when opened. Each increment updates the in-memory
/// map and rewrites the file while the lock is held, so writes reach disk in
/// the same order they were applied.
#[derive(Debug)]
pub struct JsonFileQuotaStore {
    path: PathBuf,
    records: Mutex<QuotaMap>,
}

impl JsonFileQuotaStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, QuotaError> {
        let path = path.into();
        let records = load_records(&path).await?;
        info!("Loaded {} quota record(s) from {:?}", records.len(), path);

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl QuotaStore for JsonFileQuotaStore {
    async fn usage_on(&self, user_id: &str, day: NaiveDate) -> Result<u64, QuotaError> {
        let records = self.records.lock().await;
        Ok(records
            .get(user_id)
            .map(|record| record.usage_on(day))
            .unwrap_or_default())
    }

    async fn increment(
        &self,
        user_id: &str,
        day: NaiveDate,
        bytes: u64,
    ) -> Result<u64, QuotaError> {
        let mut records = self.records.lock().await;
        let previous = records.get(user_id).copied();

        let mut record = previous.unwrap_or(QuotaRecord {
            date: day,
            bytes_used: 0,
        });
        let total = record.add(day, bytes);
        records.insert(user_id.to_string(), record);

        if let Err(error) = persist_records(&self.path, &records).await {
            match previous {
                Some(previous) => records.insert(user_id.to_string(), previous),
                None => records.remove(user_id),
            };
            return Err(error);
        }

        Ok(total)
    }
}

async fn load_records(path: &Path) -> Result<QuotaMap, QuotaError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) if contents.trim().is_empty() => Ok(HashMap::new()),
        Ok(contents) => Ok(serde_json::from_str(&contents)?),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
        Err(source) => Err(QuotaError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn persist_records(path: &Path, records: &QuotaMap) -> Result<(), QuotaError> {
    let payload = serde_json::to_string_pretty(records)?;
    let staging = path.with_extension("json.tmp");

    tokio::fs::write(&staging, payload)
        .await
        .map_err(|source| QuotaError::Write {
            path: staging.clone(),
            source,
        })?;
    tokio::fs::rename(&staging, path)
        .await
        .map_err(|source| QuotaError::Write {
            path: path.to_path_buf(),
            source,
        })
}

type DayClock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

/// Per-user daily byte budget. Days are UTC calendar days.
#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    daily_limit: u64,
    today: DayClock,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>, daily_limit: u64) -> Self {
        Self {
            store,
            daily_limit,
            today: Arc::new(|| Utc::now().date_naive()),
        }
    }

    pub fn with_clock(mut self, today: impl Fn() -> NaiveDate + Send + Sync + 'static) -> Self {
        self.today = Arc::new(today);
        self
    }

    pub fn daily_limit(&self) -> u64 {
        self.daily_limit
    }

    /// True while the user has used less than the daily limit today.
    pub async fn check(&self, user_id: &str) -> Result<bool, QuotaError> {
        Ok(self.usage(user_id).await? < self.daily_limit)
    }

    pub async fn usage(&self, user_id: &str) -> Result<u64, QuotaError> {
        self.store.usage_on(user_id, (self.today)()).await
    }

    pub async fn remaining(&self, user_id: &str) -> Result<u64, QuotaError> {
        Ok(self.daily_limit.saturating_sub(self.usage(user_id).await?))
    }

    pub async fn add_usage(&self, user_id: &str, bytes: u64) -> Result<u64, QuotaError> {
        let total = self.store.increment(user_id, (self.today)(), bytes).await?;
        debug!(user_id, bytes, total, "quota usage recorded");
        Ok(total)
    }

    /// Seconds until the next UTC midnight, when every counter resets.
    pub fn seconds_until_reset(&self) -> u64 {
        let now = Utc::now();
        let tomorrow = now.date_naive() + Duration::days(1);
        tomorrow
            .and_hms_opt(0, 0, 0)
            .map(|midnight| (midnight.and_utc() - now).num_seconds().max(1) as u64)
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tempfile::tempdir;

    use super::*;

    const LIMIT: u64 = 1_000;

    fn day(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").unwrap()
    }

    fn memory_ledger() -> QuotaLedger {
        QuotaLedger::new(Arc::new(MemoryQuotaStore::new()), LIMIT)
    }

    #[tokio::test]
    async fn fresh_user_is_within_quota() {
        let ledger = memory_ledger();
        assert!(ledger.check("ip:10.0.0.1").await.unwrap());
        assert_eq!(ledger.remaining("ip:10.0.0.1").await.unwrap(), LIMIT);
    }

    #[tokio::test]
    async fn reaching_the_limit_blocks_the_user() {
        let ledger = memory_ledger();
        ledger.add_usage("ip:10.0.0.1", LIMIT).await.unwrap();
        assert!(!ledger.check("ip:10.0.0.1").await.unwrap());

        ledger.add_usage("ip:10.0.0.1", 1).await.unwrap();
        assert!(!ledger.check("ip:10.0.0.1").await.unwrap());
        assert_eq!(ledger.remaining("ip:10.0.0.1").await.unwrap(), 0);
        assert!(ledger.check("ip:10.0.0.2").await.unwrap());
    }

    #[tokio::test]
    async fn usage_resets_when_the_day_rolls_over() {
        let current = Arc::new(StdMutex::new(day("2026-03-01")));
        let clock = Arc::clone(&current);
        let ledger = memory_ledger().with_clock(move || *clock.lock().unwrap());

        ledger.add_usage("ip:10.0.0.1", LIMIT + 500).await.unwrap();
        assert!(!ledger.check("ip:10.0.0.1").await.unwrap());

        *current.lock().unwrap() = day("2026-03-02");
        assert!(ledger.check("ip:10.0.0.1").await.unwrap());
        assert_eq!(ledger.add_usage("ip:10.0.0.1", 10).await.unwrap(), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_are_not_lost() {
        let ledger = memory_ledger();
        let mut handles = Vec::new();
        for _ in 0..64 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.add_usage("ip:10.0.0.9", 7).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(ledger.usage("ip:10.0.0.9").await.unwrap(), 64 * 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn file_store_serializes_concurrent_increments_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("quota.json");
        let store = Arc::new(JsonFileQuotaStore::open(&path).await.unwrap());
        let ledger = QuotaLedger::new(store, LIMIT * 100);

        let mut handles = Vec::new();
        for index in 0..50u64 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.add_usage("key:abc", index + 1).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let expected = (1..=50u64).sum::<u64>();
        assert_eq!(ledger.usage("key:abc").await.unwrap(), expected);

        let reopened = JsonFileQuotaStore::open(&path).await.unwrap();
        let today = Utc::now().date_naive();
        assert_eq!(reopened.usage_on("key:abc", today).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn stale_record_on_disk_counts_as_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("quota.json");
        tokio::fs::write(
            &path,
            r#"{"ip:10.0.0.1": {"date": "2020-01-01", "bytes_used": 999999}}"#,
        )
        .await
        .unwrap();

        let store = JsonFileQuotaStore::open(&path).await.unwrap();
        let ledger = QuotaLedger::new(Arc::new(store), LIMIT);
        assert!(ledger.check("ip:10.0.0.1").await.unwrap());
        assert_eq!(ledger.add_usage("ip:10.0.0.1", 5).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn corrupt_quota_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("quota.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        assert!(matches!(
            JsonFileQuotaStore::open(&path).await,
            Err(QuotaError::Json(_))
        ));
    }
}
