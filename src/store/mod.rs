pub mod journal;

pub use journal::*;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::analytics::drawdown_from_peak;
use crate::config::{AppConfig, StorageSettings};
use crate::error::StoreError;
use crate::types::{EventKind, EventRecord, StrategyId};

/// Decimal places kept on drawdown values filled in at append time.
const DRAWDOWN_SCALE: u32 = 8;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub storage: StorageSettings,
    pub clock_skew_tolerance: ChronoDuration,
}

impl StoreOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            storage: config.storage.clone(),
            clock_skew_tolerance: ChronoDuration::milliseconds(config.ingest.clock_skew_tolerance_ms),
        }
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Per-base bookkeeping derived from the log.
#[derive(Debug, Clone)]
pub struct BaseIndex {
    pub last_timestamp: DateTime<Utc>,
    /// All records ever appended for this base, markers included.
    pub record_count: usize,
    /// Number of reset markers seen.
    pub epoch: u32,
    /// Timestamp of the latest reset marker; later records may not predate it.
    pub epoch_start: Option<DateTime<Utc>>,
    /// Non-marker records since the latest reset.
    pub epoch_records: usize,
    pub epoch_peak: Option<Decimal>,
}

impl BaseIndex {
    fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            last_timestamp: timestamp,
            record_count: 0,
            epoch: 0,
            epoch_start: None,
            epoch_records: 0,
            epoch_peak: None,
        }
    }

    fn apply(&mut self, record: &EventRecord) {
        self.record_count += 1;
        if record.timestamp > self.last_timestamp {
            self.last_timestamp = record.timestamp;
        }

        if record.is_reset() {
            self.epoch += 1;
            self.epoch_start = Some(record.timestamp);
            self.epoch_records = 0;
            self.epoch_peak = None;
            return;
        }
        if self.epoch_start.is_some_and(|start| record.timestamp < start) {
            return;
        }

        self.epoch_records += 1;
        if record.event == EventKind::EquityUpdate {
            if let Some(equity) = record.equity {
                self.epoch_peak = Some(self.epoch_peak.map_or(equity, |peak| peak.max(equity)));
            }
        }
    }
}

/// Point-in-time view of the whole log. Cheap to clone; never changes.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    records: Arc<Vec<EventRecord>>,
    bases: Arc<BTreeMap<String, BaseIndex>>,
}

impl StoreSnapshot {
    fn apply(&mut self, mut record: EventRecord) -> EventRecord {
        record.sequence = self.records.len() as u64;
        Arc::make_mut(&mut self.bases)
            .entry(record.base_id().to_string())
            .or_insert_with(|| BaseIndex::new(record.timestamp))
            .apply(&record);
        Arc::make_mut(&mut self.records).push(record.clone());
        record
    }

    /// Total records in the log; doubles as the store version.
    pub fn version(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    pub fn base(&self, base_id: &str) -> Option<&BaseIndex> {
        self.bases.get(base_id)
    }

    pub fn base_ids(&self) -> BTreeSet<String> {
        self.bases.keys().cloned().collect()
    }

    /// Records of one base id, in append order.
    pub fn records_for<'a>(&'a self, base_id: &'a str) -> impl Iterator<Item = &'a EventRecord> + 'a {
        self.records.iter().filter(move |r| r.base_id() == base_id)
    }
}

/// Append-only, strategy-scoped webhook log.
///
/// Writers to the same base id are serialised by a per-base lock; commits
/// are serialised at the journal so that the persisted order always equals
/// the in-memory order. Readers clone an `Arc` snapshot and never wait on I/O.
pub struct EventStore {
    state: RwLock<StoreSnapshot>,
    journal: Mutex<Box<dyn Journal>>,
    base_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    options: StoreOptions,
    consecutive_failures: AtomicU32,
    unavailable: OnceLock<String>,
}

impl EventStore {
    /// Replay the journal and rebuild the in-memory indices.
    pub async fn open(mut journal: Box<dyn Journal>, options: StoreOptions) -> Result<Self, StoreError> {
        let records = journal
            .load_all()
            .await
            .map_err(|e| StoreError::Replay(e.to_string()))?;

        let mut state = StoreSnapshot::default();
        for record in records {
            state.apply(record);
        }

        info!(
            "Event store ready: {} records across {} strategies from {}",
            state.records.len(),
            state.bases.len(),
            journal.describe()
        );

        Ok(Self {
            state: RwLock::new(state),
            journal: Mutex::new(journal),
            base_locks: Mutex::new(HashMap::new()),
            options,
            consecutive_failures: AtomicU32::new(0),
            unavailable: OnceLock::new(),
        })
    }

    /// Append one record produced by a strategy (or replayed from an export).
    ///
    /// Returns the stored record with its sequence number and, for equity
    /// updates that arrived without one, the drawdown filled in.
    pub async fn append(&self, record: EventRecord) -> Result<EventRecord, StoreError> {
        record.validate()?;
        let lock = self.base_lock(record.base_id()).await;
        let _guard = lock.lock().await;
        self.commit(record).await
    }

    /// Close the current epoch of `base_id` by appending a zeroed reset
    /// marker. History is kept; returns how many records the marker supersedes.
    pub async fn reset_strategy(&self, base_id: &str) -> Result<usize, StoreError> {
        let id = StrategyId::base_only(base_id)?;
        let base_id = id.as_str();
        let lock = self.base_lock(base_id).await;
        let _guard = lock.lock().await;

        let (superseded, epoch, timestamp) = {
            let state = self.state.read().await;
            let index = state
                .base(base_id)
                .ok_or_else(|| StoreError::UnknownStrategy(base_id.to_string()))?;
            (index.epoch_records, index.epoch + 1, Utc::now().max(index.last_timestamp))
        };

        let marker = EventRecord::reset_marker(timestamp, base_id)?;
        let stored = self.commit(marker).await?;
        info!(
            "Strategy {} reset to epoch {} at seq {}: {} records superseded",
            base_id, epoch, stored.sequence, superseded
        );
        Ok(superseded)
    }

    /// All records in insertion order, as of now.
    pub async fn query_all(&self) -> Vec<EventRecord> {
        self.snapshot().await.records().to_vec()
    }

    pub async fn list_base_ids(&self) -> BTreeSet<String> {
        self.snapshot().await.base_ids()
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        self.state.read().await.clone()
    }

    /// The full log as a pretty-printed JSON array in the export schema.
    pub async fn export_log(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string_pretty(&self.query_all().await)?)
    }

    /// Replay an exported document into this (empty) store.
    pub async fn import_log(&self, document: &str) -> Result<usize, StoreError> {
        let records: Vec<EventRecord> = serde_json::from_str(document)?;
        if self.snapshot().await.version() > 0 {
            return Err(StoreError::Replay(
                "import requires an empty event store".to_string(),
            ));
        }

        let count = records.len();
        for record in records {
            self.append(record).await?;
        }
        info!("Imported {} records", count);
        Ok(count)
    }

    pub fn is_writable(&self) -> bool {
        self.unavailable.get().is_none()
    }

    /// Drop any unacknowledged write and flush the journal; called on shutdown.
    pub async fn close(&self) -> Result<(), StoreError> {
        let mut journal = self.journal.lock().await;
        journal
            .discard_pending()
            .await
            .map_err(|e| StoreError::StorageWriteFailure(e.to_string()))?;
        journal
            .flush()
            .await
            .map_err(|e| StoreError::StorageWriteFailure(e.to_string()))?;
        info!("Event store closed ({})", journal.describe());
        Ok(())
    }

    async fn base_lock(&self, base_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.base_locks.lock().await;
        locks.entry(base_id.to_string()).or_default().clone()
    }

    /// Validate ordering, persist, then publish. Caller holds the base lock.
    async fn commit(&self, mut record: EventRecord) -> Result<EventRecord, StoreError> {
        if let Some(reason) = self.unavailable.get() {
            return Err(StoreError::StorageUnavailable(reason.clone()));
        }

        {
            let state = self.state.read().await;
            let index = state.base(record.base_id()).cloned();
            if let Some(index) = &index {
                let tolerated = index.last_timestamp - self.options.clock_skew_tolerance;
                let floor = index.epoch_start.map_or(tolerated, |start| tolerated.max(start));
                if record.timestamp < floor {
                    let behind = index.last_timestamp - record.timestamp;
                    return Err(StoreError::OutOfOrder {
                        base_id: record.base_id().to_string(),
                        timestamp: record.timestamp.to_rfc3339(),
                        behind_ms: behind.num_milliseconds(),
                    });
                }
            }
            fill_drawdown(&mut record, index.as_ref());
        }

        let mut journal = self.journal.lock().await;
        self.write_with_retry(&mut **journal, &record).await?;

        let mut state = self.state.write().await;
        let stored = state.apply(record);
        drop(state);
        drop(journal);

        debug!(
            "Appended seq {} {} {}",
            stored.sequence, stored.strategy_id, stored.event
        );
        Ok(stored)
    }

    async fn write_with_retry(
        &self,
        journal: &mut dyn Journal,
        record: &EventRecord,
    ) -> Result<(), StoreError> {
        let settings = &self.options.storage;
        let attempts = settings.max_write_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match tokio::time::timeout(settings.write_timeout(), journal.append(record)).await {
                Ok(Ok(())) => {
                    self.consecutive_failures.store(0, Ordering::Release);
                    return Ok(());
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("write timed out after {:?}", settings.write_timeout()),
            }

            warn!(
                "Journal write attempt {}/{} for {} failed: {}",
                attempt, attempts, record.strategy_id, last_error
            );
            self.discard_pending(journal).await?;
            if attempt < attempts {
                tokio::time::sleep(settings.backoff(attempt)).await;
            }
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= settings.fatal_after_failures {
            let reason = format!("{} consecutive failed writes, last: {}", failures, last_error);
            if self.unavailable.set(reason.clone()).is_ok() {
                error!("Event store is refusing further writes: {}", reason);
            }
            return Err(StoreError::StorageUnavailable(reason));
        }

        Err(StoreError::StorageWriteFailure(last_error))
    }

    /// Roll back a write that failed or was cut off by the timeout. If even
    /// that fails the journal may hold a record nobody acknowledged, so the
    /// store stops accepting writes.
    async fn discard_pending(&self, journal: &mut dyn Journal) -> Result<(), StoreError> {
        let timeout = self.options.storage.write_timeout();
        let failure = match tokio::time::timeout(timeout, journal.discard_pending()).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", timeout),
        };

        let reason = format!("could not discard interrupted write: {}", failure);
        if self.unavailable.set(reason.clone()).is_ok() {
            error!("Event store is refusing further writes: {}", reason);
        }
        Err(StoreError::StorageUnavailable(reason))
    }
}

/// Equity updates without a drawdown get one from their epoch's running peak.
fn fill_drawdown(record: &mut EventRecord, index: Option<&BaseIndex>) {
    if record.event != EventKind::EquityUpdate || record.drawdown.is_some() {
        return;
    }
    let Some(equity) = record.equity else {
        return;
    };

    let prior_peak = index.and_then(|i| i.epoch_peak);
    let peak = prior_peak.map_or(equity, |p| p.max(equity));
    record.drawdown = drawdown_from_peak(peak, equity).map(|d| d.round_dp(DRAWDOWN_SCALE));
}
