use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::{ChartSeries, MetricsEngine};
use crate::store::StoreSnapshot;

struct CachedChart {
    record_count: usize,
    series: Arc<ChartSeries>,
}

/// Per-base chart cache. An entry is served only for the exact record count
/// it was computed from, so a cached chart always matches its snapshot.
#[derive(Default)]
pub struct ChartCache {
    entries: RwLock<HashMap<String, CachedChart>>,
}

impl ChartCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn chart(&self, snapshot: &StoreSnapshot, base_id: &str) -> Option<Arc<ChartSeries>> {
        let record_count = snapshot.base(base_id)?.record_count;

        if let Some(cached) = self.entries.read().await.get(base_id) {
            if cached.record_count == record_count {
                return Some(Arc::clone(&cached.series));
            }
        }

        let series = Arc::new(MetricsEngine::compute(base_id, snapshot.records_for(base_id))?);
        debug!("Recomputed charts for {} at {} records", base_id, record_count);

        let mut entries = self.entries.write().await;
        let newer_cached = entries
            .get(base_id)
            .is_some_and(|cached| cached.record_count > record_count);
        if !newer_cached {
            entries.insert(
                base_id.to_string(),
                CachedChart {
                    record_count,
                    series: Arc::clone(&series),
                },
            );
        }
        Some(series)
    }

    pub async fn charts(&self, snapshot: &StoreSnapshot) -> BTreeMap<String, Arc<ChartSeries>> {
        let mut charts = BTreeMap::new();
        for base_id in snapshot.base_ids() {
            if let Some(series) = self.chart(snapshot, &base_id).await {
                charts.insert(base_id, series);
            }
        }
        charts
    }

    pub async fn invalidate(&self, base_id: &str) {
        if self.entries.write().await.remove(base_id).is_some() {
            debug!("Invalidated cached charts for {}", base_id);
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EventStore, JsonlJournal, StoreOptions};
    use crate::store::journal::tests::temp_log_path;
    use crate::types::{EventKind, EventRecord, StrategyId};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    async fn store() -> EventStore {
        let journal = JsonlJournal::open(temp_log_path("log.jsonl")).await.unwrap();
        EventStore::open(Box::new(journal), StoreOptions::default()).await.unwrap()
    }

    fn update(id: &str, equity: rust_decimal::Decimal) -> EventRecord {
        EventRecord::new(Utc::now(), StrategyId::parse(id).unwrap(), EventKind::EquityUpdate)
            .with_equity(equity)
    }

    #[tokio::test]
    async fn test_cached_chart_is_reused_until_base_changes() {
        let store = store().await;
        let cache = ChartCache::new();
        store.append(update("strat_001_a", dec!(100))).await.unwrap();
        store.append(update("strat_002", dec!(50))).await.unwrap();

        let snapshot = store.snapshot().await;
        let first = cache.chart(&snapshot, "strat_001").await.unwrap();
        let again = cache.chart(&snapshot, "strat_001").await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        // Another base changing does not evict this entry.
        store.append(update("strat_002", dec!(40))).await.unwrap();
        let snapshot = store.snapshot().await;
        assert!(Arc::ptr_eq(&first, &cache.chart(&snapshot, "strat_001").await.unwrap()));

        store.append(update("strat_001_b", dec!(80))).await.unwrap();
        let snapshot = store.snapshot().await;
        let updated = cache.chart(&snapshot, "strat_001").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &updated));
        assert_eq!(updated.equity_curve.len(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_and_unknown_base() {
        let store = store().await;
        let cache = ChartCache::new();
        store.append(update("strat_001", dec!(100))).await.unwrap();

        let snapshot = store.snapshot().await;
        assert_eq!(cache.charts(&snapshot).await.len(), 1);
        assert_eq!(cache.len().await, 1);
        assert!(cache.chart(&snapshot, "strat_404").await.is_none());

        cache.invalidate("strat_001").await;
        assert_eq!(cache.len().await, 0);
    }
}
