use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::analytics::{ChartCache, ChartSeries};
use crate::error::StoreError;
use crate::store::EventStore;
use crate::types::{EventRecord, StrategyId};

/// Everything one dashboard render needs, taken from a single store version.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub version: u64,
    /// Newest first.
    pub records: Vec<EventRecord>,
    pub base_ids: Vec<String>,
    pub charts: BTreeMap<String, Arc<ChartSeries>>,
}

/// Read-only view over the store for the presentation layer.
pub struct QueryFacade {
    store: Arc<EventStore>,
    cache: Arc<ChartCache>,
}

impl QueryFacade {
    pub fn new(store: Arc<EventStore>, cache: Arc<ChartCache>) -> Self {
        Self { store, cache }
    }

    pub async fn snapshot(&self) -> DashboardSnapshot {
        let snapshot = self.store.snapshot().await;
        let mut records = snapshot.records().to_vec();
        records.reverse();

        DashboardSnapshot {
            version: snapshot.version(),
            records,
            base_ids: snapshot.base_ids().into_iter().collect(),
            charts: self.cache.charts(&snapshot).await,
        }
    }

    /// Snapshot narrowed to one base id, as the dashboard selector shows it.
    /// The selector list itself stays complete.
    pub async fn snapshot_for(&self, base_id: &str) -> Result<DashboardSnapshot, StoreError> {
        let id = StrategyId::base_only(base_id)?;
        let base_id = id.base_id();

        let snapshot = self.store.snapshot().await;
        let chart = self
            .cache
            .chart(&snapshot, base_id)
            .await
            .ok_or_else(|| StoreError::UnknownStrategy(base_id.to_string()))?;

        let mut records: Vec<EventRecord> = snapshot.records_for(base_id).cloned().collect();
        records.reverse();

        Ok(DashboardSnapshot {
            version: snapshot.version(),
            records,
            base_ids: snapshot.base_ids().into_iter().collect(),
            charts: BTreeMap::from([(base_id.to_string(), chart)]),
        })
    }

    pub async fn base_ids(&self) -> Vec<String> {
        self.store.list_base_ids().await.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::journal::tests::temp_log_path;
    use crate::store::{JsonlJournal, StoreOptions};
    use crate::types::EventKind;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    async fn facade_with(records: Vec<EventRecord>) -> (Arc<EventStore>, QueryFacade) {
        let journal = JsonlJournal::open(temp_log_path("log.jsonl")).await.unwrap();
        let store = Arc::new(EventStore::open(Box::new(journal), StoreOptions::default()).await.unwrap());
        for record in records {
            store.append(record).await.unwrap();
        }
        let facade = QueryFacade::new(Arc::clone(&store), Arc::new(ChartCache::new()));
        (store, facade)
    }

    fn update(minute: i64, id: &str, equity: rust_decimal::Decimal) -> EventRecord {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::minutes(minute);
        EventRecord::new(ts, StrategyId::parse(id).unwrap(), EventKind::EquityUpdate).with_equity(equity)
    }

    #[tokio::test]
    async fn test_snapshot_is_newest_first_and_consistent() {
        let (_, facade) = facade_with(vec![
            update(1, "strat_001_a", dec!(100)),
            update(2, "strat_002", dec!(10)),
            update(3, "strat_001_b", dec!(90)),
        ])
        .await;

        let snapshot = facade.snapshot().await;
        assert_eq!(snapshot.version, 3);
        let ids: Vec<_> = snapshot.records.iter().map(|r| r.strategy_id.to_string()).collect();
        assert_eq!(ids, vec!["strat_001_b", "strat_002", "strat_001_a"]);
        assert_eq!(snapshot.base_ids, vec!["strat_001", "strat_002"]);

        // Charts reflect exactly the records in the snapshot.
        let total_points: usize = snapshot.charts.values().map(|c| c.equity_curve.len()).sum();
        assert_eq!(total_points, snapshot.records.len());
    }

    #[tokio::test]
    async fn test_snapshot_for_filters_records_and_charts() {
        let (_, facade) = facade_with(vec![
            update(1, "strat_001_a", dec!(100)),
            update(2, "strat_002", dec!(10)),
        ])
        .await;

        let snapshot = facade.snapshot_for("strat_002").await.unwrap();
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.charts.len(), 1);
        assert_eq!(snapshot.base_ids.len(), 2);

        assert!(matches!(
            facade.snapshot_for("strat_404").await,
            Err(StoreError::UnknownStrategy(_))
        ));
        assert!(matches!(
            facade.snapshot_for("strat").await,
            Err(StoreError::MalformedId(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_serializes() {
        let (_, facade) = facade_with(vec![update(1, "strat_001", dec!(100))]).await;
        let json = serde_json::to_value(facade.snapshot().await).unwrap();
        assert_eq!(json["base_ids"][0], "strat_001");
        assert_eq!(json["records"][0]["event"], "equity_update");
        assert_eq!(json["charts"]["strat_001"]["win_rate"]["status"], "undefined");
    }
}
