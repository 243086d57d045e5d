use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

use crate::analytics::ChartCache;
use crate::config::ResetSecret;
use crate::error::StoreError;
use crate::notifications::{AlertType, NotificationManager};
use crate::store::EventStore;
use crate::types::StrategyId;

type HmacSha256 = Hmac<Sha256>;

/// Fixed message MAC'd under each secret; comparing the tags keeps the check constant-time.
const SECRET_DOMAIN: &[u8] = b"webhook-ledger/reset-secret/v1";

fn secret_tag(secret: &[u8]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(SECRET_DOMAIN);
    mac
}

/// Removes a base id from the in-flight set when the reset finishes or is dropped.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
    base_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.base_id);
    }
}

/// Authorizes and serializes strategy resets.
pub struct ResetController {
    store: Arc<EventStore>,
    cache: Arc<ChartCache>,
    notifier: Arc<NotificationManager>,
    expected_tag: Option<Vec<u8>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl ResetController {
    pub fn new(
        store: Arc<EventStore>,
        cache: Arc<ChartCache>,
        notifier: Arc<NotificationManager>,
        secret: &ResetSecret,
    ) -> Self {
        let expected_tag = if secret.is_configured() {
            Some(secret_tag(secret.expose().as_bytes()).finalize().into_bytes().to_vec())
        } else {
            warn!("RESET_SECRET is not configured, every reset request will be rejected");
            None
        };

        Self {
            store,
            cache,
            notifier,
            expected_tag,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn authorize(&self, presented: &str) -> bool {
        match &self.expected_tag {
            Some(expected) => secret_tag(presented.as_bytes()).verify_slice(expected).is_ok(),
            None => false,
        }
    }

    fn begin(&self, base_id: &str) -> Result<InFlightGuard, StoreError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(base_id.to_string()) {
            return Err(StoreError::ConcurrencyConflict(base_id.to_string()));
        }
        Ok(InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            base_id: base_id.to_string(),
        })
    }

    /// Reset `base_id` if `presented_secret` matches. Returns how many records
    /// the new epoch supersedes.
    ///
    /// The secret is checked before the id is looked at, so a rejected
    /// caller learns nothing about which strategies exist.
    pub async fn submit_reset(&self, base_id: &str, presented_secret: &str) -> Result<usize, StoreError> {
        if !self.authorize(presented_secret) {
            warn!("Rejected reset for {}: secret mismatch", base_id);
            self.notifier
                .notify(AlertType::ResetRejected {
                    base_id: base_id.to_string(),
                    reason: "unauthorized".to_string(),
                })
                .await;
            return Err(StoreError::Unauthorized(base_id.to_string()));
        }

        let id = StrategyId::base_only(base_id)?;
        let base_id = id.base_id().to_string();
        let guard = self.begin(&base_id)?;

        // Runs to completion, follow-ups included, even if the caller goes away.
        let store = Arc::clone(&self.store);
        let cache = Arc::clone(&self.cache);
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            let _guard = guard;
            let result = store.reset_strategy(&base_id).await;
            match &result {
                Ok(superseded) => {
                    cache.invalidate(&base_id).await;
                    info!("Reset {} accepted", base_id);
                    notifier
                        .notify(AlertType::StrategyReset {
                            base_id: base_id.clone(),
                            superseded: *superseded,
                        })
                        .await;
                }
                Err(e @ StoreError::StorageUnavailable(_)) => {
                    notifier
                        .notify(AlertType::StorageDegraded {
                            message: e.to_string(),
                        })
                        .await;
                }
                Err(_) => {}
            }
            result
        })
        .await
        .unwrap_or_else(|e| Err(StoreError::StorageWriteFailure(format!("reset task failed: {}", e))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::journal::tests::temp_log_path;
    use crate::store::{JsonlJournal, StoreOptions};
    use crate::types::{EventKind, EventRecord};
    use chrono::Utc;

    async fn setup(secret: &str) -> (Arc<EventStore>, Arc<ChartCache>, ResetController) {
        let journal = JsonlJournal::open(temp_log_path("log.jsonl")).await.unwrap();
        let store = Arc::new(EventStore::open(Box::new(journal), StoreOptions::default()).await.unwrap());
        let cache = Arc::new(ChartCache::new());
        let controller = ResetController::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::new(NotificationManager::default()),
            &ResetSecret::new(secret),
        );
        (store, cache, controller)
    }

    async fn seed(store: &EventStore, id: &str) {
        let record = EventRecord::new(Utc::now(), StrategyId::parse(id).unwrap(), EventKind::Signal);
        store.append(record).await.unwrap();
    }

    #[test]
    fn test_secret_comparison() {
        let expected = secret_tag(b"correct horse").finalize().into_bytes().to_vec();
        assert!(secret_tag(b"correct horse").verify_slice(&expected).is_ok());
        assert!(secret_tag(b"correct hors").verify_slice(&expected).is_err());
        assert!(secret_tag(b"").verify_slice(&expected).is_err());
    }

    #[tokio::test]
    async fn test_wrong_secret_is_unauthorized_and_writes_nothing() {
        let (store, _, controller) = setup("s3cret").await;
        seed(&store, "strat_001_a").await;

        let err = controller.submit_reset("strat_001", "wrong-secret").await.unwrap_err();
        assert_eq!(err, StoreError::Unauthorized("strat_001".to_string()));
        assert!(!err.to_string().contains("wrong-secret"));

        let records = store.query_all().await;
        assert_eq!(records.len(), 1);
        assert!(records.iter().all(|r| !r.is_reset()));
    }

    #[tokio::test]
    async fn test_unconfigured_secret_rejects_everything() {
        let (store, _, controller) = setup("").await;
        seed(&store, "strat_001").await;
        assert!(matches!(
            controller.submit_reset("strat_001", "").await,
            Err(StoreError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_targets() {
        let (store, _, controller) = setup("s3cret").await;
        seed(&store, "strat_002").await;

        assert_eq!(
            controller.submit_reset("strat_001", "s3cret").await,
            Err(StoreError::UnknownStrategy("strat_001".to_string()))
        );
        assert!(matches!(
            controller.submit_reset("strat_001_a", "s3cret").await,
            Err(StoreError::MalformedId(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_invalidates_cached_chart() {
        let (store, cache, controller) = setup("s3cret").await;
        seed(&store, "strat_001_a").await;
        seed(&store, "strat_001_b").await;
        cache.charts(&store.snapshot().await).await;
        assert_eq!(cache.len().await, 1);

        assert_eq!(controller.submit_reset("strat_001", "s3cret").await, Ok(2));
        assert_eq!(cache.len().await, 0);

        let chart = cache.chart(&store.snapshot().await, "strat_001").await.unwrap();
        assert_eq!(chart.epoch, 1);
        assert_eq!(chart.epoch_records, 0);
    }

    #[tokio::test]
    async fn test_in_flight_reset_conflicts() {
        let (store, _, controller) = setup("s3cret").await;
        seed(&store, "strat_001").await;

        let guard = controller.begin("strat_001").unwrap();
        assert_eq!(
            controller.submit_reset("strat_001", "s3cret").await,
            Err(StoreError::ConcurrencyConflict("strat_001".to_string()))
        );
        drop(guard);
        assert!(controller.submit_reset("strat_001", "s3cret").await.is_ok());
    }

    #[tokio::test]
    async fn test_reset_completes_after_caller_is_dropped() {
        let journal = JsonlJournal::open(temp_log_path("log.jsonl")).await.unwrap();
        let store = Arc::new(EventStore::open(Box::new(journal), StoreOptions::default()).await.unwrap());
        let notifier = Arc::new(NotificationManager::default());
        let controller = ResetController::new(
            Arc::clone(&store),
            Arc::new(ChartCache::new()),
            Arc::clone(&notifier),
            &ResetSecret::new("s3cret"),
        );
        seed(&store, "strat_001_a").await;

        {
            let reset = controller.submit_reset("strat_001", "s3cret");
            tokio::pin!(reset);
            // One poll hands the reset to its task, then the caller gives up.
            tokio::select! {
                biased;
                _ = &mut reset => panic!("reset finished before its task ran"),
                _ = std::future::ready(()) => {}
            }
        }

        let expected = AlertType::StrategyReset {
            base_id: "strat_001".to_string(),
            superseded: 1,
        };
        for _ in 0..200 {
            if notifier.get_recent(10).await.iter().any(|n| n.alert_type == expected) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert!(notifier.get_recent(10).await.iter().any(|n| n.alert_type == expected));
        assert_eq!(store.query_all().await.iter().filter(|r| r.is_reset()).count(), 1);
        // The in-flight slot was released by the task.
        assert_eq!(controller.submit_reset("strat_001", "s3cret").await, Ok(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resets_each_mutate_once() {
        let (store, _, controller) = setup("s3cret").await;
        seed(&store, "strat_001").await;
        let controller = Arc::new(controller);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let controller = Arc::clone(&controller);
            handles.push(tokio::spawn(async move {
                controller.submit_reset("strat_001", "s3cret").await
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(StoreError::ConcurrencyConflict(_)) => {}
                Err(other) => panic!("unexpected error: {}", other),
            }
        }

        let markers: Vec<_> = store.query_all().await.into_iter().filter(|r| r.is_reset()).collect();
        assert!(succeeded >= 1);
        assert_eq!(markers.len(), succeeded);
        assert!(markers
            .iter()
            .all(|m| m.equity == Some(rust_decimal::Decimal::ZERO) && m.drawdown == Some(rust_decimal::Decimal::ZERO)));
    }
}
