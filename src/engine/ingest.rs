use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use super::ResetController;
use crate::error::StoreError;
use crate::notifications::{AlertType, NotificationManager};
use crate::store::EventStore;
use crate::types::{parse_timestamp, EventKind, EventRecord, StrategyId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookData {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub position_size: Option<Decimal>,
}

/// Body posted by a strategy runtime to `/webhook`.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub strategy_id: String,
    pub signal_type: String,
    #[serde(default)]
    pub equity: Option<Decimal>,
    #[serde(default)]
    pub drawdown: Option<Decimal>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default)]
    pub data: Option<WebhookData>,
    /// Only read for `reset`.
    #[serde(default)]
    pub secret: Option<String>,
    /// Producer-side timestamp; the server clock is used when absent.
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl std::fmt::Debug for WebhookPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookPayload")
            .field("strategy_id", &self.strategy_id)
            .field("signal_type", &self.signal_type)
            .field("equity", &self.equity)
            .field("symbol", &self.symbol)
            .field("order_type", &self.order_type)
            .field("data", &self.data)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

impl WebhookPayload {
    pub fn kind(&self) -> Result<EventKind, StoreError> {
        EventKind::from_str(&self.signal_type)
    }

    /// Build the record to append. Not valid for `reset`, which goes through the controller.
    pub fn to_record(&self) -> Result<EventRecord, StoreError> {
        let kind = self.kind()?;
        let strategy_id = StrategyId::parse(&self.strategy_id)?;
        let timestamp = match &self.timestamp {
            Some(raw) => parse_timestamp(raw).map_err(StoreError::InvalidEvent)?,
            None => Utc::now(),
        };

        let mut record = EventRecord::new(timestamp, strategy_id, kind);
        record.equity = self.equity;
        record.drawdown = self.drawdown;
        record.order_action = self
            .data
            .as_ref()
            .map(|d| d.action.trim())
            .filter(|action| !action.is_empty())
            .map(str::to_string);
        Ok(record)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Recorded { record: EventRecord },
    Reset { base_id: String, superseded: usize },
}

/// Entry point for producers: records events and routes reset signals.
pub struct Ingestor {
    store: Arc<EventStore>,
    controller: Arc<ResetController>,
    notifier: Arc<NotificationManager>,
}

impl Ingestor {
    pub fn new(
        store: Arc<EventStore>,
        controller: Arc<ResetController>,
        notifier: Arc<NotificationManager>,
    ) -> Self {
        Self {
            store,
            controller,
            notifier,
        }
    }

    pub async fn handle(&self, payload: &WebhookPayload) -> Result<IngestOutcome, StoreError> {
        debug!("Webhook payload: {:?}", payload);

        if payload.kind()? == EventKind::Reset {
            // A reset posted with an instance id targets its base id.
            let base_id = match StrategyId::parse(&payload.strategy_id) {
                Ok(id) => id.base_id().to_string(),
                Err(_) => payload.strategy_id.trim().to_string(),
            };
            let secret = payload.secret.as_deref().unwrap_or_default();
            let superseded = self.controller.submit_reset(&base_id, secret).await?;
            return Ok(IngestOutcome::Reset { base_id, superseded });
        }

        let record = self.record_event(payload.to_record()?).await?;
        Ok(IngestOutcome::Recorded { record })
    }

    /// Append one producer event. Reset markers are only written by the reset controller.
    pub async fn record_event(&self, record: EventRecord) -> Result<EventRecord, StoreError> {
        if record.is_reset() {
            return Err(StoreError::InvalidEvent(
                "reset must be submitted with the reset secret".to_string(),
            ));
        }

        match self.store.append(record).await {
            Ok(stored) => {
                info!("Recorded {} {}", stored.strategy_id, stored.event);
                self.notifier
                    .notify(AlertType::EventRecorded {
                        strategy_id: stored.strategy_id.to_string(),
                        event: stored.event.to_string(),
                        action: stored.order_action.clone(),
                    })
                    .await;
                Ok(stored)
            }
            Err(e) => {
                if matches!(e, StoreError::StorageUnavailable(_)) {
                    self.notifier
                        .notify(AlertType::StorageDegraded {
                            message: e.to_string(),
                        })
                        .await;
                }
                Err(e)
            }
        }
    }
}
