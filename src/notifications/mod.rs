pub mod line;

pub use line::*;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::NotificationSettings;

/// Notification severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AlertType {
    EventRecorded {
        strategy_id: String,
        event: String,
        action: Option<String>,
    },
    StrategyReset {
        base_id: String,
        superseded: usize,
    },
    ResetRejected {
        base_id: String,
        reason: String,
    },
    StorageDegraded {
        message: String,
    },
}

impl AlertType {
    pub fn default_severity(&self) -> Severity {
        match self {
            AlertType::StorageDegraded { .. } => Severity::Critical,
            AlertType::ResetRejected { .. } => Severity::Warning,
            _ => Severity::Info,
        }
    }

    pub fn title(&self) -> String {
        match self {
            AlertType::EventRecorded { strategy_id, .. } => format!("Signal received: {}", strategy_id),
            AlertType::StrategyReset { base_id, .. } => format!("Strategy reset: {}", base_id),
            AlertType::ResetRejected { base_id, .. } => format!("Reset rejected: {}", base_id),
            AlertType::StorageDegraded { .. } => "Storage degraded".to_string(),
        }
    }

    /// Text pushed to LINE.
    pub fn message(&self) -> String {
        match self {
            AlertType::EventRecorded {
                strategy_id,
                event,
                action,
            } => format!(
                "Strategy {} received signal: {}, action: {}",
                strategy_id,
                event,
                action.as_deref().unwrap_or("")
            ),
            AlertType::StrategyReset { base_id, superseded } => format!(
                "Strategy {} was reset ({} records archived)",
                base_id, superseded
            ),
            AlertType::ResetRejected { base_id, reason } => {
                format!("Reset of {} rejected: {}", base_id, reason)
            }
            AlertType::StorageDegraded { message } => format!("Webhook log storage degraded: {}", message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub alert_type: AlertType,
}

impl Notification {
    pub fn new(alert_type: AlertType) -> Self {
        let severity = alert_type.default_severity();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            severity,
            alert_type,
        }
    }
}

/// Keeps recent alerts in memory and forwards them to LINE when configured.
pub struct NotificationManager {
    notifications: Arc<RwLock<Vec<Notification>>>,
    line: Option<LinePusher>,
    max_notifications: usize,
}

impl NotificationManager {
    pub fn new(line: Option<LinePusher>, max_notifications: usize) -> Self {
        Self {
            notifications: Arc::new(RwLock::new(Vec::new())),
            line,
            max_notifications,
        }
    }

    pub fn from_settings(settings: &NotificationSettings) -> Self {
        let line = LinePusher::from_settings(settings);
        if !settings.line_enabled() {
            warn!("LINE_USER_ID or LINE_CHANNEL_TOKEN not set, LINE push disabled");
        }
        Self::new(line, settings.history_limit)
    }

    pub async fn notify(&self, alert_type: AlertType) {
        let notification = Notification::new(alert_type);

        let title = notification.alert_type.title();
        match notification.severity {
            Severity::Critical => error!("{} - {:?}", title, notification.alert_type),
            Severity::Warning => warn!("{} - {:?}", title, notification.alert_type),
            Severity::Info => info!("{} - {:?}", title, notification.alert_type),
        }

        if let Some(line) = &self.line {
            let line = line.clone();
            let text = notification.alert_type.message();
            tokio::spawn(async move {
                if let Err(e) = line.push(&text).await {
                    warn!("Failed to push LINE message: {}", e);
                }
            });
        }

        let mut notifications = self.notifications.write().await;
        notifications.insert(0, notification);
        if notifications.len() > self.max_notifications {
            notifications.truncate(self.max_notifications);
        }
    }

    /// Push a fixed message straight to LINE to check the credentials.
    /// Not recorded in the history.
    pub async fn send_test(&self) -> anyhow::Result<()> {
        let line = self
            .line
            .as_ref()
            .ok_or_else(|| anyhow!("LINE push is not configured"))?;
        line.push("Webhook ledger: LINE notification test").await?;
        info!("LINE test message delivered");
        Ok(())
    }

    /// Most recent first.
    pub async fn get_recent(&self, limit: usize) -> Vec<Notification> {
        let notifications = self.notifications.read().await;
        notifications.iter().take(limit).cloned().collect()
    }
}

impl Default for NotificationManager {
    fn default() -> Self {
        Self::new(None, 500)
    }
}
