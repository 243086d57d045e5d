use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use super::strategy_id::StrategyId;
use crate::error::StoreError;

/// Timestamp layout written by the first generation of the webhook service.
const LEGACY_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Signal,
    OrderFilled,
    OrderRejected,
    EquityUpdate,
    Reset,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Signal => "signal",
            EventKind::OrderFilled => "order_filled",
            EventKind::OrderRejected => "order_rejected",
            EventKind::EquityUpdate => "equity_update",
            EventKind::Reset => "reset",
        }
    }

    /// Kinds that must carry an equity value.
    pub fn requires_equity(&self) -> bool {
        matches!(self, EventKind::EquityUpdate | EventKind::Reset)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "signal" => Ok(EventKind::Signal),
            "order_filled" => Ok(EventKind::OrderFilled),
            "order_rejected" => Ok(EventKind::OrderRejected),
            "equity_update" => Ok(EventKind::EquityUpdate),
            "reset" => Ok(EventKind::Reset),
            other => Err(StoreError::InvalidEvent(format!("unknown event kind '{}'", other))),
        }
    }
}

/// One line of the webhook log. Immutable once appended.
///
/// `equity` and `drawdown` serialize as exact decimal strings; JSON numbers are
/// accepted when reading.
///
/// `sequence` is the store-assigned append position and is not part of the
/// exported document; replaying an export in order reassigns the same values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(skip)]
    pub sequence: u64,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub strategy_id: StrategyId,
    pub event: EventKind,
    #[serde(default)]
    pub equity: Option<Decimal>,
    #[serde(default)]
    pub drawdown: Option<Decimal>,
    #[serde(default)]
    pub order_action: Option<String>,
}

impl EventRecord {
    pub fn new(timestamp: DateTime<Utc>, strategy_id: StrategyId, event: EventKind) -> Self {
        Self {
            sequence: 0,
            timestamp,
            strategy_id,
            event,
            equity: None,
            drawdown: None,
            order_action: None,
        }
    }

    /// Marker that closes the current epoch of `base_id`.
    pub fn reset_marker(timestamp: DateTime<Utc>, base_id: &str) -> Result<Self, StoreError> {
        Ok(Self::new(timestamp, StrategyId::base_only(base_id)?, EventKind::Reset)
            .with_equity(Decimal::ZERO)
            .with_drawdown(Decimal::ZERO))
    }

    pub fn with_equity(mut self, equity: Decimal) -> Self {
        self.equity = Some(equity);
        self
    }

    pub fn with_drawdown(mut self, drawdown: Decimal) -> Self {
        self.drawdown = Some(drawdown);
        self
    }

    pub fn with_order_action(mut self, action: impl Into<String>) -> Self {
        self.order_action = Some(action.into());
        self
    }

    pub fn base_id(&self) -> &str {
        self.strategy_id.base_id()
    }

    pub fn is_reset(&self) -> bool {
        self.event == EventKind::Reset
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.event.requires_equity() && self.equity.is_none() {
            return Err(StoreError::InvalidEvent(format!(
                "{} for '{}' must carry an equity value",
                self.event, self.strategy_id
            )));
        }
        if self.is_reset() && self.strategy_id.suffix().is_some() {
            return Err(StoreError::InvalidEvent(format!(
                "reset marker must use a base id, got '{}'",
                self.strategy_id
            )));
        }
        Ok(())
    }
}

/// Accepts RFC 3339 as well as the legacy `YYYY-MM-DD HH:MM:SS` layout (read as UTC).
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, LEGACY_TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("invalid timestamp '{}': {}", raw, e))
}
