use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// A strategy identifier such as `strat_001` or `strat_001_a`.
///
/// The first two underscore-separated tokens form the base id used for
/// grouping and resets; anything after them is the instance suffix, which is
/// only shown in the log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StrategyId {
    full: String,
    base_len: usize,
}

impl StrategyId {
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let full = raw.trim();
        if full.is_empty() || full.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(StoreError::MalformedId(raw.to_string()));
        }

        let tokens: Vec<&str> = full.split('_').collect();
        if tokens.len() < 2 || tokens.iter().any(|t| t.is_empty()) {
            return Err(StoreError::MalformedId(raw.to_string()));
        }

        let base_len = tokens[0].len() + 1 + tokens[1].len();
        Ok(Self {
            full: full.to_string(),
            base_len,
        })
    }

    /// Id of the reset marker for a base id, which carries no suffix.
    pub fn base_only(base_id: &str) -> Result<Self, StoreError> {
        let id = Self::parse(base_id)?;
        if id.suffix().is_some() {
            return Err(StoreError::MalformedId(base_id.to_string()));
        }
        Ok(id)
    }

    pub fn base_id(&self) -> &str {
        &self.full[..self.base_len]
    }

    pub fn suffix(&self) -> Option<&str> {
        if self.full.len() > self.base_len {
            Some(&self.full[self.base_len + 1..])
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.full
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full)
    }
}

impl FromStr for StrategyId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for StrategyId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StrategyId> for String {
    fn from(id: StrategyId) -> Self {
        id.full
    }
}
