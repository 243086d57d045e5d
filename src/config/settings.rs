use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file looked up next to the binary's working directory.
pub const DEFAULT_CONFIG_FILE: &str = "webhook_ledger.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageSettings,
    pub ingest: IngestSettings,
    pub reset: ResetSettings,
    pub server: ServerSettings,
    pub notifications: NotificationSettings,
}

impl AppConfig {
    /// Layered load: defaults, then the optional TOML file, then `LEDGER_*`
    /// environment variables. The reset secret and LINE credentials also
    /// honour the bare `RESET_SECRET`, `LINE_USER_ID` and `LINE_CHANNEL_TOKEN`
    /// variables.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let _ = dotenvy::dotenv();

        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut app: AppConfig = config::Config::builder()
            .add_source(config::File::from(file).required(path.is_some()))
            .add_source(
                config::Environment::with_prefix("LEDGER")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        if let Ok(secret) = std::env::var("RESET_SECRET") {
            app.reset.secret = ResetSecret::new(secret);
        }
        if let Ok(user) = std::env::var("LINE_USER_ID") {
            app.notifications.line_user_id = Some(user);
        }
        if let Ok(token) = std::env::var("LINE_CHANNEL_TOKEN") {
            app.notifications.line_channel_token = Some(token);
        }

        Ok(app)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.storage.path.as_os_str().is_empty() {
            errors.push("storage.path must not be empty".to_string());
        }
        if self.storage.write_timeout_ms == 0 {
            errors.push("storage.write_timeout_ms must be > 0".to_string());
        }
        if self.storage.max_write_attempts == 0 {
            errors.push("storage.max_write_attempts must be >= 1".to_string());
        }
        if self.storage.fatal_after_failures == 0 {
            errors.push("storage.fatal_after_failures must be >= 1".to_string());
        }
        if self.ingest.clock_skew_tolerance_ms < 0 {
            errors.push("ingest.clock_skew_tolerance_ms must be >= 0".to_string());
        }
        if self.server.port == 0 {
            errors.push("server.port must be > 0".to_string());
        }
        if self.notifications.history_limit == 0 {
            errors.push("notifications.history_limit must be > 0".to_string());
        }
        if self.notifications.line_api_url.trim().is_empty() {
            errors.push("notifications.line_api_url must not be empty".to_string());
        }
        if self.notifications.line_user_id.is_some() != self.notifications.line_channel_token.is_some() {
            errors.push("LINE push needs both line_user_id and line_channel_token".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Jsonl,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub path: PathBuf,
    pub write_timeout_ms: u64,
    pub max_write_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Consecutive failed writes after which the store stops accepting writes.
    pub fatal_after_failures: u32,
}

impl StorageSettings {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Backoff before retry number `attempt` (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Jsonl,
            path: PathBuf::from("log/log.jsonl"),
            write_timeout_ms: 2_000,
            max_write_attempts: 3,
            retry_backoff_ms: 50,
            fatal_after_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    /// How far a record may lag behind the newest record of its base id.
    pub clock_skew_tolerance_ms: i64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            clock_skew_tolerance_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetSettings {
    pub secret: ResetSecret,
}

/// Shared secret guarding strategy resets. Never printed.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResetSecret(String);

impl ResetSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_configured(&self) -> bool {
        !self.0.is_empty()
    }
}

impl fmt::Debug for ResetSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_configured() {
            write!(f, "ResetSecret(<redacted>)")
        } else {
            write!(f, "ResetSecret(<unset>)")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { port: 8000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub line_user_id: Option<String>,
    pub line_channel_token: Option<String>,
    /// LINE Messaging API push endpoint.
    pub line_api_url: String,
    pub history_limit: usize,
}

impl NotificationSettings {
    pub fn line_enabled(&self) -> bool {
        self.line_user_id.is_some() && self.line_channel_token.is_some()
    }
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            line_user_id: None,
            line_channel_token: None,
            line_api_url: crate::notifications::LINE_PUSH_URL.to_string(),
            history_limit: 500,
        }
    }
}
