use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::monitoring::LiveOptions;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub backend: BackendConfig,
    pub data: DataConfig,
    pub live: LiveConfig,
    pub logging: LoggingConfig,
}

/// Scanning backend that starts, cancels and reports on runs.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    pub api_url: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:5001".to_string(),
        }
    }
}

/// REST endpoint serving the run tables.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DataConfig {
    pub rest_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            rest_url: "http://localhost:54321/rest/v1".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LiveConfig {
    pub poll_interval_ms: u64,
    pub event_limit: usize,
    pub stale_after_ms: u64,
    pub render_interval_ms: u64,
    pub recent_events: usize,
    /// Bound on one snapshot fetch, including the HTTP client's own timeout.
    pub fetch_timeout_ms: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            event_limit: 200,
            stale_after_ms: 10_000,
            render_interval_ms: 500,
            recent_events: 12,
            fetch_timeout_ms: 10_000,
        }
    }
}

impl LiveConfig {
    pub fn options(&self) -> LiveOptions {
        LiveOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            event_limit: self.event_limit,
            stale_after: Duration::from_millis(self.stale_after_ms),
            resubscribe_after: Duration::from_millis(self.poll_interval_ms),
            fetch_timeout: self.fetch_timeout(),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn render_interval(&self) -> Duration {
        Duration::from_millis(self.render_interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of error, warn, info, debug, trace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl LoggingConfig {
    pub fn level(&self) -> Option<tracing::Level> {
        self.level.as_deref()?.parse().ok()
    }
}
