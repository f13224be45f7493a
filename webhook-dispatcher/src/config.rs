use serde::{Deserialize, Serialize};

/// Dispatcher-wide settings, supplied by the host in `initialize`.
///
/// The retry and timeout values are the defaults applied to any webhook
/// registered without its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_max_log_entries() -> usize {
    1000
}
fn default_user_agent() -> String {
    format!("NexusWebhookDispatcher/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_ms: default_timeout_ms(),
            max_log_entries: default_max_log_entries(),
            user_agent: default_user_agent(),
        }
    }
}

impl DispatcherConfig {
    /// Parse the `config` object of an `initialize` call. Null or missing
    /// means all defaults.
    pub fn from_value(value: Option<&serde_json::Value>) -> Result<Self, String> {
        match value {
            None | Some(serde_json::Value::Null) => Ok(Self::default()),
            Some(v) => serde_json::from_value(v.clone()).map_err(|e| format!("invalid config: {e}")),
        }
    }
}
