use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::DispatcherConfig;
use crate::error::{DispatchError, Result};
use crate::signing::SignatureScheme;

/// Registration input. Unset retry and timeout fields fall back to the
/// dispatcher defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub retry_attempts: Option<u32>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub signature_scheme: SignatureScheme,
}

impl WebhookConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            secret: None,
            headers: BTreeMap::new(),
            retry_attempts: None,
            retry_delay_ms: None,
            timeout_ms: None,
            signature_scheme: SignatureScheme::default(),
        }
    }

    /// Validate and apply defaults.
    pub fn resolve(self, defaults: &DispatcherConfig) -> Result<Webhook> {
        let id = self.id.trim().to_string();
        if id.is_empty() {
            return Err(DispatchError::InvalidConfig {
                id,
                reason: "id must not be empty".into(),
            });
        }

        let parsed = url::Url::parse(&self.url).map_err(|e| DispatchError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(DispatchError::InvalidUrl {
                url: self.url,
                reason: format!("unsupported scheme `{}`, expected http or https", parsed.scheme()),
            });
        }

        let retry_attempts = self.retry_attempts.unwrap_or(defaults.retry_attempts);
        if retry_attempts == 0 {
            return Err(DispatchError::InvalidConfig {
                id,
                reason: "retry_attempts must be at least 1".into(),
            });
        }
        let timeout_ms = self.timeout_ms.unwrap_or(defaults.timeout_ms);
        if timeout_ms == 0 {
            return Err(DispatchError::InvalidConfig {
                id,
                reason: "timeout_ms must be greater than 0".into(),
            });
        }

        for (name, value) in &self.headers {
            if HeaderName::from_bytes(name.as_bytes()).is_err() {
                return Err(DispatchError::InvalidConfig {
                    id,
                    reason: format!("invalid header name `{name}`"),
                });
            }
            if HeaderValue::from_str(value).is_err() {
                return Err(DispatchError::InvalidConfig {
                    id,
                    reason: format!("invalid value for header `{name}`"),
                });
            }
        }

        Ok(Webhook {
            id,
            url: self.url,
            secret: self.secret.filter(|s| !s.is_empty()),
            headers: self.headers,
            retry_attempts,
            retry_delay_ms: self.retry_delay_ms.unwrap_or(defaults.retry_delay_ms),
            timeout_ms,
            signature_scheme: self.signature_scheme,
            registered_at: Utc::now(),
        })
    }
}

/// A registered webhook with every default resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub timeout_ms: u64,
    #[serde(default)]
    pub signature_scheme: SignatureScheme,
    pub registered_at: DateTime<Utc>,
}

impl Webhook {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// JSON body POSTed to every destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: String,
    pub payload: serde_json::Value,
    /// ISO-8601, UTC, millisecond precision.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
}

impl EventEnvelope {
    pub fn new(
        event: &str,
        payload: serde_json::Value,
        metadata: Option<EventMetadata>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            event: event.to_string(),
            payload,
            timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
            metadata,
        }
    }
}

/// Outcome of one destination within one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub webhook_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Body of the last HTTP response, truncated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
}

/// Immutable audit record, one per destination per dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchLog {
    pub id: String,
    pub webhook_id: String,
    pub event: String,
    pub url: String,
    pub timestamp: DateTime<Utc>,
    /// What was sent.
    pub envelope: EventEnvelope,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Body of the last HTTP response, truncated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    #[serde(default)]
    pub webhook_id: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    /// Keep only the most recent `limit` matches.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl LogFilter {
    pub fn webhook(id: impl Into<String>) -> Self {
        Self {
            webhook_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn event(name: impl Into<String>) -> Self {
        Self {
            event: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &DispatchLog) -> bool {
        self.webhook_id.as_deref().map_or(true, |id| entry.webhook_id == id)
            && self.event.as_deref().map_or(true, |ev| entry.event == ev)
    }
}
