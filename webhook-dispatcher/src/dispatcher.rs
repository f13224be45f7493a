use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::error::{DispatchError, Result};
use crate::events;
use crate::history::DeliveryHistory;
use crate::registry::{self, Registry};
use crate::signing;
use crate::transport::{HttpTransport, OutboundRequest, Transport, TransportError, TransportResponse};
use crate::types::{
    DispatchLog, DispatchResult, EventEnvelope, EventMetadata, LogFilter, Webhook, WebhookConfig,
    WebhookStats,
};

/// Delivers events to subscribed webhooks.
///
/// Cheap to clone; clones share the registry, the log and the transport.
/// Nothing here holds a lock across network I/O.
#[derive(Clone)]
pub struct WebhookDispatcher {
    config: DispatcherConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<RwLock<Registry>>,
    history: Arc<RwLock<DeliveryHistory>>,
    log_sink: Option<mpsc::UnboundedSender<DispatchLog>>,
}

enum AttemptOutcome {
    Delivered(TransportResponse),
    Rejected(TransportResponse),
    Failed(TransportError),
}

impl AttemptOutcome {
    fn is_delivered(&self) -> bool {
        matches!(self, AttemptOutcome::Delivered(_))
    }

    fn describe(&self) -> String {
        match self {
            AttemptOutcome::Delivered(resp) => format!("HTTP {}", resp.status),
            AttemptOutcome::Rejected(resp) if resp.reason.is_empty() => {
                format!("HTTP {}", resp.status)
            }
            AttemptOutcome::Rejected(resp) => format!("HTTP {}: {}", resp.status, resp.reason),
            AttemptOutcome::Failed(e) => e.to_string(),
        }
    }

    fn into_result(self, webhook_id: &str, attempts: u32, duration_ms: u64) -> DispatchResult {
        let error = match &self {
            AttemptOutcome::Delivered(_) => None,
            _ => Some(self.describe()),
        };
        let (status_code, response_body) = match &self {
            AttemptOutcome::Delivered(resp) | AttemptOutcome::Rejected(resp) => (
                Some(resp.status),
                Some(resp.body.clone()).filter(|b| !b.is_empty()),
            ),
            AttemptOutcome::Failed(_) => (None, None),
        };
        DispatchResult {
            webhook_id: webhook_id.to_string(),
            success: self.is_delivered(),
            status_code,
            error,
            response_body,
            attempts,
            duration_ms,
        }
    }
}

impl WebhookDispatcher {
    /// Dispatcher backed by a real HTTP client.
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config.user_agent)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: DispatcherConfig, transport: Arc<dyn Transport>) -> Self {
        let history = DeliveryHistory::new(config.max_log_entries);
        Self {
            config,
            transport,
            registry: Arc::new(RwLock::new(Registry::new())),
            history: Arc::new(RwLock::new(history)),
            log_sink: None,
        }
    }

    /// Forward every log entry to `sink` as it is recorded.
    pub fn with_log_sink(mut self, sink: mpsc::UnboundedSender<DispatchLog>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Register or overwrite a webhook. Returns the resolved registration.
    pub async fn register_webhook(&self, config: WebhookConfig) -> Result<Webhook> {
        self.register_and_subscribe::<&str>(config, &[]).await
    }

    /// Register and subscribe in one step. On any error the registry is
    /// left exactly as it was.
    pub async fn register_and_subscribe<S: AsRef<str>>(
        &self,
        config: WebhookConfig,
        events: &[S],
    ) -> Result<Webhook> {
        let webhook = config.resolve(&self.config)?;
        registry::validate_events(events)?;

        let mut registry = self.registry.write().await;
        let replaced = registry.insert(webhook.clone());
        if !events.is_empty() {
            registry.subscribe(&webhook.id, events)?;
        }
        drop(registry);

        if replaced {
            info!("Re-registered webhook: {} -> {}", webhook.id, webhook.url);
        } else {
            info!("Registered webhook: {} -> {}", webhook.id, webhook.url);
        }
        Ok(webhook)
    }

    pub async fn unregister_webhook(&self, id: &str) -> bool {
        let removed = self.registry.write().await.remove(id).is_some();
        if removed {
            info!("Unregistered webhook: {id}");
        }
        removed
    }

    pub async fn subscribe<S: AsRef<str>>(&self, id: &str, events: &[S]) -> Result<()> {
        self.registry.write().await.subscribe(id, events)?;
        debug!("Webhook {id} subscribed to {} event(s)", events.len());
        Ok(())
    }

    /// An empty `events` slice unsubscribes from everything.
    pub async fn unsubscribe<S: AsRef<str>>(&self, id: &str, events: &[S]) -> Result<()> {
        self.registry.write().await.unsubscribe(id, events)
    }

    pub async fn dispatch(&self, event: &str, payload: Value) -> Vec<DispatchResult> {
        self.dispatch_with_metadata(event, payload, None).await
    }

    /// Deliver `event` to every subscriber concurrently and wait for all of
    /// them, retries included. Never fails: delivery problems are reported
    /// per webhook in the returned results, in registration order.
    pub async fn dispatch_with_metadata(
        &self,
        event: &str,
        payload: Value,
        metadata: Option<EventMetadata>,
    ) -> Vec<DispatchResult> {
        let targets = self.registry.read().await.subscribers(event);
        if targets.is_empty() {
            debug!("No subscribers for event: {event}");
            return Vec::new();
        }

        let sent_at = Utc::now();
        let envelope = EventEnvelope::new(event, payload, metadata, sent_at);
        let body = match serde_json::to_vec(&envelope) {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to encode {event} envelope: {e}");
                let mut results = Vec::with_capacity(targets.len());
                for webhook in &targets {
                    let result = DispatchResult {
                        webhook_id: webhook.id.clone(),
                        success: false,
                        status_code: None,
                        error: Some(format!("failed to encode payload: {e}")),
                        response_body: None,
                        attempts: 0,
                        duration_ms: 0,
                    };
                    results.push(self.record(webhook, &envelope, result).await);
                }
                return results;
            }
        };

        debug!("Dispatching {event} to {} webhook(s)", targets.len());
        let deliveries = targets
            .iter()
            .map(|webhook| self.deliver(webhook, &envelope, sent_at.timestamp(), &body));
        join_all(deliveries).await
    }

    /// Send a `system.health_check` event to one webhook, ignoring its
    /// subscriptions.
    pub async fn test_webhook(&self, id: &str) -> Result<DispatchResult> {
        let webhook = self
            .registry
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownWebhook(id.to_string()))?;

        let sent_at = Utc::now();
        let payload = serde_json::json!({ "test": true, "webhook_id": id });
        let envelope = EventEnvelope::new(events::HEALTH_CHECK, payload, None, sent_at);
        let body = serde_json::to_vec(&envelope).map_err(|e| DispatchError::Encode(e.to_string()))?;
        Ok(self.deliver(&webhook, &envelope, sent_at.timestamp(), &body).await)
    }

    async fn deliver(
        &self,
        webhook: &Webhook,
        envelope: &EventEnvelope,
        timestamp: i64,
        body: &[u8],
    ) -> DispatchResult {
        let started = Instant::now();
        let delivery_id = Uuid::new_v4().to_string();

        let request = match build_request(webhook, envelope, &delivery_id, timestamp, body) {
            Ok(request) => request,
            Err(e) => {
                error!("Cannot prepare delivery to webhook {}: {e}", webhook.id);
                let result = DispatchResult {
                    webhook_id: webhook.id.clone(),
                    success: false,
                    status_code: None,
                    error: Some(e.to_string()),
                    response_body: None,
                    attempts: 0,
                    duration_ms: 0,
                };
                return self.record(webhook, envelope, result).await;
            }
        };

        let max_attempts = webhook.retry_attempts.max(1);
        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            let outcome = match self.transport.post(&request).await {
                Ok(resp) if resp.is_success() => AttemptOutcome::Delivered(resp),
                Ok(resp) => AttemptOutcome::Rejected(resp),
                Err(e) => AttemptOutcome::Failed(e),
            };
            if outcome.is_delivered() || attempts >= max_attempts {
                break outcome;
            }
            warn!(
                "Webhook {} attempt {}/{} for {} failed: {}; retrying in {} ms",
                webhook.id,
                attempts,
                max_attempts,
                envelope.event,
                outcome.describe(),
                webhook.retry_delay_ms
            );
            tokio::time::sleep(webhook.retry_delay()).await;
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        if outcome.is_delivered() {
            debug!(
                "Webhook delivered: {} -> {} ({} attempt(s), {} ms)",
                webhook.id, webhook.url, attempts, duration_ms
            );
        } else {
            warn!(
                "Webhook {} gave up on {} after {} attempt(s): {}",
                webhook.id,
                envelope.event,
                attempts,
                outcome.describe()
            );
        }

        let result = outcome.into_result(&webhook.id, attempts, duration_ms);
        self.record(webhook, envelope, result).await
    }

    async fn record(
        &self,
        webhook: &Webhook,
        envelope: &EventEnvelope,
        result: DispatchResult,
    ) -> DispatchResult {
        let entry = DispatchLog {
            id: Uuid::new_v4().to_string(),
            webhook_id: webhook.id.clone(),
            event: envelope.event.clone(),
            url: webhook.url.clone(),
            timestamp: Utc::now(),
            envelope: envelope.clone(),
            success: result.success,
            status_code: result.status_code,
            error: result.error.clone(),
            response_body: result.response_body.clone(),
            attempts: result.attempts,
            duration_ms: result.duration_ms,
        };
        if let Some(sink) = &self.log_sink {
            let _ = sink.send(entry.clone());
        }
        self.history.write().await.append(entry);
        result
    }

    /// Log entries, oldest first.
    pub async fn get_logs(&self, filter: &LogFilter) -> Vec<DispatchLog> {
        self.history.read().await.query(filter)
    }

    pub async fn get_webhook_stats(&self, id: &str) -> WebhookStats {
        self.history.read().await.stats(id)
    }

    pub async fn log_len(&self) -> usize {
        self.history.read().await.len()
    }

    /// Registrations in registration order, defaults resolved.
    pub async fn list_webhooks(&self) -> Vec<Webhook> {
        self.registry.read().await.list().into_iter().cloned().collect()
    }

    pub async fn get_webhook(&self, id: &str) -> Option<Webhook> {
        self.registry.read().await.get(id).cloned()
    }

    pub async fn subscriptions_for(&self, id: &str) -> Vec<String> {
        self.registry.read().await.events_for(id)
    }

    pub async fn snapshot(&self) -> Registry {
        self.registry.read().await.clone()
    }

    /// Replace every registration and subscription with `registry`.
    pub async fn restore(&self, mut registry: Registry) {
        registry.normalize();
        info!("Restored {} webhook registration(s)", registry.len());
        *self.registry.write().await = registry;
    }
}

fn build_request(
    webhook: &Webhook,
    envelope: &EventEnvelope,
    delivery_id: &str,
    timestamp: i64,
    body: &[u8],
) -> Result<OutboundRequest> {
    let mut headers: Vec<(String, String)> = Vec::new();
    set_header(&mut headers, "Content-Type", "application/json");
    set_header(&mut headers, "X-Webhook-Event", &envelope.event);
    set_header(&mut headers, "X-Webhook-Timestamp", &envelope.timestamp);
    set_header(&mut headers, "X-Webhook-Delivery", delivery_id);
    for (name, value) in &webhook.headers {
        set_header(&mut headers, name, value);
    }
    if let Some(secret) = &webhook.secret {
        let signed =
            signing::signature_headers(webhook.signature_scheme, secret, delivery_id, timestamp, body)?;
        for (name, value) in &signed {
            set_header(&mut headers, name, value);
        }
    }

    Ok(OutboundRequest {
        url: webhook.url.clone(),
        headers,
        body: body.to_vec(),
        timeout: webhook.timeout(),
    })
}

/// Header names are case-insensitive; a later value replaces an earlier one.
fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    match headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        Some(entry) => entry.1 = value.to_string(),
        None => headers.push((name.to_string(), value.to_string())),
    }
}
