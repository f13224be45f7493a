use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

use crate::config::DispatcherConfig;
use crate::dispatcher::WebhookDispatcher;
use crate::error::DispatchError;
use crate::events;
use crate::store::RegistryStore;
use crate::types::{DispatchLog, EventMetadata, LogFilter, Webhook, WebhookConfig};

// ─── JSON-RPC wire types ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: Value,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;
pub const OPERATION_ERROR: i64 = -32000;

fn ok_response(id: Value, data: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: Some(serde_json::json!({
            "success": true,
            "data": data,
            "message": null
        })),
        error: None,
        id,
    }
}

pub fn err_response(id: Value, code: i64, message: String) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: None,
        error: Some(JsonRpcError { code, message }),
        id,
    }
}

fn raw_response(id: Value, result: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: Some(result),
        error: None,
        id,
    }
}

pub fn emit_line(out: &mut dyn Write, resp: &JsonRpcResponse) {
    match serde_json::to_string(resp) {
        Ok(line) => {
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
        Err(e) => error!("Failed to serialize response: {e}"),
    }
}

/// The host connection: responses and event publications go to `out`,
/// acknowledgements for published events are read back from `input`.
pub struct HostIo<'a> {
    pub out: &'a mut dyn Write,
    pub input: &'a mut dyn BufRead,
}

// ─── Shared app state ────────────────────────────────────────────────────────

pub struct AppState {
    dispatcher: WebhookDispatcher,
    store: Option<RegistryStore>,
    /// Log entries not yet published to the host.
    pending_rx: Option<mpsc::UnboundedReceiver<DispatchLog>>,
}

impl AppState {
    /// Uninitialized state with default settings and no persistence.
    pub fn new() -> Result<Self, DispatchError> {
        Ok(Self {
            dispatcher: WebhookDispatcher::new(DispatcherConfig::default())?,
            store: None,
            pending_rx: None,
        })
    }

    pub fn dispatcher(&self) -> &WebhookDispatcher {
        &self.dispatcher
    }

    async fn persist(&self) -> Result<(), String> {
        match &self.store {
            Some(store) => store
                .save(&self.dispatcher.snapshot().await)
                .map_err(|e| e.to_string()),
            None => Ok(()),
        }
    }
}

// ─── Request dispatch ─────────────────────────────────────────────────────────

pub async fn handle_request(
    req: &JsonRpcRequest,
    state: &Arc<RwLock<AppState>>,
    io: &mut HostIo<'_>,
) -> JsonRpcResponse {
    match req.method.as_str() {
        "initialize" => handle_initialize(req, state).await,
        "shutdown" => handle_shutdown(req, state).await,
        "execute" => handle_execute(req, state, io).await,
        _ => err_response(
            req.id.clone(),
            METHOD_NOT_FOUND,
            format!("Unknown method: {}", req.method),
        ),
    }
}

async fn handle_initialize(req: &JsonRpcRequest, state: &Arc<RwLock<AppState>>) -> JsonRpcResponse {
    let data_dir = req
        .params
        .get("data_dir")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let config = match DispatcherConfig::from_value(req.params.get("config")) {
        Ok(c) => c,
        Err(e) => return err_response(req.id.clone(), INTERNAL_ERROR, e),
    };

    let (log_tx, log_rx) = mpsc::unbounded_channel();
    let dispatcher = match WebhookDispatcher::new(config) {
        Ok(d) => d.with_log_sink(log_tx),
        Err(e) => return err_response(req.id.clone(), INTERNAL_ERROR, e.to_string()),
    };

    let store = RegistryStore::new(data_dir);
    match store.load() {
        Ok(Some(registry)) => dispatcher.restore(registry).await,
        Ok(None) => {}
        Err(e) => error!("Failed to load webhook registry: {e}"),
    }
    info!("Webhook dispatcher ready (data dir: {})", store.data_dir().display());

    let mut st = state.write().await;
    st.dispatcher = dispatcher;
    st.store = Some(store);
    st.pending_rx = Some(log_rx);

    raw_response(req.id.clone(), serde_json::json!({ "ready": true }))
}

async fn handle_shutdown(req: &JsonRpcRequest, state: &Arc<RwLock<AppState>>) -> JsonRpcResponse {
    let st = state.read().await;
    if let Err(e) = st.persist().await {
        error!("Failed to save webhook registry on shutdown: {e}");
    }
    raw_response(req.id.clone(), serde_json::json!({}))
}

// ─── Execute handler ──────────────────────────────────────────────────────────

async fn handle_execute(
    req: &JsonRpcRequest,
    state: &Arc<RwLock<AppState>>,
    io: &mut HostIo<'_>,
) -> JsonRpcResponse {
    drain_pending_events(state, io).await;

    let operation = req
        .params
        .get("operation")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let input = req
        .params
        .get("input")
        .cloned()
        .unwrap_or(Value::Object(Default::default()));

    match execute(operation, &input, state).await {
        Ok(data) => ok_response(req.id.clone(), data),
        Err(msg) => err_response(req.id.clone(), OPERATION_ERROR, msg),
    }
}

pub async fn execute(
    operation: &str,
    input: &Value,
    state: &Arc<RwLock<AppState>>,
) -> Result<Value, String> {
    match operation {
        "register_webhook" => op_register_webhook(input, state).await,
        "unregister_webhook" => op_unregister_webhook(input, state).await,
        "subscribe" => op_subscribe(input, state).await,
        "unsubscribe" => op_unsubscribe(input, state).await,
        "dispatch" => op_dispatch(input, state).await,
        "test_webhook" => op_test_webhook(input, state).await,
        "get_logs" => op_get_logs(input, state).await,
        "get_webhook_stats" => op_get_webhook_stats(input, state).await,
        "list_webhooks" => op_list_webhooks(state).await,
        "list_event_types" => Ok(op_list_event_types()),
        "get_dispatcher_info" => op_get_dispatcher_info(state).await,
        _ => Err(format!("Unknown operation: {operation}")),
    }
}

// ─── Pending event draining ───────────────────────────────────────────────────

/// Publish recorded deliveries to the host as `event.publish` calls.
/// Only valid while the host is waiting on one of our responses.
async fn drain_pending_events(state: &Arc<RwLock<AppState>>, io: &mut HostIo<'_>) {
    let mut pending: Vec<DispatchLog> = Vec::new();
    {
        let mut st = state.write().await;
        if let Some(rx) = &mut st.pending_rx {
            while let Ok(entry) = rx.try_recv() {
                pending.push(entry);
            }
        }
    }

    static NEXT_ID: AtomicU64 = AtomicU64::new(20000);

    for entry in &pending {
        let call_id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let event_type = if entry.success {
            "webhook.delivered"
        } else {
            "webhook.failed"
        };
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "event.publish",
            "params": {
                "type": event_type,
                "subject": entry.webhook_id,
                "data": entry,
            },
            "id": call_id,
        });
        let _ = writeln!(io.out, "{req}");
        let _ = io.out.flush();

        // Keep the protocol in step: the host answers every publish.
        let mut line = String::new();
        if io.input.read_line(&mut line).is_err() {
            warn!("Host did not acknowledge event.publish {call_id}");
        }
    }
}

// ─── Operations ───────────────────────────────────────────────────────────────

fn required_str<'a>(input: &'a Value, key: &str) -> Result<&'a str, String> {
    input
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing required field: {key}"))
}

fn string_list(input: &Value, key: &str) -> Result<Vec<String>, String> {
    match input.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(v) => serde_json::from_value(v.clone()).map_err(|_| format!("{key} must be an array of strings")),
    }
}

/// Registration as shown to the host: secret redacted, subscriptions and
/// delivery stats attached.
async fn webhook_view(webhook: &Webhook, dispatcher: &WebhookDispatcher) -> Value {
    let stats = dispatcher.get_webhook_stats(&webhook.id).await;
    let success_rate = if stats.total == 0 {
        Value::Null
    } else {
        serde_json::json!(stats.success as f64 / stats.total as f64)
    };
    let mut view = serde_json::to_value(webhook).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut view {
        map.remove("secret");
        map.insert("has_secret".into(), Value::Bool(webhook.secret.is_some()));
        map.insert(
            "events".into(),
            serde_json::json!(dispatcher.subscriptions_for(&webhook.id).await),
        );
        map.insert("stats".into(), serde_json::json!(stats));
        map.insert("success_rate".into(), success_rate);
    }
    view
}

async fn op_register_webhook(input: &Value, state: &Arc<RwLock<AppState>>) -> Result<Value, String> {
    let config: WebhookConfig =
        serde_json::from_value(input.clone()).map_err(|e| format!("invalid webhook config: {e}"))?;
    let events = string_list(input, "events")?;

    let st = state.read().await;
    let webhook = st
        .dispatcher
        .register_and_subscribe(config, &events)
        .await
        .map_err(|e| e.to_string())?;
    st.persist().await?;
    Ok(webhook_view(&webhook, &st.dispatcher).await)
}

async fn op_unregister_webhook(input: &Value, state: &Arc<RwLock<AppState>>) -> Result<Value, String> {
    let id = required_str(input, "webhook_id")?;
    let st = state.read().await;
    let removed = st.dispatcher.unregister_webhook(id).await;
    if removed {
        st.persist().await?;
    }
    Ok(serde_json::json!({ "removed": removed }))
}

async fn op_subscribe(input: &Value, state: &Arc<RwLock<AppState>>) -> Result<Value, String> {
    let id = required_str(input, "webhook_id")?;
    let events = string_list(input, "events")?;
    if events.is_empty() {
        return Err("events must not be empty".into());
    }
    let st = state.read().await;
    st.dispatcher
        .subscribe(id, &events)
        .await
        .map_err(|e| e.to_string())?;
    st.persist().await?;
    Ok(serde_json::json!({
        "webhook_id": id,
        "events": st.dispatcher.subscriptions_for(id).await,
    }))
}

async fn op_unsubscribe(input: &Value, state: &Arc<RwLock<AppState>>) -> Result<Value, String> {
    let id = required_str(input, "webhook_id")?;
    let events = string_list(input, "events")?;
    let st = state.read().await;
    st.dispatcher
        .unsubscribe(id, &events)
        .await
        .map_err(|e| e.to_string())?;
    st.persist().await?;
    Ok(serde_json::json!({
        "webhook_id": id,
        "events": st.dispatcher.subscriptions_for(id).await,
    }))
}

async fn op_dispatch(input: &Value, state: &Arc<RwLock<AppState>>) -> Result<Value, String> {
    let event = required_str(input, "event")?;
    let payload = input
        .get("payload")
        .cloned()
        .unwrap_or(Value::Object(Default::default()));
    let metadata: Option<EventMetadata> = match input.get("metadata") {
        None | Some(Value::Null) => None,
        Some(v) => Some(serde_json::from_value(v.clone()).map_err(|e| format!("invalid metadata: {e}"))?),
    };

    let dispatcher = state.read().await.dispatcher.clone();
    let results = dispatcher.dispatch_with_metadata(event, payload, metadata).await;
    let delivered = results.iter().filter(|r| r.success).count();
    Ok(serde_json::json!({
        "event": event,
        "delivered": delivered,
        "failed": results.len() - delivered,
        "results": results,
    }))
}

async fn op_test_webhook(input: &Value, state: &Arc<RwLock<AppState>>) -> Result<Value, String> {
    let id = required_str(input, "webhook_id")?;
    let dispatcher = state.read().await.dispatcher.clone();
    let result = dispatcher.test_webhook(id).await.map_err(|e| e.to_string())?;
    serde_json::to_value(result).map_err(|e| e.to_string())
}

async fn op_get_logs(input: &Value, state: &Arc<RwLock<AppState>>) -> Result<Value, String> {
    let filter: LogFilter =
        serde_json::from_value(input.clone()).map_err(|e| format!("invalid log filter: {e}"))?;
    let st = state.read().await;
    let logs = st.dispatcher.get_logs(&filter).await;
    Ok(serde_json::json!({ "count": logs.len(), "logs": logs }))
}

async fn op_get_webhook_stats(input: &Value, state: &Arc<RwLock<AppState>>) -> Result<Value, String> {
    let id = required_str(input, "webhook_id")?;
    let st = state.read().await;
    let stats = st.dispatcher.get_webhook_stats(id).await;
    Ok(serde_json::json!({
        "webhook_id": id,
        "total": stats.total,
        "success": stats.success,
        "failed": stats.failed,
    }))
}

async fn op_list_webhooks(state: &Arc<RwLock<AppState>>) -> Result<Value, String> {
    let st = state.read().await;
    let mut items = Vec::new();
    for webhook in st.dispatcher.list_webhooks().await {
        items.push(webhook_view(&webhook, &st.dispatcher).await);
    }
    Ok(serde_json::json!({ "count": items.len(), "webhooks": items }))
}

fn op_list_event_types() -> Value {
    serde_json::json!({
        "events": events::KNOWN_EVENTS,
        "wildcard": events::WILDCARD,
    })
}

async fn op_get_dispatcher_info(state: &Arc<RwLock<AppState>>) -> Result<Value, String> {
    let st = state.read().await;
    Ok(serde_json::json!({
        "webhook_count": st.dispatcher.list_webhooks().await.len(),
        "log_entries": st.dispatcher.log_len().await,
        "config": st.dispatcher.config(),
        "data_dir": st.store.as_ref().map(|s| s.data_dir().display().to_string()),
    }))
}
