//! Outbound webhook dispatcher: registrations, event subscriptions, signed
//! HTTP delivery with fixed-delay retries, and a bounded delivery log.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod history;
pub mod logging;
pub mod registry;
pub mod rpc;
pub mod signing;
pub mod store;
pub mod transport;
pub mod types;

pub use config::DispatcherConfig;
pub use dispatcher::WebhookDispatcher;
pub use error::{DispatchError, Result};
pub use signing::SignatureScheme;
pub use types::{
    DispatchLog, DispatchResult, EventEnvelope, EventMetadata, LogFilter, Webhook, WebhookConfig,
    WebhookStats,
};
