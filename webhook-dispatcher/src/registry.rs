use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{DispatchError, Result};
use crate::events;
use crate::types::Webhook;

/// Registered webhooks and event subscriptions.
///
/// Every id in `subscriptions` refers to an entry in `webhooks`; the
/// mutators below keep it that way.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    webhooks: HashMap<String, Webhook>,
    /// Registration order; an overwrite keeps the original slot.
    #[serde(default)]
    order: Vec<String>,
    #[serde(default)]
    subscriptions: BTreeMap<String, BTreeSet<String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite. Returns true when an existing registration was
    /// replaced.
    pub fn insert(&mut self, webhook: Webhook) -> bool {
        let id = webhook.id.clone();
        let replaced = self.webhooks.insert(id.clone(), webhook).is_some();
        if !replaced {
            self.order.push(id);
        }
        replaced
    }

    pub fn remove(&mut self, id: &str) -> Option<Webhook> {
        let removed = self.webhooks.remove(id)?;
        self.order.retain(|o| o != id);
        for subscribers in self.subscriptions.values_mut() {
            subscribers.remove(id);
        }
        self.subscriptions.retain(|_, subscribers| !subscribers.is_empty());
        Some(removed)
    }

    pub fn get(&self, id: &str) -> Option<&Webhook> {
        self.webhooks.get(id)
    }

    pub fn len(&self) -> usize {
        self.webhooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.webhooks.is_empty()
    }

    /// Webhooks in registration order.
    pub fn list(&self) -> Vec<&Webhook> {
        self.order.iter().filter_map(|id| self.webhooks.get(id)).collect()
    }

    pub fn subscribe<S: AsRef<str>>(&mut self, id: &str, events: &[S]) -> Result<()> {
        if !self.webhooks.contains_key(id) {
            return Err(DispatchError::UnknownWebhook(id.to_string()));
        }
        validate_events(events)?;
        for event in events {
            self.subscriptions
                .entry(event.as_ref().to_string())
                .or_default()
                .insert(id.to_string());
        }
        Ok(())
    }

    /// Remove `id` from the named events, or from every event when `events`
    /// is empty.
    pub fn unsubscribe<S: AsRef<str>>(&mut self, id: &str, events: &[S]) -> Result<()> {
        if !self.webhooks.contains_key(id) {
            return Err(DispatchError::UnknownWebhook(id.to_string()));
        }
        if events.is_empty() {
            for subscribers in self.subscriptions.values_mut() {
                subscribers.remove(id);
            }
        } else {
            for event in events {
                if let Some(subscribers) = self.subscriptions.get_mut(event.as_ref()) {
                    subscribers.remove(id);
                }
            }
        }
        self.subscriptions.retain(|_, subscribers| !subscribers.is_empty());
        Ok(())
    }

    /// Webhooks that should receive `event`, in registration order.
    pub fn subscribers(&self, event: &str) -> Vec<Webhook> {
        let direct = self.subscriptions.get(event);
        let wildcard = self.subscriptions.get(events::WILDCARD);
        self.order
            .iter()
            .filter(|id| {
                direct.is_some_and(|s| s.contains(*id)) || wildcard.is_some_and(|s| s.contains(*id))
            })
            .filter_map(|id| self.webhooks.get(id).cloned())
            .collect()
    }

    /// Events `id` is subscribed to, sorted.
    pub fn events_for(&self, id: &str) -> Vec<String> {
        self.subscriptions
            .iter()
            .filter(|(_, subscribers)| subscribers.contains(id))
            .map(|(event, _)| event.clone())
            .collect()
    }

    /// Drop dangling ids and rebuild the order list. Used after loading a
    /// snapshot that may have been edited by hand.
    pub fn normalize(&mut self) {
        let webhooks = &self.webhooks;
        let mut seen = BTreeSet::new();
        self.order
            .retain(|id| webhooks.contains_key(id) && seen.insert(id.clone()));
        let mut missing: Vec<&Webhook> = webhooks
            .values()
            .filter(|w| !seen.contains(&w.id))
            .collect();
        missing.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then(a.id.cmp(&b.id)));
        let missing: Vec<String> = missing.into_iter().map(|w| w.id.clone()).collect();
        self.order.extend(missing);

        for subscribers in self.subscriptions.values_mut() {
            subscribers.retain(|id| webhooks.contains_key(id));
        }
        self.subscriptions.retain(|_, subscribers| !subscribers.is_empty());
    }
}

/// Blank names are rejected; uncatalogued ones only warn.
pub(crate) fn validate_events<S: AsRef<str>>(events: &[S]) -> Result<()> {
    for event in events {
        let name = event.as_ref();
        if name.trim().is_empty() {
            return Err(DispatchError::InvalidEvent(name.to_string()));
        }
        if !events::is_known(name) {
            tracing::warn!("subscribing to uncatalogued event `{name}`");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::types::WebhookConfig;

    fn webhook(id: &str) -> Webhook {
        WebhookConfig::new(id, format!("https://{id}.test/hook"))
            .resolve(&DispatcherConfig::default())
            .unwrap()
    }

    fn ids(webhooks: &[Webhook]) -> Vec<&str> {
        webhooks.iter().map(|w| w.id.as_str()).collect()
    }

    #[test]
    fn overwrite_keeps_slot_and_subscriptions() {
        let mut registry = Registry::new();
        assert!(!registry.insert(webhook("a")));
        assert!(!registry.insert(webhook("b")));
        registry.subscribe("a", &["deal.created"]).unwrap();

        let mut replacement = webhook("a");
        replacement.url = "https://new.test/hook".into();
        assert!(registry.insert(replacement));

        assert_eq!(registry.len(), 2);
        let listed: Vec<&str> = registry.list().iter().map(|w| w.id.as_str()).collect();
        assert_eq!(listed, vec!["a", "b"]);
        let subs = registry.subscribers("deal.created");
        assert_eq!(ids(&subs), vec!["a"]);
        assert_eq!(subs[0].url, "https://new.test/hook");
    }

    #[test]
    fn remove_clears_every_subscription() {
        let mut registry = Registry::new();
        registry.insert(webhook("a"));
        registry.subscribe("a", &["deal.created", "deal.won", "*"]).unwrap();

        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert!(registry.subscribers("deal.created").is_empty());
        assert!(registry.subscribers("deal.won").is_empty());
        assert!(registry.events_for("a").is_empty());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn subscribe_unknown_id_fails_without_side_effects() {
        let mut registry = Registry::new();
        let err = registry.subscribe("ghost", &["deal.created"]).unwrap_err();
        assert_eq!(err, DispatchError::UnknownWebhook("ghost".into()));
        assert!(registry.subscribers("deal.created").is_empty());

        let err = registry.unsubscribe("ghost", &["deal.created"]).unwrap_err();
        assert_eq!(err, DispatchError::UnknownWebhook("ghost".into()));
    }

    #[test]
    fn blank_event_names_are_rejected() {
        let mut registry = Registry::new();
        registry.insert(webhook("a"));
        assert!(matches!(
            registry.subscribe("a", &["deal.created", " "]),
            Err(DispatchError::InvalidEvent(_))
        ));
        assert!(registry.events_for("a").is_empty());
    }

    #[test]
    fn unsubscribe_specific_and_all() {
        let mut registry = Registry::new();
        registry.insert(webhook("a"));
        registry
            .subscribe("a", &["deal.created", "deal.won", "deal.lost"])
            .unwrap();

        registry.unsubscribe("a", &["deal.created"]).unwrap();
        assert_eq!(registry.events_for("a"), vec!["deal.lost", "deal.won"]);

        registry.unsubscribe::<&str>("a", &[]).unwrap();
        assert!(registry.events_for("a").is_empty());
        assert!(registry.get("a").is_some());
    }

    #[test]
    fn subscribers_follow_registration_order_and_wildcard() {
        let mut registry = Registry::new();
        registry.insert(webhook("c"));
        registry.insert(webhook("a"));
        registry.insert(webhook("b"));
        registry.subscribe("b", &["deal.won"]).unwrap();
        registry.subscribe("c", &["deal.won"]).unwrap();
        registry.subscribe("a", &["*"]).unwrap();

        assert_eq!(ids(&registry.subscribers("deal.won")), vec!["c", "a", "b"]);
        assert_eq!(ids(&registry.subscribers("contact.created")), vec!["a"]);
    }

    #[test]
    fn normalize_repairs_loaded_state() {
        let mut registry = Registry::new();
        registry.insert(webhook("a"));
        registry.subscribe("a", &["deal.won"]).unwrap();

        let mut value = serde_json::to_value(&registry).unwrap();
        value["order"] = serde_json::json!(["ghost", "a", "a"]);
        value["subscriptions"]["deal.won"] = serde_json::json!(["a", "ghost"]);
        value["subscriptions"]["deal.lost"] = serde_json::json!(["ghost"]);

        let mut loaded: Registry = serde_json::from_value(value).unwrap();
        loaded.normalize();
        assert_eq!(loaded, registry);
    }
}
