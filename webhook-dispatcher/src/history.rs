use std::collections::VecDeque;

use crate::types::{DispatchLog, LogFilter, WebhookStats};

/// Bounded, append-only delivery log. Oldest entries are evicted first.
#[derive(Debug)]
pub struct DeliveryHistory {
    entries: VecDeque<DispatchLog>,
    capacity: usize,
}

impl DeliveryHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn append(&mut self, entry: DispatchLog) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Matching entries, oldest first.
    pub fn query(&self, filter: &LogFilter) -> Vec<DispatchLog> {
        let mut matched: Vec<DispatchLog> = self
            .entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }

    pub fn stats(&self, webhook_id: &str) -> WebhookStats {
        self.entries
            .iter()
            .filter(|e| e.webhook_id == webhook_id)
            .fold(WebhookStats::default(), |mut acc, e| {
                acc.total += 1;
                if e.success {
                    acc.success += 1;
                } else {
                    acc.failed += 1;
                }
                acc
            })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventEnvelope;
    use chrono::Utc;

    fn entry(id: &str, webhook: &str, event: &str, success: bool) -> DispatchLog {
        DispatchLog {
            id: id.into(),
            webhook_id: webhook.into(),
            event: event.into(),
            url: "https://x.test/hook".into(),
            timestamp: Utc::now(),
            envelope: EventEnvelope::new(event, serde_json::json!({}), None, Utc::now()),
            success,
            status_code: if success { Some(200) } else { Some(500) },
            error: None,
            response_body: None,
            attempts: 1,
            duration_ms: 1,
        }
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let mut history = DeliveryHistory::new(2);
        history.append(entry("a", "w1", "deal.created", true));
        history.append(entry("b", "w1", "deal.created", true));
        history.append(entry("c", "w1", "deal.created", true));
        let ids: Vec<String> = history.query(&LogFilter::default()).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn query_filters_and_limits_keep_order() {
        let mut history = DeliveryHistory::new(100);
        history.append(entry("1", "w1", "deal.created", true));
        history.append(entry("2", "w2", "deal.created", false));
        history.append(entry("3", "w1", "deal.won", false));
        history.append(entry("4", "w1", "deal.created", true));

        let ids = |filter: LogFilter| -> Vec<String> {
            history.query(&filter).into_iter().map(|e| e.id).collect()
        };
        assert_eq!(ids(LogFilter::webhook("w1")), vec!["1", "3", "4"]);
        assert_eq!(ids(LogFilter::event("deal.created")), vec!["1", "2", "4"]);
        assert_eq!(
            ids(LogFilter {
                webhook_id: Some("w1".into()),
                event: Some("deal.created".into()),
                limit: Some(1),
            }),
            vec!["4"]
        );
        assert_eq!(
            ids(LogFilter {
                limit: Some(10),
                ..LogFilter::default()
            })
            .len(),
            4
        );
    }

    #[test]
    fn stats_per_webhook() {
        let mut history = DeliveryHistory::new(100);
        history.append(entry("1", "w1", "deal.created", true));
        history.append(entry("2", "w1", "deal.created", false));
        history.append(entry("3", "w2", "deal.created", false));
        history.append(entry("4", "w1", "deal.won", true));

        assert_eq!(
            history.stats("w1"),
            WebhookStats {
                total: 3,
                success: 2,
                failed: 1
            }
        );
        assert_eq!(history.stats("missing"), WebhookStats::default());
    }
}
