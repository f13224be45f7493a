use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::error::DispatchError;

/// Response bodies are kept only for diagnostics.
const MAX_RESPONSE_BODY_CHARS: usize = 1000;

/// One outbound POST, fully prepared by the dispatcher.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

impl OutboundRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub reason: String,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Request(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, request: &OutboundRequest) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport used outside tests.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| DispatchError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, request: &OutboundRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .post(&request.url)
            .timeout(request.timeout)
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(request.timeout)
            } else {
                TransportError::Request(e.to_string())
            }
        })?;

        let status = resp.status();
        let body = match resp.text().await {
            Ok(text) => text.chars().take(MAX_RESPONSE_BODY_CHARS).collect(),
            Err(e) if e.is_timeout() => return Err(TransportError::Timeout(request.timeout)),
            Err(_) => String::new(),
        };

        Ok(TransportResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let request = OutboundRequest {
            url: "https://x.test".into(),
            headers: vec![("X-Webhook-Event".into(), "deal.won".into())],
            body: Vec::new(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(request.header("x-webhook-event"), Some("deal.won"));
        assert_eq!(request.header("content-type"), None);
    }

    #[test]
    fn success_range() {
        let resp = |status| TransportResponse {
            status,
            reason: String::new(),
            body: String::new(),
        };
        assert!(resp(200).is_success());
        assert!(resp(204).is_success());
        assert!(!resp(199).is_success());
        assert!(!resp(302).is_success());
        assert!(!resp(500).is_success());
    }

    #[tokio::test]
    async fn connection_refused_is_a_request_error() {
        let transport = HttpTransport::new("test-agent").unwrap();
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let request = OutboundRequest {
            url: format!("http://127.0.0.1:{port}/hook"),
            headers: vec![],
            body: b"{}".to_vec(),
            timeout: Duration::from_secs(5),
        };
        let err = transport.post(&request).await.unwrap_err();
        assert!(matches!(err, TransportError::Request(_)), "{err:?}");
    }
}
