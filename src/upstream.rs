//! Client for the AI Core inference service.
//!
//! One pooled `reqwest::Client` is shared by every request for the life of
//! the process and released by [`ChatUpstream::close`] during shutdown. No
//! retries happen here; every failure is classified once into
//! [`UpstreamError`] and handed back to the caller.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::UpstreamError;

/// Longest slice of an error body kept for logs.
const ERROR_BODY_LOG_LIMIT: usize = 200;

/// A completed chat turn as returned by AI Core.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamReply {
    pub response: String,
    pub session_id: String,
    /// Versioned, loosely-typed metadata. Not interpreted here.
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpstreamHistory {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<UpstreamHistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpstreamHistoryEntry {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, alias = "timestamp")]
    pub created_at: Option<String>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

/// The upstream seam the orchestrator talks through.
#[async_trait]
pub trait ChatUpstream: Send + Sync {
    async fn send_message(
        &self,
        message: &str,
        session_id: Option<&str>,
    ) -> Result<UpstreamReply, UpstreamError>;

    async fn get_history(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<UpstreamHistory, UpstreamError>;

    /// Release pooled connections. Returns `false` if already closed.
    async fn close(&self) -> bool;
}

pub struct AiCoreClient {
    base_url: String,
    timeout: Duration,
    client: Mutex<Option<reqwest::Client>>,
}

impl AiCoreClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| UpstreamError::Unreachable {
                url: base_url.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            client: Mutex::new(Some(client)),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn client(&self) -> Result<reqwest::Client, UpstreamError> {
        let guard = self.client.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clone().ok_or_else(|| UpstreamError::Unreachable {
            url: self.base_url.clone(),
            reason: "client closed".to_string(),
        })
    }

    fn classify(&self, err: reqwest::Error, url: &str) -> UpstreamError {
        classify_transport_error(err, url, self.timeout)
    }

    async fn check_status(
        &self,
        response: reqwest::Response,
        url: &str,
    ) -> Result<reqwest::Response, UpstreamError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(ERROR_BODY_LOG_LIMIT).collect();
        tracing::error!(url, status = status.as_u16(), body = %snippet, "AI Core returned an error status");
        Err(UpstreamError::Protocol {
            status: Some(status.as_u16()),
            detail: format!("HTTP {}", status.as_u16()),
        })
    }
}

#[async_trait]
impl ChatUpstream for AiCoreClient {
    async fn send_message(
        &self,
        message: &str,
        session_id: Option<&str>,
    ) -> Result<UpstreamReply, UpstreamError> {
        let client = self.client()?;
        let url = format!("{}/chat", self.base_url);
        tracing::info!(
            url = %url,
            has_session = session_id.is_some(),
            message_length = message.len(),
            "Calling AI Core"
        );

        let response = client
            .post(&url)
            .json(&ChatRequest { message, session_id })
            .send()
            .await
            .map_err(|e| self.classify(e, &url))?;
        let response = self.check_status(response, &url).await?;
        let body: Value = response.json().await.map_err(|e| self.classify(e, &url))?;

        let reply = parse_reply(body)?;
        tracing::info!(
            session_id = %reply.session_id,
            response_length = reply.response.len(),
            "AI Core response received"
        );
        Ok(reply)
    }

    async fn get_history(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<UpstreamHistory, UpstreamError> {
        let client = self.client()?;
        let url = format!("{}/chat/history/{}", self.base_url, session_id);
        let response = client
            .get(&url)
            .query(&[("limit", limit)])
            .send()
            .await
            .map_err(|e| self.classify(e, &url))?;
        let response = self.check_status(response, &url).await?;
        response.json().await.map_err(|e| self.classify(e, &url))
    }

    async fn close(&self) -> bool {
        let mut guard = self.client.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.take().is_some() {
            tracing::info!(url = %self.base_url, "AI Core client closed");
            true
        } else {
            tracing::warn!(url = %self.base_url, "AI Core client already closed");
            false
        }
    }
}

/// Map a transport failure onto the three upstream error kinds.
///
/// Timeout is checked first: a connect timeout is both a timeout and a
/// connect error, and should surface as a timeout.
pub fn classify_transport_error(err: reqwest::Error, url: &str, timeout: Duration) -> UpstreamError {
    if err.is_timeout() {
        tracing::error!(url, ?timeout, error = %err, "AI Core timed out");
        return UpstreamError::Timeout { timeout };
    }
    if err.is_connect() {
        tracing::error!(url, error = %err, "Cannot connect to AI Core");
        return UpstreamError::Unreachable {
            url: url.to_string(),
            reason: err.to_string(),
        };
    }
    if let Some(status) = err.status() {
        return UpstreamError::Protocol {
            status: Some(status.as_u16()),
            detail: err.to_string(),
        };
    }
    if err.is_decode() {
        tracing::error!(url, error = %err, "AI Core sent an undecodable body");
        return UpstreamError::Protocol {
            status: None,
            detail: format!("undecodable body: {err}"),
        };
    }
    classify_by_message(&err.to_string(), url, timeout)
}

/// Last-resort classification for errors that carry no structured kind.
fn classify_by_message(message: &str, url: &str, timeout: Duration) -> UpstreamError {
    let lowered = message.to_lowercase();
    tracing::error!(url, error = %message, "AI Core request failed");
    if lowered.contains("timed out") || lowered.contains("timeout") {
        UpstreamError::Timeout { timeout }
    } else if lowered.contains("connect") {
        UpstreamError::Unreachable {
            url: url.to_string(),
            reason: message.to_string(),
        }
    } else {
        UpstreamError::Protocol {
            status: None,
            detail: message.to_string(),
        }
    }
}

fn parse_reply(body: Value) -> Result<UpstreamReply, UpstreamError> {
    let Value::Object(mut map) = body else {
        return Err(UpstreamError::Protocol {
            status: None,
            detail: "response body is not a JSON object".to_string(),
        });
    };
    let response = match map.remove("response") {
        Some(Value::String(s)) => s,
        _ => {
            return Err(UpstreamError::Protocol {
                status: None,
                detail: "missing 'response'".to_string(),
            });
        }
    };
    let session_id = match map.remove("session_id") {
        Some(Value::String(s)) if !s.trim().is_empty() => s,
        _ => {
            return Err(UpstreamError::Protocol {
                status: None,
                detail: "missing 'session_id'".to_string(),
            });
        }
    };
    Ok(UpstreamReply {
        response,
        session_id,
        metadata: map.remove("metadata").unwrap_or(Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reply_requires_response_and_session_id() {
        let ok = parse_reply(json!({"response": "hi", "session_id": "abc", "metadata": {"tone": "casual"}}))
            .expect("valid reply");
        assert_eq!(ok.session_id, "abc");
        assert_eq!(ok.metadata, json!({"tone": "casual"}));

        let no_meta = parse_reply(json!({"response": "hi", "session_id": "abc"})).expect("valid reply");
        assert_eq!(no_meta.metadata, Value::Null);

        for bad in [
            json!([]),
            json!({"session_id": "abc"}),
            json!({"response": "hi"}),
            json!({"response": "hi", "session_id": ""}),
            json!({"response": 3, "session_id": "abc"}),
        ] {
            assert!(matches!(parse_reply(bad), Err(UpstreamError::Protocol { status: None, .. })));
        }
    }

    #[test]
    fn message_fallback_classification() {
        let timeout = Duration::from_secs(3);
        assert!(matches!(
            classify_by_message("operation timed out", "http://x", timeout),
            UpstreamError::Timeout { .. }
        ));
        assert!(matches!(
            classify_by_message("error trying to connect", "http://x", timeout),
            UpstreamError::Unreachable { .. }
        ));
        assert!(matches!(
            classify_by_message("stream reset", "http://x", timeout),
            UpstreamError::Protocol { .. }
        ));
    }

    #[tokio::test]
    async fn close_is_reported_once() {
        let client = AiCoreClient::new("http://127.0.0.1:9/", Duration::from_secs(1)).expect("client");
        assert_eq!(client.base_url(), "http://127.0.0.1:9");
        assert!(client.close().await);
        assert!(!client.close().await);

        let err = client.send_message("hi", None).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Unreachable { ref reason, .. } if reason == "client closed"));
    }

    #[test]
    fn history_accepts_timestamp_alias() {
        let history: UpstreamHistory = serde_json::from_value(json!({
            "session_id": "abc",
            "messages": [
                {"role": "user", "content": "hi", "timestamp": "2026-02-01T10:00:00Z"},
                {"role": "assistant", "content": "hello", "metadata": {"persona": "Friendly"}}
            ]
        }))
        .expect("history");
        assert_eq!(history.messages.len(), 2);
        assert_eq!(history.messages[0].created_at.as_deref(), Some("2026-02-01T10:00:00Z"));
        assert_eq!(history.messages[1].metadata, json!({"persona": "Friendly"}));
    }
}
