//! Bulk push-notification gateway.
//!
//! The delivery service accepts a batch of messages keyed by device push
//! token and reports a per-message ticket; a transport failure is reported
//! as a failed outcome for every recipient rather than an exception, since
//! fan-out is always best-effort for the caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Delivery priority hint for the push service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushPriority {
    Default,
    High,
    Max,
}

/// One notification, fanned out to many tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    pub priority: PushPriority,
    pub sound: Option<String>,
}

impl PushPayload {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            data: serde_json::Value::Null,
            priority: PushPriority::High,
            sound: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_priority(mut self, priority: PushPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_sound(mut self, sound: &str) -> Self {
        self.sound = Some(sound.to_string());
        self
    }
}

/// Per-recipient delivery outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct PushOutcome {
    pub token: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Bulk push dispatch by device-token list.
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Send `payload` to every token. Never errors; failures come back as
    /// unsuccessful outcomes.
    async fn send_bulk(&self, tokens: &[String], payload: &PushPayload) -> Vec<PushOutcome>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// One message in the batch request body.
#[derive(Debug, Clone, Serialize)]
struct PushMessage<'a> {
    to: &'a str,
    title: &'a str,
    body: &'a str,
    data: &'a serde_json::Value,
    priority: PushPriority,
    #[serde(skip_serializing_if = "Option::is_none")]
    sound: Option<&'a str>,
    #[serde(rename = "channelId")]
    channel_id: &'a str,
}

/// Response from the push service's send endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct PushSendResponse {
    /// One ticket per message, in request order.
    #[serde(default)]
    pub data: Vec<PushTicket>,
}

/// A single delivery ticket.
#[derive(Debug, Clone, Deserialize)]
pub struct PushTicket {
    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub message: String,
}

impl PushTicket {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Map a send response back onto the token list, in order. Missing tickets
/// count as failures.
fn outcomes_from_response(tokens: &[String], response: &PushSendResponse) -> Vec<PushOutcome> {
    tokens
        .iter()
        .enumerate()
        .map(|(i, token)| match response.data.get(i) {
            Some(ticket) if ticket.is_ok() => PushOutcome {
                token: token.clone(),
                success: true,
                error: None,
            },
            Some(ticket) => PushOutcome {
                token: token.clone(),
                success: false,
                error: Some(ticket.message.clone()),
            },
            None => PushOutcome {
                token: token.clone(),
                success: false,
                error: Some("no ticket returned".to_string()),
            },
        })
        .collect()
}

fn all_failed(tokens: &[String], error: &str) -> Vec<PushOutcome> {
    tokens
        .iter()
        .map(|token| PushOutcome {
            token: token.clone(),
            success: false,
            error: Some(error.to_string()),
        })
        .collect()
}

/// Client for the push delivery service's HTTP API.
#[derive(Clone)]
pub struct HttpPushGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPushGateway {
    /// Create a client against the given push-service base URL.
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post_batch(
        &self,
        tokens: &[String],
        payload: &PushPayload,
    ) -> anyhow::Result<PushSendResponse> {
        let messages: Vec<PushMessage<'_>> = tokens
            .iter()
            .map(|token| PushMessage {
                to: token,
                title: &payload.title,
                body: &payload.body,
                data: &payload.data,
                priority: payload.priority,
                sound: payload.sound.as_deref(),
                channel_id: "emergency-alerts",
            })
            .collect();

        let url = format!("{}/send", self.base_url);
        let response = self.client.post(&url).json(&messages).send().await?;
        let data = response.json::<PushSendResponse>().await?;
        Ok(data)
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn send_bulk(&self, tokens: &[String], payload: &PushPayload) -> Vec<PushOutcome> {
        if tokens.is_empty() {
            return Vec::new();
        }

        match self.post_batch(tokens, payload).await {
            Ok(response) => outcomes_from_response(tokens, &response),
            Err(e) => {
                warn!(error = %e, recipients = tokens.len(), "bulk push send failed");
                all_failed(tokens, &e.to_string())
            }
        }
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// Recording gateway for tests and the demo binary.
pub struct MemoryPushGateway {
    sent: std::sync::Mutex<Vec<(Vec<String>, PushPayload)>>,
    succeed: std::sync::atomic::AtomicBool,
}

impl MemoryPushGateway {
    pub fn new() -> Self {
        Self {
            sent: std::sync::Mutex::new(Vec::new()),
            succeed: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn set_succeed(&self, succeed: bool) {
        self.succeed
            .store(succeed, std::sync::atomic::Ordering::SeqCst);
    }

    /// Batches sent so far: `(tokens, payload)` per call.
    pub fn sent(&self) -> Vec<(Vec<String>, PushPayload)> {
        self.sent.lock().unwrap().clone()
    }
}

impl Default for MemoryPushGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushGateway for MemoryPushGateway {
    async fn send_bulk(&self, tokens: &[String], payload: &PushPayload) -> Vec<PushOutcome> {
        self.sent
            .lock()
            .unwrap()
            .push((tokens.to_vec(), payload.clone()));

        let success = self.succeed.load(std::sync::atomic::Ordering::SeqCst);
        tokens
            .iter()
            .map(|token| PushOutcome {
                token: token.clone(),
                success,
                error: (!success).then(|| "simulated failure".to_string()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcomes_follow_ticket_order() {
        let tokens = vec!["tok-a".to_string(), "tok-b".to_string(), "tok-c".to_string()];
        let response: PushSendResponse = serde_json::from_str(
            r#"{
                "data": [
                    {"status": "ok"},
                    {"status": "error", "message": "DeviceNotRegistered"}
                ]
            }"#,
        )
        .unwrap();

        let outcomes = outcomes_from_response(&tokens, &response);

        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        assert_eq!(outcomes[1].error.as_deref(), Some("DeviceNotRegistered"));
        // Missing ticket counts as a failure
        assert!(!outcomes[2].success);
    }

    #[test]
    fn test_transport_failure_fails_every_recipient() {
        let tokens = vec!["tok-a".to_string(), "tok-b".to_string()];
        let outcomes = all_failed(&tokens, "connection refused");

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| !o.success));
    }

    #[tokio::test]
    async fn test_memory_gateway_records_batches() {
        let gateway = MemoryPushGateway::new();
        let payload = PushPayload::new("title", "body");

        let outcomes = gateway
            .send_bulk(&["tok-1".to_string()], &payload)
            .await;

        assert!(outcomes[0].success);
        assert_eq!(gateway.sent().len(), 1);
        assert_eq!(gateway.sent()[0].1.title, "title");
    }
}
