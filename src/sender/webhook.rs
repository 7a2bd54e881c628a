//! Webhook [`Sender`]: one JSON `POST` per message.

use std::time::Duration;

use serde::Serialize;

use super::{check_http_response, SendError, SendReceipt, Sender};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Webhook request body.
#[doc(hidden)]
#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    /// Recipient address.
    pub to: &'a str,
    /// Message body.
    pub content: &'a str,
}

/// HTTP webhook client.
#[derive(Debug, Clone)]
pub struct WebhookSender {
    url: String,
    client: reqwest::Client,
}

impl WebhookSender {
    /// Build a sender posting to `url` with a bounded per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Unavailable`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SendError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    /// Target URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Parse the recipient's acknowledgement body.
///
/// # Errors
///
/// Returns `SendError::Parse` if the body is not the expected JSON object.
#[doc(hidden)]
pub fn parse_receipt(body: &str) -> Result<SendReceipt, SendError> {
    serde_json::from_str(body).map_err(|e| SendError::Parse(e.to_string()))
}

#[async_trait::async_trait]
impl Sender for WebhookSender {
    async fn send(&self, recipient: &str, content: &str) -> Result<SendReceipt, SendError> {
        let payload = WebhookPayload {
            to: recipient,
            content,
        };

        let response = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .await?;

        let body = check_http_response(response).await?;
        parse_receipt(&body)
    }
}
