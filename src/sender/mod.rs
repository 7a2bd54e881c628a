//! External sender: the uncontrolled, side-effecting outbound call.
//!
//! The delivery engine invokes a [`Sender`] once per claimed message. A send
//! is not transactional and may be slow or fail; the engine decides what a
//! failure means for the message's status.

pub mod webhook;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use self::webhook::WebhookSender;

/// Acknowledgement returned by the recipient for one send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Recipient-assigned identifier for the accepted message.
    #[serde(rename = "messageId")]
    pub message_id: String,
    /// Free-form status text, when the recipient provides one.
    #[serde(default)]
    pub message: Option<String>,
}

/// Errors returned by an external sender.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// HTTP transport failure (connect, timeout, body read).
    #[error("send request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Recipient answered with a non-2xx status.
    #[error("recipient returned non-success status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Truncated response body.
        body: String,
    },

    /// Response body did not match the expected schema.
    #[error("recipient response parse error: {0}")]
    Parse(String),

    /// The sender is misconfigured or otherwise cannot attempt the send.
    #[error("sender unavailable: {0}")]
    Unavailable(String),
}

/// One outbound delivery attempt.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Deliver `content` to `recipient`.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] on transport failure, rejection or a malformed
    /// acknowledgement. Every error means "not known to be delivered".
    async fn send(&self, recipient: &str, content: &str) -> Result<SendReceipt, SendError>;
}

/// Check HTTP response status and return body text or a structured error.
///
/// # Errors
///
/// Returns `SendError::Request` on transport failure, `SendError::HttpStatus` on non-2xx.
pub async fn check_http_response(response: reqwest::Response) -> Result<String, SendError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(SendError::HttpStatus {
            status: status.as_u16(),
            body: truncate_error_body(&body),
        });
    }
    Ok(body)
}

/// Collapse whitespace and cap the length of an error body for logging.
fn truncate_error_body(raw: &str) -> String {
    const MAX_ERROR_BODY_CHARS: usize = 256;

    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = collapsed
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }
    collapsed
}
