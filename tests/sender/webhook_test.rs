//! Tests for `src/sender/webhook.rs`: request shape, acknowledgement parsing
//! and failure classification.

use std::time::Duration;

use axum::http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use herald::sender::webhook::DEFAULT_TIMEOUT;
use herald::sender::{SendError, Sender, WebhookSender};

use crate::common::{spawn_accepting_webhook, spawn_webhook};

/// Answer exactly one request with a raw HTTP response.
async fn serve_once(status_line: &str, body: &str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener should expose addr");

    let status_line_owned = status_line.to_owned();
    let body_owned = body.to_owned();
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut read_buf = [0_u8; 4096];
            let _ = socket.read(&mut read_buf).await;

            let response = format!(
                "HTTP/1.1 {status_line_owned}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body_owned}",
                body_owned.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
        }
    });

    format!("http://{addr}/")
}

#[tokio::test]
async fn posts_recipient_and_content_as_json() {
    let mock = spawn_accepting_webhook().await;
    let sender = WebhookSender::new(mock.url.clone(), DEFAULT_TIMEOUT).expect("sender");
    assert_eq!(sender.url(), mock.url);

    let receipt = sender
        .send("+905551112233", "Insider - Project")
        .await
        .expect("send should succeed");

    assert_eq!(receipt.message_id, "67f2f8a8-ea58-4ed0-a6f9-ff217df4d849");
    assert_eq!(receipt.message.as_deref(), Some("Accepted"));

    let hits = mock.hits();
    assert_eq!(hits.len(), 1);
    assert_eq!(
        hits[0],
        serde_json::json!({"to": "+905551112233", "content": "Insider - Project"})
    );
}

#[tokio::test]
async fn any_success_status_is_accepted() {
    let url = serve_once("200 OK", r#"{"messageId":"abc"}"#).await;
    let sender = WebhookSender::new(url, DEFAULT_TIMEOUT).expect("sender");

    let receipt = sender.send("to", "body").await.expect("send");
    assert_eq!(receipt.message_id, "abc");
    assert!(receipt.message.is_none());
}

#[tokio::test]
async fn non_success_status_is_http_status_error() {
    let mock = spawn_webhook(
        StatusCode::INTERNAL_SERVER_ERROR,
        "upstream exploded",
        Duration::ZERO,
    )
    .await;
    let sender = WebhookSender::new(mock.url.clone(), DEFAULT_TIMEOUT).expect("sender");

    let err = sender.send("to", "body").await.expect_err("should fail");
    match err {
        SendError::HttpStatus { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body, "upstream exploded");
        }
        other => panic!("expected HttpStatus, got {other:?}"),
    }
}

#[tokio::test]
async fn error_body_is_truncated() {
    let long_body = "y".repeat(2000);
    let url = serve_once("400 Bad Request", &long_body).await;
    let sender = WebhookSender::new(url, DEFAULT_TIMEOUT).expect("sender");

    let err = sender.send("to", "body").await.expect_err("should fail");
    let SendError::HttpStatus { body, .. } = err else {
        panic!("expected HttpStatus");
    };
    assert!(body.ends_with("...[truncated]"));
    assert!(body.len() < long_body.len());
}

#[tokio::test]
async fn unparseable_acknowledgement_is_parse_error() {
    let url = serve_once("202 Accepted", "not json").await;
    let sender = WebhookSender::new(url, DEFAULT_TIMEOUT).expect("sender");

    let err = sender.send("to", "body").await.expect_err("should fail");
    assert!(matches!(err, SendError::Parse(_)), "got {err:?}");
}

#[tokio::test]
async fn acknowledgement_without_message_id_is_parse_error() {
    let url = serve_once("202 Accepted", r#"{"message":"Accepted"}"#).await;
    let sender = WebhookSender::new(url, DEFAULT_TIMEOUT).expect("sender");

    let err = sender.send("to", "body").await.expect_err("should fail");
    assert!(matches!(err, SendError::Parse(_)), "got {err:?}");
}

#[tokio::test]
async fn slow_recipient_times_out() {
    let mock = spawn_webhook(
        StatusCode::ACCEPTED,
        r#"{"messageId":"late"}"#,
        Duration::from_secs(2),
    )
    .await;
    let sender =
        WebhookSender::new(mock.url.clone(), Duration::from_millis(200)).expect("sender");

    let err = sender.send("to", "body").await.expect_err("should time out");
    match err {
        SendError::Request(e) => assert!(e.is_timeout(), "expected timeout, got {e}"),
        other => panic!("expected Request, got {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_recipient_is_request_error() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let sender = WebhookSender::new(format!("http://{addr}/webhook"), DEFAULT_TIMEOUT)
        .expect("sender");
    let err = sender.send("to", "body").await.expect_err("should fail");
    assert!(matches!(err, SendError::Request(_)), "got {err:?}");
}
