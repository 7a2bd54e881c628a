//! Control and query HTTP surface.
//!
//! | Method | Path        | Effect                                    |
//! |--------|-------------|-------------------------------------------|
//! | POST   | `/start`    | start the delivery engine                 |
//! | POST   | `/stop`     | stop the delivery engine                  |
//! | GET    | `/status`   | `{"running": bool}`                       |
//! | GET    | `/messages` | every completion record in the cache      |

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::cache::RecordCache;
use crate::delivery::DeliveryControl;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Delivery start/stop switch.
    pub control: Arc<DeliveryControl>,
    /// Source of the sent-message listing.
    pub cache: Arc<dyn RecordCache>,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusResponse {
    /// Whether the delivery engine is processing batches.
    pub running: bool,
}

/// Build the router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/start", post(start_delivery))
        .route("/stop", post(stop_delivery))
        .route("/status", get(delivery_status))
        .route("/messages", get(sent_messages))
        .with_state(state)
}

/// Serve the router on `listener` until `shutdown_rx` fires.
///
/// # Errors
///
/// Returns an error if the server fails while accepting connections.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown_rx: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "http api listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while shutdown_rx.changed().await.is_ok() {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        })
        .await
}

async fn start_delivery(State(state): State<AppState>) -> &'static str {
    state.control.start();
    "Message sending started"
}

async fn stop_delivery(State(state): State<AppState>) -> &'static str {
    state.control.stop();
    "Message sending stopped"
}

async fn delivery_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        running: state.control.is_running(),
    })
}

async fn sent_messages(State(state): State<AppState>) -> Response {
    match state.cache.list_all().await {
        Ok(records) if records.is_empty() => {
            (StatusCode::NOT_FOUND, "No sent messages found").into_response()
        }
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(e) => {
            error!(error = %e, "failed to retrieve sent messages");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to retrieve sent messages",
            )
                .into_response()
        }
    }
}
