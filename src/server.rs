//! Webhook HTTP server.
//!
//! Receives Drive push notifications and hands them to the
//! [`NotificationRelay`]. The response never depends on whether ingestion
//! later finds anything: once the signal carries the required headers the
//! sender gets `200`, even if the channel turns out to be unknown (that
//! signal is logged and dropped). Only a failure to enqueue yields `500`,
//! which makes Drive redeliver.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/webhook` | Drive push notification (headers only, empty body) |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Headers read
//!
//! | Header | Required |
//! |--------|----------|
//! | `X-Goog-Channel-ID` | yes |
//! | `X-Goog-Resource-ID` | yes |
//! | `X-Goog-Resource-State` | yes |
//! | `X-Goog-Message-Number` | no |
//! | `X-Goog-Channel-Token` | when a channel token secret is configured |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "missing header X-Goog-Channel-ID" } }
//! ```

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use drivewatch_core::relay::{NotificationRelay, RelayOutcome, Signal};
use drivewatch_core::CoordError;

use crate::config::Config;
use crate::db;
use crate::sqlite_queue::{SqliteQueue, NOTIFICATIONS_QUEUE};
use crate::sqlite_store::SqliteStore;
use crate::token;

const HEADER_CHANNEL_ID: &str = "x-goog-channel-id";
const HEADER_RESOURCE_ID: &str = "x-goog-resource-id";
const HEADER_RESOURCE_STATE: &str = "x-goog-resource-state";
const HEADER_MESSAGE_NUMBER: &str = "x-goog-message-number";
const HEADER_CHANNEL_TOKEN: &str = "x-goog-channel-token";

#[derive(Clone)]
pub struct AppState {
    relay: Arc<NotificationRelay>,
    /// HMAC secret for channel tokens; `None` disables the check.
    token_secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(relay: Arc<NotificationRelay>, token_secret: Option<String>) -> Self {
        Self {
            relay,
            token_secret: token_secret.map(Arc::from),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the webhook on `[server].bind` until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let store = Arc::new(SqliteStore::new(pool.clone()));
    let queue = Arc::new(SqliteQueue::from_config(
        pool,
        NOTIFICATIONS_QUEUE,
        &config.queue,
    ));
    let relay = Arc::new(NotificationRelay::new(store, queue));
    let state = AppState::new(relay, config.server.channel_token_secret()?);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "webhook server listening");
    println!("Webhook server listening on http://{}", config.server.bind);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /webhook ============

#[derive(Debug, Serialize)]
struct WebhookResponse {
    /// `accepted`, `ignored`, or `dropped`.
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    notification_id: Option<String>,
}

impl WebhookResponse {
    fn status(status: &'static str) -> Json<Self> {
        Json(Self {
            status,
            notification_id: None,
        })
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, AppError> {
    header(headers, name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| bad_request(format!("missing header {}", name)))
}

fn signal_from_headers(headers: &HeaderMap) -> Result<Signal, AppError> {
    Ok(Signal {
        channel_id: required_header(headers, HEADER_CHANNEL_ID)?.to_string(),
        resource_id: required_header(headers, HEADER_RESOURCE_ID)?.to_string(),
        resource_state: required_header(headers, HEADER_RESOURCE_STATE)?.to_string(),
        message_number: header(headers, HEADER_MESSAGE_NUMBER).and_then(|v| v.parse().ok()),
    })
}

async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<WebhookResponse>, AppError> {
    let signal = signal_from_headers(&headers)?;

    if let Some(secret) = &state.token_secret {
        let presented = header(&headers, HEADER_CHANNEL_TOKEN).unwrap_or_default();
        if !token::verify_channel(secret, &signal.channel_id, presented) {
            warn!(channel_id = %signal.channel_id, "channel token rejected; signal dropped");
            return Ok(WebhookResponse::status("dropped"));
        }
    }

    match state.relay.relay(&signal).await {
        Ok(RelayOutcome::Forwarded(n)) => Ok(Json(WebhookResponse {
            status: "accepted",
            notification_id: Some(n.notification_id),
        })),
        Ok(RelayOutcome::Ignored { .. }) => Ok(WebhookResponse::status("ignored")),
        Err(CoordError::InvalidChannel(_)) => Ok(WebhookResponse::status("dropped")),
        Err(e) => {
            error!(channel_id = %signal.channel_id, error = %e, "failed to relay signal");
            Err(internal(e.to_string()))
        }
    }
}
