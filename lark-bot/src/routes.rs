//! HTTP routes for the webhook server.
//!
//! Event deliveries are acknowledged immediately and processed off the
//! request path: the handler decodes, queues the event, and returns 200,
//! while a processor task dispatches it and sends any reply through the
//! outbound client. Card callbacks are the exception: the platform expects
//! the updated card in the HTTP response, so they are dispatched inline.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::card::CardActionHandler;
use crate::dedup::DeduplicationGuard;
use crate::event::{DispatchOutcome, InboundEvent, Reply};
use crate::feishu::{FeishuClient, FeishuCodec, ParsedPayload};
use crate::gateway::CompletionGateway;
use crate::roles::RoleCatalog;
use crate::router::EventRouter;
use crate::session::SessionStore;
use lark_common::Config;

/// Request timeout for the whole router. Completion calls do not run on the
/// request path, so this only covers decode + queueing (and inline card
/// dispatch).
const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Webhook payloads are small; anything bigger is noise.
const MAX_BODY_BYTES: usize = 256 * 1024;

// ============================================================================
// State
// ============================================================================

/// Shared state for the webhook HTTP server.
pub struct AppState {
    /// Inbound payload decoder/verifier.
    pub codec: FeishuCodec,
    /// Dispatch core.
    pub router: Arc<EventRouter>,
    /// Card renderer, for error cards at the transport edge.
    pub cards: Arc<CardActionHandler>,
    /// Session store handle for the idle sweeper.
    pub sessions: Arc<SessionStore>,
    /// Queue feeding the event processor.
    pub event_tx: mpsc::Sender<InboundEvent>,
}

/// Assemble the dispatch stack from configuration and return the shared
/// state plus the processor's receiving end.
pub fn create_state(
    config: &Config,
    gateway: Arc<dyn CompletionGateway>,
) -> (Arc<AppState>, mpsc::Receiver<InboundEvent>) {
    let (tx, rx) = mpsc::channel(100);

    let sessions = Arc::new(SessionStore::new(
        config.session.default_role.clone(),
        config.session.history_window,
    ));
    let dedup = Arc::new(DeduplicationGuard::new(
        Duration::from_secs(config.dedup.retention_secs),
        config.dedup.max_entries,
    ));
    let catalog = Arc::new(RoleCatalog::builtin().with_extra(&config.roles));
    let cards = Arc::new(CardActionHandler::new(
        Arc::clone(&sessions),
        Arc::clone(&catalog),
    ));
    let router = Arc::new(EventRouter::new(
        Arc::clone(&sessions),
        dedup,
        gateway,
        Arc::clone(&cards),
        catalog,
    ));

    let state = Arc::new(AppState {
        codec: FeishuCodec::new(&config.feishu),
        router,
        cards,
        sessions,
        event_tx: tx,
    });

    (state, rx)
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
struct WebhookResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    challenge: Option<String>,
}

// ============================================================================
// Health Routes
// ============================================================================

async fn ping() -> impl IntoResponse {
    Json(json!({ "message": "pong" }))
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "lark-bot",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.event_tx.is_closed() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "not_ready",
                service: "lark-bot",
                version: env!("CARGO_PKG_VERSION"),
            }),
        );
    }

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ready",
            service: "lark-bot",
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

// ============================================================================
// Event Webhook
// ============================================================================

async fn event_webhook(State(state): State<Arc<AppState>>, body: String) -> impl IntoResponse {
    match state.codec.parse_event(&body) {
        Ok(ParsedPayload::Challenge(challenge)) => (
            StatusCode::OK,
            Json(WebhookResponse {
                success: true,
                message: None,
                challenge: Some(challenge),
            }),
        ),
        Ok(ParsedPayload::Unsupported { event_type }) => {
            tracing::warn!(event_type, "Unsupported event kind suppressed");
            (
                StatusCode::OK,
                Json(WebhookResponse {
                    success: true,
                    message: Some(format!("unsupported event type: {event_type}")),
                    challenge: None,
                }),
            )
        }
        Ok(ParsedPayload::Event(event)) => {
            if let Err(e) = state.event_tx.send(event).await {
                tracing::error!("Failed to queue event: {}", e);
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(WebhookResponse {
                        success: false,
                        message: Some("event queue closed".to_string()),
                        challenge: None,
                    }),
                );
            }
            (
                StatusCode::OK,
                Json(WebhookResponse {
                    success: true,
                    message: None,
                    challenge: None,
                }),
            )
        }
        Err(e) => {
            tracing::error!("Event webhook decode error: {}", e);
            (
                StatusCode::BAD_REQUEST,
                Json(WebhookResponse {
                    success: false,
                    message: Some(e.to_string()),
                    challenge: None,
                }),
            )
        }
    }
}

// ============================================================================
// Card Webhook
// ============================================================================

async fn card_webhook(State(state): State<Arc<AppState>>, body: String) -> impl IntoResponse {
    match state.codec.parse_card_action(&body) {
        Ok(ParsedPayload::Challenge(challenge)) => {
            (StatusCode::OK, Json(json!({ "challenge": challenge })))
        }
        Ok(ParsedPayload::Unsupported { event_type }) => {
            tracing::warn!(event_type, "Unsupported card callback suppressed");
            (StatusCode::OK, Json(json!({})))
        }
        Ok(ParsedPayload::Event(event)) => match state.router.dispatch(event).await {
            Ok(DispatchOutcome::Replied(Reply::Card(card))) => (StatusCode::OK, Json(card)),
            // Duplicate redeliveries get an empty ack; no state changed
            Ok(other) => {
                tracing::debug!(outcome = other.label(), "Card dispatch without card reply");
                (StatusCode::OK, Json(json!({})))
            }
            Err(e) => (
                StatusCode::OK,
                Json(state.cards.render_error_card(&e.user_message())),
            ),
        },
        Err(e) => {
            tracing::error!("Card webhook decode error: {}", e);
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
        }
    }
}

// ============================================================================
// Event Processor
// ============================================================================

/// Dispatch one queued event and deliver its reply, if any. Dispatch
/// failures turn into a safe notice to the user; delivery failures are
/// logged and dropped.
async fn process_event(
    router: Arc<EventRouter>,
    client: Option<Arc<FeishuClient>>,
    event: InboundEvent,
) {
    let reply_to = match &event {
        InboundEvent::MessageReceived { chat_id, .. } => Some(chat_id.clone()),
        _ => None,
    };

    let delivery = match router.dispatch(event).await {
        Ok(DispatchOutcome::Replied(reply)) => Some(reply),
        Ok(_) => None,
        Err(e) => Some(Reply::Text(e.user_message())),
    };

    let (Some(reply), Some(target)) = (delivery, reply_to) else {
        return;
    };
    let Some(client) = client else {
        tracing::debug!("No outbound client configured; dropping reply");
        return;
    };

    let result = match reply {
        Reply::Text(text) => client.send_text(&target, &text).await,
        Reply::Card(card) => client.send_card(&target, &card).await,
    };
    if let Err(e) = result {
        tracing::error!("Failed to deliver reply: {}", e);
    }
}

/// Run the event processor until the queue closes. Each event gets its own
/// task, so slow upstream calls for one user never delay another; same-user
/// ordering is enforced inside the dispatch core.
pub fn spawn_processor(
    router: Arc<EventRouter>,
    client: Option<Arc<FeishuClient>>,
    mut rx: mpsc::Receiver<InboundEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let router = Arc::clone(&router);
            let client = client.clone();
            tokio::spawn(async move {
                process_event(router, client, event).await;
            });
        }
        tracing::info!("Event processor stopped: queue closed");
    })
}

// ============================================================================
// Router Builder
// ============================================================================

/// Build the webhook HTTP router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health endpoints
        .route("/ping", get(ping))
        .route("/health", get(health))
        .route("/ready", get(ready))
        // Platform webhooks
        .route("/webhook/event", post(event_webhook))
        .route("/webhook/card", post(card_webhook))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}
