//! Lark Bot - Feishu webhook to LLM bridge.
//!
//! Receives message, read-receipt, and card-action events from the Feishu
//! Open Platform, routes each to a per-user conversation session, forwards
//! message text to an OpenAI-compatible completion backend, and sends
//! replies and interactive cards back to the chat.
//!
//! ## Architecture
//!
//! ```text
//! Feishu → webhook → FeishuCodec → EventRouter → CompletionGateway
//!                                      ↓
//! User ←── send ←── FeishuClient ← reply/card
//! ```
//!
//! The router is the only stateful part: it deduplicates redelivered
//! webhook events, serializes same-user processing, and keeps session
//! history writes all-or-nothing per event.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod card;
pub mod dedup;
pub mod event;
pub mod feishu;
pub mod gateway;
pub mod roles;
pub mod router;
pub mod routes;
pub mod session;

// Re-export commonly used types
pub use card::{CardActionHandler, CardError, ACTION_RESET_HISTORY, ACTION_SELECT_ROLE};
pub use dedup::DeduplicationGuard;
pub use event::{DispatchOutcome, InboundEvent, Reply, SuppressReason};
pub use feishu::{FeishuClient, FeishuCodec, ParsedPayload};
pub use gateway::{
    CompletionGateway, CompletionRequest, GatewayError, OpenAiGateway, ResilientGateway,
    RetryConfig,
};
pub use roles::{Role, RoleCatalog};
pub use router::{DispatchError, EventRouter};
pub use routes::{build_router, create_state, spawn_processor, AppState};
pub use session::{SessionSnapshot, SessionStore, Speaker, Turn};

use lark_common::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// How often the idle-session sweeper runs.
const IDLE_SWEEP_INTERVAL_SECS: u64 = 600;

/// Start the webhook HTTP server with its event processor.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));

    // Sessions created on first contact take the default role; a default
    // outside the catalog would silently run every session promptless
    let catalog_check = RoleCatalog::builtin().with_extra(&config.roles);
    if !catalog_check.contains(&config.session.default_role) {
        anyhow::bail!(
            "default role {:?} is not in the role catalog (available: {})",
            config.session.default_role,
            catalog_check.names().join(", ")
        );
    }
    if config.openai.api_key.is_empty() {
        tracing::warn!("No completion API key configured; only key-less backends will work");
    }

    let openai = Arc::new(OpenAiGateway::new(&config.openai));
    let resilient: Arc<dyn CompletionGateway> = Arc::new(ResilientGateway::new(
        openai,
        RetryConfig::from_config(&config.openai),
    ));

    let client = if config.feishu_enabled() {
        Some(Arc::new(FeishuClient::new(&config.feishu)))
    } else {
        tracing::warn!("Feishu credentials not configured; replies will not be delivered");
        None
    };

    let (state, rx) = create_state(config, resilient);
    let router = build_router(Arc::clone(&state));

    // Spawn the event processor
    let processor_handle = spawn_processor(Arc::clone(&state.router), client, rx);

    // Spawn the idle-session sweeper
    let sessions = Arc::clone(&state.sessions);
    let event_router = Arc::clone(&state.router);
    let idle_ttl = Duration::from_secs(config.session.idle_ttl_secs);
    let sweeper_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(IDLE_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let removed = sessions.evict_idle(idle_ttl);
            let pruned = event_router.prune_locks();
            if removed > 0 || pruned > 0 {
                tracing::debug!(removed, pruned, "Idle sessions evicted");
            }
        }
    });

    tracing::info!("Starting Lark Bot on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    // Clean up on shutdown
    sweeper_handle.abort();
    processor_handle.abort();

    Ok(())
}
