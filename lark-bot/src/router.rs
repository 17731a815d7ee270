//! Event dispatch: the state machine between decoded webhook events and
//! outbound replies.
//!
//! Every event walks the same path: dedup check, session resolution, branch
//! by kind, response. Events for one user are processed strictly one at a
//! time behind a per-user dispatch lock; events for distinct users never
//! wait on each other. The session store's own locks are only taken around
//! state reads and writes, so the upstream completion call runs under the
//! dispatch lock but never under a store lock.

use crate::card::{CardActionHandler, CardError};
use crate::dedup::DeduplicationGuard;
use crate::event::{DispatchOutcome, InboundEvent, Reply, SuppressReason};
use crate::gateway::{CompletionGateway, CompletionRequest, GatewayError};
use crate::roles::RoleCatalog;
use crate::session::{SessionStore, Speaker};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// A dispatch that could not produce its normal outcome. Session state is
/// untouched when this is returned.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Card(#[from] CardError),
}

impl DispatchError {
    /// Safe reply text for the end user. Upstream details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            DispatchError::Gateway(GatewayError::Unavailable(_))
            | DispatchError::Gateway(GatewayError::Timeout(_)) => {
                "The assistant is temporarily unavailable. Please try again in a moment."
                    .to_string()
            }
            DispatchError::Gateway(GatewayError::Rejected { .. }) => {
                "The assistant could not process that message.".to_string()
            }
            DispatchError::Card(e) => e.to_string(),
        }
    }
}

/// Routes decoded events to the session store, completion gateway, and card
/// handler.
pub struct EventRouter {
    sessions: Arc<SessionStore>,
    dedup: Arc<DeduplicationGuard>,
    gateway: Arc<dyn CompletionGateway>,
    cards: Arc<CardActionHandler>,
    catalog: Arc<RoleCatalog>,
    /// One lock per user id, acquired for the full span of a mutating
    /// dispatch. Tokio mutexes queue waiters fairly, so same-user events
    /// are served in acquisition order.
    dispatch_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl EventRouter {
    pub fn new(
        sessions: Arc<SessionStore>,
        dedup: Arc<DeduplicationGuard>,
        gateway: Arc<dyn CompletionGateway>,
        cards: Arc<CardActionHandler>,
        catalog: Arc<RoleCatalog>,
    ) -> Self {
        Self {
            sessions,
            dedup,
            gateway,
            cards,
            catalog,
            dispatch_locks: DashMap::new(),
        }
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.dispatch_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop lock entries no dispatch currently holds, so the table shrinks
    /// with the session table. An in-flight dispatch keeps its entry alive
    /// through the cloned `Arc`. Returns the number of entries removed.
    pub fn prune_locks(&self) -> usize {
        let before = self.dispatch_locks.len();
        self.dispatch_locks
            .retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.dispatch_locks.len())
    }

    /// Process one event to a terminal outcome.
    ///
    /// Message and card events are deduplicated by event id before any
    /// session work; a redelivered id is suppressed without side effects.
    /// Read receipts skip dedup entirely: recording the same marker twice
    /// converges to the same state.
    pub async fn dispatch(&self, event: InboundEvent) -> Result<DispatchOutcome, DispatchError> {
        let event_id = event.event_id().to_string();
        let user_id = event.user_id().to_string();
        let kind = event.kind();
        tracing::debug!(event_id, user_id, kind, "Event received");

        let outcome = match event {
            InboundEvent::MessageRead { .. } => {
                self.sessions.record_read(&user_id, &event_id).await;
                Ok(DispatchOutcome::Acknowledged)
            }
            InboundEvent::MessageReceived { text, .. } => {
                if self.dedup.seen(&event_id).await {
                    Ok(DispatchOutcome::Suppressed(SuppressReason::DuplicateEvent))
                } else {
                    let trimmed = text.trim();
                    if trimmed.is_empty() {
                        Ok(DispatchOutcome::Suppressed(SuppressReason::EmptyMessage))
                    } else {
                        self.handle_message(&event_id, &user_id, trimmed).await
                    }
                }
            }
            InboundEvent::CardAction { action, params, .. } => {
                if self.dedup.seen(&event_id).await {
                    Ok(DispatchOutcome::Suppressed(SuppressReason::DuplicateEvent))
                } else {
                    self.handle_card_action(&event_id, &user_id, &action, &params)
                        .await
                }
            }
        };

        match &outcome {
            Ok(o) => {
                tracing::info!(event_id, user_id, kind, outcome = o.label(), "Event dispatched")
            }
            Err(e) => {
                tracing::warn!(event_id, user_id, kind, error = %e, "Event dispatch failed")
            }
        }
        outcome
    }

    /// Forward a message to the completion gateway and reply with its text.
    ///
    /// History is written only after the gateway call succeeds, and then
    /// both turns (user + assistant) land together. A gateway failure
    /// leaves the session exactly as the user last saw it.
    async fn handle_message(
        &self,
        event_id: &str,
        user_id: &str,
        text: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let snapshot = self.sessions.snapshot(user_id).await;
        let system_prompt = self
            .catalog
            .get(&snapshot.role)
            .map(|role| role.prompt.clone());

        let request = CompletionRequest {
            system_prompt,
            history: snapshot.history,
            user_text: text.to_string(),
        };
        let reply = self.gateway.complete(request).await?;

        self.sessions.append_turn(user_id, Speaker::User, text).await;
        self.sessions
            .append_turn(user_id, Speaker::Assistant, reply.clone())
            .await;
        self.sessions.set_last_event(user_id, event_id).await;

        Ok(DispatchOutcome::Replied(Reply::Text(reply)))
    }

    async fn handle_card_action(
        &self,
        event_id: &str,
        user_id: &str,
        action: &str,
        params: &serde_json::Value,
    ) -> Result<DispatchOutcome, DispatchError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let card = self.cards.apply(user_id, action, params).await?;
        self.sessions.set_last_event(user_id, event_id).await;

        Ok(DispatchOutcome::Replied(Reply::Card(card)))
    }
}
