//! Inbound event model and dispatch outcomes.
//!
//! Webhook deliveries are decoded at the transport boundary into
//! [`InboundEvent`], a closed tagged union. Everything past that boundary
//! (the router, the session store, the card handler) works on these types
//! and never sees platform wire formats.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A decoded webhook event.
///
/// The platform delivers events at-least-once: `event_id` is unique per
/// delivery attempt but the same id may arrive again on redelivery, and
/// consumers must treat the repeat as a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    /// A user sent a text message to the bot.
    MessageReceived {
        event_id: String,
        /// Sender open_id; the session key.
        user_id: String,
        /// Reply target (chat the message arrived in).
        chat_id: String,
        /// Platform timestamp, milliseconds.
        timestamp: i64,
        text: String,
    },
    /// A user read one of the bot's messages.
    MessageRead {
        event_id: String,
        user_id: String,
        timestamp: i64,
    },
    /// A user interacted with an interactive card.
    CardAction {
        event_id: String,
        user_id: String,
        timestamp: i64,
        /// Action code, e.g. "select-role" or "reset-history".
        action: String,
        /// Action parameters from the card value payload.
        params: Value,
    },
}

impl InboundEvent {
    pub fn event_id(&self) -> &str {
        match self {
            Self::MessageReceived { event_id, .. }
            | Self::MessageRead { event_id, .. }
            | Self::CardAction { event_id, .. } => event_id,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Self::MessageReceived { user_id, .. }
            | Self::MessageRead { user_id, .. }
            | Self::CardAction { user_id, .. } => user_id,
        }
    }

    /// Short kind label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageReceived { .. } => "message_received",
            Self::MessageRead { .. } => "message_read",
            Self::CardAction { .. } => "card_action",
        }
    }
}

/// Terminal outcome of dispatching one event.
///
/// The fourth terminal state, a failed dispatch, is the `Err` arm of
/// `Result<DispatchOutcome, DispatchError>`, carrying the typed error the
/// transport turns into a safe user-facing reply.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A reply should be delivered to the originating chat.
    Replied(Reply),
    /// Event consumed, nothing to send (read receipts).
    Acknowledged,
    /// Event intentionally not processed.
    Suppressed(SuppressReason),
}

/// Outbound payload produced by a successful dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    /// Interactive card JSON, returned in the card-callback HTTP response.
    Card(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    /// The event id was already processed within the retention window.
    DuplicateEvent,
    /// Message text was empty after trimming; no completion call is wasted.
    EmptyMessage,
}

impl DispatchOutcome {
    /// Outcome label for structured logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Replied(_) => "replied",
            Self::Acknowledged => "acknowledged",
            Self::Suppressed(SuppressReason::DuplicateEvent) => "suppressed_duplicate",
            Self::Suppressed(SuppressReason::EmptyMessage) => "suppressed_empty",
        }
    }
}
