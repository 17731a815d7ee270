//! Per-user conversation sessions.
//!
//! Sessions are owned exclusively by [`SessionStore`]; callers get
//! short-lived access per operation and never hold a session across events.
//! Each session sits behind its own `Mutex` inside a `DashMap`, so
//! operations on one user are linearizable while distinct users proceed in
//! parallel; there is no global lock on the event path. The session mutex
//! is only ever held for the duration of a read or write, never across an
//! upstream call.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Who produced a history turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Assistant => "assistant",
        }
    }
}

/// One history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
}

impl Turn {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
        }
    }
}

/// Mutable per-user state. Created on first contact, mutated only through
/// store methods.
#[derive(Debug)]
struct Session {
    role: String,
    history: VecDeque<Turn>,
    last_event_id: Option<String>,
    last_active: Instant,
}

impl Session {
    fn new(role: String) -> Self {
        Self {
            role,
            history: VecDeque::new(),
            last_event_id: None,
            last_active: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_active = Instant::now();
    }
}

/// Read-only copy of the session state the gateway needs. Taken under the
/// session lock, used after it is released.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub role: String,
    pub history: Vec<Turn>,
}

/// Holds every live session, keyed by platform user id.
pub struct SessionStore {
    sessions: DashMap<String, Arc<Mutex<Session>>>,
    history_window: usize,
    default_role: String,
}

impl SessionStore {
    /// `history_window` bounds retained turns per session; the oldest turn
    /// is evicted first once the bound is exceeded.
    pub fn new(default_role: impl Into<String>, history_window: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            history_window,
            default_role: default_role.into(),
        }
    }

    /// Fetch the session slot, creating a default session (configured role,
    /// empty history) on first contact. The `Arc` is cloned out so no map
    /// shard lock is held while the session mutex is awaited.
    fn get_or_create(&self, user_id: &str) -> Arc<Mutex<Session>> {
        self.sessions
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(self.default_role.clone()))))
            .clone()
    }

    /// Role and history copy for building a completion request.
    pub async fn snapshot(&self, user_id: &str) -> SessionSnapshot {
        let slot = self.get_or_create(user_id);
        let mut session = slot.lock().await;
        session.touch();
        SessionSnapshot {
            role: session.role.clone(),
            history: session.history.iter().cloned().collect(),
        }
    }

    /// Append one turn, then truncate from the front past the window.
    pub async fn append_turn(&self, user_id: &str, speaker: Speaker, text: impl Into<String>) {
        let slot = self.get_or_create(user_id);
        let mut session = slot.lock().await;
        session.history.push_back(Turn::new(speaker, text));
        while session.history.len() > self.history_window {
            session.history.pop_front();
        }
        session.touch();
    }

    pub async fn set_role(&self, user_id: &str, role: impl Into<String>) {
        let slot = self.get_or_create(user_id);
        let mut session = slot.lock().await;
        session.role = role.into();
        session.touch();
    }

    /// Clear history; the selected role survives.
    pub async fn reset_history(&self, user_id: &str) {
        let slot = self.get_or_create(user_id);
        let mut session = slot.lock().await;
        session.history.clear();
        session.touch();
    }

    /// Record a read receipt. Setting the same marker twice converges to
    /// the same state, so redelivered receipts need no dedup.
    pub async fn record_read(&self, user_id: &str, event_id: &str) {
        self.set_last_event(user_id, event_id).await;
    }

    /// Remember the last processed event id for ordering diagnostics.
    pub async fn set_last_event(&self, user_id: &str, event_id: &str) {
        let slot = self.get_or_create(user_id);
        let mut session = slot.lock().await;
        session.last_event_id = Some(event_id.to_string());
        session.touch();
    }

    pub async fn last_event_id(&self, user_id: &str) -> Option<String> {
        let slot = self.sessions.get(user_id)?.clone();
        let session = slot.lock().await;
        session.last_event_id.clone()
    }

    /// Current history copy, primarily for tests and diagnostics.
    pub async fn history(&self, user_id: &str) -> Vec<Turn> {
        match self.sessions.get(user_id).map(|s| s.clone()) {
            Some(slot) => slot.lock().await.history.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub async fn role(&self, user_id: &str) -> Option<String> {
        let slot = self.sessions.get(user_id)?.clone();
        let session = slot.lock().await;
        Some(session.role.clone())
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.sessions.contains_key(user_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop sessions idle longer than `ttl`. Sessions currently referenced
    /// or locked by an in-flight event are skipped; they get swept on a
    /// later pass. Returns the number of sessions removed.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, slot| {
            // Another holder means an event is mid-flight for this user
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(session) => session.last_active.elapsed() < ttl,
                Err(_) => true,
            }
        });
        before.saturating_sub(self.sessions.len())
    }
}
