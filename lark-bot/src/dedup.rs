//! Webhook delivery deduplication.
//!
//! The platform delivers events at-least-once, so a redelivered event id
//! must be recognized and suppressed. [`DeduplicationGuard::seen`] is the
//! single check-and-record primitive: the first caller for an id records it
//! and gets `false`, every later caller inside the retention window gets
//! `true`. One mutex guards the table, so concurrent deliveries of the same
//! id resolve to exactly one `false`.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Tracks recently processed event identifiers.
///
/// Memory is bounded two ways: ids older than the retention window are
/// purged (redelivery after that long is assumed impossible), and a hard
/// entry cap evicts the oldest ids under sustained traffic. Eviction can
/// only forget an id, never falsely remember one.
pub struct DeduplicationGuard {
    inner: Mutex<Inner>,
    retention: Duration,
    max_entries: usize,
}

struct Inner {
    seen: HashMap<String, Instant>,
    /// Insertion order; ids are recorded at most once, so front == oldest.
    order: VecDeque<(String, Instant)>,
}

impl DeduplicationGuard {
    pub fn new(retention: Duration, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                seen: HashMap::new(),
                order: VecDeque::new(),
            }),
            retention,
            max_entries,
        }
    }

    /// Check-and-record: returns `true` if the id was already recorded
    /// within the retention window, otherwise records it and returns `false`.
    pub async fn seen(&self, event_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        Self::purge_expired(&mut inner, now, self.retention);

        if inner.seen.contains_key(event_id) {
            return true;
        }

        inner.seen.insert(event_id.to_string(), now);
        inner.order.push_back((event_id.to_string(), now));

        while inner.order.len() > self.max_entries {
            if let Some((id, _)) = inner.order.pop_front() {
                inner.seen.remove(&id);
            }
        }

        false
    }

    /// Number of ids currently tracked.
    pub async fn tracked_count(&self) -> usize {
        self.inner.lock().await.order.len()
    }

    fn purge_expired(inner: &mut Inner, now: Instant, retention: Duration) {
        while inner
            .order
            .front()
            .is_some_and(|(_, at)| now.duration_since(*at) >= retention)
        {
            if let Some((id, _)) = inner.order.pop_front() {
                inner.seen.remove(&id);
            }
        }
    }
}
