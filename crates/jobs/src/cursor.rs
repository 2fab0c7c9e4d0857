//! Stream cursors: cheap change detection for long-lived progress streams.
//!
//! Each topic carries a process-wide monotonically increasing counter that is
//! bumped on every relevant state-changing write, plus metadata about the
//! last event. Stream consumers compare their last-seen value against the
//! current one instead of re-scanning full state every tick. Cursors live for
//! the life of the process; reconnecting clients get a fresh snapshot
//! (snapshot+tail, not a durable log).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Topic carrying job lifecycle changes.
pub const JOBS_TOPIC: &str = "jobs";

/// Metadata of the last state-changing write on a topic.
#[derive(Debug, Clone, Serialize)]
pub struct CursorEvent {
    pub cursor: u64,
    /// Identity of the entity that changed (job id, item id).
    pub entity: String,
    /// What happened, e.g. `"item_done"`, `"job_completed"`.
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Per-topic monotonic counter plus last-event metadata.
#[derive(Debug, Default)]
pub struct TopicCursor {
    value: AtomicU64,
    last: RwLock<Option<CursorEvent>>,
}

impl TopicCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the cursor for a state-changing write; returns the new value.
    pub fn bump(&self, entity: impl Into<String>, reason: impl Into<String>) -> u64 {
        let next = self.value.fetch_add(1, Ordering::SeqCst) + 1;
        let event = CursorEvent {
            cursor: next,
            entity: entity.into(),
            reason: reason.into(),
            occurred_at: Utc::now(),
        };
        match self.last.write() {
            Ok(mut guard) => *guard = Some(event),
            Err(e) => tracing::error!("RwLock poisoned writing cursor event: {e}"),
        }
        next
    }

    pub fn current(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn last_event(&self) -> Option<CursorEvent> {
        match self.last.read() {
            Ok(guard) => guard.clone(),
            Err(e) => {
                tracing::error!("RwLock poisoned reading cursor event: {e}");
                None
            }
        }
    }
}

/// Registry of topic cursors, created lazily on first use.
#[derive(Debug, Default)]
pub struct CursorRegistry {
    topics: RwLock<HashMap<String, Arc<TopicCursor>>>,
}

impl CursorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Get (or lazily create) the cursor for a topic.
    pub fn topic(&self, name: &str) -> Arc<TopicCursor> {
        if let Ok(topics) = self.topics.read() {
            if let Some(cursor) = topics.get(name) {
                return cursor.clone();
            }
        }
        let mut topics = self.topics.write().unwrap();
        topics.entry(name.to_string()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_is_monotonic() {
        let cursor = TopicCursor::new();
        assert_eq!(cursor.current(), 0);
        assert_eq!(cursor.bump("job-1", "item_done"), 1);
        assert_eq!(cursor.bump("job-1", "item_done"), 2);
        assert_eq!(cursor.current(), 2);
    }

    #[test]
    fn last_event_carries_metadata() {
        let cursor = TopicCursor::new();
        cursor.bump("job-7", "job_completed");
        let event = cursor.last_event().unwrap();
        assert_eq!(event.cursor, 1);
        assert_eq!(event.entity, "job-7");
        assert_eq!(event.reason, "job_completed");
    }

    #[test]
    fn registry_returns_same_cursor_per_topic() {
        let registry = CursorRegistry::new();
        let a = registry.topic(JOBS_TOPIC);
        a.bump("x", "y");
        let b = registry.topic(JOBS_TOPIC);
        assert_eq!(b.current(), 1);
        assert_eq!(registry.topic("calendar_reminders").current(), 0);
    }

    #[test]
    fn concurrent_bumps_never_lose_a_count() {
        let cursor = Arc::new(TopicCursor::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cursor = cursor.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    cursor.bump("job", "tick");
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cursor.current(), 800);
    }
}
