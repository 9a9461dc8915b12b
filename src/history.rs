//! Bounded replay log of normalized events.
//!
//! The overlay client can disconnect at any time (page reloads are the
//! whole point of a dev server). On reconnect it asks for the history and
//! rebuilds the transcript from it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::normalized::NormalizedEvent;

/// Default number of entries kept before the oldest are evicted.
pub const DEFAULT_HISTORY_CAPACITY: usize = 500;

/// A single recorded event.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HistoryEntry {
    pub recorded_at: DateTime<Utc>,
    pub event: NormalizedEvent,
}

/// Thread-safe, size-bounded event log.
#[derive(Debug, Clone)]
pub struct HistoryLog {
    inner: Arc<HistoryInner>,
}

#[derive(Debug)]
struct HistoryInner {
    capacity: usize,
    entries: Mutex<VecDeque<HistoryEntry>>,
}

impl Default for HistoryLog {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl HistoryLog {
    /// Create a log holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HistoryInner {
                capacity: capacity.max(1),
                entries: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Record an event.
    ///
    /// Transient kinds are skipped. A `text` event directly following
    /// another `text` event for the same model is appended to it instead of
    /// creating a new entry.
    pub fn append(&self, event: &NormalizedEvent) {
        if event.is_transient() {
            return;
        }

        let mut entries = self.inner.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if let NormalizedEvent::Text { text, model } = event {
            if let Some(HistoryEntry {
                event:
                    NormalizedEvent::Text {
                        text: last_text,
                        model: last_model,
                    },
                ..
            }) = entries.back_mut()
            {
                if *last_model == *model {
                    last_text.push_str(text);
                    return;
                }
            }
        }

        entries.push_back(HistoryEntry {
            recorded_at: Utc::now(),
            event: event.clone(),
        });
        while entries.len() > self.inner.capacity {
            entries.pop_front();
        }
    }

    /// Snapshot of all entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything; the replay must not outlive a reset session.
    pub fn clear(&self) {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
