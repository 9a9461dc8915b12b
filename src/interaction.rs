//! Pending-interaction registries.
//!
//! Plans, clarifying questions and execute-confirmations are all "the agent
//! is waiting on the human" moments. Each one is registered under a fresh id
//! and resolved exactly once, either by the user or in bulk when a run is
//! torn down. Resolution removes the entry. Anyone that needs to block on the
//! outcome holds the [`oneshot::Receiver`] returned at registration.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::normalized::QuestionSpec;

/// Outcome delivered to whoever waits on an interaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The user accepted; answers or edits travel in the value.
    Approved(serde_json::Value),
    /// Declined by the user, or torn down with the run.
    Rejected,
}

impl Resolution {
    #[must_use]
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved(_))
    }
}

/// A plan awaiting review.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PlanProposal {
    pub title: String,
    pub content: String,
    /// The prompt of the run that produced the plan.
    pub prompt: String,
    pub provider: String,
    pub model: String,
}

/// A set of clarifying questions.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QuestionSet {
    pub questions: Vec<QuestionSpec>,
    pub prompt: String,
    pub provider: String,
    pub model: String,
}

/// A tool call that needs an explicit go-ahead.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConfirmRequest {
    pub tool_name: String,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Public view of a pending interaction.
#[derive(Debug, Clone, Serialize)]
pub struct InteractionView<T> {
    pub id: String,
    pub payload: T,
}

/// Returned by [`PendingRegistry::register`].
#[derive(Debug)]
pub struct PendingHandle {
    pub id: String,
    pub outcome: oneshot::Receiver<Resolution>,
}

#[derive(Debug)]
struct Entry<T> {
    id: String,
    payload: T,
    waiter: oneshot::Sender<Resolution>,
}

#[derive(Debug)]
struct RegistryState<T> {
    next_seq: u64,
    // keyed by arrival order
    entries: BTreeMap<u64, Entry<T>>,
    seq_by_id: HashMap<String, u64>,
}

/// Registry for one interaction type.
#[derive(Debug)]
pub struct PendingRegistry<T> {
    kind: &'static str,
    state: Arc<Mutex<RegistryState<T>>>,
}

impl<T> Clone for PendingRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone> PendingRegistry<T> {
    /// Create an empty registry; `kind` only shows up in logs.
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(RegistryState {
                next_seq: 0,
                entries: BTreeMap::new(),
                seq_by_id: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new pending interaction.
    pub fn register(&self, payload: T) -> PendingHandle {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            seq,
            Entry {
                id: id.clone(),
                payload,
                waiter: tx,
            },
        );
        state.seq_by_id.insert(id.clone(), seq);
        tracing::debug!(kind = self.kind, interaction_id = %id, "Interaction registered");
        PendingHandle { id, outcome: rx }
    }

    /// Resolve a pending interaction and forget it.
    ///
    /// Returns the payload, or `None` when the id is unknown or was already
    /// resolved.
    pub fn resolve(&self, id: &str, resolution: Resolution) -> Option<T> {
        let entry = {
            let mut state = self.lock();
            let seq = state.seq_by_id.remove(id)?;
            state.entries.remove(&seq)?
        };
        let approved = resolution.is_approved();
        // Nobody listening is fine: plans are resolved long after their run ended.
        let _ = entry.waiter.send(resolution);
        tracing::debug!(kind = self.kind, interaction_id = %id, approved, "Interaction resolved");
        Some(entry.payload)
    }

    /// Reject every outstanding entry so no waiter blocks forever.
    ///
    /// Returns how many entries were rejected.
    pub fn reject_all_pending(&self) -> usize {
        let drained = {
            let mut state = self.lock();
            state.seq_by_id.clear();
            std::mem::take(&mut state.entries)
        };
        let rejected = drained.len();
        for entry in drained.into_values() {
            let _ = entry.waiter.send(Resolution::Rejected);
        }
        if rejected > 0 {
            tracing::info!(kind = self.kind, rejected, "Rejected pending interactions");
        }
        rejected
    }

    /// Pending entries in arrival order.
    #[must_use]
    pub fn pending(&self) -> Vec<InteractionView<T>> {
        self.lock()
            .entries
            .values()
            .map(|e| InteractionView {
                id: e.id.clone(),
                payload: e.payload.clone(),
            })
            .collect()
    }
}

/// The three registries the orchestrator coordinates.
#[derive(Debug, Clone)]
pub struct Interactions {
    pub plans: PendingRegistry<PlanProposal>,
    pub questions: PendingRegistry<QuestionSet>,
    pub confirms: PendingRegistry<ConfirmRequest>,
}

impl Default for Interactions {
    fn default() -> Self {
        Self {
            plans: PendingRegistry::new("plan"),
            questions: PendingRegistry::new("question"),
            confirms: PendingRegistry::new("confirm"),
        }
    }
}

impl Interactions {
    /// Reject everything in every registry.
    pub fn reject_all_pending(&self) -> usize {
        self.plans.reject_all_pending()
            + self.questions.reject_all_pending()
            + self.confirms.reject_all_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirm(name: &str) -> ConfirmRequest {
        ConfirmRequest {
            tool_name: name.to_string(),
            summary: format!("run {name}"),
            details: None,
        }
    }

    #[tokio::test]
    async fn test_resolve_notifies_waiter() {
        let registry = PendingRegistry::new("confirm");
        let handle = registry.register(confirm("ls"));
        let payload = registry
            .resolve(&handle.id, Resolution::Approved(serde_json::Value::Null))
            .unwrap();
        assert_eq!(payload.tool_name, "ls");
        assert!(handle.outcome.await.unwrap().is_approved());
        assert!(registry.pending().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_twice_is_refused() {
        let registry = PendingRegistry::new("confirm");
        let handle = registry.register(confirm("ls"));
        assert!(registry.resolve(&handle.id, Resolution::Rejected).is_some());
        assert!(
            registry
                .resolve(&handle.id, Resolution::Approved(serde_json::Value::Null))
                .is_none()
        );
        assert_eq!(handle.outcome.await.unwrap(), Resolution::Rejected);
    }

    #[tokio::test]
    async fn test_reject_all_pending_releases_every_waiter() {
        let registry = PendingRegistry::new("confirm");
        let first = registry.register(confirm("a"));
        let second = registry.register(confirm("b"));
        let done = registry.register(confirm("c"));
        registry.resolve(&done.id, Resolution::Approved(serde_json::Value::Null));

        assert_eq!(registry.reject_all_pending(), 2);
        assert_eq!(first.outcome.await.unwrap(), Resolution::Rejected);
        assert_eq!(second.outcome.await.unwrap(), Resolution::Rejected);
        assert_eq!(registry.reject_all_pending(), 0);
    }

    #[test]
    fn test_resolved_entries_are_forgotten() {
        let registry = PendingRegistry::new("confirm");
        let mut last = None;
        for _ in 0..1001 {
            let handle = registry.register(confirm("ls"));
            registry.resolve(&handle.id, Resolution::Approved(serde_json::Value::Null));
            last = Some(handle.id);
        }
        let kept = registry.register(confirm("kept"));
        registry.register(confirm("dropped"));
        assert_eq!(registry.reject_all_pending(), 2);

        let state = registry.lock();
        assert!(state.entries.is_empty());
        assert!(state.seq_by_id.is_empty());
        drop(state);
        assert!(registry.resolve(&last.unwrap(), Resolution::Rejected).is_none());
        assert!(registry.resolve(&kept.id, Resolution::Rejected).is_none());
    }

    #[test]
    fn test_pending_is_fifo() {
        let registry = PendingRegistry::new("confirm");
        let a = registry.register(confirm("a"));
        let b = registry.register(confirm("b"));
        let c = registry.register(confirm("c"));
        registry.resolve(&b.id, Resolution::Rejected);

        let ids: Vec<String> = registry.pending().into_iter().map(|v| v.id).collect();
        assert_eq!(ids, vec![a.id, c.id]);
    }
}
