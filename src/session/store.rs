//! Session state and its on-disk store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::llm::{Message, MessageRole};

/// File name of the persisted session inside the state directory.
pub const SESSION_FILE_NAME: &str = "session.json";

/// The persisted session object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub model_provider: String,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl SessionState {
    /// Drop any trailing run of user messages left by an interrupted turn.
    ///
    /// Returns how many messages were removed.
    pub fn repair(&mut self) -> usize {
        let keep = self
            .messages
            .iter()
            .rposition(|m| m.role != MessageRole::User)
            .map_or(0, |i| i + 1);
        let dropped = self.messages.len() - keep;
        self.messages.truncate(keep);
        dropped
    }
}

/// Thread-safe session store.
///
/// Every mutation rewrites the session file atomically. Persistence errors
/// are logged and never fail the caller.
#[derive(Debug, Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    path: Option<PathBuf>,
    state: Mutex<SessionState>,
}

impl SessionStore {
    /// Load the session stored in `state_dir`, or start empty.
    pub async fn open(state_dir: &Path) -> Self {
        let path = state_dir.join(SESSION_FILE_NAME);
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<SessionState>(&bytes) {
                Ok(state) => {
                    tracing::info!(
                        path = %path.display(),
                        message_count = state.messages.len(),
                        provider = %state.model_provider,
                        "Loaded session"
                    );
                    state
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable session file");
                    SessionState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SessionState::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Could not read session file");
                SessionState::default()
            }
        };

        Self {
            inner: Arc::new(StoreInner {
                path: Some(path),
                state: Mutex::new(state),
            }),
        }
    }

    /// A store that never touches disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                path: None,
                state: Mutex::new(SessionState::default()),
            }),
        }
    }

    pub async fn snapshot(&self) -> SessionState {
        self.inner.state.lock().await.clone()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.inner.state.lock().await.messages.clone()
    }

    /// Make `provider`/`model` the active pair.
    ///
    /// History survives a switch between two tool-augmented providers. If
    /// either side is self-contained the history is cleared, since the two
    /// tool vocabularies cannot be mixed. Returns `true` when it was cleared.
    pub async fn select_model(
        &self,
        provider: &str,
        model: &str,
        is_self_contained: impl Fn(&str) -> bool,
    ) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.model_provider == provider && state.model_id == model {
            return false;
        }

        let had_provider = !state.model_provider.is_empty();
        let reset = had_provider
            && !state.messages.is_empty()
            && (is_self_contained(&state.model_provider) || is_self_contained(provider));

        if reset {
            tracing::info!(
                from = %state.model_provider,
                to = %provider,
                dropped = state.messages.len(),
                "Resetting session history on provider family switch"
            );
            state.messages.clear();
        }
        state.model_provider = provider.to_string();
        state.model_id = model.to_string();
        self.persist(&state).await;
        reset
    }

    /// Repair the history, append the new user message and return the
    /// outbound message list.
    pub async fn begin_turn(&self, prompt: &str) -> Vec<Message> {
        let mut state = self.inner.state.lock().await;
        let dropped = state.repair();
        if dropped > 0 {
            tracing::debug!(dropped, "Dropped orphaned user messages");
        }
        state.messages.push(Message::user(prompt));
        self.persist(&state).await;
        state.messages.clone()
    }

    /// Append messages produced by a run.
    pub async fn append(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let mut state = self.inner.state.lock().await;
        state.messages.extend(messages);
        self.persist(&state).await;
    }

    /// Forget the session and remove its file.
    pub async fn reset(&self) {
        let mut state = self.inner.state.lock().await;
        state.messages.clear();
        if let Some(path) = &self.inner.path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => tracing::info!(path = %path.display(), "Session reset"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Could not remove session file"),
            }
        }
    }

    async fn persist(&self, state: &SessionState) {
        let Some(path) = &self.inner.path else {
            return;
        };
        if let Err(e) = write_atomic(path, state).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to save session");
        }
    }
}

/// Write via a sibling temp file and rename.
async fn write_atomic(path: &Path, state: &SessionState) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(messages: &[Message]) -> Vec<(MessageRole, &str)> {
        messages.iter().map(|m| (m.role, m.content.as_str())).collect()
    }

    #[tokio::test]
    async fn test_repair_then_new_turn() {
        let store = SessionStore::in_memory();
        store.append(vec![Message::user("a"), Message::assistant("b"), Message::user("c")]).await;

        let outbound = store.begin_turn("d").await;
        assert_eq!(
            roles(&outbound),
            vec![
                (MessageRole::User, "a"),
                (MessageRole::Assistant, "b"),
                (MessageRole::User, "d"),
            ]
        );
    }

    #[test]
    fn test_repair_drops_every_trailing_user_message() {
        let mut state = SessionState {
            messages: vec![Message::assistant("x"), Message::user("1"), Message::user("2")],
            ..SessionState::default()
        };
        assert_eq!(state.repair(), 2);
        assert_eq!(state.messages.len(), 1);

        let mut only_users = SessionState {
            messages: vec![Message::user("1")],
            ..SessionState::default()
        };
        assert_eq!(only_users.repair(), 1);
        assert!(only_users.messages.is_empty());
    }

    #[tokio::test]
    async fn test_switch_between_tool_augmented_keeps_history() {
        let store = SessionStore::in_memory();
        let self_contained = |p: &str| p == "cli";
        store.select_model("openai", "gpt-4o", self_contained).await;
        store.append(vec![Message::user("a"), Message::assistant("b")]).await;

        assert!(!store.select_model("groq", "llama", self_contained).await);
        assert_eq!(store.messages().await.len(), 2);
    }

    #[tokio::test]
    async fn test_switch_to_or_from_self_contained_resets() {
        let self_contained = |p: &str| p == "cli";

        let store = SessionStore::in_memory();
        store.select_model("openai", "gpt-4o", self_contained).await;
        store.append(vec![Message::user("a"), Message::assistant("b")]).await;
        assert!(store.select_model("cli", "agent", self_contained).await);
        assert!(store.messages().await.is_empty());

        store.append(vec![Message::user("c"), Message::assistant("d")]).await;
        assert!(store.select_model("openai", "gpt-4o", self_contained).await);
        assert!(store.messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).await;
        store.select_model("openai", "gpt-4o", |_| false).await;
        store.begin_turn("hello").await;

        let reloaded = SessionStore::open(dir.path()).await;
        let state = reloaded.snapshot().await;
        assert_eq!(state.model_provider, "openai");
        assert_eq!(state.messages, vec![Message::user("hello")]);

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(SESSION_FILE_NAME)).unwrap())
                .unwrap();
        assert_eq!(raw["modelId"], "gpt-4o");
        assert_eq!(raw["modelProvider"], "openai");
    }

    #[tokio::test]
    async fn test_corrupt_file_means_empty_session() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SESSION_FILE_NAME), b"{not json").unwrap();
        let store = SessionStore::open(dir.path()).await;
        assert_eq!(store.snapshot().await, SessionState::default());
    }

    #[tokio::test]
    async fn test_reset_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).await;
        store.begin_turn("hello").await;
        assert!(dir.path().join(SESSION_FILE_NAME).exists());

        store.reset().await;
        assert!(!dir.path().join(SESSION_FILE_NAME).exists());
        assert!(store.messages().await.is_empty());
    }
}
