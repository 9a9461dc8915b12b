//! Undo boundary around agent runs.
//!
//! A run opens an undo session before the agent touches anything: the
//! current working tree is snapshotted (without mutating it) and the set of
//! untracked files is recorded. When the run ends the changed files are
//! resolved and, if there are any, the session is pushed onto a LIFO stack.
//! Popping the stack puts every changed file back to its baseline content.
//!
//! Directories that are not under version control get a no-op session that
//! is always discarded.

pub mod stats;
pub mod vcs;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

pub use vcs::{GitVcs, VcsError, VcsPort};

use crate::normalized::FileStats;

#[derive(Debug)]
struct OpenSession {
    id: String,
    project_dir: PathBuf,
    /// `None` for the no-op session of a non-repository directory.
    baseline: Option<String>,
    untracked_at_start: BTreeSet<String>,
}

/// A finished session with changes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedSession {
    pub session_id: String,
    #[serde(skip)]
    pub project_dir: PathBuf,
    #[serde(skip)]
    pub baseline: String,
    pub files: Vec<String>,
    pub closed_at: DateTime<Utc>,
}

/// Baseline vs. live content of one changed file.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileDiff {
    pub relative_path: String,
    pub original_content: String,
    pub current_content: String,
    pub existed: bool,
    pub exists_now: bool,
}

#[derive(Debug, Default)]
struct UndoState {
    open: Option<OpenSession>,
    stack: Vec<ClosedSession>,
}

/// Coordinates undo sessions for the process.
#[derive(Debug, Clone)]
pub struct UndoCoordinator {
    vcs: Arc<dyn VcsPort>,
    /// Path prefixes never treated as agent changes (the tool-state dir).
    ignored: Arc<Vec<String>>,
    state: Arc<Mutex<UndoState>>,
}

impl UndoCoordinator {
    #[must_use]
    pub fn new(vcs: Arc<dyn VcsPort>, ignored: Vec<String>) -> Self {
        Self {
            vcs,
            ignored: Arc::new(ignored),
            state: Arc::new(Mutex::new(UndoState::default())),
        }
    }

    /// Coordinator using the `git` binary.
    #[must_use]
    pub fn git(ignored: Vec<String>) -> Self {
        Self::new(Arc::new(GitVcs), ignored)
    }

    fn is_ignored(&self, path: &str) -> bool {
        self.ignored.iter().any(|prefix| {
            path == prefix || path.strip_prefix(prefix.as_str()).is_some_and(|r| r.starts_with('/'))
        })
    }

    /// Open a session for `project_dir`.
    ///
    /// A session left open by an earlier run is closed first.
    #[tracing::instrument(skip(self), fields(project_dir = %project_dir.display()))]
    pub async fn start(&self, project_dir: &Path) {
        let mut state = self.state.lock().await;
        if let Some(stale) = state.open.take() {
            tracing::warn!(session_id = %stale.id, "Closing undo session left open");
            self.close(&mut state, stale).await;
        }

        let id = Uuid::new_v4().to_string();
        let session = match self.capture(project_dir).await {
            Ok(Some((baseline, untracked))) => {
                tracing::debug!(session_id = %id, baseline = %baseline, untracked = untracked.len(), "Undo session opened");
                OpenSession {
                    id,
                    project_dir: project_dir.to_path_buf(),
                    baseline: Some(baseline),
                    untracked_at_start: untracked,
                }
            }
            Ok(None) => {
                tracing::debug!("Not a repository, undo disabled for this run");
                OpenSession {
                    id,
                    project_dir: project_dir.to_path_buf(),
                    baseline: None,
                    untracked_at_start: BTreeSet::new(),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not snapshot working tree, undo disabled for this run");
                OpenSession {
                    id,
                    project_dir: project_dir.to_path_buf(),
                    baseline: None,
                    untracked_at_start: BTreeSet::new(),
                }
            }
        };
        state.open = Some(session);
    }

    async fn capture(&self, dir: &Path) -> Result<Option<(String, BTreeSet<String>)>, VcsError> {
        if !self.vcs.is_repo(dir).await {
            return Ok(None);
        }
        let baseline = self.vcs.snapshot_baseline(dir).await?;
        let untracked = self.vcs.list_untracked(dir).await?;
        Ok(Some((baseline, untracked)))
    }

    /// Close the open session, if any.
    ///
    /// Returns the session when it was kept on the stack.
    pub async fn end(&self) -> Option<ClosedSession> {
        let mut state = self.state.lock().await;
        let open = state.open.take()?;
        self.close(&mut state, open).await
    }

    async fn close(&self, state: &mut UndoState, open: OpenSession) -> Option<ClosedSession> {
        let baseline = open.baseline.clone()?;
        let files = match self.changed_files(&open).await {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(session_id = %open.id, error = %e, "Could not resolve changed files, dropping undo session");
                return None;
            }
        };
        if files.is_empty() {
            tracing::debug!(session_id = %open.id, "No changes, undo session discarded");
            return None;
        }

        let closed = ClosedSession {
            session_id: open.id,
            project_dir: open.project_dir,
            baseline,
            files,
            closed_at: Utc::now(),
        };
        tracing::info!(session_id = %closed.session_id, files = closed.files.len(), depth = state.stack.len() + 1, "Undo session recorded");
        state.stack.push(closed.clone());
        Some(closed)
    }

    async fn changed_files(&self, open: &OpenSession) -> Result<Vec<String>, VcsError> {
        let Some(baseline) = &open.baseline else {
            return Ok(Vec::new());
        };
        let mut changed = self.vcs.diff_names(&open.project_dir, baseline).await?;
        let untracked = self.vcs.list_untracked(&open.project_dir).await?;
        changed.extend(untracked.difference(&open.untracked_at_start).cloned());
        Ok(changed.into_iter().filter(|p| !self.is_ignored(p)).collect())
    }

    /// Pop the newest session and restore its files to baseline content.
    ///
    /// Returns the restored paths, or `None` when the stack is empty.
    /// Per-file failures are logged and skipped.
    #[tracing::instrument(skip(self))]
    pub async fn pop_and_restore(&self) -> Option<Vec<String>> {
        let session = self.state.lock().await.stack.pop()?;
        let mut restored = Vec::with_capacity(session.files.len());

        for rel in &session.files {
            let target = session.project_dir.join(rel);
            let result = match self
                .vcs
                .read_file_at_ref(&session.project_dir, &session.baseline, rel)
                .await
            {
                Ok(Some(content)) => restore_file(&target, &content).await,
                Ok(None) => remove_file(&target).await,
                Err(e) => {
                    tracing::warn!(path = %rel, error = %e, "Could not read baseline content");
                    continue;
                }
            };
            match result {
                Ok(()) => restored.push(rel.clone()),
                Err(e) => tracing::warn!(path = %rel, error = %e, "Could not restore file"),
            }
        }

        tracing::info!(session_id = %session.session_id, restored = restored.len(), "Undo session restored");
        Some(restored)
    }

    /// Baseline vs. disk for the newest closed session, without popping it.
    pub async fn latest_session_diffs(&self) -> Option<Vec<FileDiff>> {
        let session = self.state.lock().await.stack.last().cloned()?;
        let mut diffs = Vec::with_capacity(session.files.len());
        for rel in &session.files {
            let (original, current) = self
                .contents(&session.project_dir, &session.baseline, rel)
                .await;
            diffs.push(FileDiff {
                relative_path: rel.clone(),
                existed: original.is_some(),
                exists_now: current.is_some(),
                original_content: original.unwrap_or_default(),
                current_content: current.unwrap_or_default(),
            });
        }
        Some(diffs)
    }

    /// Line statistics for the still-open session.
    pub async fn current_session_stats(&self) -> Option<FileStats> {
        let state = self.state.lock().await;
        let open = state.open.as_ref()?;
        let baseline = open.baseline.as_deref()?;
        let files = match self.changed_files(open).await {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(error = %e, "Could not compute session stats");
                return None;
            }
        };

        let mut stats = Vec::with_capacity(files.len());
        for rel in &files {
            let (original, current) = self.contents(&open.project_dir, baseline, rel).await;
            stats.push(stats::file_stat(rel, original.as_deref(), current.as_deref()));
        }
        Some(FileStats::from_files(stats))
    }

    async fn contents(&self, dir: &Path, baseline: &str, rel: &str) -> (Option<String>, Option<String>) {
        let original = match self.vcs.read_file_at_ref(dir, baseline, rel).await {
            Ok(bytes) => bytes.map(|b| String::from_utf8_lossy(&b).into_owned()),
            Err(e) => {
                tracing::debug!(path = %rel, error = %e, "Baseline content unavailable");
                None
            }
        };
        let current = tokio::fs::read(dir.join(rel))
            .await
            .ok()
            .map(|b| String::from_utf8_lossy(&b).into_owned());
        (original, current)
    }

    /// Closed sessions, newest first.
    pub async fn stack(&self) -> Vec<ClosedSession> {
        self.state.lock().await.stack.iter().rev().cloned().collect()
    }

    /// Whether a session is currently open.
    pub async fn is_open(&self) -> bool {
        self.state.lock().await.open.is_some()
    }
}

async fn restore_file(target: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(target, content).await
}

async fn remove_file(target: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(target).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use super::*;

    /// In-memory VCS: baseline contents are fixed, the working tree is the
    /// real directory.
    #[derive(Debug, Default)]
    struct FakeVcs {
        repo: bool,
        baseline: HashMap<String, Vec<u8>>,
        tracked: BTreeSet<String>,
        fail_reads: StdMutex<BTreeSet<String>>,
    }

    #[async_trait::async_trait]
    impl VcsPort for FakeVcs {
        async fn is_repo(&self, _dir: &Path) -> bool {
            self.repo
        }

        async fn snapshot_baseline(&self, _dir: &Path) -> Result<String, VcsError> {
            Ok("base".into())
        }

        async fn list_untracked(&self, dir: &Path) -> Result<BTreeSet<String>, VcsError> {
            let mut out = BTreeSet::new();
            for entry in walkdir::WalkDir::new(dir).into_iter().filter_map(Result::ok) {
                if entry.file_type().is_file() {
                    let rel = entry
                        .path()
                        .strip_prefix(dir)
                        .unwrap()
                        .to_string_lossy()
                        .into_owned();
                    if !self.tracked.contains(&rel) {
                        out.insert(rel);
                    }
                }
            }
            Ok(out)
        }

        async fn diff_names(&self, dir: &Path, _baseline: &str) -> Result<BTreeSet<String>, VcsError> {
            Ok(self
                .tracked
                .iter()
                .filter(|p| std::fs::read(dir.join(p)).ok() != self.baseline.get(*p).cloned())
                .cloned()
                .collect())
        }

        async fn read_file_at_ref(
            &self,
            _dir: &Path,
            _baseline: &str,
            path: &str,
        ) -> Result<Option<Vec<u8>>, VcsError> {
            if self.fail_reads.lock().unwrap().contains(path) {
                return Err(VcsError::Spawn(std::io::Error::other("boom")));
            }
            Ok(self.baseline.get(path).cloned())
        }
    }

    fn repo_with(dir: &Path, files: &[(&str, &str)]) -> FakeVcs {
        let mut vcs = FakeVcs {
            repo: true,
            ..FakeVcs::default()
        };
        for (path, content) in files {
            std::fs::write(dir.join(path), content).unwrap();
            vcs.baseline.insert((*path).to_string(), content.as_bytes().to_vec());
            vcs.tracked.insert((*path).to_string());
        }
        vcs
    }

    #[tokio::test]
    async fn test_non_repo_session_is_always_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let undo = UndoCoordinator::new(Arc::new(FakeVcs::default()), Vec::new());
        undo.start(dir.path()).await;
        std::fs::write(dir.path().join("new.txt"), "x").unwrap();
        assert!(undo.end().await.is_none());
        assert!(undo.stack().await.is_empty());
        assert!(undo.pop_and_restore().await.is_none());
    }

    #[tokio::test]
    async fn test_changes_are_recorded_and_restored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "mine").unwrap();
        let vcs = repo_with(dir.path(), &[("app.js", "a\nb\nc\n")]);
        let undo = UndoCoordinator::new(Arc::new(vcs), vec![".overlay-agent".into()]);

        undo.start(dir.path()).await;
        std::fs::write(dir.path().join("app.js"), "a\nc\nd\n").unwrap();
        std::fs::write(dir.path().join("new.js"), "1\n").unwrap();
        std::fs::create_dir_all(dir.path().join(".overlay-agent")).unwrap();
        std::fs::write(dir.path().join(".overlay-agent/session.json"), "{}").unwrap();

        let stats = undo.current_session_stats().await.unwrap();
        assert_eq!(stats.files_changed, 2);
        assert_eq!((stats.additions, stats.deletions), (2, 1));

        let closed = undo.end().await.unwrap();
        assert_eq!(closed.files, vec!["app.js".to_string(), "new.js".to_string()]);

        let diffs = undo.latest_session_diffs().await.unwrap();
        let new_file = diffs.iter().find(|d| d.relative_path == "new.js").unwrap();
        assert!(!new_file.existed);
        assert!(new_file.exists_now);

        let restored = undo.pop_and_restore().await.unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(std::fs::read_to_string(dir.path().join("app.js")).unwrap(), "a\nb\nc\n");
        assert!(!dir.path().join("new.js").exists());
        assert_eq!(std::fs::read_to_string(dir.path().join("notes.txt")).unwrap(), "mine");
        assert!(undo.pop_and_restore().await.is_none());
    }

    #[tokio::test]
    async fn test_unchanged_session_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = repo_with(dir.path(), &[("app.js", "a\n")]);
        let undo = UndoCoordinator::new(Arc::new(vcs), Vec::new());
        undo.start(dir.path()).await;
        assert!(undo.end().await.is_none());
        assert!(!undo.is_open().await);
    }

    #[tokio::test]
    async fn test_restore_continues_past_failed_file() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = repo_with(dir.path(), &[("a.txt", "a\n"), ("b.txt", "b\n")]);
        vcs.fail_reads.lock().unwrap().insert("a.txt".into());
        let undo = UndoCoordinator::new(Arc::new(vcs), Vec::new());

        undo.start(dir.path()).await;
        std::fs::write(dir.path().join("a.txt"), "changed\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "changed\n").unwrap();
        undo.end().await.unwrap();

        let restored = undo.pop_and_restore().await.unwrap();
        assert_eq!(restored, vec!["b.txt".to_string()]);
        assert_eq!(std::fs::read_to_string(dir.path().join("b.txt")).unwrap(), "b\n");
    }

    #[tokio::test]
    async fn test_stack_is_lifo() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = repo_with(dir.path(), &[("a.txt", "a\n")]);
        let undo = UndoCoordinator::new(Arc::new(vcs), Vec::new());

        undo.start(dir.path()).await;
        std::fs::write(dir.path().join("first.txt"), "1").unwrap();
        let first = undo.end().await.unwrap();

        undo.start(dir.path()).await;
        std::fs::write(dir.path().join("second.txt"), "2").unwrap();
        let second = undo.end().await.unwrap();

        let stack = undo.stack().await;
        assert_eq!(stack[0].session_id, second.session_id);
        assert_eq!(stack[1].session_id, first.session_id);
    }

    #[test]
    fn test_ignored_prefix_matching() {
        let undo = UndoCoordinator::new(Arc::new(FakeVcs::default()), vec![".overlay-agent".into()]);
        assert!(undo.is_ignored(".overlay-agent/session.json"));
        assert!(undo.is_ignored(".overlay-agent"));
        assert!(!undo.is_ignored(".overlay-agent-other/x"));
        assert!(!undo.is_ignored("src/app.js"));
    }
}
