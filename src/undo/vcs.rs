//! Version-control port and its git implementation.

use std::collections::BTreeSet;
use std::path::Path;

use tokio::process::Command;

/// Hash of git's empty tree, used as baseline in a repository without commits.
pub const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// Errors from the version-control subprocess.
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("`git {args}` failed ({status}): {stderr}")]
    Failed {
        args: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// The operations the undo coordinator needs from a VCS.
#[async_trait::async_trait]
pub trait VcsPort: Send + Sync + std::fmt::Debug {
    /// Whether `dir` is inside a working tree.
    async fn is_repo(&self, dir: &Path) -> bool;

    /// A reference to the current working-tree state, without mutating it.
    async fn snapshot_baseline(&self, dir: &Path) -> Result<String, VcsError>;

    /// Untracked, non-ignored paths relative to `dir`.
    async fn list_untracked(&self, dir: &Path) -> Result<BTreeSet<String>, VcsError>;

    /// Tracked paths (relative to `dir`) that differ between `baseline` and
    /// the working tree.
    async fn diff_names(&self, dir: &Path, baseline: &str) -> Result<BTreeSet<String>, VcsError>;

    /// Content of `path` at `baseline`, or `None` if it did not exist there.
    async fn read_file_at_ref(
        &self,
        dir: &Path,
        baseline: &str,
        path: &str,
    ) -> Result<Option<Vec<u8>>, VcsError>;
}

/// [`VcsPort`] backed by the `git` binary.
#[derive(Debug, Clone, Default)]
pub struct GitVcs;

impl GitVcs {
    async fn run(dir: &Path, args: &[&str]) -> Result<Vec<u8>, VcsError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdin(std::process::Stdio::null())
            .output()
            .await?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(VcsError::Failed {
                args: args.join(" "),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn nul_separated(out: &[u8]) -> BTreeSet<String> {
        out.split(|b| *b == 0)
            .filter(|p| !p.is_empty())
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect()
    }
}

#[async_trait::async_trait]
impl VcsPort for GitVcs {
    async fn is_repo(&self, dir: &Path) -> bool {
        Self::run(dir, &["rev-parse", "--is-inside-work-tree"])
            .await
            .is_ok_and(|out| out.trim_ascii() == b"true")
    }

    async fn snapshot_baseline(&self, dir: &Path) -> Result<String, VcsError> {
        let head = match Self::run(dir, &["rev-parse", "--verify", "HEAD"]).await {
            Ok(head) => String::from_utf8_lossy(&head).trim().to_string(),
            Err(e) => {
                // No commits yet: the index is the only recorded state.
                tracing::debug!(error = %e, "No HEAD yet, using the index as baseline");
                return Ok(match Self::run(dir, &["write-tree"]).await {
                    Ok(tree) => String::from_utf8_lossy(&tree).trim().to_string(),
                    Err(_) => EMPTY_TREE.to_string(),
                });
            }
        };

        // `stash create` prints nothing on a clean tree.
        match Self::run(dir, &["stash", "create"]).await {
            Ok(stash) => {
                let stash = String::from_utf8_lossy(&stash).trim().to_string();
                Ok(if stash.is_empty() { head } else { stash })
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not snapshot uncommitted changes, using HEAD");
                Ok(head)
            }
        }
    }

    async fn list_untracked(&self, dir: &Path) -> Result<BTreeSet<String>, VcsError> {
        let out = Self::run(dir, &["ls-files", "-z", "--others", "--exclude-standard"]).await?;
        Ok(Self::nul_separated(&out))
    }

    async fn diff_names(&self, dir: &Path, baseline: &str) -> Result<BTreeSet<String>, VcsError> {
        let out = Self::run(dir, &["diff", "-z", "--name-only", "--relative", baseline]).await?;
        Ok(Self::nul_separated(&out))
    }

    async fn read_file_at_ref(
        &self,
        dir: &Path,
        baseline: &str,
        path: &str,
    ) -> Result<Option<Vec<u8>>, VcsError> {
        let spec = format!("{baseline}:./{path}");
        if Self::run(dir, &["cat-file", "-e", &spec]).await.is_err() {
            return Ok(None);
        }
        Self::run(dir, &["show", &spec]).await.map(Some)
    }
}
