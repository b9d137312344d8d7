//! Git worktree handle: one isolated working copy per session, rooted at a
//! base revision, with its own branch.

mod diff;

pub use diff::DiffStats;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};

use crate::errors;

/// Run a git command in `cwd` and return stdout.
pub(crate) async fn run_git(args: &[&str], cwd: &Path) -> Result<String> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .with_context(|| format!("failed to run git {}", args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let msg = stderr.trim();
        let msg = if msg.is_empty() { stdout.trim() } else { msg };
        bail!("git {} failed: {}", args.join(" "), msg);
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Reduce a session title to something git accepts as a branch component.
/// Keeps ASCII alphanumerics plus `.`, `_`, `-` and `/`; every other run of
/// characters collapses to a single dash.
fn sanitize_branch_component(title: &str) -> String {
    let mut result = String::with_capacity(title.len());
    let mut prev_was_dash = false;
    for c in title.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/') {
            result.push(c);
            prev_was_dash = false;
        } else if c == '-' || !prev_was_dash {
            result.push('-');
            prev_was_dash = true;
        }
    }
    result.trim_matches(|c| c == '-' || c == '/').to_string()
}

/// Derive the branch name for a new session checkout.
///
/// Titles that sanitize to nothing fall back to the bare prefix. Nested
/// titles (containing `/`) are taken as explicit branch paths and bypass the
/// prefix entirely.
pub fn branch_name_from_title(branch_prefix: &str, title: &str) -> String {
    let sanitized = sanitize_branch_component(title);
    if sanitized.is_empty() {
        return branch_prefix.trim_end_matches('/').to_string();
    }
    if sanitized.contains('/') {
        return sanitized;
    }
    format!("{branch_prefix}{sanitized}")
}

#[derive(Default)]
struct DiffCache {
    last_status_snapshot: Option<String>,
    last_diff: Option<DiffStats>,
    last_checked_at: Option<DateTime<Utc>>,
}

/// An isolated working copy of a host repository.
///
/// All state that the diff computation touches sits behind the handle's own
/// locks, so a shared `Arc<GitWorktree>` can be probed from the watcher task
/// while the supervisor drives lifecycle operations.
pub struct GitWorktree {
    repo_path: String,
    worktree_path: String,
    session_name: String,
    branch_name: String,
    base_commit_sha: Mutex<String>,
    /// Serializes diff computation; at most one `diff` per handle at a time.
    diff_op: tokio::sync::Mutex<()>,
    diff_cache: Mutex<DiffCache>,
}

impl GitWorktree {
    /// Create a handle for a brand-new checkout of the repository containing
    /// `repo_path`. Returns the handle and the branch name it will use; the
    /// working copy itself is materialized later by [`GitWorktree::setup`].
    pub async fn create(
        repo_path: &str,
        title: &str,
        branch_prefix: &str,
    ) -> Result<(Arc<Self>, String)> {
        let abs = std::path::absolute(repo_path)
            .with_context(|| format!("failed to resolve path {repo_path}"))?;
        let repo_root = run_git(&["rev-parse", "--show-toplevel"], &abs)
            .await
            .context("path is not a git repository")?;
        if repo_root.is_empty() {
            bail!("unable to resolve git repository root");
        }

        let root = PathBuf::from(&repo_root);
        let repo_parent = root
            .parent()
            .context("cannot determine repository parent directory")?;
        let repo_name = root
            .file_name()
            .and_then(|n| n.to_str())
            .context("cannot determine repository name")?;

        let branch_name = branch_name_from_title(branch_prefix, title);
        let worktree_path = repo_parent
            .join(format!("{repo_name}-worktrees"))
            .join(branch_name.replace('/', "-"));

        let worktree = Arc::new(Self {
            repo_path: repo_root,
            worktree_path: worktree_path.to_string_lossy().into_owned(),
            session_name: title.to_string(),
            branch_name: branch_name.clone(),
            base_commit_sha: Mutex::new(String::new()),
            diff_op: tokio::sync::Mutex::new(()),
            diff_cache: Mutex::new(DiffCache::default()),
        });
        Ok((worktree, branch_name))
    }

    /// Rebuild a handle from its persisted fields.
    pub fn from_storage(
        repo_path: String,
        worktree_path: String,
        session_name: String,
        branch_name: String,
        base_commit_sha: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo_path,
            worktree_path,
            session_name,
            branch_name,
            base_commit_sha: Mutex::new(base_commit_sha),
            diff_op: tokio::sync::Mutex::new(()),
            diff_cache: Mutex::new(DiffCache::default()),
        })
    }

    pub fn repo_path(&self) -> &str {
        &self.repo_path
    }

    pub fn worktree_path(&self) -> &str {
        &self.worktree_path
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn branch_name(&self) -> &str {
        &self.branch_name
    }

    pub fn base_commit_sha(&self) -> String {
        self.base_commit_sha.lock().unwrap().clone()
    }

    /// When the working-copy status was last consulted.
    pub fn last_checked_at(&self) -> Option<DateTime<Utc>> {
        self.diff_cache.lock().unwrap().last_checked_at
    }

    /// Last path segment of the host repository.
    pub fn repo_name(&self) -> String {
        Path::new(&self.repo_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.repo_path.clone())
    }

    async fn branch_exists(&self) -> bool {
        let reference = format!("refs/heads/{}", self.branch_name);
        run_git(
            &["show-ref", "--verify", "--quiet", &reference],
            Path::new(&self.repo_path),
        )
        .await
        .is_ok()
    }

    /// Materialize the working copy. A preserved branch (pause/resume) is
    /// checked out as-is; otherwise a new branch is created at the current
    /// HEAD, which also becomes the base revision for diffs.
    pub async fn setup(&self) -> Result<()> {
        let repo = Path::new(&self.repo_path);
        if let Some(parent) = Path::new(&self.worktree_path).parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let _ = run_git(&["worktree", "prune"], repo).await;

        if self.branch_exists().await {
            run_git(
                &["worktree", "add", &self.worktree_path, &self.branch_name],
                repo,
            )
            .await
            .context("failed to add worktree for existing branch")?;
            if self.base_commit_sha().is_empty() {
                let sha = run_git(&["rev-parse", &self.branch_name], repo)
                    .await
                    .context("failed to resolve branch revision")?;
                *self.base_commit_sha.lock().unwrap() = sha;
            }
        } else {
            let head = run_git(&["rev-parse", "HEAD"], repo)
                .await
                .context("failed to resolve repository HEAD")?;
            run_git(
                &[
                    "worktree",
                    "add",
                    "-b",
                    &self.branch_name,
                    &self.worktree_path,
                    &head,
                ],
                repo,
            )
            .await
            .context("failed to create worktree")?;
            *self.base_commit_sha.lock().unwrap() = head;
        }

        Ok(())
    }

    /// Tear down the working copy and its branch. Every step runs even when
    /// an earlier one fails; errors are combined.
    pub async fn cleanup(&self) -> Result<()> {
        let repo = Path::new(&self.repo_path);
        let mut errs = Vec::new();

        if Path::new(&self.worktree_path).exists() {
            if let Err(err) = run_git(
                &["worktree", "remove", "--force", &self.worktree_path],
                repo,
            )
            .await
            {
                errs.push(err.context("failed to remove worktree"));
            }
        }

        if self.branch_exists().await {
            if let Err(err) = run_git(&["branch", "-D", &self.branch_name], repo).await {
                errs.push(err.context("failed to delete branch"));
            }
        }

        if let Err(err) = run_git(&["worktree", "prune"], repo).await {
            errs.push(err.context("failed to prune worktrees"));
        }

        errors::combine(errs)
    }

    /// Remove the working copy directory while keeping the branch.
    pub async fn remove(&self) -> Result<()> {
        run_git(
            &["worktree", "remove", "--force", &self.worktree_path],
            Path::new(&self.repo_path),
        )
        .await
        .context("failed to remove worktree")?;
        Ok(())
    }

    pub async fn prune(&self) -> Result<()> {
        run_git(&["worktree", "prune"], Path::new(&self.repo_path))
            .await
            .context("failed to prune worktrees")?;
        Ok(())
    }

    /// Whether the working copy has uncommitted changes.
    pub async fn is_dirty(&self) -> Result<bool> {
        let status = run_git(&["status", "--porcelain"], Path::new(&self.worktree_path))
            .await
            .context("failed to read worktree status")?;
        Ok(!status.is_empty())
    }

    /// Whether the preserved branch is checked out anywhere in the host
    /// repository. Called while paused, so the session's own working copy is
    /// already gone and any hit belongs to someone else.
    pub async fn is_branch_checked_out(&self) -> Result<bool> {
        let output = run_git(
            &["worktree", "list", "--porcelain"],
            Path::new(&self.repo_path),
        )
        .await
        .context("failed to list worktrees")?;
        let needle = format!("branch refs/heads/{}", self.branch_name);
        Ok(output.lines().any(|line| line.trim() == needle))
    }

    /// Stage everything and commit with the given message.
    pub async fn commit_changes(&self, message: &str) -> Result<()> {
        let worktree = Path::new(&self.worktree_path);
        run_git(&["add", "-A"], worktree)
            .await
            .context("failed to stage changes")?;
        run_git(&["commit", "-m", message], worktree)
            .await
            .context("failed to commit changes")?;
        Ok(())
    }

    /// Drop the status-snapshot cache so the next diff recomputes.
    pub fn invalidate_diff_cache(&self) {
        let mut cache = self.diff_cache.lock().unwrap();
        cache.last_diff = None;
        cache.last_status_snapshot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::branch_name_from_title;

    #[test]
    fn falls_back_to_prefix_when_sanitized_name_is_empty() {
        assert_eq!(branch_name_from_title("tester/", "/🔥"), "tester");
    }

    #[test]
    fn preserves_nested_names_when_sanitized_name_remains_valid() {
        assert_eq!(
            branch_name_from_title("tester/", "feature/subtask"),
            "feature/subtask"
        );
    }

    #[test]
    fn prefixes_simple_titles() {
        assert_eq!(
            branch_name_from_title("tester/", "Fix Bug 42"),
            "tester/fix-bug-42"
        );
    }

    #[test]
    fn collapses_character_runs_to_a_single_dash() {
        assert_eq!(
            branch_name_from_title("corral/", "my   fancy  task"),
            "corral/my-fancy-task"
        );
    }
}
