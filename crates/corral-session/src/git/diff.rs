use std::path::Path;

use anyhow::anyhow;
use chrono::Utc;

use super::{GitWorktree, run_git};

/// Statistics for the changes a working copy carries against its base
/// revision.
#[derive(Debug, Default)]
pub struct DiffStats {
    /// Full diff content.
    pub content: String,
    /// Number of added lines.
    pub added: usize,
    /// Number of removed lines.
    pub removed: usize,
    /// Any error hit while computing the diff. Carried inside the stats so
    /// setup-phase failures (like a missing base commit) flow back without
    /// breaking the refresh loop.
    pub error: Option<anyhow::Error>,
}

impl DiffStats {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.content.is_empty()
    }

    fn from_error(err: anyhow::Error) -> Self {
        Self {
            error: Some(err),
            ..Self::default()
        }
    }

    /// Copy of the stats without the (never-cached) error.
    fn snapshot(&self) -> Self {
        Self {
            content: self.content.clone(),
            added: self.added,
            removed: self.removed,
            error: None,
        }
    }
}

impl GitWorktree {
    /// Diff the working copy against the base revision.
    ///
    /// The short-form status output acts as a cache key: when it matches the
    /// previous run and `force` is false, the cached stats are returned
    /// without re-running the diff. `force` bypasses the cache entirely.
    pub async fn diff(&self, force: bool) -> DiffStats {
        let _op = self.diff_op.lock().await;
        let worktree = Path::new(&self.worktree_path);

        let status = match run_git(&["status", "--porcelain"], worktree).await {
            Ok(output) => output,
            Err(err) => return DiffStats::from_error(err),
        };

        {
            let mut cache = self.diff_cache.lock().unwrap();
            cache.last_checked_at = Some(Utc::now());
            if !force
                && cache.last_status_snapshot.as_deref() == Some(status.as_str())
                && let Some(last) = &cache.last_diff
            {
                return last.snapshot();
            }
        }

        let mut signature = status;

        // Untracked files are invisible to a diff against the base commit.
        // Record an intent-to-add so they show up, then re-read the status.
        if signature.contains("?? ") {
            if let Err(err) = run_git(&["add", "-N", "."], worktree).await {
                return DiffStats::from_error(err);
            }
            signature = match run_git(&["status", "--porcelain"], worktree).await {
                Ok(output) => output,
                Err(err) => return DiffStats::from_error(err),
            };
        }

        let base = self.base_commit_sha();
        if base.is_empty() {
            return DiffStats::from_error(anyhow!("base commit SHA not set"));
        }

        let content = match run_git(&["--no-pager", "diff", &base], worktree).await {
            Ok(output) => output,
            Err(err) => return DiffStats::from_error(err),
        };

        let (added, removed) = count_diff_lines(&content);
        let stats = DiffStats {
            content,
            added,
            removed,
            error: None,
        };

        let mut cache = self.diff_cache.lock().unwrap();
        cache.last_status_snapshot = Some(signature);
        cache.last_diff = Some(stats.snapshot());

        stats
    }
}

/// Count added and removed lines, skipping the `+++`/`---` file headers.
fn count_diff_lines(content: &str) -> (usize, usize) {
    let mut added = 0;
    let mut removed = 0;
    for line in content.lines() {
        if line.is_empty() {
            continue;
        }
        if line.starts_with('+') && !line.starts_with("+++") {
            added += 1;
        } else if line.starts_with('-') && !line.starts_with("---") {
            removed += 1;
        }
    }
    (added, removed)
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::process::Command;

    use tempfile::TempDir;

    use super::super::GitWorktree;
    use super::count_diff_lines;

    fn run_git_test(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap_or_else(|err| panic!("git {}: {err}", args.join(" ")));
        assert!(
            output.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn setup_temp_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().to_path_buf();
        run_git_test(&path, &["init", "--initial-branch=main"]);
        run_git_test(&path, &["config", "user.email", "test@example.com"]);
        run_git_test(&path, &["config", "user.name", "Test User"]);
        std::fs::write(path.join("file.txt"), "hello world\n").expect("write initial file");
        run_git_test(&path, &["add", "."]);
        run_git_test(&path, &["commit", "-m", "initial commit"]);
        (dir, path)
    }

    #[tokio::test]
    async fn diff_caches_status_snapshots() {
        let (_guard, repo) = setup_temp_repo();
        let head = run_git_test(&repo, &["rev-parse", "HEAD"]);
        let repo_str = repo.to_string_lossy().into_owned();

        let worktree = GitWorktree::from_storage(
            repo_str.clone(),
            repo_str,
            "session-test".into(),
            "main".into(),
            head,
        );

        std::fs::write(repo.join("file.txt"), "hello world\nsecond line\n")
            .expect("write pending change");

        assert!(worktree.last_checked_at().is_none());
        let stats = worktree.diff(false).await;
        assert!(stats.error.is_none(), "diff initial: {:?}", stats.error);
        assert!(!stats.is_empty(), "expected non-empty diff");
        assert!(worktree.last_checked_at().is_some());

        worktree
            .diff_cache
            .lock()
            .unwrap()
            .last_diff
            .as_mut()
            .expect("cached diff")
            .content = "cached".into();
        let second = worktree.diff(false).await;
        assert!(second.error.is_none(), "diff cached: {:?}", second.error);
        assert_eq!(second.content, "cached", "expected the cached diff back");

        std::fs::write(repo.join("file.txt"), "hello world\nsecond line\nthird line\n")
            .expect("write file");

        worktree.invalidate_diff_cache();
        let after_change = worktree.diff(false).await;
        assert!(after_change.error.is_none());
        assert_ne!(after_change.content, "cached");
        assert!(after_change.added > 0, "expected additions after change");
    }

    #[tokio::test]
    async fn diff_includes_untracked_files() {
        let (_guard, repo) = setup_temp_repo();
        let head = run_git_test(&repo, &["rev-parse", "HEAD"]);
        let repo_str = repo.to_string_lossy().into_owned();

        let worktree = GitWorktree::from_storage(
            repo_str.clone(),
            repo_str,
            "session-test".into(),
            "main".into(),
            head,
        );

        std::fs::write(repo.join("new-file.txt"), "brand new\n").expect("write untracked file");

        let stats = worktree.diff(false).await;
        assert!(stats.error.is_none(), "diff: {:?}", stats.error);
        assert!(
            stats.content.contains("new-file.txt"),
            "expected untracked file in diff, got {:?}",
            stats.content
        );
        assert!(stats.added > 0);
    }

    #[tokio::test]
    async fn diff_without_base_commit_reports_missing_sha() {
        let (_guard, repo) = setup_temp_repo();
        let repo_str = repo.to_string_lossy().into_owned();

        let worktree = GitWorktree::from_storage(
            repo_str.clone(),
            repo_str,
            "session-test".into(),
            "main".into(),
            String::new(),
        );

        std::fs::write(repo.join("file.txt"), "hello world\nchanged\n").expect("write change");

        let stats = worktree.diff(false).await;
        let err = stats.error.expect("expected missing-base error");
        assert!(err.to_string().contains("base commit SHA not set"));
    }

    #[test]
    fn counts_added_and_removed_lines() {
        let content = "\
--- a/file.txt
+++ b/file.txt
@@ -1,2 +1,2 @@
-old line
+new line
+another line
 context";
        assert_eq!(count_diff_lines(content), (2, 1));
    }

    #[test]
    fn empty_diff_counts_nothing() {
        assert_eq!(count_diff_lines(""), (0, 0));
    }
}
