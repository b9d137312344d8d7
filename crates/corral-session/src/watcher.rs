//! Filesystem watcher feeding the per-session diff dirty flag.
//!
//! One background task per running session listens for events under the
//! working copy (minus the repository metadata directory) and flips the
//! dirty flag so the next refresh recomputes the diff. The supervisor falls
//! back to interval-only refreshes when the watcher cannot be created.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;
use walkdir::WalkDir;

use crate::errors;
use crate::git::GitWorktree;

pub(crate) struct DiffWatcher {
    watcher: Arc<Mutex<RecommendedWatcher>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DiffWatcher {
    /// Build a watcher over the worktree and spawn its event task. Any
    /// creation or registration failure is returned so the caller can fall
    /// back to interval-only refreshes.
    pub(crate) fn spawn(
        worktree: Arc<GitWorktree>,
        diff_dirty: Arc<AtomicBool>,
        title: &str,
    ) -> Result<Self> {
        let root = PathBuf::from(worktree.worktree_path());

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = event_tx.send(res);
            },
            notify::Config::default(),
        )
        .context("failed to create filesystem watcher")?;
        let watcher = Arc::new(Mutex::new(watcher));

        add_directories(&watcher, &root, &root)?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task_watcher = Arc::clone(&watcher);
        let session = title.to_string();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    received = event_rx.recv() => match received {
                        None => break,
                        Some(Ok(event)) => {
                            handle_event(&event, &diff_dirty, &worktree);
                            if matches!(event.kind, EventKind::Create(_)) {
                                for path in &event.paths {
                                    if path.is_dir()
                                        && let Err(err) = add_directories(&task_watcher, path, &root)
                                    {
                                        warn!(
                                            session = %session,
                                            path = %path.display(),
                                            "failed to watch new directory: {err:#}"
                                        );
                                    }
                                }
                            }
                        }
                        Some(Err(err)) => {
                            warn!(session = %session, "filesystem watcher error: {err}");
                        }
                    },
                }
            }
        });

        Ok(Self {
            watcher,
            shutdown: shutdown_tx,
            task,
        })
    }

    /// Signal the task, wait for it to exit, then drop the watcher. The task
    /// is always awaited before the watcher goes away.
    pub(crate) async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(true);

        let mut errs = Vec::new();
        if let Err(err) = self.task.await {
            errs.push(anyhow!("diff watcher task failed: {err}"));
        }
        drop(self.watcher);

        errors::combine(errs)
    }
}

fn handle_event(event: &Event, diff_dirty: &AtomicBool, worktree: &GitWorktree) {
    if matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        diff_dirty.store(true, Ordering::SeqCst);
        worktree.invalidate_diff_cache();
    }
}

/// Register `root` and every directory below it, skipping the repository
/// metadata directory.
fn add_directories(
    watcher: &Mutex<RecommendedWatcher>,
    root: &Path,
    worktree_root: &Path,
) -> Result<()> {
    let mut guard = watcher.lock().unwrap();
    let walk = WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| !is_repo_metadata(entry.path(), worktree_root));
    for entry in walk {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        guard
            .watch(entry.path(), RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", entry.path().display()))?;
    }
    Ok(())
}

fn is_repo_metadata(path: &Path, worktree_root: &Path) -> bool {
    match path.strip_prefix(worktree_root) {
        Ok(rel) => rel.components().any(|c| c.as_os_str() == ".git"),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use tempfile::TempDir;

    use super::{DiffWatcher, is_repo_metadata};
    use crate::git::GitWorktree;

    #[test]
    fn repo_metadata_paths_are_ignored() {
        let root = Path::new("/tmp/worktree");
        assert!(is_repo_metadata(Path::new("/tmp/worktree/.git"), root));
        assert!(is_repo_metadata(
            Path::new("/tmp/worktree/.git/objects"),
            root
        ));
        assert!(!is_repo_metadata(Path::new("/tmp/worktree/src"), root));
        assert!(!is_repo_metadata(Path::new("/elsewhere/.git"), root));
    }

    #[tokio::test]
    async fn watcher_marks_dirty_on_file_writes() {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().to_string_lossy().into_owned();
        let worktree = GitWorktree::from_storage(
            path.clone(),
            path,
            "watch-test".into(),
            "main".into(),
            String::new(),
        );

        let dirty = Arc::new(AtomicBool::new(false));
        let watcher =
            DiffWatcher::spawn(worktree, Arc::clone(&dirty), "watch-test").expect("spawn watcher");

        std::fs::write(dir.path().join("touched.txt"), "content").expect("write file");

        let mut saw_dirty = false;
        for _ in 0..100 {
            if dirty.load(Ordering::SeqCst) {
                saw_dirty = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(saw_dirty, "expected file write to mark the diff dirty");

        watcher.stop().await.expect("stop watcher");
    }
}
