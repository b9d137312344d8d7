//! The per-session supervisor: lifecycle state machine, diff refresh engine,
//! and the wiring between one tmux pane and one git worktree.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::errors;
use crate::git::{DiffStats, GitWorktree};
use crate::storage::{DiffStatsData, InstanceData, WorktreeData};
use crate::tmux::TmuxSession;
use crate::watcher::DiffWatcher;

/// Interval-based fallback: a refresh this long after the previous one is
/// forced even when the dirty flag never fired.
pub(crate) const DIFF_REFRESH_INTERVAL_NANOS: i64 = 5_000_000_000;

/// Lifecycle state of an instance. Serialized numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Status {
    /// The agent is running and working.
    Running,
    /// The agent is waiting for user input.
    Ready,
    /// The instance is in the middle of starting up.
    Loading,
    /// Worktree removed, branch preserved.
    Paused,
}

impl From<Status> for u8 {
    fn from(status: Status) -> Self {
        match status {
            Status::Running => 0,
            Status::Ready => 1,
            Status::Loading => 2,
            Status::Paused => 3,
        }
    }
}

impl TryFrom<u8> for Status {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Status::Running),
            1 => Ok(Status::Ready),
            2 => Ok(Status::Loading),
            3 => Ok(Status::Paused),
            other => Err(format!("unknown instance status {other}")),
        }
    }
}

impl Status {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Ready => "ready",
            Self::Loading => "loading",
            Self::Paused => "paused",
        }
    }
}

/// Commit message recorded when a dirty worktree is paused. The timestamp
/// follows the RFC 822 layout (`02 Jan 06 15:04 UTC`).
fn pause_commit_message(title: &str, now: DateTime<Utc>) -> String {
    format!(
        "[corral] update from '{title}' on {} (paused)",
        now.format("%d %b %y %H:%M %Z")
    )
}

/// Options for creating a new instance.
pub struct InstanceOptions {
    /// Unique human identifier. Immutable once the instance starts.
    pub title: String,
    /// Path to the host repository the checkout derives from.
    pub path: String,
    /// Program to run in the pane (e.g. "claude").
    pub program: String,
    /// Automatically confirm when the pane shows a prompt.
    pub auto_yes: bool,
    /// Prefix for the branch created for this instance.
    pub branch_prefix: String,
}

/// One supervised agent: a tmux pane plus an isolated git worktree.
pub struct Instance {
    pub title: String,
    pub path: String,
    pub branch: String,
    pub status: Status,
    pub program: String,
    pub height: u16,
    pub width: u16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub auto_yes: bool,
    /// Initial text delivered to the pane right after the first start.
    pub prompt: String,

    pub(crate) branch_prefix: String,
    pub(crate) diff_stats: Option<DiffStats>,

    pub(crate) preview_dirty: AtomicBool,
    pub(crate) diff_dirty: Arc<AtomicBool>,
    pub(crate) last_diff_check: Arc<AtomicI64>,
    pub(crate) watcher: Option<DiffWatcher>,
    pub(crate) watcher_disabled: bool,

    pub(crate) started: bool,
    pub(crate) tmux: Option<TmuxSession>,
    pub(crate) worktree: Option<Arc<GitWorktree>>,
}

impl Instance {
    pub fn new(opts: InstanceOptions) -> Result<Self> {
        let now = Utc::now();
        let abs = std::path::absolute(&opts.path)
            .with_context(|| format!("failed to resolve path {}", opts.path))?;

        Ok(Self {
            title: opts.title,
            path: abs.to_string_lossy().into_owned(),
            branch: String::new(),
            status: Status::Ready,
            program: opts.program,
            height: 0,
            width: 0,
            created_at: now,
            updated_at: now,
            auto_yes: opts.auto_yes,
            prompt: String::new(),
            branch_prefix: opts.branch_prefix,
            diff_stats: None,
            preview_dirty: AtomicBool::new(true),
            diff_dirty: Arc::new(AtomicBool::new(true)),
            last_diff_check: Arc::new(AtomicI64::new(0)),
            watcher: None,
            watcher_disabled: false,
            started: false,
            tmux: None,
            worktree: None,
        })
    }

    /// Convert to the serializable record. `updated_at` is stamped at
    /// serialization time.
    pub fn to_data(&self) -> InstanceData {
        InstanceData {
            title: self.title.clone(),
            path: self.path.clone(),
            branch: self.branch.clone(),
            status: self.status,
            height: self.height,
            width: self.width,
            created_at: self.created_at,
            updated_at: Utc::now(),
            auto_yes: self.auto_yes,
            program: self.program.clone(),
            worktree: self
                .worktree
                .as_ref()
                .map(|worktree| WorktreeData {
                    repo_path: worktree.repo_path().to_string(),
                    worktree_path: worktree.worktree_path().to_string(),
                    session_name: worktree.session_name().to_string(),
                    branch_name: worktree.branch_name().to_string(),
                    base_commit_sha: worktree.base_commit_sha(),
                })
                .unwrap_or_default(),
            diff_stats: self
                .diff_stats
                .as_ref()
                .map(|stats| DiffStatsData {
                    added: stats.added,
                    removed: stats.removed,
                    content: stats.content.clone(),
                })
                .unwrap_or_default(),
        }
    }

    /// Rebuild an instance from a persisted record. Paused instances come
    /// back without reconnecting their resources; anything else re-binds the
    /// pane via a non-first-time start.
    pub async fn from_data(data: InstanceData) -> Result<Self> {
        let mut instance = Self {
            title: data.title,
            path: data.path,
            branch: data.branch,
            status: data.status,
            program: data.program,
            height: data.height,
            width: data.width,
            created_at: data.created_at,
            updated_at: data.updated_at,
            auto_yes: data.auto_yes,
            prompt: String::new(),
            branch_prefix: String::new(),
            diff_stats: Some(DiffStats {
                added: data.diff_stats.added,
                removed: data.diff_stats.removed,
                content: data.diff_stats.content,
                error: None,
            }),
            preview_dirty: AtomicBool::new(true),
            diff_dirty: Arc::new(AtomicBool::new(true)),
            last_diff_check: Arc::new(AtomicI64::new(0)),
            watcher: None,
            watcher_disabled: false,
            started: false,
            tmux: None,
            worktree: Some(GitWorktree::from_storage(
                data.worktree.repo_path,
                data.worktree.worktree_path,
                data.worktree.session_name,
                data.worktree.branch_name,
                data.worktree.base_commit_sha,
            )),
        };

        if instance.paused() {
            instance.started = true;
            instance.tmux = Some(TmuxSession::new(&instance.title, &instance.program));
            instance.get_branch();
        } else {
            instance.start(false).await?;
        }

        Ok(instance)
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn paused(&self) -> bool {
        self.status == Status::Paused
    }

    /// Last path segment of the host repository.
    pub fn repo_name(&self) -> Result<String> {
        if !self.started {
            bail!("cannot get repo name for instance that has not been started");
        }
        let worktree = self.worktree.as_ref().context("git worktree not initialized")?;
        Ok(worktree.repo_name())
    }

    /// Rename the instance. Refused once started: the title names the tmux
    /// session and the branch by then.
    pub fn set_title(&mut self, title: &str) -> Result<()> {
        if self.started {
            bail!("cannot change title of a started instance");
        }
        self.title = title.to_string();
        Ok(())
    }

    /// Current branch name, re-synced from the worktree when one exists.
    pub fn get_branch(&mut self) -> String {
        if let Some(worktree) = &self.worktree {
            self.branch = worktree.branch_name().to_string();
        }
        self.branch.clone()
    }

    pub fn get_diff_stats(&self) -> Option<&DiffStats> {
        self.diff_stats.as_ref()
    }

    /// Start the instance. `first_time` creates the worktree and a fresh
    /// pane; otherwise an existing pane is restored. Resources acquired
    /// along the way are released again on any failure.
    pub async fn start(&mut self, first_time: bool) -> Result<()> {
        if self.title.is_empty() {
            bail!("instance title cannot be empty");
        }
        if self.started {
            bail!("instance '{}' is already started", self.title);
        }

        self.status = Status::Loading;
        match self.start_inner(first_time).await {
            Ok(()) => {
                self.mark_preview_dirty();
                self.mark_diff_dirty();
                self.last_diff_check.store(0, Ordering::SeqCst);
                self.status = Status::Running;
                self.started = true;
                Ok(())
            }
            Err(err) => {
                self.status = Status::Ready;
                Err(err)
            }
        }
    }

    async fn start_inner(&mut self, first_time: bool) -> Result<()> {
        if self.tmux.is_none() {
            self.tmux = Some(TmuxSession::new(&self.title, &self.program));
        }

        if first_time {
            let (worktree, branch_name) =
                GitWorktree::create(&self.path, &self.title, &self.branch_prefix)
                    .await
                    .context("failed to create git worktree")?;
            self.worktree = Some(worktree);
            self.branch = branch_name;

            let worktree = self.worktree.clone().context("git worktree not initialized")?;
            if let Err(setup_err) = worktree.setup().await {
                let mut err = setup_err;
                if let Err(cleanup_err) = worktree.cleanup().await {
                    err = anyhow!("{err:#} (cleanup error: {cleanup_err:#})");
                }
                return Err(err.context("failed to setup git worktree"));
            }

            let tmux = self.tmux.as_ref().context("tmux session not initialized")?;
            if let Err(start_err) = tmux.start(worktree.worktree_path()) {
                let mut err = start_err;
                if let Err(cleanup_err) = worktree.cleanup().await {
                    err = anyhow!("{err:#} (cleanup error: {cleanup_err:#})");
                }
                return Err(err.context("failed to start new session"));
            }
        } else {
            {
                let tmux = self.tmux.as_ref().context("tmux session not initialized")?;
                tmux.restore().context("failed to restore existing session")?;
            }
            self.get_branch();
        }

        if let Err(watcher_err) = self.start_diff_watcher().await {
            let mut err = watcher_err.context("failed to initialize diff watcher");
            if first_time {
                let mut cleanup = Vec::new();
                if let Some(tmux) = &self.tmux
                    && let Err(close_err) = tmux.close()
                {
                    cleanup.push(close_err.context("failed to close tmux session"));
                }
                if let Some(worktree) = &self.worktree
                    && let Err(cleanup_err) = worktree.cleanup().await
                {
                    cleanup.push(cleanup_err.context("failed to cleanup git worktree"));
                }
                if let Err(cleanup_err) = errors::combine(cleanup) {
                    err = anyhow!("{err:#} (cleanup error: {cleanup_err:#})");
                }
            }
            return Err(err);
        }

        Ok(())
    }

    /// Terminate the instance and release everything it holds. Idempotent:
    /// an instance that never started reports success. Every cleanup step
    /// runs; errors are aggregated.
    pub async fn kill(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        let mut errs = Vec::new();

        if let Err(err) = self.stop_diff_watcher().await {
            errs.push(err.context("failed to stop diff watcher"));
        }

        // The pane is using the worktree directory, so it goes first.
        if let Some(tmux) = &self.tmux
            && let Err(err) = tmux.close()
        {
            errs.push(err.context("failed to close tmux session"));
        }

        if let Some(worktree) = &self.worktree
            && let Err(err) = worktree.cleanup().await
        {
            errs.push(err.context("failed to cleanup git worktree"));
        }

        errors::combine(errs)
    }

    /// Stop the pane and remove the worktree while preserving the branch.
    /// Dirty changes are committed locally first; if that commit fails the
    /// worktree is left in place.
    pub async fn pause(&mut self) -> Result<()> {
        if !self.started {
            bail!("cannot pause instance that has not been started");
        }
        if self.status == Status::Paused {
            bail!("instance is already paused");
        }

        let mut errs = Vec::new();

        if let Err(err) = self.stop_diff_watcher().await {
            errs.push(err.context("failed to stop diff watcher"));
        }

        let worktree = self.worktree.clone().context("git worktree not initialized")?;

        match worktree.is_dirty().await {
            Err(err) => errs.push(err.context("failed to check if worktree is dirty")),
            Ok(true) => {
                let message = pause_commit_message(&self.title, Utc::now());
                if let Err(err) = worktree.commit_changes(&message).await {
                    errs.push(err.context("failed to commit changes"));
                    // Uncommitted work is still in the tree; keep the worktree.
                    return errors::combine(errs);
                }
            }
            Ok(false) => {}
        }

        // Detach rather than close so the pane scrollback survives the pause.
        let tmux = self.tmux.as_ref().context("tmux session not initialized")?;
        if let Err(err) = tmux.detach_safely() {
            warn!(session = %self.title, "failed to detach tmux session: {err:#}");
            errs.push(err.context("failed to detach tmux session"));
        }

        if Path::new(worktree.worktree_path()).exists() {
            if let Err(err) = worktree.remove().await {
                errs.push(err.context("failed to remove git worktree"));
                return errors::combine(errs);
            }
            if let Err(err) = worktree.prune().await {
                errs.push(err.context("failed to prune git worktrees"));
                return errors::combine(errs);
            }
        }

        errors::combine(errs)?;
        self.status = Status::Paused;
        Ok(())
    }

    /// Recreate the worktree from the preserved branch and reconnect (or
    /// restart) the pane.
    pub async fn resume(&mut self) -> Result<()> {
        if !self.started {
            bail!("cannot resume instance that has not been started");
        }
        if self.status != Status::Paused {
            bail!("can only resume paused instances");
        }

        let worktree = self.worktree.clone().context("git worktree not initialized")?;

        if worktree
            .is_branch_checked_out()
            .await
            .context("failed to check if branch is checked out")?
        {
            bail!("cannot resume: branch is checked out, please switch to a different branch");
        }

        worktree.setup().await.context("failed to setup git worktree")?;

        {
            let tmux = self.tmux.as_ref().context("tmux session not initialized")?;
            let needs_fresh_start = if tmux.does_session_exist() {
                match tmux.restore() {
                    Ok(()) => false,
                    Err(err) => {
                        warn!(session = %self.title, "failed to restore tmux session: {err:#}");
                        true
                    }
                }
            } else {
                true
            };

            if needs_fresh_start
                && let Err(start_err) = tmux.start(worktree.worktree_path())
            {
                let mut err = start_err;
                if let Err(cleanup_err) = worktree.cleanup().await {
                    err = anyhow!("{err:#} (cleanup error: {cleanup_err:#})");
                }
                return Err(err.context("failed to start new session"));
            }
        }

        self.start_diff_watcher()
            .await
            .context("failed to initialize diff watcher")?;

        self.mark_preview_dirty();
        self.mark_diff_dirty();
        self.last_diff_check.store(0, Ordering::SeqCst);
        self.status = Status::Running;
        self.get_branch();

        Ok(())
    }

    /// Re-start the pane if its tmux session went away underneath us. The
    /// worktree directory must still exist.
    pub fn ensure_tmux_session(&mut self) -> Result<()> {
        if !self.started {
            bail!("cannot ensure tmux session for instance that has not been started");
        }
        if self.status == Status::Paused {
            bail!("cannot ensure tmux session for paused instance");
        }
        let tmux = self.tmux.as_ref().context("tmux session not initialized")?;
        if tmux.does_session_exist() {
            return Ok(());
        }

        let worktree_path = self
            .worktree
            .as_ref()
            .map(|worktree| worktree.worktree_path().to_string())
            .unwrap_or_default();
        if worktree_path.is_empty() {
            bail!("worktree path not set; resume the instance before attaching");
        }
        if !Path::new(&worktree_path).exists() {
            bail!("worktree path {worktree_path} unavailable");
        }

        info!(
            session = %self.title,
            path = %worktree_path,
            "tmux session missing; starting a fresh one"
        );
        tmux.start(&worktree_path)
            .context("failed to start new tmux session")?;

        self.mark_preview_dirty();
        self.mark_diff_dirty();
        self.last_diff_check.store(0, Ordering::SeqCst);
        self.status = Status::Running;
        self.updated_at = Utc::now();

        Ok(())
    }

    /// Attach the current terminal to the pane. The returned channel
    /// resolves when the attached client exits. A stale handle gets one
    /// restore-and-retry.
    pub async fn attach(&mut self) -> Result<oneshot::Receiver<()>> {
        if !self.started {
            bail!("cannot attach instance that has not been started");
        }
        self.ensure_tmux_session()?;

        let tmux = self.tmux.as_ref().context("tmux session not initialized")?;
        match tmux.attach().await {
            Ok(done) => Ok(done),
            Err(err) => {
                warn!(
                    session = %self.title,
                    "failed to attach to tmux session: {err:#}; attempting restore"
                );
                if tmux.restore().is_err() {
                    return Err(err.context("failed to attach and restore tmux session"));
                }
                tmux.attach().await
            }
        }
    }

    /// Deliver `text` to the pane, then confirm. The pause keeps the
    /// carriage return from being swallowed as part of the text.
    pub async fn send_prompt(&self, text: &str) -> Result<()> {
        if !self.started {
            bail!("instance not started");
        }
        let tmux = self.tmux.as_ref().context("tmux session not initialized")?;
        tmux.send_keys(text)
            .context("error sending keys to tmux session")?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        tmux.tap_enter().context("error tapping enter")?;
        Ok(())
    }

    /// Confirm a pending prompt, but only when auto-yes is on.
    pub fn tap_enter(&self) {
        if !self.started || !self.auto_yes {
            return;
        }
        let Some(tmux) = &self.tmux else {
            return;
        };
        if let Err(err) = tmux.tap_enter() {
            warn!(session = %self.title, "error tapping enter: {err:#}");
        }
    }

    /// Probe the pane for changes; any change or prompt marks both the
    /// preview and the diff dirty.
    pub fn has_updated(&self) -> (bool, bool) {
        if !self.started {
            return (false, false);
        }
        let Some(tmux) = &self.tmux else {
            return (false, false);
        };
        let (updated, has_prompt) = tmux.has_updated();
        if updated || has_prompt {
            self.mark_preview_dirty();
            self.mark_diff_dirty();
        }
        (updated, has_prompt)
    }

    /// Current pane content. Clears the preview dirty flag.
    pub fn preview(&self) -> Result<String> {
        if !self.started || self.status == Status::Paused {
            return Ok(String::new());
        }
        let tmux = self.tmux.as_ref().context("tmux session not initialized")?;
        let content = tmux.capture_pane_content()?;
        self.preview_dirty.store(false, Ordering::SeqCst);
        Ok(content)
    }

    /// Pane content including the full scrollback history.
    pub fn preview_full_history(&self) -> Result<String> {
        if !self.started || self.status == Status::Paused {
            return Ok(String::new());
        }
        let tmux = self.tmux.as_ref().context("tmux session not initialized")?;
        tmux.capture_pane_content_with_options("-", "-")
    }

    pub fn set_preview_size(&mut self, width: u16, height: u16) -> Result<()> {
        if !self.started || self.status == Status::Paused {
            bail!("cannot set preview size for instance that has not been started or is paused");
        }
        let tmux = self.tmux.as_ref().context("tmux session not initialized")?;
        tmux.set_detached_size(width, height)?;
        self.width = width;
        self.height = height;
        Ok(())
    }

    pub fn mark_preview_dirty(&self) {
        self.preview_dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_preview_dirty(&self) -> bool {
        self.preview_dirty.load(Ordering::SeqCst)
    }

    /// Flag the diff as stale and drop the worktree's snapshot cache so the
    /// next refresh recomputes.
    pub fn mark_diff_dirty(&self) {
        self.diff_dirty.store(true, Ordering::SeqCst);
        if let Some(worktree) = &self.worktree {
            worktree.invalidate_diff_cache();
        }
    }

    /// Refresh the diff stats if anything warrants it: the dirty flag, a
    /// forced pass (`now` = `None`), or the interval fallback. Stats are
    /// cleared for never-started instances and frozen while paused.
    pub async fn update_diff_stats(&mut self, now: Option<DateTime<Utc>>) -> Result<()> {
        if !self.started {
            self.diff_stats = None;
            return Ok(());
        }
        if self.status == Status::Paused {
            return Ok(());
        }

        let dirty = self.diff_dirty.swap(false, Ordering::SeqCst);

        let (refresh, force) = if dirty {
            // The watcher already invalidated the snapshot cache; only a
            // disabled watcher leaves a cache we cannot trust.
            (true, self.watcher_disabled)
        } else {
            match now {
                None => (true, true),
                Some(now) => {
                    let last = self.last_diff_check.load(Ordering::SeqCst);
                    let now_nanos = now.timestamp_nanos_opt().unwrap_or(0);
                    if last == 0 || now_nanos - last >= DIFF_REFRESH_INTERVAL_NANOS {
                        (true, true)
                    } else {
                        (false, false)
                    }
                }
            }
        };

        if !refresh {
            return Ok(());
        }

        let worktree = self.worktree.clone().context("git worktree not initialized")?;
        let mut stats = worktree.diff(force).await;

        if let Some(err) = stats.error.take() {
            if err.to_string().contains("base commit SHA not set") {
                // Worktree is not fully set up yet, not an error.
                self.diff_stats = None;
                self.mark_diff_dirty();
                return Ok(());
            }
            self.mark_diff_dirty();
            return Err(err.context("failed to get diff stats"));
        }

        self.diff_stats = Some(stats);
        if let Some(now) = now {
            self.last_diff_check
                .store(now.timestamp_nanos_opt().unwrap_or(0), Ordering::SeqCst);
        }
        Ok(())
    }

    async fn start_diff_watcher(&mut self) -> Result<()> {
        let Some(worktree) = self.worktree.clone() else {
            bail!("git worktree not initialized");
        };
        if worktree.worktree_path().is_empty() {
            bail!("worktree path not set");
        }

        if let Some(watcher) = self.watcher.take()
            && let Err(err) = watcher.stop().await
        {
            warn!(session = %self.title, "failed to stop existing diff watcher: {err:#}");
        }

        match DiffWatcher::spawn(worktree, Arc::clone(&self.diff_dirty), &self.title) {
            Ok(watcher) => {
                self.watcher = Some(watcher);
                self.watcher_disabled = false;
            }
            Err(err) => {
                self.watcher_disabled = true;
                warn!(session = %self.title, "disabling diff watcher: {err:#}");
            }
        }

        // Trigger an initial diff computation now that we are (possibly) watching.
        self.mark_diff_dirty();
        Ok(())
    }

    async fn stop_diff_watcher(&mut self) -> Result<()> {
        match self.watcher.take() {
            Some(watcher) => watcher.stop().await,
            None => Ok(()),
        }
    }

    /// Bare instance for tests: nothing started, no flags set.
    #[cfg(test)]
    pub(crate) fn stub(title: &str) -> Self {
        let now = Utc::now();
        Self {
            title: title.to_string(),
            path: String::new(),
            branch: String::new(),
            status: Status::Ready,
            program: String::new(),
            height: 0,
            width: 0,
            created_at: now,
            updated_at: now,
            auto_yes: false,
            prompt: String::new(),
            branch_prefix: String::new(),
            diff_stats: None,
            preview_dirty: AtomicBool::new(false),
            diff_dirty: Arc::new(AtomicBool::new(false)),
            last_diff_check: Arc::new(AtomicI64::new(0)),
            watcher: None,
            watcher_disabled: false,
            started: false,
            tmux: None,
            worktree: None,
        }
    }
}
