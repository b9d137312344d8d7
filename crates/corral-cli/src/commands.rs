//! Command handlers behind the CLI surface.
//!
//! Every handler builds the storage layer, does its work, and flushes
//! pending writes before returning so nothing is lost on process exit.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use corral_session::instance::{Instance, InstanceOptions};
use corral_session::storage::Storage;
use tracing::warn;

use crate::config::{self, Config, Paths};
use crate::state::AppState;

fn open_storage() -> Result<(Config, Arc<Storage>)> {
    let paths = Paths::create()?;
    let config = config::load_config(&paths.config_file)?;
    let store = Arc::new(AppState::new(&paths));
    let storage =
        Storage::with_debounce_interval(store, Duration::from_millis(config.save_debounce_ms));
    Ok((config, storage))
}

fn find_instance<'a>(instances: &'a mut [Instance], title: &str) -> Result<&'a mut Instance> {
    instances
        .iter_mut()
        .find(|instance| instance.title == title)
        .with_context(|| format!("instance not found: {title}"))
}

/// Options for `corral new`.
pub struct NewSessionOptions {
    pub title: String,
    pub path: String,
    pub program: Option<String>,
    pub auto_yes: bool,
    pub prompt: Option<String>,
}

/// Create a session, start its agent, and persist it.
pub async fn new_session(opts: NewSessionOptions) -> Result<()> {
    let (config, storage) = open_storage()?;

    let mut instances = storage.load_instances().await?;
    if instances
        .iter()
        .any(|instance| instance.title == opts.title)
    {
        bail!("a session named '{}' already exists", opts.title);
    }

    let mut instance = Instance::new(InstanceOptions {
        title: opts.title,
        path: opts.path,
        program: opts.program.unwrap_or(config.default_program),
        auto_yes: opts.auto_yes || config.auto_yes,
        branch_prefix: config.branch_prefix,
    })?;
    instance.prompt = opts.prompt.unwrap_or_default();

    instance.start(true).await?;

    if !instance.prompt.is_empty() {
        let prompt = std::mem::take(&mut instance.prompt);
        instance.send_prompt(&prompt).await?;
    }

    let branch = instance.get_branch();
    println!("started session '{}' on branch {}", instance.title, branch);

    instances.push(instance);
    storage.save_instances(&instances)?;
    storage.flush()?;
    Ok(())
}

/// List sessions with their status, branch, and diff counts. Also services
/// auto-yes prompts and refreshes diff stats along the way.
pub async fn list_sessions() -> Result<()> {
    let (_config, storage) = open_storage()?;

    let mut instances = storage.load_instances().await?;
    if instances.is_empty() {
        println!("no sessions");
        return Ok(());
    }

    println!(
        "{:<20} {:<8} {:<28} {:<16} {:>12}",
        "TITLE", "STATUS", "BRANCH", "REPO", "DIFF"
    );
    for instance in &mut instances {
        let (_changed, has_prompt) = instance.has_updated();
        if has_prompt {
            instance.tap_enter();
        }
        if let Err(err) = instance.update_diff_stats(Some(Utc::now())).await {
            warn!(session = %instance.title, "failed to update diff stats: {err:#}");
        }

        let diff = instance
            .get_diff_stats()
            .map(|stats| format!("+{} -{}", stats.added, stats.removed))
            .unwrap_or_else(|| "-".into());
        let repo = instance.repo_name().unwrap_or_default();
        let branch = instance.get_branch();
        println!(
            "{:<20} {:<8} {:<28} {:<16} {:>12}",
            instance.title,
            instance.status.label(),
            branch,
            repo,
            diff
        );
    }

    storage.save_instances(&instances)?;
    storage.flush()?;
    Ok(())
}

/// Attach the terminal to a session's pane and wait until the user detaches.
pub async fn attach_session(title: &str) -> Result<()> {
    let (_config, storage) = open_storage()?;

    let mut instances = storage.load_instances().await?;
    let done = {
        let instance = find_instance(&mut instances, title)?;
        instance.attach().await?
    };
    let _ = done.await;

    storage.save_instances(&instances)?;
    storage.flush()?;
    Ok(())
}

/// Print a snapshot of a session's pane without attaching.
pub async fn peek_session(title: &str, history: bool, width: u16, height: u16) -> Result<()> {
    let (_config, storage) = open_storage()?;

    let mut instances = storage.load_instances().await?;
    let instance = find_instance(&mut instances, title)?;

    instance.ensure_tmux_session()?;
    instance.set_preview_size(width, height)?;
    let content = if history {
        instance.preview_full_history()?
    } else {
        instance.preview()?
    };
    println!("{content}");

    storage.save_instances(&instances)?;
    storage.flush()?;
    Ok(())
}

/// Pause a session: commit outstanding work, detach the pane, drop the
/// worktree. The branch stays.
pub async fn pause_session(title: &str) -> Result<()> {
    let (_config, storage) = open_storage()?;

    let mut instances = storage.load_instances().await?;
    {
        let instance = find_instance(&mut instances, title)?;
        instance.pause().await?;
        let branch = instance.get_branch();
        println!(
            "paused session '{}'; branch {} is preserved",
            instance.title, branch
        );
    }

    storage.save_instances(&instances)?;
    storage.flush()?;
    Ok(())
}

/// Resume a paused session.
pub async fn resume_session(title: &str) -> Result<()> {
    let (_config, storage) = open_storage()?;

    let mut instances = storage.load_instances().await?;
    {
        let instance = find_instance(&mut instances, title)?;
        instance.resume().await?;
        println!("resumed session '{}'", instance.title);
    }

    storage.save_instances(&instances)?;
    storage.flush()?;
    Ok(())
}

/// Kill a session and remove it from storage.
pub async fn kill_session(title: &str) -> Result<()> {
    let (_config, storage) = open_storage()?;

    let mut instances = storage.load_instances().await?;
    let position = instances
        .iter()
        .position(|instance| instance.title == title)
        .with_context(|| format!("instance not found: {title}"))?;

    let mut instance = instances.remove(position);
    instance.kill().await?;
    println!("killed session '{}'", instance.title);

    storage.save_instances(&instances)?;
    storage.flush()?;
    Ok(())
}

/// Kill every session and clear storage.
pub async fn reset_sessions() -> Result<()> {
    let (_config, storage) = open_storage()?;

    match storage.load_instances().await {
        Ok(mut instances) => {
            for instance in &mut instances {
                if let Err(err) = instance.kill().await {
                    warn!(session = %instance.title, "failed to kill session: {err:#}");
                }
            }
        }
        Err(err) => {
            warn!("failed to load instances for reset: {err:#}");
        }
    }

    storage.delete_all_instances()?;
    println!("removed all sessions");
    Ok(())
}
