//! Debounced persistence for the session registry.
//!
//! The byte store underneath is pluggable; this layer owns the canonical
//! serialization, content-based write dedup, and the debounce timer with its
//! synchronous flush escape hatch.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::instance::{Instance, Status};

/// Minimum wall-clock gap between consecutive writes of changed state.
pub const DEFAULT_SAVE_DEBOUNCE: Duration = Duration::from_secs(5);

/// Byte sink the registry persists into. Bytes are opaque to the store.
pub trait InstanceStore: Send + Sync {
    fn save_instances(&self, data: &[u8]) -> Result<()>;
    fn get_instances(&self) -> Vec<u8>;
    fn delete_all_instances(&self) -> Result<()>;
}

/// Serializable form of an [`Instance`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceData {
    pub title: String,
    pub path: String,
    pub branch: String,
    pub status: Status,
    pub height: u16,
    pub width: u16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub auto_yes: bool,
    pub program: String,
    pub worktree: WorktreeData,
    pub diff_stats: DiffStatsData,
}

/// Serializable form of a worktree handle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorktreeData {
    pub repo_path: String,
    pub worktree_path: String,
    pub session_name: String,
    pub branch_name: String,
    pub base_commit_sha: String,
}

/// Serializable form of the last computed diff.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffStatsData {
    pub added: usize,
    pub removed: usize,
    pub content: String,
}

#[derive(Default)]
struct DebounceState {
    last_saved: Option<Vec<u8>>,
    last_save_time: Option<Instant>,
    pending: Option<Vec<u8>>,
    timer: Option<JoinHandle<()>>,
}

/// Saves and loads instances through an [`InstanceStore`], deduplicating
/// identical payloads and debouncing bursts of writes.
pub struct Storage {
    store: Arc<dyn InstanceStore>,
    debounce_interval: Duration,
    state: Mutex<DebounceState>,
}

impl Storage {
    pub fn new(store: Arc<dyn InstanceStore>) -> Arc<Self> {
        Self::with_debounce_interval(store, DEFAULT_SAVE_DEBOUNCE)
    }

    pub fn with_debounce_interval(
        store: Arc<dyn InstanceStore>,
        debounce_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            debounce_interval,
            state: Mutex::new(DebounceState::default()),
        })
    }

    /// Persist the current list. Only started instances are serialized. An
    /// unchanged payload with nothing pending is a no-op; a payload arriving
    /// within the debounce window is parked and written by a one-shot timer.
    pub fn save_instances(self: &Arc<Self>, instances: &[Instance]) -> Result<()> {
        let data: Vec<InstanceData> = instances
            .iter()
            .filter(|instance| instance.started())
            .map(Instance::to_data)
            .collect();
        self.save_data(&data)
    }

    fn save_data(self: &Arc<Self>, data: &[InstanceData]) -> Result<()> {
        let bytes = serde_json::to_vec(data).context("failed to serialize instances")?;

        let mut state = self.state.lock().unwrap();

        if state.last_saved.as_deref() == Some(bytes.as_slice()) && state.pending.is_none() {
            return Ok(());
        }

        let now = Instant::now();
        let due = state
            .last_save_time
            .is_none_or(|last| now.duration_since(last) >= self.debounce_interval);

        if due {
            self.store.save_instances(&bytes)?;
            state.last_saved = Some(bytes);
            state.last_save_time = Some(now);
            state.pending = None;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            return Ok(());
        }

        state.pending = Some(bytes);
        if state.timer.is_none() {
            let delay = match state.last_save_time {
                Some(last) => self
                    .debounce_interval
                    .saturating_sub(now.duration_since(last))
                    .max(Duration::from_secs(1)),
                None => Duration::from_secs(1),
            };
            state.timer = Some(self.arm_timer(delay));
        }

        Ok(())
    }

    fn arm_timer(self: &Arc<Self>, delay: Duration) -> JoinHandle<()> {
        let storage = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            storage.flush_pending();
        })
    }

    /// Deferred-write callback. On failure the pending buffer survives and
    /// the timer re-arms.
    fn flush_pending(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        state.timer = None;

        let Some(pending) = state.pending.clone() else {
            return;
        };

        match self.store.save_instances(&pending) {
            Ok(()) => {
                state.last_saved = Some(pending);
                state.last_save_time = Some(Instant::now());
                state.pending = None;
            }
            Err(err) => {
                warn!("failed to flush pending instances: {err:#}");
                state.timer = Some(self.arm_timer(self.debounce_interval));
            }
        }
    }

    /// Write any pending state synchronously. The crash-safety hook; call it
    /// before process exit.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        let Some(pending) = state.pending.clone() else {
            return Ok(());
        };

        self.store.save_instances(&pending)?;
        state.last_saved = Some(pending);
        state.last_save_time = Some(Instant::now());
        state.pending = None;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        Ok(())
    }

    /// Load all persisted instances, re-binding their resources. Paused
    /// records come back cold; everything else restores its pane.
    pub async fn load_instances(&self) -> Result<Vec<Instance>> {
        let bytes = self.store.get_instances();
        let records: Vec<InstanceData> =
            serde_json::from_slice(&bytes).context("failed to deserialize instances")?;

        let mut instances = Vec::with_capacity(records.len());
        for record in records {
            let title = record.title.clone();
            let instance = Instance::from_data(record)
                .await
                .with_context(|| format!("failed to restore instance {title}"))?;
            instances.push(instance);
        }
        Ok(instances)
    }

    /// Remove one instance from storage by title.
    pub async fn delete_instance(self: &Arc<Self>, title: &str) -> Result<()> {
        let instances = self
            .load_instances()
            .await
            .context("failed to load instances")?;

        if !instances.iter().any(|instance| instance.title == title) {
            bail!("instance not found: {title}");
        }

        let data: Vec<InstanceData> = instances
            .iter()
            .filter(|instance| instance.title != title && instance.started())
            .map(Instance::to_data)
            .collect();
        self.save_data(&data)
    }

    /// Replace a stored instance with the given one, matched by title.
    pub async fn update_instance(self: &Arc<Self>, instance: &Instance) -> Result<()> {
        let instances = self
            .load_instances()
            .await
            .context("failed to load instances")?;

        if !instances
            .iter()
            .any(|existing| existing.title == instance.title)
        {
            bail!("instance not found: {}", instance.title);
        }

        let data: Vec<InstanceData> = instances
            .iter()
            .map(|existing| {
                if existing.title == instance.title {
                    instance
                } else {
                    existing
                }
            })
            .filter(|candidate| candidate.started())
            .map(|candidate| candidate.to_data())
            .collect();
        self.save_data(&data)
    }

    /// Drop every stored instance.
    pub fn delete_all_instances(&self) -> Result<()> {
        self.store.delete_all_instances()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::Result;
    use chrono::Utc;

    use super::{InstanceData, InstanceStore, Storage, WorktreeData};
    use crate::instance::{Instance, Status};

    #[derive(Default)]
    struct FakeInstanceStore {
        writes: Mutex<Vec<Vec<u8>>>,
        contents: Mutex<Vec<u8>>,
    }

    impl FakeInstanceStore {
        fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }

        fn last_write(&self) -> Vec<u8> {
            self.writes.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    impl InstanceStore for FakeInstanceStore {
        fn save_instances(&self, data: &[u8]) -> Result<()> {
            self.writes.lock().unwrap().push(data.to_vec());
            *self.contents.lock().unwrap() = data.to_vec();
            Ok(())
        }

        fn get_instances(&self) -> Vec<u8> {
            let contents = self.contents.lock().unwrap();
            if contents.is_empty() {
                b"[]".to_vec()
            } else {
                contents.clone()
            }
        }

        fn delete_all_instances(&self) -> Result<()> {
            *self.contents.lock().unwrap() = b"[]".to_vec();
            Ok(())
        }
    }

    fn paused_record(title: &str) -> InstanceData {
        let now = Utc::now();
        InstanceData {
            title: title.to_string(),
            path: "/repo".into(),
            branch: "corral/example".into(),
            status: Status::Paused,
            height: 0,
            width: 0,
            created_at: now,
            updated_at: now,
            auto_yes: false,
            program: "claude".into(),
            worktree: WorktreeData {
                repo_path: "/repo".into(),
                worktree_path: "/repo-worktrees/example".into(),
                session_name: title.to_string(),
                branch_name: "corral/example".into(),
                base_commit_sha: "abc123".into(),
            },
            diff_stats: Default::default(),
        }
    }

    #[tokio::test]
    async fn debounce_and_flush() {
        let store = Arc::new(FakeInstanceStore::default());
        let storage = Storage::with_debounce_interval(store.clone(), Duration::from_millis(50));

        storage.save_instances(&[]).expect("initial save");
        assert_eq!(store.write_count(), 1, "expected initial write");

        storage.save_instances(&[]).expect("identical save");
        assert_eq!(
            store.write_count(),
            1,
            "identical payload should not write again"
        );

        let mut instance = Instance::stub("example");
        instance.started = true;
        storage
            .save_instances(&[instance])
            .expect("pending save");
        assert_eq!(store.write_count(), 1, "changed payload should be deferred");
        assert!(
            storage.state.lock().unwrap().pending.is_some(),
            "expected pending data to be queued"
        );

        storage.flush().expect("flush");
        assert_eq!(store.write_count(), 2, "flush should write pending data");
        let state = storage.state.lock().unwrap();
        assert!(state.pending.is_none(), "pending cleared after flush");
        assert!(state.timer.is_none(), "timer cleared after flush");
    }

    #[tokio::test]
    async fn flush_without_pending_is_a_noop() {
        let store = Arc::new(FakeInstanceStore::default());
        let storage = Storage::new(store.clone());

        storage.flush().expect("flush");
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn only_started_instances_are_serialized() {
        let store = Arc::new(FakeInstanceStore::default());
        let storage = Storage::with_debounce_interval(store.clone(), Duration::from_millis(1));

        let started = {
            let mut instance = Instance::stub("started");
            instance.started = true;
            instance
        };
        let unstarted = Instance::stub("unstarted");

        storage
            .save_instances(&[started, unstarted])
            .expect("save");

        let written: Vec<InstanceData> =
            serde_json::from_slice(&store.last_write()).expect("parse written payload");
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].title, "started");
    }

    #[tokio::test]
    async fn serialized_record_uses_fixed_keys_and_numeric_status() {
        let record = paused_record("shape");
        let value = serde_json::to_value(&record).expect("serialize record");

        assert_eq!(value["status"], 3);
        assert_eq!(value["worktree"]["base_commit_sha"], "abc123");
        assert_eq!(value["diff_stats"]["added"], 0);
        assert!(value["created_at"].is_string());
    }

    #[tokio::test]
    async fn delete_instance_filters_by_title() {
        let store = Arc::new(FakeInstanceStore::default());
        let bytes = serde_json::to_vec(&[paused_record("keep"), paused_record("drop")])
            .expect("serialize seed");
        store.save_instances(&bytes).expect("seed store");

        let storage = Storage::with_debounce_interval(store.clone(), Duration::from_millis(1));

        let err = storage
            .delete_instance("missing")
            .await
            .expect_err("unknown title should fail");
        assert!(format!("{err}").contains("instance not found: missing"));

        tokio::time::sleep(Duration::from_millis(5)).await;
        storage.delete_instance("drop").await.expect("delete");
        storage.flush().expect("flush");

        let remaining: Vec<InstanceData> =
            serde_json::from_slice(&store.last_write()).expect("parse remaining");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].title, "keep");
    }

    #[tokio::test]
    async fn update_instance_replaces_matching_title() {
        let store = Arc::new(FakeInstanceStore::default());
        let bytes = serde_json::to_vec(&[paused_record("target")]).expect("serialize seed");
        store.save_instances(&bytes).expect("seed store");

        let storage = Storage::with_debounce_interval(store.clone(), Duration::from_millis(1));

        let mut instances = storage.load_instances().await.expect("load");
        assert_eq!(instances.len(), 1);
        instances[0].height = 42;

        tokio::time::sleep(Duration::from_millis(5)).await;
        storage
            .update_instance(&instances[0])
            .await
            .expect("update");
        storage.flush().expect("flush");

        let written: Vec<InstanceData> =
            serde_json::from_slice(&store.last_write()).expect("parse written payload");
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].height, 42);
    }

    #[tokio::test]
    async fn load_restores_paused_instances_without_resources() {
        let store = Arc::new(FakeInstanceStore::default());
        let bytes = serde_json::to_vec(&[paused_record("sleeper")]).expect("serialize seed");
        store.save_instances(&bytes).expect("seed store");

        let storage = Storage::new(store);
        let instances = storage.load_instances().await.expect("load");

        assert_eq!(instances.len(), 1);
        let instance = &instances[0];
        assert!(instance.started());
        assert!(instance.paused());
        assert_eq!(instance.branch, "corral/example");
    }
}
