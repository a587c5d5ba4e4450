//! Per-source reconciliation.
//!
//! One pass of [`Reconciler::reconcile`] moves a source through
//! `Pending -> Fetching -> Ready | Error`. Fetches run as spawned tasks so a
//! pass never waits on the network: the task parks its result in a per-key
//! [`FetchSlot`] and sends the key on the completion channel, and the next
//! pass consumes the result, stores the content and writes the index.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;

use arena_core::conditions::{
    find_condition, set_condition, Reason, CONDITION_ARTIFACT_AVAILABLE, CONDITION_READY,
};
use arena_core::config::EngineConfig;
use arena_core::duration::parse_interval;
use arena_core::error::ConfigError;
use arena_core::store::{FsSourceStore, SourceStore};
use arena_core::types::{
    ArenaTemplateSource, Artifact, ArtifactStatus, ConditionStatus, Phase, SourceKey, Template,
    TemplateSourceSpec, TemplateSourceStatus,
};
use arena_fetch::{select_fetcher, validate_source, FetchContext, FetchEnv, Fetcher};
use arena_sync::{ContentStore, TemplateIndexer};

use crate::error::DaemonError;
use crate::events::{EventRecorder, EventType};

/// Upper bound on the retry delay after a store or index failure.
pub const MAX_SYNC_BACKOFF: Duration = Duration::from_secs(30);

const SETTLE_POLL: Duration = Duration::from_millis(25);

/// What the caller should do with the key after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileResult {
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    fn done() -> Self {
        Self::default()
    }

    fn after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStage {
    Fetch,
    Parse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub stage: FetchStage,
    pub message: String,
}

/// Outcome of one fetch task: an artifact with its templates, or a failure.
#[derive(Debug, Clone, Default)]
pub struct TemplateFetchResult {
    pub artifact: Option<Artifact>,
    pub templates: Vec<Template>,
    pub error: Option<FetchFailure>,
}

impl TemplateFetchResult {
    fn failed(stage: FetchStage, message: impl Into<String>) -> Self {
        Self {
            error: Some(FetchFailure {
                stage,
                message: message.into(),
            }),
            ..Self::default()
        }
    }
}

enum FetchSlot {
    InFlight {
        id: u64,
        abort: AbortHandle,
        generation: i64,
        dir: PathBuf,
    },
    Completed {
        result: TemplateFetchResult,
        generation: i64,
        dir: PathBuf,
    },
}

type Slots = Arc<Mutex<HashMap<SourceKey, FetchSlot>>>;

fn lock_slots(slots: &Mutex<HashMap<SourceKey, FetchSlot>>) -> MutexGuard<'_, HashMap<SourceKey, FetchSlot>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Builds the fetcher for a source. Tests swap this to observe or fake fetches.
pub trait FetcherFactory: Send + Sync {
    fn fetcher_for(
        &self,
        spec: &TemplateSourceSpec,
        env: &FetchEnv,
    ) -> Result<Box<dyn Fetcher>, ConfigError>;
}

/// Selects the built-in fetcher for each source type.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinFetchers;

impl FetcherFactory for BuiltinFetchers {
    fn fetcher_for(
        &self,
        spec: &TemplateSourceSpec,
        env: &FetchEnv,
    ) -> Result<Box<dyn Fetcher>, ConfigError> {
        select_fetcher(spec, env)
    }
}

pub struct Reconciler {
    store: Arc<dyn SourceStore>,
    env: FetchEnv,
    fetchers: Arc<dyn FetcherFactory>,
    content: ContentStore,
    indexer: TemplateIndexer,
    recorder: Option<Arc<dyn EventRecorder>>,
    fetch_timeout: Duration,
    slots: Slots,
    next_fetch_id: AtomicU64,
    completions: mpsc::UnboundedSender<SourceKey>,
    shutdown: Option<broadcast::Sender<()>>,
}

impl Reconciler {
    /// A reconciler and the receiving end of its completion channel. Every key
    /// received there has a finished fetch waiting to be consumed.
    pub fn new(
        store: Arc<dyn SourceStore>,
        env: FetchEnv,
        content: ContentStore,
        indexer: TemplateIndexer,
    ) -> (Self, mpsc::UnboundedReceiver<SourceKey>) {
        let (completions, completed) = mpsc::unbounded_channel();
        let reconciler = Self {
            store,
            env,
            fetchers: Arc::new(BuiltinFetchers),
            content,
            indexer,
            recorder: None,
            fetch_timeout: Duration::from_secs(300),
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_fetch_id: AtomicU64::new(1),
            completions,
            shutdown: None,
        };
        (reconciler, completed)
    }

    /// Filesystem-backed reconciler for `home`.
    pub fn from_config(
        home: &Path,
        config: &EngineConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SourceKey>) {
        let (reconciler, completed) = Self::new(
            Arc::new(FsSourceStore::new(home)),
            FetchEnv::new(home, config.work_dir.clone()),
            ContentStore::from_config(config),
            TemplateIndexer::from_config(config),
        );
        (reconciler.with_fetch_timeout(config.fetch_timeout()), completed)
    }

    pub fn with_fetchers(mut self, fetchers: Arc<dyn FetcherFactory>) -> Self {
        self.fetchers = fetchers;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Fetch tasks stop with a failure result when `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: broadcast::Sender<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// `true` while a fetch for `key` is running or its result is unconsumed.
    pub fn has_outstanding_fetch(&self, key: &SourceKey) -> bool {
        lock_slots(&self.slots).contains_key(key)
    }

    pub fn outstanding_fetches(&self) -> usize {
        lock_slots(&self.slots).len()
    }

    /// Wait up to `grace` for running fetches to park their results, then
    /// consume every parked result so no source is left in `Fetching`.
    /// Returns how many sources were settled.
    pub async fn settle_fetches(&self, grace: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let running = lock_slots(&self.slots)
                .values()
                .filter(|slot| matches!(slot, FetchSlot::InFlight { .. }))
                .count();
            if running == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(running, "fetches still running after the shutdown grace period");
                break;
            }
            tokio::time::sleep(SETTLE_POLL).await;
        }

        let parked: Vec<SourceKey> = lock_slots(&self.slots)
            .iter()
            .filter(|(_, slot)| matches!(slot, FetchSlot::Completed { .. }))
            .map(|(key, _)| key.clone())
            .collect();

        let mut settled = 0;
        for key in parked {
            match self.reconcile(&key).await {
                Ok(_) => settled += 1,
                Err(err) => {
                    tracing::warn!(source = %key, error = %err, "failed to settle fetch result");
                }
            }
        }
        settled
    }

    pub async fn reconcile(&self, key: &SourceKey) -> Result<ReconcileResult, DaemonError> {
        let store = Arc::clone(&self.store);
        let lookup = key.clone();
        let source = tokio::task::spawn_blocking(move || store.get(&lookup))
            .await
            .map_err(|e| task_error("source lookup", e))??;

        let Some(source) = source else {
            tracing::debug!(source = %key, "source not found; nothing to reconcile");
            self.drop_slot(key).await;
            return Ok(ReconcileResult::done());
        };

        let generation = source.metadata.generation;
        let now = Utc::now();
        let mut status = source.status.clone();

        if source.spec.suspend {
            self.drop_slot(key).await;
            set_condition(
                &mut status.conditions,
                CONDITION_READY,
                ConditionStatus::False,
                Reason::Suspended,
                "reconciliation is suspended",
                generation,
                now,
            );
            self.save_status(key, &source.status, status).await?;
            return Ok(ReconcileResult::done());
        }

        let interval = match validate_source(&source.spec)
            .and_then(|()| parse_interval(&source.spec.sync_interval))
        {
            Ok(interval) => interval,
            Err(err) => {
                self.drop_slot(key).await;
                return self.fail_configuration(&source, status, &err, now).await;
            }
        };

        match self.take_result(key) {
            SlotState::Running => {
                tracing::debug!(source = %key, "fetch in flight");
                return Ok(ReconcileResult::done());
            }
            SlotState::Done {
                result,
                generation: fetched,
                dir,
            } => {
                if fetched == generation {
                    let outcome = self.apply_result(&source, status, result, interval, now).await;
                    remove_scratch(&dir).await;
                    return outcome;
                }
                tracing::debug!(
                    source = %key,
                    fetched,
                    generation,
                    "discarding fetch result for an older generation"
                );
                remove_scratch(&dir).await;
            }
            SlotState::Empty => {}
        }

        if status.phase() == Phase::Ready && status.observed_generation == generation {
            if let Some(last) = status.last_fetch_time {
                let elapsed = (now - last).to_std().unwrap_or_default();
                if elapsed < interval {
                    return Ok(ReconcileResult::after(interval - elapsed));
                }
            }
        }

        let fetcher = match self.fetchers.fetcher_for(&source.spec, &self.env) {
            Ok(fetcher) => fetcher,
            Err(err) => return self.fail_configuration(&source, status, &err, now).await,
        };
        let kind = fetcher.kind();
        let ctx = self.env.context(key);
        tracing::info!(source = %key, kind, generation, "dispatching fetch");
        self.spawn_fetch(key, generation, fetcher, ctx);

        status.phase = Some(Phase::Fetching);
        status.observed_generation = generation;
        set_condition(
            &mut status.conditions,
            CONDITION_READY,
            ConditionStatus::False,
            Reason::Fetching,
            format!("fetching from {kind} source"),
            generation,
            now,
        );
        self.save_status(key, &source.status, status).await?;
        Ok(ReconcileResult::done())
    }

    fn spawn_fetch(
        &self,
        key: &SourceKey,
        generation: i64,
        fetcher: Box<dyn Fetcher>,
        ctx: FetchContext,
    ) {
        let id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let dir = ctx.dir.clone();
        let slots = Arc::clone(&self.slots);
        let completions = self.completions.clone();
        let timeout = self.fetch_timeout;
        let mut shutdown = self.shutdown.as_ref().map(broadcast::Sender::subscribe);
        let task_key = key.clone();
        let task_dir = dir.clone();

        // The slot is registered before the task can report back.
        let mut guard = lock_slots(&self.slots);
        let handle = tokio::spawn(async move {
            let result = tokio::select! {
                outcome = tokio::time::timeout(timeout, run_fetch(fetcher.as_ref(), &ctx)) => {
                    match outcome {
                        Ok(result) => result,
                        Err(_) => TemplateFetchResult::failed(
                            FetchStage::Fetch,
                            format!("fetch timed out after {}s", timeout.as_secs()),
                        ),
                    }
                }
                () = wait_for_shutdown(&mut shutdown) => {
                    TemplateFetchResult::failed(FetchStage::Fetch, "fetch cancelled: daemon shutting down")
                }
            };

            let mut slots = lock_slots(&slots);
            let current = matches!(
                slots.get(&task_key),
                Some(FetchSlot::InFlight { id: running, .. }) if *running == id
            );
            if !current {
                return;
            }
            slots.insert(
                task_key.clone(),
                FetchSlot::Completed {
                    result,
                    generation,
                    dir: task_dir,
                },
            );
            drop(slots);
            if completions.send(task_key).is_err() {
                tracing::debug!("completion channel closed; result stays parked");
            }
        });
        guard.insert(
            key.clone(),
            FetchSlot::InFlight {
                id,
                abort: handle.abort_handle(),
                generation,
                dir,
            },
        );
    }

    /// Remove the key's result from its slot, leaving a running fetch alone.
    fn take_result(&self, key: &SourceKey) -> SlotState {
        let mut slots = lock_slots(&self.slots);
        match slots.get(key) {
            None => SlotState::Empty,
            Some(FetchSlot::InFlight { .. }) => SlotState::Running,
            Some(FetchSlot::Completed { .. }) => match slots.remove(key) {
                Some(FetchSlot::Completed {
                    result,
                    generation,
                    dir,
                }) => SlotState::Done {
                    result,
                    generation,
                    dir,
                },
                _ => SlotState::Empty,
            },
        }
    }

    /// Forget any fetch for `key`, aborting it if it is still running.
    async fn drop_slot(&self, key: &SourceKey) {
        let removed = lock_slots(&self.slots).remove(key);
        let dir = match removed {
            Some(FetchSlot::InFlight { abort, dir, .. }) => {
                tracing::debug!(source = %key, "aborting in-flight fetch");
                abort.abort();
                dir
            }
            Some(FetchSlot::Completed { dir, .. }) => dir,
            None => return,
        };
        remove_scratch(&dir).await;
    }

    async fn apply_result(
        &self,
        source: &ArenaTemplateSource,
        mut status: TemplateSourceStatus,
        result: TemplateFetchResult,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<ReconcileResult, DaemonError> {
        let key = source.key();
        let generation = source.metadata.generation;
        status.observed_generation = generation;
        status.last_fetch_time = Some(now);

        let artifact = match (result.error, result.artifact) {
            (Some(failure), _) => {
                let reason = match failure.stage {
                    FetchStage::Fetch => Reason::FetchFailed,
                    FetchStage::Parse => Reason::ParseFailed,
                };
                self.mark_error(&key, &mut status, reason, failure.message, generation, now);
                self.save_status(&key, &source.status, status).await?;
                return Ok(ReconcileResult::after(interval));
            }
            (None, None) => {
                self.mark_error(
                    &key,
                    &mut status,
                    Reason::FetchFailed,
                    "fetch produced no artifact".to_string(),
                    generation,
                    now,
                );
                self.save_status(&key, &source.status, status).await?;
                return Ok(ReconcileResult::after(interval));
            }
            (None, Some(artifact)) => artifact,
        };

        let backoff = interval.min(MAX_SYNC_BACKOFF);
        let workspace = source.workspace().to_string();
        let namespace = key.namespace.0.clone();
        let target = source.target_path();

        let content = self.content.clone();
        let synced = {
            let (workspace, namespace, target, artifact) =
                (workspace.clone(), namespace.clone(), target.clone(), artifact.clone());
            tokio::task::spawn_blocking(move || {
                content.sync(&workspace, &namespace, &target, &artifact)
            })
            .await
            .map_err(|e| task_error("content sync", e))?
        };
        let synced = match synced {
            Ok(synced) => synced,
            Err(err) => {
                self.mark_error(&key, &mut status, Reason::SyncFailed, err.to_string(), generation, now);
                self.save_status(&key, &source.status, status).await?;
                return Ok(ReconcileResult::after(backoff));
            }
        };

        let indexer = self.indexer.clone();
        let templates = result.templates;
        let indexed = {
            let (workspace, namespace, name, templates) = (
                workspace.clone(),
                namespace.clone(),
                key.name.0.clone(),
                templates.clone(),
            );
            tokio::task::spawn_blocking(move || {
                indexer.write_index(&workspace, &namespace, &name, &templates)
            })
            .await
            .map_err(|e| task_error("index write", e))?
        };
        if let Err(err) = indexed {
            self.mark_error(&key, &mut status, Reason::IndexFailed, err.to_string(), generation, now);
            self.save_status(&key, &source.status, status).await?;
            return Ok(ReconcileResult::after(backoff));
        }

        let message = format!(
            "stored version {} with {} template(s)",
            synced.version,
            templates.len()
        );
        status.phase = Some(Phase::Ready);
        status.templates = templates;
        status.head_version = Some(synced.version.clone());
        status.message = None;
        status.artifact = Some(ArtifactStatus {
            revision: artifact.revision.clone(),
            checksum: artifact.checksum.clone(),
            version: synced.version.clone(),
            content_path: synced.content_path.clone(),
            size: artifact.size,
            last_update_time: now,
        });
        set_condition(
            &mut status.conditions,
            CONDITION_READY,
            ConditionStatus::True,
            Reason::Synced,
            message.clone(),
            generation,
            now,
        );
        set_condition(
            &mut status.conditions,
            CONDITION_ARTIFACT_AVAILABLE,
            ConditionStatus::True,
            Reason::Synced,
            format!("revision {}", artifact.revision),
            generation,
            now,
        );
        tracing::info!(
            source = %key,
            version = %synced.version,
            reused = synced.reused,
            templates = status.templates.len(),
            "source synced"
        );
        self.record(&key, EventType::Normal, Reason::Synced, &message);
        self.save_status(&key, &source.status, status).await?;
        Ok(ReconcileResult::after(interval))
    }

    async fn fail_configuration(
        &self,
        source: &ArenaTemplateSource,
        mut status: TemplateSourceStatus,
        err: &ConfigError,
        now: DateTime<Utc>,
    ) -> Result<ReconcileResult, DaemonError> {
        let key = source.key();
        let generation = source.metadata.generation;
        status.observed_generation = generation;
        self.mark_error(
            &key,
            &mut status,
            Reason::ConfigurationError,
            err.to_string(),
            generation,
            now,
        );
        self.save_status(&key, &source.status, status).await?;
        Ok(ReconcileResult::done())
    }

    fn mark_error(
        &self,
        key: &SourceKey,
        status: &mut TemplateSourceStatus,
        reason: Reason,
        message: String,
        generation: i64,
        now: DateTime<Utc>,
    ) {
        let repeated = status.phase() == Phase::Error
            && find_condition(&status.conditions, CONDITION_READY)
                .map(|c| c.reason == reason.as_str() && c.message == message)
                .unwrap_or(false);

        tracing::warn!(source = %key, %reason, "{message}");
        status.phase = Some(Phase::Error);
        set_condition(
            &mut status.conditions,
            CONDITION_READY,
            ConditionStatus::False,
            reason,
            message.clone(),
            generation,
            now,
        );
        if !repeated {
            self.record(key, EventType::Warning, reason, &message);
        }
        status.message = Some(message);
    }

    fn record(&self, key: &SourceKey, event_type: EventType, reason: Reason, message: &str) {
        if let Some(recorder) = &self.recorder {
            recorder.record(key, event_type, reason, message);
        }
    }

    /// Persist `after` unless it equals the status the pass started from.
    async fn save_status(
        &self,
        key: &SourceKey,
        before: &TemplateSourceStatus,
        after: TemplateSourceStatus,
    ) -> Result<(), DaemonError> {
        if *before == after {
            return Ok(());
        }
        let store = Arc::clone(&self.store);
        let key = key.clone();
        tokio::task::spawn_blocking(move || store.update_status(&key, &after))
            .await
            .map_err(|e| task_error("status write", e))??;
        Ok(())
    }
}

enum SlotState {
    Empty,
    Running,
    Done {
        result: TemplateFetchResult,
        generation: i64,
        dir: PathBuf,
    },
}

async fn run_fetch(fetcher: &dyn Fetcher, ctx: &FetchContext) -> TemplateFetchResult {
    let artifact = match fetcher.fetch(ctx).await {
        Ok(artifact) => artifact,
        Err(err) => return TemplateFetchResult::failed(FetchStage::Fetch, err.to_string()),
    };

    let root = artifact.path.clone();
    match tokio::task::spawn_blocking(move || arena_templates::discover_templates(&root)).await {
        Ok(Ok(templates)) => TemplateFetchResult {
            artifact: Some(artifact),
            templates,
            error: None,
        },
        Ok(Err(err)) => TemplateFetchResult::failed(FetchStage::Parse, err.to_string()),
        Err(err) => TemplateFetchResult::failed(
            FetchStage::Parse,
            format!("template discovery task failed: {err}"),
        ),
    }
}

async fn wait_for_shutdown(shutdown: &mut Option<broadcast::Receiver<()>>) {
    match shutdown {
        Some(rx) => {
            let _ = rx.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn remove_scratch(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(path = %dir.display(), error = %err, "failed to remove fetch scratch dir");
        }
    }
}

fn task_error(task: &'static str, err: tokio::task::JoinError) -> DaemonError {
    DaemonError::Task {
        task,
        message: err.to_string(),
    }
}
