//! Reconciliation passes against a temp home with config-store sources.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;

use arena_core::conditions::{find_condition, Reason, CONDITION_ARTIFACT_AVAILABLE, CONDITION_READY};
use arena_core::config::{load_at, EngineConfig};
use arena_core::error::ConfigError;
use arena_core::store::{delete_source_at, load_source_at, save_source_at};
use arena_core::types::{
    ArenaTemplateSource, Artifact, ConditionStatus, ConfigStoreSource, ObjectMeta, Phase,
    SourceKey, SourceType, TemplateSourceSpec, TemplateSourceStatus,
};
use arena_daemon::{
    BuiltinFetchers, EventRecorder, EventType, FetcherFactory, Reconciler, MAX_SYNC_BACKOFF,
};
use arena_fetch::{FetchContext, FetchEnv, FetchError, Fetcher};
use arena_sync::TemplateIndexer;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const STARTER_STORE: &str = r#"
revision: "3"
data:
  chat/template.yaml: |
    name: chat
    description: Chat starter
  chat/prompt.md: You are helpful.
"#;

fn key() -> SourceKey {
    SourceKey::new("team-a", "starter")
}

fn config_store_source(generation: i64) -> ArenaTemplateSource {
    ArenaTemplateSource {
        metadata: ObjectMeta {
            name: "starter".into(),
            namespace: "team-a".into(),
            workspace: None,
            generation,
        },
        spec: TemplateSourceSpec {
            source_type: SourceType::ConfigStore,
            config_store: Some(ConfigStoreSource {
                name: "starter".to_string(),
                key_prefix: None,
            }),
            ..TemplateSourceSpec::default()
        },
        status: TemplateSourceStatus::default(),
    }
}

fn write_store(home: &Path, contents: &str) {
    let path = home.join(".arena/configstores/team-a/starter.yaml");
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, contents).expect("write config store");
}

fn status(home: &Path) -> TemplateSourceStatus {
    load_source_at(home, &key())
        .expect("load")
        .expect("source exists")
        .status
}

fn ready_reason(status: &TemplateSourceStatus) -> (ConditionStatus, String) {
    let ready = find_condition(&status.conditions, CONDITION_READY).expect("Ready condition");
    (ready.status, ready.reason.clone())
}

#[derive(Default)]
struct Recorded(Mutex<Vec<(EventType, Reason)>>);

impl Recorded {
    fn events(&self) -> Vec<(EventType, Reason)> {
        self.0.lock().expect("lock").clone()
    }
}

impl EventRecorder for Recorded {
    fn record(&self, _key: &SourceKey, event_type: EventType, reason: Reason, _message: &str) {
        self.0.lock().expect("lock").push((event_type, reason));
    }
}

/// Counts how many fetchers were built before delegating to the real ones.
#[derive(Default)]
struct Counting(AtomicUsize);

impl FetcherFactory for Counting {
    fn fetcher_for(
        &self,
        spec: &TemplateSourceSpec,
        env: &FetchEnv,
    ) -> Result<Box<dyn Fetcher>, ConfigError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        BuiltinFetchers.fetcher_for(spec, env)
    }
}

/// A fetcher that never finishes on its own.
struct Stalled;

#[async_trait]
impl Fetcher for Stalled {
    fn kind(&self) -> &'static str {
        "stalled"
    }

    async fn fetch(&self, _ctx: &FetchContext) -> Result<Artifact, FetchError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(FetchError::Task("unreachable".into()))
    }
}

struct AlwaysStalled;

impl FetcherFactory for AlwaysStalled {
    fn fetcher_for(
        &self,
        _spec: &TemplateSourceSpec,
        _env: &FetchEnv,
    ) -> Result<Box<dyn Fetcher>, ConfigError> {
        Ok(Box::new(Stalled))
    }
}

struct Harness {
    home: TempDir,
    config: EngineConfig,
    reconciler: Reconciler,
    completed: UnboundedReceiver<SourceKey>,
    recorded: Arc<Recorded>,
}

fn harness() -> Harness {
    let home = TempDir::new().expect("home");
    let config = load_at(home.path()).expect("default config");
    let (reconciler, completed) = Reconciler::from_config(home.path(), &config);
    let recorded = Arc::new(Recorded::default());
    let reconciler = reconciler.with_recorder(recorded.clone());
    Harness {
        home,
        config,
        reconciler,
        completed,
        recorded,
    }
}

async fn wait_for_completion(completed: &mut UnboundedReceiver<SourceKey>) -> SourceKey {
    tokio::time::timeout(Duration::from_secs(10), completed.recv())
        .await
        .expect("fetch completed in time")
        .expect("completion channel open")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_source_is_a_no_op() {
    let h = harness();

    let result = h.reconciler.reconcile(&key()).await.expect("reconcile");
    assert_eq!(result.requeue_after, None);
    assert!(!h.reconciler.has_outstanding_fetch(&key()));

    let entries: Vec<_> = fs::read_dir(h.home.path()).expect("read home").collect();
    assert!(entries.is_empty(), "reconciling a missing source must not touch the filesystem");
}

#[tokio::test]
async fn suspended_source_never_fetches() {
    let h = harness();
    let counting = Arc::new(Counting::default());
    let reconciler = h.reconciler.with_fetchers(counting.clone());

    let mut source = config_store_source(1);
    source.spec.suspend = true;
    save_source_at(h.home.path(), &source).expect("save");
    write_store(h.home.path(), STARTER_STORE);

    let result = reconciler.reconcile(&key()).await.expect("reconcile");
    assert_eq!(result.requeue_after, None);
    assert_eq!(counting.0.load(Ordering::SeqCst), 0);
    assert!(!reconciler.has_outstanding_fetch(&key()));

    let status = status(h.home.path());
    assert_eq!(status.phase, None, "suspend leaves the phase untouched");
    assert_eq!(
        ready_reason(&status),
        (ConditionStatus::False, "Suspended".to_string())
    );
}

#[tokio::test]
async fn invalid_configuration_is_terminal() {
    let h = harness();
    let mut source = config_store_source(4);
    source.spec.source_type = SourceType::Registry;
    source.spec.config_store = None;
    save_source_at(h.home.path(), &source).expect("save");

    let result = h.reconciler.reconcile(&key()).await.expect("reconcile");
    assert_eq!(result.requeue_after, None, "configuration errors are not retried on a timer");

    let status = status(h.home.path());
    assert_eq!(status.phase, Some(Phase::Error));
    assert_eq!(status.observed_generation, 4);
    assert_eq!(
        ready_reason(&status),
        (ConditionStatus::False, "ConfigurationError".to_string())
    );
    assert_eq!(
        h.recorded.events(),
        vec![(EventType::Warning, Reason::ConfigurationError)]
    );

    // A second pass over the same error neither rewrites nor re-reports it.
    h.reconciler.reconcile(&key()).await.expect("reconcile again");
    assert_eq!(h.recorded.events().len(), 1);
}

#[tokio::test]
async fn unparseable_interval_is_a_configuration_error() {
    let h = harness();
    let mut source = config_store_source(1);
    source.spec.sync_interval = "soon".to_string();
    save_source_at(h.home.path(), &source).expect("save");

    h.reconciler.reconcile(&key()).await.expect("reconcile");
    let status = status(h.home.path());
    assert_eq!(status.phase, Some(Phase::Error));
    assert!(status.message.unwrap_or_default().contains("soon"));
}

#[tokio::test]
async fn config_store_source_becomes_ready() {
    let mut h = harness();
    save_source_at(h.home.path(), &config_store_source(1)).expect("save");
    write_store(h.home.path(), STARTER_STORE);

    // First pass dispatches the fetch and returns at once.
    let first = h.reconciler.reconcile(&key()).await.expect("first pass");
    assert_eq!(first.requeue_after, None);
    let fetching = status(h.home.path());
    assert_eq!(fetching.phase, Some(Phase::Fetching));
    assert_eq!(
        ready_reason(&fetching),
        (ConditionStatus::False, "Fetching".to_string())
    );

    assert_eq!(wait_for_completion(&mut h.completed).await, key());
    assert!(h.reconciler.has_outstanding_fetch(&key()), "result parked until consumed");

    // Second pass consumes the result.
    let second = h.reconciler.reconcile(&key()).await.expect("second pass");
    assert_eq!(second.requeue_after, Some(Duration::from_secs(300)));
    assert!(!h.reconciler.has_outstanding_fetch(&key()));

    let ready = status(h.home.path());
    assert_eq!(ready.phase, Some(Phase::Ready));
    assert_eq!(ready_reason(&ready), (ConditionStatus::True, "Synced".to_string()));
    let available =
        find_condition(&ready.conditions, CONDITION_ARTIFACT_AVAILABLE).expect("artifact condition");
    assert_eq!(available.status, ConditionStatus::True);

    let version = ready.head_version.clone().expect("head version");
    assert_eq!(version.len(), 12);
    let artifact = ready.artifact.clone().expect("artifact status");
    assert_eq!(artifact.revision, "starter@3");
    assert_eq!(
        artifact.content_path,
        format!("templates/starter/.arena/versions/{version}")
    );
    assert_eq!(ready.templates.len(), 1);
    assert_eq!(ready.templates[0].name, "chat");

    let stored = h
        .config
        .base_dir
        .join("team-a/team-a")
        .join(&artifact.content_path)
        .join("chat/prompt.md");
    assert_eq!(fs::read_to_string(stored).expect("stored file"), "You are helpful.");

    let indexer = TemplateIndexer::from_config(&h.config);
    let index = indexer
        .read_index("team-a", "team-a", "starter")
        .expect("read index");
    assert_eq!(index.len(), 1);
    assert_eq!(index[0].name, "chat");

    assert_eq!(h.recorded.events(), vec![(EventType::Normal, Reason::Synced)]);

    // Within the interval a further pass only schedules the next check.
    let third = h.reconciler.reconcile(&key()).await.expect("third pass");
    let wait = third.requeue_after.expect("requeue");
    assert!(wait <= Duration::from_secs(300) && wait > Duration::from_secs(290));
    assert!(!h.reconciler.has_outstanding_fetch(&key()));
}

#[tokio::test]
async fn missing_config_store_fails_the_fetch() {
    let mut h = harness();
    save_source_at(h.home.path(), &config_store_source(1)).expect("save");

    h.reconciler.reconcile(&key()).await.expect("dispatch");
    wait_for_completion(&mut h.completed).await;
    let result = h.reconciler.reconcile(&key()).await.expect("consume");

    assert_eq!(result.requeue_after, Some(Duration::from_secs(300)));
    let status = status(h.home.path());
    assert_eq!(status.phase, Some(Phase::Error));
    assert_eq!(
        ready_reason(&status),
        (ConditionStatus::False, "FetchFailed".to_string())
    );
    assert_eq!(status.head_version, None);
    assert_eq!(
        h.recorded.events(),
        vec![(EventType::Warning, Reason::FetchFailed)]
    );
}

#[tokio::test]
async fn duplicate_template_names_fail_parsing() {
    let mut h = harness();
    save_source_at(h.home.path(), &config_store_source(1)).expect("save");
    write_store(
        h.home.path(),
        r#"
data:
  a/template.yaml: "name: chat"
  b/template.yaml: "name: chat"
"#,
    );

    h.reconciler.reconcile(&key()).await.expect("dispatch");
    wait_for_completion(&mut h.completed).await;
    h.reconciler.reconcile(&key()).await.expect("consume");

    let status = status(h.home.path());
    assert_eq!(status.phase, Some(Phase::Error));
    assert_eq!(
        ready_reason(&status),
        (ConditionStatus::False, "ParseFailed".to_string())
    );
}

#[tokio::test]
async fn stalled_fetch_times_out() {
    let mut h = harness();
    let reconciler = h
        .reconciler
        .with_fetchers(Arc::new(AlwaysStalled))
        .with_fetch_timeout(Duration::from_millis(50));
    save_source_at(h.home.path(), &config_store_source(1)).expect("save");

    reconciler.reconcile(&key()).await.expect("dispatch");
    // A pass while the fetch runs neither blocks nor dispatches again.
    let during = reconciler.reconcile(&key()).await.expect("pass during fetch");
    assert_eq!(during.requeue_after, None);
    assert_eq!(reconciler.outstanding_fetches(), 1);

    wait_for_completion(&mut h.completed).await;
    reconciler.reconcile(&key()).await.expect("consume");

    let status = status(h.home.path());
    assert_eq!(
        ready_reason(&status),
        (ConditionStatus::False, "FetchFailed".to_string())
    );
    assert!(status.message.unwrap_or_default().contains("timed out"));
}

#[tokio::test]
async fn deleting_a_source_drops_its_fetch() {
    let h = harness();
    let reconciler = h.reconciler.with_fetchers(Arc::new(AlwaysStalled));
    save_source_at(h.home.path(), &config_store_source(1)).expect("save");

    reconciler.reconcile(&key()).await.expect("dispatch");
    assert!(reconciler.has_outstanding_fetch(&key()));

    delete_source_at(h.home.path(), &key()).expect("delete");
    let result = reconciler.reconcile(&key()).await.expect("reconcile deleted");
    assert_eq!(result.requeue_after, None);
    assert!(!reconciler.has_outstanding_fetch(&key()));
}

#[tokio::test]
async fn result_for_an_older_generation_is_discarded() {
    let mut h = harness();
    save_source_at(h.home.path(), &config_store_source(1)).expect("save");
    write_store(h.home.path(), STARTER_STORE);

    h.reconciler.reconcile(&key()).await.expect("dispatch gen 1");
    wait_for_completion(&mut h.completed).await;

    save_source_at(h.home.path(), &config_store_source(2)).expect("bump generation");
    h.reconciler.reconcile(&key()).await.expect("pass at gen 2");

    let status = status(h.home.path());
    assert_eq!(status.phase, Some(Phase::Fetching), "a fresh fetch replaces the stale one");
    assert_eq!(status.observed_generation, 2);
    assert_eq!(status.head_version, None);
    assert!(h.reconciler.has_outstanding_fetch(&key()));
}

/// Put a plain file where the store expects a directory.
fn block_with_file(path: &Path) {
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, "not a directory").expect("write blocker");
}

#[tokio::test]
async fn store_failure_backs_off_at_most_thirty_seconds() {
    let mut h = harness();
    save_source_at(h.home.path(), &config_store_source(1)).expect("save");
    write_store(h.home.path(), STARTER_STORE);
    block_with_file(&h.config.base_dir.join("team-a/team-a/templates"));

    h.reconciler.reconcile(&key()).await.expect("dispatch");
    wait_for_completion(&mut h.completed).await;
    let result = h.reconciler.reconcile(&key()).await.expect("consume");

    assert_eq!(result.requeue_after, Some(MAX_SYNC_BACKOFF));
    let status = status(h.home.path());
    assert_eq!(status.phase, Some(Phase::Error));
    assert_eq!(
        ready_reason(&status),
        (ConditionStatus::False, "SyncFailed".to_string())
    );
    assert_eq!(status.head_version, None);
    assert_eq!(h.recorded.events(), vec![(EventType::Warning, Reason::SyncFailed)]);
}

#[tokio::test]
async fn store_failure_retries_within_a_short_interval() {
    let mut h = harness();
    let mut source = config_store_source(1);
    source.spec.sync_interval = "10s".to_string();
    save_source_at(h.home.path(), &source).expect("save");
    write_store(h.home.path(), STARTER_STORE);
    block_with_file(&h.config.base_dir.join("team-a/team-a/templates"));

    h.reconciler.reconcile(&key()).await.expect("dispatch");
    wait_for_completion(&mut h.completed).await;
    let result = h.reconciler.reconcile(&key()).await.expect("consume");

    assert_eq!(result.requeue_after, Some(Duration::from_secs(10)));
}

#[tokio::test]
async fn index_failure_keeps_stored_content() {
    let mut h = harness();
    save_source_at(h.home.path(), &config_store_source(1)).expect("save");
    write_store(h.home.path(), STARTER_STORE);
    let namespace_dir = h.config.base_dir.join("team-a/team-a");
    block_with_file(&namespace_dir.join("template-index"));

    h.reconciler.reconcile(&key()).await.expect("dispatch");
    wait_for_completion(&mut h.completed).await;
    let result = h.reconciler.reconcile(&key()).await.expect("consume");

    assert_eq!(result.requeue_after, Some(MAX_SYNC_BACKOFF));
    let status = status(h.home.path());
    assert_eq!(status.phase, Some(Phase::Error));
    assert_eq!(
        ready_reason(&status),
        (ConditionStatus::False, "IndexFailed".to_string())
    );
    assert!(
        namespace_dir.join("templates/starter/.arena/HEAD").is_file(),
        "the store step already ran"
    );
    assert_eq!(h.recorded.events(), vec![(EventType::Warning, Reason::IndexFailed)]);
}

#[tokio::test]
async fn shutdown_settles_interrupted_fetches() {
    let h = harness();
    let (shutdown, _) = broadcast::channel(1);
    let reconciler = h
        .reconciler
        .with_fetchers(Arc::new(AlwaysStalled))
        .with_shutdown(shutdown.clone());
    save_source_at(h.home.path(), &config_store_source(1)).expect("save");

    reconciler.reconcile(&key()).await.expect("dispatch");
    assert_eq!(status(h.home.path()).phase, Some(Phase::Fetching));

    shutdown.send(()).expect("fetch task subscribed");
    let settled = reconciler.settle_fetches(Duration::from_secs(5)).await;

    assert_eq!(settled, 1);
    assert_eq!(reconciler.outstanding_fetches(), 0);
    let status = status(h.home.path());
    assert_eq!(status.phase, Some(Phase::Error));
    assert_eq!(
        ready_reason(&status),
        (ConditionStatus::False, "FetchFailed".to_string())
    );
    assert!(status.message.unwrap_or_default().contains("shutting down"));
}

#[tokio::test]
async fn settling_without_fetches_is_a_no_op() {
    let h = harness();
    assert_eq!(h.reconciler.settle_fetches(Duration::from_secs(1)).await, 0);
}
