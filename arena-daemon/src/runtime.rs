use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use arena_core::conditions::{is_condition_true, CONDITION_READY};
use arena_core::config::{self, arena_root};
use arena_core::store::{key_for_path, FsSourceStore, SourceStore};
use arena_core::types::SourceKey;

use crate::error::{io_err, DaemonError};
use crate::events::TracingEventRecorder;
use crate::paths::{
    socket_path, sources_root, DAEMON_LABEL, DEBOUNCE_WINDOW, FETCH_SHUTDOWN_GRACE,
};
use crate::protocol::{DaemonRequest, DaemonStatus, ReconcileAck, Reply, SourceSummary, StopAck};
use crate::reconciler::{Reconciler, MAX_SYNC_BACKOFF};
use crate::workqueue::WorkQueue;

type SourceQueue = WorkQueue<SourceKey>;

/// State shared by the socket server and its clients.
struct DaemonState {
    home: PathBuf,
    store: FsSourceStore,
    reconciler: Arc<Reconciler>,
    queue: Arc<SourceQueue>,
    workers: usize,
    started_at: DateTime<Utc>,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon: watch source documents, reconcile them on a worker pool and
/// answer requests on the control socket until `stop` or ctrl-c.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    let config = config::load_at(&home)?;
    ensure_runtime_dirs(&home)?;

    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let (reconciler, completed) = Reconciler::from_config(&home, &config);
    let reconciler = Arc::new(
        reconciler
            .with_recorder(Arc::new(TracingEventRecorder))
            .with_shutdown(shutdown_tx.clone()),
    );
    let queue = Arc::new(SourceQueue::new());
    let workers = config.workers.max(1);

    tracing::info!(
        home = %home.display(),
        workers,
        resync_secs = config.resync_secs,
        persist = config.persist,
        "starting arena daemon"
    );

    let state = Arc::new(DaemonState {
        home: home.clone(),
        store: FsSourceStore::new(&home),
        reconciler: Arc::clone(&reconciler),
        queue: Arc::clone(&queue),
        workers,
        started_at: Utc::now(),
    });

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let result = watcher_task(home, queue, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let workers_handle = {
        let shutdown = shutdown_tx.clone();
        let reconciler = Arc::clone(&reconciler);
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let result = worker_pool_task(reconciler, queue, workers, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let completion_handle = {
        let shutdown = shutdown_tx.clone();
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let result = completion_task(completed, queue, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let resync_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let queue = Arc::clone(&queue);
        let period = config.resync_period();
        tokio::spawn(async move {
            let result = resync_task(home, queue, period, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let result = socket_server_task(state, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (watcher, pool, completion, resync, socket, signal) = tokio::join!(
        watcher_handle,
        workers_handle,
        completion_handle,
        resync_handle,
        socket_handle,
        signal_handle
    );

    handle_join("watcher", watcher)?;
    handle_join("worker_pool", pool)?;
    handle_join("completion_forwarder", completion)?;
    handle_join("resync", resync)?;
    handle_join("socket_server", socket)?;
    handle_join("signal_handler", signal)?;
    tracing::info!("arena daemon stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

async fn watcher_task(
    home: PathBuf,
    queue: Arc<SourceQueue>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let root = sources_root(&home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }

    // Events arrive with real paths (e.g. /private/var/... on macOS), so
    // resolve keys against the canonical home.
    let watch_home = fs::canonicalize(&home).unwrap_or(home);
    let root = sources_root(&watch_home);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;

    let mut watched_dirs = HashSet::new();
    register_tree(&mut watcher, &mut watched_dirs, &root)?;

    let mut debounce = HashMap::<PathBuf, Instant>::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }

                for path in event.paths {
                    // A new namespace directory needs its own watch.
                    if let Some(dir) = directory_to_watch(&path) {
                        if dir.starts_with(&root) && dir.exists() {
                            register_tree(&mut watcher, &mut watched_dirs, &dir)?;
                        }
                    }

                    let Some(key) = source_key_for_event(&watch_home, &path) else {
                        continue;
                    };

                    if should_process_event(&mut debounce, &path, Instant::now()) {
                        tracing::debug!(source = %key, "source document changed");
                        queue.add(key);
                    } else {
                        // Coalesce the burst into one trailing pass.
                        queue.add_after(key, DEBOUNCE_WINDOW);
                    }
                }
            }
        }
    }

    Ok(())
}

/// Key of a source document event. Status files and temp files are ignored,
/// otherwise every status write would trigger another reconciliation.
fn source_key_for_event(home: &Path, path: &Path) -> Option<SourceKey> {
    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml"))
        .unwrap_or(false);
    if !is_yaml {
        return None;
    }
    key_for_path(home, path)
}

fn register_tree(
    watcher: &mut RecommendedWatcher,
    watched_dirs: &mut HashSet<PathBuf>,
    root: &Path,
) -> Result<(), DaemonError> {
    if !root.exists() {
        fs::create_dir_all(root).map_err(|e| io_err(root, e))?;
    }
    for dir in collect_dirs(root)? {
        let canonical = match fs::canonicalize(&dir) {
            Ok(path) => path,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&dir, err)),
        };
        if watched_dirs.insert(canonical.clone()) {
            watcher.watch(&canonical, RecursiveMode::NonRecursive)?;
            tracing::debug!(path = %canonical.display(), "watching source directory");
        }
    }
    Ok(())
}

fn collect_dirs(root: &Path) -> Result<Vec<PathBuf>, DaemonError> {
    let mut dirs = vec![root.to_path_buf()];
    let mut cursor = 0;
    while cursor < dirs.len() {
        let current = dirs[cursor].clone();
        cursor += 1;
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&current, err)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&current, e))?;
            let ty = entry.file_type().map_err(|e| io_err(entry.path(), e))?;
            if ty.is_dir() {
                dirs.push(entry.path());
            }
        }
    }
    dirs.sort();
    dirs.dedup();
    Ok(dirs)
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn directory_to_watch(path: &Path) -> Option<PathBuf> {
    if path.is_dir() {
        Some(path.to_path_buf())
    } else {
        path.parent().map(Path::to_path_buf)
    }
}

fn should_process_event(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
) -> bool {
    should_process_event_with_threshold(debounce, path, now, DEBOUNCE_WINDOW)
}

fn should_process_event_with_threshold(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
    threshold: Duration,
) -> bool {
    debounce.retain(|_, seen_at| now.duration_since(*seen_at) <= Duration::from_secs(30));
    match debounce.get(path) {
        Some(last_seen) if now.duration_since(*last_seen) < threshold => false,
        _ => {
            debounce.insert(path.to_path_buf(), now);
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Workers, completions, resync
// ---------------------------------------------------------------------------

async fn worker_pool_task(
    reconciler: Arc<Reconciler>,
    queue: Arc<SourceQueue>,
    workers: usize,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let handles: Vec<JoinHandle<()>> = (0..workers)
        .map(|worker| {
            let reconciler = Arc::clone(&reconciler);
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { worker_loop(worker, reconciler, queue).await })
        })
        .collect();

    let _ = shutdown_rx.recv().await;
    queue.shutdown();

    for handle in handles {
        handle.await.map_err(|err| DaemonError::Task {
            task: "worker",
            message: err.to_string(),
        })?;
    }

    let settled = reconciler.settle_fetches(FETCH_SHUTDOWN_GRACE).await;
    if settled > 0 {
        tracing::info!(settled, "recorded interrupted fetches");
    }
    Ok(())
}

async fn worker_loop(worker: usize, reconciler: Arc<Reconciler>, queue: Arc<SourceQueue>) {
    while let Some(key) = queue.get().await {
        let started = Instant::now();
        let outcome = reconciler.reconcile(&key).await;
        queue.done(&key);
        match outcome {
            Ok(result) => {
                tracing::debug!(
                    worker,
                    source = %key,
                    requeue_after_secs = result.requeue_after.map(|d| d.as_secs()),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "reconciled"
                );
                if let Some(delay) = result.requeue_after {
                    queue.add_after(key, delay);
                }
            }
            Err(err) => {
                tracing::error!(worker, source = %key, error = %err, "reconcile failed");
                queue.add_after(key, MAX_SYNC_BACKOFF);
            }
        }
    }
}

async fn completion_task(
    mut completed: mpsc::UnboundedReceiver<SourceKey>,
    queue: Arc<SourceQueue>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            key = completed.recv() => {
                let Some(key) = key else { break };
                tracing::debug!(source = %key, "fetch completed");
                queue.add(key);
            }
        }
    }
    Ok(())
}

/// Enqueue every source now and then once per `period`.
async fn resync_task(
    home: PathBuf,
    queue: Arc<SourceQueue>,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let home = home.clone();
                let listed = tokio::task::spawn_blocking(move || FsSourceStore::new(home).list())
                    .await
                    .map_err(|err| DaemonError::Task { task: "resync", message: err.to_string() })?;
                match listed {
                    Ok(sources) => {
                        tracing::debug!(count = sources.len(), "resync");
                        for source in sources {
                            queue.add(source.key());
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "resync listing failed"),
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Control socket
// ---------------------------------------------------------------------------

async fn socket_server_task(
    state: Arc<DaemonState>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&state.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let state = Arc::clone(&state);
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, state, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    state: Arc<DaemonState>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                let reply = Reply::<()>::rejected(format!("invalid request: {err}"));
                write_response(&mut writer, &reply).await?;
                continue;
            }
        };

        match request {
            DaemonRequest::Status => {
                let reply = match build_status_payload(&state).await {
                    Ok(status) => Reply::ok(status),
                    Err(err) => Reply::rejected(err.to_string()),
                };
                write_response(&mut writer, &reply).await?;
            }
            DaemonRequest::Reconcile { source } => {
                write_response(&mut writer, &enqueue_reconcile(&state.queue, &source)).await?;
            }
            DaemonRequest::Stop => {
                let _ = shutdown_tx.send(());
                write_response(&mut writer, &Reply::ok(StopAck { stopping: true })).await?;
                break;
            }
        }
    }

    Ok(())
}

fn enqueue_reconcile(queue: &SourceQueue, source: &str) -> Reply<ReconcileAck> {
    match source.parse::<SourceKey>() {
        Ok(key) => {
            tracing::info!(source = %key, "reconcile requested over socket");
            let queued = key.to_string();
            queue.add(key);
            Reply::ok(ReconcileAck { queued })
        }
        Err(err) => Reply::rejected(err.to_string()),
    }
}

async fn build_status_payload(state: &DaemonState) -> Result<DaemonStatus, DaemonError> {
    let store = state.store.clone();
    let sources = tokio::task::spawn_blocking(move || store.list())
        .await
        .map_err(|err| DaemonError::Task {
            task: "status",
            message: err.to_string(),
        })??;

    let sources = sources
        .iter()
        .map(|source| {
            let status = &source.status;
            SourceSummary {
                source: source.key().to_string(),
                source_type: source.spec.source_type.to_string(),
                suspended: source.spec.suspend,
                phase: status.phase(),
                ready: is_condition_true(&status.conditions, CONDITION_READY),
                head_version: status.head_version.clone(),
                templates: status.templates.len(),
                last_fetch_time: status.last_fetch_time,
                message: status.message.clone(),
            }
        })
        .collect();

    Ok(DaemonStatus {
        running: true,
        label: DAEMON_LABEL.to_string(),
        started_at: state.started_at,
        workers: state.workers,
        queue_depth: state.queue.len(),
        outstanding_fetches: state.reconciler.outstanding_fetches(),
        socket: socket_path(&state.home),
        sources_root: sources_root(&state.home),
        sources,
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [arena_root(home), sources_root(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response<T: Serialize>(
    writer: &mut OwnedWriteHalf,
    response: &Reply<T>,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &'static str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Task {
            task,
            message: err.to_string(),
        }),
    }
}

/// Install the global subscriber: `RUST_LOG` or `info`, without targets.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
