//! Arena daemon: source watcher, reconciliation workers and control socket.
//!
//! - [`reconciler`] — one reconciliation pass per source key
//! - [`workqueue`] — per-key serialized work queue
//! - [`events`] — optional event sink for outcomes
//! - [`protocol`] — newline-delimited JSON over the control socket

mod error;
pub mod events;
pub mod paths;
pub mod protocol;
pub mod reconciler;
mod runtime;
pub mod workqueue;

pub use error::DaemonError;
pub use events::{EventRecorder, EventType, TracingEventRecorder};
pub use protocol::{
    DaemonClient, DaemonRequest, DaemonStatus, ReconcileAck, Reply, SourceSummary, StopAck,
};
pub use reconciler::{
    BuiltinFetchers, FetchFailure, FetchStage, FetcherFactory, ReconcileResult, Reconciler,
    TemplateFetchResult, MAX_SYNC_BACKOFF,
};
pub use runtime::{init_tracing, run, start_blocking};
pub use workqueue::WorkQueue;
