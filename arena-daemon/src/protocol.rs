//! Control socket protocol.
//!
//! One JSON object per line in each direction. Requests are tagged by `cmd`:
//!
//! ```text
//! {"cmd":"status"}
//! {"cmd":"reconcile","source":"team-a/starter"}
//! {"cmd":"stop"}
//! ```
//!
//! Every reply is a [`Reply`] envelope, `{"ok":true,"data":…}` or
//! `{"ok":false,"error":"…"}`, whose `data` is the command's typed payload:
//! [`DaemonStatus`], [`ReconcileAck`] or [`StopAck`].

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use arena_core::types::{Phase, SourceKey};

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

const STATUS_ATTEMPTS: usize = 5;
const STATUS_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum DaemonRequest {
    Status,
    /// Enqueue `source` (`<namespace>/<name>`) for an immediate pass.
    Reconcile { source: String },
    Stop,
}

impl DaemonRequest {
    pub fn command(&self) -> &'static str {
        match self {
            DaemonRequest::Status => "status",
            DaemonRequest::Reconcile { .. } => "reconcile",
            DaemonRequest::Stop => "stop",
        }
    }
}

/// Reply envelope shared by every command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Reply<T> {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Reply<T> {
    pub fn ok(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    /// The payload, or [`DaemonError::Rejected`] carrying the daemon's message.
    pub fn into_result(self, command: &'static str) -> Result<T, DaemonError> {
        match (self.ok, self.data) {
            (true, Some(data)) => Ok(data),
            (true, None) => Err(DaemonError::Protocol(format!(
                "daemon reply to '{command}' carried no data"
            ))),
            (false, _) => Err(DaemonError::Rejected {
                command,
                message: self
                    .error
                    .unwrap_or_else(|| "no reason given".to_string()),
            }),
        }
    }
}

/// One source as reported by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub source: String,
    #[serde(rename = "type")]
    pub source_type: String,
    pub suspended: bool,
    pub phase: Phase,
    pub ready: bool,
    pub head_version: Option<String>,
    pub templates: usize,
    pub last_fetch_time: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

/// Payload of `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub label: String,
    pub started_at: DateTime<Utc>,
    pub workers: usize,
    pub queue_depth: usize,
    pub outstanding_fetches: usize,
    pub socket: PathBuf,
    pub sources_root: PathBuf,
    pub sources: Vec<SourceSummary>,
}

/// Payload of `reconcile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileAck {
    pub queued: String,
}

/// Payload of `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopAck {
    pub stopping: bool,
}

/// Blocking client for the daemon's control socket.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket: PathBuf,
}

impl DaemonClient {
    /// Client for the daemon serving `home`.
    pub fn for_home(home: &Path) -> Self {
        Self {
            socket: socket_path(home),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Daemon status. A socket that is not accepting yet is retried briefly
    /// so a status right after `daemon start` does not race the bind.
    pub fn status(&self) -> Result<DaemonStatus, DaemonError> {
        let mut attempt = 1;
        loop {
            match self.call(&DaemonRequest::Status) {
                Err(DaemonError::DaemonNotRunning { .. }) if attempt < STATUS_ATTEMPTS => {
                    attempt += 1;
                    sleep(STATUS_RETRY_DELAY);
                }
                other => return other,
            }
        }
    }

    pub fn reconcile(&self, key: &SourceKey) -> Result<ReconcileAck, DaemonError> {
        self.call(&DaemonRequest::Reconcile {
            source: key.to_string(),
        })
    }

    pub fn stop(&self) -> Result<StopAck, DaemonError> {
        self.call(&DaemonRequest::Stop)
    }

    /// Send one request and decode the typed payload of its reply.
    pub fn call<T: DeserializeOwned>(&self, request: &DaemonRequest) -> Result<T, DaemonError> {
        let mut stream = self.connect()?;
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        stream
            .write_all(line.as_bytes())
            .and_then(|()| stream.flush())
            .map_err(|e| io_err(&self.socket, e))?;

        let mut reply = String::new();
        let read = BufReader::new(stream)
            .read_line(&mut reply)
            .map_err(|e| io_err(&self.socket, e))?;
        if read == 0 {
            return Err(DaemonError::Protocol(format!(
                "daemon closed the connection before answering '{}'",
                request.command()
            )));
        }
        let reply: Reply<T> = serde_json::from_str(reply.trim_end())?;
        reply.into_result(request.command())
    }

    fn connect(&self) -> Result<UnixStream, DaemonError> {
        if !self.socket.exists() {
            return Err(self.not_running());
        }
        UnixStream::connect(&self.socket).map_err(|err| match err.kind() {
            ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                self.not_running()
            }
            _ => io_err(&self.socket, err),
        })
    }

    fn not_running(&self) -> DaemonError {
        DaemonError::DaemonNotRunning {
            socket: self.socket.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn requests_are_tagged_by_command() {
        assert_eq!(
            serde_json::to_value(DaemonRequest::Status).expect("encode"),
            json!({"cmd": "status"})
        );
        let decoded: DaemonRequest =
            serde_json::from_str(r#"{"cmd":"reconcile","source":"team-a/starter"}"#).expect("decode");
        assert_eq!(
            decoded,
            DaemonRequest::Reconcile {
                source: "team-a/starter".to_string()
            }
        );
        assert!(serde_json::from_str::<DaemonRequest>(r#"{"cmd":"reconcile"}"#).is_err());
        assert!(serde_json::from_str::<DaemonRequest>(r#"{"cmd":"restart"}"#).is_err());
    }

    #[test]
    fn missing_socket_reports_not_running() {
        let home = TempDir::new().expect("home");
        let err = DaemonClient::for_home(home.path()).stop().unwrap_err();
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }), "got: {err}");
    }

    #[test]
    fn rejected_replies_name_the_command() {
        let reply: Reply<ReconcileAck> =
            serde_json::from_str(r#"{"ok":false,"error":"invalid source key 'x'"}"#).expect("decode");
        let err = reply.into_result("reconcile").unwrap_err();
        assert_eq!(
            err.to_string(),
            "daemon rejected 'reconcile': invalid source key 'x'"
        );

        let reply: Reply<StopAck> = serde_json::from_str(r#"{"ok":true}"#).expect("decode");
        assert!(matches!(reply.into_result("stop"), Err(DaemonError::Protocol(_))));

        let ack = Reply::ok(StopAck { stopping: true }).into_result("stop").expect("ok");
        assert!(ack.stopping);
    }
}
