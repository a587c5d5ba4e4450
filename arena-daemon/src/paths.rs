use std::path::{Path, PathBuf};
use std::time::Duration;

use arena_core::config::arena_root;

pub const DAEMON_LABEL: &str = "dev.arena.daemon";
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);
/// How long shutdown waits for cancelled fetches to report back.
pub const FETCH_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub const DAEMON_SOCKET: &str = "daemon.sock";

/// `<home>/.arena/daemon.sock`
pub fn socket_path(home: &Path) -> PathBuf {
    arena_root(home).join(DAEMON_SOCKET)
}

pub use arena_core::store::sources_root_at as sources_root;
