//! Inherited listen descriptors and the service manager's UCSPI socket.

use std::{
    env, fs, io,
    os::{fd::OwnedFd, fd::RawFd, unix::net::UnixListener},
    path::PathBuf,
};

use tracing::warn;

use crate::{environ, RootMode};

/// First descriptor of the LISTEN_FDS block, and the position where every
/// spawned service manager expects its listening socket.
pub const LISTEN_SOCKET_FILENO: RawFd = 3;

/// How many command FIFOs were handed to us, LISTEN_FDS-style. The count is
/// only honoured when LISTEN_PID is absent or names this process.
pub fn query_listen_fds() -> usize {
    parse_listen_fds(
        env::var("LISTEN_FDS").ok().as_deref(),
        env::var("LISTEN_PID").ok().as_deref(),
        nix::unistd::getpid().as_raw(),
    )
}

fn parse_listen_fds(listen_fds: Option<&str>, listen_pid: Option<&str>, my_pid: i32) -> usize {
    if let Some(pid) = listen_pid {
        if pid.trim().parse::<i32>() != Ok(my_pid) {
            return 0;
        }
    }
    listen_fds
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0)
}

pub fn socket_path(mode: RootMode) -> PathBuf {
    match mode {
        RootMode::SystemRoot => PathBuf::from("/run/service-manager/control"),
        RootMode::UserSessionRoot => environ::user_runtime_dir().join("service-manager/control"),
    }
}

/// Create the listening socket the service manager will inherit at
/// `LISTEN_SOCKET_FILENO`. Failure leaves the slot empty: a service manager
/// without its socket is better than no supervision root at all.
pub fn create_service_manager_socket(mode: RootMode) -> Option<OwnedFd> {
    let path = socket_path(mode);
    // A socket left over from a previous incarnation would make bind fail.
    if let Err(e) = fs::remove_file(&path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("cannot remove stale {}: {e}", path.display());
        }
    }
    match UnixListener::bind(&path) {
        Ok(listener) => Some(OwnedFd::from(listener)),
        Err(e) => {
            warn!("cannot listen on {}: {e}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_fds_counts_only_for_this_process() {
        assert_eq!(parse_listen_fds(Some("2"), None, 1), 2);
        assert_eq!(parse_listen_fds(Some("2"), Some("1"), 1), 2);
        assert_eq!(parse_listen_fds(Some("2"), Some("99"), 1), 0);
        assert_eq!(parse_listen_fds(None, None, 1), 0);
        assert_eq!(parse_listen_fds(Some("nonsense"), None, 1), 0);
        assert_eq!(parse_listen_fds(Some(" 3\n"), Some(" 1 "), 1), 3);
    }

    #[test]
    fn system_socket_lives_under_run() {
        assert_eq!(
            socket_path(RootMode::SystemRoot),
            PathBuf::from("/run/service-manager/control")
        );
    }
}
