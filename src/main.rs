use std::{env, process::ExitCode, time::Instant};

use tracing::info;
use tracing_subscriber::EnvFilter;

mod bringup;
mod cgroup;
mod children;
mod clock;
mod environ;
mod events;
mod listen;
mod manager;
mod mounts;
mod platform;
mod signals;
mod spawn;
mod stdio;

/// Which kind of supervision root this process is. Fixed at start and never
/// re-examined: a per-user root must not request machine-level reboots.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RootMode {
    SystemRoot,
    UserSessionRoot,
}

impl RootMode {
    pub fn detect() -> Self {
        if nix::unistd::getpid().as_raw() == 1 {
            RootMode::SystemRoot
        } else {
            RootMode::UserSessionRoot
        }
    }

    pub fn is_system(self) -> bool {
        self == RootMode::SystemRoot
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("cannot mount {what} on {target}: {errno}")]
    Mount {
        what: &'static str,
        target: &'static str,
        errno: nix::Error,
    },
    #[error("cannot create the logging pipe: {0}")]
    LogPipe(nix::Error),
}

pub struct Timeline {
    last_stage_start: Instant,
}

impl Timeline {
    pub fn new() -> Timeline {
        Timeline {
            last_stage_start: Instant::now(),
        }
    }

    pub fn begin(&mut self, stage: &str) {
        let now = Instant::now();
        let diff = now.duration_since(self.last_stage_start);
        info!("{}  (+{}ms)", stage, diff.as_millis());
        self.last_stage_start = now;
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let mode = RootMode::detect();

    // Lines get their TAI64N stamps from cyclog; writing our own timestamps
    // would double them up. stderr follows wherever descriptor 2 points:
    // the console at first, the log pipe once it exists.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let listen_fds = listen::query_listen_fds();
    if listen_fds > 0 {
        // The names describe fds meant for us, not for our children.
        env::remove_var("LISTEN_FDNAMES");
    }

    // The boot-time "system-control init" one-shot gets our own arguments.
    let argv_tail: Vec<String> = env::args().skip(1).collect();

    match manager::run(mode, listen_fds, argv_tail).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
