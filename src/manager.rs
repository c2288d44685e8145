//! The supervision root proper: bring-up, the event loop, final shutdown.
//!
//! The loop is single-threaded and has exactly one suspension point, the
//! event wait at the bottom. Everything else (reaping, arbitration,
//! spawning) runs between waits and never blocks.

use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    time::Duration,
};

use anyhow::{Context, Result};
use nix::{
    sys::signal::{kill, Signal},
    unistd::sync,
};
use tokio::io::{unix::AsyncFd, Interest};
use tracing::{debug, error, info, warn};

use crate::{
    bringup, cgroup,
    children::{self, ChildSlot, Children, ExitKind},
    events::{self, Event, PendingEvents},
    listen::{self, LISTEN_SOCKET_FILENO},
    platform, signals,
    signals::SignalIntake,
    spawn,
    stdio::{self, FillerFds, LogPipe, SavedStdio},
    RootMode, Timeline,
};

/// How long a crashed logger waits before its replacement is spawned.
const CYCLOG_RESPAWN_THROTTLE: Duration = Duration::from_millis(500);

struct CommandFifo {
    fd: AsyncFd<OwnedFd>,
    eof: bool,
}

pub async fn run(mode: RootMode, listen_fds: usize, argv_tail: Vec<String>) -> Result<()> {
    let mut timeline = Timeline::new();
    timeline.begin(match mode {
        RootMode::SystemRoot => "Starting system manager",
        RootMode::UserSessionRoot => "Starting per-user manager",
    });

    // Keep descriptors 0..=3 occupied so everything opened from here on
    // lands above the range children inherit at fixed positions.
    let mut fillers = FillerFds::acquire().context("reserving standard descriptors")?;
    let mut saved = SavedStdio::save(&fillers);

    // From here our own stdout and stderr go down the log pipe. Nothing
    // reads it yet, so early messages must stay shy of the pipe buffer.
    let mut log_pipe = LogPipe::open()?;
    log_pipe.adopt_stdout_stderr(&mut fillers);

    bringup::setup_process_state(mode);

    let pending = PendingEvents::new();
    let intake = signals::install(mode, &pending).context("signal intake")?;

    if mode.is_system() {
        bringup::system_bringup(&mut timeline);
    }
    bringup::make_needed_run_directories(mode);
    cgroup::initialize_root_control_groups();

    // /dev exists now; populate standard input and whatever standard
    // descriptors never existed.
    let dev_null = stdio::open_null();
    if let Some(null) = &dev_null {
        match unsafe { libc::dup2(null.as_raw_fd(), 0) } {
            -1 => warn!(
                "cannot point stdin at /dev/null: {}",
                io::Error::last_os_error()
            ),
            _ => fillers.release(0),
        }
    }
    stdio::last_resort_io_defaults(mode, dev_null.as_ref(), &mut saved);

    let socket = listen::create_service_manager_socket(mode);

    let mut fifos = watch_command_fifos(listen_fds, &fillers);

    // Every position in the low range is now assigned or intentionally
    // left to the inherited fds; the fillers have done their job.
    fillers.release_all();
    drop(fillers);

    timeline.begin("Entering supervision loop");

    let mut children = Children::default();
    let mut try_all_log_directories = false;

    loop {
        reap_spawned_children(&pending, &mut children, &intake).await;

        // Transient work first: a pending verb never waits behind the
        // long-lived children.
        spawn_system_control_as_needed(mode, &pending, &mut children, &argv_tail);

        // Stop signalled and both long-lived children gone: we are done.
        if supervision_complete(&pending, &children) {
            break;
        }

        // Ask the service manager to leave, once nothing transient is still
        // talking to it.
        if should_terminate_service_manager(&pending, &children) {
            if let Some(pid) = children.get(ChildSlot::ServiceManager) {
                debug!("terminating service manager");
                if let Err(e) = kill(pid, Signal::SIGTERM) {
                    warn!("cannot signal service-manager: {e}");
                }
            }
        }

        // A logger restart is a TERM now and a respawn once the old one has
        // been reaped; no two cyclogs ever share the pipe.
        if children.has(ChildSlot::Cyclog) && pending.restart_logger_signalled() {
            if let Some(pid) = children.get(ChildSlot::Cyclog) {
                debug!("terminating cyclog (pid {pid})");
                if let Err(e) = kill(pid, Signal::SIGTERM) {
                    warn!("cannot signal cyclog: {e}");
                }
            }
            resolve_logger_restart(&pending, &mut try_all_log_directories);
        }

        // The logger stays up while the service manager still writes, even
        // during a stop.
        if may_spawn_cyclog(&pending, &children) {
            match spawn::spawn_cyclog(mode, &log_pipe, &saved, try_all_log_directories) {
                Ok(pid) => {
                    info!("cyclog (pid {pid}) started");
                    children.set(ChildSlot::Cyclog, pid);
                }
                Err(e) => error!("cannot spawn cyclog: {e}"),
            }
        }

        // Stop in progress and the service manager gone: give the logger
        // its EOF, with our own output retargeted first so the last
        // messages still land somewhere.
        if should_release_logger(&pending, &children) && log_pipe.is_open() {
            debug!("closing logger");
            saved.reinstall();
            log_pipe.close();
        }

        if may_spawn_service_manager(&pending, &children) {
            match spawn::spawn_service_manager(mode, dev_null.as_ref(), &log_pipe, socket.as_ref())
            {
                Ok(pid) => {
                    info!("service-manager (pid {pid}) started");
                    children.set(ChildSlot::ServiceManager, pid);
                }
                Err(e) => error!("cannot spawn service-manager: {e}"),
            }
        }

        if pending.take(Event::Unknown) {
            warn!("unknown signal ignored");
        }

        if let Err(e) = wait_for_events(mode, &pending, &intake, &mut fifos).await {
            // A broken wait would spin the loop; only the machine root is
            // obliged to soldier on.
            if mode.is_system() {
                error!("event wait failed: {e}");
            } else {
                return Err(e).context("event wait");
            }
        }
    }

    timeline.begin("Shutting down");
    if mode.is_system() {
        sync();
        if !platform::in_container() {
            platform::end_system(&pending);
        }
    }
    Ok(())
}

/// Wrap the inherited command FIFOs for readiness watching.
fn watch_command_fifos(listen_fds: usize, fillers: &FillerFds) -> Vec<CommandFifo> {
    let mut fifos = Vec::new();
    for i in 0..listen_fds {
        let raw = LISTEN_SOCKET_FILENO + i as RawFd;
        // A descriptor the filler holds was closed at start: the advertised
        // count lied, and taking the fd over would double-own it.
        if fillers.holds(raw) {
            warn!("listen fd {raw} was not actually open");
            continue;
        }
        let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
        if flags < 0
            || unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
        {
            warn!("listen fd {raw}: {}", io::Error::last_os_error());
            continue;
        }
        let owned = unsafe { OwnedFd::from_raw_fd(raw) };
        match AsyncFd::with_interest(owned, Interest::READABLE) {
            Ok(fd) => fifos.push(CommandFifo { fd, eof: false }),
            Err(e) => warn!("listen fd {raw}: {e}"),
        }
    }
    fifos
}

/// Reap every child the kernel has ready. Runs at the top of each iteration
/// so that reaping always precedes spawning.
async fn reap_spawned_children(
    pending: &PendingEvents,
    children: &mut Children,
    intake: &SignalIntake,
) {
    if !pending.take(Event::Child) {
        return;
    }
    loop {
        let reaped = match children::reap_next() {
            Ok(Some(reaped)) => reaped,
            Ok(None) => break,
            Err(e) => {
                warn!("wait: {e}");
                break;
            }
        };
        // PIDs we never forked (inherited orphans and the like) are not ours
        // to track.
        let Some(slot) = children.slot_of(reaped.pid) else {
            continue;
        };
        if reaped.kind == ExitKind::Paused {
            info!(
                "{} (pid {}) paused code {}",
                slot.program(),
                reaped.pid,
                reaped.code
            );
            continue;
        }
        children.clear(slot);
        match slot {
            ChildSlot::ServiceManager | ChildSlot::Cyclog => warn!(
                "{} (pid {}) ended status {} code {}",
                slot.program(),
                reaped.pid,
                reaped.kind,
                reaped.code
            ),
            _ => info!(
                "{} (pid {}) ended status {} code {}",
                slot.program(),
                reaped.pid,
                reaped.kind,
                reaped.code
            ),
        }
        if slot == ChildSlot::Cyclog && reaped.is_abend() {
            // A crash-looping logger gets a breather, cut short by any new
            // signal so a shutdown never waits on it.
            tokio::select! {
                _ = tokio::time::sleep(CYCLOG_RESPAWN_THROTTLE) => {}
                _ = intake.wait() => {}
            }
        }
    }
}

fn spawn_system_control_as_needed(
    mode: RootMode,
    pending: &PendingEvents,
    children: &mut Children,
    argv_tail: &[String],
) {
    if !children.has(ChildSlot::EmergencySystemControl) {
        if let Some(job) = spawn::next_emergency_job(pending) {
            launch_system_control(mode, &job, children, argv_tail);
        }
    }
    if !children.has(ChildSlot::KbreqSystemControl) {
        if let Some(job) = spawn::next_kbreq_job(pending) {
            launch_system_control(mode, &job, children, argv_tail);
        }
    }
    if !children.has(ChildSlot::RegularSystemControl) {
        if let Some(job) = spawn::next_regular_job(pending) {
            launch_system_control(mode, &job, children, argv_tail);
        } else if pending.take(Event::Init) {
            launch_system_control(mode, &spawn::init_job(), children, argv_tail);
        }
    }
}

fn launch_system_control(
    mode: RootMode,
    job: &spawn::SystemControlJob,
    children: &mut Children,
    argv_tail: &[String],
) {
    match spawn::spawn_system_control(mode, job, argv_tail) {
        Ok(pid) => {
            info!(
                "system-control (pid {pid}) started ({})",
                job.describe(mode)
            );
            children.set(job.slot, pid);
        }
        Err(e) => error!("cannot spawn system-control: {e}"),
    }
}

fn supervision_complete(pending: &PendingEvents, children: &Children) -> bool {
    pending.stop_signalled()
        && !children.has(ChildSlot::ServiceManager)
        && !children.has(ChildSlot::Cyclog)
}

fn should_terminate_service_manager(pending: &PendingEvents, children: &Children) -> bool {
    pending.stop_signalled()
        && children.has(ChildSlot::ServiceManager)
        && !children.has_any_system_control()
}

fn may_spawn_cyclog(pending: &PendingEvents, children: &Children) -> bool {
    !children.has(ChildSlot::Cyclog)
        && (!pending.stop_signalled() || children.has(ChildSlot::ServiceManager))
}

fn should_release_logger(pending: &PendingEvents, children: &Children) -> bool {
    pending.stop_signalled() && !children.has(ChildSlot::ServiceManager)
}

fn may_spawn_service_manager(pending: &PendingEvents, children: &Children) -> bool {
    !children.has(ChildSlot::ServiceManager) && !pending.stop_signalled()
}

/// All three restart flags clear together; the strongest of the requested
/// recovery modes decides where the next cyclog ends up.
fn resolve_logger_restart(pending: &PendingEvents, try_all_log_directories: &mut bool) {
    let cycle = pending.take(Event::RestartLoggerCycleDirs);
    let reset = pending.take(Event::RestartLoggerResetCwd);
    let _keep = pending.take(Event::RestartLoggerKeepCwd);
    if cycle {
        *try_all_log_directories = true;
    } else if reset {
        *try_all_log_directories = false;
    }
}

enum FifoRead {
    Byte(u8),
    Eof,
    Retry,
}

/// The loop's only suspension point: block until a trapped signal fires or
/// a command FIFO has a byte for us.
async fn wait_for_events(
    mode: RootMode,
    pending: &PendingEvents,
    intake: &SignalIntake,
    fifos: &mut Vec<CommandFifo>,
) -> io::Result<()> {
    fifos.retain(|fifo| !fifo.eof);

    if fifos.is_empty() {
        intake.wait().await?;
        intake.drain();
        return Ok(());
    }

    let mut fifo_outcome: Option<(usize, FifoRead)> = None;
    {
        let readables = fifos
            .iter()
            .map(|fifo| Box::pin(fifo.fd.readable()))
            .collect::<Vec<_>>();
        tokio::select! {
            result = intake.wait() => {
                result?;
                intake.drain();
            }
            (result, index, _) = futures::future::select_all(readables) => {
                let mut guard = result?;
                let read = guard.try_io(|fd| {
                    let mut byte = [0u8; 1];
                    let n = unsafe {
                        libc::read(fd.get_ref().as_raw_fd(), byte.as_mut_ptr().cast(), 1)
                    };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok((n as usize, byte[0]))
                    }
                });
                let outcome = match read {
                    Ok(Ok((0, _))) => FifoRead::Eof,
                    Ok(Ok((_, byte))) => FifoRead::Byte(byte),
                    Ok(Err(e)) => {
                        warn!("command fifo: {e}");
                        FifoRead::Eof
                    }
                    Err(_would_block) => FifoRead::Retry,
                };
                fifo_outcome = Some((index, outcome));
            }
        }
    }

    if let Some((index, outcome)) = fifo_outcome {
        match outcome {
            FifoRead::Byte(byte) => pending.set(events::decode_command(mode, byte)),
            FifoRead::Eof => {
                // A FIFO at EOF stays readable forever; stop watching it
                // rather than spin.
                fifos[index].eof = true;
            }
            FifoRead::Retry => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    fn populated(slots: &[ChildSlot]) -> Children {
        let mut children = Children::default();
        for (i, slot) in slots.iter().enumerate() {
            children.set(*slot, Pid::from_raw(100 + i as i32));
        }
        children
    }

    #[test]
    fn stop_kind_blocks_new_service_managers() {
        let pending = PendingEvents::new();
        let children = Children::default();
        assert!(may_spawn_service_manager(&pending, &children));
        pending.set(Event::FastReboot);
        // Sticky: the empty slot no longer matters.
        assert!(!may_spawn_service_manager(&pending, &children));
    }

    #[test]
    fn logger_outlives_the_stop_while_the_service_manager_writes() {
        let pending = PendingEvents::new();
        pending.set(Event::FastHalt);
        let with_sm = populated(&[ChildSlot::ServiceManager]);
        assert!(may_spawn_cyclog(&pending, &with_sm));
        let without_sm = Children::default();
        assert!(!may_spawn_cyclog(&pending, &without_sm));
    }

    #[test]
    fn logger_is_released_only_after_the_service_manager_is_gone() {
        let pending = PendingEvents::new();
        pending.set(Event::FastPoweroff);
        assert!(!should_release_logger(&pending, &populated(&[ChildSlot::ServiceManager])));
        assert!(should_release_logger(&pending, &Children::default()));
    }

    #[test]
    fn service_manager_is_not_terminated_under_a_running_system_control() {
        let pending = PendingEvents::new();
        pending.set(Event::FastReboot);
        let busy = populated(&[ChildSlot::ServiceManager, ChildSlot::RegularSystemControl]);
        assert!(!should_terminate_service_manager(&pending, &busy));
        let idle = populated(&[ChildSlot::ServiceManager]);
        assert!(should_terminate_service_manager(&pending, &idle));
    }

    #[test]
    fn loop_ends_once_both_long_lived_children_are_gone() {
        let pending = PendingEvents::new();
        assert!(!supervision_complete(&pending, &Children::default()));
        pending.set(Event::FastHalt);
        assert!(supervision_complete(&pending, &Children::default()));
        assert!(!supervision_complete(&pending, &populated(&[ChildSlot::Cyclog])));
    }

    #[test]
    fn restart_requests_coalesce_and_the_strongest_wins() {
        let pending = PendingEvents::new();
        let mut try_all = false;

        pending.set(Event::RestartLoggerKeepCwd);
        pending.set(Event::RestartLoggerCycleDirs);
        resolve_logger_restart(&pending, &mut try_all);
        assert!(try_all);
        // Everything was consumed in one go: exactly one respawn follows.
        assert!(!pending.restart_logger_signalled());

        pending.set(Event::RestartLoggerKeepCwd);
        resolve_logger_restart(&pending, &mut try_all);
        assert!(try_all, "keep-cwd leaves the directory choice alone");

        pending.set(Event::RestartLoggerResetCwd);
        resolve_logger_restart(&pending, &mut try_all);
        assert!(!try_all, "reset-cwd goes back to the runtime directory");
    }
}
