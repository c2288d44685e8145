//! Spawn contracts for the three child families, and the arbitration that
//! decides which transient verb runs next.

use std::{
    ffi::CString,
    io,
    os::fd::{AsRawFd, OwnedFd},
    os::unix::ffi::OsStringExt,
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Command, Stdio},
};

use nix::unistd::Pid;

use crate::{
    children::ChildSlot,
    environ,
    events::{Event, PendingEvents},
    listen::LISTEN_SOCKET_FILENO,
    stdio::{LogPipe, SavedStdio},
    RootMode,
};

/// Every child is wrapped so it lands in its own slice before exec.
const MOVE_TO_CONTROL_GROUP: &str = "move-to-control-group";

/// Reset the child's signal mask and dispositions between fork and exec.
/// Runs in pre_exec context: only async-signal-safe calls.
fn reset_signals() {
    unsafe {
        let mut empty: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut empty);
        libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());
        for signo in 1..=libc::SIGRTMAX() {
            // SIGKILL and SIGSTOP refuse this, which is fine.
            libc::signal(signo, libc::SIG_DFL);
        }
    }
}

/// One transient system-control invocation: a slot, a verb, a deadline.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SystemControlJob {
    pub slot: ChildSlot,
    pub subcommand: &'static str,
    pub option: Option<&'static str>,
    pub alarm_secs: u32,
    pub verbose: bool,
    /// The boot one-shot passes the root's own arguments through.
    pub append_argv: bool,
}

impl SystemControlJob {
    pub fn describe(&self, mode: RootMode) -> String {
        let mut description = String::from(self.subcommand);
        if !mode.is_system() {
            description.push_str(" --user");
        }
        if let Some(option) = self.option {
            description.push(' ');
            description.push_str(option);
        }
        description
    }
}

/// Emergency actions preempt everything else in the arbitration order.
pub fn next_emergency_job(pending: &PendingEvents) -> Option<SystemControlJob> {
    pending.take(Event::Emergency).then_some(SystemControlJob {
        slot: ChildSlot::EmergencySystemControl,
        subcommand: "activate",
        option: Some("emergency"),
        alarm_secs: 60,
        verbose: true,
        append_argv: false,
    })
}

/// Keyboard and power events share one slot, power failure first.
pub fn next_kbreq_job(pending: &PendingEvents) -> Option<SystemControlJob> {
    let option = if pending.take(Event::Power) {
        "powerfail"
    } else if pending.take(Event::Kbrequest) {
        "kbrequest"
    } else if pending.take(Event::Sak) {
        "secure-attention-key"
    } else {
        return None;
    };
    Some(SystemControlJob {
        slot: ChildSlot::KbreqSystemControl,
        subcommand: "activate",
        option: Some(option),
        alarm_secs: 60,
        verbose: true,
        append_argv: false,
    })
}

/// Regular mode changes, one per iteration, in fixed precedence order.
pub fn next_regular_job(pending: &PendingEvents) -> Option<SystemControlJob> {
    const VERBS: [(Event, &str); 7] = [
        (Event::Sysinit, "sysinit"),
        (Event::Normal, "normal"),
        (Event::Rescue, "rescue"),
        (Event::Halt, "halt"),
        (Event::Poweroff, "poweroff"),
        (Event::Powercycle, "powercycle"),
        (Event::Reboot, "reboot"),
    ];
    for (event, verb) in VERBS {
        if pending.take(event) {
            return Some(SystemControlJob {
                slot: ChildSlot::RegularSystemControl,
                subcommand: "start",
                option: Some(verb),
                alarm_secs: 480,
                verbose: true,
                append_argv: false,
            });
        }
    }
    None
}

/// The boot-time one-shot.
pub fn init_job() -> SystemControlJob {
    SystemControlJob {
        slot: ChildSlot::RegularSystemControl,
        subcommand: "init",
        option: None,
        alarm_secs: 420,
        verbose: false,
        append_argv: true,
    }
}

pub fn spawn_system_control(
    mode: RootMode,
    job: &SystemControlJob,
    argv_tail: &[String],
) -> io::Result<Pid> {
    let mut command = Command::new(MOVE_TO_CONTROL_GROUP);
    command
        .arg("../system-control.slice")
        .arg("system-control")
        .arg(job.subcommand);
    if job.verbose {
        command.arg("--verbose");
    }
    if !mode.is_system() {
        command.arg("--user");
    }
    if let Some(option) = job.option {
        command.arg(option);
    }
    if job.append_argv {
        command.args(argv_tail);
    }
    let alarm_secs = job.alarm_secs;
    unsafe {
        command.pre_exec(move || {
            reset_signals();
            // The verb must finish inside its deadline or SIGALRM ends it.
            libc::alarm(alarm_secs);
            Ok(())
        });
    }
    // stdin, stdout, stderr inherit: /dev/null and the log pipe.
    let child = command.spawn()?;
    Ok(Pid::from_raw(child.id() as i32))
}

/// Cyclog working-directory candidates, most durable first. The transient
/// /run directory always works; the persistent ones are only tried when
/// cycling through all log directories.
pub fn log_directory_candidates(mode: RootMode, try_all: bool) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    match mode {
        RootMode::SystemRoot => {
            if try_all {
                dirs.push(PathBuf::from("/var/log/system-manager"));
                dirs.push(PathBuf::from("/var/system-manager/log"));
            }
            dirs.push(PathBuf::from("/run/system-manager/log"));
        }
        RootMode::UserSessionRoot => {
            if try_all {
                dirs.push(environ::user_log_dir());
            }
            dirs.push(environ::user_runtime_dir().join("per-user-manager/log"));
        }
    }
    dirs
}

pub fn spawn_cyclog(
    mode: RootMode,
    pipe: &LogPipe,
    saved: &SavedStdio,
    try_all_log_directories: bool,
) -> io::Result<Pid> {
    let directories: Vec<CString> = log_directory_candidates(mode, try_all_log_directories)
        .into_iter()
        .filter_map(|path| CString::new(path.into_os_string().into_vec()).ok())
        .collect();

    let mut command = Command::new(MOVE_TO_CONTROL_GROUP);
    command
        .arg(if mode.is_system() {
            "../system-manager-log.slice"
        } else {
            "../per-user-manager-log.slice"
        })
        .arg("cyclog")
        .arg("--max-file-size")
        .arg("262144")
        .arg("--max-total-size")
        .arg("1048576")
        .arg(".");
    if let Some(read_end) = pipe.read_end() {
        command.stdin(Stdio::from(read_end.try_clone()?));
    }
    // The logger cannot log through itself; it writes to the saved stdio.
    if let Some(out) = saved.get(1) {
        command.stdout(Stdio::from(out.try_clone()?));
    }
    if let Some(err) = saved.get(2) {
        command.stderr(Stdio::from(err.try_clone()?));
    }
    let system = mode.is_system();
    unsafe {
        command.pre_exec(move || {
            for dir in &directories {
                if libc::chdir(dir.as_ptr()) == 0 {
                    break;
                }
            }
            if system {
                libc::setsid();
            }
            reset_signals();
            libc::close(LISTEN_SOCKET_FILENO);
            Ok(())
        });
    }
    let child = command.spawn()?;
    Ok(Pid::from_raw(child.id() as i32))
}

pub fn spawn_service_manager(
    mode: RootMode,
    dev_null: Option<&OwnedFd>,
    pipe: &LogPipe,
    socket: Option<&OwnedFd>,
) -> io::Result<Pid> {
    let mut command = Command::new(MOVE_TO_CONTROL_GROUP);
    command
        .arg("../service-manager.slice/me.slice")
        .arg("service-manager");
    if let Some(null) = dev_null {
        command.stdin(Stdio::from(null.try_clone()?));
    }
    if let Some(write_end) = pipe.write_end() {
        command.stdout(Stdio::from(write_end.try_clone()?));
        command.stderr(Stdio::from(write_end.try_clone()?));
    }
    let system = mode.is_system();
    let socket_fd = socket.map(|fd| fd.as_raw_fd());
    unsafe {
        command.pre_exec(move || {
            if system {
                libc::setsid();
            }
            reset_signals();
            // The socket goes to the fixed systemd-style position.
            if let Some(socket_fd) = socket_fd {
                if libc::dup2(socket_fd, LISTEN_SOCKET_FILENO) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
    let child = command.spawn()?;
    Ok(Pid::from_raw(child.id() as i32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RootMode::{SystemRoot, UserSessionRoot};

    #[test]
    fn emergency_is_dispatched_before_regular_verbs() {
        let pending = PendingEvents::new();
        pending.set(Event::Emergency);
        pending.set(Event::Halt);

        let emergency = next_emergency_job(&pending).unwrap();
        assert_eq!(emergency.slot, ChildSlot::EmergencySystemControl);
        assert_eq!(emergency.option, Some("emergency"));
        // The halt is untouched: it runs in the regular slot, in parallel.
        assert!(pending.is_set(Event::Halt));
        let regular = next_regular_job(&pending).unwrap();
        assert_eq!(regular.option, Some("halt"));
        assert!(!pending.is_set(Event::Halt));
    }

    #[test]
    fn regular_verbs_follow_fixed_precedence() {
        let pending = PendingEvents::new();
        pending.set(Event::Reboot);
        pending.set(Event::Rescue);

        let first = next_regular_job(&pending).unwrap();
        assert_eq!(first.option, Some("rescue"));
        let second = next_regular_job(&pending).unwrap();
        assert_eq!(second.option, Some("reboot"));
        assert_eq!(next_regular_job(&pending), None);
    }

    #[test]
    fn consuming_a_verb_clears_exactly_that_flag() {
        let pending = PendingEvents::new();
        pending.set(Event::Powercycle);
        pending.set(Event::Poweroff);
        let job = next_regular_job(&pending).unwrap();
        assert_eq!(job.option, Some("poweroff"));
        assert!(pending.is_set(Event::Powercycle));
        assert!(!pending.is_set(Event::Poweroff));
    }

    #[test]
    fn kbreq_slot_prefers_power_failure() {
        let pending = PendingEvents::new();
        pending.set(Event::Sak);
        pending.set(Event::Power);
        let job = next_kbreq_job(&pending).unwrap();
        assert_eq!(job.option, Some("powerfail"));
        assert_eq!(job.slot, ChildSlot::KbreqSystemControl);
        let next = next_kbreq_job(&pending).unwrap();
        assert_eq!(next.option, Some("secure-attention-key"));
        assert_eq!(next_kbreq_job(&pending), None);
    }

    #[test]
    fn job_descriptions_name_the_whole_verb() {
        let pending = PendingEvents::new();
        pending.set(Event::Emergency);
        let job = next_emergency_job(&pending).unwrap();
        assert_eq!(job.describe(SystemRoot), "activate emergency");
        assert_eq!(job.describe(UserSessionRoot), "activate --user emergency");
        assert_eq!(init_job().describe(SystemRoot), "init");
    }

    #[test]
    fn system_log_directories_depend_on_cycling() {
        assert_eq!(
            log_directory_candidates(SystemRoot, false),
            vec![PathBuf::from("/run/system-manager/log")]
        );
        assert_eq!(
            log_directory_candidates(SystemRoot, true),
            vec![
                PathBuf::from("/var/log/system-manager"),
                PathBuf::from("/var/system-manager/log"),
                PathBuf::from("/run/system-manager/log"),
            ]
        );
    }
}
