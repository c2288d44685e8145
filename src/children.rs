//! The child registry: five logical slots, reaped asynchronously.

use std::fmt;

use nix::{
    errno::Errno,
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
    unistd::Pid,
};

/// The children the root may own, at most one process per slot. Three
/// system-control slots exist so that a regular action never blocks an
/// emergency or keyboard/power action.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChildSlot {
    ServiceManager,
    Cyclog,
    RegularSystemControl,
    EmergencySystemControl,
    KbreqSystemControl,
}

impl ChildSlot {
    pub fn program(self) -> &'static str {
        match self {
            ChildSlot::ServiceManager => "service-manager",
            ChildSlot::Cyclog => "cyclog",
            ChildSlot::RegularSystemControl
            | ChildSlot::EmergencySystemControl
            | ChildSlot::KbreqSystemControl => "system-control",
        }
    }
}

/// How a waited-on child ended. The numeric form appears in log lines.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(i32)]
pub enum ExitKind {
    Exited = 0,
    Paused = 1,
    Signalled = 2,
    SignalledCore = 3,
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as i32)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Reaped {
    pub pid: Pid,
    pub kind: ExitKind,
    pub code: i32,
}

impl Reaped {
    pub fn from_status(status: WaitStatus) -> Option<Reaped> {
        match status {
            WaitStatus::Exited(pid, code) => Some(Reaped {
                pid,
                kind: ExitKind::Exited,
                code,
            }),
            WaitStatus::Signaled(pid, signal, core_dumped) => Some(Reaped {
                pid,
                kind: if core_dumped {
                    ExitKind::SignalledCore
                } else {
                    ExitKind::Signalled
                },
                code: signal as i32,
            }),
            WaitStatus::Stopped(pid, signal) => Some(Reaped {
                pid,
                kind: ExitKind::Paused,
                code: signal as i32,
            }),
            _ => None,
        }
    }

    /// An ending that throttles the logger respawn: killed, or exited
    /// non-zero.
    pub fn is_abend(&self) -> bool {
        match self.kind {
            ExitKind::Signalled | ExitKind::SignalledCore => true,
            ExitKind::Exited => self.code != 0,
            ExitKind::Paused => false,
        }
    }
}

/// PID registry. Slots are mutated only by fork success, reap of a known
/// PID, or teardown; the absent state is structural, not a sentinel value.
#[derive(Default)]
pub struct Children {
    service_manager: Option<Pid>,
    cyclog: Option<Pid>,
    regular_system_control: Option<Pid>,
    emergency_system_control: Option<Pid>,
    kbreq_system_control: Option<Pid>,
}

impl Children {
    fn slot(&self, slot: ChildSlot) -> &Option<Pid> {
        match slot {
            ChildSlot::ServiceManager => &self.service_manager,
            ChildSlot::Cyclog => &self.cyclog,
            ChildSlot::RegularSystemControl => &self.regular_system_control,
            ChildSlot::EmergencySystemControl => &self.emergency_system_control,
            ChildSlot::KbreqSystemControl => &self.kbreq_system_control,
        }
    }

    fn slot_mut(&mut self, slot: ChildSlot) -> &mut Option<Pid> {
        match slot {
            ChildSlot::ServiceManager => &mut self.service_manager,
            ChildSlot::Cyclog => &mut self.cyclog,
            ChildSlot::RegularSystemControl => &mut self.regular_system_control,
            ChildSlot::EmergencySystemControl => &mut self.emergency_system_control,
            ChildSlot::KbreqSystemControl => &mut self.kbreq_system_control,
        }
    }

    pub fn get(&self, slot: ChildSlot) -> Option<Pid> {
        *self.slot(slot)
    }

    pub fn has(&self, slot: ChildSlot) -> bool {
        self.slot(slot).is_some()
    }

    pub fn set(&mut self, slot: ChildSlot, pid: Pid) {
        let entry = self.slot_mut(slot);
        debug_assert!(entry.is_none(), "slot {slot:?} already occupied");
        *entry = Some(pid);
    }

    pub fn clear(&mut self, slot: ChildSlot) {
        *self.slot_mut(slot) = None;
    }

    pub fn slot_of(&self, pid: Pid) -> Option<ChildSlot> {
        const SLOTS: [ChildSlot; 5] = [
            ChildSlot::ServiceManager,
            ChildSlot::Cyclog,
            ChildSlot::RegularSystemControl,
            ChildSlot::EmergencySystemControl,
            ChildSlot::KbreqSystemControl,
        ];
        SLOTS.into_iter().find(|s| self.get(*s) == Some(pid))
    }

    pub fn has_any_system_control(&self) -> bool {
        self.regular_system_control.is_some()
            || self.emergency_system_control.is_some()
            || self.kbreq_system_control.is_some()
    }
}

/// One non-blocking wait. `Ok(None)` when no more children are ready.
pub fn reap_next() -> nix::Result<Option<Reaped>> {
    loop {
        match waitpid(
            None,
            Some(WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED),
        ) {
            Ok(WaitStatus::StillAlive) => return Ok(None),
            Ok(status) => match Reaped::from_status(status) {
                Some(reaped) => return Ok(Some(reaped)),
                None => continue,
            },
            Err(Errno::ECHILD) => return Ok(None),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    #[test]
    fn one_child_per_slot() {
        let mut children = Children::default();
        assert!(!children.has(ChildSlot::Cyclog));
        children.set(ChildSlot::Cyclog, Pid::from_raw(100));
        assert!(children.has(ChildSlot::Cyclog));
        assert_eq!(children.slot_of(Pid::from_raw(100)), Some(ChildSlot::Cyclog));
        children.clear(ChildSlot::Cyclog);
        assert!(!children.has(ChildSlot::Cyclog));
        assert_eq!(children.slot_of(Pid::from_raw(100)), None);
    }

    #[test]
    fn unknown_pids_belong_to_no_slot() {
        let mut children = Children::default();
        children.set(ChildSlot::ServiceManager, Pid::from_raw(5));
        assert_eq!(children.slot_of(Pid::from_raw(6)), None);
    }

    #[test]
    fn any_system_control_covers_all_three_slots() {
        let mut children = Children::default();
        assert!(!children.has_any_system_control());
        children.set(ChildSlot::EmergencySystemControl, Pid::from_raw(9));
        assert!(children.has_any_system_control());
        children.clear(ChildSlot::EmergencySystemControl);
        children.set(ChildSlot::KbreqSystemControl, Pid::from_raw(10));
        assert!(children.has_any_system_control());
    }

    #[test]
    fn wait_status_classification() {
        let pid = Pid::from_raw(41);
        let exited = Reaped::from_status(WaitStatus::Exited(pid, 3)).unwrap();
        assert_eq!(exited.kind, ExitKind::Exited);
        assert_eq!(exited.code, 3);
        assert!(exited.is_abend());

        let clean = Reaped::from_status(WaitStatus::Exited(pid, 0)).unwrap();
        assert!(!clean.is_abend());

        let killed = Reaped::from_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false)).unwrap();
        assert_eq!(killed.kind, ExitKind::Signalled);
        assert_eq!(killed.code, 9);
        assert!(killed.is_abend());

        let core = Reaped::from_status(WaitStatus::Signaled(pid, Signal::SIGSEGV, true)).unwrap();
        assert_eq!(core.kind, ExitKind::SignalledCore);

        let paused = Reaped::from_status(WaitStatus::Stopped(pid, Signal::SIGSTOP)).unwrap();
        assert_eq!(paused.kind, ExitKind::Paused);
        assert!(!paused.is_abend());
    }

    #[test]
    fn exit_kind_log_form_is_numeric() {
        // A cyclog killed by SIGKILL logs "ended status 2 code 9".
        assert_eq!(ExitKind::Signalled.to_string(), "2");
        assert_eq!(ExitKind::Exited.to_string(), "0");
        assert_eq!(ExitKind::SignalledCore.to_string(), "3");
    }
}
