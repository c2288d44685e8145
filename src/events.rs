//! Pending-event flags and the two signal dialects.
//!
//! Everything the root reacts to (signals, FIFO command bytes, its own
//! boot-time one-shot) is folded into one set of flags. Signal handlers are
//! the only writers besides the loop; each flag is a single atomic word, so
//! no locking is needed anywhere.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::RootMode;

/// One kind of external event.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Event {
    Sysinit,
    Normal,
    Rescue,
    Emergency,
    Halt,
    Poweroff,
    Powercycle,
    Reboot,
    FastHalt,
    FastPoweroff,
    FastPowercycle,
    FastReboot,
    Power,
    Kbrequest,
    Sak,
    RestartLoggerKeepCwd,
    RestartLoggerResetCwd,
    RestartLoggerCycleDirs,
    Child,
    Init,
    Unknown,
}

const EVENT_COUNT: usize = Event::Unknown as usize + 1;

/// The set of events waiting for the transition arbiter.
///
/// Flags are monotonic within a loop iteration: intake sets, the arbiter
/// clears via [`PendingEvents::take`]. The stop-kind flags are sticky (read
/// with [`PendingEvents::stop_signalled`], never cleared), so once any of
/// them is set the arbiter can only drive the system toward termination.
pub struct PendingEvents {
    flags: [Arc<AtomicBool>; EVENT_COUNT],
}

impl PendingEvents {
    pub fn new() -> PendingEvents {
        let flags: [Arc<AtomicBool>; EVENT_COUNT] =
            std::array::from_fn(|_| Arc::new(AtomicBool::new(false)));
        let pending = PendingEvents { flags };
        // The boot-time "system-control init" one-shot is pending from the
        // start and is never raised again.
        pending.set(Event::Init);
        pending
    }

    /// The shared flag behind one event, in the shape `signal_hook::flag`
    /// wants to own a clone of.
    pub fn flag(&self, event: Event) -> &Arc<AtomicBool> {
        &self.flags[event as usize]
    }

    pub fn set(&self, event: Event) {
        self.flags[event as usize].store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self, event: Event) -> bool {
        self.flags[event as usize].load(Ordering::SeqCst)
    }

    /// Consume an event: clears the flag and reports whether it was set.
    pub fn take(&self, event: Event) -> bool {
        self.flags[event as usize].swap(false, Ordering::SeqCst)
    }

    pub fn stop_signalled(&self) -> bool {
        self.is_set(Event::FastHalt)
            || self.is_set(Event::FastPoweroff)
            || self.is_set(Event::FastPowercycle)
            || self.is_set(Event::FastReboot)
    }

    pub fn restart_logger_signalled(&self) -> bool {
        self.is_set(Event::RestartLoggerKeepCwd)
            || self.is_set(Event::RestartLoggerResetCwd)
            || self.is_set(Event::RestartLoggerCycleDirs)
    }
}

/// Every signal the root traps, with its per-dialect meaning. Signals that
/// are trapped but carry no meaning in the dialect surface as
/// [`Event::Unknown`].
pub fn signal_table(mode: RootMode) -> Vec<(i32, Event)> {
    let rt = libc::SIGRTMIN();
    let mut table: Vec<(i32, Event)> = vec![(libc::SIGCHLD, Event::Child)];

    match mode {
        RootMode::SystemRoot => {
            table.extend([
                (libc::SIGPWR, Event::Power),
                (crate::platform::KBREQ_SIGNAL, Event::Kbrequest),
                (crate::platform::SAK_SIGNAL, Event::Sak),
                // A machine-level root does not halt on terminal signals.
                (libc::SIGTERM, Event::Unknown),
                (libc::SIGHUP, Event::Unknown),
                (libc::SIGPIPE, Event::Unknown),
                (rt, Event::Normal),
                (rt + 1, Event::Rescue),
                (rt + 2, Event::Emergency),
                (rt + 3, Event::Halt),
                (rt + 4, Event::Poweroff),
                (rt + 5, Event::Reboot),
                (rt + 7, Event::Powercycle),
                (rt + 10, Event::Sysinit),
                (rt + 13, Event::FastHalt),
                (rt + 14, Event::FastPoweroff),
                (rt + 15, Event::FastReboot),
                (rt + 17, Event::FastPowercycle),
            ]);
        }
        RootMode::UserSessionRoot => {
            table.extend([
                (libc::SIGINT, Event::Halt),
                (libc::SIGTERM, Event::Halt),
                (libc::SIGHUP, Event::Halt),
                (libc::SIGPIPE, Event::Halt),
                // Rescue and emergency are meaningless for a session; they
                // demote to a plain start.
                (rt, Event::Normal),
                (rt + 1, Event::Normal),
                (rt + 2, Event::Normal),
                (rt + 3, Event::Halt),
                (rt + 4, Event::Halt),
                (rt + 5, Event::Halt),
                (rt + 7, Event::Unknown),
                (rt + 10, Event::Sysinit),
                (rt + 13, Event::FastHalt),
                (rt + 14, Event::FastHalt),
                (rt + 15, Event::FastHalt),
                (rt + 17, Event::Unknown),
            ]);
        }
    }

    table.extend([
        (rt + 26, Event::RestartLoggerKeepCwd),
        (rt + 27, Event::RestartLoggerResetCwd),
        (rt + 28, Event::RestartLoggerCycleDirs),
    ]);
    table
}

/// Map one FIFO command byte to an event. The single-character vocabulary is
/// the whole protocol surface; a per-user root demotes the machine-level
/// letters.
pub fn decode_command(mode: RootMode, byte: u8) -> Event {
    let system = mode.is_system();
    match byte {
        b'R' => {
            if system {
                Event::FastReboot
            } else {
                Event::FastHalt
            }
        }
        b'r' => {
            if system {
                Event::Reboot
            } else {
                Event::Halt
            }
        }
        b'H' => Event::FastHalt,
        b'h' => Event::Halt,
        b'C' => {
            if system {
                Event::FastPowercycle
            } else {
                Event::FastHalt
            }
        }
        b'c' => {
            if system {
                Event::Powercycle
            } else {
                Event::Halt
            }
        }
        b'P' => {
            if system {
                Event::FastPoweroff
            } else {
                Event::FastHalt
            }
        }
        b'p' => {
            if system {
                Event::Poweroff
            } else {
                Event::Halt
            }
        }
        b'S' => Event::Sysinit,
        b's' => {
            if system {
                Event::Rescue
            } else {
                Event::Unknown
            }
        }
        b'b' => {
            if system {
                Event::Emergency
            } else {
                Event::Unknown
            }
        }
        b'n' => Event::Normal,
        b'L' => Event::RestartLoggerCycleDirs,
        b'l' => Event::RestartLoggerKeepCwd,
        _ => Event::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RootMode::{SystemRoot, UserSessionRoot};

    fn lookup(mode: RootMode, signo: i32) -> Option<Event> {
        signal_table(mode)
            .into_iter()
            .find(|(s, _)| *s == signo)
            .map(|(_, e)| e)
    }

    #[test]
    fn init_is_pending_from_the_start() {
        let pending = PendingEvents::new();
        assert!(pending.is_set(Event::Init));
        assert!(pending.take(Event::Init));
        assert!(!pending.take(Event::Init));
    }

    #[test]
    fn take_consumes_exactly_once() {
        let pending = PendingEvents::new();
        pending.set(Event::Reboot);
        assert!(pending.take(Event::Reboot));
        assert!(!pending.take(Event::Reboot));
        assert!(!pending.is_set(Event::Reboot));
    }

    #[test]
    fn stop_kinds_are_sticky() {
        let pending = PendingEvents::new();
        assert!(!pending.stop_signalled());
        pending.set(Event::FastReboot);
        assert!(pending.stop_signalled());
        // Nothing in the arbiter path clears a stop kind; reading it twice
        // still reports it.
        assert!(pending.stop_signalled());
    }

    #[test]
    fn system_dialect_maps_realtime_verbs() {
        let rt = libc::SIGRTMIN();
        assert_eq!(lookup(SystemRoot, rt), Some(Event::Normal));
        assert_eq!(lookup(SystemRoot, rt + 2), Some(Event::Emergency));
        assert_eq!(lookup(SystemRoot, rt + 5), Some(Event::Reboot));
        assert_eq!(lookup(SystemRoot, rt + 10), Some(Event::Sysinit));
        assert_eq!(lookup(SystemRoot, rt + 15), Some(Event::FastReboot));
        assert_eq!(lookup(SystemRoot, rt + 17), Some(Event::FastPowercycle));
        assert_eq!(
            lookup(SystemRoot, rt + 28),
            Some(Event::RestartLoggerCycleDirs)
        );
        assert_eq!(lookup(SystemRoot, libc::SIGCHLD), Some(Event::Child));
        assert_eq!(lookup(SystemRoot, libc::SIGPWR), Some(Event::Power));
        // Terminal signals carry no meaning for the machine root.
        assert_eq!(lookup(SystemRoot, libc::SIGTERM), Some(Event::Unknown));
    }

    #[test]
    fn user_dialect_folds_terminal_signals_into_halt() {
        for signo in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP, libc::SIGPIPE] {
            assert_eq!(lookup(UserSessionRoot, signo), Some(Event::Halt));
        }
    }

    #[test]
    fn user_dialect_demotes_machine_verbs() {
        let rt = libc::SIGRTMIN();
        assert_eq!(lookup(UserSessionRoot, rt + 2), Some(Event::Normal));
        assert_eq!(lookup(UserSessionRoot, rt + 4), Some(Event::Halt));
        assert_eq!(lookup(UserSessionRoot, rt + 14), Some(Event::FastHalt));
        assert_eq!(lookup(UserSessionRoot, rt + 7), Some(Event::Unknown));
        assert_eq!(lookup(UserSessionRoot, libc::SIGPWR), None);
    }

    #[test]
    fn command_bytes_decode_per_dialect() {
        assert_eq!(decode_command(SystemRoot, b'R'), Event::FastReboot);
        assert_eq!(decode_command(SystemRoot, b'r'), Event::Reboot);
        assert_eq!(decode_command(SystemRoot, b'S'), Event::Sysinit);
        assert_eq!(decode_command(SystemRoot, b's'), Event::Rescue);
        assert_eq!(decode_command(SystemRoot, b'b'), Event::Emergency);
        assert_eq!(decode_command(SystemRoot, b'L'), Event::RestartLoggerCycleDirs);
        assert_eq!(decode_command(SystemRoot, b'l'), Event::RestartLoggerKeepCwd);

        assert_eq!(decode_command(UserSessionRoot, b'R'), Event::FastHalt);
        assert_eq!(decode_command(UserSessionRoot, b'r'), Event::Halt);
        assert_eq!(decode_command(UserSessionRoot, b'C'), Event::FastHalt);
        assert_eq!(decode_command(UserSessionRoot, b'p'), Event::Halt);
        assert_eq!(decode_command(UserSessionRoot, b's'), Event::Unknown);
        assert_eq!(decode_command(UserSessionRoot, b'b'), Event::Unknown);
        // The halt letters mean the same thing everywhere.
        assert_eq!(decode_command(UserSessionRoot, b'H'), Event::FastHalt);
        assert_eq!(decode_command(UserSessionRoot, b'h'), Event::Halt);
    }

    #[test]
    fn unrecognised_bytes_are_unknown() {
        assert_eq!(decode_command(SystemRoot, b'Z'), Event::Unknown);
        assert_eq!(decode_command(UserSessionRoot, 0), Event::Unknown);
    }
}
