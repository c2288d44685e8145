//! The OS-specific corners: signal numbers, console hotkeys, the reboot
//! syscall. Everything above this module is platform-independent.

use std::{env, fs::OpenOptions, io, os::fd::AsRawFd};

use nix::sys::reboot::{set_cad_enabled, RebootMode};
use tracing::{error, warn};

use crate::events::{Event, PendingEvents};

/// The keyboard-request signal: what the kernel raises at us for the VT
/// "KeyboardSignal" key once KDSIGACCEPT routes it here.
pub const KBREQ_SIGNAL: i32 = libc::SIGWINCH;

/// Secure attention key: with the Ctrl-Alt-Del default action disabled, the
/// kernel delivers SIGINT to the init process instead.
pub const SAK_SIGNAL: i32 = libc::SIGINT;

const KDSIGACCEPT: libc::c_ulong = 0x4B4E;

/// Take over the reboot hotkeys: Ctrl-Alt-Del becomes a signal rather than
/// an instant reboot, and the keyboard-request key gets routed to us.
pub fn claim_reboot_hotkeys() {
    if let Err(e) = set_cad_enabled(false) {
        warn!("cannot disable Ctrl-Alt-Del: {e}");
    }
    match OpenOptions::new().read(true).write(true).open("/dev/tty0") {
        Ok(tty) => {
            let rc = unsafe {
                libc::ioctl(tty.as_raw_fd(), KDSIGACCEPT, KBREQ_SIGNAL as libc::c_ulong)
            };
            if rc < 0 {
                warn!("KDSIGACCEPT: {}", io::Error::last_os_error());
            }
        }
        Err(e) => warn!("/dev/tty0: {e}"),
    }
}

/// Inside a container the kernel reboot interface belongs to the host; the
/// container manager marks us with the conventional variable.
pub fn in_container() -> bool {
    env::var_os("container").map_or(false, |value| !value.is_empty())
}

/// The reboot flag for the sticky stop kind that got us here. Linux has no
/// powercycle flag, so that one boots again like a plain reboot.
pub fn reboot_mode(pending: &PendingEvents) -> RebootMode {
    if pending.is_set(Event::FastPoweroff) {
        RebootMode::RB_POWER_OFF
    } else if pending.is_set(Event::FastHalt) {
        RebootMode::RB_HALT_SYSTEM
    } else {
        RebootMode::RB_AUTOBOOT
    }
}

/// The last thing the system root ever does.
pub fn end_system(pending: &PendingEvents) {
    if let Err(e) = nix::sys::reboot::reboot(reboot_mode(pending)) {
        error!("reboot: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poweroff_outranks_halt_outranks_reboot() {
        let pending = PendingEvents::new();
        pending.set(Event::FastReboot);
        assert_eq!(reboot_mode(&pending), RebootMode::RB_AUTOBOOT);
        pending.set(Event::FastHalt);
        assert_eq!(reboot_mode(&pending), RebootMode::RB_HALT_SYSTEM);
        pending.set(Event::FastPoweroff);
        assert_eq!(reboot_mode(&pending), RebootMode::RB_POWER_OFF);
    }

    #[test]
    fn powercycle_falls_back_to_autoboot() {
        let pending = PendingEvents::new();
        pending.set(Event::FastPowercycle);
        assert_eq!(reboot_mode(&pending), RebootMode::RB_AUTOBOOT);
    }
}
