//! Descriptor discipline: filler fds, saved stdio, and the log pipe.
//!
//! Children inherit a fixed numbering (0 is /dev/null, 1 and 2 are the log
//! pipe, 3 is the listening socket), and the only robust way to guarantee
//! it is to occupy the low descriptors early and replace each one exactly
//! once via dup2.

use std::{
    fs::{File, OpenOptions},
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use nix::{fcntl::OFlag, unistd};
use tracing::{error, warn};

use crate::{listen::LISTEN_SOCKET_FILENO, InitError, RootMode};

/// Placeholder descriptors keeping 0..=3 occupied during initialisation so
/// everything we open lands above the range children expect at fixed
/// positions. Each slot is released at the moment the real descriptor is
/// dup2'd into its numeric position.
pub struct FillerFds {
    slots: [Option<File>; (LISTEN_SOCKET_FILENO + 1) as usize],
}

impl FillerFds {
    /// Claim whichever of 0..=3 are currently closed. `open("/")` always
    /// takes the lowest free descriptor, so the first handle past 3 means
    /// the range is fully occupied.
    pub fn acquire() -> io::Result<FillerFds> {
        let mut slots: [Option<File>; 4] = [None, None, None, None];
        loop {
            let handle = File::open("/")?;
            let raw = handle.as_raw_fd();
            if raw > LISTEN_SOCKET_FILENO {
                break;
            }
            slots[raw as usize] = Some(handle);
        }
        Ok(FillerFds { slots })
    }

    /// True when the descriptor was closed at program start and we are
    /// holding its number.
    pub fn holds(&self, fd: RawFd) -> bool {
        self.slots
            .get(fd as usize)
            .map_or(false, |slot| slot.is_some())
    }

    pub fn release(&mut self, fd: RawFd) {
        if let Some(slot) = self.slots.get_mut(fd as usize) {
            *slot = None;
        }
    }

    pub fn release_all(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

/// The stdin/stdout/stderr this process started with, duplicated aside
/// before the log pipe replaces them. They seed the /dev/null and
/// /dev/console fallbacks, feed cyclog's own stdout and stderr, and take
/// descriptors 0..2 back when the logger is torn down at shutdown.
pub struct SavedStdio {
    fds: [Option<OwnedFd>; 3],
}

impl SavedStdio {
    /// Duplicate whichever of 0/1/2 were actually open at start, meaning
    /// the ones the filler does not hold.
    pub fn save(fillers: &FillerFds) -> SavedStdio {
        let mut fds = [None, None, None];
        for (i, slot) in fds.iter_mut().enumerate() {
            if fillers.holds(i as RawFd) {
                continue;
            }
            match dup_out_of_low_range(i as RawFd) {
                Ok(fd) => *slot = Some(fd),
                Err(e) => warn!("cannot save descriptor {i}: {e}"),
            }
        }
        SavedStdio { fds }
    }

    pub fn get(&self, i: usize) -> Option<&OwnedFd> {
        self.fds[i].as_ref()
    }

    fn set_if_absent(&mut self, i: usize, fd: OwnedFd) {
        if self.fds[i].is_none() {
            self.fds[i] = Some(fd);
        }
    }

    /// Reinstall the saved descriptors over 0..2. Used when the log pipe is
    /// torn down so our final messages still have a destination.
    pub fn reinstall(&self) {
        for (i, slot) in self.fds.iter().enumerate() {
            if let Some(fd) = slot {
                if unsafe { libc::dup2(fd.as_raw_fd(), i as RawFd) } == -1 {
                    error!(
                        "cannot restore descriptor {i}: {}",
                        io::Error::last_os_error()
                    );
                }
            }
        }
    }
}

/// Duplicate a descriptor to a number above the reserved range, close-on-exec.
fn dup_out_of_low_range(fd: RawFd) -> io::Result<OwnedFd> {
    let min = LISTEN_SOCKET_FILENO + 1;
    let duplicate = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, min as libc::c_int) };
    if duplicate < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(duplicate) })
}

/// The anonymous pipe carrying the combined log stream. The write end is
/// dup2'd over the root's (and the service manager's) stdout and stderr; the
/// read end becomes cyclog's stdin.
pub struct LogPipe {
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
}

impl LogPipe {
    pub fn open() -> Result<LogPipe, InitError> {
        let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC).map_err(InitError::LogPipe)?;
        Ok(LogPipe {
            read: Some(read),
            write: Some(write),
        })
    }

    /// Point our own stdout and stderr down the pipe. Device files like
    /// /dev/console do not exist yet; from here on, early boot messages
    /// queue in the pipe until the first cyclog starts draining it.
    pub fn adopt_stdout_stderr(&self, fillers: &mut FillerFds) {
        let Some(write) = &self.write else { return };
        for fd in [1, 2] {
            match unsafe { libc::dup2(write.as_raw_fd(), fd) } {
                -1 => error!(
                    "cannot route descriptor {fd} into the log pipe: {}",
                    io::Error::last_os_error()
                ),
                _ => fillers.release(fd),
            }
        }
    }

    pub fn read_end(&self) -> Option<&OwnedFd> {
        self.read.as_ref()
    }

    pub fn write_end(&self) -> Option<&OwnedFd> {
        self.write.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.read.is_some()
    }

    /// Release both ends. Once the service manager is gone and saved stdio
    /// is back on 0..2, this leaves cyclog as the last reader: it sees EOF
    /// and exits on its own.
    pub fn close(&mut self) {
        self.read = None;
        self.write = None;
    }
}

/// Open /dev/null for reading, the stdin of every spawned service manager.
pub fn open_null() -> Option<OwnedFd> {
    match File::open("/dev/null") {
        Ok(f) => Some(OwnedFd::from(f)),
        Err(e) => {
            warn!("/dev/null: {e}");
            None
        }
    }
}

/// Make sure the saved stdio set is fully populated, so that during
/// shutdown there is always somewhere to write messages.
pub fn last_resort_io_defaults(mode: RootMode, dev_null: Option<&OwnedFd>, saved: &mut SavedStdio) {
    // Saved standard input falls back to /dev/null.
    if saved.get(0).is_none() {
        if let Some(null) = dev_null {
            match null.try_clone() {
                Ok(fd) => saved.set_if_absent(0, fd),
                Err(e) => warn!("cannot seed saved stdin: {e}"),
            }
        }
    }

    if mode.is_system() {
        // The console is the logger of last resort.
        let console = match OpenOptions::new().read(true).write(true).open("/dev/console") {
            Ok(console) => Some(OwnedFd::from(console)),
            Err(e) => {
                warn!("/dev/console: {e}");
                saved.get(0).and_then(|stdin| stdin.try_clone().ok())
            }
        };
        if let Some(console) = console {
            saved.set_if_absent(1, console);
        }
    } else if saved.get(1).is_none() {
        // A per-user root has no console; whatever standard input was is the
        // best remaining sink.
        let stdin = saved.get(0).and_then(|fd| fd.try_clone().ok());
        if let Some(fd) = stdin {
            saved.set_if_absent(1, fd);
        }
    }

    if saved.get(2).is_none() {
        let stdout = saved.get(1).and_then(|fd| fd.try_clone().ok());
        if let Some(fd) = stdout {
            saved.set_if_absent(2, fd);
        }
    }
}
