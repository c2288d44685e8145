//! Signal intake.
//!
//! Handlers do exactly two async-signal-safe things: set the pending flag
//! for the event and write one byte to the wake socket. The loop owns the
//! read side and drains it before re-arming, so delivery can coalesce but
//! never get lost: the flag is set before the byte is written.

use std::{io, os::unix::net::UnixStream as StdUnixStream};

use signal_hook::{flag, low_level::pipe, SigId};
use tokio::net::UnixStream;
use tracing::warn;

use crate::{
    events::{self, PendingEvents},
    RootMode,
};

pub struct SignalIntake {
    wake: UnixStream,
    // Handlers write into this for the life of the process.
    _wake_write: StdUnixStream,
    _registrations: Vec<SigId>,
}

pub fn install(mode: RootMode, pending: &PendingEvents) -> io::Result<SignalIntake> {
    let (read, write) = StdUnixStream::pair()?;
    read.set_nonblocking(true)?;
    // A full socket must never block a signal handler.
    write.set_nonblocking(true)?;

    let mut registrations = Vec::new();
    for (signo, event) in events::signal_table(mode) {
        // The flag hook runs before the pipe hook: registration order is
        // execution order, and the loop must observe the flag once woken.
        match flag::register(signo, pending.flag(event).clone()) {
            Ok(id) => registrations.push(id),
            Err(e) => {
                warn!("cannot trap signal {signo}: {e}");
                continue;
            }
        }
        match pipe::register(signo, write.try_clone()?) {
            Ok(id) => registrations.push(id),
            Err(e) => warn!("cannot arm wake-up for signal {signo}: {e}"),
        }
    }

    Ok(SignalIntake {
        wake: UnixStream::from_std(read)?,
        _wake_write: write,
        _registrations: registrations,
    })
}

impl SignalIntake {
    /// Resolves once any trapped signal has fired since the last drain.
    pub async fn wait(&self) -> io::Result<()> {
        self.wake.readable().await
    }

    /// Discard queued wake bytes so the next wait blocks again.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match self.wake.try_read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }
}
