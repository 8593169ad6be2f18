//! Interruption signals the coordinator relays to the wrapped command.

use std::io;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::signal::unix::{SignalKind, signal};

/// SIGINT, SIGTERM and SIGHUP listeners.
///
/// Installing them replaces the default "terminate" disposition, so the
/// coordinator outlives an interrupt long enough to tear the pool down.
pub(crate) struct Interrupts {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

impl Interrupts {
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the next interruption.
    pub async fn recv(&mut self) -> Signal {
        tokio::select! {
            Some(()) = self.interrupt.recv() => Signal::SIGINT,
            Some(()) = self.terminate.recv() => Signal::SIGTERM,
            Some(()) = self.hangup.recv() => Signal::SIGHUP,
            // Signal driver gone: nothing will ever arrive.
            else => std::future::pending().await,
        }
    }
}

/// Send `signal` to `pid`. A process that already exited is not an error.
pub(crate) fn forward(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        tracing::warn!(pid, "Child pid out of range, not forwarding signal");
        return;
    };
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) => tracing::info!(pid, %signal, "Forwarded signal to wrapped command"),
        Err(nix::errno::Errno::ESRCH) => {
            tracing::debug!(pid, %signal, "Wrapped command already gone")
        }
        Err(e) => tracing::warn!(pid, %signal, error = %e, "Failed to forward signal"),
    }
}
