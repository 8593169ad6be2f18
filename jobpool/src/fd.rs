//! Single-byte token I/O on channel file descriptors.
//!
//! Every read and write moves exactly one byte, so one byte in the kernel
//! buffer always corresponds to one free token.
//!
//! ## Blocking model
//!
//! Waiting is done with poll(2). Two kinds of readers exist:
//! - **private non-blocking** (FIFO readers, reopened pipe readers): after every
//!   poll wakeup *or* probe interval we attempt a read. Linux does not raise
//!   POLLHUP on a FIFO whose only writer connected before the reader, so the
//!   periodic read is what turns "last writer gone" into `ChannelClosed`.
//! - **shared blocking** (inherited pipe fds whose open file description we
//!   must not flip to O_NONBLOCK): we only read after poll reports POLLIN.
//!   Another process can win the race for that byte, in which case the read
//!   blocks until the next token arrives.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::Path;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::error::{PoolError, Result};

/// Upper bound on how long a closed channel can go unnoticed by a blocked reader.
pub(crate) const CLOSE_PROBE_INTERVAL: Duration = Duration::from_millis(200);

/// Read one token, waiting up to `timeout` (`None` waits forever).
///
/// Returns `Ok(None)` when the timeout elapses, `Err(ChannelClosed)` when the
/// last writer is gone.
pub(crate) fn read_token(
    file: &File,
    timeout: Option<Duration>,
    nonblocking: bool,
) -> Result<Option<u8>> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let wait = match (remaining, nonblocking) {
            (Some(r), true) => Some(r.min(CLOSE_PROBE_INTERVAL)),
            (None, true) => Some(CLOSE_PROBE_INTERVAL),
            (r, false) => r,
        };

        let ready = wait_readable(file, wait)?;
        if ready || nonblocking {
            if let Some(byte) = try_read_token(file)? {
                return Ok(Some(byte));
            }
        }

        if remaining.is_some_and(|r| r.is_zero()) {
            return Ok(None);
        }
    }
}

/// A single read attempt. `Ok(None)` means the fd would block.
pub(crate) fn try_read_token(file: &File) -> Result<Option<u8>> {
    let mut buf = [0u8; 1];
    loop {
        match (&*file).read(&mut buf) {
            Ok(0) => return Err(PoolError::ChannelClosed),
            Ok(_) => return Ok(Some(buf[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
}

fn wait_readable(file: &File, wait: Option<Duration>) -> Result<bool> {
    let timeout = match wait {
        None => PollTimeout::NONE,
        Some(d) => PollTimeout::try_from(d).unwrap_or(PollTimeout::MAX),
    };
    loop {
        let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(0) => return Ok(false),
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                if revents.contains(PollFlags::POLLNVAL) {
                    return Err(io::Error::from(Errno::EBADF).into());
                }
                // POLLHUP without POLLIN still needs a read to observe EOF.
                return Ok(true);
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Write one token. Never waits: a full channel means some participant
/// released more tokens than it acquired.
pub(crate) fn write_token(file: &File, byte: u8) -> Result<()> {
    loop {
        match (&*file).write(&[byte]) {
            Ok(1) => return Ok(()),
            Ok(_) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                return Err(PoolError::ChannelClosed);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(io::Error::other(
                    "token channel is full: more tokens released than acquired",
                )
                .into());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Open the read end of a FIFO without waiting for a writer.
pub(crate) fn open_fifo_reader(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)
        .map_err(closed_if_gone)?;
    ensure_fifo(&file, path)?;
    Ok(file)
}

/// Open the write end of a FIFO. Fails with `ChannelClosed` when nobody
/// holds the read end any more.
pub(crate) fn open_fifo_writer(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)
        .map_err(closed_if_gone)
}

fn closed_if_gone(e: io::Error) -> PoolError {
    match e.raw_os_error().map(Errno::from_raw) {
        Some(Errno::ENOENT) | Some(Errno::ENXIO) => PoolError::ChannelClosed,
        _ => PoolError::Io(e),
    }
}

fn ensure_fifo(file: &File, path: &Path) -> Result<()> {
    if file.metadata()?.file_type().is_fifo() {
        Ok(())
    } else {
        Err(PoolError::InvalidDescriptor(format!(
            "{} is not a fifo",
            path.display()
        )))
    }
}

/// Clear FD_CLOEXEC so the fd survives exec into the wrapped command.
pub(crate) fn set_inheritable(fd: &OwnedFd) -> io::Result<()> {
    fcntl(fd.as_fd(), FcntlArg::F_SETFD(FdFlag::empty()))?;
    Ok(())
}

/// Whether `fd` refers to an open file description in this process.
pub(crate) fn is_open(fd: RawFd) -> bool {
    // Safety: F_GETFD only inspects the descriptor table, any integer is accepted.
    unsafe { nix::libc::fcntl(fd, nix::libc::F_GETFD) != -1 }
}

/// Duplicate an inherited pipe fd into one we own, leaving the inherited
/// number untouched for our own children.
pub(crate) fn dup_inherited(fd: RawFd) -> Result<File> {
    if !is_open(fd) {
        return Err(PoolError::InvalidDescriptor(format!("fd {fd} is not open")));
    }
    // Safety: checked open above; the borrow ends before this function returns.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let owned = nix::unistd::dup(borrowed)?;
    fcntl(owned.as_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;

    let file = File::from(owned);
    if !file.metadata()?.file_type().is_fifo() {
        return Err(PoolError::InvalidDescriptor(format!("fd {fd} is not a pipe")));
    }
    Ok(file)
}

/// Open a private non-blocking description of a pipe we hold.
///
/// Only possible through procfs; callers fall back to the shared blocking
/// description when this fails.
pub(crate) fn reopen_nonblocking(file: &File) -> io::Result<File> {
    #[cfg(target_os = "linux")]
    {
        let path = format!("/proc/self/fd/{}", file.as_raw_fd());
        OpenOptions::new()
            .read(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(path)
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = file;
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_files() -> (File, File) {
        let (r, w) = nix::unistd::pipe().unwrap();
        (File::from(r), File::from(w))
    }

    #[test]
    fn one_byte_per_operation() {
        let (r, w) = pipe_files();
        write_token(&w, b'a').unwrap();
        write_token(&w, b'b').unwrap();

        assert_eq!(read_token(&r, Some(Duration::ZERO), false).unwrap(), Some(b'a'));
        assert_eq!(read_token(&r, Some(Duration::ZERO), false).unwrap(), Some(b'b'));
        assert_eq!(read_token(&r, Some(Duration::ZERO), false).unwrap(), None);
    }

    #[test]
    fn timeout_elapses_without_tokens() {
        let (r, _w) = pipe_files();
        let start = Instant::now();
        let got = read_token(&r, Some(Duration::from_millis(50)), false).unwrap();
        assert_eq!(got, None);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn eof_is_channel_closed() {
        let (r, w) = pipe_files();
        drop(w);
        let err = read_token(&r, None, false).unwrap_err();
        assert!(matches!(err, PoolError::ChannelClosed));
    }

    #[test]
    fn write_to_readerless_pipe_is_channel_closed() {
        let (r, w) = pipe_files();
        drop(r);
        let err = write_token(&w, b'+').unwrap_err();
        assert!(matches!(err, PoolError::ChannelClosed));
    }

    #[test]
    fn dup_rejects_non_pipe() {
        let file = tempfile::tempfile().unwrap();
        let err = dup_inherited(file.as_raw_fd()).unwrap_err();
        assert!(matches!(err, PoolError::InvalidDescriptor(_)));
    }

    #[test]
    fn missing_fifo_is_channel_closed() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_fifo_reader(&dir.path().join("gone")).unwrap_err();
        assert!(matches!(err, PoolError::ChannelClosed));
    }
}
