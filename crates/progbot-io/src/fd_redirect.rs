//! File descriptor redirection for result stream isolation.
//!
//! The worker uses fd 1 (stdout) as the result stream to the supervisor. Camera
//! drivers and the native libraries under them like to print to stdout, which
//! would corrupt the length-prefixed frames.
//!
//! We move the result stream to a private duplicate of fd 1 early in startup,
//! then point fd 1 at stderr. Anything written to stdout afterwards lands in
//! the supervisor's log output instead of the protocol.
//!
//! Must be called before the driver is constructed.
//!
//! ## Safety contracts
//!
//! 1. Called before any driver code runs (tokio runtime threads exist but are
//!    not touching fds 1/2).
//! 2. Standard fds (1, 2) are guaranteed open by the OS at process startup.
//! 3. The `OwnedFd` built over fd 1 is forgotten after `dup2`, so fd 1 is never
//!    closed by us.

use std::io;

#[cfg(unix)]
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

#[cfg(unix)]
use nix::unistd::{dup, dup2};

/// Detach the result stream from fd 1.
///
/// Returns a file over the original stdout. After this call fd 1 is an alias
/// of stderr.
#[cfg(unix)]
pub fn isolate_result_stream() -> io::Result<std::fs::File> {
    // Safety: fd 1 and 2 are open for the life of the process.
    let results = unsafe {
        let fd = BorrowedFd::borrow_raw(1);
        dup(fd)
    }
    .map_err(|e| io::Error::other(format!("dup(1) failed: {}", e)))?;

    let stderr = unsafe { BorrowedFd::borrow_raw(2) };
    let mut target_fd1 = unsafe { OwnedFd::from_raw_fd(1) };
    let redirected = dup2(stderr, &mut target_fd1);
    std::mem::forget(target_fd1); // Don't close fd 1
    redirected.map_err(|e| io::Error::other(format!("dup2(stderr -> stdout) failed: {}", e)))?;

    tracing::debug!(
        result_fd = results.as_raw_fd(),
        "Result stream moved off stdout"
    );

    Ok(std::fs::File::from(results))
}

#[cfg(not(unix))]
pub fn isolate_result_stream() -> io::Result<std::fs::File> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "stdout isolation needs unix file descriptors",
    ))
}
