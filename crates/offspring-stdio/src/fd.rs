use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::libc;
use tracing::warn;

use crate::error::StdioError;

/// Owns one OS file descriptor.
///
/// `close` is idempotent and never touches the three standard descriptors:
/// those belong to the process, not to this library, and keeping them open
/// also guarantees that freshly created descriptors land above slot 2.
#[derive(Debug)]
pub struct Descriptor {
  fd: RawFd,
  closed: AtomicBool,
}

impl Descriptor {
  pub fn new(fd: RawFd) -> Self {
    Self {
      fd,
      closed: AtomicBool::new(false),
    }
  }

  pub fn raw(&self) -> RawFd {
    self.fd
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  /// Closes the descriptor. Subsequent calls are no-ops, as is any call on
  /// a standard descriptor (0, 1, 2).
  pub fn close(&self) -> Result<(), StdioError> {
    if (0..=2).contains(&self.fd) {
      return Ok(());
    }
    if self.closed.swap(true, Ordering::SeqCst) {
      return Ok(());
    }
    Errno::result(unsafe { libc::close(self.fd) })
      .map(drop)
      .map_err(|errno| StdioError::io(errno, "close"))
  }
}

impl AsRawFd for Descriptor {
  fn as_raw_fd(&self) -> RawFd {
    self.fd
  }
}

impl From<OwnedFd> for Descriptor {
  fn from(fd: OwnedFd) -> Self {
    Self::new(fd.into_raw_fd())
  }
}

impl Drop for Descriptor {
  fn drop(&mut self) {
    if let Err(err) = self.close() {
      warn!("dropping descriptor {}: {err}", self.fd);
    }
  }
}

/// Sets `FD_CLOEXEC` on a raw descriptor.
pub fn set_cloexec(fd: RawFd) -> Result<(), StdioError> {
  let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
  if flags == -1 {
    return Err(StdioError::last_os("fcntl(F_GETFD)"));
  }
  if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } == -1 {
    return Err(StdioError::last_os("fcntl(F_SETFD)"));
  }
  Ok(())
}
