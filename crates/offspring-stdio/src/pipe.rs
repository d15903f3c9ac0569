use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use cfg_if::cfg_if;
use nix::libc;

use crate::error::StdioError;
use crate::fd::{Descriptor, set_cloexec};

/// A unidirectional pipe with close-on-exec set on both ends.
///
/// On platforms with an atomic `pipe2(O_CLOEXEC)` the flag is set before the
/// descriptors ever become visible; elsewhere it is applied with `fcntl`
/// right after creation and `created_atomically` reports `false` so callers
/// know a concurrent fork could have inherited the ends in between.
#[derive(Debug)]
pub struct Pipe {
  pub read: Arc<Descriptor>,
  pub write: Arc<Descriptor>,
  created_atomically: bool,
}

cfg_if! {
  if #[cfg(any(target_os = "linux", target_os = "android"))] {
    fn open_pipe() -> Result<(OwnedFd, OwnedFd, bool), StdioError> {
      match nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC) {
        Ok((read, write)) => Ok((read, write, true)),
        // Pre-pipe2 kernels; take the fcntl route.
        Err(nix::errno::Errno::ENOSYS) => open_pipe_nonatomic(),
        Err(errno) => Err(StdioError::io(errno, "pipe2")),
      }
    }
  } else {
    fn open_pipe() -> Result<(OwnedFd, OwnedFd, bool), StdioError> {
      open_pipe_nonatomic()
    }
  }
}

fn open_pipe_nonatomic() -> Result<(OwnedFd, OwnedFd, bool), StdioError> {
  let (read, write) = nix::unistd::pipe().map_err(|errno| StdioError::io(errno, "pipe"))?;
  // If flagging fails both ends are released by the drops on unwind.
  set_cloexec(read.as_raw_fd())?;
  set_cloexec(write.as_raw_fd())?;
  Ok((read, write, false))
}

impl Pipe {
  pub fn cloexec() -> Result<Self, StdioError> {
    let (read, write, created_atomically) = open_pipe()?;
    Ok(Self {
      read: Arc::new(Descriptor::from(read)),
      write: Arc::new(Descriptor::from(write)),
      created_atomically,
    })
  }

  pub fn created_atomically(&self) -> bool {
    self.created_atomically
  }

  /// Puts the read end in non-blocking mode. Used for the launcher's error
  /// channel so the parent never hangs on a descriptor leaked to a
  /// concurrently forked process.
  pub fn set_read_nonblocking(&self) -> Result<(), StdioError> {
    let fd = self.read.raw();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
      return Err(StdioError::last_os("fcntl(F_GETFL)"));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
      return Err(StdioError::last_os("fcntl(F_SETFL)"));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn fd_flags(fd: i32) -> i32 {
    unsafe { libc::fcntl(fd, libc::F_GETFD) }
  }

  #[test]
  fn both_ends_are_cloexec() {
    let pipe = Pipe::cloexec().unwrap();
    assert_ne!(fd_flags(pipe.read.raw()) & libc::FD_CLOEXEC, 0);
    assert_ne!(fd_flags(pipe.write.raw()) & libc::FD_CLOEXEC, 0);
  }

  #[cfg(any(target_os = "linux", target_os = "android"))]
  #[test]
  fn pipe2_path_is_atomic() {
    let pipe = Pipe::cloexec().unwrap();
    assert!(pipe.created_atomically());
  }

  #[test]
  fn nonatomic_fallback_still_flags_cloexec() {
    let (read, write, atomic) = open_pipe_nonatomic().unwrap();
    assert!(!atomic);
    assert_ne!(fd_flags(read.as_raw_fd()) & libc::FD_CLOEXEC, 0);
    assert_ne!(fd_flags(write.as_raw_fd()) & libc::FD_CLOEXEC, 0);
  }

  #[test]
  fn nonblocking_read_end() {
    let pipe = Pipe::cloexec().unwrap();
    pipe.set_read_nonblocking().unwrap();
    let flags = unsafe { libc::fcntl(pipe.read.raw(), libc::F_GETFL) };
    assert_ne!(flags & libc::O_NONBLOCK, 0);
  }

  #[test]
  fn data_flows_read_to_write() {
    let pipe = Pipe::cloexec().unwrap();
    let payload = b"ping";
    let written =
      unsafe { libc::write(pipe.write.raw(), payload.as_ptr().cast(), payload.len()) };
    assert_eq!(written, 4);
    let mut buf = [0u8; 8];
    let read = unsafe { libc::read(pipe.read.raw(), buf.as_mut_ptr().cast(), buf.len()) };
    assert_eq!(read, 4);
    assert_eq!(&buf[..4], payload);
  }
}
