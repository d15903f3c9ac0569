//! The fork+exec launch path and its error-pipe protocol.
//!
//! Failures between fork and exec cannot unwind across the process
//! boundary, so the child reports them over a CLOEXEC pipe as exactly five
//! bytes (big-endian errno + step tag) and `_exit(127)`s. A successful
//! exec closes the pipe and the parent reads EOF. No user code ever runs
//! in the child before exec.

use std::ffi::CString;
use std::os::fd::RawFd;
use std::time::Duration;

use cfg_if::cfg_if;
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{SigSet, SigmaskHow, Signal, kill, sigprocmask};
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, fork};
use offspring_stdio::{Pipe, StdioHandle};
use tracing::warn;

use crate::error::{Error, Result};
use crate::spawn::LaunchRequest;

/// Wire format: 4 bytes big-endian errno, 1 tag byte.
const ERROR_RECORD_LEN: usize = 5;

/// Iterations of the parent's non-blocking read loop before giving up.
///
/// Only enforced when the error pipe could not be created with atomic
/// CLOEXEC: a concurrent fork elsewhere in the process may then have
/// inherited the write end, in which case EOF never arrives. The bound
/// makes that pathological case fail after ~100 ms instead of hanging;
/// raising it trades latency for tolerance on heavily loaded systems.
const ERROR_PIPE_READ_ATTEMPTS: u32 = 100;

const ERROR_PIPE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// One retry after ~3 ms when exec hits a transiently busy text file.
const ETXTBSY_RETRY_DELAY: Duration = Duration::from_millis(3);

/// Which child-side step failed before exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ChildFault {
  Dup2 = 1,
  FdCloexec = 2,
  Chdir = 3,
  SigMask = 4,
  Exec = 5,
}

impl ChildFault {
  pub(crate) fn from_tag(tag: u8) -> Option<Self> {
    match tag {
      1 => Some(Self::Dup2),
      2 => Some(Self::FdCloexec),
      3 => Some(Self::Chdir),
      4 => Some(Self::SigMask),
      5 => Some(Self::Exec),
      _ => None,
    }
  }

  pub(crate) fn describe(self) -> &'static str {
    match self {
      Self::Dup2 => "child process dup2 failure before exec",
      Self::FdCloexec => "child process FD_CLOEXEC failure before exec",
      Self::Chdir => "child process chdir failure before exec",
      Self::SigMask => "child process signal mask failure before exec",
      Self::Exec => "child process exec failure",
    }
  }
}

pub(crate) fn encode_error(errno: Errno, fault: ChildFault) -> [u8; ERROR_RECORD_LEN] {
  let mut record = [0u8; ERROR_RECORD_LEN];
  record[..4].copy_from_slice(&(errno as i32 as u32).to_be_bytes());
  record[4] = fault as u8;
  record
}

/// `None` means a corrupt record: tag 0 is never written.
pub(crate) fn decode_error(record: &[u8; ERROR_RECORD_LEN]) -> Option<(Errno, ChildFault)> {
  let errno = u32::from_be_bytes([record[0], record[1], record[2], record[3]]);
  let fault = ChildFault::from_tag(record[4])?;
  Some((Errno::from_raw(errno as i32), fault))
}

pub(crate) fn spawn(req: &LaunchRequest, handle: &StdioHandle) -> Result<Pid> {
  let error_pipe = Pipe::cloexec()?;
  if let Err(err) = error_pipe.set_read_nonblocking() {
    // Not fatal: the bounded read loop below degrades to blocking reads.
    warn!("error pipe non-blocking setup failed: {err}");
  }
  match unsafe { fork() }.map_err(|errno| Error::io(errno, "fork"))? {
    ForkResult::Parent { child } => read_child_verdict(child, &error_pipe, req),
    ForkResult::Child => child_setup_and_exec(req, handle, &error_pipe),
  }
}

/// Everything that runs in the child. Never unwinds and never returns:
/// either an exec replaces the image or the tagged errno goes down the
/// pipe followed by `_exit(127)`.
fn child_setup_and_exec(req: &LaunchRequest, handle: &StdioHandle, error_pipe: &Pipe) -> ! {
  let _ = error_pipe.read.close();
  let report_fd = error_pipe.write.raw();

  if let Err(errno) =
    handle.dup2_plan(|src, dst| Errno::result(unsafe { libc::dup2(src, dst) }).map(drop))
  {
    child_abort(report_fd, errno, ChildFault::Dup2);
  }
  if let Err(errno) = flag_descriptors_cloexec() {
    child_abort(report_fd, errno, ChildFault::FdCloexec);
  }
  if let Some(dir) = &req.cwd
    && let Err(errno) = nix::unistd::chdir(dir.as_c_str())
  {
    child_abort(report_fd, errno, ChildFault::Chdir);
  }
  if let Err(errno) = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None) {
    child_abort(report_fd, errno, ChildFault::SigMask);
  }
  let errno = exec_candidates(req);
  child_abort(report_fd, errno, ChildFault::Exec)
}

/// Sets `FD_CLOEXEC` on every open descriptor above the stdio slots by
/// walking the process's fd directory. Closes the race window left by any
/// descriptor that could not be opened with atomic CLOEXEC.
fn flag_descriptors_cloexec() -> Result<(), Errno> {
  cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
      const FD_DIR: &str = "/proc/self/fd";
    } else {
      const FD_DIR: &str = "/dev/fd";
    }
  }
  let dir = std::fs::read_dir(FD_DIR)
    .map_err(|err| err.raw_os_error().map_or(Errno::EIO, Errno::from_raw))?;
  let mut fds = Vec::new();
  for entry in dir {
    if let Some(num) = entry
      .ok()
      .map(|e| e.file_name())
      .and_then(|s| s.into_string().ok())
      .and_then(|n| n.parse::<libc::c_int>().ok())
      && num > 2
    {
      fds.push(num);
    }
  }
  for fd in fds {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
      // The directory's own descriptor is closed by now; skip it.
      if Errno::last() == Errno::EBADF {
        continue;
      }
      return Err(Errno::last());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } == -1
      && Errno::last() != Errno::EBADF
    {
      return Err(Errno::last());
    }
  }
  Ok(())
}

/// Tries each precomputed candidate in order, returning the decisive errno
/// once all have failed. `ENOENT` from one component never masks a more
/// telling error from another.
fn exec_candidates(req: &LaunchRequest) -> Errno {
  let mut verdict = Errno::ENOENT;
  for candidate in &req.exec_candidates {
    let mut errno = exec_one(candidate, req);
    if errno == Errno::ETXTBSY {
      std::thread::sleep(ETXTBSY_RETRY_DELAY);
      errno = exec_one(candidate, req);
    }
    if errno != Errno::ENOENT {
      verdict = errno;
    }
  }
  verdict
}

fn exec_one(path: &CString, req: &LaunchRequest) -> Errno {
  match nix::unistd::execve(path.as_c_str(), &req.argv, &req.envp) {
    Ok(never) => match never {},
    Err(errno) => errno,
  }
}

fn child_abort(report_fd: RawFd, errno: Errno, fault: ChildFault) -> ! {
  let record = encode_error(errno, fault);
  let mut written = 0;
  while written < record.len() {
    let res = unsafe {
      libc::write(
        report_fd,
        record[written..].as_ptr().cast(),
        record.len() - written,
      )
    };
    match Errno::result(res) {
      Ok(n) => written += n as usize,
      Err(Errno::EINTR) => {}
      // The parent is gone or the pipe is broken; nothing left to say.
      Err(_) => break,
    }
  }
  unsafe { libc::_exit(127) }
}

/// Reads the child's verdict from the error pipe: EOF with no bytes means
/// exec succeeded, a full record names the failed step, anything else is
/// protocol corruption and the child is put down.
fn read_child_verdict(child: Pid, error_pipe: &Pipe, req: &LaunchRequest) -> Result<Pid> {
  if let Err(err) = error_pipe.write.close() {
    warn!("closing error pipe write end: {err}");
  }
  let fd = error_pipe.read.raw();
  let mut record = [0u8; ERROR_RECORD_LEN];
  let mut filled = 0usize;
  let mut attempts = 0u32;
  let complete = loop {
    let res = unsafe {
      libc::read(
        fd,
        record[filled..].as_mut_ptr().cast(),
        ERROR_RECORD_LEN - filled,
      )
    };
    match Errno::result(res) {
      Ok(0) => break false,
      Ok(n) => {
        filled += n as usize;
        if filled == ERROR_RECORD_LEN {
          break true;
        }
      }
      Err(Errno::EINTR) => {}
      Err(Errno::EAGAIN) => {
        attempts += 1;
        if !error_pipe.created_atomically() && attempts >= ERROR_PIPE_READ_ATTEMPTS {
          return Err(destroy_and_report(child, "error pipe read timed out"));
        }
        std::thread::sleep(ERROR_PIPE_POLL_INTERVAL);
      }
      Err(errno) => {
        warn!("error pipe read failed: {errno}");
        return Err(destroy_and_report(child, "error pipe read failed"));
      }
    }
  };

  if !complete && filled == 0 {
    return Ok(child);
  }
  if complete {
    // The child reported a step failure and has already _exit(127)ed.
    reap(child);
    let Some((errno, fault)) = decode_error(&record) else {
      return Err(Error::io(Errno::EPROTO, "error pipe record corrupted"));
    };
    return Err(if errno == Errno::ENOENT {
      let path = if fault == ChildFault::Chdir {
        req
          .cwd
          .as_ref()
          .map_or_else(|| req.program.clone(), cstring_path)
      } else {
        req.program.clone()
      };
      Error::FileNotFound { path }
    } else {
      Error::io(errno, fault.describe())
    });
  }
  Err(destroy_and_report(child, "truncated error pipe record"))
}

fn destroy_and_report(child: Pid, what: &'static str) -> Error {
  if let Err(errno) = kill(child, Signal::SIGKILL)
    && errno != Errno::ESRCH
  {
    warn!("killing child after protocol failure: {errno}");
  }
  reap(child);
  Error::io(Errno::EPROTO, what)
}

fn cstring_path(s: &CString) -> std::path::PathBuf {
  use std::os::unix::ffi::OsStringExt;
  std::path::PathBuf::from(std::ffi::OsString::from_vec(s.as_bytes().to_vec()))
}

fn reap(child: Pid) {
  loop {
    match waitpid(child, None) {
      Err(Errno::EINTR) => {}
      _ => break,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::builder::Command;
  use nix::sys::wait::WaitStatus;
  use offspring_stdio::{Stdio, StdioConfig};
  use rstest::rstest;
  use rusty_fork::rusty_fork_test;

  #[rstest]
  #[case(Errno::ENOENT, ChildFault::Exec)]
  #[case(Errno::EACCES, ChildFault::Dup2)]
  #[case(Errno::ENOTDIR, ChildFault::Chdir)]
  fn error_record_roundtrips(#[case] errno: Errno, #[case] fault: ChildFault) {
    let record = encode_error(errno, fault);
    assert_eq!(record.len(), 5);
    assert_eq!(decode_error(&record), Some((errno, fault)));
  }

  #[test]
  fn errno_is_big_endian_on_the_wire() {
    let record = encode_error(Errno::EACCES, ChildFault::Exec);
    assert_eq!(record[..4], (Errno::EACCES as u32).to_be_bytes()[..]);
    assert_eq!(record[4], 5);
  }

  #[test]
  fn zero_tag_is_corruption() {
    let record = [0, 0, 0, 2, 0];
    assert_eq!(decode_error(&record), None);
    assert_eq!(decode_error(&[0, 0, 0, 2, 9]), None);
  }

  #[test]
  fn fault_messages_name_the_step() {
    assert!(ChildFault::Chdir.describe().contains("chdir"));
    assert!(ChildFault::Dup2.describe().contains("dup2"));
    assert!(ChildFault::Exec.describe().contains("exec"));
  }

  fn assemble(cmd: &Command) -> LaunchRequest {
    crate::spawn::assemble(cmd).unwrap()
  }

  rusty_fork_test! {
    #[test]
    fn fork_path_runs_a_real_command() {
      let mut cmd = Command::new("/bin/sh");
      cmd.arg("-c").arg("exit 7");
      let req = assemble(&cmd);
      let handle = StdioHandle::open(&StdioConfig {
        stdin: Stdio::null(),
        ..StdioConfig::default()
      })
      .unwrap();
      let pid = spawn(&req, &handle).unwrap();
      handle.prune_child_ends();
      let status = waitpid(pid, None).unwrap();
      assert_eq!(status, WaitStatus::Exited(pid, 7));
      handle.close().unwrap();
    }
  }

  rusty_fork_test! {
    #[test]
    fn fork_path_reports_exec_failure_as_file_not_found() {
      let mut cmd = Command::new("definitely-not-a-real-binary-name");
      cmd.env("PATH", "/nonexistent-dir");
      let req = assemble(&cmd);
      let handle = StdioHandle::open(&StdioConfig::default()).unwrap();
      let err = spawn(&req, &handle).unwrap_err();
      assert!(matches!(err, Error::FileNotFound { .. }), "got {err:?}");
      handle.close().unwrap();
    }
  }

  rusty_fork_test! {
    #[test]
    fn fork_path_reports_chdir_failure() {
      // Bypasses the parent-side cwd precheck to exercise the child-side
      // tagged report.
      let mut cmd = Command::new("/bin/sh");
      cmd.arg("-c").arg("exit 0");
      let mut req = assemble(&cmd);
      req.cwd = Some(std::ffi::CString::new("/no/such/dir").unwrap());
      let handle = StdioHandle::open(&StdioConfig::default()).unwrap();
      let err = spawn(&req, &handle).unwrap_err();
      match err {
        Error::FileNotFound { .. } => {}
        Error::Io { message, .. } => assert!(message.contains("chdir")),
        other => panic!("unexpected error: {other:?}"),
      }
      handle.close().unwrap();
    }
  }
}
