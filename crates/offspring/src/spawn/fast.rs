//! The `posix_spawn`-based launch path.
//!
//! Built on the raw libc interface: an attributes object, a file-actions
//! object, and one combined fork+exec call. The chdir action is a late
//! addition to the API surface (`posix_spawn_file_actions_addchdir_np`),
//! so it is resolved once with `dlsym` and its absence makes this path
//! decline in favor of fork+exec.

use std::ffi::CStr;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::sync::LazyLock;

use nix::errno::Errno;
use nix::libc;
use nix::unistd::Pid;
use offspring_stdio::StdioHandle;

use crate::error::{Error, Result};
use crate::spawn::LaunchRequest;

type AddChdirFn =
  unsafe extern "C" fn(*mut libc::posix_spawn_file_actions_t, *const libc::c_char) -> libc::c_int;

/// `posix_spawn_file_actions_addchdir_np`, if this libc exports it.
/// glibc ≥ 2.29, musl ≥ 1.1.24, macOS 10.15+; resolved at runtime rather
/// than trusting a version matrix.
static ADDCHDIR_NP: LazyLock<Option<AddChdirFn>> = LazyLock::new(|| unsafe {
  let sym = libc::dlsym(
    libc::RTLD_DEFAULT,
    c"posix_spawn_file_actions_addchdir_np".as_ptr(),
  );
  if sym.is_null() {
    None
  } else {
    Some(std::mem::transmute::<*mut libc::c_void, AddChdirFn>(sym))
  }
});

struct FileActions {
  raw: libc::posix_spawn_file_actions_t,
}

impl FileActions {
  fn new() -> Result<Self> {
    let mut raw = MaybeUninit::uninit();
    let rc = unsafe { libc::posix_spawn_file_actions_init(raw.as_mut_ptr()) };
    if rc != 0 {
      return Err(Error::io(
        Errno::from_raw(rc),
        "posix_spawn_file_actions_init",
      ));
    }
    Ok(Self {
      raw: unsafe { raw.assume_init() },
    })
  }

  fn add_dup2(&mut self, src: RawFd, dst: RawFd) -> Result<()> {
    let rc = unsafe { libc::posix_spawn_file_actions_adddup2(&mut self.raw, src, dst) };
    if rc != 0 {
      return Err(Error::io(
        Errno::from_raw(rc),
        "posix_spawn_file_actions_adddup2",
      ));
    }
    Ok(())
  }

  fn add_chdir(&mut self, dir: &CStr) -> Result<()> {
    let Some(addchdir) = *ADDCHDIR_NP else {
      return Err(Error::Unsupported {
        what: "posix_spawn_file_actions_addchdir_np",
      });
    };
    let rc = unsafe { addchdir(&mut self.raw, dir.as_ptr()) };
    if rc != 0 {
      return Err(Error::io(
        Errno::from_raw(rc),
        "posix_spawn_file_actions_addchdir_np",
      ));
    }
    Ok(())
  }

  fn as_ptr(&self) -> *const libc::posix_spawn_file_actions_t {
    &self.raw
  }
}

impl Drop for FileActions {
  fn drop(&mut self) {
    unsafe {
      libc::posix_spawn_file_actions_destroy(&mut self.raw);
    }
  }
}

struct SpawnAttr {
  raw: libc::posix_spawnattr_t,
}

impl SpawnAttr {
  fn new() -> Result<Self> {
    let mut raw = MaybeUninit::uninit();
    let rc = unsafe { libc::posix_spawnattr_init(raw.as_mut_ptr()) };
    if rc != 0 {
      return Err(Error::io(Errno::from_raw(rc), "posix_spawnattr_init"));
    }
    Ok(Self {
      raw: unsafe { raw.assume_init() },
    })
  }

  /// Clears any inherited signal blocks and, on Darwin, closes every
  /// descriptor the actions do not explicitly wire through.
  fn configure(&mut self) -> Result<()> {
    let mut empty_set = MaybeUninit::<libc::sigset_t>::uninit();
    unsafe {
      libc::sigemptyset(empty_set.as_mut_ptr());
    }
    let rc = unsafe { libc::posix_spawnattr_setsigmask(&mut self.raw, empty_set.as_ptr()) };
    if rc != 0 {
      return Err(Error::io(Errno::from_raw(rc), "posix_spawnattr_setsigmask"));
    }

    #[allow(unused_mut)]
    let mut flags: libc::c_short = libc::POSIX_SPAWN_SETSIGMASK as libc::c_short;
    #[cfg(target_os = "macos")]
    {
      flags |= libc::POSIX_SPAWN_CLOEXEC_DEFAULT as libc::c_short;
    }
    let rc = unsafe { libc::posix_spawnattr_setflags(&mut self.raw, flags) };
    if rc != 0 {
      return Err(Error::io(Errno::from_raw(rc), "posix_spawnattr_setflags"));
    }
    Ok(())
  }

  fn as_ptr(&self) -> *const libc::posix_spawnattr_t {
    &self.raw
  }
}

impl Drop for SpawnAttr {
  fn drop(&mut self) {
    unsafe {
      libc::posix_spawnattr_destroy(&mut self.raw);
    }
  }
}

pub(crate) fn spawn(req: &LaunchRequest, handle: &StdioHandle) -> Result<Pid> {
  let mut actions = FileActions::new()?;
  // The chdir action must come first so the dup2 targets are not affected
  // by a relative interpretation later; failing that capability declines
  // the whole path.
  if let Some(dir) = &req.cwd {
    actions.add_chdir(dir)?;
  }
  handle.dup2_plan(|src, dst| actions.add_dup2(src, dst))?;
  #[cfg(target_os = "macos")]
  {
    // CLOEXEC_DEFAULT closes every descriptor without an explicit action,
    // so inherited slots (src == dst, skipped by the plan) must be marked
    // with an equal-fd dup2 to survive the exec.
    for (src, dst) in handle.child_fds().into_iter().zip(0..) {
      if src == dst {
        actions.add_dup2(src, dst)?;
      }
    }
  }

  let mut attr = SpawnAttr::new()?;
  attr.configure()?;

  let argv = nul_terminated(&req.argv);
  let envp = nul_terminated(&req.envp);
  let mut pid: libc::pid_t = 0;
  let rc = unsafe {
    if req.search {
      libc::posix_spawnp(
        &mut pid,
        req.program_c.as_ptr(),
        actions.as_ptr(),
        attr.as_ptr(),
        argv.as_ptr(),
        envp.as_ptr(),
      )
    } else {
      libc::posix_spawn(
        &mut pid,
        req.program_c.as_ptr(),
        actions.as_ptr(),
        attr.as_ptr(),
        argv.as_ptr(),
        envp.as_ptr(),
      )
    }
  };
  if rc != 0 {
    let errno = Errno::from_raw(rc);
    return Err(if errno == Errno::ENOENT {
      Error::FileNotFound {
        path: req.program.clone(),
      }
    } else {
      Error::io(errno, "posix_spawn")
    });
  }
  Ok(Pid::from_raw(pid))
}

/// Borrows the strings into the NULL-terminated pointer array exec wants.
/// The returned vector must not outlive `strings`.
fn nul_terminated(strings: &[std::ffi::CString]) -> Vec<*mut libc::c_char> {
  let mut ptrs: Vec<*mut libc::c_char> = strings
    .iter()
    .map(|s| s.as_ptr().cast_mut())
    .collect();
  ptrs.push(std::ptr::null_mut());
  ptrs
}
