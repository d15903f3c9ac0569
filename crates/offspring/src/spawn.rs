//! Process launch: preconditions, request assembly and path selection.
//!
//! Two launch strategies with identical observable semantics: a
//! `posix_spawn` fast path and a fork+exec fallback. The fast path
//! declines (internally, via `Unsupported`) when it cannot express the
//! request; the fork path always works.

use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

use cfg_if::cfg_if;
use nix::unistd::Pid;
use offspring_stdio::StdioHandle;
use tracing::debug;

use crate::builder::Command;
use crate::child::Child;
use crate::error::{Error, Result};

cfg_if! {
  if #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))] {
    mod fast;
  }
}
mod fork;

/// Fallback search path when neither the builder's environment nor the
/// parent's carries `PATH`.
const DEFAULT_PATH: &str = "/bin:/usr/bin";

/// Everything a launch path needs, assembled before any process creation.
/// All strings are owned and NUL-checked here so the forked child never
/// has to construct one.
#[derive(Debug)]
pub(crate) struct LaunchRequest {
  /// The program as configured, for error reporting.
  pub program: PathBuf,
  /// The program as handed to `posix_spawn`/`posix_spawnp`.
  pub program_c: CString,
  /// Whether the program is a bare name to be resolved against `PATH`.
  pub search: bool,
  pub argv: Vec<CString>,
  pub envp: Vec<CString>,
  pub cwd: Option<CString>,
  /// Paths the fork path execs, in order. A single entry when the program
  /// already names a path.
  pub exec_candidates: Vec<CString>,
}

pub(crate) fn launch(cmd: &Command) -> Result<Child> {
  let req = assemble(cmd)?;
  let handle = StdioHandle::open(cmd.get_stdio())?;
  let pid = match launch_via_best_path(&req, &handle) {
    Ok(pid) => pid,
    Err(err) => {
      // A failed spawn leaves no descriptors behind.
      let _ = handle.close();
      return Err(err);
    }
  };
  handle.prune_child_ends();
  Ok(Child::new(
    pid,
    cmd.get_program().to_owned(),
    cmd.get_args().to_vec(),
    handle,
    cmd.get_destroy_signal(),
    cmd.error_handler(),
  ))
}

fn launch_via_best_path(req: &LaunchRequest, handle: &StdioHandle) -> Result<Pid> {
  #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
  {
    match fast::spawn(req, handle) {
      Err(Error::Unsupported { what }) => {
        debug!("posix_spawn path declined ({what}), falling back to fork+exec");
      }
      other => return other,
    }
  }
  fork::spawn(req, handle)
}

fn assemble(cmd: &Command) -> Result<LaunchRequest> {
  let program = cmd.get_program();
  if program.is_empty() {
    return Err(Error::invalid("command must not be blank"));
  }
  let program_path = PathBuf::from(program);
  let search = !program.as_bytes().contains(&b'/');
  if program_path.is_absolute() && !program_path.exists() {
    return Err(Error::FileNotFound { path: program_path });
  }
  if let Some(cwd) = cmd.get_current_dir()
    && !cwd.is_dir()
  {
    return Err(Error::FileNotFound {
      path: cwd.to_owned(),
    });
  }

  let program_c = cstring(program)?;
  let argv = std::iter::once(program)
    .chain(cmd.get_args().iter().map(OsString::as_os_str))
    .map(cstring)
    .collect::<Result<Vec<_>>>()?;
  let envp = cmd.get_envs().to_envp()?;
  let cwd = cmd
    .get_current_dir()
    .map(|dir| cstring(dir.as_os_str()))
    .transpose()?;
  let exec_candidates = if search {
    path_candidates(cmd, program)?
  } else {
    vec![program_c.clone()]
  };

  Ok(LaunchRequest {
    program: program_path,
    program_c,
    search,
    argv,
    envp,
    cwd,
    exec_candidates,
  })
}

/// Resolves `PATH` into the concrete paths the fork path will exec. The
/// builder's environment wins over the parent's so that an `env`-scrubbed
/// child is searched the way it will run; empty components mean the
/// current directory, as the OS loader treats them.
fn path_candidates(cmd: &Command, program: &OsStr) -> Result<Vec<CString>> {
  let path = cmd
    .get_envs()
    .get("PATH")
    .map(OsStr::to_owned)
    .or_else(|| std::env::var_os("PATH"))
    .unwrap_or_else(|| OsString::from(DEFAULT_PATH));
  std::env::split_paths(&path)
    .map(|dir| {
      let dir = if dir.as_os_str().is_empty() {
        PathBuf::from(".")
      } else {
        dir
      };
      cstring(dir.join(program).as_os_str())
    })
    .collect()
}

fn cstring(s: &OsStr) -> Result<CString> {
  CString::new(s.to_owned().into_vec())
    .map_err(|_| Error::invalid("argument contains a NUL byte"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::builder::Command;

  #[test]
  fn blank_command_is_invalid() {
    assert!(matches!(
      assemble(&Command::new("")),
      Err(Error::Invalid { .. })
    ));
  }

  #[test]
  fn missing_absolute_program_is_file_not_found() {
    let err = assemble(&Command::new("/no/such/binary")).unwrap_err();
    assert_eq!(
      err,
      Error::FileNotFound {
        path: "/no/such/binary".into()
      }
    );
  }

  #[test]
  fn missing_cwd_is_file_not_found() {
    let mut cmd = Command::new("/bin/sh");
    cmd.current_dir("/no/such/dir");
    let err = assemble(&cmd).unwrap_err();
    assert_eq!(
      err,
      Error::FileNotFound {
        path: "/no/such/dir".into()
      }
    );
  }

  #[test]
  fn bare_names_get_path_candidates() {
    let mut cmd = Command::new("sh");
    cmd.env("PATH", "/bin:/usr/bin");
    let req = assemble(&cmd).unwrap();
    assert!(req.search);
    let rendered: Vec<&str> = req
      .exec_candidates
      .iter()
      .map(|c| c.to_str().unwrap())
      .collect();
    assert_eq!(rendered, ["/bin/sh", "/usr/bin/sh"]);
  }

  #[test]
  fn empty_path_components_mean_cwd() {
    let mut cmd = Command::new("tool");
    cmd.env("PATH", "/opt/bin::/bin");
    let req = assemble(&cmd).unwrap();
    let rendered: Vec<&str> = req
      .exec_candidates
      .iter()
      .map(|c| c.to_str().unwrap())
      .collect();
    assert_eq!(rendered, ["/opt/bin/tool", "./tool", "/bin/tool"]);
  }

  #[test]
  fn separator_paths_are_execd_directly() {
    let req = assemble(&Command::new("/bin/sh")).unwrap();
    assert!(!req.search);
    assert_eq!(req.exec_candidates.len(), 1);
    assert_eq!(req.argv[0].to_str().unwrap(), "/bin/sh");
  }

  #[test]
  fn argv_zero_is_the_program_as_written() {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg("exit 0");
    let req = assemble(&cmd).unwrap();
    let rendered: Vec<&str> = req.argv.iter().map(|c| c.to_str().unwrap()).collect();
    assert_eq!(rendered, ["sh", "-c", "exit 0"]);
  }

  #[test]
  fn nul_in_argument_is_invalid() {
    let mut cmd = Command::new("/bin/echo");
    cmd.arg(OsString::from("a\0b"));
    assert!(matches!(assemble(&cmd), Err(Error::Invalid { .. })));
  }
}
