//! Command assembly.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use offspring_stdio::{Stdio, StdioConfig};

use crate::child::Child;
use crate::env::EnvTable;
use crate::error::{ErrorHandler, ProcessFault, Result, default_error_handler};
use crate::signal::DestroySignal;
use crate::spawn;

/// Describes a child process to be spawned.
///
/// The interface is intentionally similar to `std::process::Command`: pure
/// data assembly, no side effects until [`Command::spawn`]. The environment
/// is snapshotted from the parent process when the builder is created.
#[derive(Clone)]
pub struct Command {
  program: OsString,
  args: Vec<OsString>,
  env: EnvTable,
  cwd: Option<PathBuf>,
  stdio: StdioConfig,
  destroy_signal: DestroySignal,
  on_error: Option<ErrorHandler>,
}

impl Command {
  pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
    Self {
      program: program.as_ref().to_owned(),
      args: Vec::new(),
      env: EnvTable::inherited(),
      cwd: None,
      stdio: StdioConfig::default(),
      destroy_signal: DestroySignal::default(),
      on_error: None,
    }
  }

  /// Appends one argument to the argv passed to exec.
  pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
    self.args.push(arg.as_ref().to_owned());
    self
  }

  pub fn args<I, S>(&mut self, args: I) -> &mut Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
  {
    for arg in args {
      self.arg(arg);
    }
    self
  }

  pub fn env<K: Into<OsString>, V: Into<OsString>>(&mut self, key: K, value: V) -> &mut Self {
    self.env.set(key, value);
    self
  }

  pub fn envs<I, K, V>(&mut self, vars: I) -> &mut Self
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<OsString>,
    V: Into<OsString>,
  {
    for (key, value) in vars {
      self.env.set(key, value);
    }
    self
  }

  pub fn env_remove<K: AsRef<OsStr>>(&mut self, key: K) -> &mut Self {
    self.env.remove(key);
    self
  }

  pub fn env_clear(&mut self) -> &mut Self {
    self.env.clear();
    self
  }

  /// The child's working directory. When the platform cannot express this
  /// on the spawn fast path, the fork path is used instead.
  pub fn current_dir<P: AsRef<Path>>(&mut self, dir: P) -> &mut Self {
    self.cwd = Some(dir.as_ref().to_owned());
    self
  }

  pub fn stdin(&mut self, cfg: Stdio) -> &mut Self {
    self.stdio.stdin = cfg;
    self
  }

  pub fn stdout(&mut self, cfg: Stdio) -> &mut Self {
    self.stdio.stdout = cfg;
    self
  }

  pub fn stderr(&mut self, cfg: Stdio) -> &mut Self {
    self.stdio.stderr = cfg;
    self
  }

  /// The signal [`Child::destroy`] delivers. Defaults to SIGTERM.
  pub fn destroy_signal(&mut self, signal: DestroySignal) -> &mut Self {
    self.destroy_signal = signal;
    self
  }

  /// Handler for faults raised outside the launch path (destroy, stdout
  /// feed, stderr feed). The default handler logs them.
  pub fn on_error<F>(&mut self, handler: F) -> &mut Self
  where
    F: Fn(&ProcessFault) + Send + Sync + 'static,
  {
    self.on_error = Some(Arc::new(handler));
    self
  }

  pub fn get_program(&self) -> &OsStr {
    &self.program
  }

  pub fn get_args(&self) -> &[OsString] {
    &self.args
  }

  pub fn get_envs(&self) -> &EnvTable {
    &self.env
  }

  pub fn get_current_dir(&self) -> Option<&Path> {
    self.cwd.as_deref()
  }

  pub fn get_stdio(&self) -> &StdioConfig {
    &self.stdio
  }

  pub fn get_destroy_signal(&self) -> DestroySignal {
    self.destroy_signal
  }

  pub(crate) fn error_handler(&self) -> ErrorHandler {
    self
      .on_error
      .clone()
      .unwrap_or_else(default_error_handler)
  }

  /// Launches the child. Uses the posix_spawn fast path where the platform
  /// supports everything this command needs, the fork+exec path otherwise.
  pub fn spawn(&self) -> Result<Child> {
    spawn::launch(self)
  }
}

impl std::fmt::Debug for Command {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Command")
      .field("program", &self.program)
      .field("args", &self.args)
      .field("cwd", &self.cwd)
      .field("stdio", &self.stdio)
      .field("destroy_signal", &self.destroy_signal)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_accumulates_arguments() {
    let mut cmd = Command::new("echo");
    cmd.arg("one").args(["two", "three"]);
    assert_eq!(cmd.get_program(), "echo");
    assert_eq!(cmd.get_args(), ["one", "two", "three"]);
  }

  #[test]
  fn environment_starts_inherited_and_takes_overrides() {
    let mut cmd = Command::new("env");
    cmd.env("OFFSPRING_TEST_MARKER", "1");
    assert_eq!(
      cmd.get_envs().get("OFFSPRING_TEST_MARKER"),
      Some(OsStr::new("1"))
    );
    cmd.env_clear();
    assert!(cmd.get_envs().is_empty());
  }

  #[test]
  fn stdio_defaults_to_inherit() {
    let cmd = Command::new("true");
    assert_eq!(*cmd.get_stdio(), StdioConfig::default());
    assert_eq!(cmd.get_destroy_signal(), DestroySignal::Term);
  }

  #[test]
  fn blank_command_fails_to_spawn() {
    let err = Command::new("").spawn().unwrap_err();
    assert!(matches!(err, crate::Error::Invalid { .. }));
  }
}
