//! A running child process: state tracking, waiting, line feeds, destroy.

use std::ffi::OsString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use offspring_stdio::{
  BufferedWriteStream, LineFeedEngine, LineSink, ReadStream, StdioError, StdioHandle,
};
use tracing::debug;

use crate::error::{Error, ErrorHandler, FaultContext, ProcessFault, Result};
use crate::signal::DestroySignal;

/// Chunk size of the background reader threads.
const READ_CHUNK: usize = 8 * 1024;

/// Upper bound of the adaptive sleep inside `wait`.
const WAIT_SLEEP_CAP: Duration = Duration::from_millis(100);

const WAIT_SLEEP_START: Duration = Duration::from_millis(1);

/// A spawned child process.
///
/// The exit code is latched: once observed it never changes, and every
/// wait or poll afterwards answers from the cache. `destroy` is one-way
/// and idempotent; after it returns, the configured signal has been sent
/// (if the child was still running) and every pipe is closed. Waiting for
/// the latched code remains possible after destroy.
pub struct Child {
  pid: Pid,
  program: OsString,
  args: Vec<OsString>,
  stdio: StdioHandle,
  destroy_signal: DestroySignal,
  exit_code: Mutex<Option<i32>>,
  destroyed: AtomicBool,
  on_error: ErrorHandler,
  stdout_feed: Option<Feed>,
  stderr_feed: Option<Feed>,
}

/// Line dispatch for one piped output stream. The reader thread starts
/// when the first sink is attached.
struct Feed {
  engine: Arc<Mutex<LineFeedEngine>>,
  stream: Arc<ReadStream>,
  context: FaultContext,
  started: Mutex<bool>,
}

impl Child {
  pub(crate) fn new(
    pid: Pid,
    program: OsString,
    args: Vec<OsString>,
    stdio: StdioHandle,
    destroy_signal: DestroySignal,
    on_error: ErrorHandler,
  ) -> Self {
    let stdout_feed = stdio.stdout_reader().map(|stream| Feed {
      engine: Arc::default(),
      stream,
      context: FaultContext::FeedStdout,
      started: Mutex::new(false),
    });
    let stderr_feed = stdio.stderr_reader().map(|stream| Feed {
      engine: Arc::default(),
      stream,
      context: FaultContext::FeedStderr,
      started: Mutex::new(false),
    });
    Self {
      pid,
      program,
      args,
      stdio,
      destroy_signal,
      exit_code: Mutex::new(None),
      destroyed: AtomicBool::new(false),
      on_error,
      stdout_feed,
      stderr_feed,
    }
  }

  pub fn pid(&self) -> Pid {
    self.pid
  }

  pub fn program(&self) -> &OsString {
    &self.program
  }

  pub fn args(&self) -> &[OsString] {
    &self.args
  }

  pub fn destroy_signal(&self) -> DestroySignal {
    self.destroy_signal
  }

  fn latched(&self) -> Option<i32> {
    *self
      .exit_code
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn latch(&self, code: i32) -> i32 {
    let mut slot = self
      .exit_code
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    *slot.get_or_insert(code)
  }

  /// Non-blocking poll. Latches and returns the exit code once the OS
  /// reports termination. For a signal-terminated child the code is the
  /// signal number, comparable against [`DestroySignal::code`].
  pub fn exit_code_or_none(&self) -> Result<Option<i32>> {
    if let Some(code) = self.latched() {
      return Ok(Some(code));
    }
    match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
      Ok(WaitStatus::StillAlive) => Ok(None),
      Ok(WaitStatus::Exited(_, code)) => Ok(Some(self.latch(code))),
      Ok(WaitStatus::Signaled(_, signal, _)) => Ok(Some(self.latch(signal as i32))),
      // Stopped/continued children are still alive.
      Ok(_) => Ok(None),
      Err(Errno::EINTR) => Err(Error::Interrupted),
      Err(errno) => Err(Error::io(errno, "waitpid")),
    }
  }

  /// Whether the exit code has not been latched yet.
  pub fn is_alive(&self) -> bool {
    matches!(self.exit_code_or_none(), Ok(None))
  }

  /// Blocks until the child terminates and returns the latched exit code.
  pub fn wait(&self) -> Result<i32> {
    let mut sleep = WAIT_SLEEP_START;
    loop {
      if let Some(code) = self.exit_code_or_none()? {
        return Ok(code);
      }
      std::thread::sleep(sleep);
      sleep = (sleep * 2).min(WAIT_SLEEP_CAP);
    }
  }

  /// Blocks until the child terminates or the timeout elapses. `None`
  /// means the deadline passed with the child still running.
  pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<i32>> {
    let deadline = Instant::now() + timeout;
    let mut sleep = WAIT_SLEEP_START;
    loop {
      if let Some(code) = self.exit_code_or_none()? {
        return Ok(Some(code));
      }
      let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
      else {
        return Ok(None);
      };
      std::thread::sleep(sleep.min(remaining));
      sleep = (sleep * 2).min(WAIT_SLEEP_CAP);
    }
  }

  /// Sends the configured signal if the child is still running, then
  /// closes every pipe. Idempotent; never fails: problems are reported
  /// through the error handler. Callers may still `wait` afterwards to
  /// collect the latched exit code.
  pub fn destroy(&self) {
    if self.destroyed.swap(true, Ordering::SeqCst) {
      return;
    }
    if self.latched().is_none() {
      match kill(self.pid, self.destroy_signal.signal()) {
        // ESRCH means it beat us to the exit.
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(errno) => (self.on_error)(&ProcessFault {
          context: FaultContext::Destroy,
          source: Error::io(errno, "kill"),
        }),
      }
    }
    if let Err(err) = self.stdio.close() {
      (self.on_error)(&ProcessFault {
        context: FaultContext::Destroy,
        source: err.into(),
      });
    }
  }

  pub fn is_destroyed(&self) -> bool {
    self.destroyed.load(Ordering::SeqCst)
  }

  /// The parent-side writer for a piped stdin slot.
  pub fn stdin_writer(&self) -> Option<Arc<BufferedWriteStream>> {
    self.stdio.stdin_writer()
  }

  /// Flushes and closes the stdin writer, delivering EOF to the child.
  pub fn close_stdin(&self) -> Result<()> {
    self.stdio.close_stdin().map_err(Error::from)
  }

  /// The parent-side reader for a piped stdout slot. Reading here
  /// competes with any attached line sinks.
  pub fn stdout_reader(&self) -> Option<Arc<ReadStream>> {
    self.stdio.stdout_reader()
  }

  pub fn stderr_reader(&self) -> Option<Arc<ReadStream>> {
    self.stdio.stderr_reader()
  }

  /// Attaches a line sink to the child's stdout. The first registration
  /// starts the background reader thread; later sinks receive subsequent
  /// lines but no replay.
  pub fn stdout_feed<S: LineSink + 'static>(&self, sink: S) -> Result<()> {
    self.attach_sink(self.stdout_feed.as_ref(), "stdout", Box::new(sink))
  }

  pub fn stderr_feed<S: LineSink + 'static>(&self, sink: S) -> Result<()> {
    self.attach_sink(self.stderr_feed.as_ref(), "stderr", Box::new(sink))
  }

  fn attach_sink(
    &self,
    feed: Option<&Feed>,
    name: &str,
    sink: Box<dyn LineSink>,
  ) -> Result<()> {
    let Some(feed) = feed else {
      return Err(Error::invalid(format!("{name} is not a pipe")));
    };
    feed
      .engine
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .attach(sink);
    let mut started = feed
      .started
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    if !*started {
      let engine = feed.engine.clone();
      let stream = feed.stream.clone();
      let context = feed.context;
      let on_error = self.on_error.clone();
      std::thread::Builder::new()
        .name(format!("offspring-{name}"))
        .spawn(move || run_feed(&stream, &engine, context, &on_error))
        .map_err(|err| {
          Error::io(
            err.raw_os_error().map_or(Errno::EAGAIN, Errno::from_raw),
            "spawn reader thread",
          )
        })?;
      *started = true;
    }
    Ok(())
  }
}

/// Body of a reader thread: pull chunks until EOF or a non-retriable
/// error, feed the line engine, close it on the way out so every sink
/// sees its end-of-stream sentinel.
fn run_feed(
  stream: &ReadStream,
  engine: &Mutex<LineFeedEngine>,
  context: FaultContext,
  on_error: &ErrorHandler,
) {
  let mut buf = [0u8; READ_CHUNK];
  loop {
    match stream.read(&mut buf) {
      Ok(0) => break,
      Ok(n) => {
        let res = engine
          .lock()
          .unwrap_or_else(PoisonError::into_inner)
          .push(&buf[..n]);
        match res {
          Ok(()) => {}
          // A sink error closed the engine; report and stop reading.
          Err(StdioError::Closed) => break,
          Err(err) => {
            on_error(&ProcessFault {
              context,
              source: err.into(),
            });
            break;
          }
        }
      }
      Err(StdioError::Interrupted) => {}
      Err(err) => {
        // Closed by destroy, or the descriptor went away under us;
        // either way the stream is over.
        debug!("reader thread stopping: {err}");
        break;
      }
    }
  }
  let res = engine
    .lock()
    .unwrap_or_else(PoisonError::into_inner)
    .close();
  if let Err(err) = res {
    on_error(&ProcessFault {
      context,
      source: err.into(),
    });
  }
}

impl std::fmt::Debug for Child {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Child")
      .field("pid", &self.pid.as_raw())
      .field("program", &self.program)
      .field("exit_code", &self.latched())
      .field("destroyed", &self.is_destroyed())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::builder::Command;
  use offspring_stdio::Stdio;

  fn shell(script: &str) -> Command {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(script);
    cmd
  }

  #[test]
  fn exit_code_latches_and_never_changes() {
    let child = shell("exit 42").spawn().unwrap();
    let code = child.wait().unwrap();
    assert_eq!(code, 42);
    for _ in 0..3 {
      assert_eq!(child.exit_code_or_none().unwrap(), Some(42));
      assert_eq!(child.wait().unwrap(), 42);
    }
    assert!(!child.is_alive());
  }

  #[test]
  fn wait_timeout_returns_none_while_running() {
    let mut cmd = shell("sleep 5");
    cmd.destroy_signal(DestroySignal::Kill);
    let child = cmd.spawn().unwrap();
    assert!(child.is_alive());
    assert_eq!(
      child.wait_timeout(Duration::from_millis(50)).unwrap(),
      None
    );
    child.destroy();
    let code = child.wait().unwrap();
    assert_eq!(code, DestroySignal::Kill.code());
  }

  #[test]
  fn destroy_is_idempotent() {
    let child = shell("sleep 5").spawn().unwrap();
    child.destroy();
    assert!(child.is_destroyed());
    child.destroy();
    let code = child.wait().unwrap();
    assert_eq!(code, DestroySignal::Term.code());
  }

  #[test]
  fn destroy_after_exit_keeps_the_real_code() {
    let child = shell("exit 3").spawn().unwrap();
    assert_eq!(child.wait().unwrap(), 3);
    child.destroy();
    assert_eq!(child.exit_code_or_none().unwrap(), Some(3));
  }

  #[test]
  fn feed_on_inherit_slot_is_rejected() {
    let child = shell("exit 0").spawn().unwrap();
    let err = child
      .stdout_feed(|_line: Option<&str>| {})
      .unwrap_err();
    assert!(matches!(err, Error::Invalid { .. }));
    child.wait().unwrap();
    child.destroy();
  }

  #[test]
  fn stdout_feed_delivers_lines_and_sentinel() {
    let mut cmd = shell("printf 'Hello\\r\\nWorld\\nHello\\nWorld\\r\\n'");
    cmd.stdout(Stdio::MakePipe);
    let child = cmd.spawn().unwrap();
    let events: Arc<Mutex<Vec<Option<String>>>> = Arc::default();
    let sink_events = events.clone();
    child
      .stdout_feed(move |line: Option<&str>| {
        sink_events
          .lock()
          .unwrap()
          .push(line.map(str::to_owned));
      })
      .unwrap();
    child.wait().unwrap();
    // EOF reaches the reader thread shortly after exit.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
      if events.lock().unwrap().last() == Some(&None) {
        break;
      }
      assert!(Instant::now() < deadline, "sentinel never arrived");
      std::thread::sleep(Duration::from_millis(5));
    }
    let events = events.lock().unwrap();
    assert_eq!(
      *events,
      vec![
        Some("Hello".to_owned()),
        Some("World".to_owned()),
        Some("Hello".to_owned()),
        Some("World".to_owned()),
        None,
      ]
    );
    child.destroy();
  }

  #[test]
  fn stderr_feed_is_independent_of_stdout() {
    let mut cmd = shell("echo out; echo err 1>&2");
    cmd.stdout(Stdio::MakePipe).stderr(Stdio::MakePipe);
    let child = cmd.spawn().unwrap();
    let err_lines: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink_lines = err_lines.clone();
    let done: Arc<AtomicBool> = Arc::default();
    let sink_done = done.clone();
    child
      .stderr_feed(move |line: Option<&str>| match line {
        Some(line) => sink_lines.lock().unwrap().push(line.to_owned()),
        None => sink_done.store(true, Ordering::SeqCst),
      })
      .unwrap();
    child.wait().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done.load(Ordering::SeqCst) {
      assert!(Instant::now() < deadline, "sentinel never arrived");
      std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*err_lines.lock().unwrap(), vec!["err".to_owned()]);
    child.destroy();
  }

  #[test]
  fn destroy_reports_faults_to_the_handler_not_the_caller() {
    let faults: Arc<Mutex<Vec<FaultContext>>> = Arc::default();
    let seen = faults.clone();
    let mut cmd = shell("exit 0");
    cmd.on_error(move |fault| seen.lock().unwrap().push(fault.context));
    let child = cmd.spawn().unwrap();
    child.wait().unwrap();
    // Destroying an already-exited child must not raise anywhere.
    child.destroy();
    child.destroy();
    assert!(faults.lock().unwrap().is_empty());
  }
}
