//! Stdio slot configuration and the realized descriptor handle.

use std::fs::File;
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;
use nix::libc;
use tracing::warn;

use crate::error::StdioError;
use crate::fd::Descriptor;
use crate::pipe::Pipe;
use crate::stream::{BufferedWriteStream, ReadStream, WriteStream};

/// The discard device.
pub const NULL_DEVICE: &str = "/dev/null";

/// How one of the child's standard descriptors is populated.
#[derive(Debug, Clone)]
pub enum Stdio {
  /// The child shares the parent's descriptor for this slot.
  Inherit,
  /// A pipe is created; the parent keeps the opposite end.
  MakePipe,
  /// The slot reads from / writes to a file. `append` only matters for
  /// output slots and is ignored for stdin.
  File { path: PathBuf, append: bool },
}

impl Stdio {
  pub fn file<P: Into<PathBuf>>(path: P) -> Self {
    Self::File {
      path: path.into(),
      append: false,
    }
  }

  pub fn append<P: Into<PathBuf>>(path: P) -> Self {
    Self::File {
      path: path.into(),
      append: true,
    }
  }

  /// The canonical discard sink.
  pub fn null() -> Self {
    Self::file(NULL_DEVICE)
  }

  pub fn is_null(&self) -> bool {
    matches!(self, Self::File { path, .. } if path == Path::new(NULL_DEVICE))
  }
}

impl Default for Stdio {
  fn default() -> Self {
    Self::Inherit
  }
}

impl PartialEq for Stdio {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (Self::Inherit, Self::Inherit) | (Self::MakePipe, Self::MakePipe) => true,
      // Any two values naming the null device are the same sink, append
      // or not.
      (a @ Self::File { .. }, b @ Self::File { .. }) if a.is_null() || b.is_null() => {
        a.is_null() && b.is_null()
      }
      (
        Self::File { path, append },
        Self::File {
          path: other_path,
          append: other_append,
        },
      ) => path == other_path && append == other_append,
      _ => false,
    }
  }
}

impl Eq for Stdio {}

/// The three slot configurations a child is launched with. Immutable once
/// the child exists.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StdioConfig {
  pub stdin: Stdio,
  pub stdout: Stdio,
  pub stderr: Stdio,
}

/// The realized descriptors for a launch.
///
/// Holds the child-side descriptor for each slot plus the parent-side
/// stream endpoints for pipe slots. Created from a [`StdioConfig`],
/// consumed by the launcher, owned by the child afterwards; `close` is
/// idempotent and releases everything exactly once.
#[derive(Debug)]
pub struct StdioHandle {
  child_in: Arc<Descriptor>,
  child_out: Arc<Descriptor>,
  child_err: Arc<Descriptor>,
  parent_in: Option<Arc<BufferedWriteStream>>,
  parent_out: Option<Arc<ReadStream>>,
  parent_err: Option<Arc<ReadStream>>,
}

impl StdioHandle {
  /// Opens every slot. On failure, descriptors opened by the earlier slots
  /// are released before the error is returned.
  pub fn open(config: &StdioConfig) -> Result<Self, StdioError> {
    let (child_in, parent_in) = open_input_slot(&config.stdin)?;
    let (child_out, parent_out) = open_output_slot(&config.stdout, 1)?;
    let (child_err, parent_err) = open_output_slot(&config.stderr, 2)?;
    Ok(Self {
      child_in,
      child_out,
      child_err,
      parent_in,
      parent_out,
      parent_err,
    })
  }

  /// The raw child-side descriptors in slot order.
  pub fn child_fds(&self) -> [RawFd; 3] {
    [
      self.child_in.raw(),
      self.child_out.raw(),
      self.child_err.raw(),
    ]
  }

  /// Runs the duplicate plan: `(child_in → 0)`, `(child_out → 1)`,
  /// `(child_err → 2)`, skipping slots whose source already sits on the
  /// target. The primitive is supplied by the launch path: a queued
  /// posix_spawn file action, or a direct `dup2` in the forked child.
  /// The first failure aborts the plan; the caller is responsible for
  /// closing the handle.
  pub fn dup2_plan<E>(
    &self,
    mut duplicate: impl FnMut(RawFd, RawFd) -> Result<(), E>,
  ) -> Result<(), E> {
    for (src, dst) in self.child_fds().into_iter().zip(0..) {
      if src != dst {
        duplicate(src, dst)?;
      }
    }
    Ok(())
  }

  /// Closes the child-side ends the parent is still holding. Called once
  /// the child exists and owns its copies; also called from `close`.
  pub fn prune_child_ends(&self) {
    for desc in [&self.child_in, &self.child_out, &self.child_err] {
      if let Err(err) = desc.close() {
        warn!("closing child-side descriptor: {err}");
      }
    }
  }

  pub fn stdin_writer(&self) -> Option<Arc<BufferedWriteStream>> {
    self.parent_in.clone()
  }

  pub fn stdout_reader(&self) -> Option<Arc<ReadStream>> {
    self.parent_out.clone()
  }

  pub fn stderr_reader(&self) -> Option<Arc<ReadStream>> {
    self.parent_err.clone()
  }

  /// Flushes and closes the parent's stdin writer, delivering EOF to the
  /// child. A no-op for non-pipe stdin slots or when already closed.
  pub fn close_stdin(&self) -> Result<(), StdioError> {
    match &self.parent_in {
      Some(writer) => writer.close(),
      None => Ok(()),
    }
  }

  /// Releases every descriptor this handle owns. Safe to call more than
  /// once; the first error is returned, later ones are logged.
  pub fn close(&self) -> Result<(), StdioError> {
    let mut first: Option<StdioError> = None;
    let mut record = |res: Result<(), StdioError>| match res {
      Ok(()) => {}
      Err(err) if first.is_none() => first = Some(err),
      Err(err) => warn!("closing stdio handle: {err}"),
    };
    record(self.close_stdin());
    self.prune_child_ends();
    if let Some(reader) = &self.parent_out {
      record(reader.close());
    }
    if let Some(reader) = &self.parent_err {
      record(reader.close());
    }
    first.map_or(Ok(()), Err)
  }
}

fn open_input_slot(
  slot: &Stdio,
) -> Result<(Arc<Descriptor>, Option<Arc<BufferedWriteStream>>), StdioError> {
  match slot {
    Stdio::Inherit => Ok((Arc::new(Descriptor::new(0)), None)),
    Stdio::MakePipe => {
      let pipe = Pipe::cloexec()?;
      let writer = BufferedWriteStream::new(WriteStream::new(pipe.write));
      Ok((pipe.read, Some(Arc::new(writer))))
    }
    Stdio::File { path, .. } => {
      let fd = open_file(path, OpenMode::Read)?;
      Ok((Arc::new(fd), None))
    }
  }
}

fn open_output_slot(
  slot: &Stdio,
  std_fd: RawFd,
) -> Result<(Arc<Descriptor>, Option<Arc<ReadStream>>), StdioError> {
  match slot {
    Stdio::Inherit => Ok((Arc::new(Descriptor::new(std_fd)), None)),
    Stdio::MakePipe => {
      let pipe = Pipe::cloexec()?;
      let reader = ReadStream::new(pipe.read);
      Ok((pipe.write, Some(Arc::new(reader))))
    }
    Stdio::File { path, append } => {
      let mode = if *append {
        OpenMode::Append
      } else {
        OpenMode::Truncate
      };
      let fd = open_file(path, mode)?;
      Ok((Arc::new(fd), None))
    }
  }
}

enum OpenMode {
  Read,
  Truncate,
  Append,
}

fn open_file(path: &Path, mode: OpenMode) -> Result<Descriptor, StdioError> {
  let mut options = File::options();
  match mode {
    OpenMode::Read => {
      options.read(true);
    }
    OpenMode::Truncate => {
      options.write(true).create(true).truncate(true).mode(0o644);
    }
    OpenMode::Append => {
      options.write(true).create(true).append(true).mode(0o644);
    }
  }
  options.custom_flags(libc::O_CLOEXEC);
  let file = options.open(path).map_err(|err| StdioError::Io {
    errno: err
      .raw_os_error()
      .map_or(Errno::EIO, Errno::from_raw),
    op: "open stdio file",
  })?;
  Ok(Descriptor::new(file.into_raw_fd()))
}
