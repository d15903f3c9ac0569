use nix::errno::Errno;
use snafu::Snafu;

/// Errors surfaced by the descriptor, pipe and stream layer.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum StdioError {
  /// An OS call failed. Carries the errno and the operation that failed.
  #[snafu(display("{op} failed: {errno}"))]
  Io { errno: Errno, op: &'static str },
  /// The stream or handle was closed before or during the operation.
  #[snafu(display("stream is closed"))]
  Closed,
  /// A blocking call was interrupted repeatedly without making progress.
  #[snafu(display("interrupted with no progress"))]
  Interrupted,
}

impl StdioError {
  pub fn io(errno: Errno, op: &'static str) -> Self {
    Self::Io { errno, op }
  }

  pub fn last_os(op: &'static str) -> Self {
    Self::Io {
      errno: Errno::last(),
      op,
    }
  }
}
