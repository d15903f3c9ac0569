//! Error taxonomy and the out-of-band fault channel.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use nix::errno::Errno;
use offspring_stdio::StdioError;
use snafu::Snafu;
use tracing::warn;

/// Errors raised on the launch path or by lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum Error {
  /// Builder misuse: blank command, NUL bytes in argv or environment.
  #[snafu(display("invalid command: {reason}"))]
  Invalid { reason: String },

  /// The command or working directory does not exist.
  #[snafu(display("no such file: {}", path.display()))]
  FileNotFound { path: PathBuf },

  /// An OS call failed.
  #[snafu(display("{message}: {errno}"))]
  Io { errno: Errno, message: String },

  /// A blocking call was interrupted without making progress.
  #[snafu(display("operation interrupted"))]
  Interrupted,

  /// The stream or handle was closed before the operation.
  #[snafu(display("stream or handle is closed"))]
  Closed,

  /// The platform lacks a capability. Internal signal from the spawn fast
  /// path to the fork fallback; reaches callers only when no fallback
  /// exists.
  #[snafu(display("{what} is not supported on this platform"))]
  Unsupported { what: &'static str },
}

impl Error {
  pub(crate) fn io(errno: Errno, message: impl Into<String>) -> Self {
    Self::Io {
      errno,
      message: message.into(),
    }
  }

  pub(crate) fn invalid(reason: impl Into<String>) -> Self {
    Self::Invalid {
      reason: reason.into(),
    }
  }
}

impl From<StdioError> for Error {
  fn from(err: StdioError) -> Self {
    match err {
      StdioError::Io { errno, op } => Self::io(errno, op),
      StdioError::Closed => Self::Closed,
      StdioError::Interrupted => Self::Interrupted,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Where a fault reported through the error handler originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultContext {
  Destroy,
  FeedStdout,
  FeedStderr,
}

impl fmt::Display for FaultContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Destroy => "destroy",
      Self::FeedStdout => "stdout feed",
      Self::FeedStderr => "stderr feed",
    })
  }
}

/// An error that occurred outside the launch path. Delivered to the
/// configured error handler instead of being raised, so that `destroy`
/// and the reader threads never fail their callers.
#[derive(Debug, Clone, Snafu)]
#[snafu(display("process fault during {context}: {source}"))]
pub struct ProcessFault {
  pub context: FaultContext,
  pub source: Error,
}

/// Callback receiving [`ProcessFault`]s. Never invoked between fork and
/// exec, and never re-entered from itself.
pub type ErrorHandler = Arc<dyn Fn(&ProcessFault) + Send + Sync>;

pub(crate) fn default_error_handler() -> ErrorHandler {
  Arc::new(|fault| warn!("{fault}"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stdio_errors_map_onto_the_taxonomy() {
    assert_eq!(
      Error::from(StdioError::io(Errno::EPIPE, "write")),
      Error::io(Errno::EPIPE, "write")
    );
    assert_eq!(Error::from(StdioError::Closed), Error::Closed);
    assert_eq!(Error::from(StdioError::Interrupted), Error::Interrupted);
  }

  #[test]
  fn fault_display_names_the_context() {
    let fault = ProcessFault {
      context: FaultContext::FeedStderr,
      source: Error::Closed,
    };
    let rendered = fault.to_string();
    assert!(rendered.contains("stderr feed"));
  }
}
