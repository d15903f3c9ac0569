//! Descriptor, pipe and stdio plumbing for the `offspring` process library.
//!
//! Everything here is parent-side machinery: owned descriptors with
//! idempotent close, CLOEXEC pipes, retrying byte streams, the
//! line-splitting engine, and the stdio slot realization consumed by the
//! launch paths.

pub mod error;
pub mod fd;
pub mod line;
pub mod pipe;
pub mod stdio;
pub mod stream;

pub use error::StdioError;
pub use fd::Descriptor;
pub use line::{LineFeedEngine, LineSink};
pub use pipe::Pipe;
pub use stdio::{Stdio, StdioConfig, StdioHandle};
pub use stream::{BufferedWriteStream, ReadStream, WriteStream};
