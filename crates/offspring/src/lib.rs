//! Spawn, talk to and destroy child processes on POSIX systems.
//!
//! A [`Command`] describes the program, arguments, environment, working
//! directory and stdio wiring; [`Command::spawn`] launches it through
//! `posix_spawn` where the platform can express the request, or through a
//! fork+exec path with a tagged error pipe otherwise; the two are
//! observably identical. The resulting [`Child`] exposes pipe streams,
//! line-oriented output feeds, bounded waits and a one-shot [`Child::destroy`]
//! that signals the process and releases every descriptor exactly once.
//!
//! ```
//! use offspring::{Command, Stdio};
//! use std::sync::{Arc, Mutex};
//!
//! # fn main() -> Result<(), offspring::Error> {
//! let mut cmd = Command::new("/bin/sh");
//! cmd.arg("-c").arg("echo hello").stdout(Stdio::MakePipe);
//! let child = cmd.spawn()?;
//!
//! let lines: Arc<Mutex<Vec<String>>> = Arc::default();
//! let sink = lines.clone();
//! child.stdout_feed(move |line: Option<&str>| {
//!   if let Some(line) = line {
//!     sink.lock().unwrap().push(line.to_owned());
//!   }
//! })?;
//!
//! assert_eq!(child.wait()?, 0);
//! child.destroy();
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod child;
pub mod env;
pub mod error;
pub mod signal;
mod spawn;

pub use builder::Command;
pub use child::Child;
pub use env::EnvTable;
pub use error::{Error, ErrorHandler, FaultContext, ProcessFault, Result};
pub use signal::DestroySignal;

pub use offspring_stdio::{
  BufferedWriteStream, LineFeedEngine, LineSink, ReadStream, Stdio, StdioConfig, StdioError,
  WriteStream,
};
