//! Splits a byte stream into lines and fans them out to registered sinks.

use crate::error::StdioError;

/// Receives the lines of one output stream.
///
/// `on_end` is the end-of-stream sentinel; it is delivered exactly once,
/// after the last line. Closures of shape `FnMut(Option<&str>)` implement
/// this trait, receiving `None` as the sentinel.
pub trait LineSink: Send {
  fn on_line(&mut self, line: &str) -> Result<(), StdioError>;
  fn on_end(&mut self);
}

impl<F> LineSink for F
where
  F: FnMut(Option<&str>) + Send,
{
  fn on_line(&mut self, line: &str) -> Result<(), StdioError> {
    self(Some(line));
    Ok(())
  }

  fn on_end(&mut self) {
    self(None);
  }
}

/// Incremental line splitter with sink dispatch.
///
/// Lines are terminated by `\n`; a single `\r` immediately before the `\n`
/// is stripped. Bytes after the last terminator stay buffered until the
/// next chunk, or are flushed as a final line on close. The engine is not
/// a synchronization point: one producer owns it (the reader thread) and
/// callers serialize access externally.
#[derive(Default)]
pub struct LineFeedEngine {
  buffered: Vec<u8>,
  sinks: Vec<Box<dyn LineSink>>,
  closed: bool,
}

impl LineFeedEngine {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_closed(&self) -> bool {
    self.closed
  }

  /// Registers a sink. Sinks attached mid-stream receive subsequent lines
  /// but no replay; a sink attached after close only receives the
  /// end-of-stream sentinel.
  pub fn attach(&mut self, mut sink: Box<dyn LineSink>) {
    if self.closed {
      sink.on_end();
      return;
    }
    self.sinks.push(sink);
  }

  pub fn sink_count(&self) -> usize {
    self.sinks.len()
  }

  /// Feeds one chunk of bytes, dispatching every completed line to all
  /// sinks in registration order. A sink error closes the engine (each
  /// sink still sees its end-of-stream sentinel) and is returned.
  pub fn push(&mut self, chunk: &[u8]) -> Result<(), StdioError> {
    if self.closed {
      return Err(StdioError::Closed);
    }
    self.buffered.extend_from_slice(chunk);
    let mut start = 0;
    while let Some(offset) = memchr_newline(&self.buffered[start..]) {
      let newline = start + offset;
      let mut end = newline;
      if end > start && self.buffered[end - 1] == b'\r' {
        end -= 1;
      }
      let line = String::from_utf8_lossy(&self.buffered[start..end]).into_owned();
      if let Err(err) = self.dispatch(&line) {
        self.finish();
        return Err(err);
      }
      start = newline + 1;
    }
    self.buffered.drain(..start);
    Ok(())
  }

  /// Flushes a non-empty residue as the final line, then delivers the
  /// end-of-stream sentinel to every sink. Closing twice is a no-op.
  pub fn close(&mut self) -> Result<(), StdioError> {
    if self.closed {
      return Ok(());
    }
    let mut result = Ok(());
    if !self.buffered.is_empty() {
      let line = String::from_utf8_lossy(&std::mem::take(&mut self.buffered)).into_owned();
      result = self.dispatch(&line);
    }
    self.finish();
    result
  }

  fn dispatch(&mut self, line: &str) -> Result<(), StdioError> {
    for sink in &mut self.sinks {
      sink.on_line(line)?;
    }
    Ok(())
  }

  fn finish(&mut self) {
    self.closed = true;
    self.buffered.clear();
    for sink in &mut self.sinks {
      sink.on_end();
    }
  }
}

fn memchr_newline(haystack: &[u8]) -> Option<usize> {
  haystack.iter().position(|&b| b == b'\n')
}
