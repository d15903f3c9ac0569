//! Byte-level I/O over pipe descriptors.

use std::sync::{Arc, Mutex, PoisonError};

use nix::errno::Errno;
use nix::libc;

use crate::error::StdioError;
use crate::fd::Descriptor;

/// Consecutive `EINTR`s without any progress before giving up.
const INTERRUPT_LIMIT: u32 = 3;

/// Capacity of [`BufferedWriteStream`].
pub const WRITE_BUFFER_SIZE: usize = 8 * 1024;

/// Parent-side reader for a child's stdout/stderr pipe.
#[derive(Debug)]
pub struct ReadStream {
  fd: Arc<Descriptor>,
}

impl ReadStream {
  pub(crate) fn new(fd: Arc<Descriptor>) -> Self {
    Self { fd }
  }

  /// Reads up to `buf.len()` bytes. `Ok(0)` means end of stream.
  pub fn read(&self, buf: &mut [u8]) -> Result<usize, StdioError> {
    if self.fd.is_closed() {
      return Err(StdioError::Closed);
    }
    let mut interrupts = 0;
    loop {
      let res = unsafe { libc::read(self.fd.raw(), buf.as_mut_ptr().cast(), buf.len()) };
      match Errno::result(res) {
        Ok(n) => return Ok(n as usize),
        Err(Errno::EINTR) => {
          interrupts += 1;
          if interrupts >= INTERRUPT_LIMIT {
            return Err(StdioError::Interrupted);
          }
        }
        Err(errno) => {
          return Err(if self.fd.is_closed() {
            StdioError::Closed
          } else {
            StdioError::io(errno, "read")
          });
        }
      }
    }
  }

  pub fn is_closed(&self) -> bool {
    self.fd.is_closed()
  }

  pub fn close(&self) -> Result<(), StdioError> {
    self.fd.close()
  }
}

/// Parent-side writer for a child's stdin pipe.
#[derive(Debug)]
pub struct WriteStream {
  fd: Arc<Descriptor>,
}

impl WriteStream {
  pub(crate) fn new(fd: Arc<Descriptor>) -> Self {
    Self { fd }
  }

  /// Writes the whole buffer, retrying interrupts and short writes.
  pub fn write(&self, mut buf: &[u8]) -> Result<(), StdioError> {
    if self.fd.is_closed() {
      return Err(StdioError::Closed);
    }
    let mut interrupts = 0;
    while !buf.is_empty() {
      let res = unsafe { libc::write(self.fd.raw(), buf.as_ptr().cast(), buf.len()) };
      match Errno::result(res) {
        Ok(0) => return Err(StdioError::io(Errno::EIO, "write")),
        Ok(n) => {
          buf = &buf[n as usize..];
          interrupts = 0;
        }
        Err(Errno::EINTR) => {
          interrupts += 1;
          if interrupts >= INTERRUPT_LIMIT {
            return Err(StdioError::Interrupted);
          }
        }
        Err(errno) => {
          return Err(if self.fd.is_closed() {
            StdioError::Closed
          } else {
            StdioError::io(errno, "write")
          });
        }
      }
    }
    Ok(())
  }

  pub fn is_closed(&self) -> bool {
    self.fd.is_closed()
  }

  pub fn close(&self) -> Result<(), StdioError> {
    self.fd.close()
  }
}

/// [`WriteStream`] with an 8 KiB in-memory buffer.
///
/// Writes larger than the buffer are flushed through directly; closing
/// flushes whatever is pending and then releases the descriptor.
#[derive(Debug)]
pub struct BufferedWriteStream {
  inner: WriteStream,
  buf: Mutex<Vec<u8>>,
}

impl BufferedWriteStream {
  pub(crate) fn new(inner: WriteStream) -> Self {
    Self {
      inner,
      buf: Mutex::new(Vec::with_capacity(WRITE_BUFFER_SIZE)),
    }
  }

  pub fn write(&self, bytes: &[u8]) -> Result<(), StdioError> {
    let mut buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
    if bytes.len() >= WRITE_BUFFER_SIZE {
      Self::flush_locked(&self.inner, &mut buf)?;
      return self.inner.write(bytes);
    }
    if buf.len() + bytes.len() > WRITE_BUFFER_SIZE {
      Self::flush_locked(&self.inner, &mut buf)?;
    }
    buf.extend_from_slice(bytes);
    Ok(())
  }

  pub fn flush(&self) -> Result<(), StdioError> {
    let mut buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
    Self::flush_locked(&self.inner, &mut buf)
  }

  fn flush_locked(inner: &WriteStream, buf: &mut Vec<u8>) -> Result<(), StdioError> {
    if buf.is_empty() {
      return Ok(());
    }
    inner.write(buf)?;
    buf.clear();
    Ok(())
  }

  pub fn is_closed(&self) -> bool {
    self.inner.is_closed()
  }

  /// Flushes pending bytes and closes the descriptor, delivering EOF to the
  /// reading side. Closing twice is a no-op.
  pub fn close(&self) -> Result<(), StdioError> {
    if self.inner.is_closed() {
      return Ok(());
    }
    let flushed = self.flush();
    let closed = self.inner.close();
    flushed.and(closed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pipe::Pipe;

  fn stream_pair() -> (ReadStream, WriteStream) {
    let pipe = Pipe::cloexec().unwrap();
    (
      ReadStream::new(pipe.read.clone()),
      WriteStream::new(pipe.write.clone()),
    )
  }

  #[test]
  fn write_then_read_roundtrip() {
    let (reader, writer) = stream_pair();
    writer.write(b"hello there").unwrap();
    writer.close().unwrap();
    let mut buf = [0u8; 32];
    let n = reader.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello there");
    assert_eq!(reader.read(&mut buf).unwrap(), 0);
  }

  #[test]
  fn closed_stream_reports_closed() {
    let (reader, writer) = stream_pair();
    reader.close().unwrap();
    writer.close().unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(reader.read(&mut buf), Err(StdioError::Closed));
    assert_eq!(writer.write(b"x"), Err(StdioError::Closed));
  }

  #[test]
  fn buffered_writer_defers_until_flush() {
    let pipe = Pipe::cloexec().unwrap();
    pipe.set_read_nonblocking().unwrap();
    let reader = ReadStream::new(pipe.read.clone());
    let buffered = BufferedWriteStream::new(WriteStream::new(pipe.write.clone()));

    buffered.write(b"abc").unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(
      reader.read(&mut buf),
      Err(StdioError::io(Errno::EAGAIN, "read"))
    );

    buffered.flush().unwrap();
    let n = reader.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"abc");
  }

  #[test]
  fn oversized_write_bypasses_buffer() {
    let (reader, writer) = stream_pair();
    let buffered = BufferedWriteStream::new(writer);
    buffered.write(b"prefix-").unwrap();
    let big = vec![b'x'; WRITE_BUFFER_SIZE];
    // The pipe capacity on Linux is 64 KiB, large enough for both writes
    // without a draining thread.
    buffered.write(&big).unwrap();
    buffered.close().unwrap();

    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
      let n = reader.read(&mut buf).unwrap();
      if n == 0 {
        break;
      }
      collected.extend_from_slice(&buf[..n]);
    }
    assert_eq!(collected.len(), 7 + WRITE_BUFFER_SIZE);
    assert!(collected.starts_with(b"prefix-"));
  }

  #[test]
  fn close_is_idempotent_and_flushes() {
    let (reader, writer) = stream_pair();
    let buffered = BufferedWriteStream::new(writer);
    buffered.write(b"tail").unwrap();
    buffered.close().unwrap();
    buffered.close().unwrap();
    let mut buf = [0u8; 8];
    let n = reader.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"tail");
    assert_eq!(reader.read(&mut buf).unwrap(), 0);
  }
}
