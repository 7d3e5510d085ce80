//! Thread-safe byte stream adapter over [`ByteQueue`].
//!
//! A [`StreamBuffer`] connects a producer of bytes with a consumer that wants
//! to block until bytes are available. It works in one of two modes:
//!
//! - **Queue mode** (default): [`push()`](StreamBuffer::push) appends bytes
//!   to an internal [`ByteQueue`] and wakes any blocked reader.
//! - **Pull mode**: after [`set_producer()`](StreamBuffer::set_producer),
//!   reads are delegated straight to the producer callback, so bytes coming
//!   from an external pipe are never copied through the queue.
//!
//! The [`reader()`](StreamBuffer::reader) and [`writer()`](StreamBuffer::writer)
//! adapters expose the buffer as [`std::io::Read`] and [`std::io::Write`].
use std::{
    io,
    sync::{Mutex, atomic::{AtomicBool, Ordering}},
};

use thiserror::Error;

use super::queue::ByteQueue;
use crate::sync::{Event, lock};

/// Error returned when pushing into a closed [`StreamBuffer`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("The stream buffer has been closed")]
    Closed,
}

/// Callback used in pull mode. Fills the given buffer and returns the number
/// of bytes written into it; returning `0` signals end of stream.
pub type Producer = Box<dyn FnMut(&mut [u8]) -> usize + Send>;

#[derive(Default)]
struct StreamState {
    queue: ByteQueue,
    closed: bool,
}

/// A thread-safe FIFO byte stream with blocking reads.
///
/// ```
/// use std::io::Read;
///
/// use tcpline::StreamBuffer;
///
/// let stream = StreamBuffer::new();
/// stream.push(b"hello").unwrap();
/// stream.close();
///
/// let mut out = String::new();
/// stream.reader().read_to_string(&mut out).unwrap();
/// assert_eq!(out, "hello");
/// ```
#[derive(Default)]
pub struct StreamBuffer {
    state: Mutex<StreamState>,
    readable: Event,
    producer: Mutex<Option<Producer>>,
    pulling: AtomicBool,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and wakes blocked readers.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Closed`] once [`close()`](Self::close) has been
    /// called.
    pub fn push(&self, bytes: &[u8]) -> Result<(), StreamError> {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(StreamError::Closed);
            }
            state.queue.push(bytes);
        }
        self.readable.notify_all();
        Ok(())
    }

    /// Closes the stream. Queued bytes can still be read; once they are
    /// drained every read returns `0`.
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.readable.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Number of bytes queued. Pull mode bypasses the queue and leaves it
    /// untouched.
    pub fn len(&self) -> usize {
        lock(&self.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Switches the stream to pull mode: every subsequent read calls
    /// `producer` directly instead of consuming the queue.
    pub fn set_producer<F>(&self, producer: F)
    where
        F: FnMut(&mut [u8]) -> usize + Send + 'static,
    {
        *lock(&self.producer) = Some(Box::new(producer));
        self.pulling.store(true, Ordering::Release);
        self.readable.notify_all();
    }

    /// Switches the stream back to queue mode.
    pub fn clear_producer(&self) {
        self.pulling.store(false, Ordering::Release);
        *lock(&self.producer) = None;
    }

    /// Reads into `buf`, blocking the calling thread until at least one byte
    /// is available or the stream is closed.
    ///
    /// Returns the number of bytes read; `0` means end of stream.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        self.readable.wait_until_blocking(|| self.try_read(buf))
    }

    /// Async twin of [`read()`](Self::read).
    pub async fn read_async(&self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        self.readable.wait_until(|| self.try_read(buf)).await
    }

    /// Reads without blocking. Returns `None` when no byte is available and
    /// the stream is still open.
    pub fn try_read(&self, buf: &mut [u8]) -> Option<usize> {
        if self.pulling.load(Ordering::Acquire) {
            if let Some(producer) = lock(&self.producer).as_mut() {
                return Some(producer(buf));
            }
        }

        let mut state = lock(&self.state);
        if !state.queue.is_empty() {
            return Some(state.queue.read(buf));
        }
        state.closed.then_some(0)
    }

    /// Returns a [`std::io::Read`] adapter over this stream.
    pub fn reader(&self) -> StreamReader<'_> {
        StreamReader(self)
    }

    /// Returns a [`std::io::Write`] adapter over this stream.
    pub fn writer(&self) -> StreamWriter<'_> {
        StreamWriter(self)
    }
}

/// Blocking [`std::io::Read`] adapter returned by [`StreamBuffer::reader()`].
pub struct StreamReader<'a>(&'a StreamBuffer);

impl io::Read for StreamReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.0.read(buf))
    }
}

/// [`std::io::Write`] adapter returned by [`StreamBuffer::writer()`].
pub struct StreamWriter<'a>(&'a StreamBuffer);

impl io::Write for StreamWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .push(buf)
            .map(|()| buf.len())
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        sync::Arc,
        time::Duration,
    };

    use super::*;

    #[test]
    fn test_blocking_read() {
        let stream = Arc::new(StreamBuffer::new());

        let reader = std::thread::spawn({
            let stream = stream.clone();
            move || {
                let mut buf = [0u8; 16];
                let read = stream.read(&mut buf);
                buf[..read].to_vec()
            }
        });

        std::thread::sleep(Duration::from_millis(20));
        stream.push(b"ping").unwrap();
        assert_eq!(reader.join().unwrap(), b"ping");
    }

    #[test]
    fn test_close_drains_then_eof() {
        let stream = StreamBuffer::new();
        stream.push(b"abc").unwrap();
        stream.close();
        assert!(stream.is_closed());
        assert_eq!(stream.push(b"def"), Err(StreamError::Closed));

        let mut buf = [0u8; 2];
        assert_eq!(stream.read(&mut buf), 2);
        assert_eq!(&buf, b"ab");
        assert_eq!(stream.read(&mut buf), 1);
        assert_eq!(stream.read(&mut buf), 0);
        assert_eq!(stream.try_read(&mut buf), Some(0));
    }

    #[test]
    fn test_try_read_would_block() {
        let stream = StreamBuffer::new();
        let mut buf = [0u8; 4];
        assert_eq!(stream.try_read(&mut buf), None);
        assert_eq!(stream.read(&mut []), 0);
    }

    #[test]
    fn test_producer_mode() {
        let stream = StreamBuffer::new();
        stream.push(b"queued").unwrap();

        let mut remaining = 3;
        stream.set_producer(move |buf: &mut [u8]| {
            if remaining == 0 {
                return 0;
            }
            remaining -= 1;
            buf[0] = b'x';
            1
        });

        let mut out = Vec::new();
        stream.reader().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"xxx");

        // Queued bytes are untouched by pull mode
        stream.clear_producer();
        assert_eq!(stream.len(), 6);
    }

    #[test]
    fn test_io_adapters() {
        let stream = StreamBuffer::new();
        write!(stream.writer(), "hello {}", 42).unwrap();
        stream.close();
        assert!(stream.writer().write(b"late").is_err());

        let mut out = String::new();
        stream.reader().read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello 42");
    }

    #[tokio::test]
    async fn test_async_read() {
        let stream = Arc::new(StreamBuffer::new());

        let task = tokio::spawn({
            let stream = stream.clone();
            async move {
                let mut buf = [0u8; 8];
                let read = stream.read_async(&mut buf).await;
                buf[..read].to_vec()
            }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        stream.push(b"async").unwrap();
        assert_eq!(task.await.unwrap(), b"async");
    }
}
