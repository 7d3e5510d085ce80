use core::fmt;

use super::reader::{DidntRead, Reader};

/// A growable FIFO byte queue backed by a contiguous ring.
///
/// Bytes are pushed at the back and popped from the front. The capacity is
/// always a power of two so that wrapping reduces to a mask, and it doubles
/// whenever a push does not fit, which keeps every operation amortized O(1).
///
/// ```
/// use tcpline::ByteQueue;
///
/// let mut queue = ByteQueue::new();
/// queue.push(b"hello");
/// assert_eq!(queue.len(), 5);
/// assert_eq!(queue.pop(), Some(b'h'));
///
/// let mut buf = [0u8; 8];
/// let read = queue.read(&mut buf);
/// assert_eq!(&buf[..read], b"ello");
/// assert!(queue.is_empty());
/// ```
#[derive(Default, Clone)]
pub struct ByteQueue {
    buf: Box<[u8]>,
    head: usize,
    len: usize,
}

impl ByteQueue {
    const MIN_CAPACITY: usize = 64;

    /// Creates an empty queue. No memory is allocated until the first push.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty queue able to hold at least `capacity` bytes without
    /// reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut queue = Self::new();
        queue.reserve(capacity);
        queue
    }

    /// Number of bytes currently queued.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of bytes the queue can hold before growing.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    fn mask(&self) -> usize {
        self.buf.len() - 1
    }

    /// Makes room for at least `additional` more bytes.
    pub fn reserve(&mut self, additional: usize) {
        let required = self.len + additional;
        if required <= self.capacity() {
            return;
        }
        let capacity = required.next_power_of_two().max(Self::MIN_CAPACITY);
        let mut buf = vec![0u8; capacity].into_boxed_slice();
        let (front, back) = self.as_slices();
        buf[..front.len()].copy_from_slice(front);
        buf[front.len()..front.len() + back.len()].copy_from_slice(back);
        self.buf = buf;
        self.head = 0;
    }

    /// Appends `bytes` at the back of the queue.
    pub fn push(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.reserve(bytes.len());
        let tail = (self.head + self.len) & self.mask();
        let first = bytes.len().min(self.capacity() - tail);
        self.buf[tail..tail + first].copy_from_slice(&bytes[..first]);
        self.buf[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        self.len += bytes.len();
    }

    /// Removes and returns the byte at the front of the queue.
    pub fn pop(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let byte = self.buf[self.head];
        self.consume(1);
        Some(byte)
    }

    /// Returns the byte at the front of the queue without removing it.
    pub fn front(&self) -> Option<u8> {
        (!self.is_empty()).then(|| self.buf[self.head])
    }

    /// Moves up to `into.len()` bytes from the front of the queue into
    /// `into`, returning how many were moved.
    pub fn read(&mut self, into: &mut [u8]) -> usize {
        let len = into.len().min(self.len);
        let (front, back) = self.as_slices();
        let first = len.min(front.len());
        into[..first].copy_from_slice(&front[..first]);
        into[first..len].copy_from_slice(&back[..len - first]);
        self.consume(len);
        len
    }

    /// Returns the queued bytes as two slices, front first.
    ///
    /// The second slice is empty unless the content wraps around the end of
    /// the ring.
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        if self.is_empty() {
            return (&[], &[]);
        }
        let end = self.head + self.len;
        if end <= self.capacity() {
            (&self.buf[self.head..end], &[])
        } else {
            (&self.buf[self.head..], &self.buf[..end - self.capacity()])
        }
    }

    /// Drops `len` bytes from the front of the queue.
    ///
    /// # Panics
    ///
    /// Panics if `len` is greater than the number of queued bytes.
    pub fn consume(&mut self, len: usize) {
        assert!(len <= self.len, "cannot consume more bytes than queued");
        if len == 0 {
            return;
        }
        self.len -= len;
        self.head = if self.len == 0 { 0 } else { (self.head + len) & self.mask() };
    }

    /// Moves every queued byte to the end of `out`, leaving the queue empty.
    pub fn drain_into(&mut self, out: &mut Vec<u8>) {
        let (front, back) = self.as_slices();
        out.reserve(front.len() + back.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        self.clear();
    }

    /// Moves up to `len` bytes from the front of this queue to the back of
    /// `into`, returning how many were moved.
    pub fn transfer(&mut self, into: &mut ByteQueue, len: usize) -> usize {
        let len = len.min(self.len);
        let (front, back) = self.as_slices();
        let first = len.min(front.len());
        into.push(&front[..first]);
        into.push(&back[..len - first]);
        self.consume(len);
        len
    }

    /// Removes every byte, keeping the allocation.
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}

impl fmt::Debug for ByteQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteQueue")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl From<&[u8]> for ByteQueue {
    fn from(bytes: &[u8]) -> Self {
        let mut queue = Self::with_capacity(bytes.len());
        queue.push(bytes);
        queue
    }
}

impl Reader for ByteQueue {
    fn read_exact(&mut self, into: &mut [u8]) -> Result<(), DidntRead> {
        if self.len < into.len() {
            return Err(DidntRead);
        }
        ByteQueue::read(self, into);
        Ok(())
    }
}
