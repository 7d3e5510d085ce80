pub(crate) mod queue;
pub(crate) mod stream;
mod vec;

pub use queue::ByteQueue;
pub use stream::{StreamBuffer, StreamError, StreamReader, StreamWriter};

/// Traits for writing data to buffers.
pub(crate) mod writer {
    /// Error type indicating a write operation failed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct DidntWrite;

    /// A trait for writing bytes into a buffer.
    ///
    /// Writes are all-or-nothing: either every byte lands in the buffer or
    /// the buffer is left untouched.
    pub(crate) trait Writer {
        /// Writes all bytes from `bytes` into the buffer.
        ///
        /// # Errors
        ///
        /// Returns `DidntWrite` if the buffer has insufficient space to write
        /// all bytes.
        fn write_exact(&mut self, bytes: &[u8]) -> Result<(), DidntWrite>;
    }
}

/// Traits for reading data from buffers.
pub(crate) mod reader {
    /// Error type indicating a read operation failed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct DidntRead;

    /// A trait for reading bytes from a buffer.
    pub(crate) trait Reader {
        /// Reads exactly enough bytes to fill `into`.
        ///
        /// Nothing is consumed when the buffer holds fewer bytes than `into`.
        ///
        /// # Errors
        ///
        /// Returns `DidntRead` if the buffer has insufficient data.
        fn read_exact(&mut self, into: &mut [u8]) -> Result<(), DidntRead>;
    }
}
