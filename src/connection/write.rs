use std::{mem, sync::atomic::Ordering};

use super::{WriteError, shared::Shared};
use crate::{codec, sync::lock};

/// An open write transaction, returned by
/// [`Connection::begin_write()`](super::Connection::begin_write).
///
/// Values are encoded into a buffer owned by the transaction and nothing
/// reaches the connection until [`end()`](Self::end) commits them in one
/// piece. Dropping the transaction without calling `end()` discards every
/// byte written to it.
///
/// ```no_run
/// # async fn example(connection: tcpline::Connection) -> Result<(), tcpline::WriteError> {
/// let mut tx = connection.begin_write()?;
/// tx.write_u16(0xCAFE).write_f32(1.5).write_string("hello");
/// tx.end()?;
/// # Ok(())
/// # }
/// ```
#[must_use = "bytes are discarded unless the transaction is ended"]
pub struct PendingWrite<'a> {
    shared: &'a Shared,
    buffer: Vec<u8>,
}

macro_rules! write_impl {
    ($name:ident, $t:ty) => {
        pub fn $name(&mut self, x: $t) -> &mut Self {
            // Writing into a Vec cannot fail
            let _ = codec::encode(&mut self.buffer, x);
            self
        }
    };
}

impl<'a> PendingWrite<'a> {
    pub(crate) fn begin(shared: &'a Shared) -> Result<Self, WriteError> {
        shared
            .writing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| WriteError::WriteInProgress)?;
        Ok(Self {
            shared,
            buffer: Vec::new(),
        })
    }

    write_impl!(write_u8, u8);
    write_impl!(write_u16, u16);
    write_impl!(write_u32, u32);
    write_impl!(write_u64, u64);
    write_impl!(write_i8, i8);
    write_impl!(write_i16, i16);
    write_impl!(write_i32, i32);
    write_impl!(write_i64, i64);
    write_impl!(write_f32, f32);

    /// Appends `bytes` verbatim.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        let _ = codec::encode(&mut self.buffer, bytes);
        self
    }

    /// Appends the UTF-8 bytes of `s`, without length or terminator.
    pub fn write_string(&mut self, s: &str) -> &mut Self {
        let _ = codec::encode(&mut self.buffer, s);
        self
    }

    /// Number of bytes written to this transaction so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Commits the transaction and wakes the writer task.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::Closed`] if the connection is closing. The
    /// transaction's bytes are discarded in that case.
    pub fn end(mut self) -> Result<(), WriteError> {
        if self.shared.is_closing() {
            return Err(WriteError::Closed);
        }
        let bytes = mem::take(&mut self.buffer);
        if !bytes.is_empty() {
            lock(&self.shared.outbound).queue.push(&bytes);
            self.shared.outbound_ready.notify_all();
        }
        Ok(())
    }
}

impl Drop for PendingWrite<'_> {
    fn drop(&mut self) {
        self.shared.writing.store(false, Ordering::Release);
    }
}
