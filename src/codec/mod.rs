//! Fixed-width wire encodings used by the typed connection accessors.
//!
//! There is no framing on the wire: a value is written as its raw bytes and
//! the peer is expected to know what comes next. Integers and floats are
//! little-endian, byte slices and strings are written verbatim and read back
//! with an explicit length through [`WireCodecLen`].
use crate::buffers::{
    reader::{DidntRead, Reader},
    writer::{DidntWrite, Writer},
};

mod bytes;
mod primitives;

pub(crate) trait WCodec<Message, Buffer> {
    type Output;
    fn write(self, buffer: Buffer, message: Message) -> Self::Output;
}

pub(crate) trait RCodec<Message, Buffer> {
    type Error;
    fn read(self, buffer: Buffer) -> Result<Message, Self::Error>;
}

#[derive(Clone, Copy, Default)]
pub(crate) struct WireCodec;

impl WireCodec {
    pub(crate) const fn new() -> Self {
        Self
    }
}

/// Codec for variable-sized payloads whose length is known out of band.
#[derive(Clone, Copy)]
pub(crate) struct WireCodecLen {
    pub(crate) len: usize,
}

/// Encodes `x` into a new buffer.
#[cfg(test)]
pub(crate) fn to_vec<T>(x: T) -> Vec<u8>
where
    for<'a> WireCodec: WCodec<T, &'a mut Vec<u8>, Output = Result<(), DidntWrite>>,
{
    let mut buffer = Vec::new();
    // Writing into a Vec never fails
    let _ = WireCodec::new().write(&mut buffer, x);
    buffer
}

pub(crate) fn decode<T, R>(reader: &mut R) -> Result<T, DidntRead>
where
    R: Reader,
    for<'a> WireCodec: RCodec<T, &'a mut R, Error = DidntRead>,
{
    WireCodec::new().read(reader)
}

pub(crate) fn encode<T, W>(writer: &mut W, x: T) -> Result<(), DidntWrite>
where
    W: Writer,
    for<'a> WireCodec: WCodec<T, &'a mut W, Output = Result<(), DidntWrite>>,
{
    WireCodec::new().write(writer, x)
}
