use super::{RCodec, WCodec, WireCodec, WireCodecLen};
use crate::buffers::{
    reader::{DidntRead, Reader},
    writer::{DidntWrite, Writer},
};

// &[u8] / &str, written verbatim
impl<W> WCodec<&[u8], &mut W> for WireCodec
where
    W: Writer,
{
    type Output = Result<(), DidntWrite>;

    fn write(self, writer: &mut W, x: &[u8]) -> Self::Output {
        if x.is_empty() { Ok(()) } else { writer.write_exact(x) }
    }
}

impl<W> WCodec<&str, &mut W> for WireCodec
where
    W: Writer,
{
    type Output = Result<(), DidntWrite>;

    fn write(self, writer: &mut W, x: &str) -> Self::Output {
        self.write(&mut *writer, x.as_bytes())
    }
}

impl<R> RCodec<Vec<u8>, &mut R> for WireCodecLen
where
    R: Reader,
{
    type Error = DidntRead;

    fn read(self, reader: &mut R) -> Result<Vec<u8>, Self::Error> {
        let mut buff = vec![0u8; self.len];
        if self.len != 0 {
            reader.read_exact(&mut buff[..])?;
        }
        Ok(buff)
    }
}
