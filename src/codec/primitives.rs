use super::{RCodec, WCodec, WireCodec};
use crate::buffers::{
    reader::{DidntRead, Reader},
    writer::{DidntWrite, Writer},
};

// Fixed-width little-endian numbers
macro_rules! le_impl {
    ($t:ty) => {
        impl<W> WCodec<$t, &mut W> for WireCodec
        where
            W: Writer,
        {
            type Output = Result<(), DidntWrite>;

            fn write(self, writer: &mut W, x: $t) -> Self::Output {
                writer.write_exact(&x.to_le_bytes())
            }
        }

        impl<W> WCodec<&$t, &mut W> for WireCodec
        where
            W: Writer,
        {
            type Output = Result<(), DidntWrite>;

            fn write(self, writer: &mut W, x: &$t) -> Self::Output {
                self.write(writer, *x)
            }
        }

        impl<R> RCodec<$t, &mut R> for WireCodec
        where
            R: Reader,
        {
            type Error = DidntRead;

            fn read(self, reader: &mut R) -> Result<$t, Self::Error> {
                let mut x = [0u8; size_of::<$t>()];
                reader.read_exact(&mut x)?;
                Ok(<$t>::from_le_bytes(x))
            }
        }
    };
}

le_impl!(u8);
le_impl!(u16);
le_impl!(u32);
le_impl!(u64);
le_impl!(i8);
le_impl!(i16);
le_impl!(i32);
le_impl!(i64);
le_impl!(f32);
