use super::writer::{DidntWrite, Writer};

// Pending write transactions accumulate into a plain vector, which never runs
// out of space.
impl Writer for Vec<u8> {
    fn write_exact(&mut self, bytes: &[u8]) -> Result<(), DidntWrite> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}
