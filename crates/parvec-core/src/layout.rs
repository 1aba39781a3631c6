//! Flat little-endian encoding of payloads into shared-memory blocks.
//!
//! The block size is always dictated by the space
//! ([`Space::fixed_byte_len`](crate::Space::fixed_byte_len)); encoders
//! check the payload fits it exactly.

use crate::error::LayoutError;

/// A payload that can be written to and read back from a fixed-size
/// byte block.
pub trait FixedLayout: Sized {
    /// Encode `self` into `out`, which must be exactly the encoded size.
    fn write_fixed(&self, out: &mut [u8]) -> Result<(), LayoutError>;

    /// Decode a value from a block previously filled by `write_fixed`.
    fn read_fixed(bytes: &[u8]) -> Result<Self, LayoutError>;
}

fn check_len(expected: usize, actual: usize) -> Result<(), LayoutError> {
    if expected != actual {
        return Err(LayoutError::LengthMismatch { expected, actual });
    }
    Ok(())
}

fn check_aligned(len: usize, width: usize) -> Result<(), LayoutError> {
    if len % width != 0 {
        return Err(LayoutError::Misaligned { len, width });
    }
    Ok(())
}

impl FixedLayout for Vec<f32> {
    fn write_fixed(&self, out: &mut [u8]) -> Result<(), LayoutError> {
        check_len(out.len(), self.len() * 4)?;
        for (chunk, v) in out.chunks_exact_mut(4).zip(self) {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }

    fn read_fixed(bytes: &[u8]) -> Result<Self, LayoutError> {
        check_aligned(bytes.len(), 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

impl FixedLayout for Vec<i64> {
    fn write_fixed(&self, out: &mut [u8]) -> Result<(), LayoutError> {
        check_len(out.len(), self.len() * 8)?;
        for (chunk, v) in out.chunks_exact_mut(8).zip(self) {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }

    fn read_fixed(bytes: &[u8]) -> Result<Self, LayoutError> {
        check_aligned(bytes.len(), 8)?;
        Ok(bytes
            .chunks_exact(8)
            .map(|c| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(c);
                i64::from_le_bytes(raw)
            })
            .collect())
    }
}

impl FixedLayout for i64 {
    fn write_fixed(&self, out: &mut [u8]) -> Result<(), LayoutError> {
        check_len(out.len(), 8)?;
        out.copy_from_slice(&self.to_le_bytes());
        Ok(())
    }

    fn read_fixed(bytes: &[u8]) -> Result<Self, LayoutError> {
        check_len(8, bytes.len())?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(raw))
    }
}

impl FixedLayout for Vec<u8> {
    fn write_fixed(&self, out: &mut [u8]) -> Result<(), LayoutError> {
        check_len(out.len(), self.len())?;
        out.copy_from_slice(self);
        Ok(())
    }

    fn read_fixed(bytes: &[u8]) -> Result<Self, LayoutError> {
        Ok(bytes.to_vec())
    }
}
