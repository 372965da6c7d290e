use crate::errors::{ServerError, ServerResult};

/// A buffer reader that manages position and provides meaningful parsing
/// methods for the binary snapshot format.
///
/// The snapshot format mixes single opcode bytes, little-endian expiry
/// timestamps and big-endian length fields, so both byte orders are
/// provided explicitly.
#[derive(Debug)]
pub struct BufferReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BufferReader<'a> {
    /// Create a new buffer reader from a byte slice
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Get current position in the buffer
    pub fn position(&self) -> usize {
        self.position
    }

    /// Get remaining bytes in the buffer
    pub fn remaining(&self) -> usize {
        if self.position < self.buffer.len() {
            self.buffer.len() - self.position
        } else {
            0
        }
    }

    /// Check if we have at least `count` bytes remaining
    pub fn has_bytes(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    /// Read a single byte at current position
    pub fn read_u8(&mut self) -> ServerResult<u8> {
        if !self.has_bytes(1) {
            return Err(ServerError::snapshot("Not enough bytes for u8"));
        }
        let value = self.buffer[self.position];
        self.position += 1;
        Ok(value)
    }

    /// Peek at the next byte without advancing position
    #[allow(unused)]
    pub fn peek_u8(&self) -> ServerResult<u8> {
        if !self.has_bytes(1) {
            return Err(ServerError::snapshot("No bytes to peek"));
        }
        Ok(self.buffer[self.position])
    }

    /// Read a 32-bit unsigned integer in little-endian order
    pub fn read_u32_le(&mut self) -> ServerResult<u32> {
        let bytes = self.read_array::<4>("u32")?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Read a 64-bit unsigned integer in little-endian order
    pub fn read_u64_le(&mut self) -> ServerResult<u64> {
        let bytes = self.read_array::<8>("u64")?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Read a 32-bit unsigned integer in big-endian order
    pub fn read_u32_be(&mut self) -> ServerResult<u32> {
        let bytes = self.read_array::<4>("u32")?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Read an 8-bit signed integer
    pub fn read_i8(&mut self) -> ServerResult<i8> {
        Ok(self.read_u8()? as i8)
    }

    /// Read a 16-bit signed integer in little-endian order
    pub fn read_i16_le(&mut self) -> ServerResult<i16> {
        let bytes = self.read_array::<2>("i16")?;
        Ok(i16::from_le_bytes(bytes))
    }

    /// Read a 32-bit signed integer in little-endian order
    pub fn read_i32_le(&mut self) -> ServerResult<i32> {
        let bytes = self.read_array::<4>("i32")?;
        Ok(i32::from_le_bytes(bytes))
    }

    /// Read `count` bytes at current position
    pub fn read_bytes(&mut self, count: usize) -> ServerResult<Vec<u8>> {
        if !self.has_bytes(count) {
            return Err(ServerError::snapshot("Not enough bytes"));
        }
        let bytes = &self.buffer[self.position..self.position + count];
        self.position += count;
        Ok(bytes.to_vec())
    }

    /// Advance past `count` bytes without returning them
    pub fn skip(&mut self, count: usize) -> ServerResult<()> {
        if !self.has_bytes(count) {
            return Err(ServerError::snapshot("Not enough bytes to skip"));
        }
        self.position += count;
        Ok(())
    }

    fn read_array<const N: usize>(&mut self, what: &str) -> ServerResult<[u8; N]> {
        if !self.has_bytes(N) {
            return Err(ServerError::snapshot(format!("Not enough bytes for {what}")));
        }
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&self.buffer[self.position..self.position + N]);
        self.position += N;
        Ok(bytes)
    }
}
