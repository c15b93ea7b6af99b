#![forbid(unsafe_code)]
//! Fixed-width field helpers, varints, and a bounds-checked cursor.

pub mod fixed {
    //! Fixed-width integer fields used by node and file headers.

    use crate::types::{Result, StrataError};

    /// Largest value a 24-bit field can hold.
    pub const U24_MAX: usize = 0x00FF_FFFF;

    /// Writes a 24-bit big-endian field.
    pub fn put_u24_be(dst: &mut [u8], v: usize) -> Result<()> {
        if v > U24_MAX {
            return Err(StrataError::Invalid("value exceeds 24-bit field"));
        }
        let field = dst
            .get_mut(..3)
            .ok_or(StrataError::Invalid("u24 destination too small"))?;
        field[0] = (v >> 16) as u8;
        field[1] = (v >> 8) as u8;
        field[2] = v as u8;
        Ok(())
    }

    /// Reads a 24-bit big-endian field.
    pub fn get_u24_be(src: &[u8]) -> Result<usize> {
        let field = src
            .get(..3)
            .ok_or(StrataError::Corruption("u24 source truncated"))?;
        Ok((usize::from(field[0]) << 16) | (usize::from(field[1]) << 8) | usize::from(field[2]))
    }

    /// Reads a little-endian u32.
    pub fn get_u32_le(src: &[u8]) -> Result<u32> {
        let field = src
            .get(..4)
            .ok_or(StrataError::Corruption("u32 source truncated"))?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(field);
        Ok(u32::from_le_bytes(raw))
    }

    /// Reads a little-endian i64.
    pub fn get_i64_le(src: &[u8]) -> Result<i64> {
        let field = src
            .get(..8)
            .ok_or(StrataError::Corruption("i64 source truncated"))?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(field);
        Ok(i64::from_le_bytes(raw))
    }
}

pub mod var {
    //! Unsigned varints and ZigZag signed integers.

    use crate::types::{Result, StrataError};

    /// Longest encoding of a u64.
    pub const MAX_VARINT_LEN: usize = 10;

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Number of bytes `encode_u64` produces for `v`.
    pub fn encoded_len(v: u64) -> usize {
        let bits = 64 - (v | 1).leading_zeros() as usize;
        bits.div_ceil(7)
    }

    /// Decodes a u64 varint from a slice, advancing `off` past it.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut pos = *off;
        for i in 0..MAX_VARINT_LEN {
            let byte = *src
                .get(pos)
                .ok_or(StrataError::Corruption("varint truncated"))?;
            pos += 1;
            let payload = u64::from(byte & 0x7f);
            if i == MAX_VARINT_LEN - 1 && payload > 1 {
                return Err(StrataError::Corruption("varint overflows 64 bits"));
            }
            result |= payload << (7 * i);
            if byte & 0x80 == 0 {
                *off = pos;
                return Ok(result);
            }
        }
        Err(StrataError::Corruption("varint longer than 10 bytes"))
    }

    /// Maps a signed value onto the unsigned line, small magnitudes first.
    pub const fn zigzag(v: i64) -> u64 {
        ((v << 1) ^ (v >> 63)) as u64
    }

    /// Inverse of [`zigzag`].
    pub const fn unzigzag(v: u64) -> i64 {
        ((v >> 1) as i64) ^ -((v & 1) as i64)
    }

    /// Encodes an i64 as a ZigZag varint.
    pub fn encode_i64(v: i64, out: &mut Vec<u8>) {
        encode_u64(zigzag(v), out);
    }

    /// Decodes a ZigZag varint, advancing `off` past it.
    pub fn decode_i64(src: &[u8], off: &mut usize) -> Result<i64> {
        decode_u64(src, off).map(unzigzag)
    }
}

pub mod buf {
    //! A slice-backed cursor for parsing.

    use core::fmt;

    use crate::types::{Result, StrataError};

    use super::var;

    /// A cursor for reading bytes from a slice with offset tracking.
    pub struct Cursor<'a> {
        /// The underlying byte slice.
        pub buf: &'a [u8],
        /// Current read offset.
        pub off: usize,
    }

    impl<'a> Cursor<'a> {
        /// Creates a new cursor starting at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Takes the next `n` bytes, advancing the offset.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .ok_or(StrataError::Corruption("cursor offset overflow"))?;
            let slice = self
                .buf
                .get(self.off..end)
                .ok_or(StrataError::Corruption("cursor read past end of buffer"))?;
            self.off = end;
            Ok(slice)
        }

        /// Reads one unsigned varint.
        pub fn read_u64(&mut self) -> Result<u64> {
            var::decode_u64(self.buf, &mut self.off)
        }

        /// Reads one ZigZag varint.
        pub fn read_i64(&mut self) -> Result<i64> {
            var::decode_i64(self.buf, &mut self.off)
        }

        /// Returns the number of bytes remaining in the buffer.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }
    }

    impl<'a> fmt::Debug for Cursor<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Cursor")
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }
}
