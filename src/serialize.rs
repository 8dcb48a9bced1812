//! Wire serialization helpers: little-endian integers, CompactSize varints,
//! length-prefixed byte strings.

use crate::error::{ConsensusError, Result};
use crate::types::Uint256;

/// Upper bound for any single length prefix we are willing to honour
pub const MAX_SIZE: u64 = 0x0200_0000;

fn short_read(what: &str) -> ConsensusError {
    ConsensusError::Serialization(format!("unexpected end of data reading {what}"))
}

pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(short_read("bytes"));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_fixed::<1>()?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_fixed()?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_i64_le(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_hash(&mut self) -> Result<Uint256> {
        Ok(Uint256(self.read_fixed()?))
    }

    /// CompactSize; non-canonical encodings are rejected
    pub fn read_varint(&mut self) -> Result<u64> {
        let first = self.read_u8()?;
        let value = match first {
            0xfd => {
                let v = self.read_u16_le()? as u64;
                if v < 0xfd {
                    return Err(ConsensusError::Serialization("non-canonical varint".into()));
                }
                v
            }
            0xfe => {
                let v = self.read_u32_le()? as u64;
                if v <= 0xffff {
                    return Err(ConsensusError::Serialization("non-canonical varint".into()));
                }
                v
            }
            0xff => {
                let v = self.read_u64_le()?;
                if v <= 0xffff_ffff {
                    return Err(ConsensusError::Serialization("non-canonical varint".into()));
                }
                v
            }
            n => n as u64,
        };
        Ok(value)
    }

    /// Varint used as an element count or length; bounded by `MAX_SIZE`
    pub fn read_len(&mut self) -> Result<usize> {
        let n = self.read_varint()?;
        if n > MAX_SIZE {
            return Err(ConsensusError::Serialization(format!("length {n} too large")));
        }
        Ok(n as usize)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>> {
        let n = self.read_len()?;
        Ok(self.read_bytes(n)?.to_vec())
    }

    pub fn read_var_str(&mut self) -> Result<String> {
        let bytes = self.read_var_bytes()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[derive(Default, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            buf: Vec::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16_le(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u16_be(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32_le(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32_le(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64_le(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_hash(&mut self, h: &Uint256) {
        self.buf.extend_from_slice(&h.0);
    }

    pub fn write_varint(&mut self, v: u64) {
        write_varint(&mut self.buf, v);
    }

    pub fn write_var_bytes(&mut self, b: &[u8]) {
        self.write_varint(b.len() as u64);
        self.write_bytes(b);
    }

    pub fn write_var_str(&mut self, s: &str) {
        self.write_var_bytes(s.as_bytes());
    }
}

pub fn write_varint(buf: &mut Vec<u8>, v: u64) {
    if v < 0xfd {
        buf.push(v as u8);
    } else if v <= 0xffff {
        buf.push(0xfd);
        buf.extend_from_slice(&(v as u16).to_le_bytes());
    } else if v <= 0xffff_ffff {
        buf.push(0xfe);
        buf.extend_from_slice(&(v as u32).to_le_bytes());
    } else {
        buf.push(0xff);
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

pub fn varint_size(v: u64) -> usize {
    if v < 0xfd {
        1
    } else if v <= 0xffff {
        3
    } else if v <= 0xffff_ffff {
        5
    } else {
        9
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        for v in [0u64, 0xfc, 0xfd, 0xffff, 0x10000, 0xffff_ffff, 0x1_0000_0000] {
            let mut buf = Vec::new();
            write_varint(&mut buf, v);
            assert_eq!(buf.len(), varint_size(v));
            let mut d = Decoder::new(&buf);
            assert_eq!(d.read_varint().unwrap(), v);
            assert!(d.is_empty());
        }
    }

    #[test]
    fn test_non_canonical_varint_rejected() {
        let buf = [0xfd, 0x10, 0x00];
        assert!(Decoder::new(&buf).read_varint().is_err());
    }

    #[test]
    fn test_short_read() {
        let buf = [1u8, 2, 3];
        let mut d = Decoder::new(&buf);
        assert!(d.read_u32_le().is_err());
    }
}
