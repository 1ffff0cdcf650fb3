//! Byte- and bit-level encoding primitives shared by the WAL, chunk, index and tombstone formats.

use crc32fast::Hasher as Crc32;

use crate::error::DbError;

pub fn put_be_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}
pub fn put_be_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}
pub fn put_le_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}
pub fn put_le_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Zig-zag encoded signed varint.
pub fn put_varint(buf: &mut Vec<u8>, v: i64) {
    put_uvarint(buf, ((v << 1) ^ (v >> 63)) as u64);
}

pub fn put_uvarint_str(buf: &mut Vec<u8>, s: &str) {
    put_uvarint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

#[inline]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(bytes);
    h.finalize()
}

/// Bounds-checked cursor over an encoded byte slice.
#[derive(Debug, Clone)]
pub struct Decbuf<'a> {
    b: &'a [u8],
}

impl<'a> Decbuf<'a> {
    pub fn new(b: &'a [u8]) -> Self {
        Self { b }
    }

    pub fn len(&self) -> usize {
        self.b.len()
    }

    pub fn is_empty(&self) -> bool {
        self.b.is_empty()
    }

    pub fn byte(&mut self) -> Result<u8, DbError> {
        let (&first, rest) = self.b.split_first().ok_or_else(|| truncated("byte"))?;
        self.b = rest;
        Ok(first)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], DbError> {
        if self.b.len() < n {
            return Err(truncated("byte slice"));
        }
        let (head, rest) = self.b.split_at(n);
        self.b = rest;
        Ok(head)
    }

    pub fn be_u32(&mut self) -> Result<u32, DbError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn be_u64(&mut self) -> Result<u64, DbError> {
        let b = self.bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    pub fn uvarint(&mut self) -> Result<u64, DbError> {
        let mut out: u64 = 0;
        let mut shift: u32 = 0;
        for _ in 0..10 {
            let byte = self.byte()?;
            out |= ((byte & 0x7F) as u64) << shift;
            if (byte & 0x80) == 0 {
                return Ok(out);
            }
            shift = shift.saturating_add(7);
        }
        Err(DbError::Corruption {
            details: "varint too long".to_string(),
        })
    }

    pub fn varint(&mut self) -> Result<i64, DbError> {
        let u = self.uvarint()?;
        Ok(((u >> 1) as i64) ^ -((u & 1) as i64))
    }

    pub fn uvarint_str(&mut self) -> Result<String, DbError> {
        let len = self.uvarint()? as usize;
        let b = self.bytes(len)?;
        String::from_utf8(b.to_vec()).map_err(|e| DbError::Corruption {
            details: format!("invalid UTF-8: {}", e),
        })
    }
}

fn truncated(what: &str) -> DbError {
    DbError::Corruption {
        details: format!("unexpected end of data reading {}", what),
    }
}

/// Append-only bit stream. `free` is the number of unused low bits in the last byte.
#[derive(Debug, Clone, Default)]
pub struct BitStream {
    buf: Vec<u8>,
    free: u8,
}

impl BitStream {
    pub fn from_vec(buf: Vec<u8>) -> Self {
        Self { buf, free: 0 }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_bit(&mut self, bit: bool) {
        if self.free == 0 {
            self.buf.push(0);
            self.free = 8;
        }
        if bit {
            if let Some(last) = self.buf.last_mut() {
                *last |= 1 << (self.free - 1);
            }
        }
        self.free -= 1;
    }

    pub fn write_byte(&mut self, byte: u8) {
        if self.free == 0 {
            self.buf.push(byte);
            return;
        }
        let free = self.free;
        if let Some(last) = self.buf.last_mut() {
            *last |= byte >> (8 - free);
        }
        self.buf.push(byte << free);
    }

    /// Writes the low `nbits` bits of `v`, most significant first.
    pub fn write_bits(&mut self, mut v: u64, mut nbits: u32) {
        if nbits == 0 {
            return;
        }
        v <<= 64 - nbits;
        while nbits >= 8 {
            self.write_byte((v >> 56) as u8);
            v <<= 8;
            nbits -= 8;
        }
        while nbits > 0 {
            self.write_bit((v >> 63) == 1);
            v <<= 1;
            nbits -= 1;
        }
    }
}

/// Reads bits written by [`BitStream`].
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    buf: &'a [u8],
    pos: usize,
    // bits still unread in buf[pos]
    left: u8,
}

impl<'a> BitReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, left: 8 }
    }

    pub fn read_bit(&mut self) -> Result<bool, DbError> {
        if self.left == 0 {
            self.pos += 1;
            self.left = 8;
        }
        let byte = *self.buf.get(self.pos).ok_or_else(|| truncated("bit"))?;
        self.left -= 1;
        Ok((byte >> self.left) & 1 == 1)
    }

    pub fn read_byte(&mut self) -> Result<u8, DbError> {
        Ok(self.read_bits(8)? as u8)
    }

    pub fn read_bits(&mut self, nbits: u32) -> Result<u64, DbError> {
        let mut v = 0u64;
        for _ in 0..nbits {
            v = (v << 1) | self.read_bit()? as u64;
        }
        Ok(v)
    }

    pub fn read_uvarint(&mut self) -> Result<u64, DbError> {
        let mut out: u64 = 0;
        let mut shift: u32 = 0;
        for _ in 0..10 {
            let byte = self.read_byte()?;
            out |= ((byte & 0x7F) as u64) << shift;
            if (byte & 0x80) == 0 {
                return Ok(out);
            }
            shift = shift.saturating_add(7);
        }
        Err(DbError::Corruption {
            details: "varint too long".to_string(),
        })
    }

    pub fn read_varint(&mut self) -> Result<i64, DbError> {
        let u = self.read_uvarint()?;
        Ok(((u >> 1) as i64) ^ -((u & 1) as i64))
    }
}
