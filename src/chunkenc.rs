//! XOR chunk encoding (delta-of-delta timestamps, XOR'd float values).
//!
//! Layout: a 2-byte big-endian sample count followed by the bit stream. The first sample is a
//! zig-zag varint timestamp and the raw 64 value bits; the second stores a uvarint timestamp
//! delta; every later sample stores a bucketed delta-of-delta. Values are XOR'd against their
//! predecessor with leading/trailing zero compression.

use crate::encoding::{BitReader, BitStream};
use crate::error::DbError;
use crate::pool::Pool;
use crate::types::{Sample, Timestamp, Value};

/// Most samples a chunk can hold.
pub const MAX_CHUNK_SAMPLES: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Encoding {
    Xor = 1,
}

impl Encoding {
    pub fn from_u8(b: u8) -> Result<Self, DbError> {
        match b {
            1 => Ok(Encoding::Xor),
            other => Err(DbError::Corruption {
                details: format!("unknown chunk encoding {}", other),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct XorChunk {
    b: BitStream,
}

impl Default for XorChunk {
    fn default() -> Self {
        Self::new()
    }
}

impl XorChunk {
    pub fn new() -> Self {
        Self::with_buffer(Vec::with_capacity(128))
    }

    /// An empty chunk writing into `buf`, whose contents are discarded.
    pub fn with_buffer(mut buf: Vec<u8>) -> Self {
        buf.clear();
        buf.extend_from_slice(&[0, 0]);
        Self {
            b: BitStream::from_vec(buf),
        }
    }

    /// Wraps encoded bytes for reading. Chunks built this way are not appended to.
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self, DbError> {
        if buf.len() < 2 {
            return Err(DbError::Corruption {
                details: format!("chunk of {} bytes has no header", buf.len()),
            });
        }
        Ok(Self {
            b: BitStream::from_vec(buf),
        })
    }

    pub fn encoding(&self) -> Encoding {
        Encoding::Xor
    }

    pub fn bytes(&self) -> &[u8] {
        self.b.bytes()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.b.into_vec()
    }

    pub fn num_samples(&self) -> usize {
        let b = self.b.bytes();
        u16::from_be_bytes([b[0], b[1]]) as usize
    }

    /// Returns an appender positioned after the last sample.
    pub fn appender(&self) -> Result<XorAppender, DbError> {
        // Replay the stream to recover the encoder state.
        let mut it = self.iter();
        while it.next().is_some() {}
        if let Some(err) = it.err.take() {
            return Err(err);
        }
        let leading = if self.num_samples() == 0 { 0xff } else { it.leading };
        Ok(XorAppender {
            t: it.t,
            v: it.val,
            t_delta: it.t_delta,
            leading,
            trailing: it.trailing,
        })
    }

    pub fn iter(&self) -> XorIterator<'_> {
        let b = self.b.bytes();
        XorIterator {
            br: BitReader::new(&b[2..]),
            num_total: self.num_samples(),
            num_read: 0,
            t: 0,
            val: 0.0,
            t_delta: 0,
            leading: 0,
            trailing: 0,
            err: None,
        }
    }
}

/// Encoder state for the tail of a chunk. It writes into the chunk passed to `append`.
#[derive(Debug, Clone)]
pub struct XorAppender {
    t: Timestamp,
    v: Value,
    t_delta: u64,
    leading: u8,
    trailing: u8,
}

impl XorAppender {
    /// Appends a sample. Fails once the chunk holds [`MAX_CHUNK_SAMPLES`] samples, the most its
    /// two byte header can count.
    pub fn append(&mut self, c: &mut XorChunk, t: Timestamp, v: Value) -> Result<(), DbError> {
        let num = c.num_samples();
        if num >= MAX_CHUNK_SAMPLES {
            return Err(DbError::Internal(format!("chunk is full at {} samples", num)));
        }
        let mut t_delta = 0u64;

        if num == 0 {
            let mut buf = Vec::with_capacity(10);
            crate::encoding::put_varint(&mut buf, t);
            for byte in buf {
                c.b.write_byte(byte);
            }
            c.b.write_bits(v.to_bits(), 64);
        } else if num == 1 {
            t_delta = t.wrapping_sub(self.t) as u64;
            let mut buf = Vec::with_capacity(10);
            crate::encoding::put_uvarint(&mut buf, t_delta);
            for byte in buf {
                c.b.write_byte(byte);
            }
            self.write_v_delta(c, v);
        } else {
            t_delta = t.wrapping_sub(self.t) as u64;
            let dod = t_delta.wrapping_sub(self.t_delta) as i64;
            if dod == 0 {
                c.b.write_bit(false);
            } else if bit_range(dod, 14) {
                c.b.write_bits(0x02, 2);
                c.b.write_bits(dod as u64, 14);
            } else if bit_range(dod, 17) {
                c.b.write_bits(0x06, 3);
                c.b.write_bits(dod as u64, 17);
            } else if bit_range(dod, 20) {
                c.b.write_bits(0x0e, 4);
                c.b.write_bits(dod as u64, 20);
            } else {
                c.b.write_bits(0x0f, 4);
                c.b.write_bits(dod as u64, 64);
            }
            self.write_v_delta(c, v);
        }

        self.t = t;
        self.v = v;
        self.t_delta = t_delta;
        let header = ((num + 1) as u16).to_be_bytes();
        c.b.bytes_mut()[..2].copy_from_slice(&header);
        Ok(())
    }

    fn write_v_delta(&mut self, c: &mut XorChunk, v: Value) {
        let delta = v.to_bits() ^ self.v.to_bits();
        if delta == 0 {
            c.b.write_bit(false);
            return;
        }
        c.b.write_bit(true);

        // Five bits hold the leading count.
        let leading = (delta.leading_zeros() as u8).min(31);
        let trailing = delta.trailing_zeros() as u8;

        if self.leading != 0xff && leading >= self.leading && trailing >= self.trailing {
            c.b.write_bit(false);
            c.b.write_bits(
                delta >> self.trailing,
                64 - self.leading as u32 - self.trailing as u32,
            );
        } else {
            self.leading = leading;
            self.trailing = trailing;
            c.b.write_bit(true);
            c.b.write_bits(leading as u64, 5);
            // 64 significant bits does not fit in six bits; it is stored as 0.
            let sigbits = 64 - leading as u32 - trailing as u32;
            c.b.write_bits((sigbits & 0x3f) as u64, 6);
            c.b.write_bits(delta >> trailing, sigbits);
        }
    }
}

fn bit_range(x: i64, nbits: u32) -> bool {
    -((1i64 << (nbits - 1)) - 1) <= x && x <= 1i64 << (nbits - 1)
}

/// Decodes a chunk front to back. Decoding stops at the first malformed bit; `err` reports it.
#[derive(Debug)]
pub struct XorIterator<'a> {
    br: BitReader<'a>,
    num_total: usize,
    num_read: usize,
    t: Timestamp,
    val: Value,
    t_delta: u64,
    leading: u8,
    trailing: u8,
    err: Option<DbError>,
}

impl XorIterator<'_> {
    pub fn err(&self) -> Option<&DbError> {
        self.err.as_ref()
    }

    fn step(&mut self) -> Result<(), DbError> {
        if self.num_read == 0 {
            self.t = self.br.read_varint()?;
            self.val = f64::from_bits(self.br.read_bits(64)?);
            return Ok(());
        }
        if self.num_read == 1 {
            self.t_delta = self.br.read_uvarint()?;
            self.t = self.t.wrapping_add(self.t_delta as i64);
            return self.read_value();
        }

        let mut d = 0u8;
        for _ in 0..4 {
            d <<= 1;
            if !self.br.read_bit()? {
                break;
            }
            d |= 1;
        }
        let dod: i64 = match d {
            0x00 => 0,
            0x02 => self.read_dod(14)?,
            0x06 => self.read_dod(17)?,
            0x0e => self.read_dod(20)?,
            0x0f => self.br.read_bits(64)? as i64,
            other => {
                return Err(DbError::Corruption {
                    details: format!("invalid delta-of-delta marker {:#x}", other),
                })
            }
        };
        self.t_delta = (self.t_delta as i64).wrapping_add(dod) as u64;
        self.t = self.t.wrapping_add(self.t_delta as i64);
        self.read_value()
    }

    fn read_dod(&mut self, sz: u32) -> Result<i64, DbError> {
        let mut bits = self.br.read_bits(sz)?;
        if bits > (1 << (sz - 1)) {
            bits = bits.wrapping_sub(1 << sz);
        }
        Ok(bits as i64)
    }

    fn read_value(&mut self) -> Result<(), DbError> {
        if !self.br.read_bit()? {
            return Ok(());
        }
        if self.br.read_bit()? {
            self.leading = self.br.read_bits(5)? as u8;
            let mut mbits = self.br.read_bits(6)? as u8;
            if mbits == 0 {
                mbits = 64;
            }
            if self.leading as u32 + mbits as u32 > 64 {
                return Err(DbError::Corruption {
                    details: "invalid XOR significant bit width".to_string(),
                });
            }
            self.trailing = 64 - self.leading - mbits;
        }
        let mbits = 64 - self.leading as u32 - self.trailing as u32;
        let bits = self.br.read_bits(mbits)?;
        let vbits = self.val.to_bits() ^ (bits << self.trailing);
        self.val = f64::from_bits(vbits);
        Ok(())
    }
}

impl Iterator for XorIterator<'_> {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        if self.err.is_some() || self.num_read == self.num_total {
            return None;
        }
        if let Err(e) = self.step() {
            self.err = Some(e);
            return None;
        }
        self.num_read += 1;
        Some((self.t, self.val))
    }
}

/// A chunk as handed out by chunk readers.
///
/// Chunks snapshotted from the tail of a live series carry the series' last four samples,
/// which are served from that buffer instead of the bit stream.
#[derive(Debug, Clone)]
pub struct Chunk {
    data: XorChunk,
    recent: Option<[Sample; 4]>,
}

impl Chunk {
    pub fn new(data: XorChunk) -> Self {
        Self { data, recent: None }
    }

    pub(crate) fn with_recent(data: XorChunk, recent: [Sample; 4]) -> Self {
        Self {
            data,
            recent: Some(recent),
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.data.encoding()
    }

    pub fn bytes(&self) -> &[u8] {
        self.data.bytes()
    }

    pub fn num_samples(&self) -> usize {
        self.data.num_samples()
    }

    pub fn into_xor(self) -> XorChunk {
        self.data
    }

    pub fn iter(&self) -> ChunkIter<'_> {
        ChunkIter {
            inner: self.data.iter(),
            recent: self.recent,
            total: self.data.num_samples(),
            i: 0,
        }
    }
}

impl From<XorChunk> for Chunk {
    fn from(c: XorChunk) -> Self {
        Chunk::new(c)
    }
}

#[derive(Debug)]
pub struct ChunkIter<'a> {
    inner: XorIterator<'a>,
    recent: Option<[Sample; 4]>,
    total: usize,
    i: usize,
}

impl ChunkIter<'_> {
    pub fn err(&self) -> Option<&DbError> {
        self.inner.err()
    }
}

impl Iterator for ChunkIter<'_> {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        let recent = match self.recent {
            Some(buf) => buf,
            None => return self.inner.next(),
        };
        if self.i >= self.total {
            return None;
        }
        let remaining = self.total - self.i;
        self.i += 1;
        if remaining > 4 {
            return self.inner.next();
        }
        Some(recent[4 - remaining])
    }
}

/// Recycles chunk byte buffers across compactions and block reads.
#[derive(Debug)]
pub struct ChunkPool {
    bufs: Pool<Vec<u8>>,
}

impl Default for ChunkPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkPool {
    pub fn new() -> Self {
        Self {
            bufs: Pool::new(1024),
        }
    }

    /// A chunk holding a copy of `data`.
    pub fn get(&self, enc: Encoding, data: &[u8]) -> Result<XorChunk, DbError> {
        match enc {
            Encoding::Xor => {
                let mut buf = self.bufs.get();
                buf.extend_from_slice(data);
                XorChunk::from_bytes(buf)
            }
        }
    }

    /// An empty chunk ready for appending.
    pub fn get_empty(&self) -> XorChunk {
        XorChunk::with_buffer(self.bufs.get())
    }

    pub fn put(&self, c: XorChunk) {
        self.bufs.put(c.into_bytes());
    }

    pub fn idle(&self) -> usize {
        self.bufs.idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode(samples: &[Sample]) -> XorChunk {
        let mut c = XorChunk::new();
        let mut app = c.appender().unwrap();
        for &(t, v) in samples {
            app.append(&mut c, t, v).unwrap();
        }
        c
    }

    #[test]
    fn round_trips_regular_and_irregular_series() {
        let mut samples = Vec::new();
        let mut t = 1_600_000_000_000i64;
        for i in 0..200 {
            t += match i % 7 {
                0 => 15_000,
                1 => 15_001,
                2 => 14_000,
                3 => 1 << 16,
                4 => 1 << 19,
                5 => 1 << 30,
                _ => 1,
            };
            samples.push((t, (i as f64).sin() * 1000.0));
        }
        let c = encode(&samples);
        assert_eq!(c.num_samples(), 200);
        let got: Vec<Sample> = c.iter().collect();
        assert_eq!(got, samples);
    }

    #[test]
    fn appender_resumes_after_existing_samples() {
        let mut c = encode(&[(1, 1.0), (2, 2.5), (4, 2.5)]);
        let mut app = c.appender().unwrap();
        app.append(&mut c, 10, -7.25).unwrap();
        app.append(&mut c, 11, 0.0).unwrap();
        let got: Vec<Sample> = c.iter().collect();
        assert_eq!(got, vec![(1, 1.0), (2, 2.5), (4, 2.5), (10, -7.25), (11, 0.0)]);
    }

    #[test]
    fn full_chunk_rejects_more_samples() {
        let samples: Vec<Sample> = (0..MAX_CHUNK_SAMPLES as i64).map(|t| (t, 1.0)).collect();
        let mut c = encode(&samples);
        assert_eq!(c.num_samples(), MAX_CHUNK_SAMPLES);
        let mut app = c.appender().unwrap();
        assert!(matches!(app.append(&mut c, i64::MAX, 2.0), Err(DbError::Internal(_))));
        assert_eq!(c.num_samples(), MAX_CHUNK_SAMPLES);
        assert_eq!(c.iter().last(), Some((MAX_CHUNK_SAMPLES as i64 - 1, 1.0)));
    }

    #[test]
    fn special_floats_survive() {
        let c = encode(&[(0, f64::INFINITY), (1, f64::NEG_INFINITY), (2, f64::MIN_POSITIVE), (3, -0.0)]);
        let got: Vec<Sample> = c.iter().collect();
        assert_eq!(got[0].1, f64::INFINITY);
        assert_eq!(got[1].1, f64::NEG_INFINITY);
        assert_eq!(got[2].1, f64::MIN_POSITIVE);
        assert_eq!(got[3].1.to_bits(), (-0.0f64).to_bits());

        let c = encode(&[(0, f64::NAN), (5, 1.0)]);
        let got: Vec<Sample> = c.iter().collect();
        assert!(got[0].1.is_nan());
    }

    #[test]
    fn truncated_chunk_reports_error() {
        let c = encode(&[(1, 1.0), (2, 2.0), (3, 3.5)]);
        let mut bytes = c.bytes().to_vec();
        bytes.truncate(5);
        let broken = XorChunk::from_bytes(bytes).unwrap();
        let mut it = broken.iter();
        while it.next().is_some() {}
        assert!(it.err().is_some());
    }

    #[test]
    fn recent_buffer_serves_tail_samples() {
        let samples: Vec<Sample> = (0..10).map(|i| (i, i as f64)).collect();
        let c = encode(&samples);
        let recent = [(6, 60.0), (7, 70.0), (8, 80.0), (9, 90.0)];
        let chunk = Chunk::with_recent(c, recent);
        let got: Vec<Sample> = chunk.iter().collect();
        assert_eq!(&got[..6], &samples[..6]);
        assert_eq!(&got[6..], &recent[..]);
    }

    #[test]
    fn pool_recycles_buffers() {
        let pool = ChunkPool::new();
        let c = encode(&[(1, 1.0), (2, 2.0)]);
        let copy = pool.get(Encoding::Xor, c.bytes()).unwrap();
        assert_eq!(copy.iter().collect::<Vec<_>>(), vec![(1, 1.0), (2, 2.0)]);
        pool.put(copy);
        assert_eq!(pool.idle(), 1);
        let empty = pool.get_empty();
        assert_eq!(empty.num_samples(), 0);
        assert_eq!(pool.idle(), 0);
    }

    proptest! {
        #[test]
        fn encoded_samples_decode_identically(
            deltas in prop::collection::vec(0i64..5_000_000, 1..300),
            values in prop::collection::vec(-1e12f64..1e12, 300),
            start in -1_000_000_000i64..1_000_000_000,
        ) {
            let mut t = start;
            let samples: Vec<Sample> = deltas
                .iter()
                .zip(values.iter())
                .map(|(d, v)| { t += d; (t, *v) })
                .collect();
            let c = encode(&samples);
            let got: Vec<Sample> = c.iter().collect();
            prop_assert_eq!(got, samples);
        }
    }
}
