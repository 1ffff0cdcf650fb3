//! Chunk segment files stored under `<block>/chunks/`.
//!
//! Each segment starts with a 4-byte magic, a version byte and three bytes of padding. Chunks
//! follow back to back as (uvarint data length, encoding byte, data, big-endian CRC32 over the
//! encoding byte and data). A chunk reference is `(segment sequence << 32) | byte offset`.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::chunkenc::{Chunk, ChunkPool, Encoding};
use crate::encoding::{crc32, put_be_u32, put_uvarint, Decbuf};
use crate::error::DbError;
use crate::types::Timestamp;

pub const MAGIC_CHUNKS: u32 = 0x85BD40DD;
pub const CHUNKS_FORMAT_V1: u8 = 1;
const SEGMENT_HEADER_SIZE: u64 = 8;
pub const DEFAULT_CHUNK_SEGMENT_SIZE: u64 = 512 * 1024 * 1024;

pub type ChunkRef = u64;

/// Reference and time bounds of a chunk, plus its data once loaded.
#[derive(Debug, Clone, Default)]
pub struct ChunkMeta {
    pub chunk_ref: ChunkRef,
    pub min_time: Timestamp,
    pub max_time: Timestamp,
    pub chunk: Option<Chunk>,
}

impl ChunkMeta {
    pub fn overlaps_closed_interval(&self, mint: Timestamp, maxt: Timestamp) -> bool {
        // The chunk itself is a closed interval [min_time, max_time].
        self.min_time <= maxt && mint <= self.max_time
    }
}

/// Serialises chunks and assigns their references.
pub trait ChunkWriter {
    /// Writes all chunks and sets `chunk_ref` on each meta.
    fn write_chunks(&mut self, chks: &mut [ChunkMeta]) -> Result<(), DbError>;

    fn close(&mut self) -> Result<(), DbError>;
}

/// Resolves chunk references to chunk data.
pub trait ChunkReader: Send + Sync {
    fn chunk(&self, r: ChunkRef) -> Result<Chunk, DbError>;

    fn close(&self) -> Result<(), DbError> {
        Ok(())
    }
}

impl<T: ChunkReader + ?Sized> ChunkReader for Arc<T> {
    fn chunk(&self, r: ChunkRef) -> Result<Chunk, DbError> {
        (**self).chunk(r)
    }

    fn close(&self) -> Result<(), DbError> {
        (**self).close()
    }
}

pub fn segment_file(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{:06}", seq))
}

#[derive(Debug)]
pub struct SegmentChunkWriter {
    dir: PathBuf,
    seq: u64,
    w: Option<BufWriter<File>>,
    n: u64,
    segment_size: u64,
    buf: Vec<u8>,
}

impl SegmentChunkWriter {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, DbError> {
        Self::with_segment_size(dir, DEFAULT_CHUNK_SEGMENT_SIZE)
    }

    pub fn with_segment_size(dir: impl AsRef<Path>, segment_size: u64) -> Result<Self, DbError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            seq: 0,
            w: None,
            n: 0,
            segment_size,
            buf: Vec::with_capacity(1024),
        })
    }

    fn finalize_tail(&mut self) -> Result<(), DbError> {
        if let Some(mut w) = self.w.take() {
            w.flush()?;
            w.get_ref().sync_all()?;
        }
        Ok(())
    }

    fn cut(&mut self) -> Result<(), DbError> {
        self.finalize_tail()?;
        self.seq += 1;
        let f = File::create(segment_file(&self.dir, self.seq))?;
        let mut w = BufWriter::with_capacity(1 << 20, f);
        let mut header = Vec::with_capacity(SEGMENT_HEADER_SIZE as usize);
        put_be_u32(&mut header, MAGIC_CHUNKS);
        header.push(CHUNKS_FORMAT_V1);
        header.extend_from_slice(&[0, 0, 0]);
        w.write_all(&header)?;
        self.w = Some(w);
        self.n = SEGMENT_HEADER_SIZE;
        Ok(())
    }
}

impl ChunkWriter for SegmentChunkWriter {
    fn write_chunks(&mut self, chks: &mut [ChunkMeta]) -> Result<(), DbError> {
        let mut max_len = 0u64;
        for c in chks.iter() {
            let chunk = c.chunk.as_ref().ok_or_else(|| {
                DbError::Internal(format!("chunk [{}, {}] has no data", c.min_time, c.max_time))
            })?;
            // uvarint length, encoding byte, data, crc
            max_len += 10 + 1 + chunk.bytes().len() as u64 + 4;
        }
        if self.w.is_none() || (self.n + max_len > self.segment_size && self.n > SEGMENT_HEADER_SIZE) {
            self.cut()?;
        }

        let seq = self.seq;
        for c in chks.iter_mut() {
            let chunk = match c.chunk.as_ref() {
                Some(chunk) => chunk,
                None => continue,
            };
            self.buf.clear();
            put_uvarint(&mut self.buf, chunk.bytes().len() as u64);
            let crc_start = self.buf.len();
            self.buf.push(chunk.encoding() as u8);
            self.buf.extend_from_slice(chunk.bytes());
            let sum = crc32(&self.buf[crc_start..]);
            put_be_u32(&mut self.buf, sum);

            c.chunk_ref = (seq << 32) | self.n;
            if let Some(w) = self.w.as_mut() {
                w.write_all(&self.buf)?;
            }
            self.n += self.buf.len() as u64;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DbError> {
        self.finalize_tail()?;
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

/// Reads chunks of an on-disk block. Segment files are loaded into memory on open.
#[derive(Debug)]
pub struct BlockChunkReader {
    segments: HashMap<u64, Vec<u8>>,
    pool: Arc<ChunkPool>,
    size: u64,
}

impl BlockChunkReader {
    pub fn open(dir: impl AsRef<Path>, pool: Arc<ChunkPool>) -> Result<Self, DbError> {
        let dir = dir.as_ref();
        let mut segments = HashMap::new();
        let mut size = 0u64;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let seq = match name.to_str().and_then(|s| s.parse::<u64>().ok()) {
                Some(seq) => seq,
                None => continue,
            };
            let data = fs::read(entry.path())?;
            let mut d = Decbuf::new(&data);
            let magic = d.be_u32().map_err(|_| DbError::Corruption {
                details: format!("chunk segment {:?} too short", entry.path()),
            })?;
            if magic != MAGIC_CHUNKS {
                return Err(DbError::Corruption {
                    details: format!("invalid magic number {:#x} in {:?}", magic, entry.path()),
                });
            }
            let version = d.byte()?;
            if version != CHUNKS_FORMAT_V1 {
                return Err(DbError::Corruption {
                    details: format!("invalid chunk format version {} in {:?}", version, entry.path()),
                });
            }
            size += data.len() as u64;
            segments.insert(seq, data);
        }
        Ok(Self { segments, pool, size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl ChunkReader for BlockChunkReader {
    fn chunk(&self, r: ChunkRef) -> Result<Chunk, DbError> {
        let seq = r >> 32;
        let off = (r & 0xffff_ffff) as usize;
        let seg = self.segments.get(&seq).ok_or_else(|| DbError::Corruption {
            details: format!("reference sequence {} out of range", seq),
        })?;
        if off >= seg.len() || (off as u64) < SEGMENT_HEADER_SIZE {
            return Err(DbError::Corruption {
                details: format!("offset {} out of range in segment {}", off, seq),
            });
        }
        let mut d = Decbuf::new(&seg[off..]);
        // The encoding byte precedes the data.
        let body_len = usize::try_from(d.uvarint()?)
            .ok()
            .and_then(|n| n.checked_add(1))
            .ok_or_else(|| DbError::Corruption {
                details: format!("chunk length overflows at ref {:#x}", r),
            })?;
        let body = d.bytes(body_len)?;
        let expected = d.be_u32()?;
        let actual = crc32(body);
        if expected != actual {
            return Err(DbError::Corruption {
                details: format!(
                    "chunk checksum mismatch at ref {:#x}: expected {:#010x}, got {:#010x}",
                    r, expected, actual
                ),
            });
        }
        let enc = Encoding::from_u8(body[0])?;
        Ok(Chunk::new(self.pool.get(enc, &body[1..])?))
    }
}

/// Chunk metas whose data goes back to the pool when the guard is dropped.
pub struct PooledChunks<'a> {
    pool: &'a ChunkPool,
    metas: Vec<ChunkMeta>,
}

impl<'a> PooledChunks<'a> {
    pub fn new(pool: &'a ChunkPool, metas: Vec<ChunkMeta>) -> Self {
        Self { pool, metas }
    }

    pub fn metas(&self) -> &[ChunkMeta] {
        &self.metas
    }

    pub fn metas_mut(&mut self) -> &mut [ChunkMeta] {
        &mut self.metas
    }
}

impl Drop for PooledChunks<'_> {
    fn drop(&mut self) {
        for m in self.metas.drain(..) {
            if let Some(c) = m.chunk {
                self.pool.put(c.into_xor());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunkenc::XorChunk;
    use tempfile::tempdir;

    fn meta(samples: &[(i64, f64)]) -> ChunkMeta {
        let mut c = XorChunk::new();
        let mut app = c.appender().unwrap();
        for &(t, v) in samples {
            app.append(&mut c, t, v).unwrap();
        }
        ChunkMeta {
            chunk_ref: 0,
            min_time: samples[0].0,
            max_time: samples[samples.len() - 1].0,
            chunk: Some(Chunk::new(c)),
        }
    }

    #[test]
    fn written_chunks_are_readable_by_ref() {
        let dir = tempdir().unwrap();
        let cdir = dir.path().join("chunks");
        let mut w = SegmentChunkWriter::with_segment_size(&cdir, 64).unwrap();
        let mut a = vec![meta(&[(1, 1.0), (2, 2.0)]), meta(&[(3, 3.0)])];
        let mut b = vec![meta(&[(10, 10.0), (11, 11.0), (12, 12.0)])];
        w.write_chunks(&mut a).unwrap();
        w.write_chunks(&mut b).unwrap();
        w.close().unwrap();

        // The tiny segment size forces the second batch into a new file.
        assert_eq!(a[0].chunk_ref >> 32, 1);
        assert_eq!(b[0].chunk_ref >> 32, 2);

        let pool = Arc::new(ChunkPool::new());
        let r = BlockChunkReader::open(&cdir, pool).unwrap();
        let got: Vec<_> = r.chunk(a[1].chunk_ref).unwrap().iter().collect();
        assert_eq!(got, vec![(3, 3.0)]);
        let got: Vec<_> = r.chunk(b[0].chunk_ref).unwrap().iter().collect();
        assert_eq!(got, vec![(10, 10.0), (11, 11.0), (12, 12.0)]);
        assert!(r.chunk((7 << 32) | 8).is_err());
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let dir = tempdir().unwrap();
        let cdir = dir.path().join("chunks");
        let mut w = SegmentChunkWriter::new(&cdir).unwrap();
        let mut a = vec![meta(&[(1, 1.0), (2, 2.0)])];
        w.write_chunks(&mut a).unwrap();
        w.close().unwrap();

        let path = segment_file(&cdir, 1);
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 6;
        data[last] ^= 0xff;
        fs::write(&path, data).unwrap();

        let r = BlockChunkReader::open(&cdir, Arc::new(ChunkPool::new())).unwrap();
        assert!(matches!(r.chunk(a[0].chunk_ref), Err(DbError::Corruption { .. })));
    }

    #[test]
    fn oversized_length_is_corruption() {
        let dir = tempdir().unwrap();
        let cdir = dir.path().join("chunks");
        let mut w = SegmentChunkWriter::new(&cdir).unwrap();
        let mut a = vec![meta(&[(1, 1.0), (2, 2.0), (3, 3.0)])];
        w.write_chunks(&mut a).unwrap();
        w.close().unwrap();

        // A ten byte uvarint holding u64::MAX where the chunk length starts.
        let path = segment_file(&cdir, 1);
        let mut data = fs::read(&path).unwrap();
        let off = (a[0].chunk_ref & 0xffff_ffff) as usize;
        data[off..off + 9].fill(0xff);
        data[off + 9] = 0x01;
        fs::write(&path, data).unwrap();

        let r = BlockChunkReader::open(&cdir, Arc::new(ChunkPool::new())).unwrap();
        assert!(matches!(r.chunk(a[0].chunk_ref), Err(DbError::Corruption { .. })));
    }

    #[test]
    fn pooled_chunks_return_on_drop() {
        let pool = ChunkPool::new();
        {
            let guard = PooledChunks::new(&pool, vec![meta(&[(1, 1.0)]), meta(&[(2, 2.0)])]);
            assert_eq!(guard.metas().len(), 2);
        }
        assert_eq!(pool.idle(), 2);
    }
}
