use std::collections::BTreeSet;
use std::sync::Arc;

use crate::block::{BlockMeta, BlockReader, BlockStats};
use crate::chunkenc::{Chunk, XorChunk};
use crate::chunks::{ChunkMeta, ChunkReader, ChunkRef};
use crate::error::DbError;
use crate::index::{IndexReader, Postings};
use crate::labels::Labels;
use crate::tombstones::TombstoneReader;
use crate::types::Timestamp;
use crate::ulid::Ulid;

use super::Head;

const MAX_SERIES_ID: u64 = (1 << 40) - 1;
const MAX_CHUNK_ID: u64 = (1 << 24) - 1;

/// Packs a series id (40 bits) and a chunk id (24 bits) into a head chunk reference.
pub fn pack_chunk_id(series_id: u64, chunk_id: u64) -> Result<ChunkRef, DbError> {
    if series_id > MAX_SERIES_ID {
        return Err(DbError::Internal(format!("series id {} exceeds 5 bytes", series_id)));
    }
    if chunk_id > MAX_CHUNK_ID {
        return Err(DbError::Internal(format!("chunk id {} exceeds 3 bytes", chunk_id)));
    }
    Ok((series_id << 24) | chunk_id)
}

pub fn unpack_chunk_id(r: ChunkRef) -> (u64, u64) {
    (r >> 24, r & MAX_CHUNK_ID)
}

/// Index view of the head restricted to `[mint, maxt]`.
#[derive(Debug)]
pub struct HeadIndexReader {
    head: Arc<Head>,
    mint: Timestamp,
    maxt: Timestamp,
}

impl HeadIndexReader {
    pub(super) fn new(head: Arc<Head>, mint: Timestamp, maxt: Timestamp) -> Self {
        Self { head, mint, maxt }
    }

    fn out_of_range(&self) -> bool {
        self.maxt < self.head.min_time() || self.mint > self.head.max_time()
    }
}

impl IndexReader for HeadIndexReader {
    fn symbols(&self) -> Result<BTreeSet<String>, DbError> {
        Ok(self.head.symbols.read()?.iter().cloned().collect())
    }

    fn label_values(&self, name: &str) -> Result<Vec<String>, DbError> {
        if self.out_of_range() {
            return Ok(Vec::new());
        }
        self.head.postings.label_values(name)
    }

    fn label_names(&self) -> Result<Vec<String>, DbError> {
        if self.out_of_range() {
            return Ok(Vec::new());
        }
        self.head.postings.label_names()
    }

    fn postings(&self, name: &str, value: &str) -> Result<Postings, DbError> {
        self.head.postings.get(name, value)
    }

    fn sorted_postings(&self, p: Postings) -> Result<Vec<u64>, DbError> {
        let mut series = Vec::with_capacity(p.len() as usize);
        for r in p.iter() {
            // Series may have been garbage collected in the meantime.
            if let Some(s) = self.head.series.get_by_id(r)? {
                series.push(s);
            }
        }
        series.sort_by(|a, b| a.lset.cmp(&b.lset));
        Ok(series.iter().map(|s| s.series_ref).collect())
    }

    fn series(&self, series_ref: u64, lset: &mut Labels, chks: &mut Vec<ChunkMeta>) -> Result<(), DbError> {
        let s = self.head.series.get_by_id(series_ref)?.ok_or(DbError::NotFound)?;
        *lset = s.lset.clone();
        chks.clear();

        let st = s.state.lock()?;
        for (i, c) in st.chunks.iter().enumerate() {
            if !c.overlaps_closed_interval(self.mint, self.maxt) {
                continue;
            }
            chks.push(ChunkMeta {
                chunk_ref: pack_chunk_id(s.series_ref, st.chunk_id(i))?,
                min_time: c.min_time.max(self.mint),
                max_time: c.max_time.min(self.maxt),
                chunk: None,
            });
        }
        Ok(())
    }

    fn symbol_table_size(&self) -> u64 {
        match self.head.symbols.read() {
            Ok(symbols) => symbols.iter().map(|s| s.len() as u64).sum(),
            Err(_) => 0,
        }
    }
}

/// Chunk view of the head restricted to `[mint, maxt]`.
///
/// Chunks are copied out under the series lock. The tail chunk keeps its last samples in the
/// series' ring buffer; chunks reaching past the range are re-encoded with only the samples in
/// range.
#[derive(Debug)]
pub struct HeadChunkReader {
    head: Arc<Head>,
    mint: Timestamp,
    maxt: Timestamp,
}

impl HeadChunkReader {
    pub(super) fn new(head: Arc<Head>, mint: Timestamp, maxt: Timestamp) -> Self {
        Self { head, mint, maxt }
    }
}

impl ChunkReader for HeadChunkReader {
    fn chunk(&self, r: ChunkRef) -> Result<Chunk, DbError> {
        let (sid, cid) = unpack_chunk_id(r);
        // The series may have been garbage collected.
        let s = self.head.series.get_by_id(sid)?.ok_or(DbError::NotFound)?;
        let st = s.state.lock()?;
        let (c, is_head) = st.chunk(cid).ok_or(DbError::NotFound)?;
        if !c.overlaps_closed_interval(self.mint, self.maxt) {
            return Err(DbError::NotFound);
        }

        let snapshot = if is_head {
            Chunk::with_recent(c.chunk.clone(), st.sample_buf)
        } else {
            Chunk::new(c.chunk.clone())
        };
        if c.min_time >= self.mint && c.max_time <= self.maxt {
            return Ok(snapshot);
        }
        drop(st);

        let mut clipped = XorChunk::new();
        let mut app = clipped.appender()?;
        for (t, v) in snapshot.iter() {
            if t >= self.mint && t <= self.maxt {
                app.append(&mut clipped, t, v)?;
            }
        }
        Ok(Chunk::new(clipped))
    }
}

/// The head seen as a block covering `[mint, maxt]`.
#[derive(Debug, Clone)]
pub struct RangeHead {
    head: Arc<Head>,
    mint: Timestamp,
    maxt: Timestamp,
}

impl RangeHead {
    pub fn new(head: Arc<Head>, mint: Timestamp, maxt: Timestamp) -> Self {
        Self { head, mint, maxt }
    }

    pub fn min_time(&self) -> Timestamp {
        self.mint
    }

    pub fn max_time(&self) -> Timestamp {
        self.maxt
    }
}

impl BlockReader for RangeHead {
    fn index(&self) -> Result<Box<dyn IndexReader>, DbError> {
        Ok(Box::new(HeadIndexReader::new(Arc::clone(&self.head), self.mint, self.maxt)))
    }

    fn chunks(&self) -> Result<Box<dyn ChunkReader>, DbError> {
        Ok(Box::new(HeadChunkReader::new(Arc::clone(&self.head), self.mint, self.maxt)))
    }

    fn tombstones(&self) -> Result<Box<dyn TombstoneReader>, DbError> {
        Ok(Box::new(self.head.tombstones()))
    }

    fn meta(&self) -> BlockMeta {
        let mut meta = BlockMeta::new(Ulid::nil(), self.mint, self.maxt);
        meta.stats = BlockStats {
            num_series: self.head.num_series(),
            ..BlockStats::default()
        };
        meta
    }
}
