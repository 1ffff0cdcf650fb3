//! The mutable in-memory head block.
//!
//! Samples are appended through transaction-scoped appenders, logged to the WAL on commit and
//! kept in compressed chunks per series until they are persisted into a block and truncated
//! away.

mod appender;
mod readers;
mod replay;
mod series;

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

pub use appender::{Appender, HeadAppender};
pub use readers::{pack_chunk_id, unpack_chunk_id, HeadChunkReader, HeadIndexReader, RangeHead};
pub use series::{compute_chunk_end_time, MemChunk, MemSeries, StripeSeries, SAMPLES_PER_CHUNK, STRIPE_SIZE};

use crate::block::{BlockMeta, BlockStats};
use crate::checkpoint::{checkpoint, delete_checkpoints};
use crate::error::{DbError, ResultExt};
use crate::index::MemPostings;
use crate::labels::{Labels, Matcher};
use crate::pool::Pool;
use crate::querier::postings_for_matchers;
use crate::record::{encode_tombstones, RefSample, Stone};
use crate::telemetry::{DbEvent, DbEventListener};
use crate::tombstones::{Interval, MemTombstones};
use crate::types::{clamp_interval, Timestamp};
use crate::ulid::Ulid;
use crate::wal::Wal;

#[derive(Debug)]
pub struct Head {
    chunk_range: i64,
    wal: Option<Arc<Wal>>,
    events: Arc<dyn DbEventListener>,

    min_time: AtomicI64,
    max_time: AtomicI64,
    /// Lowest time appenders may write; at least the end of the newest persisted block.
    min_valid_time: AtomicI64,
    last_series_id: AtomicU64,
    num_series: AtomicU64,

    series: StripeSeries,
    symbols: RwLock<HashSet<String>>,
    postings: MemPostings,
    tombstones: Arc<MemTombstones>,

    sample_pool: Pool<Vec<RefSample>>,
    series_pool: Pool<Vec<Arc<MemSeries>>>,
    bytes_pool: Pool<Vec<u8>>,
}

impl Head {
    /// Creates an empty head. `wal` may be `None` for a head that is never persisted.
    pub fn new(
        wal: Option<Arc<Wal>>,
        chunk_range: i64,
        events: Arc<dyn DbEventListener>,
    ) -> Result<Self, DbError> {
        if chunk_range < 1 {
            return Err(DbError::ConfigError(format!(
                "invalid chunk range {}",
                chunk_range
            )));
        }
        Ok(Self {
            chunk_range,
            wal,
            events,
            min_time: AtomicI64::new(Timestamp::MAX),
            max_time: AtomicI64::new(Timestamp::MIN),
            min_valid_time: AtomicI64::new(Timestamp::MIN),
            last_series_id: AtomicU64::new(0),
            num_series: AtomicU64::new(0),
            series: StripeSeries::new(),
            symbols: RwLock::new(HashSet::new()),
            postings: MemPostings::new(),
            tombstones: Arc::new(MemTombstones::new()),
            sample_pool: Pool::new(64),
            series_pool: Pool::new(64),
            bytes_pool: Pool::new(64),
        })
    }

    pub fn chunk_range(&self) -> i64 {
        self.chunk_range
    }

    /// Lowest timestamp in the head, `i64::MAX` while it holds no data.
    pub fn min_time(&self) -> Timestamp {
        self.min_time.load(Ordering::Acquire)
    }

    /// Highest timestamp in the head, `i64::MIN` while it holds no data.
    pub fn max_time(&self) -> Timestamp {
        self.max_time.load(Ordering::Acquire)
    }

    pub fn min_valid_time(&self) -> Timestamp {
        self.min_valid_time.load(Ordering::Acquire)
    }

    pub fn num_series(&self) -> u64 {
        self.num_series.load(Ordering::Acquire)
    }

    pub(crate) fn initialized(&self) -> bool {
        self.min_time() != Timestamp::MAX
    }

    /// Whether the head spans enough time to persist a block out of it.
    pub fn compactable(&self) -> bool {
        self.initialized()
            && self.max_time().saturating_sub(self.min_time()) > self.chunk_range / 2 * 3
    }

    pub fn appender(self: &Arc<Self>) -> HeadAppender {
        HeadAppender::new(Arc::clone(self))
    }

    /// A block view of the head restricted to `[mint, maxt]`.
    pub fn range(self: &Arc<Self>, mint: Timestamp, maxt: Timestamp) -> RangeHead {
        RangeHead::new(Arc::clone(self), mint, maxt)
    }

    pub fn index_range(self: &Arc<Self>, mint: Timestamp, maxt: Timestamp) -> HeadIndexReader {
        HeadIndexReader::new(Arc::clone(self), mint, maxt)
    }

    pub fn chunks_range(self: &Arc<Self>, mint: Timestamp, maxt: Timestamp) -> HeadChunkReader {
        HeadChunkReader::new(Arc::clone(self), mint, maxt)
    }

    pub fn tombstones(&self) -> Arc<MemTombstones> {
        Arc::clone(&self.tombstones)
    }

    pub fn meta(&self) -> BlockMeta {
        let mut meta = BlockMeta::new(Ulid::nil(), self.min_time(), self.max_time());
        meta.stats = BlockStats {
            num_series: self.num_series(),
            ..BlockStats::default()
        };
        meta
    }

    /// Sets the time bounds of a fresh head from its first sample. Only the first call has an
    /// effect.
    fn init_time(&self, t: Timestamp) {
        if self
            .min_time
            .compare_exchange(Timestamp::MAX, t, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        // Concurrent appenders may already have raised it.
        let _ = self
            .max_time
            .compare_exchange(Timestamp::MIN, t, Ordering::AcqRel, Ordering::Acquire);
    }

    fn update_min_max_time(&self, mint: Timestamp, maxt: Timestamp) {
        loop {
            let lt = self.min_time();
            if mint >= lt {
                break;
            }
            if self
                .min_time
                .compare_exchange(lt, mint, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        loop {
            let ht = self.max_time();
            if maxt <= ht {
                break;
            }
            if self
                .max_time
                .compare_exchange(ht, maxt, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Lower bound for samples of a new appender.
    fn appendable_min_valid_time(&self) -> Timestamp {
        self.min_valid_time()
            .max(self.max_time().saturating_sub(self.chunk_range / 2))
    }

    fn get_or_create(&self, hash: u64, lset: &Labels) -> Result<(Arc<MemSeries>, bool), DbError> {
        // Fast path for existing series avoids burning an id.
        if let Some(s) = self.series.get_by_hash(hash, lset)? {
            return Ok((s, false));
        }
        let id = self.last_series_id.fetch_add(1, Ordering::AcqRel) + 1;
        self.get_or_create_with_id(id, hash, lset)
    }

    fn get_or_create_with_id(
        &self,
        id: u64,
        hash: u64,
        lset: &Labels,
    ) -> Result<(Arc<MemSeries>, bool), DbError> {
        let s = Arc::new(MemSeries::new(lset.clone(), id, self.chunk_range));
        let (s, created) = self.series.get_or_set(hash, s)?;
        if !created {
            return Ok((s, false));
        }
        self.num_series.fetch_add(1, Ordering::AcqRel);
        self.postings.add(id, lset)?;

        let mut symbols = self.symbols.write()?;
        for l in lset {
            if !symbols.contains(&l.name) {
                symbols.insert(l.name.clone());
            }
            if !symbols.contains(&l.value) {
                symbols.insert(l.value.clone());
            }
        }
        Ok((s, true))
    }

    /// Removes chunks before the head's min time and series left empty, then rebuilds the
    /// symbol table from the remaining postings.
    fn gc(&self) -> Result<(), DbError> {
        let start = Instant::now();
        let mint = self.min_time();

        let (deleted, chunks_removed) = self.series.gc(mint)?;
        let series_removed = deleted.len() as usize;
        self.num_series
            .fetch_sub(series_removed as u64, Ordering::AcqRel);
        self.postings.delete(&deleted)?;

        let mut symbols = self.symbols.write()?;
        let mut rebuilt = HashSet::with_capacity(symbols.len());
        self.postings.iter(&mut |name, value, _| {
            rebuilt.insert(name.to_string());
            rebuilt.insert(value.to_string());
        })?;
        *symbols = rebuilt;
        drop(symbols);

        self.events.on_event(DbEvent::HeadGarbageCollected {
            series_removed,
            chunks_removed,
            duration: start.elapsed(),
        });
        Ok(())
    }

    /// Drops everything before `mint` and checkpoints the obsolete lower third of the WAL.
    pub fn truncate(&self, mint: Timestamp) -> Result<(), DbError> {
        let initialize = !self.initialized();
        if self.min_time() >= mint && !initialize {
            return Ok(());
        }
        self.min_time.store(mint, Ordering::Release);
        self.min_valid_time.store(mint, Ordering::Release);

        loop {
            let ht = self.max_time();
            if ht >= mint {
                break;
            }
            if self
                .max_time
                .compare_exchange(ht, mint, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        // First call after loading blocks on startup; the WAL has not been replayed yet.
        if initialize {
            return Ok(());
        }

        self.gc()?;

        let wal = match &self.wal {
            Some(wal) => wal,
            None => return Ok(()),
        };
        let (first, last) = wal.segments().context("get segment range")?;
        // Never checkpoint the segment being written.
        let last = match last.checked_sub(1) {
            Some(last) => last,
            None => return Ok(()),
        };
        let last = first + last.saturating_sub(first) / 3;
        if last <= first {
            return Ok(());
        }

        let keep = |id: u64| matches!(self.series.get_by_id(id), Ok(Some(_)));
        match checkpoint(wal, first, last, keep, mint) {
            Ok(stats) => self.events.on_event(DbEvent::CheckpointCreated {
                from: first,
                to: last,
                dropped_series: stats.dropped_series,
                dropped_samples: stats.dropped_samples,
            }),
            Err(e) => {
                self.events.on_event(DbEvent::CheckpointFailed {
                    error: e.to_string(),
                });
                return Err(e.context("create checkpoint"));
            }
        }
        // Leftover segments and checkpoints are superseded by the new checkpoint and are
        // retried on the next truncation.
        if let Err(e) = wal.truncate(last + 1) {
            self.events.on_event(DbEvent::WalTruncateFailed {
                error: e.to_string(),
            });
        }
        if let Err(e) = delete_checkpoints(wal.dir(), last) {
            self.events.on_event(DbEvent::CheckpointDeleteFailed {
                error: e.to_string(),
            });
        }
        Ok(())
    }

    /// Marks `[mint, maxt]` as deleted for every series selected by `matchers`.
    pub fn delete(self: &Arc<Self>, mint: Timestamp, maxt: Timestamp, matchers: &[Matcher]) -> Result<(), DbError> {
        let (mint, maxt) = clamp_interval(mint, maxt, self.min_time(), self.max_time());
        let ir = self.index_range(mint, maxt);
        let refs = postings_for_matchers(&ir, matchers).context("select series")?;

        let mut stones = Vec::new();
        for r in refs {
            let series = match self.series.get_by_id(r)? {
                Some(s) => s,
                None => continue,
            };
            let bounds = {
                let st = series.state.lock()?;
                st.min_time().zip(st.max_time())
            };
            let (t0, t1) = match bounds {
                Some(b) => b,
                None => continue,
            };
            // Delete only up to the series' own samples.
            let (t0, t1) = clamp_interval(mint, maxt, t0, t1);
            if t0 > t1 {
                continue;
            }
            stones.push(Stone {
                series_ref: r,
                intervals: [Interval::new(t0, t1)].into_iter().collect(),
            });
        }

        if let Some(wal) = &self.wal {
            let mut buf = self.bytes_pool.scoped();
            encode_tombstones(&stones, &mut buf);
            wal.log(&[buf.as_slice()])?;
        }
        for s in &stones {
            self.tombstones.add_interval(s.series_ref, s.intervals.as_slice())?;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<(), DbError> {
        match &self.wal {
            Some(wal) => wal.close(),
            None => Ok(()),
        }
    }
}
