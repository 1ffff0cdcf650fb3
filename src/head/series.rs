//! In-memory series and the lock-striped map holding them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use roaring::RoaringTreemap;

use crate::chunkenc::{XorAppender, XorChunk};
use crate::error::DbError;
use crate::labels::Labels;
use crate::types::{range_for_timestamp, Sample, Timestamp, Value};

/// Number of independently locked shards.
pub const STRIPE_SIZE: usize = 1 << 14;
const STRIPE_MASK: u64 = STRIPE_SIZE as u64 - 1;

/// Target number of samples per chunk.
pub const SAMPLES_PER_CHUNK: usize = 120;

#[derive(Debug, Clone)]
pub struct MemChunk {
    pub chunk: XorChunk,
    pub min_time: Timestamp,
    pub max_time: Timestamp,
}

impl MemChunk {
    pub fn overlaps_closed_interval(&self, mint: Timestamp, maxt: Timestamp) -> bool {
        self.min_time <= maxt && mint <= self.max_time
    }
}

/// Mutable part of a series, guarded by the series lock.
#[derive(Debug)]
pub struct SeriesState {
    pub chunks: Vec<MemChunk>,
    /// Id of `chunks[0]`. Ids stay stable when old chunks are dropped.
    pub first_chunk_id: u64,
    pub next_at: Timestamp,
    /// The last four appended samples, oldest first.
    pub sample_buf: [Sample; 4],
    pub pending_commit: bool,
    app: Option<XorAppender>,
    chunk_range: i64,
}

#[derive(Debug)]
pub struct MemSeries {
    pub series_ref: u64,
    pub lset: Labels,
    pub state: Mutex<SeriesState>,
}

impl MemSeries {
    pub fn new(lset: Labels, series_ref: u64, chunk_range: i64) -> Self {
        Self {
            series_ref,
            lset,
            state: Mutex::new(SeriesState {
                chunks: Vec::new(),
                first_chunk_id: 0,
                next_at: Timestamp::MIN,
                sample_buf: [(0, 0.0); 4],
                pending_commit: false,
                app: None,
                chunk_range,
            }),
        }
    }
}

impl SeriesState {
    pub fn min_time(&self) -> Option<Timestamp> {
        self.chunks.first().map(|c| c.min_time)
    }

    pub fn max_time(&self) -> Option<Timestamp> {
        self.head().map(|c| c.max_time)
    }

    pub fn head(&self) -> Option<&MemChunk> {
        self.chunks.last()
    }

    pub fn chunk_id(&self, pos: usize) -> u64 {
        self.first_chunk_id + pos as u64
    }

    /// Chunk by id, with a flag telling whether it is the head chunk.
    pub fn chunk(&self, id: u64) -> Option<(&MemChunk, bool)> {
        let ix = id.checked_sub(self.first_chunk_id)? as usize;
        let c = self.chunks.get(ix)?;
        Some((c, ix + 1 == self.chunks.len()))
    }

    fn cut(&mut self, mint: Timestamp) -> Result<(), DbError> {
        let chunk = XorChunk::new();
        self.app = Some(chunk.appender()?);
        self.chunks.push(MemChunk {
            chunk,
            min_time: mint,
            max_time: Timestamp::MIN,
        });
        // Chunks never span a chunk range boundary.
        self.next_at = range_for_timestamp(mint, self.chunk_range);
        Ok(())
    }

    /// Checks whether `(t, v)` could be appended.
    pub fn appendable(&self, t: Timestamp, v: Value) -> Result<(), DbError> {
        let c = match self.head() {
            Some(c) => c,
            None => return Ok(()),
        };
        if t > c.max_time {
            return Ok(());
        }
        if t < c.max_time {
            return Err(DbError::OutOfOrderSample);
        }
        // Exact duplicates are accepted.
        if self.sample_buf[3].1.to_bits() != v.to_bits() {
            return Err(DbError::AmendSample);
        }
        Ok(())
    }

    /// Appends a sample. Returns whether it was in order and whether a chunk was cut for it.
    pub fn append(&mut self, t: Timestamp, v: Value) -> Result<(bool, bool), DbError> {
        let mut chunk_created = false;
        if self.chunks.is_empty() {
            self.cut(t)?;
            chunk_created = true;
        }
        let (num_samples, c_min, c_max) = match self.head() {
            Some(c) => (c.chunk.num_samples(), c.min_time, c.max_time),
            None => return Ok((false, chunk_created)),
        };
        if c_max >= t {
            return Ok((false, chunk_created));
        }
        // At a quarter of the target size, fix the time at which the next chunk starts.
        if num_samples == SAMPLES_PER_CHUNK / 4 {
            self.next_at = compute_chunk_end_time(c_min, c_max, self.next_at);
        }
        if t >= self.next_at {
            self.cut(t)?;
            chunk_created = true;
        }

        let (app, c) = match (self.app.as_mut(), self.chunks.last_mut()) {
            (Some(app), Some(c)) => (app, c),
            _ => return Err(DbError::Internal("series has no head chunk appender".to_string())),
        };
        app.append(&mut c.chunk, t, v)?;
        c.max_time = t;

        self.sample_buf.rotate_left(1);
        self.sample_buf[3] = (t, v);
        Ok((true, chunk_created))
    }

    /// Drops all chunks without samples at or after `mint`. Returns how many were removed.
    pub fn truncate_chunks_before(&mut self, mint: Timestamp) -> usize {
        let k = self.chunks.iter().take_while(|c| c.max_time < mint).count();
        if k == 0 {
            return 0;
        }
        self.chunks.drain(..k);
        self.first_chunk_id += k as u64;
        if self.chunks.is_empty() {
            self.app = None;
        }
        k
    }
}

/// Estimates the end of a chunk from its start, its current last timestamp and the latest
/// allowed end, assuming it is a quarter full.
pub fn compute_chunk_end_time(start: Timestamp, cur: Timestamp, max: Timestamp) -> Timestamp {
    let a = (max - start) / ((cur - start + 1) * 4);
    if a == 0 {
        return max;
    }
    start + (max - start) / a
}

#[derive(Debug, Default)]
struct Shard {
    by_id: HashMap<u64, Arc<MemSeries>>,
    by_hash: HashMap<u64, Vec<Arc<MemSeries>>>,
}

/// Series indexed by id and by label set hash, spread over [`STRIPE_SIZE`] locked shards.
///
/// A series lives in the id map of shard `ref & mask` and in the hash map of shard
/// `hash & mask`. Only garbage collection holds two shard locks at once, always the hash shard
/// first.
#[derive(Debug)]
pub struct StripeSeries {
    shards: Box<[RwLock<Shard>]>,
}

impl Default for StripeSeries {
    fn default() -> Self {
        Self::new()
    }
}

impl StripeSeries {
    pub fn new() -> Self {
        let shards: Vec<RwLock<Shard>> = (0..STRIPE_SIZE).map(|_| RwLock::default()).collect();
        Self {
            shards: shards.into_boxed_slice(),
        }
    }

    fn shard(&self, key: u64) -> &RwLock<Shard> {
        &self.shards[(key & STRIPE_MASK) as usize]
    }

    pub fn get_by_id(&self, id: u64) -> Result<Option<Arc<MemSeries>>, DbError> {
        Ok(self.shard(id).read()?.by_id.get(&id).cloned())
    }

    pub fn get_by_hash(&self, hash: u64, lset: &Labels) -> Result<Option<Arc<MemSeries>>, DbError> {
        Ok(self
            .shard(hash)
            .read()?
            .by_hash
            .get(&hash)
            .and_then(|list| list.iter().find(|s| &s.lset == lset))
            .cloned())
    }

    /// Inserts `series` unless one with the same label set exists. Returns the series now in
    /// the map and whether it was inserted.
    pub fn get_or_set(&self, hash: u64, series: Arc<MemSeries>) -> Result<(Arc<MemSeries>, bool), DbError> {
        {
            let mut shard = self.shard(hash).write()?;
            let list = shard.by_hash.entry(hash).or_default();
            if let Some(prev) = list.iter().find(|s| s.lset == series.lset) {
                return Ok((Arc::clone(prev), false));
            }
            list.push(Arc::clone(&series));
        }
        self.shard(series.series_ref)
            .write()?
            .by_id
            .insert(series.series_ref, Arc::clone(&series));
        Ok((series, true))
    }

    /// Drops chunks entirely before `mint` and removes series left without chunks and without a
    /// pending commit. Returns the removed refs and the number of removed chunks.
    pub fn gc(&self, mint: Timestamp) -> Result<(RoaringTreemap, usize), DbError> {
        let mut deleted = RoaringTreemap::new();
        let mut rm_chunks = 0;

        for i in 0..STRIPE_SIZE {
            let mut guard = self.shards[i].write()?;
            let Shard { by_id, by_hash } = &mut *guard;
            let mut empty = Vec::new();

            for (hash, list) in by_hash.iter_mut() {
                let mut k = 0;
                while k < list.len() {
                    let series = Arc::clone(&list[k]);
                    let mut st = series.state.lock()?;
                    rm_chunks += st.truncate_chunks_before(mint);
                    if !st.chunks.is_empty() || st.pending_commit {
                        k += 1;
                        continue;
                    }
                    let j = (series.series_ref & STRIPE_MASK) as usize;
                    if j == i {
                        by_id.remove(&series.series_ref);
                    } else {
                        self.shards[j].write()?.by_id.remove(&series.series_ref);
                    }
                    deleted.insert(series.series_ref);
                    list.swap_remove(k);
                }
                if list.is_empty() {
                    empty.push(*hash);
                }
            }
            for h in empty {
                by_hash.remove(&h);
            }
        }
        Ok((deleted, rm_chunks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(r: u64) -> Arc<MemSeries> {
        let lset = Labels::from_pairs(&[("id", r.to_string())]).unwrap();
        Arc::new(MemSeries::new(lset, r, 1000))
    }

    #[test]
    fn duplicate_sample_is_stored_once() {
        let s = series(1);
        let mut st = s.state.lock().unwrap();
        assert_eq!(st.append(10, 1.0).unwrap(), (true, true));
        st.appendable(10, 1.0).unwrap();
        assert!(matches!(st.appendable(10, 2.0), Err(DbError::AmendSample)));
        assert!(matches!(st.appendable(9, 1.0), Err(DbError::OutOfOrderSample)));
        assert_eq!(st.append(10, 1.0).unwrap(), (false, false));
        assert_eq!(st.head().unwrap().chunk.num_samples(), 1);
    }

    #[test]
    fn chunks_are_cut_near_target_size() {
        let s = Arc::new(MemSeries::new(Labels::default(), 1, i64::MAX / 4));
        let mut st = s.state.lock().unwrap();
        for t in 0..481 {
            st.append(t, t as f64).unwrap();
        }
        assert!(st.chunks.len() >= 4, "got {} chunks", st.chunks.len());
        for w in st.chunks.windows(2) {
            assert!(w[0].max_time < w[1].min_time);
        }
        let total: usize = st.chunks.iter().map(|c| c.chunk.num_samples()).sum();
        assert_eq!(total, 481);
    }

    #[test]
    fn chunks_do_not_cross_range_boundary() {
        let s = series(1);
        let mut st = s.state.lock().unwrap();
        for t in [990, 995, 999, 1000, 1005] {
            st.append(t, 0.0).unwrap();
        }
        assert_eq!(st.chunks.len(), 2);
        assert_eq!(st.chunks[1].min_time, 1000);
    }

    #[test]
    fn end_time_estimate() {
        assert_eq!(compute_chunk_end_time(0, 29, 1000), 1000 / (1000 / 120));
        assert_eq!(compute_chunk_end_time(0, 500, 1000), 1000);
    }

    #[test]
    fn get_or_set_keeps_first_winner() {
        let stripe = StripeSeries::new();
        let a = series(1);
        let b = Arc::new(MemSeries::new(a.lset.clone(), 2, 1000));
        let h = a.lset.hash();
        let (got, created) = stripe.get_or_set(h, Arc::clone(&a)).unwrap();
        assert!(created);
        assert_eq!(got.series_ref, 1);
        let (got, created) = stripe.get_or_set(h, b).unwrap();
        assert!(!created);
        assert_eq!(got.series_ref, 1);
        assert!(stripe.get_by_id(2).unwrap().is_none());
        assert!(stripe.get_by_hash(h, &a.lset).unwrap().is_some());
    }

    #[test]
    fn gc_drops_old_chunks_and_empty_series() {
        let stripe = StripeSeries::new();
        let old = series(3);
        let pending = series(4);
        let live = series(STRIPE_SIZE as u64 + 5);
        for s in [&old, &pending, &live] {
            stripe.get_or_set(s.lset.hash(), Arc::clone(s)).unwrap();
        }
        old.state.lock().unwrap().append(10, 1.0).unwrap();
        {
            let mut st = pending.state.lock().unwrap();
            st.append(10, 1.0).unwrap();
            st.pending_commit = true;
        }
        {
            let mut st = live.state.lock().unwrap();
            st.append(10, 1.0).unwrap();
            st.append(2000, 1.0).unwrap();
        }

        let (deleted, removed) = stripe.gc(1000).unwrap();
        assert_eq!(deleted.iter().collect::<Vec<_>>(), vec![3]);
        assert_eq!(removed, 3);
        assert!(stripe.get_by_id(3).unwrap().is_none());
        assert!(stripe.get_by_id(4).unwrap().is_some());
        let st = live.state.lock().unwrap();
        assert_eq!(st.first_chunk_id, 1);
        assert!(st.chunk(0).is_none());
        assert!(st.chunk(1).unwrap().1);
    }
}
