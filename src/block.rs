//! Persisted, immutable blocks.
//!
//! A block directory holds `meta.json`, an `index`, a `chunks/` directory of segment files and a
//! `tombstones` file. Only the tombstones and the meta change after a block is written.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::chunkenc::{Chunk, ChunkPool};
use crate::chunks::{BlockChunkReader, ChunkMeta, ChunkReader, ChunkRef};
use crate::compact::Compactor;
use crate::error::{DbError, MultiError, ResultExt};
use crate::index::{BlockIndexReader, IndexReader, Postings, INDEX_FILENAME, INDEX_FORMAT_V2, INDEX_VERSION_OFFSET};
use crate::labels::{Labels, Matcher};
use crate::querier::postings_for_matchers;
use crate::telemetry::{DbEvent, DbEventListener};
use crate::tombstones::{
    read_tombstones, write_tombstone_file, Interval, Intervals, MemTombstones, TombstoneReader, TOMBSTONE_FILENAME,
};
use crate::types::{clamp_interval, Timestamp};
use crate::ulid::Ulid;

pub const META_FILENAME: &str = "meta.json";
pub const META_VERSION: u32 = 1;
pub const CHUNKS_DIRNAME: &str = "chunks";

/// Everything needed to read a block: the head exposes the same view over a time range.
pub trait BlockReader: Send + Sync {
    fn index(&self) -> Result<Box<dyn IndexReader>, DbError>;

    fn chunks(&self) -> Result<Box<dyn ChunkReader>, DbError>;

    fn tombstones(&self) -> Result<Box<dyn TombstoneReader>, DbError>;

    fn meta(&self) -> BlockMeta;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStats {
    pub num_samples: u64,
    pub num_series: u64,
    pub num_chunks: u64,
    pub num_tombstones: u64,
}

/// Identity and range of a block another block was compacted from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDesc {
    pub ulid: Ulid,
    pub min_time: Timestamp,
    pub max_time: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMetaCompaction {
    /// 1 for blocks persisted from the head, one more than the highest input otherwise.
    pub level: u32,
    /// Ids of all level-1 blocks this block was built from.
    pub sources: Vec<Ulid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<BlockDesc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
}

/// Contents of `meta.json`. The block covers `[min_time, max_time)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    pub ulid: Ulid,
    pub min_time: Timestamp,
    pub max_time: Timestamp,
    #[serde(default)]
    pub stats: BlockStats,
    pub compaction: BlockMetaCompaction,
    pub version: u32,
}

impl BlockMeta {
    /// Meta of a fresh level-1 block that is its own only source.
    pub fn new(ulid: Ulid, min_time: Timestamp, max_time: Timestamp) -> Self {
        Self {
            ulid,
            min_time,
            max_time,
            stats: BlockStats::default(),
            compaction: BlockMetaCompaction {
                level: 1,
                sources: vec![ulid],
                parents: Vec::new(),
                failed: false,
            },
            version: META_VERSION,
        }
    }

    pub fn desc(&self) -> BlockDesc {
        BlockDesc {
            ulid: self.ulid,
            min_time: self.min_time,
            max_time: self.max_time,
        }
    }
}

fn read_meta_any_version(dir: &Path) -> Result<BlockMeta, DbError> {
    let data = fs::read(dir.join(META_FILENAME)).with_context(|| format!("read meta of {:?}", dir))?;
    Ok(serde_json::from_slice(&data)?)
}

/// Reads `<dir>/meta.json`.
pub fn read_meta(dir: &Path) -> Result<BlockMeta, DbError> {
    let meta = read_meta_any_version(dir)?;
    if meta.version != META_VERSION {
        return Err(DbError::Corruption {
            details: format!("unexpected meta file version {} in {:?}", meta.version, dir),
        });
    }
    Ok(meta)
}

/// Atomically replaces `<dir>/meta.json`.
pub fn write_meta(dir: &Path, meta: &BlockMeta) -> Result<(), DbError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, meta)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(META_FILENAME))
        .map_err(|e| DbError::Io(e.error))?;
    sync_dir(dir)
}

pub(crate) fn sync_dir(dir: &Path) -> Result<(), DbError> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Whether `dir` looks like a block directory.
pub fn is_block_dir(dir: &Path) -> bool {
    dir.is_dir()
        && dir
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.parse::<Ulid>().is_ok())
}

/// Block directories directly below `dir`, in name order.
pub fn block_dirs(dir: &Path) -> Result<Vec<PathBuf>, DbError> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if is_block_dir(&path) {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Rewrites the index version byte of blocks whose meta does not carry the current version.
///
/// Each index is copied to `index.repaired`, patched, synced and renamed over the original before
/// the meta is rewritten, so a crash at any point leaves a block that is repaired on the next run.
pub fn repair_bad_index_version(db_dir: &Path, events: &dyn DbEventListener) -> Result<(), DbError> {
    for dir in block_dirs(db_dir)? {
        let mut meta = read_meta_any_version(&dir)?;
        if meta.version == META_VERSION {
            continue;
        }
        let broken = dir.join(INDEX_FILENAME);
        let repaired = dir.join(format!("{}.repaired", INDEX_FILENAME));
        fs::copy(&broken, &repaired).with_context(|| format!("copy index of {:?}", dir))?;

        let mut f = OpenOptions::new().write(true).open(&repaired)?;
        f.seek(SeekFrom::Start(INDEX_VERSION_OFFSET))?;
        f.write_all(&[INDEX_FORMAT_V2])?;
        f.sync_all()?;
        drop(f);
        fs::rename(&repaired, &broken)?;

        meta.version = META_VERSION;
        write_meta(&dir, &meta)?;
        events.on_event(DbEvent::IndexVersionRepaired { block: dir });
    }
    Ok(())
}

/// Counts readers handed out by a block so close can wait for them.
#[derive(Debug, Default)]
struct PendingReaders {
    state: Mutex<(usize, bool)>,
    cond: Condvar,
}

impl PendingReaders {
    fn acquire(&self) -> Result<(), DbError> {
        let mut st = self.state.lock()?;
        if st.1 {
            return Err(DbError::Closing);
        }
        st.0 += 1;
        Ok(())
    }

    fn release(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.0 = st.0.saturating_sub(1);
            if st.0 == 0 {
                self.cond.notify_all();
            }
        }
    }

    /// Refuses new readers and waits for the outstanding ones.
    fn close(&self) -> Result<(), DbError> {
        let mut st = self.state.lock()?;
        st.1 = true;
        while st.0 > 0 {
            st = self.cond.wait(st)?;
        }
        Ok(())
    }
}

/// A reader that releases its registration with the block when dropped.
struct Tracked<R> {
    inner: R,
    pending: Arc<PendingReaders>,
}

impl<R> Drop for Tracked<R> {
    fn drop(&mut self) {
        self.pending.release();
    }
}

impl<R: IndexReader> IndexReader for Tracked<R> {
    fn symbols(&self) -> Result<std::collections::BTreeSet<String>, DbError> {
        self.inner.symbols()
    }

    fn label_values(&self, name: &str) -> Result<Vec<String>, DbError> {
        self.inner.label_values(name)
    }

    fn label_names(&self) -> Result<Vec<String>, DbError> {
        self.inner.label_names()
    }

    fn postings(&self, name: &str, value: &str) -> Result<Postings, DbError> {
        self.inner.postings(name, value)
    }

    fn sorted_postings(&self, p: Postings) -> Result<Vec<u64>, DbError> {
        self.inner.sorted_postings(p)
    }

    fn series(&self, series_ref: u64, lset: &mut Labels, chks: &mut Vec<ChunkMeta>) -> Result<(), DbError> {
        self.inner.series(series_ref, lset, chks)
    }

    fn symbol_table_size(&self) -> u64 {
        self.inner.symbol_table_size()
    }
}

impl<R: ChunkReader> ChunkReader for Tracked<R> {
    fn chunk(&self, r: ChunkRef) -> Result<Chunk, DbError> {
        self.inner.chunk(r)
    }
}

impl<R: TombstoneReader> TombstoneReader for Tracked<R> {
    fn get(&self, series_ref: u64) -> Result<Intervals, DbError> {
        self.inner.get(series_ref)
    }

    fn iter(&self, f: &mut dyn FnMut(u64, &Intervals) -> Result<(), DbError>) -> Result<(), DbError> {
        self.inner.iter(f)
    }

    fn total(&self) -> Result<u64, DbError> {
        self.inner.total()
    }
}

/// An opened block directory.
#[derive(Debug)]
pub struct Block {
    dir: PathBuf,
    meta: RwLock<BlockMeta>,
    index: Arc<BlockIndexReader>,
    chunks: Arc<BlockChunkReader>,
    /// Replaced wholesale on delete; the write lock serialises deletes.
    tombstones: RwLock<Arc<MemTombstones>>,
    symbol_table_size: u64,
    pending: Arc<PendingReaders>,
}

impl Block {
    pub fn open(dir: impl AsRef<Path>, pool: Arc<ChunkPool>) -> Result<Self, DbError> {
        let dir = dir.as_ref().to_path_buf();
        let meta = read_meta(&dir)?;
        let chunks = BlockChunkReader::open(dir.join(CHUNKS_DIRNAME), pool).context("open chunk reader")?;
        let index = BlockIndexReader::open(dir.join(INDEX_FILENAME)).context("open index reader")?;
        let tombstones = read_tombstones(&dir).context("read tombstones")?;
        let symbol_table_size = index.symbol_table_size();
        Ok(Self {
            dir,
            meta: RwLock::new(meta),
            index: Arc::new(index),
            chunks: Arc::new(chunks),
            tombstones: RwLock::new(Arc::new(tombstones)),
            symbol_table_size,
            pending: Arc::new(PendingReaders::default()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ulid(&self) -> Ulid {
        self.meta_snapshot().ulid
    }

    pub fn min_time(&self) -> Timestamp {
        self.meta_snapshot().min_time
    }

    pub fn max_time(&self) -> Timestamp {
        self.meta_snapshot().max_time
    }

    fn meta_snapshot(&self) -> BlockMeta {
        match self.meta.read() {
            Ok(m) => m.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn symbol_table_size(&self) -> u64 {
        self.symbol_table_size
    }

    /// Bytes on disk across index, chunks, tombstones and meta.
    pub fn size(&self) -> u64 {
        let file_len = |p: PathBuf| fs::metadata(p).map(|m| m.len()).unwrap_or(0);
        self.index.size()
            + self.chunks.size()
            + file_len(self.dir.join(TOMBSTONE_FILENAME))
            + file_len(self.dir.join(META_FILENAME))
    }

    /// Whether the block's `[min_time, max_time)` intersects the closed `[mint, maxt]`.
    pub fn overlaps_closed_interval(&self, mint: Timestamp, maxt: Timestamp) -> bool {
        let meta = self.meta_snapshot();
        meta.min_time <= maxt && mint < meta.max_time
    }

    /// Waits for all outstanding readers, then closes the underlying files.
    pub fn close(&self) -> Result<(), DbError> {
        self.pending.close()?;
        let mut merr = MultiError::new();
        merr.add(self.chunks.close());
        merr.add(self.index.close());
        match self.tombstones.read() {
            Ok(ts) => merr.add(ts.close()),
            Err(e) => merr.push(e.into()),
        }
        merr.into_result()
    }

    /// Marks `[mint, maxt]` deleted for every series selected by `matchers`.
    pub fn delete(&self, mint: Timestamp, maxt: Timestamp, matchers: &[Matcher]) -> Result<(), DbError> {
        let mut current = self.tombstones.write()?;
        let ir = self.index()?;
        let refs = postings_for_matchers(ir.as_ref(), matchers).context("select series")?;

        let stones = MemTombstones::new();
        let mut lset = Labels::default();
        let mut chks = Vec::new();
        for r in refs {
            ir.series(r, &mut lset, &mut chks)?;
            let (first, last) = match (chks.first(), chks.last()) {
                (Some(f), Some(l)) => (f.min_time, l.max_time),
                _ => continue,
            };
            if chks.iter().any(|c| c.overlaps_closed_interval(mint, maxt)) {
                let (t0, t1) = clamp_interval(mint, maxt, first, last);
                stones.add_interval(r, &[Interval::new(t0, t1)])?;
            }
        }

        current.iter(&mut |r, ivs| stones.add_interval(r, ivs.as_slice()))?;
        write_tombstone_file(&self.dir, &stones)?;

        let mut meta = self.meta.write()?;
        meta.stats.num_tombstones = stones.total()?;
        write_meta(&self.dir, &meta)?;
        *current = Arc::new(stones);
        Ok(())
    }

    /// Rewrites the block without its deleted data into `dest`. Returns the new block's id, or
    /// `None` if there was nothing to clean or nothing is left.
    pub fn clean_tombstones(&self, dest: &Path, compactor: &dyn Compactor) -> Result<Option<Ulid>, DbError> {
        if self.tombstones.read()?.is_empty()? {
            return Ok(None);
        }
        let meta = self.meta_snapshot();
        compactor.write(dest, self, meta.min_time, meta.max_time, Some(&meta))
    }

    /// Records that compacting this block failed so planning skips it.
    pub fn set_compaction_failed(&self) -> Result<(), DbError> {
        let mut meta = self.meta.write()?;
        meta.compaction.failed = true;
        write_meta(&self.dir, &meta)
    }

    /// Hard-links the block's files into `<dir>/<ulid>/`.
    pub fn snapshot(&self, dir: &Path) -> Result<(), DbError> {
        let ulid = self.ulid();
        let block_dir = dir.join(ulid.to_string());
        let chunks_dir = block_dir.join(CHUNKS_DIRNAME);
        fs::create_dir_all(&chunks_dir)?;

        for name in [META_FILENAME, INDEX_FILENAME, TOMBSTONE_FILENAME] {
            let src = self.dir.join(name);
            if src.exists() {
                fs::hard_link(&src, block_dir.join(name)).with_context(|| format!("link {:?}", src))?;
            }
        }
        for entry in fs::read_dir(self.dir.join(CHUNKS_DIRNAME))? {
            let entry = entry?;
            fs::hard_link(entry.path(), chunks_dir.join(entry.file_name()))?;
        }
        Ok(())
    }
}

impl BlockReader for Block {
    fn index(&self) -> Result<Box<dyn IndexReader>, DbError> {
        self.pending.acquire()?;
        Ok(Box::new(Tracked {
            inner: Arc::clone(&self.index),
            pending: Arc::clone(&self.pending),
        }))
    }

    fn chunks(&self) -> Result<Box<dyn ChunkReader>, DbError> {
        self.pending.acquire()?;
        Ok(Box::new(Tracked {
            inner: Arc::clone(&self.chunks),
            pending: Arc::clone(&self.pending),
        }))
    }

    fn tombstones(&self) -> Result<Box<dyn TombstoneReader>, DbError> {
        let ts = Arc::clone(&*self.tombstones.read()?);
        self.pending.acquire()?;
        Ok(Box::new(Tracked {
            inner: ts,
            pending: Arc::clone(&self.pending),
        }))
    }

    fn meta(&self) -> BlockMeta {
        self.meta_snapshot()
    }
}

/// Test helper: writes a block holding `series` and returns its directory.
#[cfg(test)]
pub(crate) fn create_block(dir: &Path, series: &[(Labels, Vec<crate::types::Sample>)]) -> PathBuf {
    use crate::compact::LeveledCompactor;
    use crate::head::{Appender, Head};
    use crate::telemetry::noop_event_listener;

    let head = Arc::new(Head::new(None, i64::MAX / 4, noop_event_listener()).unwrap());
    let mut app = head.appender();
    for (lset, samples) in series {
        for &(t, v) in samples {
            app.add(lset, t, v).unwrap();
        }
    }
    app.commit().unwrap();

    let compactor = LeveledCompactor::new(vec![1000], Arc::new(ChunkPool::new()), noop_event_listener()).unwrap();
    let (mint, maxt) = (head.min_time(), head.max_time());
    let ulid = compactor
        .write(dir, &head.range(mint, maxt), mint, maxt + 1, None)
        .unwrap()
        .unwrap();
    dir.join(ulid.to_string())
}
