//! The database: a directory of persisted blocks plus the head, kept in shape by a background
//! compaction loop.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use fs2::FileExt;
use rayon::prelude::*;

use crate::block::{block_dirs, read_meta, repair_bad_index_version, Block, BlockReader};
use crate::chunkenc::ChunkPool;
use crate::compact::{default_block_ranges, Compactor, LeveledCompactor};
use crate::error::{DbError, MultiError, ResultExt};
use crate::head::{Appender, Head, HeadAppender};
use crate::labels::{Labels, Matcher};
use crate::querier::{BlockQuerier, MergedQuerier, Querier};
use crate::telemetry::{noop_event_listener, DbEvent, DbEventListener};
use crate::types::{range_for_timestamp, Sample, Timestamp, Value};
use crate::ulid::Ulid;
use crate::wal::{Wal, WalOptions, DEFAULT_SEGMENT_SIZE};

const LOCK_FILENAME: &str = "lock";
const WAL_DIRNAME: &str = "wal";
const MIN_COMPACTION_BACKOFF: Duration = Duration::from_secs(1);

/// Configuration for the database.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Size at which WAL segments are cut.
    pub wal_segment_size: u64,
    /// fsync the WAL on every commit.
    pub wal_sync: bool,
    /// Blocks ending more than this many milliseconds before the newest block are deleted.
    /// Zero keeps everything.
    pub retention_duration: i64,
    /// Block ranges in milliseconds, strictly increasing. The first one is the head's chunk
    /// range and the span of blocks persisted from it.
    pub block_ranges: Vec<i64>,
    /// Skip taking the directory lock. Only safe if nothing else can open the directory.
    pub no_lockfile: bool,
    /// How often the compaction loop checks for work without being signalled.
    pub compaction_interval: Duration,
    /// Upper bound of the exponential backoff after failed compactions.
    pub max_compaction_backoff: Duration,
    /// Sink for structured engine events (logging, metrics).
    pub event_listener: Arc<dyn DbEventListener>,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            wal_segment_size: DEFAULT_SEGMENT_SIZE,
            wal_sync: true,
            retention_duration: 15 * 24 * 60 * 60 * 1000,
            block_ranges: default_block_ranges(),
            no_lockfile: false,
            compaction_interval: Duration::from_secs(60),
            max_compaction_backoff: Duration::from_secs(60),
            event_listener: noop_event_listener(),
        }
    }
}

impl DbConfig {
    pub fn validate(&self) -> Result<(), DbError> {
        if self.block_ranges.is_empty() {
            return Err(DbError::ConfigError("at least one block range is required".into()));
        }
        if self.block_ranges[0] <= 0 {
            return Err(DbError::ConfigError(format!(
                "block ranges must be positive, got {}",
                self.block_ranges[0]
            )));
        }
        if let Some(w) = self.block_ranges.windows(2).find(|w| w[1] <= w[0]) {
            return Err(DbError::ConfigError(format!(
                "block ranges must be strictly increasing, got {} after {}",
                w[1], w[0]
            )));
        }
        if self.wal_segment_size == 0 {
            return Err(DbError::ConfigError("WAL segment size must be positive".into()));
        }
        if self.retention_duration < 0 {
            return Err(DbError::ConfigError(format!(
                "retention must not be negative, got {}",
                self.retention_duration
            )));
        }
        Ok(())
    }
}

/// Exclusive advisory lock on the data directory, held for the lifetime of the database.
#[derive(Debug)]
struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    fn acquire(dir: &Path) -> Result<Self, DbError> {
        let path = dir.join(LOCK_FILENAME);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.try_lock_exclusive()
            .with_context(|| format!("lock DB directory {:?}", dir))?;
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { file, path })
    }

    fn release(self) -> Result<(), DbError> {
        FileExt::unlock(&self.file).with_context(|| format!("unlock {:?}", self.path))
    }
}

#[derive(Debug)]
enum LoopCmd {
    Compact,
    Stop,
}

#[derive(Debug)]
struct DbInner {
    dir: PathBuf,
    config: DbConfig,
    events: Arc<dyn DbEventListener>,
    head: Arc<Head>,
    compactor: LeveledCompactor,
    chunk_pool: Arc<ChunkPool>,
    /// Open blocks sorted by min time.
    blocks: RwLock<Vec<Arc<Block>>>,
    /// Serializes compaction, reloads, deletion and snapshots.
    cmtx: Mutex<()>,
    auto_compact: AtomicBool,
    stopping: AtomicBool,
}

/// Handle to an open database.
#[derive(Debug)]
pub struct Db {
    inner: Arc<DbInner>,
    compact_tx: SyncSender<LoopCmd>,
    compact_thread: Mutex<Option<JoinHandle<()>>>,
    lock: Mutex<Option<DirLock>>,
    closed: AtomicBool,
}

impl Db {
    /// Opens or creates the database in `dir`, replays the WAL and starts the compaction loop.
    pub fn open(dir: impl AsRef<Path>, config: DbConfig) -> Result<Self, DbError> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("create DB directory {:?}", dir))?;

        let lock = if config.no_lockfile {
            None
        } else {
            Some(DirLock::acquire(&dir)?)
        };

        let events = config.event_listener.clone();
        repair_bad_index_version(&dir, events.as_ref()).context("repair bad index version")?;

        let wal = Wal::open(
            dir.join(WAL_DIRNAME),
            WalOptions {
                segment_size: config.wal_segment_size,
                sync: config.wal_sync,
            },
        )
        .context("open WAL")?;
        let head = Arc::new(Head::new(Some(Arc::new(wal)), config.block_ranges[0], events.clone())?);

        let chunk_pool = Arc::new(ChunkPool::new());
        let compactor = LeveledCompactor::new(config.block_ranges.clone(), chunk_pool.clone(), events.clone())?;

        let inner = Arc::new(DbInner {
            dir,
            config,
            events,
            head,
            compactor,
            chunk_pool,
            blocks: RwLock::new(Vec::new()),
            cmtx: Mutex::new(()),
            auto_compact: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
        });

        {
            let _guard = inner.cmtx.lock()?;
            inner.reload().context("reload blocks")?;
        }
        let min_valid_time = inner
            .blocks
            .read()?
            .last()
            .map(|b| b.max_time())
            .unwrap_or(Timestamp::MIN);
        inner.head.init(min_valid_time).context("read WAL")?;

        let (compact_tx, compact_rx) = mpsc::sync_channel(1);
        let loop_inner = inner.clone();
        let handle = thread::Builder::new()
            .name("strix-compaction".into())
            .spawn(move || loop_inner.run(compact_rx))?;

        Ok(Db {
            inner,
            compact_tx,
            compact_thread: Mutex::new(Some(handle)),
            lock: Mutex::new(lock),
            closed: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn head(&self) -> &Arc<Head> {
        &self.inner.head
    }

    /// The currently open blocks, sorted by min time.
    pub fn blocks(&self) -> Result<Vec<Arc<Block>>, DbError> {
        Ok(self.inner.blocks.read()?.clone())
    }

    /// Starts a new append transaction. A commit that leaves the head compactable wakes the
    /// compaction loop.
    pub fn appender(&self) -> DbAppender {
        DbAppender {
            app: self.inner.head.appender(),
            head: self.inner.head.clone(),
            compact_tx: self.compact_tx.clone(),
        }
    }

    /// Persists the head and compacts blocks until there is nothing left to do.
    pub fn compact(&self) -> Result<(), DbError> {
        self.inner.compact()
    }

    /// Enables or disables compactions run by the background loop. Explicit calls to
    /// [`Db::compact`] are unaffected.
    pub fn set_compactions_enabled(&self, enabled: bool) {
        self.inner.auto_compact.store(enabled, Ordering::SeqCst);
    }

    /// A querier over all blocks and the part of the head overlapping `[mint, maxt]`.
    pub fn querier(&self, mint: Timestamp, maxt: Timestamp) -> Result<MergedQuerier, DbError> {
        let blocks = self.inner.blocks.read()?.clone();
        let mut queriers: Vec<Box<dyn Querier>> = Vec::new();

        for b in blocks.iter().filter(|b| b.overlaps_closed_interval(mint, maxt)) {
            let q = BlockQuerier::new(b.as_ref(), mint, maxt)
                .with_context(|| format!("open querier for block {}", b.ulid()));
            push_or_close(&mut queriers, q)?;
        }
        if maxt >= self.inner.head.min_time() {
            let rh = self.inner.head.range(mint, maxt);
            push_or_close(&mut queriers, BlockQuerier::new(&rh, mint, maxt).context("open querier for head"))?;
        }
        Ok(MergedQuerier::new(queriers))
    }

    /// Convenience wrapper collecting every series matching `matchers` within `[mint, maxt]`.
    pub fn query(
        &self,
        matchers: &[Matcher],
        mint: Timestamp,
        maxt: Timestamp,
    ) -> Result<Vec<(Labels, Vec<Sample>)>, DbError> {
        let mut q = self.querier(mint, maxt)?;
        let res = collect_series(&q, matchers);
        let closed = q.close();
        let out = res?;
        closed?;
        Ok(out)
    }

    /// Marks samples of matching series within `[mint, maxt]` as deleted in every block and
    /// the head.
    pub fn delete(&self, mint: Timestamp, maxt: Timestamp, matchers: &[Matcher]) -> Result<(), DbError> {
        let _guard = self.inner.cmtx.lock()?;
        let blocks = self.inner.blocks.read()?.clone();

        let results: Vec<Result<(), DbError>> = blocks
            .par_iter()
            .filter(|b| b.overlaps_closed_interval(mint, maxt))
            .map(|b| {
                b.delete(mint, maxt, matchers)
                    .with_context(|| format!("delete from block {}", b.ulid()))
            })
            .collect();

        let mut merr = MultiError::new();
        for r in results {
            merr.add(r);
        }
        merr.add(self.inner.head.delete(mint, maxt, matchers).context("delete from head"));
        merr.into_result()
    }

    /// Rewrites every block carrying tombstones without the deleted data.
    pub fn clean_tombstones(&self) -> Result<(), DbError> {
        let _guard = self.inner.cmtx.lock()?;
        self.inner.clean_tombstones()
    }

    /// Writes a consistent copy of the database into `dir`: hard links of every block and,
    /// with `with_head`, the head persisted as a new block.
    pub fn snapshot(&self, dir: impl AsRef<Path>, with_head: bool) -> Result<(), DbError> {
        let dir = dir.as_ref();
        if same_path(dir, &self.inner.dir) {
            return Err(DbError::ConfigError(
                "cannot snapshot into the data directory".into(),
            ));
        }
        if dir
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.parse::<Ulid>().is_ok())
            .unwrap_or(false)
        {
            return Err(DbError::ConfigError(format!(
                "snapshot directory {:?} would be mistaken for a block",
                dir
            )));
        }
        fs::create_dir_all(dir)?;

        let _guard = self.inner.cmtx.lock()?;
        for b in self.inner.blocks.read()?.iter() {
            b.snapshot(dir)
                .with_context(|| format!("snapshot block {}", b.ulid()))?;
        }
        if !with_head {
            return Ok(());
        }
        let head = &self.inner.head;
        let (mint, maxt) = (head.min_time(), head.max_time());
        if maxt < mint {
            return Ok(());
        }
        self.inner
            .compactor
            .write(dir, &head.range(mint, maxt), mint, maxt + 1, None)
            .context("snapshot head block")?;
        Ok(())
    }

    /// Stops the compaction loop and closes every block, the head and the WAL. Later calls are
    /// no-ops.
    pub fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.stopping.store(true, Ordering::SeqCst);
        // The loop only blocks in recv, so this completes once any running compaction
        // returns. A send error means the thread is already gone.
        let _ = self.compact_tx.send(LoopCmd::Stop);
        if let Some(handle) = self.compact_thread.lock()?.take() {
            if handle.join().is_err() {
                self.inner.events.on_event(DbEvent::CompactionLoopPanicked);
            }
        }

        let _guard = self.inner.cmtx.lock()?;
        let mut merr = MultiError::new();
        for b in self.inner.blocks.write()?.drain(..) {
            merr.add(b.close().with_context(|| format!("close block {}", b.ulid())));
        }
        merr.add(self.inner.head.close().context("close head"));
        if let Some(lock) = self.lock.lock()?.take() {
            merr.add(lock.release());
        }
        merr.into_result()
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn push_or_close(queriers: &mut Vec<Box<dyn Querier>>, q: Result<BlockQuerier, DbError>) -> Result<(), DbError> {
    match q {
        Ok(q) => {
            queriers.push(Box::new(q));
            Ok(())
        }
        Err(e) => {
            for q in queriers.iter_mut() {
                let _ = q.close();
            }
            Err(e)
        }
    }
}

fn collect_series(q: &dyn Querier, matchers: &[Matcher]) -> Result<Vec<(Labels, Vec<Sample>)>, DbError> {
    let mut out = Vec::new();
    for s in q.select(matchers) {
        let s = s?;
        out.push((s.labels().clone(), s.iter().collect()));
    }
    Ok(out)
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn exponential_backoff(cur: Duration, min: Duration, max: Duration) -> Duration {
    (cur * 2).clamp(min, max)
}

impl DbInner {
    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn run(&self, rx: Receiver<LoopCmd>) {
        self.events.on_event(DbEvent::CompactionLoopStarted);
        let mut backoff = Duration::ZERO;
        loop {
            if !backoff.is_zero() {
                match rx.recv_timeout(backoff) {
                    Ok(LoopCmd::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                    Ok(LoopCmd::Compact) | Err(RecvTimeoutError::Timeout) => {}
                }
            }
            match rx.recv_timeout(self.config.compaction_interval) {
                Ok(LoopCmd::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(LoopCmd::Compact) | Err(RecvTimeoutError::Timeout) => {}
            }
            if self.stopping() {
                break;
            }
            if !self.auto_compact.load(Ordering::SeqCst) {
                continue;
            }
            match self.compact() {
                Ok(()) => backoff = Duration::ZERO,
                Err(e) => {
                    backoff = exponential_backoff(
                        backoff,
                        MIN_COMPACTION_BACKOFF,
                        self.config.max_compaction_backoff.max(MIN_COMPACTION_BACKOFF),
                    );
                    self.events.on_event(DbEvent::CompactionFailed {
                        error: e.to_string(),
                        backoff,
                    });
                }
            }
        }
        self.events.on_event(DbEvent::CompactionLoopStopping);
    }

    fn compact(&self) -> Result<(), DbError> {
        let _guard = self.cmtx.lock()?;
        let block_range = self.config.block_ranges[0];

        // Persist the oldest block range of the head while it holds more than 1.5 ranges, so
        // appends near the boundary still land in the head.
        while self.head.compactable() {
            if self.stopping() {
                return Ok(());
            }
            let mint = self.head.min_time();
            let maxt = range_for_timestamp(mint, block_range);
            // The head range is closed, the block range half-open.
            let rh = self.head.range(mint, maxt - 1);
            let ulid = self
                .compactor
                .write(&self.dir, &rh, mint, maxt, None)
                .context("persist head block")?;

            if let Some(ulid) = ulid {
                self.events.on_event(DbEvent::HeadPersisted {
                    ulid: ulid.to_string(),
                    min_time: mint,
                    max_time: maxt,
                });
            }
            if let Err(e) = self.reload() {
                if let Some(ulid) = ulid {
                    let _ = fs::remove_dir_all(self.dir.join(ulid.to_string()));
                }
                return Err(e.context("reload blocks"));
            }
            if ulid.is_none() {
                // Nothing was persisted, so reload saw no new block to truncate the head to.
                self.head.truncate(maxt).context("truncate head")?;
            }
        }

        loop {
            if self.stopping() {
                return Ok(());
            }
            let plan = self.compactor.plan(&self.dir).context("plan compaction")?;
            if plan.is_empty() {
                return Ok(());
            }
            let ulid = self.compactor.compact(&self.dir, &plan)?;
            if let Err(e) = self.reload() {
                let _ = fs::remove_dir_all(self.dir.join(ulid.to_string()));
                return Err(e.context("reload blocks"));
            }
        }
    }

    fn clean_tombstones(&self) -> Result<(), DbError> {
        let blocks = self.blocks.read()?.clone();
        let mut created = Vec::new();
        let mut emptied = HashSet::new();

        for b in &blocks {
            let had_tombstones = b.meta().stats.num_tombstones > 0;
            match b.clean_tombstones(&self.dir, &self.compactor) {
                Ok(Some(ulid)) => created.push(ulid),
                Ok(None) if had_tombstones => {
                    emptied.insert(b.ulid());
                }
                Ok(None) => {}
                Err(e) => {
                    self.remove_blocks(&created);
                    return Err(e.context(format!("clean tombstones of block {}", b.ulid())));
                }
            }
        }
        if created.is_empty() && emptied.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.reload_with(&emptied) {
            self.remove_blocks(&created);
            return Err(e.context("reload blocks"));
        }
        Ok(())
    }

    fn remove_blocks(&self, ulids: &[Ulid]) {
        for ulid in ulids {
            let path = self.dir.join(ulid.to_string());
            if let Err(e) = fs::remove_dir_all(&path) {
                self.events.on_event(DbEvent::BlockRemovalFailed {
                    path,
                    error: e.to_string(),
                });
            }
        }
    }

    fn reload(&self) -> Result<(), DbError> {
        self.reload_with(&HashSet::new())
    }

    /// Syncs the open blocks with the directory: opens new blocks, drops those that are
    /// beyond retention or replaced by a compacted block, and truncates the head to the newest
    /// block. `extra` names further blocks to drop.
    fn reload_with(&self, extra: &HashSet<Ulid>) -> Result<(), DbError> {
        let current = self.blocks.read()?.clone();
        let mut loaded: Vec<Arc<Block>> = Vec::new();
        let mut corrupted: HashMap<Ulid, DbError> = HashMap::new();

        for dir in block_dirs(&self.dir)? {
            let Some(dir_ulid) = dir
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<Ulid>().ok())
            else {
                continue;
            };
            let meta = match read_meta(&dir) {
                Ok(m) => m,
                Err(e) => {
                    corrupted.insert(dir_ulid, e);
                    continue;
                }
            };
            if let Some(b) = current.iter().find(|b| b.ulid() == meta.ulid) {
                loaded.push(b.clone());
                continue;
            }
            match Block::open(&dir, self.chunk_pool.clone()) {
                Ok(b) => loaded.push(Arc::new(b)),
                Err(e) => {
                    corrupted.insert(meta.ulid, e);
                }
            }
        }
        loaded.sort_by_key(|b| b.min_time());

        let mut deletable = self.deletable_blocks(&loaded);
        deletable.extend(extra.iter().copied());

        let is_new = |b: &Arc<Block>| !current.iter().any(|c| Arc::ptr_eq(c, b));
        let close_new = |blocks: &[Arc<Block>]| {
            for b in blocks.iter().filter(|&b| is_new(b)) {
                let _ = b.close();
            }
        };

        if let Some((ulid, err)) = corrupted.into_iter().find(|(u, _)| !deletable.contains(u)) {
            close_new(&loaded);
            return Err(err.context(format!("unexpected corrupted block {}", ulid)));
        }

        let (removed, keep): (Vec<Arc<Block>>, Vec<Arc<Block>>) =
            loaded.into_iter().partition(|b| deletable.contains(&b.ulid()));

        if let Err(e) = validate_block_sequence(&keep) {
            close_new(&keep);
            close_new(&removed);
            return Err(e);
        }

        let old = std::mem::replace(&mut *self.blocks.write()?, keep.clone());

        for b in old.iter().filter(|b| !keep.iter().any(|k| Arc::ptr_eq(k, b))) {
            if let Err(e) = b.close() {
                self.events.on_event(DbEvent::BlockRemovalFailed {
                    path: b.dir().to_path_buf(),
                    error: e.to_string(),
                });
            }
        }
        for b in removed.iter().filter(|&b| is_new(b)) {
            let _ = b.close();
        }

        for dir in block_dirs(&self.dir)? {
            let ulid = dir
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<Ulid>().ok());
            if !ulid.map(|u| deletable.contains(&u)).unwrap_or(false) {
                continue;
            }
            match fs::remove_dir_all(&dir) {
                Ok(()) => self.events.on_event(DbEvent::BlockRemoved { path: dir }),
                Err(e) => self.events.on_event(DbEvent::BlockRemovalFailed {
                    path: dir,
                    error: e.to_string(),
                }),
            }
        }

        if let Some(newest) = keep.last() {
            self.head.truncate(newest.max_time()).context("truncate head")?;
        }
        Ok(())
    }

    /// Blocks that fall out of retention or were compacted into another block.
    fn deletable_blocks(&self, blocks: &[Arc<Block>]) -> HashSet<Ulid> {
        let mut deletable = HashSet::new();

        let retention = self.config.retention_duration;
        if retention > 0 {
            if let Some(newest) = blocks.iter().map(|b| b.max_time()).max() {
                let cutoff = newest.saturating_sub(retention);
                deletable.extend(blocks.iter().filter(|b| b.max_time() < cutoff).map(|b| b.ulid()));
            }
        }
        for b in blocks {
            deletable.extend(b.meta().compaction.parents.iter().map(|p| p.ulid));
        }
        deletable
    }
}

/// Checks that sorted blocks do not overlap.
fn validate_block_sequence(blocks: &[Arc<Block>]) -> Result<(), DbError> {
    for w in blocks.windows(2) {
        if w[0].max_time() > w[1].min_time() {
            return Err(DbError::OverlappingBlocks {
                prev_min: w[0].min_time(),
                prev_max: w[0].max_time(),
                next_min: w[1].min_time(),
                next_max: w[1].max_time(),
            });
        }
    }
    Ok(())
}

/// Appender returned by [`Db::appender`].
#[derive(Debug)]
pub struct DbAppender {
    app: HeadAppender,
    head: Arc<Head>,
    compact_tx: SyncSender<LoopCmd>,
}

impl Appender for DbAppender {
    fn add(&mut self, lset: &Labels, t: Timestamp, v: Value) -> Result<u64, DbError> {
        self.app.add(lset, t, v)
    }

    fn add_fast(&mut self, series_ref: u64, t: Timestamp, v: Value) -> Result<(), DbError> {
        self.app.add_fast(series_ref, t, v)
    }

    fn commit(&mut self) -> Result<(), DbError> {
        self.app.commit()?;
        if self.head.compactable() {
            // A full channel already has a compaction pending.
            let _ = self.compact_tx.try_send(LoopCmd::Compact);
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        self.app.rollback()
    }
}
