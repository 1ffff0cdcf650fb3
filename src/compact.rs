//! Leveled compaction: planning which blocks to merge and writing blocks from any
//! [`BlockReader`].

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::block::{block_dirs, read_meta, sync_dir, write_meta, Block, BlockMeta, BlockReader, CHUNKS_DIRNAME};
use crate::chunkenc::{Chunk, ChunkPool};
use crate::chunks::{ChunkMeta, ChunkReader, ChunkWriter, PooledChunks, SegmentChunkWriter};
use crate::error::{DbError, MultiError, ResultExt};
use crate::index::{BlockIndexWriter, IndexReader, IndexWriter, MemPostings, ALL_POSTINGS_KEY, INDEX_FILENAME};
use crate::labels::Labels;
use crate::querier::DeletedIterator;
use crate::telemetry::{DbEvent, DbEventListener};
use crate::tombstones::{write_tombstone_file, Interval, Intervals, MemTombstones, TombstoneReader};
use crate::types::Timestamp;
use crate::ulid::Ulid;

/// Two hours in milliseconds.
pub const DEFAULT_BLOCK_DURATION: i64 = 2 * 60 * 60 * 1000;

/// `steps` ranges starting at `min_size`, each `step_size` times the previous one.
pub fn exponential_block_ranges(min_size: i64, steps: usize, step_size: i64) -> Vec<i64> {
    let mut ranges = Vec::with_capacity(steps);
    let mut cur = min_size;
    for _ in 0..steps {
        ranges.push(cur);
        cur = cur.saturating_mul(step_size);
    }
    ranges
}

/// Default ranges: 2h, 10h and 50h.
pub fn default_block_ranges() -> Vec<i64> {
    exponential_block_ranges(DEFAULT_BLOCK_DURATION, 3, 5)
}

/// Creates blocks and merges them.
pub trait Compactor: Send + Sync {
    /// Block directories in `dir` that should be compacted together next. Empty if none.
    fn plan(&self, dir: &Path) -> Result<Vec<PathBuf>, DbError>;

    /// Merges the blocks in `dirs` into a new block in `dest`.
    fn compact(&self, dest: &Path, dirs: &[PathBuf]) -> Result<Ulid, DbError>;

    /// Writes the data of `b` within `[mint, maxt)` as a new level-1 block in `dest`. Returns
    /// `None` if the block would hold no samples.
    fn write(
        &self,
        dest: &Path,
        b: &dyn BlockReader,
        mint: Timestamp,
        maxt: Timestamp,
        parent: Option<&BlockMeta>,
    ) -> Result<Option<Ulid>, DbError>;
}

/// Compacts blocks into exponentially growing time ranges.
#[derive(Debug)]
pub struct LeveledCompactor {
    ranges: Vec<i64>,
    chunk_pool: Arc<ChunkPool>,
    events: Arc<dyn DbEventListener>,
}

#[derive(Debug, Clone)]
struct DirMeta {
    dir: PathBuf,
    meta: BlockMeta,
}

impl LeveledCompactor {
    pub fn new(ranges: Vec<i64>, chunk_pool: Arc<ChunkPool>, events: Arc<dyn DbEventListener>) -> Result<Self, DbError> {
        if ranges.is_empty() {
            return Err(DbError::ConfigError("at least one block range must be provided".to_string()));
        }
        Ok(Self {
            ranges,
            chunk_pool,
            events,
        })
    }

    pub fn ranges(&self) -> &[i64] {
        &self.ranges
    }

    /// The first group of blocks in a tier that is complete or lies entirely before the newest
    /// block.
    fn select_dirs(&self, ds: &[DirMeta]) -> Vec<DirMeta> {
        let high_time = match ds.last() {
            Some(d) if self.ranges.len() >= 2 => d.meta.min_time,
            _ => return Vec::new(),
        };
        for &tier in &self.ranges[1..] {
            for group in split_by_range(ds, tier) {
                if group.iter().any(|d| d.meta.compaction.failed) {
                    continue;
                }
                let mint = group[0].meta.min_time;
                let maxt = group[group.len() - 1].meta.max_time;
                // Waiting for a group to fill its tier avoids compacting blocks prematurely
                // while a block of the same size still fits.
                if (maxt - mint == tier || maxt <= high_time) && group.len() > 1 {
                    return group;
                }
            }
        }
        Vec::new()
    }

    fn write_block(&self, dest: &Path, meta: &mut BlockMeta, blocks: &[&dyn BlockReader]) -> Result<(), DbError> {
        let dir = dest.join(meta.ulid.to_string());
        let tmp = dest.join(format!("{}.tmp", meta.ulid));
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        fs::create_dir_all(&tmp)?;

        let res = self.write_block_files(&tmp, meta, blocks).and_then(|()| {
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
            fs::rename(&tmp, &dir)?;
            sync_dir(dest)
        });
        if res.is_err() {
            let _ = fs::remove_dir_all(&tmp);
        }
        res.with_context(|| format!("write block {}", meta.ulid))
    }

    fn write_block_files(&self, tmp: &Path, meta: &mut BlockMeta, blocks: &[&dyn BlockReader]) -> Result<(), DbError> {
        let mut chunkw = SegmentChunkWriter::new(tmp.join(CHUNKS_DIRNAME)).context("open chunk writer")?;
        let mut indexw = BlockIndexWriter::new(tmp.join(INDEX_FILENAME)).context("open index writer")?;
        self.populate_block(blocks, meta, &mut indexw, &mut chunkw)
            .context("write compaction")?;
        chunkw.close().context("close chunk writer")?;
        indexw.close().context("close index writer")?;

        write_meta(tmp, meta)?;
        // Data from the inputs is already filtered by their tombstones.
        write_tombstone_file(tmp, &MemTombstones::new())?;
        sync_dir(tmp)
    }

    /// Streams the merged series of `blocks` into the writers and fills in `meta.stats`.
    fn populate_block(
        &self,
        blocks: &[&dyn BlockReader],
        meta: &mut BlockMeta,
        indexw: &mut dyn IndexWriter,
        chunkw: &mut dyn ChunkWriter,
    ) -> Result<(), DbError> {
        let mut readers = Vec::with_capacity(blocks.len());
        let mut symbols = BTreeSet::new();
        for b in blocks {
            let ir = b.index().context("open index reader")?;
            let cr = b.chunks().context("open chunk reader")?;
            let tr = b.tombstones().context("open tombstone reader")?;
            symbols.extend(ir.symbols().context("read symbols")?);
            readers.push((ir, cr, tr));
        }
        let mut sets = Vec::with_capacity(readers.len());
        for (ir, cr, tr) in &readers {
            sets.push(compaction_series_set(ir.as_ref(), cr.as_ref(), tr.as_ref())?);
        }
        indexw.add_symbols(&symbols)?;

        let mut values: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let postings = MemPostings::new();
        let mut i = 0u64;
        for s in merge_compaction_sets(sets) {
            let s = s?;
            let mut chks = PooledChunks::new(&self.chunk_pool, s.chunks);
            for c in chks.metas() {
                if c.min_time < meta.min_time || c.max_time >= meta.max_time {
                    return Err(DbError::ChunkOutOfBlockRange {
                        chunk_min: c.min_time,
                        chunk_max: c.max_time,
                        block_min: meta.min_time,
                        block_max: meta.max_time,
                    });
                }
            }
            if !s.intervals.is_empty() {
                for c in chks.metas_mut() {
                    let src = match c.chunk.take() {
                        Some(src) => src,
                        None => continue,
                    };
                    let mut fresh = self.chunk_pool.get_empty();
                    let mut app = fresh.appender()?;
                    for (t, v) in DeletedIterator::new(src.iter(), s.intervals.as_slice()) {
                        app.append(&mut fresh, t, v)?;
                    }
                    self.chunk_pool.put(src.into_xor());
                    c.chunk = Some(Chunk::new(fresh));
                }
            }

            chunkw.write_chunks(chks.metas_mut())?;
            indexw.add_series(i, &s.labels, chks.metas())?;

            meta.stats.num_series += 1;
            meta.stats.num_chunks += chks.metas().len() as u64;
            for c in chks.metas() {
                meta.stats.num_samples += c.chunk.as_ref().map_or(0, |c| c.num_samples() as u64);
            }
            for l in &s.labels {
                values.entry(l.name.clone()).or_default().insert(l.value.clone());
            }
            postings.add(i, &s.labels)?;
            i += 1;
        }

        for (name, vals) in values {
            let vals: Vec<String> = vals.into_iter().collect();
            indexw.write_label_index(&[name], &vals)?;
        }
        for l in postings.sorted_keys()? {
            indexw.write_postings(&l.name, &l.value, &postings.get(&l.name, &l.value)?)?;
        }
        Ok(())
    }
}

impl Compactor for LeveledCompactor {
    fn plan(&self, dir: &Path) -> Result<Vec<PathBuf>, DbError> {
        let mut dms = Vec::new();
        for d in block_dirs(dir)? {
            let meta = read_meta(&d)?;
            dms.push(DirMeta { dir: d, meta });
        }
        dms.sort_by_key(|d| d.meta.min_time);
        // The newest block is left alone so there is always a window for backfilling without
        // overlaps.
        if dms.pop().is_none() {
            return Ok(Vec::new());
        }

        let selected = self.select_dirs(&dms);
        if !selected.is_empty() {
            return Ok(selected.into_iter().map(|d| d.dir).collect());
        }

        // Rewrite big blocks with more than 5% of their series deleted.
        let threshold = self.ranges[self.ranges.len() / 2];
        for d in dms.iter().rev() {
            let meta = &d.meta;
            if meta.max_time - meta.min_time < threshold {
                break;
            }
            if meta.stats.num_tombstones as f64 / (meta.stats.num_series + 1) as f64 > 0.05 {
                return Ok(vec![d.dir.clone()]);
            }
        }
        Ok(Vec::new())
    }

    fn compact(&self, dest: &Path, dirs: &[PathBuf]) -> Result<Ulid, DbError> {
        let start = Instant::now();
        let mut blocks = Vec::with_capacity(dirs.len());
        for d in dirs {
            let b = Block::open(d, Arc::clone(&self.chunk_pool)).with_context(|| format!("open block {:?}", d))?;
            blocks.push(b);
        }
        let metas: Vec<BlockMeta> = blocks.iter().map(|b| b.meta()).collect();
        let mut meta = compact_block_metas(Ulid::new(), &metas)?;

        let readers: Vec<&dyn BlockReader> = blocks.iter().map(|b| b as &dyn BlockReader).collect();
        let res = self.write_block(dest, &mut meta, &readers);

        let mut merr = MultiError::new();
        if let Err(e) = res {
            for b in &blocks {
                merr.add(
                    b.set_compaction_failed()
                        .with_context(|| format!("mark block {} as failed", b.ulid())),
                );
            }
            for b in &blocks {
                let _ = b.close();
            }
            self.events.on_event(DbEvent::BlocksCompactionFailed {
                dirs: dirs.to_vec(),
                error: e.to_string(),
            });
            return Err(if merr.is_empty() {
                e
            } else {
                merr.push(e);
                DbError::Multi(merr)
            });
        }

        for b in &blocks {
            merr.add(b.close());
        }
        merr.into_result()?;
        self.events.on_event(DbEvent::BlocksCompacted {
            ulid: meta.ulid.to_string(),
            sources: dirs.len(),
            duration: start.elapsed(),
        });
        Ok(meta.ulid)
    }

    fn write(
        &self,
        dest: &Path,
        b: &dyn BlockReader,
        mint: Timestamp,
        maxt: Timestamp,
        parent: Option<&BlockMeta>,
    ) -> Result<Option<Ulid>, DbError> {
        let mut meta = BlockMeta::new(Ulid::new(), mint, maxt);
        if let Some(p) = parent {
            meta.compaction.parents = vec![p.desc()];
        }
        self.write_block(dest, &mut meta, &[b])?;
        if meta.stats.num_samples == 0 {
            fs::remove_dir_all(dest.join(meta.ulid.to_string()))?;
            return Ok(None);
        }
        Ok(Some(meta.ulid))
    }
}

/// Meta of the block resulting from merging blocks with `metas`, given in time order.
fn compact_block_metas(ulid: Ulid, metas: &[BlockMeta]) -> Result<BlockMeta, DbError> {
    let (first, last) = match (metas.first(), metas.last()) {
        (Some(f), Some(l)) => (f, l),
        _ => return Err(DbError::Internal("no blocks to compact".to_string())),
    };
    let mut meta = BlockMeta::new(ulid, first.min_time, last.max_time);
    let mut sources = BTreeSet::new();
    let mut level = 0;
    for m in metas {
        level = level.max(m.compaction.level);
        sources.extend(m.compaction.sources.iter().copied());
        meta.compaction.parents.push(m.desc());
    }
    meta.compaction.level = level + 1;
    meta.compaction.sources = sources.into_iter().collect();
    Ok(meta)
}

/// Splits blocks sorted by time into groups aligned to `tr`. Blocks larger than their aligned
/// window are skipped.
fn split_by_range(ds: &[DirMeta], tr: i64) -> Vec<Vec<DirMeta>> {
    let mut groups = Vec::new();
    let mut i = 0;
    while i < ds.len() {
        let m = &ds[i].meta;
        let t0 = if m.min_time >= 0 {
            tr * (m.min_time / tr)
        } else {
            tr * ((m.min_time - tr + 1) / tr)
        };
        if m.max_time > t0 + tr {
            i += 1;
            continue;
        }
        let mut group = Vec::new();
        while i < ds.len() && ds[i].meta.max_time <= t0 + tr {
            group.push(ds[i].clone());
            i += 1;
        }
        if !group.is_empty() {
            groups.push(group);
        }
    }
    groups
}

/// A series with its chunks loaded and the deletions that still apply to them.
struct CompactionSeries {
    labels: Labels,
    chunks: Vec<ChunkMeta>,
    intervals: Intervals,
}

type CompactionSet<'a> = Box<dyn Iterator<Item = Result<CompactionSeries, DbError>> + 'a>;

/// All series of one block in label order. Chunks entirely covered by deletions are dropped, as
/// are series left without chunks.
fn compaction_series_set<'a>(
    ir: &'a dyn IndexReader,
    cr: &'a dyn ChunkReader,
    tr: &'a dyn TombstoneReader,
) -> Result<CompactionSet<'a>, DbError> {
    let (n, v) = ALL_POSTINGS_KEY;
    let refs = ir.sorted_postings(ir.postings(n, v)?)?;
    Ok(Box::new(refs.into_iter().filter_map(move |r| {
        let load = || -> Result<Option<CompactionSeries>, DbError> {
            let mut labels = Labels::default();
            let mut chunks = Vec::new();
            ir.series(r, &mut labels, &mut chunks).with_context(|| format!("get series {}", r))?;
            let intervals = tr.get(r)?;
            if !intervals.is_empty() {
                chunks.retain(|c: &ChunkMeta| !Interval::new(c.min_time, c.max_time).is_subrange(&intervals));
            }
            if chunks.is_empty() {
                return Ok(None);
            }
            for c in chunks.iter_mut() {
                c.chunk = Some(cr.chunk(c.chunk_ref).with_context(|| format!("chunk {:#x} not found", c.chunk_ref))?);
            }
            Ok(Some(CompactionSeries {
                labels,
                chunks,
                intervals,
            }))
        };
        load().transpose()
    })))
}

/// Merges two compaction sets by labels. Equal series are concatenated with `a`'s chunks first.
struct MergedCompactionSet<'a> {
    a: Peekable<CompactionSet<'a>>,
    b: Peekable<CompactionSet<'a>>,
}

impl Iterator for MergedCompactionSet<'_> {
    type Item = Result<CompactionSeries, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        let ord = match (self.a.peek(), self.b.peek()) {
            (None, None) => return None,
            (Some(_), None) | (Some(Err(_)), _) => Ordering::Less,
            (None, Some(_)) | (_, Some(Err(_))) => Ordering::Greater,
            (Some(Ok(a)), Some(Ok(b))) => a.labels.cmp(&b.labels),
        };
        match ord {
            Ordering::Less => self.a.next(),
            Ordering::Greater => self.b.next(),
            Ordering::Equal => match (self.a.next()?, self.b.next()?) {
                (Ok(mut a), Ok(b)) => {
                    a.chunks.extend(b.chunks);
                    for iv in b.intervals.iter() {
                        a.intervals.add(*iv);
                    }
                    Some(Ok(a))
                }
                (Err(e), _) | (_, Err(e)) => Some(Err(e)),
            },
        }
    }
}

fn merge_compaction_sets(mut sets: Vec<CompactionSet<'_>>) -> CompactionSet<'_> {
    match sets.len() {
        0 => Box::new(std::iter::empty()),
        1 => sets.remove(0),
        n => {
            let right = sets.split_off(n / 2);
            Box::new(MergedCompactionSet {
                a: merge_compaction_sets(sets).peekable(),
                b: merge_compaction_sets(right).peekable(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::create_block;
    use crate::labels::Matcher;
    use crate::querier::{BlockQuerier, Querier};
    use crate::telemetry::noop_event_listener;
    use tempfile::tempdir;

    fn ls(pairs: &[(&str, &str)]) -> Labels {
        Labels::from_pairs(pairs).unwrap()
    }

    fn compactor(ranges: Vec<i64>) -> LeveledCompactor {
        LeveledCompactor::new(ranges, Arc::new(ChunkPool::new()), noop_event_listener()).unwrap()
    }

    /// Writes only a meta file; planning never looks at anything else.
    fn meta_block(dir: &Path, mint: i64, maxt: i64, edit: impl FnOnce(&mut BlockMeta)) -> PathBuf {
        let mut meta = BlockMeta::new(Ulid::with_time(mint.max(0) as u64 + 1), mint, maxt);
        edit(&mut meta);
        let bdir = dir.join(meta.ulid.to_string());
        fs::create_dir_all(&bdir).unwrap();
        write_meta(&bdir, &meta).unwrap();
        bdir
    }

    fn dm(mint: i64, maxt: i64) -> DirMeta {
        DirMeta {
            dir: PathBuf::from(format!("{}-{}", mint, maxt)),
            meta: BlockMeta::new(Ulid::nil(), mint, maxt),
        }
    }

    fn ranges_of(groups: Vec<Vec<DirMeta>>) -> Vec<Vec<(i64, i64)>> {
        groups
            .into_iter()
            .map(|g| g.into_iter().map(|d| (d.meta.min_time, d.meta.max_time)).collect())
            .collect()
    }

    fn all_samples(b: &dyn BlockReader) -> Vec<(String, Vec<(i64, f64)>)> {
        let meta = b.meta();
        let q = BlockQuerier::new(b, meta.min_time, meta.max_time - 1).unwrap();
        q.select(&[Matcher::regex("a", ".+").unwrap()])
            .map(|s| {
                let s = s.unwrap();
                (s.labels().to_string(), s.iter().collect())
            })
            .collect()
    }

    #[test]
    fn exponential_ranges() {
        assert_eq!(exponential_block_ranges(10, 3, 5), vec![10, 50, 250]);
        assert_eq!(
            default_block_ranges(),
            vec![7_200_000, 36_000_000, 180_000_000]
        );
    }

    #[test]
    fn split_by_range_groups_aligned_blocks() {
        let ds = vec![dm(0, 10), dm(10, 20), dm(20, 30), dm(30, 40)];
        assert_eq!(
            ranges_of(split_by_range(&ds, 20)),
            vec![vec![(0, 10), (10, 20)], vec![(20, 30), (30, 40)]]
        );
        // A block crossing the aligned window is skipped.
        let ds = vec![dm(0, 10), dm(10, 30), dm(30, 40)];
        assert_eq!(ranges_of(split_by_range(&ds, 20)), vec![vec![(0, 10)], vec![(30, 40)]]);
        let ds = vec![dm(-20, -10), dm(-10, 0)];
        assert_eq!(ranges_of(split_by_range(&ds, 20)), vec![vec![(-20, -10), (-10, 0)]]);
    }

    #[test]
    fn plan_picks_full_tier_and_leaves_newest() {
        let dir = tempdir().unwrap();
        let c = compactor(vec![20, 60, 180]);
        assert!(c.plan(dir.path()).unwrap().is_empty());

        let b0 = meta_block(dir.path(), 0, 20, |_| {});
        let b1 = meta_block(dir.path(), 20, 40, |_| {});
        let b2 = meta_block(dir.path(), 40, 60, |_| {});
        // [0, 40) neither fills its tier nor lies before the newest remaining block.
        assert!(c.plan(dir.path()).unwrap().is_empty());

        meta_block(dir.path(), 60, 80, |_| {});
        assert_eq!(c.plan(dir.path()).unwrap(), vec![b0, b1, b2]);
    }

    #[test]
    fn plan_skips_failed_groups() {
        let dir = tempdir().unwrap();
        let c = compactor(vec![20, 60, 180]);
        meta_block(dir.path(), 0, 20, |m| m.compaction.failed = true);
        meta_block(dir.path(), 20, 40, |_| {});
        meta_block(dir.path(), 40, 60, |_| {});
        meta_block(dir.path(), 60, 80, |_| {});
        assert!(c.plan(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn plan_falls_back_to_tombstone_heavy_block() {
        let dir = tempdir().unwrap();
        let c = compactor(vec![20, 60, 180]);
        let big = meta_block(dir.path(), 0, 60, |m| {
            m.stats.num_series = 10;
            m.stats.num_tombstones = 1;
        });
        meta_block(dir.path(), 60, 80, |_| {});
        assert_eq!(c.plan(dir.path()).unwrap(), vec![big.clone()]);

        // 1 / (20 + 1) is below the threshold.
        let mut meta = read_meta(&big).unwrap();
        meta.stats.num_series = 20;
        write_meta(&big, &meta).unwrap();
        assert!(c.plan(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn compact_merges_adjacent_blocks() {
        let dir = tempdir().unwrap();
        let samples = |r: std::ops::Range<i64>| r.map(|t| (t, t as f64)).collect::<Vec<_>>();
        let a = create_block(
            dir.path(),
            &[(ls(&[("a", "1")]), samples(0..100)), (ls(&[("a", "2")]), samples(0..50))],
        );
        let b = create_block(
            dir.path(),
            &[(ls(&[("a", "1")]), samples(100..200)), (ls(&[("a", "3")]), samples(150..200))],
        );
        let c = compactor(vec![100, 200]);
        let ulid = c.compact(dir.path(), &[a.clone(), b.clone()]).unwrap();

        let merged = Block::open(dir.path().join(ulid.to_string()), Arc::new(ChunkPool::new())).unwrap();
        let meta = merged.meta();
        assert_eq!((meta.min_time, meta.max_time), (0, 200));
        assert_eq!(meta.compaction.level, 2);
        assert_eq!(meta.compaction.parents.len(), 2);
        let mut want_sources = vec![read_meta(&a).unwrap().ulid, read_meta(&b).unwrap().ulid];
        want_sources.sort();
        assert_eq!(meta.compaction.sources, want_sources);
        assert_eq!(meta.stats.num_samples, 300);
        assert_eq!(meta.stats.num_series, 3);

        let got = all_samples(&merged);
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].1, samples(0..200));
        assert_eq!(got[2].1, samples(150..200));
        assert!(!dir.path().join(format!("{}.tmp", ulid)).exists());
    }

    #[test]
    fn failed_compaction_marks_inputs() {
        let dir = tempdir().unwrap();
        let a = create_block(dir.path(), &[(ls(&[("a", "1")]), vec![(0, 0.0), (99, 1.0)])]);
        let b = create_block(dir.path(), &[(ls(&[("a", "1")]), vec![(100, 0.0), (199, 1.0)])]);
        let c = compactor(vec![100, 200]);
        // Out of time order the merged range is empty, so every chunk is out of bounds.
        let err = c.compact(dir.path(), &[b.clone(), a.clone()]).unwrap_err();
        assert!(matches!(err.root(), DbError::ChunkOutOfBlockRange { .. }));
        assert!(read_meta(&a).unwrap().compaction.failed);
        assert!(read_meta(&b).unwrap().compaction.failed);
        assert_eq!(block_dirs(dir.path()).unwrap().len(), 2);
    }

    #[test]
    fn write_drops_deleted_data_and_empty_blocks() {
        let dir = tempdir().unwrap();
        let src = create_block(
            dir.path(),
            &[(ls(&[("a", "1")]), (0..10).map(|t| (t, t as f64)).collect())],
        );
        let block = Block::open(&src, Arc::new(ChunkPool::new())).unwrap();
        block.delete(2, 4, &[Matcher::equal("a", "1")]).unwrap();
        let c = compactor(vec![100]);

        let meta = block.meta();
        let out = c
            .write(dir.path(), &block, meta.min_time, meta.max_time, Some(&meta))
            .unwrap()
            .unwrap();
        let cleaned = Block::open(dir.path().join(out.to_string()), Arc::new(ChunkPool::new())).unwrap();
        assert_eq!(cleaned.meta().compaction.parents, vec![meta.desc()]);
        assert_eq!(cleaned.meta().stats.num_samples, 7);
        let ts: Vec<i64> = all_samples(&cleaned)[0].1.iter().map(|s| s.0).collect();
        assert_eq!(ts, vec![0, 1, 5, 6, 7, 8, 9]);

        block.delete(0, 100, &[Matcher::equal("a", "1")]).unwrap();
        let before = block_dirs(dir.path()).unwrap().len();
        assert!(c
            .write(dir.path(), &block, meta.min_time, meta.max_time, None)
            .unwrap()
            .is_none());
        assert_eq!(block_dirs(dir.path()).unwrap().len(), before);
    }
}
