//! Rebuilding the head from the last checkpoint and the WAL segments after it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;

use crate::checkpoint::last_checkpoint;
use crate::error::{DbError, ResultExt};
use crate::record::{decode_samples, decode_series, decode_tombstones, record_type, RecordType, RefSample, RefSeries, Stone};
use crate::telemetry::DbEvent;
use crate::types::Timestamp;
use crate::wal::{list_segments, segment_range, WalReader};

use super::{Head, MemSeries};

/// Upper bound of samples handed to the workers at once.
const REPLAY_BATCH_SIZE: usize = 5000;

#[derive(Debug, Default)]
struct ReplayStats {
    series: u64,
    samples: u64,
    unknown_refs: u64,
}

/// Per-worker state kept across batches.
#[derive(Debug)]
struct Worker {
    cache: HashMap<u64, Arc<MemSeries>>,
    mint: Timestamp,
    maxt: Timestamp,
    samples: u64,
    unknown_refs: u64,
    err: Option<DbError>,
}

impl Worker {
    fn new() -> Self {
        Self {
            cache: HashMap::new(),
            mint: Timestamp::MAX,
            maxt: Timestamp::MIN,
            samples: 0,
            unknown_refs: 0,
            err: None,
        }
    }

    fn process(&mut self, head: &Head, min_valid_time: Timestamp, samples: &[RefSample]) {
        if self.err.is_some() {
            return;
        }
        if let Err(e) = self.try_process(head, min_valid_time, samples) {
            self.err = Some(e);
        }
    }

    fn try_process(&mut self, head: &Head, min_valid_time: Timestamp, samples: &[RefSample]) -> Result<(), DbError> {
        for s in samples {
            if s.t < min_valid_time {
                continue;
            }
            let series = match self.cache.get(&s.series_ref) {
                Some(series) => Arc::clone(series),
                None => match head.series.get_by_id(s.series_ref)? {
                    Some(series) => {
                        self.cache.insert(s.series_ref, Arc::clone(&series));
                        series
                    }
                    None => {
                        self.unknown_refs += 1;
                        continue;
                    }
                },
            };
            let (ok, _) = series.state.lock()?.append(s.t, s.v)?;
            if ok {
                self.samples += 1;
            }
            self.mint = self.mint.min(s.t);
            self.maxt = self.maxt.max(s.t);
        }
        Ok(())
    }
}

/// Applies records in log order. Sample batches are partitioned by series so every series
/// sees its samples in order, and each batch completes before the next record is read.
struct Replayer<'a> {
    head: &'a Head,
    pool: &'a rayon::ThreadPool,
    min_valid_time: Timestamp,
    workers: Vec<Worker>,
    parts: Vec<Vec<RefSample>>,
    series: Vec<RefSeries>,
    samples: Vec<RefSample>,
    stones: Vec<Stone>,
    stats: ReplayStats,
}

impl<'a> Replayer<'a> {
    fn new(head: &'a Head, pool: &'a rayon::ThreadPool, min_valid_time: Timestamp) -> Self {
        let n = pool.current_num_threads().max(1);
        Self {
            head,
            pool,
            min_valid_time,
            workers: (0..n).map(|_| Worker::new()).collect(),
            parts: (0..n).map(|_| Vec::new()).collect(),
            series: Vec::new(),
            samples: Vec::new(),
            stones: Vec::new(),
            stats: ReplayStats::default(),
        }
    }

    fn apply(&mut self, rec: &[u8]) -> Result<(), DbError> {
        match record_type(rec) {
            RecordType::Series => {
                self.series.clear();
                decode_series(rec, &mut self.series)?;
                for s in &self.series {
                    let (_, created) = self.head.get_or_create_with_id(s.series_ref, s.labels.hash(), &s.labels)?;
                    if created {
                        self.stats.series += 1;
                    }
                    self.head
                        .last_series_id
                        .fetch_max(s.series_ref, std::sync::atomic::Ordering::AcqRel);
                }
            }
            RecordType::Samples => {
                self.samples.clear();
                decode_samples(rec, &mut self.samples)?;
                let n = self.workers.len() as u64;
                for batch in self.samples.chunks(REPLAY_BATCH_SIZE) {
                    for p in self.parts.iter_mut() {
                        p.clear();
                    }
                    for s in batch {
                        self.parts[(s.series_ref % n) as usize].push(*s);
                    }
                    let head = self.head;
                    let min_valid = self.min_valid_time;
                    let workers = &mut self.workers;
                    let parts = &self.parts;
                    self.pool.install(|| {
                        workers
                            .par_iter_mut()
                            .zip(parts.par_iter())
                            .for_each(|(w, part)| w.process(head, min_valid, part));
                    });
                }
            }
            RecordType::Tombstones => {
                self.stones.clear();
                decode_tombstones(rec, &mut self.stones)?;
                for s in &self.stones {
                    for iv in &s.intervals {
                        if iv.maxt < self.min_valid_time {
                            continue;
                        }
                        self.head.tombstones.add_interval(s.series_ref, &[*iv])?;
                    }
                }
            }
            RecordType::Invalid => {
                return Err(DbError::Corruption {
                    details: format!("invalid record type {:?}", rec.first()),
                });
            }
        }
        Ok(())
    }

    /// Folds the workers' results into the head and `total`, also after a failed read, so the
    /// samples replayed so far stay within the head's time range.
    fn finish(mut self, total: &mut ReplayStats) -> Result<(), DbError> {
        let mut first_err = None;
        for w in self.workers.iter_mut() {
            if let Some(e) = w.err.take() {
                first_err.get_or_insert(e);
            }
            self.head.update_min_max_time(w.mint, w.maxt);
            self.stats.samples += w.samples;
            self.stats.unknown_refs += w.unknown_refs;
        }
        accumulate(total, std::mem::take(&mut self.stats));
        first_err.map_or(Ok(()), Err)
    }

    fn read_all(&mut self, r: &mut WalReader, dir: &Path) -> Result<(), DbError> {
        while let Some(rec) = r.next_record()? {
            if let Err(e) = self.apply(rec) {
                return Err(DbError::WalCorruption {
                    dir: dir.to_path_buf(),
                    segment: r.segment().unwrap_or_default(),
                    offset: r.offset() as u64,
                    details: e.to_string(),
                });
            }
            if let Some(e) = self.workers.iter_mut().find_map(|w| w.err.take()) {
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Reads every record of `r` into the head. Decoding failures are reported as corruption at
/// the position of the offending record. Whatever was replayed before a failure is kept.
fn load_wal(
    head: &Head,
    pool: &rayon::ThreadPool,
    mut r: WalReader,
    dir: &Path,
    total: &mut ReplayStats,
) -> Result<(), DbError> {
    let mut rp = Replayer::new(head, pool, head.min_valid_time());
    let res = rp.read_all(&mut r, dir);
    let folded = rp.finish(total);
    res.and(folded)
}

impl Head {
    /// Loads the head from the WAL and garbage collects what lies before `min_valid_time`.
    ///
    /// A corrupt checkpoint is fatal. A corrupt WAL segment is repaired by cutting it back to
    /// the last valid record.
    pub fn init(&self, min_valid_time: Timestamp) -> Result<(), DbError> {
        self.min_valid_time
            .store(min_valid_time, std::sync::atomic::Ordering::Release);
        let res = self.replay();
        let gc = self.gc();
        res?;
        gc
    }

    fn replay(&self) -> Result<(), DbError> {
        let wal = match &self.wal {
            Some(wal) => Arc::clone(wal),
            None => return Ok(()),
        };
        let start = Instant::now();
        let n = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .thread_name(|i| format!("strix-wal-replay-{}", i))
            .build()
            .map_err(|e| DbError::BackgroundTaskError(format!("build replay pool: {}", e)))?;

        let mut total = ReplayStats::default();
        let mut start_from = None;
        if let Some((dir, idx)) = last_checkpoint(wal.dir()).context("find last checkpoint")? {
            let segs = list_segments(&dir).context("open checkpoint")?;
            load_wal(self, &pool, WalReader::new(segs), &dir, &mut total).context("backfill checkpoint")?;
            start_from = Some(idx + 1);
        }

        let segs = segment_range(wal.dir(), start_from, None)?;
        if let Err(e) = load_wal(self, &pool, WalReader::new(segs), wal.dir(), &mut total) {
            let (segment, offset) = match e.root() {
                DbError::WalCorruption { segment, offset, .. } => (*segment, *offset),
                _ => return Err(e),
            };
            wal.repair(&e).context("repair corrupted WAL")?;
            self.events.on_event(DbEvent::WalRepaired {
                segment,
                offset,
                error: e.to_string(),
            });
        }

        if total.unknown_refs > 0 {
            self.events.on_event(DbEvent::WalUnknownSeriesRefs {
                count: total.unknown_refs,
            });
        }
        self.events.on_event(DbEvent::WalReplayCompleted {
            series: total.series,
            samples: total.samples,
            duration: start.elapsed(),
        });
        Ok(())
    }
}

fn accumulate(total: &mut ReplayStats, s: ReplayStats) {
    total.series += s.series;
    total.samples += s.samples;
    total.unknown_refs += s.unknown_refs;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::head::tests::ls;
    use crate::head::Appender;
    use crate::labels::{Labels, Matcher};
    use crate::record::{encode_samples, encode_series};
    use crate::telemetry::noop_event_listener;
    use crate::telemetry::test_support::RecordingListener;
    use crate::tombstones::TombstoneReader;
    use crate::wal::{segment_name, Wal, WalOptions};
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;

    fn open_head(dir: &Path) -> Arc<Head> {
        let wal = Arc::new(Wal::open(dir, WalOptions::default()).unwrap());
        Arc::new(Head::new(Some(wal), 10_000, noop_event_listener()).unwrap())
    }

    fn samples_of(head: &Arc<Head>, lset: &Labels) -> Vec<(i64, f64)> {
        let s = head.series.get_by_hash(lset.hash(), lset).unwrap().unwrap();
        let st = s.state.lock().unwrap();
        st.chunks.iter().flat_map(|c| c.chunk.iter().collect::<Vec<_>>()).collect()
    }

    #[test]
    fn reopen_restores_committed_samples_and_tombstones() {
        let dir = tempdir().unwrap();
        {
            let head = open_head(dir.path());
            head.init(i64::MIN).unwrap();
            let mut app = head.appender();
            for t in 0..50 {
                app.add(&ls(&[("a", "1")]), t, t as f64).unwrap();
                app.add(&ls(&[("a", "2")]), t, 1.0).unwrap();
            }
            app.commit().unwrap();
            let mut app = head.appender();
            app.add(&ls(&[("a", "3")]), 60, 1.0).unwrap();
            app.rollback().unwrap();
            head.delete(10, 20, &[Matcher::equal("a", "2")]).unwrap();
            head.close().unwrap();
        }

        let head = open_head(dir.path());
        head.init(i64::MIN).unwrap();
        // The rolled back series never got samples and is collected.
        assert_eq!(head.num_series(), 2);
        assert_eq!(head.min_time(), 0);
        assert_eq!(head.max_time(), 49);
        let want: Vec<(i64, f64)> = (0..50).map(|t| (t, t as f64)).collect();
        assert_eq!(samples_of(&head, &ls(&[("a", "1")])), want);
        assert_eq!(head.tombstones().total().unwrap(), 1);

        // New series continue after the highest replayed id.
        let mut app = head.appender();
        let r = app.add(&ls(&[("a", "4")]), 100, 1.0).unwrap();
        assert_eq!(r, 4);
    }

    #[test]
    fn samples_below_min_valid_time_are_skipped() {
        let dir = tempdir().unwrap();
        {
            let head = open_head(dir.path());
            let mut app = head.appender();
            for t in 0..100 {
                app.add(&ls(&[("a", "1")]), t, 0.0).unwrap();
            }
            app.commit().unwrap();
            head.close().unwrap();
        }
        let head = open_head(dir.path());
        head.init(50).unwrap();
        assert_eq!(head.min_time(), 50);
        assert_eq!(samples_of(&head, &ls(&[("a", "1")])).len(), 50);
    }

    #[test]
    fn unknown_refs_are_reported_not_fatal() {
        let dir = tempdir().unwrap();
        {
            let wal = Wal::open(dir.path(), WalOptions::default()).unwrap();
            let mut buf = Vec::new();
            encode_series(
                &[RefSeries {
                    series_ref: 1,
                    labels: ls(&[("a", "1")]),
                }],
                &mut buf,
            );
            wal.log(&[buf.as_slice()]).unwrap();
            buf.clear();
            encode_samples(
                &[
                    RefSample { series_ref: 1, t: 5, v: 1.0 },
                    RefSample { series_ref: 7, t: 5, v: 1.0 },
                ],
                &mut buf,
            );
            wal.log(&[buf.as_slice()]).unwrap();
            wal.close().unwrap();
        }
        let events = Arc::new(RecordingListener::default());
        let wal = Arc::new(Wal::open(dir.path(), WalOptions::default()).unwrap());
        let head = Head::new(Some(wal), 10_000, events.clone()).unwrap();
        head.init(i64::MIN).unwrap();
        assert_eq!(
            events.count(|e| matches!(e, DbEvent::WalUnknownSeriesRefs { count: 1 })),
            1
        );
    }

    #[test]
    fn torn_tail_is_repaired() {
        let dir = tempdir().unwrap();
        {
            let head = open_head(dir.path());
            let mut app = head.appender();
            app.add(&ls(&[("a", "1")]), 1, 1.0).unwrap();
            app.commit().unwrap();
            head.close().unwrap();
        }
        let mut f = OpenOptions::new()
            .append(true)
            .open(segment_name(dir.path(), 0))
            .unwrap();
        f.write_all(&[0xff, 0x00, 0x00]).unwrap();
        drop(f);

        let events = Arc::new(RecordingListener::default());
        let wal = Arc::new(Wal::open(dir.path(), WalOptions::default()).unwrap());
        let head = Arc::new(Head::new(Some(wal), 10_000, events.clone()).unwrap());
        head.init(i64::MIN).unwrap();
        assert_eq!(events.count(|e| matches!(e, DbEvent::WalRepaired { .. })), 1);
        // Records before the tear survive the gc that follows the repair.
        assert_eq!((head.min_time(), head.max_time()), (1, 1));
        assert_eq!(head.num_series(), 1);
        assert_eq!(samples_of(&head, &ls(&[("a", "1")])), vec![(1, 1.0)]);
        assert_eq!(
            events.count(|e| matches!(e, DbEvent::WalReplayCompleted { series: 1, samples: 1, .. })),
            1
        );

        let mut app = head.appender();
        app.add(&ls(&[("a", "1")]), 2, 2.0).unwrap();
        app.commit().unwrap();
    }
}
