//! WAL checkpoints: compacted snapshots of a WAL prefix, stored as `checkpoint.NNNNNN`
//! directories inside the WAL directory and written in the WAL segment format.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{DbError, ResultExt};
use crate::record::{
    decode_samples, decode_series, decode_tombstones, encode_samples, encode_series,
    encode_tombstones, record_type, RecordType, RefSample, RefSeries, Stone,
};
use crate::types::Timestamp;
use crate::wal::{segment_range, SegmentRef, Wal, WalOptions, WalReader};

pub const CHECKPOINT_PREFIX: &str = "checkpoint.";
const FLUSH_THRESHOLD: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    pub dropped_series: usize,
    pub dropped_samples: usize,
    pub dropped_tombstones: usize,
    pub total_series: usize,
    pub total_samples: usize,
    pub total_tombstones: usize,
}

pub fn checkpoint_dir(wal_dir: &Path, index: u64) -> PathBuf {
    wal_dir.join(format!("{}{:06}", CHECKPOINT_PREFIX, index))
}

fn parse_checkpoint(name: &str) -> Option<u64> {
    let rest = name.strip_prefix(CHECKPOINT_PREFIX)?;
    if rest.len() != 6 {
        return None;
    }
    rest.parse().ok()
}

fn list_checkpoints(dir: &Path) -> Result<Vec<(u64, PathBuf)>, DbError> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(idx) = entry.file_name().to_str().and_then(parse_checkpoint) {
            out.push((idx, entry.path()));
        }
    }
    out.sort_by_key(|(i, _)| *i);
    Ok(out)
}

/// The newest finished checkpoint in `wal_dir` with its index.
pub fn last_checkpoint(wal_dir: &Path) -> Result<Option<(PathBuf, u64)>, DbError> {
    Ok(list_checkpoints(wal_dir)?
        .pop()
        .map(|(idx, path)| (path, idx)))
}

/// Deletes every checkpoint with an index below `max_index`.
pub fn delete_checkpoints(wal_dir: &Path, max_index: u64) -> Result<(), DbError> {
    let mut first_err = None;
    for (idx, path) in list_checkpoints(wal_dir)? {
        if idx >= max_index {
            break;
        }
        if let Err(e) = fs::remove_dir_all(&path) {
            first_err.get_or_insert(DbError::Io(e));
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Compacts the last checkpoint plus segments `from..=to` into `checkpoint.<to>`, keeping only
/// series accepted by `keep`, their samples at or after `mint` and their tombstones that still
/// reach `mint`.
pub fn checkpoint(
    wal: &Wal,
    mut from: u64,
    to: u64,
    keep: impl Fn(u64) -> bool,
    mint: Timestamp,
) -> Result<CheckpointStats, DbError> {
    let mut stats = CheckpointStats::default();
    let wal_dir = wal.dir();

    let mut segs: Vec<SegmentRef> = Vec::new();
    if let Some((dir, idx)) = last_checkpoint(wal_dir).context("find last checkpoint")? {
        let last = idx + 1;
        if from > last {
            return Err(DbError::Internal(format!(
                "unexpected gap to last checkpoint. expected:{}, requested:{}",
                last, from
            )));
        }
        // Segments below the checkpoint are already part of it.
        from = last;
        segs.extend(segment_range(&dir, None, None)?);
    }
    segs.extend(segment_range(wal_dir, Some(from), Some(to))?);

    let cpdir = checkpoint_dir(wal_dir, to);
    let cpdir_tmp = wal_dir.join(format!("{}{:06}.tmp", CHECKPOINT_PREFIX, to));
    if cpdir_tmp.exists() {
        fs::remove_dir_all(&cpdir_tmp)?;
    }
    let res = write_checkpoint(&cpdir_tmp, segs, &keep, mint, &mut stats);
    if let Err(e) = res {
        let _ = fs::remove_dir_all(&cpdir_tmp);
        return Err(e);
    }
    if cpdir.exists() {
        fs::remove_dir_all(&cpdir)?;
    }
    fs::rename(&cpdir_tmp, &cpdir).context("rename checkpoint directory")?;
    fs::File::open(wal_dir)?.sync_all()?;
    Ok(stats)
}

fn write_checkpoint(
    tmp: &Path,
    segs: Vec<SegmentRef>,
    keep: &dyn Fn(u64) -> bool,
    mint: Timestamp,
    stats: &mut CheckpointStats,
) -> Result<(), DbError> {
    let cp = Wal::open(
        tmp,
        WalOptions {
            sync: false,
            ..WalOptions::default()
        },
    )?;
    let mut r = WalReader::new(segs);

    let mut series: Vec<RefSeries> = Vec::new();
    let mut samples: Vec<RefSample> = Vec::new();
    let mut stones: Vec<Stone> = Vec::new();
    // Records are batched into one buffer and flushed in ~1MB increments.
    let mut buf: Vec<u8> = Vec::with_capacity(FLUSH_THRESHOLD);
    let mut bounds: Vec<(usize, usize)> = Vec::new();

    // A corrupt segment cannot be repaired here: the head would not know which series are lost.
    while let Some(rec) = r.next_record().context("read segments")? {
        let start = buf.len();
        match record_type(rec) {
            RecordType::Series => {
                series.clear();
                decode_series(rec, &mut series)?;
                let total = series.len();
                series.retain(|s| keep(s.series_ref));
                stats.total_series += total;
                stats.dropped_series += total - series.len();
                if !series.is_empty() {
                    encode_series(&series, &mut buf);
                }
            }
            RecordType::Samples => {
                samples.clear();
                decode_samples(rec, &mut samples)?;
                let total = samples.len();
                samples.retain(|s| s.t >= mint && keep(s.series_ref));
                stats.total_samples += total;
                stats.dropped_samples += total - samples.len();
                if !samples.is_empty() {
                    encode_samples(&samples, &mut buf);
                }
            }
            RecordType::Tombstones => {
                stones.clear();
                decode_tombstones(rec, &mut stones)?;
                let total = stones.len();
                stones.retain(|s| keep(s.series_ref) && s.intervals.iter().any(|iv| iv.maxt >= mint));
                stats.total_tombstones += total;
                stats.dropped_tombstones += total - stones.len();
                if !stones.is_empty() {
                    encode_tombstones(&stones, &mut buf);
                }
            }
            RecordType::Invalid => {
                return Err(DbError::Corruption {
                    details: "invalid record type in checkpoint source".to_string(),
                });
            }
        }
        if buf.len() == start {
            continue;
        }
        bounds.push((start, buf.len()));
        if buf.len() > FLUSH_THRESHOLD {
            flush(&cp, &buf, &bounds)?;
            buf.clear();
            bounds.clear();
        }
    }
    flush(&cp, &buf, &bounds)?;
    cp.close().context("close checkpoint")
}

fn flush(cp: &Wal, buf: &[u8], bounds: &[(usize, usize)]) -> Result<(), DbError> {
    if bounds.is_empty() {
        return Ok(());
    }
    let recs: Vec<&[u8]> = bounds.iter().map(|&(s, e)| &buf[s..e]).collect();
    cp.log(&recs).context("flush records")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Labels;
    use crate::tombstones::Interval;
    use crate::wal::list_segments;
    use tempfile::tempdir;

    fn series_rec(refs: &[u64]) -> Vec<u8> {
        let s: Vec<RefSeries> = refs
            .iter()
            .map(|&r| RefSeries {
                series_ref: r,
                labels: Labels::from_pairs(&[("id", r.to_string())]).unwrap(),
            })
            .collect();
        let mut buf = Vec::new();
        encode_series(&s, &mut buf);
        buf
    }

    fn samples_rec(s: &[(u64, i64)]) -> Vec<u8> {
        let s: Vec<RefSample> = s
            .iter()
            .map(|&(r, t)| RefSample {
                series_ref: r,
                t,
                v: t as f64,
            })
            .collect();
        let mut buf = Vec::new();
        encode_samples(&s, &mut buf);
        buf
    }

    #[test]
    fn checkpoint_keeps_live_series_and_recent_samples() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), WalOptions::default()).unwrap();
        wal.log(&[series_rec(&[1, 2, 3]).as_slice()]).unwrap();
        wal.log(&[samples_rec(&[(1, 10), (2, 10), (3, 10)]).as_slice()]).unwrap();
        wal.next_segment().unwrap();
        wal.log(&[samples_rec(&[(1, 100), (2, 100), (3, 100)]).as_slice()]).unwrap();
        let stones = vec![
            Stone {
                series_ref: 1,
                intervals: [Interval::new(0, 5)].into_iter().collect(),
            },
            Stone {
                series_ref: 3,
                intervals: [Interval::new(0, 500)].into_iter().collect(),
            },
        ];
        let mut buf = Vec::new();
        encode_tombstones(&stones, &mut buf);
        wal.log(&[buf.as_slice()]).unwrap();
        wal.next_segment().unwrap();

        let stats = checkpoint(&wal, 0, 1, |r| r != 2, 50).unwrap();
        assert_eq!(stats.total_series, 3);
        assert_eq!(stats.dropped_series, 1);
        assert_eq!(stats.total_samples, 6);
        assert_eq!(stats.dropped_samples, 4);
        assert_eq!(stats.dropped_tombstones, 1);

        let (cp, idx) = last_checkpoint(dir.path()).unwrap().unwrap();
        assert_eq!(idx, 1);
        assert!(cp.ends_with("checkpoint.000001"));

        let mut r = WalReader::new(list_segments(&cp).unwrap());
        let mut got_series = Vec::new();
        let mut got_samples = Vec::new();
        let mut got_stones = Vec::new();
        while let Some(rec) = r.next_record().unwrap() {
            match record_type(rec) {
                RecordType::Series => decode_series(rec, &mut got_series).unwrap(),
                RecordType::Samples => decode_samples(rec, &mut got_samples).unwrap(),
                RecordType::Tombstones => decode_tombstones(rec, &mut got_stones).unwrap(),
                RecordType::Invalid => panic!("invalid record"),
            }
        }
        let refs: Vec<u64> = got_series.iter().map(|s| s.series_ref).collect();
        assert_eq!(refs, vec![1, 3]);
        let ts: Vec<(u64, i64)> = got_samples.iter().map(|s| (s.series_ref, s.t)).collect();
        assert_eq!(ts, vec![(1, 100), (3, 100)]);
        assert_eq!(got_stones.len(), 1);
        assert_eq!(got_stones[0].series_ref, 3);
    }

    #[test]
    fn later_checkpoint_folds_in_previous_and_old_ones_are_deleted() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), WalOptions::default()).unwrap();
        wal.log(&[series_rec(&[1]).as_slice()]).unwrap();
        wal.next_segment().unwrap();
        checkpoint(&wal, 0, 0, |_| true, 0).unwrap();
        wal.log(&[series_rec(&[2]).as_slice()]).unwrap();
        wal.next_segment().unwrap();
        checkpoint(&wal, 1, 1, |_| true, 0).unwrap();

        delete_checkpoints(dir.path(), 1).unwrap();
        let all = list_checkpoints(dir.path()).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, 1);

        let mut r = WalReader::new(list_segments(&all[0].1).unwrap());
        let mut got = Vec::new();
        while let Some(rec) = r.next_record().unwrap() {
            decode_series(rec, &mut got).unwrap();
        }
        let refs: Vec<u64> = got.iter().map(|s| s.series_ref).collect();
        assert_eq!(refs, vec![1, 2]);
    }
}
