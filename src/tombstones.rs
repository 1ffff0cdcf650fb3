//! Deleted time ranges per series, and the per-block tombstone file.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tempfile::NamedTempFile;

use crate::encoding::{crc32, put_be_u32, put_uvarint, put_varint, Decbuf};
use crate::error::DbError;
use crate::types::Timestamp;

pub const TOMBSTONE_FILENAME: &str = "tombstones";
pub const MAGIC_TOMBSTONE: u32 = 0x0130BA30;
pub const TOMBSTONE_FORMAT_V1: u8 = 1;

/// A closed time interval `[mint, maxt]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub mint: Timestamp,
    pub maxt: Timestamp,
}

impl Interval {
    pub fn new(mint: Timestamp, maxt: Timestamp) -> Self {
        Self { mint, maxt }
    }

    pub fn in_bounds(&self, t: Timestamp) -> bool {
        t >= self.mint && t <= self.maxt
    }

    /// Whether this interval is fully covered by one of `dranges`.
    pub fn is_subrange(&self, dranges: &Intervals) -> bool {
        dranges
            .iter()
            .any(|r| r.in_bounds(self.mint) && r.in_bounds(self.maxt))
    }
}

/// Sorted, non-overlapping intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Intervals(Vec<Interval>);

impl Intervals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `n`, merging it with every interval it overlaps or touches.
    pub fn add(&mut self, n: Interval) {
        let v = &mut self.0;
        let mut i = 0;
        while i < v.len() {
            let r = v[i];
            // Merge when overlapping or adjacent.
            if r.in_bounds(n.mint) || r.in_bounds(n.maxt) || n.in_bounds(r.mint) || adjacent(r, n) {
                let mut merged = Interval::new(r.mint.min(n.mint), r.maxt.max(n.maxt));
                let mut j = i + 1;
                while j < v.len() && (v[j].mint <= merged.maxt || adjacent(merged, v[j])) {
                    merged.maxt = merged.maxt.max(v[j].maxt);
                    j += 1;
                }
                v.splice(i..j, std::iter::once(merged));
                return;
            }
            if n.maxt < r.mint {
                v.insert(i, n);
                return;
            }
            i += 1;
        }
        v.push(n);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Interval> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<&Interval> {
        self.0.first()
    }

    pub fn last(&self) -> Option<&Interval> {
        self.0.last()
    }

    pub fn as_slice(&self) -> &[Interval] {
        &self.0
    }
}

fn adjacent(a: Interval, b: Interval) -> bool {
    a.maxt.checked_add(1) == Some(b.mint) || b.maxt.checked_add(1) == Some(a.mint)
}

impl FromIterator<Interval> for Intervals {
    fn from_iter<I: IntoIterator<Item = Interval>>(iter: I) -> Self {
        let mut out = Intervals::new();
        for iv in iter {
            out.add(iv);
        }
        out
    }
}

impl<'a> IntoIterator for &'a Intervals {
    type Item = &'a Interval;
    type IntoIter = std::slice::Iter<'a, Interval>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Read access to a tombstone set.
pub trait TombstoneReader: Send + Sync {
    /// Deleted intervals of a series, empty if there are none.
    fn get(&self, series_ref: u64) -> Result<Intervals, DbError>;

    /// Calls `f` for every series with tombstones.
    fn iter(&self, f: &mut dyn FnMut(u64, &Intervals) -> Result<(), DbError>) -> Result<(), DbError>;

    /// Total number of intervals.
    fn total(&self) -> Result<u64, DbError>;

    fn close(&self) -> Result<(), DbError> {
        Ok(())
    }
}

impl<T: TombstoneReader + ?Sized> TombstoneReader for Arc<T> {
    fn get(&self, series_ref: u64) -> Result<Intervals, DbError> {
        (**self).get(series_ref)
    }

    fn iter(&self, f: &mut dyn FnMut(u64, &Intervals) -> Result<(), DbError>) -> Result<(), DbError> {
        (**self).iter(f)
    }

    fn total(&self) -> Result<u64, DbError> {
        (**self).total()
    }

    fn close(&self) -> Result<(), DbError> {
        (**self).close()
    }
}

/// In-memory tombstones, safe for concurrent use.
#[derive(Debug, Default)]
pub struct MemTombstones {
    intervals: RwLock<HashMap<u64, Intervals>>,
}

impl MemTombstones {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_interval(&self, series_ref: u64, ivs: &[Interval]) -> Result<(), DbError> {
        let mut map = self.intervals.write()?;
        let entry = map.entry(series_ref).or_default();
        for iv in ivs {
            entry.add(*iv);
        }
        Ok(())
    }

    pub fn is_empty(&self) -> Result<bool, DbError> {
        Ok(self.intervals.read()?.is_empty())
    }
}

impl TombstoneReader for MemTombstones {
    fn get(&self, series_ref: u64) -> Result<Intervals, DbError> {
        Ok(self
            .intervals
            .read()?
            .get(&series_ref)
            .cloned()
            .unwrap_or_default())
    }

    fn iter(&self, f: &mut dyn FnMut(u64, &Intervals) -> Result<(), DbError>) -> Result<(), DbError> {
        let map = self.intervals.read()?;
        let mut refs: Vec<&u64> = map.keys().collect();
        refs.sort();
        for r in refs {
            f(*r, &map[r])?;
        }
        Ok(())
    }

    fn total(&self) -> Result<u64, DbError> {
        Ok(self.intervals.read()?.values().map(|v| v.len() as u64).sum())
    }
}

/// Atomically replaces `<dir>/tombstones` with the contents of `tr`.
pub fn write_tombstone_file(dir: &Path, tr: &dyn TombstoneReader) -> Result<u64, DbError> {
    let mut buf = Vec::with_capacity(64);
    put_be_u32(&mut buf, MAGIC_TOMBSTONE);
    buf.push(TOMBSTONE_FORMAT_V1);
    tr.iter(&mut |series_ref, ivs| {
        for iv in ivs {
            put_uvarint(&mut buf, series_ref);
            put_varint(&mut buf, iv.mint);
            put_varint(&mut buf, iv.maxt);
        }
        Ok(())
    })?;
    let sum = crc32(&buf);
    put_be_u32(&mut buf, sum);

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&buf)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(TOMBSTONE_FILENAME))
        .map_err(|e| DbError::Io(e.error))?;
    fs::File::open(dir)?.sync_all()?;
    Ok(buf.len() as u64)
}

/// Reads `<dir>/tombstones`. A missing file is an empty set.
pub fn read_tombstones(dir: &Path) -> Result<MemTombstones, DbError> {
    let path = dir.join(TOMBSTONE_FILENAME);
    let data = match fs::read(&path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(MemTombstones::new()),
        Err(e) => return Err(e.into()),
    };
    if data.len() < 5 + 4 {
        return Err(DbError::Corruption {
            details: format!("tombstones file {:?} too short: {} bytes", path, data.len()),
        });
    }
    let (body, tail) = data.split_at(data.len() - 4);
    let expected = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let actual = crc32(body);
    if expected != actual {
        return Err(DbError::ChecksumMismatch {
            path,
            expected,
            actual,
        });
    }

    let mut d = Decbuf::new(body);
    let magic = d.be_u32()?;
    if magic != MAGIC_TOMBSTONE {
        return Err(DbError::Corruption {
            details: format!("invalid tombstones magic {:#x}", magic),
        });
    }
    let version = d.byte()?;
    if version != TOMBSTONE_FORMAT_V1 {
        return Err(DbError::Corruption {
            details: format!("invalid tombstones format version {}", version),
        });
    }

    let stones = MemTombstones::new();
    while !d.is_empty() {
        let series_ref = d.uvarint()?;
        let mint = d.varint()?;
        let maxt = d.varint()?;
        stones.add_interval(series_ref, &[Interval::new(mint, maxt)])?;
    }
    Ok(stones)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn ivs(v: &[(i64, i64)]) -> Intervals {
        v.iter().map(|&(a, b)| Interval::new(a, b)).collect()
    }

    #[test]
    fn add_merges_overlapping_and_adjacent() {
        let mut i = ivs(&[(1, 2), (10, 20)]);
        i.add(Interval::new(3, 5));
        assert_eq!(i, ivs(&[(1, 5), (10, 20)]));
        i.add(Interval::new(6, 9));
        assert_eq!(i.as_slice(), &[Interval::new(1, 20)]);
        i.add(Interval::new(-10, -5));
        assert_eq!(i, ivs(&[(-10, -5), (1, 20)]));
        i.add(Interval::new(30, 40));
        i.add(Interval::new(-7, 35));
        assert_eq!(i.as_slice(), &[Interval::new(-10, 40)]);
    }

    #[test]
    fn subrange_checks_full_cover() {
        let d = ivs(&[(0, 10), (20, 30)]);
        assert!(Interval::new(2, 8).is_subrange(&d));
        assert!(!Interval::new(8, 22).is_subrange(&d));
    }

    #[test]
    fn file_round_trip_and_checksum() {
        let dir = tempdir().unwrap();
        let stones = MemTombstones::new();
        stones.add_interval(1, &[Interval::new(-5, 3)]).unwrap();
        stones.add_interval(7, &[Interval::new(10, 20), Interval::new(30, 40)]).unwrap();
        write_tombstone_file(dir.path(), &stones).unwrap();

        let back = read_tombstones(dir.path()).unwrap();
        assert_eq!(back.get(1).unwrap(), ivs(&[(-5, 3)]));
        assert_eq!(back.get(7).unwrap(), ivs(&[(10, 20), (30, 40)]));
        assert_eq!(back.total().unwrap(), 3);
        assert!(back.get(2).unwrap().is_empty());

        let path = dir.path().join(TOMBSTONE_FILENAME);
        let mut data = fs::read(&path).unwrap();
        data[6] ^= 0x01;
        fs::write(&path, data).unwrap();
        assert!(matches!(
            read_tombstones(dir.path()),
            Err(DbError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempdir().unwrap();
        assert!(read_tombstones(dir.path()).unwrap().is_empty().unwrap());
    }

    proptest! {
        #[test]
        fn added_intervals_stay_sorted_and_disjoint(
            raw in prop::collection::vec((-1000i64..1000, 0i64..50), 0..40)
        ) {
            let mut set = Intervals::new();
            for (a, len) in &raw {
                set.add(Interval::new(*a, a + len));
            }
            for w in set.as_slice().windows(2) {
                prop_assert!(w[0].maxt + 1 < w[1].mint);
            }
            for (a, len) in &raw {
                for t in [*a, a + len] {
                    prop_assert!(set.iter().any(|iv| iv.in_bounds(t)));
                }
            }
        }
    }
}
