//! Segmented write-ahead log.
//!
//! A WAL directory holds numbered segment files (`00000000`, `00000001`, ...). Each segment
//! starts with an 8-byte magic and a little-endian u32 version, followed by records framed as
//! `len: u32 LE | crc32(payload): u32 LE | payload`. A record never spans two segments; writing
//! always continues in a fresh segment after open or repair.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::encoding::{crc32, put_le_u32};
use crate::error::DbError;

pub const WAL_MAGIC: &[u8; 8] = b"STXWAL01";
pub const WAL_VERSION: u32 = 1;
pub const SEGMENT_HEADER_LEN: u64 = 12;
const RECORD_HEADER_LEN: u64 = 8;
pub const DEFAULT_SEGMENT_SIZE: u64 = 128 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct WalOptions {
    /// Segments are cut once the next record would grow them beyond this size.
    pub segment_size: u64,
    /// fsync after every `log` call.
    pub sync: bool,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            sync: true,
        }
    }
}

/// A segment file within a WAL-formatted directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRef {
    pub dir: PathBuf,
    pub index: u64,
}

impl SegmentRef {
    pub fn path(&self) -> PathBuf {
        segment_name(&self.dir, self.index)
    }
}

pub fn segment_name(dir: &Path, i: u64) -> PathBuf {
    dir.join(format!("{:08}", i))
}

/// Lists segment files in ascending order. Non-numeric entries are ignored.
pub fn list_segments(dir: &Path) -> Result<Vec<SegmentRef>, DbError> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.len() != 8 {
            continue;
        }
        if let Ok(index) = name.parse::<u64>() {
            out.push(SegmentRef {
                dir: dir.to_path_buf(),
                index,
            });
        }
    }
    out.sort_by_key(|s| s.index);
    for w in out.windows(2) {
        if w[1].index != w[0].index + 1 {
            return Err(DbError::Corruption {
                details: format!("segments in {:?} are not sequential: {} -> {}", dir, w[0].index, w[1].index),
            });
        }
    }
    Ok(out)
}

/// Segments of `dir` with index in `[first, last]`; `None` leaves that side open.
pub fn segment_range(dir: &Path, first: Option<u64>, last: Option<u64>) -> Result<Vec<SegmentRef>, DbError> {
    Ok(list_segments(dir)?
        .into_iter()
        .filter(|s| first.map_or(true, |f| s.index >= f) && last.map_or(true, |l| s.index <= l))
        .collect())
}

#[derive(Debug)]
struct WalWriter {
    file: Option<BufWriter<File>>,
    index: u64,
    written: u64,
    closed: bool,
}

#[derive(Debug)]
pub struct Wal {
    dir: PathBuf,
    opts: WalOptions,
    inner: Mutex<WalWriter>,
}

fn create_segment(dir: &Path, index: u64) -> Result<BufWriter<File>, DbError> {
    let f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(segment_name(dir, index))?;
    let mut w = BufWriter::with_capacity(32 * 1024, f);
    let mut header = Vec::with_capacity(SEGMENT_HEADER_LEN as usize);
    header.extend_from_slice(WAL_MAGIC);
    put_le_u32(&mut header, WAL_VERSION);
    w.write_all(&header)?;
    w.flush()?;
    w.get_ref().sync_all()?;
    File::open(dir)?.sync_all()?;
    Ok(w)
}

/// Length of a record as stored in its frame.
fn record_len(n: usize) -> Result<u32, DbError> {
    u32::try_from(n).map_err(|_| DbError::Internal(format!("WAL record of {} bytes is too large", n)))
}

impl Wal {
    /// Opens the WAL in `dir`, creating it if needed. Writing starts in a new segment after the
    /// last existing one.
    pub fn open(dir: impl AsRef<Path>, opts: WalOptions) -> Result<Self, DbError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let next = match list_segments(&dir)?.last() {
            Some(s) => s.index + 1,
            None => 0,
        };
        let file = create_segment(&dir, next)?;
        Ok(Self {
            dir,
            opts,
            inner: Mutex::new(WalWriter {
                file: Some(file),
                index: next,
                written: SEGMENT_HEADER_LEN,
                closed: false,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends records in order. They are flushed (and fsynced if configured) before returning.
    pub fn log(&self, recs: &[&[u8]]) -> Result<(), DbError> {
        let mut w = self.inner.lock()?;
        if w.closed {
            return Err(DbError::Internal("WAL is closed".to_string()));
        }
        let mut frame = Vec::with_capacity(RECORD_HEADER_LEN as usize);
        // Nothing is written if any record is too large.
        for rec in recs {
            record_len(rec.len())?;
        }
        for rec in recs {
            let need = RECORD_HEADER_LEN + rec.len() as u64;
            if w.written > SEGMENT_HEADER_LEN && w.written + need > self.opts.segment_size {
                self.cut(&mut w)?;
            }
            frame.clear();
            put_le_u32(&mut frame, record_len(rec.len())?);
            put_le_u32(&mut frame, crc32(rec));
            let file = w
                .file
                .as_mut()
                .ok_or_else(|| DbError::Internal("WAL has no active segment".to_string()))?;
            file.write_all(&frame)?;
            file.write_all(rec)?;
            w.written += need;
        }
        if let Some(file) = w.file.as_mut() {
            file.flush()?;
            if self.opts.sync {
                file.get_ref().sync_data()?;
            }
        }
        Ok(())
    }

    fn cut(&self, w: &mut WalWriter) -> Result<(), DbError> {
        if let Some(mut f) = w.file.take() {
            f.flush()?;
            f.get_ref().sync_all()?;
        }
        let next = w.index + 1;
        w.file = Some(create_segment(&self.dir, next)?);
        w.index = next;
        w.written = SEGMENT_HEADER_LEN;
        Ok(())
    }

    /// Closes the active segment and starts the next one. Returns the new segment index.
    pub fn next_segment(&self) -> Result<u64, DbError> {
        let mut w = self.inner.lock()?;
        self.cut(&mut w)?;
        Ok(w.index)
    }

    /// First and last segment index on disk.
    pub fn segments(&self) -> Result<(u64, u64), DbError> {
        let segs = list_segments(&self.dir)?;
        match (segs.first(), segs.last()) {
            (Some(f), Some(l)) => Ok((f.index, l.index)),
            _ => Err(DbError::Internal(format!("no WAL segments in {:?}", self.dir))),
        }
    }

    /// Removes every segment with an index below `i`.
    pub fn truncate(&self, i: u64) -> Result<(), DbError> {
        for s in list_segments(&self.dir)? {
            if s.index >= i {
                break;
            }
            fs::remove_file(s.path())?;
        }
        Ok(())
    }

    /// Recovers from a corruption reported while reading this WAL: segments after the corrupt
    /// one are deleted, the corrupt segment is cut back to its last valid record, and writing
    /// continues in a fresh segment.
    pub fn repair(&self, err: &DbError) -> Result<(), DbError> {
        let (segment, offset) = match err.root() {
            DbError::WalCorruption {
                dir,
                segment,
                offset,
                ..
            } if dir == &self.dir => (*segment, *offset),
            other => {
                return Err(DbError::Internal(format!("cannot repair WAL from error: {}", other)));
            }
        };

        let mut w = self.inner.lock()?;
        // The active segment may be among the deleted ones.
        if let Some(mut f) = w.file.take() {
            f.flush()?;
        }
        for s in list_segments(&self.dir)? {
            if s.index > segment {
                fs::remove_file(s.path())?;
            }
        }

        let path = segment_name(&self.dir, segment);
        if offset < SEGMENT_HEADER_LEN {
            drop(create_segment(&self.dir, segment)?);
        } else {
            let f = OpenOptions::new().write(true).open(&path)?;
            f.set_len(offset)?;
            f.sync_all()?;
        }

        w.file = Some(create_segment(&self.dir, segment + 1)?);
        w.index = segment + 1;
        w.written = SEGMENT_HEADER_LEN;
        Ok(())
    }

    pub fn close(&self) -> Result<(), DbError> {
        let mut w = self.inner.lock()?;
        if w.closed {
            return Ok(());
        }
        w.closed = true;
        if let Some(mut f) = w.file.take() {
            f.flush()?;
            f.get_ref().sync_all()?;
        }
        Ok(())
    }
}

/// Sequential reader over a list of segments, possibly from several directories.
#[derive(Debug)]
pub struct WalReader {
    segs: Vec<SegmentRef>,
    cur: usize,
    data: Vec<u8>,
    off: usize,
    rec_off: usize,
    loaded: bool,
}

impl WalReader {
    pub fn new(segs: Vec<SegmentRef>) -> Self {
        Self {
            segs,
            cur: 0,
            data: Vec::new(),
            off: 0,
            rec_off: 0,
            loaded: false,
        }
    }

    /// Segment index of the last returned record.
    pub fn segment(&self) -> Option<u64> {
        self.segs.get(self.cur).map(|s| s.index)
    }

    /// Byte offset of the last returned record within its segment.
    pub fn offset(&self) -> usize {
        self.rec_off
    }

    fn corruption(&self, offset: usize, details: impl Into<String>) -> DbError {
        let seg = &self.segs[self.cur];
        DbError::WalCorruption {
            dir: seg.dir.clone(),
            segment: seg.index,
            offset: offset as u64,
            details: details.into(),
        }
    }

    fn load(&mut self) -> Result<(), DbError> {
        self.data = fs::read(self.segs[self.cur].path())?;
        self.loaded = true;
        self.off = 0;
        if self.data.is_empty() {
            // Crashed before the header was written.
            return Ok(());
        }
        if (self.data.len() as u64) < SEGMENT_HEADER_LEN || &self.data[..8] != WAL_MAGIC {
            return Err(self.corruption(0, "invalid segment header"));
        }
        let version = u32::from_le_bytes([self.data[8], self.data[9], self.data[10], self.data[11]]);
        if version != WAL_VERSION {
            return Err(self.corruption(0, format!("unsupported segment version {}", version)));
        }
        self.off = SEGMENT_HEADER_LEN as usize;
        Ok(())
    }

    /// Next record, or `None` once every segment is consumed.
    pub fn next_record(&mut self) -> Result<Option<&[u8]>, DbError> {
        loop {
            if self.cur >= self.segs.len() {
                return Ok(None);
            }
            if !self.loaded {
                self.load()?;
            }
            if self.off >= self.data.len() {
                self.cur += 1;
                self.loaded = false;
                continue;
            }
            break;
        }

        let start = self.off;
        let rest = self.data.len() - start;
        if (rest as u64) < RECORD_HEADER_LEN {
            return Err(self.corruption(start, "torn record header"));
        }
        let d = &self.data[start..];
        let len = u32::from_le_bytes([d[0], d[1], d[2], d[3]]) as usize;
        let expected = u32::from_le_bytes([d[4], d[5], d[6], d[7]]);
        if len == 0 {
            return Err(self.corruption(start, "zero-length record"));
        }
        let end = start + RECORD_HEADER_LEN as usize + len;
        if end > self.data.len() {
            return Err(self.corruption(
                start,
                format!("unexpected end of segment: record of {} bytes, {} left", len, rest - 8),
            ));
        }
        let payload_start = start + RECORD_HEADER_LEN as usize;
        let actual = crc32(&self.data[payload_start..end]);
        if actual != expected {
            return Err(self.corruption(
                start,
                format!("record checksum mismatch: expected {:#010x}, got {:#010x}", expected, actual),
            ));
        }
        self.rec_off = start;
        self.off = end;
        Ok(Some(&self.data[payload_start..end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn read_all(dir: &Path) -> Result<Vec<Vec<u8>>, DbError> {
        let mut r = WalReader::new(list_segments(dir)?);
        let mut out = Vec::new();
        while let Some(rec) = r.next_record()? {
            out.push(rec.to_vec());
        }
        Ok(out)
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn record_length_must_fit_the_frame() {
        assert_eq!(record_len(5).unwrap(), 5);
        assert_eq!(record_len(u32::MAX as usize).unwrap(), u32::MAX);
        assert!(matches!(record_len(u32::MAX as usize + 1), Err(DbError::Internal(_))));
    }

    #[test]
    fn records_span_segments_in_order() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(
            dir.path(),
            WalOptions {
                segment_size: 64,
                sync: false,
            },
        )
        .unwrap();
        let recs: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; 10 + i as usize]).collect();
        for r in &recs {
            wal.log(&[r.as_slice()]).unwrap();
        }
        let (first, last) = wal.segments().unwrap();
        assert_eq!(first, 0);
        assert!(last > 3);
        assert_eq!(read_all(dir.path()).unwrap(), recs);
    }

    #[test]
    fn reopen_starts_a_new_segment() {
        let dir = tempdir().unwrap();
        {
            let wal = Wal::open(dir.path(), WalOptions::default()).unwrap();
            wal.log(&[b"a".as_slice()]).unwrap();
            wal.close().unwrap();
        }
        let wal = Wal::open(dir.path(), WalOptions::default()).unwrap();
        assert_eq!(wal.segments().unwrap(), (0, 1));
        wal.log(&[b"b".as_slice()]).unwrap();
        assert_eq!(read_all(dir.path()).unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn torn_tail_is_reported_and_repaired() {
        let dir = tempdir().unwrap();
        {
            let wal = Wal::open(dir.path(), WalOptions::default()).unwrap();
            wal.log(&[b"first".as_slice(), b"second".as_slice()]).unwrap();
            wal.close().unwrap();
        }
        // Simulate a torn write at the tail of segment 0.
        let path = segment_name(dir.path(), 0);
        let len = fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(len - 3).unwrap();

        let wal = Wal::open(dir.path(), WalOptions::default()).unwrap();
        let err = read_all(dir.path()).unwrap_err();
        match &err {
            DbError::WalCorruption { segment, offset, .. } => {
                assert_eq!(*segment, 0);
                assert_eq!(*offset, SEGMENT_HEADER_LEN + 8 + 5);
            }
            other => panic!("unexpected error {other:?}"),
        }

        wal.repair(&err).unwrap();
        assert_eq!(read_all(dir.path()).unwrap(), vec![b"first".to_vec()]);
        wal.log(&[b"third".as_slice()]).unwrap();
        assert_eq!(
            read_all(dir.path()).unwrap(),
            vec![b"first".to_vec(), b"third".to_vec()]
        );
        assert_eq!(wal.segments().unwrap(), (0, 1));
    }

    #[test]
    fn truncate_drops_older_segments() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), WalOptions::default()).unwrap();
        for _ in 0..3 {
            wal.log(&[b"x".as_slice()]).unwrap();
            wal.next_segment().unwrap();
        }
        assert_eq!(wal.segments().unwrap(), (0, 3));
        wal.truncate(2).unwrap();
        assert_eq!(wal.segments().unwrap(), (2, 3));
        let segs = segment_range(dir.path(), Some(3), None).unwrap();
        assert_eq!(segs.len(), 1);
    }

    #[test]
    fn repair_rejects_foreign_errors() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), WalOptions::default()).unwrap();
        assert!(wal.repair(&DbError::NotFound).is_err());
    }
}
