//! Series index: postings lists, the in-memory postings used by the head, and the on-disk
//! index file of a block.
//!
//! Index file layout: 4-byte big-endian magic, one format version byte, three padding bytes,
//! an 8-byte little-endian body length, the `bincode` body and a big-endian CRC32 of the body.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};

use crate::chunks::{ChunkMeta, ChunkRef};
use crate::encoding::{crc32, put_be_u32, put_le_u64};
use crate::error::DbError;
use crate::labels::{Label, Labels};
use crate::types::Timestamp;

pub const INDEX_FILENAME: &str = "index";
pub const MAGIC_INDEX: u32 = 0xBAAAD700;
pub const INDEX_FORMAT_V2: u8 = 2;
/// Offset of the format version byte.
pub const INDEX_VERSION_OFFSET: u64 = 4;
const HEADER_LEN: usize = 16;

/// A sorted set of series references.
pub type Postings = RoaringTreemap;

/// Name and value under which every series is listed.
pub const ALL_POSTINGS_KEY: (&str, &str) = ("", "");

pub fn intersect(mut its: Vec<Postings>) -> Postings {
    let Some(mut acc) = its.pop() else {
        return Postings::new();
    };
    for p in &its {
        acc &= p;
    }
    acc
}

pub fn merge(its: Vec<Postings>) -> Postings {
    let mut acc = Postings::new();
    for p in &its {
        acc |= p;
    }
    acc
}

/// `full` minus every reference in `drop`.
pub fn without(mut full: Postings, drop: &Postings) -> Postings {
    full -= drop;
    full
}

/// Read access to a series index.
pub trait IndexReader: Send + Sync {
    /// All label names and values in the index.
    fn symbols(&self) -> Result<BTreeSet<String>, DbError>;

    /// Sorted values of a label.
    fn label_values(&self, name: &str) -> Result<Vec<String>, DbError>;

    /// Sorted label names.
    fn label_names(&self) -> Result<Vec<String>, DbError>;

    fn postings(&self, name: &str, value: &str) -> Result<Postings, DbError>;

    /// The given references ordered by their series' label sets.
    fn sorted_postings(&self, p: Postings) -> Result<Vec<u64>, DbError>;

    /// Fills `lset` and `chks` for a series; `NotFound` if it does not exist.
    fn series(&self, series_ref: u64, lset: &mut Labels, chks: &mut Vec<ChunkMeta>) -> Result<(), DbError>;

    fn symbol_table_size(&self) -> u64;

    fn close(&self) -> Result<(), DbError> {
        Ok(())
    }
}

impl<T: IndexReader + ?Sized> IndexReader for Arc<T> {
    fn symbols(&self) -> Result<BTreeSet<String>, DbError> {
        (**self).symbols()
    }
    fn label_values(&self, name: &str) -> Result<Vec<String>, DbError> {
        (**self).label_values(name)
    }
    fn label_names(&self) -> Result<Vec<String>, DbError> {
        (**self).label_names()
    }
    fn postings(&self, name: &str, value: &str) -> Result<Postings, DbError> {
        (**self).postings(name, value)
    }
    fn sorted_postings(&self, p: Postings) -> Result<Vec<u64>, DbError> {
        (**self).sorted_postings(p)
    }
    fn series(&self, series_ref: u64, lset: &mut Labels, chks: &mut Vec<ChunkMeta>) -> Result<(), DbError> {
        (**self).series(series_ref, lset, chks)
    }
    fn symbol_table_size(&self) -> u64 {
        (**self).symbol_table_size()
    }
    fn close(&self) -> Result<(), DbError> {
        (**self).close()
    }
}

/// Builds an index file. Stages must be written in order: symbols, series, label indices,
/// postings.
pub trait IndexWriter {
    fn add_symbols(&mut self, symbols: &BTreeSet<String>) -> Result<(), DbError>;

    /// Series must be added in label-set order with increasing references.
    fn add_series(&mut self, series_ref: u64, lset: &Labels, chunks: &[ChunkMeta]) -> Result<(), DbError>;

    fn write_label_index(&mut self, names: &[String], values: &[String]) -> Result<(), DbError>;

    fn write_postings(&mut self, name: &str, value: &str, refs: &Postings) -> Result<(), DbError>;

    fn close(&mut self) -> Result<(), DbError>;
}

/// Postings of live series, keyed by label name and value.
#[derive(Debug, Default)]
pub struct MemPostings {
    m: RwLock<HashMap<String, HashMap<String, Postings>>>,
}

impl MemPostings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: u64, lset: &Labels) -> Result<(), DbError> {
        let mut m = self.m.write()?;
        for l in lset {
            m.entry(l.name.clone())
                .or_default()
                .entry(l.value.clone())
                .or_default()
                .insert(id);
        }
        let (n, v) = ALL_POSTINGS_KEY;
        m.entry(n.to_string()).or_default().entry(v.to_string()).or_default().insert(id);
        Ok(())
    }

    /// Removes the given references from every list, dropping lists that become empty.
    pub fn delete(&self, deleted: &Postings) -> Result<(), DbError> {
        if deleted.is_empty() {
            return Ok(());
        }
        let mut m = self.m.write()?;
        for values in m.values_mut() {
            for p in values.values_mut() {
                *p -= deleted;
            }
            values.retain(|_, p| !p.is_empty());
        }
        m.retain(|_, values| !values.is_empty());
        Ok(())
    }

    pub fn get(&self, name: &str, value: &str) -> Result<Postings, DbError> {
        Ok(self
            .m
            .read()?
            .get(name)
            .and_then(|values| values.get(value))
            .cloned()
            .unwrap_or_default())
    }

    /// Sorted values of a label.
    pub fn label_values(&self, name: &str) -> Result<Vec<String>, DbError> {
        let mut values: Vec<String> = self
            .m
            .read()?
            .get(name)
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default();
        values.sort();
        Ok(values)
    }

    /// Sorted label names, without the all-postings key.
    pub fn label_names(&self) -> Result<Vec<String>, DbError> {
        let mut names: Vec<String> = self
            .m
            .read()?
            .keys()
            .filter(|n| !n.is_empty())
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    /// Label name/value pairs in sorted order.
    pub fn sorted_keys(&self) -> Result<Vec<Label>, DbError> {
        let m = self.m.read()?;
        let mut keys: Vec<Label> = m
            .iter()
            .flat_map(|(n, values)| values.keys().map(move |v| Label::new(n.clone(), v.clone())))
            .collect();
        keys.sort();
        Ok(keys)
    }

    pub fn iter(&self, f: &mut dyn FnMut(&str, &str, &Postings)) -> Result<(), DbError> {
        let m = self.m.read()?;
        for (n, values) in m.iter() {
            for (v, p) in values {
                f(n, v, p);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ChunkEntry {
    chunk_ref: ChunkRef,
    min_time: Timestamp,
    max_time: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SeriesEntry {
    series_ref: u64,
    labels: Labels,
    chunks: Vec<ChunkEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PostingsEntry {
    name: String,
    value: String,
    refs: Vec<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IndexBody {
    symbols: Vec<String>,
    series: Vec<SeriesEntry>,
    label_indices: Vec<(Vec<String>, Vec<String>)>,
    postings: Vec<PostingsEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Start,
    Symbols,
    Series,
    LabelIndex,
    Postings,
    Done,
}

/// Writes a block's `index` file on `close`.
#[derive(Debug)]
pub struct BlockIndexWriter {
    path: PathBuf,
    stage: Stage,
    body: IndexBody,
    symbols: BTreeSet<String>,
    last_series: Option<(u64, Labels)>,
}

impl BlockIndexWriter {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            stage: Stage::Start,
            body: IndexBody::default(),
            symbols: BTreeSet::new(),
            last_series: None,
        })
    }

    fn ensure_stage(&mut self, s: Stage) -> Result<(), DbError> {
        if self.stage > s {
            return Err(DbError::Internal(format!(
                "invalid index write stage {:?} after {:?}",
                s, self.stage
            )));
        }
        self.stage = s;
        Ok(())
    }
}

impl IndexWriter for BlockIndexWriter {
    fn add_symbols(&mut self, symbols: &BTreeSet<String>) -> Result<(), DbError> {
        self.ensure_stage(Stage::Symbols)?;
        self.symbols = symbols.clone();
        self.body.symbols = symbols.iter().cloned().collect();
        Ok(())
    }

    fn add_series(&mut self, series_ref: u64, lset: &Labels, chunks: &[ChunkMeta]) -> Result<(), DbError> {
        self.ensure_stage(Stage::Series)?;
        if let Some((last_ref, last_lset)) = &self.last_series {
            if series_ref <= *last_ref || lset <= last_lset {
                return Err(DbError::Internal(format!(
                    "out-of-order series added with label set {}",
                    lset
                )));
            }
        }
        for l in lset {
            if !self.symbols.contains(&l.name) || !self.symbols.contains(&l.value) {
                return Err(DbError::Internal(format!("symbol entry for {:?} does not exist", l)));
            }
        }
        self.body.series.push(SeriesEntry {
            series_ref,
            labels: lset.clone(),
            chunks: chunks
                .iter()
                .map(|c| ChunkEntry {
                    chunk_ref: c.chunk_ref,
                    min_time: c.min_time,
                    max_time: c.max_time,
                })
                .collect(),
        });
        self.last_series = Some((series_ref, lset.clone()));
        Ok(())
    }

    fn write_label_index(&mut self, names: &[String], values: &[String]) -> Result<(), DbError> {
        self.ensure_stage(Stage::LabelIndex)?;
        let mut values = values.to_vec();
        values.sort();
        values.dedup();
        self.body.label_indices.push((names.to_vec(), values));
        Ok(())
    }

    fn write_postings(&mut self, name: &str, value: &str, refs: &Postings) -> Result<(), DbError> {
        self.ensure_stage(Stage::Postings)?;
        self.body.postings.push(PostingsEntry {
            name: name.to_string(),
            value: value.to_string(),
            refs: refs.iter().collect(),
        });
        Ok(())
    }

    fn close(&mut self) -> Result<(), DbError> {
        if self.stage == Stage::Done {
            return Ok(());
        }
        self.stage = Stage::Done;
        let body = bincode::serialize(&self.body)?;
        let mut out = Vec::with_capacity(HEADER_LEN + body.len() + 4);
        put_be_u32(&mut out, MAGIC_INDEX);
        out.push(INDEX_FORMAT_V2);
        out.extend_from_slice(&[0, 0, 0]);
        put_le_u64(&mut out, body.len() as u64);
        out.extend_from_slice(&body);
        put_be_u32(&mut out, crc32(&body));

        let mut f = File::create(&self.path)?;
        f.write_all(&out)?;
        f.sync_all()?;
        Ok(())
    }
}

/// Reader for a block's `index` file. The whole index is decoded on open.
#[derive(Debug)]
pub struct BlockIndexReader {
    symbols: BTreeSet<String>,
    series: Vec<SeriesEntry>,
    label_values: HashMap<String, Vec<String>>,
    postings: HashMap<String, HashMap<String, Postings>>,
    symbol_table_size: u64,
    size: u64,
}

impl BlockIndexReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        if data.len() < HEADER_LEN + 4 {
            return Err(DbError::Corruption {
                details: format!("index file {:?} too short: {} bytes", path, data.len()),
            });
        }
        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if magic != MAGIC_INDEX {
            return Err(DbError::Corruption {
                details: format!("invalid index magic number {:#x}", magic),
            });
        }
        let version = data[INDEX_VERSION_OFFSET as usize];
        if version != INDEX_FORMAT_V2 {
            return Err(DbError::Corruption {
                details: format!("unknown index file version {}", version),
            });
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&data[8..16]);
        let body_len = u64::from_le_bytes(len_bytes);
        let body_len = usize::try_from(body_len)
            .ok()
            .filter(|n| n.checked_add(HEADER_LEN + 4) == Some(data.len()))
            .ok_or_else(|| DbError::Corruption {
                details: format!("index body length {} does not match file size {}", body_len, data.len()),
            })?;
        let body = &data[HEADER_LEN..HEADER_LEN + body_len];
        let tail = &data[HEADER_LEN + body_len..];
        let expected = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let actual = crc32(body);
        if expected != actual {
            return Err(DbError::ChecksumMismatch {
                path: path.to_path_buf(),
                expected,
                actual,
            });
        }
        let body: IndexBody = bincode::deserialize(body)?;

        let mut label_values = HashMap::new();
        for (names, values) in body.label_indices {
            if let [name] = names.as_slice() {
                label_values.insert(name.clone(), values);
            }
        }
        let mut postings: HashMap<String, HashMap<String, Postings>> = HashMap::new();
        for p in body.postings {
            let list = Postings::from_sorted_iter(p.refs).map_err(|e| DbError::Corruption {
                details: format!("unsorted postings for {}={:?}: {}", p.name, p.value, e),
            })?;
            postings.entry(p.name).or_default().insert(p.value, list);
        }
        let symbol_table_size = body.symbols.iter().map(|s| s.len() as u64).sum();
        Ok(Self {
            symbols: body.symbols.into_iter().collect(),
            series: body.series,
            label_values,
            postings,
            symbol_table_size,
            size: data.len() as u64,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl IndexReader for BlockIndexReader {
    fn symbols(&self) -> Result<BTreeSet<String>, DbError> {
        Ok(self.symbols.clone())
    }

    fn label_values(&self, name: &str) -> Result<Vec<String>, DbError> {
        Ok(self.label_values.get(name).cloned().unwrap_or_default())
    }

    fn label_names(&self) -> Result<Vec<String>, DbError> {
        let mut names: Vec<String> = self
            .label_values
            .keys()
            .filter(|n| !n.is_empty())
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    fn postings(&self, name: &str, value: &str) -> Result<Postings, DbError> {
        Ok(self
            .postings
            .get(name)
            .and_then(|values| values.get(value))
            .cloned()
            .unwrap_or_default())
    }

    fn sorted_postings(&self, p: Postings) -> Result<Vec<u64>, DbError> {
        // Series are written in label order with increasing references.
        Ok(p.iter().collect())
    }

    fn series(&self, series_ref: u64, lset: &mut Labels, chks: &mut Vec<ChunkMeta>) -> Result<(), DbError> {
        let i = self
            .series
            .binary_search_by_key(&series_ref, |s| s.series_ref)
            .map_err(|_| DbError::NotFound)?;
        let s = &self.series[i];
        *lset = s.labels.clone();
        chks.clear();
        chks.extend(s.chunks.iter().map(|c| ChunkMeta {
            chunk_ref: c.chunk_ref,
            min_time: c.min_time,
            max_time: c.max_time,
            chunk: None,
        }));
        Ok(())
    }

    fn symbol_table_size(&self) -> u64 {
        self.symbol_table_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ls(pairs: &[(&str, &str)]) -> Labels {
        Labels::from_pairs(pairs).unwrap()
    }

    fn postings(refs: &[u64]) -> Postings {
        refs.iter().copied().collect()
    }

    #[test]
    fn set_operations() {
        let a = postings(&[1, 2, 3, 5]);
        let b = postings(&[2, 3, 4]);
        assert_eq!(intersect(vec![a.clone(), b.clone()]), postings(&[2, 3]));
        assert_eq!(merge(vec![a.clone(), b.clone()]), postings(&[1, 2, 3, 4, 5]));
        assert_eq!(without(a, &b), postings(&[1, 5]));
        assert!(intersect(vec![]).is_empty());
    }

    #[test]
    fn mem_postings_add_delete() {
        let p = MemPostings::new();
        p.add(1, &ls(&[("a", "1"), ("b", "x")])).unwrap();
        p.add(2, &ls(&[("a", "1")])).unwrap();
        p.add(3, &ls(&[("a", "2")])).unwrap();
        assert_eq!(p.get("a", "1").unwrap(), postings(&[1, 2]));
        assert_eq!(p.get("", "").unwrap(), postings(&[1, 2, 3]));

        p.delete(&postings(&[1, 3])).unwrap();
        assert_eq!(p.get("a", "1").unwrap(), postings(&[2]));
        assert!(p.get("b", "x").unwrap().is_empty());
        let keys: Vec<(String, String)> = p
            .sorted_keys()
            .unwrap()
            .into_iter()
            .map(|l| (l.name, l.value))
            .collect();
        assert_eq!(keys, vec![("".into(), "".into()), ("a".into(), "1".into())]);
    }

    fn write_sample_index(path: &Path) {
        let mut w = BlockIndexWriter::new(path).unwrap();
        let s1 = ls(&[("job", "api"), ("zone", "a")]);
        let s2 = ls(&[("job", "web")]);
        let syms: BTreeSet<String> = ["job", "api", "zone", "a", "web"].iter().map(|s| s.to_string()).collect();
        w.add_symbols(&syms).unwrap();
        let chk = ChunkMeta {
            chunk_ref: 42,
            min_time: 0,
            max_time: 9,
            chunk: None,
        };
        w.add_series(0, &s1, &[chk.clone()]).unwrap();
        w.add_series(1, &s2, &[]).unwrap();
        w.write_label_index(&["job".to_string()], &["web".to_string(), "api".to_string()]).unwrap();
        w.write_label_index(&["zone".to_string()], &["a".to_string()]).unwrap();
        w.write_label_index(&["".to_string()], &["".to_string()]).unwrap();
        w.write_postings("", "", &postings(&[0, 1])).unwrap();
        w.write_postings("job", "api", &postings(&[0])).unwrap();
        w.write_postings("job", "web", &postings(&[1])).unwrap();
        w.write_postings("zone", "a", &postings(&[0])).unwrap();
        w.close().unwrap();
    }

    #[test]
    fn index_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(INDEX_FILENAME);
        write_sample_index(&path);

        let r = BlockIndexReader::open(&path).unwrap();
        assert_eq!(r.label_values("job").unwrap(), vec!["api", "web"]);
        assert_eq!(r.label_names().unwrap(), vec!["job", "zone"]);
        assert_eq!(r.postings("job", "api").unwrap(), postings(&[0]));
        assert!(r.postings("job", "nope").unwrap().is_empty());

        let mut lset = Labels::default();
        let mut chks = Vec::new();
        r.series(0, &mut lset, &mut chks).unwrap();
        assert_eq!(lset, ls(&[("job", "api"), ("zone", "a")]));
        assert_eq!(chks.len(), 1);
        assert_eq!(chks[0].chunk_ref, 42);
        assert!(matches!(r.series(7, &mut lset, &mut chks), Err(DbError::NotFound)));
    }

    #[test]
    fn writer_enforces_order() {
        let dir = tempdir().unwrap();
        let mut w = BlockIndexWriter::new(dir.path().join(INDEX_FILENAME)).unwrap();
        let syms: BTreeSet<String> = ["a", "1", "2"].iter().map(|s| s.to_string()).collect();
        w.add_symbols(&syms).unwrap();
        w.add_series(0, &ls(&[("a", "2")]), &[]).unwrap();
        assert!(w.add_series(1, &ls(&[("a", "1")]), &[]).is_err());
        w.write_postings("a", "2", &postings(&[0])).unwrap();
        assert!(w.add_symbols(&syms).is_err());
    }

    #[test]
    fn version_byte_and_checksum_are_checked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(INDEX_FILENAME);
        write_sample_index(&path);

        let mut data = fs::read(&path).unwrap();
        data[INDEX_VERSION_OFFSET as usize] = 1;
        fs::write(&path, &data).unwrap();
        assert!(matches!(BlockIndexReader::open(&path), Err(DbError::Corruption { .. })));

        data[INDEX_VERSION_OFFSET as usize] = INDEX_FORMAT_V2;
        let mut huge = data.clone();
        huge[8..16].copy_from_slice(&u64::MAX.to_le_bytes());
        fs::write(&path, &huge).unwrap();
        assert!(matches!(BlockIndexReader::open(&path), Err(DbError::Corruption { .. })));

        let mid = data.len() / 2;
        data[mid] ^= 0xff;
        fs::write(&path, &data).unwrap();
        assert!(matches!(BlockIndexReader::open(&path), Err(DbError::ChecksumMismatch { .. })));
    }
}
