//! Read path: selecting series by label matchers and iterating their samples over a time range.

use std::cmp::Ordering;
use std::iter::Peekable;

use crate::block::BlockReader;
use crate::chunkenc::Chunk;
use crate::chunks::{ChunkMeta, ChunkReader};
use crate::error::{DbError, MultiError, ResultExt};
use crate::index::{intersect, merge, without, IndexReader, Postings, ALL_POSTINGS_KEY};
use crate::labels::{Labels, Matcher};
use crate::tombstones::{Interval, Intervals, TombstoneReader};
use crate::types::{Sample, Timestamp};

/// A series with its samples in time order.
pub trait Series {
    fn labels(&self) -> &Labels;

    fn iter(&self) -> Box<dyn Iterator<Item = Sample> + '_>;
}

/// Series sorted by label set.
pub type SeriesSet<'a> = Box<dyn Iterator<Item = Result<Box<dyn Series>, DbError>> + 'a>;

/// Read access to the data of one or more blocks over a fixed time range.
pub trait Querier {
    /// Series matching all `matchers`, sorted by label set.
    fn select(&self, matchers: &[Matcher]) -> SeriesSet<'_>;

    /// Sorted values of label `name`.
    fn label_values(&self, name: &str) -> Result<Vec<String>, DbError>;

    /// Sorted label names.
    fn label_names(&self) -> Result<Vec<String>, DbError>;

    /// Releases the underlying readers. Selecting afterwards fails with `Closing`.
    fn close(&mut self) -> Result<(), DbError>;
}

/// Resolves `matchers` to the sorted references of all series matching every one of them.
pub fn postings_for_matchers(ir: &dyn IndexReader, matchers: &[Matcher]) -> Result<Vec<u64>, DbError> {
    let mut its = Vec::with_capacity(matchers.len());
    for m in matchers {
        its.push(postings_for_matcher(ir, m)?);
    }
    ir.sorted_postings(intersect(its))
}

fn postings_for_matcher(ir: &dyn IndexReader, m: &Matcher) -> Result<Postings, DbError> {
    // Series without the label have the empty value, so they match too.
    if m.matches("") {
        return postings_for_unset_label_matcher(ir, m);
    }
    if let Matcher::Equal { name, value } = m {
        return ir.postings(name, value);
    }
    let mut its = Vec::new();
    for v in ir.label_values(m.name())? {
        if m.matches(&v) {
            its.push(ir.postings(m.name(), &v)?);
        }
    }
    Ok(merge(its))
}

fn postings_for_unset_label_matcher(ir: &dyn IndexReader, m: &Matcher) -> Result<Postings, DbError> {
    let mut rit = Vec::new();
    for v in ir.label_values(m.name())? {
        if !m.matches(&v) {
            rit.push(ir.postings(m.name(), &v)?);
        }
    }
    let all = ir.postings(ALL_POSTINGS_KEY.0, ALL_POSTINGS_KEY.1)?;
    Ok(without(all, &merge(rit)))
}

/// Drops samples inside any of the deleted intervals. Both the samples and the intervals must be
/// sorted by time.
#[derive(Debug)]
pub struct DeletedIterator<'a, I> {
    it: I,
    intervals: &'a [Interval],
}

impl<'a, I> DeletedIterator<'a, I> {
    pub fn new(it: I, intervals: &'a [Interval]) -> Self {
        Self { it, intervals }
    }
}

impl<I: Iterator<Item = Sample>> Iterator for DeletedIterator<'_, I> {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        'samples: loop {
            let (t, v) = self.it.next()?;
            while let Some(iv) = self.intervals.first() {
                if t > iv.maxt {
                    // Passed this interval for good.
                    self.intervals = &self.intervals[1..];
                    continue;
                }
                if iv.in_bounds(t) {
                    continue 'samples;
                }
                break;
            }
            return Some((t, v));
        }
    }
}

/// A series read from one block, with its chunks loaded.
#[derive(Debug)]
struct BlockSeries {
    labels: Labels,
    chunks: Vec<Chunk>,
    intervals: Intervals,
    mint: Timestamp,
    maxt: Timestamp,
}

impl Series for BlockSeries {
    fn labels(&self) -> &Labels {
        &self.labels
    }

    fn iter(&self) -> Box<dyn Iterator<Item = Sample> + '_> {
        let (mint, maxt) = (self.mint, self.maxt);
        let it = self
            .chunks
            .iter()
            .flat_map(|c| c.iter())
            .skip_while(move |&(t, _)| t < mint)
            .take_while(move |&(t, _)| t <= maxt);
        if self.intervals.is_empty() {
            Box::new(it)
        } else {
            Box::new(DeletedIterator::new(it, self.intervals.as_slice()))
        }
    }
}

/// Series with the same labels from several sources, iterated one after the other.
struct ChainedSeries {
    series: Vec<Box<dyn Series>>,
}

impl Series for ChainedSeries {
    fn labels(&self) -> &Labels {
        self.series[0].labels()
    }

    fn iter(&self) -> Box<dyn Iterator<Item = Sample> + '_> {
        Box::new(self.series.iter().flat_map(|s| s.iter()))
    }
}

struct BlockReaders {
    index: Box<dyn IndexReader>,
    chunks: Box<dyn ChunkReader>,
    tombstones: Box<dyn TombstoneReader>,
}

/// Querier over a single block or a head range.
pub struct BlockQuerier {
    readers: Option<BlockReaders>,
    mint: Timestamp,
    maxt: Timestamp,
}

impl BlockQuerier {
    pub fn new(b: &dyn BlockReader, mint: Timestamp, maxt: Timestamp) -> Result<Self, DbError> {
        let index = b.index().context("open index reader")?;
        let chunks = b.chunks().context("open chunk reader")?;
        let tombstones = b.tombstones().context("open tombstone reader")?;
        Ok(Self {
            readers: Some(BlockReaders {
                index,
                chunks,
                tombstones,
            }),
            mint,
            maxt,
        })
    }

    fn readers(&self) -> Result<&BlockReaders, DbError> {
        self.readers.as_ref().ok_or(DbError::Closing)
    }

    /// Builds the series for `r`, or `None` if nothing of it is left in range.
    fn load_series(&self, rd: &BlockReaders, r: u64, chks: &mut Vec<ChunkMeta>) -> Result<Option<Box<dyn Series>>, DbError> {
        let mut labels = Labels::default();
        rd.index.series(r, &mut labels, chks)?;
        let intervals = rd.tombstones.get(r)?;

        let mut chunks = Vec::with_capacity(chks.len());
        for c in chks.iter() {
            if c.max_time < self.mint {
                continue;
            }
            if c.min_time > self.maxt {
                break;
            }
            if Interval::new(c.min_time, c.max_time).is_subrange(&intervals) {
                continue;
            }
            match rd.chunks.chunk(c.chunk_ref) {
                Ok(chk) => chunks.push(chk),
                // Head chunks may be truncated away concurrently.
                Err(DbError::NotFound) => continue,
                Err(e) => return Err(e.context(format!("read chunk {:#x}", c.chunk_ref))),
            }
        }
        if chunks.is_empty() {
            return Ok(None);
        }
        Ok(Some(Box::new(BlockSeries {
            labels,
            chunks,
            intervals,
            mint: self.mint,
            maxt: self.maxt,
        })))
    }
}

impl Querier for BlockQuerier {
    fn select(&self, matchers: &[Matcher]) -> SeriesSet<'_> {
        let (rd, refs) = match self
            .readers()
            .and_then(|rd| Ok((rd, postings_for_matchers(rd.index.as_ref(), matchers)?)))
        {
            Ok(v) => v,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        let mut chks = Vec::new();
        Box::new(
            refs.into_iter()
                .filter_map(move |r| self.load_series(rd, r, &mut chks).transpose()),
        )
    }

    fn label_values(&self, name: &str) -> Result<Vec<String>, DbError> {
        self.readers()?.index.label_values(name)
    }

    fn label_names(&self) -> Result<Vec<String>, DbError> {
        self.readers()?.index.label_names()
    }

    fn close(&mut self) -> Result<(), DbError> {
        let rd = match self.readers.take() {
            Some(rd) => rd,
            None => return Ok(()),
        };
        let mut merr = MultiError::new();
        merr.add(rd.index.close());
        merr.add(rd.chunks.close());
        merr.add(rd.tombstones.close());
        merr.into_result()
    }
}

/// Merges two series sets sorted by labels. Series present in both are chained, `a` first.
pub struct MergedSeriesSet<'a> {
    a: Peekable<SeriesSet<'a>>,
    b: Peekable<SeriesSet<'a>>,
}

impl<'a> MergedSeriesSet<'a> {
    pub fn new(a: SeriesSet<'a>, b: SeriesSet<'a>) -> Self {
        Self {
            a: a.peekable(),
            b: b.peekable(),
        }
    }
}

impl Iterator for MergedSeriesSet<'_> {
    type Item = Result<Box<dyn Series>, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        let ord = match (self.a.peek(), self.b.peek()) {
            (None, None) => return None,
            (Some(_), None) | (Some(Err(_)), _) => Ordering::Less,
            (None, Some(_)) | (_, Some(Err(_))) => Ordering::Greater,
            (Some(Ok(a)), Some(Ok(b))) => a.labels().cmp(b.labels()),
        };
        match ord {
            Ordering::Less => self.a.next(),
            Ordering::Greater => self.b.next(),
            Ordering::Equal => match (self.a.next()?, self.b.next()?) {
                (Ok(a), Ok(b)) => Some(Ok(Box::new(ChainedSeries { series: vec![a, b] }))),
                (Err(e), _) | (_, Err(e)) => Some(Err(e)),
            },
        }
    }
}

/// Merges series sets by splitting the list in halves recursively.
pub fn merge_series_sets(mut sets: Vec<SeriesSet<'_>>) -> SeriesSet<'_> {
    match sets.len() {
        0 => Box::new(std::iter::empty()),
        1 => sets.remove(0),
        n => {
            let right = sets.split_off(n / 2);
            Box::new(MergedSeriesSet::new(merge_series_sets(sets), merge_series_sets(right)))
        }
    }
}

/// Sorted union of two sorted, deduplicated lists.
fn merge_strings(a: Vec<String>, b: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(a.len().max(b.len()));
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();
    loop {
        let ord = match (a.peek(), b.peek()) {
            (None, None) => return out,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(y),
        };
        match ord {
            Ordering::Less => out.extend(a.next()),
            Ordering::Greater => out.extend(b.next()),
            Ordering::Equal => {
                out.extend(a.next());
                b.next();
            }
        }
    }
}

/// Querier over several queriers ordered by time, e.g. every block overlapping a range plus the
/// head.
pub struct MergedQuerier {
    queriers: Vec<Box<dyn Querier>>,
}

impl MergedQuerier {
    pub fn new(queriers: Vec<Box<dyn Querier>>) -> Self {
        Self { queriers }
    }

    fn strings<F>(qs: &[Box<dyn Querier>], f: &F) -> Result<Vec<String>, DbError>
    where
        F: Fn(&dyn Querier) -> Result<Vec<String>, DbError>,
    {
        match qs.len() {
            0 => Ok(Vec::new()),
            1 => f(qs[0].as_ref()),
            n => {
                let (l, r) = qs.split_at(n / 2);
                Ok(merge_strings(Self::strings(l, f)?, Self::strings(r, f)?))
            }
        }
    }
}

impl Querier for MergedQuerier {
    fn select(&self, matchers: &[Matcher]) -> SeriesSet<'_> {
        merge_series_sets(self.queriers.iter().map(|q| q.select(matchers)).collect())
    }

    fn label_values(&self, name: &str) -> Result<Vec<String>, DbError> {
        Self::strings(&self.queriers, &|q| q.label_values(name))
    }

    fn label_names(&self) -> Result<Vec<String>, DbError> {
        Self::strings(&self.queriers, &|q| q.label_names())
    }

    fn close(&mut self) -> Result<(), DbError> {
        let mut merr = MultiError::new();
        for q in self.queriers.iter_mut() {
            merr.add(q.close());
        }
        merr.into_result()
    }
}
