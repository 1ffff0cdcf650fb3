//! WAL record codec.
//!
//! Every record starts with a type byte:
//! - series: per entry an 8-byte big-endian ref, a uvarint label count and uvarint
//!   length-prefixed name/value strings;
//! - samples: an 8-byte ref and 8-byte time taken from the first sample, then per sample a
//!   varint ref delta, a varint time delta and the 8 raw value bytes;
//! - tombstones: per interval an 8-byte ref and varint bounds.
//!
//! An empty batch encodes to the type byte alone.

use crate::encoding::{put_be_u64, put_uvarint, put_uvarint_str, put_varint, Decbuf};
use crate::error::DbError;
use crate::labels::{Label, Labels};
use crate::tombstones::{Interval, Intervals};
use crate::types::{Timestamp, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Invalid = 255,
    Series = 1,
    Samples = 2,
    Tombstones = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefSeries {
    pub series_ref: u64,
    pub labels: Labels,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefSample {
    pub series_ref: u64,
    pub t: Timestamp,
    pub v: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stone {
    pub series_ref: u64,
    pub intervals: Intervals,
}

/// Type of an encoded record; `Invalid` for anything unknown.
pub fn record_type(rec: &[u8]) -> RecordType {
    match rec.first() {
        Some(1) => RecordType::Series,
        Some(2) => RecordType::Samples,
        Some(3) => RecordType::Tombstones,
        _ => RecordType::Invalid,
    }
}

/// Appends a series record to `buf`.
pub fn encode_series(series: &[RefSeries], buf: &mut Vec<u8>) {
    buf.push(RecordType::Series as u8);
    for s in series {
        put_be_u64(buf, s.series_ref);
        put_uvarint(buf, s.labels.len() as u64);
        for l in &s.labels {
            put_uvarint_str(buf, &l.name);
            put_uvarint_str(buf, &l.value);
        }
    }
}

/// Appends a samples record to `buf`.
pub fn encode_samples(samples: &[RefSample], buf: &mut Vec<u8>) {
    buf.push(RecordType::Samples as u8);
    let first = match samples.first() {
        Some(f) => *f,
        None => return,
    };
    put_be_u64(buf, first.series_ref);
    put_be_u64(buf, first.t as u64);
    for s in samples {
        put_varint(buf, s.series_ref.wrapping_sub(first.series_ref) as i64);
        put_varint(buf, s.t.wrapping_sub(first.t));
        put_be_u64(buf, s.v.to_bits());
    }
}

/// Appends a tombstones record to `buf`.
pub fn encode_tombstones(stones: &[Stone], buf: &mut Vec<u8>) {
    buf.push(RecordType::Tombstones as u8);
    for s in stones {
        for iv in &s.intervals {
            put_be_u64(buf, s.series_ref);
            put_varint(buf, iv.mint);
            put_varint(buf, iv.maxt);
        }
    }
}

fn expect_type(d: &mut Decbuf<'_>, want: RecordType) -> Result<(), DbError> {
    let got = d.byte()?;
    if got != want as u8 {
        return Err(DbError::Corruption {
            details: format!("invalid record type {}, expected {:?}", got, want),
        });
    }
    Ok(())
}

/// Decodes a series record, appending to `out`.
pub fn decode_series(rec: &[u8], out: &mut Vec<RefSeries>) -> Result<(), DbError> {
    let mut d = Decbuf::new(rec);
    expect_type(&mut d, RecordType::Series)?;
    while !d.is_empty() {
        let series_ref = d.be_u64()?;
        let n = d.uvarint()? as usize;
        let mut labels = Vec::with_capacity(n.min(64));
        for _ in 0..n {
            let name = d.uvarint_str()?;
            let value = d.uvarint_str()?;
            labels.push(Label { name, value });
        }
        out.push(RefSeries {
            series_ref,
            labels: Labels::from_sorted(labels),
        });
    }
    Ok(())
}

/// Decodes a samples record, appending to `out`.
pub fn decode_samples(rec: &[u8], out: &mut Vec<RefSample>) -> Result<(), DbError> {
    let mut d = Decbuf::new(rec);
    expect_type(&mut d, RecordType::Samples)?;
    if d.is_empty() {
        return Ok(());
    }
    let base_ref = d.be_u64()?;
    let base_time = d.be_u64()? as i64;
    while !d.is_empty() {
        let dref = d.varint()?;
        let dtime = d.varint()?;
        let v = f64::from_bits(d.be_u64()?);
        out.push(RefSample {
            series_ref: base_ref.wrapping_add(dref as u64),
            t: base_time.wrapping_add(dtime),
            v,
        });
    }
    Ok(())
}

/// Decodes a tombstones record, appending one stone per encoded interval.
pub fn decode_tombstones(rec: &[u8], out: &mut Vec<Stone>) -> Result<(), DbError> {
    let mut d = Decbuf::new(rec);
    expect_type(&mut d, RecordType::Tombstones)?;
    while !d.is_empty() {
        let series_ref = d.be_u64()?;
        let mint = d.varint()?;
        let maxt = d.varint()?;
        let mut intervals = Intervals::new();
        intervals.add(Interval::new(mint, maxt));
        out.push(Stone {
            series_ref,
            intervals,
        });
    }
    Ok(())
}
