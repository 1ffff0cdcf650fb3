#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use strix::chunkenc::ChunkPool;
use strix::compact::{Compactor, LeveledCompactor};
use strix::head::{Appender, Head};
use strix::telemetry::noop_event_listener;
use strix::types::Sample;
use strix::{DbConfig, Labels};

pub fn ls(pairs: &[(&str, &str)]) -> Labels {
    Labels::from_pairs(pairs).unwrap()
}

/// Small ranges, no retention and a loop that only runs when signalled.
pub fn test_config() -> DbConfig {
    DbConfig {
        block_ranges: vec![100, 300, 900],
        retention_duration: 0,
        wal_sync: false,
        compaction_interval: Duration::from_secs(3600),
        ..DbConfig::default()
    }
}

/// Writes a block covering `[mint, maxt)` into `dir` and returns its directory.
pub fn write_block(dir: &Path, series: &[(Labels, Vec<Sample>)], mint: i64, maxt: i64) -> PathBuf {
    let head = Arc::new(Head::new(None, i64::MAX / 4, noop_event_listener()).unwrap());
    let mut app = head.appender();
    for (lset, samples) in series {
        for &(t, v) in samples {
            app.add(lset, t, v).unwrap();
        }
    }
    app.commit().unwrap();

    let compactor = LeveledCompactor::new(vec![100], Arc::new(ChunkPool::new()), noop_event_listener()).unwrap();
    let ulid = compactor
        .write(dir, &head.range(mint, maxt - 1), mint, maxt, None)
        .unwrap()
        .expect("block has samples");
    dir.join(ulid.to_string())
}

pub fn samples(range: std::ops::Range<i64>) -> Vec<Sample> {
    range.map(|t| (t, t as f64)).collect()
}
