use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::types::Timestamp;

/// Structured, in-process event hook for observability.
///
/// This crate is a library; emitting logs directly (e.g. `println!`) is not acceptable for
/// production. Instead, callers provide an implementation through
/// [`DbConfig::event_listener`](crate::db::DbConfig) that forwards these events to `tracing`,
/// metrics or custom sinks. [`TracingEventListener`] covers the common case.
pub trait DbEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: DbEvent);
}

/// Structured events emitted by the engine.
#[derive(Debug, Clone)]
pub enum DbEvent {
    CompactionLoopStarted,
    CompactionLoopStopping,
    CompactionLoopPanicked,
    CompactionFailed { error: String, backoff: Duration },

    HeadPersisted { ulid: String, min_time: Timestamp, max_time: Timestamp },
    BlocksCompacted { ulid: String, sources: usize, duration: Duration },
    BlocksCompactionFailed { dirs: Vec<PathBuf>, error: String },
    BlockRemoved { path: PathBuf },
    BlockRemovalFailed { path: PathBuf, error: String },
    IndexVersionRepaired { block: PathBuf },

    WalReplayCompleted { series: u64, samples: u64, duration: Duration },
    WalUnknownSeriesRefs { count: u64 },
    WalRepaired { segment: u64, offset: u64, error: String },
    WalTruncateFailed { error: String },

    CheckpointCreated { from: u64, to: u64, dropped_series: usize, dropped_samples: usize },
    CheckpointFailed { error: String },
    CheckpointDeleteFailed { error: String },

    HeadGarbageCollected { series_removed: usize, chunks_removed: usize, duration: Duration },
    AppenderRollbackFailed { error: String },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl DbEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: DbEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn DbEventListener> {
    Arc::new(NoopEventListener)
}

/// Forwards every event to `tracing` with structured fields. Failures are logged at `warn` or
/// `error`, lifecycle progress at `info`, routine maintenance at `debug`.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl DbEventListener for TracingEventListener {
    fn on_event(&self, event: DbEvent) {
        match event {
            DbEvent::CompactionLoopStarted => tracing::debug!("compaction loop started"),
            DbEvent::CompactionLoopStopping => tracing::debug!("compaction loop stopping"),
            DbEvent::CompactionLoopPanicked => tracing::error!("compaction loop panicked"),
            DbEvent::CompactionFailed { error, backoff } => {
                tracing::error!(%error, backoff_ms = backoff.as_millis() as u64, "compaction failed")
            }
            DbEvent::HeadPersisted { ulid, min_time, max_time } => {
                tracing::info!(%ulid, min_time, max_time, "head persisted as block")
            }
            DbEvent::BlocksCompacted { ulid, sources, duration } => tracing::info!(
                %ulid,
                sources,
                duration_ms = duration.as_millis() as u64,
                "compacted blocks"
            ),
            DbEvent::BlocksCompactionFailed { dirs, error } => {
                tracing::error!(?dirs, %error, "block compaction failed")
            }
            DbEvent::BlockRemoved { path } => tracing::info!(?path, "removed block"),
            DbEvent::BlockRemovalFailed { path, error } => {
                tracing::warn!(?path, %error, "removing block failed")
            }
            DbEvent::IndexVersionRepaired { block } => {
                tracing::info!(?block, "repaired index version")
            }
            DbEvent::WalReplayCompleted { series, samples, duration } => tracing::info!(
                series,
                samples,
                duration_ms = duration.as_millis() as u64,
                "WAL replay completed"
            ),
            DbEvent::WalUnknownSeriesRefs { count } => {
                tracing::warn!(count, "unknown series references in WAL")
            }
            DbEvent::WalRepaired { segment, offset, error } => {
                tracing::warn!(segment, offset, %error, "repaired corrupted WAL")
            }
            DbEvent::WalTruncateFailed { error } => {
                tracing::error!(%error, "truncating WAL segments failed")
            }
            DbEvent::CheckpointCreated {
                from,
                to,
                dropped_series,
                dropped_samples,
            } => tracing::debug!(from, to, dropped_series, dropped_samples, "WAL checkpoint created"),
            DbEvent::CheckpointFailed { error } => tracing::error!(%error, "WAL checkpoint failed"),
            DbEvent::CheckpointDeleteFailed { error } => {
                tracing::error!(%error, "deleting old checkpoints failed")
            }
            DbEvent::HeadGarbageCollected {
                series_removed,
                chunks_removed,
                duration,
            } => tracing::debug!(
                series_removed,
                chunks_removed,
                duration_ms = duration.as_millis() as u64,
                "head GC completed"
            ),
            DbEvent::AppenderRollbackFailed { error } => {
                tracing::error!(%error, "implicit appender rollback failed")
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records every event for later assertions.
    #[derive(Debug, Default)]
    pub struct RecordingListener {
        pub events: Mutex<Vec<DbEvent>>,
    }

    impl DbEventListener for RecordingListener {
        fn on_event(&self, event: DbEvent) {
            if let Ok(mut ev) = self.events.lock() {
                ev.push(event);
            }
        }
    }

    impl RecordingListener {
        pub fn count(&self, pred: impl Fn(&DbEvent) -> bool) -> usize {
            self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
        }
    }
}
