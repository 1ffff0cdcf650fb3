use std::sync::{Arc, PoisonError};

use crate::error::{DbError, ResultExt};
use crate::labels::Labels;
use crate::record::{encode_samples, encode_series, RefSample, RefSeries};
use crate::telemetry::DbEvent;
use crate::types::{Timestamp, Value};

use super::{Head, MemSeries};

/// A batch of samples that becomes visible atomically on commit.
pub trait Appender {
    /// Adds a sample for `lset`, creating the series if needed. Returns the series reference
    /// usable with [`Appender::add_fast`].
    fn add(&mut self, lset: &Labels, t: Timestamp, v: Value) -> Result<u64, DbError>;

    /// Adds a sample to an already known series.
    fn add_fast(&mut self, series_ref: u64, t: Timestamp, v: Value) -> Result<(), DbError>;

    fn commit(&mut self) -> Result<(), DbError>;

    fn rollback(&mut self) -> Result<(), DbError>;
}

/// Appender writing into the head. Dropping it without commit rolls it back.
#[derive(Debug)]
pub struct HeadAppender {
    head: Arc<Head>,
    /// `None` until the head has a time range to validate against.
    min_valid_time: Option<Timestamp>,
    mint: Timestamp,
    maxt: Timestamp,

    series: Vec<RefSeries>,
    samples: Vec<RefSample>,
    sample_series: Vec<Arc<MemSeries>>,
    done: bool,
}

impl HeadAppender {
    pub(super) fn new(head: Arc<Head>) -> Self {
        let min_valid_time = head.initialized().then(|| head.appendable_min_valid_time());
        let samples = head.sample_pool.get();
        let sample_series = head.series_pool.get();
        Self {
            head,
            min_valid_time,
            mint: Timestamp::MAX,
            maxt: Timestamp::MIN,
            series: Vec::new(),
            samples,
            sample_series,
            done: false,
        }
    }

    fn log(&self) -> Result<(), DbError> {
        let wal = match &self.head.wal {
            Some(wal) => wal,
            None => return Ok(()),
        };
        let mut buf = self.head.bytes_pool.scoped();
        if !self.series.is_empty() {
            encode_series(&self.series, &mut buf);
            wal.log(&[buf.as_slice()])?;
            buf.clear();
        }
        if !self.samples.is_empty() {
            encode_samples(&self.samples, &mut buf);
            wal.log(&[buf.as_slice()])?;
        }
        Ok(())
    }

    fn release_buffers(&mut self) {
        self.head.sample_pool.put(std::mem::take(&mut self.samples));
        self.head.series_pool.put(std::mem::take(&mut self.sample_series));
        self.series.clear();
    }
}

impl Appender for HeadAppender {
    fn add(&mut self, lset: &Labels, t: Timestamp, v: Value) -> Result<u64, DbError> {
        let min_valid = match self.min_valid_time {
            Some(m) => m,
            None => {
                self.head.init_time(t);
                let m = self.head.appendable_min_valid_time();
                self.min_valid_time = Some(m);
                m
            }
        };
        if t < min_valid {
            return Err(DbError::OutOfBounds);
        }

        let (s, created) = self.head.get_or_create(lset.hash(), lset)?;
        if created {
            self.series.push(RefSeries {
                series_ref: s.series_ref,
                labels: lset.clone(),
            });
        }
        self.add_fast(s.series_ref, t, v)?;
        Ok(s.series_ref)
    }

    fn add_fast(&mut self, series_ref: u64, t: Timestamp, v: Value) -> Result<(), DbError> {
        let min_valid = self.min_valid_time.ok_or(DbError::NotFound)?;
        if t < min_valid {
            return Err(DbError::OutOfBounds);
        }
        let s = self
            .head
            .series
            .get_by_id(series_ref)?
            .ok_or(DbError::NotFound)
            .context("unknown series")?;
        {
            let mut st = s.state.lock()?;
            st.appendable(t, v)?;
            st.pending_commit = true;
        }

        self.mint = self.mint.min(t);
        self.maxt = self.maxt.max(t);
        self.samples.push(RefSample { series_ref, t, v });
        self.sample_series.push(s);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DbError> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        let mut res = self.log().context("write to WAL");
        let logged = res.is_ok();
        // Every series is visited so none keeps its pending flag, which would pin it against gc.
        for (s, rs) in self.sample_series.iter().zip(self.samples.iter()) {
            let (mut st, poisoned) = match s.state.lock() {
                Ok(st) => (st, false),
                Err(e) => (e.into_inner(), true),
            };
            if poisoned {
                res = res.and(Err(DbError::LockError(format!(
                    "state of series {} poisoned",
                    s.series_ref
                ))));
            } else if logged {
                // Samples that lost a race with another appender are dropped.
                if let Err(e) = st.append(rs.t, rs.v) {
                    res = res.and(Err(e).context("append committed sample"));
                }
            }
            st.pending_commit = false;
        }
        if logged {
            self.head.update_min_max_time(self.mint, self.maxt);
        }
        self.release_buffers();
        res
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        for s in &self.sample_series {
            s.state.lock().unwrap_or_else(PoisonError::into_inner).pending_commit = false;
        }
        self.samples.clear();
        // Created series exist in memory regardless and must be logged.
        let res = self.log();
        self.release_buffers();
        res
    }
}

impl Drop for HeadAppender {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(e) = self.rollback() {
            self.head.events.on_event(DbEvent::AppenderRollbackFailed {
                error: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::head::tests::ls;
    use crate::querier::{BlockQuerier, Querier};
    use crate::telemetry::noop_event_listener;
    use crate::labels::Matcher;

    fn head() -> Arc<Head> {
        Arc::new(Head::new(None, 1000, noop_event_listener()).unwrap())
    }

    fn read_all(head: &Arc<Head>) -> Vec<(i64, f64)> {
        let q = BlockQuerier::new(&head.range(i64::MIN, i64::MAX), i64::MIN, i64::MAX).unwrap();
        let mut out = Vec::new();
        for s in q.select(&[Matcher::regex("a", ".+").unwrap()]) {
            out.extend(s.unwrap().iter());
        }
        out
    }

    #[test]
    fn add_fast_before_first_add_is_not_found() {
        let h = head();
        let mut app = h.appender();
        assert!(matches!(app.add_fast(1, 10, 1.0), Err(DbError::NotFound)));
    }

    #[test]
    fn add_fast_unknown_ref() {
        let h = head();
        let mut app = h.appender();
        let r = app.add(&ls(&[("a", "1")]), 10, 1.0).unwrap();
        app.add_fast(r, 11, 1.0).unwrap();
        let err = app.add_fast(r + 100, 12, 1.0).unwrap_err();
        assert!(matches!(err.root(), DbError::NotFound));
    }

    #[test]
    fn boundary_is_half_a_chunk_range_behind_max_time() {
        let h = head();
        let mut app = h.appender();
        app.add(&ls(&[("a", "1")]), 2000, 1.0).unwrap();
        app.commit().unwrap();

        let mut app = h.appender();
        assert!(matches!(app.add(&ls(&[("a", "2")]), 1499, 1.0), Err(DbError::OutOfBounds)));
        app.add(&ls(&[("a", "2")]), 1500, 1.0).unwrap();
        app.commit().unwrap();
    }

    #[test]
    fn ordering_and_duplicates() {
        let h = head();
        let mut app = h.appender();
        let r = app.add(&ls(&[("a", "1")]), 100, 1.0).unwrap();
        app.commit().unwrap();

        let mut app = h.appender();
        assert!(matches!(app.add_fast(r, 99, 1.0), Err(DbError::OutOfOrderSample)));
        assert!(matches!(app.add_fast(r, 100, 2.0), Err(DbError::AmendSample)));
        app.add_fast(r, 100, 1.0).unwrap();
        app.add_fast(r, 101, 5.0).unwrap();
        app.commit().unwrap();

        assert_eq!(read_all(&h), vec![(100, 1.0), (101, 5.0)]);
    }

    #[test]
    fn rollback_discards_samples_but_keeps_series() {
        let h = head();
        let mut app = h.appender();
        app.add(&ls(&[("a", "1")]), 100, 1.0).unwrap();
        app.rollback().unwrap();
        assert_eq!(h.num_series(), 1);
        assert!(read_all(&h).is_empty());

        {
            let mut app = h.appender();
            app.add(&ls(&[("a", "1")]), 150, 1.0).unwrap();
        }
        assert!(read_all(&h).is_empty());
        let s = h.series.get_by_id(1).unwrap().unwrap();
        assert!(!s.state.lock().unwrap().pending_commit);
    }

    #[test]
    fn failed_commit_still_releases_every_series() {
        let h = head();
        let mut app = h.appender();
        app.add(&ls(&[("a", "1")]), 100, 1.0).unwrap();
        app.add(&ls(&[("a", "2")]), 100, 2.0).unwrap();

        let first = h.series.get_by_id(1).unwrap().unwrap();
        let held = Arc::clone(&first);
        std::thread::spawn(move || {
            let _st = held.state.lock().unwrap();
            panic!("series state poisoned on purpose");
        })
        .join()
        .unwrap_err();

        let err = app.commit().unwrap_err();
        assert!(matches!(err.root(), DbError::LockError(_)));
        first.state.clear_poison();
        assert!(!first.state.lock().unwrap().pending_commit);
        // Series after the failing one are still committed.
        assert_eq!(read_all(&h), vec![(100, 2.0)]);
        assert_eq!(h.sample_pool.idle(), 1);

        // With no chunks and no pending commit the first series is collectable.
        h.gc().unwrap();
        assert_eq!(h.num_series(), 1);
    }

    #[test]
    fn buffers_return_to_pools() {
        let h = head();
        let mut app = h.appender();
        app.add(&ls(&[("a", "1")]), 100, 1.0).unwrap();
        app.commit().unwrap();
        drop(app);
        assert_eq!(h.sample_pool.idle(), 1);
        assert_eq!(h.series_pool.idle(), 1);
    }
}
