use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::Timestamp;

/// Custom error type for the storage engine.
#[derive(Error, Debug)]
pub enum DbError {
    /// The sample timestamp is below the lowest time the head still accepts.
    #[error("out of bounds")]
    OutOfBounds,

    /// The sample timestamp is older than the newest sample of its series.
    #[error("out of order sample")]
    OutOfOrderSample,

    /// A sample with the newest timestamp of its series but a different value.
    #[error("amending sample")]
    AmendSample,

    #[error("not found")]
    NotFound,

    /// The block is shutting down and no longer hands out readers.
    #[error("block is closing")]
    Closing,

    #[error("WAL corruption in {dir:?} segment {segment} at offset {offset}: {details}")]
    WalCorruption {
        dir: PathBuf,
        segment: u64,
        offset: u64,
        details: String,
    },

    #[error("Corruption detected: {details}")]
    Corruption { details: String },

    #[error("Checksum mismatch in {path:?}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },

    #[error(
        "found chunk with minTime: {chunk_min} maxTime: {chunk_max} outside of compacted minTime: {block_min} maxTime: {block_max}"
    )]
    ChunkOutOfBlockRange {
        chunk_min: Timestamp,
        chunk_max: Timestamp,
        block_min: Timestamp,
        block_max: Timestamp,
    },

    #[error("block time ranges overlap: [{prev_min}, {prev_max}) and [{next_min}, {next_max})")]
    OverlappingBlocks {
        prev_min: Timestamp,
        prev_max: Timestamp,
        next_min: Timestamp,
        next_max: Timestamp,
    },

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Invalid labels: {0}")]
    InvalidLabels(String),

    #[error("Invalid time range: start={start}, end={end}")]
    InvalidTimeRange { start: Timestamp, end: Timestamp },

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Background task error: {0}")]
    BackgroundTaskError(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<DbError>,
    },

    #[error(transparent)]
    Multi(#[from] MultiError),
}

impl DbError {
    /// Strips any `Context` wrappers and returns the underlying error.
    pub fn root(&self) -> &DbError {
        let mut e = self;
        while let DbError::Context { source, .. } = e {
            e = source;
        }
        e
    }

    /// Wraps the error with a short description of the operation that failed.
    pub fn context(self, context: impl Into<String>) -> DbError {
        DbError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DbError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for DbError {
    fn from(err: bincode::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

/// Adds `context` to `Result`s, mirroring [`DbError::context`].
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T, DbError>;

    fn with_context<F, S>(self, f: F) -> Result<T, DbError>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E: Into<DbError>> ResultExt<T> for Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T, DbError> {
        self.map_err(|e| Into::<DbError>::into(e).context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T, DbError>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| Into::<DbError>::into(e).context(f()))
    }
}

/// A collection of errors gathered while tearing down several resources.
#[derive(Debug, Default)]
pub struct MultiError(Vec<DbError>);

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the error of `res`, if any.
    pub fn add<T>(&mut self, res: Result<T, DbError>) {
        if let Err(e) = res {
            self.0.push(e);
        }
    }

    pub fn push(&mut self, err: DbError) {
        self.0.push(err);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn errors(&self) -> &[DbError] {
        &self.0
    }

    /// `Ok` when nothing was recorded, the error itself when exactly one was, the whole set otherwise.
    pub fn into_result(mut self) -> Result<(), DbError> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(DbError::Multi(self)),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors: ", self.0.len())?;
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_unwraps_nested_context() {
        let err = DbError::OutOfBounds.context("add sample").context("commit");
        assert!(matches!(err.root(), DbError::OutOfBounds));
        assert_eq!(err.to_string(), "commit: add sample: out of bounds");
    }

    #[test]
    fn multi_error_collapses_single_entry() {
        let mut merr = MultiError::new();
        merr.add::<()>(Ok(()));
        assert!(merr.is_empty());
        merr.add::<()>(Err(DbError::NotFound));
        assert!(matches!(merr.into_result(), Err(DbError::NotFound)));

        let mut merr = MultiError::new();
        merr.push(DbError::Closing);
        merr.push(DbError::NotFound);
        let err = merr.into_result().unwrap_err();
        assert!(matches!(err, DbError::Multi(ref m) if m.len() == 2));
        assert_eq!(err.to_string(), "2 errors: block is closing; not found");
    }
}
