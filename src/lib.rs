#![doc = include_str!("../README.md")]
// Declare modules
pub mod block;
pub mod checkpoint;
pub mod chunkenc;
pub mod chunks;
pub mod compact;
pub mod db;
pub mod encoding;
pub mod error;
pub mod head;
pub mod index;
pub mod labels;
pub mod pool;
pub mod querier;
pub mod record;
pub mod telemetry;
pub mod tombstones;
pub mod types;
pub mod ulid;
pub mod wal;

/// An opened, persisted block.
pub use crate::block::{Block, BlockMeta};
/// Planning and merging of blocks.
pub use crate::compact::{Compactor, LeveledCompactor};
/// Main entry point: the database and its configuration.
pub use crate::db::{Db, DbAppender, DbConfig};
/// Error type for database operations.
pub use crate::error::DbError;
/// Transactional sample ingestion.
pub use crate::head::Appender;
/// Series identity and selection.
pub use crate::labels::{Label, Labels, Matcher};
/// Read access to series data.
pub use crate::querier::{Querier, Series};
/// Structured event hook for observability.
pub use crate::telemetry::{DbEvent, DbEventListener, TracingEventListener};
/// Type alias for a timestamp (milliseconds since epoch).
pub use crate::types::Timestamp;
/// Type alias for a sample value (f64).
pub use crate::types::Value;
/// Block identifier.
pub use crate::ulid::Ulid;
