//! Block identifiers: 128-bit ULIDs, lexicographically sortable by creation time.
//!
//! A thin wrapper over the `ulid` crate that adds the crate's error type and the nil id used
//! for views that are not backed by a persisted block.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ulid(ulid::Ulid);

impl Ulid {
    /// A fresh id stamped with the current time.
    pub fn new() -> Self {
        Ulid(ulid::Ulid::new())
    }

    pub fn with_time(ms: u64) -> Self {
        Ulid(ulid::Ulid::from_parts(ms, rand::random()))
    }

    pub const fn nil() -> Self {
        Ulid(ulid::Ulid(0))
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for Ulid {
    fn default() -> Self {
        Self::nil()
    }
}

impl fmt::Display for Ulid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for Ulid {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s)
            .map(Ulid)
            .map_err(|e| DbError::Corruption {
                details: format!("invalid block id {:?}: {}", s, e),
            })
    }
}
