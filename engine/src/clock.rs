//! Date-modified watermark.
//!
//! Remote backends stamp writes with a server timestamp (milliseconds since
//! the epoch). The watermark is the newest stamp seen for a table; it filters
//! "changes since" queries and arbitrates between a remote change and a local
//! write still waiting to be saved.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Newest server timestamp observed for a table.
///
/// Ordering rules:
/// 1. Any timestamp is newer than an unset watermark
/// 2. Otherwise the larger timestamp wins
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(Option<u64>);

impl Watermark {
    /// An empty watermark; every timestamp is newer.
    pub const fn unset() -> Self {
        Self(None)
    }

    pub const fn at(millis: u64) -> Self {
        Self(Some(millis))
    }

    pub fn get(&self) -> Option<u64> {
        self.0
    }

    pub fn is_unset(&self) -> bool {
        self.0.is_none()
    }

    /// Advance to `other` if it is newer. Never moves backwards.
    pub fn merge(&mut self, other: impl Into<Watermark>) {
        let other = other.into();
        if other > *self {
            *self = other;
        }
    }

    /// Whether `millis` is strictly newer than this watermark.
    pub fn is_newer(&self, millis: u64) -> bool {
        match self.0 {
            None => true,
            Some(current) => millis > current,
        }
    }
}

impl From<u64> for Watermark {
    fn from(millis: u64) -> Self {
        Self(Some(millis))
    }
}

impl From<Option<u64>> for Watermark {
    fn from(millis: Option<u64>) -> Self {
        Self(millis)
    }
}

impl Ord for Watermark {
    fn cmp(&self, other: &Self) -> Ordering {
        // Option already orders None below Some.
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Watermark {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
