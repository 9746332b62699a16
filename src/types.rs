//! SHALE - Core Type Definitions
//! Defines fundamental types used across the storage engine.

/// Key type for the storage engine.
/// Using Vec<u8> allows arbitrary binary keys.
pub type Key = Vec<u8>;

/// Value type for the storage engine.
/// Using Vec<u8> allows arbitrary binary values.
pub type Value = Vec<u8>;

/// Page identifier (position of the page in the file, in pages).
pub type PageId = u64;

/// Transaction identifier. Every committed write transaction gets the next one.
pub type TxId = u64;

/// Largest accepted key, in bytes.
pub const MAX_KEY_SIZE: usize = 32768;

/// Largest accepted value, in bytes.
pub const MAX_VALUE_SIZE: usize = (1 << 31) - 2;

/// Direction a scan walks the keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Ascending byte order.
    #[default]
    Forward,
    /// Descending byte order.
    Reverse,
}

/// Options for an ordered scan over a bucket.
///
/// `offset` skips that many leading entries in traversal order and
/// `limit` caps how many entries are delivered after the skip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scan {
    pub direction: Direction,
    /// Forward scans start at the first key >= `start`,
    /// reverse scans at the last key <= `start`.
    pub start: Option<Key>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Scan {
    /// Ascending scan over the whole bucket.
    pub fn forward() -> Self {
        Self::default()
    }

    /// Descending scan over the whole bucket.
    pub fn reverse() -> Self {
        Self {
            direction: Direction::Reverse,
            ..Default::default()
        }
    }

    /// Start the scan at `key` instead of the bucket edge.
    pub fn from(mut self, key: impl Into<Key>) -> Self {
        self.start = Some(key.into());
        self
    }

    /// Skip `n` leading entries.
    pub fn offset(mut self, n: usize) -> Self {
        self.offset = n;
        self
    }

    /// Deliver at most `n` entries.
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_builder() {
        let scan = Scan::reverse().from(b"k".to_vec()).offset(2).limit(3);
        assert_eq!(scan.direction, Direction::Reverse);
        assert_eq!(scan.start.as_deref(), Some(&b"k"[..]));
        assert_eq!(scan.offset, 2);
        assert_eq!(scan.limit, Some(3));
        assert_eq!(Scan::forward().direction, Direction::Forward);
    }
}
