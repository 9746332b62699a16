//! SHALE - Engine Configuration
//! Defines tunable parameters for the B+Tree storage engine.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, ShaleError};

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest accepted page size.
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest accepted page size.
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Configuration for the Shale storage engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the single database file.
    pub path: PathBuf,

    /// Page size used when a new file is created. Existing files keep
    /// the page size recorded in their meta page.
    pub page_size: usize,

    /// Whether commits fsync before and after writing the meta page.
    pub sync_writes: bool,

    /// Readers older than this are reported when they pin freed pages.
    pub reader_warn_age: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/shale.db"),
            page_size: DEFAULT_PAGE_SIZE,
            sync_writes: true,
            reader_warn_age: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Create a new Config for a database file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the page size for newly created files.
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    /// Enable or disable fsync on commit.
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Set the age after which open readers are reported as stale.
    pub fn with_reader_warn_age(mut self, age: Duration) -> Self {
        self.reader_warn_age = age;
        self
    }

    /// Check that the configured values are usable.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(ShaleError::Config(format!(
                "page size {} must be a power of two between {} and {}",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        if self.path.as_os_str().is_empty() {
            return Err(ShaleError::Config("database path is empty".to_string()));
        }
        Ok(())
    }

    /// Ensure the directory holding the database file exists.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir),
            _ => Ok(()),
        }
    }
}
