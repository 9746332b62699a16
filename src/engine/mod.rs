//! SHALE - Storage Engine Module
//! Top-level module for the copy-on-write B+Tree storage engine.

pub mod btree;
pub mod bucket;
pub mod cursor;
pub mod failpoint;
pub mod freelist;
pub mod metrics;
pub mod node;
pub mod page;
pub mod pager;
pub mod txn;

use std::fs::OpenOptions;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::config::{Config, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::error::{Result, ShaleError};
use crate::types::{PageId, TxId};

use self::freelist::Freelist;
use self::metrics::EngineMetrics;
use self::page::Meta;
use self::pager::Pager;
use self::txn::{ReadTxn, ReaderInfo, ReaderRegistry, WriteTxn};

/// Point-in-time summary of the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub page_size: usize,
    /// Id of the last committed transaction.
    pub txid: TxId,
    pub high_water: PageId,
    pub free_pages: usize,
    /// Freed pages still visible to open readers.
    pub pending_pages: usize,
    pub open_readers: usize,
    pub file_size: u64,
}

/// The core Shale storage engine.
/// Owns the database file and coordinates one writer with any number
/// of snapshot readers.
pub struct Shale {
    config: Config,
    pager: Pager,
    /// Meta of the last committed transaction.
    meta: RwLock<Meta>,
    /// Allocator state as of the last commit.
    freelist: Mutex<Freelist>,
    writer: Mutex<()>,
    readers: ReaderRegistry,
    metrics: EngineMetrics,
    /// Set when a failed commit may have left its meta on disk.
    poisoned: AtomicBool,
}

impl Shale {
    /// Open or create a database file at the configured path.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs()?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&config.path)?;

        let created = file.metadata()?.len() == 0;
        if created {
            Pager::format(&mut file, config.page_size)?;
        }

        let page_size = Self::detect_page_size(&mut file)?.unwrap_or(config.page_size);
        let pager = Pager::new(file, page_size)?;
        let metrics = EngineMetrics::new();
        let meta = Self::load_meta(&pager, &metrics)?;
        let freelist = Freelist::from_page(&pager.read(meta.freelist)?)?;

        log::info!(
            "Shale {} {:?} (txid {}, page size {}, {} pages, {} free)",
            if created { "created" } else { "opened" },
            config.path,
            meta.txid,
            page_size,
            meta.high_water,
            freelist.free_count()
        );

        Ok(Self {
            config,
            pager,
            meta: RwLock::new(meta),
            freelist: Mutex::new(freelist),
            writer: Mutex::new(()),
            readers: ReaderRegistry::default(),
            metrics,
            poisoned: AtomicBool::new(false),
        })
    }

    /// Page size recorded by either meta page.
    fn detect_page_size(file: &mut std::fs::File) -> Result<Option<usize>> {
        let valid = |size: usize| {
            size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size)
        };
        if let Some(size) = Pager::probe_page_size(file, 0)?.filter(|&s| valid(s)) {
            return Ok(Some(size));
        }
        // The first meta is unreadable: look for the second one at every
        // candidate page size.
        let mut size = MIN_PAGE_SIZE;
        while size <= MAX_PAGE_SIZE {
            if Pager::probe_page_size(file, size as u64)? == Some(size) {
                return Ok(Some(size));
            }
            size *= 2;
        }
        Ok(None)
    }

    /// Pick the valid meta page with the highest transaction id.
    fn load_meta(pager: &Pager, metrics: &EngineMetrics) -> Result<Meta> {
        let read = |id: PageId| -> Result<Meta> {
            let meta = Meta::from_page(&pager.read(id)?)?;
            if meta.page_size as usize != pager.page_size() {
                return Err(ShaleError::Corruption(format!(
                    "meta page {id} records page size {}",
                    meta.page_size
                )));
            }
            Ok(meta)
        };

        match (read(0), read(1)) {
            (Ok(a), Ok(b)) => Ok(if a.txid >= b.txid { a } else { b }),
            (Ok(meta), Err(e)) | (Err(e), Ok(meta)) => {
                log::warn!(
                    "Ignoring invalid meta page ({}); recovered at txid {}",
                    e,
                    meta.txid
                );
                metrics.record_meta_recovery();
                Ok(meta)
            }
            (Err(a), Err(b)) => Err(ShaleError::Corruption(format!(
                "no valid meta page: {a}; {b}"
            ))),
        }
    }

    /// Flush and close the database.
    pub fn close(self) -> Result<()> {
        self.pager.sync()?;
        log::info!(
            "Shale closed {:?} at txid {}",
            self.config.path,
            self.meta.read().txid
        );
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Begin a read transaction on the latest committed snapshot.
    pub fn begin_read(&self) -> ReadTxn<'_> {
        let meta = self.meta.read();
        let id = self.readers.register(meta.txid);
        let snapshot = *meta;
        drop(meta);
        ReadTxn::new(self, snapshot, id)
    }

    /// Begin the write transaction, waiting for the current writer to finish.
    pub fn begin_write(&self) -> WriteTxn<'_> {
        let guard = self.writer.lock();
        self.start_write(guard)
    }

    /// Begin the write transaction unless another one is active.
    pub fn try_begin_write(&self) -> Option<WriteTxn<'_>> {
        let guard = self.writer.try_lock()?;
        Some(self.start_write(guard))
    }

    fn start_write<'db>(&'db self, guard: parking_lot::MutexGuard<'db, ()>) -> WriteTxn<'db> {
        let meta = *self.meta.read();
        let freelist = {
            let mut freelist = self.freelist.lock();
            let released = freelist.release(self.readers.oldest());
            if released > 0 {
                log::debug!("Released {} pages for reuse", released);
            }
            if freelist.pending_count() > 0 {
                self.warn_stale_readers();
            }
            freelist.clone()
        };
        WriteTxn::new(self, meta, freelist, guard)
    }

    /// Whether write transactions are refused until the file is reopened.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    fn warn_stale_readers(&self) {
        for reader in self.readers.list() {
            if reader.age >= self.config.reader_warn_age {
                log::warn!(
                    "Reader {} on snapshot {} has been open for {:.1}s and is holding freed pages",
                    reader.id,
                    reader.snapshot,
                    reader.age.as_secs_f64()
                );
            }
        }
    }

    /// Run `f` inside a read transaction.
    pub fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ReadTxn<'_>) -> Result<T>,
    {
        let tx = self.begin_read();
        f(&tx)
    }

    /// Run `f` inside a write transaction, committing on `Ok` and
    /// rolling back on `Err`.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WriteTxn<'_>) -> Result<T>,
    {
        let mut tx = self.begin_write();
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> Stats {
        let meta = *self.meta.read();
        let freelist = self.freelist.lock();
        Stats {
            page_size: self.pager.page_size(),
            txid: meta.txid,
            high_water: meta.high_water,
            free_pages: freelist.free_count(),
            pending_pages: freelist.pending_count(),
            open_readers: self.readers.len(),
            file_size: self.pager.len(),
        }
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Open read transactions, oldest snapshot first.
    pub fn active_readers(&self) -> Vec<ReaderInfo> {
        self.readers.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &std::path::Path) -> Shale {
        Shale::open(Config::new(dir.join("test.db")).with_page_size(1024)).unwrap()
    }

    #[test]
    fn test_open_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        let stats = db.stats();
        assert_eq!(stats.txid, 1);
        assert_eq!(stats.high_water, 4);
        assert_eq!(stats.page_size, 1024);
        assert_eq!(stats.open_readers, 0);
    }

    #[test]
    fn test_existing_file_keeps_its_page_size() {
        let dir = tempfile::tempdir().unwrap();
        open(dir.path()).close().unwrap();

        let db = Shale::open(Config::new(dir.path().join("test.db")).with_page_size(8192)).unwrap();
        assert_eq!(db.stats().page_size, 1024);
    }

    #[test]
    fn test_update_commits_and_view_reads() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        db.update(|tx| {
            tx.create_bucket(b"b")?;
            tx.put(b"b", b"k", b"v")
        })
        .unwrap();

        let value = db.view(|tx| tx.get(b"b", b"k")).unwrap();
        assert_eq!(value, Some(b"v".to_vec()));
        assert_eq!(db.stats().txid, 2);
        assert_eq!(db.metrics().commits.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn test_update_error_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        let result: Result<()> = db.update(|tx| {
            tx.create_bucket(b"b")?;
            tx.put(b"missing", b"k", b"v")
        });
        assert!(matches!(result, Err(ShaleError::BucketNotFound)));
        assert!(db.view(|tx| tx.bucket(b"b").map(|b| b.is_none())).unwrap());
        assert_eq!(db.stats().txid, 1);
    }

    #[test]
    fn test_write_transaction_state() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        let tx = db.begin_write();
        assert_eq!(tx.state(), txn::TxState::ActiveWrite);
        assert!(!db.is_poisoned());
        tx.rollback();
    }

    #[test]
    fn test_try_begin_write_while_writing() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        let tx = db.begin_write();
        assert!(db.try_begin_write().is_none());
        tx.rollback();
        assert!(db.try_begin_write().is_some());
    }
}
