//! SHALE - Transactions
//! Read transactions pin an immutable snapshot (the meta page current when
//! they began). The single write transaction builds new page versions in
//! memory and publishes them atomically by writing a new meta page.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{Result, ShaleError};
use crate::types::{Key, PageId, Scan, TxId, Value, MAX_KEY_SIZE, MAX_VALUE_SIZE};

use super::btree::{self, PageSink, PageSource};
use super::bucket::{Bucket, BucketHeader, BucketMut};
use super::cursor::Entries;
use super::failpoint;
use super::freelist::Freelist;
use super::node::BUCKET_FLAG;
use super::page::{Meta, Page};
use super::Shale;

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    ActiveRead,
    ActiveWrite,
    Committed,
    RolledBack,
}

/// An open read transaction as reported by `Shale::active_readers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderInfo {
    pub id: u64,
    /// Transaction id of the snapshot the reader sees.
    pub snapshot: TxId,
    pub age: Duration,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    open: HashMap<u64, (TxId, Instant)>,
}

/// Open read transactions and the snapshots they pin.
#[derive(Default)]
pub struct ReaderRegistry {
    inner: Mutex<Registry>,
}

impl ReaderRegistry {
    pub fn register(&self, snapshot: TxId) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.open.insert(id, (snapshot, Instant::now()));
        id
    }

    pub fn unregister(&self, id: u64) {
        self.inner.lock().open.remove(&id);
    }

    /// Snapshot id of the oldest open reader.
    pub fn oldest(&self) -> Option<TxId> {
        self.inner.lock().open.values().map(|(txid, _)| *txid).min()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open readers, oldest snapshot first.
    pub fn list(&self) -> Vec<ReaderInfo> {
        let inner = self.inner.lock();
        let mut readers: Vec<ReaderInfo> = inner
            .open
            .iter()
            .map(|(&id, &(snapshot, started))| ReaderInfo {
                id,
                snapshot,
                age: started.elapsed(),
            })
            .collect();
        readers.sort_by_key(|r| (r.snapshot, r.id));
        readers
    }
}

/// A read-only snapshot of the database.
pub struct ReadTxn<'db> {
    db: &'db Shale,
    meta: Meta,
    reader_id: u64,
}

impl<'db> ReadTxn<'db> {
    pub(crate) fn new(db: &'db Shale, meta: Meta, reader_id: u64) -> Self {
        Self {
            db,
            meta,
            reader_id,
        }
    }

    /// Transaction id of the snapshot.
    pub fn id(&self) -> TxId {
        self.meta.txid
    }

    /// The root bucket, which holds the top-level buckets.
    pub fn root(&self) -> Bucket<'_, Self> {
        Bucket::new(self, self.meta.root)
    }

    pub fn bucket(&self, name: &[u8]) -> Result<Option<Bucket<'_, Self>>> {
        self.root().bucket(name)
    }

    /// Names of the top-level buckets.
    pub fn buckets(&self) -> Result<Vec<Key>> {
        self.root().buckets()
    }

    /// Value of `key` in `bucket`; absent when either is missing.
    pub fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Value>> {
        self.db.metrics.record_get();
        match self.bucket(bucket)? {
            Some(b) => b.get(key),
            None => Ok(None),
        }
    }

    /// Ordered scan of `bucket`; empty when the bucket is missing.
    pub fn scan(&self, bucket: &[u8], scan: Scan) -> Result<Entries<'_, Self>> {
        self.db.metrics.record_scan();
        Ok(match self.bucket(bucket)? {
            Some(b) => b.scan(scan),
            None => Entries::empty(),
        })
    }

    pub fn for_each<F>(&self, bucket: &[u8], f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    {
        self.db.metrics.record_scan();
        match self.bucket(bucket)? {
            Some(b) => b.for_each(f),
            None => Ok(()),
        }
    }

    pub fn count(&self, bucket: &[u8]) -> Result<usize> {
        match self.bucket(bucket)? {
            Some(b) => b.count(),
            None => Ok(0),
        }
    }

    /// End the transaction and release its snapshot.
    pub fn close(self) {}
}

impl PageSource for ReadTxn<'_> {
    fn page(&self, id: PageId) -> Result<Page> {
        self.db.metrics.record_page_read();
        self.db.pager.read(id)
    }

    fn page_size(&self) -> usize {
        self.db.pager.page_size()
    }
}

impl Drop for ReadTxn<'_> {
    fn drop(&mut self) {
        self.db.readers.unregister(self.reader_id);
    }
}

/// The exclusive read-write transaction.
///
/// Modified pages live in `dirty` until commit. Dropping the transaction
/// without committing rolls it back.
pub struct WriteTxn<'db> {
    db: &'db Shale,
    meta: Meta,
    freelist: Freelist,
    dirty: HashMap<PageId, Page>,
    state: TxState,
    failed: bool,
    _writer: MutexGuard<'db, ()>,
}

impl<'db> WriteTxn<'db> {
    pub(crate) fn new(
        db: &'db Shale,
        mut meta: Meta,
        freelist: Freelist,
        writer: MutexGuard<'db, ()>,
    ) -> Self {
        meta.txid += 1;
        Self {
            db,
            meta,
            freelist,
            dirty: HashMap::new(),
            state: TxState::ActiveWrite,
            failed: db.is_poisoned(),
            _writer: writer,
        }
    }

    /// Id this transaction commits as.
    pub fn id(&self) -> TxId {
        self.meta.txid
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// Pages modified so far.
    pub fn dirty_pages(&self) -> usize {
        self.dirty.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.failed {
            Err(ShaleError::TxClosed)
        } else {
            Ok(())
        }
    }

    /// Run a mutation; a fatal error poisons the transaction.
    fn guarded<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.ensure_open()?;
        let result = op(self);
        if let Err(e) = &result {
            if e.is_fatal() {
                log::error!("Write transaction {} poisoned: {}", self.meta.txid, e);
                self.failed = true;
            }
        }
        result
    }

    /// Header of the bucket at `path`; an empty path is the root bucket.
    pub(crate) fn load_header(&self, path: &[Key]) -> Result<Option<BucketHeader>> {
        self.ensure_open()?;
        let mut header = self.meta.root;
        for name in path {
            match btree::get(self, header.root, name)? {
                Some((value, flags)) if flags & BUCKET_FLAG != 0 => {
                    header = BucketHeader::decode(&value)?;
                }
                Some(_) => return Err(ShaleError::IncompatibleValue),
                None => return Ok(None),
            }
        }
        Ok(Some(header))
    }

    /// Store a changed header and propagate the new roots up to the meta.
    fn store_header(&mut self, path: &[Key], header: BucketHeader) -> Result<()> {
        let Some((name, parent_path)) = path.split_last() else {
            self.meta.root = header;
            return Ok(());
        };
        let mut parent = self
            .load_header(parent_path)?
            .ok_or(ShaleError::BucketNotFound)?;
        let root = btree::put(self, parent.root, name, &header.encode(), BUCKET_FLAG)?;
        if root == parent.root {
            return Ok(());
        }
        parent.root = root;
        self.store_header(parent_path, parent)
    }

    fn existing_bucket_header(&self, path: &[Key]) -> Result<BucketHeader> {
        self.load_header(path)?.ok_or(ShaleError::BucketNotFound)
    }

    pub(crate) fn put_at(&mut self, path: &[Key], key: &[u8], value: &[u8]) -> Result<()> {
        validate_key(key)?;
        if value.len() > MAX_VALUE_SIZE {
            return Err(ShaleError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        self.guarded(|tx| {
            let mut header = tx.existing_bucket_header(path)?;
            if let Some((_, flags)) = btree::get(&*tx, header.root, key)? {
                if flags & BUCKET_FLAG != 0 {
                    return Err(ShaleError::IncompatibleValue);
                }
            }
            header.root = btree::put(tx, header.root, key, value, 0)?;
            tx.store_header(path, header)?;
            tx.db.metrics.record_put();
            Ok(())
        })
    }

    pub(crate) fn delete_at(&mut self, path: &[Key], key: &[u8]) -> Result<bool> {
        validate_key(key)?;
        self.guarded(|tx| {
            let mut header = tx.existing_bucket_header(path)?;
            match btree::get(&*tx, header.root, key)? {
                None => return Ok(false),
                Some((_, flags)) if flags & BUCKET_FLAG != 0 => {
                    return Err(ShaleError::IncompatibleValue)
                }
                Some(_) => {}
            }
            let (root, removed) = btree::delete(tx, header.root, key)?;
            header.root = root;
            tx.store_header(path, header)?;
            tx.db.metrics.record_delete();
            Ok(removed.is_some())
        })
    }

    pub(crate) fn next_sequence_at(&mut self, path: &[Key]) -> Result<u64> {
        self.guarded(|tx| {
            let mut header = tx.existing_bucket_header(path)?;
            header.sequence += 1;
            tx.store_header(path, header)?;
            Ok(header.sequence)
        })
    }

    pub(crate) fn set_sequence_at(&mut self, path: &[Key], sequence: u64) -> Result<()> {
        self.guarded(|tx| {
            let mut header = tx.existing_bucket_header(path)?;
            header.sequence = sequence;
            tx.store_header(path, header)
        })
    }

    pub(crate) fn create_bucket_at(
        &mut self,
        path: &[Key],
        name: &[u8],
        exist_ok: bool,
    ) -> Result<()> {
        validate_key(name)?;
        self.guarded(|tx| {
            let mut parent = tx.existing_bucket_header(path)?;
            match btree::get(&*tx, parent.root, name)? {
                Some((_, flags)) if flags & BUCKET_FLAG != 0 => {
                    return if exist_ok {
                        Ok(())
                    } else {
                        Err(ShaleError::BucketExists)
                    };
                }
                Some(_) => return Err(ShaleError::IncompatibleValue),
                None => {}
            }
            let header = BucketHeader {
                root: btree::create_root(tx)?,
                sequence: 0,
            };
            parent.root = btree::put(tx, parent.root, name, &header.encode(), BUCKET_FLAG)?;
            tx.store_header(path, parent)?;
            log::debug!("Created bucket {:?}", String::from_utf8_lossy(name));
            Ok(())
        })
    }

    pub(crate) fn delete_bucket_at(&mut self, path: &[Key], name: &[u8]) -> Result<bool> {
        validate_key(name)?;
        self.guarded(|tx| {
            let mut parent = tx.existing_bucket_header(path)?;
            let header = match btree::get(&*tx, parent.root, name)? {
                None => return Ok(false),
                Some((value, flags)) if flags & BUCKET_FLAG != 0 => BucketHeader::decode(&value)?,
                Some(_) => return Err(ShaleError::IncompatibleValue),
            };
            btree::free_tree(tx, header.root)?;
            parent.root = btree::delete(tx, parent.root, name)?.0;
            tx.store_header(path, parent)?;
            log::debug!("Deleted bucket {:?}", String::from_utf8_lossy(name));
            Ok(true)
        })
    }

    /// Create a top-level bucket; fails with `BucketExists` if present.
    pub fn create_bucket(&mut self, name: &[u8]) -> Result<BucketMut<'_, 'db>> {
        self.create_bucket_at(&[], name, false)?;
        Ok(BucketMut::new(self, vec![name.to_vec()]))
    }

    pub fn create_bucket_if_not_exists(&mut self, name: &[u8]) -> Result<BucketMut<'_, 'db>> {
        self.create_bucket_at(&[], name, true)?;
        Ok(BucketMut::new(self, vec![name.to_vec()]))
    }

    /// Delete a top-level bucket and everything in it.
    /// Returns `false` when no such bucket exists.
    pub fn delete_bucket(&mut self, name: &[u8]) -> Result<bool> {
        self.delete_bucket_at(&[], name)
    }

    /// Read view of the root bucket.
    pub fn root(&self) -> Result<Bucket<'_, Self>> {
        self.ensure_open()?;
        Ok(Bucket::new(self, self.meta.root))
    }

    /// Writable handle on the root bucket.
    pub fn root_mut(&mut self) -> Result<BucketMut<'_, 'db>> {
        self.ensure_open()?;
        Ok(BucketMut::new(self, Vec::new()))
    }

    pub fn bucket(&self, name: &[u8]) -> Result<Option<Bucket<'_, Self>>> {
        self.root()?.bucket(name)
    }

    pub fn bucket_mut(&mut self, name: &[u8]) -> Result<Option<BucketMut<'_, 'db>>> {
        let path = vec![name.to_vec()];
        Ok(match self.load_header(&path)? {
            Some(_) => Some(BucketMut::new(self, path)),
            None => None,
        })
    }

    pub fn buckets(&self) -> Result<Vec<Key>> {
        self.root()?.buckets()
    }

    /// Value of `key` in `bucket`, seeing this transaction's own writes.
    pub fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Value>> {
        self.db.metrics.record_get();
        match self.bucket(bucket)? {
            Some(b) => b.get(key),
            None => Ok(None),
        }
    }

    /// Insert or overwrite `key` in an existing bucket.
    pub fn put(&mut self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        self.put_at(&[bucket.to_vec()], key, value)
    }

    /// Remove `key`; returns whether it existed.
    pub fn delete(&mut self, bucket: &[u8], key: &[u8]) -> Result<bool> {
        self.delete_at(&[bucket.to_vec()], key)
    }

    /// Advance and return the sequence counter of `bucket`.
    pub fn next_sequence(&mut self, bucket: &[u8]) -> Result<u64> {
        self.next_sequence_at(&[bucket.to_vec()])
    }

    pub fn scan(&self, bucket: &[u8], scan: Scan) -> Result<Entries<'_, Self>> {
        self.db.metrics.record_scan();
        Ok(match self.bucket(bucket)? {
            Some(b) => b.scan(scan),
            None => Entries::empty(),
        })
    }

    pub fn for_each<F>(&self, bucket: &[u8], f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    {
        self.db.metrics.record_scan();
        match self.bucket(bucket)? {
            Some(b) => b.for_each(f),
            None => Ok(()),
        }
    }

    pub fn count(&self, bucket: &[u8]) -> Result<usize> {
        match self.bucket(bucket)? {
            Some(b) => b.count(),
            None => Ok(0),
        }
    }

    /// Make every change durable and visible to new readers.
    ///
    /// On failure the transaction is rolled back and the database stays
    /// at its previous state.
    pub fn commit(mut self) -> Result<()> {
        if self.failed {
            self.finish_rollback("poisoned");
            return Err(ShaleError::TxClosed);
        }
        match self.write_out() {
            Ok(()) => {
                self.state = TxState::Committed;
                self.db.metrics.record_commit();
                log::debug!(
                    "Committed transaction {} ({} pages, high water {})",
                    self.meta.txid,
                    self.dirty.len(),
                    self.meta.high_water
                );
                self.dirty.clear();
                Ok(())
            }
            Err(e) => {
                log::warn!("Commit of transaction {} failed: {}", self.meta.txid, e);
                self.finish_rollback("commit failure");
                Err(e)
            }
        }
    }

    /// Discard every change made by this transaction.
    pub fn rollback(mut self) {
        self.finish_rollback("requested");
    }

    fn finish_rollback(&mut self, reason: &str) {
        self.dirty.clear();
        self.state = TxState::RolledBack;
        self.db.metrics.record_rollback();
        log::debug!("Rolled back transaction {} ({})", self.meta.txid, reason);
    }

    fn write_out(&mut self) -> Result<()> {
        let page_size = self.db.pager.page_size();

        // Replace the persisted free list.
        let old = self.page(self.meta.freelist)?;
        self.free(old.id, old.page_count());
        let pages = self.freelist.pages_needed(page_size);
        let id = self.allocate(pages)?;
        let list = self.freelist.to_page(id, page_size, pages)?;
        self.dirty.insert(id, list);
        self.meta.freelist = id;

        failpoint::maybe_fail(failpoint::COMMIT_BEFORE_PAGES)?;
        self.db
            .pager
            .ensure_len(self.meta.high_water * page_size as u64)?;

        let mut ids: Vec<PageId> = self.dirty.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(page) = self.dirty.get(&id) {
                self.db.pager.write(page)?;
                self.db
                    .metrics
                    .record_page_write(page.page_count(), page.data.len());
            }
        }

        failpoint::maybe_fail(failpoint::COMMIT_BEFORE_META)?;
        let sync = self.db.config.sync_writes;
        if sync {
            self.db.pager.sync()?;
        }
        // Once the meta write has started the slot may hold this
        // transaction's meta, so every failure must put the committed one back.
        if let Err(e) = self.publish_meta(sync) {
            self.restore_meta_slot();
            return Err(e);
        }

        *self.db.meta.write() = self.meta;
        *self.db.freelist.lock() = std::mem::take(&mut self.freelist);
        Ok(())
    }

    fn publish_meta(&self, sync: bool) -> Result<()> {
        let meta_page = self.meta.to_page();
        self.db.pager.write(&meta_page)?;
        self.db.metrics.record_page_write(1, meta_page.data.len());
        failpoint::maybe_fail(failpoint::COMMIT_AFTER_META)?;
        if sync {
            self.db.pager.sync()?;
        }
        Ok(())
    }

    /// Overwrite this transaction's meta slot with the committed meta.
    /// If that fails too, the file may reopen at this transaction and the
    /// pages it wrote must stay untouched, so the handle refuses writes.
    fn restore_meta_slot(&self) {
        let committed = *self.db.meta.read();
        let slot = self.meta.slot();
        let page = committed.to_page_in(slot);
        let restored = failpoint::maybe_fail(failpoint::COMMIT_RESTORE_META)
            .map_err(ShaleError::from)
            .and_then(|()| self.db.pager.write(&page))
            .and_then(|()| self.db.pager.sync());
        match restored {
            Ok(()) => log::warn!(
                "Restored meta slot {} to txid {} after failed commit {}",
                slot,
                committed.txid,
                self.meta.txid
            ),
            Err(e) => {
                log::error!(
                    "Could not restore meta slot {} after failed commit {}: {}; refusing further writes",
                    slot,
                    self.meta.txid,
                    e
                );
                self.db.poison();
            }
        }
    }
}

impl PageSource for WriteTxn<'_> {
    fn page(&self, id: PageId) -> Result<Page> {
        if let Some(page) = self.dirty.get(&id) {
            return Ok(page.clone());
        }
        self.db.metrics.record_page_read();
        self.db.pager.read(id)
    }

    fn page_size(&self) -> usize {
        self.db.pager.page_size()
    }
}

impl PageSink for WriteTxn<'_> {
    fn allocate(&mut self, pages: usize) -> Result<PageId> {
        if let Some(id) = self.freelist.allocate(pages) {
            return Ok(id);
        }
        let id = self.meta.high_water;
        self.meta.high_water += pages.max(1) as u64;
        Ok(id)
    }

    fn write(&mut self, mut page: Page) -> Result<()> {
        page.seal();
        self.dirty.insert(page.id, page);
        Ok(())
    }

    fn free(&mut self, id: PageId, pages: usize) {
        if self.dirty.remove(&id).is_some() {
            self.freelist.reclaim(id, pages);
        } else {
            self.freelist.free(self.meta.txid, id, pages);
        }
    }

    fn is_dirty(&self, id: PageId) -> bool {
        self.dirty.contains_key(&id)
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if self.state == TxState::ActiveWrite {
            log::warn!(
                "Write transaction {} dropped without commit; rolling back",
                self.meta.txid
            );
            self.finish_rollback("dropped");
        }
    }
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(ShaleError::KeyRequired);
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(ShaleError::KeyTooLarge {
            size: key.len(),
            max: MAX_KEY_SIZE,
        });
    }
    Ok(())
}
