//! SHALE - Buckets
//! Named namespaces, each an independent tree. A bucket is stored as a
//! flagged entry in its parent's tree whose value is a `BucketHeader`.

use std::ops::ControlFlow;

use bytes::{Buf, BufMut};

use crate::error::{Result, ShaleError};
use crate::types::{Key, PageId, Scan, Value};

use super::btree::{self, PageSource};
use super::cursor::{Cursor, Entries};
use super::node::BUCKET_FLAG;
use super::txn::WriteTxn;

/// Root page and sequence counter of a bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketHeader {
    pub root: PageId,
    pub sequence: u64,
}

impl BucketHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut buf = &mut out[..];
        buf.put_u64_le(self.root);
        buf.put_u64_le(self.sequence);
        out
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(ShaleError::Corruption(format!(
                "bucket header is {} bytes",
                bytes.len()
            )));
        }
        Ok(Self {
            root: bytes.get_u64_le(),
            sequence: bytes.get_u64_le(),
        })
    }
}

/// Read-only handle on a bucket inside a transaction.
pub struct Bucket<'t, S: PageSource + ?Sized> {
    src: &'t S,
    header: BucketHeader,
}

impl<'t, S: PageSource + ?Sized> Bucket<'t, S> {
    pub(crate) fn new(src: &'t S, header: BucketHeader) -> Self {
        Self { src, header }
    }

    pub fn header(&self) -> BucketHeader {
        self.header
    }

    /// Current value of the bucket's sequence counter.
    pub fn sequence(&self) -> u64 {
        self.header.sequence
    }

    /// Value stored under `key`. Nested bucket names read as absent.
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        Ok(match btree::get(self.src, self.header.root, key)? {
            Some((value, flags)) if flags & BUCKET_FLAG == 0 => Some(value),
            _ => None,
        })
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Nested bucket `name`, if one exists.
    pub fn bucket(&self, name: &[u8]) -> Result<Option<Bucket<'t, S>>> {
        match btree::get(self.src, self.header.root, name)? {
            Some((value, flags)) if flags & BUCKET_FLAG != 0 => {
                Ok(Some(Bucket::new(self.src, BucketHeader::decode(&value)?)))
            }
            _ => Ok(None),
        }
    }

    /// Names of the nested buckets in key order.
    pub fn buckets(&self) -> Result<Vec<Key>> {
        let mut cursor = self.cursor();
        let mut names = Vec::new();
        let mut entry = cursor.first_entry()?;
        while let Some(e) = entry {
            if e.is_bucket() {
                names.push(e.key);
            }
            entry = cursor.next_entry()?;
        }
        Ok(names)
    }

    pub fn cursor(&self) -> Cursor<'t, S> {
        Cursor::new(self.src, self.header.root)
    }

    /// Ordered scan with a start key, offset and limit.
    pub fn scan(&self, scan: Scan) -> Entries<'t, S> {
        Entries::new(self.cursor(), scan)
    }

    /// Every key/value pair in ascending order.
    pub fn iter(&self) -> Entries<'t, S> {
        self.scan(Scan::forward())
    }

    /// Visit pairs in ascending order until `f` breaks.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    {
        for entry in self.iter() {
            let (key, value) = entry?;
            if f(&key, &value).is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Number of key/value pairs, nested buckets excluded.
    pub fn count(&self) -> Result<usize> {
        let mut count = 0;
        for entry in self.iter() {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}

/// Writable handle on a bucket, addressed by its path from the root.
///
/// The handle borrows the write transaction; nested handles reborrow it.
pub struct BucketMut<'t, 'db> {
    tx: &'t mut WriteTxn<'db>,
    path: Vec<Key>,
}

impl<'t, 'db> BucketMut<'t, 'db> {
    pub(crate) fn new(tx: &'t mut WriteTxn<'db>, path: Vec<Key>) -> Self {
        Self { tx, path }
    }

    /// Names from the root to this bucket.
    pub fn path(&self) -> &[Key] {
        &self.path
    }

    /// Read-only view of this bucket as it stands in the transaction.
    pub fn view(&self) -> Result<Bucket<'_, WriteTxn<'db>>> {
        let header = self
            .tx
            .load_header(&self.path)?
            .ok_or(ShaleError::BucketNotFound)?;
        Ok(Bucket::new(&*self.tx, header))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        self.view()?.get(key)
    }

    /// Insert or overwrite a pair.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tx.put_at(&self.path, key, value)
    }

    /// Remove a pair; returns whether it existed.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        self.tx.delete_at(&self.path, key)
    }

    pub fn sequence(&self) -> Result<u64> {
        Ok(self.view()?.sequence())
    }

    /// Advance and return the bucket's sequence counter.
    pub fn next_sequence(&mut self) -> Result<u64> {
        self.tx.next_sequence_at(&self.path)
    }

    pub fn set_sequence(&mut self, sequence: u64) -> Result<()> {
        self.tx.set_sequence_at(&self.path, sequence)
    }

    /// Create a nested bucket; fails with `BucketExists` if present.
    pub fn create_bucket(&mut self, name: &[u8]) -> Result<BucketMut<'_, 'db>> {
        self.tx.create_bucket_at(&self.path, name, false)?;
        Ok(self.child(name))
    }

    pub fn create_bucket_if_not_exists(&mut self, name: &[u8]) -> Result<BucketMut<'_, 'db>> {
        self.tx.create_bucket_at(&self.path, name, true)?;
        Ok(self.child(name))
    }

    /// Nested bucket `name`, if one exists.
    pub fn bucket_mut(&mut self, name: &[u8]) -> Result<Option<BucketMut<'_, 'db>>> {
        let mut path = self.path.clone();
        path.push(name.to_vec());
        Ok(match self.tx.load_header(&path)? {
            Some(_) => Some(BucketMut::new(&mut *self.tx, path)),
            None => None,
        })
    }

    /// Delete a nested bucket and everything under it.
    pub fn delete_bucket(&mut self, name: &[u8]) -> Result<bool> {
        self.tx.delete_bucket_at(&self.path, name)
    }

    fn child(&mut self, name: &[u8]) -> BucketMut<'_, 'db> {
        let mut path = self.path.clone();
        path.push(name.to_vec());
        BucketMut::new(&mut *self.tx, path)
    }
}
