//! SHALE - Bucket Store Facade
//! A cloneable handle that runs every call in its own managed transaction.
//!
//! ## Concurrency Model
//! - **Reads** (`get`, `select`, `iterate`, typed getters) each open a
//!   snapshot read transaction and never block writers
//! - **Writes** (`add`, `delete`, `next`, typed setters) each run and
//!   commit one write transaction; writers serialize
//!
//! Clones share the same open database.

use std::ops::ControlFlow;
use std::sync::Arc;

use crate::codec;
use crate::config::Config;
use crate::engine::Shale;
use crate::error::Result;
use crate::types::{Scan, Value};

/// Thread-safe, auto-committing facade over a Shale database.
///
/// ## Example
/// ```no_run
/// use shale::config::Config;
/// use shale::store::Store;
/// use std::thread;
///
/// let store = Store::open(Config::new("./data/app.db"), &["users"]).unwrap();
///
/// // Clone for multiple threads
/// let writer = store.clone();
/// thread::spawn(move || {
///     writer.add("users", b"alice", b"admin").unwrap();
/// });
///
/// let id = store.next("user_ids").unwrap();
/// let role = store.get("users", b"alice").unwrap();
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Arc<Shale>,
}

impl Store {
    /// Open the database and make sure `buckets` exist.
    pub fn open(config: Config, buckets: &[&str]) -> Result<Self> {
        let store = Self {
            inner: Arc::new(Shale::open(config)?),
        };
        store.ensure_buckets(buckets)?;
        Ok(store)
    }

    /// The underlying engine, for explicit transactions.
    pub fn db(&self) -> &Shale {
        &self.inner
    }

    /// Close the database once this is the last handle.
    pub fn close(self) -> Result<()> {
        match Arc::try_unwrap(self.inner) {
            Ok(db) => db.close(),
            Err(_) => {
                log::debug!("Store handle dropped; database stays open for other clones");
                Ok(())
            }
        }
    }

    /// Create every missing bucket in one transaction.
    pub fn ensure_buckets(&self, buckets: &[&str]) -> Result<()> {
        if buckets.is_empty() {
            return Ok(());
        }
        self.inner.update(|tx| {
            for name in buckets {
                tx.create_bucket_if_not_exists(name.as_bytes())?;
            }
            Ok(())
        })
    }

    /// Next value of the counter named `counter`, creating it on first use.
    pub fn next(&self, counter: &str) -> Result<u64> {
        self.inner.update(|tx| {
            tx.create_bucket_if_not_exists(counter.as_bytes())?
                .next_sequence()
        })
    }

    /// Visit entries newest key first, skipping `offset` entries and
    /// delivering at most `limit` (0 means no limit).
    pub fn select<F>(&self, bucket: &str, limit: usize, offset: usize, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]),
    {
        let mut scan = Scan::reverse().offset(offset);
        if limit > 0 {
            scan = scan.limit(limit);
        }
        self.inner.view(|tx| {
            for entry in tx.scan(bucket.as_bytes(), scan)? {
                let (key, value) = entry?;
                f(&key, &value);
            }
            Ok(())
        })
    }

    pub fn has_bucket(&self, bucket: &str) -> Result<bool> {
        self.inner
            .view(|tx| Ok(tx.bucket(bucket.as_bytes())?.is_some()))
    }

    /// Value of `key`; absent when the key or the bucket is missing.
    pub fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Value>> {
        self.inner.view(|tx| tx.get(bucket.as_bytes(), key))
    }

    /// Whether `key` holds a non-empty value.
    pub fn has(&self, bucket: &str, key: &[u8]) -> Result<bool> {
        Ok(self.get(bucket, key)?.is_some_and(|v| !v.is_empty()))
    }

    /// Values of several keys from one snapshot, in the order asked.
    pub fn list<K: AsRef<[u8]>>(&self, bucket: &str, keys: &[K]) -> Result<Vec<Option<Value>>> {
        self.inner.view(|tx| {
            let Some(b) = tx.bucket(bucket.as_bytes())? else {
                return Ok(Vec::new());
            };
            keys.iter().map(|k| b.get(k.as_ref())).collect()
        })
    }

    /// Store a pair in an existing bucket.
    pub fn add(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.update(|tx| tx.put(bucket.as_bytes(), key, value))
    }

    /// Remove a pair; returns whether it existed.
    pub fn delete(&self, bucket: &str, key: &[u8]) -> Result<bool> {
        self.inner.update(|tx| tx.delete(bucket.as_bytes(), key))
    }

    /// Drop every entry of a bucket, leaving it empty.
    pub fn reset_bucket(&self, bucket: &str) -> Result<()> {
        self.inner.update(|tx| {
            tx.delete_bucket(bucket.as_bytes())?;
            tx.create_bucket(bucket.as_bytes())?;
            Ok(())
        })
    }

    pub fn int(&self, bucket: &str, key: &str) -> Result<isize> {
        codec::decode_int(self.get(bucket, key.as_bytes())?.as_deref())
    }

    pub fn set_int(&self, bucket: &str, key: &str, value: isize) -> Result<()> {
        self.add(bucket, key.as_bytes(), &codec::encode_int(value))
    }

    pub fn int64(&self, bucket: &str, key: &str) -> Result<i64> {
        codec::decode_i64(self.get(bucket, key.as_bytes())?.as_deref())
    }

    pub fn set_int64(&self, bucket: &str, key: &str, value: i64) -> Result<()> {
        self.add(bucket, key.as_bytes(), &codec::encode_i64(value))
    }

    pub fn uint64(&self, bucket: &str, key: &str) -> Result<u64> {
        codec::decode_u64(self.get(bucket, key.as_bytes())?.as_deref())
    }

    pub fn set_uint64(&self, bucket: &str, key: &str, value: u64) -> Result<()> {
        self.add(bucket, key.as_bytes(), &codec::encode_u64(value))
    }

    pub fn string(&self, bucket: &str, key: &str) -> Result<String> {
        Ok(codec::decode_string(
            self.get(bucket, key.as_bytes())?.as_deref(),
        ))
    }

    pub fn set_string(&self, bucket: &str, key: &str, value: &str) -> Result<()> {
        self.add(bucket, key.as_bytes(), value.as_bytes())
    }

    pub fn bool(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(codec::decode_bool(
            self.get(bucket, key.as_bytes())?.as_deref(),
        ))
    }

    pub fn set_bool(&self, bucket: &str, key: &str, value: bool) -> Result<()> {
        self.add(bucket, key.as_bytes(), codec::encode_bool(value))
    }

    /// Number of pairs in `bucket`; 0 when it is missing.
    pub fn count(&self, bucket: &str) -> Result<usize> {
        self.inner.view(|tx| tx.count(bucket.as_bytes()))
    }

    /// Visit pairs in key order until `f` breaks.
    pub fn iterate<F>(&self, bucket: &str, f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    {
        self.inner.view(|tx| tx.for_each(bucket.as_bytes(), f))
    }

    /// Visit the first `count` pairs in key order.
    pub fn iterate_count<F>(&self, bucket: &str, count: usize, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]),
    {
        if count == 0 {
            return Ok(());
        }
        self.inner.view(|tx| {
            for entry in tx.scan(bucket.as_bytes(), Scan::forward().limit(count))? {
                let (key, value) = entry?;
                f(&key, &value);
            }
            Ok(())
        })
    }

    /// Visit every pair in key order.
    pub fn all<F>(&self, bucket: &str, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]),
    {
        self.iterate(bucket, |k, v| {
            f(k, v);
            ControlFlow::Continue(())
        })
    }
}
