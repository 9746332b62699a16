//! SHALE - Single-File B+Tree Key-Value Storage Engine
//!
//! An embedded key-value store that keeps everything in one file of
//! fixed-size pages, organized as copy-on-write B+Trees.
//!
//! ## Features
//! - **Copy-on-Write Pages**: Committed pages are never modified in place
//! - **Double-Buffered Meta Pages**: CRC32-checked; a torn commit falls back to the previous one
//! - **MVCC**: One writer and any number of snapshot readers, neither blocking the other
//! - **Buckets**: Named, nestable namespaces with per-bucket sequence counters
//! - **Page Reclamation**: Freed pages are reused once no reader can observe them
//! - **Metrics**: Lock-free atomic counters for observability
//! - **Store Facade**: Auto-committing bucket helpers with typed scalar accessors
//!
//! ## Example
//! ```no_run
//! use shale::{config::Config, engine::Shale};
//!
//! let db = Shale::open(Config::new("./data/shale.db")).unwrap();
//!
//! db.update(|tx| {
//!     tx.create_bucket_if_not_exists(b"widgets")?;
//!     tx.put(b"widgets", b"key", b"value")
//! })
//! .unwrap();
//!
//! let value = db.view(|tx| tx.get(b"widgets", b"key")).unwrap();
//! assert_eq!(value, Some(b"value".to_vec()));
//! ```

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod store;
pub mod types;

pub use config::Config;
pub use engine::Shale;
pub use error::{Result, ShaleError};
pub use store::Store;
