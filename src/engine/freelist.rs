//! SHALE - Free Page Tracking
//! Keeps the set of reusable pages and the pages freed by committed
//! transactions that open readers may still observe.
//!
//! Freed pages move through two stages:
//! - **pending**: freed by write transaction `T`, still reachable from
//!   snapshots older than `T`
//! - **free**: no open reader can reach them; `allocate` may hand them out

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShaleError};
use crate::types::{PageId, TxId};

use super::page::{Page, PageKind, PAGE_HEADER_SIZE};

/// On-disk image of the free list.
#[derive(Debug, Default, Serialize, Deserialize)]
struct FreelistImage {
    ids: Vec<PageId>,
}

/// Free-list allocator state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Freelist {
    free: BTreeSet<PageId>,
    pending: BTreeMap<TxId, Vec<PageId>>,
}

impl Freelist {
    /// Build a free list where every given page is immediately reusable.
    pub fn from_ids(ids: impl IntoIterator<Item = PageId>) -> Self {
        Self {
            free: ids.into_iter().collect(),
            pending: BTreeMap::new(),
        }
    }

    /// Reserve `count` contiguous free pages, lowest run first.
    pub fn allocate(&mut self, count: usize) -> Option<PageId> {
        let count = count.max(1) as u64;
        let mut run_start = 0;
        let mut run_len = 0;
        let mut prev: Option<PageId> = None;

        for &id in &self.free {
            match prev {
                Some(p) if id == p + 1 => run_len += 1,
                _ => {
                    run_start = id;
                    run_len = 1;
                }
            }
            prev = Some(id);
            if run_len == count {
                for page in run_start..run_start + count {
                    self.free.remove(&page);
                }
                return Some(run_start);
            }
        }
        None
    }

    /// Return pages no snapshot can see straight to the free set.
    pub fn reclaim(&mut self, id: PageId, count: usize) {
        self.free.extend(id..id + count.max(1) as u64);
    }

    /// Record pages released by transaction `txid`.
    pub fn free(&mut self, txid: TxId, id: PageId, count: usize) {
        self.pending
            .entry(txid)
            .or_default()
            .extend(id..id + count.max(1) as u64);
    }

    /// Move pending pages to the free set once no reader can observe them.
    ///
    /// Pages freed by `T` are released when no reader is open or the
    /// oldest reader's snapshot id exceeds `T`. Returns the number released.
    pub fn release(&mut self, oldest_reader: Option<TxId>) -> usize {
        let releasable: Vec<TxId> = self
            .pending
            .keys()
            .copied()
            .filter(|&txid| oldest_reader.map_or(true, |oldest| oldest > txid))
            .collect();

        let mut released = 0;
        for txid in releasable {
            if let Some(ids) = self.pending.remove(&txid) {
                released += ids.len();
                self.free.extend(ids);
            }
        }
        released
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn is_free(&self, id: PageId) -> bool {
        self.free.contains(&id)
    }

    /// Every id that becomes reusable once the database is reopened.
    fn persisted_ids(&self) -> Vec<PageId> {
        let mut ids: Vec<PageId> = self
            .free
            .iter()
            .copied()
            .chain(self.pending.values().flatten().copied())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Pages needed to persist the current list.
    pub fn pages_needed(&self, page_size: usize) -> usize {
        // bincode: u64 length prefix + one u64 per id
        let bytes = PAGE_HEADER_SIZE + 8 + 8 * (self.free.len() + self.pending_count());
        bytes.div_ceil(page_size)
    }

    /// Encode the list into a free-list page starting at `id`.
    pub fn to_page(&self, id: PageId, page_size: usize, pages: usize) -> Result<Page> {
        let image = FreelistImage {
            ids: self.persisted_ids(),
        };
        let encoded = bincode::serialize(&image)?;
        let mut page = Page::new(id, page_size, pages, PageKind::Freelist);
        if encoded.len() > page.body().len() {
            return Err(ShaleError::Serialization(format!(
                "free list of {} bytes does not fit {} pages",
                encoded.len(),
                pages
            )));
        }
        page.set_count(image.ids.len().min(u16::MAX as usize) as u16);
        page.body_mut()[..encoded.len()].copy_from_slice(&encoded);
        page.seal();
        Ok(page)
    }

    /// Decode a persisted free list; every listed page becomes free.
    pub fn from_page(page: &Page) -> Result<Self> {
        if page.kind()? != PageKind::Freelist {
            return Err(ShaleError::Corruption(format!(
                "page {} is not a free-list page",
                page.id
            )));
        }
        let image: FreelistImage = bincode::deserialize(page.body())?;
        Ok(Self::from_ids(image.ids))
    }
}
