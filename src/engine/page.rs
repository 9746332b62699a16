//! SHALE - Page Layout
//! Fixed-size pages, their header, checksums and the meta page.
//!
//! ## Page header (24 bytes)
//! ```text
//! Offset  Size  Field
//! 0       8     Page id
//! 8       1     Kind (PageKind)
//! 9       1     Flags (reserved)
//! 10      2     Element count
//! 12      4     Overflow (extra contiguous pages)
//! 16      4     CRC32 of the logical page, checksum field excluded
//! 20      4     Reserved
//! ```

use bytes::{Buf, BufMut};

use crate::error::{Result, ShaleError};
use crate::types::{PageId, TxId};

use super::bucket::BucketHeader;

/// Size of the header at the start of every logical page.
pub const PAGE_HEADER_SIZE: usize = 24;

/// Marker identifying a Shale database file.
pub const MAGIC: u32 = 0x5348_414C;

/// On-disk format version.
pub const VERSION: u32 = 1;

const CHECKSUM_RANGE: std::ops::Range<usize> = 16..20;

/// Kinds of pages stored in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageKind {
    Meta = 1,
    Freelist = 2,
    Branch = 3,
    Leaf = 4,
}

impl TryFrom<u8> for PageKind {
    type Error = ShaleError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PageKind::Meta),
            2 => Ok(PageKind::Freelist),
            3 => Ok(PageKind::Branch),
            4 => Ok(PageKind::Leaf),
            other => Err(ShaleError::Corruption(format!("unknown page kind {other}"))),
        }
    }
}

/// A logical page: one page, or several contiguous ones when it overflows.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    /// Id of the first physical page.
    pub id: PageId,
    /// Raw bytes including the header; length is a multiple of the page size.
    pub data: Vec<u8>,
}

impl Page {
    /// Create a zeroed page spanning `pages` physical pages.
    pub fn new(id: PageId, page_size: usize, pages: usize, kind: PageKind) -> Self {
        let pages = pages.max(1);
        let mut data = vec![0u8; page_size * pages];
        data[0..8].copy_from_slice(&id.to_le_bytes());
        data[8] = kind as u8;
        data[12..16].copy_from_slice(&((pages - 1) as u32).to_le_bytes());
        Self { id, data }
    }

    /// Wrap bytes read from storage.
    pub fn from_bytes(id: PageId, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    pub fn kind(&self) -> Result<PageKind> {
        PageKind::try_from(self.data[8])
    }

    pub fn count(&self) -> u16 {
        u16::from_le_bytes([self.data[10], self.data[11]])
    }

    pub fn set_count(&mut self, count: u16) {
        self.data[10..12].copy_from_slice(&count.to_le_bytes());
    }

    pub fn overflow(&self) -> u32 {
        (&self.data[12..16]).get_u32_le()
    }

    /// Number of physical pages this logical page occupies.
    pub fn page_count(&self) -> usize {
        self.overflow() as usize + 1
    }

    /// Bytes after the header.
    pub fn body(&self) -> &[u8] {
        &self.data[PAGE_HEADER_SIZE..]
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.data[PAGE_HEADER_SIZE..]
    }

    fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[..CHECKSUM_RANGE.start]);
        hasher.update(&self.data[CHECKSUM_RANGE.end..]);
        hasher.finalize()
    }

    /// Stamp the page id and checksum. Called before the page is written.
    pub fn seal(&mut self) {
        let id = self.id;
        self.data[0..8].copy_from_slice(&id.to_le_bytes());
        let checksum = self.compute_checksum();
        self.data[CHECKSUM_RANGE].copy_from_slice(&checksum.to_le_bytes());
    }

    /// Check the stored id and checksum against the page contents.
    pub fn verify(&self) -> Result<()> {
        let stored_id = (&self.data[0..8]).get_u64_le();
        if stored_id != self.id {
            return Err(ShaleError::Corruption(format!(
                "page {} carries id {}",
                self.id, stored_id
            )));
        }
        let stored = (&self.data[CHECKSUM_RANGE]).get_u32_le();
        if stored != self.compute_checksum() {
            return Err(ShaleError::Corruption(format!(
                "page {} checksum mismatch",
                self.id
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("kind", &self.kind().ok())
            .field("count", &self.count())
            .field("overflow", &self.overflow())
            .finish()
    }
}

/// Durable pointer to the current tree and free list.
///
/// Pages 0 and 1 hold the two most recent metas; a commit overwrites
/// the slot `txid % 2`, so the previous meta survives a torn write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub page_size: u32,
    /// Header of the root bucket (the bucket directory).
    pub root: BucketHeader,
    /// First page of the persisted free list.
    pub freelist: PageId,
    /// First page id that has never been allocated.
    pub high_water: PageId,
    pub txid: TxId,
}

impl Meta {
    /// Meta slot this meta is written to.
    pub fn slot(&self) -> PageId {
        self.txid % 2
    }

    pub fn to_page(&self) -> Page {
        self.to_page_in(self.slot())
    }

    /// Encode into an explicit slot. Used to overwrite a slot holding a
    /// meta that must not become current.
    pub fn to_page_in(&self, slot: PageId) -> Page {
        let page_size = self.page_size as usize;
        let mut page = Page::new(slot, page_size, 1, PageKind::Meta);
        let mut body = page.body_mut();
        body.put_u32_le(MAGIC);
        body.put_u32_le(VERSION);
        body.put_u32_le(self.page_size);
        body.put_u32_le(0);
        body.put_slice(&self.root.encode());
        body.put_u64_le(self.freelist);
        body.put_u64_le(self.high_water);
        body.put_u64_le(self.txid);
        page.seal();
        page
    }

    pub fn from_page(page: &Page) -> Result<Self> {
        page.verify()?;
        if page.kind()? != PageKind::Meta {
            return Err(ShaleError::Corruption(format!(
                "page {} is not a meta page",
                page.id
            )));
        }
        let mut body = page.body();
        if body.get_u32_le() != MAGIC {
            return Err(ShaleError::Corruption("invalid magic".to_string()));
        }
        let version = body.get_u32_le();
        if version != VERSION {
            return Err(ShaleError::Corruption(format!(
                "unsupported format version {version}"
            )));
        }
        let page_size = body.get_u32_le();
        body.advance(4);
        let root = BucketHeader::decode(&body[..BucketHeader::SIZE])?;
        body.advance(BucketHeader::SIZE);
        Ok(Self {
            page_size,
            root,
            freelist: body.get_u64_le(),
            high_water: body.get_u64_le(),
            txid: body.get_u64_le(),
        })
    }

    /// Read the page size out of the start of a file without trusting it.
    pub fn probe_page_size(head: &[u8]) -> Option<usize> {
        if head.len() < PAGE_HEADER_SIZE + 12 {
            return None;
        }
        let mut body = &head[PAGE_HEADER_SIZE..];
        if body.get_u32_le() != MAGIC {
            return None;
        }
        body.advance(4);
        Some(body.get_u32_le() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_fields() {
        let mut page = Page::new(7, 4096, 3, PageKind::Leaf);
        page.set_count(42);
        assert_eq!(page.kind().unwrap(), PageKind::Leaf);
        assert_eq!(page.count(), 42);
        assert_eq!(page.overflow(), 2);
        assert_eq!(page.page_count(), 3);
        assert_eq!(page.data.len(), 3 * 4096);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut page = Page::new(5, 4096, 1, PageKind::Leaf);
        page.body_mut()[100] = 0xAB;
        page.seal();
        assert!(page.verify().is_ok());

        page.data[PAGE_HEADER_SIZE + 50] ^= 0xFF;
        assert!(matches!(page.verify(), Err(ShaleError::Corruption(_))));
    }

    #[test]
    fn test_misplaced_page_is_rejected() {
        let mut page = Page::new(5, 4096, 1, PageKind::Leaf);
        page.seal();
        let moved = Page::from_bytes(6, page.data.clone());
        assert!(moved.verify().is_err());
    }

    #[test]
    fn test_meta_round_trip() {
        let meta = Meta {
            page_size: 4096,
            root: BucketHeader {
                root: 3,
                sequence: 9,
            },
            freelist: 2,
            high_water: 10,
            txid: 5,
        };
        let page = meta.to_page();
        assert_eq!(page.id, 1);
        assert_eq!(Meta::from_page(&page).unwrap(), meta);
        assert_eq!(Meta::probe_page_size(&page.data), Some(4096));

        let restored = meta.to_page_in(0);
        assert_eq!(restored.id, 0);
        assert_eq!(Meta::from_page(&restored).unwrap(), meta);
    }

    #[test]
    fn test_unknown_kind() {
        let mut page = Page::new(4, 1024, 1, PageKind::Leaf);
        page.data[8] = 99;
        assert!(page.kind().is_err());
    }
}
