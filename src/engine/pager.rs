//! SHALE - Pager
//! Reads pages out of a memory map of the database file and writes them
//! back with positioned file I/O. The map is replaced when the file grows.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};

use crate::error::{Result, ShaleError};
use crate::types::PageId;

use super::bucket::BucketHeader;
use super::freelist::Freelist;
use super::node::Node;
use super::page::{Meta, Page, PAGE_HEADER_SIZE};

/// Growth switches from doubling to fixed steps past this size.
const MAX_GROWTH_STEP: u64 = 1 << 30;

/// Page-granular access to the single database file.
pub struct Pager {
    file: Mutex<File>,
    map: RwLock<Mmap>,
    page_size: usize,
}

impl Pager {
    /// Map an initialized database file.
    pub fn new(file: File, page_size: usize) -> Result<Self> {
        let map = map_file(&file)?;
        Ok(Self {
            file: Mutex::new(file),
            map: RwLock::new(map),
            page_size,
        })
    }

    /// Write the initial layout into an empty file:
    /// two metas, an empty free list and an empty root leaf.
    pub fn format(file: &mut File, page_size: usize) -> Result<()> {
        let root = BucketHeader {
            root: 3,
            sequence: 0,
        };
        let mut buf = Vec::with_capacity(page_size * 4);
        for txid in 0..2 {
            let meta = Meta {
                page_size: page_size as u32,
                root,
                freelist: 2,
                high_water: 4,
                txid,
            };
            buf.extend_from_slice(&meta.to_page().data);
        }
        buf.extend_from_slice(&Freelist::default().to_page(2, page_size, 1)?.data);

        let mut leaf = Page::new(3, page_size, 1, Node::Leaf(Vec::new()).kind());
        Node::Leaf(Vec::new()).encode_into(&mut leaf);
        leaf.seal();
        buf.extend_from_slice(&leaf.data);

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }

    /// Page size recorded by a meta page starting at `offset`, if its
    /// magic is intact. The value is not otherwise validated.
    pub fn probe_page_size(file: &mut File, offset: u64) -> Result<Option<usize>> {
        let mut head = [0u8; PAGE_HEADER_SIZE + 16];
        file.seek(SeekFrom::Start(offset))?;
        match file.read_exact(&mut head) {
            Ok(()) => Ok(Meta::probe_page_size(&head)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Current size of the mapped file in bytes.
    pub fn len(&self) -> u64 {
        self.map.read().len() as u64
    }

    /// Copy a logical page out of the map and verify it.
    pub fn read(&self, id: PageId) -> Result<Page> {
        let map = self.map.read();
        let start = usize::try_from(id)
            .ok()
            .and_then(|id| id.checked_mul(self.page_size))
            .filter(|start| start + PAGE_HEADER_SIZE <= map.len())
            .ok_or_else(|| ShaleError::Corruption(format!("page {id} is beyond end of file")))?;

        let overflow = u32::from_le_bytes([
            map[start + 12],
            map[start + 13],
            map[start + 14],
            map[start + 15],
        ]) as usize;
        let end = overflow
            .checked_add(1)
            .and_then(|pages| pages.checked_mul(self.page_size))
            .and_then(|len| start.checked_add(len))
            .filter(|&end| end <= map.len())
            .ok_or_else(|| {
                ShaleError::Corruption(format!("page {id} overflows end of file"))
            })?;

        let page = Page::from_bytes(id, map[start..end].to_vec());
        drop(map);
        page.verify()?;
        Ok(page)
    }

    /// Write a sealed page at its position in the file.
    pub fn write(&self, page: &Page) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page.id * self.page_size as u64))?;
        file.write_all(&page.data)?;
        Ok(())
    }

    /// Make every write so far durable.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    /// Grow the file to hold at least `required` bytes and remap it.
    /// Returns whether the file grew.
    pub fn ensure_len(&self, required: u64) -> Result<bool> {
        let current = self.len();
        if required <= current {
            return Ok(false);
        }

        let mut size = current.max(self.page_size as u64 * 4);
        while size < required {
            size += size.min(MAX_GROWTH_STEP);
        }
        let page_size = self.page_size as u64;
        size = size.div_ceil(page_size) * page_size;

        let file = self.file.lock();
        file.set_len(size)?;
        file.sync_all()?;
        let remapped = map_file(&file)?;
        *self.map.write() = remapped;

        log::debug!("Database file grown from {} to {} bytes", current, size);
        Ok(true)
    }
}

fn map_file(file: &File) -> Result<Mmap> {
    // SAFETY: the file is opened read-write by this process only and is never
    // truncated below the mapped length while the map is alive; pages a
    // snapshot can reach are never rewritten (copy-on-write).
    let map = unsafe { Mmap::map(file)? };
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::page::PageKind;
    use std::fs::OpenOptions;

    fn formatted(dir: &std::path::Path, page_size: usize) -> Pager {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join("pager.db"))
            .unwrap();
        Pager::format(&mut file, page_size).unwrap();
        Pager::new(file, page_size).unwrap()
    }

    #[test]
    fn test_format_layout() {
        let dir = tempfile::tempdir().unwrap();
        let pager = formatted(dir.path(), 4096);

        assert_eq!(pager.len(), 4 * 4096);
        let meta0 = Meta::from_page(&pager.read(0).unwrap()).unwrap();
        let meta1 = Meta::from_page(&pager.read(1).unwrap()).unwrap();
        assert_eq!(meta0.txid, 0);
        assert_eq!(meta1.txid, 1);
        assert_eq!(meta1.root.root, 3);
        assert_eq!(pager.read(2).unwrap().kind().unwrap(), PageKind::Freelist);
        assert_eq!(pager.read(3).unwrap().kind().unwrap(), PageKind::Leaf);
    }

    #[test]
    fn test_write_after_grow() {
        let dir = tempfile::tempdir().unwrap();
        let pager = formatted(dir.path(), 1024);

        assert!(pager.ensure_len(20 * 1024).unwrap());
        assert!(pager.len() >= 20 * 1024);
        assert!(!pager.ensure_len(8 * 1024).unwrap());

        let mut page = Page::new(17, 1024, 2, PageKind::Leaf);
        page.body_mut()[0] = 0x5A;
        page.seal();
        pager.write(&page).unwrap();

        let read = pager.read(17).unwrap();
        assert_eq!(read, page);
    }

    #[test]
    fn test_read_beyond_end_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let pager = formatted(dir.path(), 1024);
        assert!(matches!(pager.read(500), Err(ShaleError::Corruption(_))));
    }

    #[test]
    fn test_probe_page_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.db");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        assert_eq!(Pager::probe_page_size(&mut file, 0).unwrap(), None);
        Pager::format(&mut file, 2048).unwrap();
        assert_eq!(Pager::probe_page_size(&mut file, 0).unwrap(), Some(2048));
        assert_eq!(Pager::probe_page_size(&mut file, 2048).unwrap(), Some(2048));
    }
}
