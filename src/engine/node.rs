//! SHALE - B+Tree Nodes
//! Decoded leaf and branch nodes, their page encoding and a zero-copy
//! view used for lookups.
//!
//! ## Leaf page
//! ```text
//! [header 24B][element 16B x count][packed key/value bytes]
//! element = pos u32 | flags u32 | ksize u32 | vsize u32
//! ```
//!
//! ## Branch page
//! ```text
//! [header 24B][element 16B x count][packed keys]
//! element = pos u32 | ksize u32 | child u64
//! ```
//!
//! `pos` is the absolute offset of the key from the start of the page.
//! A branch element's key is the smallest key reachable through its child.

use std::cmp::Ordering;

use bytes::{Buf, BufMut};

use crate::error::{Result, ShaleError};
use crate::types::{Key, PageId, Value};

use super::page::{Page, PageKind, PAGE_HEADER_SIZE};

/// Leaf entry flag: the value is a nested bucket header.
pub const BUCKET_FLAG: u32 = 0x01;

/// Size of one element in the element table of either node kind.
pub const ELEMENT_SIZE: usize = 16;

/// A key/value pair stored in a leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: Key,
    pub value: Value,
    pub flags: u32,
}

impl LeafEntry {
    pub fn is_bucket(&self) -> bool {
        self.flags & BUCKET_FLAG != 0
    }
}

/// A separator key and the child page it routes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchEntry {
    pub key: Key,
    pub child: PageId,
}

/// A decoded tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf(Vec<LeafEntry>),
    Branch(Vec<BranchEntry>),
}

impl Node {
    /// Decode a leaf or branch page.
    pub fn decode(page: &Page) -> Result<Self> {
        let view = NodeView::new(page)?;
        let count = view.len();
        if view.is_leaf() {
            let mut entries = Vec::with_capacity(count);
            for i in 0..count {
                entries.push(LeafEntry {
                    key: view.key(i)?.to_vec(),
                    value: view.value(i)?.to_vec(),
                    flags: view.flags(i)?,
                });
            }
            Ok(Node::Leaf(entries))
        } else {
            let mut entries = Vec::with_capacity(count);
            for i in 0..count {
                entries.push(BranchEntry {
                    key: view.key(i)?.to_vec(),
                    child: view.child(i)?,
                });
            }
            Ok(Node::Branch(entries))
        }
    }

    pub fn kind(&self) -> PageKind {
        match self {
            Node::Leaf(_) => PageKind::Leaf,
            Node::Branch(_) => PageKind::Branch,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Node::Leaf(entries) => entries.len(),
            Node::Branch(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest key in the node, empty for an empty node.
    pub fn first_key(&self) -> &[u8] {
        match self {
            Node::Leaf(entries) => entries.first().map_or(&[][..], |e| &e.key),
            Node::Branch(entries) => entries.first().map_or(&[][..], |e| &e.key),
        }
    }

    /// Bytes needed to encode the node, header included.
    pub fn encoded_size(&self) -> usize {
        let payload: usize = match self {
            Node::Leaf(entries) => entries
                .iter()
                .map(|e| ELEMENT_SIZE + e.key.len() + e.value.len())
                .sum(),
            Node::Branch(entries) => entries.iter().map(|e| ELEMENT_SIZE + e.key.len()).sum(),
        };
        PAGE_HEADER_SIZE + payload
    }

    /// Physical pages needed to hold the node.
    pub fn pages_needed(&self, page_size: usize) -> usize {
        self.encoded_size().div_ceil(page_size).max(1)
    }

    /// Write the node into a page created with at least `pages_needed` pages.
    pub fn encode_into(&self, page: &mut Page) {
        let count = self.len();
        page.set_count(count as u16);

        let table_end = PAGE_HEADER_SIZE + count * ELEMENT_SIZE;
        let (head, data) = page.data.split_at_mut(table_end);
        let mut table = &mut head[PAGE_HEADER_SIZE..];
        let mut pos = table_end;
        let mut cursor = 0;

        let mut pack = |bytes: &[u8], cursor: &mut usize| {
            data[*cursor..*cursor + bytes.len()].copy_from_slice(bytes);
            *cursor += bytes.len();
        };

        match self {
            Node::Leaf(entries) => {
                for e in entries {
                    table.put_u32_le(pos as u32);
                    table.put_u32_le(e.flags);
                    table.put_u32_le(e.key.len() as u32);
                    table.put_u32_le(e.value.len() as u32);
                    pack(&e.key, &mut cursor);
                    pack(&e.value, &mut cursor);
                    pos += e.key.len() + e.value.len();
                }
            }
            Node::Branch(entries) => {
                for e in entries {
                    table.put_u32_le(pos as u32);
                    table.put_u32_le(e.key.len() as u32);
                    table.put_u64_le(e.child);
                    pack(&e.key, &mut cursor);
                    pos += e.key.len();
                }
            }
        }
    }

    /// Append the entries of a right-hand sibling of the same kind.
    pub fn absorb(&mut self, right: Node) -> Result<()> {
        match (self, right) {
            (Node::Leaf(left), Node::Leaf(right)) => left.extend(right),
            (Node::Branch(left), Node::Branch(right)) => left.extend(right),
            _ => {
                return Err(ShaleError::Corruption(
                    "sibling nodes have different kinds".to_string(),
                ))
            }
        }
        Ok(())
    }

    /// Split at the median, recursively, until every part fits one page.
    /// A single entry larger than a page stays alone in an overflow node.
    pub fn split(self, page_size: usize) -> Vec<Node> {
        if self.len() < 2 || self.encoded_size() <= page_size {
            return vec![self];
        }
        let mid = self.len() / 2;
        let (left, right) = match self {
            Node::Leaf(mut entries) => {
                let right = entries.split_off(mid);
                (Node::Leaf(entries), Node::Leaf(right))
            }
            Node::Branch(mut entries) => {
                let right = entries.split_off(mid);
                (Node::Branch(entries), Node::Branch(right))
            }
        };
        let mut parts = left.split(page_size);
        parts.extend(right.split(page_size));
        parts
    }
}

/// Read-only view over an encoded node page.
pub struct NodeView<'a> {
    data: &'a [u8],
    leaf: bool,
    count: usize,
}

impl<'a> NodeView<'a> {
    pub fn new(page: &'a Page) -> Result<Self> {
        let leaf = match page.kind()? {
            PageKind::Leaf => true,
            PageKind::Branch => false,
            other => {
                return Err(ShaleError::Corruption(format!(
                    "page {} is a {:?} page, expected a tree node",
                    page.id, other
                )))
            }
        };
        let count = page.count() as usize;
        if PAGE_HEADER_SIZE + count * ELEMENT_SIZE > page.data.len() {
            return Err(ShaleError::Corruption(format!(
                "page {} element table overflows the page",
                page.id
            )));
        }
        Ok(Self {
            data: &page.data,
            leaf,
            count,
        })
    }

    pub fn is_leaf(&self) -> bool {
        self.leaf
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn element(&self, i: usize) -> &'a [u8] {
        let start = PAGE_HEADER_SIZE + i * ELEMENT_SIZE;
        &self.data[start..start + ELEMENT_SIZE]
    }

    fn slice(&self, pos: usize, len: usize) -> Result<&'a [u8]> {
        pos.checked_add(len)
            .filter(|&end| end <= self.data.len())
            .map(|end| &self.data[pos..end])
            .ok_or_else(|| ShaleError::Corruption("node entry out of bounds".to_string()))
    }

    pub fn key(&self, i: usize) -> Result<&'a [u8]> {
        let mut el = self.element(i);
        let pos = el.get_u32_le() as usize;
        let ksize = if self.leaf {
            el.advance(4);
            el.get_u32_le()
        } else {
            el.get_u32_le()
        };
        self.slice(pos, ksize as usize)
    }

    pub fn value(&self, i: usize) -> Result<&'a [u8]> {
        let mut el = self.element(i);
        let pos = el.get_u32_le() as usize;
        el.advance(4);
        let ksize = el.get_u32_le() as usize;
        let vsize = el.get_u32_le() as usize;
        self.slice(pos + ksize, vsize)
    }

    pub fn flags(&self, i: usize) -> Result<u32> {
        let mut el = self.element(i);
        el.advance(4);
        Ok(el.get_u32_le())
    }

    pub fn child(&self, i: usize) -> Result<PageId> {
        let mut el = self.element(i);
        el.advance(8);
        Ok(el.get_u64_le())
    }

    /// Binary search for `key`: `Ok(index)` on a hit, `Err(insert_at)` otherwise.
    pub fn search(&self, key: &[u8]) -> Result<std::result::Result<usize, usize>> {
        let (mut lo, mut hi) = (0, self.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key(mid)?.cmp(key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// Index of the child that covers `key` in a branch.
    pub fn route(&self, key: &[u8]) -> Result<usize> {
        Ok(match self.search(key)? {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        })
    }
}

/// Child index covering `key` among decoded branch entries.
pub fn route(entries: &[BranchEntry], key: &[u8]) -> usize {
    match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
        Ok(i) => i,
        Err(i) => i.saturating_sub(1),
    }
}
