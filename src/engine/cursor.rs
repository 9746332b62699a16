//! SHALE - Cursors
//! Ordered traversal of a tree within one transaction.
//!
//! A cursor keeps the root-to-leaf path it is positioned on. Entries that
//! hold nested bucket headers are skipped by the public positioning calls.

use crate::error::{Result, ShaleError};
use crate::types::{Direction, Key, PageId, Scan, Value};

use super::btree::PageSource;
use super::node::{route, LeafEntry, Node};

struct Frame {
    node: Node,
    index: usize,
}

/// A positioned walk over one tree.
pub struct Cursor<'t, S: PageSource + ?Sized> {
    src: &'t S,
    root: PageId,
    stack: Vec<Frame>,
}

impl<'t, S: PageSource + ?Sized> Cursor<'t, S> {
    pub(crate) fn new(src: &'t S, root: PageId) -> Self {
        Self {
            src,
            root,
            stack: Vec::new(),
        }
    }

    /// Move to the smallest key.
    pub fn first(&mut self) -> Result<Option<(Key, Value)>> {
        let found = self.first_entry()?;
        self.skip_buckets(found, Direction::Forward)
    }

    /// Move to the largest key.
    pub fn last(&mut self) -> Result<Option<(Key, Value)>> {
        let root = self.load(self.root)?;
        let index = root.len().saturating_sub(1);
        self.stack.clear();
        self.stack.push(Frame { node: root, index });
        let found = self.move_back(false)?;
        self.skip_buckets(found, Direction::Reverse)
    }

    /// Move to the first key >= `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<(Key, Value)>> {
        let index = self.descend_to(key)?;
        if let Some(top) = self.stack.last_mut() {
            top.index = match index {
                Ok(i) | Err(i) => i,
            };
        }
        let found = self.move_forward(false)?;
        self.skip_buckets(found, Direction::Forward)
    }

    /// Move to the last key <= `key`.
    pub fn seek_le(&mut self, key: &[u8]) -> Result<Option<(Key, Value)>> {
        let index = self.descend_to(key)?;
        let step = match index {
            Ok(i) => {
                self.set_leaf_index(i);
                false
            }
            Err(0) => {
                self.set_leaf_index(0);
                true
            }
            Err(i) => {
                self.set_leaf_index(i - 1);
                false
            }
        };
        let found = self.move_back(step)?;
        self.skip_buckets(found, Direction::Reverse)
    }

    /// Advance to the next key.
    pub fn next(&mut self) -> Result<Option<(Key, Value)>> {
        let found = self.next_entry()?;
        self.skip_buckets(found, Direction::Forward)
    }

    /// Step back to the previous key.
    pub fn prev(&mut self) -> Result<Option<(Key, Value)>> {
        let found = self.move_back(true)?;
        self.skip_buckets(found, Direction::Reverse)
    }

    /// Smallest entry, bucket entries included.
    pub(crate) fn first_entry(&mut self) -> Result<Option<LeafEntry>> {
        let root = self.load(self.root)?;
        self.stack.clear();
        self.stack.push(Frame {
            node: root,
            index: 0,
        });
        self.move_forward(false)
    }

    /// Next entry, bucket entries included.
    pub(crate) fn next_entry(&mut self) -> Result<Option<LeafEntry>> {
        self.move_forward(true)
    }

    fn skip_buckets(
        &mut self,
        mut found: Option<LeafEntry>,
        direction: Direction,
    ) -> Result<Option<(Key, Value)>> {
        loop {
            match found {
                Some(entry) if entry.is_bucket() => {
                    found = match direction {
                        Direction::Forward => self.move_forward(true)?,
                        Direction::Reverse => self.move_back(true)?,
                    };
                }
                Some(entry) => return Ok(Some((entry.key, entry.value))),
                None => return Ok(None),
            }
        }
    }

    fn load(&self, id: PageId) -> Result<Node> {
        Node::decode(&self.src.page(id)?)
    }

    /// Walk from the root to the leaf covering `key`, leaving the path on
    /// the stack. Returns the search result within the leaf.
    fn descend_to(&mut self, key: &[u8]) -> Result<std::result::Result<usize, usize>> {
        self.stack.clear();
        let mut id = self.root;
        loop {
            let node = self.load(id)?;
            match &node {
                Node::Branch(entries) => {
                    if entries.is_empty() {
                        return Err(ShaleError::Corruption(format!("branch page {id} is empty")));
                    }
                    let index = route(entries, key);
                    id = entries[index].child;
                    self.stack.push(Frame { node, index });
                }
                Node::Leaf(entries) => {
                    let found = entries.binary_search_by(|e| e.key.as_slice().cmp(key));
                    self.stack.push(Frame { node, index: 0 });
                    return Ok(found);
                }
            }
        }
    }

    fn set_leaf_index(&mut self, index: usize) {
        if let Some(top) = self.stack.last_mut() {
            top.index = index;
        }
    }

    /// Settle on the entry at the current position, moving forward past
    /// exhausted nodes. With `step` the position advances first.
    fn move_forward(&mut self, mut step: bool) -> Result<Option<LeafEntry>> {
        loop {
            if step {
                let Some(top) = self.stack.last_mut() else {
                    return Ok(None);
                };
                top.index += 1;
                step = false;
            }
            let Some(top) = self.stack.last() else {
                return Ok(None);
            };
            if top.index >= top.node.len() {
                self.stack.pop();
                step = true;
                continue;
            }
            let child = match &top.node {
                Node::Leaf(entries) => return Ok(Some(entries[top.index].clone())),
                Node::Branch(entries) => entries[top.index].child,
            };
            let node = self.load(child)?;
            self.stack.push(Frame { node, index: 0 });
        }
    }

    /// Mirror of `move_forward` towards smaller keys.
    fn move_back(&mut self, mut step: bool) -> Result<Option<LeafEntry>> {
        loop {
            if step {
                let Some(top) = self.stack.last_mut() else {
                    return Ok(None);
                };
                if top.index == 0 {
                    self.stack.pop();
                    continue;
                }
                top.index -= 1;
                step = false;
            }
            let Some(top) = self.stack.last() else {
                return Ok(None);
            };
            let child = match &top.node {
                Node::Leaf(entries) => match entries.get(top.index) {
                    Some(entry) => return Ok(Some(entry.clone())),
                    None => {
                        step = true;
                        continue;
                    }
                },
                Node::Branch(entries) => match entries.get(top.index) {
                    Some(entry) => entry.child,
                    None => {
                        return Err(ShaleError::Corruption("branch page is empty".to_string()))
                    }
                },
            };
            let node = self.load(child)?;
            let index = node.len().saturating_sub(1);
            self.stack.push(Frame { node, index });
        }
    }
}

/// Lazy iterator over a bucket's key/value pairs.
pub struct Entries<'t, S: PageSource + ?Sized> {
    cursor: Option<Cursor<'t, S>>,
    direction: Direction,
    start: Option<Key>,
    started: bool,
    skip: usize,
    remaining: Option<usize>,
    done: bool,
}

impl<'t, S: PageSource + ?Sized> Entries<'t, S> {
    pub(crate) fn new(cursor: Cursor<'t, S>, scan: Scan) -> Self {
        Self {
            cursor: Some(cursor),
            direction: scan.direction,
            start: scan.start,
            started: false,
            skip: scan.offset,
            remaining: scan.limit,
            done: false,
        }
    }

    /// An iterator that yields nothing, for scans of missing buckets.
    pub(crate) fn empty() -> Self {
        Self {
            cursor: None,
            direction: Direction::Forward,
            start: None,
            started: true,
            skip: 0,
            remaining: None,
            done: true,
        }
    }
}

impl<'t, S: PageSource + ?Sized> Iterator for Entries<'t, S> {
    type Item = Result<(Key, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.remaining == Some(0) {
                self.done = true;
                return None;
            }
            let cursor = self.cursor.as_mut()?;
            let step = if self.started {
                match self.direction {
                    Direction::Forward => cursor.next(),
                    Direction::Reverse => cursor.prev(),
                }
            } else {
                self.started = true;
                match (self.direction, self.start.as_deref()) {
                    (Direction::Forward, None) => cursor.first(),
                    (Direction::Forward, Some(key)) => cursor.seek(key),
                    (Direction::Reverse, None) => cursor.last(),
                    (Direction::Reverse, Some(key)) => cursor.seek_le(key),
                }
            };

            match step {
                Ok(Some(entry)) => {
                    if self.skip > 0 {
                        self.skip -= 1;
                        continue;
                    }
                    if let Some(remaining) = self.remaining.as_mut() {
                        *remaining -= 1;
                    }
                    return Some(Ok(entry));
                }
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
