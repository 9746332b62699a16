//! SHALE - Copy-on-Write B+Tree
//! Point lookup, insert and delete over page-addressed nodes.
//!
//! Every mutation rewrites the root-to-leaf path. Pages already written by
//! the running transaction are rewritten in place; committed pages are
//! freed and replaced by newly allocated ones, so a committed snapshot is
//! never modified. Operations return the new root id.

use crate::error::{Result, ShaleError};
use crate::types::{PageId, Value};

use super::bucket::BucketHeader;
use super::node::{route, BranchEntry, LeafEntry, Node, NodeView};
use super::page::Page;

/// Read access to pages by id.
pub trait PageSource {
    fn page(&self, id: PageId) -> Result<Page>;
    fn page_size(&self) -> usize;
}

/// Page allocation and buffered writes for a write transaction.
pub trait PageSink: PageSource {
    /// Reserve `pages` contiguous pages.
    fn allocate(&mut self, pages: usize) -> Result<PageId>;
    /// Buffer a page for the commit.
    fn write(&mut self, page: Page) -> Result<()>;
    /// Release a logical page that is no longer referenced.
    fn free(&mut self, id: PageId, pages: usize);
    /// Whether the page was written by the running transaction.
    fn is_dirty(&self, id: PageId) -> bool;
}

/// A freshly written node as seen by its parent.
#[derive(Debug, Clone)]
struct Child {
    key: Vec<u8>,
    id: PageId,
    size: usize,
    len: usize,
    leaf: bool,
}

impl Child {
    fn of(node: &Node, id: PageId) -> Self {
        Self {
            key: node.first_key().to_vec(),
            id,
            size: node.encoded_size(),
            len: node.len(),
            leaf: node.is_leaf(),
        }
    }

    /// Below a quarter page, or too few entries to be useful.
    fn underfilled(&self, page_size: usize) -> bool {
        let min_len = if self.leaf { 1 } else { 2 };
        self.size < page_size / 4 || self.len < min_len
    }
}

/// Allocate an empty leaf to serve as a new tree's root.
pub fn create_root<S: PageSink + ?Sized>(sink: &mut S) -> Result<PageId> {
    let children = write_node(sink, Node::Leaf(Vec::new()), None)?;
    children
        .first()
        .map(|c| c.id)
        .ok_or_else(|| ShaleError::Corruption("empty root was not written".to_string()))
}

/// Look up `key`, returning its value and entry flags.
pub fn get<S: PageSource + ?Sized>(
    src: &S,
    root: PageId,
    key: &[u8],
) -> Result<Option<(Value, u32)>> {
    let mut id = root;
    loop {
        let page = src.page(id)?;
        let view = NodeView::new(&page)?;
        if view.is_leaf() {
            return Ok(match view.search(key)? {
                Ok(i) => Some((view.value(i)?.to_vec(), view.flags(i)?)),
                Err(_) => None,
            });
        }
        if view.is_empty() {
            return Err(ShaleError::Corruption(format!("branch page {id} is empty")));
        }
        id = view.child(view.route(key)?)?;
    }
}

/// Insert or overwrite `key`. Returns the new root.
pub fn put<S: PageSink + ?Sized>(
    sink: &mut S,
    root: PageId,
    key: &[u8],
    value: &[u8],
    flags: u32,
) -> Result<PageId> {
    let entry = LeafEntry {
        key: key.to_vec(),
        value: value.to_vec(),
        flags,
    };
    let children = insert(sink, root, entry)?;
    grow_root(sink, children)
}

/// Remove `key`. Returns the new root and the removed value with its flags.
pub fn delete<S: PageSink + ?Sized>(
    sink: &mut S,
    root: PageId,
    key: &[u8],
) -> Result<(PageId, Option<(Value, u32)>)> {
    let Some((children, removed)) = remove(sink, root, key)? else {
        return Ok((root, None));
    };
    let mut root = grow_root(sink, children)?;

    // A root branch with a single child is replaced by that child.
    loop {
        let page = sink.page(root)?;
        match Node::decode(&page)? {
            Node::Branch(entries) if entries.len() == 1 => {
                sink.free(page.id, page.page_count());
                root = entries[0].child;
            }
            _ => break,
        }
    }
    Ok((root, Some(removed)))
}

/// Free every page of the tree, nested bucket trees included.
pub fn free_tree<S: PageSink + ?Sized>(sink: &mut S, root: PageId) -> Result<()> {
    let page = sink.page(root)?;
    match Node::decode(&page)? {
        Node::Leaf(entries) => {
            for entry in entries.iter().filter(|e| e.is_bucket()) {
                free_tree(sink, BucketHeader::decode(&entry.value)?.root)?;
            }
        }
        Node::Branch(entries) => {
            for entry in &entries {
                free_tree(sink, entry.child)?;
            }
        }
    }
    sink.free(page.id, page.page_count());
    Ok(())
}

fn insert<S: PageSink + ?Sized>(sink: &mut S, id: PageId, entry: LeafEntry) -> Result<Vec<Child>> {
    let page = sink.page(id)?;
    let mut node = Node::decode(&page)?;
    match &mut node {
        Node::Leaf(entries) => {
            match entries.binary_search_by(|e| e.key.cmp(&entry.key)) {
                Ok(i) => entries[i] = entry,
                Err(i) => entries.insert(i, entry),
            }
        }
        Node::Branch(entries) => {
            if entries.is_empty() {
                return Err(ShaleError::Corruption(format!("branch page {id} is empty")));
            }
            let i = route(entries, &entry.key);
            let child = entries[i].child;
            let replaced = insert(sink, child, entry)?;

            // The child was rewritten in place under an unchanged key.
            if let [only] = replaced.as_slice() {
                if only.id == child && (only.key.is_empty() || only.key == entries[i].key) {
                    return Ok(vec![Child::of(&node, id)]);
                }
            }
            splice(entries, i, replaced);
        }
    }
    write_node(sink, node, Some(&page))
}

fn remove<S: PageSink + ?Sized>(
    sink: &mut S,
    id: PageId,
    key: &[u8],
) -> Result<Option<(Vec<Child>, (Value, u32))>> {
    let page = sink.page(id)?;
    let mut node = Node::decode(&page)?;
    let removed = match &mut node {
        Node::Leaf(entries) => match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
            Ok(i) => {
                let entry = entries.remove(i);
                (entry.value, entry.flags)
            }
            Err(_) => return Ok(None),
        },
        Node::Branch(entries) => {
            if entries.is_empty() {
                return Err(ShaleError::Corruption(format!("branch page {id} is empty")));
            }
            let i = route(entries, key);
            let Some((replaced, removed)) = remove(sink, entries[i].child, key)? else {
                return Ok(None);
            };
            let underfilled = match replaced.as_slice() {
                [only] => only.underfilled(sink.page_size()),
                _ => false,
            };
            splice(entries, i, replaced);
            if underfilled && entries.len() > 1 {
                let left = if i > 0 { i - 1 } else { i };
                rebalance(sink, entries, left)?;
            }
            removed
        }
    };
    Ok(Some((write_node(sink, node, Some(&page))?, removed)))
}

/// Merge the children at `left` and `left + 1`, redistributing at the
/// median when the merged node would not fit a page.
fn rebalance<S: PageSink + ?Sized>(
    sink: &mut S,
    entries: &mut Vec<BranchEntry>,
    left: usize,
) -> Result<()> {
    let left_page = sink.page(entries[left].child)?;
    let right_page = sink.page(entries[left + 1].child)?;
    let mut merged = Node::decode(&left_page)?;
    merged.absorb(Node::decode(&right_page)?)?;
    sink.free(right_page.id, right_page.page_count());

    let children = write_node(sink, merged, Some(&left_page))?;
    let key = std::mem::take(&mut entries[left].key);
    let replacement: Vec<BranchEntry> = children
        .into_iter()
        .enumerate()
        .map(|(n, c)| BranchEntry {
            key: if n == 0 && c.key.is_empty() {
                key.clone()
            } else {
                c.key
            },
            child: c.id,
        })
        .collect();
    entries.splice(left..=left + 1, replacement);
    Ok(())
}

/// Replace the entry at `i` with the children it was rewritten into.
fn splice(entries: &mut Vec<BranchEntry>, i: usize, children: Vec<Child>) {
    let key = std::mem::take(&mut entries[i].key);
    let replacement: Vec<BranchEntry> = children
        .into_iter()
        .enumerate()
        .map(|(n, c)| BranchEntry {
            // An emptied child keeps its old separator.
            key: if n == 0 && c.key.is_empty() {
                key.clone()
            } else {
                c.key
            },
            child: c.id,
        })
        .collect();
    entries.splice(i..=i, replacement);
}

/// Add branch levels until a single node holds every child.
fn grow_root<S: PageSink + ?Sized>(sink: &mut S, mut children: Vec<Child>) -> Result<PageId> {
    loop {
        match children.as_slice() {
            [] => return Err(ShaleError::Corruption("tree has no root".to_string())),
            [only] => return Ok(only.id),
            _ => {}
        }
        let node = Node::Branch(
            children
                .into_iter()
                .map(|c| BranchEntry {
                    key: c.key,
                    child: c.id,
                })
                .collect(),
        );
        children = write_node(sink, node, None)?;
    }
}

/// Encode `node` (split as needed) and buffer it, reusing `old` when the
/// running transaction already owns it.
fn write_node<S: PageSink + ?Sized>(
    sink: &mut S,
    node: Node,
    old: Option<&Page>,
) -> Result<Vec<Child>> {
    let page_size = sink.page_size();
    let mut reusable = None;
    if let Some(old) = old {
        if sink.is_dirty(old.id) {
            reusable = Some((old.id, old.page_count()));
        } else {
            sink.free(old.id, old.page_count());
        }
    }

    let parts = node.split(page_size);
    let mut children = Vec::with_capacity(parts.len());
    for part in parts {
        let pages = part.pages_needed(page_size);
        let id = match reusable.take() {
            Some((id, count)) if count == pages => id,
            Some((id, count)) => {
                sink.free(id, count);
                sink.allocate(pages)?
            }
            None => sink.allocate(pages)?,
        };
        let mut page = Page::new(id, page_size, pages, part.kind());
        part.encode_into(&mut page);
        children.push(Child::of(&part, id));
        sink.write(page)?;
    }
    if let Some((id, count)) = reusable {
        sink.free(id, count);
    }
    Ok(children)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet, HashMap};

    use proptest::prelude::*;

    use crate::engine::node::BUCKET_FLAG;

    /// In-memory page store with a commit boundary, for tree tests.
    pub(crate) struct MemPages {
        page_size: usize,
        committed: HashMap<PageId, Page>,
        dirty: HashMap<PageId, Page>,
        free: BTreeSet<PageId>,
        pending: Vec<PageId>,
        next: PageId,
    }

    impl MemPages {
        pub(crate) fn new(page_size: usize) -> Self {
            Self {
                page_size,
                committed: HashMap::new(),
                dirty: HashMap::new(),
                free: BTreeSet::new(),
                pending: Vec::new(),
                next: 0,
            }
        }

        /// Make the dirty pages durable and release pending frees.
        pub(crate) fn commit(&mut self) {
            self.committed.extend(self.dirty.drain());
            for id in self.pending.drain(..) {
                self.committed.remove(&id);
                self.free.insert(id);
            }
        }

        pub(crate) fn live_pages(&self) -> usize {
            self.committed.len() + self.dirty.len()
        }
    }

    impl PageSource for MemPages {
        fn page(&self, id: PageId) -> Result<Page> {
            self.dirty
                .get(&id)
                .or_else(|| self.committed.get(&id))
                .cloned()
                .ok_or_else(|| ShaleError::Corruption(format!("missing page {id}")))
        }

        fn page_size(&self) -> usize {
            self.page_size
        }
    }

    impl PageSink for MemPages {
        fn allocate(&mut self, pages: usize) -> Result<PageId> {
            if pages == 1 {
                if let Some(id) = self.free.pop_first() {
                    return Ok(id);
                }
            }
            let id = self.next;
            self.next += pages as u64;
            Ok(id)
        }

        fn write(&mut self, mut page: Page) -> Result<()> {
            page.seal();
            self.dirty.insert(page.id, page);
            Ok(())
        }

        fn free(&mut self, id: PageId, _pages: usize) {
            if self.dirty.remove(&id).is_some() {
                self.free.insert(id);
            } else {
                self.pending.push(id);
            }
        }

        fn is_dirty(&self, id: PageId) -> bool {
            self.dirty.contains_key(&id)
        }
    }

    fn key(i: u32) -> Vec<u8> {
        format!("key-{i:06}").into_bytes()
    }

    fn depth(pages: &MemPages, root: PageId) -> usize {
        match Node::decode(&pages.page(root).unwrap()).unwrap() {
            Node::Leaf(_) => 1,
            Node::Branch(entries) => 1 + depth(pages, entries[0].child),
        }
    }

    fn check_invariants(pages: &MemPages, id: PageId, lower: Option<&[u8]>) -> Vec<Vec<u8>> {
        match Node::decode(&pages.page(id).unwrap()).unwrap() {
            Node::Leaf(entries) => {
                let keys: Vec<Vec<u8>> = entries.into_iter().map(|e| e.key).collect();
                assert!(keys.windows(2).all(|w| w[0] < w[1]));
                if let (Some(lower), Some(first)) = (lower, keys.first()) {
                    assert!(first.as_slice() >= lower);
                }
                keys
            }
            Node::Branch(entries) => {
                assert!(!entries.is_empty());
                let mut keys = Vec::new();
                for (n, entry) in entries.iter().enumerate() {
                    let bound = if n == 0 { lower } else { Some(entry.key.as_slice()) };
                    keys.extend(check_invariants(pages, entry.child, bound));
                }
                assert!(keys.windows(2).all(|w| w[0] < w[1]));
                keys
            }
        }
    }

    #[test]
    fn test_put_get() {
        let mut pages = MemPages::new(1024);
        let mut root = create_root(&mut pages).unwrap();
        root = put(&mut pages, root, b"alpha", b"1", 0).unwrap();
        root = put(&mut pages, root, b"beta", b"2", 0).unwrap();
        root = put(&mut pages, root, b"alpha", b"3", 0).unwrap();

        assert_eq!(get(&pages, root, b"alpha").unwrap(), Some((b"3".to_vec(), 0)));
        assert_eq!(get(&pages, root, b"beta").unwrap(), Some((b"2".to_vec(), 0)));
        assert_eq!(get(&pages, root, b"gamma").unwrap(), None);
    }

    #[test]
    fn test_splits_grow_the_tree() {
        let mut pages = MemPages::new(1024);
        let mut root = create_root(&mut pages).unwrap();
        for i in 0..2000 {
            root = put(&mut pages, root, &key(i), b"some value bytes", 0).unwrap();
        }
        assert!(depth(&pages, root) >= 3);
        assert_eq!(check_invariants(&pages, root, None).len(), 2000);
        for i in (0..2000).step_by(97) {
            assert!(get(&pages, root, &key(i)).unwrap().is_some());
        }
    }

    #[test]
    fn test_mass_delete_merges_back() {
        let mut pages = MemPages::new(1024);
        let mut root = create_root(&mut pages).unwrap();
        for i in 0..1500 {
            root = put(&mut pages, root, &key(i), b"v", 0).unwrap();
        }
        pages.commit();
        let full = pages.live_pages();

        for i in 0..1490 {
            let (new_root, removed) = delete(&mut pages, root, &key(i)).unwrap();
            assert_eq!(removed, Some((b"v".to_vec(), 0)));
            root = new_root;
        }
        pages.commit();

        assert_eq!(check_invariants(&pages, root, None).len(), 10);
        assert!(pages.live_pages() < full / 4);
        assert!(depth(&pages, root) <= 2);
    }

    #[test]
    fn test_delete_missing_key_keeps_root() {
        let mut pages = MemPages::new(1024);
        let mut root = create_root(&mut pages).unwrap();
        root = put(&mut pages, root, b"a", b"1", 0).unwrap();
        let (same, removed) = delete(&mut pages, root, b"zzz").unwrap();
        assert_eq!(same, root);
        assert!(removed.is_none());
    }

    #[test]
    fn test_committed_root_is_never_rewritten() {
        let mut pages = MemPages::new(1024);
        let mut root = create_root(&mut pages).unwrap();
        root = put(&mut pages, root, b"a", b"1", 0).unwrap();
        pages.commit();

        let snapshot = pages.page(root).unwrap();
        let new_root = put(&mut pages, root, b"b", b"2", 0).unwrap();
        assert_ne!(new_root, root);
        assert_eq!(pages.committed.get(&root), Some(&snapshot));

        // Within one transaction the dirty root is rewritten in place.
        let again = put(&mut pages, new_root, b"c", b"3", 0).unwrap();
        assert_eq!(again, new_root);
    }

    #[test]
    fn test_large_values_overflow() {
        let mut pages = MemPages::new(1024);
        let mut root = create_root(&mut pages).unwrap();
        let big = vec![0xAB; 10 * 1024];
        root = put(&mut pages, root, b"big", &big, 0).unwrap();
        root = put(&mut pages, root, b"small", b"s", 0).unwrap();
        assert_eq!(get(&pages, root, b"big").unwrap().unwrap().0, big);
        let (root, _) = delete(&mut pages, root, b"big").unwrap();
        assert!(get(&pages, root, b"big").unwrap().is_none());
        assert!(get(&pages, root, b"small").unwrap().is_some());
    }

    #[test]
    fn test_free_tree_releases_nested_buckets() {
        let mut pages = MemPages::new(1024);
        let mut inner = create_root(&mut pages).unwrap();
        for i in 0..200 {
            inner = put(&mut pages, inner, &key(i), b"x", 0).unwrap();
        }
        let header = BucketHeader { root: inner, sequence: 0 };
        let mut outer = create_root(&mut pages).unwrap();
        outer = put(&mut pages, outer, b"nested", &header.encode(), BUCKET_FLAG).unwrap();
        pages.commit();
        assert!(pages.live_pages() > 2);

        free_tree(&mut pages, outer).unwrap();
        pages.commit();
        assert_eq!(pages.live_pages(), 0);
    }

    proptest! {
        #[test]
        fn prop_matches_btreemap(ops in proptest::collection::vec((any::<bool>(), 0u32..400, 0usize..120), 1..400)) {
            let mut pages = MemPages::new(1024);
            let mut root = create_root(&mut pages).unwrap();
            let mut model = BTreeMap::new();

            for (n, (is_put, k, len)) in ops.into_iter().enumerate() {
                let k = key(k);
                if is_put {
                    let value = vec![(n % 251) as u8; len];
                    root = put(&mut pages, root, &k, &value, 0).unwrap();
                    model.insert(k, value);
                } else {
                    let (new_root, removed) = delete(&mut pages, root, &k).unwrap();
                    root = new_root;
                    prop_assert_eq!(removed.map(|(v, _)| v), model.remove(&k));
                }
                if n % 50 == 0 {
                    pages.commit();
                }
            }

            let keys = check_invariants(&pages, root, None);
            let expected: Vec<Vec<u8>> = model.keys().cloned().collect();
            prop_assert_eq!(keys, expected);
            for (k, v) in &model {
                prop_assert_eq!(get(&pages, root, k).unwrap().map(|(v, _)| v), Some(v.clone()));
            }
        }
    }
}
