use std::cell::Cell;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::RawRwLock as _;
use parking_lot::RawRwLock;
use tracing::debug;

use crate::buffer::BufferPoolManager;
use crate::common::{BrambleError, PageId, RecordId, Result, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::concurrency::Transaction;
use crate::storage::page::{HeaderPage, HeaderPageRef, Page};

use super::b_plus_tree_page::{
    internal_capacity, leaf_capacity, BPlusTreePage, BPlusTreePageRef, InternalPage,
    InternalPageRef, LeafPage, LeafPageRef, OpType,
};
use super::generic_key::{IndexKey, KeyComparator};
use super::index_iterator::IndexIterator;

thread_local! {
    /// How many times the current thread holds the root-id latch. The
    /// physical lock is taken on the 0 -> 1 transition and released on
    /// 1 -> 0, so nested descents on one thread do not self-deadlock.
    static ROOT_LATCH_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Concurrent B+-tree over fixed-width keys, backed by a buffer pool.
///
/// Latch-crabbing: every operation descends root-to-leaf, latching each
/// page (shared for reads, exclusive for writes) before releasing the
/// ancestors, and releases them early as soon as the child is safe -
/// i.e. cannot split (insert) or underflow (delete). Pages still held at
/// the leaf, plus any sibling taken during rebalancing, live in the
/// transaction's page set and are released together when the operation
/// commits; pages emptied by a merge are deleted at the same point.
///
/// The root page id itself is guarded by a dedicated latch so the descent
/// entry point cannot race with root splits and root collapses.
pub struct BPlusTree<K: IndexKey, C: KeyComparator<K>> {
    index_name: String,
    bpm: Arc<BufferPoolManager>,
    comparator: C,
    root_page_id: AtomicI32,
    root_id_latch: RawRwLock,
    leaf_max_size: u32,
    internal_max_size: u32,
    _key: PhantomData<K>,
}

impl<K: IndexKey, C: KeyComparator<K>> BPlusTree<K, C> {
    /// Opens (or registers) the named index with node capacities derived
    /// from the page size.
    pub fn new(index_name: &str, bpm: Arc<BufferPoolManager>, comparator: C) -> Result<Self> {
        Self::with_max_sizes(
            index_name,
            bpm,
            comparator,
            leaf_capacity::<K>(),
            internal_capacity::<K>(),
        )
    }

    /// Same as `new` but with explicit node capacities (mainly for tests,
    /// which want small fan-outs).
    pub fn with_max_sizes(
        index_name: &str,
        bpm: Arc<BufferPoolManager>,
        comparator: C,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Result<Self> {
        assert!(leaf_max_size >= 2, "leaf nodes need at least two entries");
        assert!(
            internal_max_size >= 3,
            "internal nodes need at least three children"
        );
        assert!(leaf_max_size <= leaf_capacity::<K>());
        assert!(internal_max_size <= internal_capacity::<K>());

        let tree = Self {
            index_name: index_name.to_string(),
            bpm,
            comparator,
            root_page_id: AtomicI32::new(INVALID_PAGE_ID.as_i32()),
            root_id_latch: RawRwLock::INIT,
            leaf_max_size,
            internal_max_size,
            _key: PhantomData,
        };

        let header = tree.bpm.fetch_page(HEADER_PAGE_ID)?;
        header.rlatch();
        let existing = HeaderPageRef::new(header.data()).get_root_id(&tree.index_name);
        header.runlatch();
        tree.bpm.unpin_page(HEADER_PAGE_ID, false);

        match existing {
            Some(root) => tree.root_page_id.store(root.as_i32(), Ordering::Release),
            None => tree.update_root_page_id(true)?,
        }

        Ok(tree)
    }

    pub fn is_empty(&self) -> bool {
        !self.root_page_id().is_valid()
    }

    pub fn root_page_id(&self) -> PageId {
        PageId::new(self.root_page_id.load(Ordering::Acquire))
    }

    /// Point lookup. Returns the stored value, or None when the key is
    /// absent.
    pub fn get_value(&self, key: &K, txn: &mut Transaction) -> Result<Option<RecordId>> {
        let result = self.get_value_inner(key, txn);
        let freed = self.free_pages_in_transaction(false, txn);
        let value = result?;
        freed?;
        Ok(value)
    }

    fn get_value_inner(&self, key: &K, txn: &mut Transaction) -> Result<Option<RecordId>> {
        let Some(page) = self.find_leaf_page(Some(key), OpType::Read, Some(txn))? else {
            return Ok(None);
        };
        let leaf = LeafPageRef::<K>::new(page.data());
        Ok(leaf.lookup(key, &self.comparator))
    }

    /// Inserts a unique key. Returns false (and changes nothing) when the
    /// key is already present.
    pub fn insert(&self, key: &K, value: RecordId, txn: &mut Transaction) -> Result<bool> {
        loop {
            self.lock_root_id(true);
            if self.is_empty() {
                let started = self.start_new_tree(key, value);
                self.try_unlock_root_id(true);
                started?;
                return Ok(true);
            }
            self.try_unlock_root_id(true);

            let result = self.insert_into_leaf(key, value, txn);
            let freed = self.free_pages_in_transaction(true, txn);
            match result {
                Ok(Some(inserted)) => {
                    freed?;
                    return Ok(inserted);
                }
                // The tree emptied between the root check and the descent
                Ok(None) => freed?,
                Err(e) => {
                    let _ = freed;
                    return Err(e);
                }
            }
        }
    }

    /// Deletes `key` if present; absent keys are a no-op.
    pub fn remove(&self, key: &K, txn: &mut Transaction) -> Result<()> {
        let result = self.remove_inner(key, txn);
        let freed = self.free_pages_in_transaction(true, txn);
        result?;
        freed
    }

    fn remove_inner(&self, key: &K, txn: &mut Transaction) -> Result<()> {
        let Some(page) = self.find_leaf_page(Some(key), OpType::Delete, Some(&mut *txn))? else {
            return Ok(());
        };

        let underflow = {
            let mut leaf = LeafPage::<K>::new(page.data_mut());
            leaf.remove(key, &self.comparator) < leaf.min_size()
        };
        if underflow {
            self.coalesce_or_redistribute(&page, txn)?;
        }
        Ok(())
    }

    /// Iterator positioned at the leftmost entry.
    pub fn begin(&self) -> Result<IndexIterator<K>> {
        let leaf = self.find_leaf_page(None, OpType::Read, None)?;
        self.try_unlock_root_id(false);
        Ok(IndexIterator::new(Arc::clone(&self.bpm), leaf, 0))
    }

    /// Iterator positioned at `key`, or at its successor when absent.
    pub fn begin_at(&self, key: &K) -> Result<IndexIterator<K>> {
        let leaf = self.find_leaf_page(Some(key), OpType::Read, None)?;
        self.try_unlock_root_id(false);
        let index = match &leaf {
            Some(page) => LeafPageRef::<K>::new(page.data()).key_index(key, &self.comparator),
            None => 0,
        };
        Ok(IndexIterator::new(Arc::clone(&self.bpm), leaf, index))
    }

    fn start_new_tree(&self, key: &K, value: RecordId) -> Result<()> {
        let page = self.bpm.new_page()?;
        let page_id = page.page_id();
        {
            // Unpublished page: nothing can reach it until the root id below
            // is stored, and we hold the root-id latch exclusively
            let mut leaf = LeafPage::<K>::new(page.data_mut());
            leaf.init(page_id, INVALID_PAGE_ID, self.leaf_max_size);
            leaf.insert(key, value, &self.comparator);
        }
        self.set_root_page_id(page_id);
        self.update_root_page_id(false)?;
        self.bpm.unpin_page(page_id, true);

        debug!(index = %self.index_name, root = %page_id, "started new tree");
        Ok(())
    }

    /// Returns Ok(None) when the descent found the tree empty (a concurrent
    /// delete collapsed it) and the caller should retry.
    fn insert_into_leaf(
        &self,
        key: &K,
        value: RecordId,
        txn: &mut Transaction,
    ) -> Result<Option<bool>> {
        let Some(page) = self.find_leaf_page(Some(key), OpType::Insert, Some(&mut *txn))? else {
            return Ok(None);
        };

        let duplicate = {
            let leaf = LeafPageRef::<K>::new(page.data());
            leaf.lookup(key, &self.comparator).is_some()
        };
        if duplicate {
            return Ok(Some(false));
        }

        let overflow = {
            let mut leaf = LeafPage::<K>::new(page.data_mut());
            leaf.insert(key, value, &self.comparator) > leaf.max_size()
        };
        if overflow {
            let (new_page, sep) = self.split_leaf(&page, txn)?;
            self.insert_into_parent(&page, sep, &new_page, txn)?;
        }
        Ok(Some(true))
    }

    /// Moves the upper half of an overflowing leaf into a fresh page and
    /// returns it (exclusively latched, recorded in the page set) together
    /// with the separator to push up.
    fn split_leaf(&self, page: &Arc<Page>, txn: &mut Transaction) -> Result<(Arc<Page>, K)> {
        let new_page = self.bpm.new_page()?;
        new_page.wlatch();
        txn.add_into_page_set(Arc::clone(&new_page));

        let new_page_id = new_page.page_id();
        let sep = {
            let mut old_leaf = LeafPage::<K>::new(page.data_mut());
            let mut new_leaf = LeafPage::<K>::new(new_page.data_mut());
            new_leaf.init(new_page_id, old_leaf.parent_page_id(), self.leaf_max_size);
            old_leaf.move_half_to(&mut new_leaf);
            new_leaf.key_at(0)
        };

        debug!(from = %page.page_id(), to = %new_page_id, "split leaf");
        Ok((new_page, sep))
    }

    /// Leaf-split counterpart for internal nodes; also re-parents the moved
    /// children.
    fn split_internal(&self, page: &Arc<Page>, txn: &mut Transaction) -> Result<(Arc<Page>, K)> {
        let new_page = self.bpm.new_page()?;
        new_page.wlatch();
        txn.add_into_page_set(Arc::clone(&new_page));

        let new_page_id = new_page.page_id();
        let (sep, moved) = {
            let mut old_node = InternalPage::<K>::new(page.data_mut());
            let mut new_node = InternalPage::<K>::new(new_page.data_mut());
            new_node.init(new_page_id, old_node.parent_page_id(), self.internal_max_size);
            old_node.move_half_to(&mut new_node);

            let moved: Vec<PageId> = (0..new_node.size() as usize)
                .map(|i| new_node.value_at(i))
                .collect();
            (new_node.key_at(0), moved)
        };
        for child_id in moved {
            self.reparent_child(child_id, new_page_id)?;
        }

        debug!(from = %page.page_id(), to = %new_page_id, "split internal node");
        Ok((new_page, sep))
    }

    fn insert_into_parent(
        &self,
        old_page: &Arc<Page>,
        key: K,
        new_page: &Arc<Page>,
        txn: &mut Transaction,
    ) -> Result<()> {
        let (old_is_root, parent_id, old_id) = {
            let node = BPlusTreePageRef::new(old_page.data());
            (node.is_root(), node.parent_page_id(), node.page_id())
        };
        let new_id = new_page.page_id();

        if old_is_root {
            // Grow the tree by one level. The root-id latch is still held
            // exclusively (a splitting root is never a safe child), so the
            // new root stays private until published.
            let root_page = self.bpm.new_page()?;
            let root_id = root_page.page_id();
            {
                let mut root = InternalPage::<K>::new(root_page.data_mut());
                root.init(root_id, INVALID_PAGE_ID, self.internal_max_size);
                root.populate_new_root(old_id, &key, new_id);
            }
            BPlusTreePage::new(old_page.data_mut()).set_parent_page_id(root_id);
            BPlusTreePage::new(new_page.data_mut()).set_parent_page_id(root_id);

            self.set_root_page_id(root_id);
            self.update_root_page_id(false)?;
            self.bpm.unpin_page(root_id, true);

            debug!(index = %self.index_name, root = %root_id, "grew tree with new root");
            return Ok(());
        }

        // The parent is exclusively latched from the descent and sits in
        // the page set; this fetch only adds a pin
        let parent_page = self.bpm.fetch_page(parent_id)?;
        BPlusTreePage::new(new_page.data_mut()).set_parent_page_id(parent_id);
        let overflow = {
            let mut parent = InternalPage::<K>::new(parent_page.data_mut());
            parent.insert_node_after(old_id, &key, new_id) > parent.max_size()
        };
        if overflow {
            let split = self.split_internal(&parent_page, txn);
            match split {
                Ok((new_parent, sep)) => {
                    let res = self.insert_into_parent(&parent_page, sep, &new_parent, txn);
                    if let Err(e) = res {
                        self.bpm.unpin_page(parent_id, true);
                        return Err(e);
                    }
                }
                Err(e) => {
                    self.bpm.unpin_page(parent_id, true);
                    return Err(e);
                }
            }
        }
        self.bpm.unpin_page(parent_id, true);
        Ok(())
    }

    /// Restores the minimum-occupancy invariant for an under-full node.
    /// Returns whether the node itself was emptied and scheduled for
    /// deletion.
    fn coalesce_or_redistribute(&self, page: &Arc<Page>, txn: &mut Transaction) -> Result<bool> {
        let (is_root, parent_id, node_id, node_size, node_max) = {
            let node = BPlusTreePageRef::new(page.data());
            (
                node.is_root(),
                node.parent_page_id(),
                node.page_id(),
                node.size(),
                node.max_size(),
            )
        };

        if is_root {
            let deleted = self.adjust_root(page)?;
            if deleted {
                txn.add_into_deleted_page_set(node_id);
            }
            return Ok(deleted);
        }

        let parent_page = self.bpm.fetch_page(parent_id)?;
        let result: Result<bool> = (|| {
            let (index, sibling_id) = {
                let parent = InternalPageRef::<K>::new(parent_page.data());
                let index = parent.value_index(node_id).ok_or_else(|| {
                    BrambleError::IndexCorrupted(format!("{node_id} missing from its parent"))
                })?;
                // Prefer the left sibling; the leftmost child borrows from
                // (or merges with) its right neighbour instead
                let sibling_index = if index == 0 { 1 } else { index - 1 };
                (index, parent.value_at(sibling_index))
            };

            let sibling_page =
                self.crabbing_fetch_page(sibling_id, OpType::Delete, None, Some(&mut *txn))?;
            let sibling_size = BPlusTreePageRef::new(sibling_page.data()).size();

            if node_size + sibling_size <= node_max {
                // Merge, arranged so the right node always drains into the
                // left one
                let (left, right, remove_index) = if index == 0 {
                    (page, &sibling_page, 1)
                } else {
                    (&sibling_page, page, index)
                };
                self.coalesce(left, right, &parent_page, remove_index, txn)?;
                Ok(true)
            } else {
                self.redistribute(&sibling_page, page, &parent_page, index)?;
                Ok(false)
            }
        })();
        self.bpm.unpin_page(parent_id, true);
        result
    }

    /// Drains `right` into `left`, removes the separator at `remove_index`
    /// from the parent, and recurses when the parent in turn under-flows.
    fn coalesce(
        &self,
        left: &Arc<Page>,
        right: &Arc<Page>,
        parent_page: &Arc<Page>,
        remove_index: usize,
        txn: &mut Transaction,
    ) -> Result<()> {
        let left_id = left.page_id();
        let right_id = right.page_id();
        let right_is_leaf = BPlusTreePageRef::new(right.data()).is_leaf();

        if right_is_leaf {
            let mut right_leaf = LeafPage::<K>::new(right.data_mut());
            let mut left_leaf = LeafPage::<K>::new(left.data_mut());
            right_leaf.move_all_to(&mut left_leaf);
        } else {
            let middle_key = InternalPageRef::<K>::new(parent_page.data()).key_at(remove_index);
            let moved = {
                let mut right_node = InternalPage::<K>::new(right.data_mut());
                let mut left_node = InternalPage::<K>::new(left.data_mut());
                let start = left_node.size() as usize;
                right_node.move_all_to(&mut left_node, &middle_key);
                (start..left_node.size() as usize)
                    .map(|i| left_node.value_at(i))
                    .collect::<Vec<PageId>>()
            };
            for child_id in moved {
                self.reparent_child(child_id, left_id)?;
            }
        }

        debug!(%right_id, into = %left_id, "coalesced nodes");
        txn.add_into_deleted_page_set(right_id);

        let parent_underflow = {
            let mut parent = InternalPage::<K>::new(parent_page.data_mut());
            parent.remove(remove_index);
            parent.size() <= parent.min_size()
        };
        if parent_underflow {
            self.coalesce_or_redistribute(parent_page, txn)?;
        }
        Ok(())
    }

    /// Rotates one entry from `sibling` into `node` and rewrites the parent
    /// separator between them. `index` is the node's position in the parent
    /// (0 means the sibling sits to the right).
    fn redistribute(
        &self,
        sibling: &Arc<Page>,
        node: &Arc<Page>,
        parent_page: &Arc<Page>,
        index: usize,
    ) -> Result<()> {
        let node_is_leaf = BPlusTreePageRef::new(node.data()).is_leaf();
        let node_id = node.page_id();

        if node_is_leaf {
            if index == 0 {
                {
                    let mut sib = LeafPage::<K>::new(sibling.data_mut());
                    let mut dst = LeafPage::<K>::new(node.data_mut());
                    sib.move_first_to_end_of(&mut dst);
                }
                let new_sep = LeafPageRef::<K>::new(sibling.data()).key_at(0);
                InternalPage::<K>::new(parent_page.data_mut()).set_key_at(1, &new_sep);
            } else {
                {
                    let mut sib = LeafPage::<K>::new(sibling.data_mut());
                    let mut dst = LeafPage::<K>::new(node.data_mut());
                    sib.move_last_to_front_of(&mut dst);
                }
                let new_sep = LeafPageRef::<K>::new(node.data()).key_at(0);
                InternalPage::<K>::new(parent_page.data_mut()).set_key_at(index, &new_sep);
            }
        } else if index == 0 {
            // The old separator descends into the node; the sibling's first
            // real key replaces it in the parent
            let middle = InternalPageRef::<K>::new(parent_page.data()).key_at(1);
            let new_sep = InternalPageRef::<K>::new(sibling.data()).key_at(1);
            let moved = {
                let mut sib = InternalPage::<K>::new(sibling.data_mut());
                let mut dst = InternalPage::<K>::new(node.data_mut());
                sib.move_first_to_end_of(&mut dst, &middle)
            };
            InternalPage::<K>::new(parent_page.data_mut()).set_key_at(1, &new_sep);
            self.reparent_child(moved, node_id)?;
        } else {
            let middle = InternalPageRef::<K>::new(parent_page.data()).key_at(index);
            let new_sep = {
                let sib = InternalPageRef::<K>::new(sibling.data());
                sib.key_at(sib.size() as usize - 1)
            };
            let moved = {
                let mut sib = InternalPage::<K>::new(sibling.data_mut());
                let mut dst = InternalPage::<K>::new(node.data_mut());
                sib.move_last_to_front_of(&mut dst, &middle)
            };
            InternalPage::<K>::new(parent_page.data_mut()).set_key_at(index, &new_sep);
            self.reparent_child(moved, node_id)?;
        }
        Ok(())
    }

    /// Shrinks the tree at the top: an empty root leaf empties the tree; a
    /// root with a single child hands its role down one level.
    fn adjust_root(&self, root_page: &Arc<Page>) -> Result<bool> {
        let (is_leaf, size) = {
            let node = BPlusTreePageRef::new(root_page.data());
            (node.is_leaf(), node.size())
        };

        if is_leaf {
            if size == 0 {
                self.set_root_page_id(INVALID_PAGE_ID);
                self.update_root_page_id(false)?;
                debug!(index = %self.index_name, "tree emptied");
                return Ok(true);
            }
            return Ok(false);
        }

        if size == 1 {
            let child_id = {
                let mut root = InternalPage::<K>::new(root_page.data_mut());
                root.remove_and_return_only_child()
            };
            self.set_root_page_id(child_id);
            self.update_root_page_id(false)?;

            // No latch here: the promoted child is the merge recipient this
            // thread already holds exclusively, and re-latching it would
            // self-deadlock
            let child = self.bpm.fetch_page(child_id)?;
            BPlusTreePage::new(child.data_mut()).set_parent_page_id(INVALID_PAGE_ID);
            self.bpm.unpin_page(child_id, true);

            debug!(index = %self.index_name, root = %child_id, "collapsed root");
            return Ok(true);
        }
        Ok(false)
    }

    /// Descends to the leaf responsible for `key` (or the leftmost leaf
    /// when `key` is None), applying the crabbing protocol. Returns None on
    /// an empty tree. Without a transaction (iterator path) each ancestor
    /// is released directly as the descent moves past it.
    fn find_leaf_page(
        &self,
        key: Option<&K>,
        op: OpType,
        mut txn: Option<&mut Transaction>,
    ) -> Result<Option<Arc<Page>>> {
        let exclusive = op != OpType::Read;
        self.lock_root_id(exclusive);
        if self.is_empty() {
            self.try_unlock_root_id(exclusive);
            return Ok(None);
        }

        let mut page = self.crabbing_fetch_page(self.root_page_id(), op, None, txn.as_deref_mut())?;
        loop {
            let next = {
                let node = BPlusTreePageRef::new(page.data());
                if node.is_leaf() {
                    break;
                }
                let internal = InternalPageRef::<K>::new(page.data());
                match key {
                    Some(key) => internal.lookup(key, &self.comparator),
                    None => internal.value_at(0),
                }
            };
            page = self.crabbing_fetch_page(next, op, Some(&page), txn.as_deref_mut())?;
        }
        Ok(Some(page))
    }

    /// Fetches and latches one page of the descent. When the page is safe
    /// for the operation (always, for reads) every latch acquired above it
    /// is released before going deeper.
    fn crabbing_fetch_page(
        &self,
        page_id: PageId,
        op: OpType,
        previous: Option<&Arc<Page>>,
        mut txn: Option<&mut Transaction>,
    ) -> Result<Arc<Page>> {
        let exclusive = op != OpType::Read;
        let page = self.bpm.fetch_page(page_id)?;
        if exclusive {
            page.wlatch();
        } else {
            page.rlatch();
        }

        if let Some(prev) = previous {
            let release = !exclusive || BPlusTreePageRef::new(page.data()).is_safe(op);
            if release {
                match txn.as_deref_mut() {
                    Some(txn) => self.free_pages_in_transaction(exclusive, txn)?,
                    None => {
                        self.try_unlock_root_id(exclusive);
                        let prev_id = prev.page_id();
                        if exclusive {
                            prev.wunlatch();
                        } else {
                            prev.runlatch();
                        }
                        self.bpm.unpin_page(prev_id, exclusive);
                    }
                }
            }
        }
        if let Some(txn) = txn {
            txn.add_into_page_set(Arc::clone(&page));
        }
        Ok(page)
    }

    /// Releases everything the operation holds: the root-id latch (once),
    /// then every page in the page set in acquisition order. Pages marked
    /// for deletion are deleted right after their unpin.
    fn free_pages_in_transaction(&self, exclusive: bool, txn: &mut Transaction) -> Result<()> {
        self.try_unlock_root_id(exclusive);
        while let Some(page) = txn.page_set().pop_front() {
            let page_id = page.page_id();
            if exclusive {
                page.wunlatch();
            } else {
                page.runlatch();
            }
            self.bpm.unpin_page(page_id, exclusive);
            if txn.deleted_page_set().remove(&page_id) {
                // A reader racing along the sibling chain may still hold a
                // pin; the page is unreachable from the tree either way, so
                // a refused deletion only delays reclamation
                let _ = self.bpm.delete_page(page_id);
            }
        }
        debug_assert!(txn.deleted_page_set().is_empty());
        Ok(())
    }

    /// Fetches, re-parents, and unpins one child page after its entry moved
    /// to a different internal node.
    ///
    /// Taken without a latch: the child may be a page this thread already
    /// holds exclusively (the descent leaf, when its parent merges away).
    /// Every path to the child runs through nodes held exclusively by this
    /// operation, and parent pointers are only read by writers, which
    /// cannot be inside the subtree.
    fn reparent_child(&self, child_id: PageId, parent_id: PageId) -> Result<()> {
        let child = self.bpm.fetch_page(child_id)?;
        BPlusTreePage::new(child.data_mut()).set_parent_page_id(parent_id);
        self.bpm.unpin_page(child_id, true);
        Ok(())
    }

    fn set_root_page_id(&self, page_id: PageId) {
        self.root_page_id.store(page_id.as_i32(), Ordering::Release);
    }

    /// Persists the current root page id in the header page. With
    /// `insert_record` the index's record is created first. Callers hold
    /// the root-id latch exclusively whenever the root changes, so header
    /// updates for one index never race.
    fn update_root_page_id(&self, insert_record: bool) -> Result<()> {
        let header = self.bpm.fetch_page(HEADER_PAGE_ID)?;
        header.wlatch();
        {
            let mut view = HeaderPage::new(header.data_mut());
            let root = self.root_page_id();
            if insert_record {
                if !view.insert_record(&self.index_name, root) {
                    view.update_record(&self.index_name, root);
                }
            } else {
                view.update_record(&self.index_name, root);
            }
        }
        header.wunlatch();
        self.bpm.unpin_page(HEADER_PAGE_ID, true);
        Ok(())
    }

    fn lock_root_id(&self, exclusive: bool) {
        ROOT_LATCH_DEPTH.with(|depth| {
            if depth.get() == 0 {
                if exclusive {
                    self.root_id_latch.lock_exclusive();
                } else {
                    self.root_id_latch.lock_shared();
                }
            }
            depth.set(depth.get() + 1);
        });
    }

    fn try_unlock_root_id(&self, exclusive: bool) {
        ROOT_LATCH_DEPTH.with(|depth| {
            if depth.get() == 0 {
                return;
            }
            depth.set(depth.get() - 1);
            if depth.get() == 0 {
                // This thread took the lock at the matching 0 -> 1 transition
                unsafe {
                    if exclusive {
                        self.root_id_latch.unlock_exclusive();
                    } else {
                        self.root_id_latch.unlock_shared();
                    }
                }
            }
        });
    }

    /// Rank-by-rank dump of the tree for diagnostics. Pages are fetched
    /// without latches; meant for quiescent trees.
    pub fn to_string_tree(&self, verbose: bool) -> Result<String> {
        if self.is_empty() {
            return Ok("Empty tree".to_string());
        }

        let mut out = String::new();
        let mut current: VecDeque<PageId> = VecDeque::from([self.root_page_id()]);
        let mut next: VecDeque<PageId> = VecDeque::new();

        while !current.is_empty() {
            out.push_str("| ");
            while let Some(page_id) = current.pop_front() {
                let page = self.bpm.fetch_page(page_id)?;
                let is_leaf = BPlusTreePageRef::new(page.data()).is_leaf();

                if is_leaf {
                    let leaf = LeafPageRef::<K>::new(page.data());
                    let keys: Vec<String> = (0..leaf.size() as usize)
                        .map(|i| format!("{}", DebugKey(&leaf.key_at(i))))
                        .collect();
                    if verbose {
                        out.push_str(&format!("[{page_id}] "));
                    }
                    out.push_str(&keys.join(","));
                } else {
                    let node = InternalPageRef::<K>::new(page.data());
                    let keys: Vec<String> = (1..node.size() as usize)
                        .map(|i| format!("{}", DebugKey(&node.key_at(i))))
                        .collect();
                    if verbose {
                        out.push_str(&format!("[{page_id}] "));
                    }
                    out.push_str(&keys.join(","));
                    for i in 0..node.size() as usize {
                        next.push_back(node.value_at(i));
                    }
                }
                out.push_str(" | ");
                self.bpm.unpin_page(page_id, false);
            }
            out.push('\n');
            std::mem::swap(&mut current, &mut next);
        }
        Ok(out)
    }

    /// True when every leaf sits at the same depth.
    pub fn is_balanced(&self) -> Result<bool> {
        if self.is_empty() {
            return Ok(true);
        }
        Ok(self.depth_of(self.root_page_id())?.is_some())
    }

    fn depth_of(&self, page_id: PageId) -> Result<Option<u32>> {
        let page = self.bpm.fetch_page(page_id)?;
        let result = if BPlusTreePageRef::new(page.data()).is_leaf() {
            Some(0)
        } else {
            let children: Vec<PageId> = {
                let node = InternalPageRef::<K>::new(page.data());
                (0..node.size() as usize).map(|i| node.value_at(i)).collect()
            };
            let mut depth = None;
            let mut ok = true;
            for child in children {
                match (self.depth_of(child)?, depth) {
                    (None, _) => {
                        ok = false;
                        break;
                    }
                    (Some(d), None) => depth = Some(d),
                    (Some(d), Some(expected)) if d != expected => {
                        ok = false;
                        break;
                    }
                    _ => {}
                }
            }
            if ok {
                depth.map(|d| d + 1)
            } else {
                None
            }
        };
        self.bpm.unpin_page(page_id, false);
        Ok(result)
    }

    /// Structural validation: size bounds, in-node key ordering, separator
    /// containment, and parent back-pointers. For quiescent trees.
    pub fn check_integrity(&self) -> Result<bool> {
        if self.is_empty() {
            return Ok(true);
        }
        self.check_node(self.root_page_id(), None, None, INVALID_PAGE_ID)
    }

    fn check_node(
        &self,
        page_id: PageId,
        lower: Option<&K>,
        upper: Option<&K>,
        expected_parent: PageId,
    ) -> Result<bool> {
        let page = self.bpm.fetch_page(page_id)?;
        let result = self.check_node_inner(&page, lower, upper, expected_parent);
        self.bpm.unpin_page(page_id, false);
        result
    }

    fn check_node_inner(
        &self,
        page: &Arc<Page>,
        lower: Option<&K>,
        upper: Option<&K>,
        expected_parent: PageId,
    ) -> Result<bool> {
        let header = BPlusTreePageRef::new(page.data());
        if header.parent_page_id() != expected_parent {
            return Ok(false);
        }
        let size = header.size() as usize;
        if expected_parent.is_valid()
            && ((size as u32) < header.min_size() || (size as u32) > header.max_size())
        {
            return Ok(false);
        }

        let in_bounds = |k: &K| {
            lower.map_or(true, |lo| self.comparator.compare(k, lo).is_ge())
                && upper.map_or(true, |hi| self.comparator.compare(k, hi).is_lt())
        };

        if header.is_leaf() {
            let leaf = LeafPageRef::<K>::new(page.data());
            for i in 0..size {
                let k = leaf.key_at(i);
                if !in_bounds(&k) {
                    return Ok(false);
                }
                if i > 0 && !self.comparator.compare(&leaf.key_at(i - 1), &k).is_lt() {
                    return Ok(false);
                }
            }
            return Ok(true);
        }

        let node = InternalPageRef::<K>::new(page.data());
        if size < 2 {
            return Ok(false);
        }
        for i in 1..size {
            let k = node.key_at(i);
            if !in_bounds(&k) {
                return Ok(false);
            }
            if i > 1 && !self.comparator.compare(&node.key_at(i - 1), &k).is_lt() {
                return Ok(false);
            }
        }
        let page_id = node.page_id();
        for i in 0..size {
            let child_lower: Option<K> = if i == 0 {
                lower.copied()
            } else {
                Some(node.key_at(i))
            };
            let child_upper: Option<K> = if i == size - 1 {
                upper.copied()
            } else {
                Some(node.key_at(i + 1))
            };
            if !self.check_node(
                node.value_at(i),
                child_lower.as_ref(),
                child_upper.as_ref(),
                page_id,
            )? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Display adapter so key dumps do not require K: Display.
struct DebugKey<'a, K>(&'a K);

impl<'a, K: IndexKey> std::fmt::Display for DebugKey<'a, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut bytes = vec![0u8; K::LEN];
        self.0.write_to(&mut bytes);
        if K::LEN >= 8 {
            let v = i64::from_le_bytes(bytes[..8].try_into().unwrap());
            write!(f, "{v}")
        } else {
            let v = i32::from_le_bytes(bytes[..4].try_into().unwrap());
            write!(f, "{v}")
        }
    }
}
