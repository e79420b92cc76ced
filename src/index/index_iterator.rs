use std::marker::PhantomData;
use std::sync::Arc;

use crate::buffer::BufferPoolManager;
use crate::common::{RecordId, Result};
use crate::storage::page::Page;

use super::b_plus_tree_page::LeafPageRef;
use super::generic_key::IndexKey;

/// Forward iterator over leaf entries. Holds the current leaf pinned and
/// read-latched; crossing to the next leaf releases the old one before the
/// new one is latched, so the iterator never holds two leaves at once.
///
/// Iteration is not snapshot-isolated: leaves not yet visited may be
/// changed by concurrent writers.
pub struct IndexIterator<K> {
    bpm: Arc<BufferPoolManager>,
    leaf: Option<Arc<Page>>,
    index: usize,
    _marker: PhantomData<K>,
}

impl<K: IndexKey> IndexIterator<K> {
    /// Takes ownership of a leaf that the tree has already read-latched and
    /// pinned (None for an empty tree).
    pub(crate) fn new(bpm: Arc<BufferPoolManager>, leaf: Option<Arc<Page>>, index: usize) -> Self {
        Self {
            bpm,
            leaf,
            index,
            _marker: PhantomData,
        }
    }

    pub fn is_end(&self) -> bool {
        self.leaf.is_none()
    }

    /// Returns the next entry, or None past the last leaf.
    pub fn next_entry(&mut self) -> Result<Option<(K, RecordId)>> {
        loop {
            let Some(page) = self.leaf.as_ref() else {
                return Ok(None);
            };

            let (entry, next_id) = {
                let leaf = LeafPageRef::<K>::new(page.data());
                if self.index < leaf.size() as usize {
                    let entry = (leaf.key_at(self.index), leaf.value_at(self.index));
                    (Some(entry), None)
                } else {
                    (None, Some(leaf.next_page_id()))
                }
            };

            if let Some(entry) = entry {
                self.index += 1;
                return Ok(Some(entry));
            }

            let next_id = next_id.expect("no entry implies a sibling id");
            self.release_current();
            if !next_id.is_valid() {
                return Ok(None);
            }

            let next = self.bpm.fetch_page(next_id)?;
            next.rlatch();
            self.leaf = Some(next);
            self.index = 0;
        }
    }
}

impl<K> IndexIterator<K> {
    fn release_current(&mut self) {
        if let Some(page) = self.leaf.take() {
            let page_id = page.page_id();
            page.runlatch();
            self.bpm.unpin_page(page_id, false);
        }
    }
}

impl<K: IndexKey> Iterator for IndexIterator<K> {
    type Item = Result<(K, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl<K> Drop for IndexIterator<K> {
    fn drop(&mut self) {
        self.release_current();
    }
}
