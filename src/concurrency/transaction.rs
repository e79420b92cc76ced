use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::common::PageId;
use crate::storage::page::Page;

/// Per-operation crabbing state: the pages this operation still holds
/// latched (in acquisition order) and the pages it has scheduled for
/// deletion. Deletions are deferred until the operation releases its
/// latches, at which point each deleted page has been unpinned.
#[derive(Default)]
pub struct Transaction {
    page_set: VecDeque<Arc<Page>>,
    deleted_page_set: HashSet<PageId>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a latched, pinned page.
    pub fn add_into_page_set(&mut self, page: Arc<Page>) {
        self.page_set.push_back(page);
    }

    /// Marks a page for deletion at operation end.
    pub fn add_into_deleted_page_set(&mut self, page_id: PageId) {
        self.deleted_page_set.insert(page_id);
    }

    pub fn page_set(&mut self) -> &mut VecDeque<Arc<Page>> {
        &mut self.page_set
    }

    pub fn deleted_page_set(&mut self) -> &mut HashSet<PageId> {
        &mut self.deleted_page_set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_page_set_order() {
        let mut txn = Transaction::new();
        let a = Arc::new(Page::new());
        let b = Arc::new(Page::new());
        a.set_page_id(PageId::new(1));
        b.set_page_id(PageId::new(2));

        txn.add_into_page_set(Arc::clone(&a));
        txn.add_into_page_set(Arc::clone(&b));

        assert_eq!(txn.page_set().pop_front().unwrap().page_id(), PageId::new(1));
        assert_eq!(txn.page_set().pop_front().unwrap().page_id(), PageId::new(2));
        assert!(txn.page_set().is_empty());
    }

    #[test]
    fn test_transaction_deleted_page_set() {
        let mut txn = Transaction::new();
        txn.add_into_deleted_page_set(PageId::new(4));
        txn.add_into_deleted_page_set(PageId::new(4));

        assert_eq!(txn.deleted_page_set().len(), 1);
        assert!(txn.deleted_page_set().remove(&PageId::new(4)));
    }
}
