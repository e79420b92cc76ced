use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

use parking_lot::lock_api::RawRwLock as _;
use parking_lot::RawRwLock;

use crate::common::{PageId, INVALID_PAGE_ID, PAGE_SIZE};

/// A buffer frame holding one disk page.
///
/// The latch is acquired and released manually (`rlatch`/`runlatch`,
/// `wlatch`/`wunlatch`) instead of through RAII guards: the B+-tree's
/// latch-crabbing protocol acquires latches during the descent and releases
/// them from a different stack frame at operation end, so lock and unlock
/// sites cannot share a lexical scope.
///
/// Access rules for the data area:
/// - `data` requires the latch to be held in shared or exclusive mode.
/// - `data_mut` requires the latch to be held in exclusive mode, or the
///   frame to be unpublished (not yet reachable through the page table).
///
/// Pin count and dirty flag are atomics managed by the buffer pool.
pub struct Page {
    page_id: AtomicI32,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
    latch: RawRwLock,
    data: UnsafeCell<Box<[u8; PAGE_SIZE]>>,
}

// The latch discipline above is what makes concurrent access to `data`
// sound; everything else is atomics.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    pub fn new() -> Self {
        Self {
            page_id: AtomicI32::new(INVALID_PAGE_ID.as_i32()),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            latch: RawRwLock::INIT,
            data: UnsafeCell::new(Box::new([0u8; PAGE_SIZE])),
        }
    }

    pub fn page_id(&self) -> PageId {
        PageId::new(self.page_id.load(Ordering::Acquire))
    }

    pub fn set_page_id(&self, page_id: PageId) {
        self.page_id.store(page_id.as_i32(), Ordering::Release);
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count and returns the new value.
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the pin count and returns the new value.
    /// Returns None if the pin count was already 0.
    pub fn unpin(&self) -> Option<u32> {
        loop {
            let current = self.pin_count.load(Ordering::Acquire);
            if current == 0 {
                return None;
            }
            if self
                .pin_count
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(current - 1);
            }
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::Release);
    }

    /// Acquires the latch in shared mode.
    pub fn rlatch(&self) {
        self.latch.lock_shared();
    }

    /// Releases a shared latch previously taken with `rlatch`.
    pub fn runlatch(&self) {
        // The caller owns one shared acquisition of the latch.
        unsafe { self.latch.unlock_shared() }
    }

    /// Acquires the latch in exclusive mode.
    pub fn wlatch(&self) {
        self.latch.lock_exclusive();
    }

    /// Releases an exclusive latch previously taken with `wlatch`.
    pub fn wunlatch(&self) {
        // The caller owns the exclusive acquisition of the latch.
        unsafe { self.latch.unlock_exclusive() }
    }

    /// Returns the page data. The caller must hold the latch.
    pub fn data(&self) -> &[u8] {
        unsafe { &(&*self.data.get())[..] }
    }

    /// Returns the page data for writing. The caller must hold the latch in
    /// exclusive mode (or own the frame exclusively, e.g. before it is
    /// published in the page table).
    #[allow(clippy::mut_from_ref)]
    pub fn data_mut(&self) -> &mut [u8] {
        unsafe { &mut (&mut *self.data.get())[..] }
    }

    /// Resets the frame to its initial state.
    pub fn reset(&self) {
        self.page_id
            .store(INVALID_PAGE_ID.as_i32(), Ordering::Release);
        self.pin_count.store(0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
        self.data_mut().fill(0);
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_new() {
        let page = Page::new();
        assert_eq!(page.page_id(), INVALID_PAGE_ID);
        assert_eq!(page.pin_count(), 0);
        assert!(!page.is_dirty());
    }

    #[test]
    fn test_page_pin_unpin() {
        let page = Page::new();

        assert_eq!(page.pin(), 1);
        assert_eq!(page.pin(), 2);
        assert_eq!(page.pin_count(), 2);

        assert_eq!(page.unpin(), Some(1));
        assert_eq!(page.unpin(), Some(0));
        assert_eq!(page.unpin(), None);
    }

    #[test]
    fn test_page_data_roundtrip() {
        let page = Page::new();

        page.wlatch();
        page.data_mut()[0] = 42;
        page.data_mut()[PAGE_SIZE - 1] = 7;
        page.wunlatch();

        page.rlatch();
        assert_eq!(page.data()[0], 42);
        assert_eq!(page.data()[PAGE_SIZE - 1], 7);
        page.runlatch();
    }

    #[test]
    fn test_page_reset() {
        let page = Page::new();
        page.set_page_id(PageId::new(5));
        page.pin();
        page.set_dirty(true);
        page.wlatch();
        page.data_mut().fill(1);
        page.wunlatch();

        page.reset();

        assert_eq!(page.page_id(), INVALID_PAGE_ID);
        assert_eq!(page.pin_count(), 0);
        assert!(!page.is_dirty());
        page.rlatch();
        assert_eq!(page.data()[0], 0);
        page.runlatch();
    }

    #[test]
    fn test_page_latch_allows_concurrent_readers() {
        let page = Page::new();
        page.rlatch();
        page.rlatch();
        page.runlatch();
        page.runlatch();
    }
}
