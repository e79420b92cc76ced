use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::common::{BrambleError, FrameId, PageId, Result, DEFAULT_BUCKET_SIZE, PAGE_SIZE};
use crate::hash::ExtendibleHash;
use crate::storage::disk::{DiskManager, DiskScheduler};
use crate::storage::page::Page;

use super::LruReplacer;

/// BufferPoolManager caches disk pages in a fixed set of frames. The page
/// table mapping page ids to frames is an extendible hash table; victim
/// frames are chosen by an LRU replacer that tracks every frame whose pin
/// count has dropped to zero.
///
/// Frame placement (allocating, loading, deleting) is serialised by one
/// latch. Pin counts are atomics, so unpinning takes no pool-wide lock.
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<Arc<Page>>,
    page_table: ExtendibleHash<PageId, FrameId>,
    replacer: LruReplacer<FrameId>,
    free_list: Mutex<VecDeque<FrameId>>,
    disk_scheduler: DiskScheduler,
    latch: Mutex<()>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, disk_manager: Arc<DiskManager>) -> Self {
        let frames = (0..pool_size).map(|_| Arc::new(Page::new())).collect();
        let free_list = (0..pool_size).map(|i| FrameId::new(i as u32)).collect();

        Self {
            pool_size,
            frames,
            page_table: ExtendibleHash::new(DEFAULT_BUCKET_SIZE),
            replacer: LruReplacer::new(),
            free_list: Mutex::new(free_list),
            disk_scheduler: DiskScheduler::new(disk_manager),
            latch: Mutex::new(()),
        }
    }

    /// Allocates a brand-new page, pinned once and zero-filled.
    pub fn new_page(&self) -> Result<Arc<Page>> {
        let _guard = self.latch.lock();

        let frame_id = self.acquire_frame()?;
        let frame = &self.frames[frame_id.as_usize()];
        let page_id = self.disk_scheduler.disk_manager().allocate_page()?;

        // The frame is not in the page table yet, so this thread owns it
        frame.reset();
        frame.set_page_id(page_id);
        frame.pin();
        // Content exists only in memory until the first flush or eviction
        frame.set_dirty(true);

        self.page_table.insert(page_id, frame_id);

        Ok(Arc::clone(frame))
    }

    /// Fetches a page, pinning its frame. Loads from disk on a miss,
    /// evicting (and flushing, if dirty) a victim frame when none is free.
    pub fn fetch_page(&self, page_id: PageId) -> Result<Arc<Page>> {
        if !page_id.is_valid() {
            return Err(BrambleError::InvalidPageId(page_id));
        }

        let _guard = self.latch.lock();

        if let Some(frame_id) = self.page_table.find(&page_id) {
            let frame = &self.frames[frame_id.as_usize()];
            frame.pin();
            self.replacer.erase(&frame_id);
            return Ok(Arc::clone(frame));
        }

        let frame_id = self.acquire_frame()?;
        let frame = &self.frames[frame_id.as_usize()];

        // Unpublished frame: loading through data_mut is exclusive to us
        self.disk_scheduler.read_sync(page_id, frame.data_mut())?;
        frame.set_page_id(page_id);
        frame.set_dirty(false);
        frame.pin();

        self.page_table.insert(page_id, frame_id);

        Ok(Arc::clone(frame))
    }

    /// Drops one pin on a page; `is_dirty` marks the page as modified. When
    /// the pin count reaches zero the frame becomes an eviction candidate.
    /// Returns false if the page is absent or was not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let Some(frame_id) = self.page_table.find(&page_id) else {
            return false;
        };
        let frame = &self.frames[frame_id.as_usize()];

        if is_dirty {
            frame.set_dirty(true);
        }
        match frame.unpin() {
            Some(0) => {
                self.replacer.insert(frame_id);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Deletes a page from the pool and the disk. Fails on a pinned page;
    /// returns false when the page is not resident.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let _guard = self.latch.lock();

        let Some(frame_id) = self.page_table.find(&page_id) else {
            return Ok(false);
        };
        let frame = &self.frames[frame_id.as_usize()];

        if frame.pin_count() > 0 {
            return Err(BrambleError::PageStillPinned(page_id));
        }

        self.page_table.remove(&page_id);
        self.replacer.erase(&frame_id);
        frame.reset();
        self.free_list.lock().push_back(frame_id);
        self.disk_scheduler.disk_manager().deallocate_page(page_id);

        debug!(%page_id, "deleted page");
        Ok(true)
    }

    /// Writes a page back to disk and clears its dirty flag.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if !page_id.is_valid() {
            return Err(BrambleError::InvalidPageId(page_id));
        }

        // Resolve the frame under the pool latch, but never wait on a page
        // latch while holding it; a writer blocked on the pool latch may be
        // holding that page latch.
        let frame = {
            let _guard = self.latch.lock();
            match self.page_table.find(&page_id) {
                Some(frame_id) => Arc::clone(&self.frames[frame_id.as_usize()]),
                None => return Ok(false),
            }
        };
        self.flush_frame_checked(&frame, page_id)?;
        Ok(true)
    }

    /// Flushes every dirty resident page.
    pub fn flush_all_pages(&self) -> Result<()> {
        let frames: Vec<Arc<Page>> = {
            let _guard = self.latch.lock();
            self.frames.iter().map(Arc::clone).collect()
        };
        for frame in frames {
            let page_id = frame.page_id();
            if page_id.is_valid() && frame.is_dirty() {
                self.flush_frame_checked(&frame, page_id)?;
            }
        }
        Ok(())
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn free_frame_count(&self) -> usize {
        self.free_list.lock().len()
    }

    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        self.page_table
            .find(&page_id)
            .map(|frame_id| self.frames[frame_id.as_usize()].pin_count())
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        self.disk_scheduler.disk_manager()
    }

    /// Flush path for frames that may be concurrently re-used: re-checks
    /// under the page latch that the frame still holds `page_id` (an evicted
    /// frame was already flushed on its way out).
    fn flush_frame_checked(&self, frame: &Arc<Page>, page_id: PageId) -> Result<()> {
        let mut data = [0u8; PAGE_SIZE];
        frame.rlatch();
        if frame.page_id() != page_id {
            frame.runlatch();
            return Ok(());
        }
        // Clear before copying: a writer that modifies after our copy will
        // re-mark the frame dirty
        frame.set_dirty(false);
        data.copy_from_slice(frame.data());
        frame.runlatch();
        self.disk_scheduler.write_sync(page_id, &data)?;
        Ok(())
    }

    /// Flush path for eviction victims: pin count is zero, so no one holds
    /// the page latch and acquiring it cannot block.
    fn write_frame(&self, frame: &Arc<Page>, page_id: PageId) -> Result<()> {
        let mut data = [0u8; PAGE_SIZE];
        frame.rlatch();
        data.copy_from_slice(frame.data());
        frame.runlatch();
        self.disk_scheduler.write_sync(page_id, &data)?;
        frame.set_dirty(false);
        Ok(())
    }

    /// Takes a frame off the free list, or evicts the LRU victim. Caller
    /// must hold the pool latch.
    fn acquire_frame(&self) -> Result<FrameId> {
        if let Some(frame_id) = self.free_list.lock().pop_front() {
            return Ok(frame_id);
        }

        while let Some(frame_id) = self.replacer.victim() {
            let frame = &self.frames[frame_id.as_usize()];

            // A frame can linger in the replacer after being re-pinned;
            // skip it, it will re-enter on its next unpin to zero
            if frame.pin_count() > 0 {
                continue;
            }

            let old_page_id = frame.page_id();
            if frame.is_dirty() {
                self.write_frame(frame, old_page_id)?;
            }
            self.page_table.remove(&old_page_id);
            frame.reset();

            debug!(%old_page_id, %frame_id, "evicted page");
            return Ok(frame_id);
        }

        Err(BrambleError::BufferPoolFull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_bpm(pool_size: usize) -> (BufferPoolManager, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        (BufferPoolManager::new(pool_size, dm), temp_file)
    }

    #[test]
    fn test_buffer_pool_manager_new() {
        let (bpm, _temp) = create_bpm(10);
        assert_eq!(bpm.pool_size(), 10);
        assert_eq!(bpm.free_frame_count(), 10);
    }

    #[test]
    fn test_buffer_pool_manager_new_page() {
        let (bpm, _temp) = create_bpm(10);

        let page = bpm.new_page().unwrap();
        // Page 0 is the header page, reserved at file creation
        assert_eq!(page.page_id(), PageId::new(1));
        assert_eq!(page.pin_count(), 1);
        assert_eq!(bpm.free_frame_count(), 9);
    }

    #[test]
    fn test_buffer_pool_manager_read_write() {
        let (bpm, _temp) = create_bpm(10);

        let page = bpm.new_page().unwrap();
        let page_id = page.page_id();

        page.wlatch();
        page.data_mut()[0] = 42;
        page.data_mut()[100] = 255;
        page.wunlatch();
        bpm.unpin_page(page_id, true);
        assert_eq!(bpm.get_pin_count(page_id), Some(0));

        let page = bpm.fetch_page(page_id).unwrap();
        page.rlatch();
        assert_eq!(page.data()[0], 42);
        assert_eq!(page.data()[100], 255);
        page.runlatch();
        bpm.unpin_page(page_id, false);
    }

    #[test]
    fn test_buffer_pool_manager_eviction_roundtrip() {
        let (bpm, _temp) = create_bpm(3);

        let mut page_ids = Vec::new();
        for i in 0..3 {
            let page = bpm.new_page().unwrap();
            page.wlatch();
            page.data_mut()[0] = i as u8 + 1;
            page.wunlatch();
            page_ids.push(page.page_id());
            bpm.unpin_page(page.page_id(), true);
        }
        assert_eq!(bpm.free_frame_count(), 0);

        // Forces eviction of the least recently unpinned page
        let extra = bpm.new_page().unwrap();
        bpm.unpin_page(extra.page_id(), false);

        // The evicted page must come back from disk intact
        for (i, &page_id) in page_ids.iter().enumerate() {
            let page = bpm.fetch_page(page_id).unwrap();
            page.rlatch();
            assert_eq!(page.data()[0], i as u8 + 1);
            page.runlatch();
            bpm.unpin_page(page_id, false);
        }
    }

    #[test]
    fn test_buffer_pool_manager_full_when_all_pinned() {
        let (bpm, _temp) = create_bpm(2);

        let _p1 = bpm.new_page().unwrap();
        let _p2 = bpm.new_page().unwrap();

        assert!(matches!(bpm.new_page(), Err(BrambleError::BufferPoolFull)));
    }

    #[test]
    fn test_buffer_pool_manager_delete_page() {
        let (bpm, _temp) = create_bpm(10);

        let page = bpm.new_page().unwrap();
        let page_id = page.page_id();

        assert!(bpm.delete_page(page_id).is_err());

        bpm.unpin_page(page_id, false);
        assert!(bpm.delete_page(page_id).unwrap());
        assert_eq!(bpm.get_pin_count(page_id), None);
        assert!(!bpm.delete_page(page_id).unwrap());

        // The freed id is handed out again
        let page = bpm.new_page().unwrap();
        assert_eq!(page.page_id(), page_id);
    }

    #[test]
    fn test_buffer_pool_manager_unpin_twice() {
        let (bpm, _temp) = create_bpm(10);

        let page = bpm.new_page().unwrap();
        let page_id = page.page_id();

        assert!(bpm.unpin_page(page_id, false));
        assert!(!bpm.unpin_page(page_id, false));
    }

    #[test]
    fn test_buffer_pool_manager_pinned_page_survives_pressure() {
        let (bpm, _temp) = create_bpm(2);

        let keep = bpm.new_page().unwrap();
        let keep_id = keep.page_id();
        keep.wlatch();
        keep.data_mut()[0] = 99;
        keep.wunlatch();

        // Churn the other frame
        for _ in 0..4 {
            let page = bpm.new_page().unwrap();
            bpm.unpin_page(page.page_id(), false);
        }

        assert_eq!(bpm.get_pin_count(keep_id), Some(1));
        keep.rlatch();
        assert_eq!(keep.data()[0], 99);
        keep.runlatch();
        bpm.unpin_page(keep_id, true);
    }
}
