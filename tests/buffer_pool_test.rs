//! Integration tests for the buffer pool manager

use std::sync::Arc;
use std::thread;

use bramble::buffer::BufferPoolManager;
use bramble::common::{BrambleError, PageId, PAGE_SIZE};
use bramble::storage::disk::DiskManager;
use tempfile::NamedTempFile;

fn create_bpm(pool_size: usize) -> (BufferPoolManager, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
    (BufferPoolManager::new(pool_size, dm), temp_file)
}

#[test]
fn test_buffer_pool_basic_operations() {
    let (bpm, _temp) = create_bpm(10);

    // Page 0 is the header page, so the first data page is 1
    let page = bpm.new_page().unwrap();
    let page_id = page.page_id();
    assert_eq!(page_id, PageId::new(1));

    page.wlatch();
    page.data_mut()[0] = 0xDE;
    page.data_mut()[1] = 0xAD;
    page.data_mut()[2] = 0xBE;
    page.data_mut()[3] = 0xEF;
    page.wunlatch();
    bpm.unpin_page(page_id, true);

    let page = bpm.fetch_page(page_id).unwrap();
    page.rlatch();
    assert_eq!(&page.data()[0..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
    page.runlatch();
    bpm.unpin_page(page_id, false);
}

#[test]
fn test_buffer_pool_persistence_across_reopen() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path().to_path_buf();

    let page_id = {
        let dm = Arc::new(DiskManager::new(&path).unwrap());
        let bpm = BufferPoolManager::new(10, dm);

        let page = bpm.new_page().unwrap();
        let page_id = page.page_id();
        page.wlatch();
        page.data_mut()[0] = 42;
        page.data_mut()[PAGE_SIZE - 1] = 7;
        page.wunlatch();
        bpm.unpin_page(page_id, true);
        bpm.flush_all_pages().unwrap();
        page_id
    };

    let dm = Arc::new(DiskManager::new(&path).unwrap());
    let bpm = BufferPoolManager::new(10, dm);
    let page = bpm.fetch_page(page_id).unwrap();
    page.rlatch();
    assert_eq!(page.data()[0], 42);
    assert_eq!(page.data()[PAGE_SIZE - 1], 7);
    page.runlatch();
    bpm.unpin_page(page_id, false);
}

#[test]
fn test_buffer_pool_eviction_pressure() {
    let (bpm, _temp) = create_bpm(4);

    // Write more pages than there are frames
    let mut page_ids = Vec::new();
    for i in 0..16 {
        let page = bpm.new_page().unwrap();
        page.wlatch();
        page.data_mut()[0] = i as u8;
        page.wunlatch();
        page_ids.push(page.page_id());
        bpm.unpin_page(page.page_id(), true);
    }

    // Every page must read back correctly despite evictions
    for (i, &page_id) in page_ids.iter().enumerate() {
        let page = bpm.fetch_page(page_id).unwrap();
        page.rlatch();
        assert_eq!(page.data()[0], i as u8, "wrong content for {page_id}");
        page.runlatch();
        bpm.unpin_page(page_id, false);
    }
}

#[test]
fn test_buffer_pool_exhaustion_and_recovery() {
    let (bpm, _temp) = create_bpm(3);

    let pages: Vec<_> = (0..3).map(|_| bpm.new_page().unwrap()).collect();
    assert!(matches!(bpm.new_page(), Err(BrambleError::BufferPoolFull)));
    assert!(matches!(
        bpm.fetch_page(PageId::new(100)),
        Err(BrambleError::BufferPoolFull)
    ));

    // Releasing one pin makes a frame reclaimable again
    bpm.unpin_page(pages[0].page_id(), false);
    assert!(bpm.new_page().is_ok());
}

#[test]
fn test_buffer_pool_delete_and_reuse() {
    let (bpm, _temp) = create_bpm(10);

    let page = bpm.new_page().unwrap();
    let page_id = page.page_id();

    assert!(matches!(
        bpm.delete_page(page_id),
        Err(BrambleError::PageStillPinned(_))
    ));

    bpm.unpin_page(page_id, false);
    assert!(bpm.delete_page(page_id).unwrap());
    assert!(!bpm.delete_page(page_id).unwrap());

    let reused = bpm.new_page().unwrap();
    assert_eq!(reused.page_id(), page_id);
    bpm.unpin_page(page_id, false);
}

#[test]
fn test_buffer_pool_concurrent_pin_unpin() {
    let (bpm, _temp) = create_bpm(16);
    let bpm = Arc::new(bpm);

    let mut page_ids = Vec::new();
    for i in 0..8 {
        let page = bpm.new_page().unwrap();
        page.wlatch();
        page.data_mut()[0] = i as u8;
        page.wunlatch();
        page_ids.push(page.page_id());
        bpm.unpin_page(page.page_id(), true);
    }
    let page_ids = Arc::new(page_ids);

    let handles: Vec<_> = (0..4usize)
        .map(|t| {
            let bpm = Arc::clone(&bpm);
            let page_ids = Arc::clone(&page_ids);
            thread::spawn(move || {
                for round in 0..200usize {
                    let page_id = page_ids[(t + round) % page_ids.len()];
                    let page = bpm.fetch_page(page_id).unwrap();
                    page.rlatch();
                    let expected = page_ids.iter().position(|&p| p == page_id).unwrap() as u8;
                    assert_eq!(page.data()[0], expected);
                    page.runlatch();
                    bpm.unpin_page(page_id, false);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // All pins released
    for &page_id in page_ids.iter() {
        assert_eq!(bpm.get_pin_count(page_id), Some(0));
    }
}
