use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::common::{PageId, Result, PAGE_SIZE};

/// DiskManager reads and writes fixed-size pages from a single database
/// file and hands out page ids. Deallocated ids go on a free list and are
/// reused by later allocations.
pub struct DiskManager {
    db_file: Mutex<File>,
    db_path: PathBuf,
    /// High-water mark of allocated page ids
    num_pages: AtomicI32,
    free_pages: Mutex<Vec<PageId>>,
    num_reads: AtomicU32,
    num_writes: AtomicU32,
}

impl DiskManager {
    /// Opens (or creates) the database file. A fresh file immediately
    /// materialises page 0, the header page, so allocation never hands
    /// out id 0.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&db_path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as i32;

        let dm = Self {
            db_file: Mutex::new(file),
            db_path,
            num_pages: AtomicI32::new(num_pages),
            free_pages: Mutex::new(Vec::new()),
            num_reads: AtomicU32::new(0),
            num_writes: AtomicU32::new(0),
        };

        if num_pages == 0 {
            let zeros = [0u8; PAGE_SIZE];
            dm.write_page(PageId::new(0), &zeros)?;
            dm.num_pages.store(1, Ordering::SeqCst);
        }

        Ok(dm)
    }

    /// Reads a page from disk into the provided buffer. Reads past the end
    /// of the file zero-fill the remainder.
    pub fn read_page(&self, page_id: PageId, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE, "Buffer must be PAGE_SIZE bytes");

        let byte_offset = (page_id.as_i32() as u64) * (PAGE_SIZE as u64);

        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(byte_offset))?;

        let bytes_read = file.read(data)?;
        if bytes_read < PAGE_SIZE {
            data[bytes_read..].fill(0);
        }

        self.num_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes a page to disk from the provided buffer.
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE, "Buffer must be PAGE_SIZE bytes");

        let byte_offset = (page_id.as_i32() as u64) * (PAGE_SIZE as u64);

        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(byte_offset))?;
        file.write_all(data)?;
        file.flush()?;

        self.num_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Allocates a page id, reusing a deallocated one when available.
    pub fn allocate_page(&self) -> Result<PageId> {
        if let Some(page_id) = self.free_pages.lock().pop() {
            return Ok(page_id);
        }
        let id = self.num_pages.fetch_add(1, Ordering::SeqCst);
        Ok(PageId::new(id))
    }

    /// Returns a page id to the allocator for reuse.
    pub fn deallocate_page(&self, page_id: PageId) {
        self.free_pages.lock().push(page_id);
    }

    pub fn num_pages(&self) -> i32 {
        self.num_pages.load(Ordering::Relaxed)
    }

    pub fn num_reads(&self) -> u32 {
        self.num_reads.load(Ordering::Relaxed)
    }

    pub fn num_writes(&self) -> u32 {
        self.num_writes.load(Ordering::Relaxed)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn sync(&self) -> Result<()> {
        self.db_file.lock().sync_all()?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.db_file.get_mut().sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_manager_new_reserves_header_page() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dm = DiskManager::new(temp_dir.path().join("test.db")).unwrap();

        assert_eq!(dm.num_pages(), 1);
        assert_eq!(dm.allocate_page().unwrap(), PageId::new(1));
    }

    #[test]
    fn test_disk_manager_read_write() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dm = DiskManager::new(temp_dir.path().join("rw.db")).unwrap();

        // Writing the header page of the fresh file counted once
        assert_eq!(dm.num_reads(), 0);
        assert_eq!(dm.num_writes(), 1);

        let page_id = dm.allocate_page().unwrap();

        let mut write_data = [0u8; PAGE_SIZE];
        write_data[0] = 42;
        write_data[100] = 255;
        write_data[PAGE_SIZE - 1] = 128;
        dm.write_page(page_id, &write_data).unwrap();
        assert_eq!(dm.num_writes(), 2);

        let mut read_data = [0u8; PAGE_SIZE];
        dm.read_page(page_id, &mut read_data).unwrap();
        assert_eq!(dm.num_reads(), 1);

        assert_eq!(read_data[0], 42);
        assert_eq!(read_data[100], 255);
        assert_eq!(read_data[PAGE_SIZE - 1], 128);

        dm.read_page(page_id, &mut read_data).unwrap();
        assert_eq!(dm.num_reads(), 2);
        assert_eq!(dm.num_writes(), 2);
    }

    #[test]
    fn test_disk_manager_read_past_eof_zero_fills() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dm = DiskManager::new(temp_dir.path().join("eof.db")).unwrap();

        let mut data = [7u8; PAGE_SIZE];
        dm.read_page(PageId::new(10), &mut data).unwrap();
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_disk_manager_deallocate_reuses_id() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dm = DiskManager::new(temp_dir.path().join("realloc.db")).unwrap();

        let a = dm.allocate_page().unwrap();
        let b = dm.allocate_page().unwrap();
        assert_ne!(a, b);

        dm.deallocate_page(a);
        assert_eq!(dm.allocate_page().unwrap(), a);
    }

    #[test]
    fn test_disk_manager_persistence() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("persist.db");

        let page_id = {
            let dm = DiskManager::new(&path).unwrap();
            let page_id = dm.allocate_page().unwrap();
            let mut data = [0u8; PAGE_SIZE];
            data[0] = 123;
            dm.write_page(page_id, &data).unwrap();
            page_id
        };

        {
            let dm = DiskManager::new(&path).unwrap();
            assert_eq!(dm.num_pages(), 2);

            let mut data = [0u8; PAGE_SIZE];
            dm.read_page(page_id, &mut data).unwrap();
            assert_eq!(data[0], 123);
        }
    }
}
