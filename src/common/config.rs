use super::types::PageId;

/// Size of a page in bytes (4 KB)
pub const PAGE_SIZE: usize = 4096;

/// Sentinel for "no page"
pub const INVALID_PAGE_ID: PageId = PageId(-1);

/// Page 0 is reserved for the header page holding index root records
pub const HEADER_PAGE_ID: PageId = PageId(0);

/// Default buffer pool size (number of frames)
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 64;

/// Default per-bucket capacity of the extendible hash table
pub const DEFAULT_BUCKET_SIZE: usize = 64;
