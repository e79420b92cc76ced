use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::common::{FrameId, PageId};

/// Hash function used for directory addressing. Integer keys hash to
/// themselves so bucket placement follows the low bits of the value.
pub trait HashKey {
    fn hash_key(&self) -> usize;
}

macro_rules! impl_hash_key_for_int {
    ($($t:ty),*) => {
        $(impl HashKey for $t {
            fn hash_key(&self) -> usize {
                *self as usize
            }
        })*
    };
}

impl_hash_key_for_int!(u16, u32, u64, usize, i16, i32, i64, isize);

impl HashKey for PageId {
    fn hash_key(&self) -> usize {
        self.0 as usize
    }
}

impl HashKey for FrameId {
    fn hash_key(&self) -> usize {
        self.0 as usize
    }
}

struct BucketData<K, V> {
    items: HashMap<K, V>,
    /// Number of address bits this bucket owns
    local_depth: u32,
}

struct Bucket<K, V> {
    latch: Mutex<BucketData<K, V>>,
}

impl<K, V> Bucket<K, V> {
    fn with_depth(local_depth: u32) -> Self {
        Self {
            latch: Mutex::new(BucketData {
                items: HashMap::new(),
                local_depth,
            }),
        }
    }

    fn with_contents(local_depth: u32, items: HashMap<K, V>) -> Self {
        Self {
            latch: Mutex::new(BucketData { items, local_depth }),
        }
    }
}

struct Directory<K, V> {
    global_depth: u32,
    slots: Vec<Arc<Bucket<K, V>>>,
    num_buckets: usize,
}

impl<K: HashKey, V> Directory<K, V> {
    fn slot_index(&self, key: &K) -> usize {
        key.hash_key() & ((1usize << self.global_depth) - 1)
    }

    fn bucket_for(&self, key: &K) -> Arc<Bucket<K, V>> {
        Arc::clone(&self.slots[self.slot_index(key)])
    }
}

/// Extendible hash table with a doubling directory and bucket-granular
/// latches. Two directory slots share a bucket iff their indices agree in
/// the bucket's low `local_depth` bits. The directory only grows; there is
/// no shrink or merge path.
///
/// Lock order: the directory latch is only acquired either alone or while
/// holding a bucket latch (during a split); a thread never takes a bucket
/// latch while holding the directory latch on the lookup path, so the two
/// levels cannot form a cycle.
pub struct ExtendibleHash<K, V> {
    bucket_size: usize,
    directory: RwLock<Directory<K, V>>,
}

impl<K, V> ExtendibleHash<K, V>
where
    K: HashKey + Eq + Hash + Clone,
    V: Clone,
{
    /// Creates a table with one bucket of the given fixed capacity and
    /// global depth 0.
    pub fn new(bucket_size: usize) -> Self {
        assert!(bucket_size > 0, "bucket capacity must be positive");
        Self {
            bucket_size,
            directory: RwLock::new(Directory {
                global_depth: 0,
                slots: vec![Arc::new(Bucket::with_depth(0))],
                num_buckets: 1,
            }),
        }
    }

    pub fn global_depth(&self) -> u32 {
        self.directory.read().global_depth
    }

    /// Local depth of the bucket referenced by the given directory slot.
    pub fn local_depth(&self, slot: usize) -> u32 {
        let bucket = Arc::clone(&self.directory.read().slots[slot]);
        let depth = bucket.latch.lock().local_depth;
        depth
    }

    /// Number of (key, value) entries across all buckets.
    pub fn len(&self) -> usize {
        let buckets: Vec<Arc<Bucket<K, V>>> = {
            let dir = self.directory.read();
            dir.slots.clone()
        };
        let mut seen: Vec<*const Bucket<K, V>> = Vec::new();
        let mut total = 0;
        for bucket in buckets {
            let ptr = Arc::as_ptr(&bucket);
            if !seen.contains(&ptr) {
                seen.push(ptr);
                total += bucket.latch.lock().items.len();
            }
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_buckets(&self) -> usize {
        self.directory.read().num_buckets
    }

    /// Looks up `key`, returning a clone of its value.
    pub fn find(&self, key: &K) -> Option<V> {
        self.with_bucket(key, |data| data.items.get(key).cloned())
    }

    /// Removes `key`; returns whether an entry was removed.
    pub fn remove(&self, key: &K) -> bool {
        self.with_bucket(key, |data| data.items.remove(key).is_some())
    }

    /// Runs `f` with the bucket currently responsible for `key` locked.
    /// A split between the directory read and the bucket lock may have
    /// re-pointed the key's slot; in that case the lookup is retried so an
    /// entry moved by the rehash is never missed.
    fn with_bucket<R>(&self, key: &K, f: impl FnOnce(&mut BucketData<K, V>) -> R) -> R {
        loop {
            let bucket = self.directory.read().bucket_for(key);
            let mut data = bucket.latch.lock();
            let current = self.directory.read().bucket_for(key);
            if !Arc::ptr_eq(&bucket, &current) {
                continue;
            }
            return f(&mut data);
        }
    }

    /// Inserts or overwrites `key`. A full bucket is split, doubling the
    /// directory when the bucket already owns every address bit; the loop
    /// retries because the target bucket can remain full under skewed
    /// hashes.
    pub fn insert(&self, key: K, value: V) {
        loop {
            let bucket = self.directory.read().bucket_for(&key);
            let mut data = bucket.latch.lock();

            // A concurrent split may have re-pointed this key's slot between
            // the directory read and the bucket lock; retry on a stale bucket.
            {
                let current = self.directory.read().bucket_for(&key);
                if !Arc::ptr_eq(&bucket, &current) {
                    continue;
                }
            }

            if data.items.contains_key(&key) || data.items.len() < self.bucket_size {
                data.items.insert(key, value);
                return;
            }

            // Split: the new bucket takes every entry whose hash has the
            // bit just above the old local depth set.
            let mask = 1usize << data.local_depth;
            data.local_depth += 1;

            {
                let mut dir = self.directory.write();
                if data.local_depth > dir.global_depth {
                    // Double the directory, keeping the low half's mapping
                    // by appending identical slots before any re-pointing
                    let len = dir.slots.len();
                    for i in 0..len {
                        let slot = Arc::clone(&dir.slots[i]);
                        dir.slots.push(slot);
                    }
                    dir.global_depth += 1;
                }

                let moved_keys: Vec<K> = data
                    .items
                    .keys()
                    .filter(|k| k.hash_key() & mask != 0)
                    .cloned()
                    .collect();
                let mut moved = HashMap::with_capacity(moved_keys.len());
                for k in moved_keys {
                    let v = data.items.remove(&k).expect("key was just listed");
                    moved.insert(k, v);
                }
                let new_bucket = Arc::new(Bucket::with_contents(data.local_depth, moved));

                for (i, slot) in dir.slots.iter_mut().enumerate() {
                    if Arc::ptr_eq(slot, &bucket) && i & mask != 0 {
                        *slot = Arc::clone(&new_bucket);
                    }
                }
                dir.num_buckets += 1;

                debug!(
                    global_depth = dir.global_depth,
                    local_depth = data.local_depth,
                    num_buckets = dir.num_buckets,
                    "split hash bucket"
                );
            }

            drop(data);
            // The bucket this key now maps to may itself be full
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extendible_hash_new() {
        let table: ExtendibleHash<i32, String> = ExtendibleHash::new(4);
        assert_eq!(table.global_depth(), 0);
        assert_eq!(table.num_buckets(), 1);
        assert_eq!(table.local_depth(0), 0);
    }

    #[test]
    fn test_extendible_hash_find_and_remove() {
        let table = ExtendibleHash::new(4);
        assert!(table.is_empty());
        table.insert(1, "a");
        table.insert(2, "b");
        assert_eq!(table.len(), 2);

        assert_eq!(table.find(&1), Some("a"));
        assert_eq!(table.find(&2), Some("b"));
        assert_eq!(table.find(&3), None);

        assert!(table.remove(&1));
        assert!(!table.remove(&1));
        assert_eq!(table.find(&1), None);
        assert_eq!(table.find(&2), Some("b"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_extendible_hash_overwrite() {
        let table = ExtendibleHash::new(2);
        table.insert(7, 1);
        table.insert(7, 2);
        assert_eq!(table.find(&7), Some(2));
        assert_eq!(table.num_buckets(), 1);
    }

    #[test]
    fn test_extendible_hash_split_grows_directory() {
        let table = ExtendibleHash::new(2);
        table.insert(1, 'a');
        table.insert(2, 'b');
        table.insert(3, 'c');

        // 1 and 2 fill the single depth-0 bucket; inserting 3 splits it on
        // bit 0, moving the odd keys out
        assert_eq!(table.global_depth(), 1);
        assert_eq!(table.num_buckets(), 2);
        assert_eq!(table.find(&1), Some('a'));
        assert_eq!(table.find(&2), Some('b'));
        assert_eq!(table.find(&3), Some('c'));
    }

    #[test]
    fn test_extendible_hash_second_split_deepens() {
        let table = ExtendibleHash::new(2);
        table.insert(1, 'a');
        table.insert(2, 'b');
        table.insert(3, 'c');
        // Bucket {1, 3} is full; 5 also has bit 0 set, forcing a split on
        // bit 1 and a second doubling
        table.insert(5, 'e');

        assert_eq!(table.global_depth(), 2);
        assert_eq!(table.num_buckets(), 3);
        for (k, v) in [(1, 'a'), (2, 'b'), (3, 'c'), (5, 'e')] {
            assert_eq!(table.find(&k), Some(v));
        }
    }

    #[test]
    fn test_extendible_hash_local_depth_bounded_by_global() {
        let table = ExtendibleHash::new(2);
        for i in 0..64 {
            table.insert(i, i * 10);
        }
        let global = table.global_depth();
        for slot in 0..(1usize << global) {
            assert!(table.local_depth(slot) <= global);
        }
        for i in 0..64 {
            assert_eq!(table.find(&i), Some(i * 10));
        }
    }
}
