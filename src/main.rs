use std::sync::Arc;

use bramble::buffer::BufferPoolManager;
use bramble::common::RecordId;
use bramble::concurrency::Transaction;
use bramble::index::{BPlusTree, GenericComparator, GenericKey};
use bramble::storage::disk::DiskManager;

type Key = GenericKey<8>;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    println!("Bramble - a concurrent B+-tree index engine");
    println!("===========================================\n");

    let db_path = "demo.db";
    let disk_manager = Arc::new(DiskManager::new(db_path).expect("failed to open database file"));
    let bpm = Arc::new(BufferPoolManager::new(64, disk_manager));
    println!("Opened {db_path} with a 64-frame buffer pool");

    let tree: BPlusTree<Key, GenericComparator<8>> =
        BPlusTree::with_max_sizes("demo_index", bpm, GenericComparator::<8>, 4, 4)
            .expect("failed to create index");

    let mut txn = Transaction::new();

    for i in 1..=12 {
        let key = Key::from_i64(i);
        tree.insert(&key, RecordId::new(i as i32, 0), &mut txn)
            .expect("insert failed");
    }
    println!("\nInserted keys 1..=12; tree shape:");
    println!("{}", tree.to_string_tree(false).unwrap());

    let probe = Key::from_i64(7);
    match tree.get_value(&probe, &mut txn).expect("lookup failed") {
        Some(rid) => println!("get_value(7) -> {rid}"),
        None => println!("get_value(7) -> not found"),
    }

    for i in [3i64, 4, 5] {
        tree.remove(&Key::from_i64(i), &mut txn).expect("remove failed");
    }
    println!("\nRemoved 3, 4, 5; tree shape:");
    println!("{}", tree.to_string_tree(false).unwrap());

    print!("Scan: ");
    let entries: Vec<i64> = tree
        .begin()
        .expect("iterator failed")
        .map(|entry| entry.expect("scan failed").0.to_i64())
        .collect();
    println!("{entries:?}");

    std::fs::remove_file(db_path).ok();
    println!("\nDemo completed");
}
