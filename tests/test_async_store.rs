use bigchunks::{
    AsyncChunksStore, BigCollectionChunksStore, Chunk, Error, RawBytesSerializer, StoreConfig,
};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn config(dir: &TempDir, max_items_per_file: usize) -> StoreConfig {
    StoreConfig {
        avg_collection_id_size: 16,
        max_collections: 64,
        avg_item_size: 16,
        max_items_per_file,
        ..StoreConfig::new("async-store", dir.path())
    }
}

// Common test setup
fn setup_store(max_items_per_file: usize) -> (TempDir, AsyncChunksStore<Vec<u8>>) {
    let dir = TempDir::new().unwrap();
    let store =
        AsyncChunksStore::new(config(&dir, max_items_per_file), Arc::new(RawBytesSerializer))
            .unwrap();
    store.start().unwrap();
    (dir, store)
}

fn item(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

#[test]
fn test_save_and_read_back() {
    let (_dir, store) = setup_store(1000);
    let first = Chunk::new(0, vec![item(3, 0), item(100, 1)]);
    let second = Chunk::new(1, vec![item(17, 2)]);

    assert!(store.save("block", &first).unwrap());
    assert!(store.save("block", &second).unwrap());
    assert!(!store.save("block", &first).unwrap());

    let chunks = store
        .get_chunks("block")
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(chunks, vec![first, second]);

    // Per-collection counters are updated inline
    assert_eq!(store.size("block").unwrap(), 3);
    assert_eq!(store.size_in_bytes("block").unwrap(), 120);

    store.sync_pending().unwrap();
    assert_eq!(store.total_size_in_bytes().unwrap(), 120);
}

#[test]
fn test_remove_is_applied_after_sync() {
    let (_dir, store) = setup_store(1000);
    store.save("gone", &Chunk::new(0, vec![item(40, 0)])).unwrap();
    store.save("kept", &Chunk::new(0, vec![item(8, 1)])).unwrap();

    store.remove("gone").unwrap();
    store.sync_pending().unwrap();

    assert!(!store.contains("gone").unwrap());
    assert!(store.contains("kept").unwrap());
    assert_eq!(store.total_size_in_bytes().unwrap(), 8);
    assert_eq!(store.stat().unwrap().content_entries, 2);
    assert!(store.get_chunks("gone").unwrap().next().is_none());
}

#[test]
fn test_background_reclamation() {
    // Two single-item collections fill a map
    let (dir, store) = setup_store(4);
    for id in ["a", "b", "c", "d", "e"] {
        store.save(id, &Chunk::new(0, vec![item(4, 0)])).unwrap();
    }
    for id in ["a", "b", "c", "d"] {
        store.remove(id).unwrap();
    }
    store.sync_pending().unwrap();

    let folder = dir.path().join("async-store");
    assert_eq!(store.stat().unwrap().content_maps, 2);
    assert!(folder.join("content_0.dat").exists());
    assert!(!folder.join("content_1.dat").exists());
    assert_eq!(store.total_size_in_bytes().unwrap(), 4);
}

#[test]
fn test_stop_drains_queued_removals() {
    let dir = TempDir::new().unwrap();
    let store =
        AsyncChunksStore::new(config(&dir, 100), Arc::new(RawBytesSerializer)).unwrap();
    store.start().unwrap();
    for ordinal in 0..5 {
        store.save("gone", &Chunk::new(ordinal, vec![item(30, 0)])).unwrap();
    }
    store.save("kept", &Chunk::new(0, vec![item(5, 0)])).unwrap();
    store.remove("gone").unwrap();
    store.stop().unwrap();

    assert!(matches!(store.remove("kept"), Err(Error::NotStarted)));

    store.start().unwrap();
    assert_eq!(store.collection_ids().unwrap(), vec!["kept".to_string()]);
    assert_eq!(store.total_size_in_bytes().unwrap(), 5);
}

#[test]
fn test_drop_drains_queued_work() {
    let dir = TempDir::new().unwrap();
    {
        let store =
            AsyncChunksStore::new(config(&dir, 100), Arc::new(RawBytesSerializer)).unwrap();
        store.start().unwrap();
        store.save("gone", &Chunk::new(0, vec![item(30, 0)])).unwrap();
        store.save("kept", &Chunk::new(0, vec![item(6, 0)])).unwrap();
        store.remove("gone").unwrap();
    }

    let store = AsyncChunksStore::new(config(&dir, 100), Arc::new(RawBytesSerializer)).unwrap();
    store.start().unwrap();
    assert!(!store.contains("gone").unwrap());
    assert_eq!(store.total_size_in_bytes().unwrap(), 6);
}

#[test]
fn test_clear_waits_for_pending_work() {
    let (_dir, store) = setup_store(100);
    store.save("a", &Chunk::new(0, vec![item(30, 0)])).unwrap();
    store.save("b", &Chunk::new(0, vec![item(30, 0)])).unwrap();
    store.remove("a").unwrap();

    store.clear().unwrap();
    store.sync_pending().unwrap();

    let stat = store.stat().unwrap();
    assert_eq!(stat.collections, 0);
    assert_eq!(stat.content_maps, 0);
    assert_eq!(stat.total_size_in_bytes, 0);
}

#[test]
fn test_concurrent_saves_and_removals() {
    let (_dir, store) = setup_store(64);
    thread::scope(|scope| {
        for worker in 0..4u8 {
            let store = &store;
            scope.spawn(move || {
                for round in 0..5u32 {
                    let id = format!("w{}-{}", worker, round);
                    let chunk = Chunk::new(0, vec![item(10, worker); 2]);
                    assert!(store.save(&id, &chunk).unwrap());
                    if round % 2 == 0 {
                        store.remove(&id).unwrap();
                    }
                }
            });
        }
    });
    store.sync_pending().unwrap();

    let mut ids = store.collection_ids().unwrap();
    ids.sort();
    let expected: Vec<String> = (0..4)
        .flat_map(|worker| [1, 3].map(|round| format!("w{}-{}", worker, round)))
        .collect();
    assert_eq!(ids, expected);
    assert_eq!(store.total_size_in_bytes().unwrap(), 8 * 20);
}

#[test]
fn test_caller_errors() {
    let (_dir, store) = setup_store(100);
    assert!(matches!(store.remove(""), Err(Error::InvalidArgument(_))));
    assert!(matches!(store.start(), Err(Error::AlreadyStarted)));

    store.stop().unwrap();
    assert!(matches!(store.sync_pending(), Err(Error::NotStarted)));
    assert!(matches!(
        store.save("a", &Chunk::new(0, vec![item(1, 0)])),
        Err(Error::NotStarted)
    ));
}
