#![cfg(feature = "fjall")]

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use utxod_storage::fjall::FjallStore;
use utxod_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn fjall_smoke_roundtrip() {
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    dir.push(format!("utxod_fjall_smoke_{nanos}"));

    let store = FjallStore::open(&dir).expect("open fjall");
    store.put(Column::Meta, b"key", b"value").expect("put");
    assert_eq!(
        store.get(Column::Meta, b"key").expect("get"),
        Some(b"value".to_vec())
    );

    store.put(Column::AddressIndex, b"a.1", b"x").expect("put");
    store.put(Column::AddressIndex, b"a.2", b"y").expect("put");
    store.put(Column::Utxo, b"a.3", b"z").expect("put");
    let rows: HashSet<(Vec<u8>, Vec<u8>)> = store
        .scan_prefix(Column::AddressIndex, b"a.")
        .expect("scan")
        .into_iter()
        .collect();
    assert_eq!(
        rows,
        HashSet::from([
            (b"a.1".to_vec(), b"x".to_vec()),
            (b"a.2".to_vec(), b"y".to_vec()),
        ])
    );

    let mut batch = WriteBatch::new();
    batch.put(Column::RawTx, b"tx", b"bytes");
    batch.delete(Column::Meta, b"key");
    store.write_batch(&batch).expect("batch commit");
    store.persist().expect("persist");

    assert!(store.get(Column::Meta, b"key").expect("get").is_none());
    assert_eq!(
        store.get(Column::RawTx, b"tx").expect("get"),
        Some(b"bytes".to_vec())
    );

    drop(store);
    let reopened = FjallStore::open(&dir).expect("reopen fjall");
    assert_eq!(
        reopened.get(Column::RawTx, b"tx").expect("get"),
        Some(b"bytes".to_vec())
    );
    drop(reopened);
    let _ = std::fs::remove_dir_all(&dir);
}
