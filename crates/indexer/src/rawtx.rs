use utxod_primitives::Hash256;
use utxod_storage::{Column, KeyValueStore, StoreError, WriteBatch};

pub struct RawTxStore<S> {
    store: S,
}

impl<S> RawTxStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> RawTxStore<S> {
    pub fn get(&self, txid: &Hash256) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.get(Column::RawTx, txid)
    }

    pub fn put(&self, batch: &mut WriteBatch, txid: &Hash256, bytes: &[u8]) {
        batch.put(Column::RawTx, txid, bytes);
    }
}
