use utxod_primitives::Hash256;
use utxod_storage::{Column, KeyValueStore, StoreError, WriteBatch};

/// Compact sequence number to txid mapping.
pub struct SequenceIndex<S> {
    store: S,
}

impl<S> SequenceIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> SequenceIndex<S> {
    pub fn get(&self, sequence: u32) -> Result<Option<Hash256>, StoreError> {
        let Some(bytes) = self.store.get(Column::TxSequence, &sequence.to_be_bytes())? else {
            return Ok(None);
        };
        let txid: Hash256 = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::corrupt(Column::TxSequence, "txid length"))?;
        Ok(Some(txid))
    }

    pub fn put(&self, batch: &mut WriteBatch, sequence: u32, txid: &Hash256) {
        batch.put(Column::TxSequence, sequence.to_be_bytes(), txid);
    }
}
