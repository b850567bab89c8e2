//! Per-block overlay: effects are collected here and only reach the write buffer
//! once every transaction of the block has been staged.

use utxod_primitives::{Hash256, Network, Transaction};
use utxod_script::extract_destination;
use utxod_storage::KeyValueStore;

use crate::error::IndexerError;
use crate::hotset::HotSet;
use crate::slot_cache::{Lookup, SlotCache, SlotEntries};
use crate::utxo::{UtxoDetail, UtxoSet, UtxoSource};

pub(crate) struct BlockStaging<'a, S> {
    buffered: &'a SlotCache,
    hot: Option<&'a HotSet>,
    utxos: &'a UtxoSet<S>,
    network: Network,
    store_raw_tx: bool,
    height: u32,
    last_sequence: u32,
    delta: SlotEntries,
    pub(crate) inputs: usize,
    pub(crate) outputs: usize,
}

impl<'a, S: KeyValueStore> BlockStaging<'a, S> {
    pub(crate) fn new(
        buffered: &'a SlotCache,
        hot: Option<&'a HotSet>,
        utxos: &'a UtxoSet<S>,
        network: Network,
        store_raw_tx: bool,
        height: u32,
        last_sequence: u32,
    ) -> Self {
        Self {
            buffered,
            hot,
            utxos,
            network,
            store_raw_tx,
            height,
            last_sequence,
            delta: SlotEntries::new(),
            inputs: 0,
            outputs: 0,
        }
    }

    /// Block delta, then write buffer, then hot set, then storage.
    fn resolve(&self, source: &UtxoSource) -> Result<UtxoDetail, IndexerError> {
        match self.delta.lookup_utxo(source) {
            Lookup::Found(detail) => return Ok(detail.clone()),
            Lookup::Spent => return Err(IndexerError::MissingUtxo(*source)),
            Lookup::Unknown => {}
        }
        // A flush only moves buffered keys, so a key unknown here keeps its stored value.
        match self.buffered.lock().lookup_utxo(source) {
            Lookup::Found(detail) => return Ok(detail.clone()),
            Lookup::Spent => return Err(IndexerError::MissingUtxo(*source)),
            Lookup::Unknown => {}
        }
        if let Some(detail) = self.hot.and_then(|hot| hot.get_utxo(source)) {
            return Ok(detail);
        }
        self.utxos
            .get(source)?
            .ok_or(IndexerError::MissingUtxo(*source))
    }

    /// Stages one transaction. Inputs are resolved before anything is written so a
    /// failure leaves the delta untouched.
    pub(crate) fn stage(
        &mut self,
        position: usize,
        tx: &Transaction,
    ) -> Result<(Hash256, u32), IndexerError> {
        let txid = tx.txid();
        let sequence = self
            .last_sequence
            .checked_add(1)
            .ok_or(IndexerError::SequenceExhausted)?;

        let spent = if position == 0 && tx.is_coinbase() {
            Vec::new()
        } else {
            tx.vin
                .iter()
                .map(|input| {
                    let source = UtxoSource::from(&input.prevout);
                    self.resolve(&source).map(|detail| (source, detail))
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        for (source, detail) in spent {
            self.delta.remove_utxo(source);
            if let Some(address) = extract_destination(&detail.script, self.network).index_key() {
                self.delta.add_address_association(&address, sequence);
            }
            self.inputs += 1;
        }

        for (index, output) in tx.vout.iter().enumerate() {
            let address = extract_destination(&output.script_pubkey, self.network)
                .index_key()
                .unwrap_or_default();
            if !address.is_empty() {
                self.delta.add_address_association(&address, sequence);
            }
            let index = u32::try_from(index)
                .map_err(|_| IndexerError::Decode(format!("output index {index} overflows")))?;
            self.delta.add_utxo(
                UtxoSource::new(txid, index),
                UtxoDetail {
                    amount: output.value,
                    height: self.height,
                    address,
                    script: output.script_pubkey.clone(),
                },
            );
            self.outputs += 1;
        }

        self.delta.add_sequence_mapping(sequence, txid);
        if self.store_raw_tx {
            self.delta.add_raw_transaction(txid, tx.consensus_encode());
        }
        self.last_sequence = sequence;
        Ok((txid, sequence))
    }

    pub(crate) fn last_sequence(&self) -> u32 {
        self.last_sequence
    }

    pub(crate) fn into_delta(self) -> SlotEntries {
        self.delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use utxod_primitives::outpoint::OutPoint;
    use utxod_primitives::transaction::{TxIn, TxOut};
    use utxod_storage::memory::MemoryStore;
    use utxod_storage::{Column, PrefixVisitor, ScanResult, StoreError, WriteBatch};

    /// Records whether the write buffer was locked while storage was read.
    struct BufferWatchingStore {
        inner: MemoryStore,
        cache: Arc<SlotCache>,
        locked_during_read: AtomicBool,
    }

    impl KeyValueStore for BufferWatchingStore {
        fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
            if self.cache.is_locked() {
                self.locked_during_read.store(true, Ordering::SeqCst);
            }
            self.inner.get(column, key)
        }

        fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
            self.inner.put(column, key, value)
        }

        fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
            self.inner.delete(column, key)
        }

        fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
            self.inner.scan_prefix(column, prefix)
        }

        fn for_each_prefix<'a>(
            &self,
            column: Column,
            prefix: &[u8],
            visitor: &mut PrefixVisitor<'a>,
        ) -> Result<(), StoreError> {
            self.inner.for_each_prefix(column, prefix, visitor)
        }

        fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
            self.inner.write_batch(batch)
        }
    }

    fn spend(prevout: OutPoint) -> Transaction {
        Transaction {
            version: 2,
            vin: vec![TxIn {
                prevout,
                script_sig: vec![0x00],
                sequence: u32::MAX,
                witness: Vec::new(),
            }],
            vout: vec![TxOut {
                value: 40,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn storage_reads_happen_outside_the_buffer_lock() {
        let cache = Arc::new(SlotCache::new());
        let store = Arc::new(BufferWatchingStore {
            inner: MemoryStore::new(),
            cache: Arc::clone(&cache),
            locked_during_read: AtomicBool::new(false),
        });
        let utxos = UtxoSet::new(Arc::clone(&store));
        let stored = UtxoSource::new([7; 32], 0);
        let mut batch = WriteBatch::new();
        utxos.put(
            &mut batch,
            &stored,
            &UtxoDetail {
                amount: 50,
                height: 1,
                address: String::new(),
                script: vec![0x51],
            },
        );
        store.write_batch(&batch).expect("seed utxo");

        let mut staging = BlockStaging::new(&cache, None, &utxos, Network::Regtest, false, 2, 1);
        let tx = spend(OutPoint {
            hash: [7; 32],
            index: 0,
        });
        let (_, sequence) = staging.stage(1, &tx).expect("stage spend");
        assert_eq!(sequence, 2);
        assert_eq!(staging.inputs, 1);
        assert!(!store.locked_during_read.load(Ordering::SeqCst));

        let delta = staging.into_delta();
        assert_eq!(delta.lookup_utxo(&stored), Lookup::Spent);
    }

    #[test]
    fn buffered_tombstone_blocks_storage_fallback() {
        let cache = SlotCache::new();
        let store = Arc::new(MemoryStore::new());
        let utxos = UtxoSet::new(Arc::clone(&store));
        let stored = UtxoSource::new([9; 32], 0);
        let mut batch = WriteBatch::new();
        utxos.put(
            &mut batch,
            &stored,
            &UtxoDetail {
                amount: 5,
                height: 1,
                address: String::new(),
                script: vec![0x51],
            },
        );
        store.write_batch(&batch).expect("seed utxo");
        cache.lock().remove_utxo(stored);

        let mut staging = BlockStaging::new(&cache, None, &utxos, Network::Regtest, false, 3, 4);
        let tx = spend(OutPoint {
            hash: [9; 32],
            index: 0,
        });
        match staging.stage(1, &tx) {
            Err(IndexerError::MissingUtxo(missing)) => assert_eq!(missing, stored),
            other => panic!("expected missing utxo, got {other:?}"),
        }
    }
}
