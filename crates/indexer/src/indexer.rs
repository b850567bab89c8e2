//! The indexing context: storage wrappers, write buffer, optional hot set and
//! in-memory progress, constructed once at startup.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use utxod_primitives::{Block, Network};
use utxod_storage::KeyValueStore;

use crate::address_index::AddressIndex;
use crate::cursor::{Cursor, CursorStore, IndexState};
use crate::error::IndexerError;
use crate::hotset::{HotSet, HotSetConfig};
use crate::rawtx::RawTxStore;
use crate::slot_cache::SlotCache;
use crate::staging::BlockStaging;
use crate::txseq::SequenceIndex;
use crate::utxo::UtxoSet;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IndexerConfig {
    pub network: Network,
    pub store_raw_tx: bool,
    pub hot_set: Option<HotSetConfig>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            store_raw_tx: true,
            hot_set: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockStats {
    pub height: u32,
    pub transactions: usize,
    pub inputs: usize,
    pub outputs: usize,
    pub last_sequence: u32,
    /// Buffer weight after absorbing the block.
    pub weight: usize,
}

pub struct Indexer<S> {
    pub(crate) store: S,
    pub(crate) utxos: UtxoSet<S>,
    pub(crate) addresses: AddressIndex<S>,
    pub(crate) sequences: SequenceIndex<S>,
    pub(crate) raw_txs: RawTxStore<S>,
    pub(crate) cursor_store: CursorStore<S>,
    pub(crate) config: IndexerConfig,
    pub(crate) cache: SlotCache,
    pub(crate) hot: Option<HotSet>,
    pub(crate) height: AtomicU32,
    pub(crate) sequence: AtomicU32,
    durable: Mutex<Cursor>,
    pub(crate) flushes: AtomicU64,
}

impl<S: KeyValueStore + Clone> Indexer<S> {
    /// Loads the durable cursor and refuses a store whose last flush was interrupted.
    pub fn open(store: S, config: IndexerConfig) -> Result<Self, IndexerError> {
        let cursor_store = CursorStore::new(store.clone());
        let cursor = cursor_store.load()?;
        if cursor.state == IndexState::Applying {
            return Err(IndexerError::InterruptedFlush {
                height: cursor.height,
            });
        }
        cursor_store.ensure_layout()?;

        let indexer = Self {
            utxos: UtxoSet::new(store.clone()),
            addresses: AddressIndex::new(store.clone()),
            sequences: SequenceIndex::new(store.clone()),
            raw_txs: RawTxStore::new(store.clone()),
            cursor_store,
            config,
            cache: SlotCache::new(),
            hot: config.hot_set.map(HotSet::new),
            height: AtomicU32::new(cursor.height),
            sequence: AtomicU32::new(cursor.sequence),
            durable: Mutex::new(cursor),
            flushes: AtomicU64::new(0),
            store,
        };

        if let Some(hot) = indexer.hot.as_ref() {
            let loaded = hot.warm(&indexer.utxos, &indexer.addresses)?;
            utxod_log::log_info!(
                "hot set warmed with {loaded} entries ({} utxos, {} addresses)",
                hot.utxo_count(),
                hot.address_count()
            );
        }
        utxod_log::log_info!(
            "index opened at height {} sequence {}",
            cursor.height,
            cursor.sequence
        );
        Ok(indexer)
    }

    /// Stages every transaction of the block at `height`, which must follow the
    /// current in-memory height. A failure leaves the write buffer unchanged.
    pub fn index_block(&self, height: u32, block: &Block) -> Result<BlockStats, IndexerError> {
        let current = self.height();
        let expected = current
            .checked_add(1)
            .ok_or(IndexerError::OutOfOrder {
                expected: current,
                got: height,
            })?;
        if height != expected {
            return Err(IndexerError::OutOfOrder {
                expected,
                got: height,
            });
        }

        let mut staging = BlockStaging::new(
            &self.cache,
            self.hot.as_ref(),
            &self.utxos,
            self.config.network,
            self.config.store_raw_tx,
            height,
            self.last_sequence(),
        );
        for (position, tx) in block.transactions.iter().enumerate() {
            let (txid, sequence) = staging.stage(position, tx)?;
            utxod_log::log_trace!(
                "staged tx {} seq {sequence} at height {height}",
                utxod_primitives::hex::hash256_to_hex(&txid)
            );
        }
        let inputs = staging.inputs;
        let outputs = staging.outputs;
        let last_sequence = staging.last_sequence();
        let delta = staging.into_delta();

        let mut entries = self.cache.lock();
        if self.height() != current {
            return Err(IndexerError::OutOfOrder {
                expected: self.height().saturating_add(1),
                got: height,
            });
        }
        entries.absorb(delta);
        let weight = entries.weight();
        // Published under the lock so a flush never sees the entries without their height.
        self.sequence.store(last_sequence, Ordering::SeqCst);
        self.height.store(height, Ordering::SeqCst);
        drop(entries);

        Ok(BlockStats {
            height,
            transactions: block.transactions.len(),
            inputs,
            outputs,
            last_sequence,
            weight,
        })
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S> Indexer<S> {
    /// Height of the last block absorbed into the buffer.
    pub fn height(&self) -> u32 {
        self.height.load(Ordering::SeqCst)
    }

    pub fn last_sequence(&self) -> u32 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn weight(&self) -> usize {
        self.cache.weight()
    }

    pub fn has_pending(&self) -> bool {
        !self.cache.is_empty()
    }

    pub fn durable_cursor(&self) -> Cursor {
        *self.durable_lock()
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn hot_set(&self) -> Option<&HotSet> {
        self.hot.as_ref()
    }

    pub(crate) fn durable_lock(&self) -> MutexGuard<'_, Cursor> {
        self.durable.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_durable_state(&self, state: IndexState) {
        self.durable_lock().state = state;
    }
}
