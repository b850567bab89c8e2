//! In-memory write buffer between block processing and durable storage.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
#[cfg(test)]
use std::sync::TryLockError;

use utxod_primitives::Hash256;

use crate::utxo::{UtxoDetail, UtxoSource};

pub const ADDRESS_BUCKET_WEIGHT: usize = 30;
pub const ADDRESS_REF_WEIGHT: usize = 8;
pub const UTXO_ADD_WEIGHT: usize = 108;
pub const UTXO_DELETE_WEIGHT: usize = 36;
pub const SEQUENCE_WEIGHT: usize = 36;
pub const RAW_TX_BASE_WEIGHT: usize = 32;

/// Outcome of looking a UTXO up in a pending layer.
#[derive(Debug, Eq, PartialEq)]
pub enum Lookup<'a> {
    Found(&'a UtxoDetail),
    /// Tombstoned in this layer; lower layers must not be consulted.
    Spent,
    Unknown,
}

/// Pending effects not yet written to storage.
///
/// A key is never in both `utxo_adds` and `utxo_deletes`.
#[derive(Debug, Default)]
pub struct SlotEntries {
    address_refs: HashMap<String, BTreeSet<u32>>,
    utxo_adds: HashMap<UtxoSource, UtxoDetail>,
    utxo_deletes: HashSet<UtxoSource>,
    sequences: BTreeMap<u32, Hash256>,
    raw_txs: HashMap<Hash256, Vec<u8>>,
    ref_count: usize,
    raw_bytes: usize,
}

impl SlotEntries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_address_association(&mut self, address: &str, sequence: u32) {
        let inserted = match self.address_refs.get_mut(address) {
            Some(set) => set.insert(sequence),
            None => {
                self.address_refs
                    .insert(address.to_owned(), BTreeSet::from([sequence]));
                true
            }
        };
        if inserted {
            self.ref_count += 1;
        }
    }

    pub fn add_utxo(&mut self, source: UtxoSource, detail: UtxoDetail) {
        self.utxo_deletes.remove(&source);
        self.utxo_adds.insert(source, detail);
    }

    /// Cancels a pending add of the same key, otherwise records a tombstone.
    pub fn remove_utxo(&mut self, source: UtxoSource) {
        if self.utxo_adds.remove(&source).is_none() {
            self.utxo_deletes.insert(source);
        }
    }

    pub fn add_sequence_mapping(&mut self, sequence: u32, txid: Hash256) {
        self.sequences.insert(sequence, txid);
    }

    pub fn add_raw_transaction(&mut self, txid: Hash256, bytes: Vec<u8>) {
        let len = bytes.len();
        if let Some(previous) = self.raw_txs.insert(txid, bytes) {
            self.raw_bytes -= RAW_TX_BASE_WEIGHT + previous.len();
        }
        self.raw_bytes += RAW_TX_BASE_WEIGHT + len;
    }

    pub fn lookup_utxo(&self, source: &UtxoSource) -> Lookup<'_> {
        if let Some(detail) = self.utxo_adds.get(source) {
            Lookup::Found(detail)
        } else if self.utxo_deletes.contains(source) {
            Lookup::Spent
        } else {
            Lookup::Unknown
        }
    }

    pub fn weight(&self) -> usize {
        self.address_refs.len() * ADDRESS_BUCKET_WEIGHT
            + self.ref_count * ADDRESS_REF_WEIGHT
            + self.utxo_adds.len() * UTXO_ADD_WEIGHT
            + self.utxo_deletes.len() * UTXO_DELETE_WEIGHT
            + self.sequences.len() * SEQUENCE_WEIGHT
            + self.raw_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.address_refs.is_empty()
            && self.utxo_adds.is_empty()
            && self.utxo_deletes.is_empty()
            && self.sequences.is_empty()
            && self.raw_txs.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Folds a later layer on top of this one, applying the cancel rule to its deletes.
    pub fn absorb(&mut self, delta: SlotEntries) {
        for source in delta.utxo_deletes {
            self.remove_utxo(source);
        }
        for (source, detail) in delta.utxo_adds {
            self.add_utxo(source, detail);
        }
        for (address, refs) in delta.address_refs {
            for sequence in refs {
                self.add_address_association(&address, sequence);
            }
        }
        self.sequences.extend(delta.sequences);
        for (txid, bytes) in delta.raw_txs {
            self.add_raw_transaction(txid, bytes);
        }
    }

    pub fn address_refs(&self) -> &HashMap<String, BTreeSet<u32>> {
        &self.address_refs
    }

    pub fn utxo_adds(&self) -> &HashMap<UtxoSource, UtxoDetail> {
        &self.utxo_adds
    }

    pub fn utxo_deletes(&self) -> &HashSet<UtxoSource> {
        &self.utxo_deletes
    }

    pub fn sequences(&self) -> &BTreeMap<u32, Hash256> {
        &self.sequences
    }

    pub fn raw_txs(&self) -> &HashMap<Hash256, Vec<u8>> {
        &self.raw_txs
    }
}

/// Mutex-guarded [`SlotEntries`] shared by the ingestion and status paths.
#[derive(Debug, Default)]
pub struct SlotCache {
    inner: Mutex<SlotEntries>,
}

impl SlotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, SlotEntries> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn weight(&self) -> usize {
        self.lock().weight()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn absorb(&self, delta: SlotEntries) {
        self.lock().absorb(delta);
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        matches!(self.inner.try_lock(), Err(TryLockError::WouldBlock))
    }
}
