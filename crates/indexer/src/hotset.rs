//! Optional in-memory mirror of recently touched UTXOs and address sets.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use utxod_storage::{KeyValueStore, StoreError};

use crate::address_index::AddressIndex;
use crate::slot_cache::SlotEntries;
use crate::utxo::{UtxoDetail, UtxoSet, UtxoSource};

pub const DEFAULT_HIGH_WATER: usize = 5_000_000;
pub const DEFAULT_CONFIRMATION_DEPTH: u32 = 50_000;
pub const DEFAULT_MIN_REFS: usize = 3;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HotSetConfig {
    pub utxos: bool,
    pub addresses: bool,
    pub high_water: usize,
    pub confirmation_depth: u32,
    /// Address entries with at most this many associations are swept first.
    pub min_refs: usize,
}

impl Default for HotSetConfig {
    fn default() -> Self {
        Self {
            utxos: true,
            addresses: true,
            high_water: DEFAULT_HIGH_WATER,
            confirmation_depth: DEFAULT_CONFIRMATION_DEPTH,
            min_refs: DEFAULT_MIN_REFS,
        }
    }
}

#[derive(Default)]
struct HotEntries {
    utxos: HashMap<UtxoSource, UtxoDetail>,
    addresses: HashMap<String, BTreeSet<u32>>,
}

impl HotEntries {
    fn total(&self) -> usize {
        self.utxos.len() + self.addresses.len()
    }
}

/// A hit is authoritative for presence; a miss says nothing and must fall back to storage.
/// Address sets are always a subset of what is persisted.
pub struct HotSet {
    config: HotSetConfig,
    inner: Mutex<HotEntries>,
}

impl HotSet {
    pub fn new(config: HotSetConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(HotEntries::default()),
        }
    }

    pub fn config(&self) -> &HotSetConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HotEntries> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads durable entries until the high-water mark is reached. Returns the entry count.
    pub fn warm<S: KeyValueStore>(
        &self,
        utxos: &UtxoSet<S>,
        addresses: &AddressIndex<S>,
    ) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let high_water = self.config.high_water;
        if self.config.utxos {
            utxos.for_each(|source, detail| {
                inner.utxos.insert(source, detail);
                inner.total() < high_water
            })?;
        }
        if self.config.addresses && inner.total() < high_water {
            addresses.for_each_association(|address, seq| {
                match inner.addresses.get_mut(address) {
                    Some(set) => {
                        set.insert(seq);
                    }
                    None => {
                        inner
                            .addresses
                            .insert(address.to_owned(), BTreeSet::from([seq]));
                    }
                }
                inner.total() < high_water
            })?;
        }
        Ok(inner.total())
    }

    pub fn get_utxo(&self, source: &UtxoSource) -> Option<UtxoDetail> {
        if !self.config.utxos {
            return None;
        }
        self.lock().utxos.get(source).cloned()
    }

    pub fn address_refs(&self, address: &str) -> Option<BTreeSet<u32>> {
        if !self.config.addresses {
            return None;
        }
        self.lock().addresses.get(address).cloned()
    }

    /// Mirrors a buffer whose writes are already durable.
    pub fn apply(&self, entries: &SlotEntries) {
        let mut inner = self.lock();
        if self.config.utxos {
            for source in entries.utxo_deletes() {
                inner.utxos.remove(source);
            }
            for (source, detail) in entries.utxo_adds() {
                inner.utxos.insert(*source, detail.clone());
            }
        }
        if self.config.addresses {
            for (address, refs) in entries.address_refs() {
                inner
                    .addresses
                    .entry(address.clone())
                    .or_default()
                    .extend(refs.iter().copied());
            }
        }
    }

    /// Drops old UTXOs and sparse address sets once over the high-water mark.
    /// Returns how many entries were evicted.
    pub fn sweep(&self, current_height: u32) -> usize {
        let mut inner = self.lock();
        let before = inner.total();
        if before <= self.config.high_water {
            return 0;
        }
        let depth = self.config.confirmation_depth;
        let min_refs = self.config.min_refs;
        inner
            .utxos
            .retain(|_, detail| detail.height.saturating_add(depth) >= current_height);
        inner.addresses.retain(|_, refs| refs.len() > min_refs);
        before - inner.total()
    }

    pub fn utxo_count(&self) -> usize {
        self.lock().utxos.len()
    }

    pub fn address_count(&self) -> usize {
        self.lock().addresses.len()
    }

    pub fn len(&self) -> usize {
        self.lock().total()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
