//! Flush trigger policy and the ordered write-out of the buffer.

use std::fmt;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use utxod_storage::{Column, KeyValueStore, WriteBatch};

use crate::cursor::{Cursor, IndexState};
use crate::error::IndexerError;
use crate::indexer::Indexer;

pub const DEFAULT_WEIGHT_CEILING: usize = 256 * 1024 * 1024;
pub const DEFAULT_SAMPLING_INTERVAL: u32 = 1_000;
pub const DEFAULT_TAIL_WINDOW: u32 = 20;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushReason {
    Weight,
    Tail,
    Quit,
    Manual,
}

impl FlushReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FlushReason::Weight => "weight",
            FlushReason::Tail => "tail",
            FlushReason::Quit => "quit",
            FlushReason::Manual => "manual",
        }
    }
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FlushPolicy {
    pub weight_ceiling: usize,
    /// Weight is only sampled at heights divisible by this; zero disables weight flushes.
    pub sampling_interval: u32,
    pub tail_window: u32,
    pub flush_on_quit: bool,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            weight_ceiling: DEFAULT_WEIGHT_CEILING,
            sampling_interval: DEFAULT_SAMPLING_INTERVAL,
            tail_window: DEFAULT_TAIL_WINDOW,
            flush_on_quit: true,
        }
    }
}

impl FlushPolicy {
    pub fn should_flush(&self, height: u32, tip: u32, weight: usize) -> Option<FlushReason> {
        if u64::from(height) + u64::from(self.tail_window) > u64::from(tip) {
            return Some(FlushReason::Tail);
        }
        if self.sampling_interval > 0
            && height % self.sampling_interval == 0
            && weight > self.weight_ceiling
        {
            return Some(FlushReason::Weight);
        }
        None
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlushStats {
    pub reason: FlushReason,
    pub height: u32,
    pub sequence: u32,
    pub weight: usize,
    pub addresses: usize,
    pub association_rows: usize,
    pub utxo_adds: usize,
    pub utxo_deletes: usize,
    pub sequences: usize,
    pub raw_txs: usize,
    pub evicted: usize,
    pub elapsed: Duration,
}

impl<S: KeyValueStore + Clone> Indexer<S> {
    /// Writes the buffer out under the `Applying` marker and moves the durable cursor to
    /// the current in-memory height.
    ///
    /// On error the buffer is kept and the marker is left at `Applying`, so the next
    /// startup refuses to resume.
    pub fn flush(&self, reason: FlushReason) -> Result<FlushStats, IndexerError> {
        let started = Instant::now();
        let mut entries = self.cache.lock();
        let height = self.height.load(Ordering::SeqCst);
        let sequence = self.sequence.load(Ordering::SeqCst);
        let weight = entries.weight();

        self.cursor_store.mark(IndexState::Applying)?;
        self.set_durable_state(IndexState::Applying);

        let mut batch = WriteBatch::new();
        let mut association_rows = 0;
        for (address, pending) in entries.address_refs() {
            let persisted = match self.hot.as_ref().and_then(|hot| hot.address_refs(address)) {
                Some(known) => known,
                None => self.addresses.associations(address)?,
            };
            association_rows += self
                .addresses
                .stage_merge(&mut batch, address, &persisted, pending);
        }
        if !batch.is_empty() {
            self.store.write_batch(&batch)?;
        }

        let deletes = entries.utxo_deletes();
        let adds: Vec<_> = entries
            .utxo_adds()
            .par_iter()
            .map(|(source, detail)| (source.key(), detail.encode()))
            .collect();
        let mut batch = WriteBatch::with_capacity(deletes.len() + adds.len());
        for source in deletes {
            self.utxos.delete(&mut batch, source);
        }
        for (key, value) in adds {
            batch.put(Column::Utxo, key, value);
        }
        if !batch.is_empty() {
            self.store.write_batch(&batch)?;
        }

        let mut batch = WriteBatch::with_capacity(entries.sequences().len());
        for (seq, txid) in entries.sequences() {
            self.sequences.put(&mut batch, *seq, txid);
        }
        if !batch.is_empty() {
            self.store.write_batch(&batch)?;
        }

        let mut raw_txs = 0;
        if self.config.store_raw_tx && !entries.raw_txs().is_empty() {
            let mut batch = WriteBatch::with_capacity(entries.raw_txs().len());
            for (txid, bytes) in entries.raw_txs() {
                self.raw_txs.put(&mut batch, txid, bytes);
            }
            raw_txs = batch.len();
            self.store.write_batch(&batch)?;
        }
        self.store.persist()?;

        self.cursor_store.set_progress(height, sequence)?;
        self.cursor_store.mark(IndexState::Consistent)?;
        *self.durable_lock() = Cursor {
            height,
            sequence,
            state: IndexState::Consistent,
        };

        let mut evicted = 0;
        if let Some(hot) = self.hot.as_ref() {
            hot.apply(&entries);
            evicted = hot.sweep(height);
        }

        let stats = FlushStats {
            reason,
            height,
            sequence,
            weight,
            addresses: entries.address_refs().len(),
            association_rows,
            utxo_adds: entries.utxo_adds().len(),
            utxo_deletes: entries.utxo_deletes().len(),
            sequences: entries.sequences().len(),
            raw_txs,
            evicted,
            elapsed: started.elapsed(),
        };
        entries.clear();
        drop(entries);
        self.flushes.fetch_add(1, Ordering::Relaxed);

        utxod_log::log_info!(
            "flush ({}) height {} sequence {} weight {} addresses {} utxo +{} -{} txs {} raw {} evicted {} in {}ms",
            stats.reason,
            stats.height,
            stats.sequence,
            stats.weight,
            stats.addresses,
            stats.utxo_adds,
            stats.utxo_deletes,
            stats.sequences,
            stats.raw_txs,
            stats.evicted,
            stats.elapsed.as_millis()
        );
        Ok(stats)
    }
}
