//! Address to transaction-sequence index backed by the storage trait.
//!
//! One row per association: `address ‖ '.' ‖ seq (BE)`, so a prefix scan over
//! `address ‖ '.'` returns the set in ingestion order.

use std::collections::BTreeSet;
use std::ops::ControlFlow;

use utxod_storage::{Column, KeyValueStore, StoreError, WriteBatch};

const SEPARATOR: u8 = b'.';
const SEQ_LEN: usize = 4;

pub fn address_prefix(address: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(address.len() + 1);
    prefix.extend_from_slice(address.as_bytes());
    prefix.push(SEPARATOR);
    prefix
}

pub fn address_key(address: &str, sequence: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(address.len() + 1 + SEQ_LEN);
    key.extend_from_slice(address.as_bytes());
    key.push(SEPARATOR);
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

/// Splits a row key back into its address and sequence.
pub fn parse_address_key(key: &[u8]) -> Option<(&str, u32)> {
    if key.len() < SEQ_LEN + 1 {
        return None;
    }
    let (head, seq) = key.split_at(key.len() - SEQ_LEN);
    let (&separator, address) = head.split_last()?;
    if separator != SEPARATOR {
        return None;
    }
    let address = std::str::from_utf8(address).ok()?;
    Some((address, u32::from_be_bytes(seq.try_into().ok()?)))
}

/// Set union; merging the same pending set twice gives the same result.
pub fn merge_associations(persisted: &BTreeSet<u32>, pending: &BTreeSet<u32>) -> BTreeSet<u32> {
    persisted.union(pending).copied().collect()
}

pub struct AddressIndex<S> {
    store: S,
}

impl<S> AddressIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> AddressIndex<S> {
    pub fn associations(&self, address: &str) -> Result<BTreeSet<u32>, StoreError> {
        let prefix = address_prefix(address);
        let mut out = BTreeSet::new();
        self.store
            .for_each_prefix(Column::AddressIndex, &prefix, &mut |key, _| {
                let seq = key
                    .get(prefix.len()..)
                    .and_then(|tail| <[u8; SEQ_LEN]>::try_from(tail).ok())
                    .map(u32::from_be_bytes)
                    .ok_or_else(|| StoreError::corrupt(Column::AddressIndex, "bad key length"))?;
                out.insert(seq);
                Ok(ControlFlow::Continue(()))
            })?;
        Ok(out)
    }

    /// Stages the rows that `merge_associations(persisted, pending)` adds on top of
    /// `persisted`. Returns how many rows were staged.
    pub fn stage_merge(
        &self,
        batch: &mut WriteBatch,
        address: &str,
        persisted: &BTreeSet<u32>,
        pending: &BTreeSet<u32>,
    ) -> usize {
        let merged = merge_associations(persisted, pending);
        let mut staged = 0;
        for seq in merged.difference(persisted) {
            batch.put(
                Column::AddressIndex,
                address_key(address, *seq),
                seq.to_le_bytes(),
            );
            staged += 1;
        }
        staged
    }

    /// Visits `(address, sequence)` rows in key order; the visitor returns `false` to stop.
    pub fn for_each_association(
        &self,
        mut visitor: impl FnMut(&str, u32) -> bool,
    ) -> Result<(), StoreError> {
        self.store
            .for_each_prefix(Column::AddressIndex, &[], &mut |key, _| {
                let (address, seq) = parse_address_key(key)
                    .ok_or_else(|| StoreError::corrupt(Column::AddressIndex, "bad key"))?;
                Ok(if visitor(address, seq) {
                    ControlFlow::Continue(())
                } else {
                    ControlFlow::Break(())
                })
            })
    }
}
