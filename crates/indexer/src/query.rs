//! Read-only views over durable storage.
//!
//! Nothing here consults the write buffer, so answers trail ingestion by up to one
//! flush interval.

use utxod_primitives::{Hash256, Network, Transaction};
use utxod_script::extract_destination;
use utxod_storage::KeyValueStore;

use crate::address_index::AddressIndex;
use crate::cursor::{Cursor, CursorStore};
use crate::error::IndexerError;
use crate::rawtx::RawTxStore;
use crate::txseq::SequenceIndex;
use crate::utxo::{UtxoDetail, UtxoSet, UtxoSource};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InputView {
    /// `None` for a coinbase input.
    pub prevout: Option<UtxoSource>,
    pub sequence: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutputView {
    pub index: u32,
    pub value: i64,
    pub script: Vec<u8>,
    pub address: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransactionView {
    pub txid: Hash256,
    pub version: i32,
    pub lock_time: u32,
    pub size: usize,
    pub inputs: Vec<InputView>,
    pub outputs: Vec<OutputView>,
}

pub struct QueryService<S> {
    cursor: CursorStore<S>,
    utxos: UtxoSet<S>,
    addresses: AddressIndex<S>,
    sequences: SequenceIndex<S>,
    raw_txs: RawTxStore<S>,
    network: Network,
}

impl<S: KeyValueStore + Clone> QueryService<S> {
    pub fn new(store: S, network: Network) -> Self {
        Self {
            cursor: CursorStore::new(store.clone()),
            utxos: UtxoSet::new(store.clone()),
            addresses: AddressIndex::new(store.clone()),
            sequences: SequenceIndex::new(store.clone()),
            raw_txs: RawTxStore::new(store),
            network,
        }
    }
}

impl<S: KeyValueStore> QueryService<S> {
    pub fn index_state(&self) -> Result<Cursor, IndexerError> {
        Ok(self.cursor.load()?)
    }

    pub fn indexed_height(&self) -> Result<u32, IndexerError> {
        Ok(self.index_state()?.height)
    }

    /// Last persisted sequence number, which is also the number of indexed transactions.
    pub fn transaction_count(&self) -> Result<u32, IndexerError> {
        Ok(self.index_state()?.sequence)
    }

    pub fn txid_by_sequence(&self, sequence: u32) -> Result<Option<Hash256>, IndexerError> {
        Ok(self.sequences.get(sequence)?)
    }

    /// Transactions that paid to or spent from `address`, in ingestion order.
    pub fn address_associations(&self, address: &str) -> Result<Vec<Hash256>, IndexerError> {
        let sequences = self.addresses.associations(address)?;
        let mut txids = Vec::with_capacity(sequences.len());
        for sequence in sequences {
            match self.sequences.get(sequence)? {
                Some(txid) => txids.push(txid),
                None => utxod_log::log_debug!("address {address} references unmapped seq {sequence}"),
            }
        }
        Ok(txids)
    }

    pub fn raw_transaction(&self, txid: &Hash256) -> Result<Option<Vec<u8>>, IndexerError> {
        Ok(self.raw_txs.get(txid)?)
    }

    pub fn decoded_transaction(
        &self,
        txid: &Hash256,
    ) -> Result<Option<TransactionView>, IndexerError> {
        let Some(raw) = self.raw_txs.get(txid)? else {
            return Ok(None);
        };
        let tx = Transaction::consensus_decode(&raw)
            .map_err(|err| IndexerError::Decode(format!("stored transaction: {err}")))?;
        let coinbase = tx.is_coinbase();
        let inputs = tx
            .vin
            .iter()
            .map(|input| InputView {
                prevout: (!coinbase).then(|| UtxoSource::from(&input.prevout)),
                sequence: input.sequence,
            })
            .collect();
        let outputs = tx
            .vout
            .iter()
            .zip(0u32..)
            .map(|(output, index)| OutputView {
                index,
                value: output.value,
                script: output.script_pubkey.clone(),
                address: extract_destination(&output.script_pubkey, self.network).index_key(),
            })
            .collect();
        Ok(Some(TransactionView {
            txid: tx.txid(),
            version: tx.version,
            lock_time: tx.lock_time,
            size: raw.len(),
            inputs,
            outputs,
        }))
    }

    pub fn utxo(&self, source: &UtxoSource) -> Result<Option<UtxoDetail>, IndexerError> {
        Ok(self.utxos.get(source)?)
    }

    /// Live outputs paying to `address`, found through its associated transactions.
    pub fn list_unspent(
        &self,
        address: &str,
    ) -> Result<Vec<(UtxoSource, UtxoDetail)>, IndexerError> {
        let mut unspent = Vec::new();
        for txid in self.address_associations(address)? {
            for (source, detail) in self.utxos.outputs_of(&txid)? {
                if detail.address == address {
                    unspent.push((source, detail));
                }
            }
        }
        Ok(unspent)
    }
}
