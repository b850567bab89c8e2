//! UTXO set logic backed by the storage trait.

use std::fmt;
use std::ops::ControlFlow;

use utxod_primitives::encoding::{DecodeError, Decoder, Encoder};
use utxod_primitives::hex::hash256_to_hex;
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::Hash256;
use utxod_storage::{Column, KeyValueStore, StoreError, WriteBatch};

pub const SOURCE_KEY_LEN: usize = 36;

/// Identity of one transaction output.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct UtxoSource {
    pub txid: Hash256,
    pub index: u32,
}

impl UtxoSource {
    pub fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }

    /// Txid followed by the little-endian output index; all outputs of one
    /// transaction share the 32-byte prefix.
    pub fn key(&self) -> [u8; SOURCE_KEY_LEN] {
        let mut key = [0u8; SOURCE_KEY_LEN];
        key[..32].copy_from_slice(&self.txid);
        key[32..].copy_from_slice(&self.index.to_le_bytes());
        key
    }

    pub fn from_key(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SOURCE_KEY_LEN {
            return None;
        }
        let txid: Hash256 = bytes[..32].try_into().ok()?;
        let index = u32::from_le_bytes(bytes[32..].try_into().ok()?);
        Some(Self { txid, index })
    }
}

impl From<&OutPoint> for UtxoSource {
    fn from(outpoint: &OutPoint) -> Self {
        Self {
            txid: outpoint.hash,
            index: outpoint.index,
        }
    }
}

impl fmt::Display for UtxoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hash256_to_hex(&self.txid), self.index)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UtxoDetail {
    pub amount: i64,
    pub height: u32,
    /// Empty when the script has no recognised destination.
    pub address: String,
    pub script: Vec<u8>,
}

impl UtxoDetail {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(14 + self.address.len() + self.script.len());
        encoder.write_i64_le(self.amount);
        encoder.write_u32_le(self.height);
        encoder.write_var_str(&self.address);
        encoder.write_var_bytes(&self.script);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let amount = decoder.read_i64_le()?;
        let height = decoder.read_u32_le()?;
        let address = decoder.read_var_str()?;
        let script = decoder.read_var_bytes()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            amount,
            height,
            address,
            script,
        })
    }
}

fn decode_detail(bytes: &[u8]) -> Result<UtxoDetail, StoreError> {
    UtxoDetail::decode(bytes).map_err(|err| StoreError::corrupt(Column::Utxo, err.to_string()))
}

pub struct UtxoSet<S> {
    store: S,
}

impl<S> UtxoSet<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> UtxoSet<S> {
    pub fn get(&self, source: &UtxoSource) -> Result<Option<UtxoDetail>, StoreError> {
        match self.store.get(Column::Utxo, &source.key())? {
            Some(bytes) => decode_detail(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn put(&self, batch: &mut WriteBatch, source: &UtxoSource, detail: &UtxoDetail) {
        batch.put(Column::Utxo, source.key(), detail.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, source: &UtxoSource) {
        batch.delete(Column::Utxo, source.key());
    }

    /// Live outputs of one transaction, in output order.
    pub fn outputs_of(&self, txid: &Hash256) -> Result<Vec<(UtxoSource, UtxoDetail)>, StoreError> {
        let rows = self.store.scan_prefix(Column::Utxo, txid)?;
        let mut outputs = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let source = UtxoSource::from_key(&key)
                .ok_or_else(|| StoreError::corrupt(Column::Utxo, "bad key length"))?;
            outputs.push((source, decode_detail(&value)?));
        }
        outputs.sort_by_key(|(source, _)| source.index);
        Ok(outputs)
    }

    /// Visits every live output; the visitor returns `false` to stop early.
    pub fn for_each(
        &self,
        mut visitor: impl FnMut(UtxoSource, UtxoDetail) -> bool,
    ) -> Result<(), StoreError> {
        self.store.for_each_prefix(Column::Utxo, &[], &mut |key, value| {
            let source = UtxoSource::from_key(key)
                .ok_or_else(|| StoreError::corrupt(Column::Utxo, "bad key length"))?;
            Ok(if visitor(source, decode_detail(value)?) {
                ControlFlow::Continue(())
            } else {
                ControlFlow::Break(())
            })
        })
    }
}
