#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use utxod_indexer::{BlockSource, IndexerConfig, SourceError};
use utxod_primitives::address::p2pkh_address;
use utxod_primitives::block::{Block, BlockHeader};
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::{Transaction, TxIn, TxOut};
use utxod_primitives::{Hash256, Network};

pub const NETWORK: Network = Network::Regtest;

pub fn config() -> IndexerConfig {
    IndexerConfig {
        network: NETWORK,
        store_raw_tx: true,
        hot_set: None,
    }
}

pub fn p2pkh_script(tag: u8) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

pub fn address(tag: u8) -> String {
    p2pkh_address(&[tag; 20], NETWORK)
}

pub fn coinbase_tx(height: u32, value: i64, script_pubkey: Vec<u8>) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: height.to_le_bytes().to_vec(),
            sequence: u32::MAX,
            witness: Vec::new(),
        }],
        vout: vec![TxOut {
            value,
            script_pubkey,
        }],
        lock_time: 0,
    }
}

pub fn spend_tx(prevouts: &[(Hash256, u32)], outputs: Vec<(i64, Vec<u8>)>) -> Transaction {
    Transaction {
        version: 2,
        vin: prevouts
            .iter()
            .map(|(hash, index)| TxIn {
                prevout: OutPoint {
                    hash: *hash,
                    index: *index,
                },
                script_sig: vec![0x00],
                sequence: u32::MAX - 1,
                witness: Vec::new(),
            })
            .collect(),
        vout: outputs
            .into_iter()
            .map(|(value, script_pubkey)| TxOut {
                value,
                script_pubkey,
            })
            .collect(),
        lock_time: 0,
    }
}

pub fn make_block(height: u32, transactions: Vec<Transaction>) -> Block {
    Block {
        header: BlockHeader {
            version: 4,
            prev_block: [height.to_le_bytes()[0]; 32],
            merkle_root: [0u8; 32],
            time: 1_600_000_000 + height,
            bits: 0x207f_ffff,
            nonce: height,
        },
        transactions,
    }
}

/// Block with only a coinbase paying `tag`.
pub fn coinbase_block(height: u32, tag: u8) -> Block {
    make_block(height, vec![coinbase_tx(height, 50_0000_0000, p2pkh_script(tag))])
}

/// In-memory chain served through the `BlockSource` contract.
pub struct ScriptedSource {
    chain: Mutex<Vec<(Hash256, Vec<u8>)>>,
    tip_failures: AtomicU32,
    fetch_failures: AtomicU32,
    pub tip_calls: AtomicU32,
}

impl ScriptedSource {
    /// `blocks[0]` is genesis.
    pub fn new(blocks: &[Block]) -> Self {
        let chain = blocks
            .iter()
            .map(|block| (block.header.hash(), block.consensus_encode()))
            .collect();
        Self {
            chain: Mutex::new(chain),
            tip_failures: AtomicU32::new(0),
            fetch_failures: AtomicU32::new(0),
            tip_calls: AtomicU32::new(0),
        }
    }

    /// Genesis followed by coinbase-only blocks up to `tip`.
    pub fn coinbase_chain(tip: u32) -> Self {
        let blocks: Vec<Block> = (0..=tip)
            .map(|height| coinbase_block(height, (height % 200) as u8 + 1))
            .collect();
        Self::new(&blocks)
    }

    pub fn fail_tip(&self, times: u32) {
        self.tip_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_fetch(&self, times: u32) {
        self.fetch_failures.store(times, Ordering::SeqCst);
    }

    pub fn push(&self, block: &Block) {
        self.chain
            .lock()
            .expect("chain lock")
            .push((block.header.hash(), block.consensus_encode()));
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl BlockSource for ScriptedSource {
    fn chain_tip_height(&self) -> Result<u32, SourceError> {
        self.tip_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.tip_failures) {
            return Err(SourceError::Unavailable("connection refused".to_string()));
        }
        let len = self.chain.lock().expect("chain lock").len();
        Ok(len.saturating_sub(1) as u32)
    }

    fn block_hash(&self, height: u32) -> Result<Hash256, SourceError> {
        if Self::take_failure(&self.fetch_failures) {
            return Err(SourceError::Unavailable("timeout".to_string()));
        }
        self.chain
            .lock()
            .expect("chain lock")
            .get(height as usize)
            .map(|(hash, _)| *hash)
            .ok_or_else(|| SourceError::Unavailable(format!("no block at {height}")))
    }

    fn raw_block(&self, hash: &Hash256) -> Result<Vec<u8>, SourceError> {
        self.chain
            .lock()
            .expect("chain lock")
            .iter()
            .find(|(candidate, _)| candidate == hash)
            .map(|(_, raw)| raw.clone())
            .ok_or_else(|| SourceError::Malformed("unknown hash".to_string()))
    }
}
