use utxod_primitives::block::{Block, BlockHeader, HEADER_SIZE};
use utxod_primitives::hex::{hash256_to_hex, hex_decode};
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::{Transaction, TxIn, TxOut};

const GENESIS_HEADER_HEX: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";
const GENESIS_COINBASE_HEX: &str = "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff4d04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000";

fn genesis_block_bytes() -> Vec<u8> {
    let mut bytes = hex_decode(GENESIS_HEADER_HEX).expect("header hex");
    bytes.push(0x01);
    bytes.extend(hex_decode(GENESIS_COINBASE_HEX).expect("coinbase hex"));
    bytes
}

#[test]
fn genesis_block_decodes() {
    let bytes = genesis_block_bytes();
    let block = Block::consensus_decode(&bytes).expect("decode genesis");
    assert_eq!(
        hash256_to_hex(&block.header.hash()),
        "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
    );
    assert_eq!(block.transactions.len(), 1);

    let coinbase = &block.transactions[0];
    assert!(coinbase.is_coinbase());
    assert!(!coinbase.has_witness());
    assert_eq!(coinbase.vout[0].value, 5_000_000_000);
    assert_eq!(
        hash256_to_hex(&coinbase.txid()),
        "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
    );
    assert_eq!(coinbase.txid(), block.header.merkle_root);
    assert_eq!(block.consensus_encode(), bytes);
}

#[test]
fn header_encoding_is_eighty_bytes() {
    let header = BlockHeader {
        version: 2,
        prev_block: [0x11; 32],
        merkle_root: [0x22; 32],
        time: 1_600_000_000,
        bits: 0x1d00ffff,
        nonce: 42,
    };
    assert_eq!(header.consensus_encode().len(), HEADER_SIZE);
}

#[test]
fn trailing_bytes_are_rejected() {
    let mut bytes = genesis_block_bytes();
    bytes.push(0x00);
    assert!(Block::consensus_decode(&bytes).is_err());
}

#[test]
fn truncated_transaction_reports_position() {
    let mut bytes = genesis_block_bytes();
    bytes.truncate(bytes.len() - 2);
    let err = Block::consensus_decode(&bytes).expect_err("truncated");
    assert!(err.to_string().starts_with("transaction 0"), "{err}");
}

fn segwit_spend() -> Transaction {
    Transaction {
        version: 2,
        vin: vec![TxIn {
            prevout: OutPoint {
                hash: [0x5a; 32],
                index: 1,
            },
            script_sig: Vec::new(),
            sequence: 0xffff_fffd,
            witness: vec![vec![0x30; 71], vec![0x02; 33]],
        }],
        vout: vec![TxOut {
            value: 90_000,
            script_pubkey: {
                let mut script = vec![0x00, 0x14];
                script.extend_from_slice(&[0x77; 20]);
                script
            },
        }],
        lock_time: 0,
    }
}

#[test]
fn segwit_txid_ignores_witness() {
    let tx = segwit_spend();
    let encoded = tx.consensus_encode();
    assert_eq!(&encoded[4..6], &[0x00, 0x01]);

    let decoded = Transaction::consensus_decode(&encoded).expect("decode segwit");
    assert_eq!(decoded, tx);

    let mut stripped = tx.clone();
    stripped.vin[0].witness.clear();
    assert_eq!(tx.txid(), stripped.txid());
    assert_ne!(tx.txid(), tx.wtxid());
    assert_eq!(stripped.txid(), stripped.wtxid());
}

#[test]
fn segwit_flag_without_witness_is_invalid() {
    let mut tx = segwit_spend();
    tx.vin[0].witness.clear();
    let mut encoded = tx.consensus_encode();
    // Re-insert marker and flag, then an empty witness stack before lock_time.
    encoded.splice(4..4, [0x00, 0x01]);
    let lock_time_at = encoded.len() - 4;
    encoded.insert(lock_time_at, 0x00);
    assert!(Transaction::consensus_decode(&encoded).is_err());
}
