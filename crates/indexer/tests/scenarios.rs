mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::{
    address, coinbase_block, coinbase_tx, config, make_block, p2pkh_script, spend_tx, NETWORK,
};
use utxod_indexer::address_index::{merge_associations, AddressIndex};
use utxod_indexer::cursor::CursorStore;
use utxod_indexer::{
    FlushPolicy, FlushReason, IndexState, Indexer, IndexerError, QueryService, UtxoSource,
};
use utxod_storage::memory::MemoryStore;
use utxod_storage::{
    Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp,
};

const COINBASE_VALUE: i64 = 5_000_000_000;

fn open(store: &Arc<MemoryStore>) -> Indexer<Arc<MemoryStore>> {
    Indexer::open(Arc::clone(store), config()).expect("open indexer")
}

#[test]
fn coinbase_output_is_indexed_after_flush() {
    let store = Arc::new(MemoryStore::new());
    let indexer = open(&store);
    let block = make_block(1, vec![coinbase_tx(1, COINBASE_VALUE, p2pkh_script(1))]);
    let txid0 = block.transactions[0].txid();

    let stats = indexer.index_block(1, &block).expect("index block");
    assert_eq!(stats.transactions, 1);
    assert_eq!(stats.last_sequence, 1);
    indexer.flush(FlushReason::Manual).expect("flush");

    let query = QueryService::new(Arc::clone(&store), NETWORK);
    let detail = query
        .utxo(&UtxoSource::new(txid0, 0))
        .expect("utxo")
        .expect("present");
    assert_eq!(detail.amount, COINBASE_VALUE);
    assert_eq!(detail.address, address(1));
    assert_eq!(detail.height, 1);
    assert_eq!(
        query.address_associations(&address(1)).expect("assoc"),
        vec![txid0]
    );
    assert_eq!(query.indexed_height().expect("height"), 1);
    assert_eq!(query.transaction_count().expect("count"), 1);
}

#[test]
fn spend_removes_source_and_associates_both_addresses() {
    let store = Arc::new(MemoryStore::new());
    let indexer = open(&store);
    let block1 = make_block(1, vec![coinbase_tx(1, COINBASE_VALUE, p2pkh_script(1))]);
    let txid0 = block1.transactions[0].txid();
    indexer.index_block(1, &block1).expect("block 1");
    indexer.flush(FlushReason::Manual).expect("flush 1");

    let spend = spend_tx(&[(txid0, 0)], vec![(4_999_990_000, p2pkh_script(2))]);
    let txid1 = spend.txid();
    let block2 = make_block(2, vec![coinbase_tx(2, COINBASE_VALUE, p2pkh_script(9)), spend]);
    indexer.index_block(2, &block2).expect("block 2");
    indexer.flush(FlushReason::Manual).expect("flush 2");

    let query = QueryService::new(Arc::clone(&store), NETWORK);
    assert!(query
        .utxo(&UtxoSource::new(txid0, 0))
        .expect("utxo")
        .is_none());
    let created = query
        .utxo(&UtxoSource::new(txid1, 0))
        .expect("utxo")
        .expect("present");
    assert_eq!(created.amount, 4_999_990_000);
    assert_eq!(created.address, address(2));

    let addr1 = query.address_associations(&address(1)).expect("assoc");
    assert!(addr1.contains(&txid0));
    assert!(addr1.contains(&txid1));
    assert_eq!(
        query.address_associations(&address(2)).expect("assoc"),
        vec![txid1]
    );
    assert_eq!(query.transaction_count().expect("count"), 3);
    assert!(query.list_unspent(&address(1)).expect("unspent").is_empty());
}

#[test]
fn output_spent_in_same_block_never_reaches_storage() {
    let store = Arc::new(MemoryStore::new());
    let indexer = open(&store);
    let coinbase = coinbase_tx(1, COINBASE_VALUE, p2pkh_script(1));
    let txid0 = coinbase.txid();
    let child = spend_tx(&[(txid0, 0)], vec![(COINBASE_VALUE - 1_000, p2pkh_script(2))]);
    let txid1 = child.txid();
    indexer
        .index_block(1, &make_block(1, vec![coinbase, child]))
        .expect("index block");
    indexer.flush(FlushReason::Manual).expect("flush");

    assert_eq!(store.len(Column::Utxo), 1);
    let query = QueryService::new(Arc::clone(&store), NETWORK);
    assert!(query
        .utxo(&UtxoSource::new(txid1, 0))
        .expect("utxo")
        .is_some());
}

#[test]
fn weight_flush_at_sampling_checkpoint_empties_buffer() {
    let store = Arc::new(MemoryStore::new());
    let indexer = open(&store);
    let policy = FlushPolicy {
        weight_ceiling: 200,
        sampling_interval: 4,
        tail_window: 0,
        flush_on_quit: false,
    };

    for height in 1..=8 {
        let stats = indexer
            .index_block(height, &coinbase_block(height, height as u8))
            .expect("index block");
        match policy.should_flush(height, 1_000, stats.weight) {
            Some(reason) => {
                assert_eq!(height % 4, 0);
                assert_eq!(reason, FlushReason::Weight);
                indexer.flush(reason).expect("flush");
                assert!(!indexer.has_pending());
                assert_eq!(indexer.weight(), 0);
                assert_eq!(indexer.durable_cursor().height, height);
            }
            None => assert!(height % 4 != 0 || stats.weight <= 200),
        }
    }
    assert_eq!(indexer.flush_count(), 2);
}

/// Fails every batch that moves the durable height.
#[derive(Clone)]
struct CrashBeforeProgress {
    inner: Arc<MemoryStore>,
}

impl KeyValueStore for CrashBeforeProgress {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
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
        let moves_height = batch.iter().any(|op| {
            matches!(op, WriteOp::Put { column: Column::Meta, key, .. } if key.as_slice() == b"blockHeight")
        });
        if moves_height {
            return Err(StoreError::Backend("simulated crash".to_string()));
        }
        self.inner.write_batch(batch)
    }
}

#[test]
fn interrupted_flush_blocks_restart() {
    let inner = Arc::new(MemoryStore::new());
    let crashing = CrashBeforeProgress {
        inner: Arc::clone(&inner),
    };
    let indexer = Indexer::open(crashing, config()).expect("open");
    indexer
        .index_block(1, &coinbase_block(1, 1))
        .expect("index block");
    let err = indexer
        .flush(FlushReason::Manual)
        .expect_err("flush must fail");
    assert!(matches!(err, IndexerError::Store(_)));
    assert_eq!(indexer.durable_cursor().state, IndexState::Applying);
    assert!(indexer.has_pending());
    drop(indexer);

    let cursor = CursorStore::new(Arc::clone(&inner)).load().expect("cursor");
    assert_eq!(cursor.state, IndexState::Applying);
    assert_eq!(cursor.height, 0);

    match Indexer::open(Arc::clone(&inner), config()) {
        Err(IndexerError::InterruptedFlush { height }) => assert_eq!(height, 0),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("restart must be refused"),
    }
}

#[test]
fn missing_input_leaves_buffer_untouched() {
    let store = Arc::new(MemoryStore::new());
    let indexer = open(&store);
    let block1 = make_block(1, vec![coinbase_tx(1, COINBASE_VALUE, p2pkh_script(1))]);
    let txid0 = block1.transactions[0].txid();
    indexer.index_block(1, &block1).expect("block 1");
    let weight_before = indexer.weight();

    let missing = UtxoSource::new([0xee; 32], 3);
    let bad = spend_tx(
        &[(txid0, 0), (missing.txid, missing.index)],
        vec![(1_000, p2pkh_script(3))],
    );
    let block2 = make_block(2, vec![coinbase_tx(2, COINBASE_VALUE, p2pkh_script(4)), bad]);
    match indexer.index_block(2, &block2) {
        Err(IndexerError::MissingUtxo(source)) => assert_eq!(source, missing),
        other => panic!("expected missing utxo, got {other:?}"),
    }
    assert_eq!(indexer.weight(), weight_before);
    assert_eq!(indexer.height(), 1);
    assert_eq!(indexer.last_sequence(), 1);

    let good = spend_tx(&[(txid0, 0)], vec![(1_000, p2pkh_script(3))]);
    let retry = make_block(2, vec![coinbase_tx(2, COINBASE_VALUE, p2pkh_script(4)), good]);
    indexer.index_block(2, &retry).expect("valid block 2");
    assert_eq!(indexer.last_sequence(), 3);
}

#[test]
fn double_spend_within_block_is_missing() {
    let store = Arc::new(MemoryStore::new());
    let indexer = open(&store);
    let block1 = coinbase_block(1, 1);
    let txid0 = block1.transactions[0].txid();
    indexer.index_block(1, &block1).expect("block 1");

    let first = spend_tx(&[(txid0, 0)], vec![(10, p2pkh_script(2))]);
    let second = spend_tx(&[(txid0, 0)], vec![(20, p2pkh_script(3))]);
    let block2 = make_block(2, vec![coinbase_tx(2, 1, p2pkh_script(4)), first, second]);
    assert!(matches!(
        indexer.index_block(2, &block2),
        Err(IndexerError::MissingUtxo(_))
    ));
}

#[test]
fn blocks_must_arrive_in_order() {
    let store = Arc::new(MemoryStore::new());
    let indexer = open(&store);
    match indexer.index_block(2, &coinbase_block(2, 1)) {
        Err(IndexerError::OutOfOrder { expected, got }) => {
            assert_eq!((expected, got), (1, 2));
        }
        other => panic!("expected out of order, got {other:?}"),
    }
}

#[test]
fn merge_is_idempotent() {
    let persisted = BTreeSet::from([3, 4]);
    let pending = BTreeSet::from([5]);
    let once = merge_associations(&persisted, &pending);
    let twice = merge_associations(&once, &pending);
    assert_eq!(once, BTreeSet::from([3, 4, 5]));
    assert_eq!(twice, once);

    let store = Arc::new(MemoryStore::new());
    let index = AddressIndex::new(Arc::clone(&store));
    for _ in 0..2 {
        let current = index.associations("addr").expect("assoc");
        let mut batch = WriteBatch::new();
        index.stage_merge(&mut batch, "addr", &current, &persisted);
        index.stage_merge(&mut batch, "addr", &persisted, &pending);
        store.write_batch(&batch).expect("write");
    }
    assert_eq!(
        index.associations("addr").expect("assoc"),
        BTreeSet::from([3, 4, 5])
    );
    assert_eq!(store.len(Column::AddressIndex), 3);
}

#[test]
fn restart_resumes_from_flushed_height() {
    let store = Arc::new(MemoryStore::new());
    {
        let indexer = open(&store);
        for height in 1..=3 {
            indexer
                .index_block(height, &coinbase_block(height, 7))
                .expect("index block");
        }
        indexer.flush(FlushReason::Manual).expect("flush");
        indexer
            .index_block(4, &coinbase_block(4, 7))
            .expect("unflushed block");
    }

    let indexer = open(&store);
    assert_eq!(indexer.height(), 3);
    assert_eq!(indexer.last_sequence(), 3);
    assert!(!indexer.has_pending());
    indexer
        .index_block(4, &coinbase_block(4, 7))
        .expect("replayed block");
    indexer.flush(FlushReason::Manual).expect("flush");
    assert_eq!(indexer.durable_cursor().height, 4);

    let query = QueryService::new(Arc::clone(&store), NETWORK);
    assert_eq!(query.address_associations(&address(7)).expect("assoc").len(), 4);
    assert_eq!(query.list_unspent(&address(7)).expect("unspent").len(), 4);
}

#[test]
fn empty_flush_still_advances_cursor() {
    let store = Arc::new(MemoryStore::new());
    let indexer = open(&store);
    indexer
        .index_block(1, &make_block(1, Vec::new()))
        .expect("empty block");
    assert!(!indexer.has_pending());
    let stats = indexer.flush(FlushReason::Manual).expect("flush");
    assert_eq!(stats.height, 1);
    assert_eq!(stats.sequences, 0);
    let cursor = CursorStore::new(Arc::clone(&store)).load().expect("cursor");
    assert_eq!(cursor.height, 1);
    assert_eq!(cursor.state, IndexState::Consistent);
}

#[test]
fn concurrent_flush_never_writes_blocks_past_its_cursor() {
    let store = Arc::new(MemoryStore::new());
    let indexer = Arc::new(open(&store));
    let blocks: Vec<_> = (1..=120u32)
        .map(|height| coinbase_block(height, (height % 200) as u8 + 1))
        .collect();
    let txids: Vec<_> = blocks
        .iter()
        .map(|block| block.transactions[0].txid())
        .collect();

    let writer = {
        let indexer = Arc::clone(&indexer);
        std::thread::spawn(move || {
            for (offset, block) in blocks.iter().enumerate() {
                indexer
                    .index_block(offset as u32 + 1, block)
                    .expect("index block");
            }
        })
    };

    let query = QueryService::new(Arc::clone(&store), NETWORK);
    while !writer.is_finished() {
        let stats = indexer.flush(FlushReason::Manual).expect("flush");
        // txids[h] belongs to block h + 1.
        if let Some(next) = txids.get(stats.height as usize) {
            assert!(
                query
                    .utxo(&UtxoSource::new(*next, 0))
                    .expect("utxo")
                    .is_none(),
                "block {} reached storage under cursor {}",
                stats.height + 1,
                stats.height
            );
        }
    }
    writer.join().expect("writer thread");
    indexer.flush(FlushReason::Manual).expect("final flush");
    assert_eq!(query.indexed_height().expect("height"), 120);
    assert_eq!(query.transaction_count().expect("count"), 120);
}
