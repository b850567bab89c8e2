mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{coinbase_block, config, make_block, p2pkh_script, spend_tx, ScriptedSource};
use utxod_indexer::cursor::CursorStore;
use utxod_indexer::{
    CancelToken, FlushPolicy, IndexState, Indexer, IndexerError, IngestConfig, IngestState,
    Ingestor, UtxoSource,
};
use utxod_storage::memory::MemoryStore;

fn ingest_config(policy: FlushPolicy) -> IngestConfig {
    IngestConfig {
        poll_interval: Duration::from_millis(10),
        fetch_retries: 2,
        policy,
    }
}

fn tail_policy() -> FlushPolicy {
    FlushPolicy {
        weight_ceiling: usize::MAX,
        sampling_interval: 1_000,
        tail_window: 3,
        flush_on_quit: true,
    }
}

/// Runs the loop on a worker thread until `done` holds, then cancels and joins.
fn run_until<F>(
    ingestor: &Ingestor<Arc<ScriptedSource>>,
    indexer: &Indexer<Arc<MemoryStore>>,
    done: F,
) -> Result<utxod_indexer::IngestSummary, IndexerError>
where
    F: Fn() -> bool,
{
    let cancel = CancelToken::new();
    thread::scope(|scope| {
        let worker = scope.spawn(|| ingestor.run(indexer, &cancel));
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() && !worker.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        cancel.cancel();
        worker.join().expect("ingest thread")
    })
}

#[test]
fn tail_window_flushes_and_genesis_is_skipped() {
    let store = Arc::new(MemoryStore::new());
    let indexer = Indexer::open(Arc::clone(&store), config()).expect("open");
    let source = Arc::new(ScriptedSource::coinbase_chain(10));
    let genesis_txid = coinbase_block(0, 1).transactions[0].txid();
    let ingestor = Ingestor::new(Arc::clone(&source), ingest_config(tail_policy()));
    let status = ingestor.status();

    let summary = run_until(&ingestor, &indexer, || status.height() == 10).expect("run");
    assert_eq!(summary.start_height, 0);
    assert_eq!(summary.end_height, 10);
    assert_eq!(summary.blocks, 10);
    assert!(summary.cancelled);
    assert_eq!(status.state(), IngestState::Stopped);
    assert_eq!(status.tip(), 10);

    // Heights 8, 9 and 10 fall inside the tail window.
    assert_eq!(indexer.flush_count(), 3);
    assert_eq!(indexer.durable_cursor().height, 10);
    assert_eq!(indexer.last_sequence(), 10);
    let cursor = CursorStore::new(Arc::clone(&store)).load().expect("cursor");
    assert_eq!(cursor.height, 10);
    assert_eq!(cursor.state, IndexState::Consistent);

    let utxos = utxod_indexer::utxo::UtxoSet::new(Arc::clone(&store));
    assert!(utxos
        .get(&UtxoSource::new(genesis_txid, 0))
        .expect("get")
        .is_none());
}

#[test]
fn stop_drains_with_final_flush_and_restart_resumes() {
    let store = Arc::new(MemoryStore::new());
    let no_tail = FlushPolicy {
        tail_window: 0,
        ..tail_policy()
    };
    let source = Arc::new(ScriptedSource::coinbase_chain(5));
    {
        let indexer = Indexer::open(Arc::clone(&store), config()).expect("open");
        let ingestor = Ingestor::new(Arc::clone(&source), ingest_config(no_tail));
        let status = ingestor.status();
        let summary = run_until(&ingestor, &indexer, || status.height() == 5).expect("run");
        assert_eq!(summary.end_height, 5);
        assert_eq!(summary.durable_height, 5);
        assert_eq!(indexer.flush_count(), 1);
    }

    for height in 6..=8 {
        source.push(&coinbase_block(height, 3));
    }
    let indexer = Indexer::open(Arc::clone(&store), config()).expect("reopen");
    assert_eq!(indexer.height(), 5);
    let ingestor = Ingestor::new(Arc::clone(&source), ingest_config(no_tail));
    let status = ingestor.status();
    let summary = run_until(&ingestor, &indexer, || status.height() == 8).expect("run");
    assert_eq!(summary.start_height, 5);
    assert_eq!(summary.blocks, 3);
    assert_eq!(indexer.durable_cursor().height, 8);
    assert_eq!(indexer.last_sequence(), 8);
}

#[test]
fn transient_tip_errors_are_retried() {
    let store = Arc::new(MemoryStore::new());
    let indexer = Indexer::open(Arc::clone(&store), config()).expect("open");
    let source = Arc::new(ScriptedSource::coinbase_chain(2));
    source.fail_tip(3);
    let ingestor = Ingestor::new(Arc::clone(&source), ingest_config(tail_policy()));
    let status = ingestor.status();

    run_until(&ingestor, &indexer, || status.height() == 2).expect("run");
    assert_eq!(indexer.height(), 2);
    assert!(source.tip_calls.load(Ordering::SeqCst) >= 4);
}

#[test]
fn block_fetch_errors_retry_then_fail() {
    let store = Arc::new(MemoryStore::new());
    let indexer = Indexer::open(Arc::clone(&store), config()).expect("open");
    let source = Arc::new(ScriptedSource::coinbase_chain(2));
    source.fail_fetch(2);
    let ingestor = Ingestor::new(Arc::clone(&source), ingest_config(tail_policy()));
    let status = ingestor.status();
    run_until(&ingestor, &indexer, || status.height() == 2).expect("retries suffice");
    assert_eq!(indexer.height(), 2);

    let store = Arc::new(MemoryStore::new());
    let indexer = Indexer::open(Arc::clone(&store), config()).expect("open");
    let source = Arc::new(ScriptedSource::coinbase_chain(2));
    source.fail_fetch(3);
    let ingestor = Ingestor::new(Arc::clone(&source), ingest_config(tail_policy()));
    let err = run_until(&ingestor, &indexer, || false).expect_err("retries exhausted");
    assert!(err.is_transient());
    assert_eq!(indexer.height(), 0);
}

#[test]
fn fatal_error_flushes_progress_before_stopping() {
    let store = Arc::new(MemoryStore::new());
    let indexer = Indexer::open(Arc::clone(&store), config()).expect("open");
    let no_tail = FlushPolicy {
        tail_window: 0,
        ..tail_policy()
    };
    let bad_spend = spend_tx(&[([0x42; 32], 0)], vec![(1, p2pkh_script(2))]);
    let blocks = vec![
        coinbase_block(0, 1),
        coinbase_block(1, 1),
        coinbase_block(2, 1),
        make_block(3, vec![common::coinbase_tx(3, 1, p2pkh_script(1)), bad_spend]),
    ];
    let source = Arc::new(ScriptedSource::new(&blocks));
    let ingestor = Ingestor::new(Arc::clone(&source), ingest_config(no_tail));
    let status = ingestor.status();

    let err = run_until(&ingestor, &indexer, || false).expect_err("missing utxo");
    assert!(matches!(err, IndexerError::MissingUtxo(_)));
    assert_eq!(status.state(), IngestState::Stopped);
    assert_eq!(indexer.height(), 2);
    let cursor = CursorStore::new(Arc::clone(&store)).load().expect("cursor");
    assert_eq!(cursor.height, 2);
    assert_eq!(cursor.sequence, 2);
    assert_eq!(cursor.state, IndexState::Consistent);
}

#[test]
fn weight_flushes_land_on_sampled_heights_only() {
    let store = Arc::new(MemoryStore::new());
    let indexer = Indexer::open(Arc::clone(&store), config()).expect("open");
    let source = Arc::new(ScriptedSource::coinbase_chain(8));
    let sampled = FlushPolicy {
        weight_ceiling: 1,
        sampling_interval: 2,
        tail_window: 0,
        flush_on_quit: false,
    };
    let ingestor = Ingestor::new(Arc::clone(&source), ingest_config(sampled));
    let status = ingestor.status();

    let summary = run_until(&ingestor, &indexer, || status.height() == 8).expect("run");
    assert_eq!(summary.end_height, 8);
    // Every block outweighs the ceiling, so only the even heights 2, 4, 6 and 8 flush.
    assert_eq!(indexer.flush_count(), 4);
    assert!(!indexer.has_pending());
    assert_eq!(indexer.weight(), 0);
    assert_eq!(summary.durable_height, 8);
    let cursor = CursorStore::new(Arc::clone(&store)).load().expect("cursor");
    assert_eq!(cursor.height, 8);
    assert_eq!(cursor.sequence, 8);
    assert_eq!(cursor.state, IndexState::Consistent);
}

#[test]
fn odd_tip_leaves_last_block_buffered_without_quit_flush() {
    let store = Arc::new(MemoryStore::new());
    let indexer = Indexer::open(Arc::clone(&store), config()).expect("open");
    let source = Arc::new(ScriptedSource::coinbase_chain(5));
    let sampled = FlushPolicy {
        weight_ceiling: 1,
        sampling_interval: 2,
        tail_window: 0,
        flush_on_quit: false,
    };
    let ingestor = Ingestor::new(Arc::clone(&source), ingest_config(sampled));
    let status = ingestor.status();

    let summary = run_until(&ingestor, &indexer, || status.height() == 5).expect("run");
    assert_eq!(indexer.flush_count(), 2);
    assert_eq!(summary.durable_height, 4);
    assert!(indexer.has_pending());
    assert_eq!(indexer.height(), 5);
}

#[test]
fn tip_is_not_polled_again_during_catchup() {
    let store = Arc::new(MemoryStore::new());
    let indexer = Indexer::open(Arc::clone(&store), config()).expect("open");
    let source = Arc::new(ScriptedSource::coinbase_chain(10));
    let slow_poll = IngestConfig {
        poll_interval: Duration::from_secs(1),
        ..ingest_config(tail_policy())
    };
    let ingestor = Ingestor::new(Arc::clone(&source), slow_poll);
    let status = ingestor.status();

    run_until(&ingestor, &indexer, || status.height() == 10).expect("run");
    assert_eq!(indexer.height(), 10);
    assert_eq!(status.tip(), 10);
    // One read to learn the tip, at most one more once it is reached.
    assert!(source.tip_calls.load(Ordering::SeqCst) <= 2);
}
