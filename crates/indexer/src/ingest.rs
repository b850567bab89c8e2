//! Forward-only ingestion loop driving the indexer from a block source.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use utxod_primitives::{Block, Hash256};
use utxod_storage::KeyValueStore;

use crate::error::IndexerError;
use crate::flush::{FlushPolicy, FlushReason};
use crate::indexer::Indexer;

const CANCEL_SLICE: Duration = Duration::from_millis(100);
const PROGRESS_EVERY: u32 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Node unreachable, timed out, or answered with an RPC error.
    Unavailable(String),
    /// The node answered but the payload could not be understood.
    Malformed(String),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Unavailable(message) => write!(f, "unavailable: {message}"),
            SourceError::Malformed(message) => write!(f, "malformed response: {message}"),
        }
    }
}

impl std::error::Error for SourceError {}

impl From<SourceError> for IndexerError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Unavailable(message) => IndexerError::TransientFetch(message),
            SourceError::Malformed(message) => IndexerError::Decode(message),
        }
    }
}

/// Where blocks come from.
pub trait BlockSource: Send + Sync {
    fn chain_tip_height(&self) -> Result<u32, SourceError>;
    fn block_hash(&self, height: u32) -> Result<Hash256, SourceError>;
    fn raw_block(&self, hash: &Hash256) -> Result<Vec<u8>, SourceError>;
}

impl<T: BlockSource + ?Sized> BlockSource for Arc<T> {
    fn chain_tip_height(&self) -> Result<u32, SourceError> {
        self.as_ref().chain_tip_height()
    }

    fn block_hash(&self, height: u32) -> Result<Hash256, SourceError> {
        self.as_ref().block_hash(height)
    }

    fn raw_block(&self, hash: &Hash256) -> Result<Vec<u8>, SourceError> {
        self.as_ref().raw_block(hash)
    }
}

/// Cooperative stop flag, observed between blocks.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IngestState {
    Idle,
    Catchup,
    LiveTail,
    Draining,
    Stopped,
}

impl IngestState {
    pub fn as_str(self) -> &'static str {
        match self {
            IngestState::Idle => "idle",
            IngestState::Catchup => "catchup",
            IngestState::LiveTail => "live",
            IngestState::Draining => "draining",
            IngestState::Stopped => "stopped",
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            IngestState::Idle => 0,
            IngestState::Catchup => 1,
            IngestState::LiveTail => 2,
            IngestState::Draining => 3,
            IngestState::Stopped => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => IngestState::Catchup,
            2 => IngestState::LiveTail,
            3 => IngestState::Draining,
            4 => IngestState::Stopped,
            _ => IngestState::Idle,
        }
    }
}

impl fmt::Display for IngestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published by the loop for the status path.
#[derive(Debug, Default)]
pub struct IngestStatus {
    state: AtomicU8,
    tip: AtomicU32,
    height: AtomicU32,
}

impl IngestStatus {
    pub fn state(&self) -> IngestState {
        IngestState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn tip(&self) -> u32 {
        self.tip.load(Ordering::Relaxed)
    }

    pub fn height(&self) -> u32 {
        self.height.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: IngestState) {
        let previous = self.state.swap(state.as_u8(), Ordering::SeqCst);
        if previous != state.as_u8() {
            utxod_log::log_debug!(
                "ingest state {} -> {}",
                IngestState::from_u8(previous),
                state
            );
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IngestConfig {
    pub poll_interval: Duration,
    /// Extra attempts for a block fetch before the error becomes fatal.
    pub fetch_retries: u32,
    pub policy: FlushPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            fetch_retries: 3,
            policy: FlushPolicy::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IngestSummary {
    pub start_height: u32,
    pub end_height: u32,
    pub blocks: u64,
    /// Height covered by the durable cursor when the loop returned.
    pub durable_height: u32,
    pub cancelled: bool,
}

pub struct Ingestor<B> {
    source: B,
    config: IngestConfig,
    status: Arc<IngestStatus>,
}

impl<B: BlockSource> Ingestor<B> {
    pub fn new(source: B, config: IngestConfig) -> Self {
        Self {
            source,
            config,
            status: Arc::new(IngestStatus::default()),
        }
    }

    pub fn status(&self) -> Arc<IngestStatus> {
        Arc::clone(&self.status)
    }

    /// Runs until cancelled or a fatal error, then drains: a final flush is attempted
    /// when `flush_on_quit` is set, even after an error.
    pub fn run<S: KeyValueStore + Clone>(
        &self,
        indexer: &Indexer<S>,
        cancel: &CancelToken,
    ) -> Result<IngestSummary, IndexerError> {
        let start_height = indexer.height();
        self.status.height.store(start_height, Ordering::Relaxed);
        utxod_log::log_info!("ingest resuming at height {}", start_height.saturating_add(1));

        let mut blocks = 0u64;
        let outcome = self.drive(indexer, cancel, &mut blocks);

        self.status.set_state(IngestState::Draining);
        let needs_flush =
            indexer.has_pending() || indexer.height() != indexer.durable_cursor().height;
        let drained = if self.config.policy.flush_on_quit && needs_flush {
            indexer.flush(FlushReason::Quit).map(|_| ())
        } else {
            Ok(())
        };
        self.status.set_state(IngestState::Stopped);

        match (outcome, drained) {
            (Err(err), drained) => {
                if let Err(flush_err) = drained {
                    utxod_log::log_error!("final flush failed: {flush_err}");
                }
                utxod_log::log_error!("ingest stopped at height {}: {err}", indexer.height());
                Err(err)
            }
            (Ok(()), Err(flush_err)) => Err(flush_err),
            (Ok(()), Ok(())) => {
                let summary = IngestSummary {
                    start_height,
                    end_height: indexer.height(),
                    blocks,
                    durable_height: indexer.durable_cursor().height,
                    cancelled: cancel.is_cancelled(),
                };
                utxod_log::log_info!(
                    "ingest stopped at height {} ({} blocks this run, durable {})",
                    summary.end_height,
                    summary.blocks,
                    summary.durable_height
                );
                Ok(summary)
            }
        }
    }

    fn drive<S: KeyValueStore + Clone>(
        &self,
        indexer: &Indexer<S>,
        cancel: &CancelToken,
        blocks: &mut u64,
    ) -> Result<(), IndexerError> {
        let policy = self.config.policy;
        let mut run_started = Instant::now();
        let mut known_tip = None;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let next = indexer.height().saturating_add(1);
            // The tip is only re-read once the cached one has been reached.
            let tip = match known_tip {
                Some(tip) if next <= tip => tip,
                _ => match self.source.chain_tip_height() {
                    Ok(tip) => {
                        self.status.tip.store(tip, Ordering::Relaxed);
                        known_tip = Some(tip);
                        tip
                    }
                    Err(err) => {
                        utxod_log::log_warn!("chain tip query failed: {err}; retrying");
                        if !self.sleep(cancel) {
                            return Ok(());
                        }
                        continue;
                    }
                },
            };

            if next > tip {
                self.status.set_state(IngestState::LiveTail);
                if !self.sleep(cancel) {
                    return Ok(());
                }
                continue;
            }
            if u64::from(next) + u64::from(policy.tail_window) > u64::from(tip) {
                self.status.set_state(IngestState::LiveTail);
            } else {
                self.status.set_state(IngestState::Catchup);
            }

            let Some(raw) = self.fetch_block(next, cancel)? else {
                return Ok(());
            };
            let block = Block::consensus_decode(&raw)?;
            let stats = indexer.index_block(next, &block)?;
            *blocks += 1;
            self.status.height.store(next, Ordering::Relaxed);

            if let Some(reason) = policy.should_flush(next, tip, stats.weight) {
                indexer.flush(reason)?;
            }
            if next % PROGRESS_EVERY == 0 {
                utxod_log::log_info!(
                    "indexed height {next}/{tip} seq {} weight {} ({}ms per {PROGRESS_EVERY} blocks)",
                    stats.last_sequence,
                    stats.weight,
                    run_started.elapsed().as_millis()
                );
                run_started = Instant::now();
            }
        }
    }

    /// `Ok(None)` when cancelled while waiting to retry.
    fn fetch_block(
        &self,
        height: u32,
        cancel: &CancelToken,
    ) -> Result<Option<Vec<u8>>, IndexerError> {
        let mut attempt = 0u32;
        loop {
            let fetched = self
                .source
                .block_hash(height)
                .and_then(|hash| self.source.raw_block(&hash));
            match fetched {
                Ok(raw) => return Ok(Some(raw)),
                Err(SourceError::Unavailable(message)) if attempt < self.config.fetch_retries => {
                    attempt += 1;
                    utxod_log::log_warn!(
                        "fetch of block {height} failed ({message}); retry {attempt}/{}",
                        self.config.fetch_retries
                    );
                    if !self.sleep(cancel) {
                        return Ok(None);
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Sleeps one poll interval in short slices; returns `false` if cancelled.
    fn sleep(&self, cancel: &CancelToken) -> bool {
        let deadline = Instant::now() + self.config.poll_interval;
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(CANCEL_SLICE.min(deadline - now));
        }
    }
}
