use utxod_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

macro_rules! log_error {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Error, $($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warn, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Debug, $($arg)*);
    }};
}

pub mod config;
mod repl;
pub mod rpc;
pub mod source;

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use fs2::FileExt;
use tokio::sync::watch;
use utxod_indexer::{
    BlockSource, CancelToken, Indexer, IndexerConfig, IndexerError, IngestSummary, Ingestor,
    QueryService,
};
use utxod_storage::fjall::{FjallOptions, FjallStore};
use utxod_storage::memory::MemoryStore;
use utxod_storage::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch};

use crate::config::{parse_args, usage, Backend, CliAction, Config, SourceKind};
use crate::source::{RawBlockSource, RpcClient, WalletSource};

const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";
const LOG_CAPTURE_ENTRIES: usize = 512;

pub enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.put(column, key, value),
            Store::Fjall(store) => store.put(column, key, value),
        }
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.delete(column, key),
            Store::Fjall(store) => store.delete(column, key),
        }
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        match self {
            Store::Memory(store) => store.scan_prefix(column, prefix),
            Store::Fjall(store) => store.scan_prefix(column, prefix),
        }
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.for_each_prefix(column, prefix, visitor),
            Store::Fjall(store) => store.for_each_prefix(column, prefix, visitor),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }

    fn persist(&self) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.persist(),
            Store::Fjall(store) => store.persist(),
        }
    }
}

struct DataDirLock {
    _file: File,
}

fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let pid = std::process::id();
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={pid}");
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            let suffix = if holder.is_empty() {
                String::new()
            } else {
                format!(" ({holder})")
            };
            Err(format!(
                "data dir {} is already locked (another utxod instance may be running); lock file {}{suffix}",
                data_dir.display(),
                lock_path.display()
            ))
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

fn open_store(config: &Config) -> Result<Store, String> {
    match config.backend {
        Backend::Memory => Ok(Store::Memory(MemoryStore::new())),
        Backend::Fjall => {
            let options = FjallOptions {
                cache_bytes: config.db_cache_bytes,
                write_buffer_bytes: config.db_write_buffer_bytes,
                journal_bytes: config.db_journal_bytes,
                memtable_bytes: config.db_memtable_bytes,
                flush_workers: config.db_flush_workers,
                compaction_workers: config.db_compaction_workers,
                fsync_ms: config.db_fsync_ms,
            };
            let partition_count = Column::ALL.len() as u64;
            if let (Some(write_buffer), Some(memtable)) =
                (options.write_buffer_bytes, options.memtable_bytes)
            {
                let max_memtables = u64::from(memtable).saturating_mul(partition_count);
                if write_buffer < max_memtables {
                    log_warn!(
                        "Warning: --db-write-buffer-mb ({}) is below partitions ({}) x --db-memtable-mb ({}); expect frequent flushes",
                        write_buffer / (1024 * 1024),
                        partition_count,
                        u64::from(memtable) / (1024 * 1024),
                    );
                }
            }
            let db_path = config.db_path();
            let store = FjallStore::open_with_options(&db_path, options)
                .map_err(|err| format!("failed to open {}: {err}", db_path.display()))?;
            Ok(Store::Fjall(store))
        }
    }
}

fn open_source(config: &Config) -> Arc<dyn BlockSource> {
    let client = RpcClient::new(
        config.source_url.clone(),
        config.rpc_user.as_deref(),
        config.rpc_password.as_deref(),
    );
    log_info!(
        "Block source: {} at {}",
        config.source.as_str(),
        client.url()
    );
    match config.source {
        SourceKind::Wallet => Arc::new(WalletSource::new(client)),
        SourceKind::RawBlock => Arc::new(RawBlockSource::new(client)),
    }
}

pub async fn run_entry() -> Result<(), String> {
    match parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("utxod {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(*config).await,
    }
}

async fn run_with_config(config: Config) -> Result<(), String> {
    let start_time = Instant::now();
    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
        capture: if config.repl { LOG_CAPTURE_ENTRIES } else { 0 },
    });

    fs::create_dir_all(&config.data_dir).map_err(|err| {
        format!(
            "failed to create data dir {}: {err}",
            config.data_dir.display()
        )
    })?;
    let _lock = lock_data_dir(&config.data_dir)?;

    if config.resync && config.backend == Backend::Fjall {
        let db_path = config.db_path();
        log_warn!("Resync requested; removing {}", db_path.display());
        if let Err(err) = fs::remove_dir_all(&db_path) {
            if err.kind() != ErrorKind::NotFound {
                return Err(format!(
                    "failed to remove db dir {}: {err}",
                    db_path.display()
                ));
            }
        }
    }

    let store = Arc::new(open_store(&config)?);
    let indexer_config = IndexerConfig {
        network: config.network,
        store_raw_tx: config.store_raw_tx,
        hot_set: config.hot_set_config(),
    };
    let indexer = match Indexer::open(Arc::clone(&store), indexer_config) {
        Ok(indexer) => Arc::new(indexer),
        Err(err @ IndexerError::InterruptedFlush { .. }) => {
            return Err(format!("{err}; restart with --resync"));
        }
        Err(err) => return Err(format!("failed to open index: {err}")),
    };
    let durable = indexer.durable_cursor();
    log_info!(
        "Index opened at height {} (seq {}, {}) on {} in {}ms",
        durable.height,
        durable.sequence,
        durable.state,
        config.network.as_str(),
        start_time.elapsed().as_millis()
    );

    let ingestor = Ingestor::new(open_source(&config), config.ingest_config());
    let status = ingestor.status();
    let cancel = CancelToken::new();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    {
        let cancel = cancel.clone();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = match signal(SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(err) => {
                        log_warn!("failed to install SIGTERM handler: {err}");
                        let _ = tokio::signal::ctrl_c().await;
                        cancel.cancel();
                        let _ = shutdown_tx.send(true);
                        return;
                    }
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = sigterm.recv() => {},
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }

            log_info!("Signal received; requesting shutdown.");
            cancel.cancel();
            let _ = shutdown_tx.send(true);
        });
    }

    let query = Arc::new(QueryService::new(Arc::clone(&store), config.network));
    let rpc_task = {
        let shutdown_tx = shutdown_tx.clone();
        let shutdown_rx = shutdown_rx.clone();
        let rpc_bind = config.rpc_bind;
        tokio::spawn(async move {
            if let Err(err) = rpc::serve_rpc(rpc_bind, query, shutdown_rx).await {
                log_error!("{err}");
                let _ = shutdown_tx.send(true);
            }
        })
    };

    let ingest_handle = {
        let indexer = Arc::clone(&indexer);
        let cancel = cancel.clone();
        let shutdown_tx = shutdown_tx.clone();
        thread::Builder::new()
            .name("ingest".to_string())
            .spawn(move || {
                let result = ingestor.run(&indexer, &cancel);
                let _ = shutdown_tx.send(true);
                result
            })
            .map_err(|err| format!("failed to spawn ingest thread: {err}"))?
    };

    if config.repl {
        repl::spawn(
            repl::Console {
                indexer: Arc::clone(&indexer),
                status,
            },
            cancel.clone(),
            shutdown_tx.clone(),
        )?;
    }

    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }
    log_info!("Shutting down; waiting for ingest to drain.");
    cancel.cancel();

    let outcome = tokio::task::spawn_blocking(move || ingest_handle.join())
        .await
        .map_err(|err| format!("ingest join failed: {err}"))?
        .map_err(|_| "ingest thread panicked".to_string())?;
    let _ = rpc_task.await;

    report(outcome, start_time)
}

fn report(outcome: Result<IngestSummary, IndexerError>, start_time: Instant) -> Result<(), String> {
    match outcome {
        Ok(summary) => {
            log_info!(
                "Stopped after {} blocks ({} -> {}); durable height {}; uptime {}s",
                summary.blocks,
                summary.start_height,
                summary.end_height,
                summary.durable_height,
                start_time.elapsed().as_secs()
            );
            Ok(())
        }
        Err(err) => {
            log_error!("Ingestion stopped: {err}");
            Err(format!("ingestion failed: {err}"))
        }
    }
}
