//! Command-line and `utxod.conf` handling.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use utxod_indexer::flush::{DEFAULT_SAMPLING_INTERVAL, DEFAULT_TAIL_WINDOW, DEFAULT_WEIGHT_CEILING};
use utxod_indexer::hotset::{DEFAULT_CONFIRMATION_DEPTH, DEFAULT_HIGH_WATER, DEFAULT_MIN_REFS};
use utxod_indexer::{FlushPolicy, HotSetConfig, IngestConfig};
use utxod_primitives::Network;

use crate::logging;

pub const CONF_FILE_NAME: &str = "utxod.conf";
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_SOURCE_URL: &str = "http://127.0.0.1:8332";
const DEFAULT_RPC_BIND: &str = "127.0.0.1:8335";
const DEFAULT_POLL_SECS: u64 = 5;
const DEFAULT_FETCH_RETRIES: u32 = 3;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SourceKind {
    /// A full node's own JSON-RPC (`getblockcount`, `getblockhash`, `getblock`).
    Wallet,
    /// A raw block service exposing `Service.*` methods.
    RawBlock,
}

impl SourceKind {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "wallet" => Some(Self::Wallet),
            "rawblock" => Some(Self::RawBlock),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wallet => "wallet",
            Self::RawBlock => "rawblock",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HotSetMode {
    Off,
    Utxo,
    Address,
    All,
}

impl HotSetMode {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "off" | "0" => Some(Self::Off),
            "utxo" => Some(Self::Utxo),
            "address" => Some(Self::Address),
            "all" | "1" => Some(Self::All),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub network: Network,
    pub source: SourceKind,
    pub source_url: String,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub rpc_bind: SocketAddr,
    pub store_raw_tx: bool,
    pub weight_ceiling: usize,
    pub sampling_interval: u32,
    pub tail_window: u32,
    pub flush_on_quit: bool,
    pub poll_interval: Duration,
    pub fetch_retries: u32,
    pub hot_set: HotSetMode,
    pub hot_set_high_water: usize,
    pub hot_set_depth: u32,
    pub hot_set_min_refs: usize,
    pub db_cache_bytes: Option<u64>,
    pub db_write_buffer_bytes: Option<u64>,
    pub db_journal_bytes: Option<u64>,
    pub db_memtable_bytes: Option<u32>,
    pub db_flush_workers: Option<usize>,
    pub db_compaction_workers: Option<usize>,
    pub db_fsync_ms: Option<u16>,
    pub resync: bool,
    pub repl: bool,
    pub log_level: logging::Level,
    pub log_format: logging::Format,
    pub log_timestamps: bool,
}

impl Config {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    pub fn hot_set_config(&self) -> Option<HotSetConfig> {
        let (utxos, addresses) = match self.hot_set {
            HotSetMode::Off => return None,
            HotSetMode::Utxo => (true, false),
            HotSetMode::Address => (false, true),
            HotSetMode::All => (true, true),
        };
        Some(HotSetConfig {
            utxos,
            addresses,
            high_water: self.hot_set_high_water,
            confirmation_depth: self.hot_set_depth,
            min_refs: self.hot_set_min_refs,
        })
    }

    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            poll_interval: self.poll_interval,
            fetch_retries: self.fetch_retries,
            policy: FlushPolicy {
                weight_ceiling: self.weight_ceiling,
                sampling_interval: self.sampling_interval,
                tail_window: self.tail_window,
                flush_on_quit: self.flush_on_quit,
            },
        }
    }
}

pub enum CliAction {
    Run(Box<Config>),
    PrintHelp,
    PrintVersion,
}

/// Flag name to conf key, and whether the flag takes a value.
const FLAG_KEYS: &[(&str, &str, bool)] = &[
    ("--data-dir", "datadir", true),
    ("--backend", "backend", true),
    ("--network", "network", true),
    ("--source", "source", true),
    ("--source-url", "rpcconnect", true),
    ("--rpc-user", "rpcuser", true),
    ("--rpc-password", "rpcpassword", true),
    ("--rpc-bind", "rpcbind", true),
    ("--store-raw-tx", "storerawtx", true),
    ("--weight-ceiling", "weightceiling", true),
    ("--sampling-interval", "samplinginterval", true),
    ("--tail-window", "tailwindow", true),
    ("--flush-on-quit", "flushonquit", true),
    ("--poll-interval", "pollinterval", true),
    ("--fetch-retries", "fetchretries", true),
    ("--hot-set", "hotset", true),
    ("--hot-set-high-water", "hotsethighwater", true),
    ("--hot-set-depth", "hotsetdepth", true),
    ("--hot-set-min-refs", "hotsetminrefs", true),
    ("--db-cache-mb", "dbcache", true),
    ("--db-write-buffer-mb", "dbwritebuffer", true),
    ("--db-journal-mb", "dbjournal", true),
    ("--db-memtable-mb", "dbmemtable", true),
    ("--db-flush-workers", "dbflushworkers", true),
    ("--db-compaction-workers", "dbcompactionworkers", true),
    ("--db-fsync-ms", "dbfsyncms", true),
    ("--log-level", "loglevel", true),
    ("--log-format", "logformat", true),
    ("--resync", "resync", false),
    ("--no-repl", "norepl", false),
    ("--no-log-timestamps", "nologtimestamps", false),
];

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut overrides: HashMap<String, String> = HashMap::new();
    let mut conf_path: Option<PathBuf> = None;
    let mut args = raw_args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            "--conf" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --conf\n{}", usage()))?;
                conf_path = Some(PathBuf::from(value));
            }
            flag => {
                let Some((_, key, takes_value)) =
                    FLAG_KEYS.iter().find(|(name, _, _)| *name == flag)
                else {
                    return Err(format!("unknown argument '{flag}'\n{}", usage()));
                };
                let value = if *takes_value {
                    args.next()
                        .ok_or_else(|| format!("missing value for {flag}\n{}", usage()))?
                } else {
                    "1".to_string()
                };
                overrides.insert((*key).to_string(), value);
            }
        }
    }

    let data_dir = PathBuf::from(
        overrides
            .get("datadir")
            .map(String::as_str)
            .unwrap_or(DEFAULT_DATA_DIR),
    );
    let conf_path = conf_path.unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));
    let mut settings = load_conf(&conf_path)?.unwrap_or_default();
    for (key, value) in overrides {
        settings.insert(key, vec![value]);
    }
    let mut config = config_from_settings(&settings, &conf_path)?;
    config.conf_path = conf_path;
    Ok(CliAction::Run(Box::new(config)))
}

/// Builds a config from merged settings; the last value of a repeated key wins.
pub fn config_from_settings(
    settings: &HashMap<String, Vec<String>>,
    origin: &Path,
) -> Result<Config, String> {
    let lookup = Settings { settings, origin };
    let backend = match lookup.value("backend") {
        Some(raw) => Backend::parse(raw).ok_or_else(|| lookup.invalid("backend", raw))?,
        None => Backend::Fjall,
    };
    let network = match lookup.value("network") {
        Some(raw) => raw
            .parse::<Network>()
            .map_err(|_| lookup.invalid("network", raw))?,
        None => Network::Mainnet,
    };
    let source = match lookup.value("source") {
        Some(raw) => SourceKind::parse(raw).ok_or_else(|| lookup.invalid("source", raw))?,
        None => SourceKind::Wallet,
    };
    let hot_set = match lookup.value("hotset") {
        Some(raw) => HotSetMode::parse(raw).ok_or_else(|| lookup.invalid("hotset", raw))?,
        None => HotSetMode::Off,
    };
    let log_level = match lookup.value("loglevel") {
        Some(raw) => logging::Level::parse(raw).ok_or_else(|| lookup.invalid("loglevel", raw))?,
        None => logging::Level::Info,
    };
    let log_format = match lookup.value("logformat") {
        Some(raw) => {
            logging::Format::parse(raw).ok_or_else(|| lookup.invalid("logformat", raw))?
        }
        None => logging::Format::Text,
    };
    let rpc_bind_raw = lookup.value("rpcbind").unwrap_or(DEFAULT_RPC_BIND);
    let rpc_bind = rpc_bind_raw
        .parse::<SocketAddr>()
        .map_err(|_| lookup.invalid("rpcbind", rpc_bind_raw))?;
    let poll_secs: u64 = lookup.number("pollinterval")?.unwrap_or(DEFAULT_POLL_SECS);
    let mb = |key: &str| -> Result<Option<u64>, String> {
        Ok(lookup.number::<u64>(key)?.map(mb_to_bytes))
    };
    let db_memtable_bytes = match lookup.number::<u64>("dbmemtable")? {
        Some(value) => Some(
            u32::try_from(mb_to_bytes(value))
                .map_err(|_| lookup.invalid("dbmemtable", &value.to_string()))?,
        ),
        None => None,
    };

    Ok(Config {
        backend,
        data_dir: PathBuf::from(lookup.value("datadir").unwrap_or(DEFAULT_DATA_DIR)),
        conf_path: origin.to_path_buf(),
        network,
        source,
        source_url: lookup
            .value("rpcconnect")
            .unwrap_or(DEFAULT_SOURCE_URL)
            .to_string(),
        rpc_user: lookup.value("rpcuser").map(str::to_string),
        rpc_password: lookup.value("rpcpassword").map(str::to_string),
        rpc_bind,
        store_raw_tx: lookup.flag("storerawtx")?.unwrap_or(true),
        weight_ceiling: lookup
            .number("weightceiling")?
            .unwrap_or(DEFAULT_WEIGHT_CEILING),
        sampling_interval: lookup
            .number("samplinginterval")?
            .unwrap_or(DEFAULT_SAMPLING_INTERVAL),
        tail_window: lookup.number("tailwindow")?.unwrap_or(DEFAULT_TAIL_WINDOW),
        flush_on_quit: lookup.flag("flushonquit")?.unwrap_or(true),
        poll_interval: Duration::from_secs(poll_secs.max(1)),
        fetch_retries: lookup
            .number("fetchretries")?
            .unwrap_or(DEFAULT_FETCH_RETRIES),
        hot_set,
        hot_set_high_water: lookup
            .number("hotsethighwater")?
            .unwrap_or(DEFAULT_HIGH_WATER),
        hot_set_depth: lookup
            .number("hotsetdepth")?
            .unwrap_or(DEFAULT_CONFIRMATION_DEPTH),
        hot_set_min_refs: lookup.number("hotsetminrefs")?.unwrap_or(DEFAULT_MIN_REFS),
        db_cache_bytes: mb("dbcache")?,
        db_write_buffer_bytes: mb("dbwritebuffer")?,
        db_journal_bytes: mb("dbjournal")?,
        db_memtable_bytes,
        db_flush_workers: lookup.number("dbflushworkers")?,
        db_compaction_workers: lookup.number("dbcompactionworkers")?,
        db_fsync_ms: lookup.number("dbfsyncms")?,
        resync: lookup.flag("resync")?.unwrap_or(false),
        repl: !lookup.flag("norepl")?.unwrap_or(false),
        log_level,
        log_format,
        log_timestamps: !lookup.flag("nologtimestamps")?.unwrap_or(false),
    })
}

struct Settings<'a> {
    settings: &'a HashMap<String, Vec<String>>,
    origin: &'a Path,
}

impl Settings<'_> {
    fn value(&self, key: &str) -> Option<&str> {
        self.settings
            .get(key)
            .and_then(|values| values.last())
            .map(String::as_str)
    }

    fn invalid(&self, key: &str, raw: &str) -> String {
        format!(
            "invalid {key} value '{raw}' (config {})\n{}",
            self.origin.display(),
            usage()
        )
    }

    fn number<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, String> {
        match self.value(key) {
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|_| self.invalid(key, raw)),
            None => Ok(None),
        }
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, String> {
        match self.value(key) {
            Some(raw) => parse_conf_bool(raw)
                .map(Some)
                .ok_or_else(|| self.invalid(key, raw)),
            None => Ok(None),
        }
    }
}

pub fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };
    Ok(Some(parse_conf(&contents)))
}

pub fn parse_conf(contents: &str) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(idx) = line.find('#') {
            line = &line[..idx];
        }
        if let Some(idx) = line.find(';') {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    out
}

pub fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn mb_to_bytes(mb: u64) -> u64 {
    mb.saturating_mul(1024 * 1024)
}

pub fn usage() -> String {
    [
        "Usage: utxod [OPTIONS]",
        "",
        "Options:",
        "  --data-dir PATH           data directory (default ./data)",
        "  --conf PATH               config file (default <data-dir>/utxod.conf)",
        "  --backend fjall|memory    storage backend (default fjall)",
        "  --network NAME            mainnet|testnet|regtest (default mainnet)",
        "  --source wallet|rawblock  block source protocol (default wallet)",
        "  --source-url URL          upstream JSON-RPC endpoint (default http://127.0.0.1:8332)",
        "  --rpc-user USER           upstream RPC user",
        "  --rpc-password PASS       upstream RPC password",
        "  --rpc-bind ADDR           query server bind address (default 127.0.0.1:8335)",
        "  --store-raw-tx 0|1        keep serialized transactions (default 1)",
        "  --weight-ceiling N        buffer weight that triggers a flush (default 268435456)",
        "  --sampling-interval N     blocks between weight checks (default 1000)",
        "  --tail-window N           flush every block this close to the tip (default 20)",
        "  --flush-on-quit 0|1       flush buffered work on stop (default 1)",
        "  --poll-interval SECS      chain tip poll interval (default 5)",
        "  --fetch-retries N         block fetch retries before giving up (default 3)",
        "  --hot-set MODE            off|utxo|address|all (default off)",
        "  --hot-set-high-water N    hot set size that triggers eviction (default 5000000)",
        "  --hot-set-depth N         confirmations before a hot UTXO may be evicted (default 50000)",
        "  --hot-set-min-refs N      address sets at or below this size are evicted (default 3)",
        "  --db-cache-mb N           fjall block cache size",
        "  --db-write-buffer-mb N    fjall write buffer size",
        "  --db-journal-mb N         fjall journal size",
        "  --db-memtable-mb N        fjall memtable size per partition",
        "  --db-flush-workers N      fjall flush workers",
        "  --db-compaction-workers N fjall compaction workers",
        "  --db-fsync-ms N           fjall fsync interval",
        "  --resync                  wipe the database and index from height 1",
        "  --no-repl                 do not read commands from stdin",
        "  --log-level LEVEL         error|warn|info|debug|trace (default info)",
        "  --log-format FORMAT       text|json (default text)",
        "  --no-log-timestamps       omit timestamps from text logs",
        "  -h, --help                print this help",
        "  -V, --version             print the version",
    ]
    .join("\n")
}
