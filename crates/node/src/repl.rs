//! Line-oriented operator console on stdin.

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread;

use tokio::sync::watch;
use utxod_indexer::{CancelToken, Indexer, IngestStatus};
use utxod_storage::KeyValueStore;

use crate::logging;

const DEFAULT_LOG_LINES: usize = 20;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Command {
    Stop,
    BlockCount,
    UtxoCount,
    Weight,
    Status,
    Logs(usize),
    Help,
    Empty,
    Unknown(String),
}

pub(crate) fn parse_command(line: &str) -> Command {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
        return Command::Empty;
    };
    match word.to_ascii_lowercase().as_str() {
        "stop" | "quit" | "exit" => Command::Stop,
        "getblockcount" => Command::BlockCount,
        "getutxocount" => Command::UtxoCount,
        "getweight" => Command::Weight,
        "status" => Command::Status,
        "logs" => match words.next() {
            None => Command::Logs(DEFAULT_LOG_LINES),
            Some(raw) => match raw.parse() {
                Ok(limit) => Command::Logs(limit),
                Err(_) => Command::Unknown(line.trim().to_string()),
            },
        },
        "help" | "?" => Command::Help,
        _ => Command::Unknown(line.trim().to_string()),
    }
}

pub(crate) struct Console<S> {
    pub indexer: Arc<Indexer<S>>,
    pub status: Arc<IngestStatus>,
}

impl<S: KeyValueStore + Clone> Console<S> {
    /// Text shown for `command`; `None` for commands with no output.
    pub(crate) fn render(&self, command: &Command) -> Option<String> {
        match command {
            Command::Stop | Command::Empty => None,
            Command::BlockCount => Some(format!(
                "durable {} / indexed {}",
                self.indexer.durable_cursor().height,
                self.indexer.height()
            )),
            Command::UtxoCount => Some(match self.indexer.hot_set() {
                Some(hot) => format!(
                    "{} hot utxos ({} addresses)",
                    hot.utxo_count(),
                    hot.address_count()
                ),
                None => "hot set disabled".to_string(),
            }),
            Command::Weight => Some(format!("{} bytes buffered", self.indexer.weight())),
            Command::Status => {
                let cursor = self.indexer.durable_cursor();
                Some(format!(
                    "state={} tip={} indexed={} seq={} durable={}/{} ({}) flushes={}",
                    self.status.state().as_str(),
                    self.status.tip(),
                    self.indexer.height(),
                    self.indexer.last_sequence(),
                    cursor.height,
                    cursor.sequence,
                    cursor.state,
                    self.indexer.flush_count()
                ))
            }
            Command::Logs(limit) => {
                let lines: Vec<String> = logging::recent(*limit)
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                Some(if lines.is_empty() {
                    "no captured log entries".to_string()
                } else {
                    lines.join("\n")
                })
            }
            Command::Help => Some(help()),
            Command::Unknown(line) => Some(format!("unknown command '{line}'; try 'help'")),
        }
    }
}

fn help() -> String {
    [
        "stop | quit | exit   flush and shut down",
        "getblockcount        durable and indexed heights",
        "getutxocount         hot set entries",
        "getweight            write buffer weight",
        "status               ingest state and cursor",
        "logs [n]             last n log entries",
        "help                 this text",
    ]
    .join("\n")
}

/// Reads stdin on a detached thread; end of input does not stop the node.
pub(crate) fn spawn<S>(
    console: Console<S>,
    cancel: CancelToken,
    shutdown_tx: watch::Sender<bool>,
) -> Result<(), String>
where
    S: KeyValueStore + Clone + 'static,
{
    thread::Builder::new()
        .name("repl".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                let command = parse_command(&line);
                if command == Command::Stop {
                    log_info!("Stop requested from console.");
                    cancel.cancel();
                    let _ = shutdown_tx.send(true);
                    break;
                }
                if let Some(output) = console.render(&command) {
                    let mut stdout = io::stdout().lock();
                    let _ = writeln!(stdout, "{output}");
                    let _ = stdout.flush();
                }
            }
        })
        .map(|_| ())
        .map_err(|err| format!("failed to spawn repl thread: {err}"))
}
