//! UTXO set and address index derived from a forward-only block stream.

pub mod address_index;
pub mod cursor;
pub mod error;
pub mod flush;
pub mod hotset;
pub mod indexer;
pub mod ingest;
pub mod query;
pub mod rawtx;
pub mod slot_cache;
mod staging;
pub mod txseq;
pub mod utxo;

pub use cursor::{Cursor, IndexState};
pub use error::IndexerError;
pub use flush::{FlushPolicy, FlushReason, FlushStats};
pub use hotset::{HotSet, HotSetConfig};
pub use indexer::{BlockStats, Indexer, IndexerConfig};
pub use ingest::{
    BlockSource, CancelToken, IngestConfig, IngestState, IngestStatus, IngestSummary, Ingestor,
    SourceError,
};
pub use query::{QueryService, TransactionView};
pub use slot_cache::{SlotCache, SlotEntries};
pub use utxo::{UtxoDetail, UtxoSource};
