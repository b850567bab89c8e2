use std::fmt;

use utxod_primitives::block::BlockDecodeError;
use utxod_storage::StoreError;

use crate::utxo::UtxoSource;

#[derive(Debug)]
pub enum IndexerError {
    /// Block source unreachable or returned an error; nothing was staged.
    TransientFetch(String),
    Decode(String),
    /// An input references an output absent from every layer.
    MissingUtxo(UtxoSource),
    Store(StoreError),
    /// The cursor says the previous flush never completed.
    InterruptedFlush { height: u32 },
    OutOfOrder { expected: u32, got: u32 },
    SequenceExhausted,
}

impl IndexerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexerError::TransientFetch(_))
    }
}

impl fmt::Display for IndexerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexerError::TransientFetch(message) => write!(f, "block source: {message}"),
            IndexerError::Decode(message) => write!(f, "decode: {message}"),
            IndexerError::MissingUtxo(source) => write!(f, "missing utxo {source}"),
            IndexerError::Store(err) => write!(f, "storage: {err}"),
            IndexerError::InterruptedFlush { height } => write!(
                f,
                "index state is Applying (last flush after height {height} was interrupted); resync required"
            ),
            IndexerError::OutOfOrder { expected, got } => {
                write!(f, "block {got} out of order (expected {expected})")
            }
            IndexerError::SequenceExhausted => write!(f, "transaction sequence exhausted"),
        }
    }
}

impl std::error::Error for IndexerError {}

impl From<StoreError> for IndexerError {
    fn from(err: StoreError) -> Self {
        IndexerError::Store(err)
    }
}

impl From<BlockDecodeError> for IndexerError {
    fn from(err: BlockDecodeError) -> Self {
        IndexerError::Decode(err.to_string())
    }
}
