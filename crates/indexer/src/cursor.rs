//! Durable progress marker.

use std::fmt;

use utxod_storage::{Column, KeyValueStore, StoreError, WriteBatch};

pub const META_HEIGHT_KEY: &[u8] = b"blockHeight";
pub const META_SEQUENCE_KEY: &[u8] = b"trxSequence";
pub const META_STATE_KEY: &[u8] = b"chainIndexState";
pub const META_LAYOUT_KEY: &[u8] = b"layout";
pub const LAYOUT_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IndexState {
    /// A flush is in progress; data columns may be partially written.
    Applying,
    Consistent,
}

impl IndexState {
    pub fn as_byte(self) -> u8 {
        match self {
            IndexState::Applying => b'0',
            IndexState::Consistent => b'1',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'0' => Some(IndexState::Applying),
            b'1' => Some(IndexState::Consistent),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IndexState::Applying => "applying",
            IndexState::Consistent => "consistent",
        }
    }
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Cursor {
    pub height: u32,
    pub sequence: u32,
    pub state: IndexState,
}

impl Default for Cursor {
    fn default() -> Self {
        Self {
            height: 0,
            sequence: 0,
            state: IndexState::Consistent,
        }
    }
}

pub struct CursorStore<S> {
    store: S,
}

impl<S> CursorStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> CursorStore<S> {
    /// Absent keys read as the fresh cursor `(0, 0, Consistent)`.
    pub fn load(&self) -> Result<Cursor, StoreError> {
        let height = self.read_u32(META_HEIGHT_KEY)?.unwrap_or(0);
        let sequence = self.read_u32(META_SEQUENCE_KEY)?.unwrap_or(0);
        let state = match self.store.get(Column::Meta, META_STATE_KEY)? {
            None => IndexState::Consistent,
            Some(bytes) => match bytes.as_slice() {
                [byte] => IndexState::from_byte(*byte)
                    .ok_or_else(|| StoreError::corrupt(Column::Meta, "unknown index state"))?,
                _ => return Err(StoreError::corrupt(Column::Meta, "index state length")),
            },
        };
        Ok(Cursor {
            height,
            sequence,
            state,
        })
    }

    pub fn mark(&self, state: IndexState) -> Result<(), StoreError> {
        self.store
            .put(Column::Meta, META_STATE_KEY, &[state.as_byte()])?;
        self.store.persist()
    }

    pub fn set_progress(&self, height: u32, sequence: u32) -> Result<(), StoreError> {
        let mut batch = WriteBatch::with_capacity(2);
        batch.put(Column::Meta, META_HEIGHT_KEY, height.to_le_bytes());
        batch.put(Column::Meta, META_SEQUENCE_KEY, sequence.to_le_bytes());
        self.store.write_batch(&batch)?;
        self.store.persist()
    }

    /// Writes the layout marker on a fresh store and rejects an unknown one.
    pub fn ensure_layout(&self) -> Result<(), StoreError> {
        match self.read_u32(META_LAYOUT_KEY)? {
            Some(LAYOUT_VERSION) => Ok(()),
            Some(other) => Err(StoreError::corrupt(
                Column::Meta,
                format!("layout version {other} (expected {LAYOUT_VERSION})"),
            )),
            None => self
                .store
                .put(Column::Meta, META_LAYOUT_KEY, &LAYOUT_VERSION.to_le_bytes()),
        }
    }

    fn read_u32(&self, key: &[u8]) -> Result<Option<u32>, StoreError> {
        let Some(bytes) = self.store.get(Column::Meta, key)? else {
            return Ok(None);
        };
        let bytes: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::corrupt(Column::Meta, "u32 length"))?;
        Ok(Some(u32::from_le_bytes(bytes)))
    }
}
