//! Locking-script classification and destination extraction.

pub mod destination;
pub mod opcodes;
pub mod standard;

pub use destination::{extract_destination, Destination};
pub use standard::{classify_script_pubkey, ScriptType};
