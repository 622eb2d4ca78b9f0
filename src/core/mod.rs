//! Ledger primitives.
//!
//! Deterministic encodings and key material shared by the codecs and the
//! transaction builder. Nothing here does I/O except [`keys::SessionKeys::load`].

pub mod address;
pub mod hash;
pub mod keys;
pub mod plutus;

// Re-export core types
pub use address::{Address, AddressError};
pub use hash::{blake2b_224, blake2b_256, KeyHashBytes, TxHashBytes};
pub use keys::{KeyError, SessionKeys};
pub use plutus::{PlutusData, PlutusError};
