//! Ledger Hashing
//!
//! BLAKE2b digests used by the ledger:
//! - 224-bit key hashes (payment credentials, ephemeral keys)
//! - 256-bit transaction ids (hash of the transaction body)

use blake2::digest::consts::{U28, U32};
use blake2::{Blake2b, Digest};

/// Key hash output (224 bits / 28 bytes).
pub type KeyHashBytes = [u8; 28];

/// Transaction id output (256 bits / 32 bytes).
pub type TxHashBytes = [u8; 32];

type Blake2b224 = Blake2b<U28>;
type Blake2b256 = Blake2b<U32>;

/// Hash a verification key into its 28-byte key hash.
pub fn blake2b_224(data: &[u8]) -> KeyHashBytes {
    let mut hasher = Blake2b224::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash serialized bytes into a 32-byte digest.
pub fn blake2b_256(data: &[u8]) -> TxHashBytes {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Transaction id of a serialized transaction body.
#[inline]
pub fn hash_tx_body(body: &[u8]) -> TxHashBytes {
    blake2b_256(body)
}

// =============================================================================
// TESTS
// =============================================================================
