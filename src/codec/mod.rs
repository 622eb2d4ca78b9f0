//! Payload codecs.
//!
//! The anchor output carries one of two payload shapes:
//! - a packet batch (list of packet tuples)
//! - a game record (7-field constructor)
//!
//! [`payload::decode_payload`] picks between them.

pub mod game;
pub mod packet;
pub mod payload;

use thiserror::Error;

use crate::core::plutus::PlutusError;

pub use game::{decode_game, encode_game, GameRecord, GameState, KeyHash};
pub use packet::{decode_packets, encode_packets, Packet};
pub use payload::{decode_data, decode_payload, Payload};

/// Payload decode errors.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not valid structured data.
    #[error("invalid payload encoding: {0}")]
    Plutus(#[from] PlutusError),

    /// A packet list with a malformed element.
    #[error("malformed packet at index {index}: {reason}")]
    MalformedPacket {
        /// Position in the batch.
        index: usize,
        /// What was wrong.
        reason: &'static str,
    },

    /// A game record with a malformed field.
    #[error("malformed game record: {0}")]
    MalformedGame(&'static str),
}
