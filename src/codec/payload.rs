//! Payload dispatch.
//!
//! Packet batch first, game record second, anything else is
//! `Unrecognized`. A payload that commits to one shape but breaks it is
//! an error, never silently read as the other shape.

use crate::core::plutus::PlutusData;

use super::game::{decode_game, is_game_shape, GameRecord};
use super::packet::{decode_packets, Packet};
use super::DecodeError;

/// A decoded anchor payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Ordered packets from one transaction.
    PacketBatch(Vec<Packet>),
    /// Game lobby/outcome record.
    GameRecord(GameRecord),
    /// Well-formed data of neither shape.
    Unrecognized,
}

impl Payload {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::PacketBatch(_) => "packet_batch",
            Payload::GameRecord(_) => "game_record",
            Payload::Unrecognized => "unrecognized",
        }
    }
}

/// Decode raw datum bytes.
pub fn decode_payload(bytes: &[u8]) -> Result<Payload, DecodeError> {
    let data = PlutusData::from_cbor(bytes)?;
    decode_data(&data)
}

/// Decode already-parsed structured data.
pub fn decode_data(data: &PlutusData) -> Result<Payload, DecodeError> {
    if let Some(packets) = decode_packets(data)? {
        return Ok(Payload::PacketBatch(packets));
    }
    if is_game_shape(data) {
        return decode_game(data).map(Payload::GameRecord);
    }
    Ok(Payload::Unrecognized)
}
