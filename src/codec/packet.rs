//! Packet Batch Codec
//!
//! A batch is a list of `Constr 0 [to, from, ephemeral_key, data]`,
//! integers for the slots and byte strings for the key and payload.
//! Order is preserved; delivery order matters to the engine.

use crate::core::plutus::PlutusData;

use super::DecodeError;

/// One game packet as exchanged with the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Destination slot.
    pub to: u32,
    /// Source slot.
    pub from: u32,
    /// Sender's session key hash (advisory attribution).
    pub ephemeral_key: Vec<u8>,
    /// Opaque engine datagram.
    pub data: Vec<u8>,
}

impl Packet {
    /// Build a packet.
    pub fn new(to: u32, from: u32, ephemeral_key: Vec<u8>, data: Vec<u8>) -> Self {
        Self {
            to,
            from,
            ephemeral_key,
            data,
        }
    }

    fn to_data(&self) -> PlutusData {
        PlutusData::constr(
            0,
            vec![
                PlutusData::Int(self.to as i128),
                PlutusData::Int(self.from as i128),
                PlutusData::Bytes(self.ephemeral_key.clone()),
                PlutusData::Bytes(self.data.clone()),
            ],
        )
    }

    fn from_data(index: usize, data: &PlutusData) -> Result<Self, DecodeError> {
        let malformed = |reason| DecodeError::MalformedPacket { index, reason };

        let fields = match data.as_constr() {
            Some((_, fields)) => fields,
            None => return Err(malformed("expected constructor")),
        };
        let [to, from, key, payload] = fields else {
            return Err(malformed("expected 4 fields"));
        };

        let slot = |field: &PlutusData| {
            field
                .as_int()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| malformed("slot is not a small non-negative integer"))
        };
        let bytes = |field: &PlutusData| {
            field
                .as_bytes()
                .map(<[u8]>::to_vec)
                .ok_or_else(|| malformed("expected byte string"))
        };

        Ok(Self {
            to: slot(to)?,
            from: slot(from)?,
            ephemeral_key: bytes(key)?,
            data: bytes(payload)?,
        })
    }
}

/// Encode a batch as one structured payload.
pub fn encode_packets(packets: &[Packet]) -> PlutusData {
    PlutusData::List(packets.iter().map(Packet::to_data).collect())
}

/// Decode a batch.
///
/// `Ok(None)` when the payload is not a list at all, which is the signal
/// to try the game-record shape instead. A list holding anything but
/// packet tuples is an error.
pub fn decode_packets(data: &PlutusData) -> Result<Option<Vec<Packet>>, DecodeError> {
    let Some(items) = data.as_list() else {
        return Ok(None);
    };
    items
        .iter()
        .enumerate()
        .map(|(index, item)| Packet::from_data(index, item))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}
