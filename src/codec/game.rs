//! Game Record Codec
//!
//! The lobby/outcome record that shares the anchor payload slot with
//! packet batches. Wire shape, a 7-field constructor:
//!
//! ```text
//! Constr _ [
//!   Constr _ [referee_key_hash],
//!   player_count,
//!   bot_count,
//!   [Constr _ [player_key_hash], ...],
//!   Constr state_index [],
//!   Constr 0 [winner] | Constr _ [],
//!   Constr 0 [cheater] | Constr _ [],
//! ]
//! ```

use std::fmt;

use serde::{Serialize, Serializer};

use crate::core::plutus::PlutusData;

use super::DecodeError;

/// Number of fields in a game record constructor.
pub const GAME_RECORD_FIELDS: usize = 7;

/// A participant key hash.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KeyHash(pub Vec<u8>);

impl KeyHash {
    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyHash({})", self.to_hex())
    }
}

impl Serialize for KeyHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Game lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GameState {
    /// Waiting for players.
    Lobby,
    /// In progress.
    Running,
    /// Ended with a cheater identified.
    Cheated,
    /// Ended normally.
    Finished,
    /// Abandoned. Also the meaning of any unknown index.
    Aborted,
}

impl GameState {
    /// Map a constructor index; unknown indices are `Aborted`.
    pub fn from_index(index: u64) -> Self {
        match index {
            0 => GameState::Lobby,
            1 => GameState::Running,
            2 => GameState::Cheated,
            3 => GameState::Finished,
            _ => GameState::Aborted,
        }
    }

    /// Constructor index on the wire.
    pub fn index(self) -> u64 {
        match self {
            GameState::Lobby => 0,
            GameState::Running => 1,
            GameState::Cheated => 2,
            GameState::Finished => 3,
            GameState::Aborted => 4,
        }
    }

    /// Whether the game is over.
    pub fn is_terminal(self) -> bool {
        matches!(self, GameState::Cheated | GameState::Finished | GameState::Aborted)
    }
}

/// Announced / lobby / outcome state of one game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameRecord {
    /// Key hash of the referee (game host).
    pub referee_key_hash: KeyHash,
    /// Human seats.
    pub player_count: u64,
    /// Bot seats.
    pub bot_count: u64,
    /// Joined players in join order.
    pub players: Vec<KeyHash>,
    /// Lifecycle state.
    pub state: GameState,
    /// Winner, when finished.
    pub winner: Option<KeyHash>,
    /// Cheater, when caught.
    pub cheater: Option<KeyHash>,
}

/// Whether `data` commits to the game-record shape.
pub fn is_game_shape(data: &PlutusData) -> bool {
    matches!(data.as_constr(), Some((_, fields)) if fields.len() == GAME_RECORD_FIELDS)
}

/// Decode a game record.
///
/// Fails only on structural problems; an unknown state index decodes
/// as [`GameState::Aborted`].
pub fn decode_game(data: &PlutusData) -> Result<GameRecord, DecodeError> {
    let (_, fields) = data
        .as_constr()
        .ok_or(DecodeError::MalformedGame("expected constructor"))?;
    let [referee, player_count, bot_count, players, state, winner, cheater] = fields else {
        return Err(DecodeError::MalformedGame("expected 7 fields"));
    };

    let players = players
        .as_list()
        .ok_or(DecodeError::MalformedGame("players must be a list"))?
        .iter()
        .map(|p| wrapped_key(p).ok_or(DecodeError::MalformedGame("player key wrapper")))
        .collect::<Result<Vec<_>, _>>()?;

    let (state_index, _) = state
        .as_constr()
        .ok_or(DecodeError::MalformedGame("state must be a constructor"))?;

    Ok(GameRecord {
        referee_key_hash: wrapped_key(referee)
            .ok_or(DecodeError::MalformedGame("referee key wrapper"))?,
        player_count: count(player_count, "player count")?,
        bot_count: count(bot_count, "bot count")?,
        players,
        state: GameState::from_index(state_index),
        winner: optional_key(winner, "winner")?,
        cheater: optional_key(cheater, "cheater")?,
    })
}

/// Encode a game record.
pub fn encode_game(record: &GameRecord) -> PlutusData {
    PlutusData::constr(
        0,
        vec![
            wrap_key(&record.referee_key_hash),
            PlutusData::Int(record.player_count as i128),
            PlutusData::Int(record.bot_count as i128),
            PlutusData::List(record.players.iter().map(wrap_key).collect()),
            PlutusData::constr(record.state.index(), vec![]),
            encode_optional(record.winner.as_ref()),
            encode_optional(record.cheater.as_ref()),
        ],
    )
}

fn wrap_key(key: &KeyHash) -> PlutusData {
    PlutusData::constr(0, vec![PlutusData::Bytes(key.0.clone())])
}

fn encode_optional(key: Option<&KeyHash>) -> PlutusData {
    match key {
        Some(key) => PlutusData::constr(0, vec![PlutusData::Bytes(key.0.clone())]),
        None => PlutusData::constr(1, vec![]),
    }
}

/// First field of a single-field wrapper, as a key hash.
fn wrapped_key(data: &PlutusData) -> Option<KeyHash> {
    let (_, fields) = data.as_constr()?;
    fields.first()?.as_bytes().map(|b| KeyHash(b.to_vec()))
}

fn count(data: &PlutusData, what: &'static str) -> Result<u64, DecodeError> {
    data.as_int()
        .and_then(|n| u64::try_from(n).ok())
        .ok_or(DecodeError::MalformedGame(what))
}

fn optional_key(data: &PlutusData, what: &'static str) -> Result<Option<KeyHash>, DecodeError> {
    match data.as_constr() {
        Some((0, [value, ..])) => match value {
            PlutusData::Bytes(b) => Ok(Some(KeyHash(b.clone()))),
            other => wrapped_key(other).map(Some).ok_or(DecodeError::MalformedGame(what)),
        },
        Some((0, [])) => Err(DecodeError::MalformedGame(what)),
        Some(_) => Ok(None),
        None => Err(DecodeError::MalformedGame(what)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::packet::{decode_packets, encode_packets, Packet};

    fn key(byte: u8) -> KeyHash {
        KeyHash(vec![byte; 28])
    }

    fn lobby() -> GameRecord {
        GameRecord {
            referee_key_hash: key(0xaa),
            player_count: 2,
            bot_count: 1,
            players: vec![key(1)],
            state: GameState::Lobby,
            winner: None,
            cheater: None,
        }
    }

    #[test]
    fn test_roundtrip() {
        let mut record = lobby();
        record.players.push(key(2));
        record.state = GameState::Finished;
        record.winner = Some(key(2));
        let bytes = encode_game(&record).to_cbor().unwrap();
        let decoded = decode_game(&PlutusData::from_cbor(&bytes).unwrap()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_absent_optionals() {
        let decoded = decode_game(&encode_game(&lobby())).unwrap();
        assert_eq!(decoded.winner, None);
        assert_eq!(decoded.cheater, None);
    }

    #[test]
    fn test_winner_at_tag_zero() {
        let mut data = encode_game(&lobby());
        if let PlutusData::Constr(_, fields) = &mut data {
            fields[5] = PlutusData::constr(0, vec![PlutusData::Bytes(vec![0x42; 28])]);
            fields[6] = PlutusData::constr(3, vec![PlutusData::Bytes(vec![0x43; 28])]);
        }
        let decoded = decode_game(&data).unwrap();
        assert_eq!(decoded.winner, Some(key(0x42)));
        // Any index other than 0 is absent, even with a payload.
        assert_eq!(decoded.cheater, None);
    }

    #[test]
    fn test_unknown_state_is_aborted() {
        let mut data = encode_game(&lobby());
        if let PlutusData::Constr(_, fields) = &mut data {
            fields[4] = PlutusData::constr(9, vec![]);
        }
        assert_eq!(decode_game(&data).unwrap().state, GameState::Aborted);
    }

    #[test]
    fn test_every_known_state() {
        for (index, state) in [
            (0, GameState::Lobby),
            (1, GameState::Running),
            (2, GameState::Cheated),
            (3, GameState::Finished),
        ] {
            assert_eq!(GameState::from_index(index), state);
            assert_eq!(state.index(), index);
        }
    }

    #[test]
    fn test_missing_fields_rejected() {
        let data = PlutusData::constr(0, vec![PlutusData::Int(1); 6]);
        assert!(matches!(decode_game(&data), Err(DecodeError::MalformedGame(_))));
    }

    #[test]
    fn test_bad_player_list_rejected() {
        let mut data = encode_game(&lobby());
        if let PlutusData::Constr(_, fields) = &mut data {
            fields[3] = PlutusData::Int(3);
        }
        assert!(decode_game(&data).is_err());
    }

    #[test]
    fn test_shapes_are_mutually_exclusive() {
        let record = encode_game(&lobby());
        assert_eq!(decode_packets(&record).unwrap(), None);

        let batch = encode_packets(&[Packet::new(1, 0, vec![1], vec![2])]);
        assert!(decode_game(&batch).is_err());
        assert!(!is_game_shape(&batch));
        assert!(is_game_shape(&record));
    }
}
