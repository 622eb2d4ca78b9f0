//! Lifecycle notifications.
//!
//! Consumers implement [`BridgeListener`] (every method defaults to a
//! no-op) or hand the bridge an `UnboundedSender<BridgeEvent>`.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::codec::game::{GameRecord, KeyHash};
use crate::codec::packet::Packet;
use crate::ledger::tx::ObservedTx;
use crate::ledger::utxo::TxId;

/// Callbacks fired by the bridge, synchronously, from its task.
pub trait BridgeListener: Send + 'static {
    /// First game record seen; `game_id` is its transaction id.
    fn new_game(
        &mut self,
        _game_id: &TxId,
        _player_count: u64,
        _bot_count: u64,
        _first_player: Option<&KeyHash>,
    ) {
    }

    /// A later record for the tracked game.
    fn player_joined(&mut self, _game_id: &TxId, _players: &[KeyHash]) {}

    /// The tracked game reached Cheated, Finished or Aborted.
    fn game_ended(&mut self, _game_id: &TxId, _record: &GameRecord) {}

    /// A packet-batch transaction was confirmed, with the packets it carried.
    fn tx_observed(&mut self, _tx: &ObservedTx, _packets: &[Packet]) {}

    /// One packet of a confirmed batch, whoever it was addressed to.
    fn packet_observed(&mut self, _tx_id: &TxId, _packet: &Packet) {}
}

/// No listener.
impl BridgeListener for () {}

/// Channel form of the listener callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// See [`BridgeListener::new_game`].
    NewGame {
        /// Game id.
        game_id: TxId,
        /// Human seats.
        player_count: u64,
        /// Bot seats.
        bot_count: u64,
        /// First joined player.
        first_player: Option<KeyHash>,
    },
    /// See [`BridgeListener::player_joined`].
    PlayerJoined {
        /// Game id.
        game_id: TxId,
        /// Players so far.
        players: Vec<KeyHash>,
    },
    /// See [`BridgeListener::game_ended`].
    GameEnded {
        /// Game id.
        game_id: TxId,
        /// Final record.
        record: GameRecord,
    },
    /// See [`BridgeListener::tx_observed`].
    TxObserved {
        /// Transaction id.
        tx_id: TxId,
        /// Packets carried.
        packet_count: usize,
    },
    /// See [`BridgeListener::packet_observed`].
    PacketObserved {
        /// Carrying transaction.
        tx_id: TxId,
        /// Destination slot.
        to: u32,
        /// Source slot.
        from: u32,
        /// Datagram length.
        len: usize,
    },
}

impl BridgeListener for mpsc::UnboundedSender<BridgeEvent> {
    fn new_game(
        &mut self,
        game_id: &TxId,
        player_count: u64,
        bot_count: u64,
        first_player: Option<&KeyHash>,
    ) {
        let _ = self.send(BridgeEvent::NewGame {
            game_id: *game_id,
            player_count,
            bot_count,
            first_player: first_player.cloned(),
        });
    }

    fn player_joined(&mut self, game_id: &TxId, players: &[KeyHash]) {
        let _ = self.send(BridgeEvent::PlayerJoined {
            game_id: *game_id,
            players: players.to_vec(),
        });
    }

    fn game_ended(&mut self, game_id: &TxId, record: &GameRecord) {
        let _ = self.send(BridgeEvent::GameEnded {
            game_id: *game_id,
            record: record.clone(),
        });
    }

    fn tx_observed(&mut self, tx: &ObservedTx, packets: &[Packet]) {
        let _ = self.send(BridgeEvent::TxObserved {
            tx_id: tx.tx_id,
            packet_count: packets.len(),
        });
    }

    fn packet_observed(&mut self, tx_id: &TxId, packet: &Packet) {
        let _ = self.send(BridgeEvent::PacketObserved {
            tx_id: *tx_id,
            to: packet.to,
            from: packet.from,
            len: packet.data.len(),
        });
    }
}
