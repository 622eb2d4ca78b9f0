//! Multiplayer bridge.
//!
//! Sits between the game engine and the head: outgoing packets are
//! queued and flushed into anchor transactions, confirmed transactions
//! are decoded back into packets and lifecycle events.

pub mod engine;
pub mod events;
pub mod multiplayer;

use thiserror::Error;

use crate::codec::packet::Packet;
use crate::ledger::connection::LedgerError;
use crate::ledger::utxo::{AnchorUtxo, TxId};

pub use engine::{deliver_packet, EnginePtr, GameEngine};
pub use events::{BridgeEvent, BridgeListener};
pub use multiplayer::{BridgeHandle, MultiplayerBridge};

/// Errors reported to senders.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// The head rejected the transaction; the packets stay queued.
    #[error("transaction rejected: {reason}")]
    Rejected {
        /// Node-provided reason.
        reason: String,
    },

    /// Submission failed for a transport reason.
    #[error("submission failed: {0}")]
    Submission(String),

    /// Anchor could not be resolved.
    #[error("anchor unavailable: {0}")]
    Anchor(String),

    /// Transaction could not be built.
    #[error("build failed: {0}")]
    Build(String),

    /// The bridge task is gone.
    #[error("bridge stopped")]
    Stopped,
}

impl From<LedgerError> for BridgeError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Rejected { reason } => BridgeError::Rejected { reason },
            other => BridgeError::Submission(other.to_string()),
        }
    }
}

/// Point-in-time view of the bridge state.
#[derive(Debug, Clone)]
pub struct BridgeSnapshot {
    /// Packets not yet confirmed.
    pub queued: Vec<Packet>,
    /// Local anchor, if known.
    pub anchor: Option<AnchorUtxo>,
    /// Tracked game.
    pub game_id: Option<TxId>,
    /// Slot used for self-filtering.
    pub local_slot: u32,
    /// Whether a flush is in progress.
    pub flushing: bool,
}
