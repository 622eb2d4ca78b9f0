//! # Hydra Multiplayer
//!
//! Relays game packets through a Hydra head. Outgoing packets are batched
//! into the datum of a single session-owned UTxO; every transaction the
//! head confirms is decoded back into packets and game lifecycle events.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    HYDRA MULTIPLAYER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Ledger primitives                         │
//! │  ├── plutus.rs   - Structured datum values (CBOR)            │
//! │  ├── hash.rs     - Blake2b key and transaction hashes        │
//! │  ├── address.rs  - Enterprise addresses, bech32              │
//! │  └── keys.rs     - Ed25519 session keys                      │
//! │                                                              │
//! │  codec/          - Datum payloads                            │
//! │  ├── packet.rs   - Packet batches                            │
//! │  ├── game.rs     - Game records                              │
//! │  └── payload.rs  - Shape dispatch                            │
//! │                                                              │
//! │  ledger/         - Head connectivity                         │
//! │  ├── connection.rs - WebSocket client, submissions           │
//! │  ├── protocol.rs - Head message types                        │
//! │  ├── utxo.rs     - Anchor tracking and resolution            │
//! │  └── tx.rs       - Successor transactions                    │
//! │                                                              │
//! │  bridge/         - Engine-facing actor                       │
//! │  ├── multiplayer.rs - Queue, flush, dispatch                 │
//! │  ├── engine.rs   - Engine memory boundary                    │
//! │  └── events.rs   - Lifecycle callbacks                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering
//!
//! The head totally orders transactions, so every participant observes
//! the same packet sequence. Each session spends its own anchor output;
//! a batch either lands whole or not at all.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod bridge;
pub mod codec;
pub mod config;
pub mod core;
pub mod ledger;

// Re-export commonly used types
pub use bridge::{BridgeError, BridgeEvent, BridgeHandle, BridgeListener, GameEngine, MultiplayerBridge};
pub use codec::{GameRecord, GameState, Packet, Payload};
pub use config::{BridgeConfig, ConfigError};
pub use core::{Address, PlutusData, SessionKeys};
pub use ledger::{HydraUtxoResolver, LedgerConfig, LedgerConnection, LedgerEvent, TransactionBuilder, TxId};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
