//! Settlement layer plumbing.
//!
//! - `connection` / `protocol`: websocket to the head
//! - `utxo`: anchor tracking and resolution
//! - `tx`: successor transaction building and parsing

pub mod connection;
pub mod protocol;
pub mod tx;
pub mod utxo;

use std::future::Future;

use chrono::{DateTime, Utc};

pub use connection::{ConnectionState, LedgerConfig, LedgerConnection, LedgerError};
pub use tx::{parse_transaction, ObservedTx, SignedTx, TransactionBuilder, TxBuildError};
pub use utxo::{AnchorResolver, AnchorUtxo, ChainError, HydraUtxoResolver, OutRef, TxId, Utxo, UtxoChain, Value};

/// Something that accepts transactions, as seen by the bridge.
pub trait Ledger: Send + Sync {
    /// Whether submissions can currently succeed.
    fn is_open(&self) -> bool;

    /// Submit and wait for the verdict.
    fn submit(&self, tx: SignedTx) -> impl Future<Output = Result<TxId, LedgerError>> + Send;
}

/// Asynchronous notifications from the head.
#[derive(Debug, Clone)]
pub enum LedgerEvent {
    /// A transaction was applied, whoever submitted it.
    Confirmed {
        /// Transaction id.
        tx_id: TxId,
        /// Full serialized transaction.
        tx_cbor: Vec<u8>,
        /// Node timestamp, when provided.
        observed_at: Option<DateTime<Utc>>,
    },
    /// The connection ended; no further events follow.
    Closed {
        /// Why.
        reason: String,
    },
}
