//! Head Protocol Messages
//!
//! JSON messages exchanged with a Hydra node over its websocket API.
//! Every message carries a `tag` naming its kind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::tx::SignedTx;

// =============================================================================
// CLIENT -> HEAD
// =============================================================================

/// Commands sent to the head.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "tag")]
pub enum ClientInput {
    /// Submit a transaction to the head ledger.
    NewTx {
        /// The transaction envelope.
        transaction: TransactionEnvelope,
    },
}

impl ClientInput {
    /// `NewTx` for a signed transaction.
    pub fn new_tx(era_tag: &str, tx: &SignedTx) -> Self {
        ClientInput::NewTx {
            transaction: TransactionEnvelope {
                era: era_tag.to_string(),
                description: String::new(),
                cbor_hex: tx.to_hex(),
                tx_id: None,
            },
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Text-envelope form of a transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionEnvelope {
    /// Era tag, e.g. `Tx BabbageEra`.
    #[serde(rename = "type", default)]
    pub era: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Hex-encoded transaction.
    #[serde(rename = "cborHex", default)]
    pub cbor_hex: String,
    /// Transaction id, when the node includes it.
    #[serde(rename = "txId", default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
}

// =============================================================================
// HEAD -> CLIENT
// =============================================================================

/// Messages pushed by the head.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "tag")]
pub enum HeadMessage {
    /// First message after connecting.
    Greetings {
        /// Head lifecycle status.
        #[serde(rename = "headStatus", default)]
        head_status: Option<String>,
    },

    /// A transaction was applied to the head ledger.
    TxValid {
        /// The applied transaction.
        #[serde(default)]
        transaction: Option<TransactionEnvelope>,
        /// Id, as sent by nodes that do not embed the transaction id.
        #[serde(rename = "transactionId", default)]
        transaction_id: Option<String>,
        /// Node timestamp.
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },

    /// A transaction was rejected.
    TxInvalid {
        /// The rejected transaction.
        #[serde(default)]
        transaction: Option<TransactionEnvelope>,
        /// Why.
        #[serde(rename = "validationError", default)]
        validation_error: Option<ValidationError>,
    },

    /// A snapshot was multi-signed.
    SnapshotConfirmed {
        /// The snapshot.
        #[serde(default)]
        snapshot: Option<Snapshot>,
    },

    /// A peer came online.
    PeerConnected {
        /// Peer identifier.
        #[serde(default)]
        peer: Option<serde_json::Value>,
    },

    /// A peer went away.
    PeerDisconnected {
        /// Peer identifier.
        #[serde(default)]
        peer: Option<serde_json::Value>,
    },

    /// Head opened.
    HeadIsOpen,

    /// Head closed.
    HeadIsClosed,

    /// A client command could not be processed.
    CommandFailed {
        /// The failing input.
        #[serde(rename = "clientInput", default)]
        client_input: Option<serde_json::Value>,
    },

    /// An on-chain post failed.
    PostTxOnChainFailed {
        /// Node error.
        #[serde(rename = "postTxError", default)]
        post_tx_error: Option<serde_json::Value>,
    },

    /// Any tag this client does not know.
    #[serde(other)]
    Unknown,
}

/// Ledger validation failure.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationError {
    /// Node-provided reason.
    #[serde(default)]
    pub reason: String,
}

/// Confirmed snapshot summary.
#[derive(Debug, Clone, Deserialize)]
pub struct Snapshot {
    /// Snapshot sequence number.
    #[serde(rename = "snapshotNumber", default)]
    pub number: Option<u64>,
}

impl HeadMessage {
    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Tag name for logs.
    pub fn tag(&self) -> &'static str {
        match self {
            HeadMessage::Greetings { .. } => "Greetings",
            HeadMessage::TxValid { .. } => "TxValid",
            HeadMessage::TxInvalid { .. } => "TxInvalid",
            HeadMessage::SnapshotConfirmed { .. } => "SnapshotConfirmed",
            HeadMessage::PeerConnected { .. } => "PeerConnected",
            HeadMessage::PeerDisconnected { .. } => "PeerDisconnected",
            HeadMessage::HeadIsOpen => "HeadIsOpen",
            HeadMessage::HeadIsClosed => "HeadIsClosed",
            HeadMessage::CommandFailed { .. } => "CommandFailed",
            HeadMessage::PostTxOnChainFailed { .. } => "PostTxOnChainFailed",
            HeadMessage::Unknown => "Unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::utxo::TxId;

    #[test]
    fn test_new_tx_json() {
        let tx = SignedTx {
            tx_id: TxId([1; 32]),
            cbor: vec![0x84, 0xa0],
        };
        let json = ClientInput::new_tx("Tx BabbageEra", &tx).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["tag"], "NewTx");
        assert_eq!(value["transaction"]["type"], "Tx BabbageEra");
        assert_eq!(value["transaction"]["description"], "");
        assert_eq!(value["transaction"]["cborHex"], "84a0");
        assert!(value["transaction"].get("txId").is_none());
    }

    #[test]
    fn test_tx_valid_parse() {
        let json = r#"{"tag":"TxValid","headId":"01","seq":7,
            "timestamp":"2024-05-01T12:00:00Z",
            "transaction":{"type":"Tx BabbageEra","description":"","cborHex":"84a0","txId":"ab"}}"#;
        match HeadMessage::from_json(json).unwrap() {
            HeadMessage::TxValid { transaction, timestamp, .. } => {
                let transaction = transaction.unwrap();
                assert_eq!(transaction.cbor_hex, "84a0");
                assert_eq!(transaction.tx_id.as_deref(), Some("ab"));
                assert!(timestamp.is_some());
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_tx_invalid_reason() {
        let json = r#"{"tag":"TxInvalid","utxo":{},
            "transaction":{"cborHex":"84a0"},
            "validationError":{"reason":"BadInputsUTxO"}}"#;
        match HeadMessage::from_json(json).unwrap() {
            HeadMessage::TxInvalid { validation_error, .. } => {
                assert_eq!(validation_error.unwrap().reason, "BadInputsUTxO");
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_informational_tags() {
        let open = HeadMessage::from_json(r#"{"tag":"HeadIsOpen","headId":"01","utxo":{}}"#).unwrap();
        assert_eq!(open.tag(), "HeadIsOpen");

        let snap = HeadMessage::from_json(
            r#"{"tag":"SnapshotConfirmed","snapshot":{"snapshotNumber":4,"confirmed":[]}}"#,
        )
        .unwrap();
        match snap {
            HeadMessage::SnapshotConfirmed { snapshot } => {
                assert_eq!(snapshot.unwrap().number, Some(4));
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag() {
        let msg = HeadMessage::from_json(r#"{"tag":"SomethingNew","x":1}"#).unwrap();
        assert!(matches!(msg, HeadMessage::Unknown));
    }
}
