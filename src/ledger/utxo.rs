//! Anchor UTxO Chain
//!
//! Tracks the single unspent output that holds the session's shared
//! state. Every submitted transaction spends it and produces its
//! successor, so the local view must stay in step with the ledger:
//!
//! - `advance` after our own submission confirms
//! - `invalidate` after a rejection (the anchor must be re-resolved)
//! - `observe_spend` when someone else spends it first

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::core::address::Address;
use crate::core::hash::TxHashBytes;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// A transaction id (blake2b-256 of the body).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(pub TxHashBytes);

impl TxId {
    /// Raw bytes.
    pub fn as_bytes(&self) -> &TxHashBytes {
        &self.0
    }

    /// Lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({})", self.to_hex())
    }
}

impl FromStr for TxId {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| ChainError::InvalidTxId(s.to_string()))?;
        let bytes: TxHashBytes = bytes
            .try_into()
            .map_err(|_| ChainError::InvalidTxId(s.to_string()))?;
        Ok(TxId(bytes))
    }
}

impl Serialize for TxId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TxId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Reference to one output: `txid#index`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutRef {
    /// Producing transaction.
    pub tx_id: TxId,
    /// Output position.
    pub index: u64,
}

impl OutRef {
    /// Build an output reference.
    pub fn new(tx_id: TxId, index: u64) -> Self {
        Self { tx_id, index }
    }
}

impl fmt::Display for OutRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tx_id, self.index)
    }
}

impl FromStr for OutRef {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tx, index) = s
            .split_once('#')
            .ok_or_else(|| ChainError::InvalidOutRef(s.to_string()))?;
        let index = index
            .parse()
            .map_err(|_| ChainError::InvalidOutRef(s.to_string()))?;
        Ok(OutRef::new(tx.parse()?, index))
    }
}

// =============================================================================
// OUTPUTS
// =============================================================================

/// Asset bundle: policy id -> asset name -> quantity.
pub type MultiAsset = BTreeMap<Vec<u8>, BTreeMap<Vec<u8>, u64>>;

/// Value held by an output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Value {
    /// Ada in lovelace.
    pub lovelace: u64,
    /// Native assets.
    pub assets: MultiAsset,
}

impl Value {
    /// Pure ada value.
    pub fn lovelace(lovelace: u64) -> Self {
        Self {
            lovelace,
            assets: MultiAsset::new(),
        }
    }

    /// Same value minus `fee` lovelace, or `None` if it does not cover it.
    pub fn checked_sub_lovelace(&self, fee: u64) -> Option<Self> {
        Some(Self {
            lovelace: self.lovelace.checked_sub(fee)?,
            assets: self.assets.clone(),
        })
    }
}

/// An unspent output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Utxo {
    /// Where it lives.
    pub out_ref: OutRef,
    /// Who controls it.
    pub address: Address,
    /// What it holds.
    pub value: Value,
    /// Raw inline datum, if any.
    pub datum: Option<Vec<u8>>,
}

/// The anchor as known locally, stamped with the chain version that
/// installed it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnchorUtxo {
    /// The output itself.
    pub utxo: Utxo,
    /// Chain version at install time.
    pub version: u64,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Anchor resolution errors.
#[derive(Debug, Error)]
pub enum ChainError {
    /// No candidate output at the session address.
    #[error("no anchor utxo at {0}")]
    NoAnchor(String),

    /// More than one candidate; the anchor must be unique.
    #[error("{count} candidate anchors at {address}")]
    AmbiguousAnchor {
        /// Session address.
        address: String,
        /// Number of candidates.
        count: usize,
    },

    /// Query to the head failed.
    #[error("snapshot query failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Snapshot body was not the expected JSON.
    #[error("invalid snapshot: {0}")]
    Json(#[from] serde_json::Error),

    /// Head URL could not be joined.
    #[error("invalid head url: {0}")]
    Url(#[from] url::ParseError),

    /// Malformed transaction id.
    #[error("invalid tx id: {0}")]
    InvalidTxId(String),

    /// Malformed `txid#index`.
    #[error("invalid output reference: {0}")]
    InvalidOutRef(String),

    /// Snapshot entry with a value that is not a token bundle.
    #[error("invalid value in snapshot entry {0}")]
    InvalidValue(String),
}

// =============================================================================
// RESOLUTION
// =============================================================================

/// Finds the current anchor on the ledger.
pub trait AnchorResolver: Send + Sync {
    /// Resolve exactly one anchor UTxO.
    fn resolve(&self) -> impl Future<Output = Result<Utxo, ChainError>> + Send;
}

/// Resolves the anchor from a Hydra node's `/snapshot/utxo` endpoint.
#[derive(Debug, Clone)]
pub struct HydraUtxoResolver {
    client: reqwest::Client,
    endpoint: Url,
    address: Address,
}

impl HydraUtxoResolver {
    /// Resolver for the UTxO at `address` on the head at `head_url`.
    pub fn new(head_url: &Url, address: Address) -> Result<Self, ChainError> {
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: head_url.join("snapshot/utxo")?,
            address,
        })
    }

    /// The queried endpoint.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl AnchorResolver for HydraUtxoResolver {
    async fn resolve(&self) -> Result<Utxo, ChainError> {
        let body = self
            .client
            .get(self.endpoint.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        select_from_snapshot(&body, &self.address)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotEntry {
    address: String,
    value: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    inline_datum_raw: Option<String>,
}

/// Pick the one UTxO held at `address` out of a snapshot body.
pub fn select_from_snapshot(body: &str, address: &Address) -> Result<Utxo, ChainError> {
    let snapshot: BTreeMap<String, SnapshotEntry> = serde_json::from_str(body)?;

    let mut found = Vec::new();
    for (key, entry) in snapshot {
        match Address::from_bech32(&entry.address) {
            Ok(a) if a == *address => {}
            _ => continue,
        }
        let datum = match entry.inline_datum_raw.as_deref().map(hex::decode) {
            Some(Ok(bytes)) => Some(bytes),
            Some(Err(e)) => {
                warn!(utxo = %key, "ignoring undecodable inline datum: {}", e);
                None
            }
            None => None,
        };
        found.push(Utxo {
            out_ref: key.parse()?,
            value: parse_value(&key, &entry.value)?,
            address: address.clone(),
            datum,
        });
    }

    match found.len() {
        0 => Err(ChainError::NoAnchor(address.to_string())),
        1 => Ok(found.remove(0)),
        count => Err(ChainError::AmbiguousAnchor {
            address: address.to_string(),
            count,
        }),
    }
}

fn parse_value(key: &str, raw: &BTreeMap<String, serde_json::Value>) -> Result<Value, ChainError> {
    let invalid = || ChainError::InvalidValue(key.to_string());
    let mut value = Value::default();
    for (unit, amount) in raw {
        if unit == "lovelace" {
            value.lovelace = amount.as_u64().ok_or_else(invalid)?;
            continue;
        }
        let policy = hex::decode(unit).map_err(|_| invalid())?;
        let names = amount.as_object().ok_or_else(invalid)?;
        let bundle = value.assets.entry(policy).or_default();
        for (name, qty) in names {
            let name = hex::decode(name).map_err(|_| invalid())?;
            bundle.insert(name, qty.as_u64().ok_or_else(invalid)?);
        }
    }
    Ok(value)
}

// =============================================================================
// CHAIN
// =============================================================================

/// Local view of the anchor.
#[derive(Debug, Default)]
pub struct UtxoChain {
    anchor: Option<AnchorUtxo>,
    version: u64,
    in_flight: Option<TxId>,
}

impl UtxoChain {
    /// Empty chain; the first flush resolves the anchor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current anchor, `None` before resolution or after invalidation.
    pub fn current_anchor(&self) -> Option<&AnchorUtxo> {
        self.anchor.as_ref()
    }

    /// Current chain version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Install a freshly resolved anchor.
    pub fn adopt(&mut self, utxo: Utxo) -> &AnchorUtxo {
        self.version += 1;
        debug!(anchor = %utxo.out_ref, version = self.version, "anchor resolved");
        self.anchor.insert(AnchorUtxo {
            utxo,
            version: self.version,
        })
    }

    /// Record the transaction being submitted, so its confirmation is
    /// not mistaken for a foreign spend.
    pub fn begin_submission(&mut self, tx_id: TxId) {
        self.in_flight = Some(tx_id);
    }

    /// Our submission confirmed; its output is the new anchor.
    pub fn advance(&mut self, successor: Utxo) {
        self.version += 1;
        self.in_flight = None;
        debug!(anchor = %successor.out_ref, version = self.version, "anchor advanced");
        self.anchor = Some(AnchorUtxo {
            utxo: successor,
            version: self.version,
        });
    }

    /// Drop the anchor; the next flush re-resolves it.
    pub fn invalidate(&mut self) {
        self.version += 1;
        self.in_flight = None;
        if let Some(old) = self.anchor.take() {
            debug!(anchor = %old.utxo.out_ref, version = self.version, "anchor invalidated");
        }
    }

    /// Note a confirmed transaction's inputs.
    ///
    /// Returns `true` when it spent the current anchor without being our
    /// own submission, in which case the anchor is invalidated.
    pub fn observe_spend(&mut self, tx_id: &TxId, inputs: &[OutRef]) -> bool {
        let Some(anchor) = &self.anchor else {
            return false;
        };
        if !inputs.contains(&anchor.utxo.out_ref) || self.in_flight == Some(*tx_id) {
            return false;
        }
        warn!(anchor = %anchor.utxo.out_ref, spender = %tx_id, "anchor spent by another transaction");
        self.invalidate();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::enterprise(0, &[byte; 28])
    }

    fn utxo(tx: u8, index: u64) -> Utxo {
        Utxo {
            out_ref: OutRef::new(TxId([tx; 32]), index),
            address: addr(1),
            value: Value::lovelace(10_000_000),
            datum: None,
        }
    }

    #[test]
    fn test_out_ref_parse() {
        let text = format!("{}#3", "ab".repeat(32));
        let out_ref: OutRef = text.parse().unwrap();
        assert_eq!(out_ref.index, 3);
        assert_eq!(out_ref.to_string(), text);
        assert!("nohash".parse::<OutRef>().is_err());
        assert!("abcd#0".parse::<OutRef>().is_err());
    }

    #[test]
    fn test_no_anchor_before_resolution() {
        let chain = UtxoChain::new();
        assert!(chain.current_anchor().is_none());
    }

    #[test]
    fn test_adopt_after_invalidate_bumps_version() {
        let mut chain = UtxoChain::new();
        let first = chain.adopt(utxo(1, 0)).version;
        assert_eq!(first, 1);

        chain.invalidate();
        assert!(chain.current_anchor().is_none());
        let again = chain.adopt(utxo(1, 0)).version;
        assert!(again > first);
    }

    #[test]
    fn test_advance_bumps_version() {
        let mut chain = UtxoChain::new();
        chain.adopt(utxo(1, 0));
        chain.advance(utxo(2, 0));
        let anchor = chain.current_anchor().unwrap();
        assert_eq!(anchor.utxo.out_ref.tx_id, TxId([2; 32]));
        assert_eq!(anchor.version, 2);
    }

    #[test]
    fn test_foreign_spend_invalidates() {
        let mut chain = UtxoChain::new();
        chain.adopt(utxo(1, 0));
        let spent = [utxo(1, 0).out_ref];
        assert!(chain.observe_spend(&TxId([9; 32]), &spent));
        assert!(chain.current_anchor().is_none());
    }

    #[test]
    fn test_own_spend_is_not_stale() {
        let mut chain = UtxoChain::new();
        chain.adopt(utxo(1, 0));
        chain.begin_submission(TxId([2; 32]));
        assert!(!chain.observe_spend(&TxId([2; 32]), &[utxo(1, 0).out_ref]));
        assert!(chain.current_anchor().is_some());

        // Unrelated inputs never touch the anchor.
        assert!(!chain.observe_spend(&TxId([3; 32]), &[utxo(7, 0).out_ref]));
    }

    #[test]
    fn test_select_from_snapshot() {
        let mine = addr(1);
        let other = addr(2);
        let body = format!(
            r#"{{
                "{a}#0": {{"address": "{mine}", "value": {{"lovelace": 5000000,
                    "{policy}": {{"{name}": 1}}}}, "inlineDatumRaw": "80"}},
                "{b}#1": {{"address": "{other}", "value": {{"lovelace": 1}}}}
            }}"#,
            a = "aa".repeat(32),
            b = "bb".repeat(32),
            policy = "cc".repeat(28),
            name = "7469636b6574",
        );

        let anchor = select_from_snapshot(&body, &mine).unwrap();
        assert_eq!(anchor.out_ref.index, 0);
        assert_eq!(anchor.value.lovelace, 5_000_000);
        assert_eq!(anchor.value.assets[&vec![0xcc; 28]][&b"ticket".to_vec()], 1);
        assert_eq!(anchor.datum, Some(vec![0x80]));
    }

    #[test]
    fn test_select_from_snapshot_none_or_many() {
        let mine = addr(1);
        assert!(matches!(select_from_snapshot("{}", &mine), Err(ChainError::NoAnchor(_))));

        let body = format!(
            r#"{{"{a}#0": {{"address": "{mine}", "value": {{"lovelace": 1}}}},
                "{a}#1": {{"address": "{mine}", "value": {{"lovelace": 2}}}}}}"#,
            a = "aa".repeat(32),
        );
        assert!(matches!(
            select_from_snapshot(&body, &mine),
            Err(ChainError::AmbiguousAnchor { count: 2, .. })
        ));
    }

    #[test]
    fn test_fee_cannot_exceed_value() {
        let value = Value::lovelace(10);
        assert_eq!(value.checked_sub_lovelace(3).unwrap().lovelace, 7);
        assert!(value.checked_sub_lovelace(11).is_none());
    }

    #[test]
    fn test_resolver_endpoint() {
        let url = Url::parse("http://localhost:4001").unwrap();
        let resolver = HydraUtxoResolver::new(&url, addr(1)).unwrap();
        assert_eq!(resolver.endpoint().as_str(), "http://localhost:4001/snapshot/utxo");
    }
}
