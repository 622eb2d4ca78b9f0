//! Ledger Addresses
//!
//! Shelley addresses as raw header-prefixed bytes, rendered in bech32.
//! Only the parts the bridge needs: enterprise key addresses for the
//! session key, and opaque round-tripping of any address read from the head.

use std::fmt;
use std::str::FromStr;

use bech32::{Bech32, Hrp};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use super::hash::KeyHashBytes;

/// Network id of mainnet; every other id renders as a test address.
pub const MAINNET_ID: u8 = 1;

/// Header nibble of an enterprise address with a key payment credential.
const ENTERPRISE_KEY_HEADER: u8 = 0b0110_0000;

/// Address errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// bech32 decoding or encoding failed.
    #[error("bech32: {0}")]
    Bech32(String),
    /// Address has no header byte.
    #[error("empty address")]
    Empty,
}

/// A ledger address.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(Vec<u8>);

impl Address {
    /// Wrap raw address bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, AddressError> {
        if bytes.is_empty() {
            return Err(AddressError::Empty);
        }
        Ok(Self(bytes))
    }

    /// Enterprise address paying to a key hash.
    pub fn enterprise(network_id: u8, key_hash: &KeyHashBytes) -> Self {
        let mut bytes = Vec::with_capacity(1 + key_hash.len());
        bytes.push(ENTERPRISE_KEY_HEADER | (network_id & 0x0f));
        bytes.extend_from_slice(key_hash);
        Self(bytes)
    }

    /// Raw bytes as carried in transaction outputs.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Network id from the header's low nibble.
    pub fn network_id(&self) -> u8 {
        self.0[0] & 0x0f
    }

    /// Parse a bech32 address.
    pub fn from_bech32(s: &str) -> Result<Self, AddressError> {
        let (_, bytes) = bech32::decode(s).map_err(|e| AddressError::Bech32(e.to_string()))?;
        Self::from_bytes(bytes)
    }

    /// Render as bech32 (`addr` on mainnet, `addr_test` elsewhere).
    pub fn to_bech32(&self) -> Result<String, AddressError> {
        let prefix = if self.network_id() == MAINNET_ID { "addr" } else { "addr_test" };
        let hrp = Hrp::parse(prefix).map_err(|e| AddressError::Bech32(e.to_string()))?;
        bech32::encode::<Bech32>(hrp, &self.0).map_err(|e| AddressError::Bech32(e.to_string()))
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bech32(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_bech32() {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{}", hex::encode(&self.0)),
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::from_bech32(&s).map_err(serde::de::Error::custom)
    }
}
