//! Session Keys
//!
//! The per-session ed25519 identity of the local participant.
//! Its key hash doubles as the packet `ephemeral_key`; the signing key
//! witnesses every transaction the bridge submits.

use std::fmt;
use std::path::Path;

use bech32::{Bech32, Hrp};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use minicbor::Decoder;
use rand::rngs::OsRng;
use serde::Deserialize;
use thiserror::Error;

use super::address::Address;
use super::hash::{blake2b_224, KeyHashBytes};

/// bech32 prefix for exported session secrets.
pub const SECRET_KEY_HRP: &str = "ed25519_sk";

/// Session key errors.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Key file could not be read.
    #[error("failed to read key file: {0}")]
    Io(#[from] std::io::Error),
    /// Key file was not a text envelope.
    #[error("invalid key envelope: {0}")]
    Envelope(#[from] serde_json::Error),
    /// Envelope payload was not hex.
    #[error("invalid key hex: {0}")]
    Hex(#[from] hex::FromHexError),
    /// Envelope payload was not a 32-byte CBOR byte string.
    #[error("expected 32-byte signing key")]
    InvalidKeyBytes,
    /// bech32 encoding failed.
    #[error("bech32: {0}")]
    Bech32(String),
}

/// cardano-cli text envelope.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextEnvelope {
    cbor_hex: String,
}

/// Key pair plus derived identifiers for one session.
#[derive(Clone)]
pub struct SessionKeys {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    key_hash: KeyHashBytes,
    network_id: u8,
}

impl SessionKeys {
    /// Build from a raw 32-byte secret.
    pub fn from_secret_bytes(secret: [u8; 32], network_id: u8) -> Self {
        let signing_key = SigningKey::from_bytes(&secret);
        let verifying_key = signing_key.verifying_key();
        let key_hash = blake2b_224(verifying_key.as_bytes());
        Self {
            signing_key,
            verifying_key,
            key_hash,
            network_id,
        }
    }

    /// Generate a fresh random session key.
    pub fn generate(network_id: u8) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_secret_bytes(signing_key.to_bytes(), network_id)
    }

    /// Parse a cardano-cli text envelope (`{"cborHex": "5820..."}`).
    pub fn from_text_envelope(json: &str, network_id: u8) -> Result<Self, KeyError> {
        let envelope: TextEnvelope = serde_json::from_str(json)?;
        let raw = hex::decode(envelope.cbor_hex.trim())?;
        let mut d = Decoder::new(&raw);
        let secret: [u8; 32] = d
            .bytes()
            .ok()
            .filter(|_| d.position() == raw.len())
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(KeyError::InvalidKeyBytes)?;
        Ok(Self::from_secret_bytes(secret, network_id))
    }

    /// Load a text envelope from disk.
    pub fn load(path: impl AsRef<Path>, network_id: u8) -> Result<Self, KeyError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_text_envelope(&json, network_id)
    }

    /// Raw verification key.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// blake2b-224 hash of the verification key.
    pub fn public_key_hash(&self) -> &KeyHashBytes {
        &self.key_hash
    }

    /// Key hash as hex.
    pub fn public_key_hash_hex(&self) -> String {
        hex::encode(self.key_hash)
    }

    /// Network the session address is rendered for.
    pub fn network_id(&self) -> u8 {
        self.network_id
    }

    /// Enterprise address controlled by this key.
    pub fn address(&self) -> Address {
        Address::enterprise(self.network_id, &self.key_hash)
    }

    /// Secret key as `ed25519_sk1...`.
    pub fn secret_bech32(&self) -> Result<String, KeyError> {
        let hrp = Hrp::parse(SECRET_KEY_HRP).map_err(|e| KeyError::Bech32(e.to_string()))?;
        bech32::encode::<Bech32>(hrp, &self.signing_key.to_bytes())
            .map_err(|e| KeyError::Bech32(e.to_string()))
    }

    /// Sign a message (a transaction id when witnessing).
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the secret.
        f.debug_struct("SessionKeys")
            .field("key_hash", &self.public_key_hash_hex())
            .field("network_id", &self.network_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier};

    #[test]
    fn test_key_hash_matches_public_key() {
        let keys = SessionKeys::from_secret_bytes([7u8; 32], 0);
        assert_eq!(*keys.public_key_hash(), blake2b_224(&keys.public_key_bytes()));
        assert_eq!(keys.public_key_hash_hex().len(), 56);
    }

    #[test]
    fn test_text_envelope() {
        let secret = [0x11u8; 32];
        let json = format!(
            r#"{{"type":"PaymentSigningKeyShelley_ed25519","description":"","cborHex":"5820{}"}}"#,
            hex::encode(secret)
        );
        let keys = SessionKeys::from_text_envelope(&json, 0).unwrap();
        assert_eq!(keys.public_key_bytes(), SessionKeys::from_secret_bytes(secret, 0).public_key_bytes());
    }

    #[test]
    fn test_text_envelope_wrong_length() {
        let json = r#"{"cborHex":"4101"}"#;
        assert!(matches!(
            SessionKeys::from_text_envelope(json, 0),
            Err(KeyError::InvalidKeyBytes)
        ));
    }

    #[test]
    fn test_secret_bech32_prefix() {
        let keys = SessionKeys::generate(0);
        assert!(keys.secret_bech32().unwrap().starts_with("ed25519_sk1"));
    }

    #[test]
    fn test_signature_verifies() {
        let keys = SessionKeys::generate(0);
        let sig = keys.sign(b"tx id");
        let vk = VerifyingKey::from_bytes(&keys.public_key_bytes()).unwrap();
        assert!(vk.verify(b"tx id", &Signature::from_bytes(&sig)).is_ok());
    }

    #[test]
    fn test_address_uses_key_hash() {
        let keys = SessionKeys::from_secret_bytes([2u8; 32], 0);
        assert_eq!(&keys.address().as_bytes()[1..], &keys.public_key_hash()[..]);
    }

    #[test]
    fn test_debug_hides_secret() {
        let keys = SessionKeys::from_secret_bytes([5u8; 32], 0);
        let shown = format!("{:?}", keys);
        assert!(!shown.contains(&hex::encode([5u8; 32])));
    }
}
