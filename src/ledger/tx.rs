//! Transaction Builder
//!
//! Builds the successor transaction of the anchor: one input (the
//! anchor), one output back to the same address carrying the payload as
//! an inline datum, witnessed by the session key.
//!
//! Wire layout (Babbage era):
//!
//! ```text
//! tx     = [body, witnesses, true, null]
//! body   = {0: [[txid, ix]], 1: [output], 2: fee}
//! output = {0: address, 1: value, 2: [1, #6.24(datum)]}
//! wits   = {0: [[vkey, signature]]}
//! ```
//!
//! The transaction id is blake2b-256 of the serialized body.

use std::convert::Infallible;

use minicbor::data::{Tag, Type};
use minicbor::{decode, encode, Decoder, Encoder};
use thiserror::Error;
use tracing::trace;

use crate::core::address::{Address, AddressError};
use crate::core::hash::hash_tx_body;
use crate::core::keys::SessionKeys;
use crate::core::plutus::{for_each_item, PlutusData};

use super::utxo::{OutRef, TxId, Utxo, Value};

/// CBOR tag wrapping embedded CBOR (inline datums).
const TAG_EMBEDDED_CBOR: u64 = 24;
/// CBOR tag marking a set (Conway-era input lists).
const TAG_SET: u64 = 258;
/// Datum option discriminant for an inline datum.
const DATUM_INLINE: u64 = 1;

type EncodeError = encode::Error<Infallible>;

/// Build failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxBuildError {
    /// Anchor does not cover the fee.
    #[error("anchor holds {available} lovelace, fee is {fee}")]
    InsufficientFunds {
        /// Lovelace in the anchor.
        available: u64,
        /// Configured fee.
        fee: u64,
    },

    /// Anchor is not at the session address, so the session key cannot
    /// witness it.
    #[error("anchor at {0} is not controlled by the session key")]
    ForeignAnchor(String),

    /// Serialization failed.
    #[error("encoding failed: {0}")]
    Encode(String),
}

/// Errors reading an observed transaction.
#[derive(Debug, Error)]
pub enum TxDecodeError {
    /// Not CBOR, or CBOR of an unexpected type.
    #[error("cbor: {0}")]
    Cbor(#[from] decode::Error),

    /// CBOR of the wrong shape.
    #[error("malformed transaction: {0}")]
    Malformed(&'static str),

    /// Output address was unusable.
    #[error("address: {0}")]
    Address(#[from] AddressError),
}

/// A serialized, signed transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedTx {
    /// Body hash.
    pub tx_id: TxId,
    /// Full transaction bytes.
    pub cbor: Vec<u8>,
}

impl SignedTx {
    /// Hex form for the head API.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.cbor)
    }
}

/// Builds anchor successor transactions for one session.
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    keys: SessionKeys,
    fee: u64,
}

impl TransactionBuilder {
    /// Builder signing with `keys`, deducting `fee` from the anchor.
    pub fn new(keys: SessionKeys, fee: u64) -> Self {
        Self { keys, fee }
    }

    /// Session keys.
    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    /// Address the anchor lives at.
    pub fn address(&self) -> Address {
        self.keys.address()
    }

    /// Spend `anchor` into a successor carrying `payload`.
    ///
    /// Returns the predicted successor UTxO (`tx_id#0`) and the signed
    /// transaction.
    pub fn build(
        &self,
        anchor: &Utxo,
        payload: &PlutusData,
    ) -> Result<(Utxo, SignedTx), TxBuildError> {
        if anchor.address != self.keys.address() {
            return Err(TxBuildError::ForeignAnchor(anchor.address.to_string()));
        }
        let value = anchor
            .value
            .checked_sub_lovelace(self.fee)
            .ok_or(TxBuildError::InsufficientFunds {
                available: anchor.value.lovelace,
                fee: self.fee,
            })?;
        let datum = payload
            .to_cbor()
            .map_err(|e| TxBuildError::Encode(e.to_string()))?;

        let body = encode_body(&anchor.out_ref, &anchor.address, &value, &datum, self.fee)
            .map_err(|e| TxBuildError::Encode(e.to_string()))?;
        let tx_id = TxId(hash_tx_body(&body));
        let signature = self.keys.sign(tx_id.as_bytes());
        let cbor = encode_signed(&body, &self.keys.public_key_bytes(), &signature)
            .map_err(|e| TxBuildError::Encode(e.to_string()))?;

        trace!(%tx_id, spends = %anchor.out_ref, datum_len = datum.len(), "built transaction");

        let successor = Utxo {
            out_ref: OutRef::new(tx_id, 0),
            address: anchor.address.clone(),
            value,
            datum: Some(datum),
        };
        Ok((successor, SignedTx { tx_id, cbor }))
    }
}

fn encode_body(
    spend: &OutRef,
    address: &Address,
    value: &Value,
    datum: &[u8],
    fee: u64,
) -> Result<Vec<u8>, EncodeError> {
    let mut e = Encoder::new(Vec::new());
    e.map(3)?;
    e.u8(0)?.array(1)?.array(2)?.bytes(spend.tx_id.as_bytes())?.u64(spend.index)?;
    e.u8(1)?.array(1)?;
    encode_output(&mut e, address, value, datum)?;
    e.u8(2)?.u64(fee)?;
    Ok(e.into_writer())
}

fn encode_output(
    e: &mut Encoder<Vec<u8>>,
    address: &Address,
    value: &Value,
    datum: &[u8],
) -> Result<(), EncodeError> {
    e.map(3)?.u8(0)?.bytes(address.as_bytes())?.u8(1)?;
    if value.assets.is_empty() {
        e.u64(value.lovelace)?;
    } else {
        e.array(2)?.u64(value.lovelace)?.map(value.assets.len() as u64)?;
        for (policy, names) in &value.assets {
            e.bytes(policy)?.map(names.len() as u64)?;
            for (name, qty) in names {
                e.bytes(name)?.u64(*qty)?;
            }
        }
    }
    e.u8(2)?.array(2)?.u64(DATUM_INLINE)?;
    e.tag(Tag::new(TAG_EMBEDDED_CBOR))?.bytes(datum)?;
    Ok(())
}

/// `[body, {0: [[vkey, signature]]}, true, null]`, with the body bytes
/// copied verbatim so the id stays the hash of what was signed.
fn encode_signed(body: &[u8], vkey: &[u8], signature: &[u8]) -> Result<Vec<u8>, EncodeError> {
    let mut e = Encoder::new(Vec::new());
    e.array(4)?;
    e.writer_mut().extend_from_slice(body);
    e.map(1)?.u8(0)?.array(1)?.array(2)?.bytes(vkey)?.bytes(signature)?;
    e.bool(true)?.null()?;
    Ok(e.into_writer())
}

// =============================================================================
// OBSERVED TRANSACTIONS
// =============================================================================

/// One output of an observed transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedOutput {
    /// Recipient.
    pub address: Address,
    /// Inline datum bytes, if the output carries one.
    pub datum: Option<Vec<u8>>,
}

/// The parts of a confirmed transaction the bridge looks at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedTx {
    /// Hash of the body as carried.
    pub tx_id: TxId,
    /// Spent outputs.
    pub inputs: Vec<OutRef>,
    /// Produced outputs in order.
    pub outputs: Vec<ObservedOutput>,
}

/// Transaction id of a serialized body.
pub fn tx_id(body: &[u8]) -> TxId {
    TxId(hash_tx_body(body))
}

/// Raw bytes of the body, the first element of the transaction array.
fn split_body(bytes: &[u8]) -> Result<&[u8], TxDecodeError> {
    let mut d = Decoder::new(bytes);
    d.array()?;
    let start = d.position();
    d.skip()?;
    Ok(&bytes[start..d.position()])
}

/// Transaction id of a full serialized transaction.
pub fn transaction_id(bytes: &[u8]) -> Result<TxId, TxDecodeError> {
    split_body(bytes).map(tx_id)
}

/// Read inputs and outputs from a confirmed transaction.
pub fn parse_transaction(bytes: &[u8]) -> Result<ObservedTx, TxDecodeError> {
    let raw = split_body(bytes)?;
    let mut d = Decoder::new(raw);

    let mut inputs = None;
    let mut outputs = None;
    let len = d.map()?;
    for_each_item(&mut d, len, |d| {
        match d.u64()? {
            0 => inputs = Some(decode_inputs(d)?),
            1 => outputs = Some(decode_outputs(d)?),
            _ => d.skip()?,
        }
        Ok::<_, TxDecodeError>(())
    })?;

    Ok(ObservedTx {
        tx_id: tx_id(raw),
        inputs: inputs.ok_or(TxDecodeError::Malformed("missing inputs"))?,
        outputs: outputs.ok_or(TxDecodeError::Malformed("missing outputs"))?,
    })
}

fn decode_inputs(d: &mut Decoder<'_>) -> Result<Vec<OutRef>, TxDecodeError> {
    if d.datatype()? == Type::Tag && d.tag()?.as_u64() != TAG_SET {
        return Err(TxDecodeError::Malformed("inputs must be an array or set"));
    }
    let mut inputs = Vec::new();
    let len = d.array()?;
    for_each_item(d, len, |d| {
        if d.array()? != Some(2) {
            return Err(TxDecodeError::Malformed("input must be [txid, index]"));
        }
        let hash: [u8; 32] = d
            .bytes()?
            .try_into()
            .map_err(|_| TxDecodeError::Malformed("input txid must be 32 bytes"))?;
        inputs.push(OutRef::new(TxId(hash), d.u64()?));
        Ok(())
    })?;
    Ok(inputs)
}

fn decode_outputs(d: &mut Decoder<'_>) -> Result<Vec<ObservedOutput>, TxDecodeError> {
    let mut outputs = Vec::new();
    let len = d.array()?;
    for_each_item(d, len, |d| {
        outputs.push(decode_output(d)?);
        Ok::<_, TxDecodeError>(())
    })?;
    Ok(outputs)
}

fn decode_output(d: &mut Decoder<'_>) -> Result<ObservedOutput, TxDecodeError> {
    let mut address = None;
    let mut datum = None;
    match d.datatype()? {
        Type::Map | Type::MapIndef => {
            let len = d.map()?;
            for_each_item(d, len, |d| {
                match d.u64()? {
                    0 => address = Some(d.bytes()?.to_vec()),
                    2 => datum = decode_datum_option(d)?,
                    _ => d.skip()?,
                }
                Ok::<_, TxDecodeError>(())
            })?;
        }
        // Legacy outputs carry at most a datum hash.
        Type::Array | Type::ArrayIndef => {
            let len = d.array()?;
            let mut position = 0;
            for_each_item(d, len, |d| {
                if position == 0 {
                    address = Some(d.bytes()?.to_vec());
                } else {
                    d.skip()?;
                }
                position += 1;
                Ok::<_, TxDecodeError>(())
            })?;
        }
        _ => return Err(TxDecodeError::Malformed("output must be a map or array")),
    }
    let address = address.ok_or(TxDecodeError::Malformed("output address"))?;
    Ok(ObservedOutput {
        address: Address::from_bytes(address)?,
        datum,
    })
}

/// `[1, #6.24(bytes)]` -> bytes; datum hashes yield `None`.
fn decode_datum_option(d: &mut Decoder<'_>) -> Result<Option<Vec<u8>>, TxDecodeError> {
    if d.array()? != Some(2) {
        return Err(TxDecodeError::Malformed("datum option must be a pair"));
    }
    if d.u64()? != DATUM_INLINE {
        d.skip()?;
        return Ok(None);
    }
    if d.tag()?.as_u64() != TAG_EMBEDDED_CBOR {
        return Err(TxDecodeError::Malformed("inline datum must be embedded cbor"));
    }
    Ok(Some(d.bytes()?.to_vec()))
}
