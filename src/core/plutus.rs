//! Plutus Structured Data
//!
//! The datum model carried by ledger outputs, with the canonical CBOR
//! form produced by Cardano tooling:
//!
//! - constructor `i` is tag `121 + i` (i < 7), `1280 + i - 7` (i < 128),
//!   or tag 102 wrapping `[i, fields]`
//! - non-empty lists and constructor fields use indefinite arrays
//! - byte strings over 64 bytes are split into 64-byte chunks
//! - integers outside 64 bits use bignum tags 2 and 3
//!
//! Integers are held as `i128`; larger bignums are rejected on decode.

use std::convert::Infallible;

use minicbor::data::{Int, Tag, Type};
use minicbor::encode::{self, Write};
use minicbor::{decode, Decoder, Encode, Encoder};
use thiserror::Error;

/// Maximum byte-string chunk in canonical encoding.
pub const BYTES_CHUNK: usize = 64;

/// Nesting limit when decoding untrusted datums.
pub const MAX_DEPTH: usize = 128;

const TAG_BIGNUM_POS: u64 = 2;
const TAG_BIGNUM_NEG: u64 = 3;
const TAG_CONSTR_GENERAL: u64 = 102;
const TAG_CONSTR_SMALL: u64 = 121;
const TAG_CONSTR_LARGE: u64 = 1280;

/// Plutus data value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlutusData {
    /// Constructor application: index and fields.
    Constr(u64, Vec<PlutusData>),
    /// Association list.
    Map(Vec<(PlutusData, PlutusData)>),
    /// Ordered list.
    List(Vec<PlutusData>),
    /// Integer.
    Int(i128),
    /// Byte string.
    Bytes(Vec<u8>),
}

/// Errors converting between CBOR and Plutus data.
#[derive(Debug, Error)]
pub enum PlutusError {
    /// Underlying CBOR was malformed.
    #[error("cbor: {0}")]
    Cbor(#[from] decode::Error),
    /// Encoding failed.
    #[error("cbor encode: {0}")]
    Encode(#[from] encode::Error<Infallible>),
    /// Hex transport string was malformed.
    #[error("hex: {0}")]
    Hex(#[from] hex::FromHexError),
    /// CBOR item has no Plutus data meaning.
    #[error("not plutus data: {0}")]
    NotPlutusData(&'static str),
    /// Bignum does not fit in 128 bits.
    #[error("integer too large")]
    IntegerTooLarge,
    /// Nesting deeper than [`MAX_DEPTH`].
    #[error("nesting too deep")]
    TooDeep,
    /// Bytes left over after the value.
    #[error("trailing bytes after value")]
    TrailingBytes,
}

impl PlutusData {
    /// Shorthand for a constructor.
    pub fn constr(index: u64, fields: Vec<PlutusData>) -> Self {
        PlutusData::Constr(index, fields)
    }

    /// Encode to canonical CBOR bytes.
    pub fn to_cbor(&self) -> Result<Vec<u8>, PlutusError> {
        let mut e = Encoder::new(Vec::new());
        e.encode(self)?;
        Ok(e.into_writer())
    }

    /// Encode to a hex string for transport.
    pub fn to_hex(&self) -> Result<String, PlutusError> {
        self.to_cbor().map(hex::encode)
    }

    /// Decode exactly one value from CBOR bytes.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, PlutusError> {
        let mut d = Decoder::new(bytes);
        let data = Self::decode(&mut d)?;
        if d.position() != bytes.len() {
            return Err(PlutusError::TrailingBytes);
        }
        Ok(data)
    }

    /// Decode from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, PlutusError> {
        Self::from_cbor(&hex::decode(s)?)
    }

    /// Read the next value from a CBOR stream.
    pub fn decode(d: &mut Decoder<'_>) -> Result<Self, PlutusError> {
        read(d, 0)
    }

    /// Constructor index and fields, if this is a constructor.
    pub fn as_constr(&self) -> Option<(u64, &[PlutusData])> {
        match self {
            PlutusData::Constr(index, fields) => Some((*index, fields)),
            _ => None,
        }
    }

    /// List items, if this is a list.
    pub fn as_list(&self) -> Option<&[PlutusData]> {
        match self {
            PlutusData::List(items) => Some(items),
            _ => None,
        }
    }

    /// Integer value, if this is an integer.
    pub fn as_int(&self) -> Option<i128> {
        match self {
            PlutusData::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Byte content, if this is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            PlutusData::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

// =============================================================================
// ENCODING
// =============================================================================

impl<C> Encode<C> for PlutusData {
    fn encode<W: Write>(
        &self,
        e: &mut Encoder<W>,
        ctx: &mut C,
    ) -> Result<(), encode::Error<W::Error>> {
        match self {
            PlutusData::Constr(index, fields) => {
                match *index {
                    i @ 0..=6 => {
                        e.tag(Tag::new(TAG_CONSTR_SMALL + i))?;
                    }
                    i @ 7..=127 => {
                        e.tag(Tag::new(TAG_CONSTR_LARGE + i - 7))?;
                    }
                    i => {
                        e.tag(Tag::new(TAG_CONSTR_GENERAL))?.array(2)?.u64(i)?;
                    }
                }
                encode_list(e, fields, ctx)
            }
            PlutusData::Map(entries) => {
                e.map(entries.len() as u64)?;
                for (k, v) in entries {
                    k.encode(e, ctx)?;
                    v.encode(e, ctx)?;
                }
                Ok(())
            }
            PlutusData::List(items) => encode_list(e, items, ctx),
            PlutusData::Int(value) => encode_int(e, *value),
            PlutusData::Bytes(bytes) if bytes.len() <= BYTES_CHUNK => {
                e.bytes(bytes)?;
                Ok(())
            }
            PlutusData::Bytes(bytes) => {
                e.begin_bytes()?;
                for chunk in bytes.chunks(BYTES_CHUNK) {
                    e.bytes(chunk)?;
                }
                e.end()?;
                Ok(())
            }
        }
    }
}

fn encode_list<C, W: Write>(
    e: &mut Encoder<W>,
    items: &[PlutusData],
    ctx: &mut C,
) -> Result<(), encode::Error<W::Error>> {
    if items.is_empty() {
        e.array(0)?;
        return Ok(());
    }
    e.begin_array()?;
    for item in items {
        item.encode(e, ctx)?;
    }
    e.end()?;
    Ok(())
}

fn encode_int<W: Write>(e: &mut Encoder<W>, value: i128) -> Result<(), encode::Error<W::Error>> {
    match Int::try_from(value) {
        Ok(int) => {
            e.int(int)?;
        }
        Err(_) if value >= 0 => {
            e.tag(Tag::new(TAG_BIGNUM_POS))?.bytes(&minimal_be(value as u128))?;
        }
        Err(_) => {
            e.tag(Tag::new(TAG_BIGNUM_NEG))?.bytes(&minimal_be((-1 - value) as u128))?;
        }
    }
    Ok(())
}

fn minimal_be(n: u128) -> Vec<u8> {
    let bytes = n.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    bytes[first..].to_vec()
}

// =============================================================================
// DECODING
// =============================================================================

/// Run `item` once per element of a definite or indefinite container
/// whose header (`len`) was just read.
pub(crate) fn for_each_item<'b, E, F>(
    d: &mut Decoder<'b>,
    len: Option<u64>,
    mut item: F,
) -> Result<(), E>
where
    E: From<decode::Error>,
    F: FnMut(&mut Decoder<'b>) -> Result<(), E>,
{
    match len {
        Some(n) => {
            for _ in 0..n {
                item(d)?;
            }
        }
        None => {
            while d.datatype()? != Type::Break {
                item(d)?;
            }
            // The break marker is a single byte.
            d.set_position(d.position() + 1);
        }
    }
    Ok(())
}

fn read(d: &mut Decoder<'_>, depth: usize) -> Result<PlutusData, PlutusError> {
    if depth > MAX_DEPTH {
        return Err(PlutusError::TooDeep);
    }
    match d.datatype()? {
        Type::U8
        | Type::U16
        | Type::U32
        | Type::U64
        | Type::I8
        | Type::I16
        | Type::I32
        | Type::I64
        | Type::Int => Ok(PlutusData::Int(i128::from(d.int()?))),
        Type::Bytes | Type::BytesIndef => read_bytes(d).map(PlutusData::Bytes),
        Type::Array | Type::ArrayIndef => read_list(d, depth).map(PlutusData::List),
        Type::Map | Type::MapIndef => {
            let len = d.map()?;
            let mut entries = Vec::new();
            for_each_item(d, len, |d| {
                let key = read(d, depth + 1)?;
                let value = read(d, depth + 1)?;
                entries.push((key, value));
                Ok::<_, PlutusError>(())
            })?;
            Ok(PlutusData::Map(entries))
        }
        Type::Tag => read_tagged(d, depth),
        Type::String | Type::StringIndef => Err(PlutusError::NotPlutusData("text string")),
        _ => Err(PlutusError::NotPlutusData("simple value")),
    }
}

fn read_bytes(d: &mut Decoder<'_>) -> Result<Vec<u8>, PlutusError> {
    let mut out = Vec::new();
    for chunk in d.bytes_iter()? {
        out.extend_from_slice(chunk?);
    }
    Ok(out)
}

fn read_list(d: &mut Decoder<'_>, depth: usize) -> Result<Vec<PlutusData>, PlutusError> {
    if !matches!(d.datatype()?, Type::Array | Type::ArrayIndef) {
        return Err(PlutusError::NotPlutusData("expected an array"));
    }
    let len = d.array()?;
    let mut items = Vec::new();
    for_each_item(d, len, |d| {
        items.push(read(d, depth + 1)?);
        Ok::<_, PlutusError>(())
    })?;
    Ok(items)
}

fn read_tagged(d: &mut Decoder<'_>, depth: usize) -> Result<PlutusData, PlutusError> {
    let tag = d.tag()?.as_u64();
    match tag {
        TAG_BIGNUM_POS => {
            let magnitude = bignum_magnitude(&read_bytes(d)?)?;
            i128::try_from(magnitude)
                .map(PlutusData::Int)
                .map_err(|_| PlutusError::IntegerTooLarge)
        }
        TAG_BIGNUM_NEG => {
            let magnitude = bignum_magnitude(&read_bytes(d)?)?;
            i128::try_from(magnitude)
                .map(|n| PlutusData::Int(-1 - n))
                .map_err(|_| PlutusError::IntegerTooLarge)
        }
        TAG_CONSTR_SMALL..=127 => Ok(PlutusData::Constr(
            tag - TAG_CONSTR_SMALL,
            read_list(d, depth)?,
        )),
        TAG_CONSTR_LARGE..=1400 => Ok(PlutusData::Constr(
            tag - TAG_CONSTR_LARGE + 7,
            read_list(d, depth)?,
        )),
        TAG_CONSTR_GENERAL => {
            if d.array()? != Some(2) {
                return Err(PlutusError::NotPlutusData("malformed general constructor"));
            }
            let index = d.u64()?;
            Ok(PlutusData::Constr(index, read_list(d, depth)?))
        }
        _ => Err(PlutusError::NotPlutusData("unknown tag")),
    }
}

fn bignum_magnitude(bytes: &[u8]) -> Result<u128, PlutusError> {
    let significant: &[u8] = match bytes.iter().position(|b| *b != 0) {
        Some(first) => &bytes[first..],
        None => &[],
    };
    if significant.len() > 16 {
        return Err(PlutusError::IntegerTooLarge);
    }
    Ok(significant.iter().fold(0u128, |acc, b| (acc << 8) | *b as u128))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(f: impl FnOnce(&mut Encoder<Vec<u8>>) -> Result<(), encode::Error<Infallible>>) -> Vec<u8> {
        let mut e = Encoder::new(Vec::new());
        f(&mut e).unwrap();
        e.into_writer()
    }

    #[test]
    fn test_small_constructor_encoding() {
        let data = PlutusData::constr(0, vec![PlutusData::Int(1), PlutusData::Bytes(vec![0xab])]);
        // d8 79 = tag 121, 9f ... ff = indefinite array
        assert_eq!(data.to_hex().unwrap(), "d8799f0141abff");
        assert_eq!(PlutusData::from_hex("d8799f0141abff").unwrap(), data);
    }

    #[test]
    fn test_empty_fields_are_definite() {
        assert_eq!(PlutusData::constr(1, vec![]).to_hex().unwrap(), "d87a80");
        assert_eq!(PlutusData::List(vec![]).to_hex().unwrap(), "80");
    }

    #[test]
    fn test_constructor_index_ranges() {
        for index in [0u64, 6, 7, 127, 128, 5000] {
            let data = PlutusData::constr(index, vec![PlutusData::Int(index as i128)]);
            let decoded = PlutusData::from_cbor(&data.to_cbor().unwrap()).unwrap();
            assert_eq!(decoded.as_constr().map(|(i, _)| i), Some(index));
        }
        // index 7 uses tag 1280 (d9 0500)
        assert!(PlutusData::constr(7, vec![]).to_hex().unwrap().starts_with("d90500"));
        // index 128 uses the general form: tag 102, [128, []]
        assert_eq!(PlutusData::constr(128, vec![]).to_hex().unwrap(), "d86682188080");
    }

    #[test]
    fn test_long_bytes_are_chunked() {
        let payload = vec![7u8; 100];
        let encoded = PlutusData::Bytes(payload.clone()).to_cbor().unwrap();
        assert_eq!(encoded[0], 0x5f);
        assert_eq!(&encoded[1..3], &[0x58, 64]);
        assert_eq!(*encoded.last().unwrap(), 0xff);
        assert_eq!(PlutusData::from_cbor(&encoded).unwrap(), PlutusData::Bytes(payload));
    }

    #[test]
    fn test_integer_boundaries() {
        for value in [
            0i128,
            -1,
            23,
            -24,
            u64::MAX as i128,
            u64::MAX as i128 + 1,
            -(u64::MAX as i128) - 1,
            -(u64::MAX as i128) - 2,
            i128::MAX,
            i128::MIN,
        ] {
            let decoded = PlutusData::from_cbor(&PlutusData::Int(value).to_cbor().unwrap()).unwrap();
            assert_eq!(decoded, PlutusData::Int(value), "value {}", value);
        }
        // 2^64 needs a bignum: tag 2, 9-byte string
        let big = PlutusData::Int(u64::MAX as i128 + 1).to_cbor().unwrap();
        assert_eq!(&big[..2], &[0xc2, 0x49]);
    }

    #[test]
    fn test_oversized_bignum_rejected() {
        let bytes = encoded(|e| {
            e.tag(Tag::new(2))?.bytes(&[1u8; 17])?;
            Ok(())
        });
        assert!(matches!(
            PlutusData::from_cbor(&bytes),
            Err(PlutusError::IntegerTooLarge)
        ));
    }

    #[test]
    fn test_text_is_not_plutus_data() {
        let bytes = encoded(|e| {
            e.str("doom")?;
            Ok(())
        });
        assert!(matches!(
            PlutusData::from_cbor(&bytes),
            Err(PlutusError::NotPlutusData(_))
        ));
    }

    #[test]
    fn test_map_roundtrip() {
        let data = PlutusData::Map(vec![(PlutusData::Bytes(vec![1]), PlutusData::Int(-5))]);
        assert_eq!(PlutusData::from_cbor(&data.to_cbor().unwrap()).unwrap(), data);
    }

    #[test]
    fn test_malformed_input_rejected() {
        // truncated indefinite list, stray break, trailing byte
        assert!(matches!(PlutusData::from_hex("9f01"), Err(PlutusError::Cbor(_))));
        assert!(PlutusData::from_hex("ff").is_err());
        assert!(matches!(PlutusData::from_hex("0101"), Err(PlutusError::TrailingBytes)));
    }

    #[test]
    fn test_depth_limit() {
        let nested = "81".repeat(MAX_DEPTH + 2) + "00";
        assert!(matches!(PlutusData::from_hex(&nested), Err(PlutusError::TooDeep)));
        let shallow = "81".repeat(10) + "00";
        assert!(PlutusData::from_hex(&shallow).is_ok());
    }
}
