use ed25519_dalek::{Signature, SignatureError, VerifyingKey};
use num_bigint::BigUint;
use std::borrow::Cow;
use std::convert::Infallible;

pub use hex_buffer_serde::Hex;

// a single-purpose type for use in `#[serde(with)]`
// Written as the big-endian bytes of the integer, so the hex is always of even length.
pub enum BigUintHex {}

impl Hex<BigUint> for BigUintHex {
    type Error = Infallible;

    fn create_bytes(value: &BigUint) -> Cow<'_, [u8]> {
        Cow::Owned(value.to_bytes_be())
    }

    fn from_bytes(bytes: &[u8]) -> Result<BigUint, Self::Error> {
        Ok(BigUint::from_bytes_be(bytes))
    }
}

// a single-purpose type for use in `#[serde(with)]`
pub enum SignatureHex {}

impl Hex<Signature> for SignatureHex {
    type Error = SignatureError;

    fn create_bytes(sig: &Signature) -> Cow<'_, [u8]> {
        Cow::Owned(sig.to_bytes().to_vec())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Signature, Self::Error> {
        Signature::from_slice(bytes)
    }
}

// a single-purpose type for use in `#[serde(with)]`
pub enum VerifyingKeyHex {}

impl Hex<VerifyingKey> for VerifyingKeyHex {
    type Error = SignatureError;

    fn create_bytes(key: &VerifyingKey) -> Cow<'_, [u8]> {
        Cow::Borrowed(key.as_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Result<VerifyingKey, Self::Error> {
        VerifyingKey::try_from(bytes)
    }
}

// a single-purpose type for use in `#[serde(with)]`
pub enum BytesHex {}

impl Hex<Vec<u8>> for BytesHex {
    type Error = Infallible;

    fn create_bytes(bytes: &Vec<u8>) -> Cow<'_, [u8]> {
        Cow::Borrowed(bytes)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Vec<u8>, Self::Error> {
        Ok(bytes.to_vec())
    }
}

/// Parse a hex-encoded ed25519 verifying key
pub fn verifying_key_from_hex(public_key_hex: &str) -> Result<VerifyingKey, crate::Error> {
    let bytes = hex::decode(public_key_hex.trim())
        .map_err(|e| crate::Error::MalformedInput(format!("invalid public key hex: {}", e)))?;
    Ok(VerifyingKeyHex::from_bytes(&bytes)?)
}
