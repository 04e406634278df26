use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Generate an ed25519 keypair for signing audit blocks
pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let mut csprng = rand::rngs::OsRng;
    let secret = SigningKey::generate(&mut csprng);
    let public = secret.verifying_key();
    (secret, public)
}

/// Lowercase hex SHA-256 of some bytes
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

/// Compact JSON serialization; struct fields keep declaration order.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(value)
}

/// SHA-256 of the canonical JSON serialization of a value
pub fn hash_canonical<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    Ok(sha256_hex(canonical_json(value)?))
}

/// Milliseconds since the unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Shorten an identifier or hash for log output
pub(crate) fn abbreviate(value: &str, len: usize) -> &str {
    match value.char_indices().nth(len) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sha256_hex("").len(), 64);
    }

    #[test]
    fn test_abbreviate() {
        assert_eq!(abbreviate("0123456789", 4), "0123");
        assert_eq!(abbreviate("01", 4), "01");
    }
}
