//! PIN-protected storage for a device's audit signing keys.
//!
//! The PIN is stretched with PBKDF2-HMAC-SHA256 into a master key that only lives in memory
//! while the vault is unlocked. Signing keys are stored AES-256-GCM wrapped under a subkey of
//! it, and a second subkey seals the evidence vaults of the device's audit chain.

use crate::*;
use ed25519_dalek::{SigningKey, VerifyingKey};
use indexmap::IndexMap;
use rand::RngCore;
use sha2::Sha256;
use std::convert::TryFrom;

pub const PBKDF2_ITERATIONS: u32 = 100_000;

const SALT_LENGTH: usize = 16;
const CHECK_PLAINTEXT: &[u8] = b"blindballot key vault";

const CHECK_INFO: &[u8] = b"pin check";
const WRAPPING_INFO: &[u8] = b"key wrapping";
const EVIDENCE_INFO: &[u8] = b"evidence vault";

/// A signing key as the vault stores it
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredKey {
    pub id: String,

    #[serde(with = "VerifyingKeyHex")]
    pub public_key: VerifyingKey,

    pub wrapped_private_key: SealedBox,
    pub created_at: u64,
    pub usage_count: u64,
}

/// The public half of a stored key, for listing
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VaultKeyInfo {
    pub id: String,

    #[serde(with = "VerifyingKeyHex")]
    pub public_key: VerifyingKey,

    pub created_at: u64,
    pub usage_count: u64,
}

struct MasterKey([u8; 32]);

impl MasterKey {
    fn subkey(&self, info: &[u8]) -> Result<SealingKey, Error> {
        SealingKey::derive(&self.0, info)
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

fn stretch_pin(pin: &str, salt: &[u8], iterations: u32) -> Result<MasterKey, Error> {
    if pin.is_empty() {
        return Err(Error::MalformedInput("PIN is required".to_owned()));
    }
    let mut master = MasterKey([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(pin.as_bytes(), salt, iterations, &mut master.0);
    Ok(master)
}

/// Audit signing keys wrapped under a PIN.
///
/// Serializes to its locked form: salt, iteration count, a PIN check box and the wrapped keys.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyVault {
    #[serde(with = "BytesHex")]
    salt: Vec<u8>,

    iterations: u32,
    check: SealedBox,
    keys: IndexMap<String, StoredKey>,

    #[serde(skip)]
    master: Option<MasterKey>,
}

impl KeyVault {
    /// Create an empty vault, unlocked, under a fresh random salt
    pub fn create(pin: &str) -> Result<Self, Error> {
        Self::create_with_iterations(pin, PBKDF2_ITERATIONS)
    }

    pub fn create_with_iterations(pin: &str, iterations: u32) -> Result<Self, Error> {
        let mut salt = vec![0u8; SALT_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        let master = stretch_pin(pin, &salt, iterations)?;
        let check = master.subkey(CHECK_INFO)?.seal(CHECK_PLAINTEXT)?;

        Ok(KeyVault {
            salt,
            iterations,
            check,
            keys: IndexMap::new(),
            master: Some(master),
        })
    }

    pub fn unlock(&mut self, pin: &str) -> Result<(), Error> {
        let master = stretch_pin(pin, &self.salt, self.iterations)?;
        match master.subkey(CHECK_INFO)?.open(&self.check) {
            Ok(plaintext) if plaintext == CHECK_PLAINTEXT => {}
            _ => return Err(Error::InvalidPin),
        }
        self.master = Some(master);
        debug!("vault: unlocked ({} keys)", self.keys.len());
        Ok(())
    }

    /// Forget the master key until the next `unlock`
    pub fn lock(&mut self) {
        self.master = None;
    }

    pub fn is_unlocked(&self) -> bool {
        self.master.is_some()
    }

    pub fn has_keys(&self) -> bool {
        !self.keys.is_empty()
    }

    fn master(&self) -> Result<&MasterKey, Error> {
        self.master.as_ref().ok_or(Error::VaultLocked)
    }

    /// Generate a signing key, store it wrapped, and return its public key
    pub fn generate_key(&mut self, key_id: &str) -> Result<VerifyingKey, Error> {
        if key_id.is_empty() {
            return Err(Error::MalformedInput("keyId is required".to_owned()));
        }
        if self.keys.contains_key(key_id) {
            return Err(Error::MalformedInput(format!("key {} is already in the vault", key_id)));
        }

        let wrapping = self.master()?.subkey(WRAPPING_INFO)?;
        let (signing_key, public_key) = generate_keypair();

        let stored = StoredKey {
            id: key_id.to_owned(),
            public_key,
            wrapped_private_key: wrapping.seal(&signing_key.to_bytes())?,
            created_at: now_millis(),
            usage_count: 0,
        };
        self.keys.insert(key_id.to_owned(), stored);

        info!("vault: generated key {}", key_id);
        Ok(public_key)
    }

    /// Unwrap a stored key for signing, counting the use
    pub fn signer(&mut self, key_id: &str) -> Result<AuditSigner, Error> {
        let wrapping = self.master()?.subkey(WRAPPING_INFO)?;
        let stored = self
            .keys
            .get_mut(key_id)
            .ok_or_else(|| Error::UnknownSigner(key_id.to_owned()))?;

        let plaintext = wrapping.open(&stored.wrapped_private_key)?;
        let bytes = <[u8; 32]>::try_from(plaintext.as_slice())
            .map_err(|_| Error::MalformedInput("wrapped key has the wrong length".to_owned()))?;
        let signing_key = SigningKey::from_bytes(&bytes);

        if signing_key.verifying_key() != stored.public_key {
            return Err(Error::MalformedInput(format!(
                "wrapped key {} does not match its public key",
                key_id
            )));
        }

        stored.usage_count += 1;
        Ok(AuditSigner::from_key(key_id, signing_key))
    }

    /// Key for the evidence vaults of this device's audit chain
    pub fn evidence_key(&self) -> Result<SealingKey, Error> {
        self.master()?.subkey(EVIDENCE_INFO)
    }

    pub fn public_keys(&self) -> Vec<VaultKeyInfo> {
        self.keys
            .values()
            .map(|k| VaultKeyInfo {
                id: k.id.clone(),
                public_key: k.public_key,
                created_at: k.created_at,
                usage_count: k.usage_count,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ROUNDS: u32 = 10;

    #[test]
    fn test_pbkdf2_sha256() {
        // RFC 7914 section 11
        let mut out = [0u8; 64];
        pbkdf2::pbkdf2_hmac::<Sha256>(b"passwd", b"salt", 1, &mut out);
        assert_eq!(
            hex::encode(&out[..16]),
            "55ac046e56e3089fec1691c22544b605"
        );
    }

    #[test]
    fn test_unlock_and_sign() {
        let mut vault = KeyVault::create_with_iterations("123456", ROUNDS).unwrap();
        assert!(vault.is_unlocked());
        assert!(!vault.has_keys());

        let public = vault.generate_key("device-1").unwrap();
        assert!(vault.has_keys());

        let json = serde_json::to_string(&vault).unwrap();
        let mut restored: KeyVault = serde_json::from_str(&json).unwrap();
        assert!(!restored.is_unlocked());
        assert!(matches!(restored.signer("device-1"), Err(Error::VaultLocked)));

        assert!(matches!(restored.unlock("654321"), Err(Error::InvalidPin)));
        assert!(!restored.is_unlocked());
        restored.unlock("123456").unwrap();

        let signer = restored.signer("device-1").unwrap();
        assert_eq!(signer.verifying_key(), public);
        restored.signer("device-1").unwrap();
        assert_eq!(restored.public_keys()[0].usage_count, 2);

        assert!(matches!(restored.signer("device-2"), Err(Error::UnknownSigner(_))));
        assert!(restored.generate_key("device-1").is_err());

        restored.lock();
        assert!(matches!(restored.evidence_key(), Err(Error::VaultLocked)));
    }

    #[test]
    fn test_wrapped_key_is_not_plaintext() {
        let mut vault = KeyVault::create_with_iterations("123456", ROUNDS).unwrap();
        vault.generate_key("device-1").unwrap();
        let signer = vault.signer("device-1").unwrap();

        let json = serde_json::to_string(&vault).unwrap();
        assert!(!json.contains(&hex::encode(signer.signing_key().to_bytes())));
        assert!(KeyVault::create_with_iterations("", ROUNDS).is_err());
    }

    #[test]
    fn test_evidence_key_survives_relock() {
        let mut vault = KeyVault::create_with_iterations("2468", ROUNDS).unwrap();
        vault.generate_key("device-1").unwrap();
        let signer = vault.signer("device-1").unwrap();

        let chain = AuditChain::new(MemStore::new()).with_evidence_key(vault.evidence_key().unwrap());
        let block = chain
            .append_block(
                AuditAction::VoteAlteredAttempt,
                &json!({ "option": "B" }),
                &signer,
                Some(&json!({ "option": "A" })),
            )
            .unwrap();

        vault.lock();
        vault.unlock("2468").unwrap();
        let reader = AuditChain::new(MemStore::new()).with_evidence_key(vault.evidence_key().unwrap());
        assert_eq!(
            reader.decrypt_evidence(&block).unwrap(),
            Some(json!({ "option": "A" }))
        );

        // A vault under another salt cannot read it, even with the same PIN
        let other = KeyVault::create_with_iterations("2468", ROUNDS).unwrap();
        let outsider = AuditChain::new(MemStore::new()).with_evidence_key(other.evidence_key().unwrap());
        assert!(outsider.decrypt_evidence(&block).is_err());
    }
}
