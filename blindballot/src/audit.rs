use crate::*;
use aes_gcm::aead::{generic_array::GenericArray, Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use serde::Serialize;
use sha2::Sha256;
use std::sync::Mutex;
use uuid::Uuid;

/// `previousHash` of the first block in a chain
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const AES_NONCE_LENGTH: usize = 12;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    VoteCast,
    VoteAlteredAttempt,
    RecordDeleted,
    ElectionClosed,
}

/// AES-256-GCM ciphertext and its nonce: an evidence vault, or a wrapped signing key
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SealedBox {
    #[serde(with = "BytesHex")]
    pub ciphertext: Vec<u8>,

    #[serde(with = "BytesHex")]
    pub nonce: Vec<u8>,
}

/// AES-256 key for sealed boxes. Never leaves the device that owns it.
pub struct SealingKey([u8; 32]);

impl SealingKey {
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        SealingKey(key)
    }

    /// Expand a purpose-bound subkey from high-entropy key material with HKDF-SHA256.
    ///
    /// Not for human-chosen secrets: PINs go through the `KeyVault`.
    pub fn derive(master: &[u8], info: &[u8]) -> Result<Self, Error> {
        let h = Hkdf::<Sha256>::new(None, master);
        let mut key = [0u8; 32];
        h.expand(info, &mut key)
            .map_err(|_| Error::MalformedInput("invalid sealing key length".to_owned()))?;
        Ok(SealingKey(key))
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedBox, Error> {
        let aead = Aes256Gcm::new(GenericArray::from_slice(&self.0));

        let mut nonce = [0u8; AES_NONCE_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = aead
            .encrypt(GenericArray::from_slice(&nonce), plaintext)
            .map_err(Error::Aead)?;

        Ok(SealedBox {
            ciphertext,
            nonce: nonce.to_vec(),
        })
    }

    pub fn open(&self, sealed: &SealedBox) -> Result<Vec<u8>, Error> {
        if sealed.nonce.len() != AES_NONCE_LENGTH {
            return Err(Error::MalformedInput(format!(
                "nonce must be {} bytes",
                AES_NONCE_LENGTH
            )));
        }

        let aead = Aes256Gcm::new(GenericArray::from_slice(&self.0));
        aead.decrypt(GenericArray::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
            .map_err(Error::Aead)
    }
}

/// Exactly the fields covered by a block's signature
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignablePayload {
    pub index: u64,
    pub timestamp: u64,
    pub action: AuditAction,
    pub signer_key_id: String,
    pub payload_hash: String,
    pub previous_hash: String,
    pub evidence_vault: Option<SealedBox>,
}

/// One signed, hash-linked entry of an audit chain
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AuditBlock {
    #[serde(flatten)]
    pub payload: SignablePayload,

    #[serde(with = "SignatureHex")]
    pub signature: Signature,

    pub hash: String,
}

// The block as it is hashed: every field except the hash itself
#[derive(Serialize)]
struct HashedBlock<'a> {
    #[serde(flatten)]
    payload: &'a SignablePayload,
    signature: String,
}

impl AuditBlock {
    pub fn index(&self) -> u64 {
        self.payload.index
    }

    /// Recompute the block hash from its stored fields
    pub fn compute_hash(&self) -> Result<String, Error> {
        let hashed = HashedBlock {
            payload: &self.payload,
            signature: hex::encode(self.signature.to_bytes()),
        };
        Ok(hash_canonical(&hashed)?)
    }

    /// Verify the signature over the canonical payload
    pub fn verify_signature(&self, public_key: &VerifyingKey) -> Result<(), Error> {
        let message = canonical_json(&self.payload)?;
        public_key.verify(message.as_bytes(), &self.signature)?;
        Ok(())
    }
}

/// An audit signing key and its id
pub struct AuditSigner {
    key_id: String,
    signing_key: SigningKey,
}

impl AuditSigner {
    /// Generate a fresh keypair under a random key id
    pub fn generate() -> Self {
        let (signing_key, _) = generate_keypair();
        AuditSigner {
            key_id: Uuid::new_v4().to_string(),
            signing_key,
        }
    }

    pub fn from_key(key_id: impl Into<String>, signing_key: SigningKey) -> Self {
        AuditSigner {
            key_id: key_id.into(),
            signing_key,
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key().as_bytes())
    }

    pub fn sign(&self, payload: &SignablePayload) -> Result<Signature, Error> {
        let message = canonical_json(payload)?;
        Ok(self.signing_key.sign(message.as_bytes()))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainIssueKind {
    ChainBreak,
    HashMismatch,
    InvalidSignature,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChainIssue {
    #[serde(rename = "type")]
    pub kind: ChainIssueKind,
    pub block_index: u64,
    pub message: String,
}

/// Integrity report for a chain. Problems are reported, never repaired.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChainVerification {
    pub valid: bool,
    pub block_count: usize,
    pub errors: Vec<ChainIssue>,
}

impl ChainVerification {
    pub(crate) fn from_issues(block_count: usize, errors: Vec<ChainIssue>) -> Self {
        ChainVerification {
            valid: errors.is_empty(),
            block_count,
            errors,
        }
    }
}

/// Check the hash links between blocks and recompute every block's hash.
///
/// `blockIndex` in the report is the position in `blocks`.
pub fn verify_chain(blocks: &[AuditBlock]) -> ChainVerification {
    let mut errors = Vec::new();

    for (i, block) in blocks.iter().enumerate() {
        let position = i as u64;

        let expected_previous = match i {
            0 => GENESIS_HASH,
            _ => blocks[i - 1].hash.as_str(),
        };
        if block.payload.previous_hash != expected_previous {
            let message = match i {
                0 => "first block does not link to the genesis hash".to_owned(),
                _ => format!("broken link between block {} and {}", i - 1, i),
            };
            errors.push(ChainIssue {
                kind: ChainIssueKind::ChainBreak,
                block_index: position,
                message,
            });
        }

        let hash_matches = match block.compute_hash() {
            Ok(hash) => hash == block.hash,
            Err(_) => false,
        };
        if !hash_matches {
            errors.push(ChainIssue {
                kind: ChainIssueKind::HashMismatch,
                block_index: position,
                message: format!("hash of block {} does not match its contents", i),
            });
        }
    }

    ChainVerification::from_issues(blocks.len(), errors)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChainStats {
    pub total_blocks: usize,
    pub votes: usize,
    pub alterations: usize,
    pub deletions: usize,
    pub last_block_time: Option<u64>,
}

/// An append-only, signed, hash-linked ledger of protocol actions.
///
/// Appends are serialized so that each block links to the one before it.
pub struct AuditChain<S: AuditStore> {
    store: S,
    evidence_key: Option<SealingKey>,
    append_lock: Mutex<()>,
}

impl<S: AuditStore> AuditChain<S> {
    pub fn new(store: S) -> Self {
        AuditChain {
            store,
            evidence_key: None,
            append_lock: Mutex::new(()),
        }
    }

    pub fn with_evidence_key(mut self, key: SealingKey) -> Self {
        self.evidence_key = Some(key);
        self
    }

    /// Record an action.
    ///
    /// `previous_state` is the state the action supersedes or deletes. It is sealed in the
    /// block's evidence vault and requires an evidence key.
    pub fn append_block<P: Serialize + ?Sized>(
        &self,
        action: AuditAction,
        payload: &P,
        signer: &AuditSigner,
        previous_state: Option<&serde_json::Value>,
    ) -> Result<AuditBlock, Error> {
        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| Error::Store("audit append lock poisoned".to_owned()))?;

        let (index, previous_hash) = match self.store.last_block()? {
            Some(last) => (last.index() + 1, last.hash),
            None => (0, GENESIS_HASH.to_owned()),
        };

        let evidence_vault = match previous_state {
            Some(state) => {
                let key = self.evidence_key.as_ref().ok_or(Error::EvidenceKeyMissing)?;
                Some(key.seal(canonical_json(state)?.as_bytes())?)
            }
            None => None,
        };

        let payload = SignablePayload {
            index,
            timestamp: now_millis(),
            action,
            signer_key_id: signer.key_id().to_owned(),
            payload_hash: hash_canonical(payload)?,
            previous_hash,
            evidence_vault,
        };

        let signature = signer.sign(&payload)?;
        let mut block = AuditBlock {
            payload,
            signature,
            hash: String::new(),
        };
        block.hash = block.compute_hash()?;

        if !self.store.append_block(block.clone())? {
            return Err(Error::Store(format!(
                "audit block {} conflicts with the stored chain",
                index
            )));
        }

        debug!(
            "audit: block {} appended ({:?}), hash {}...",
            index,
            action,
            abbreviate(&block.hash, 16)
        );

        Ok(block)
    }

    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    pub fn blocks(&self) -> Result<Vec<AuditBlock>, Error> {
        self.store.blocks()
    }

    pub fn verify(&self) -> Result<ChainVerification, Error> {
        Ok(verify_chain(&self.store.blocks()?))
    }

    /// Recover the superseded state sealed in a block, if it has one
    pub fn decrypt_evidence(&self, block: &AuditBlock) -> Result<Option<serde_json::Value>, Error> {
        let vault = match &block.payload.evidence_vault {
            Some(vault) => vault,
            None => return Ok(None),
        };

        let key = self.evidence_key.as_ref().ok_or(Error::EvidenceKeyMissing)?;
        let plaintext = key.open(vault)?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    pub fn stats(&self) -> Result<ChainStats, Error> {
        let blocks = self.store.blocks()?;
        let count = |action: AuditAction| {
            blocks
                .iter()
                .filter(|b| b.payload.action == action)
                .count()
        };

        Ok(ChainStats {
            total_blocks: blocks.len(),
            votes: count(AuditAction::VoteCast),
            alterations: count(AuditAction::VoteAlteredAttempt),
            deletions: count(AuditAction::RecordDeleted),
            last_block_time: blocks.last().map(|b| b.payload.timestamp),
        })
    }
}
