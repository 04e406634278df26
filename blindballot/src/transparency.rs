//! Server-side ingestion of audit chains submitted by remote signers.

use crate::*;
use ed25519_dalek::VerifyingKey;
use indexmap::IndexMap;
use std::sync::{Mutex, MutexGuard, RwLock};

/// A public key registered for verifying audit blocks
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredKey {
    pub key_id: String,

    #[serde(with = "VerifyingKeyHex")]
    pub public_key: VerifyingKey,

    pub status: KeyStatus,
    pub registered_at: u64,
}

/// Audit signer keys by key id, in registration order
#[derive(Default)]
pub struct KeyRegistry {
    keys: RwLock<IndexMap<String, RegisteredKey>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a key as `ACTIVE`
    pub fn register(&self, key_id: &str, public_key: VerifyingKey) -> Result<KeyStatus, Error> {
        if key_id.is_empty() {
            return Err(Error::MalformedInput("keyId is required".to_owned()));
        }

        let record = RegisteredKey {
            key_id: key_id.to_owned(),
            public_key,
            status: KeyStatus::Active,
            registered_at: now_millis(),
        };
        self.write()?.insert(key_id.to_owned(), record);

        info!("transparency: key {} registered", key_id);
        Ok(KeyStatus::Active)
    }

    pub fn revoke(&self, key_id: &str) -> Result<(), Error> {
        let mut keys = self.write()?;
        let record = keys
            .get_mut(key_id)
            .ok_or_else(|| Error::UnknownSigner(key_id.to_owned()))?;
        record.status = KeyStatus::Revoked;

        warn!("transparency: key {} revoked", key_id);
        Ok(())
    }

    pub fn get(&self, key_id: &str) -> Result<Option<RegisteredKey>, Error> {
        Ok(self.read()?.get(key_id).cloned())
    }

    pub fn keys(&self) -> Result<Vec<RegisteredKey>, Error> {
        Ok(self.read()?.values().cloned().collect())
    }

    /// Check a block's signature against the registered key for its signer
    pub fn verify_block(&self, block: &AuditBlock) -> Result<(), Error> {
        let key_id = &block.payload.signer_key_id;
        let record = self
            .get(key_id)?
            .ok_or_else(|| Error::UnknownSigner(key_id.clone()))?;

        if record.status == KeyStatus::Revoked {
            return Err(Error::SignerRevoked);
        }

        block
            .verify_signature(&record.public_key)
            .map_err(|_| Error::InvalidSignature)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, IndexMap<String, RegisteredKey>>, Error> {
        self.keys
            .read()
            .map_err(|_| Error::Store("key registry lock poisoned".to_owned()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, IndexMap<String, RegisteredKey>>, Error> {
        self.keys
            .write()
            .map_err(|_| Error::Store("key registry lock poisoned".to_owned()))
    }
}

/// Check every block's signature against the registry
pub fn verify_chain_signatures(blocks: &[AuditBlock], registry: &KeyRegistry) -> ChainVerification {
    let errors = blocks
        .iter()
        .enumerate()
        .filter_map(|(i, block)| match registry.verify_block(block) {
            Ok(()) => None,
            Err(e) => Some(ChainIssue {
                kind: ChainIssueKind::InvalidSignature,
                block_index: i as u64,
                message: e.to_string(),
            }),
        })
        .collect();

    ChainVerification::from_issues(blocks.len(), errors)
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Accepted,
    Rejected,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockSyncStatus {
    pub index: u64,
    pub status: SyncStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub success: bool,
    pub per_block_status: Vec<BlockSyncStatus>,
    pub stored_blocks: usize,
}

/// One signer's stored chain with its structural verification
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignerChain {
    pub key_id: String,
    pub chain: Vec<AuditBlock>,
    pub verification: ChainVerification,
}

/// Every stored chain. `chain` lists all blocks grouped by signer, and `verification`
/// merges the per-signer reports.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChainReport {
    pub chain: Vec<AuditBlock>,
    pub chains: Vec<SignerChain>,
    pub verification: ChainVerification,
    pub total_blocks: usize,
}

// Issue indices stay relative to the signer's chain; the message names the signer
fn merge_verifications<'a, I>(reports: I) -> ChainVerification
where
    I: IntoIterator<Item = (&'a str, ChainVerification)>,
{
    let mut block_count = 0;
    let mut errors = Vec::new();
    for (key_id, report) in reports {
        block_count += report.block_count;
        errors.extend(report.errors.into_iter().map(|issue| ChainIssue {
            message: format!("{}: {}", key_id, issue.message),
            ..issue
        }));
    }
    ChainVerification::from_issues(block_count, errors)
}

/// The transparency server's copy of the audit chains of every registered signer.
///
/// Each signer key has its own chain starting at the genesis hash. Blocks are accepted
/// one by one, each only if its signer is registered and active, its signature and hash
/// verify, and it extends that signer's stored chain exactly.
pub struct TransparencyLedger<S: AuditStore + Default> {
    registry: KeyRegistry,
    chains: Mutex<IndexMap<String, S>>,
}

impl<S: AuditStore + Default> Default for TransparencyLedger<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: AuditStore + Default> TransparencyLedger<S> {
    pub fn new() -> Self {
        TransparencyLedger {
            registry: KeyRegistry::new(),
            chains: Mutex::new(IndexMap::new()),
        }
    }

    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    /// Register a hex-encoded ed25519 public key
    pub fn register_key(&self, key_id: &str, public_key_hex: &str) -> Result<KeyStatus, Error> {
        let public_key = verifying_key_from_hex(public_key_hex)?;
        self.registry.register(key_id, public_key)
    }

    pub fn revoke_key(&self, key_id: &str) -> Result<(), Error> {
        self.registry.revoke(key_id)
    }

    fn lock(&self) -> Result<MutexGuard<'_, IndexMap<String, S>>, Error> {
        self.chains
            .lock()
            .map_err(|_| Error::Store("transparency chains lock poisoned".to_owned()))
    }

    /// Ingest submitted blocks in order, accepting or rejecting each one
    pub fn sync(&self, blocks: &[AuditBlock]) -> Result<SyncReport, Error> {
        let mut chains = self.lock()?;

        let mut per_block_status = Vec::with_capacity(blocks.len());
        for block in blocks {
            let status = match self.ingest(&mut chains, block)? {
                Ok(()) => BlockSyncStatus {
                    index: block.index(),
                    status: SyncStatus::Accepted,
                    reason: None,
                },
                Err(reason) => {
                    warn!(
                        "transparency: block {} of {} rejected: {}",
                        block.index(),
                        block.payload.signer_key_id,
                        reason
                    );
                    BlockSyncStatus {
                        index: block.index(),
                        status: SyncStatus::Rejected,
                        reason: Some(reason),
                    }
                }
            };
            per_block_status.push(status);
        }

        let mut stored_blocks = 0;
        for store in chains.values() {
            stored_blocks += store.block_count()?;
        }

        Ok(SyncReport {
            success: per_block_status
                .iter()
                .all(|d| d.status == SyncStatus::Accepted),
            per_block_status,
            stored_blocks,
        })
    }

    // Outer error: storage failure. Inner error: rejection reason.
    fn ingest(
        &self,
        chains: &mut IndexMap<String, S>,
        block: &AuditBlock,
    ) -> Result<Result<(), String>, Error> {
        if let Err(e) = self.registry.verify_block(block) {
            return Ok(Err(e.to_string()));
        }

        match block.compute_hash() {
            Ok(hash) if hash == block.hash => {}
            _ => return Ok(Err("block hash does not match its contents".to_owned())),
        }

        let key_id = &block.payload.signer_key_id;

        let (expected_index, expected_previous) = match chains.get(key_id) {
            Some(store) => {
                // A block we already hold is accepted again without being stored twice
                if let Some(stored) = store.block(block.index())? {
                    if stored.hash == block.hash {
                        return Ok(Ok(()));
                    }
                    return Ok(Err(format!(
                        "block {} conflicts with the stored chain",
                        block.index()
                    )));
                }
                match store.last_block()? {
                    Some(last) => (last.index() + 1, last.hash),
                    None => (0, GENESIS_HASH.to_owned()),
                }
            }
            None => (0, GENESIS_HASH.to_owned()),
        };

        if block.index() != expected_index || block.payload.previous_hash != expected_previous {
            return Ok(Err(format!(
                "chain break: expected block {} linking to {}...",
                expected_index,
                abbreviate(&expected_previous, 16)
            )));
        }

        let store = chains.entry(key_id.clone()).or_insert_with(S::default);
        if !store.append_block(block.clone())? {
            return Ok(Err(format!("block {} conflicts with the stored chain", block.index())));
        }

        Ok(Ok(()))
    }

    /// The blocks stored for one signer
    pub fn signer_chain(&self, key_id: &str) -> Result<Vec<AuditBlock>, Error> {
        match self.lock()?.get(key_id) {
            Some(store) => store.blocks(),
            None => Ok(Vec::new()),
        }
    }

    /// Every stored chain with its structural verification
    pub fn chain(&self) -> Result<ChainReport, Error> {
        let stores = self.lock()?;

        let mut chains = Vec::with_capacity(stores.len());
        for (key_id, store) in stores.iter() {
            let chain = store.blocks()?;
            chains.push(SignerChain {
                key_id: key_id.clone(),
                verification: verify_chain(&chain),
                chain,
            });
        }

        let verification = merge_verifications(
            chains
                .iter()
                .map(|c| (c.key_id.as_str(), c.verification.clone())),
        );
        let chain: Vec<AuditBlock> = chains.iter().flat_map(|c| c.chain.clone()).collect();

        Ok(ChainReport {
            total_blocks: chain.len(),
            chain,
            chains,
            verification,
        })
    }

    /// Re-check the signature of every stored block against the current registry
    pub fn verify_signatures(&self) -> Result<ChainVerification, Error> {
        let stores = self.lock()?;

        let mut reports = Vec::with_capacity(stores.len());
        for (key_id, store) in stores.iter() {
            let report = verify_chain_signatures(&store.blocks()?, &self.registry);
            reports.push((key_id.as_str(), report));
        }

        Ok(merge_verifications(reports))
    }
}
