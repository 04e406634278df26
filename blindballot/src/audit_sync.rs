//! Device-side tracking of which audit blocks have reached the transparency server.

use crate::*;

/// Somewhere a device can submit its audit blocks
pub trait AuditSyncTarget {
    fn sync(&self, blocks: &[AuditBlock]) -> Result<SyncReport, Error>;
}

impl<S: AuditStore + Default> AuditSyncTarget for TransparencyLedger<S> {
    fn sync(&self, blocks: &[AuditBlock]) -> Result<SyncReport, Error> {
        TransparencyLedger::sync(self, blocks)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChainSyncState {
    pub total: usize,
    pub synced: usize,
    pub pending: usize,
    pub last_synced_block: Option<u64>,
    pub is_fully_synced: bool,
}

/// Result of one synchronization attempt
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub success: bool,
    pub synced: usize,
    pub pending: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<S: AuditStore> AuditChain<S> {
    /// Blocks not yet accepted by the transparency server, in chain order
    pub fn pending_blocks(&self) -> Result<Vec<AuditBlock>, Error> {
        let synced = self.store().synced_indices()?;
        Ok(self
            .blocks()?
            .into_iter()
            .filter(|b| !synced.contains(&b.index()))
            .collect())
    }

    pub fn sync_status(&self) -> Result<ChainSyncState, Error> {
        let total = self.store().block_count()?;
        let synced = self.store().synced_indices()?;
        let pending = total - synced.len();

        Ok(ChainSyncState {
            total,
            synced: synced.len(),
            pending,
            last_synced_block: synced.iter().next_back().copied(),
            is_fully_synced: pending == 0,
        })
    }

    /// Submit every pending block and mark the accepted ones as synced.
    ///
    /// A target that cannot be reached leaves everything pending for the next attempt.
    pub fn synchronize<T: AuditSyncTarget + ?Sized>(&self, target: &T) -> Result<SyncOutcome, Error> {
        let pending = self.pending_blocks()?;
        if pending.is_empty() {
            debug!("audit sync: nothing to send");
            return Ok(SyncOutcome {
                success: true,
                synced: 0,
                pending: 0,
                error: None,
            });
        }

        let report = match target.sync(&pending) {
            Ok(report) => report,
            Err(e) => {
                warn!("audit sync: {} blocks left pending: {}", pending.len(), e);
                return Ok(SyncOutcome {
                    success: false,
                    synced: 0,
                    pending: pending.len(),
                    error: Some(e.to_string()),
                });
            }
        };

        let mut synced = 0;
        for status in &report.per_block_status {
            if status.status == SyncStatus::Accepted && self.store().mark_synced(status.index)? {
                synced += 1;
            }
        }

        let error = report
            .per_block_status
            .iter()
            .find_map(|status| status.reason.clone());
        let remaining = self.sync_status()?.pending;
        info!("audit sync: {} blocks synced, {} pending", synced, remaining);

        Ok(SyncOutcome {
            success: report.success && remaining == 0,
            synced,
            pending: remaining,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Offline;

    impl AuditSyncTarget for Offline {
        fn sync(&self, _blocks: &[AuditBlock]) -> Result<SyncReport, Error> {
            Err(Error::Store("connection refused".to_owned()))
        }
    }

    fn device(n: usize) -> (AuditChain<MemStore>, AuditSigner) {
        let chain = AuditChain::new(MemStore::new());
        let signer = AuditSigner::generate();
        for i in 0..n {
            chain
                .append_block(AuditAction::VoteCast, &json!({ "n": i }), &signer, None)
                .unwrap();
        }
        (chain, signer)
    }

    #[test]
    fn test_synchronize_sends_only_pending() {
        let (chain, signer) = device(2);
        let ledger = TransparencyLedger::<MemStore>::new();
        ledger
            .register_key(signer.key_id(), &signer.public_key_hex())
            .unwrap();

        let status = chain.sync_status().unwrap();
        assert_eq!(status.pending, 2);
        assert!(!status.is_fully_synced);
        assert_eq!(status.last_synced_block, None);

        let outcome = chain.synchronize(&ledger).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.synced, 2);
        assert_eq!(outcome.pending, 0);
        assert!(chain.pending_blocks().unwrap().is_empty());

        // Nothing left to send
        let outcome = chain.synchronize(&ledger).unwrap();
        assert_eq!(outcome.synced, 0);
        assert!(outcome.success);

        chain
            .append_block(AuditAction::ElectionClosed, &json!({}), &signer, None)
            .unwrap();
        assert_eq!(chain.pending_blocks().unwrap().len(), 1);
        let outcome = chain.synchronize(&ledger).unwrap();
        assert_eq!(outcome.synced, 1);

        let status = chain.sync_status().unwrap();
        assert_eq!(
            status,
            ChainSyncState {
                total: 3,
                synced: 3,
                pending: 0,
                last_synced_block: Some(2),
                is_fully_synced: true,
            }
        );
        assert_eq!(ledger.signer_chain(signer.key_id()).unwrap().len(), 3);
    }

    #[test]
    fn test_synchronize_keeps_rejected_pending() {
        let (chain, signer) = device(2);

        let outcome = chain.synchronize(&Offline).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.pending, 2);
        assert!(outcome.error.unwrap().contains("connection refused"));

        // Unregistered signer: every block is rejected
        let ledger = TransparencyLedger::<MemStore>::new();
        let outcome = chain.synchronize(&ledger).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.synced, 0);
        assert_eq!(outcome.pending, 2);
        assert!(outcome.error.is_some());

        ledger
            .register_key(signer.key_id(), &signer.public_key_hex())
            .unwrap();
        let outcome = chain.synchronize(&ledger).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.synced, 2);
        assert!(chain.sync_status().unwrap().is_fully_synced);
    }
}
