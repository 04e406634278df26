use crate::*;
use num_bigint::BigUint;
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

/// Census issuance state, keyed by voter id
pub trait EligibilityStore {
    /// Atomically mark a voter as issued.
    ///
    /// Returns `false` without changing anything if the voter was already marked.
    fn mark_issued(&self, voter_id: &str) -> Result<bool, Error>;

    fn is_issued(&self, voter_id: &str) -> Result<bool, Error>;

    fn issued_count(&self) -> Result<usize, Error>;
}

/// Burned tokens and deposited votes for the urn
pub trait TokenLedger {
    fn is_burned(&self, token: &BigUint) -> Result<bool, Error>;

    /// Atomically burn a token and append its vote record.
    ///
    /// Returns `false`, recording nothing, if the token was already burned.
    fn burn_and_record(&self, token: &BigUint, record: VoteRecord) -> Result<bool, Error>;

    fn find_record(&self, receipt_hash: &str) -> Result<Option<VoteRecord>, Error>;

    /// All vote records, in deposit order
    fn records(&self) -> Result<Vec<VoteRecord>, Error>;

    fn record_count(&self) -> Result<usize, Error>;

    /// Atomically mark an election as closed.
    ///
    /// Returns `false` if it was already closed.
    fn mark_closed(&self, election_id: &str) -> Result<bool, Error>;

    fn closed_count(&self) -> Result<usize, Error>;
}

/// Append-only storage for audit blocks
pub trait AuditStore {
    fn last_block(&self) -> Result<Option<AuditBlock>, Error>;

    /// Append a block at the end of the chain.
    ///
    /// Returns `false`, appending nothing, if `block.index` is not the next index.
    fn append_block(&self, block: AuditBlock) -> Result<bool, Error>;

    fn block(&self, index: u64) -> Result<Option<AuditBlock>, Error>;

    fn blocks(&self) -> Result<Vec<AuditBlock>, Error>;

    fn block_count(&self) -> Result<usize, Error>;

    /// Record that the transparency server accepted a stored block.
    ///
    /// Returns `false` if there is no block at `index` or it was already marked.
    fn mark_synced(&self, index: u64) -> Result<bool, Error>;

    fn synced_indices(&self) -> Result<BTreeSet<u64>, Error>;
}

#[derive(Default)]
struct VoteLedger {
    burned: BTreeSet<BigUint>,
    records: Vec<VoteRecord>,
    closed: BTreeSet<String>,
}

#[derive(Default)]
struct AuditLog {
    blocks: Vec<AuditBlock>,
    synced: BTreeSet<u64>,
}

/// A simple store that keeps everything in memory behind mutexes
#[derive(Default)]
pub struct MemStore {
    issued: Mutex<BTreeSet<String>>,
    ledger: Mutex<VoteLedger>,
    audit: Mutex<AuditLog>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, Error> {
    mutex
        .lock()
        .map_err(|_| Error::Store("memory store lock poisoned".to_owned()))
}

impl EligibilityStore for MemStore {
    fn mark_issued(&self, voter_id: &str) -> Result<bool, Error> {
        Ok(lock(&self.issued)?.insert(voter_id.to_owned()))
    }

    fn is_issued(&self, voter_id: &str) -> Result<bool, Error> {
        Ok(lock(&self.issued)?.contains(voter_id))
    }

    fn issued_count(&self) -> Result<usize, Error> {
        Ok(lock(&self.issued)?.len())
    }
}

impl TokenLedger for MemStore {
    fn is_burned(&self, token: &BigUint) -> Result<bool, Error> {
        Ok(lock(&self.ledger)?.burned.contains(token))
    }

    fn burn_and_record(&self, token: &BigUint, record: VoteRecord) -> Result<bool, Error> {
        let mut ledger = lock(&self.ledger)?;
        if !ledger.burned.insert(token.clone()) {
            return Ok(false);
        }
        ledger.records.push(record);
        Ok(true)
    }

    fn find_record(&self, receipt_hash: &str) -> Result<Option<VoteRecord>, Error> {
        let ledger = lock(&self.ledger)?;
        Ok(ledger
            .records
            .iter()
            .find(|r| r.receipt_hash == receipt_hash)
            .cloned())
    }

    fn records(&self) -> Result<Vec<VoteRecord>, Error> {
        Ok(lock(&self.ledger)?.records.clone())
    }

    fn record_count(&self) -> Result<usize, Error> {
        Ok(lock(&self.ledger)?.records.len())
    }

    fn mark_closed(&self, election_id: &str) -> Result<bool, Error> {
        Ok(lock(&self.ledger)?.closed.insert(election_id.to_owned()))
    }

    fn closed_count(&self) -> Result<usize, Error> {
        Ok(lock(&self.ledger)?.closed.len())
    }
}

impl AuditStore for MemStore {
    fn last_block(&self) -> Result<Option<AuditBlock>, Error> {
        Ok(lock(&self.audit)?.blocks.last().cloned())
    }

    fn append_block(&self, block: AuditBlock) -> Result<bool, Error> {
        let mut log = lock(&self.audit)?;
        if block.payload.index != log.blocks.len() as u64 {
            return Ok(false);
        }
        log.blocks.push(block);
        Ok(true)
    }

    fn block(&self, index: u64) -> Result<Option<AuditBlock>, Error> {
        Ok(lock(&self.audit)?.blocks.get(index as usize).cloned())
    }

    fn blocks(&self) -> Result<Vec<AuditBlock>, Error> {
        Ok(lock(&self.audit)?.blocks.clone())
    }

    fn block_count(&self) -> Result<usize, Error> {
        Ok(lock(&self.audit)?.blocks.len())
    }

    fn mark_synced(&self, index: u64) -> Result<bool, Error> {
        let mut log = lock(&self.audit)?;
        if index >= log.blocks.len() as u64 {
            return Ok(false);
        }
        Ok(log.synced.insert(index))
    }

    fn synced_indices(&self) -> Result<BTreeSet<u64>, Error> {
        Ok(lock(&self.audit)?.synced.clone())
    }
}

impl From<Vec<AuditBlock>> for MemStore {
    fn from(blocks: Vec<AuditBlock>) -> Self {
        MemStore {
            audit: Mutex::new(AuditLog {
                blocks,
                synced: BTreeSet::new(),
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(receipt: &str) -> VoteRecord {
        VoteRecord {
            receipt_hash: receipt.to_owned(),
            option: "A".to_owned(),
            timestamp: 1,
        }
    }

    #[test]
    fn test_eligibility() {
        let store = MemStore::new();
        assert!(!store.is_issued("V1").unwrap());
        assert!(store.mark_issued("V1").unwrap());
        assert!(!store.mark_issued("V1").unwrap());
        assert!(store.is_issued("V1").unwrap());
        assert_eq!(store.issued_count().unwrap(), 1);
    }

    #[test]
    fn test_burn_and_record() {
        let store = MemStore::new();
        let token = BigUint::from(42u32);

        assert!(store.burn_and_record(&token, record("aa")).unwrap());
        assert!(store.is_burned(&token).unwrap());

        // A second burn of the same token appends nothing
        assert!(!store.burn_and_record(&token, record("bb")).unwrap());
        assert_eq!(store.record_count().unwrap(), 1);
        assert!(store.find_record("aa").unwrap().is_some());
        assert!(store.find_record("bb").unwrap().is_none());

        assert!(store.mark_closed("E1").unwrap());
        assert!(!store.mark_closed("E1").unwrap());
        assert_eq!(store.closed_count().unwrap(), 1);
    }
}
