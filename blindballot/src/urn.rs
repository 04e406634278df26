use crate::*;
use num_bigint::BigUint;
use serde_json::Value;

/// The content of a vote as submitted to the urn.
///
/// Either a bare string naming the option, or an object whose `choice` field names it.
/// Any other fields of the object are kept and hashed into the receipt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(transparent)]
pub struct VoteContent(Value);

impl VoteContent {
    pub fn new(value: Value) -> Result<Self, Error> {
        let content = VoteContent(value);
        content.option()?;
        Ok(content)
    }

    /// The option this vote counts towards
    pub fn option(&self) -> Result<&str, Error> {
        let option = match &self.0 {
            Value::String(option) => option.as_str(),
            Value::Object(fields) => match fields.get("choice") {
                Some(Value::String(option)) => option.as_str(),
                _ => {
                    return Err(Error::MalformedInput(
                        "vote content object requires a string `choice`".to_owned(),
                    ))
                }
            },
            _ => {
                return Err(Error::MalformedInput(
                    "vote content must be a string or an object".to_owned(),
                ))
            }
        };

        if option.is_empty() {
            return Err(Error::MalformedInput("vote option is empty".to_owned()));
        }
        Ok(option)
    }

    /// SHA-256 of the compact JSON form of the content
    pub fn receipt_hash(&self) -> Result<String, Error> {
        Ok(hash_canonical(&self.0)?)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

impl From<&str> for VoteContent {
    fn from(option: &str) -> Self {
        VoteContent(Value::String(option.to_owned()))
    }
}

/// A deposited and verified vote. Holds nothing that links back to the token.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VoteRecord {
    pub receipt_hash: String,
    pub option: String,
    pub timestamp: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptStatus {
    pub found: bool,
    pub timestamp: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UrnStatus {
    Open,
    Closed,
}

/// Public urn statistics. The per-option breakdown is only revealed by the closing record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UrnStats {
    pub total_votes: usize,
    pub status: UrnStatus,
    pub timestamp: u64,
}

/// The anonymous ballot box.
///
/// It accepts any (content, token, signature) triple whose signature verifies under the
/// authority's public key, exactly once per token. It performs no identity check.
pub struct Urn<S: TokenLedger> {
    key: AuthorityPublicKey,
    store: S,
}

impl<S: TokenLedger> Urn<S> {
    pub fn new(key: AuthorityPublicKey, store: S) -> Self {
        Urn { key, store }
    }

    pub fn public_key(&self) -> &AuthorityPublicKey {
        &self.key
    }

    /// Deposit a vote, returning its receipt hash.
    pub fn submit_vote(
        &self,
        content: &VoteContent,
        token: &BigUint,
        signature: &BigUint,
    ) -> Result<String, Error> {
        let option = content.option()?.to_owned();
        let receipt_hash = content.receipt_hash()?;
        let token_hex = biguint_to_hex(token);

        if self.store.is_burned(token)? {
            warn!("urn: replayed token {}...", abbreviate(&token_hex, 16));
            return Err(Error::TokenAlreadyUsed);
        }

        if !self.key.verify(token, signature)? {
            error!("urn: forged signature for token {}...", abbreviate(&token_hex, 16));
            return Err(Error::InvalidSignature);
        }

        let record = VoteRecord {
            receipt_hash: receipt_hash.clone(),
            option,
            timestamp: now_millis(),
        };

        // A concurrent deposit of the same token may have won since the check above
        if !self.store.burn_and_record(token, record)? {
            warn!("urn: replayed token {}...", abbreviate(&token_hex, 16));
            return Err(Error::TokenAlreadyUsed);
        }

        info!("urn: vote deposited, receipt {}...", abbreviate(&receipt_hash, 16));

        Ok(receipt_hash)
    }

    pub fn verify_receipt(&self, receipt_hash: &str) -> Result<ReceiptStatus, Error> {
        let record = self.store.find_record(receipt_hash)?;
        Ok(ReceiptStatus {
            found: record.is_some(),
            timestamp: record.map(|r| r.timestamp),
        })
    }

    /// Tally the deposited votes and publish the election's record. Runs once per election.
    pub fn close_election(&self, election_id: &str) -> Result<PublicRecord, Error> {
        if election_id.is_empty() {
            return Err(Error::MalformedInput("electionId is required".to_owned()));
        }

        let records = self.store.records()?;
        let record = close_election(election_id, &records, now_millis())?;

        if !self.store.mark_closed(election_id)? {
            warn!("urn: election {} closed twice", election_id);
            return Err(Error::AlreadyClosed(election_id.to_owned()));
        }

        let verification = verify_election_results(&record);
        info!(
            "urn: election {} closed, {} votes, merkle root {}",
            election_id,
            record.total_votes,
            record.merkle_root.as_deref().unwrap_or("none")
        );
        if verification.valid {
            info!("urn: public record integrity verified");
        } else {
            error!("urn: public record failed its own verification: {:?}", verification);
        }

        Ok(record)
    }

    pub fn stats(&self) -> Result<UrnStats, Error> {
        let status = if self.store.closed_count()? > 0 {
            UrnStatus::Closed
        } else {
            UrnStatus::Open
        };

        Ok(UrnStats {
            total_votes: self.store.record_count()?,
            status,
            timestamp: now_millis(),
        })
    }
}

impl<S: TokenLedger> UrnService for Urn<S> {
    fn submit_vote(
        &self,
        content: &VoteContent,
        token: &BigUint,
        signature: &BigUint,
    ) -> Result<String, Error> {
        Urn::submit_vote(self, content, token, signature)
    }

    fn verify_receipt(&self, receipt_hash: &str) -> Result<ReceiptStatus, Error> {
        Urn::verify_receipt(self, receipt_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{toy_config, TEST_AUTHORITY};
    use rand::rngs::OsRng;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;

    fn signed_ballot(authority: &Authority<MemStore>, voter_id: &str) -> UnblindedBallot {
        let key = authority.public_key();
        let blinded = create_blinded_token(&mut OsRng, &key).unwrap();
        let blind_signature = authority.authorize_ballot(voter_id, &blinded.blinded).unwrap();
        let signature = unblind(&blind_signature, blinded.blinding_factor, &key).unwrap();
        UnblindedBallot {
            token: blinded.token,
            signature,
        }
    }

    #[test]
    fn test_vote_content() {
        let bare = VoteContent::from("A");
        assert_eq!(bare.option().unwrap(), "A");
        assert_eq!(bare.receipt_hash().unwrap(), sha256_hex("\"A\""));

        let object = VoteContent::new(json!({"choice": "B", "nonce": "x1"})).unwrap();
        assert_eq!(object.option().unwrap(), "B");
        assert_eq!(
            object.receipt_hash().unwrap(),
            sha256_hex(r#"{"choice":"B","nonce":"x1"}"#)
        );

        assert!(VoteContent::new(json!(3)).is_err());
        assert!(VoteContent::new(json!({"option": "B"})).is_err());
        assert!(VoteContent::new(json!("")).is_err());
    }

    #[test]
    fn test_submit_and_replay() {
        let authority = Authority::new(toy_config(), MemStore::new());
        let urn = Urn::new(authority.public_key(), MemStore::new());
        let ballot = signed_ballot(&authority, "V1");

        let receipt = urn
            .submit_vote(&VoteContent::from("A"), &ballot.token, &ballot.signature)
            .unwrap();
        assert_eq!(receipt.len(), 64);

        let status = urn.verify_receipt(&receipt).unwrap();
        assert!(status.found);
        assert!(status.timestamp.is_some());

        // Same token with different content
        let replay = urn.submit_vote(&VoteContent::from("B"), &ballot.token, &ballot.signature);
        assert!(matches!(replay, Err(Error::TokenAlreadyUsed)));
        assert_eq!(urn.stats().unwrap().total_votes, 1);

        let missing = urn.verify_receipt(&sha256_hex("nothing")).unwrap();
        assert_eq!(missing, ReceiptStatus { found: false, timestamp: None });
    }

    #[test]
    fn test_forged_signature() {
        let authority = Authority::new(toy_config(), MemStore::new());
        let urn = Urn::new(authority.public_key(), MemStore::new());
        let ballot = signed_ballot(&authority, "V1");

        let forged = (&ballot.signature + 1u32) % &authority.public_key().n;
        let result = urn.submit_vote(&VoteContent::from("A"), &ballot.token, &forged);
        assert!(matches!(result, Err(Error::InvalidSignature)));

        // Out of range signatures never verify
        let result = urn.submit_vote(&VoteContent::from("A"), &ballot.token, &authority.public_key().n);
        assert!(matches!(result, Err(Error::InvalidSignature)));

        // A failed attempt does not burn the token
        urn.submit_vote(&VoteContent::from("A"), &ballot.token, &ballot.signature)
            .unwrap();
    }

    #[test]
    fn test_concurrent_replay() {
        let authority = Authority::new(TEST_AUTHORITY.clone(), MemStore::new());
        let urn = Arc::new(Urn::new(authority.public_key(), MemStore::new()));
        let ballot = Arc::new(signed_ballot(&authority, "V1"));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let urn = urn.clone();
                let ballot = ballot.clone();
                thread::spawn(move || {
                    let content = VoteContent::new(json!({ "choice": "A", "device": i })).unwrap();
                    urn.submit_vote(&content, &ballot.token, &ballot.signature)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, Error::TokenAlreadyUsed)));

        assert_eq!(urn.stats().unwrap().total_votes, 1);
    }

    #[test]
    fn test_close_once() {
        let authority = Authority::new(TEST_AUTHORITY.clone(), MemStore::new());
        let urn = Urn::new(authority.public_key(), MemStore::new());
        assert_eq!(urn.stats().unwrap().status, UrnStatus::Open);

        for (i, option) in ["A", "B", "A"].iter().enumerate() {
            let ballot = signed_ballot(&authority, &format!("V{}", i));
            urn.submit_vote(&VoteContent::from(*option), &ballot.token, &ballot.signature)
                .unwrap();
        }

        let record = urn.close_election("E1").unwrap();
        assert_eq!(record.total_votes, 3);
        assert_eq!(record.results.get("A"), Some(&2));
        assert_eq!(record.results.get("B"), Some(&1));
        assert!(verify_election_results(&record).valid);

        assert!(matches!(urn.close_election("E1"), Err(Error::AlreadyClosed(_))));
        assert_eq!(urn.stats().unwrap().status, UrnStatus::Closed);
    }
}
