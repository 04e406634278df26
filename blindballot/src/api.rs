//! Request and response shapes for every network route, and a facade that serves them.
//!
//! Transport framing is left to the embedding server: each route is one method taking a
//! deserialized request and returning a serializable response or an `ApiError`.

use crate::*;
use serde_json::Value;
use std::fmt;

/// Wire form of a failed request
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub error: String,
    pub code: Option<String>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({})", self.error, code),
            None => write!(f, "{}", self.error),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError {
            error: e.to_string(),
            code: e.code().map(str::to_owned),
        }
    }
}

/// `POST authority/authorize-ballot`
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthorizeBallotRequest {
    pub blinded_token_hex: String,
    pub voter_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeBallotResponse {
    pub blinded_signature_hex: String,
}

/// `POST urn/submit-vote`
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SubmitVoteRequest {
    pub vote_content: Value,
    pub ballot_token_hex: String,
    pub census_signature_hex: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubmitVoteResponse {
    pub receipt: String,
}

/// `POST urn/close-election`
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CloseElectionRequest {
    pub election_id: Option<String>,
}

/// `POST urn/verify-receipt`
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct VerifyReceiptRequest {
    pub receipt_hash: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReceiptResponse {
    pub verified: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// `POST audit/sync`
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct SyncRequest {
    pub blocks: Vec<AuditBlock>,
}

/// `POST audit/register-key`
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterKeyRequest {
    pub key_id: String,
    pub public_key_hex: String,
}

/// `POST audit/revoke-key`
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RevokeKeyRequest {
    pub key_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeyStatusResponse {
    pub key_id: String,
    pub status: KeyStatus,
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str, Error> {
    if value.trim().is_empty() {
        return Err(Error::MalformedInput(format!("{} is required", field)));
    }
    Ok(value)
}

/// The census, urn and transparency ledger behind one set of routes
pub struct ElectionApi<E: EligibilityStore, T: TokenLedger, A: AuditStore + Default> {
    authority: Authority<E>,
    urn: Urn<T>,
    ledger: TransparencyLedger<A>,
    default_election_id: String,
}

impl ElectionApi<MemStore, MemStore, MemStore> {
    /// All three services on in-memory stores, the urn trusting `config`'s public key
    pub fn in_memory(config: AuthorityConfig, default_election_id: &str) -> Self {
        let urn = Urn::new(config.public_key(), MemStore::new());
        ElectionApi::new(
            Authority::new(config, MemStore::new()),
            urn,
            TransparencyLedger::new(),
            default_election_id,
        )
    }
}

impl<E: EligibilityStore, T: TokenLedger, A: AuditStore + Default> ElectionApi<E, T, A> {
    pub fn new(
        authority: Authority<E>,
        urn: Urn<T>,
        ledger: TransparencyLedger<A>,
        default_election_id: &str,
    ) -> Self {
        ElectionApi {
            authority,
            urn,
            ledger,
            default_election_id: default_election_id.to_owned(),
        }
    }

    pub fn authority(&self) -> &Authority<E> {
        &self.authority
    }

    pub fn urn(&self) -> &Urn<T> {
        &self.urn
    }

    pub fn ledger(&self) -> &TransparencyLedger<A> {
        &self.ledger
    }

    /// `GET authority/public-key`
    pub fn public_key(&self) -> AuthorityPublicKey {
        self.authority.public_key()
    }

    /// `POST authority/authorize-ballot`
    pub fn authorize_ballot(
        &self,
        req: &AuthorizeBallotRequest,
    ) -> Result<AuthorizeBallotResponse, ApiError> {
        let voter_id = required("voterId", &req.voter_id)?;
        let blinded = biguint_from_hex(required("blindedTokenHex", &req.blinded_token_hex)?)?;

        let blind_signature = self.authority.authorize_ballot(voter_id, &blinded)?;

        Ok(AuthorizeBallotResponse {
            blinded_signature_hex: biguint_to_hex(&blind_signature),
        })
    }

    /// `GET authority/stats`
    pub fn authority_stats(&self) -> Result<CensusStats, ApiError> {
        Ok(self.authority.stats()?)
    }

    /// `POST urn/submit-vote`
    pub fn submit_vote(&self, req: &SubmitVoteRequest) -> Result<SubmitVoteResponse, ApiError> {
        let content = VoteContent::new(req.vote_content.clone())?;
        let token = biguint_from_hex(required("ballotTokenHex", &req.ballot_token_hex)?)?;
        let signature = biguint_from_hex(required(
            "censusSignatureHex",
            &req.census_signature_hex,
        )?)?;

        let receipt = self.urn.submit_vote(&content, &token, &signature)?;
        Ok(SubmitVoteResponse { receipt })
    }

    /// `POST urn/close-election`
    pub fn close_election(&self, req: &CloseElectionRequest) -> Result<PublicRecord, ApiError> {
        let election_id = req
            .election_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or(self.default_election_id.as_str());

        Ok(self.urn.close_election(election_id)?)
    }

    /// `POST urn/verify-receipt`
    pub fn verify_receipt(&self, req: &VerifyReceiptRequest) -> Result<VerifyReceiptResponse, ApiError> {
        let receipt_hash = required("receiptHash", &req.receipt_hash)?;
        let status = self.urn.verify_receipt(receipt_hash)?;

        Ok(VerifyReceiptResponse {
            verified: status.found,
            timestamp: status.timestamp,
        })
    }

    /// `GET urn/stats`
    pub fn urn_stats(&self) -> Result<UrnStats, ApiError> {
        Ok(self.urn.stats()?)
    }

    /// `POST audit/sync`
    pub fn audit_sync(&self, req: &SyncRequest) -> Result<SyncReport, ApiError> {
        Ok(self.ledger.sync(&req.blocks)?)
    }

    /// `GET audit/chain`
    pub fn audit_chain(&self) -> Result<ChainReport, ApiError> {
        Ok(self.ledger.chain()?)
    }

    /// `POST audit/register-key`
    pub fn register_key(&self, req: &RegisterKeyRequest) -> Result<KeyStatusResponse, ApiError> {
        let key_id = required("keyId", &req.key_id)?;
        let public_key_hex = required("publicKeyHex", &req.public_key_hex)?;

        let status = self.ledger.register_key(key_id, public_key_hex)?;
        Ok(KeyStatusResponse {
            key_id: key_id.to_owned(),
            status,
        })
    }

    /// `POST audit/revoke-key`
    pub fn revoke_key(&self, req: &RevokeKeyRequest) -> Result<KeyStatusResponse, ApiError> {
        let key_id = required("keyId", &req.key_id)?;
        self.ledger.revoke_key(key_id)?;

        Ok(KeyStatusResponse {
            key_id: key_id.to_owned(),
            status: KeyStatus::Revoked,
        })
    }
}
