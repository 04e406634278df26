use super::*;
use lazy_static::lazy_static;
use num_bigint::BigUint;
use rand::rngs::OsRng;
use serde_json::json;

lazy_static! {
    /// A real RSA key shared by the slower tests
    pub(crate) static ref TEST_AUTHORITY: AuthorityConfig =
        AuthorityConfig::generate(1024).expect("generate test authority key");
}

/// The textbook key p = 61, q = 53: N = 3233, e = 17, d = 2753
pub(crate) fn toy_config() -> AuthorityConfig {
    AuthorityConfig::from_hex("ca1", "11", "ac1").unwrap()
}

fn content(option: &str, nonce: usize) -> VoteContent {
    VoteContent::new(json!({ "choice": option, "nonce": nonce })).unwrap()
}

#[test]
fn end_to_end_election() {
    let api = ElectionApi::in_memory(TEST_AUTHORITY.clone(), "PLEBISCITO_2026");
    assert_eq!(api.public_key().e, BigUint::from(0x10001u32));

    // The voting device keeps its own signed audit chain
    let device = AuditChain::new(MemStore::new()).with_evidence_key(SealingKey::generate());
    let device_signer = AuditSigner::generate();

    // Three voters cast {A, B, A}
    let mut receipts = Vec::new();
    let mut first_ballot = None;
    for (i, option) in ["A", "B", "A"].iter().enumerate() {
        let mut voter = BlindVoter::new().with_attestation(StaticAttestation(0));
        let confirmation = voter
            .cast_vote(api.authority(), api.urn(), &format!("V{}", i + 1), &content(option, i))
            .unwrap();

        assert!(confirmation.confirmed);
        assert_eq!(confirmation.receipt.len(), 64);
        assert!(confirmation.receipt.chars().all(|c| c.is_ascii_hexdigit()));

        device
            .append_block(
                AuditAction::VoteCast,
                &json!({ "receipt": confirmation.receipt }),
                &device_signer,
                None,
            )
            .unwrap();

        if first_ballot.is_none() {
            first_ballot = voter.ballot();
        }
        receipts.push(confirmation.receipt);
    }

    // V1 cannot get a second ballot
    let key = api.public_key();
    let blinded = create_blinded_token(&mut OsRng, &key).unwrap();
    let again = api.authority().authorize_ballot("V1", &blinded.blinded);
    assert!(matches!(again, Err(Error::AlreadyIssued)));

    // Replaying V1's token with different content is rejected
    let ballot = first_ballot.unwrap();
    let replay = api
        .submit_vote(&SubmitVoteRequest {
            vote_content: json!({ "choice": "B" }),
            ballot_token_hex: biguint_to_hex(&ballot.token),
            census_signature_hex: biguint_to_hex(&ballot.signature),
        })
        .unwrap_err();
    assert_eq!(replay.code.as_deref(), Some("TokenAlreadyUsed"));

    // A token the authority never signed is rejected
    let forged_token = random_coprime(&mut OsRng, &key.n).unwrap();
    let forged_signature = random_coprime(&mut OsRng, &key.n).unwrap();
    let forged = api.urn().submit_vote(&content("B", 99), &forged_token, &forged_signature);
    assert!(matches!(forged, Err(Error::InvalidSignature)));

    // Close the election
    let record = api
        .close_election(&CloseElectionRequest {
            election_id: Some("PLEBISCITO_2026".to_owned()),
        })
        .unwrap();
    assert_eq!(record.total_votes, 3);
    assert_eq!(record.results.get("A"), Some(&2));
    assert_eq!(record.results.get("B"), Some(&1));
    assert_eq!(record.results.values().sum::<u64>(), record.total_votes);

    // Anyone holding the published JSON can re-verify it
    let published = serde_json::to_string(&record).unwrap();
    let downloaded: PublicRecord = serde_json::from_str(&published).unwrap();
    let verification = verify_election_results(&downloaded);
    assert!(verification.valid);
    assert!(verification.acta_hash_valid);

    let root = downloaded.merkle_root.as_deref().unwrap();
    for receipt in &receipts {
        let proof = downloaded.receipt_proof(receipt).unwrap();
        assert!(verify_merkle_proof(receipt, &proof, root));
    }

    // The device chain syncs to the transparency server
    api.register_key(&RegisterKeyRequest {
        key_id: device_signer.key_id().to_owned(),
        public_key_hex: device_signer.public_key_hex(),
    })
    .unwrap();
    let report = api
        .audit_sync(&SyncRequest {
            blocks: device.blocks().unwrap(),
        })
        .unwrap();
    assert!(report.success);

    let chain = api.audit_chain().unwrap();
    assert_eq!(chain.total_blocks, 3);
    assert!(chain.verification.valid);
    assert!(api.ledger().verify_signatures().unwrap().valid);
    assert_eq!(device.stats().unwrap().votes, 3);
}

#[test]
fn identical_content_shares_a_receipt() {
    let authority = Authority::new(TEST_AUTHORITY.clone(), MemStore::new());
    let urn = Urn::new(authority.public_key(), MemStore::new());

    let mut receipts = Vec::new();
    for voter_id in &["V1", "V2"] {
        let mut voter = BlindVoter::new();
        let confirmation = voter
            .cast_vote(&authority, &urn, voter_id, &VoteContent::from("A"))
            .unwrap();
        receipts.push(confirmation.receipt);
    }
    assert_eq!(receipts[0], receipts[1]);

    // Both votes count and both leaves stay in the tree
    let record = urn.close_election("E1").unwrap();
    assert_eq!(record.total_votes, 2);
    assert_eq!(record.all_receipts.len(), 2);
    assert!(verify_election_results(&record).valid);
}

#[test]
fn tampered_record_is_detected() {
    let api = ElectionApi::in_memory(TEST_AUTHORITY.clone(), "E1");
    for (i, option) in ["A", "B", "A", "C"].iter().enumerate() {
        let mut voter = BlindVoter::new();
        voter
            .cast_vote(api.authority(), api.urn(), &format!("V{}", i), &content(option, i))
            .unwrap();
    }
    let record = api.close_election(&CloseElectionRequest::default()).unwrap();
    assert_eq!(record.election_id, "E1");

    let mut json = serde_json::to_value(&record).unwrap();
    json["results"]["C"] = json!(2);
    let tampered: PublicRecord = serde_json::from_value(json).unwrap();

    let verification = verify_election_results(&tampered);
    assert!(!verification.valid);
    assert!(!verification.tally_consistent);
    assert!(verification.merkle_root_valid);
}
