use crate::config::Config;
use blindballot::*;
use serde_json::json;

/// Run a complete election in-process: issue, deposit, close, verify and sync the audit chain
pub fn command_e2e(matches: &clap::ArgMatches, config: Config) {
    let votes: Vec<&str> = matches
        .value_of("VOTES")
        .unwrap_or("A,B,A")
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect();

    let keys = config.device_keys().unwrap_or_else(|e| {
        eprintln!("blindballot e2e: unable to open the device vault: {}", e);
        std::process::exit(1);
    });
    let signer = keys.signer;

    let election_id = matches
        .value_of("election-id")
        .map(str::to_owned)
        .unwrap_or(config.election_id);

    let api = ElectionApi::in_memory(config.authority, &election_id);

    // The voting device's own audit chain
    let device = AuditChain::new(MemStore::new()).with_evidence_key(keys.evidence_key);

    let registration = RegisterKeyRequest {
        key_id: signer.key_id().to_owned(),
        public_key_hex: signer.public_key_hex(),
    };
    if let Err(e) = api.register_key(&registration) {
        eprintln!("blindballot e2e: unable to register audit key: {}", e);
        std::process::exit(1);
    }

    for (i, option) in votes.iter().enumerate() {
        let voter_id = format!("voter-{}", i + 1);
        let mut voter = BlindVoter::new();

        let confirmation = voter
            .cast_vote(api.authority(), api.urn(), &voter_id, &VoteContent::from(*option))
            .unwrap_or_else(|e| {
                eprintln!("blindballot e2e: {} could not vote: {}", voter_id, e);
                std::process::exit(1);
            });

        let block = device.append_block(
            AuditAction::VoteCast,
            &json!({ "receipt": confirmation.receipt }),
            &signer,
            None,
        );
        if let Err(e) = block {
            eprintln!("blindballot e2e: unable to record vote: {}", e);
            std::process::exit(1);
        }

        println!("> {} deposited, receipt {}", voter_id, confirmation.receipt);
    }

    let request = CloseElectionRequest {
        election_id: Some(election_id.clone()),
    };
    let record = api.close_election(&request).unwrap_or_else(|e| {
        eprintln!("blindballot e2e: unable to close election: {}", e);
        std::process::exit(1);
    });

    let closing = device.append_block(
        AuditAction::ElectionClosed,
        &json!({ "electionId": record.election_id, "actaHash": record.acta_hash }),
        &signer,
        None,
    );
    if let Err(e) = closing {
        eprintln!("blindballot e2e: unable to record closing: {}", e);
        std::process::exit(1);
    }

    let verification = verify_election_results(&record);
    if verification.valid && verification.acta_hash_valid {
        println!("> Election verified OK");
    } else {
        eprintln!("blindballot e2e: public record failed verification");
        std::process::exit(1);
    }

    println!("Tally:");
    for (option, count) in &record.results {
        println!("  {} got {} votes", option, count);
    }

    let outcome = device.synchronize(api.ledger()).unwrap_or_else(|e| {
        eprintln!("blindballot e2e: audit sync failed: {}", e);
        std::process::exit(1);
    });
    if !outcome.success {
        eprintln!(
            "blindballot e2e: transparency server rejected audit blocks: {}",
            outcome.error.unwrap_or_default()
        );
        std::process::exit(1);
    }
    println!("> Audit chain synced, {} blocks sent", outcome.synced);

    let blocks = device.blocks().unwrap_or_else(|e| {
        eprintln!("blindballot e2e: {}", e);
        std::process::exit(1);
    });

    if let Some(filename) = matches.value_of("record-out") {
        crate::write_json("e2e", &crate::expand(filename), &record);
    }
    if let Some(filename) = matches.value_of("chain-out") {
        crate::write_json("e2e", &crate::expand(filename), &blocks);
    }
    if let (Some(vault), Some(filename)) = (&keys.vault, &config.vault_file) {
        crate::write_json("e2e", filename, vault);
    }
}
