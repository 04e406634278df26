//! The scrutiny engine: Merkle trees over vote receipts, the public election record and
//! its independent re-verification.

use crate::*;
use std::collections::BTreeMap;

/// A binary SHA-256 tree over sorted leaf hashes.
///
/// Each parent is `sha256_hex(left + right)` over the two hex strings. An odd node at the
/// end of a level is paired with itself.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct MerkleTree {
    levels: Vec<Vec<String>>,
}

impl MerkleTree {
    pub fn build<I, L>(leaves: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        let mut current: Vec<String> = leaves.into_iter().map(Into::into).collect();
        if current.is_empty() {
            return MerkleTree::default();
        }
        current.sort();

        let mut levels = Vec::new();
        while current.len() > 1 {
            let next: Vec<String> = current
                .chunks(2)
                .map(|pair| {
                    let left = &pair[0];
                    let right = pair.get(1).unwrap_or(left);
                    sha256_hex(format!("{}{}", left, right))
                })
                .collect();
            levels.push(current);
            current = next;
        }
        levels.push(current);

        MerkleTree { levels }
    }

    /// `None` for an empty tree
    pub fn root(&self) -> Option<&str> {
        self.levels
            .last()
            .and_then(|level| level.first())
            .map(String::as_str)
    }

    /// The sorted leaves
    pub fn leaves(&self) -> &[String] {
        self.levels.first().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// Inclusion proof for a leaf, from the leaf level up to just below the root
    pub fn proof(&self, leaf: &str) -> Option<Vec<ProofStep>> {
        let mut index = self.leaves().iter().position(|l| l == leaf)?;
        let mut proof = Vec::with_capacity(self.levels.len().saturating_sub(1));

        for level in self.levels.iter().take(self.levels.len().saturating_sub(1)) {
            let is_right = index % 2 == 1;
            let sibling_index = if is_right { index - 1 } else { index + 1 };

            // Past the end of the level the node is paired with itself
            let sibling = level.get(sibling_index).unwrap_or(&level[index]);

            proof.push(ProofStep {
                hash: sibling.clone(),
                side: if is_right { Side::Left } else { Side::Right },
            });
            index /= 2;
        }

        Some(proof)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

/// A sibling hash and the side it sits on
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProofStep {
    pub hash: String,
    pub side: Side,
}

pub fn build_merkle_tree<L: AsRef<str>>(leaves: &[L]) -> MerkleTree {
    MerkleTree::build(leaves.iter().map(|l| l.as_ref().to_owned()))
}

pub fn get_merkle_proof<L: AsRef<str>>(leaf: &str, leaves: &[L]) -> Option<Vec<ProofStep>> {
    build_merkle_tree(leaves).proof(leaf)
}

/// Fold an inclusion proof from the leaf and compare the result with the root
pub fn verify_merkle_proof(leaf: &str, proof: &[ProofStep], root: &str) -> bool {
    let computed = proof.iter().fold(leaf.to_owned(), |acc, step| match step.side {
        Side::Left => sha256_hex(format!("{}{}", step.hash, acc)),
        Side::Right => sha256_hex(format!("{}{}", acc, step.hash)),
    });
    computed == root
}

/// The published result of an election ("acta")
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicRecord {
    pub election_id: String,
    pub timestamp_closed: u64,
    pub total_votes: u64,
    pub results: BTreeMap<String, u64>,
    pub merkle_root: Option<String>,
    pub all_receipts: Vec<String>,
    pub acta_hash: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ActaContent<'a> {
    election_id: &'a str,
    total_votes: u64,
    results: &'a BTreeMap<String, u64>,
    merkle_root: Option<&'a str>,
}

impl PublicRecord {
    /// SHA-256 over the canonical JSON of electionId, totalVotes, results and merkleRoot
    pub fn compute_acta_hash(&self) -> Result<String, Error> {
        let content = ActaContent {
            election_id: &self.election_id,
            total_votes: self.total_votes,
            results: &self.results,
            merkle_root: self.merkle_root.as_deref(),
        };
        Ok(hash_canonical(&content)?)
    }

    /// Inclusion proof for one receipt against this record's leaves
    pub fn receipt_proof(&self, receipt_hash: &str) -> Option<Vec<ProofStep>> {
        get_merkle_proof(receipt_hash, &self.all_receipts)
    }
}

/// Tally vote records into a public record
pub fn close_election(
    election_id: &str,
    records: &[VoteRecord],
    timestamp_closed: u64,
) -> Result<PublicRecord, Error> {
    let mut results = BTreeMap::new();
    for record in records {
        *results.entry(record.option.clone()).or_insert(0u64) += 1;
    }

    let tree = MerkleTree::build(records.iter().map(|r| r.receipt_hash.clone()));

    let mut record = PublicRecord {
        election_id: election_id.to_owned(),
        timestamp_closed,
        total_votes: records.len() as u64,
        results,
        merkle_root: tree.root().map(str::to_owned),
        all_receipts: tree.leaves().to_vec(),
        acta_hash: String::new(),
    };
    record.acta_hash = record.compute_acta_hash()?;

    Ok(record)
}

/// The outcome of re-verifying a public record
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ElectionVerification {
    pub valid: bool,
    pub merkle_root_valid: bool,
    pub total_votes_valid: bool,
    pub tally_consistent: bool,
    pub recalculated_root: Option<String>,
    pub published_root: Option<String>,
    pub acta_hash_valid: bool,
}

/// Recompute a public record's Merkle root and totals. Needs no secret material.
///
/// `valid` covers the root, the receipt count and the tally sum. The acta hash is
/// reported separately.
pub fn verify_election_results(record: &PublicRecord) -> ElectionVerification {
    let tree = build_merkle_tree(&record.all_receipts);
    let recalculated_root = tree.root().map(str::to_owned);

    let merkle_root_valid = recalculated_root == record.merkle_root;
    let total_votes_valid = record.all_receipts.len() as u64 == record.total_votes;

    let tally_sum: u128 = record.results.values().map(|v| *v as u128).sum();
    let tally_consistent = tally_sum == record.total_votes as u128;

    let acta_hash_valid = match record.compute_acta_hash() {
        Ok(hash) => hash == record.acta_hash,
        Err(_) => false,
    };

    ElectionVerification {
        valid: merkle_root_valid && total_votes_valid && tally_consistent,
        merkle_root_valid,
        total_votes_valid,
        tally_consistent,
        recalculated_root,
        published_root: record.merkle_root.clone(),
        acta_hash_valid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<String> {
        (0..n).map(|i| sha256_hex(format!("vote-{}", i))).collect()
    }

    fn vote(option: &str, receipt: &str) -> VoteRecord {
        VoteRecord {
            receipt_hash: receipt.to_owned(),
            option: option.to_owned(),
            timestamp: 0,
        }
    }

    #[test]
    fn test_merkle_edge_cases() {
        let empty = build_merkle_tree::<String>(&[]);
        assert_eq!(empty.root(), None);
        assert!(empty.leaves().is_empty());

        let single = leaves(1);
        let tree = build_merkle_tree(&single);
        assert_eq!(tree.root(), Some(single[0].as_str()));
        assert_eq!(tree.proof(&single[0]), Some(vec![]));

        // Three leaves: the last one is paired with itself
        let mut three = leaves(3);
        three.sort();
        let left = sha256_hex(format!("{}{}", three[0], three[1]));
        let right = sha256_hex(format!("{}{}", three[2], three[2]));
        let tree = build_merkle_tree(&three);
        assert_eq!(tree.root(), Some(sha256_hex(format!("{}{}", left, right)).as_str()));
        assert_eq!(tree.levels().len(), 3);
    }

    #[test]
    fn test_merkle_order_independent() {
        let mut input = leaves(7);
        let root = build_merkle_tree(&input).root().map(str::to_owned);

        input.reverse();
        input.swap(1, 4);
        assert_eq!(build_merkle_tree(&input).root().map(str::to_owned), root);

        // Duplicates are kept
        input.push(input[0].clone());
        assert_ne!(build_merkle_tree(&input).root().map(str::to_owned), root);

        input.pop();
        input[2] = sha256_hex("changed");
        assert_ne!(build_merkle_tree(&input).root().map(str::to_owned), root);
    }

    #[test]
    fn test_merkle_proofs() {
        for n in 1..12 {
            let input = leaves(n);
            let tree = build_merkle_tree(&input);
            let root = tree.root().unwrap();

            for leaf in &input {
                let proof = get_merkle_proof(leaf, &input).unwrap();
                assert!(verify_merkle_proof(leaf, &proof, root));
                assert!(!verify_merkle_proof(&sha256_hex("other"), &proof, root));
            }
        }

        let input = leaves(4);
        assert!(get_merkle_proof(&sha256_hex("missing"), &input).is_none());
    }

    #[test]
    fn test_close_and_verify() {
        let records = vec![
            vote("A", &sha256_hex("1")),
            vote("B", &sha256_hex("2")),
            vote("A", &sha256_hex("3")),
        ];
        let record = close_election("E1", &records, 1000).unwrap();

        assert_eq!(record.total_votes, 3);
        assert_eq!(record.results.get("A"), Some(&2));
        assert_eq!(record.results.get("B"), Some(&1));
        assert_eq!(record.results.values().sum::<u64>(), record.total_votes);
        assert_eq!(record.acta_hash.len(), 64);

        let mut sorted: Vec<String> = records.iter().map(|r| r.receipt_hash.clone()).collect();
        sorted.sort();
        assert_eq!(record.all_receipts, sorted);

        let verification = verify_election_results(&record);
        assert!(verification.valid);
        assert!(verification.acta_hash_valid);
        assert_eq!(verification.recalculated_root, record.merkle_root);

        let proof = record.receipt_proof(&records[1].receipt_hash).unwrap();
        assert!(verify_merkle_proof(
            &records[1].receipt_hash,
            &proof,
            record.merkle_root.as_deref().unwrap()
        ));

        // Closing is deterministic for the same input
        assert_eq!(close_election("E1", &records, 1000).unwrap(), record);
    }

    #[test]
    fn test_tampering_detected() {
        let records: Vec<VoteRecord> = (0..5)
            .map(|i| vote(if i % 2 == 0 { "A" } else { "B" }, &sha256_hex(i.to_string())))
            .collect();
        let record = close_election("E1", &records, 1000).unwrap();

        let mut tampered = record.clone();
        let mut root = tampered.merkle_root.clone().unwrap();
        let first = if root.starts_with('0') { "1" } else { "0" };
        root.replace_range(..1, first);
        tampered.merkle_root = Some(root);
        let verification = verify_election_results(&tampered);
        assert!(!verification.valid);
        assert!(!verification.merkle_root_valid);
        assert!(!verification.acta_hash_valid);

        let mut tampered = record.clone();
        tampered.all_receipts[3] = sha256_hex("injected");
        assert!(!verify_election_results(&tampered).valid);

        let mut tampered = record.clone();
        tampered.all_receipts.pop();
        let verification = verify_election_results(&tampered);
        assert!(!verification.valid);
        assert!(!verification.total_votes_valid);

        let mut tampered = record.clone();
        tampered.results.insert("A".to_owned(), 10);
        let verification = verify_election_results(&tampered);
        assert!(!verification.valid);
        assert!(!verification.tally_consistent);
        assert!(!verification.acta_hash_valid);
    }

    #[test]
    fn test_empty_election() {
        let record = close_election("E1", &[], 1000).unwrap();
        assert_eq!(record.merkle_root, None);
        assert_eq!(record.total_votes, 0);

        let json = serde_json::to_value(&record).unwrap();
        assert!(json["merkleRoot"].is_null());
        assert!(verify_election_results(&record).valid);
    }
}
