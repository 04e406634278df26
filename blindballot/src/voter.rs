use crate::*;
use num_bigint::BigUint;
use rand::{CryptoRng, Rng};
use std::fmt;

/// Threat score at or above which the client refuses to vote
pub const UNSAFE_THREAT_SCORE: u8 = 50;

/// Highest score an attestation can report
pub const MAX_THREAT_SCORE: u8 = 120;

/// The random factor `r` that masks a ballot token.
///
/// It cannot be cloned or serialized, and unblinding consumes it. Its digits are
/// overwritten with zeros when it is dropped.
pub struct BlindingFactor {
    r: BigUint,
}

impl BlindingFactor {
    fn wipe(&mut self) {
        // Rewrites the existing digit buffer in place before it is released
        let words = ((self.r.bits() + 31) / 32) as usize;
        self.r.assign_from_slice(&vec![0u32; words]);
    }
}

impl Drop for BlindingFactor {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl fmt::Debug for BlindingFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BlindingFactor([redacted])")
    }
}

/// A freshly generated token `m`, its blinding factor `r` and `m' = m * r^e mod N`
#[derive(Debug)]
pub struct BlindedToken {
    pub token: BigUint,
    pub blinding_factor: BlindingFactor,
    pub blinded: BigUint,
}

/// A token together with the authority's unblinded signature over it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnblindedBallot {
    pub token: BigUint,
    pub signature: BigUint,
}

/// Generate a random ballot token and blind it under the authority's public key
pub fn create_blinded_token<R: Rng + CryptoRng>(
    rng: &mut R,
    key: &AuthorityPublicKey,
) -> Result<BlindedToken, Error> {
    let token = random_coprime(rng, &key.n)?;
    let r = random_coprime(rng, &key.n)?;

    let blinded = (&token * mod_pow(&r, &key.e, &key.n)?) % &key.n;

    Ok(BlindedToken {
        token,
        blinding_factor: BlindingFactor { r },
        blinded,
    })
}

/// Remove the blinding factor from the authority's signature: `s = s' * r^-1 mod N`
pub fn unblind(
    blind_signature: &BigUint,
    blinding_factor: BlindingFactor,
    key: &AuthorityPublicKey,
) -> Result<BigUint, Error> {
    let r_inverse = mod_inverse(&blinding_factor.r, &key.n)?;
    Ok((blind_signature * r_inverse) % &key.n)
}

/// Reports how likely it is that the client runs in an automated or tampered environment
pub trait EnvironmentAttestation {
    /// A score from 0 (clean) to `MAX_THREAT_SCORE`
    fn threat_score(&self) -> u8;
}

/// An attestation that always reports the same score
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticAttestation(pub u8);

impl EnvironmentAttestation for StaticAttestation {
    fn threat_score(&self) -> u8 {
        self.0
    }
}

/// The census as seen from the voter's device
pub trait CensusService {
    fn public_key(&self) -> Result<AuthorityPublicKey, Error>;

    fn authorize_ballot(&self, voter_id: &str, blinded_token: &BigUint) -> Result<BigUint, Error>;
}

/// The urn as seen from the voter's device
pub trait UrnService {
    fn submit_vote(
        &self,
        content: &VoteContent,
        token: &BigUint,
        signature: &BigUint,
    ) -> Result<String, Error>;

    fn verify_receipt(&self, receipt_hash: &str) -> Result<ReceiptStatus, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoterState {
    Idle,
    KeyFetched,
    TokenBlinded,
    SignatureReceived,
    Unblinded,
    Deposited,
}

impl VoterState {
    pub fn name(self) -> &'static str {
        match self {
            VoterState::Idle => "Idle",
            VoterState::KeyFetched => "KeyFetched",
            VoterState::TokenBlinded => "TokenBlinded",
            VoterState::SignatureReceived => "SignatureReceived",
            VoterState::Unblinded => "Unblinded",
            VoterState::Deposited => "Deposited",
        }
    }
}

/// Receipt returned once a vote has been deposited and looked up again
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteConfirmation {
    pub receipt: String,
    pub confirmed: bool,
    pub timestamp: Option<u64>,
}

/// The voter's side of the blind-signature protocol, as an explicit state machine.
///
/// Each step checks the current state and fails with `UnexpectedState` when called out
/// of order. Arithmetic and self-check failures reset the machine, so a new run always
/// starts from a fresh token and blinding factor.
pub struct BlindVoter {
    state: VoterState,
    public_key: Option<AuthorityPublicKey>,
    token: Option<BigUint>,
    blinding_factor: Option<BlindingFactor>,
    blinded_token: Option<BigUint>,
    blind_signature: Option<BigUint>,
    signature: Option<BigUint>,
    receipt: Option<String>,
    attestation: Option<Box<dyn EnvironmentAttestation + Send + Sync>>,
}

impl Default for BlindVoter {
    fn default() -> Self {
        BlindVoter {
            state: VoterState::Idle,
            public_key: None,
            token: None,
            blinding_factor: None,
            blinded_token: None,
            blind_signature: None,
            signature: None,
            receipt: None,
            attestation: None,
        }
    }
}

impl BlindVoter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attestation<A>(mut self, attestation: A) -> Self
    where
        A: EnvironmentAttestation + Send + Sync + 'static,
    {
        self.attestation = Some(Box::new(attestation));
        self
    }

    pub fn state(&self) -> VoterState {
        self.state
    }

    pub fn receipt(&self) -> Option<&str> {
        self.receipt.as_deref()
    }

    /// The token and its unblinded signature, available from `Unblinded` on
    pub fn ballot(&self) -> Option<UnblindedBallot> {
        match (&self.token, &self.signature) {
            (Some(token), Some(signature)) => Some(UnblindedBallot {
                token: token.clone(),
                signature: signature.clone(),
            }),
            _ => None,
        }
    }

    /// Drop all protocol state and return to `Idle`
    pub fn reset(&mut self) {
        let attestation = self.attestation.take();
        *self = BlindVoter {
            attestation,
            ..Default::default()
        };
    }

    fn expect_state(&self, expected: VoterState) -> Result<(), Error> {
        if self.state != expected {
            return Err(Error::UnexpectedState {
                expected: expected.name(),
                found: self.state.name(),
            });
        }
        Ok(())
    }

    fn check_environment(&self) -> Result<(), Error> {
        if let Some(attestation) = &self.attestation {
            let score = attestation.threat_score().min(MAX_THREAT_SCORE);
            if score >= UNSAFE_THREAT_SCORE {
                warn!("voter: untrusted environment, threat score {}", score);
                return Err(Error::UntrustedEnvironment(score));
            }
        }
        Ok(())
    }

    fn key(&self) -> Result<&AuthorityPublicKey, Error> {
        self.public_key.as_ref().ok_or(Error::UnexpectedState {
            expected: VoterState::KeyFetched.name(),
            found: self.state.name(),
        })
    }

    /// Use an authority public key obtained out of band
    pub fn set_public_key(&mut self, key: AuthorityPublicKey) -> Result<(), Error> {
        self.expect_state(VoterState::Idle)?;
        self.public_key = Some(key);
        self.state = VoterState::KeyFetched;
        Ok(())
    }

    pub fn fetch_key<C: CensusService + ?Sized>(&mut self, census: &C) -> Result<(), Error> {
        self.expect_state(VoterState::Idle)?;
        let key = census.public_key()?;
        self.set_public_key(key)
    }

    /// Generate a token and blinding factor; returns the blinded token to send to the census
    pub fn blind<R: Rng + CryptoRng>(&mut self, rng: &mut R) -> Result<BigUint, Error> {
        self.expect_state(VoterState::KeyFetched)?;
        self.check_environment()?;

        let blinded = match create_blinded_token(rng, self.key()?) {
            Ok(blinded) => blinded,
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };

        self.token = Some(blinded.token);
        self.blinding_factor = Some(blinded.blinding_factor);
        self.blinded_token = Some(blinded.blinded.clone());
        self.state = VoterState::TokenBlinded;

        Ok(blinded.blinded)
    }

    pub fn receive_signature(&mut self, blind_signature: BigUint) -> Result<(), Error> {
        self.expect_state(VoterState::TokenBlinded)?;
        self.blind_signature = Some(blind_signature);
        self.state = VoterState::SignatureReceived;
        Ok(())
    }

    /// Send the blinded token to the census and keep its blind signature
    pub fn request_signature<C: CensusService + ?Sized>(
        &mut self,
        census: &C,
        voter_id: &str,
    ) -> Result<(), Error> {
        self.expect_state(VoterState::TokenBlinded)?;
        let blinded = self.blinded_token.clone().ok_or(Error::NoActiveToken)?;
        let blind_signature = census.authorize_ballot(voter_id, &blinded)?;
        self.receive_signature(blind_signature)
    }

    /// Unblind the census signature and check `s^e mod N == m`.
    ///
    /// The blinding factor is consumed; a second call fails with `NoActiveToken`.
    pub fn unblind(&mut self) -> Result<UnblindedBallot, Error> {
        if self.blinding_factor.is_none() {
            return Err(Error::NoActiveToken);
        }
        self.expect_state(VoterState::SignatureReceived)?;

        let factor = self.blinding_factor.take().ok_or(Error::NoActiveToken)?;
        let blind_signature = self.blind_signature.take().ok_or(Error::NoActiveToken)?;
        let token = self.token.clone().ok_or(Error::NoActiveToken)?;
        let key = self.key()?.clone();

        let result = unblind(&blind_signature, factor, &key).and_then(|signature| {
            if key.verify(&token, &signature)? {
                Ok(signature)
            } else {
                Err(Error::SelfCheckFailed)
            }
        });

        let signature = match result {
            Ok(signature) => signature,
            Err(e) => {
                error!("voter: {}, restarting protocol", e);
                self.reset();
                return Err(e);
            }
        };

        self.signature = Some(signature.clone());
        self.blinded_token = None;
        self.state = VoterState::Unblinded;

        Ok(UnblindedBallot { token, signature })
    }

    /// Deposit the vote in the urn and keep the receipt
    pub fn deposit<U: UrnService + ?Sized>(
        &mut self,
        urn: &U,
        content: &VoteContent,
    ) -> Result<String, Error> {
        self.expect_state(VoterState::Unblinded)?;
        let ballot = self.ballot().ok_or(Error::NoActiveToken)?;

        let receipt = urn.submit_vote(content, &ballot.token, &ballot.signature)?;

        self.receipt = Some(receipt.clone());
        self.state = VoterState::Deposited;
        Ok(receipt)
    }

    /// Run the whole protocol: fetch the key, blind, get signed, unblind, deposit and confirm
    pub fn cast_vote<C, U>(
        &mut self,
        census: &C,
        urn: &U,
        voter_id: &str,
        content: &VoteContent,
    ) -> Result<VoteConfirmation, Error>
    where
        C: CensusService + ?Sized,
        U: UrnService + ?Sized,
    {
        self.check_environment()?;

        if self.state == VoterState::Idle {
            self.fetch_key(census)?;
        }

        let mut rng = rand::rngs::OsRng;
        self.blind(&mut rng)?;
        self.request_signature(census, voter_id)?;
        self.unblind()?;
        let receipt = self.deposit(urn, content)?;

        let status = urn.verify_receipt(&receipt)?;
        if !status.found {
            warn!("voter: receipt {}... not found after deposit", abbreviate(&receipt, 16));
        }

        Ok(VoteConfirmation {
            receipt,
            confirmed: status.found,
            timestamp: status.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{toy_config, TEST_AUTHORITY};
    use num_traits::Zero;
    use rand::rngs::OsRng;

    #[test]
    fn test_blind_unblind() {
        for config in &[toy_config(), TEST_AUTHORITY.clone()] {
            let key = config.public_key();
            let authority = Authority::new(config.clone(), MemStore::new());
            let mut rng = OsRng;

            for i in 0..5 {
                let blinded = create_blinded_token(&mut rng, &key).unwrap();
                assert!(blinded.blinded < key.n);

                let blind_signature = authority
                    .authorize_ballot(&format!("voter-{}", i), &blinded.blinded)
                    .unwrap();
                let signature = unblind(&blind_signature, blinded.blinding_factor, &key).unwrap();

                assert!(key.verify(&blinded.token, &signature).unwrap());
            }
        }
    }

    #[test]
    fn test_blinding_factor_wipe() {
        let key = TEST_AUTHORITY.public_key();
        let mut blinded = create_blinded_token(&mut OsRng, &key).unwrap();
        assert!(!blinded.blinding_factor.r.is_zero());

        blinded.blinding_factor.wipe();
        assert!(blinded.blinding_factor.r.is_zero());
        assert_eq!(blinded.blinding_factor.r.bits(), 0);
    }

    #[test]
    fn test_state_machine() {
        let config = toy_config();
        let authority = Authority::new(config, MemStore::new());
        let mut voter = BlindVoter::new();

        // Out of order steps are rejected
        assert!(matches!(
            voter.blind(&mut OsRng),
            Err(Error::UnexpectedState { expected: "KeyFetched", found: "Idle" })
        ));

        voter.fetch_key(&authority).unwrap();
        assert_eq!(voter.state(), VoterState::KeyFetched);

        voter.blind(&mut OsRng).unwrap();
        assert_eq!(voter.state(), VoterState::TokenBlinded);

        voter.request_signature(&authority, "V1").unwrap();
        assert_eq!(voter.state(), VoterState::SignatureReceived);

        let ballot = voter.unblind().unwrap();
        assert_eq!(voter.state(), VoterState::Unblinded);
        assert_eq!(voter.ballot(), Some(ballot));

        // The blinding factor is gone
        assert!(matches!(voter.unblind(), Err(Error::NoActiveToken)));

        voter.reset();
        assert_eq!(voter.state(), VoterState::Idle);
        assert!(voter.ballot().is_none());
    }

    #[test]
    fn test_self_check_failure_resets() {
        let mut voter = BlindVoter::new();
        voter.set_public_key(TEST_AUTHORITY.public_key()).unwrap();
        voter.blind(&mut OsRng).unwrap();

        // A signature that was not produced by the authority
        voter.receive_signature(BigUint::from(7u32)).unwrap();

        let result = voter.unblind();
        assert!(matches!(result, Err(Error::SelfCheckFailed)));
        assert!(result.unwrap_err().is_protocol_restart());
        assert_eq!(voter.state(), VoterState::Idle);
    }

    #[test]
    fn test_untrusted_environment() {
        let authority = Authority::new(toy_config(), MemStore::new());
        let urn = Urn::new(toy_config().public_key(), MemStore::new());

        let mut voter = BlindVoter::new().with_attestation(StaticAttestation(UNSAFE_THREAT_SCORE));
        let content = VoteContent::from("A");
        let result = voter.cast_vote(&authority, &urn, "V1", &content);
        assert!(matches!(result, Err(Error::UntrustedEnvironment(50))));

        // Nothing was issued
        assert_eq!(authority.stats().unwrap().total_ballots_issued, 0);

        let mut voter = BlindVoter::new().with_attestation(StaticAttestation(UNSAFE_THREAT_SCORE - 1));
        let confirmation = voter.cast_vote(&authority, &urn, "V1", &content).unwrap();
        assert!(confirmation.confirmed);
        assert_eq!(voter.state(), VoterState::Deposited);
        assert_eq!(voter.receipt(), Some(confirmation.receipt.as_str()));
    }
}
