use crate::*;
use num_bigint::BigUint;
use num_traits::{One, Zero};
use std::fmt;
use std::sync::RwLock;

/// Revocation state of an authority or audit signing key
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyStatus {
    Active,
    Revoked,
}

impl Default for KeyStatus {
    fn default() -> Self {
        KeyStatus::Active
    }
}

/// The public half of the authority's RSA key.
///
/// This is all the urn and the voters ever hold.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AuthorityPublicKey {
    #[serde(with = "BigUintHex")]
    pub n: BigUint,

    #[serde(with = "BigUintHex")]
    pub e: BigUint,
}

impl AuthorityPublicKey {
    pub fn new(n: BigUint, e: BigUint) -> Result<Self, Error> {
        if n <= BigUint::one() {
            return Err(ArithmeticError::ModulusTooSmall.into());
        }
        if e.is_zero() {
            return Err(ArithmeticError::ZeroOperand.into());
        }
        Ok(AuthorityPublicKey { n, e })
    }

    /// Check an unblinded signature: `signature^e mod N == token`
    pub fn verify(&self, token: &BigUint, signature: &BigUint) -> Result<bool, Error> {
        if token >= &self.n || signature >= &self.n {
            return Ok(false);
        }
        let recovered = mod_pow(signature, &self.e, &self.n)?;
        Ok(&recovered == token)
    }
}

/// The authority's full RSA key and its revocation state.
///
/// Built once per deployment and handed to the `Authority` explicitly.
#[derive(Clone)]
pub struct AuthorityConfig {
    pub n: BigUint,
    pub e: BigUint,
    d: BigUint,
    pub status: KeyStatus,
}

impl AuthorityConfig {
    pub fn new(n: BigUint, e: BigUint, d: BigUint) -> Result<Self, Error> {
        AuthorityPublicKey::new(n.clone(), e.clone())?;
        if d.is_zero() || d >= n {
            return Err(Error::MalformedInput(
                "private exponent must lie in (0, N)".to_owned(),
            ));
        }

        Ok(AuthorityConfig {
            n,
            e,
            d,
            status: KeyStatus::Active,
        })
    }

    /// Build a config from hexadecimal N, e and d
    pub fn from_hex(n: &str, e: &str, d: &str) -> Result<Self, Error> {
        Self::new(biguint_from_hex(n)?, biguint_from_hex(e)?, biguint_from_hex(d)?)
    }

    /// Generate a fresh RSA key of the given size
    pub fn generate(bits: usize) -> Result<Self, Error> {
        use rsa::traits::{PrivateKeyParts, PublicKeyParts};

        let mut csprng = rand::rngs::OsRng;
        let key = rsa::RsaPrivateKey::new(&mut csprng, bits)?;

        let n = BigUint::from_bytes_be(&key.n().to_bytes_be());
        let e = BigUint::from_bytes_be(&key.e().to_bytes_be());
        let d = BigUint::from_bytes_be(&key.d().to_bytes_be());

        Self::new(n, e, d)
    }

    pub fn public_key(&self) -> AuthorityPublicKey {
        AuthorityPublicKey {
            n: self.n.clone(),
            e: self.e.clone(),
        }
    }

    /// The private exponent, hex encoded, for export to secure storage
    pub fn private_exponent_hex(&self) -> String {
        biguint_to_hex(&self.d)
    }
}

impl fmt::Debug for AuthorityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorityConfig")
            .field("n", &biguint_to_hex(&self.n))
            .field("e", &biguint_to_hex(&self.e))
            .field("d", &"[redacted]")
            .field("status", &self.status)
            .finish()
    }
}

/// Public census statistics. Never includes identities.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CensusStats {
    pub total_ballots_issued: usize,
    pub status: KeyStatus,
}

/// The eligibility authority ("Census").
///
/// It checks that a voter has not already been issued a ballot and then signs a blinded
/// token it cannot read. It never sees the unblinded token or the vote.
pub struct Authority<S: EligibilityStore> {
    public: AuthorityPublicKey,
    d: BigUint,
    status: RwLock<KeyStatus>,
    store: S,
}

impl<S: EligibilityStore> Authority<S> {
    pub fn new(config: AuthorityConfig, store: S) -> Self {
        let public = config.public_key();
        Authority {
            public,
            d: config.d,
            status: RwLock::new(config.status),
            store,
        }
    }

    pub fn public_key(&self) -> AuthorityPublicKey {
        self.public.clone()
    }

    pub fn status(&self) -> KeyStatus {
        match self.status.read() {
            Ok(status) => *status,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Revoke the signing key. No further ballots are issued.
    pub fn revoke(&self) {
        match self.status.write() {
            Ok(mut status) => *status = KeyStatus::Revoked,
            Err(poisoned) => *poisoned.into_inner() = KeyStatus::Revoked,
        }
        warn!("census: authority signing key revoked");
    }

    /// Sign a blinded token for an eligible voter: `s' = (m')^d mod N`.
    ///
    /// The voter is marked as issued atomically before the signature is computed, so
    /// concurrent requests for the same voter yield at most one signature.
    pub fn authorize_ballot(&self, voter_id: &str, blinded_token: &BigUint) -> Result<BigUint, Error> {
        if voter_id.is_empty() {
            return Err(Error::MalformedInput("voterId is required".to_owned()));
        }
        if blinded_token.is_zero() || blinded_token >= &self.public.n {
            return Err(Error::MalformedInput(
                "blinded token must lie in (0, N)".to_owned(),
            ));
        }

        if self.status() == KeyStatus::Revoked {
            warn!(
                "census: refused ballot for {}..., signing key is revoked",
                abbreviate(voter_id, 8)
            );
            return Err(Error::SignerRevoked);
        }

        if !self.store.mark_issued(voter_id)? {
            warn!(
                "census: voter {}... requested a second ballot",
                abbreviate(voter_id, 8)
            );
            return Err(Error::AlreadyIssued);
        }

        let blind_signature = mod_pow(blinded_token, &self.d, &self.public.n)?;

        info!("census: ballot authorized for {}...", abbreviate(voter_id, 8));

        Ok(blind_signature)
    }

    pub fn stats(&self) -> Result<CensusStats, Error> {
        Ok(CensusStats {
            total_ballots_issued: self.store.issued_count()?,
            status: self.status(),
        })
    }
}

impl<S: EligibilityStore> CensusService for Authority<S> {
    fn public_key(&self) -> Result<AuthorityPublicKey, Error> {
        Ok(Authority::public_key(self))
    }

    fn authorize_ballot(&self, voter_id: &str, blinded_token: &BigUint) -> Result<BigUint, Error> {
        Authority::authorize_ballot(self, voter_id, blinded_token)
    }
}
