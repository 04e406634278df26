use thiserror::Error;

/// Error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("blindballot: ballot already issued for this voter")]
    AlreadyIssued,

    #[error("blindballot: signing key is revoked")]
    SignerRevoked,

    #[error("blindballot: ballot token already used")]
    TokenAlreadyUsed,

    #[error("blindballot: invalid authority signature")]
    InvalidSignature,

    #[error("blindballot: election {0} is already closed")]
    AlreadyClosed(String),

    #[error("blindballot: malformed input: {0}")]
    MalformedInput(String),

    #[error("blindballot: no active ballot token")]
    NoActiveToken,

    #[error("blindballot: unexpected protocol state: expected {expected}, found {found}")]
    UnexpectedState {
        expected: &'static str,
        found: &'static str,
    },

    #[error("blindballot: client environment is untrusted (threat score {0})")]
    UntrustedEnvironment(u8),

    #[error("blindballot: self-check failed, unblinded signature does not verify")]
    SelfCheckFailed,

    #[error("blindballot: arithmetic error: {0}")]
    Arithmetic(#[from] ArithmeticError),

    #[error("blindballot: unknown audit signer {0}")]
    UnknownSigner(String),

    #[error("blindballot: an evidence key is required to vault a previous state")]
    EvidenceKeyMissing,

    #[error("blindballot: AES-GCM error: {0}")]
    Aead(aes_gcm::Error),

    #[error("blindballot: key vault is locked")]
    VaultLocked,

    #[error("blindballot: wrong PIN for key vault")]
    InvalidPin,

    #[error("blindballot: store error: {0}")]
    Store(String),

    #[error("blindballot: JSON error: {0}")]
    JSON(#[from] serde_json::Error),

    #[error("blindballot: RSA error: {0}")]
    RSAError(#[from] rsa::errors::Error),

    #[error("blindballot: signature error: {0}")]
    SignatureError(#[from] ed25519_dalek::SignatureError),
}

impl Error {
    /// The wire code for errors that cross the network boundary
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Error::AlreadyIssued => Some("AlreadyIssued"),
            Error::SignerRevoked => Some("SignerRevoked"),
            Error::TokenAlreadyUsed => Some("TokenAlreadyUsed"),
            Error::InvalidSignature => Some("InvalidSignature"),
            Error::AlreadyClosed(_) => Some("AlreadyClosed"),
            Error::MalformedInput(_) => Some("MalformedInput"),
            Error::UnknownSigner(_) => Some("UnknownSigner"),
            _ => None,
        }
    }

    /// Arithmetic failures abort a single protocol run; the client restarts with fresh state
    pub fn is_protocol_restart(&self) -> bool {
        matches!(self, Error::Arithmetic(_) | Error::SelfCheckFailed)
    }
}

/// Modular arithmetic errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticError {
    #[error("modulus must be greater than one")]
    ModulusTooSmall,

    #[error("operand must not be zero")]
    ZeroOperand,

    #[error("value is not invertible for this modulus")]
    NotInvertible,
}
