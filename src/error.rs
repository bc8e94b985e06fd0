use alloy::primitives::Address;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GrantError {
    #[error("No signer attached")]
    SignerUnavailable,

    #[error("Signature declined: {0}")]
    SignatureDeclined(String),

    #[error("Signer failed: {0}")]
    SignerFailed(String),

    #[error("Corrupt cache entry: {0}")]
    CorruptCacheEntry(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Invalid structured message: {0}")]
    InvalidMessage(String),

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("Authorization expired")]
    Expired,

    #[error("Contract {0} is not covered by this authorization")]
    OutOfScope(Address),

    #[error("Signer does not match the authorization grantor")]
    SignerMismatch,

    #[error("No contract addresses given")]
    EmptyScope,

    #[error("Requested scope changed before the authorization arrived")]
    StaleScope,

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for GrantError {
    fn from(e: std::io::Error) -> Self {
        GrantError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GrantError>;
