//! Error types for dscuss-core.
//!
//! Each module has its own leaf error enum; callers (`dscussd::node::NodeError`
//! in particular) convert from whichever leaf type a given operation can
//! fail with via `#[from]`, rather than going through an aggregate type.

use thiserror::Error;

/// Failures from key generation, DER/PEM encoding, signing and verification.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed public key: {0}")]
    MalformedKey(String),

    #[error("malformed signature")]
    MalformedSignature,

    #[error("pem decode failed: {0}")]
    Pem(String),

    #[error("keypair io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures from the proof-of-work searcher.
#[derive(Debug, Error)]
pub enum PowError {
    #[error("a proof-of-work search is already running in this process")]
    AlreadyRunning,

    #[error("progress file is corrupt: {0}")]
    CorruptProgress(String),

    #[error("progress file io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("search space exhausted without finding a valid proof")]
    Exhausted,
}

/// Failures from topic parsing.
#[derive(Debug, Error)]
pub enum TopicError {
    #[error("topic must contain at least one tag")]
    Empty,

    #[error("invalid tag: {0:?}")]
    InvalidTag(String),
}

/// Failures from entity (de)serialization.
#[derive(Debug, Error)]
pub enum EntityError {
    #[error("malformed entity: {0}")]
    Malformed(String),

    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("operation entities are not yet implemented")]
    NotImplemented,
}
