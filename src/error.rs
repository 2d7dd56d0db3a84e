//! Error types for the health center PKI.

use std::fmt;

use thiserror::Error;

/// Position of a certificate inside a [leaf, subordinate, root] chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainLink {
    Leaf,
    Subordinate,
    Root,
}

impl fmt::Display for ChainLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChainLink::Leaf => "leaf",
            ChainLink::Subordinate => "subordinate",
            ChainLink::Root => "root",
        };
        f.write_str(label)
    }
}

/// Failure of a chain verification. The first failing link wins.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid signature on {0} certificate")]
    InvalidSignature(ChainLink),

    #[error("{0} certificate is outside its validity window")]
    Expired(ChainLink),

    #[error("crypto error while verifying chain: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
}

/// Top-level error type for the crate.
#[derive(Debug, Error)]
pub enum HealthPkiError {
    // ── Trust errors ────────────────────────────────────────────────────
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("certificate expired: {0}")]
    Expired(String),

    #[error("untrusted certificate chain: {0}")]
    Chain(#[from] ChainError),

    #[error("signature mismatch on {0}")]
    SignatureMismatch(String),

    #[error("appointment identifier mismatch: expected {expected}, confirmed {confirmed}")]
    IdentifierMismatch { expected: String, confirmed: String },

    // ── Registry errors ─────────────────────────────────────────────────
    #[error("already registered: {0}")]
    AlreadyRegistered(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // ── Crypto errors ───────────────────────────────────────────────────
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("openssl error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    // ── Plumbing ────────────────────────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Crate-level result alias.
pub type Result<T> = std::result::Result<T, HealthPkiError>;
