//! error types for lockwarden

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // === storage errors ===
    #[error("flash error: {0}")]
    Flash(String),

    #[error("storage error: {0}")]
    Storage(String),

    // === capacity errors ===
    #[error("anti-rollback log full: {capacity} slots used")]
    CounterFull { capacity: usize },

    #[error("anti-rollback counter overflow")]
    CounterOverflow,

    #[error("side flag out of range: {0} (max 15)")]
    InvalidFlag(u8),

    // === lockout errors ===
    #[error("unlock secret already provisioned")]
    AlreadyProvisioned,

    #[error("wrap failed: {0}")]
    Wrap(String),

    #[error("unwrap failed: {0}")]
    Unwrap(String),

    #[error("device erase failed: {0}")]
    Erase(String),

    // === encoding errors ===
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("invalid derivation path: {0}")]
    InvalidPath(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    // === collaborator failures ===
    #[error("internal error: {0}")]
    Internal(String),
}
