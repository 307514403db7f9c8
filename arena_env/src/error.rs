//! Error types for the Arena host abstraction.

use thiserror::Error;

/// Errors raised by host collaborators.
#[derive(Debug, Error)]
pub enum EnvError {
    /// A collaborator (registry, generator backend) is not available
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Procedural generator could not be constructed
    #[error("Generation error: {0}")]
    Generation(String),

    /// Persistence backend failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Session lookup or relocation failed
    #[error("Session error: {0}")]
    Session(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates an unavailable error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Creates a persistence error.
    pub fn persistence(msg: impl std::fmt::Display) -> Self {
        Self::Persistence(msg.to_string())
    }

    /// Creates a session error.
    pub fn session(msg: impl std::fmt::Display) -> Self {
        Self::Session(msg.to_string())
    }
}
