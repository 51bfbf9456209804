//! Error types for the allocation engine.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants. None of the variants is retried
//! automatically: the admin re-issues the mutation.

use uuid::Uuid;

use crate::model::{EntityKind, EntityRef};
use crate::propagation::Operation;

/// Errors that can occur while validating or propagating a mutation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config, store file or agent message).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed input.
    ///
    /// Covers unparsable addresses and prefixes, ranges with `end < begin`,
    /// candidates not contained by their parent subnet, mixed address
    /// families and missing required fields.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The referenced entity does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },

    /// The candidate overlaps an existing sibling entity.
    #[error("{candidate} conflicts with {existing}")]
    Conflict {
        candidate: String,
        existing: EntityRef,
    },

    /// The entity still has live leases on the enforcement nodes.
    #[error("{kind} {id} still has {leases} live lease(s)")]
    CapacityExhausted {
        kind: EntityKind,
        id: Uuid,
        leases: u64,
    },

    /// One or more nodes failed to apply a command.
    ///
    /// `rolled_back` lists nodes that received a compensating command and
    /// `rollback_failed` lists nodes left inconsistent with storage.
    #[error("{operation} {kind} failed on node {node}: {reason}")]
    Propagation {
        operation: Operation,
        kind: EntityKind,
        node: String,
        reason: String,
        rolled_back: Vec<String>,
        rollback_failed: Vec<String>,
    },

    /// Storage, registry or node topology unavailable.
    ///
    /// The mutation is aborted before any node is contacted.
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    /// Invalid engine configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub(crate) fn not_found(kind: EntityKind, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether the caller may retry the same request unchanged.
    ///
    /// Always false: conflicts and validation failures are deterministic, and
    /// propagation failures need an admin decision because nodes may be
    /// partially configured.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(error: std::net::AddrParseError) -> Self {
        Error::Validation(error.to_string())
    }
}

impl From<ipnet::AddrParseError> for Error {
    fn from(error: ipnet::AddrParseError) -> Self {
        Error::Validation(error.to_string())
    }
}

impl From<ipnet::PrefixLenError> for Error {
    fn from(error: ipnet::PrefixLenError) -> Self {
        Error::Validation(error.to_string())
    }
}

/// A specialized Result type for allocation operations.
pub type Result<T> = std::result::Result<T, Error>;
