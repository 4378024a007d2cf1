//! Registry errors

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::resource::ResourceKind;
use crate::types::ETag;

/// Errors from registry upsert, patch and lookup operations
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Update was not newer than the stored version and no override was given.
    /// Carries the unmodified stored version.
    #[error("{kind} update rejected: not newer than stored version from {last_updated}")]
    DowngradeRejected {
        kind: ResourceKind,
        last_updated: DateTime<Utc>,
        etag: ETag,
        existing: Value,
    },

    #[error("Unknown {kind}: {id}")]
    NotFound { kind: ResourceKind, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: ResourceKind, id: String },

    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RegistryError {
    pub fn not_found(kind: ResourceKind, id: impl ToString) -> Self {
        RegistryError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Client-side errors leave the registry untouched and can be retried
    /// with a corrected request.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, RegistryError::Serialization(_))
    }
}
