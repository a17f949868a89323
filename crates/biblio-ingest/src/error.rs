//! Error types for the ingestion engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fetch::FetchError;
use crate::mapping::MappingError;

/// Result type alias for ingestion operations
pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// Kinds of canonical entity managed by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Affiliation,
    Author,
    Journal,
    Document,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Affiliation => "affiliation",
            EntityKind::Author => "author",
            EntityKind::Journal => "journal",
            EntityKind::Document => "document",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for ingestion
#[derive(Error, Debug)]
pub enum IngestError {
    /// Retryable fetch failure that survived every retry attempt
    #[error("Fetch for '{identifier}' failed after {attempts} attempts: {source}")]
    TransientFetch {
        identifier: String,
        attempts: u32,
        #[source]
        source: FetchError,
    },

    #[error("Fetch for '{identifier}' failed permanently: {source}")]
    PermanentFetch {
        identifier: String,
        #[source]
        source: FetchError,
    },

    /// Contradictory data for one natural key; recovered by keeping the earliest value
    #[error("Resolution conflict on {entity} '{natural_key}': {detail}")]
    ResolutionConflict {
        entity: EntityKind,
        natural_key: String,
        detail: String,
    },

    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Malformed record '{identifier}': {reason}")]
    MalformedRecord { identifier: String, reason: String },

    #[error("Invalid {entity} draft: {reason}")]
    InvalidDraft { entity: EntityKind, reason: String },

    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),

    /// Storage failed for an entire batch; no progress can be checkpointed
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error(transparent)]
    Common(#[from] biblio_common::BiblioError),
}

/// Coarse failure classification reported per identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransientFetch,
    PermanentFetch,
    MalformedRecord,
    Mapping,
    Persistence,
    Other,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransientFetch => "transient_fetch",
            FailureKind::PermanentFetch => "permanent_fetch",
            FailureKind::MalformedRecord => "malformed_record",
            FailureKind::Mapping => "mapping",
            FailureKind::Persistence => "persistence",
            FailureKind::Other => "other",
        }
    }
}

impl IngestError {
    /// Classify for per-identifier reporting
    pub fn kind(&self) -> FailureKind {
        match self {
            IngestError::TransientFetch { .. } => FailureKind::TransientFetch,
            IngestError::PermanentFetch { .. } => FailureKind::PermanentFetch,
            IngestError::MalformedRecord { .. } => FailureKind::MalformedRecord,
            IngestError::Mapping(_) => FailureKind::Mapping,
            IngestError::Persistence(_)
            | IngestError::Migration(_)
            | IngestError::StorageUnavailable(_) => FailureKind::Persistence,
            IngestError::ResolutionConflict { .. }
            | IngestError::InvalidDraft { .. }
            | IngestError::Common(_) => FailureKind::Other,
        }
    }

    /// True when the failure came from the storage layer
    pub fn is_storage(&self) -> bool {
        self.kind() == FailureKind::Persistence
    }
}
