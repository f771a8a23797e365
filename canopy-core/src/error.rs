//! Error types for CANOPY operations.

use crate::{DataSourceId, EntityKind, NodeIndex};
use thiserror::Error;
use uuid::Uuid;

/// Store-layer errors (environment, tables, transactions).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to open store environment: {reason}")]
    EnvOpen { reason: String },

    #[error("Failed to open table {table}: {reason}")]
    TableOpen {
        table: &'static str,
        reason: String,
    },

    #[error("Transaction error: {reason}")]
    Transaction { reason: String },

    /// Transient write contention on the durable store. Recovered by the
    /// transaction guard's bounded retry.
    #[error("Store busy: {reason}")]
    Busy { reason: String },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Deserialization error: {reason}")]
    Deserialization { reason: String },

    /// The store handle was poisoned by a failed maintenance step; every
    /// subsequent call on it fails with this.
    #[error("Store closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether a bounded immediate retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Busy { .. })
    }
}

/// Internal-consistency violations. Fatal: the affected operation aborts and
/// nothing retries these locally.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsistencyError {
    /// A row the store claims to reference does not exist.
    #[error("Missing {entity:?} row for id {id}")]
    MissingRow { entity: EntityKind, id: Uuid },

    /// A nil id reached an operation that requires a real identity. This is
    /// a caller programming error, not a cache miss.
    #[error("Invalid nil id for {entity:?}")]
    InvalidId { entity: EntityKind },

    #[error("Duplicate sibling index {index} under data source {data_source_id}")]
    DuplicateIndex {
        data_source_id: DataSourceId,
        index: NodeIndex,
    },

    /// A child row outlived its direct parent.
    #[error("Orphaned {entity:?} row {id}: missing {parent:?} {parent_id}")]
    OrphanedRow {
        entity: EntityKind,
        id: Uuid,
        parent: EntityKind,
        parent_id: Uuid,
    },

    /// A stored sort key failed to decode.
    #[error("Corrupt index encoding: {reason}")]
    CorruptIndex { reason: String },
}

impl From<crate::IndexCodecError> for ConsistencyError {
    fn from(e: crate::IndexCodecError) -> Self {
        ConsistencyError::CorruptIndex {
            reason: e.to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all CANOPY operations.
#[derive(Debug, Error)]
pub enum CanopyError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Consistency error: {0}")]
    Consistency(#[from] ConsistencyError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CanopyError {
    /// Whether the error is a transient store condition worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, CanopyError::Store(e) if e.is_transient())
    }
}

/// Result type alias for CANOPY operations.
pub type CanopyResult<T> = Result<T, CanopyError>;

/// Result type alias for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_transience() {
        assert!(StoreError::Busy {
            reason: "writer active".to_string()
        }
        .is_transient());
        assert!(!StoreError::Closed.is_transient());
    }

    #[test]
    fn test_missing_row_display() {
        let err = ConsistencyError::MissingRow {
            entity: EntityKind::DataSource,
            id: Uuid::nil(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Missing"));
        assert!(msg.contains("DataSource"));
        assert!(msg.contains("00000000-0000-0000-0000-000000000000"));
    }

    #[test]
    fn test_master_error_from_variants() {
        let store = CanopyError::from(StoreError::Closed);
        assert!(matches!(store, CanopyError::Store(_)));
        assert!(!store.is_transient());

        let busy = CanopyError::from(StoreError::Busy {
            reason: "writer active".to_string(),
        });
        assert!(busy.is_transient());

        let consistency = CanopyError::from(ConsistencyError::InvalidId {
            entity: EntityKind::HierarchyLevel,
        });
        assert!(matches!(consistency, CanopyError::Consistency(_)));

        let config = CanopyError::from(ConfigError::MissingRequired {
            field: "size_limit".to_string(),
        });
        assert!(matches!(config, CanopyError::Config(_)));
    }

    #[test]
    fn test_codec_error_conversion() {
        let err: ConsistencyError = crate::IndexCodecError::InvalidLength { len: 3 }.into();
        assert!(matches!(err, ConsistencyError::CorruptIndex { .. }));
    }
}
