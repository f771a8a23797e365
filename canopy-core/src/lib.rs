//! CANOPY Core - Entity Types
//!
//! Pure data structures for the CANOPY hierarchy cache. All other crates
//! depend on this. This crate contains ONLY data types and codecs - no
//! storage or policy logic.

pub mod config;
pub mod entities;
pub mod error;
pub mod ids;
pub mod index;
pub mod keys;

pub use config::{
    CacheConfig, DEFAULT_BUSY_RETRY_CAP, DEFAULT_MAP_SIZE_MB, DEFAULT_STALE_WINDOW,
    DEFAULT_VARIATION_THRESHOLD,
};
pub use entities::{
    ClassTag, DataSource, DataSourceClass, DataSourceInfo, DataSourceParts, EntityKind,
    HierarchyLevel, HierarchyLevelIdentifier, MergedNode, Node, NodeInstance, NodeVisibility,
    Ruleset, RulesetVariables,
};
pub use error::{
    CanopyError, CanopyResult, ConfigError, ConfigResult, ConsistencyError, StoreError,
};
pub use ids::{
    ClassId, DataSourceId, EntityIdType, HierarchyLevelId, InstanceId, NodeId, RawContent,
    RemovalId, RulesetId, Timestamp, VariablesId,
};
pub use index::{IndexCodec, IndexCodecError, NodeIndex};
pub use keys::{compute_path_hash, InstanceKey, NodeKey};
