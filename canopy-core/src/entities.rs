//! Core entity structures.
//!
//! Pure data rows as they live in either cache tier. Cross-entity
//! relationships are id references resolved through a tier, never live
//! pointers.

use crate::{
    ClassId, DataSourceId, HierarchyLevelId, NodeId, NodeIndex, RawContent, RemovalId, RulesetId,
    Timestamp, VariablesId,
};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity kind discriminator for errors and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Ruleset,
    Variables,
    HierarchyLevel,
    DataSource,
    DataSourceClass,
    Node,
    NodeKey,
    NodeInstance,
    MergedNode,
}

/// Ruleset - the root owner of cached hierarchy content.
///
/// Everything the cache holds is transitively owned by exactly one ruleset;
/// eviction removes whole rulesets and nothing smaller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ruleset {
    pub ruleset_id: RulesetId,
    /// Caller-facing ruleset name, unique among live rulesets.
    pub identifier: String,
    /// Recency marker driving LRU eviction and staleness protection.
    pub last_used_at: Timestamp,
}

/// Named variable values scoped to a ruleset.
///
/// A distinct values combination distinguishes alternative computations
/// ("variations") of the same hierarchy level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulesetVariables {
    pub variables_id: VariablesId,
    pub ruleset_id: RulesetId,
    pub values: serde_json::Value,
    pub last_used_at: Timestamp,
}

/// HierarchyLevel - the set of sibling positions produced for one parent
/// under one ruleset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyLevel {
    pub level_id: HierarchyLevelId,
    pub ruleset_id: RulesetId,
    /// True storage parent; `None` for a root level.
    pub physical_parent_node_id: Option<NodeId>,
    /// Display parent after grouping/merging adjustments, when it differs
    /// from the physical parent.
    pub virtual_parent_node_id: Option<NodeId>,
    /// Set when this level generation has been superseded and awaits reuse
    /// or cleanup.
    pub removal_id: Option<RemovalId>,
}

impl HierarchyLevel {
    /// Whether this level has been superseded.
    pub fn is_removed(&self) -> bool {
        self.removal_id.is_some()
    }
}

/// DataSource - one computed instantiation of a hierarchy level for a
/// specific ruleset-variables combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub data_source_id: DataSourceId,
    pub level_id: HierarchyLevelId,
    /// Self-reference for nested data sources.
    pub parent_data_source_id: Option<DataSourceId>,
    /// Variables combination this variation was computed with, if any.
    pub variables_id: Option<VariablesId>,
    /// Whether the producer finished filling this source with nodes.
    pub is_initialized: bool,
}

/// Class tag attached to a data source, used for invalidation matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassTag {
    pub class_id: ClassId,
    pub is_polymorphic: bool,
}

/// Persisted class-tag row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataSourceClass {
    pub data_source_id: DataSourceId,
    pub class_id: ClassId,
    pub is_polymorphic: bool,
}

/// Node display/grouping state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum NodeVisibility {
    /// Shown in the hierarchy.
    #[default]
    Visible,
    /// Hidden itself, its children displayed in its place.
    Virtual,
    /// Hidden along with its subtree.
    Hidden,
}

impl fmt::Display for NodeVisibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeVisibility::Visible => "Visible",
            NodeVisibility::Virtual => "Virtual",
            NodeVisibility::Hidden => "Hidden",
        };
        write!(f, "{}", s)
    }
}

/// Node - one cached hierarchy entry, owned by exactly one data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub data_source_id: DataSourceId,
    pub visibility: NodeVisibility,
    /// Ordered position among siblings of the owning data source. Unique
    /// within the data source.
    pub index: NodeIndex,
    /// Serialized node content, opaque to the cache.
    pub payload: RawContent,
    pub label: String,
    /// Query producing the node's instance keys, when the producer supplied
    /// one instead of materialized keys.
    pub instance_keys_query: Option<String>,
}

/// Persisted node-instance-key row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInstance {
    pub node_id: NodeId,
    pub key: crate::InstanceKey,
}

/// Merged-node edge: the merging node logically absorbs the merged node.
///
/// A merging node's effective virtual-parent set is the union of its merged
/// nodes' virtual parents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MergedNode {
    pub merging_node_id: NodeId,
    pub merged_node_id: NodeId,
}

// ============================================================================
// CALLER-FACING DESCRIPTORS
// ============================================================================

/// Identifies a hierarchy level to be cached, before it has an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyLevelIdentifier {
    pub ruleset_identifier: String,
    pub physical_parent_node_id: Option<NodeId>,
    pub virtual_parent_node_id: Option<NodeId>,
}

impl HierarchyLevelIdentifier {
    /// Identifier for a root level of the given ruleset.
    pub fn root(ruleset_identifier: impl Into<String>) -> Self {
        Self {
            ruleset_identifier: ruleset_identifier.into(),
            physical_parent_node_id: None,
            virtual_parent_node_id: None,
        }
    }
}

/// Describes a data source to be cached or updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceInfo {
    /// `None` for a source that has not been persisted yet.
    pub data_source_id: Option<DataSourceId>,
    pub level_id: HierarchyLevelId,
    pub parent_data_source_id: Option<DataSourceId>,
    pub variables_id: Option<VariablesId>,
    pub is_initialized: bool,
    pub classes: Vec<ClassTag>,
}

impl DataSourceInfo {
    /// Describe a fresh, uninitialized source for a level.
    pub fn new(level_id: HierarchyLevelId) -> Self {
        Self {
            data_source_id: None,
            level_id,
            parent_data_source_id: None,
            variables_id: None,
            is_initialized: false,
            classes: Vec::new(),
        }
    }
}

bitflags! {
    /// Which fields of a [`DataSourceInfo`] an update applies.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DataSourceParts: u32 {
        const PARENT         = 1 << 0;
        const VARIABLES      = 1 << 1;
        const IS_INITIALIZED = 1 << 2;
        const CLASSES        = 1 << 3;
    }
}
