//! Logical table layout shared by both cache tiers.
//!
//! Table names, composite key builders and row codecs live here so every
//! component binds rows the same way. Keys are built by these functions
//! only, never concatenated ad hoc at call sites.

use canopy_core::{
    ClassId, DataSourceId, EntityIdType, HierarchyLevelId, IndexCodec, InstanceKey, NodeId,
    NodeIndex, RemovalId, RulesetId, StoreError,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const TABLE_RULESETS: &str = "rulesets";
pub const TABLE_VARIABLES: &str = "variables";
pub const TABLE_HIERARCHY_LEVELS: &str = "hierarchy_levels";
pub const TABLE_PHYSICAL_LEVELS: &str = "physical_levels";
pub const TABLE_DATA_SOURCES: &str = "data_sources";
pub const TABLE_DATA_SOURCE_CLASSES: &str = "data_source_classes";
pub const TABLE_NODES: &str = "nodes";
pub const TABLE_NODE_KEYS: &str = "node_keys";
pub const TABLE_NODE_INSTANCES: &str = "node_instances";
pub const TABLE_MERGED_NODES: &str = "merged_nodes";
pub const TABLE_NODE_ORDER: &str = "node_order";

/// Number of named databases the durable environment must allow.
pub const TABLE_COUNT: u32 = 11;

/// Primary key of an id-keyed table.
pub fn id_key<I: EntityIdType>(id: I) -> [u8; 16] {
    id.to_bytes()
}

/// Key of the physical-level uniqueness marker:
/// `(ruleset_id, physical_parent_node_id, removal_id)`, nil-filled for
/// absent components so the triple stays fixed-width.
pub fn physical_level_key(
    ruleset_id: RulesetId,
    physical_parent: Option<NodeId>,
    removal_id: Option<RemovalId>,
) -> [u8; 48] {
    let mut key = [0u8; 48];
    key[..16].copy_from_slice(&ruleset_id.to_bytes());
    key[16..32].copy_from_slice(&physical_parent.unwrap_or_else(NodeId::nil).to_bytes());
    key[32..].copy_from_slice(&removal_id.unwrap_or_else(RemovalId::nil).to_bytes());
    key
}

/// Inverse of [`physical_level_key`]; nil components decode to `None`.
pub fn decode_physical_level_key(key: &[u8; 48]) -> (RulesetId, Option<NodeId>, Option<RemovalId>) {
    let mut ruleset = [0u8; 16];
    let mut parent = [0u8; 16];
    let mut removal = [0u8; 16];
    ruleset.copy_from_slice(&key[..16]);
    parent.copy_from_slice(&key[16..32]);
    removal.copy_from_slice(&key[32..]);
    let parent = NodeId::from_bytes(parent);
    let removal = RemovalId::from_bytes(removal);
    (
        RulesetId::from_bytes(ruleset),
        (!parent.is_nil()).then_some(parent),
        (!removal.is_nil()).then_some(removal),
    )
}

/// Key of a data-source class tag row.
pub fn class_key(data_source_id: DataSourceId, class_id: ClassId) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..16].copy_from_slice(&data_source_id.to_bytes());
    key[16..].copy_from_slice(&class_id.to_be_bytes());
    key
}

/// Key of a node-instance row.
pub fn node_instance_key(node_id: NodeId, key: InstanceKey) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    bytes[..16].copy_from_slice(&node_id.to_bytes());
    bytes[16..24].copy_from_slice(&key.class_id.to_be_bytes());
    bytes[24..].copy_from_slice(&key.instance_id.to_be_bytes());
    bytes
}

/// Key of a merged-node edge row.
pub fn merged_node_key(merging: NodeId, merged: NodeId) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    bytes[..16].copy_from_slice(&merging.to_bytes());
    bytes[16..].copy_from_slice(&merged.to_bytes());
    bytes
}

/// Key of the sibling-order index: data source id followed by the binary
/// index encoding, so the store's bytewise key order is the sibling order.
pub fn node_order_key(data_source_id: DataSourceId, index: &NodeIndex) -> Vec<u8> {
    let encoded = IndexCodec::encode_binary(index);
    let mut key = Vec::with_capacity(16 + encoded.len());
    key.extend_from_slice(&data_source_id.to_bytes());
    key.extend_from_slice(&encoded);
    key
}

/// Serialize a row value.
pub fn encode_row<T: Serialize>(row: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(row).map_err(|e| StoreError::Serialization {
        reason: e.to_string(),
    })
}

/// Deserialize a row value.
pub fn decode_row<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialization {
        reason: e.to_string(),
    })
}
