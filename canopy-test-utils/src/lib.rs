//! CANOPY Test Utilities
//!
//! Centralized test infrastructure for the CANOPY workspace:
//! - Fixture builders for every entity type
//! - A tempdir-backed cache harness
//! - Helpers seeding complete ruleset trees into a durable tier

// Re-export core and cache types for convenience
pub use canopy_cache::{DiskTier, HierarchyCache, OverlayTier};
pub use canopy_core::{
    CacheConfig, DataSource, DataSourceId, DataSourceInfo, HierarchyLevel, HierarchyLevelId,
    HierarchyLevelIdentifier, InstanceKey, Node, NodeId, NodeIndex, NodeKey, NodeVisibility,
    Ruleset, RulesetId, RulesetVariables, Timestamp, VariablesId, compute_path_hash,
};

use chrono::Utc;
use tempfile::TempDir;

/// A durable tier in a temp directory, plus the directory guard keeping it
/// alive.
pub struct TempTier {
    pub disk: DiskTier,
    pub dir: TempDir,
}

/// Open a fresh durable tier in a temp directory.
pub fn temp_tier() -> TempTier {
    temp_tier_with(&CacheConfig::default())
}

/// Open a fresh durable tier with a specific configuration.
pub fn temp_tier_with(config: &CacheConfig) -> TempTier {
    let dir = TempDir::new().expect("TempDir creation should succeed");
    let disk = DiskTier::open(dir.path(), config).expect("disk tier should open");
    TempTier { disk, dir }
}

/// A wrapped cache in a temp directory.
pub struct TempCache {
    pub cache: HierarchyCache,
    pub dir: TempDir,
}

/// Open a fresh two-tier cache in a temp directory.
pub fn temp_cache() -> TempCache {
    temp_cache_with(CacheConfig::default())
}

/// Open a fresh two-tier cache with a specific configuration.
pub fn temp_cache_with(config: CacheConfig) -> TempCache {
    let dir = TempDir::new().expect("TempDir creation should succeed");
    let disk = DiskTier::open(dir.path(), &config).expect("disk tier should open");
    TempCache {
        cache: HierarchyCache::new(disk, config),
        dir,
    }
}

// ============================================================================
// FIXTURE BUILDERS
// ============================================================================

/// A ruleset used at the given time.
pub fn make_ruleset(identifier: &str, last_used_at: Timestamp) -> Ruleset {
    Ruleset {
        ruleset_id: RulesetId::now_v7(),
        identifier: identifier.to_string(),
        last_used_at,
    }
}

/// A root hierarchy level owned by `ruleset_id`.
pub fn make_root_level(ruleset_id: RulesetId) -> HierarchyLevel {
    HierarchyLevel {
        level_id: HierarchyLevelId::now_v7(),
        ruleset_id,
        physical_parent_node_id: None,
        virtual_parent_node_id: None,
        removal_id: None,
    }
}

/// A child hierarchy level below `parent`.
pub fn make_child_level(ruleset_id: RulesetId, parent: NodeId) -> HierarchyLevel {
    HierarchyLevel {
        level_id: HierarchyLevelId::now_v7(),
        ruleset_id,
        physical_parent_node_id: Some(parent),
        virtual_parent_node_id: Some(parent),
        removal_id: None,
    }
}

/// An initialized data source for `level_id` without variables.
pub fn make_data_source(level_id: HierarchyLevelId) -> DataSource {
    DataSource {
        data_source_id: DataSourceId::now_v7(),
        level_id,
        parent_data_source_id: None,
        variables_id: None,
        is_initialized: true,
    }
}

/// A variables combination for `ruleset_id` used at the given time.
pub fn make_variables(ruleset_id: RulesetId, last_used_at: Timestamp) -> RulesetVariables {
    RulesetVariables {
        variables_id: VariablesId::now_v7(),
        ruleset_id,
        values: serde_json::json!({ "mode": "default" }),
        last_used_at,
    }
}

/// A visible node under `data_source_id` at sibling position `ordinal`.
pub fn make_node(data_source_id: DataSourceId, ordinal: u64, label: &str) -> Node {
    Node {
        node_id: NodeId::now_v7(),
        data_source_id,
        visibility: NodeVisibility::Visible,
        index: NodeIndex::new(vec![ordinal]),
        payload: b"{}".to_vec(),
        label: label.to_string(),
        instance_keys_query: None,
    }
}

/// A generic node key whose path hash is the node's own id.
pub fn make_custom_key(node_id: NodeId) -> NodeKey {
    NodeKey::Custom {
        kind: "test".to_string(),
        specification_id: "spec-1".to_string(),
        path_hash: compute_path_hash(&[node_id]),
    }
}

// ============================================================================
// TREE SEEDING
// ============================================================================

/// Everything [`seed_ruleset_tree`] wrote to the durable tier.
pub struct SeededTree {
    pub ruleset: Ruleset,
    pub level: HierarchyLevel,
    pub source: DataSource,
    pub nodes: Vec<Node>,
}

/// Seed a complete ruleset tree (ruleset, root level + marker, one data
/// source, `node_count` nodes) directly into a durable tier.
pub fn seed_ruleset_tree(
    disk: &DiskTier,
    identifier: &str,
    last_used_at: Timestamp,
    node_count: u64,
) -> SeededTree {
    let ruleset = make_ruleset(identifier, last_used_at);
    let level = make_root_level(ruleset.ruleset_id);
    let source = make_data_source(level.level_id);
    let mut nodes = Vec::new();

    let mut wtxn = disk.begin_write().expect("begin_write should succeed");
    disk.put_ruleset(&mut wtxn, &ruleset).expect("put ruleset");
    disk.put_hierarchy_level(&mut wtxn, &level).expect("put level");
    disk.put_physical_marker_if_absent(&mut wtxn, ruleset.ruleset_id, None, None, level.level_id)
        .expect("put marker");
    disk.put_data_source(&mut wtxn, &source).expect("put source");
    for ordinal in 0..node_count {
        let node = make_node(
            source.data_source_id,
            ordinal,
            &format!("{identifier}-{ordinal}"),
        );
        disk.put_node(&mut wtxn, &node).expect("put node");
        disk.put_node_key(&mut wtxn, node.node_id, &make_custom_key(node.node_id))
            .expect("put key");
        nodes.push(node);
    }
    wtxn.commit().expect("commit should succeed");

    SeededTree {
        ruleset,
        level,
        source,
        nodes,
    }
}

/// Seed a tree used `age_seconds` ago.
pub fn seed_aged_ruleset_tree(
    disk: &DiskTier,
    identifier: &str,
    age_seconds: i64,
    node_count: u64,
) -> SeededTree {
    seed_ruleset_tree(
        disk,
        identifier,
        Utc::now() - chrono::Duration::seconds(age_seconds),
        node_count,
    )
}
