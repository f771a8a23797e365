//! In-memory cache tier.
//!
//! A session-private arena of entity rows keyed by id, mirroring selected
//! durable rows plus everything the producer wrote since the overlay was
//! created. Relationships are id references resolved through the arena,
//! which also makes the "does X exist in this tier" queries the selection
//! policy needs cheap.
//!
//! The overlay remembers which hierarchy levels it merely mirrors from disk
//! (`levels_copied_from_disk`); a level with overlay-only content is removed
//! from that set so level reads stop deferring to the durable tier.

use std::collections::{BTreeMap, HashMap, HashSet};

use canopy_core::{
    ClassId, ClassTag, DataSource, DataSourceClass, DataSourceId, HierarchyLevel,
    HierarchyLevelId, IndexCodec, InstanceKey, MergedNode, Node, NodeId, NodeInstance, NodeKey,
    RemovalId, Ruleset, RulesetId, RulesetVariables, VariablesId,
};

use crate::schema::physical_level_key;

/// The in-memory cache tier.
#[derive(Debug, Default)]
pub struct OverlayTier {
    rulesets: BTreeMap<RulesetId, Ruleset>,
    rulesets_by_identifier: HashMap<String, RulesetId>,
    variables: BTreeMap<VariablesId, RulesetVariables>,
    levels: BTreeMap<HierarchyLevelId, HierarchyLevel>,
    physical_markers: BTreeMap<[u8; 48], HierarchyLevelId>,
    data_sources: BTreeMap<DataSourceId, DataSource>,
    classes: BTreeMap<(DataSourceId, ClassId), DataSourceClass>,
    nodes: BTreeMap<NodeId, Node>,
    node_keys: BTreeMap<NodeId, NodeKey>,
    node_instances: BTreeMap<(NodeId, InstanceKey), NodeInstance>,
    merged: BTreeMap<(NodeId, NodeId), MergedNode>,
    node_order: BTreeMap<(DataSourceId, Vec<u8>), NodeId>,
    levels_copied_from_disk: HashSet<HierarchyLevelId>,
}

impl OverlayTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the overlay holds no rows at all.
    pub fn is_empty(&self) -> bool {
        self.rulesets.is_empty()
            && self.variables.is_empty()
            && self.levels.is_empty()
            && self.data_sources.is_empty()
            && self.nodes.is_empty()
    }

    // ========================================================================
    // RULESETS & VARIABLES
    // ========================================================================

    pub fn contains_ruleset(&self, id: RulesetId) -> bool {
        self.rulesets.contains_key(&id)
    }

    pub fn get_ruleset(&self, id: RulesetId) -> Option<&Ruleset> {
        self.rulesets.get(&id)
    }

    pub fn find_ruleset_by_identifier(&self, identifier: &str) -> Option<&Ruleset> {
        self.rulesets_by_identifier
            .get(identifier)
            .and_then(|id| self.rulesets.get(id))
    }

    pub fn insert_ruleset(&mut self, ruleset: Ruleset) {
        self.rulesets_by_identifier
            .insert(ruleset.identifier.clone(), ruleset.ruleset_id);
        self.rulesets.insert(ruleset.ruleset_id, ruleset);
    }

    /// Move a ruleset's recency marker forward.
    pub fn touch_ruleset(&mut self, id: RulesetId, at: canopy_core::Timestamp) {
        if let Some(ruleset) = self.rulesets.get_mut(&id) {
            if at > ruleset.last_used_at {
                ruleset.last_used_at = at;
            }
        }
    }

    pub fn iter_rulesets(&self) -> impl Iterator<Item = &Ruleset> {
        self.rulesets.values()
    }

    pub fn contains_variables(&self, id: VariablesId) -> bool {
        self.variables.contains_key(&id)
    }

    pub fn get_variables(&self, id: VariablesId) -> Option<&RulesetVariables> {
        self.variables.get(&id)
    }

    pub fn insert_variables(&mut self, vars: RulesetVariables) {
        self.variables.insert(vars.variables_id, vars);
    }

    pub fn iter_variables(&self) -> impl Iterator<Item = &RulesetVariables> {
        self.variables.values()
    }

    // ========================================================================
    // HIERARCHY LEVELS & PHYSICAL MARKERS
    // ========================================================================

    pub fn contains_level(&self, id: HierarchyLevelId) -> bool {
        self.levels.contains_key(&id)
    }

    pub fn get_level(&self, id: HierarchyLevelId) -> Option<&HierarchyLevel> {
        self.levels.get(&id)
    }

    /// Insert a level row and claim its uniqueness-marker triple. A marker
    /// already claimed by another level is re-pointed: within the overlay the
    /// newest row for a triple is authoritative.
    pub fn insert_level(&mut self, level: HierarchyLevel) {
        let key = physical_level_key(
            level.ruleset_id,
            level.physical_parent_node_id,
            level.removal_id,
        );
        self.physical_markers.insert(key, level.level_id);
        self.levels.insert(level.level_id, level);
    }

    pub fn find_level(
        &self,
        ruleset_id: RulesetId,
        physical_parent: Option<NodeId>,
        removal_id: Option<RemovalId>,
    ) -> Option<&HierarchyLevel> {
        let key = physical_level_key(ruleset_id, physical_parent, removal_id);
        self.physical_markers
            .get(&key)
            .and_then(|id| self.levels.get(id))
    }

    /// Non-removed levels of a ruleset whose virtual parent is in `parents`.
    pub fn levels_with_virtual_parent(
        &self,
        ruleset_id: RulesetId,
        parents: &[Option<NodeId>],
    ) -> Vec<&HierarchyLevel> {
        self.levels
            .values()
            .filter(|level| {
                level.ruleset_id == ruleset_id
                    && !level.is_removed()
                    && parents.contains(&level.virtual_parent_node_id)
            })
            .collect()
    }

    pub fn iter_levels(&self) -> impl Iterator<Item = &HierarchyLevel> {
        self.levels.values()
    }

    pub fn iter_physical_markers(
        &self,
    ) -> impl Iterator<Item = (&[u8; 48], &HierarchyLevelId)> {
        self.physical_markers.iter()
    }

    /// Record that a level was mirrored from disk without modification.
    pub fn mark_level_copied_from_disk(&mut self, id: HierarchyLevelId) {
        self.levels_copied_from_disk.insert(id);
    }

    /// Record that a level gained overlay-only content.
    pub fn mark_level_modified(&mut self, id: HierarchyLevelId) {
        self.levels_copied_from_disk.remove(&id);
    }

    /// Whether the level is a plain mirror of the durable row.
    pub fn was_level_copied_from_disk(&self, id: HierarchyLevelId) -> bool {
        self.levels_copied_from_disk.contains(&id)
    }

    /// Tag a level as superseded, re-keying its uniqueness marker so the
    /// live triple becomes claimable by a successor. Returns false when the
    /// level is not in the overlay.
    pub fn supersede_level(&mut self, level_id: HierarchyLevelId, removal_id: RemovalId) -> bool {
        let Some(mut level) = self.levels.remove(&level_id) else {
            return false;
        };
        let old_key = physical_level_key(
            level.ruleset_id,
            level.physical_parent_node_id,
            level.removal_id,
        );
        if self.physical_markers.get(&old_key) == Some(&level_id) {
            self.physical_markers.remove(&old_key);
        }
        level.removal_id = Some(removal_id);
        self.insert_level(level);
        self.levels_copied_from_disk.remove(&level_id);
        true
    }

    /// Drop every level carrying this removal tag, cascading to its sources
    /// and their nodes.
    pub fn discard_removed_levels(&mut self, removal_id: RemovalId) -> usize {
        let doomed: Vec<HierarchyLevelId> = self
            .levels
            .values()
            .filter(|level| level.removal_id == Some(removal_id))
            .map(|level| level.level_id)
            .collect();
        for level_id in &doomed {
            let sources: Vec<DataSourceId> = self
                .data_sources
                .values()
                .filter(|source| source.level_id == *level_id)
                .map(|source| source.data_source_id)
                .collect();
            for source_id in sources {
                self.remove_data_source_cascade(source_id);
            }
            if let Some(level) = self.levels.remove(level_id) {
                let key = physical_level_key(
                    level.ruleset_id,
                    level.physical_parent_node_id,
                    level.removal_id,
                );
                if self.physical_markers.get(&key) == Some(level_id) {
                    self.physical_markers.remove(&key);
                }
            }
            self.levels_copied_from_disk.remove(level_id);
        }
        doomed.len()
    }

    // ========================================================================
    // DATA SOURCES & CLASSES
    // ========================================================================

    pub fn contains_data_source(&self, id: DataSourceId) -> bool {
        self.data_sources.contains_key(&id)
    }

    pub fn get_data_source(&self, id: DataSourceId) -> Option<&DataSource> {
        self.data_sources.get(&id)
    }

    pub fn get_data_source_mut(&mut self, id: DataSourceId) -> Option<&mut DataSource> {
        self.data_sources.get_mut(&id)
    }

    pub fn insert_data_source(&mut self, source: DataSource) {
        self.data_sources.insert(source.data_source_id, source);
    }

    pub fn find_data_source(
        &self,
        level_id: HierarchyLevelId,
        variables_id: Option<VariablesId>,
    ) -> Option<&DataSource> {
        self.data_sources
            .values()
            .find(|source| source.level_id == level_id && source.variables_id == variables_id)
    }

    pub fn sources_for_level(&self, level_id: HierarchyLevelId) -> Vec<&DataSource> {
        self.data_sources
            .values()
            .filter(|source| source.level_id == level_id)
            .collect()
    }

    pub fn iter_data_sources(&self) -> impl Iterator<Item = &DataSource> {
        self.data_sources.values()
    }

    pub fn set_classes(&mut self, data_source_id: DataSourceId, tags: &[ClassTag]) {
        let doomed: Vec<(DataSourceId, ClassId)> = self
            .classes
            .range((data_source_id, ClassId::MIN)..=(data_source_id, ClassId::MAX))
            .map(|(key, _)| *key)
            .collect();
        for key in doomed {
            self.classes.remove(&key);
        }
        for tag in tags {
            self.classes.insert(
                (data_source_id, tag.class_id),
                DataSourceClass {
                    data_source_id,
                    class_id: tag.class_id,
                    is_polymorphic: tag.is_polymorphic,
                },
            );
        }
    }

    pub fn classes_for_source(&self, data_source_id: DataSourceId) -> Vec<ClassTag> {
        self.classes
            .range((data_source_id, ClassId::MIN)..=(data_source_id, ClassId::MAX))
            .map(|(_, class)| ClassTag {
                class_id: class.class_id,
                is_polymorphic: class.is_polymorphic,
            })
            .collect()
    }

    fn remove_data_source_cascade(&mut self, id: DataSourceId) {
        let node_ids: Vec<NodeId> = self
            .node_order
            .range((id, Vec::new())..)
            .take_while(|((source, _), _)| *source == id)
            .map(|(_, node_id)| *node_id)
            .collect();
        for node_id in node_ids {
            self.remove_node_cascade(node_id);
        }
        self.set_classes(id, &[]);
        self.data_sources.remove(&id);
    }

    // ========================================================================
    // NODES, KEYS, INSTANCES, MERGED EDGES
    // ========================================================================

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn get_node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    /// Whether a sibling already occupies this index under the data source.
    pub fn has_node_at_index(
        &self,
        data_source_id: DataSourceId,
        index: &canopy_core::NodeIndex,
    ) -> Option<NodeId> {
        self.node_order
            .get(&(data_source_id, IndexCodec::encode_binary(index)))
            .copied()
    }

    /// Insert a node row group: the node, its key, and its instance rows.
    pub fn insert_node(&mut self, node: Node, key: Option<NodeKey>, instances: &[InstanceKey]) {
        if let Some(existing) = self.nodes.get(&node.node_id) {
            let old_key = (
                existing.data_source_id,
                IndexCodec::encode_binary(&existing.index),
            );
            self.node_order.remove(&old_key);
        }
        self.node_order.insert(
            (node.data_source_id, IndexCodec::encode_binary(&node.index)),
            node.node_id,
        );
        if let Some(key) = key {
            self.node_keys.insert(node.node_id, key);
        }
        for instance in instances {
            self.node_instances.insert(
                (node.node_id, *instance),
                NodeInstance {
                    node_id: node.node_id,
                    key: *instance,
                },
            );
        }
        self.nodes.insert(node.node_id, node);
    }

    pub fn get_node_key(&self, id: NodeId) -> Option<&NodeKey> {
        self.node_keys.get(&id)
    }

    pub fn find_node_by_key(&self, key: &NodeKey) -> Option<&Node> {
        self.node_keys
            .iter()
            .find(|(_, stored)| *stored == key)
            .and_then(|(id, _)| self.nodes.get(id))
    }

    pub fn instances_for_node(&self, id: NodeId) -> Vec<NodeInstance> {
        self.node_instances
            .range((id, InstanceKey::new(0, 0))..)
            .take_while(|((node_id, _), _)| *node_id == id)
            .map(|(_, instance)| *instance)
            .collect()
    }

    pub fn insert_merged_edge(&mut self, edge: MergedNode) {
        self.merged
            .insert((edge.merging_node_id, edge.merged_node_id), edge);
    }

    pub fn merged_nodes_of(&self, merging: NodeId) -> Vec<MergedNode> {
        self.merged
            .range((merging, NodeId::nil())..)
            .take_while(|((merging_id, _), _)| *merging_id == merging)
            .map(|(_, edge)| *edge)
            .collect()
    }

    pub fn node_count_for_source(&self, data_source_id: DataSourceId) -> u64 {
        self.node_order
            .range((data_source_id, Vec::new())..)
            .take_while(|((source, _), _)| *source == data_source_id)
            .count() as u64
    }

    /// Node ids under a data source in sibling order.
    pub fn node_ids_for_source(&self, data_source_id: DataSourceId) -> Vec<NodeId> {
        self.node_order
            .range((data_source_id, Vec::new())..)
            .take_while(|((source, _), _)| *source == data_source_id)
            .map(|(_, node_id)| *node_id)
            .collect()
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    fn remove_node_cascade(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(&id) {
            self.node_order.remove(&(
                node.data_source_id,
                IndexCodec::encode_binary(&node.index),
            ));
        }
        self.node_keys.remove(&id);
        let instance_keys: Vec<(NodeId, InstanceKey)> = self
            .node_instances
            .range((id, InstanceKey::new(0, 0))..)
            .take_while(|((node_id, _), _)| *node_id == id)
            .map(|(key, _)| *key)
            .collect();
        for key in instance_keys {
            self.node_instances.remove(&key);
        }
        let edges: Vec<(NodeId, NodeId)> = self
            .merged
            .keys()
            .filter(|(merging, merged)| *merging == id || *merged == id)
            .copied()
            .collect();
        for key in edges {
            self.merged.remove(&key);
        }
    }

    // ========================================================================
    // INTEGRITY VERIFICATION
    // ========================================================================

    /// Walk the referential-completeness invariant: every node's ownership
    /// chain and merged set must resolve inside the overlay.
    pub fn verify_integrity(&self) -> Result<(), String> {
        for level in self.levels.values() {
            if !self.rulesets.contains_key(&level.ruleset_id) {
                return Err(format!(
                    "level {} references missing ruleset {}",
                    level.level_id, level.ruleset_id
                ));
            }
        }
        for source in self.data_sources.values() {
            if !self.levels.contains_key(&source.level_id) {
                return Err(format!(
                    "data source {} references missing level {}",
                    source.data_source_id, source.level_id
                ));
            }
        }
        for node in self.nodes.values() {
            if !self.data_sources.contains_key(&node.data_source_id) {
                return Err(format!(
                    "node {} references missing data source {}",
                    node.node_id, node.data_source_id
                ));
            }
            for edge in self.merged_nodes_of(node.node_id) {
                if !self.nodes.contains_key(&edge.merged_node_id) {
                    return Err(format!(
                        "node {} merges missing node {}",
                        node.node_id, edge.merged_node_id
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::{NodeIndex, NodeVisibility};
    use chrono::Utc;

    fn seed_chain(overlay: &mut OverlayTier) -> (RulesetId, HierarchyLevelId, DataSourceId) {
        let ruleset_id = RulesetId::now_v7();
        let level_id = HierarchyLevelId::now_v7();
        let source_id = DataSourceId::now_v7();
        overlay.insert_ruleset(Ruleset {
            ruleset_id,
            identifier: "items".to_string(),
            last_used_at: Utc::now(),
        });
        overlay.insert_level(HierarchyLevel {
            level_id,
            ruleset_id,
            physical_parent_node_id: None,
            virtual_parent_node_id: None,
            removal_id: None,
        });
        overlay.insert_data_source(DataSource {
            data_source_id: source_id,
            level_id,
            parent_data_source_id: None,
            variables_id: None,
            is_initialized: true,
        });
        (ruleset_id, level_id, source_id)
    }

    fn make_node(source_id: DataSourceId, parts: &[u64]) -> Node {
        Node {
            node_id: NodeId::now_v7(),
            data_source_id: source_id,
            visibility: NodeVisibility::Visible,
            index: NodeIndex::new(parts.to_vec()),
            payload: b"{}".to_vec(),
            label: "node".to_string(),
            instance_keys_query: None,
        }
    }

    #[test]
    fn test_ruleset_identifier_lookup() {
        let mut overlay = OverlayTier::new();
        let (ruleset_id, level_id, _) = seed_chain(&mut overlay);
        assert_eq!(
            overlay
                .find_ruleset_by_identifier("items")
                .map(|r| r.ruleset_id),
            Some(ruleset_id)
        );
        assert!(overlay.find_ruleset_by_identifier("missing").is_none());
        assert_eq!(
            overlay.get_ruleset(ruleset_id).map(|r| r.identifier.as_str()),
            Some("items")
        );
        assert_eq!(
            overlay.get_level(level_id).map(|l| l.ruleset_id),
            Some(ruleset_id)
        );
    }

    #[test]
    fn test_variables_round_trip() {
        let mut overlay = OverlayTier::new();
        let (ruleset_id, _, _) = seed_chain(&mut overlay);
        let vars = RulesetVariables {
            variables_id: VariablesId::now_v7(),
            ruleset_id,
            values: serde_json::json!({ "depth": 1 }),
            last_used_at: Utc::now(),
        };
        overlay.insert_variables(vars.clone());
        assert!(overlay.contains_variables(vars.variables_id));
        assert_eq!(overlay.get_variables(vars.variables_id), Some(&vars));
    }

    #[test]
    fn test_marker_lookup_resolves_newest_level() {
        let mut overlay = OverlayTier::new();
        let (ruleset_id, first_level, _) = seed_chain(&mut overlay);
        // A second live level for the same triple takes the marker over.
        let second_level = HierarchyLevelId::now_v7();
        overlay.insert_level(HierarchyLevel {
            level_id: second_level,
            ruleset_id,
            physical_parent_node_id: None,
            virtual_parent_node_id: None,
            removal_id: None,
        });
        let found = overlay
            .find_level(ruleset_id, None, None)
            .map(|level| level.level_id);
        assert_eq!(found, Some(second_level));
        assert!(overlay.contains_level(first_level));
    }

    #[test]
    fn test_sibling_order_and_counts() {
        let mut overlay = OverlayTier::new();
        let (_, _, source_id) = seed_chain(&mut overlay);
        let n1 = make_node(source_id, &[0]);
        let n2 = make_node(source_id, &[1]);
        overlay.insert_node(n2.clone(), None, &[]);
        overlay.insert_node(n1.clone(), None, &[]);
        assert_eq!(overlay.node_count_for_source(source_id), 2);
        assert_eq!(
            overlay.node_ids_for_source(source_id),
            vec![n1.node_id, n2.node_id]
        );
        assert_eq!(
            overlay.has_node_at_index(source_id, &NodeIndex::new(vec![1])),
            Some(n2.node_id)
        );
    }

    #[test]
    fn test_copied_from_disk_tracking() {
        let mut overlay = OverlayTier::new();
        let (_, level_id, _) = seed_chain(&mut overlay);
        overlay.mark_level_copied_from_disk(level_id);
        assert!(overlay.was_level_copied_from_disk(level_id));
        overlay.mark_level_modified(level_id);
        assert!(!overlay.was_level_copied_from_disk(level_id));
    }

    #[test]
    fn test_discard_removed_levels_cascades() {
        let mut overlay = OverlayTier::new();
        let (ruleset_id, _, _) = seed_chain(&mut overlay);
        let removal = RemovalId::now_v7();
        let removed_level = HierarchyLevelId::now_v7();
        overlay.insert_level(HierarchyLevel {
            level_id: removed_level,
            ruleset_id,
            physical_parent_node_id: None,
            virtual_parent_node_id: None,
            removal_id: Some(removal),
        });
        let source_id = DataSourceId::now_v7();
        overlay.insert_data_source(DataSource {
            data_source_id: source_id,
            level_id: removed_level,
            parent_data_source_id: None,
            variables_id: None,
            is_initialized: true,
        });
        let node = make_node(source_id, &[0]);
        overlay.insert_node(node.clone(), None, &[InstanceKey::new(1, 2)]);

        assert_eq!(overlay.discard_removed_levels(removal), 1);
        assert!(!overlay.contains_level(removed_level));
        assert!(!overlay.contains_data_source(source_id));
        assert!(!overlay.contains_node(node.node_id));
        assert!(overlay.verify_integrity().is_ok());
    }

    #[test]
    fn test_merged_edges_are_scoped_to_merging_node() {
        let mut overlay = OverlayTier::new();
        let (_, _, source_id) = seed_chain(&mut overlay);
        let merging = make_node(source_id, &[0]);
        let merged_a = make_node(source_id, &[1]);
        let merged_b = make_node(source_id, &[2]);
        overlay.insert_node(merging.clone(), None, &[]);
        overlay.insert_node(merged_a.clone(), None, &[]);
        overlay.insert_node(merged_b.clone(), None, &[]);
        overlay.insert_merged_edge(MergedNode {
            merging_node_id: merging.node_id,
            merged_node_id: merged_a.node_id,
        });
        overlay.insert_merged_edge(MergedNode {
            merging_node_id: merging.node_id,
            merged_node_id: merged_b.node_id,
        });

        let edges = overlay.merged_nodes_of(merging.node_id);
        assert_eq!(edges.len(), 2);
        assert!(overlay.merged_nodes_of(merged_a.node_id).is_empty());
    }

    #[test]
    fn test_verify_integrity_catches_orphans() {
        let mut overlay = OverlayTier::new();
        let orphan_source = DataSourceId::now_v7();
        overlay.insert_data_source(DataSource {
            data_source_id: orphan_source,
            level_id: HierarchyLevelId::now_v7(),
            parent_data_source_id: None,
            variables_id: None,
            is_initialized: false,
        });
        assert!(overlay.verify_integrity().is_err());
    }
}
