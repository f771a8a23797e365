//! Copy-on-demand population of the overlay.
//!
//! Before anything is written against an entity, its full ancestor chain is
//! established in the overlay, copied from the durable store if absent. Each
//! `ensure_*` is idempotent: a no-op when the target already lives in the
//! overlay. A copy step that cannot find its durable row is a fatal
//! inconsistency, never retried.

use std::collections::HashSet;

use canopy_core::{
    CanopyResult, ConsistencyError, DataSourceId, EntityKind, HierarchyLevelId, NodeId, RulesetId,
    VariablesId,
};
use heed::RoTxn;

use crate::disk::DiskTier;
use crate::overlay::OverlayTier;

/// Walks the entity dependency graph, copying rows ancestors-first.
pub struct CopyOnDemandResolver<'a> {
    disk: &'a DiskTier,
    overlay: &'a mut OverlayTier,
    /// Nodes currently being copied higher up the call stack. Breaks merged-
    /// node cycles: a node found here will be inserted by that outer call.
    visiting: HashSet<NodeId>,
}

impl<'a> CopyOnDemandResolver<'a> {
    pub fn new(disk: &'a DiskTier, overlay: &'a mut OverlayTier) -> Self {
        Self {
            disk,
            overlay,
            visiting: HashSet::new(),
        }
    }

    /// Ensure a ruleset and its variables exist in the overlay.
    pub fn ensure_ruleset_exists(&mut self, rtxn: &RoTxn, id: RulesetId) -> CanopyResult<()> {
        if id.is_nil() {
            return Err(ConsistencyError::InvalidId {
                entity: EntityKind::Ruleset,
            }
            .into());
        }
        if self.overlay.contains_ruleset(id) {
            return Ok(());
        }
        let ruleset = self.disk.get_ruleset(rtxn, id)?.ok_or({
            ConsistencyError::MissingRow {
                entity: EntityKind::Ruleset,
                id: id.as_uuid(),
            }
        })?;
        let variables = self.disk.variables_for_ruleset(rtxn, id)?;
        self.overlay.insert_ruleset(ruleset);
        for vars in variables {
            self.overlay.insert_variables(vars);
        }
        Ok(())
    }

    /// Ensure a variables row exists in the overlay.
    pub fn ensure_variables_exist(&mut self, rtxn: &RoTxn, id: VariablesId) -> CanopyResult<()> {
        if id.is_nil() {
            return Err(ConsistencyError::InvalidId {
                entity: EntityKind::Variables,
            }
            .into());
        }
        if self.overlay.contains_variables(id) {
            return Ok(());
        }
        let vars = self.disk.get_variables(rtxn, id)?.ok_or({
            ConsistencyError::MissingRow {
                entity: EntityKind::Variables,
                id: id.as_uuid(),
            }
        })?;
        self.ensure_ruleset_exists(rtxn, vars.ruleset_id)?;
        self.overlay.insert_variables(vars);
        Ok(())
    }

    /// Ensure a hierarchy level, its parents and its ruleset exist in the
    /// overlay. A nil id is a caller programming error, not a miss.
    pub fn ensure_hierarchy_level_exists(
        &mut self,
        rtxn: &RoTxn,
        id: HierarchyLevelId,
    ) -> CanopyResult<()> {
        if id.is_nil() {
            return Err(ConsistencyError::InvalidId {
                entity: EntityKind::HierarchyLevel,
            }
            .into());
        }
        if self.overlay.contains_level(id) {
            return Ok(());
        }
        let level = self.disk.get_hierarchy_level(rtxn, id)?.ok_or({
            ConsistencyError::MissingRow {
                entity: EntityKind::HierarchyLevel,
                id: id.as_uuid(),
            }
        })?;
        self.ensure_parent_nodes_exist(
            rtxn,
            &[level.physical_parent_node_id, level.virtual_parent_node_id],
        )?;
        self.ensure_ruleset_exists(rtxn, level.ruleset_id)?;
        self.overlay.insert_level(level);
        self.overlay.mark_level_copied_from_disk(id);
        Ok(())
    }

    /// Ensure a data source and its ownership chain exist in the overlay.
    /// Class tags are copied separately, on demand.
    pub fn ensure_data_source_exists(
        &mut self,
        rtxn: &RoTxn,
        id: DataSourceId,
    ) -> CanopyResult<()> {
        if id.is_nil() {
            return Err(ConsistencyError::InvalidId {
                entity: EntityKind::DataSource,
            }
            .into());
        }
        if self.overlay.contains_data_source(id) {
            return Ok(());
        }
        let source = self.disk.get_data_source(rtxn, id)?.ok_or({
            ConsistencyError::MissingRow {
                entity: EntityKind::DataSource,
                id: id.as_uuid(),
            }
        })?;
        self.ensure_hierarchy_level_exists(rtxn, source.level_id)?;
        if let Some(parent) = source.parent_data_source_id {
            self.ensure_data_source_exists(rtxn, parent)?;
        }
        if let Some(variables_id) = source.variables_id {
            self.ensure_variables_exist(rtxn, variables_id)?;
        }
        self.overlay.insert_data_source(source);
        // Classes ride along: merge-back fully replaces a source's class
        // rows, so a mirrored source must mirror its tags too.
        self.ensure_data_source_classes(rtxn, id)?;
        Ok(())
    }

    /// Copy a data source's class tags into the overlay.
    pub fn ensure_data_source_classes(
        &mut self,
        rtxn: &RoTxn,
        id: DataSourceId,
    ) -> CanopyResult<()> {
        self.ensure_data_source_exists(rtxn, id)?;
        if self.overlay.classes_for_source(id).is_empty() {
            let tags = self.disk.classes_for_source(rtxn, id)?;
            if !tags.is_empty() {
                self.overlay.set_classes(id, &tags);
            }
        }
        Ok(())
    }

    /// Ensure a node, its data source chain and its merged set exist in the
    /// overlay.
    pub fn ensure_node_exists(&mut self, rtxn: &RoTxn, id: NodeId) -> CanopyResult<()> {
        if id.is_nil() {
            return Err(ConsistencyError::InvalidId {
                entity: EntityKind::Node,
            }
            .into());
        }
        if self.overlay.contains_node(id) || self.visiting.contains(&id) {
            return Ok(());
        }
        self.visiting.insert(id);
        let node = self.disk.get_node(rtxn, id)?.ok_or({
            ConsistencyError::MissingRow {
                entity: EntityKind::Node,
                id: id.as_uuid(),
            }
        })?;
        self.ensure_data_source_exists(rtxn, node.data_source_id)?;
        let edges = self.disk.merged_nodes_of(rtxn, id)?;
        for edge in &edges {
            self.ensure_node_exists(rtxn, edge.merged_node_id)?;
        }
        let key = self.disk.get_node_key(rtxn, id)?;
        let instances: Vec<_> = self
            .disk
            .instances_for_node(rtxn, id)?
            .into_iter()
            .map(|row| row.key)
            .collect();
        self.overlay.insert_node(node, key, &instances);
        for edge in edges {
            self.overlay.insert_merged_edge(edge);
        }
        Ok(())
    }

    /// Ensure a set of possibly absent parent ids, skipping nil and `None`.
    pub fn ensure_parent_nodes_exist(
        &mut self,
        rtxn: &RoTxn,
        ids: &[Option<NodeId>],
    ) -> CanopyResult<()> {
        for id in ids.iter().flatten() {
            if id.is_nil() {
                continue;
            }
            self.ensure_node_exists(rtxn, *id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::{
        CacheConfig, CanopyError, DataSource, HierarchyLevel, MergedNode, Node, NodeIndex,
        NodeVisibility, Ruleset,
    };
    use chrono::Utc;
    use tempfile::TempDir;

    struct Fixture {
        disk: DiskTier,
        _dir: TempDir,
    }

    fn open_fixture() -> Fixture {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let disk =
            DiskTier::open(dir.path(), &CacheConfig::default()).expect("open should succeed");
        Fixture { disk, _dir: dir }
    }

    fn seed_tree(disk: &DiskTier) -> (Ruleset, HierarchyLevel, DataSource, Node, Node) {
        let ruleset = Ruleset {
            ruleset_id: RulesetId::now_v7(),
            identifier: "items".to_string(),
            last_used_at: Utc::now(),
        };
        let level = HierarchyLevel {
            level_id: HierarchyLevelId::now_v7(),
            ruleset_id: ruleset.ruleset_id,
            physical_parent_node_id: None,
            virtual_parent_node_id: None,
            removal_id: None,
        };
        let source = DataSource {
            data_source_id: DataSourceId::now_v7(),
            level_id: level.level_id,
            parent_data_source_id: None,
            variables_id: None,
            is_initialized: true,
        };
        let parent = Node {
            node_id: NodeId::now_v7(),
            data_source_id: source.data_source_id,
            visibility: NodeVisibility::Visible,
            index: NodeIndex::new(vec![0]),
            payload: b"{}".to_vec(),
            label: "parent".to_string(),
            instance_keys_query: None,
        };
        let merged = Node {
            node_id: NodeId::now_v7(),
            data_source_id: source.data_source_id,
            visibility: NodeVisibility::Virtual,
            index: NodeIndex::new(vec![1]),
            payload: b"{}".to_vec(),
            label: "merged".to_string(),
            instance_keys_query: None,
        };
        let mut wtxn = disk.begin_write().expect("begin_write should succeed");
        disk.put_ruleset(&mut wtxn, &ruleset).expect("put ruleset");
        disk.put_hierarchy_level(&mut wtxn, &level).expect("put level");
        disk.put_data_source(&mut wtxn, &source).expect("put source");
        disk.put_node(&mut wtxn, &parent).expect("put parent");
        disk.put_node(&mut wtxn, &merged).expect("put merged");
        disk.put_merged_edge(
            &mut wtxn,
            &MergedNode {
                merging_node_id: parent.node_id,
                merged_node_id: merged.node_id,
            },
        )
        .expect("put edge");
        wtxn.commit().expect("commit should succeed");
        (ruleset, level, source, parent, merged)
    }

    #[test]
    fn test_ensure_node_establishes_full_chain() {
        let fixture = open_fixture();
        let (ruleset, level, source, parent, merged) = seed_tree(&fixture.disk);
        let mut overlay = OverlayTier::new();
        let rtxn = fixture.disk.read_txn().expect("read_txn should succeed");

        let mut resolver = CopyOnDemandResolver::new(&fixture.disk, &mut overlay);
        resolver
            .ensure_node_exists(&rtxn, parent.node_id)
            .expect("ensure should succeed");

        assert!(overlay.contains_ruleset(ruleset.ruleset_id));
        assert!(overlay.contains_level(level.level_id));
        assert!(overlay.contains_data_source(source.data_source_id));
        assert!(overlay.contains_node(parent.node_id));
        // Referential completeness pulls the merged node in too.
        assert!(overlay.contains_node(merged.node_id));
        assert!(overlay.verify_integrity().is_ok());
        assert!(overlay.was_level_copied_from_disk(level.level_id));
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let fixture = open_fixture();
        let (_, _, source, parent, _) = seed_tree(&fixture.disk);
        let mut overlay = OverlayTier::new();
        let rtxn = fixture.disk.read_txn().expect("read_txn should succeed");

        let mut resolver = CopyOnDemandResolver::new(&fixture.disk, &mut overlay);
        resolver
            .ensure_node_exists(&rtxn, parent.node_id)
            .expect("first ensure should succeed");
        drop(resolver);
        let count_after_first = overlay.node_count_for_source(source.data_source_id);
        let mut resolver = CopyOnDemandResolver::new(&fixture.disk, &mut overlay);
        resolver
            .ensure_node_exists(&rtxn, parent.node_id)
            .expect("second ensure should succeed");
        drop(resolver);
        assert_eq!(
            overlay.node_count_for_source(source.data_source_id),
            count_after_first
        );
    }

    #[test]
    fn test_nil_id_fails_fast() {
        let fixture = open_fixture();
        let mut overlay = OverlayTier::new();
        let rtxn = fixture.disk.read_txn().expect("read_txn should succeed");
        let mut resolver = CopyOnDemandResolver::new(&fixture.disk, &mut overlay);

        let err = resolver
            .ensure_hierarchy_level_exists(&rtxn, HierarchyLevelId::nil())
            .expect_err("nil level id should fail");
        assert!(matches!(
            err,
            CanopyError::Consistency(ConsistencyError::InvalidId { .. })
        ));
    }

    #[test]
    fn test_missing_durable_row_is_fatal() {
        let fixture = open_fixture();
        let mut overlay = OverlayTier::new();
        let rtxn = fixture.disk.read_txn().expect("read_txn should succeed");
        let mut resolver = CopyOnDemandResolver::new(&fixture.disk, &mut overlay);

        let err = resolver
            .ensure_data_source_exists(&rtxn, DataSourceId::now_v7())
            .expect_err("unknown source should fail");
        assert!(matches!(
            err,
            CanopyError::Consistency(ConsistencyError::MissingRow { .. })
        ));
    }

    #[test]
    fn test_parent_set_skips_nil_and_none() {
        let fixture = open_fixture();
        let (_, _, _, parent, _) = seed_tree(&fixture.disk);
        let mut overlay = OverlayTier::new();
        let rtxn = fixture.disk.read_txn().expect("read_txn should succeed");
        let mut resolver = CopyOnDemandResolver::new(&fixture.disk, &mut overlay);

        resolver
            .ensure_parent_nodes_exist(
                &rtxn,
                &[None, Some(NodeId::nil()), Some(parent.node_id)],
            )
            .expect("parent ensure should succeed");
        assert!(overlay.contains_node(parent.node_id));
    }
}
