//! Per-read tier selection.
//!
//! Decides, for each read, whether the overlay or the durable store holds
//! the authoritative answer. The overlay wins only when it provably covers
//! the requested data; a partially mirrored entry never shadows a more
//! complete durable one.

use canopy_core::{CanopyResult, DataSourceId, HierarchyLevelId, NodeId, RulesetId};
use heed::RoTxn;

use crate::disk::DiskTier;
use crate::overlay::OverlayTier;

/// Read-side tier decision logic.
pub struct TierSelectionPolicy<'a> {
    disk: &'a DiskTier,
    overlay: Option<&'a OverlayTier>,
}

impl<'a> TierSelectionPolicy<'a> {
    pub fn new(disk: &'a DiskTier, overlay: Option<&'a OverlayTier>) -> Self {
        Self { disk, overlay }
    }

    /// Single-entity node reads: the overlay answers iff it holds the node.
    /// Mutations only ever write to the overlay, so an overlay row is always
    /// at least as new as the durable one.
    pub fn should_take_node_from_memory(&self, node_id: NodeId) -> bool {
        self.overlay
            .is_some_and(|overlay| overlay.contains_node(node_id))
    }

    /// Hierarchy-level reads for one parent position.
    ///
    /// The overlay answers when the parent node lives there, or when it holds
    /// a matching level with overlay-only content. Levels the overlay merely
    /// mirrors from disk do not force an overlay read - that read would miss
    /// durable-store siblings.
    pub fn should_take_level_from_memory(
        &self,
        ruleset_id: RulesetId,
        parent: Option<NodeId>,
    ) -> bool {
        let Some(overlay) = self.overlay else {
            return false;
        };
        if let Some(parent_id) = parent {
            if overlay.contains_node(parent_id) {
                return true;
            }
        }
        overlay
            .levels_with_virtual_parent(ruleset_id, &[parent])
            .iter()
            .any(|level| !overlay.was_level_copied_from_disk(level.level_id))
    }

    /// Data-source reads.
    ///
    /// A source without an id is not persisted yet, so the overlay answers
    /// when it holds the owning level. For a persisted source the overlay
    /// must hold the row *and* at least as many of its nodes as the durable
    /// store does - the count dominance check that keeps a stale, partially
    /// copied entry from masking durable data.
    pub fn should_take_data_source_from_memory(
        &self,
        rtxn: &RoTxn,
        data_source_id: Option<DataSourceId>,
        level_id: HierarchyLevelId,
    ) -> CanopyResult<bool> {
        let Some(overlay) = self.overlay else {
            return Ok(false);
        };
        match data_source_id {
            None => Ok(overlay.contains_level(level_id)),
            Some(id) => {
                if !overlay.contains_data_source(id) {
                    return Ok(false);
                }
                let overlay_count = overlay.node_count_for_source(id);
                let disk_count = self.disk.node_count_for_source(rtxn, id)?;
                Ok(overlay_count >= disk_count)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::{
        CacheConfig, DataSource, HierarchyLevel, Node, NodeIndex, NodeVisibility, Ruleset,
    };
    use chrono::Utc;
    use tempfile::TempDir;

    fn open_disk() -> (DiskTier, TempDir) {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let disk =
            DiskTier::open(dir.path(), &CacheConfig::default()).expect("open should succeed");
        (disk, dir)
    }

    fn make_node(source_id: DataSourceId, ordinal: u64) -> Node {
        Node {
            node_id: NodeId::now_v7(),
            data_source_id: source_id,
            visibility: NodeVisibility::Visible,
            index: NodeIndex::new(vec![ordinal]),
            payload: b"{}".to_vec(),
            label: format!("node-{ordinal}"),
            instance_keys_query: None,
        }
    }

    fn seed_disk_source(disk: &DiskTier, node_count: u64) -> (HierarchyLevelId, DataSourceId) {
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
        let mut wtxn = disk.begin_write().expect("begin_write should succeed");
        disk.put_ruleset(&mut wtxn, &ruleset).expect("put ruleset");
        disk.put_hierarchy_level(&mut wtxn, &level).expect("put level");
        disk.put_data_source(&mut wtxn, &source).expect("put source");
        for ordinal in 0..node_count {
            disk.put_node(&mut wtxn, &make_node(source.data_source_id, ordinal))
                .expect("put node");
        }
        wtxn.commit().expect("commit should succeed");
        (level.level_id, source.data_source_id)
    }

    #[test]
    fn test_no_overlay_always_reads_disk() {
        let (disk, _dir) = open_disk();
        let policy = TierSelectionPolicy::new(&disk, None);
        assert!(!policy.should_take_node_from_memory(NodeId::now_v7()));
        assert!(!policy.should_take_level_from_memory(RulesetId::now_v7(), None));
    }

    #[test]
    fn test_partial_overlay_copy_defers_to_disk() {
        let (disk, _dir) = open_disk();
        let (level_id, source_id) = seed_disk_source(&disk, 10);

        let mut overlay = OverlayTier::new();
        let rtxn = disk.read_txn().expect("read_txn should succeed");
        // Mirror the source row and three of its ten nodes.
        let source = disk
            .get_data_source(&rtxn, source_id)
            .expect("get should succeed")
            .expect("source should exist");
        let level = disk
            .get_hierarchy_level(&rtxn, level_id)
            .expect("get should succeed")
            .expect("level should exist");
        let ruleset = disk
            .get_ruleset(&rtxn, level.ruleset_id)
            .expect("get should succeed")
            .expect("ruleset should exist");
        overlay.insert_ruleset(ruleset);
        overlay.insert_level(level);
        overlay.insert_data_source(source);
        let node_ids = disk
            .node_ids_for_source(&rtxn, source_id)
            .expect("ids should succeed");
        for id in node_ids.iter().take(3) {
            let node = disk
                .get_node(&rtxn, *id)
                .expect("get should succeed")
                .expect("node should exist");
            overlay.insert_node(node, None, &[]);
        }

        let policy = TierSelectionPolicy::new(&disk, Some(&overlay));
        assert!(!policy
            .should_take_data_source_from_memory(&rtxn, Some(source_id), level_id)
            .expect("policy should succeed"));

        // Mirror the rest; the overlay now dominates and wins.
        for id in node_ids.iter().skip(3) {
            let node = disk
                .get_node(&rtxn, *id)
                .expect("get should succeed")
                .expect("node should exist");
            overlay.insert_node(node, None, &[]);
        }
        let policy = TierSelectionPolicy::new(&disk, Some(&overlay));
        assert!(policy
            .should_take_data_source_from_memory(&rtxn, Some(source_id), level_id)
            .expect("policy should succeed"));
    }

    #[test]
    fn test_unpersisted_source_reads_overlay_when_level_present() {
        let (disk, _dir) = open_disk();
        let (level_id, _) = seed_disk_source(&disk, 1);
        let mut overlay = OverlayTier::new();
        let rtxn = disk.read_txn().expect("read_txn should succeed");

        let policy = TierSelectionPolicy::new(&disk, Some(&overlay));
        assert!(!policy
            .should_take_data_source_from_memory(&rtxn, None, level_id)
            .expect("policy should succeed"));

        let level = disk
            .get_hierarchy_level(&rtxn, level_id)
            .expect("get should succeed")
            .expect("level should exist");
        let ruleset = disk
            .get_ruleset(&rtxn, level.ruleset_id)
            .expect("get should succeed")
            .expect("ruleset should exist");
        overlay.insert_ruleset(ruleset);
        overlay.insert_level(level);
        let policy = TierSelectionPolicy::new(&disk, Some(&overlay));
        assert!(policy
            .should_take_data_source_from_memory(&rtxn, None, level_id)
            .expect("policy should succeed"));
    }

    #[test]
    fn test_mirrored_level_does_not_force_overlay_read() {
        let (disk, _dir) = open_disk();
        let (level_id, _) = seed_disk_source(&disk, 2);
        let mut overlay = OverlayTier::new();
        let rtxn = disk.read_txn().expect("read_txn should succeed");
        let level = disk
            .get_hierarchy_level(&rtxn, level_id)
            .expect("get should succeed")
            .expect("level should exist");
        let ruleset_id = level.ruleset_id;
        let ruleset = disk
            .get_ruleset(&rtxn, ruleset_id)
            .expect("get should succeed")
            .expect("ruleset should exist");
        overlay.insert_ruleset(ruleset);
        overlay.insert_level(level);
        overlay.mark_level_copied_from_disk(level_id);

        let policy = TierSelectionPolicy::new(&disk, Some(&overlay));
        assert!(!policy.should_take_level_from_memory(ruleset_id, None));

        // Overlay-only content flips the decision.
        overlay.mark_level_modified(level_id);
        let policy = TierSelectionPolicy::new(&disk, Some(&overlay));
        assert!(policy.should_take_level_from_memory(ruleset_id, None));
    }
}
