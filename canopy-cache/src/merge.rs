//! Merge-back of the overlay into the durable store.
//!
//! Runs at teardown inside a single immediate transaction, with referential
//! integrity enforcement suspended so insertion order across tables does not
//! matter. Per entity the step is either insert-or-replace (the overlay is
//! authoritative), insert-or-ignore (the durable row wins), or full
//! delete-then-copy (classes, keys, instances, merged edges).

use canopy_core::{
    CacheConfig, CanopyResult, DataSourceClass, DataSourceId, HierarchyLevelId, Ruleset,
    Timestamp,
};
use heed::RwTxn;
use std::collections::HashSet;

use crate::disk::DiskTier;
use crate::overlay::OverlayTier;
use crate::schema::decode_physical_level_key;
use crate::txn::{TransactionGuard, TxnMode};

/// Reconciles overlay content into the durable store.
pub struct MergeEngine<'a> {
    disk: &'a DiskTier,
    overlay: &'a OverlayTier,
    config: &'a CacheConfig,
}

impl<'a> MergeEngine<'a> {
    pub fn new(disk: &'a DiskTier, overlay: &'a OverlayTier, config: &'a CacheConfig) -> Self {
        Self {
            disk,
            overlay,
            config,
        }
    }

    /// Merge the overlay's net effect into the durable store, all-or-nothing.
    ///
    /// Idempotent: a second run with an unchanged overlay leaves the durable
    /// store in the same final state.
    pub fn merge(&self) -> CanopyResult<()> {
        if self.overlay.is_empty() {
            return Ok(());
        }
        self.disk.set_integrity_checks(false);
        let result = self.merge_inner();
        self.disk.set_integrity_checks(true);
        result?;
        // Storage-level optimization after the transaction; the logical
        // change is already committed, so a failure here is soft.
        if let Err(e) = self.disk.sync() {
            tracing::warn!(error = %e, "post-merge store sync failed");
        }
        Ok(())
    }

    fn merge_inner(&self) -> CanopyResult<()> {
        let mut guard = TransactionGuard::begin(
            self.disk,
            "merge-overlay",
            TxnMode::Immediate,
            self.config.busy_retry_cap,
        )?;
        let wtxn = guard.txn()?;

        // Rulesets: durable row wins structurally, recency moves forward.
        for ruleset in self.overlay.iter_rulesets() {
            match self.disk.get_ruleset(wtxn, ruleset.ruleset_id)? {
                None => self.disk.put_ruleset(wtxn, ruleset)?,
                Some(existing) if ruleset.last_used_at > existing.last_used_at => {
                    let touched = Ruleset {
                        last_used_at: ruleset.last_used_at,
                        ..existing
                    };
                    self.disk.put_ruleset(wtxn, &touched)?;
                }
                Some(_) => {}
            }
        }

        // Variables: insert-or-ignore.
        for vars in self.overlay.iter_variables() {
            if self.disk.get_variables(wtxn, vars.variables_id)?.is_none() {
                self.disk.put_variables(wtxn, vars)?;
            }
        }

        // Physical-level markers: insert-or-ignore.
        for (key, level_id) in self.overlay.iter_physical_markers() {
            let (ruleset_id, parent, removal) = decode_physical_level_key(key);
            self.disk
                .put_physical_marker_if_absent(wtxn, ruleset_id, parent, removal, *level_id)?;
        }

        // Hierarchy levels: insert-or-replace.
        for level in self.overlay.iter_levels() {
            self.disk.put_hierarchy_level(wtxn, level)?;
        }

        // Data sources: insert-or-replace.
        for source in self.overlay.iter_data_sources() {
            self.disk.put_data_source(wtxn, source)?;
        }

        // Data-source classes: full replace for every overlay source.
        for source in self.overlay.iter_data_sources() {
            self.disk
                .delete_classes_for_source(wtxn, source.data_source_id)?;
            for tag in self.overlay.classes_for_source(source.data_source_id) {
                self.disk.put_data_source_class(
                    wtxn,
                    &DataSourceClass {
                        data_source_id: source.data_source_id,
                        class_id: tag.class_id,
                        is_polymorphic: tag.is_polymorphic,
                    },
                )?;
            }
        }

        // Nodes: insert-or-replace (order index maintained by the put).
        for node in self.overlay.iter_nodes() {
            self.disk.put_node(wtxn, node)?;
        }

        // Node keys, instances, merged edges: delete-then-copy per node.
        for node in self.overlay.iter_nodes() {
            self.disk.delete_node_key(wtxn, node.node_id)?;
            if let Some(key) = self.overlay.get_node_key(node.node_id) {
                self.disk.put_node_key(wtxn, node.node_id, key)?;
            }
            self.disk.delete_instances_for_node(wtxn, node.node_id)?;
            for instance in self.overlay.instances_for_node(node.node_id) {
                self.disk.put_node_instance(wtxn, &instance)?;
            }
            self.disk.delete_merged_edges_of(wtxn, node.node_id)?;
            for edge in self.overlay.merged_nodes_of(node.node_id) {
                self.disk.put_merged_edge(wtxn, &edge)?;
            }
        }

        self.apply_variation_cap(wtxn)?;
        guard.commit()
    }

    /// Drop the oldest-used variable-variations of any level that now
    /// exceeds the configured threshold, cascading to their child rows.
    fn apply_variation_cap(&self, wtxn: &mut RwTxn) -> CanopyResult<()> {
        let threshold = self.config.variation_threshold;
        let level_ids: HashSet<HierarchyLevelId> = self
            .overlay
            .iter_levels()
            .map(|level| level.level_id)
            .collect();
        for level_id in level_ids {
            let sources = self.disk.sources_for_level(wtxn, level_id)?;
            let mut variations: Vec<(Option<Timestamp>, DataSourceId)> = Vec::new();
            for source in &sources {
                let Some(variables_id) = source.variables_id else {
                    continue;
                };
                let used = self
                    .disk
                    .get_variables(wtxn, variables_id)?
                    .map(|vars| vars.last_used_at);
                variations.push((used, source.data_source_id));
            }
            if variations.len() <= threshold {
                continue;
            }
            // Oldest first; unknown recency counts as oldest. Source id
            // breaks ties so repeated runs drop the same rows.
            variations.sort();
            let excess = variations.len() - threshold;
            for (_, source_id) in variations.into_iter().take(excess) {
                self.disk.delete_data_source_cascade(wtxn, source_id)?;
                tracing::debug!(%source_id, %level_id, "dropped excess hierarchy variation");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::{
        DataSource, HierarchyLevel, InstanceKey, Node, NodeIndex, NodeKey, NodeVisibility,
        RulesetId, RulesetVariables, VariablesId,
    };
    use chrono::Utc;
    use tempfile::TempDir;

    fn open_disk() -> (DiskTier, TempDir) {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let disk =
            DiskTier::open(dir.path(), &CacheConfig::default()).expect("open should succeed");
        (disk, dir)
    }

    fn overlay_with_tree() -> (OverlayTier, RulesetId, HierarchyLevelId, DataSourceId, Node) {
        let mut overlay = OverlayTier::new();
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
        let node = Node {
            node_id: canopy_core::NodeId::now_v7(),
            data_source_id: source_id,
            visibility: NodeVisibility::Visible,
            index: NodeIndex::new(vec![0]),
            payload: b"{}".to_vec(),
            label: "root".to_string(),
            instance_keys_query: None,
        };
        overlay.insert_node(
            node.clone(),
            Some(NodeKey::Custom {
                kind: "root".to_string(),
                specification_id: "spec-1".to_string(),
                path_hash: "abc".to_string(),
            }),
            &[InstanceKey::new(1, 7)],
        );
        (overlay, ruleset_id, level_id, source_id, node)
    }

    #[test]
    fn test_merge_persists_overlay_tree() {
        let (disk, _dir) = open_disk();
        let (overlay, ruleset_id, level_id, source_id, node) = overlay_with_tree();
        let config = CacheConfig::default();

        MergeEngine::new(&disk, &overlay, &config)
            .merge()
            .expect("merge should succeed");

        let rtxn = disk.read_txn().expect("read_txn should succeed");
        assert!(disk
            .get_ruleset(&rtxn, ruleset_id)
            .expect("get should succeed")
            .is_some());
        assert!(disk
            .get_hierarchy_level(&rtxn, level_id)
            .expect("get should succeed")
            .is_some());
        assert_eq!(
            disk.node_count_for_source(&rtxn, source_id)
                .expect("count should succeed"),
            1
        );
        assert!(disk
            .get_node_key(&rtxn, node.node_id)
            .expect("get should succeed")
            .is_some());
        assert_eq!(
            disk.instances_for_node(&rtxn, node.node_id)
                .expect("instances should succeed")
                .len(),
            1
        );
        assert_eq!(
            disk.get_physical_marker(&rtxn, ruleset_id, None, None)
                .expect("marker should succeed"),
            Some(level_id)
        );
        drop(rtxn);
        assert!(disk.verify_integrity().is_ok());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let (disk, _dir) = open_disk();
        let (overlay, _, _, source_id, node) = overlay_with_tree();
        let config = CacheConfig::default();

        let engine = MergeEngine::new(&disk, &overlay, &config);
        engine.merge().expect("first merge should succeed");
        engine.merge().expect("second merge should succeed");

        let rtxn = disk.read_txn().expect("read_txn should succeed");
        assert_eq!(
            disk.node_count_for_source(&rtxn, source_id)
                .expect("count should succeed"),
            1
        );
        assert_eq!(
            disk.instances_for_node(&rtxn, node.node_id)
                .expect("instances should succeed")
                .len(),
            1
        );
    }

    #[test]
    fn test_merge_keeps_durable_ruleset_row_but_moves_recency() {
        let (disk, _dir) = open_disk();
        let (mut overlay, ruleset_id, _, _, _) = overlay_with_tree();
        let config = CacheConfig::default();

        // Durable row predates the overlay's use of the ruleset.
        let old_time = Utc::now() - chrono::Duration::hours(3);
        let mut wtxn = disk.begin_write().expect("begin_write should succeed");
        disk.put_ruleset(
            &mut wtxn,
            &Ruleset {
                ruleset_id,
                identifier: "items".to_string(),
                last_used_at: old_time,
            },
        )
        .expect("put ruleset");
        wtxn.commit().expect("commit should succeed");

        let now = Utc::now();
        overlay.touch_ruleset(ruleset_id, now);
        MergeEngine::new(&disk, &overlay, &config)
            .merge()
            .expect("merge should succeed");

        let rtxn = disk.read_txn().expect("read_txn should succeed");
        let merged = disk
            .get_ruleset(&rtxn, ruleset_id)
            .expect("get should succeed")
            .expect("ruleset should exist");
        assert!(merged.last_used_at > old_time);
    }

    #[test]
    fn test_variation_cap_drops_oldest() {
        let (disk, _dir) = open_disk();
        let (mut overlay, ruleset_id, level_id, _, _) = overlay_with_tree();
        let config = CacheConfig::default().with_variation_threshold(2);

        // Three variations with distinct variables recency.
        let mut oldest_source = None;
        for age_hours in [3i64, 2, 1] {
            let variables_id = VariablesId::now_v7();
            overlay.insert_variables(RulesetVariables {
                variables_id,
                ruleset_id,
                values: serde_json::json!({ "age": age_hours }),
                last_used_at: Utc::now() - chrono::Duration::hours(age_hours),
            });
            let source_id = DataSourceId::now_v7();
            overlay.insert_data_source(DataSource {
                data_source_id: source_id,
                level_id,
                parent_data_source_id: None,
                variables_id: Some(variables_id),
                is_initialized: true,
            });
            if age_hours == 3 {
                oldest_source = Some(source_id);
            }
        }

        MergeEngine::new(&disk, &overlay, &config)
            .merge()
            .expect("merge should succeed");

        let rtxn = disk.read_txn().expect("read_txn should succeed");
        let remaining = disk
            .sources_for_level(&rtxn, level_id)
            .expect("sources should succeed");
        let with_variables: Vec<_> = remaining
            .iter()
            .filter(|source| source.variables_id.is_some())
            .collect();
        assert_eq!(with_variables.len(), 2);
        let oldest = oldest_source.expect("oldest variation should be recorded");
        assert!(with_variables
            .iter()
            .all(|source| source.data_source_id != oldest));
    }
}
