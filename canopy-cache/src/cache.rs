//! Public two-tier cache wrapper.
//!
//! One mutual-exclusion lock per wrapper instance serializes mutations and
//! overlay initialization. Mutations always go through the overlay, lazily
//! creating it on first use; reads go through the tier-selection policy.
//! Teardown merges the overlay's net effect into the durable store and may
//! run eviction afterwards.

use std::sync::{Arc, Mutex, MutexGuard};

use canopy_core::{
    CacheConfig, CanopyError, CanopyResult, ConsistencyError, DataSource, DataSourceId,
    DataSourceInfo, DataSourceParts, EntityKind, HierarchyLevel, HierarchyLevelId,
    HierarchyLevelIdentifier, InstanceKey, MergedNode, Node, NodeId, NodeIndex, NodeKey,
    NodeVisibility, RemovalId, Ruleset, RulesetId, RulesetVariables, StoreError, VariablesId,
};
use chrono::Utc;

use crate::disk::DiskTier;
use crate::eviction::{EvictionPolicy, EvictionReport};
use crate::locker::{HierarchyLevelLocker, NoopLevelLocker};
use crate::merge::MergeEngine;
use crate::overlay::OverlayTier;
use crate::policy::TierSelectionPolicy;
use crate::resolver::CopyOnDemandResolver;

/// Statistics about cache usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads answered by the overlay.
    pub overlay_hits: u64,
    /// Reads answered by the durable store.
    pub disk_hits: u64,
    /// Reads that found nothing in either tier.
    pub misses: u64,
    /// Rulesets removed by eviction through this wrapper.
    pub evicted_rulesets: u64,
}

impl CacheStats {
    /// Fraction of reads that found their entity (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.overlay_hits + self.disk_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

struct CacheInner {
    disk: DiskTier,
    overlay: Option<OverlayTier>,
    config: CacheConfig,
    locker: Arc<dyn HierarchyLevelLocker>,
    stats: CacheStats,
    poisoned: bool,
}

impl CacheInner {
    fn ensure_overlay(&mut self) -> CanopyResult<()> {
        if self.poisoned {
            return Err(CanopyError::Store(StoreError::Closed));
        }
        if self.overlay.is_none() {
            if let Err(e) = self.locker.lock() {
                self.poisoned = true;
                return Err(e);
            }
            self.overlay = Some(OverlayTier::new());
            tracing::debug!("overlay tier initialized");
        }
        Ok(())
    }

    fn check_open(&self) -> CanopyResult<()> {
        if self.poisoned {
            return Err(CanopyError::Store(StoreError::Closed));
        }
        Ok(())
    }
}

/// The hierarchical result cache.
pub struct HierarchyCache {
    inner: Mutex<CacheInner>,
}

fn lock_poisoned() -> CanopyError {
    CanopyError::Store(StoreError::Transaction {
        reason: "cache wrapper lock poisoned".to_string(),
    })
}

impl HierarchyCache {
    /// Wrap a durable tier with the default (no-op) level locker.
    pub fn new(disk: DiskTier, config: CacheConfig) -> Self {
        Self::with_locker(disk, config, Arc::new(NoopLevelLocker))
    }

    /// Wrap a durable tier with an advisory level locker, acquired when the
    /// overlay is created and released at close.
    pub fn with_locker(
        disk: DiskTier,
        config: CacheConfig,
        locker: Arc<dyn HierarchyLevelLocker>,
    ) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                disk,
                overlay: None,
                config,
                locker,
                stats: CacheStats::default(),
                poisoned: false,
            }),
        }
    }

    fn lock(&self) -> CanopyResult<MutexGuard<'_, CacheInner>> {
        self.inner.lock().map_err(|_| lock_poisoned())
    }

    /// Whether the overlay has been created.
    pub fn is_overlay_active(&self) -> bool {
        self.lock().map(|inner| inner.overlay.is_some()).unwrap_or(false)
    }

    /// A snapshot of the usage statistics.
    pub fn stats(&self) -> CacheStats {
        self.lock().map(|inner| inner.stats).unwrap_or_default()
    }

    // ========================================================================
    // MUTATIONS
    // ========================================================================

    /// Cache a new hierarchy level. The ruleset is resolved (or created) by
    /// identifier; parent nodes are pulled into the overlay first; the level
    /// row itself is written only to the overlay.
    pub fn cache_hierarchy_level(
        &self,
        identifier: &HierarchyLevelIdentifier,
    ) -> CanopyResult<HierarchyLevelId> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        inner.ensure_overlay()?;
        let CacheInner { disk, overlay, .. } = inner;
        let overlay = overlay
            .as_mut()
            .ok_or(CanopyError::Store(StoreError::Closed))?;
        let rtxn = disk.read_txn()?;

        let ruleset_id = match overlay.find_ruleset_by_identifier(&identifier.ruleset_identifier)
        {
            Some(ruleset) => ruleset.ruleset_id,
            None => match disk.find_ruleset_by_identifier(&rtxn, &identifier.ruleset_identifier)? {
                Some(ruleset) => {
                    let id = ruleset.ruleset_id;
                    CopyOnDemandResolver::new(disk, overlay).ensure_ruleset_exists(&rtxn, id)?;
                    id
                }
                None => {
                    let id = RulesetId::now_v7();
                    overlay.insert_ruleset(Ruleset {
                        ruleset_id: id,
                        identifier: identifier.ruleset_identifier.clone(),
                        last_used_at: Utc::now(),
                    });
                    id
                }
            },
        };

        CopyOnDemandResolver::new(disk, overlay).ensure_parent_nodes_exist(
            &rtxn,
            &[
                identifier.physical_parent_node_id,
                identifier.virtual_parent_node_id,
            ],
        )?;

        let level = HierarchyLevel {
            level_id: HierarchyLevelId::now_v7(),
            ruleset_id,
            physical_parent_node_id: identifier.physical_parent_node_id,
            virtual_parent_node_id: identifier.virtual_parent_node_id,
            removal_id: None,
        };
        let level_id = level.level_id;
        overlay.insert_level(level);
        Ok(level_id)
    }

    /// Cache a new data source under an existing level. Returns the id the
    /// source was persisted under.
    pub fn cache_data_source(&self, info: &DataSourceInfo) -> CanopyResult<DataSourceId> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        inner.ensure_overlay()?;
        let CacheInner { disk, overlay, .. } = inner;
        let overlay = overlay
            .as_mut()
            .ok_or(CanopyError::Store(StoreError::Closed))?;
        let rtxn = disk.read_txn()?;

        let mut resolver = CopyOnDemandResolver::new(disk, overlay);
        resolver.ensure_hierarchy_level_exists(&rtxn, info.level_id)?;
        if let Some(parent) = info.parent_data_source_id {
            resolver.ensure_data_source_exists(&rtxn, parent)?;
        }
        if let Some(variables_id) = info.variables_id {
            resolver.ensure_variables_exist(&rtxn, variables_id)?;
        }

        let data_source_id = info.data_source_id.unwrap_or_else(DataSourceId::now_v7);
        overlay.insert_data_source(DataSource {
            data_source_id,
            level_id: info.level_id,
            parent_data_source_id: info.parent_data_source_id,
            variables_id: info.variables_id,
            is_initialized: info.is_initialized,
        });
        if !info.classes.is_empty() {
            overlay.set_classes(data_source_id, &info.classes);
        }
        overlay.mark_level_modified(info.level_id);
        Ok(data_source_id)
    }

    /// Cache a computed node together with its key and instance keys.
    ///
    /// Sibling indexes are unique per data source; a collision with a
    /// different node is rejected rather than silently replaced.
    pub fn cache_node(
        &self,
        node: Node,
        key: NodeKey,
        instances: Vec<InstanceKey>,
    ) -> CanopyResult<()> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        inner.ensure_overlay()?;
        let CacheInner { disk, overlay, .. } = inner;
        let overlay = overlay
            .as_mut()
            .ok_or(CanopyError::Store(StoreError::Closed))?;
        let rtxn = disk.read_txn()?;

        CopyOnDemandResolver::new(disk, overlay)
            .ensure_data_source_exists(&rtxn, node.data_source_id)?;

        if let Some(existing) = overlay.has_node_at_index(node.data_source_id, &node.index) {
            if existing != node.node_id {
                return Err(ConsistencyError::DuplicateIndex {
                    data_source_id: node.data_source_id,
                    index: node.index,
                }
                .into());
            }
        }
        if let Some(existing) = disk.node_at_index(&rtxn, node.data_source_id, &node.index)? {
            if existing != node.node_id {
                return Err(ConsistencyError::DuplicateIndex {
                    data_source_id: node.data_source_id,
                    index: node.index,
                }
                .into());
            }
        }

        let level_id = overlay
            .get_data_source(node.data_source_id)
            .map(|source| source.level_id);
        overlay.insert_node(node, Some(key), &instances);
        if let Some(level_id) = level_id {
            overlay.mark_level_modified(level_id);
        }
        Ok(())
    }

    /// Apply the masked fields of `info` to an existing data source.
    pub fn update_data_source(
        &self,
        info: &DataSourceInfo,
        parts: DataSourceParts,
    ) -> CanopyResult<()> {
        let id = info.data_source_id.ok_or(ConsistencyError::InvalidId {
            entity: EntityKind::DataSource,
        })?;
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        inner.ensure_overlay()?;
        let CacheInner { disk, overlay, .. } = inner;
        let overlay = overlay
            .as_mut()
            .ok_or(CanopyError::Store(StoreError::Closed))?;
        let rtxn = disk.read_txn()?;

        let mut resolver = CopyOnDemandResolver::new(disk, overlay);
        resolver.ensure_data_source_exists(&rtxn, id)?;
        if parts.contains(DataSourceParts::VARIABLES) {
            if let Some(variables_id) = info.variables_id {
                resolver.ensure_variables_exist(&rtxn, variables_id)?;
            }
        }

        let source = overlay
            .get_data_source_mut(id)
            .ok_or(ConsistencyError::MissingRow {
                entity: EntityKind::DataSource,
                id: id.as_uuid(),
            })?;
        if parts.contains(DataSourceParts::PARENT) {
            source.parent_data_source_id = info.parent_data_source_id;
        }
        if parts.contains(DataSourceParts::VARIABLES) {
            source.variables_id = info.variables_id;
        }
        if parts.contains(DataSourceParts::IS_INITIALIZED) {
            source.is_initialized = info.is_initialized;
        }
        let level_id = source.level_id;
        if parts.contains(DataSourceParts::CLASSES) {
            overlay.set_classes(id, &info.classes);
        }
        overlay.mark_level_modified(level_id);
        Ok(())
    }

    /// Make a node visible again.
    pub fn make_physical(&self, node_id: NodeId) -> CanopyResult<()> {
        self.set_visibility(node_id, NodeVisibility::Visible)
    }

    /// Hide a node, displaying its children in its place.
    pub fn make_virtual(&self, node_id: NodeId) -> CanopyResult<()> {
        self.set_visibility(node_id, NodeVisibility::Virtual)
    }

    /// Hide a node together with its subtree.
    pub fn make_hidden(&self, node_id: NodeId) -> CanopyResult<()> {
        self.set_visibility(node_id, NodeVisibility::Hidden)
    }

    fn set_visibility(&self, node_id: NodeId, visibility: NodeVisibility) -> CanopyResult<()> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        inner.ensure_overlay()?;
        let CacheInner { disk, overlay, .. } = inner;
        let overlay = overlay
            .as_mut()
            .ok_or(CanopyError::Store(StoreError::Closed))?;
        let rtxn = disk.read_txn()?;

        CopyOnDemandResolver::new(disk, overlay).ensure_node_exists(&rtxn, node_id)?;
        let node = overlay
            .get_node_mut(node_id)
            .ok_or(ConsistencyError::MissingRow {
                entity: EntityKind::Node,
                id: node_id.as_uuid(),
            })?;
        node.visibility = visibility;
        let data_source_id = node.data_source_id;
        if let Some(level_id) = overlay
            .get_data_source(data_source_id)
            .map(|source| source.level_id)
        {
            overlay.mark_level_modified(level_id);
        }
        Ok(())
    }

    /// Record that `merging` logically absorbs `merged`.
    pub fn merge_nodes(&self, merging: NodeId, merged: NodeId) -> CanopyResult<()> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        inner.ensure_overlay()?;
        let CacheInner { disk, overlay, .. } = inner;
        let overlay = overlay
            .as_mut()
            .ok_or(CanopyError::Store(StoreError::Closed))?;
        let rtxn = disk.read_txn()?;

        let mut resolver = CopyOnDemandResolver::new(disk, overlay);
        resolver.ensure_node_exists(&rtxn, merging)?;
        resolver.ensure_node_exists(&rtxn, merged)?;
        overlay.insert_merged_edge(MergedNode {
            merging_node_id: merging,
            merged_node_id: merged,
        });
        if let Some(level_id) = overlay
            .get_node(merging)
            .and_then(|node| overlay.get_data_source(node.data_source_id))
            .map(|source| source.level_id)
        {
            overlay.mark_level_modified(level_id);
        }
        Ok(())
    }

    /// Tag a hierarchy level as superseded by `removal_id`.
    pub fn supersede_hierarchy_level(
        &self,
        level_id: HierarchyLevelId,
        removal_id: RemovalId,
    ) -> CanopyResult<()> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        inner.ensure_overlay()?;
        let CacheInner { disk, overlay, .. } = inner;
        let overlay = overlay
            .as_mut()
            .ok_or(CanopyError::Store(StoreError::Closed))?;
        let rtxn = disk.read_txn()?;

        CopyOnDemandResolver::new(disk, overlay).ensure_hierarchy_level_exists(&rtxn, level_id)?;
        overlay.supersede_level(level_id, removal_id);
        Ok(())
    }

    /// Drop superseded overlay rows tagged with `removal_id`. Returns how
    /// many levels were discarded.
    pub fn discard_removed_levels(&self, removal_id: RemovalId) -> CanopyResult<usize> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        inner.check_open()?;
        Ok(inner
            .overlay
            .as_mut()
            .map(|overlay| overlay.discard_removed_levels(removal_id))
            .unwrap_or(0))
    }

    // ========================================================================
    // NOTIFICATIONS
    // ========================================================================

    /// A ruleset was used: move its recency forward and preload its root
    /// levels into the overlay. Creates the ruleset when neither tier has it.
    pub fn on_ruleset_used(&self, identifier: &str) -> CanopyResult<RulesetId> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        inner.ensure_overlay()?;
        let CacheInner { disk, overlay, .. } = inner;
        let overlay = overlay
            .as_mut()
            .ok_or(CanopyError::Store(StoreError::Closed))?;
        let rtxn = disk.read_txn()?;
        let now = Utc::now();

        if let Some(ruleset) = overlay.find_ruleset_by_identifier(identifier) {
            let id = ruleset.ruleset_id;
            overlay.touch_ruleset(id, now);
            return Ok(id);
        }
        if let Some(ruleset) = disk.find_ruleset_by_identifier(&rtxn, identifier)? {
            let id = ruleset.ruleset_id;
            let mut resolver = CopyOnDemandResolver::new(disk, overlay);
            resolver.ensure_ruleset_exists(&rtxn, id)?;
            for level in disk.root_levels(&rtxn, id)? {
                resolver.ensure_hierarchy_level_exists(&rtxn, level.level_id)?;
            }
            overlay.touch_ruleset(id, now);
            return Ok(id);
        }
        let id = RulesetId::now_v7();
        overlay.insert_ruleset(Ruleset {
            ruleset_id: id,
            identifier: identifier.to_string(),
            last_used_at: now,
        });
        Ok(id)
    }

    /// A variables combination was used: upsert it and move recency forward.
    pub fn on_ruleset_variables_used(&self, vars: RulesetVariables) -> CanopyResult<()> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        inner.ensure_overlay()?;
        let CacheInner { disk, overlay, .. } = inner;
        let overlay = overlay
            .as_mut()
            .ok_or(CanopyError::Store(StoreError::Closed))?;
        let rtxn = disk.read_txn()?;
        let now = Utc::now();

        CopyOnDemandResolver::new(disk, overlay).ensure_ruleset_exists(&rtxn, vars.ruleset_id)?;
        let ruleset_id = vars.ruleset_id;
        overlay.insert_variables(RulesetVariables {
            last_used_at: now,
            ..vars
        });
        overlay.touch_ruleset(ruleset_id, now);
        Ok(())
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Read a node from the authoritative tier.
    pub fn get_node(&self, node_id: NodeId) -> CanopyResult<Option<Node>> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        inner.check_open()?;
        let policy = TierSelectionPolicy::new(&inner.disk, inner.overlay.as_ref());
        if policy.should_take_node_from_memory(node_id) {
            inner.stats.overlay_hits += 1;
            return Ok(inner
                .overlay
                .as_ref()
                .and_then(|overlay| overlay.get_node(node_id))
                .cloned());
        }
        let rtxn = inner.disk.read_txn()?;
        let node = inner.disk.get_node(&rtxn, node_id)?;
        drop(rtxn);
        if node.is_some() {
            inner.stats.disk_hits += 1;
        } else {
            inner.stats.misses += 1;
        }
        Ok(node)
    }

    /// Read a node's visibility.
    pub fn get_node_visibility(&self, node_id: NodeId) -> CanopyResult<Option<NodeVisibility>> {
        Ok(self.get_node(node_id)?.map(|node| node.visibility))
    }

    /// Read a node's sibling index.
    pub fn get_node_index(&self, node_id: NodeId) -> CanopyResult<Option<NodeIndex>> {
        Ok(self.get_node(node_id)?.map(|node| node.index))
    }

    /// Read a node's key.
    pub fn get_node_key(&self, node_id: NodeId) -> CanopyResult<Option<NodeKey>> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        inner.check_open()?;
        let policy = TierSelectionPolicy::new(&inner.disk, inner.overlay.as_ref());
        if policy.should_take_node_from_memory(node_id) {
            inner.stats.overlay_hits += 1;
            return Ok(inner
                .overlay
                .as_ref()
                .and_then(|overlay| overlay.get_node_key(node_id))
                .cloned());
        }
        let rtxn = inner.disk.read_txn()?;
        let key = inner.disk.get_node_key(&rtxn, node_id)?;
        drop(rtxn);
        if key.is_some() {
            inner.stats.disk_hits += 1;
        } else {
            inner.stats.misses += 1;
        }
        Ok(key)
    }

    /// Find a hierarchy level by its `(ruleset, physical parent, removal)`
    /// triple. An overlay row with overlay-only content shadows the durable
    /// row for the same triple.
    pub fn find_hierarchy_level(
        &self,
        ruleset_id: RulesetId,
        physical_parent: Option<NodeId>,
        removal_id: Option<RemovalId>,
    ) -> CanopyResult<Option<HierarchyLevel>> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        inner.check_open()?;
        if let Some(overlay) = inner.overlay.as_ref() {
            if let Some(level) = overlay.find_level(ruleset_id, physical_parent, removal_id) {
                let parent_in_overlay = physical_parent
                    .map(|parent| overlay.contains_node(parent))
                    .unwrap_or(false);
                if parent_in_overlay || !overlay.was_level_copied_from_disk(level.level_id) {
                    let level = level.clone();
                    inner.stats.overlay_hits += 1;
                    return Ok(Some(level));
                }
            }
        }
        let rtxn = inner.disk.read_txn()?;
        let level = match inner
            .disk
            .get_physical_marker(&rtxn, ruleset_id, physical_parent, removal_id)?
        {
            Some(level_id) => inner.disk.get_hierarchy_level(&rtxn, level_id)?,
            None => None,
        };
        drop(rtxn);
        if level.is_some() {
            inner.stats.disk_hits += 1;
        } else {
            inner.stats.misses += 1;
        }
        Ok(level)
    }

    /// Read the combined hierarchy level displayed under `parent`: every
    /// node of every matching level variation, in sibling order. A merging
    /// parent's effective virtual-parent set is the union of its merged
    /// nodes' virtual parents.
    pub fn get_hierarchy_level(
        &self,
        ruleset_id: RulesetId,
        parent: Option<NodeId>,
    ) -> CanopyResult<Vec<Node>> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        inner.check_open()?;
        let policy = TierSelectionPolicy::new(&inner.disk, inner.overlay.as_ref());
        let from_overlay = policy.should_take_level_from_memory(ruleset_id, parent);

        let mut nodes: Vec<Node> = Vec::new();
        if from_overlay {
            let overlay = inner
                .overlay
                .as_ref()
                .ok_or(CanopyError::Store(StoreError::Closed))?;
            let mut parents = vec![parent];
            if let Some(parent_id) = parent {
                for edge in overlay.merged_nodes_of(parent_id) {
                    parents.push(Some(edge.merged_node_id));
                }
            }
            for level in overlay.levels_with_virtual_parent(ruleset_id, &parents) {
                for source in overlay.sources_for_level(level.level_id) {
                    for node_id in overlay.node_ids_for_source(source.data_source_id) {
                        if let Some(node) = overlay.get_node(node_id) {
                            nodes.push(node.clone());
                        }
                    }
                }
            }
            inner.stats.overlay_hits += 1;
        } else {
            let rtxn = inner.disk.read_txn()?;
            let mut parents = vec![parent];
            if let Some(parent_id) = parent {
                for edge in inner.disk.merged_nodes_of(&rtxn, parent_id)? {
                    parents.push(Some(edge.merged_node_id));
                }
            }
            for level in inner
                .disk
                .levels_with_virtual_parent(&rtxn, ruleset_id, &parents)?
            {
                for source in inner.disk.sources_for_level(&rtxn, level.level_id)? {
                    for node_id in inner
                        .disk
                        .node_ids_for_source(&rtxn, source.data_source_id)?
                    {
                        if let Some(node) = inner.disk.get_node(&rtxn, node_id)? {
                            nodes.push(node);
                        }
                    }
                }
            }
            drop(rtxn);
            if nodes.is_empty() {
                inner.stats.misses += 1;
            } else {
                inner.stats.disk_hits += 1;
            }
        }
        nodes.sort_by(|a, b| canopy_core::IndexCodec::compare(&a.index, &b.index));
        Ok(nodes)
    }

    /// Find a level's data source for a variables combination.
    pub fn find_data_source(
        &self,
        level_id: HierarchyLevelId,
        variables_id: Option<VariablesId>,
    ) -> CanopyResult<Option<DataSource>> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        inner.check_open()?;
        let rtxn = inner.disk.read_txn()?;
        if let Some(overlay) = inner.overlay.as_ref() {
            let policy = TierSelectionPolicy::new(&inner.disk, Some(overlay));
            if let Some(found) = overlay.find_data_source(level_id, variables_id) {
                if policy.should_take_data_source_from_memory(
                    &rtxn,
                    Some(found.data_source_id),
                    level_id,
                )? {
                    let found = found.clone();
                    drop(rtxn);
                    inner.stats.overlay_hits += 1;
                    return Ok(Some(found));
                }
            } else if overlay.contains_level(level_id)
                && !overlay.was_level_copied_from_disk(level_id)
            {
                // The overlay owns this level's content; no such variation.
                drop(rtxn);
                inner.stats.misses += 1;
                return Ok(None);
            }
        }
        let source = inner.disk.find_data_source(&rtxn, level_id, variables_id)?;
        drop(rtxn);
        if source.is_some() {
            inner.stats.disk_hits += 1;
        } else {
            inner.stats.misses += 1;
        }
        Ok(source)
    }

    /// Whether a data source has been fully filled by its producer.
    pub fn is_data_source_initialized(&self, id: DataSourceId) -> CanopyResult<Option<bool>> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        inner.check_open()?;
        let rtxn = inner.disk.read_txn()?;
        if let Some(overlay) = inner.overlay.as_ref() {
            if let Some(source) = overlay.get_data_source(id) {
                let policy = TierSelectionPolicy::new(&inner.disk, Some(overlay));
                if policy.should_take_data_source_from_memory(&rtxn, Some(id), source.level_id)? {
                    let initialized = source.is_initialized;
                    drop(rtxn);
                    inner.stats.overlay_hits += 1;
                    return Ok(Some(initialized));
                }
            }
        }
        let source = inner.disk.get_data_source(&rtxn, id)?;
        drop(rtxn);
        if source.is_some() {
            inner.stats.disk_hits += 1;
        } else {
            inner.stats.misses += 1;
        }
        Ok(source.map(|row| row.is_initialized))
    }

    /// Locate the node carrying exactly this key.
    pub fn locate_node(&self, key: &NodeKey) -> CanopyResult<Option<Node>> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        inner.check_open()?;
        if let Some(overlay) = inner.overlay.as_ref() {
            if let Some(node) = overlay.find_node_by_key(key) {
                let node = node.clone();
                inner.stats.overlay_hits += 1;
                return Ok(Some(node));
            }
        }
        let rtxn = inner.disk.read_txn()?;
        let node = inner.disk.find_node_by_key(&rtxn, key)?;
        drop(rtxn);
        if node.is_some() {
            inner.stats.disk_hits += 1;
        } else {
            inner.stats.misses += 1;
        }
        Ok(node)
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Merge the overlay's net effect into the durable store. The overlay
    /// stays active; call [`HierarchyCache::close`] for full teardown.
    pub fn merge_overlay(&self) -> CanopyResult<()> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        inner.check_open()?;
        let Some(overlay) = inner.overlay.as_ref() else {
            return Ok(());
        };
        MergeEngine::new(&inner.disk, overlay, &inner.config).merge()
    }

    /// Evict least-recently-used rulesets until the durable store fits
    /// `limit` bytes, then compact and checkpoint.
    pub fn limit_cache_size(
        &self,
        limit: u64,
        remove_only_stale: bool,
    ) -> CanopyResult<EvictionReport> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        inner.check_open()?;
        let report = EvictionPolicy::new(&mut inner.disk, &inner.config).limit_cache_size(
            limit,
            remove_only_stale,
            Utc::now(),
        )?;
        inner.stats.evicted_rulesets += report.evicted_rulesets;
        Ok(report)
    }

    /// Tear the wrapper down: merge the overlay, release the advisory lock,
    /// apply the configured size limit, and hand the durable tier back.
    pub fn close(self) -> CanopyResult<DiskTier> {
        let mut inner = self.inner.into_inner().map_err(|_| lock_poisoned())?;
        if let Some(overlay) = inner.overlay.take() {
            if !inner.poisoned {
                MergeEngine::new(&inner.disk, &overlay, &inner.config).merge()?;
            }
            if let Err(e) = inner.locker.unlock() {
                tracing::warn!(error = %e, "hierarchy level lock release failed");
            }
        }
        if let Some(limit) = inner.config.size_limit {
            EvictionPolicy::new(&mut inner.disk, &inner.config).limit_cache_size(
                limit,
                inner.config.remove_only_stale,
                Utc::now(),
            )?;
        }
        Ok(inner.disk)
    }
}
