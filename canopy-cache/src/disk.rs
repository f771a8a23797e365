//! Durable cache tier backed by LMDB (via heed).
//!
//! One environment per cache directory, one named database per logical
//! table, JSON row values. The tier exposes typed row accessors; policy and
//! merge logic never touch raw keys directly.
//!
//! Referential-integrity checks on writes stand in for foreign-key
//! enforcement and can be suspended for bulk reconciliation (merge,
//! eviction), matching how those phases interleave inserts across tables.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use canopy_core::{
    CacheConfig, CanopyError, CanopyResult, ClassTag, ConsistencyError, DataSource,
    DataSourceClass, DataSourceId, EntityIdType, EntityKind, HierarchyLevel, HierarchyLevelId, MergedNode, Node,
    NodeId, NodeInstance, NodeKey, RemovalId, Ruleset, RulesetId, RulesetVariables, StoreError,
    VariablesId,
};
use heed::types::Bytes;
use heed::{CompactionOption, Database, Env, EnvOpenOptions, RoTxn, RwTxn};

use crate::schema::{
    class_key, decode_row, encode_row, id_key, merged_node_key, node_instance_key, node_order_key,
    physical_level_key, TABLE_COUNT, TABLE_DATA_SOURCES, TABLE_DATA_SOURCE_CLASSES,
    TABLE_HIERARCHY_LEVELS, TABLE_MERGED_NODES, TABLE_NODES, TABLE_NODE_INSTANCES,
    TABLE_NODE_KEYS, TABLE_NODE_ORDER, TABLE_PHYSICAL_LEVELS, TABLE_RULESETS, TABLE_VARIABLES,
};

/// LMDB data file name inside the cache directory.
const DATA_FILE: &str = "data.mdb";

/// Side file a compaction copy is written to before the swap.
const COMPACT_FILE: &str = "data.mdb.compacting";

/// Named database handles, reopened together with the environment.
#[derive(Clone, Copy)]
struct Tables {
    rulesets: Database<Bytes, Bytes>,
    variables: Database<Bytes, Bytes>,
    hierarchy_levels: Database<Bytes, Bytes>,
    physical_levels: Database<Bytes, Bytes>,
    data_sources: Database<Bytes, Bytes>,
    data_source_classes: Database<Bytes, Bytes>,
    nodes: Database<Bytes, Bytes>,
    node_keys: Database<Bytes, Bytes>,
    node_instances: Database<Bytes, Bytes>,
    merged_nodes: Database<Bytes, Bytes>,
    node_order: Database<Bytes, Bytes>,
}

/// The durable cache tier.
pub struct DiskTier {
    dir: PathBuf,
    map_size_mb: usize,
    env: Option<Env>,
    tables: Option<Tables>,
    integrity_checks: AtomicBool,
}

/// Map a heed error, classifying contention signals as transient-busy.
fn map_heed(op: &'static str, e: heed::Error) -> StoreError {
    match e {
        heed::Error::Mdb(ref mdb) if is_busy(mdb) => StoreError::Busy {
            reason: format!("{op}: {e}"),
        },
        heed::Error::Io(io) => StoreError::Io(io),
        other => StoreError::Transaction {
            reason: format!("{op}: {other}"),
        },
    }
}

fn is_busy(e: &heed::MdbError) -> bool {
    matches!(
        e,
        heed::MdbError::ReadersFull
            | heed::MdbError::TxnFull
            | heed::MdbError::MapResized
            | heed::MdbError::BadRslot
    )
}

impl DiskTier {
    /// Open (or create) the durable tier in `dir`.
    pub fn open(dir: impl AsRef<Path>, config: &CacheConfig) -> CanopyResult<Self> {
        config.validate().map_err(CanopyError::Config)?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(StoreError::Io)?;
        // A leftover compaction copy means the previous swap never happened;
        // it is stale and unsafe to adopt.
        let leftover = dir.join(COMPACT_FILE);
        if leftover.exists() {
            std::fs::remove_file(&leftover).map_err(StoreError::Io)?;
        }
        let (env, tables) = Self::open_env(&dir, config.map_size_mb)?;
        Ok(Self {
            dir,
            map_size_mb: config.map_size_mb,
            env: Some(env),
            tables: Some(tables),
            integrity_checks: AtomicBool::new(true),
        })
    }

    fn open_env(dir: &Path, map_size_mb: usize) -> CanopyResult<(Env, Tables)> {
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb * 1024 * 1024)
                .max_dbs(TABLE_COUNT)
                .open(dir)
        }
        .map_err(|e| StoreError::EnvOpen {
            reason: e.to_string(),
        })?;

        let mut wtxn = env.write_txn().map_err(|e| map_heed("open", e))?;
        let tables = Tables {
            rulesets: Self::create_table(&env, &mut wtxn, TABLE_RULESETS)?,
            variables: Self::create_table(&env, &mut wtxn, TABLE_VARIABLES)?,
            hierarchy_levels: Self::create_table(&env, &mut wtxn, TABLE_HIERARCHY_LEVELS)?,
            physical_levels: Self::create_table(&env, &mut wtxn, TABLE_PHYSICAL_LEVELS)?,
            data_sources: Self::create_table(&env, &mut wtxn, TABLE_DATA_SOURCES)?,
            data_source_classes: Self::create_table(&env, &mut wtxn, TABLE_DATA_SOURCE_CLASSES)?,
            nodes: Self::create_table(&env, &mut wtxn, TABLE_NODES)?,
            node_keys: Self::create_table(&env, &mut wtxn, TABLE_NODE_KEYS)?,
            node_instances: Self::create_table(&env, &mut wtxn, TABLE_NODE_INSTANCES)?,
            merged_nodes: Self::create_table(&env, &mut wtxn, TABLE_MERGED_NODES)?,
            node_order: Self::create_table(&env, &mut wtxn, TABLE_NODE_ORDER)?,
        };
        wtxn.commit().map_err(|e| map_heed("open", e))?;
        Ok((env, tables))
    }

    fn create_table(
        env: &Env,
        wtxn: &mut RwTxn,
        name: &'static str,
    ) -> CanopyResult<Database<Bytes, Bytes>> {
        env.create_database(wtxn, Some(name))
            .map_err(|e| CanopyError::Store(StoreError::TableOpen {
                table: name,
                reason: e.to_string(),
            }))
    }

    fn env(&self) -> CanopyResult<&Env> {
        self.env
            .as_ref()
            .ok_or(CanopyError::Store(StoreError::Closed))
    }

    fn tables(&self) -> CanopyResult<&Tables> {
        self.tables
            .as_ref()
            .ok_or(CanopyError::Store(StoreError::Closed))
    }

    /// Directory this tier lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Begin a read transaction.
    pub fn read_txn(&self) -> CanopyResult<RoTxn<'_>> {
        Ok(self
            .env()?
            .read_txn()
            .map_err(|e| map_heed("read_txn", e))?)
    }

    /// Begin a write transaction. Contention surfaces as a transient
    /// [`StoreError::Busy`]; the transaction guard handles retries.
    pub fn begin_write(&self) -> CanopyResult<RwTxn<'_>> {
        Ok(self
            .env()?
            .write_txn()
            .map_err(|e| map_heed("begin_write", e))?)
    }

    // ========================================================================
    // INTEGRITY ENFORCEMENT TOGGLE
    // ========================================================================

    /// Enable or disable referential-integrity checks on writes.
    pub fn set_integrity_checks(&self, enabled: bool) {
        self.integrity_checks.store(enabled, Ordering::Relaxed);
    }

    /// Whether writes currently verify their direct parent row.
    pub fn integrity_checks_enabled(&self) -> bool {
        self.integrity_checks.load(Ordering::Relaxed)
    }

    fn check_parent<I: EntityIdType>(
        &self,
        exists: bool,
        entity: EntityKind,
        id: I,
        parent: EntityKind,
        parent_id: uuid::Uuid,
    ) -> CanopyResult<()> {
        if self.integrity_checks_enabled() && !exists {
            return Err(ConsistencyError::OrphanedRow {
                entity,
                id: id.as_uuid(),
                parent,
                parent_id,
            }
            .into());
        }
        Ok(())
    }

    // ========================================================================
    // RULESETS & VARIABLES
    // ========================================================================

    pub fn get_ruleset(&self, rtxn: &RoTxn, id: RulesetId) -> CanopyResult<Option<Ruleset>> {
        let bytes = self
            .tables()?
            .rulesets
            .get(rtxn, &id_key(id))
            .map_err(|e| map_heed("get_ruleset", e))?;
        bytes.map(decode_row).transpose().map_err(Into::into)
    }

    pub fn put_ruleset(&self, wtxn: &mut RwTxn, ruleset: &Ruleset) -> CanopyResult<()> {
        let tables = *self.tables()?;
        tables
            .rulesets
            .put(wtxn, &id_key(ruleset.ruleset_id), &encode_row(ruleset)?)
            .map_err(|e| map_heed("put_ruleset", e))?;
        Ok(())
    }

    pub fn delete_ruleset(&self, wtxn: &mut RwTxn, id: RulesetId) -> CanopyResult<bool> {
        let tables = *self.tables()?;
        Ok(tables
            .rulesets
            .delete(wtxn, &id_key(id))
            .map_err(|e| map_heed("delete_ruleset", e))?)
    }

    pub fn find_ruleset_by_identifier(
        &self,
        rtxn: &RoTxn,
        identifier: &str,
    ) -> CanopyResult<Option<Ruleset>> {
        let tables = *self.tables()?;
        let iter = tables
            .rulesets
            .iter(rtxn)
            .map_err(|e| map_heed("find_ruleset_by_identifier", e))?;
        for result in iter {
            let (_, value) = result.map_err(|e| map_heed("find_ruleset_by_identifier", e))?;
            let ruleset: Ruleset = decode_row(value)?;
            if ruleset.identifier == identifier {
                return Ok(Some(ruleset));
            }
        }
        Ok(None)
    }

    /// The least-recently-used ruleset, ties broken by id.
    pub fn lru_ruleset(&self, rtxn: &RoTxn) -> CanopyResult<Option<Ruleset>> {
        let tables = *self.tables()?;
        let iter = tables
            .rulesets
            .iter(rtxn)
            .map_err(|e| map_heed("lru_ruleset", e))?;
        let mut oldest: Option<Ruleset> = None;
        for result in iter {
            let (_, value) = result.map_err(|e| map_heed("lru_ruleset", e))?;
            let ruleset: Ruleset = decode_row(value)?;
            let is_older = match &oldest {
                None => true,
                Some(current) => {
                    (ruleset.last_used_at, ruleset.ruleset_id)
                        < (current.last_used_at, current.ruleset_id)
                }
            };
            if is_older {
                oldest = Some(ruleset);
            }
        }
        Ok(oldest)
    }

    pub fn ruleset_count(&self, rtxn: &RoTxn) -> CanopyResult<u64> {
        let tables = *self.tables()?;
        Ok(tables
            .rulesets
            .len(rtxn)
            .map_err(|e| map_heed("ruleset_count", e))?)
    }

    pub fn get_variables(
        &self,
        rtxn: &RoTxn,
        id: VariablesId,
    ) -> CanopyResult<Option<RulesetVariables>> {
        let bytes = self
            .tables()?
            .variables
            .get(rtxn, &id_key(id))
            .map_err(|e| map_heed("get_variables", e))?;
        bytes.map(decode_row).transpose().map_err(Into::into)
    }

    pub fn put_variables(&self, wtxn: &mut RwTxn, vars: &RulesetVariables) -> CanopyResult<()> {
        let exists = self.get_ruleset(wtxn, vars.ruleset_id)?.is_some();
        self.check_parent(
            exists,
            EntityKind::Variables,
            vars.variables_id,
            EntityKind::Ruleset,
            vars.ruleset_id.as_uuid(),
        )?;
        let tables = *self.tables()?;
        tables
            .variables
            .put(wtxn, &id_key(vars.variables_id), &encode_row(vars)?)
            .map_err(|e| map_heed("put_variables", e))?;
        Ok(())
    }

    pub fn variables_for_ruleset(
        &self,
        rtxn: &RoTxn,
        ruleset_id: RulesetId,
    ) -> CanopyResult<Vec<RulesetVariables>> {
        let tables = *self.tables()?;
        let iter = tables
            .variables
            .iter(rtxn)
            .map_err(|e| map_heed("variables_for_ruleset", e))?;
        let mut rows = Vec::new();
        for result in iter {
            let (_, value) = result.map_err(|e| map_heed("variables_for_ruleset", e))?;
            let vars: RulesetVariables = decode_row(value)?;
            if vars.ruleset_id == ruleset_id {
                rows.push(vars);
            }
        }
        Ok(rows)
    }

    // ========================================================================
    // HIERARCHY LEVELS & PHYSICAL MARKERS
    // ========================================================================

    pub fn get_hierarchy_level(
        &self,
        rtxn: &RoTxn,
        id: HierarchyLevelId,
    ) -> CanopyResult<Option<HierarchyLevel>> {
        let bytes = self
            .tables()?
            .hierarchy_levels
            .get(rtxn, &id_key(id))
            .map_err(|e| map_heed("get_hierarchy_level", e))?;
        bytes.map(decode_row).transpose().map_err(Into::into)
    }

    /// Insert or replace a level row together with its uniqueness marker.
    pub fn put_hierarchy_level(
        &self,
        wtxn: &mut RwTxn,
        level: &HierarchyLevel,
    ) -> CanopyResult<()> {
        let exists = self.get_ruleset(wtxn, level.ruleset_id)?.is_some();
        self.check_parent(
            exists,
            EntityKind::HierarchyLevel,
            level.level_id,
            EntityKind::Ruleset,
            level.ruleset_id.as_uuid(),
        )?;
        let tables = *self.tables()?;
        tables
            .hierarchy_levels
            .put(wtxn, &id_key(level.level_id), &encode_row(level)?)
            .map_err(|e| map_heed("put_hierarchy_level", e))?;
        Ok(())
    }

    pub fn delete_hierarchy_level(
        &self,
        wtxn: &mut RwTxn,
        id: HierarchyLevelId,
    ) -> CanopyResult<bool> {
        let tables = *self.tables()?;
        Ok(tables
            .hierarchy_levels
            .delete(wtxn, &id_key(id))
            .map_err(|e| map_heed("delete_hierarchy_level", e))?)
    }

    pub fn get_physical_marker(
        &self,
        rtxn: &RoTxn,
        ruleset_id: RulesetId,
        physical_parent: Option<NodeId>,
        removal_id: Option<RemovalId>,
    ) -> CanopyResult<Option<HierarchyLevelId>> {
        let key = physical_level_key(ruleset_id, physical_parent, removal_id);
        let bytes = self
            .tables()?
            .physical_levels
            .get(rtxn, &key)
            .map_err(|e| map_heed("get_physical_marker", e))?;
        match bytes {
            Some(value) if value.len() == 16 => {
                let mut id = [0u8; 16];
                id.copy_from_slice(value);
                Ok(Some(HierarchyLevelId::from_bytes(id)))
            }
            Some(_) => Err(ConsistencyError::CorruptIndex {
                reason: "physical marker value is not a 16-byte id".to_string(),
            }
            .into()),
            None => Ok(None),
        }
    }

    /// Insert a marker unless the triple is already claimed. Returns whether
    /// the marker was written.
    pub fn put_physical_marker_if_absent(
        &self,
        wtxn: &mut RwTxn,
        ruleset_id: RulesetId,
        physical_parent: Option<NodeId>,
        removal_id: Option<RemovalId>,
        level_id: HierarchyLevelId,
    ) -> CanopyResult<bool> {
        if self
            .get_physical_marker(wtxn, ruleset_id, physical_parent, removal_id)?
            .is_some()
        {
            return Ok(false);
        }
        let tables = *self.tables()?;
        let key = physical_level_key(ruleset_id, physical_parent, removal_id);
        tables
            .physical_levels
            .put(wtxn, &key, &level_id.to_bytes())
            .map_err(|e| map_heed("put_physical_marker", e))?;
        Ok(true)
    }

    pub fn delete_physical_marker(
        &self,
        wtxn: &mut RwTxn,
        ruleset_id: RulesetId,
        physical_parent: Option<NodeId>,
        removal_id: Option<RemovalId>,
    ) -> CanopyResult<bool> {
        let tables = *self.tables()?;
        let key = physical_level_key(ruleset_id, physical_parent, removal_id);
        Ok(tables
            .physical_levels
            .delete(wtxn, &key)
            .map_err(|e| map_heed("delete_physical_marker", e))?)
    }

    pub fn levels_for_ruleset(
        &self,
        rtxn: &RoTxn,
        ruleset_id: RulesetId,
    ) -> CanopyResult<Vec<HierarchyLevel>> {
        let tables = *self.tables()?;
        let iter = tables
            .hierarchy_levels
            .iter(rtxn)
            .map_err(|e| map_heed("levels_for_ruleset", e))?;
        let mut rows = Vec::new();
        for result in iter {
            let (_, value) = result.map_err(|e| map_heed("levels_for_ruleset", e))?;
            let level: HierarchyLevel = decode_row(value)?;
            if level.ruleset_id == ruleset_id {
                rows.push(level);
            }
        }
        Ok(rows)
    }

    /// Root levels (no physical parent) of a ruleset, removed ones excluded.
    pub fn root_levels(
        &self,
        rtxn: &RoTxn,
        ruleset_id: RulesetId,
    ) -> CanopyResult<Vec<HierarchyLevel>> {
        Ok(self
            .levels_for_ruleset(rtxn, ruleset_id)?
            .into_iter()
            .filter(|level| level.physical_parent_node_id.is_none() && !level.is_removed())
            .collect())
    }

    /// Non-removed levels whose virtual parent matches any of `parents`.
    pub fn levels_with_virtual_parent(
        &self,
        rtxn: &RoTxn,
        ruleset_id: RulesetId,
        parents: &[Option<NodeId>],
    ) -> CanopyResult<Vec<HierarchyLevel>> {
        Ok(self
            .levels_for_ruleset(rtxn, ruleset_id)?
            .into_iter()
            .filter(|level| {
                !level.is_removed() && parents.contains(&level.virtual_parent_node_id)
            })
            .collect())
    }

    // ========================================================================
    // DATA SOURCES & CLASSES
    // ========================================================================

    pub fn get_data_source(
        &self,
        rtxn: &RoTxn,
        id: DataSourceId,
    ) -> CanopyResult<Option<DataSource>> {
        let bytes = self
            .tables()?
            .data_sources
            .get(rtxn, &id_key(id))
            .map_err(|e| map_heed("get_data_source", e))?;
        bytes.map(decode_row).transpose().map_err(Into::into)
    }

    pub fn put_data_source(&self, wtxn: &mut RwTxn, source: &DataSource) -> CanopyResult<()> {
        let exists = self.get_hierarchy_level(wtxn, source.level_id)?.is_some();
        self.check_parent(
            exists,
            EntityKind::DataSource,
            source.data_source_id,
            EntityKind::HierarchyLevel,
            source.level_id.as_uuid(),
        )?;
        let tables = *self.tables()?;
        tables
            .data_sources
            .put(wtxn, &id_key(source.data_source_id), &encode_row(source)?)
            .map_err(|e| map_heed("put_data_source", e))?;
        Ok(())
    }

    pub fn delete_data_source(&self, wtxn: &mut RwTxn, id: DataSourceId) -> CanopyResult<bool> {
        let tables = *self.tables()?;
        Ok(tables
            .data_sources
            .delete(wtxn, &id_key(id))
            .map_err(|e| map_heed("delete_data_source", e))?)
    }

    pub fn sources_for_level(
        &self,
        rtxn: &RoTxn,
        level_id: HierarchyLevelId,
    ) -> CanopyResult<Vec<DataSource>> {
        let tables = *self.tables()?;
        let iter = tables
            .data_sources
            .iter(rtxn)
            .map_err(|e| map_heed("sources_for_level", e))?;
        let mut rows = Vec::new();
        for result in iter {
            let (_, value) = result.map_err(|e| map_heed("sources_for_level", e))?;
            let source: DataSource = decode_row(value)?;
            if source.level_id == level_id {
                rows.push(source);
            }
        }
        Ok(rows)
    }

    pub fn find_data_source(
        &self,
        rtxn: &RoTxn,
        level_id: HierarchyLevelId,
        variables_id: Option<VariablesId>,
    ) -> CanopyResult<Option<DataSource>> {
        Ok(self
            .sources_for_level(rtxn, level_id)?
            .into_iter()
            .find(|source| source.variables_id == variables_id))
    }

    pub fn put_data_source_class(
        &self,
        wtxn: &mut RwTxn,
        class: &DataSourceClass,
    ) -> CanopyResult<()> {
        let exists = self.get_data_source(wtxn, class.data_source_id)?.is_some();
        self.check_parent(
            exists,
            EntityKind::DataSourceClass,
            class.data_source_id,
            EntityKind::DataSource,
            class.data_source_id.as_uuid(),
        )?;
        let tables = *self.tables()?;
        tables
            .data_source_classes
            .put(
                wtxn,
                &class_key(class.data_source_id, class.class_id),
                &encode_row(class)?,
            )
            .map_err(|e| map_heed("put_data_source_class", e))?;
        Ok(())
    }

    pub fn classes_for_source(
        &self,
        rtxn: &RoTxn,
        data_source_id: DataSourceId,
    ) -> CanopyResult<Vec<ClassTag>> {
        let prefix = id_key(data_source_id);
        let tables = *self.tables()?;
        let iter = tables
            .data_source_classes
            .iter(rtxn)
            .map_err(|e| map_heed("classes_for_source", e))?;
        let mut rows = Vec::new();
        for result in iter {
            let (key, value) = result.map_err(|e| map_heed("classes_for_source", e))?;
            if key.len() >= 16 && &key[..16] == prefix.as_slice() {
                let class: DataSourceClass = decode_row(value)?;
                rows.push(ClassTag {
                    class_id: class.class_id,
                    is_polymorphic: class.is_polymorphic,
                });
            }
        }
        Ok(rows)
    }

    pub fn delete_classes_for_source(
        &self,
        wtxn: &mut RwTxn,
        data_source_id: DataSourceId,
    ) -> CanopyResult<u64> {
        let prefix = id_key(data_source_id);
        let keys = self.collect_keys_with_prefix(wtxn, |t| t.data_source_classes, &prefix)?;
        let tables = *self.tables()?;
        let mut deleted = 0u64;
        for key in &keys {
            if tables
                .data_source_classes
                .delete(wtxn, key)
                .map_err(|e| map_heed("delete_classes_for_source", e))?
            {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    // ========================================================================
    // NODES, KEYS, INSTANCES, MERGED EDGES
    // ========================================================================

    pub fn get_node(&self, rtxn: &RoTxn, id: NodeId) -> CanopyResult<Option<Node>> {
        let bytes = self
            .tables()?
            .nodes
            .get(rtxn, &id_key(id))
            .map_err(|e| map_heed("get_node", e))?;
        bytes.map(decode_row).transpose().map_err(Into::into)
    }

    /// Insert or replace a node row, keeping the sibling-order index in step.
    pub fn put_node(&self, wtxn: &mut RwTxn, node: &Node) -> CanopyResult<()> {
        let exists = self.get_data_source(wtxn, node.data_source_id)?.is_some();
        self.check_parent(
            exists,
            EntityKind::Node,
            node.node_id,
            EntityKind::DataSource,
            node.data_source_id.as_uuid(),
        )?;
        let tables = *self.tables()?;
        if let Some(existing) = self.get_node(wtxn, node.node_id)? {
            if existing.data_source_id != node.data_source_id || existing.index != node.index {
                tables
                    .node_order
                    .delete(
                        wtxn,
                        &node_order_key(existing.data_source_id, &existing.index),
                    )
                    .map_err(|e| map_heed("put_node", e))?;
            }
        }
        tables
            .nodes
            .put(wtxn, &id_key(node.node_id), &encode_row(node)?)
            .map_err(|e| map_heed("put_node", e))?;
        tables
            .node_order
            .put(
                wtxn,
                &node_order_key(node.data_source_id, &node.index),
                &node.node_id.to_bytes(),
            )
            .map_err(|e| map_heed("put_node", e))?;
        Ok(())
    }

    /// Delete a node row and every row it directly owns.
    pub fn delete_node_cascade(&self, wtxn: &mut RwTxn, id: NodeId) -> CanopyResult<bool> {
        let tables = *self.tables()?;
        let Some(node) = self.get_node(wtxn, id)? else {
            return Ok(false);
        };
        tables
            .node_order
            .delete(wtxn, &node_order_key(node.data_source_id, &node.index))
            .map_err(|e| map_heed("delete_node_cascade", e))?;
        tables
            .nodes
            .delete(wtxn, &id_key(id))
            .map_err(|e| map_heed("delete_node_cascade", e))?;
        self.delete_node_key(wtxn, id)?;
        self.delete_instances_for_node(wtxn, id)?;
        self.delete_merged_edges_of(wtxn, id)?;
        Ok(true)
    }

    /// The node occupying this sibling index, if any.
    pub fn node_at_index(
        &self,
        rtxn: &RoTxn,
        data_source_id: DataSourceId,
        index: &canopy_core::NodeIndex,
    ) -> CanopyResult<Option<NodeId>> {
        let bytes = self
            .tables()?
            .node_order
            .get(rtxn, &node_order_key(data_source_id, index))
            .map_err(|e| map_heed("node_at_index", e))?;
        match bytes {
            Some(value) if value.len() == 16 => {
                let mut id = [0u8; 16];
                id.copy_from_slice(value);
                Ok(Some(NodeId::from_bytes(id)))
            }
            Some(_) => Err(ConsistencyError::CorruptIndex {
                reason: "node order value is not a 16-byte id".to_string(),
            }
            .into()),
            None => Ok(None),
        }
    }

    pub fn node_count_for_source(
        &self,
        rtxn: &RoTxn,
        data_source_id: DataSourceId,
    ) -> CanopyResult<u64> {
        let prefix = id_key(data_source_id);
        let keys = self.collect_keys_with_prefix(rtxn, |t| t.node_order, &prefix)?;
        Ok(keys.len() as u64)
    }

    /// Node ids under a data source in sibling order.
    pub fn node_ids_for_source(
        &self,
        rtxn: &RoTxn,
        data_source_id: DataSourceId,
    ) -> CanopyResult<Vec<NodeId>> {
        let prefix = id_key(data_source_id);
        let tables = *self.tables()?;
        let iter = tables
            .node_order
            .iter(rtxn)
            .map_err(|e| map_heed("node_ids_for_source", e))?;
        let mut ids = Vec::new();
        for result in iter {
            let (key, value) = result.map_err(|e| map_heed("node_ids_for_source", e))?;
            if key.len() >= 16 && &key[..16] == prefix.as_slice() {
                if value.len() != 16 {
                    return Err(ConsistencyError::CorruptIndex {
                        reason: "node order value is not a 16-byte id".to_string(),
                    }
                    .into());
                }
                let mut id = [0u8; 16];
                id.copy_from_slice(value);
                ids.push(NodeId::from_bytes(id));
            }
        }
        Ok(ids)
    }

    pub fn get_node_key(&self, rtxn: &RoTxn, id: NodeId) -> CanopyResult<Option<NodeKey>> {
        let bytes = self
            .tables()?
            .node_keys
            .get(rtxn, &id_key(id))
            .map_err(|e| map_heed("get_node_key", e))?;
        bytes.map(decode_row).transpose().map_err(Into::into)
    }

    pub fn put_node_key(&self, wtxn: &mut RwTxn, id: NodeId, key: &NodeKey) -> CanopyResult<()> {
        let exists = self.get_node(wtxn, id)?.is_some();
        self.check_parent(
            exists,
            EntityKind::NodeKey,
            id,
            EntityKind::Node,
            id.as_uuid(),
        )?;
        let tables = *self.tables()?;
        tables
            .node_keys
            .put(wtxn, &id_key(id), &encode_row(key)?)
            .map_err(|e| map_heed("put_node_key", e))?;
        Ok(())
    }

    pub fn delete_node_key(&self, wtxn: &mut RwTxn, id: NodeId) -> CanopyResult<bool> {
        let tables = *self.tables()?;
        Ok(tables
            .node_keys
            .delete(wtxn, &id_key(id))
            .map_err(|e| map_heed("delete_node_key", e))?)
    }

    /// Find the node carrying exactly this key.
    pub fn find_node_by_key(&self, rtxn: &RoTxn, key: &NodeKey) -> CanopyResult<Option<Node>> {
        let tables = *self.tables()?;
        let iter = tables
            .node_keys
            .iter(rtxn)
            .map_err(|e| map_heed("find_node_by_key", e))?;
        for result in iter {
            let (raw_id, value) = result.map_err(|e| map_heed("find_node_by_key", e))?;
            let stored: NodeKey = decode_row(value)?;
            if &stored == key {
                if raw_id.len() != 16 {
                    return Err(ConsistencyError::CorruptIndex {
                        reason: "node key row id is not 16 bytes".to_string(),
                    }
                    .into());
                }
                let mut id = [0u8; 16];
                id.copy_from_slice(raw_id);
                return self.get_node(rtxn, NodeId::from_bytes(id));
            }
        }
        Ok(None)
    }

    pub fn put_node_instance(
        &self,
        wtxn: &mut RwTxn,
        instance: &NodeInstance,
    ) -> CanopyResult<()> {
        let exists = self.get_node(wtxn, instance.node_id)?.is_some();
        self.check_parent(
            exists,
            EntityKind::NodeInstance,
            instance.node_id,
            EntityKind::Node,
            instance.node_id.as_uuid(),
        )?;
        let tables = *self.tables()?;
        tables
            .node_instances
            .put(
                wtxn,
                &node_instance_key(instance.node_id, instance.key),
                &encode_row(instance)?,
            )
            .map_err(|e| map_heed("put_node_instance", e))?;
        Ok(())
    }

    pub fn instances_for_node(
        &self,
        rtxn: &RoTxn,
        node_id: NodeId,
    ) -> CanopyResult<Vec<NodeInstance>> {
        let prefix = id_key(node_id);
        let tables = *self.tables()?;
        let iter = tables
            .node_instances
            .iter(rtxn)
            .map_err(|e| map_heed("instances_for_node", e))?;
        let mut rows = Vec::new();
        for result in iter {
            let (key, value) = result.map_err(|e| map_heed("instances_for_node", e))?;
            if key.len() >= 16 && &key[..16] == prefix.as_slice() {
                rows.push(decode_row(value)?);
            }
        }
        Ok(rows)
    }

    pub fn delete_instances_for_node(
        &self,
        wtxn: &mut RwTxn,
        node_id: NodeId,
    ) -> CanopyResult<u64> {
        let prefix = id_key(node_id);
        let keys = self.collect_keys_with_prefix(wtxn, |t| t.node_instances, &prefix)?;
        let tables = *self.tables()?;
        let mut deleted = 0u64;
        for key in &keys {
            if tables
                .node_instances
                .delete(wtxn, key)
                .map_err(|e| map_heed("delete_instances_for_node", e))?
            {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    pub fn put_merged_edge(&self, wtxn: &mut RwTxn, edge: &MergedNode) -> CanopyResult<()> {
        let merging_exists = self.get_node(wtxn, edge.merging_node_id)?.is_some();
        self.check_parent(
            merging_exists,
            EntityKind::MergedNode,
            edge.merging_node_id,
            EntityKind::Node,
            edge.merging_node_id.as_uuid(),
        )?;
        let merged_exists = self.get_node(wtxn, edge.merged_node_id)?.is_some();
        self.check_parent(
            merged_exists,
            EntityKind::MergedNode,
            edge.merged_node_id,
            EntityKind::Node,
            edge.merged_node_id.as_uuid(),
        )?;
        let tables = *self.tables()?;
        tables
            .merged_nodes
            .put(
                wtxn,
                &merged_node_key(edge.merging_node_id, edge.merged_node_id),
                &encode_row(edge)?,
            )
            .map_err(|e| map_heed("put_merged_edge", e))?;
        Ok(())
    }

    /// Edges absorbed by `merging` (prefix scan on the merging id).
    pub fn merged_nodes_of(&self, rtxn: &RoTxn, merging: NodeId) -> CanopyResult<Vec<MergedNode>> {
        let prefix = id_key(merging);
        let tables = *self.tables()?;
        let iter = tables
            .merged_nodes
            .iter(rtxn)
            .map_err(|e| map_heed("merged_nodes_of", e))?;
        let mut rows = Vec::new();
        for result in iter {
            let (key, value) = result.map_err(|e| map_heed("merged_nodes_of", e))?;
            if key.len() >= 16 && &key[..16] == prefix.as_slice() {
                rows.push(decode_row(value)?);
            }
        }
        Ok(rows)
    }

    pub fn delete_merged_edges_of(&self, wtxn: &mut RwTxn, merging: NodeId) -> CanopyResult<u64> {
        let prefix = id_key(merging);
        let keys = self.collect_keys_with_prefix(wtxn, |t| t.merged_nodes, &prefix)?;
        let tables = *self.tables()?;
        let mut deleted = 0u64;
        for key in &keys {
            if tables
                .merged_nodes
                .delete(wtxn, key)
                .map_err(|e| map_heed("delete_merged_edges_of", e))?
            {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Delete a data source together with every row it owns.
    pub fn delete_data_source_cascade(
        &self,
        wtxn: &mut RwTxn,
        id: DataSourceId,
    ) -> CanopyResult<bool> {
        for node_id in self.node_ids_for_source(wtxn, id)? {
            self.delete_node_cascade(wtxn, node_id)?;
        }
        self.delete_classes_for_source(wtxn, id)?;
        self.delete_data_source(wtxn, id)
    }

    // ========================================================================
    // ORPHAN SWEEPS (eviction support)
    // ========================================================================

    /// Delete variables rows whose ruleset no longer exists.
    pub fn delete_orphaned_variables(&self, wtxn: &mut RwTxn) -> CanopyResult<u64> {
        let tables = *self.tables()?;
        let mut doomed = Vec::new();
        {
            let iter = tables
                .variables
                .iter(wtxn)
                .map_err(|e| map_heed("delete_orphaned_variables", e))?;
            for result in iter {
                let (key, value) = result.map_err(|e| map_heed("delete_orphaned_variables", e))?;
                let vars: RulesetVariables = decode_row(value)?;
                if self.get_ruleset(wtxn, vars.ruleset_id)?.is_none() {
                    doomed.push(key.to_vec());
                }
            }
        }
        self.delete_keys(wtxn, tables.variables, &doomed, "delete_orphaned_variables")
    }

    /// Delete data sources whose hierarchy level no longer exists.
    pub fn delete_orphaned_data_sources(&self, wtxn: &mut RwTxn) -> CanopyResult<u64> {
        let tables = *self.tables()?;
        let mut doomed = Vec::new();
        {
            let iter = tables
                .data_sources
                .iter(wtxn)
                .map_err(|e| map_heed("delete_orphaned_data_sources", e))?;
            for result in iter {
                let (key, value) =
                    result.map_err(|e| map_heed("delete_orphaned_data_sources", e))?;
                let source: DataSource = decode_row(value)?;
                if self.get_hierarchy_level(wtxn, source.level_id)?.is_none() {
                    doomed.push(key.to_vec());
                }
            }
        }
        self.delete_keys(
            wtxn,
            tables.data_sources,
            &doomed,
            "delete_orphaned_data_sources",
        )
    }

    /// Delete class tags whose data source no longer exists.
    pub fn delete_orphaned_classes(&self, wtxn: &mut RwTxn) -> CanopyResult<u64> {
        let tables = *self.tables()?;
        let mut doomed = Vec::new();
        {
            let iter = tables
                .data_source_classes
                .iter(wtxn)
                .map_err(|e| map_heed("delete_orphaned_classes", e))?;
            for result in iter {
                let (key, value) = result.map_err(|e| map_heed("delete_orphaned_classes", e))?;
                let class: DataSourceClass = decode_row(value)?;
                if self.get_data_source(wtxn, class.data_source_id)?.is_none() {
                    doomed.push(key.to_vec());
                }
            }
        }
        self.delete_keys(
            wtxn,
            tables.data_source_classes,
            &doomed,
            "delete_orphaned_classes",
        )
    }

    /// Delete nodes (and their order entries) whose data source is gone.
    pub fn delete_orphaned_nodes(&self, wtxn: &mut RwTxn) -> CanopyResult<u64> {
        let tables = *self.tables()?;
        let mut doomed = Vec::new();
        {
            let iter = tables
                .nodes
                .iter(wtxn)
                .map_err(|e| map_heed("delete_orphaned_nodes", e))?;
            for result in iter {
                let (key, value) = result.map_err(|e| map_heed("delete_orphaned_nodes", e))?;
                let node: Node = decode_row(value)?;
                if self.get_data_source(wtxn, node.data_source_id)?.is_none() {
                    doomed.push((key.to_vec(), node.data_source_id, node.index.clone()));
                }
            }
        }
        let mut deleted = 0u64;
        for (key, data_source_id, index) in &doomed {
            tables
                .node_order
                .delete(wtxn, &node_order_key(*data_source_id, index))
                .map_err(|e| map_heed("delete_orphaned_nodes", e))?;
            if tables
                .nodes
                .delete(wtxn, key)
                .map_err(|e| map_heed("delete_orphaned_nodes", e))?
            {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Delete node keys whose node no longer exists.
    pub fn delete_orphaned_node_keys(&self, wtxn: &mut RwTxn) -> CanopyResult<u64> {
        let tables = *self.tables()?;
        let doomed = self.orphaned_node_owned_keys(wtxn, tables.node_keys, "node_keys")?;
        self.delete_keys(wtxn, tables.node_keys, &doomed, "delete_orphaned_node_keys")
    }

    /// Delete instance rows whose node no longer exists.
    pub fn delete_orphaned_node_instances(&self, wtxn: &mut RwTxn) -> CanopyResult<u64> {
        let tables = *self.tables()?;
        let doomed =
            self.orphaned_node_owned_keys(wtxn, tables.node_instances, "node_instances")?;
        self.delete_keys(
            wtxn,
            tables.node_instances,
            &doomed,
            "delete_orphaned_node_instances",
        )
    }

    /// Delete merged edges with a missing endpoint.
    pub fn delete_orphaned_merged_edges(&self, wtxn: &mut RwTxn) -> CanopyResult<u64> {
        let tables = *self.tables()?;
        let mut doomed = Vec::new();
        {
            let iter = tables
                .merged_nodes
                .iter(wtxn)
                .map_err(|e| map_heed("delete_orphaned_merged_edges", e))?;
            for result in iter {
                let (key, value) =
                    result.map_err(|e| map_heed("delete_orphaned_merged_edges", e))?;
                let edge: MergedNode = decode_row(value)?;
                if self.get_node(wtxn, edge.merging_node_id)?.is_none()
                    || self.get_node(wtxn, edge.merged_node_id)?.is_none()
                {
                    doomed.push(key.to_vec());
                }
            }
        }
        self.delete_keys(
            wtxn,
            tables.merged_nodes,
            &doomed,
            "delete_orphaned_merged_edges",
        )
    }

    /// Keys of node-owned rows (16-byte node id prefix) whose node is gone.
    fn orphaned_node_owned_keys(
        &self,
        wtxn: &RwTxn,
        db: Database<Bytes, Bytes>,
        op: &'static str,
    ) -> CanopyResult<Vec<Vec<u8>>> {
        let iter = db.iter(wtxn).map_err(|e| map_heed(op, e))?;
        let mut doomed = Vec::new();
        for result in iter {
            let (key, _) = result.map_err(|e| map_heed(op, e))?;
            if key.len() < 16 {
                continue;
            }
            let mut id = [0u8; 16];
            id.copy_from_slice(&key[..16]);
            if self.get_node(wtxn, NodeId::from_bytes(id))?.is_none() {
                doomed.push(key.to_vec());
            }
        }
        Ok(doomed)
    }

    fn delete_keys(
        &self,
        wtxn: &mut RwTxn,
        db: Database<Bytes, Bytes>,
        keys: &[Vec<u8>],
        op: &'static str,
    ) -> CanopyResult<u64> {
        let mut deleted = 0u64;
        for key in keys {
            if db.delete(wtxn, key).map_err(|e| map_heed(op, e))? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn collect_keys_with_prefix(
        &self,
        rtxn: &RoTxn,
        table: impl Fn(&Tables) -> Database<Bytes, Bytes>,
        prefix: &[u8],
    ) -> CanopyResult<Vec<Vec<u8>>> {
        let db = table(self.tables()?);
        let iter = db.iter(rtxn).map_err(|e| map_heed("collect_prefix", e))?;
        let mut keys = Vec::new();
        for result in iter {
            let (key, _) = result.map_err(|e| map_heed("collect_prefix", e))?;
            if key.len() >= prefix.len() && &key[..prefix.len()] == prefix {
                keys.push(key.to_vec());
            }
        }
        Ok(keys)
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// Size of the data file on disk. LMDB files do not shrink on delete;
    /// [`DiskTier::compact`] reclaims the space.
    pub fn file_size(&self) -> CanopyResult<u64> {
        let path = self.dir.join(DATA_FILE);
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(StoreError::Io(e).into()),
        }
    }

    /// Bytes occupied by live pages. Shrinks as rows are deleted, unlike the
    /// file itself.
    pub fn live_data_size(&self) -> CanopyResult<u64> {
        Ok(self
            .env()?
            .non_free_pages_size()
            .map_err(|e| map_heed("live_data_size", e))?)
    }

    /// Rewrite the data file without its free pages and reopen.
    ///
    /// On a failed swap or reopen the tier stays closed and every later call
    /// fails with [`StoreError::Closed`].
    pub fn compact(&mut self) -> CanopyResult<()> {
        let compacted = self.dir.join(COMPACT_FILE);
        self.env()?
            .copy_to_file(&compacted, CompactionOption::Enabled)
            .map_err(|e| map_heed("compact", e))?;
        let env = self
            .env
            .take()
            .ok_or(CanopyError::Store(StoreError::Closed))?;
        self.tables = None;
        env.prepare_for_closing().wait();
        std::fs::rename(&compacted, self.dir.join(DATA_FILE)).map_err(StoreError::Io)?;
        let (env, tables) = Self::open_env(&self.dir, self.map_size_mb)?;
        self.env = Some(env);
        self.tables = Some(tables);
        Ok(())
    }

    /// Flush outstanding writes to the file system.
    pub fn sync(&self) -> CanopyResult<()> {
        self.env()?
            .force_sync()
            .map_err(|e| map_heed("sync", e))?;
        Ok(())
    }

    // ========================================================================
    // INTEGRITY VERIFICATION
    // ========================================================================

    /// Walk the referential invariants and report the first violation.
    pub fn verify_integrity(&self) -> CanopyResult<()> {
        let rtxn = self.read_txn()?;
        let tables = *self.tables()?;

        let iter = tables
            .hierarchy_levels
            .iter(&rtxn)
            .map_err(|e| map_heed("verify_integrity", e))?;
        for result in iter {
            let (_, value) = result.map_err(|e| map_heed("verify_integrity", e))?;
            let level: HierarchyLevel = decode_row(value)?;
            if self.get_ruleset(&rtxn, level.ruleset_id)?.is_none() {
                return Err(ConsistencyError::OrphanedRow {
                    entity: EntityKind::HierarchyLevel,
                    id: level.level_id.as_uuid(),
                    parent: EntityKind::Ruleset,
                    parent_id: level.ruleset_id.as_uuid(),
                }
                .into());
            }
        }

        let iter = tables
            .data_sources
            .iter(&rtxn)
            .map_err(|e| map_heed("verify_integrity", e))?;
        for result in iter {
            let (_, value) = result.map_err(|e| map_heed("verify_integrity", e))?;
            let source: DataSource = decode_row(value)?;
            if self.get_hierarchy_level(&rtxn, source.level_id)?.is_none() {
                return Err(ConsistencyError::OrphanedRow {
                    entity: EntityKind::DataSource,
                    id: source.data_source_id.as_uuid(),
                    parent: EntityKind::HierarchyLevel,
                    parent_id: source.level_id.as_uuid(),
                }
                .into());
            }
        }

        let iter = tables
            .nodes
            .iter(&rtxn)
            .map_err(|e| map_heed("verify_integrity", e))?;
        for result in iter {
            let (_, value) = result.map_err(|e| map_heed("verify_integrity", e))?;
            let node: Node = decode_row(value)?;
            if self.get_data_source(&rtxn, node.data_source_id)?.is_none() {
                return Err(ConsistencyError::OrphanedRow {
                    entity: EntityKind::Node,
                    id: node.node_id.as_uuid(),
                    parent: EntityKind::DataSource,
                    parent_id: node.data_source_id.as_uuid(),
                }
                .into());
            }
        }

        Ok(())
    }
}
