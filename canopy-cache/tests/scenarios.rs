//! End-to-end scenarios exercising the public cache surface.

use std::cmp::Ordering;

use canopy_cache::HierarchyCache;
use canopy_core::{
    CacheConfig, DataSourceInfo, HierarchyLevelIdentifier, IndexCodec, InstanceKey, NodeIndex,
};
use canopy_test_utils::{
    make_custom_key, make_node, seed_aged_ruleset_tree, temp_cache, temp_tier, temp_tier_with,
};

/// One ruleset, one root level, one source, two ordered nodes: index reads
/// and comparisons behave like the sibling order.
#[test]
fn test_scenario_ordered_siblings() {
    let fixture = temp_cache();
    let cache = &fixture.cache;

    cache
        .on_ruleset_used("R1")
        .expect("ruleset should register");
    let level_id = cache
        .cache_hierarchy_level(&HierarchyLevelIdentifier::root("R1"))
        .expect("level should cache");
    let source_id = cache
        .cache_data_source(&DataSourceInfo::new(level_id))
        .expect("source should cache");

    let n1 = make_node(source_id, 0, "n1");
    let n2 = make_node(source_id, 1, "n2");
    cache
        .cache_node(n1.clone(), make_custom_key(n1.node_id), vec![])
        .expect("n1 should cache");
    cache
        .cache_node(n2.clone(), make_custom_key(n2.node_id), vec![])
        .expect("n2 should cache");

    assert_eq!(
        cache
            .get_node_index(n2.node_id)
            .expect("index read should succeed"),
        Some(NodeIndex::new(vec![1]))
    );
    assert_eq!(
        IndexCodec::compare(&NodeIndex::new(vec![0]), &NodeIndex::new(vec![1])),
        Ordering::Less
    );
}

/// Caching a level on an uninitialized overlay creates the overlay, copies
/// the ruleset from the durable store, and writes the level only to the
/// overlay; the overlay's row then shadows the durable one with the same
/// identification.
#[test]
fn test_scenario_overlay_level_shadows_durable_row() {
    let tier = temp_tier();
    let seeded = seed_aged_ruleset_tree(&tier.disk, "R1", 3600, 0);
    let disk_level_id = seeded.level.level_id;

    let cache = HierarchyCache::new(tier.disk, CacheConfig::default());
    assert!(!cache.is_overlay_active());

    let new_level_id = cache
        .cache_hierarchy_level(&HierarchyLevelIdentifier::root("R1"))
        .expect("level should cache");
    assert!(cache.is_overlay_active());
    assert_ne!(new_level_id, disk_level_id);

    let found = cache
        .find_hierarchy_level(seeded.ruleset.ruleset_id, None, None)
        .expect("find should succeed")
        .expect("level should be found");
    assert_eq!(found.level_id, new_level_id);
    // The ruleset itself was resolved from the durable store, not recreated.
    assert_eq!(found.ruleset_id, seeded.ruleset.ruleset_id);
}

/// Merging the overlay back is idempotent and leaves a durable store that
/// passes integrity verification.
#[test]
fn test_scenario_merge_back_idempotence() {
    let fixture = temp_cache();
    let cache = &fixture.cache;

    let level_id = cache
        .cache_hierarchy_level(&HierarchyLevelIdentifier::root("R1"))
        .expect("level should cache");
    let source_id = cache
        .cache_data_source(&DataSourceInfo::new(level_id))
        .expect("source should cache");
    for ordinal in 0..3u64 {
        let node = make_node(source_id, ordinal, "n");
        cache
            .cache_node(
                node.clone(),
                make_custom_key(node.node_id),
                vec![InstanceKey::new(1, ordinal)],
            )
            .expect("node should cache");
    }

    cache.merge_overlay().expect("first merge should succeed");
    cache.merge_overlay().expect("second merge should succeed");

    let disk = fixture.cache.close().expect("close should succeed");
    assert!(disk.verify_integrity().is_ok());
    let rtxn = disk.read_txn().expect("read_txn should succeed");
    assert_eq!(
        disk.node_count_for_source(&rtxn, source_id)
            .expect("count should succeed"),
        3
    );
}

/// Size limiting removes the least-recently-used ruleset with everything it
/// owns, re-measures the file, and attempts compaction.
#[test]
fn test_scenario_size_limit_evicts_lru_ruleset() {
    let tier = temp_tier();
    let old = seed_aged_ruleset_tree(&tier.disk, "old-rules", 3600, 2);
    let _fresh = seed_aged_ruleset_tree(&tier.disk, "fresh-rules", 0, 2);

    let cache = HierarchyCache::new(tier.disk, CacheConfig::default());
    let report = cache
        .limit_cache_size(1000, false)
        .expect("limit should succeed");
    assert!(report.evicted_rulesets >= 1);
    assert!(report.final_file_size > 0);

    let disk = cache.close().expect("close should succeed");
    let rtxn = disk.read_txn().expect("read_txn should succeed");
    assert!(disk
        .get_ruleset(&rtxn, old.ruleset.ruleset_id)
        .expect("get should succeed")
        .is_none());
    assert!(disk
        .get_hierarchy_level(&rtxn, old.level.level_id)
        .expect("get should succeed")
        .is_none());
    assert!(disk
        .get_data_source(&rtxn, old.source.data_source_id)
        .expect("get should succeed")
        .is_none());
    for node in &old.nodes {
        assert!(disk
            .get_node(&rtxn, node.node_id)
            .expect("get should succeed")
            .is_none());
    }
    drop(rtxn);
    assert!(disk.verify_integrity().is_ok());
}

/// A ruleset used moments ago survives any size limit when only stale data
/// may be removed.
#[test]
fn test_scenario_stale_window_protects_live_ruleset() {
    let tier = temp_tier();
    let live = seed_aged_ruleset_tree(&tier.disk, "live-rules", 1, 2);

    let cache = HierarchyCache::new(tier.disk, CacheConfig::default());
    let report = cache
        .limit_cache_size(1, true)
        .expect("limit should succeed");
    assert_eq!(report.evicted_rulesets, 0);

    let disk = cache.close().expect("close should succeed");
    let rtxn = disk.read_txn().expect("read_txn should succeed");
    assert!(disk
        .get_ruleset(&rtxn, live.ruleset.ruleset_id)
        .expect("get should succeed")
        .is_some());
}

/// Reads served while an overlay mirrors only part of a data source fall
/// back to the durable store until the overlay catches up.
#[test]
fn test_scenario_partial_mirror_reads_durable_store() {
    let tier = temp_tier();
    let seeded = seed_aged_ruleset_tree(&tier.disk, "R1", 3600, 5);

    let cache = HierarchyCache::new(tier.disk, CacheConfig::default());
    // Touching one node copies it (and its chain) into the overlay.
    cache
        .make_virtual(seeded.nodes[0].node_id)
        .expect("make_virtual should succeed");

    // The partially mirrored source still answers from the durable store.
    let found = cache
        .find_data_source(seeded.level.level_id, None)
        .expect("find should succeed")
        .expect("source should be found");
    assert_eq!(found.data_source_id, seeded.source.data_source_id);
    assert!(found.is_initialized);

    // Nodes the overlay holds answer from the overlay with their mutation.
    assert_eq!(
        cache
            .get_node_visibility(seeded.nodes[0].node_id)
            .expect("read should succeed"),
        Some(canopy_core::NodeVisibility::Virtual)
    );
    // Untouched siblings still answer from the durable store.
    assert_eq!(
        cache
            .get_node_visibility(seeded.nodes[4].node_id)
            .expect("read should succeed"),
        Some(canopy_core::NodeVisibility::Visible)
    );
}

/// The combined level read returns every sibling in index order, whichever
/// tier answers.
#[test]
fn test_scenario_combined_level_is_index_ordered() {
    let tier = temp_tier();
    let seeded = seed_aged_ruleset_tree(&tier.disk, "R1", 3600, 4);

    let cache = HierarchyCache::new(tier.disk, CacheConfig::default());
    let nodes = cache
        .get_hierarchy_level(seeded.ruleset.ruleset_id, None)
        .expect("level read should succeed");
    assert_eq!(nodes.len(), 4);
    for window in nodes.windows(2) {
        assert_ne!(
            IndexCodec::compare(&window[0].index, &window[1].index),
            Ordering::Greater
        );
    }
}

/// Closing with a configured size limit runs eviction after merge-back.
#[test]
fn test_scenario_close_applies_configured_limit() {
    let config = CacheConfig::default()
        .with_size_limit(1)
        .with_remove_only_stale(false);
    let tier = temp_tier_with(&config);
    seed_aged_ruleset_tree(&tier.disk, "doomed", 3600, 2);

    let cache = HierarchyCache::new(tier.disk, config);
    let disk = cache.close().expect("close should succeed");
    let rtxn = disk.read_txn().expect("read_txn should succeed");
    assert_eq!(
        disk.ruleset_count(&rtxn).expect("count should succeed"),
        0
    );
}
