//! Size-bounded LRU eviction of whole rulesets.
//!
//! The durable store is kept under a configured size by removing the
//! least-recently-used ruleset and everything transitively owned by it,
//! one ruleset per transaction, never anything smaller. Orphan sweeps are
//! each keyed off their own direct parent table, so integrity enforcement
//! is suspended for the duration instead of modeling the full delete graph.
//!
//! LMDB files do not shrink on delete, so the loop watches live page usage
//! and the post-loop compaction reclaims the file bytes.

use canopy_core::{CacheConfig, CanopyResult, Timestamp};
use chrono::Duration as ChronoDuration;

use crate::disk::DiskTier;
use crate::txn::{TransactionGuard, TxnMode};

/// Outcome of one size-limiting pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvictionReport {
    /// Rulesets removed, with everything they owned.
    pub evicted_rulesets: u64,
    /// File size after the pass (and after compaction, when attempted).
    pub final_file_size: u64,
}

/// Keeps the durable store at or below a configured size.
pub struct EvictionPolicy<'a> {
    disk: &'a mut DiskTier,
    config: &'a CacheConfig,
}

impl<'a> EvictionPolicy<'a> {
    pub fn new(disk: &'a mut DiskTier, config: &'a CacheConfig) -> Self {
        Self { disk, config }
    }

    /// Evict least-recently-used rulesets until the store fits `limit`.
    ///
    /// With `remove_only_stale` set, a ruleset used within the staleness
    /// window stops the pass: something plausibly still in use is never
    /// evicted, whatever the limit.
    pub fn limit_cache_size(
        &mut self,
        limit: u64,
        remove_only_stale: bool,
        now: Timestamp,
    ) -> CanopyResult<EvictionReport> {
        if self.disk.file_size()? <= limit {
            return Ok(EvictionReport {
                evicted_rulesets: 0,
                final_file_size: self.disk.file_size()?,
            });
        }

        self.disk.set_integrity_checks(false);
        let evicted = self.evict_until_fits(limit, remove_only_stale, now);
        self.disk.set_integrity_checks(true);
        let evicted = evicted?;

        // Best-effort page reclamation and checkpoint; the deletes are
        // already committed, so failures here are soft.
        if evicted > 0 {
            if let Err(e) = self.disk.compact() {
                tracing::warn!(error = %e, "cache compaction failed");
            }
        }
        if let Err(e) = self.disk.sync() {
            tracing::warn!(error = %e, "cache checkpoint failed");
        }

        Ok(EvictionReport {
            evicted_rulesets: evicted,
            final_file_size: self.disk.file_size()?,
        })
    }

    fn evict_until_fits(
        &mut self,
        limit: u64,
        remove_only_stale: bool,
        now: Timestamp,
    ) -> CanopyResult<u64> {
        let stale_window = ChronoDuration::from_std(self.config.stale_window)
            .unwrap_or_else(|_| ChronoDuration::seconds(300));
        let mut evicted = 0u64;
        loop {
            if self.disk.live_data_size()? <= limit {
                break;
            }
            let candidate = {
                let rtxn = self.disk.read_txn()?;
                self.disk.lru_ruleset(&rtxn)?
            };
            let Some(ruleset) = candidate else {
                break;
            };
            if remove_only_stale && now - ruleset.last_used_at < stale_window {
                tracing::debug!(
                    ruleset = %ruleset.ruleset_id,
                    "size limit not reached but remaining rulesets are fresh"
                );
                break;
            }

            let mut guard = TransactionGuard::begin(
                self.disk,
                "evict-ruleset",
                TxnMode::Immediate,
                self.config.busy_retry_cap,
            )?;
            {
                let wtxn = guard.txn()?;
                for level in self.disk.levels_for_ruleset(wtxn, ruleset.ruleset_id)? {
                    self.disk.delete_physical_marker(
                        wtxn,
                        level.ruleset_id,
                        level.physical_parent_node_id,
                        level.removal_id,
                    )?;
                    self.disk.delete_hierarchy_level(wtxn, level.level_id)?;
                }
                self.disk.delete_ruleset(wtxn, ruleset.ruleset_id)?;
                self.disk.delete_orphaned_variables(wtxn)?;
                self.disk.delete_orphaned_data_sources(wtxn)?;
                self.disk.delete_orphaned_classes(wtxn)?;
                self.disk.delete_orphaned_nodes(wtxn)?;
                self.disk.delete_orphaned_node_keys(wtxn)?;
                self.disk.delete_orphaned_node_instances(wtxn)?;
                self.disk.delete_orphaned_merged_edges(wtxn)?;
            }
            guard.commit()?;
            evicted += 1;
            tracing::debug!(
                ruleset = %ruleset.ruleset_id,
                identifier = %ruleset.identifier,
                "evicted least-recently-used ruleset"
            );
        }
        Ok(evicted)
    }
}
