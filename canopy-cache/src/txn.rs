//! Bounded-retry transaction guard for the durable tier.
//!
//! Every multi-statement durable-store mutation (merge, eviction) runs under
//! a guard. Begin retries immediately, without backoff, while the store
//! reports transient contention; an exhausted cap is a soft assertion and the
//! caller treats the failed begin as a no-op mutation.

use canopy_core::{CanopyError, CanopyResult, StoreError};
use heed::RwTxn;

use crate::disk::DiskTier;

/// When the guard actually begins its write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    /// Begin lazily, on first access to the transaction.
    Deferred,
    /// Begin at guard construction.
    Immediate,
}

/// Write-transaction wrapper with bounded busy-retry.
pub struct TransactionGuard<'env> {
    name: &'static str,
    retry_cap: u32,
    disk: &'env DiskTier,
    txn: Option<RwTxn<'env>>,
}

impl<'env> TransactionGuard<'env> {
    /// Create a guard; `Immediate` mode begins the transaction right away.
    pub fn begin(
        disk: &'env DiskTier,
        name: &'static str,
        mode: TxnMode,
        retry_cap: u32,
    ) -> CanopyResult<Self> {
        let mut guard = Self {
            name,
            retry_cap,
            disk,
            txn: None,
        };
        if mode == TxnMode::Immediate {
            guard.ensure_begun()?;
        }
        Ok(guard)
    }

    fn ensure_begun(&mut self) -> CanopyResult<()> {
        if self.txn.is_some() {
            return Ok(());
        }
        let mut attempts = 0u32;
        loop {
            match self.disk.begin_write() {
                Ok(txn) => {
                    self.txn = Some(txn);
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempts < self.retry_cap => {
                    attempts += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::warn!(
                            txn = self.name,
                            attempts,
                            "transaction begin retry cap exhausted"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    /// The open write transaction, beginning it if deferred.
    pub fn txn(&mut self) -> CanopyResult<&mut RwTxn<'env>> {
        self.ensure_begun()?;
        self.txn
            .as_mut()
            .ok_or(CanopyError::Store(StoreError::Closed))
    }

    /// Whether the transaction has begun.
    pub fn is_active(&self) -> bool {
        self.txn.is_some()
    }

    /// Commit. Single-shot; a never-begun deferred guard commits nothing.
    pub fn commit(mut self) -> CanopyResult<()> {
        if let Some(txn) = self.txn.take() {
            txn.commit().map_err(|e| {
                CanopyError::Store(StoreError::Transaction {
                    reason: format!("{}: {}", self.name, e),
                })
            })?;
        }
        Ok(())
    }

    /// Abort without committing. Dropping the guard has the same effect.
    pub fn cancel(mut self) {
        if let Some(txn) = self.txn.take() {
            txn.abort();
        }
    }
}
