//! Pipeline Lock Registry
//!
//! Enforces that at most one instance of a locked pipeline runs at a time.
//! Every lock and unlock of a pipeline name runs inside that name's
//! exclusive section, which the transaction retains until it has committed
//! or rolled back and the lock cache has been invalidated. The next caller
//! for the same name therefore always reads committed lock state.

use baton_core::domain::lock::PipelineLockState;
use baton_core::domain::name::PipelineName;
use baton_core::domain::pipeline::{PipelineIdentity, PipelineInstance};
use std::sync::Arc;

use crate::cache::{CacheStats, TransactionalCache};
use crate::config::StateConfig;
use crate::error::{LockError, PipelineAlreadyLockedError, StoreError};
use crate::repository::PersistenceStore;
use crate::sync::KeyedMutex;
use crate::transaction::{Transaction, Transactions};

pub struct PipelineLockRegistry {
    store: Arc<dyn PersistenceStore>,
    transactions: Transactions,
    cache: Arc<TransactionalCache<PipelineName, PipelineLockState>>,
    sections: KeyedMutex<PipelineName>,
}

impl PipelineLockRegistry {
    pub fn new(store: Arc<dyn PersistenceStore>, transactions: Transactions, config: &StateConfig) -> Self {
        Self {
            store,
            transactions,
            cache: Arc::new(TransactionalCache::new("pipeline-locks", config.cache_capacity)),
            sections: KeyedMutex::new(),
        }
    }

    /// Locks the instance's pipeline in a transaction of its own
    ///
    /// Succeeds if the pipeline is unlocked or already locked by this same
    /// instance. Fails with [`LockError::AlreadyLocked`] if another instance
    /// holds the lock.
    pub fn lock_pipeline(&self, instance: &PipelineInstance) -> Result<(), LockError> {
        let identity = instance.identity();
        self.transactions.run(|tx| self.lock_pipeline_in(tx, &identity))
    }

    /// Locks the pipeline as part of the caller's transaction
    ///
    /// A lock or unlock of the same pipeline earlier in `tx` is taken into
    /// account.
    pub fn lock_pipeline_in(&self, tx: &Transaction, identity: &PipelineIdentity) -> Result<(), LockError> {
        let current = if self.enter_section(tx, &identity.name) {
            self.current_lock(&identity.name)?
        } else {
            self.store.get_lock_state_in(tx, &identity.name)?
        };
        if let Some(holder) = current.holder() {
            if holder.id != identity.id {
                tracing::warn!(
                    pipeline = %identity.name,
                    requested_by = identity.id,
                    held_by = holder.id,
                    "Pipeline is already locked"
                );
                return Err(PipelineAlreadyLockedError {
                    pipeline: identity.name.clone(),
                    locked_by: holder.clone(),
                }
                .into());
            }
        }

        self.store
            .set_lock_state(tx, &identity.name, &PipelineLockState::LockedBy(identity.clone()))?;
        self.cache.invalidate_after_commit(tx, identity.name.clone());

        tracing::info!("Pipeline locked: {} by {}", identity.name, identity);
        Ok(())
    }

    /// Releases the pipeline's lock in a transaction of its own
    ///
    /// Unlocking an unlocked pipeline is a no-op that still succeeds.
    pub fn unlock_pipeline(&self, name: &PipelineName) -> Result<(), StoreError> {
        self.transactions.run(|tx| self.unlock_pipeline_in(tx, name))
    }

    /// Releases the pipeline's lock as part of the caller's transaction
    pub fn unlock_pipeline_in(&self, tx: &Transaction, name: &PipelineName) -> Result<(), StoreError> {
        self.enter_section(tx, name);

        self.store.set_lock_state(tx, name, &PipelineLockState::Unlocked)?;
        self.cache.invalidate_after_commit(tx, name.clone());

        tracing::info!("Pipeline unlocked: {}", name);
        Ok(())
    }

    /// The committed lock state, served from cache when possible
    pub fn current_lock(&self, name: &PipelineName) -> Result<PipelineLockState, StoreError> {
        self.cache
            .read_through(name.clone(), || self.store.get_lock_state(name))
    }

    pub fn is_locked(&self, name: &PipelineName) -> Result<bool, StoreError> {
        Ok(self.current_lock(name)?.is_locked())
    }

    /// The cached lock state without loading it
    pub fn cached_lock(&self, name: &PipelineName) -> Option<PipelineLockState> {
        self.cache.get(name)
    }

    /// Every currently locked pipeline and its holder
    pub fn locked_pipelines(&self) -> Result<Vec<PipelineIdentity>, StoreError> {
        self.store.query_locked_pipelines()
    }

    /// Drops the cached lock state of `name` once `tx` commits
    pub fn invalidate_after_commit(&self, tx: &Transaction, name: &PipelineName) {
        self.cache.invalidate_after_commit(tx, name.clone());
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // False when `tx` already held the section and may have written lock state.
    fn enter_section(&self, tx: &Transaction, name: &PipelineName) -> bool {
        let label = format!("pipeline-lock:{}", name.normalized());
        if tx.holds_section(&label) {
            return false;
        }
        tx.hold_section(label, &self.sections, name.clone());
        true
    }
}
