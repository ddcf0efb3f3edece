//! Pause Registry
//!
//! Operator pause state per pipeline name, cached the same way as lock
//! state. A pipeline that was never paused reads as unpaused.

use baton_core::domain::name::PipelineName;
use baton_core::domain::pause::PauseInfo;
use std::sync::Arc;

use crate::cache::TransactionalCache;
use crate::config::StateConfig;
use crate::error::StoreError;
use crate::repository::PersistenceStore;
use crate::sync::KeyedMutex;
use crate::transaction::{Transaction, Transactions};

pub struct PauseRegistry {
    store: Arc<dyn PersistenceStore>,
    transactions: Transactions,
    cache: Arc<TransactionalCache<PipelineName, PauseInfo>>,
    sections: KeyedMutex<PipelineName>,
}

impl PauseRegistry {
    pub fn new(store: Arc<dyn PersistenceStore>, transactions: Transactions, config: &StateConfig) -> Self {
        Self {
            store,
            transactions,
            cache: Arc::new(TransactionalCache::new("pipeline-pauses", config.cache_capacity)),
            sections: KeyedMutex::new(),
        }
    }

    /// Pauses the pipeline, replacing any earlier cause
    pub fn pause(&self, name: &PipelineName, cause: &str, paused_by: &str) -> Result<PauseInfo, StoreError> {
        let info = PauseInfo::paused(cause, paused_by);
        self.transactions.run(|tx| self.save(tx, name, &info))?;
        tracing::info!(pipeline = %name, paused_by, cause, "Pipeline paused");
        Ok(info)
    }

    pub fn unpause(&self, name: &PipelineName) -> Result<(), StoreError> {
        self.transactions
            .run(|tx| self.save(tx, name, &PauseInfo::unpaused()))?;
        tracing::info!(pipeline = %name, "Pipeline unpaused");
        Ok(())
    }

    pub fn pause_state(&self, name: &PipelineName) -> Result<PauseInfo, StoreError> {
        self.cache.read_through(name.clone(), || {
            Ok(self.store.get_pause_state(name)?.unwrap_or_default())
        })
    }

    pub fn is_paused(&self, name: &PipelineName) -> Result<bool, StoreError> {
        Ok(self.pause_state(name)?.paused)
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn save(&self, tx: &Transaction, name: &PipelineName, info: &PauseInfo) -> Result<(), StoreError> {
        tx.hold_section(format!("pipeline-pause:{}", name.normalized()), &self.sections, name.clone());
        self.store.set_pause_state(tx, name, info)?;
        self.cache.invalidate_after_commit(tx, name.clone());
        Ok(())
    }
}
