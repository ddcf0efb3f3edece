//! Baton State
//!
//! Coordination layer for a pipeline orchestrator: transactional caches over
//! execution state, per-pipeline locks, and the index of currently active
//! pipeline instances.
//!
//! All writes go through [`transaction::Transactions`]; caches are only
//! invalidated after the writing transaction has committed.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod repository;
pub mod service;
pub mod sync;
pub mod transaction;

pub use config::StateConfig;
pub use coordinator::Coordinator;
pub use error::{LockError, PipelineAlreadyLockedError, StateError, StoreError};
pub use repository::{InMemoryStore, PersistenceStore};
pub use transaction::{Transaction, TransactionManager, Transactions};
