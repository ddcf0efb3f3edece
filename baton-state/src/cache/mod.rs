//! Caches kept coherent with committed state

pub mod transactional;

pub use transactional::{CacheStats, TransactionalCache};
