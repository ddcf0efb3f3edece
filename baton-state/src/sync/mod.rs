//! Synchronization primitives

pub mod keyed_mutex;

pub use keyed_mutex::{KeyGuard, KeyedMutex};
