//! Core domain types
//!
//! These types describe execution state as the persistence layer stores it.
//! They are plain data: the coordination layer in `baton-state` owns every
//! rule about how and when they change.

pub mod job;
pub mod lock;
pub mod name;
pub mod pause;
pub mod pipeline;
pub mod stage;
pub mod status;
