//! Data Transfer Objects
//!
//! Shapes exchanged with callers of the coordination layer (HTTP
//! controllers, the scheduler). They wrap domain types with paging
//! metadata or describe a request.

pub mod history;
pub mod schedule;
