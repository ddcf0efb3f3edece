//! Baton Core
//!
//! Core types for the Baton execution-state layer.
//!
//! This crate contains:
//! - Domain types: pipeline, stage and job instances, lock and pause state
//! - DTOs: history pages and scheduling requests exchanged with callers

pub mod domain;
pub mod dto;
