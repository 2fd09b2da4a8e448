//! Shared domain types for Stepflow.
//!
//! Workflow definitions and their state variants, Jobs with their Attempts
//! and execution cursor, the Workflow aggregate, state resources, events,
//! configuration, and the error types shared across crates.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod execution;
pub mod job;
pub mod resource;
pub mod workflow;
