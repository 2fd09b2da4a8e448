//! Business logic and repository trait definitions for Stepflow.
//!
//! This crate defines the "ports" (the `WorkflowStore` and `WorkerDispatcher`
//! traits) that the infrastructure layer implements. It depends only on
//! `stepflow-types` -- never on `stepflow-infra` or any database/IO crate.

pub mod definition;
pub mod event;
pub mod interpreter;
pub mod repository;
pub mod status;
