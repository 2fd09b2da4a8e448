//! Infrastructure layer for Stepflow.
//!
//! Contains implementations of the ports defined in `stepflow-core`: the
//! SQLite `WorkflowStore`, a `WorkerDispatcher` that runs Task attempts as
//! local processes, and loaders for the data-directory config files.

pub mod config;
pub mod dispatcher;
pub mod sqlite;
