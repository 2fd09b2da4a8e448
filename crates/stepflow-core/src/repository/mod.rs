//! Repository trait definitions (ports).
//!
//! `WorkflowStore` is the storage interface that the infrastructure layer
//! (stepflow-infra) implements. `MemoryStore` is the in-process
//! implementation used by tests and ephemeral runs.

pub mod memory;
pub mod store;

pub use memory::MemoryStore;
pub use store::WorkflowStore;
