//! Workflow definitions: graph analysis, validation, versioning and the
//! service that stores them.

pub mod document;
pub mod graph;
pub mod service;
pub mod validate;
pub mod versioning;
