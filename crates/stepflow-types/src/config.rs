//! Configuration types for Stepflow.
//!
//! `StepflowConfig` mirrors `config.toml` in the data directory. Every field
//! has a default so a missing or partial file still yields a usable config.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepflowConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    /// Optional TOML file replacing the built-in status routing table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_rules: Option<PathBuf>,
}

/// Interpreter and engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// State entries allowed in a single step before the job is failed.
    #[serde(default = "default_max_transitions_per_step")]
    pub max_transitions_per_step: u32,

    /// Re-read/re-apply rounds after an optimistic revision conflict.
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,

    /// Rounds allowed when allocating a new definition version races.
    #[serde(default = "default_definition_retries")]
    pub definition_retries: u32,

    /// Namespace for state resource lookup when a job does not name one.
    #[serde(default = "default_namespace")]
    pub default_namespace: String,

    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_max_transitions_per_step() -> u32 {
    256
}

fn default_conflict_retries() -> u32 {
    5
}

fn default_definition_retries() -> u32 {
    3
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_transitions_per_step: default_max_transitions_per_step(),
            conflict_retries: default_conflict_retries(),
            definition_retries: default_definition_retries(),
            default_namespace: default_namespace(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}
