//! Configuration loaders for Stepflow.
//!
//! Reads `config.toml` from the data directory (`~/.stepflow/` in production)
//! into [`StepflowConfig`], and the optional routing rules file it points at
//! into a [`RoutingTable`]. Both fall back to defaults when the file is
//! missing or malformed.

use std::path::{Path, PathBuf};

use stepflow_core::status::RoutingTable;
use stepflow_types::config::StepflowConfig;

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `STEPFLOW_DATA_DIR` environment variable
/// 2. `~/.stepflow`
/// 3. `.stepflow` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STEPFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".stepflow");
    }

    PathBuf::from(".stepflow")
}

/// Load configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`StepflowConfig::default()`].
/// - If the file exists but fails to read or parse, logs a warning and returns the default.
pub async fn load_config(data_dir: &Path) -> StepflowConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return StepflowConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return StepflowConfig::default();
        }
    };

    match toml::from_str::<StepflowConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            StepflowConfig::default()
        }
    }
}

/// Load the status routing table named by `config.routing_rules`.
///
/// Relative paths resolve against `data_dir`. Without a configured file, or
/// when the file cannot be used, the built-in table is returned.
pub async fn load_routing_table(config: &StepflowConfig, data_dir: &Path) -> RoutingTable {
    let Some(path) = config.routing_rules.as_ref() else {
        return RoutingTable::default();
    };
    let path = if path.is_relative() {
        data_dir.join(path)
    } else {
        path.clone()
    };

    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) => {
            tracing::warn!("Failed to read routing rules {}: {err}, using built-in rules", path.display());
            return RoutingTable::default();
        }
    };

    match RoutingTable::from_toml_str(&content) {
        Ok(table) => {
            tracing::debug!(rules = table.rules().len(), path = %path.display(), "loaded routing rules");
            table
        }
        Err(err) => {
            tracing::warn!("Invalid routing rules {}: {err}, using built-in rules", path.display());
            RoutingTable::default()
        }
    }
}
