//! State resources: namespaced targets that Task states resolve at dispatch time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maps a Task's `resource` name, within a namespace, to a concrete worker target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateResource {
    pub namespace: String,
    pub name: String,
    /// Worker-specific target (an ARN, a queue URL, a command line).
    pub target: String,
    pub last_updated: DateTime<Utc>,
}

impl StateResource {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            target: target.into(),
            last_updated: Utc::now(),
        }
    }
}
