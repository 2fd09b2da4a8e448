//! Declarative routing of status changes to alert and metric channels.
//!
//! A `RoutingTable` is an ordered list of rules. Each rule names a subject
//! kind (Job or Workflow), the statuses it cares about, and the channel the
//! matching record goes to. Classification is a pure function of the table.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a status record is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Job,
    Workflow,
}

/// Where a matched record is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Alert,
    Metric,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub name: String,
    pub kind: SubjectKind,
    /// Statuses this rule matches. Empty matches any status, including none.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<String>,
    pub channel: Channel,
}

impl RoutingRule {
    pub fn new(name: &str, kind: SubjectKind, statuses: &[&str], channel: Channel) -> Self {
        Self {
            name: name.to_string(),
            kind,
            statuses: statuses.iter().map(|s| s.to_string()).collect(),
            channel,
        }
    }

    pub fn matches(&self, kind: SubjectKind, status: Option<&str>) -> bool {
        if self.kind != kind {
            return false;
        }
        self.statuses.is_empty()
            || status.is_some_and(|status| self.statuses.iter().any(|s| s.eq_ignore_ascii_case(status)))
    }
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("failed to parse routing rules: {0}")]
    Parse(String),

    #[error("routing rule at position {0} has an empty name")]
    EmptyName(usize),

    #[error("duplicate routing rule name: {0}")]
    DuplicateName(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    #[serde(default)]
    rules: Vec<RoutingRule>,
}

impl Default for RoutingTable {
    /// The built-in table.
    fn default() -> Self {
        Self {
            rules: vec![
                RoutingRule::new("task-status-alerts", SubjectKind::Job, &[], Channel::Alert),
                RoutingRule::new("task-failure-alerts", SubjectKind::Job, &["failed"], Channel::Alert),
                RoutingRule::new("job-status-metrics", SubjectKind::Workflow, &[], Channel::Metric),
                RoutingRule::new("job-status-alerts", SubjectKind::Workflow, &[], Channel::Alert),
                RoutingRule::new(
                    "job-failure-alerts",
                    SubjectKind::Workflow,
                    &["failed", "cancelled"],
                    Channel::Alert,
                ),
            ],
        }
    }
}

impl RoutingTable {
    /// Build a table from rules. Rule names must be non-empty and unique.
    pub fn new(rules: Vec<RoutingRule>) -> Result<Self, RoutingError> {
        for (index, rule) in rules.iter().enumerate() {
            if rule.name.trim().is_empty() {
                return Err(RoutingError::EmptyName(index));
            }
            if rules[..index].iter().any(|earlier| earlier.name == rule.name) {
                return Err(RoutingError::DuplicateName(rule.name.clone()));
            }
        }
        Ok(Self { rules })
    }

    /// Parse a `[[rules]]` TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, RoutingError> {
        let parsed: RoutingTable = toml::from_str(content).map_err(|e| RoutingError::Parse(e.to_string()))?;
        Self::new(parsed.rules)
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    /// Rules matching a subject in table order.
    pub fn matching(&self, kind: SubjectKind, status: Option<&str>) -> impl Iterator<Item = &RoutingRule> {
        self.rules.iter().filter(move |rule| rule.matches(kind, status))
    }

    /// Names of the rules matching a subject, in table order.
    pub fn classify(&self, kind: SubjectKind, status: Option<&str>) -> Vec<&str> {
        self.matching(kind, status).map(|rule| rule.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_without_status() {
        let table = RoutingTable::default();
        assert_eq!(table.classify(SubjectKind::Job, None), vec!["task-status-alerts"]);
    }

    #[test]
    fn test_failed_job() {
        let table = RoutingTable::default();
        assert_eq!(
            table.classify(SubjectKind::Job, Some("failed")),
            vec!["task-status-alerts", "task-failure-alerts"]
        );
    }

    #[test]
    fn test_workflow_running() {
        let table = RoutingTable::default();
        assert_eq!(
            table.classify(SubjectKind::Workflow, Some("running")),
            vec!["job-status-metrics", "job-status-alerts"]
        );
    }

    #[test]
    fn test_workflow_cancelled_raises_failure_alert() {
        let table = RoutingTable::default();
        let names = table.classify(SubjectKind::Workflow, Some("cancelled"));
        assert_eq!(names.len(), 3);
        assert!(names.contains(&"job-failure-alerts"));
    }

    #[test]
    fn test_toml_rules() {
        let toml_str = r#"
[[rules]]
name = "everything"
kind = "job"
channel = "metric"

[[rules]]
name = "stuck"
kind = "workflow"
statuses = ["queued"]
channel = "alert"
"#;
        let table = RoutingTable::from_toml_str(toml_str).unwrap();
        assert_eq!(table.rules().len(), 2);
        assert_eq!(table.classify(SubjectKind::Workflow, Some("QUEUED")), vec!["stuck"]);
        assert!(table.classify(SubjectKind::Workflow, None).is_empty());
        assert_eq!(table.rules()[0].channel, Channel::Metric);
    }

    #[test]
    fn test_toml_rejects_duplicates_and_garbage() {
        let dup = r#"
[[rules]]
name = "a"
kind = "job"
channel = "alert"

[[rules]]
name = "a"
kind = "workflow"
channel = "alert"
"#;
        assert!(matches!(
            RoutingTable::from_toml_str(dup),
            Err(RoutingError::DuplicateName(name)) if name == "a"
        ));
        assert!(matches!(
            RoutingTable::from_toml_str("[[rules]]\nname = 3"),
            Err(RoutingError::Parse(_))
        ));
    }

    #[test]
    fn test_empty_table_matches_nothing() {
        let table = RoutingTable::from_toml_str("").unwrap();
        assert!(table.classify(SubjectKind::Job, Some("running")).is_empty());
    }
}
