//! Destinations for routed status records.

use std::collections::BTreeMap;
use std::sync::Mutex;

use dashmap::DashMap;
use uuid::Uuid;

use super::router::{Channel, SubjectKind};

/// One status change matched by one routing rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub rule: String,
    pub channel: Channel,
    pub kind: SubjectKind,
    pub subject_id: Uuid,
    pub status: Option<String>,
    pub definition: Option<String>,
    pub reason: Option<String>,
}

/// Receives routed status records. Implementations must not block.
pub trait StatusSink: Send + Sync {
    fn emit(&self, record: &StatusRecord);
}

/// Logs one structured event per record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn emit(&self, record: &StatusRecord) {
        let status = record.status.as_deref().unwrap_or("");
        let definition = record.definition.as_deref().unwrap_or("");
        match (record.channel, record.kind) {
            (Channel::Metric, _) => tracing::info!(
                target: "stepflow::metrics",
                rule = %record.rule,
                kind = ?record.kind,
                id = %record.subject_id,
                status,
                definition,
                value = 1u64,
                "status-change"
            ),
            (Channel::Alert, SubjectKind::Job) => tracing::info!(
                target: "stepflow::alerts",
                rule = %record.rule,
                job_id = %record.subject_id,
                status,
                definition,
                reason = record.reason.as_deref().unwrap_or(""),
                "job-status"
            ),
            (Channel::Alert, SubjectKind::Workflow) => tracing::info!(
                target: "stepflow::alerts",
                rule = %record.rule,
                workflow_id = %record.subject_id,
                status,
                definition,
                "workflow-status"
            ),
        }
    }
}

/// Counts records per rule name; used by tests to assert routing.
#[derive(Debug, Default)]
pub struct RecordingSink {
    counts: DashMap<String, usize>,
    records: Mutex<Vec<StatusRecord>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rule name -> number of records routed through it.
    pub fn rule_counts(&self) -> BTreeMap<String, usize> {
        self.counts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn records(&self) -> Vec<StatusRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl StatusSink for RecordingSink {
    fn emit(&self, record: &StatusRecord) {
        *self.counts.entry(record.rule.clone()).or_insert(0) += 1;
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }
}
