//! Routes Job and Workflow status changes through a `RoutingTable` into a sink.

use std::sync::Arc;

use stepflow_types::job::Job;
use stepflow_types::workflow::{Workflow, WorkflowStatus};

use super::router::{RoutingTable, SubjectKind};
use super::sink::{StatusRecord, StatusSink};

/// Classifies status changes and hands each match to the sink.
///
/// Reporting is fire-and-forget: the return value is the number of records
/// emitted and callers never branch on it.
#[derive(Clone)]
pub struct StatusReporter {
    table: Arc<RoutingTable>,
    sink: Arc<dyn StatusSink>,
}

impl StatusReporter {
    pub fn new(table: RoutingTable, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            table: Arc::new(table),
            sink,
        }
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Report a job's current status.
    pub fn report_job(&self, job: &Job, workflow: Option<&Workflow>) -> usize {
        let status = job.status().map(|s| s.as_str());
        let definition = workflow
            .and_then(Workflow::definition_name)
            .map(str::to_string)
            .or_else(|| (!job.definition.name.is_empty()).then(|| job.definition.name.clone()));

        let mut emitted = 0;
        for rule in self.table.matching(SubjectKind::Job, status) {
            self.sink.emit(&StatusRecord {
                rule: rule.name.clone(),
                channel: rule.channel,
                kind: SubjectKind::Job,
                subject_id: job.id,
                status: status.map(str::to_string),
                definition: definition.clone(),
                reason: job.status_reason.clone(),
            });
            emitted += 1;
        }
        emitted
    }

    /// Report a workflow moving to `status`.
    pub fn report_workflow_change(&self, workflow: &Workflow, status: WorkflowStatus) -> usize {
        let mut emitted = 0;
        for rule in self.table.matching(SubjectKind::Workflow, Some(status.as_str())) {
            self.sink.emit(&StatusRecord {
                rule: rule.name.clone(),
                channel: rule.channel,
                kind: SubjectKind::Workflow,
                subject_id: workflow.id,
                status: Some(status.as_str().to_string()),
                definition: workflow.definition_name().map(str::to_string),
                reason: None,
            });
            emitted += 1;
        }
        emitted
    }
}

impl std::fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReporter")
            .field("rules", &self.table.rules().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::router::{Channel, RoutingRule};
    use crate::status::sink::RecordingSink;
    use stepflow_types::job::JobStatus;

    fn reporter() -> (StatusReporter, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        (StatusReporter::new(RoutingTable::default(), sink.clone()), sink)
    }

    #[test]
    fn test_status_routing_counts() {
        let (reporter, sink) = reporter();
        assert!(sink.rule_counts().is_empty());

        reporter.report_job(&Job::default(), Some(&Workflow::default()));
        let counts = sink.rule_counts();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts["task-status-alerts"], 1);

        reporter.report_workflow_change(&Workflow::default(), WorkflowStatus::Running);
        let counts = sink.rule_counts();
        assert_eq!(counts.len(), 3);
        assert_eq!(counts["job-status-metrics"], 1);
        assert_eq!(counts["job-status-alerts"], 1);
        assert_eq!(counts["task-status-alerts"], 1);
    }

    #[test]
    fn test_failed_job_record_carries_reason() {
        let (reporter, sink) = reporter();
        let mut job = Job::default();
        job.definition.name = "nightly".to_string();
        job.set_status(JobStatus::Failed, Some("States.TaskFailed: exit 1".to_string()), chrono::Utc::now());

        assert_eq!(reporter.report_job(&job, None), 2);
        let records = sink.records();
        assert_eq!(records[1].rule, "task-failure-alerts");
        assert_eq!(records[1].status.as_deref(), Some("failed"));
        assert_eq!(records[1].definition.as_deref(), Some("nightly"));
        assert_eq!(records[1].reason.as_deref(), Some("States.TaskFailed: exit 1"));
    }

    #[test]
    fn test_custom_table() {
        let sink = Arc::new(RecordingSink::new());
        let table = RoutingTable::new(vec![RoutingRule::new(
            "only-succeeded",
            SubjectKind::Workflow,
            &["succeeded"],
            Channel::Metric,
        )])
        .unwrap();
        let reporter = StatusReporter::new(table, sink.clone());

        assert_eq!(reporter.report_workflow_change(&Workflow::default(), WorkflowStatus::Failed), 0);
        assert_eq!(reporter.report_workflow_change(&Workflow::default(), WorkflowStatus::Succeeded), 1);
        assert_eq!(reporter.report_job(&Job::default(), None), 0);
        assert_eq!(sink.rule_counts()["only-succeeded"], 1);
    }

    #[test]
    fn test_tracing_sink_does_not_panic() {
        let reporter = StatusReporter::new(RoutingTable::default(), Arc::new(crate::status::sink::TracingSink));
        let mut job = Job::default();
        job.set_status(JobStatus::Running, None, chrono::Utc::now());
        assert_eq!(reporter.report_job(&job, None), 1);
        assert_eq!(reporter.report_workflow_change(&Workflow::default(), WorkflowStatus::Failed), 3);
    }
}
