//! Definition construction, versioning and copying.
//!
//! Every stored row gets a fresh identifier. Version numbers are supplied by
//! the caller (normally "current max + 1" resolved against the store); see
//! [`DefinitionService`](super::service::DefinitionService).

use chrono::Utc;
use stepflow_types::definition::{Manager, StateMachine, WorkflowDefinition};
use uuid::Uuid;

/// Create version 0 of a new definition.
pub fn new_workflow_definition(
    name: impl Into<String>,
    manager: Manager,
    state_machine: StateMachine,
) -> WorkflowDefinition {
    WorkflowDefinition {
        id: Uuid::now_v7(),
        name: name.into(),
        version: 0,
        created_at: Utc::now(),
        description: None,
        manager,
        state_machine,
    }
}

/// Create a new row for `def`'s name at `version`, carrying over its manager,
/// description and state machine.
pub fn new_workflow_definition_version(def: &WorkflowDefinition, version: u32) -> WorkflowDefinition {
    WorkflowDefinition {
        id: Uuid::now_v7(),
        name: def.name.clone(),
        version,
        created_at: Utc::now(),
        description: def.description.clone(),
        manager: def.manager,
        state_machine: def.state_machine.clone(),
    }
}

/// Deep copy of a definition.
///
/// The state machine is fully owned data, so nothing in the copy (down to
/// individual retriers) is shared with the original.
pub fn copy_workflow_definition(def: &WorkflowDefinition) -> WorkflowDefinition {
    def.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_types::definition::{Retrier, State, TaskState, Transition};

    fn task(next: Option<&str>) -> State {
        State::Task(TaskState {
            resource: "resource-name".to_string(),
            transition: next.map_or(Transition::End, |n| Transition::Next(n.to_string())),
            retry: vec![Retrier::new(&["States.ALL"])],
            catch: vec![],
            timeout_seconds: None,
            comment: None,
        })
    }

    fn kitchen_sink() -> WorkflowDefinition {
        new_workflow_definition(
            "kitchen-sink",
            Manager::StepFunctions,
            StateMachine::new(
                "start-state",
                [
                    ("start-state".to_string(), task(Some("second-state"))),
                    ("second-state".to_string(), task(Some("end-state"))),
                    ("end-state".to_string(), task(None)),
                ],
            ),
        )
    }

    #[test]
    fn test_new_definition_starts_at_version_zero() {
        let def = kitchen_sink();
        assert_eq!(def.version, 0);
        assert_eq!(def.name, "kitchen-sink");
        assert!(!def.id.is_nil());
    }

    #[test]
    fn test_new_version_gets_fresh_id() {
        let def = kitchen_sink();
        let next = new_workflow_definition_version(&def, 4);
        assert_eq!(next.version, 4);
        assert_eq!(next.name, def.name);
        assert_eq!(next.manager, def.manager);
        assert_eq!(next.state_machine, def.state_machine);
        assert_ne!(next.id, def.id);
    }

    #[test]
    fn test_copy_is_equal() {
        let def = kitchen_sink();
        let copy = copy_workflow_definition(&def);
        assert_eq!(copy.name, def.name);
        assert_eq!(copy.version, def.version);
        assert_eq!(copy.manager, def.manager);
        assert_eq!(copy.state_machine, def.state_machine);
    }

    #[test]
    fn test_mutating_copy_does_not_affect_original() {
        let def = kitchen_sink();
        let mut copy = copy_workflow_definition(&def);

        for state in copy.state_machine.states.values_mut() {
            if let State::Task(task) = state {
                task.resource = "testing".to_string();
                task.retry = vec![Retrier {
                    max_attempts: 1,
                    ..Retrier::new(&["States.Timeout"])
                }];
            }
        }

        for (name, state) in &def.state_machine.states {
            let copied = &copy.state_machine.states[name];
            assert_eq!(state.resource(), Some("resource-name"));
            assert_ne!(state.resource(), copied.resource());
            assert_ne!(state.retry(), copied.retry());
            assert_eq!(state.retry()[0].max_attempts, 3);
        }
    }
}
