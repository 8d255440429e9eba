use std::collections::BTreeMap;
use stepflow_core::{Task, WorkflowDefinition};
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};

/// Picks the workflow a task runs through.
pub struct TaskRouter;

impl TaskRouter {
    /// Select the workflow for `task` among `definitions`.
    ///
    /// A routing preference for the task type wins when it names one of the
    /// matching definitions. Otherwise the first match by identifier
    /// ascending, then version descending, is chosen, so the same inputs
    /// always route the same way.
    pub fn select_workflow<'a>(
        task: &Task,
        definitions: &'a [WorkflowDefinition],
        preferences: &BTreeMap<String, String>,
    ) -> Result<&'a WorkflowDefinition> {
        let mut candidates: Vec<&WorkflowDefinition> = definitions
            .iter()
            .filter(|d| d.applies_to(&task.task_type))
            .collect();

        if candidates.is_empty() {
            return Err(OrchestratorError::NoMatchingWorkflow {
                task_type: task.task_type.clone(),
            });
        }

        candidates.sort_by(|a, b| a.id.cmp(&b.id).then(b.version.cmp(&a.version)));

        if let Some(preferred) = preferences.get(&task.task_type) {
            match candidates.iter().find(|d| &d.id == preferred) {
                Some(definition) => {
                    debug!(
                        task_id = %task.id,
                        workflow_id = %definition.id,
                        "Routed by preference"
                    );
                    return Ok(definition);
                }
                None => warn!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    preferred = %preferred,
                    "Preferred workflow does not apply to task type, falling back"
                ),
            }
        }

        let chosen = candidates[0];
        debug!(task_id = %task.id, workflow_id = %chosen.id, "Routed by ordering");
        Ok(chosen)
    }
}
