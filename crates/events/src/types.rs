//! Event types for the stepflow event system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// Position in the emitter's stream, when emitted through one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create a new event envelope with auto-generated ID and timestamp
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            sequence: None,
            event,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// All possible events in the system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Task events
    /// A task was accepted and routed to a workflow
    #[serde(rename = "task.submitted")]
    TaskSubmitted {
        task_id: Uuid,
        task_type: String,
        workflow_id: String,
    },

    // Run events
    /// A run was created for a task
    #[serde(rename = "run.started")]
    RunStarted {
        task_id: Uuid,
        workflow_id: String,
        step_id: String,
    },

    /// Run status changed
    #[serde(rename = "run.status_changed")]
    RunStatusChanged {
        task_id: Uuid,
        from_status: String,
        to_status: String,
    },

    /// An operator resumed a halted run
    #[serde(rename = "run.resumed")]
    RunResumed { task_id: Uuid, step_id: String },

    /// A stalled run was picked up again
    #[serde(rename = "run.recovered")]
    RunRecovered { task_id: Uuid, step_id: String },

    /// An operator cancelled a run
    #[serde(rename = "run.cancelled")]
    RunCancelled { task_id: Uuid, step_id: String },

    // Step events
    /// A worker was dispatched for a step
    #[serde(rename = "step.started")]
    StepStarted {
        task_id: Uuid,
        step_id: String,
        role: String,
        attempt: u32,
    },

    /// A step finished and the transition was applied
    #[serde(rename = "step.finished")]
    StepFinished {
        task_id: Uuid,
        step_id: String,
        outcome: String,
        next_step_id: Option<String>,
    },

    /// Artifacts produced by a step were stored
    #[serde(rename = "artifacts.appended")]
    ArtifactsAppended {
        task_id: Uuid,
        step_id: String,
        count: usize,
    },

    // System events
    /// Generic error event
    #[serde(rename = "error")]
    Error {
        message: String,
        context: Option<String>,
    },
}

impl Event {
    /// Get the task ID associated with this event, if any
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            Event::TaskSubmitted { task_id, .. } => Some(*task_id),
            Event::RunStarted { task_id, .. } => Some(*task_id),
            Event::RunStatusChanged { task_id, .. } => Some(*task_id),
            Event::RunResumed { task_id, .. } => Some(*task_id),
            Event::RunRecovered { task_id, .. } => Some(*task_id),
            Event::RunCancelled { task_id, .. } => Some(*task_id),
            Event::StepStarted { task_id, .. } => Some(*task_id),
            Event::StepFinished { task_id, .. } => Some(*task_id),
            Event::ArtifactsAppended { task_id, .. } => Some(*task_id),
            Event::Error { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_envelope_creation() {
        let event = Event::RunResumed {
            task_id: Uuid::new_v4(),
            step_id: "plan".to_string(),
        };
        let envelope = EventEnvelope::new(event);

        assert!(!envelope.id.is_nil());
        assert!(envelope.timestamp <= Utc::now());
        assert!(envelope.sequence.is_none());
        assert_eq!(envelope.with_sequence(7).sequence, Some(7));
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::RunStatusChanged {
            task_id: Uuid::new_v4(),
            from_status: "in_progress".to_string(),
            to_status: "waiting_human".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("run.status_changed"));
        assert!(json.contains("from_status"));
        assert!(json.contains("waiting_human"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"type":"step.started","task_id":"550e8400-e29b-41d4-a716-446655440000","step_id":"plan","role":"planner","attempt":0}"#;
        let event: Event = serde_json::from_str(json).unwrap();

        match event {
            Event::StepStarted {
                task_id,
                step_id,
                role,
                attempt,
            } => {
                assert_eq!(step_id, "plan");
                assert_eq!(role, "planner");
                assert_eq!(attempt, 0);
                assert!(!task_id.is_nil());
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_event_task_id() {
        let task_id = Uuid::new_v4();

        let event = Event::ArtifactsAppended {
            task_id,
            step_id: "implement".to_string(),
            count: 2,
        };
        assert_eq!(event.task_id(), Some(task_id));

        let error_event = Event::Error {
            message: "test".to_string(),
            context: None,
        };
        assert_eq!(error_event.task_id(), None);
    }
}
