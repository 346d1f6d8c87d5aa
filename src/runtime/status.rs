//! Status projection. A snapshot is recomputed and persisted in the same
//! atomic ack as every history change, so `query_status` is a pure read of
//! the last persisted projection and never touches queues or histories.

use serde::{Deserialize, Serialize};

use crate::error::FailureInfo;
use crate::{Event, EventKind, WorkflowOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Running,
    Completed,
    Failed,
    Canceled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceStatus::Running)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Completed => "COMPLETED",
            InstanceStatus::Failed => "FAILED",
            InstanceStatus::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub workflow: String,
    pub status: InstanceStatus,
    pub output: Option<String>,
    pub failure: Option<FailureInfo>,
    /// Workflow-specific projection (JSON), produced by the handler's
    /// projector over the same history the snapshot was derived from.
    pub detail: Option<String>,
}

/// Derive the generic part of the snapshot from history. `detail` is the
/// handler projection, computed by the caller over the same history.
pub fn snapshot_from_history(history: &[Event], detail: Option<String>) -> StatusSnapshot {
    let workflow = history
        .first()
        .and_then(|e| match &e.kind {
            EventKind::Started { workflow, .. } => Some(workflow.clone()),
            _ => None,
        })
        .unwrap_or_default();
    let terminal = history.iter().rev().find_map(|e| match &e.kind {
        EventKind::Completed { outcome } => Some(outcome.clone()),
        _ => None,
    });
    let (status, output, failure) = match terminal {
        None => (InstanceStatus::Running, None, None),
        Some(WorkflowOutcome::Success { output }) => (InstanceStatus::Completed, Some(output), None),
        Some(WorkflowOutcome::Failure { failure }) => (InstanceStatus::Failed, None, Some(failure)),
        Some(WorkflowOutcome::Canceled { reason }) => (
            InstanceStatus::Canceled,
            None,
            Some(FailureInfo::canceled(reason)),
        ),
    };
    StatusSnapshot {
        workflow,
        status,
        output,
        failure,
        detail,
    }
}
