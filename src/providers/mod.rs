//! Storage abstraction: per-instance append-only histories, status
//! snapshots, and three peek-lock queues (orchestrator, worker, timer).
//!
//! The engine's crash-consistency story rests on two provider guarantees:
//! queue consumption is peek-lock (an item stays durable until explicitly
//! acked, and an abandoned or crashed consumer's item becomes visible again),
//! and [`Provider::ack_orchestration_item`] applies the history delta, the
//! snapshot, and every derived queue item in one atomic step.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FailureInfo;
use crate::runtime::status::StatusSnapshot;
use crate::{Event, ParentLink, RetryPolicy, WorkflowOutcome};

mod error;
pub mod fs;
pub mod in_memory;

pub use error::ProviderError;
pub use fs::FsProvider;
pub use in_memory::InMemoryProvider;

/// Messages flowing through the queues. Orchestrator items target an
/// instance's next turn; `ActivityExecute` rides the worker queues;
/// `TimerSchedule`/`DeadlineSchedule` ride the timer queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkItem {
    StartWorkflow {
        instance: String,
        workflow: String,
        version: Option<String>,
        input: String,
        parent: Option<ParentLink>,
        /// Execution budget in ms from start; enforced via the timer queue.
        deadline_ms: Option<u64>,
    },
    ActivityExecute {
        instance: String,
        source: u64,
        name: String,
        input: String,
        queue: String,
        timeout_ms: u64,
        policy: RetryPolicy,
        idempotency_key: Option<String>,
    },
    ActivityCompleted {
        instance: String,
        source: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        source: u64,
        failure: FailureInfo,
        attempts: u32,
    },
    TimerSchedule {
        instance: String,
        source: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        instance: String,
        source: u64,
        fire_at_ms: u64,
    },
    DeadlineSchedule {
        instance: String,
        fire_at_ms: u64,
    },
    DeadlineElapsed {
        instance: String,
    },
    SignalRaised {
        instance: String,
        name: String,
        payload: String,
    },
    ChildCompleted {
        parent_instance: String,
        source: u64,
        outcome: WorkflowOutcome,
    },
    CancelRequested {
        instance: String,
        reason: String,
    },
}

impl WorkItem {
    /// Instance whose turn this item drives (for orchestrator items) or
    /// belongs to (for worker/timer items).
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartWorkflow { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerSchedule { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::DeadlineSchedule { instance, .. }
            | WorkItem::DeadlineElapsed { instance }
            | WorkItem::SignalRaised { instance, .. }
            | WorkItem::CancelRequested { instance, .. } => instance,
            WorkItem::ChildCompleted { parent_instance, .. } => parent_instance,
        }
    }
}

/// A locked batch of orchestrator work: every pending message for one
/// instance plus its current history. Held under `lock_token` until acked
/// or abandoned; no other consumer sees this instance meanwhile.
#[derive(Debug, Clone)]
pub struct OrchestrationItem {
    pub instance: String,
    pub history: Vec<Event>,
    pub messages: Vec<WorkItem>,
    pub lock_token: String,
}

#[async_trait]
pub trait Provider: Send + Sync {
    async fn read_history(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    /// Lock the next instance with pending orchestrator messages and return
    /// the full batch. `None` when nothing is runnable.
    async fn fetch_orchestration_item(&self) -> Result<Option<OrchestrationItem>, ProviderError>;

    /// Atomically: append `history_delta` (seqs must continue the stored
    /// history contiguously), persist the snapshot, enqueue every derived
    /// item, and release the lock, consuming the batch.
    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        snapshot: Option<StatusSnapshot>,
    ) -> Result<(), ProviderError>;

    /// Release the lock and make the batch visible again, unchanged.
    async fn abandon_orchestration_item(&self, lock_token: &str) -> Result<(), ProviderError>;

    async fn enqueue_orchestrator_work(&self, item: WorkItem) -> Result<(), ProviderError>;

    async fn dequeue_worker_peek_lock(
        &self,
        queue: &str,
    ) -> Result<Option<(WorkItem, String)>, ProviderError>;

    /// Atomically consume the locked worker item and enqueue its completion
    /// for the orchestrator.
    async fn ack_worker_item(&self, lock_token: &str, completion: WorkItem) -> Result<(), ProviderError>;

    async fn abandon_worker_item(&self, lock_token: &str) -> Result<(), ProviderError>;

    async fn dequeue_timer_peek_lock(&self) -> Result<Option<(WorkItem, String)>, ProviderError>;

    /// Atomically consume the locked timer item and enqueue the fired
    /// message for the orchestrator.
    async fn ack_timer_item(&self, lock_token: &str, fired: WorkItem) -> Result<(), ProviderError>;

    async fn abandon_timer_item(&self, lock_token: &str) -> Result<(), ProviderError>;

    /// Latest persisted status projection. Pure read; never touches queues.
    async fn read_snapshot(&self, instance: &str) -> Result<Option<StatusSnapshot>, ProviderError>;

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;
}

/// Seq contiguity check shared by providers: the delta must continue the
/// stored history with no gaps or overlaps.
pub(crate) fn check_contiguous(history: &[Event], delta: &[Event]) -> Result<(), String> {
    let mut expected = history.last().map(|e| e.seq + 1).unwrap_or(1);
    for e in delta {
        if e.seq != expected {
            return Err(format!("seq gap: expected {expected}, got {}", e.seq));
        }
        expected += 1;
    }
    Ok(())
}
