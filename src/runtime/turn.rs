//! One orchestrator turn: convert the locked message batch into history
//! events, execute the workflow function against baseline + staged events,
//! and hand the resulting delta and actions back for the atomic ack.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tracing::warn;

use crate::providers::WorkItem;
use crate::runtime::registry::WorkflowHandler;
use crate::{run_turn_with_horizon, Event, EventKind, ParentLink, WorkflowOutcome};

pub enum TurnResult {
    /// Workflow is waiting on outstanding work.
    Continue,
    Completed(WorkflowOutcome),
    /// Determinism violation or workflow panic; the instance must halt.
    Integrity(String),
}

pub struct WorkflowTurn {
    instance: String,
    baseline_len: usize,
    /// Baseline followed by events staged this turn.
    pub history: Vec<Event>,
    pub actions: Vec<crate::Action>,
    next_seq: u64,
    now_ms: u64,
    /// Set when the batch carries a `DeadlineElapsed`; the turn is skipped
    /// and the instance is failed outright.
    pub deadline_elapsed: bool,
    /// Set when the batch carries a `CancelRequested`. Runtime-propagated
    /// cancellation (a terminal parent) is not cooperative: the turn is
    /// skipped and the instance is canceled outright, even if it is parked
    /// on work that will never complete.
    pub forced_cancel: Option<String>,
}

impl WorkflowTurn {
    pub fn new(instance: String, baseline: Vec<Event>, now_ms: u64) -> Self {
        let next_seq = baseline.last().map(|e| e.seq + 1).unwrap_or(1);
        Self {
            instance,
            baseline_len: baseline.len(),
            history: baseline,
            actions: Vec::new(),
            next_seq,
            now_ms,
            deadline_elapsed: false,
            forced_cancel: None,
        }
    }

    pub fn append_event(&mut self, kind: EventKind) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.history.push(Event {
            seq,
            ts_ms: self.now_ms,
            kind,
        });
        seq
    }

    /// First event of a fresh instance.
    pub fn seed_started(
        &mut self,
        workflow: String,
        version: String,
        input: String,
        parent: Option<ParentLink>,
        deadline_ms: Option<u64>,
    ) {
        debug_assert_eq!(self.baseline_len, 0, "seed on non-empty history");
        self.append_event(EventKind::Started {
            workflow,
            version,
            input,
            parent,
            deadline_ms,
        });
    }

    /// Stage the batch's messages as history events. Duplicates (redelivered
    /// completions already recorded) and completions that do not match a
    /// recorded scheduling event are dropped with a warning; consuming the
    /// batch still acks them.
    pub fn prep_messages(&mut self, messages: Vec<WorkItem>) {
        for msg in messages {
            match msg {
                WorkItem::ActivityCompleted { source, result, .. } => {
                    if self.accept_completion(source, "ActivityScheduled") {
                        self.append_event(EventKind::ActivityCompleted { source, result });
                    }
                }
                WorkItem::ActivityFailed {
                    source,
                    failure,
                    attempts,
                    ..
                } => {
                    if self.accept_completion(source, "ActivityScheduled") {
                        self.append_event(EventKind::ActivityFailed {
                            source,
                            failure,
                            attempts,
                        });
                    }
                }
                WorkItem::TimerFired { source, .. } => {
                    if self.accept_completion(source, "TimerStarted") {
                        self.append_event(EventKind::TimerFired { source });
                    }
                }
                WorkItem::ChildCompleted { source, outcome, .. } => {
                    if self.accept_completion(source, "ChildStarted") {
                        self.append_event(EventKind::ChildCompleted { source, outcome });
                    }
                }
                WorkItem::SignalRaised { name, payload, .. } => {
                    self.append_event(EventKind::SignalReceived { name, payload });
                }
                WorkItem::CancelRequested { reason, .. } => {
                    // Recorded so projections can report why the instance
                    // ended; the caller finishes the instance without a turn.
                    self.append_event(EventKind::SignalReceived {
                        name: "cancel".to_string(),
                        payload: reason.clone(),
                    });
                    self.forced_cancel = Some(reason);
                }
                WorkItem::DeadlineElapsed { .. } => {
                    self.deadline_elapsed = true;
                }
                WorkItem::StartWorkflow { .. } => {
                    // Handled by the caller before prep; a start for an
                    // already-started instance is a duplicate.
                    warn!(
                        target: "ordex::runtime",
                        instance = %self.instance,
                        "dropping duplicate start message"
                    );
                }
                other => {
                    warn!(
                        target: "ordex::runtime",
                        instance = %self.instance,
                        item = ?other,
                        "unexpected item on orchestrator queue"
                    );
                }
            }
        }
    }

    /// A completion is accepted once: its source must name a recorded
    /// scheduling event of the right kind, with no completion recorded yet.
    fn accept_completion(&self, source: u64, expect: &str) -> bool {
        let schedule = self.history.iter().find(|e| e.seq == source);
        let kind_ok = match (&schedule.map(|e| &e.kind), expect) {
            (Some(EventKind::ActivityScheduled { .. }), "ActivityScheduled") => true,
            (Some(EventKind::TimerStarted { .. }), "TimerStarted") => true,
            (Some(EventKind::ChildStarted { .. }), "ChildStarted") => true,
            _ => false,
        };
        if !kind_ok {
            warn!(
                target: "ordex::runtime",
                instance = %self.instance,
                source,
                expect,
                "dropping completion without matching scheduling event"
            );
            return false;
        }
        let duplicate = self
            .history
            .iter()
            .any(|e| e.kind.completion_source() == Some(source));
        if duplicate {
            warn!(
                target: "ordex::runtime",
                instance = %self.instance,
                source,
                "dropping duplicate completion"
            );
            return false;
        }
        true
    }

    /// Run the workflow function over baseline + staged events. The replay
    /// horizon is the baseline: everything staged this turn counts as new.
    pub fn execute(&mut self, handler: Arc<dyn WorkflowHandler>) -> TurnResult {
        let horizon = if self.baseline_len == 0 {
            0
        } else {
            self.history[self.baseline_len - 1].seq
        };
        // Keep the staged history intact; on a panic the delta is still
        // needed to fail the instance durably.
        let history = self.history.clone();
        let instance = self.instance.clone();
        let now_ms = self.now_ms;
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            run_turn_with_horizon(&instance, history, horizon, now_ms, |ctx, input| {
                handler.invoke(ctx, input)
            })
        }));
        match outcome {
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                TurnResult::Integrity(format!("workflow panicked: {msg}"))
            }
            Ok(out) => {
                self.history = out.history;
                self.next_seq = self.history.last().map(|e| e.seq + 1).unwrap_or(1);
                self.actions = out.actions;
                if let Some(msg) = out.integrity {
                    return TurnResult::Integrity(msg);
                }
                match out.outcome {
                    Some(o) => TurnResult::Completed(o),
                    None => TurnResult::Continue,
                }
            }
        }
    }

    /// Events appended since the baseline, in order; this is the ack delta.
    pub fn history_delta(&self) -> Vec<Event> {
        self.history[self.baseline_len..].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RetryPolicy;

    fn baseline_with_schedule() -> Vec<Event> {
        vec![
            Event {
                seq: 1,
                ts_ms: 0,
                kind: EventKind::Started {
                    workflow: "wf".into(),
                    version: "1.0.0".into(),
                    input: String::new(),
                    parent: None,
                    deadline_ms: None,
                },
            },
            Event {
                seq: 2,
                ts_ms: 0,
                kind: EventKind::ActivityScheduled {
                    name: "Step".into(),
                    input: String::new(),
                    queue: "q".into(),
                    timeout_ms: 1_000,
                    policy: RetryPolicy::default(),
                    idempotency_key: None,
                },
            },
        ]
    }

    #[test]
    fn duplicate_completion_is_dropped() {
        let mut turn = WorkflowTurn::new("i".into(), baseline_with_schedule(), 10);
        let msg = WorkItem::ActivityCompleted {
            instance: "i".into(),
            source: 2,
            result: "r".into(),
        };
        turn.prep_messages(vec![msg.clone(), msg]);
        assert_eq!(turn.history_delta().len(), 1);
    }

    #[test]
    fn completion_without_schedule_is_dropped() {
        let mut turn = WorkflowTurn::new("i".into(), baseline_with_schedule(), 10);
        turn.prep_messages(vec![WorkItem::TimerFired {
            instance: "i".into(),
            source: 2,
            fire_at_ms: 0,
        }]);
        assert!(turn.history_delta().is_empty());
    }

    #[test]
    fn panicking_workflow_reports_integrity() {
        let reg = crate::runtime::registry::WorkflowRegistry::builder()
            .register("p", |_ctx, _in: String| async move {
                panic!("boom");
                #[allow(unreachable_code)]
                Ok(String::new())
            })
            .build();
        let (_, handler) = reg.resolve_handler("p").unwrap();
        let mut turn = WorkflowTurn::new("i".into(), baseline_with_schedule(), 10);
        let result = turn.execute(handler);
        match result {
            TurnResult::Integrity(msg) => assert!(msg.contains("panicked"), "{msg}"),
            _ => panic!("expected integrity"),
        }
    }
}
