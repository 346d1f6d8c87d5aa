//! Deterministic workflow orchestration engine.
//!
//! Workflows are ordinary `async fn`s over a [`WorkflowContext`]. Every
//! side-effecting request (activity, timer, child workflow, outbound signal)
//! is recorded as an event in an append-only per-instance history. On every
//! turn the workflow function is re-executed from the top against that
//! history: recorded events satisfy awaits synchronously, and only once the
//! history runs out does the engine mint new events and emit the matching
//! [`Action`]s for the runtime to dispatch. Progress is driven purely by
//! durably recorded completions, so a crash between any two acknowledgements
//! replays to the identical state.
//!
//! The replay kernel itself ([`run_turn`]) is pure: history in, updated
//! history plus actions out. Everything around it (queues, workers, timers,
//! status snapshots) lives in [`runtime`] and [`providers`].

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use serde::{Deserialize, Serialize};

pub mod client;
pub mod codec;
pub mod error;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;
pub mod workflows;

pub use error::{ActivityError, FailureInfo, FailureKind};
pub use futures::{DurableFuture, DurableOutput};
pub use runtime::registry::{ActivityHandler, WorkflowHandler};

/// One recorded history entry. `seq` is assigned contiguously starting at 1;
/// `ts_ms` is the wall-clock time the event was recorded and is informational
/// only (replay ordering relies exclusively on `seq`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub ts_ms: u64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    /// First event of every instance.
    Started {
        workflow: String,
        version: String,
        input: String,
        parent: Option<ParentLink>,
        deadline_ms: Option<u64>,
    },
    /// Workflow requested an activity. `seq` of this event is the `source`
    /// its completion refers back to.
    ActivityScheduled {
        name: String,
        input: String,
        queue: String,
        timeout_ms: u64,
        policy: RetryPolicy,
        idempotency_key: Option<String>,
    },
    ActivityCompleted {
        source: u64,
        result: String,
    },
    /// Recorded after the retry policy is exhausted or a permanent failure
    /// short-circuits it. `attempts` is how many were actually made.
    ActivityFailed {
        source: u64,
        failure: FailureInfo,
        attempts: u32,
    },
    TimerStarted {
        fire_at_ms: u64,
    },
    TimerFired {
        source: u64,
    },
    /// Inbound signal, durably recorded before the workflow can observe it.
    SignalReceived {
        name: String,
        payload: String,
    },
    /// Outbound signal to another instance, recorded in the sender's history
    /// so delivery survives a crash between recording and dispatch.
    SignalSent {
        target: String,
        name: String,
        payload: String,
    },
    ChildStarted {
        workflow: String,
        instance: String,
        input: String,
        queue: String,
    },
    ChildCompleted {
        source: u64,
        outcome: WorkflowOutcome,
    },
    /// Terminal event; nothing may follow it.
    Completed {
        outcome: WorkflowOutcome,
    },
}

impl EventKind {
    /// Events that satisfy a pending durable future, in FIFO-gated order.
    /// Signals are deliberately not completions: they are consumed by name.
    pub(crate) fn completion_source(&self) -> Option<u64> {
        match self {
            EventKind::ActivityCompleted { source, .. }
            | EventKind::ActivityFailed { source, .. }
            | EventKind::TimerFired { source }
            | EventKind::ChildCompleted { source, .. } => Some(*source),
            _ => None,
        }
    }

    pub(crate) fn is_schedule(&self) -> bool {
        matches!(
            self,
            EventKind::ActivityScheduled { .. }
                | EventKind::TimerStarted { .. }
                | EventKind::ChildStarted { .. }
                | EventKind::SignalSent { .. }
        )
    }

    fn label(&self) -> &'static str {
        match self {
            EventKind::Started { .. } => "Started",
            EventKind::ActivityScheduled { .. } => "ActivityScheduled",
            EventKind::ActivityCompleted { .. } => "ActivityCompleted",
            EventKind::ActivityFailed { .. } => "ActivityFailed",
            EventKind::TimerStarted { .. } => "TimerStarted",
            EventKind::TimerFired { .. } => "TimerFired",
            EventKind::SignalReceived { .. } => "SignalReceived",
            EventKind::SignalSent { .. } => "SignalSent",
            EventKind::ChildStarted { .. } => "ChildStarted",
            EventKind::ChildCompleted { .. } => "ChildCompleted",
            EventKind::Completed { .. } => "Completed",
        }
    }
}

/// Terminal result of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkflowOutcome {
    Success { output: String },
    Failure { failure: FailureInfo },
    Canceled { reason: String },
}

/// Link from a child instance back to the `ChildStarted` event in its
/// parent's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub instance: String,
    pub source: u64,
}

/// Retry policy applied by the activity executor, not by the workflow:
/// the whole retry loop produces a single completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 50,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff before attempt `attempt` (1-based; attempt 1 has
    /// no delay). Jitter is added by the executor on top of this.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        if attempt <= 1 {
            return 0;
        }
        let exp = attempt.saturating_sub(2).min(16);
        (self.initial_delay_ms.saturating_mul(1u64 << exp)).min(self.max_delay_ms)
    }
}

/// Side effects a turn asks the runtime to perform. Each carries the `source`
/// seq of the scheduling event it was minted for, so the eventual completion
/// can be correlated back into history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    ScheduleActivity {
        source: u64,
        name: String,
        input: String,
        queue: String,
        timeout_ms: u64,
        policy: RetryPolicy,
        idempotency_key: Option<String>,
    },
    StartTimer {
        source: u64,
        fire_at_ms: u64,
    },
    StartChild {
        source: u64,
        workflow: String,
        instance: String,
        input: String,
        queue: String,
    },
    NotifyInstance {
        source: u64,
        target: String,
        name: String,
        payload: String,
    },
}

/// Options for [`WorkflowContext::schedule_activity`].
#[derive(Debug, Clone)]
pub struct ActivityOptions {
    pub queue: String,
    pub timeout_ms: u64,
    pub policy: RetryPolicy,
    pub idempotency_key: Option<String>,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            timeout_ms: 5_000,
            policy: RetryPolicy::default(),
            idempotency_key: None,
        }
    }
}

pub(crate) struct CtxInner {
    pub(crate) instance: String,
    pub(crate) parent: Option<ParentLink>,
    /// Full history, including events minted during this execution.
    pub(crate) history: Vec<Event>,
    next_seq: u64,
    /// Max seq that existed before this turn appended anything new. Consuming
    /// or minting past it means the workflow is seeing the event for the
    /// first time.
    replay_horizon: u64,
    /// Max seq consumed, claimed, or minted so far in this execution.
    frontier: u64,
    /// Logical clock: max `ts_ms` over events crossed by the frontier.
    logical_now_ms: u64,
    /// Wall clock stamped onto newly minted events.
    wall_now_ms: u64,
    pub(crate) actions: Vec<Action>,
    claimed_schedules: HashSet<u64>,
    consumed_completions: HashSet<u64>,
    consumed_signals: HashSet<u64>,
    /// Source seqs of futures abandoned as select losers; their eventual
    /// completions count as consumed for the FIFO gate.
    pub(crate) cancelled_sources: HashSet<u64>,
    pub(crate) integrity_error: Option<String>,
}

impl CtxInner {
    /// Append a freshly minted event and return its seq.
    fn mint(&mut self, kind: EventKind) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.frontier = self.frontier.max(seq);
        self.history.push(Event {
            seq,
            ts_ms: self.wall_now_ms,
            kind,
        });
        seq
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.logical_now_ms
    }

    fn cross(&mut self, seq: u64, ts_ms: u64) {
        self.frontier = self.frontier.max(seq);
        self.logical_now_ms = self.logical_now_ms.max(ts_ms);
    }

    /// Claim the next unclaimed scheduling event, or mint a new one once the
    /// recorded schedule is exhausted. Returns `(source seq, minted)`, or
    /// `None` after recording an integrity error on order mismatch.
    pub(crate) fn claim_or_mint(&mut self, kind: EventKind) -> Option<(u64, bool)> {
        if self.integrity_error.is_some() {
            return None;
        }
        let next = self
            .history
            .iter()
            .find(|e| e.kind.is_schedule() && !self.claimed_schedules.contains(&e.seq))
            .map(|e| (e.seq, e.ts_ms, e.kind.clone()));
        match next {
            Some((seq, ts, recorded)) => {
                if !schedules_match(&recorded, &kind) {
                    self.integrity_error = Some(format!(
                        "nondeterministic: schedule order mismatch at seq {seq}: recorded {}, requested {}",
                        describe_schedule(&recorded),
                        describe_schedule(&kind),
                    ));
                    return None;
                }
                self.claimed_schedules.insert(seq);
                self.cross(seq, ts);
                Some((seq, false))
            }
            None => {
                let seq = self.mint(kind);
                self.claimed_schedules.insert(seq);
                Some((seq, true))
            }
        }
    }

    /// A completion event is consumable only once every earlier completion
    /// event has been consumed or belongs to a cancelled source. Signals are
    /// exempt from the gate.
    pub(crate) fn completion_consumable(&self, seq: u64) -> bool {
        for e in &self.history {
            if e.seq >= seq {
                break;
            }
            if let Some(src) = e.kind.completion_source() {
                if !self.consumed_completions.contains(&e.seq) && !self.cancelled_sources.contains(&src) {
                    return false;
                }
            }
        }
        true
    }

    /// Find the consumable completion for `source`, consume it, and return a
    /// clone of its kind. `None` means not arrived or gated.
    pub(crate) fn consume_completion(&mut self, source: u64) -> Option<EventKind> {
        let found = self.history.iter().find_map(|e| {
            if e.kind.completion_source() == Some(source) && !self.consumed_completions.contains(&e.seq) {
                Some((e.seq, e.ts_ms, e.kind.clone()))
            } else {
                None
            }
        })?;
        let (seq, ts, kind) = found;
        if !self.completion_consumable(seq) {
            return None;
        }
        self.consumed_completions.insert(seq);
        self.cross(seq, ts);
        Some(kind)
    }

    /// Signal visibility for boundary peeks: a signal is observable only once
    /// every completion event recorded before it has been consumed and every
    /// scheduling event recorded before it has been claimed. A signal that
    /// lands while work is in flight stays hidden until the boundary after
    /// that work resolves, so a boundary check that was already passed can
    /// never observe it retroactively on replay.
    fn signal_visible(&self, seq: u64) -> bool {
        if !self.completion_consumable(seq) {
            return false;
        }
        self.history
            .iter()
            .take_while(|e| e.seq < seq)
            .all(|e| !e.kind.is_schedule() || self.claimed_schedules.contains(&e.seq))
    }

    /// Consume the next undelivered signal with the given name, in seq order.
    pub(crate) fn consume_signal(&mut self, name: &str) -> Option<String> {
        let found = self.history.iter().find_map(|e| match &e.kind {
            EventKind::SignalReceived { name: n, payload }
                if n == name && !self.consumed_signals.contains(&e.seq) =>
            {
                Some((e.seq, e.ts_ms, payload.clone()))
            }
            _ => None,
        })?;
        let (seq, ts, payload) = found;
        self.consumed_signals.insert(seq);
        self.cross(seq, ts);
        Some(payload)
    }

    /// Seq of the consumable completion for `source`, without consuming it.
    pub(crate) fn completion_ready_seq(&self, source: u64) -> Option<u64> {
        let e = self
            .history
            .iter()
            .find(|e| e.kind.completion_source() == Some(source) && !self.consumed_completions.contains(&e.seq))?;
        if self.completion_consumable(e.seq) {
            Some(e.seq)
        } else {
            None
        }
    }

    /// Seq of the next undelivered signal with this name, without consuming.
    pub(crate) fn signal_ready_seq(&self, name: &str) -> Option<u64> {
        self.history.iter().find_map(|e| match &e.kind {
            EventKind::SignalReceived { name: n, .. }
                if n == name && !self.consumed_signals.contains(&e.seq) =>
            {
                Some(e.seq)
            }
            _ => None,
        })
    }

    fn is_replaying(&self) -> bool {
        self.frontier <= self.replay_horizon
    }
}

fn schedules_match(recorded: &EventKind, requested: &EventKind) -> bool {
    match (recorded, requested) {
        (
            EventKind::ActivityScheduled { name: a, input: ia, .. },
            EventKind::ActivityScheduled { name: b, input: ib, .. },
        ) => a == b && ia == ib,
        (EventKind::TimerStarted { .. }, EventKind::TimerStarted { .. }) => true,
        (
            EventKind::ChildStarted { workflow: a, instance: ia, .. },
            EventKind::ChildStarted { workflow: b, instance: ib, .. },
        ) => a == b && ia == ib,
        (
            EventKind::SignalSent { target: a, name: na, .. },
            EventKind::SignalSent { target: b, name: nb, .. },
        ) => a == b && na == nb,
        _ => false,
    }
}

fn describe_schedule(kind: &EventKind) -> String {
    match kind {
        EventKind::ActivityScheduled { name, .. } => format!("ActivityScheduled({name})"),
        EventKind::TimerStarted { .. } => "TimerStarted".to_string(),
        EventKind::ChildStarted { workflow, instance, .. } => {
            format!("ChildStarted({workflow}, {instance})")
        }
        EventKind::SignalSent { target, name, .. } => format!("SignalSent({target}, {name})"),
        other => other.label().to_string(),
    }
}

/// Handle a workflow function uses to interact with the engine. Cheap to
/// clone; all durable operations route through the shared turn state.
#[derive(Clone)]
pub struct WorkflowContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl WorkflowContext {
    pub fn instance(&self) -> String {
        self.inner.lock().unwrap().instance.clone()
    }

    pub fn parent(&self) -> Option<ParentLink> {
        self.inner.lock().unwrap().parent.clone()
    }

    /// Logical time: the timestamp of the latest event this execution has
    /// crossed. Deterministic under replay, unlike the wall clock.
    pub fn now_ms(&self) -> u64 {
        self.inner.lock().unwrap().logical_now_ms
    }

    /// True while awaits are being satisfied from previously recorded
    /// history. Used to suppress duplicate side effects such as log lines.
    pub fn is_replaying(&self) -> bool {
        self.inner.lock().unwrap().is_replaying()
    }

    /// Schedule an activity; resolves to its single recorded completion
    /// after the executor has run the full retry loop.
    pub fn schedule_activity(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        opts: ActivityOptions,
    ) -> DurableFuture {
        DurableFuture::activity(self.clone(), name.into(), input.into(), opts)
    }

    /// Durable timer relative to logical now.
    pub fn schedule_timer(&self, delay_ms: u64) -> DurableFuture {
        DurableFuture::timer(self.clone(), delay_ms)
    }

    /// Wait for the next signal with this name. Signals queue: each call
    /// consumes one, in arrival order.
    pub fn wait_signal(&self, name: impl Into<String>) -> DurableFuture {
        DurableFuture::signal(self.clone(), name.into())
    }

    /// Start a child workflow instance and wait for its terminal outcome.
    pub fn start_child(
        &self,
        workflow: impl Into<String>,
        instance: impl Into<String>,
        input: impl Into<String>,
        queue: impl Into<String>,
    ) -> DurableFuture {
        DurableFuture::child(self.clone(), workflow.into(), instance.into(), input.into(), queue.into())
    }

    /// Durably send a signal to another instance. Recorded in this history
    /// before dispatch, so it is delivered exactly once even across a crash.
    /// Fire-and-forget: completes as soon as the event is recorded.
    pub fn notify_instance(
        &self,
        target: impl Into<String>,
        name: impl Into<String>,
        payload: impl Into<String>,
    ) {
        let (target, name, payload) = (target.into(), name.into(), payload.into());
        let mut inner = self.inner.lock().unwrap();
        let kind = EventKind::SignalSent {
            target: target.clone(),
            name: name.clone(),
            payload: payload.clone(),
        };
        if let Some((source, minted)) = inner.claim_or_mint(kind) {
            if minted {
                inner.actions.push(Action::NotifyInstance {
                    source,
                    target,
                    name,
                    payload,
                });
            }
        }
    }

    /// Race two durable futures. The winner is the one whose completion was
    /// durably recorded first (lowest seq); the loser's eventual completion
    /// is marked cancelled so it never blocks the consumption gate.
    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> futures::Select2 {
        futures::Select2::new(self.clone(), a, b)
    }

    /// Peek for a visible `cancel` signal without consuming it. Returns the
    /// cancellation reason. Stable across replays: a cancel only becomes
    /// visible once everything scheduled before it has resolved, so a cancel
    /// arriving mid-activity is honored at the next boundary, never at one
    /// already behind the workflow.
    pub fn cancel_requested(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.history.iter().find_map(|e| match &e.kind {
            EventKind::SignalReceived { name, payload }
                if name == "cancel" && inner.signal_visible(e.seq) =>
            {
                Some(payload.clone())
            }
            _ => None,
        })
    }

    /// Drain every currently visible signal with this name, in arrival
    /// order. Later calls only see signals that arrived afterwards.
    pub fn take_signals(&self, name: &str) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        let ready: Vec<(u64, u64, String)> = inner
            .history
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::SignalReceived { name: n, payload }
                    if n == name
                        && !inner.consumed_signals.contains(&e.seq)
                        && inner.signal_visible(e.seq) =>
                {
                    Some((e.seq, e.ts_ms, payload.clone()))
                }
                _ => None,
            })
            .collect();
        let mut out = Vec::with_capacity(ready.len());
        for (seq, ts, payload) in ready {
            inner.consumed_signals.insert(seq);
            inner.cross(seq, ts);
            out.push(payload);
        }
        out
    }
}

/// Result of executing one turn of a workflow against its history.
#[derive(Debug)]
pub struct TurnOutput {
    /// Updated history including any events minted this turn. Does not
    /// include the terminal `Completed` event; the caller records that.
    pub history: Vec<Event>,
    pub actions: Vec<Action>,
    /// Terminal outcome, if the workflow function returned this turn.
    pub outcome: Option<WorkflowOutcome>,
    /// Determinism violation detected this turn; the instance must halt.
    pub integrity: Option<String>,
}

/// Execute one turn treating the entire history as already recorded. This is
/// the pure replay entry point: running it on a history the workflow has
/// fully caught up with must produce no new events and no actions.
pub fn run_turn<F, Fut>(instance: &str, history: Vec<Event>, now_ms: u64, workflow: F) -> TurnOutput
where
    F: Fn(WorkflowContext, String) -> Fut,
    Fut: Future<Output = Result<String, FailureInfo>>,
{
    let horizon = history.iter().map(|e| e.seq).max().unwrap_or(0);
    run_turn_with_horizon(instance, history, horizon, now_ms, workflow)
}

/// Execute one turn with an explicit replay horizon: events with
/// `seq <= replay_horizon` are treated as replayed, anything past it as new.
pub fn run_turn_with_horizon<F, Fut>(
    instance: &str,
    history: Vec<Event>,
    replay_horizon: u64,
    now_ms: u64,
    workflow: F,
) -> TurnOutput
where
    F: Fn(WorkflowContext, String) -> Fut,
    Fut: Future<Output = Result<String, FailureInfo>>,
{
    let (input, parent, start_ts) = match history.first().map(|e| (&e.kind, e.ts_ms)) {
        Some((EventKind::Started { input, parent, .. }, ts)) => (input.clone(), parent.clone(), ts),
        _ => {
            return TurnOutput {
                history,
                actions: Vec::new(),
                outcome: None,
                integrity: Some("corrupt history: first event is not Started".to_string()),
            }
        }
    };
    let next_seq = history.iter().map(|e| e.seq).max().unwrap_or(0) + 1;
    let start_seq = history.first().map(|e| e.seq).unwrap_or(0);
    let inner = Arc::new(Mutex::new(CtxInner {
        instance: instance.to_string(),
        parent,
        history,
        next_seq,
        replay_horizon,
        frontier: start_seq,
        logical_now_ms: start_ts,
        wall_now_ms: now_ms,
        actions: Vec::new(),
        claimed_schedules: HashSet::new(),
        consumed_completions: HashSet::new(),
        consumed_signals: HashSet::new(),
        cancelled_sources: HashSet::new(),
        integrity_error: None,
    }));
    let ctx = WorkflowContext { inner: inner.clone() };

    let fut = workflow(ctx, input);
    let mut fut = Box::pin(fut);
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    let polled = fut.as_mut().poll(&mut cx);

    let mut guard = inner.lock().unwrap();
    let integrity = guard.integrity_error.take();
    let outcome = match (&integrity, polled) {
        (Some(_), _) | (None, Poll::Pending) => None,
        (None, Poll::Ready(Ok(output))) => Some(WorkflowOutcome::Success { output }),
        (None, Poll::Ready(Err(failure))) => {
            if failure.kind == FailureKind::Canceled {
                Some(WorkflowOutcome::Canceled {
                    reason: failure.message,
                })
            } else {
                Some(WorkflowOutcome::Failure { failure })
            }
        }
    };
    TurnOutput {
        history: std::mem::take(&mut guard.history),
        actions: std::mem::take(&mut guard.actions),
        outcome,
        integrity,
    }
}

pub(crate) fn noop_waker() -> Waker {
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    fn wake(_: *const ()) {}
    fn wake_by_ref(_: *const ()) {}
    fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    // Safety: every vtable entry is a no-op over a null pointer.
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

/// True once the history carries a terminal `Completed` event.
pub fn history_is_terminal(history: &[Event]) -> bool {
    history
        .iter()
        .any(|e| matches!(e.kind, EventKind::Completed { .. }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(seq: u64, kind: EventKind) -> Event {
        Event { seq, ts_ms: seq * 10, kind }
    }

    fn started(input: &str) -> Event {
        ev(
            1,
            EventKind::Started {
                workflow: "test".into(),
                version: "1.0.0".into(),
                input: input.into(),
                parent: None,
                deadline_ms: None,
            },
        )
    }

    #[test]
    fn first_turn_mints_schedule_and_action() {
        let out = run_turn("i-1", vec![started("in")], 100, |ctx, _input| async move {
            ctx.schedule_activity("Step", "payload", ActivityOptions::default())
                .into_activity()
                .await
        });
        assert!(out.outcome.is_none());
        assert!(out.integrity.is_none());
        assert_eq!(out.actions.len(), 1);
        assert!(matches!(
            &out.actions[0],
            Action::ScheduleActivity { source: 2, name, .. } if name == "Step"
        ));
        assert!(matches!(
            &out.history[1].kind,
            EventKind::ActivityScheduled { name, .. } if name == "Step"
        ));
    }

    #[test]
    fn completion_resolves_await_without_new_actions() {
        let history = vec![
            started("in"),
            ev(
                2,
                EventKind::ActivityScheduled {
                    name: "Step".into(),
                    input: "payload".into(),
                    queue: "default".into(),
                    timeout_ms: 5_000,
                    policy: RetryPolicy::default(),
                    idempotency_key: None,
                },
            ),
            ev(3, EventKind::ActivityCompleted { source: 2, result: "done".into() }),
        ];
        let out = run_turn("i-1", history, 100, |ctx, _input| async move {
            ctx.schedule_activity("Step", "payload", ActivityOptions::default())
                .into_activity()
                .await
        });
        assert_eq!(out.outcome, Some(WorkflowOutcome::Success { output: "done".into() }));
        assert!(out.actions.is_empty());
    }

    #[test]
    fn schedule_order_mismatch_is_integrity_error() {
        let history = vec![
            started("in"),
            ev(
                2,
                EventKind::ActivityScheduled {
                    name: "Step".into(),
                    input: "payload".into(),
                    queue: "default".into(),
                    timeout_ms: 5_000,
                    policy: RetryPolicy::default(),
                    idempotency_key: None,
                },
            ),
        ];
        let out = run_turn("i-1", history, 100, |ctx, _input| async move {
            // Code swapped the activity for a timer.
            ctx.schedule_timer(1_000).into_timer().await;
            Ok("never".into())
        });
        assert!(out.outcome.is_none());
        let msg = out.integrity.expect("mismatch must be flagged");
        assert!(msg.contains("schedule order mismatch"), "{msg}");
    }

    #[test]
    fn fifo_gate_blocks_out_of_order_consumption() {
        // B's completion was recorded before A's. Awaiting A must stay
        // pending until B's completion is consumed, even though A's result
        // is already in history.
        let sched = |seq: u64, name: &str| {
            ev(
                seq,
                EventKind::ActivityScheduled {
                    name: name.into(),
                    input: String::new(),
                    queue: "default".into(),
                    timeout_ms: 5_000,
                    policy: RetryPolicy::default(),
                    idempotency_key: None,
                },
            )
        };
        let history = vec![
            started("in"),
            sched(2, "A"),
            sched(3, "B"),
            ev(4, EventKind::ActivityCompleted { source: 3, result: "b".into() }),
            ev(5, EventKind::ActivityCompleted { source: 2, result: "a".into() }),
        ];
        let len_before = history.len();
        let out = run_turn("i-1", history, 100, |ctx, _input| async move {
            let a = ctx.schedule_activity("A", "", ActivityOptions::default());
            let r = a.into_activity().await;
            // Never reached this turn: A's completion is gated behind B's.
            let _ = ctx.schedule_activity("B", "", ActivityOptions::default());
            r
        });
        assert!(out.outcome.is_none());
        assert!(out.integrity.is_none());
        assert!(out.actions.is_empty());
        assert_eq!(out.history.len(), len_before);
    }

    #[test]
    fn cancel_behind_inflight_activity_waits_for_the_next_boundary() {
        // The cancel was recorded while Pay was still running. The boundary
        // check before Pay was already passed; replay must not observe the
        // cancel there, or a completed charge gets reported as canceled.
        let workflow = |ctx: WorkflowContext, _input: String| async move {
            if let Some(reason) = ctx.cancel_requested() {
                return Err(FailureInfo::canceled(format!("before pay: {reason}")));
            }
            let r = ctx
                .schedule_activity("Pay", "", ActivityOptions::default())
                .into_activity()
                .await?;
            if let Some(reason) = ctx.cancel_requested() {
                return Err(FailureInfo::canceled(format!("after pay: {reason}")));
            }
            Ok(r)
        };
        let mut history = vec![
            started("in"),
            ev(
                2,
                EventKind::ActivityScheduled {
                    name: "Pay".into(),
                    input: String::new(),
                    queue: "default".into(),
                    timeout_ms: 5_000,
                    policy: RetryPolicy::default(),
                    idempotency_key: None,
                },
            ),
            ev(3, EventKind::SignalReceived { name: "cancel".into(), payload: "user".into() }),
        ];
        let out = run_turn("i-1", history.clone(), 100, workflow);
        assert!(out.outcome.is_none(), "cancel must wait for Pay: {:?}", out.outcome);
        assert!(out.integrity.is_none());
        assert!(out.actions.is_empty());
        assert_eq!(out.history.len(), history.len());

        // Once Pay's completion is consumed the next boundary sees the cancel.
        history.push(ev(4, EventKind::ActivityCompleted { source: 2, result: "charged".into() }));
        let out = run_turn("i-1", history, 200, workflow);
        assert_eq!(
            out.outcome,
            Some(WorkflowOutcome::Canceled { reason: "after pay: user".into() })
        );
    }

    #[test]
    fn canceled_failure_maps_to_canceled_outcome() {
        let out = run_turn("i-1", vec![started("in")], 100, |_ctx, _input| async move {
            Err(FailureInfo::canceled("user requested"))
        });
        assert_eq!(
            out.outcome,
            Some(WorkflowOutcome::Canceled { reason: "user requested".into() })
        );
    }

    #[test]
    fn replay_of_final_history_is_quiescent() {
        let first = run_turn("i-1", vec![started("in")], 100, |ctx, _input| async move {
            ctx.schedule_activity("Step", "p", ActivityOptions::default())
                .into_activity()
                .await
        });
        let mut history = first.history;
        let next = history.last().unwrap().seq + 1;
        history.push(ev(next, EventKind::ActivityCompleted { source: 2, result: "ok".into() }));
        let len_before = history.len();
        let out = run_turn("i-1", history, 200, |ctx, _input| async move {
            ctx.schedule_activity("Step", "p", ActivityOptions::default())
                .into_activity()
                .await
        });
        assert_eq!(out.outcome, Some(WorkflowOutcome::Success { output: "ok".into() }));
        assert!(out.actions.is_empty());
        assert_eq!(out.history.len(), len_before);
    }
}
