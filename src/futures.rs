//! Durable futures: awaitable handles over recorded history.
//!
//! A durable future claims its scheduling event positionally (the next
//! unclaimed scheduling event in the history must match it, otherwise the
//! workflow code has diverged from the recording) and then resolves from the
//! completion event that refers back to that scheduling seq. Completions are
//! consumed under a FIFO gate: a completion is only deliverable once every
//! earlier completion has been consumed or belongs to a cancelled source.
//! Signals are exempt from the gate and are consumed by name in arrival
//! order.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::FailureInfo;
use crate::{Action, ActivityOptions, EventKind, WorkflowContext, WorkflowOutcome};

/// Resolved value of a [`DurableFuture`].
#[derive(Debug, Clone, PartialEq)]
pub enum DurableOutput {
    Activity(Result<String, FailureInfo>),
    Timer,
    Signal(String),
    Child(WorkflowOutcome),
}

enum Kind {
    Activity {
        name: String,
        input: String,
        opts: ActivityOptions,
    },
    Timer {
        delay_ms: u64,
    },
    Signal {
        name: String,
    },
    Child {
        workflow: String,
        instance: String,
        input: String,
        queue: String,
    },
}

pub struct DurableFuture {
    ctx: WorkflowContext,
    kind: Kind,
    /// Seq of the claimed or minted scheduling event. Signals never claim.
    claimed: Cell<Option<u64>>,
}

impl DurableFuture {
    pub(crate) fn activity(ctx: WorkflowContext, name: String, input: String, opts: ActivityOptions) -> Self {
        Self {
            ctx,
            kind: Kind::Activity { name, input, opts },
            claimed: Cell::new(None),
        }
    }

    pub(crate) fn timer(ctx: WorkflowContext, delay_ms: u64) -> Self {
        Self {
            ctx,
            kind: Kind::Timer { delay_ms },
            claimed: Cell::new(None),
        }
    }

    pub(crate) fn signal(ctx: WorkflowContext, name: String) -> Self {
        Self {
            ctx,
            kind: Kind::Signal { name },
            claimed: Cell::new(None),
        }
    }

    pub(crate) fn child(
        ctx: WorkflowContext,
        workflow: String,
        instance: String,
        input: String,
        queue: String,
    ) -> Self {
        Self {
            ctx,
            kind: Kind::Child {
                workflow,
                instance,
                input,
                queue,
            },
            claimed: Cell::new(None),
        }
    }

    /// Claim or mint this future's scheduling event, emitting the dispatch
    /// action on first execution. Idempotent. Returns false once an
    /// integrity error is recorded.
    fn arm(&self) -> bool {
        if self.claimed.get().is_some() {
            return true;
        }
        if matches!(self.kind, Kind::Signal { .. }) {
            return true;
        }
        let mut inner = self.ctx.inner.lock().unwrap();
        if inner.integrity_error.is_some() {
            return false;
        }
        match &self.kind {
            Kind::Activity { name, input, opts } => {
                let kind = EventKind::ActivityScheduled {
                    name: name.clone(),
                    input: input.clone(),
                    queue: opts.queue.clone(),
                    timeout_ms: opts.timeout_ms,
                    policy: opts.policy,
                    idempotency_key: opts.idempotency_key.clone(),
                };
                let Some((source, minted)) = inner.claim_or_mint(kind) else {
                    return false;
                };
                if minted {
                    inner.actions.push(Action::ScheduleActivity {
                        source,
                        name: name.clone(),
                        input: input.clone(),
                        queue: opts.queue.clone(),
                        timeout_ms: opts.timeout_ms,
                        policy: opts.policy,
                        idempotency_key: opts.idempotency_key.clone(),
                    });
                }
                self.claimed.set(Some(source));
            }
            Kind::Timer { delay_ms } => {
                let fire_at_ms = inner.now_ms().saturating_add(*delay_ms);
                let Some((source, minted)) = inner.claim_or_mint(EventKind::TimerStarted { fire_at_ms }) else {
                    return false;
                };
                if minted {
                    inner.actions.push(Action::StartTimer { source, fire_at_ms });
                }
                self.claimed.set(Some(source));
            }
            Kind::Child {
                workflow,
                instance,
                input,
                queue,
            } => {
                let kind = EventKind::ChildStarted {
                    workflow: workflow.clone(),
                    instance: instance.clone(),
                    input: input.clone(),
                    queue: queue.clone(),
                };
                let Some((source, minted)) = inner.claim_or_mint(kind) else {
                    return false;
                };
                if minted {
                    inner.actions.push(Action::StartChild {
                        source,
                        workflow: workflow.clone(),
                        instance: instance.clone(),
                        input: input.clone(),
                        queue: queue.clone(),
                    });
                }
                self.claimed.set(Some(source));
            }
            Kind::Signal { .. } => {}
        }
        true
    }

    /// Seq of the history event that would resolve this future right now,
    /// respecting the consumption gate. Does not consume.
    fn ready_seq(&self) -> Option<u64> {
        let inner = self.ctx.inner.lock().unwrap();
        match &self.kind {
            Kind::Signal { name } => inner.signal_ready_seq(name),
            _ => inner.completion_ready_seq(self.claimed.get()?),
        }
    }

    /// Consume the resolving event and produce the output.
    fn resolve(&self) -> Option<DurableOutput> {
        let mut inner = self.ctx.inner.lock().unwrap();
        match &self.kind {
            Kind::Signal { name } => inner.consume_signal(name).map(DurableOutput::Signal),
            _ => {
                let source = self.claimed.get()?;
                let kind = inner.consume_completion(source)?;
                let out = match (&self.kind, kind) {
                    (Kind::Activity { .. }, EventKind::ActivityCompleted { result, .. }) => {
                        DurableOutput::Activity(Ok(result))
                    }
                    (Kind::Activity { .. }, EventKind::ActivityFailed { failure, .. }) => {
                        DurableOutput::Activity(Err(failure))
                    }
                    (Kind::Timer { .. }, EventKind::TimerFired { .. }) => DurableOutput::Timer,
                    (Kind::Child { .. }, EventKind::ChildCompleted { outcome, .. }) => {
                        DurableOutput::Child(outcome)
                    }
                    (_, other) => {
                        inner.integrity_error = Some(format!(
                            "nondeterministic: completion kind mismatch for source {source}: recorded {}",
                            kind_name(&other),
                        ));
                        return None;
                    }
                };
                Some(out)
            }
        }
    }

    /// Abandon this future as a select loser: its eventual completion is
    /// treated as consumed so it never blocks the gate.
    fn cancel(&self) {
        if let Some(source) = self.claimed.get() {
            self.ctx.inner.lock().unwrap().cancelled_sources.insert(source);
        }
    }

    pub fn into_activity(self) -> ActivityFuture {
        ActivityFuture(self)
    }

    pub fn into_timer(self) -> TimerFuture {
        TimerFuture(self)
    }

    pub fn into_signal(self) -> SignalFuture {
        SignalFuture(self)
    }

    pub fn into_child(self) -> ChildFuture {
        ChildFuture(self)
    }
}

fn kind_name(kind: &EventKind) -> &'static str {
    match kind {
        EventKind::ActivityCompleted { .. } => "ActivityCompleted",
        EventKind::ActivityFailed { .. } => "ActivityFailed",
        EventKind::TimerFired { .. } => "TimerFired",
        EventKind::ChildCompleted { .. } => "ChildCompleted",
        _ => "other",
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.arm() {
            return Poll::Pending;
        }
        if self.ready_seq().is_none() {
            return Poll::Pending;
        }
        match self.resolve() {
            Some(out) => Poll::Ready(out),
            None => Poll::Pending,
        }
    }
}

/// Race of two durable futures. Resolves to `(index, output)` of the winner,
/// which is the future whose resolving event carries the lowest seq: the
/// first event durably recorded wins, deterministically, regardless of how
/// completions were batched. The loser is cancelled so its completion never
/// wedges the consumption gate.
pub struct Select2 {
    futures: [DurableFuture; 2],
    done: bool,
}

impl Select2 {
    pub(crate) fn new(_ctx: WorkflowContext, a: DurableFuture, b: DurableFuture) -> Self {
        Self {
            futures: [a, b],
            done: false,
        }
    }
}

impl Future for Select2 {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.done, "polled after completion");
        // Arm both first so both scheduling events are recorded in program
        // order before either side can win.
        for f in &this.futures {
            if !f.arm() {
                return Poll::Pending;
            }
        }
        let ready: Vec<(usize, u64)> = this
            .futures
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.ready_seq().map(|seq| (i, seq)))
            .collect();
        let Some(&(winner, _)) = ready.iter().min_by_key(|(_, seq)| *seq) else {
            return Poll::Pending;
        };
        let Some(out) = this.futures[winner].resolve() else {
            return Poll::Pending;
        };
        for (i, f) in this.futures.iter().enumerate() {
            if i != winner {
                f.cancel();
            }
        }
        this.done = true;
        Poll::Ready((winner, out))
    }
}

/// Typed wrappers so workflow code awaits domain results directly. The inner
/// future always yields the variant matching its kind, so the fallthrough
/// arms are unreachable by construction.
pub struct ActivityFuture(DurableFuture);

impl Future for ActivityFuture {
    type Output = Result<String, FailureInfo>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(DurableOutput::Activity(r)) => Poll::Ready(r),
            Poll::Ready(_) => unreachable!("activity future resolved with non-activity output"),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct TimerFuture(DurableFuture);

impl Future for TimerFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(DurableOutput::Timer) => Poll::Ready(()),
            Poll::Ready(_) => unreachable!("timer future resolved with non-timer output"),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct SignalFuture(DurableFuture);

impl Future for SignalFuture {
    type Output = String;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(DurableOutput::Signal(p)) => Poll::Ready(p),
            Poll::Ready(_) => unreachable!("signal future resolved with non-signal output"),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct ChildFuture(DurableFuture);

impl Future for ChildFuture {
    type Output = WorkflowOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(DurableOutput::Child(o)) => Poll::Ready(o),
            Poll::Ready(_) => unreachable!("child future resolved with non-child output"),
            Poll::Pending => Poll::Pending,
        }
    }
}
