//! Drives one locked orchestration batch end to end: seed or load the
//! instance, stage completions, run the turn, translate actions into queue
//! items, and commit everything in a single atomic ack. An ack that keeps
//! failing is abandoned so the batch becomes visible again.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use semver::Version;
use tracing::{debug, error, warn};

use crate::error::FailureInfo;
use crate::providers::{OrchestrationItem, Provider, WorkItem};
use crate::runtime::registry::{WorkflowHandler, WorkflowRegistry};
use crate::runtime::status::{snapshot_from_history, StatusSnapshot};
use crate::runtime::turn::{TurnResult, WorkflowTurn};
use crate::runtime::RuntimeOptions;
use crate::{history_is_terminal, Action, Event, EventKind, ParentLink, WorkflowOutcome};

pub(crate) fn wall_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) async fn process_orchestration_item(
    store: &Arc<dyn Provider>,
    workflows: &WorkflowRegistry,
    options: &RuntimeOptions,
    item: OrchestrationItem,
) {
    let now_ms = wall_now_ms();

    // Terminal instances accept and drop everything: a signal after
    // completion is a no-op, not an error.
    if history_is_terminal(&item.history) {
        debug!(
            target: "ordex::runtime",
            instance = %item.instance,
            dropped = item.messages.len(),
            "dropping messages for terminal instance"
        );
        ack_with_retry(store, options, &item, Vec::new(), Vec::new(), Vec::new(), Vec::new(), None).await;
        return;
    }

    let mut turn = WorkflowTurn::new(item.instance.clone(), item.history.clone(), now_ms);
    let mut timer_items: Vec<WorkItem> = Vec::new();
    let mut messages = item.messages.clone();
    let mut handler: Option<Arc<dyn WorkflowHandler>> = None;

    if item.history.is_empty() {
        let Some(pos) = messages
            .iter()
            .position(|m| matches!(m, WorkItem::StartWorkflow { .. }))
        else {
            warn!(
                target: "ordex::runtime",
                instance = %item.instance,
                "dropping messages for an instance that was never started"
            );
            ack_with_retry(store, options, &item, Vec::new(), Vec::new(), Vec::new(), Vec::new(), None).await;
            return;
        };
        let WorkItem::StartWorkflow {
            workflow,
            version,
            input,
            parent,
            deadline_ms,
            ..
        } = messages.remove(pos)
        else {
            unreachable!()
        };
        let resolved = match &version {
            Some(v) => Version::parse(v)
                .ok()
                .and_then(|v| workflows.resolve_handler_exact(&workflow, &v).map(|h| (v, h))),
            None => workflows.resolve_handler(&workflow),
        };
        match resolved {
            Some((v, h)) => {
                turn.seed_started(workflow, v.to_string(), input, parent, deadline_ms);
                if let Some(budget) = deadline_ms {
                    timer_items.push(WorkItem::DeadlineSchedule {
                        instance: item.instance.clone(),
                        fire_at_ms: now_ms.saturating_add(budget),
                    });
                }
                handler = Some(h);
            }
            None => {
                warn!(
                    target: "ordex::runtime",
                    instance = %item.instance,
                    workflow = %workflow,
                    "start for unregistered workflow"
                );
                turn.seed_started(
                    workflow.clone(),
                    version.unwrap_or_else(|| "0.0.0".to_string()),
                    input,
                    parent,
                    deadline_ms,
                );
                let outcome = WorkflowOutcome::Failure {
                    failure: FailureInfo::permanent(format!("unregistered workflow: {workflow}")),
                };
                finish_terminal(store, options, &item, turn, None, outcome, Vec::new(), Vec::new()).await;
                return;
            }
        }
    }

    turn.prep_messages(messages);

    // Deadline enforcement happens outside the workflow: the instance fails
    // regardless of what it is currently waiting on.
    if turn.deadline_elapsed {
        let outcome = WorkflowOutcome::Failure {
            failure: FailureInfo::deadline_exceeded("execution deadline elapsed"),
        };
        finish_terminal(store, options, &item, turn, handler, outcome, Vec::new(), Vec::new()).await;
        return;
    }

    let handler = match handler {
        Some(h) => h,
        None => match resolve_from_history(workflows, &item.history) {
            Ok(h) => h,
            Err(msg) => {
                error!(target: "ordex::runtime", instance = %item.instance, %msg, "cannot resolve workflow handler");
                let outcome = WorkflowOutcome::Failure {
                    failure: FailureInfo::integrity(msg),
                };
                finish_terminal(store, options, &item, turn, None, outcome, Vec::new(), Vec::new()).await;
                return;
            }
        },
    };

    // Runtime-propagated cancellation is likewise forced: the parent is
    // already terminal, so the instance ends now and propagates the cancel
    // to its own open children through the terminal path.
    if let Some(reason) = turn.forced_cancel.take() {
        let outcome = WorkflowOutcome::Canceled { reason };
        finish_terminal(store, options, &item, turn, Some(handler), outcome, Vec::new(), Vec::new()).await;
        return;
    }

    match turn.execute(handler.clone()) {
        TurnResult::Continue => {
            let (worker, timers, orch) = items_from_actions(&item.instance, &turn.actions);
            timer_items.extend(timers);
            let detail = handler.project(&turn.history);
            let snapshot = snapshot_from_history(&turn.history, detail);
            let delta = turn.history_delta();
            ack_with_retry(store, options, &item, delta, worker, timer_items, orch, Some(snapshot)).await;
        }
        TurnResult::Completed(outcome) => {
            // A final turn can still emit actions (typically an outbound
            // signal recorded just before returning); dispatch those, but a
            // terminal instance has no use for fresh timers.
            let (worker, _timers, orch) = items_from_actions(&item.instance, &turn.actions);
            finish_terminal(store, options, &item, turn, Some(handler), outcome, worker, orch).await;
        }
        TurnResult::Integrity(msg) => {
            error!(
                target: "ordex::runtime",
                instance = %item.instance,
                %msg,
                "halting instance on integrity violation"
            );
            // Nothing minted this turn may be dispatched.
            turn.actions.clear();
            let outcome = WorkflowOutcome::Failure {
                failure: FailureInfo::integrity(msg),
            };
            finish_terminal(store, options, &item, turn, Some(handler), outcome, Vec::new(), Vec::new()).await;
        }
    }
}

/// Append the terminal event, notify the parent, propagate cancellation to
/// still-open children where warranted, persist the snapshot, and ack.
#[allow(clippy::too_many_arguments)]
async fn finish_terminal(
    store: &Arc<dyn Provider>,
    options: &RuntimeOptions,
    item: &OrchestrationItem,
    mut turn: WorkflowTurn,
    handler: Option<Arc<dyn WorkflowHandler>>,
    outcome: WorkflowOutcome,
    worker_items: Vec<WorkItem>,
    mut orchestrator_items: Vec<WorkItem>,
) {
    turn.append_event(EventKind::Completed {
        outcome: outcome.clone(),
    });

    if let Some(link) = parent_link(&turn.history) {
        orchestrator_items.push(WorkItem::ChildCompleted {
            parent_instance: link.instance,
            source: link.source,
            outcome: outcome.clone(),
        });
    }

    let propagate = matches!(&outcome, WorkflowOutcome::Canceled { .. })
        || matches!(
            &outcome,
            WorkflowOutcome::Failure { failure } if failure.kind == crate::FailureKind::DeadlineExceeded
        );
    if propagate {
        for child in open_children(&turn.history) {
            orchestrator_items.push(WorkItem::CancelRequested {
                instance: child,
                reason: "parent terminated".to_string(),
            });
        }
    }

    let detail = handler.as_ref().and_then(|h| h.project(&turn.history));
    let snapshot = snapshot_from_history(&turn.history, detail);
    let delta = turn.history_delta();
    ack_with_retry(
        store,
        options,
        item,
        delta,
        worker_items,
        Vec::new(),
        orchestrator_items,
        Some(snapshot),
    )
    .await;
}

fn parent_link(history: &[Event]) -> Option<ParentLink> {
    history.first().and_then(|e| match &e.kind {
        EventKind::Started { parent, .. } => parent.clone(),
        _ => None,
    })
}

/// Instances of children that were started but have no recorded completion.
fn open_children(history: &[Event]) -> Vec<String> {
    history
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::ChildStarted { instance, .. } => Some((e.seq, instance.clone())),
            _ => None,
        })
        .filter(|(seq, _)| {
            !history.iter().any(|e| {
                matches!(&e.kind, EventKind::ChildCompleted { source, .. } if source == seq)
            })
        })
        .map(|(_, inst)| inst)
        .collect()
}

fn resolve_from_history(
    workflows: &WorkflowRegistry,
    history: &[Event],
) -> Result<Arc<dyn WorkflowHandler>, String> {
    let Some(EventKind::Started { workflow, version, .. }) = history.first().map(|e| &e.kind) else {
        return Err("corrupt history: first event is not Started".to_string());
    };
    let v = Version::parse(version).map_err(|e| format!("bad recorded version {version}: {e}"))?;
    workflows
        .resolve_handler_exact(workflow, &v)
        .ok_or_else(|| format!("workflow no longer registered: {workflow}@{version}"))
}

/// Translate a turn's actions into queue items for the atomic ack.
fn items_from_actions(instance: &str, actions: &[Action]) -> (Vec<WorkItem>, Vec<WorkItem>, Vec<WorkItem>) {
    let mut worker = Vec::new();
    let mut timers = Vec::new();
    let mut orch = Vec::new();
    for action in actions {
        match action {
            Action::ScheduleActivity {
                source,
                name,
                input,
                queue,
                timeout_ms,
                policy,
                idempotency_key,
            } => worker.push(WorkItem::ActivityExecute {
                instance: instance.to_string(),
                source: *source,
                name: name.clone(),
                input: input.clone(),
                queue: queue.clone(),
                timeout_ms: *timeout_ms,
                policy: *policy,
                idempotency_key: idempotency_key.clone(),
            }),
            Action::StartTimer { source, fire_at_ms } => timers.push(WorkItem::TimerSchedule {
                instance: instance.to_string(),
                source: *source,
                fire_at_ms: *fire_at_ms,
            }),
            Action::StartChild {
                source,
                workflow,
                instance: child,
                input,
                queue: _,
            } => orch.push(WorkItem::StartWorkflow {
                instance: child.clone(),
                workflow: workflow.clone(),
                version: None,
                input: input.clone(),
                parent: Some(ParentLink {
                    instance: instance.to_string(),
                    source: *source,
                }),
                deadline_ms: None,
            }),
            Action::NotifyInstance {
                source: _,
                target,
                name,
                payload,
            } => orch.push(WorkItem::SignalRaised {
                instance: target.clone(),
                name: name.clone(),
                payload: payload.clone(),
            }),
        }
    }
    (worker, timers, orch)
}

/// Ack with exponential backoff on retryable provider errors; abandon the
/// batch if the ack never lands so another pass can retry the whole turn.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn ack_with_retry(
    store: &Arc<dyn Provider>,
    options: &RuntimeOptions,
    item: &OrchestrationItem,
    history_delta: Vec<Event>,
    worker_items: Vec<WorkItem>,
    timer_items: Vec<WorkItem>,
    orchestrator_items: Vec<WorkItem>,
    snapshot: Option<StatusSnapshot>,
) {
    let mut attempts = 0u32;
    loop {
        let res = store
            .ack_orchestration_item(
                &item.lock_token,
                history_delta.clone(),
                worker_items.clone(),
                timer_items.clone(),
                orchestrator_items.clone(),
                snapshot.clone(),
            )
            .await;
        match res {
            Ok(()) => return,
            Err(e) if e.retryable && attempts + 1 < options.ack_max_attempts => {
                attempts += 1;
                let delay = 10u64 * (1 << attempts.min(6));
                warn!(
                    target: "ordex::runtime",
                    instance = %item.instance,
                    attempts,
                    error = %e,
                    "ack failed, backing off"
                );
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
            Err(e) => {
                error!(
                    target: "ordex::runtime",
                    instance = %item.instance,
                    error = %e,
                    "ack failed permanently, abandoning batch"
                );
                if let Err(abandon_err) = store.abandon_orchestration_item(&item.lock_token).await {
                    error!(
                        target: "ordex::runtime",
                        instance = %item.instance,
                        error = %abandon_err,
                        "abandon failed"
                    );
                }
                return;
            }
        }
    }
}
