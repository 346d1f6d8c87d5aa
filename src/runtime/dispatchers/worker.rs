//! Activity executor. Each worker polls one queue; the full retry loop for
//! an activity runs here, inside the single peek-lock hold, and produces
//! exactly one completion message in one atomic ack. Attempt-level noise
//! (timeouts, transient failures, backoff) never touches history.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{ActivityError, FailureInfo};
use crate::providers::{Provider, WorkItem};
use crate::runtime::registry::ActivityRegistry;
use crate::runtime::RuntimeOptions;
use crate::RetryPolicy;

pub(crate) async fn run_worker_dispatcher(
    store: Arc<dyn Provider>,
    activities: ActivityRegistry,
    queue: String,
    options: RuntimeOptions,
) {
    let idle = Duration::from_millis(options.dispatcher_idle_sleep_ms);
    loop {
        match store.dequeue_worker_peek_lock(&queue).await {
            Ok(Some((item, lock_token))) => {
                process_work_item(&store, &activities, &queue, item, &lock_token).await;
            }
            Ok(None) => tokio::time::sleep(idle).await,
            Err(e) => {
                warn!(target: "ordex::runtime::worker", queue = %queue, error = %e, "worker dequeue failed");
                tokio::time::sleep(idle).await;
            }
        }
    }
}

async fn process_work_item(
    store: &Arc<dyn Provider>,
    activities: &ActivityRegistry,
    queue: &str,
    item: WorkItem,
    lock_token: &str,
) {
    let WorkItem::ActivityExecute {
        instance,
        source,
        name,
        input,
        timeout_ms,
        policy,
        idempotency_key,
        ..
    } = item
    else {
        warn!(target: "ordex::runtime::worker", queue = %queue, item = ?item, "non-activity item on worker queue");
        if let Err(e) = store.abandon_worker_item(lock_token).await {
            warn!(target: "ordex::runtime::worker", error = %e, "abandon failed");
        }
        return;
    };

    debug!(
        target: "ordex::runtime::worker",
        instance = %instance,
        activity = %name,
        source,
        queue = %queue,
        idempotency_key = ?idempotency_key,
        "executing activity"
    );

    let completion = match activities.resolve_handler(&name) {
        None => WorkItem::ActivityFailed {
            instance: instance.clone(),
            source,
            failure: FailureInfo::permanent(format!("unregistered activity: {name}")),
            attempts: 0,
        },
        Some((_v, handler)) => {
            run_with_retry(&instance, source, &name, &input, timeout_ms, policy, handler.as_ref()).await
        }
    };

    if let Err(e) = store.ack_worker_item(lock_token, completion).await {
        warn!(
            target: "ordex::runtime::worker",
            instance = %instance,
            activity = %name,
            error = %e,
            "worker ack failed, abandoning"
        );
        if let Err(e) = store.abandon_worker_item(lock_token).await {
            warn!(target: "ordex::runtime::worker", error = %e, "abandon failed");
        }
    }
}

/// Run the retry loop to a single outcome. A timeout counts as a failed
/// attempt and stays retryable; a permanent failure short-circuits.
async fn run_with_retry(
    instance: &str,
    source: u64,
    name: &str,
    input: &str,
    timeout_ms: u64,
    policy: RetryPolicy,
    handler: &dyn crate::runtime::registry::ActivityHandler,
) -> WorkItem {
    let max_attempts = policy.max_attempts.max(1);
    let mut last_failure = FailureInfo::transient("no attempts made");
    for attempt in 1..=max_attempts {
        let backoff = policy.backoff_ms(attempt);
        if backoff > 0 {
            let jitter = rand::thread_rng().gen_range(0..=backoff / 2);
            tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
        }
        let attempt_result =
            tokio::time::timeout(Duration::from_millis(timeout_ms), handler.invoke(input.to_string())).await;
        match attempt_result {
            Ok(Ok(result)) => {
                return WorkItem::ActivityCompleted {
                    instance: instance.to_string(),
                    source,
                    result,
                };
            }
            Ok(Err(ActivityError::Permanent(msg))) => {
                debug!(
                    target: "ordex::runtime::worker",
                    instance = %instance,
                    activity = %name,
                    attempt,
                    %msg,
                    "permanent failure, not retrying"
                );
                return WorkItem::ActivityFailed {
                    instance: instance.to_string(),
                    source,
                    failure: FailureInfo::permanent(msg),
                    attempts: attempt,
                };
            }
            Ok(Err(ActivityError::Transient(msg))) => {
                debug!(
                    target: "ordex::runtime::worker",
                    instance = %instance,
                    activity = %name,
                    attempt,
                    %msg,
                    "transient failure"
                );
                last_failure = FailureInfo::transient(msg);
            }
            Err(_elapsed) => {
                debug!(
                    target: "ordex::runtime::worker",
                    instance = %instance,
                    activity = %name,
                    attempt,
                    timeout_ms,
                    "attempt timed out"
                );
                last_failure = FailureInfo::timeout(format!("{name} timed out after {timeout_ms}ms"));
            }
        }
    }
    WorkItem::ActivityFailed {
        instance: instance.to_string(),
        source,
        failure: last_failure,
        attempts: max_attempts,
    }
}
