//! Timer service: drains the durable timer queue into an in-memory min-heap
//! and, when an entry comes due, atomically acks it while enqueuing the
//! fired message for the orchestrator. The lock token travels with the heap
//! entry, so a crash before the ack leaves the schedule durable and the
//! next process re-arms it.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::providers::{Provider, WorkItem};
use crate::runtime::execution::wall_now_ms;
use crate::runtime::RuntimeOptions;

struct Pending {
    fire_at_ms: u64,
    lock_token: String,
    item: WorkItem,
}

// Heap order ignores the payload; lock tokens are unique, so the tiebreak
// keeps the order total.
impl Ord for Pending {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at_ms
            .cmp(&other.fire_at_ms)
            .then_with(|| self.lock_token.cmp(&other.lock_token))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for Pending {}

fn fired_message(item: &WorkItem) -> Option<WorkItem> {
    match item {
        WorkItem::TimerSchedule {
            instance,
            source,
            fire_at_ms,
        } => Some(WorkItem::TimerFired {
            instance: instance.clone(),
            source: *source,
            fire_at_ms: *fire_at_ms,
        }),
        WorkItem::DeadlineSchedule { instance, .. } => Some(WorkItem::DeadlineElapsed {
            instance: instance.clone(),
        }),
        _ => None,
    }
}

pub(crate) async fn run_timer_service(store: Arc<dyn Provider>, options: RuntimeOptions) {
    let mut heap: BinaryHeap<Reverse<Pending>> = BinaryHeap::new();
    loop {
        // Intake everything currently queued.
        loop {
            match store.dequeue_timer_peek_lock().await {
                Ok(Some((item, lock_token))) => match item {
                    WorkItem::TimerSchedule { fire_at_ms, .. }
                    | WorkItem::DeadlineSchedule { fire_at_ms, .. } => {
                        heap.push(Reverse(Pending {
                            fire_at_ms,
                            lock_token,
                            item,
                        }));
                    }
                    other => {
                        // Route junk back through the orchestrator, which
                        // logs and drops it; never leave it locked.
                        warn!(target: "ordex::runtime::timers", item = ?other, "non-timer item on timer queue");
                        if let Err(e) = store.ack_timer_item(&lock_token, other).await {
                            warn!(target: "ordex::runtime::timers", error = %e, "failed to ack stray item");
                        }
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(target: "ordex::runtime::timers", error = %e, "timer dequeue failed");
                    break;
                }
            }
        }

        // Fire everything due.
        let now = wall_now_ms();
        while heap.peek().map(|Reverse(p)| p.fire_at_ms <= now).unwrap_or(false) {
            let Reverse(pending) = heap.pop().unwrap();
            let fired = fired_message(&pending.item).unwrap();
            if let Err(e) = store.ack_timer_item(&pending.lock_token, fired).await {
                warn!(target: "ordex::runtime::timers", error = %e, "timer ack failed, abandoning");
                if let Err(e) = store.abandon_timer_item(&pending.lock_token).await {
                    warn!(target: "ordex::runtime::timers", error = %e, "timer abandon failed");
                }
            }
        }

        let idle = Duration::from_millis(options.dispatcher_idle_sleep_ms);
        let until_next = heap
            .peek()
            .map(|Reverse(p)| Duration::from_millis(p.fire_at_ms.saturating_sub(wall_now_ms())))
            .unwrap_or(idle);
        tokio::time::sleep(until_next.min(idle).max(Duration::from_millis(1))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::InMemoryProvider;

    #[tokio::test]
    async fn fires_due_timers_in_order() {
        let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
        let now = wall_now_ms();
        let item = |source: u64, fire_at_ms: u64| WorkItem::TimerSchedule {
            instance: "i".into(),
            source,
            fire_at_ms,
        };
        // Enqueue out of order; both already due.
        let batch = {
            // Seed the timer queue through an orchestration ack.
            let p = store.clone();
            p.enqueue_orchestrator_work(WorkItem::SignalRaised {
                instance: "i".into(),
                name: "seed".into(),
                payload: String::new(),
            })
            .await
            .unwrap();
            p.fetch_orchestration_item().await.unwrap().unwrap()
        };
        let delta = vec![crate::Event {
            seq: 1,
            ts_ms: 0,
            kind: crate::EventKind::SignalReceived {
                name: "seed".into(),
                payload: String::new(),
            },
        }];
        store
            .ack_orchestration_item(
                &batch.lock_token,
                delta,
                vec![],
                vec![item(2, now.saturating_sub(10)), item(3, now.saturating_sub(50))],
                vec![],
                None,
            )
            .await
            .unwrap();

        let svc = tokio::spawn(run_timer_service(
            store.clone(),
            RuntimeOptions::default(),
        ));
        // Wait for both fired messages to land on the orchestrator queue.
        let mut fired = Vec::new();
        for _ in 0..100 {
            if let Some(it) = store.fetch_orchestration_item().await.unwrap() {
                for m in &it.messages {
                    if let WorkItem::TimerFired { source, .. } = m {
                        fired.push(*source);
                    }
                }
                store.abandon_orchestration_item(&it.lock_token).await.unwrap();
                if fired.len() >= 2 {
                    break;
                }
                fired.clear();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        svc.abort();
        assert_eq!(fired, vec![3, 2], "earlier fire time acks first");
    }
}
