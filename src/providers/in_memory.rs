//! In-process provider used by tests and single-process deployments. All
//! state lives behind one mutex; atomicity of acks falls out of holding the
//! guard across the whole mutation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::providers::{check_contiguous, OrchestrationItem, Provider, ProviderError, WorkItem};
use crate::runtime::status::StatusSnapshot;
use crate::Event;

const QUEUE_CAP: usize = 1024;

struct LockedBatch {
    instance: String,
    items: Vec<WorkItem>,
}

#[derive(Default)]
struct Inner {
    histories: HashMap<String, Vec<Event>>,
    snapshots: HashMap<String, StatusSnapshot>,
    orch_q: VecDeque<WorkItem>,
    orch_locked: HashMap<String, LockedBatch>,
    locked_instances: HashSet<String>,
    worker_qs: HashMap<String, VecDeque<WorkItem>>,
    worker_locked: HashMap<String, (String, WorkItem)>,
    timer_q: VecDeque<WorkItem>,
    timer_locked: HashMap<String, WorkItem>,
}

#[derive(Default)]
pub struct InMemoryProvider {
    inner: Mutex<Inner>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

fn new_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[async_trait]
impl Provider for InMemoryProvider {
    async fn read_history(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let g = self.inner.lock().unwrap();
        Ok(g.histories.get(instance).cloned().unwrap_or_default())
    }

    async fn fetch_orchestration_item(&self) -> Result<Option<OrchestrationItem>, ProviderError> {
        let mut g = self.inner.lock().unwrap();
        let Some(instance) = g
            .orch_q
            .iter()
            .find(|it| !g.locked_instances.contains(it.instance()))
            .map(|it| it.instance().to_string())
        else {
            return Ok(None);
        };
        // Take every pending message for this instance, preserving order.
        let mut items = Vec::new();
        let mut rest = VecDeque::with_capacity(g.orch_q.len());
        for it in g.orch_q.drain(..) {
            if it.instance() == instance {
                items.push(it);
            } else {
                rest.push_back(it);
            }
        }
        g.orch_q = rest;
        let lock_token = new_token();
        g.locked_instances.insert(instance.clone());
        g.orch_locked.insert(
            lock_token.clone(),
            LockedBatch {
                instance: instance.clone(),
                items: items.clone(),
            },
        );
        let history = g.histories.get(&instance).cloned().unwrap_or_default();
        Ok(Some(OrchestrationItem {
            instance,
            history,
            messages: items,
            lock_token,
        }))
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        snapshot: Option<StatusSnapshot>,
    ) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().unwrap();
        let batch = g
            .orch_locked
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("ack_orchestration_item", "unknown lock token"))?;
        let check = {
            let history = g.histories.get(&batch.instance).map(Vec::as_slice).unwrap_or(&[]);
            check_contiguous(history, &history_delta)
        };
        if let Err(msg) = check {
            // Put the lock back; the caller decides whether to abandon.
            g.orch_locked.insert(lock_token.to_string(), batch);
            return Err(ProviderError::permanent("ack_orchestration_item", msg));
        }
        g.histories
            .entry(batch.instance.clone())
            .or_default()
            .extend(history_delta);
        if let Some(s) = snapshot {
            g.snapshots.insert(batch.instance.clone(), s);
        }
        for item in worker_items {
            let queue = match &item {
                WorkItem::ActivityExecute { queue, .. } => queue.clone(),
                other => {
                    return Err(ProviderError::permanent(
                        "ack_orchestration_item",
                        format!("not a worker item: {other:?}"),
                    ))
                }
            };
            g.worker_qs.entry(queue).or_default().push_back(item);
        }
        for item in timer_items {
            g.timer_q.push_back(item);
        }
        for item in orchestrator_items {
            g.orch_q.push_back(item);
        }
        g.locked_instances.remove(&batch.instance);
        Ok(())
    }

    async fn abandon_orchestration_item(&self, lock_token: &str) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().unwrap();
        let batch = g
            .orch_locked
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("abandon_orchestration_item", "unknown lock token"))?;
        for item in batch.items.into_iter().rev() {
            g.orch_q.push_front(item);
        }
        g.locked_instances.remove(&batch.instance);
        Ok(())
    }

    async fn enqueue_orchestrator_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().unwrap();
        if g.orch_q.len() >= QUEUE_CAP {
            return Err(ProviderError::retryable("enqueue_orchestrator_work", "queue full"));
        }
        g.orch_q.push_back(item);
        Ok(())
    }

    async fn dequeue_worker_peek_lock(
        &self,
        queue: &str,
    ) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut g = self.inner.lock().unwrap();
        let Some(item) = g.worker_qs.get_mut(queue).and_then(|q| q.pop_front()) else {
            return Ok(None);
        };
        let token = new_token();
        g.worker_locked.insert(token.clone(), (queue.to_string(), item.clone()));
        Ok(Some((item, token)))
    }

    async fn ack_worker_item(&self, lock_token: &str, completion: WorkItem) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().unwrap();
        g.worker_locked
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("ack_worker_item", "unknown lock token"))?;
        g.orch_q.push_back(completion);
        Ok(())
    }

    async fn abandon_worker_item(&self, lock_token: &str) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().unwrap();
        let (queue, item) = g
            .worker_locked
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("abandon_worker_item", "unknown lock token"))?;
        g.worker_qs.entry(queue).or_default().push_front(item);
        Ok(())
    }

    async fn dequeue_timer_peek_lock(&self) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut g = self.inner.lock().unwrap();
        let Some(item) = g.timer_q.pop_front() else {
            return Ok(None);
        };
        let token = new_token();
        g.timer_locked.insert(token.clone(), item.clone());
        Ok(Some((item, token)))
    }

    async fn ack_timer_item(&self, lock_token: &str, fired: WorkItem) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().unwrap();
        g.timer_locked
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("ack_timer_item", "unknown lock token"))?;
        g.orch_q.push_back(fired);
        Ok(())
    }

    async fn abandon_timer_item(&self, lock_token: &str) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().unwrap();
        let item = g
            .timer_locked
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("abandon_timer_item", "unknown lock token"))?;
        g.timer_q.push_front(item);
        Ok(())
    }

    async fn read_snapshot(&self, instance: &str) -> Result<Option<StatusSnapshot>, ProviderError> {
        let g = self.inner.lock().unwrap();
        Ok(g.snapshots.get(instance).cloned())
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let g = self.inner.lock().unwrap();
        let mut out: Vec<String> = g.histories.keys().cloned().collect();
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;

    fn signal(instance: &str, payload: &str) -> WorkItem {
        WorkItem::SignalRaised {
            instance: instance.to_string(),
            name: "ping".to_string(),
            payload: payload.to_string(),
        }
    }

    #[tokio::test]
    async fn fetch_batches_all_messages_for_one_instance() {
        let p = InMemoryProvider::new();
        p.enqueue_orchestrator_work(signal("a", "1")).await.unwrap();
        p.enqueue_orchestrator_work(signal("b", "x")).await.unwrap();
        p.enqueue_orchestrator_work(signal("a", "2")).await.unwrap();

        let item = p.fetch_orchestration_item().await.unwrap().unwrap();
        assert_eq!(item.instance, "a");
        assert_eq!(item.messages.len(), 2);

        // "a" is locked; the next fetch must hand out "b", not more of "a".
        let other = p.fetch_orchestration_item().await.unwrap().unwrap();
        assert_eq!(other.instance, "b");
    }

    #[tokio::test]
    async fn abandon_restores_batch_in_order() {
        let p = InMemoryProvider::new();
        p.enqueue_orchestrator_work(signal("a", "1")).await.unwrap();
        p.enqueue_orchestrator_work(signal("a", "2")).await.unwrap();

        let item = p.fetch_orchestration_item().await.unwrap().unwrap();
        assert!(p.fetch_orchestration_item().await.unwrap().is_none());
        p.abandon_orchestration_item(&item.lock_token).await.unwrap();

        let again = p.fetch_orchestration_item().await.unwrap().unwrap();
        assert_eq!(again.messages, item.messages);
    }

    #[tokio::test]
    async fn ack_rejects_seq_gap() {
        let p = InMemoryProvider::new();
        p.enqueue_orchestrator_work(signal("a", "1")).await.unwrap();
        let item = p.fetch_orchestration_item().await.unwrap().unwrap();
        let bad = vec![Event {
            seq: 5,
            ts_ms: 0,
            kind: EventKind::SignalReceived {
                name: "ping".into(),
                payload: "1".into(),
            },
        }];
        let err = p
            .ack_orchestration_item(&item.lock_token, bad, vec![], vec![], vec![], None)
            .await
            .unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("seq gap"));
    }

    #[tokio::test]
    async fn worker_ack_routes_completion_to_orchestrator() {
        let p = InMemoryProvider::new();
        p.enqueue_orchestrator_work(signal("a", "1")).await.unwrap();
        let item = p.fetch_orchestration_item().await.unwrap().unwrap();
        let delta = vec![Event {
            seq: 1,
            ts_ms: 0,
            kind: EventKind::SignalReceived {
                name: "ping".into(),
                payload: "1".into(),
            },
        }];
        let work = WorkItem::ActivityExecute {
            instance: "a".into(),
            source: 2,
            name: "Step".into(),
            input: String::new(),
            queue: "q1".into(),
            timeout_ms: 1_000,
            policy: Default::default(),
            idempotency_key: None,
        };
        p.ack_orchestration_item(&item.lock_token, delta, vec![work], vec![], vec![], None)
            .await
            .unwrap();

        assert!(p.dequeue_worker_peek_lock("other").await.unwrap().is_none());
        let (got, token) = p.dequeue_worker_peek_lock("q1").await.unwrap().unwrap();
        assert!(matches!(got, WorkItem::ActivityExecute { ref name, .. } if name == "Step"));
        p.ack_worker_item(
            &token,
            WorkItem::ActivityCompleted {
                instance: "a".into(),
                source: 2,
                result: "ok".into(),
            },
        )
        .await
        .unwrap();

        let next = p.fetch_orchestration_item().await.unwrap().unwrap();
        assert!(matches!(next.messages[0], WorkItem::ActivityCompleted { .. }));
    }
}
