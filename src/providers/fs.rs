//! Filesystem provider: one directory per instance holding a JSONL history
//! and the latest snapshot, plus JSONL queue files. Queue consumption writes
//! a lock sidecar under `.locks/`; a process that dies mid-item leaves the
//! sidecar behind, and the next open re-queues the locked work. Combined
//! with history-level dedup in the orchestrator this yields at-least-once
//! delivery with exactly-once recording.

use std::collections::HashSet;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::providers::{check_contiguous, OrchestrationItem, Provider, ProviderError, WorkItem};
use crate::runtime::status::StatusSnapshot;
use crate::Event;

pub struct FsProvider {
    root: PathBuf,
    // Serializes compound read-modify-write operations across tasks.
    guard: Mutex<()>,
}

#[derive(Serialize, Deserialize)]
struct OrchLock {
    instance: String,
    items: Vec<WorkItem>,
}

#[derive(Serialize, Deserialize)]
struct WorkerLock {
    queue: String,
    item: WorkItem,
}

#[derive(Serialize, Deserialize)]
struct TimerLock {
    item: WorkItem,
}

#[derive(Serialize, Deserialize)]
struct InstanceMeta {
    instance: String,
}

/// Filesystem-safe directory name. `_` escapes the byte's hex, so distinct
/// instance names (`a::b` vs `a__b`) never collide onto one directory and
/// the mapping stays stable across restarts.
fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' => out.push(b as char),
            other => {
                out.push('_');
                out.push_str(&format!("{other:02x}"));
            }
        }
    }
    out
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, ProviderError> {
    let data = match fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ProviderError::io("read_jsonl", e)),
    };
    data.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| ProviderError::codec("read_jsonl", e)))
        .collect()
}

/// Full rewrite via tmp file + rename so readers never see a torn file.
fn write_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<(), ProviderError> {
    let tmp = path.with_extension("tmp");
    let mut buf = String::new();
    for item in items {
        buf.push_str(&serde_json::to_string(item).map_err(|e| ProviderError::codec("write_jsonl", e))?);
        buf.push('\n');
    }
    fs::write(&tmp, buf).map_err(|e| ProviderError::io("write_jsonl", e))?;
    fs::rename(&tmp, path).map_err(|e| ProviderError::io("write_jsonl", e))
}

fn append_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<(), ProviderError> {
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| ProviderError::io("append_jsonl", e))?;
    for item in items {
        let line = serde_json::to_string(item).map_err(|e| ProviderError::codec("append_jsonl", e))?;
        writeln!(f, "{line}").map_err(|e| ProviderError::io("append_jsonl", e))?;
    }
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ProviderError> {
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_string_pretty(value).map_err(|e| ProviderError::codec("write_json", e))?;
    fs::write(&tmp, data).map_err(|e| ProviderError::io("write_json", e))?;
    fs::rename(&tmp, path).map_err(|e| ProviderError::io("write_json", e))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ProviderError> {
    let data = match fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ProviderError::io("read_json", e)),
    };
    serde_json::from_str(&data)
        .map(Some)
        .map_err(|e| ProviderError::codec("read_json", e))
}

impl FsProvider {
    /// Open (or create) a store rooted at `root`, re-queuing any work left
    /// locked by a previous process.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ProviderError> {
        let root = root.into();
        for sub in ["instances", "queues", ".locks/orch", ".locks/worker", ".locks/timer"] {
            fs::create_dir_all(root.join(sub)).map_err(|e| ProviderError::io("open", e))?;
        }
        let p = Self {
            root,
            guard: Mutex::new(()),
        };
        p.recover_stale_locks()?;
        Ok(p)
    }

    fn orch_queue_path(&self) -> PathBuf {
        self.root.join("queues/orchestrator.jsonl")
    }

    fn worker_queue_path(&self, queue: &str) -> PathBuf {
        self.root.join(format!("queues/worker-{}.jsonl", sanitize(queue)))
    }

    fn timer_queue_path(&self) -> PathBuf {
        self.root.join("queues/timer.jsonl")
    }

    fn lock_path(&self, kind: &str, token: &str) -> PathBuf {
        self.root.join(format!(".locks/{kind}/{token}.json"))
    }

    fn instance_dir(&self, instance: &str) -> PathBuf {
        self.root.join("instances").join(sanitize(instance))
    }

    fn recover_stale_locks(&self) -> Result<(), ProviderError> {
        for entry in fs::read_dir(self.root.join(".locks/orch")).map_err(|e| ProviderError::io("recover", e))? {
            let path = entry.map_err(|e| ProviderError::io("recover", e))?.path();
            if let Some(lock) = read_json::<OrchLock>(&path)? {
                let mut q: Vec<WorkItem> = read_jsonl(&self.orch_queue_path())?;
                let mut restored = lock.items;
                restored.extend(q.drain(..));
                write_jsonl(&self.orch_queue_path(), &restored)?;
            }
            fs::remove_file(&path).map_err(|e| ProviderError::io("recover", e))?;
        }
        for entry in fs::read_dir(self.root.join(".locks/worker")).map_err(|e| ProviderError::io("recover", e))? {
            let path = entry.map_err(|e| ProviderError::io("recover", e))?.path();
            if let Some(lock) = read_json::<WorkerLock>(&path)? {
                let queue_path = self.worker_queue_path(&lock.queue);
                let mut q: Vec<WorkItem> = read_jsonl(&queue_path)?;
                q.insert(0, lock.item);
                write_jsonl(&queue_path, &q)?;
            }
            fs::remove_file(&path).map_err(|e| ProviderError::io("recover", e))?;
        }
        for entry in fs::read_dir(self.root.join(".locks/timer")).map_err(|e| ProviderError::io("recover", e))? {
            let path = entry.map_err(|e| ProviderError::io("recover", e))?.path();
            if let Some(lock) = read_json::<TimerLock>(&path)? {
                let mut q: Vec<WorkItem> = read_jsonl(&self.timer_queue_path())?;
                q.insert(0, lock.item);
                write_jsonl(&self.timer_queue_path(), &q)?;
            }
            fs::remove_file(&path).map_err(|e| ProviderError::io("recover", e))?;
        }
        Ok(())
    }

    fn locked_orch_instances(&self) -> Result<HashSet<String>, ProviderError> {
        let mut out = HashSet::new();
        for entry in fs::read_dir(self.root.join(".locks/orch")).map_err(|e| ProviderError::io("locks", e))? {
            let path = entry.map_err(|e| ProviderError::io("locks", e))?.path();
            if let Some(lock) = read_json::<OrchLock>(&path)? {
                out.insert(lock.instance);
            }
        }
        Ok(out)
    }

    fn read_history_sync(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        read_jsonl(&self.instance_dir(instance).join("history.jsonl"))
    }
}

#[async_trait]
impl Provider for FsProvider {
    async fn read_history(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let _g = self.guard.lock().unwrap();
        self.read_history_sync(instance)
    }

    async fn fetch_orchestration_item(&self) -> Result<Option<OrchestrationItem>, ProviderError> {
        let _g = self.guard.lock().unwrap();
        let q: Vec<WorkItem> = read_jsonl(&self.orch_queue_path())?;
        let locked = self.locked_orch_instances()?;
        let Some(instance) = q
            .iter()
            .find(|it| !locked.contains(it.instance()))
            .map(|it| it.instance().to_string())
        else {
            return Ok(None);
        };
        let (mine, rest): (Vec<WorkItem>, Vec<WorkItem>) =
            q.into_iter().partition(|it| it.instance() == instance);
        write_jsonl(&self.orch_queue_path(), &rest)?;
        let lock_token = uuid::Uuid::new_v4().to_string();
        write_json(
            &self.lock_path("orch", &lock_token),
            &OrchLock {
                instance: instance.clone(),
                items: mine.clone(),
            },
        )?;
        let history = self.read_history_sync(&instance)?;
        Ok(Some(OrchestrationItem {
            instance,
            history,
            messages: mine,
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
        let _g = self.guard.lock().unwrap();
        let lock_path = self.lock_path("orch", lock_token);
        let Some(lock) = read_json::<OrchLock>(&lock_path)? else {
            return Err(ProviderError::permanent("ack_orchestration_item", "unknown lock token"));
        };
        let history = self.read_history_sync(&lock.instance)?;
        check_contiguous(&history, &history_delta)
            .map_err(|msg| ProviderError::permanent("ack_orchestration_item", msg))?;

        let dir = self.instance_dir(&lock.instance);
        fs::create_dir_all(&dir).map_err(|e| ProviderError::io("ack_orchestration_item", e))?;
        let meta_path = dir.join("meta.json");
        if !meta_path.exists() {
            write_json(
                &meta_path,
                &InstanceMeta {
                    instance: lock.instance.clone(),
                },
            )?;
        }
        append_jsonl(&dir.join("history.jsonl"), &history_delta)?;
        if let Some(s) = &snapshot {
            write_json(&dir.join("snapshot.json"), s)?;
        }
        for item in &worker_items {
            let queue = match item {
                WorkItem::ActivityExecute { queue, .. } => queue.clone(),
                other => {
                    return Err(ProviderError::permanent(
                        "ack_orchestration_item",
                        format!("not a worker item: {other:?}"),
                    ))
                }
            };
            append_jsonl(&self.worker_queue_path(&queue), std::slice::from_ref(item))?;
        }
        if !timer_items.is_empty() {
            append_jsonl(&self.timer_queue_path(), &timer_items)?;
        }
        if !orchestrator_items.is_empty() {
            append_jsonl(&self.orch_queue_path(), &orchestrator_items)?;
        }
        fs::remove_file(&lock_path).map_err(|e| ProviderError::io("ack_orchestration_item", e))?;
        Ok(())
    }

    async fn abandon_orchestration_item(&self, lock_token: &str) -> Result<(), ProviderError> {
        let _g = self.guard.lock().unwrap();
        let lock_path = self.lock_path("orch", lock_token);
        let Some(lock) = read_json::<OrchLock>(&lock_path)? else {
            return Err(ProviderError::permanent("abandon_orchestration_item", "unknown lock token"));
        };
        let mut q: Vec<WorkItem> = read_jsonl(&self.orch_queue_path())?;
        let mut restored = lock.items;
        restored.extend(q.drain(..));
        write_jsonl(&self.orch_queue_path(), &restored)?;
        fs::remove_file(&lock_path).map_err(|e| ProviderError::io("abandon_orchestration_item", e))?;
        Ok(())
    }

    async fn enqueue_orchestrator_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        let _g = self.guard.lock().unwrap();
        append_jsonl(&self.orch_queue_path(), std::slice::from_ref(&item))
    }

    async fn dequeue_worker_peek_lock(
        &self,
        queue: &str,
    ) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let _g = self.guard.lock().unwrap();
        let path = self.worker_queue_path(queue);
        let mut q: Vec<WorkItem> = read_jsonl(&path)?;
        if q.is_empty() {
            return Ok(None);
        }
        let item = q.remove(0);
        write_jsonl(&path, &q)?;
        let token = uuid::Uuid::new_v4().to_string();
        write_json(
            &self.lock_path("worker", &token),
            &WorkerLock {
                queue: queue.to_string(),
                item: item.clone(),
            },
        )?;
        Ok(Some((item, token)))
    }

    async fn ack_worker_item(&self, lock_token: &str, completion: WorkItem) -> Result<(), ProviderError> {
        let _g = self.guard.lock().unwrap();
        let lock_path = self.lock_path("worker", lock_token);
        if read_json::<WorkerLock>(&lock_path)?.is_none() {
            return Err(ProviderError::permanent("ack_worker_item", "unknown lock token"));
        }
        append_jsonl(&self.orch_queue_path(), std::slice::from_ref(&completion))?;
        fs::remove_file(&lock_path).map_err(|e| ProviderError::io("ack_worker_item", e))?;
        Ok(())
    }

    async fn abandon_worker_item(&self, lock_token: &str) -> Result<(), ProviderError> {
        let _g = self.guard.lock().unwrap();
        let lock_path = self.lock_path("worker", lock_token);
        let Some(lock) = read_json::<WorkerLock>(&lock_path)? else {
            return Err(ProviderError::permanent("abandon_worker_item", "unknown lock token"));
        };
        let path = self.worker_queue_path(&lock.queue);
        let mut q: Vec<WorkItem> = read_jsonl(&path)?;
        q.insert(0, lock.item);
        write_jsonl(&path, &q)?;
        fs::remove_file(&lock_path).map_err(|e| ProviderError::io("abandon_worker_item", e))?;
        Ok(())
    }

    async fn dequeue_timer_peek_lock(&self) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let _g = self.guard.lock().unwrap();
        let path = self.timer_queue_path();
        let mut q: Vec<WorkItem> = read_jsonl(&path)?;
        if q.is_empty() {
            return Ok(None);
        }
        let item = q.remove(0);
        write_jsonl(&path, &q)?;
        let token = uuid::Uuid::new_v4().to_string();
        write_json(&self.lock_path("timer", &token), &TimerLock { item: item.clone() })?;
        Ok(Some((item, token)))
    }

    async fn ack_timer_item(&self, lock_token: &str, fired: WorkItem) -> Result<(), ProviderError> {
        let _g = self.guard.lock().unwrap();
        let lock_path = self.lock_path("timer", lock_token);
        if read_json::<TimerLock>(&lock_path)?.is_none() {
            return Err(ProviderError::permanent("ack_timer_item", "unknown lock token"));
        }
        append_jsonl(&self.orch_queue_path(), std::slice::from_ref(&fired))?;
        fs::remove_file(&lock_path).map_err(|e| ProviderError::io("ack_timer_item", e))?;
        Ok(())
    }

    async fn abandon_timer_item(&self, lock_token: &str) -> Result<(), ProviderError> {
        let _g = self.guard.lock().unwrap();
        let lock_path = self.lock_path("timer", lock_token);
        let Some(lock) = read_json::<TimerLock>(&lock_path)? else {
            return Err(ProviderError::permanent("abandon_timer_item", "unknown lock token"));
        };
        let path = self.timer_queue_path();
        let mut q: Vec<WorkItem> = read_jsonl(&path)?;
        q.insert(0, lock.item);
        write_jsonl(&path, &q)?;
        fs::remove_file(&lock_path).map_err(|e| ProviderError::io("abandon_timer_item", e))?;
        Ok(())
    }

    async fn read_snapshot(&self, instance: &str) -> Result<Option<StatusSnapshot>, ProviderError> {
        let _g = self.guard.lock().unwrap();
        read_json(&self.instance_dir(instance).join("snapshot.json"))
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let _g = self.guard.lock().unwrap();
        let mut out = Vec::new();
        for entry in fs::read_dir(self.root.join("instances")).map_err(|e| ProviderError::io("list_instances", e))? {
            let path = entry.map_err(|e| ProviderError::io("list_instances", e))?.path();
            if let Some(meta) = read_json::<InstanceMeta>(&path.join("meta.json"))? {
                out.push(meta.instance);
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(instance: &str, payload: &str) -> WorkItem {
        WorkItem::SignalRaised {
            instance: instance.to_string(),
            name: "ping".to_string(),
            payload: payload.to_string(),
        }
    }

    #[tokio::test]
    async fn reopen_requeues_locked_work() {
        let dir = tempfile::tempdir().unwrap();
        {
            let p = FsProvider::open(dir.path()).unwrap();
            p.enqueue_orchestrator_work(signal("a", "1")).await.unwrap();
            let item = p.fetch_orchestration_item().await.unwrap().unwrap();
            assert_eq!(item.messages.len(), 1);
            // Simulated crash: the lock sidecar is left behind.
        }
        let p = FsProvider::open(dir.path()).unwrap();
        let item = p.fetch_orchestration_item().await.unwrap().unwrap();
        assert_eq!(item.instance, "a");
        assert_eq!(item.messages, vec![signal("a", "1")]);
    }

    #[tokio::test]
    async fn history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let delta = vec![Event {
            seq: 1,
            ts_ms: 7,
            kind: crate::EventKind::SignalReceived {
                name: "ping".into(),
                payload: "1".into(),
            },
        }];
        {
            let p = FsProvider::open(dir.path()).unwrap();
            p.enqueue_orchestrator_work(signal("a", "1")).await.unwrap();
            let item = p.fetch_orchestration_item().await.unwrap().unwrap();
            p.ack_orchestration_item(&item.lock_token, delta.clone(), vec![], vec![], vec![], None)
                .await
                .unwrap();
        }
        let p = FsProvider::open(dir.path()).unwrap();
        assert_eq!(p.read_history("a").await.unwrap(), delta);
        assert_eq!(p.list_instances().await.unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn instance_names_with_separators_get_distinct_dirs() {
        // "a::b" and "a__b" must not share storage.
        assert_ne!(sanitize("a::b"), sanitize("a__b"));

        let dir = tempfile::tempdir().unwrap();
        let p = FsProvider::open(dir.path()).unwrap();
        for inst in ["order-1", "order-1::ship-1", "a::b", "a__b"] {
            p.enqueue_orchestrator_work(signal(inst, "x")).await.unwrap();
            let item = p.fetch_orchestration_item().await.unwrap().unwrap();
            let delta = vec![Event {
                seq: 1,
                ts_ms: 0,
                kind: crate::EventKind::SignalReceived {
                    name: "ping".into(),
                    payload: "x".into(),
                },
            }];
            p.ack_orchestration_item(&item.lock_token, delta, vec![], vec![], vec![], None)
                .await
                .unwrap();
        }
        let mut listed = p.list_instances().await.unwrap();
        listed.sort();
        assert_eq!(
            listed,
            vec![
                "a::b".to_string(),
                "a__b".to_string(),
                "order-1".to_string(),
                "order-1::ship-1".to_string(),
            ]
        );
    }
}
