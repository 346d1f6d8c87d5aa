//! Runtime host: spawns the orchestration dispatchers, the per-queue
//! activity workers, and the timer service over a shared provider.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::info;

pub(crate) mod dispatchers;
pub(crate) mod execution;
pub mod registry;
pub mod status;
pub(crate) mod timers;
pub(crate) mod turn;

use crate::providers::Provider;
use registry::{ActivityRegistry, WorkflowRegistry};

#[derive(Clone, Debug)]
pub struct RuntimeOptions {
    /// Sleep between polls when a queue is empty.
    pub dispatcher_idle_sleep_ms: u64,
    /// Concurrent orchestration dispatchers. More than one is safe: the
    /// provider locks per instance.
    pub orchestration_concurrency: usize,
    /// Workers per activity queue.
    pub worker_concurrency: usize,
    /// Activity queues to poll.
    pub worker_queues: Vec<String>,
    /// Attempts before an orchestration ack is abandoned.
    pub ack_max_attempts: u32,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep_ms: 10,
            orchestration_concurrency: 2,
            worker_concurrency: 2,
            worker_queues: vec!["default".to_string()],
            ack_max_attempts: 5,
        }
    }
}

pub struct Runtime {
    store: Arc<dyn Provider>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    pub async fn start_with_store(
        store: Arc<dyn Provider>,
        activities: ActivityRegistry,
        workflows: WorkflowRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(store, activities, workflows, RuntimeOptions::default()).await
    }

    pub async fn start_with_options(
        store: Arc<dyn Provider>,
        activities: ActivityRegistry,
        workflows: WorkflowRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .try_init();

        let mut handles = Vec::new();
        for _ in 0..options.orchestration_concurrency.max(1) {
            handles.push(tokio::spawn(dispatchers::orchestration::run_orchestration_dispatcher(
                store.clone(),
                workflows.clone(),
                options.clone(),
            )));
        }
        for queue in &options.worker_queues {
            for _ in 0..options.worker_concurrency.max(1) {
                handles.push(tokio::spawn(dispatchers::worker::run_worker_dispatcher(
                    store.clone(),
                    activities.clone(),
                    queue.clone(),
                    options.clone(),
                )));
            }
        }
        handles.push(tokio::spawn(timers::run_timer_service(store.clone(), options.clone())));

        info!(
            target: "ordex::runtime",
            queues = ?options.worker_queues,
            workers_per_queue = options.worker_concurrency,
            "runtime started"
        );
        Arc::new(Self {
            store,
            handles: Mutex::new(handles),
        })
    }

    pub fn store(&self) -> Arc<dyn Provider> {
        self.store.clone()
    }

    /// Stop all dispatchers. In-flight peek-locked work is recovered by the
    /// provider on the next start.
    pub fn shutdown(&self) {
        for handle in self.handles.lock().unwrap().drain(..) {
            handle.abort();
        }
        info!(target: "ordex::runtime", "runtime stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        for handle in self.handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}
