//! Orchestration dispatcher: fetch a locked batch, run the turn, repeat.
//! Safe to run concurrently; the provider's per-instance lock guarantees at
//! most one in-flight turn per instance.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::providers::Provider;
use crate::runtime::execution::process_orchestration_item;
use crate::runtime::registry::WorkflowRegistry;
use crate::runtime::RuntimeOptions;

pub(crate) async fn run_orchestration_dispatcher(
    store: Arc<dyn Provider>,
    workflows: WorkflowRegistry,
    options: RuntimeOptions,
) {
    let idle = Duration::from_millis(options.dispatcher_idle_sleep_ms);
    loop {
        match store.fetch_orchestration_item().await {
            Ok(Some(item)) => {
                process_orchestration_item(&store, &workflows, &options, item).await;
            }
            Ok(None) => tokio::time::sleep(idle).await,
            Err(e) => {
                warn!(target: "ordex::runtime", error = %e, "orchestrator fetch failed");
                tokio::time::sleep(idle).await;
            }
        }
    }
}
