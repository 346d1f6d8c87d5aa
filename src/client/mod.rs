//! Thin control-plane client. Everything goes through the shared provider:
//! starts, signals, and cancels are enqueue-only, and status queries read
//! the last persisted snapshot without touching queues or histories.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::codec;
use crate::error::{ClientError, WaitError};
use crate::providers::{Provider, WorkItem};
use crate::runtime::status::StatusSnapshot;

pub struct Client {
    store: Arc<dyn Provider>,
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Pin to an exact registered version; `None` uses the registry policy.
    pub version: Option<String>,
    /// Execution budget in ms; exceeding it fails the instance with
    /// `DEADLINE_EXCEEDED`.
    pub deadline_ms: Option<u64>,
}

/// Outcome of delivering a signal or cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAck {
    Delivered,
    /// The instance already reached a terminal state; the signal was
    /// accepted and dropped.
    DroppedTerminal,
}

impl Client {
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self { store }
    }

    pub async fn start(
        &self,
        instance: &str,
        workflow: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.start_with_options(instance, workflow, input, StartOptions::default())
            .await
    }

    pub async fn start_with_options(
        &self,
        instance: &str,
        workflow: &str,
        input: impl Into<String>,
        opts: StartOptions,
    ) -> Result<(), ClientError> {
        let item = WorkItem::StartWorkflow {
            instance: instance.to_string(),
            workflow: workflow.to_string(),
            version: opts.version,
            input: input.into(),
            parent: None,
            deadline_ms: opts.deadline_ms,
        };
        self.store.enqueue_orchestrator_work(item).await?;
        Ok(())
    }

    pub async fn start_typed<In: Serialize>(
        &self,
        instance: &str,
        workflow: &str,
        input: &In,
        opts: StartOptions,
    ) -> Result<(), ClientError> {
        let payload = codec::encode(input).map_err(ClientError::Encode)?;
        self.start_with_options(instance, workflow, payload, opts).await
    }

    /// Deliver a signal. Signals for terminal instances are a no-op by
    /// design and reported as such, never as an error.
    pub async fn signal(
        &self,
        instance: &str,
        name: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<SignalAck, ClientError> {
        if self.is_terminal(instance).await? {
            return Ok(SignalAck::DroppedTerminal);
        }
        let item = WorkItem::SignalRaised {
            instance: instance.to_string(),
            name: name.into(),
            payload: payload.into(),
        };
        self.store.enqueue_orchestrator_work(item).await?;
        Ok(SignalAck::Delivered)
    }

    /// Request cooperative cancellation. The workflow observes it at its
    /// next cancellation boundary; completed work is never rolled back and
    /// in-flight work runs to its recorded completion first.
    pub async fn cancel(
        &self,
        instance: &str,
        reason: impl Into<String>,
    ) -> Result<SignalAck, ClientError> {
        self.signal(instance, "cancel", reason).await
    }

    /// Pure read of the last persisted projection; safe to call while the
    /// instance is mid-turn.
    pub async fn query_status(&self, instance: &str) -> Result<Option<StatusSnapshot>, ClientError> {
        Ok(self.store.read_snapshot(instance).await?)
    }

    pub async fn list_instances(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.store.list_instances().await?)
    }

    /// Poll until the instance reaches a terminal status.
    pub async fn wait_for_terminal(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<StatusSnapshot, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.store.read_snapshot(instance).await {
                Ok(Some(s)) if s.status.is_terminal() => return Ok(s),
                Ok(_) => {}
                Err(e) => return Err(WaitError::Other(e.to_string())),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn is_terminal(&self, instance: &str) -> Result<bool, ClientError> {
        Ok(self
            .store
            .read_snapshot(instance)
            .await?
            .map(|s| s.status.is_terminal())
            .unwrap_or(false))
    }
}
