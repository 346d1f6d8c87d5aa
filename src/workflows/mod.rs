//! Order fulfillment built on the durable engine: the parent
//! [`order::order_workflow`], its [`shipping::shipping_workflow`] children,
//! the activities they schedule, and a thin client facade for operators.

pub mod activities;
pub mod config;
pub mod order;
pub mod shipping;

use std::sync::Arc;

use crate::client::{Client, SignalAck, StartOptions};
use crate::error::ClientError;
use crate::providers::Provider;
use crate::runtime::registry::{ActivityRegistry, WorkflowRegistry};
use crate::runtime::status::StatusSnapshot;

use activities::{CarrierGateway, FulfillmentStore};
use config::FulfillmentConfig;
use order::OrderInput;

/// Registries for a fulfillment worker: both workflows with their status
/// projectors, and the five activities bound to the given collaborators.
pub fn fulfillment_registries(
    store: Arc<dyn FulfillmentStore>,
    carrier: Arc<dyn CarrierGateway>,
) -> (ActivityRegistry, WorkflowRegistry) {
    let workflows = WorkflowRegistry::builder()
        .register_projected(order::ORDER_WORKFLOW, order::order_workflow, order::project_order)
        .register_projected(
            shipping::SHIPPING_WORKFLOW,
            shipping::shipping_workflow,
            shipping::project_shipping,
        )
        .build();
    (activities::fulfillment_activities(store, carrier), workflows)
}

/// Operator-facing surface over the generic [`Client`]: starts orders and
/// speaks the fulfillment signal vocabulary.
pub struct FulfillmentClient {
    client: Client,
}

impl FulfillmentClient {
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self {
            client: Client::new(store),
        }
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Start an order instance. Returns the instance id, generated when the
    /// caller does not supply one. The whole order runs under the configured
    /// execution deadline.
    pub async fn start_order(
        &self,
        instance: Option<&str>,
        input: &OrderInput,
    ) -> Result<String, ClientError> {
        let instance = instance
            .map(str::to_string)
            .unwrap_or_else(|| format!("order-{}", uuid::Uuid::new_v4()));
        let opts = StartOptions {
            version: None,
            deadline_ms: Some(input.config.instance_deadline_ms),
        };
        self.client
            .start_typed(&instance, order::ORDER_WORKFLOW, input, opts)
            .await?;
        Ok(instance)
    }

    /// Approve the manual review, ending the review window early.
    pub async fn approve(&self, instance: &str, operator: &str) -> Result<SignalAck, ClientError> {
        self.client.signal(instance, "approve", operator).await
    }

    /// Update the shipping address. Applies to shipping attempts that have
    /// not started yet.
    pub async fn update_address(&self, instance: &str, address: &str) -> Result<SignalAck, ClientError> {
        self.client.signal(instance, "update_address", address).await
    }

    pub async fn cancel_order(&self, instance: &str, reason: &str) -> Result<SignalAck, ClientError> {
        self.client.cancel(instance, reason).await
    }

    pub async fn order_status(&self, instance: &str) -> Result<Option<StatusSnapshot>, ClientError> {
        self.client.query_status(instance).await
    }
}

/// Queues a fulfillment runtime must poll for the given config.
pub fn fulfillment_queues(cfg: &FulfillmentConfig) -> Vec<String> {
    vec![cfg.order_queue.clone(), cfg.shipping_queue.clone()]
}
