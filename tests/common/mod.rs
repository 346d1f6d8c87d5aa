//! Shared harness for the fulfillment integration tests: an in-process
//! runtime over a fresh provider, with the in-memory store and carrier stub
//! exposed for inspection.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ordex::providers::{InMemoryProvider, Provider};
use ordex::runtime::{Runtime, RuntimeOptions};
use ordex::workflows::activities::{InMemoryFulfillmentStore, OrderItem, StubCarrier};
use ordex::workflows::config::FulfillmentConfig;
use ordex::workflows::order::OrderInput;
use ordex::workflows::{fulfillment_queues, fulfillment_registries, FulfillmentClient};

pub const TERMINAL_WAIT: Duration = Duration::from_secs(10);

pub struct TestEnv {
    pub runtime: Arc<Runtime>,
    pub client: FulfillmentClient,
    pub provider: Arc<dyn Provider>,
    pub store: Arc<InMemoryFulfillmentStore>,
    pub carrier: Arc<StubCarrier>,
}

/// Production defaults scaled down so tests finish in milliseconds.
pub fn fast_config() -> FulfillmentConfig {
    FulfillmentConfig {
        review_delay_ms: 50,
        ship_retry_backoff_ms: 10,
        receive_timeout_ms: 1_000,
        validate_timeout_ms: 1_000,
        payment_timeout_ms: 1_000,
        shipping_timeout_ms: 1_000,
        instance_deadline_ms: 8_000,
        ..FulfillmentConfig::default()
    }
}

pub async fn start_env(cfg: &FulfillmentConfig, carrier_failures: u32) -> TestEnv {
    let provider: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    start_env_with_provider(provider, cfg, carrier_failures).await
}

pub async fn start_env_with_provider(
    provider: Arc<dyn Provider>,
    cfg: &FulfillmentConfig,
    carrier_failures: u32,
) -> TestEnv {
    let store = Arc::new(InMemoryFulfillmentStore::new());
    let carrier = Arc::new(StubCarrier::failing(carrier_failures));
    let (activities, workflows) = fulfillment_registries(store.clone(), carrier.clone());
    let options = RuntimeOptions {
        worker_queues: fulfillment_queues(cfg),
        dispatcher_idle_sleep_ms: 5,
        ..RuntimeOptions::default()
    };
    let runtime = Runtime::start_with_options(provider.clone(), activities, workflows, options).await;
    let client = FulfillmentClient::new(provider.clone());
    TestEnv {
        runtime,
        client,
        provider,
        store,
        carrier,
    }
}

pub fn sample_order(order_id: &str, cfg: &FulfillmentConfig) -> OrderInput {
    OrderInput {
        order_id: order_id.to_string(),
        customer_id: "cust-1".to_string(),
        items: vec![
            OrderItem {
                sku: "SKU-RED".to_string(),
                quantity: 2,
                price_cents: 1_250,
            },
            OrderItem {
                sku: "SKU-BLUE".to_string(),
                quantity: 1,
                price_cents: 4_000,
            },
        ],
        payment_id: format!("pay-{order_id}"),
        address: "42 Harbor Way".to_string(),
        config: cfg.clone(),
    }
}

/// Parse the snapshot's detail projection.
pub fn detail_json(snapshot: &ordex::runtime::status::StatusSnapshot) -> serde_json::Value {
    serde_json::from_str(snapshot.detail.as_deref().unwrap_or("{}")).unwrap()
}
