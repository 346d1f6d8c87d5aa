//! Fulfillment activities. Business records live behind [`FulfillmentStore`]
//! (an idempotent key-value/append-log collaborator) and the carrier behind
//! [`CarrierGateway`]; the activities themselves stay thin and replay-safe:
//! all their effects are idempotent upserts keyed by ids carried in the
//! workflow input, so a retried attempt never double-applies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ActivityError;
use crate::runtime::registry::ActivityRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub sku: String,
    pub quantity: u32,
    pub price_cents: u64,
}

#[async_trait]
pub trait FulfillmentStore: Send + Sync {
    /// Insert-or-replace the order record.
    async fn persist_order(&self, order_id: &str, record: &str) -> Result<(), String>;

    /// Insert-if-absent keyed by `payment_id`. Returns `true` when this call
    /// created the row; `false` means an identical charge already exists.
    async fn upsert_payment(&self, payment_id: &str, order_id: &str, amount_cents: u64)
        -> Result<bool, String>;

    /// Append to the order's audit log.
    async fn append_event(&self, order_id: &str, event: &str) -> Result<(), String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRow {
    pub order_id: String,
    pub amount_cents: u64,
}

#[derive(Default)]
pub struct InMemoryFulfillmentStore {
    orders: Mutex<HashMap<String, String>>,
    payments: Mutex<HashMap<String, PaymentRow>>,
    events: Mutex<HashMap<String, Vec<String>>>,
}

impl InMemoryFulfillmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payment(&self, payment_id: &str) -> Option<PaymentRow> {
        self.payments.lock().unwrap().get(payment_id).cloned()
    }

    pub fn payment_count(&self) -> usize {
        self.payments.lock().unwrap().len()
    }

    pub fn has_order(&self, order_id: &str) -> bool {
        self.orders.lock().unwrap().contains_key(order_id)
    }

    pub fn order_events(&self, order_id: &str) -> Vec<String> {
        self.events.lock().unwrap().get(order_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl FulfillmentStore for InMemoryFulfillmentStore {
    async fn persist_order(&self, order_id: &str, record: &str) -> Result<(), String> {
        self.orders
            .lock()
            .unwrap()
            .insert(order_id.to_string(), record.to_string());
        Ok(())
    }

    async fn upsert_payment(
        &self,
        payment_id: &str,
        order_id: &str,
        amount_cents: u64,
    ) -> Result<bool, String> {
        let mut payments = self.payments.lock().unwrap();
        if payments.contains_key(payment_id) {
            return Ok(false);
        }
        payments.insert(
            payment_id.to_string(),
            PaymentRow {
                order_id: order_id.to_string(),
                amount_cents,
            },
        );
        Ok(true)
    }

    async fn append_event(&self, order_id: &str, event: &str) -> Result<(), String> {
        self.events
            .lock()
            .unwrap()
            .entry(order_id.to_string())
            .or_default()
            .push(event.to_string());
        Ok(())
    }
}

#[async_trait]
pub trait CarrierGateway: Send + Sync {
    /// Returns a tracking id, or the carrier's rejection reason.
    async fn dispatch(&self, order_id: &str, address: &str) -> Result<String, String>;
}

/// Carrier stub: rejects the first `fail_times` dispatches, then accepts.
#[derive(Default)]
pub struct StubCarrier {
    fail_times: AtomicU32,
    dispatched: Mutex<Vec<(String, String)>>,
}

impl StubCarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(times: u32) -> Self {
        let s = Self::default();
        s.fail_times.store(times, Ordering::SeqCst);
        s
    }

    pub fn dispatches(&self) -> Vec<(String, String)> {
        self.dispatched.lock().unwrap().clone()
    }
}

#[async_trait]
impl CarrierGateway for StubCarrier {
    async fn dispatch(&self, order_id: &str, address: &str) -> Result<String, String> {
        let remaining = self.fail_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_times.store(remaining - 1, Ordering::SeqCst);
            return Err(format!("carrier unavailable for {order_id}"));
        }
        self.dispatched
            .lock()
            .unwrap()
            .push((order_id.to_string(), address.to_string()));
        Ok(format!("TRK-{order_id}-{}", address.len()))
    }
}

// Activity payloads. Everything an activity needs rides in its input; the
// executor may run it on any worker.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveOrderInput {
    pub order_id: String,
    pub customer_id: String,
    pub items: Vec<OrderItem>,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateOrderInput {
    pub order_id: String,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargePaymentInput {
    pub order_id: String,
    pub payment_id: String,
    pub amount_cents: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargePaymentOutput {
    pub payment_id: String,
    /// False when the row already existed: an earlier attempt charged it.
    pub charged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparePackageInput {
    pub order_id: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchCarrierInput {
    pub order_id: String,
    pub address: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchCarrierOutput {
    pub tracking_id: String,
}

pub fn fulfillment_activities(
    store: Arc<dyn FulfillmentStore>,
    carrier: Arc<dyn CarrierGateway>,
) -> ActivityRegistry {
    let receive_store = store.clone();
    let validate_store = store.clone();
    let charge_store = store.clone();
    let prepare_store = store.clone();
    let dispatch_store = store;

    ActivityRegistry::builder()
        .register_typed("ReceiveOrder", move |input: ReceiveOrderInput| {
            let store = receive_store.clone();
            async move {
                let record = serde_json::to_string(&input).map_err(|e| ActivityError::permanent(e.to_string()))?;
                store
                    .persist_order(&input.order_id, &record)
                    .await
                    .map_err(ActivityError::transient)?;
                store
                    .append_event(&input.order_id, "received")
                    .await
                    .map_err(ActivityError::transient)?;
                Ok(format!("received:{}", input.order_id))
            }
        })
        .register_typed("ValidateOrder", move |input: ValidateOrderInput| {
            let store = validate_store.clone();
            async move {
                if input.items.is_empty() {
                    return Err(ActivityError::permanent("no items to validate"));
                }
                if input.items.iter().any(|i| i.quantity == 0) {
                    return Err(ActivityError::permanent("zero-quantity line item"));
                }
                store
                    .append_event(&input.order_id, "validated")
                    .await
                    .map_err(ActivityError::transient)?;
                Ok(format!("validated:{}", input.order_id))
            }
        })
        .register_typed("ChargePayment", move |input: ChargePaymentInput| {
            let store = charge_store.clone();
            async move {
                let charged = store
                    .upsert_payment(&input.payment_id, &input.order_id, input.amount_cents)
                    .await
                    .map_err(ActivityError::transient)?;
                let note = if charged { "charged" } else { "charge-duplicate" };
                store
                    .append_event(&input.order_id, note)
                    .await
                    .map_err(ActivityError::transient)?;
                Ok(ChargePaymentOutput {
                    payment_id: input.payment_id,
                    charged,
                })
            }
        })
        .register_typed("PreparePackage", move |input: PreparePackageInput| {
            let store = prepare_store.clone();
            async move {
                store
                    .append_event(&input.order_id, &format!("prepared:{}", input.attempt))
                    .await
                    .map_err(ActivityError::transient)?;
                Ok(format!("package:{}", input.order_id))
            }
        })
        .register_typed("DispatchCarrier", move |input: DispatchCarrierInput| {
            let store = dispatch_store.clone();
            let carrier = carrier.clone();
            async move {
                let tracking_id = carrier
                    .dispatch(&input.order_id, &input.address)
                    .await
                    .map_err(ActivityError::transient)?;
                store
                    .append_event(&input.order_id, &format!("dispatched:{tracking_id}"))
                    .await
                    .map_err(ActivityError::transient)?;
                Ok(DispatchCarrierOutput { tracking_id })
            }
        })
        .build()
}
