//! Order fulfillment workflow: receive, validate, manual review window,
//! charge payment, then ship through child workflows with durable retries.
//!
//! Cancellation is cooperative. The workflow checks for a pending `cancel`
//! signal at each step boundary; steps already completed are never rolled
//! back, so a cancel after payment leaves the charge in place.

use serde::{Deserialize, Serialize};

use crate::error::{FailureInfo, FailureKind};
use crate::workflows::activities::{
    ChargePaymentInput, ChargePaymentOutput, OrderItem, ReceiveOrderInput, ValidateOrderInput,
};
use crate::workflows::config::FulfillmentConfig;
use crate::workflows::shipping::{ShippingInput, ShippingResult};
use crate::{codec, wf_info, wf_warn};
use crate::{ActivityOptions, Event, EventKind, WorkflowContext, WorkflowOutcome};

pub const ORDER_WORKFLOW: &str = "OrderWorkflow";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderInput {
    pub order_id: String,
    pub customer_id: String,
    pub items: Vec<OrderItem>,
    pub payment_id: String,
    pub address: String,
    #[serde(default)]
    pub config: FulfillmentConfig,
}

impl OrderInput {
    pub fn total_cents(&self) -> u64 {
        self.items.iter().map(|i| i.quantity as u64 * i.price_cents).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub payment_id: String,
    pub tracking_id: String,
    pub shipping_attempts: u32,
}

fn check_cancel(ctx: &WorkflowContext, step: &str) -> Result<(), FailureInfo> {
    if let Some(reason) = ctx.cancel_requested() {
        wf_info!(ctx, step, %reason, "order canceled");
        return Err(FailureInfo::canceled(format!("canceled at {step}: {reason}")));
    }
    Ok(())
}

pub async fn order_workflow(ctx: WorkflowContext, input: OrderInput) -> Result<OrderResult, FailureInfo> {
    let cfg = &input.config;
    let policy = cfg.activity_policy();

    wf_info!(ctx, order_id = %input.order_id, customer = %input.customer_id, "order started");

    check_cancel(&ctx, "RECEIVE")?;
    let receive_input = codec::encode(&ReceiveOrderInput {
        order_id: input.order_id.clone(),
        customer_id: input.customer_id.clone(),
        items: input.items.clone(),
        address: input.address.clone(),
    })
    .map_err(FailureInfo::permanent)?;
    ctx.schedule_activity(
        "ReceiveOrder",
        receive_input,
        ActivityOptions {
            queue: cfg.order_queue.clone(),
            timeout_ms: cfg.receive_timeout_ms,
            policy: policy.clone(),
            idempotency_key: None,
        },
    )
    .into_activity()
    .await?;

    check_cancel(&ctx, "VALIDATE")?;
    let validate_input = codec::encode(&ValidateOrderInput {
        order_id: input.order_id.clone(),
        items: input.items.clone(),
    })
    .map_err(FailureInfo::permanent)?;
    ctx.schedule_activity(
        "ValidateOrder",
        validate_input,
        ActivityOptions {
            queue: cfg.order_queue.clone(),
            timeout_ms: cfg.validate_timeout_ms,
            policy: policy.clone(),
            idempotency_key: None,
        },
    )
    .into_activity()
    .await?;

    // Manual review window: an approve signal cuts it short, otherwise the
    // timer elapses and the order proceeds unattended.
    check_cancel(&ctx, "MANUAL_REVIEW")?;
    let (winner, _out) = ctx
        .select2(
            ctx.schedule_timer(cfg.review_delay_ms),
            ctx.wait_signal("approve"),
        )
        .await;
    if winner == 1 {
        wf_info!(ctx, order_id = %input.order_id, "review approved by operator");
    } else {
        wf_info!(ctx, order_id = %input.order_id, "review window elapsed");
    }

    check_cancel(&ctx, "PAY")?;
    let charge_input = codec::encode(&ChargePaymentInput {
        order_id: input.order_id.clone(),
        payment_id: input.payment_id.clone(),
        amount_cents: input.total_cents(),
    })
    .map_err(FailureInfo::permanent)?;
    let charge_raw = ctx
        .schedule_activity(
            "ChargePayment",
            charge_input,
            ActivityOptions {
                queue: cfg.order_queue.clone(),
                timeout_ms: cfg.payment_timeout_ms,
                policy: policy.clone(),
                idempotency_key: Some(input.payment_id.clone()),
            },
        )
        .into_activity()
        .await?;
    let charge: ChargePaymentOutput = codec::decode(&charge_raw).map_err(FailureInfo::permanent)?;
    if !charge.charged {
        wf_info!(ctx, order_id = %input.order_id, payment_id = %charge.payment_id, "payment already charged, skipping");
    }

    // Shipping: each attempt is a child workflow. Address updates that
    // arrived since the last attempt are applied last-writer-wins before
    // starting the next child.
    let mut address = input.address.clone();
    let max_attempts = cfg.max_shipping_attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=max_attempts {
        check_cancel(&ctx, "SHIP")?;
        if let Some(updated) = ctx.take_signals("update_address").pop() {
            wf_info!(ctx, order_id = %input.order_id, %updated, "shipping address updated");
            address = updated;
        }

        let child_instance = format!("{}::ship-{attempt}", ctx.instance());
        let ship_input = codec::encode(&ShippingInput {
            order_id: input.order_id.clone(),
            address: address.clone(),
            attempt,
            config: cfg.clone(),
        })
        .map_err(FailureInfo::permanent)?;
        let outcome = ctx
            .start_child(
                crate::workflows::shipping::SHIPPING_WORKFLOW,
                child_instance,
                ship_input,
                cfg.shipping_queue.clone(),
            )
            .into_child()
            .await;

        match outcome {
            WorkflowOutcome::Success { output } => {
                let result: ShippingResult = codec::decode(&output).map_err(FailureInfo::permanent)?;
                wf_info!(
                    ctx,
                    order_id = %input.order_id,
                    tracking_id = %result.tracking_id,
                    attempt,
                    "order shipped"
                );
                return Ok(OrderResult {
                    order_id: input.order_id,
                    payment_id: input.payment_id,
                    tracking_id: result.tracking_id,
                    shipping_attempts: attempt,
                });
            }
            WorkflowOutcome::Failure { failure } => {
                wf_warn!(
                    ctx,
                    order_id = %input.order_id,
                    attempt,
                    error = %failure,
                    "shipping attempt failed"
                );
                last_error = failure.message;
            }
            WorkflowOutcome::Canceled { reason } => {
                wf_warn!(ctx, order_id = %input.order_id, attempt, %reason, "shipping attempt canceled");
                last_error = format!("canceled: {reason}");
            }
        }

        if attempt < max_attempts {
            ctx.schedule_timer(cfg.ship_retry_backoff_ms).into_timer().await;
        }
    }

    Err(FailureInfo::permanent(format!(
        "shipping failed after {max_attempts} attempts: {last_error}"
    )))
}

/// Projection of an order's history into the operator-facing status detail.
pub fn project_order(history: &[Event]) -> Option<String> {
    let mut step = "RECEIVE";
    let mut paid = false;
    let mut errors: Vec<String> = Vec::new();
    let mut canceled = false;
    let mut shipping_attempts = 0u32;
    let mut address: Option<String> = None;
    let mut max_shipping_attempts = None;

    for event in history {
        match &event.kind {
            EventKind::Started { input, .. } => {
                if let Ok(parsed) = codec::decode::<OrderInput>(input) {
                    address = Some(parsed.address);
                    max_shipping_attempts = Some(parsed.config.max_shipping_attempts);
                }
            }
            EventKind::ActivityScheduled { name, .. } => match name.as_str() {
                "ReceiveOrder" => step = "RECEIVE",
                "ValidateOrder" => step = "VALIDATE",
                "ChargePayment" => {
                    step = "PAY";
                    paid = true;
                }
                _ => {}
            },
            // Review timer only; the ship retry backoff comes after payment.
            EventKind::TimerStarted { .. } if !paid => step = "MANUAL_REVIEW",
            EventKind::ChildStarted { .. } => {
                step = "SHIP";
                shipping_attempts += 1;
            }
            EventKind::ActivityFailed { failure, .. } => errors.push(failure.to_string()),
            EventKind::SignalReceived { name, payload } => match name.as_str() {
                "dispatch_failed" => errors.push(format!("dispatch_failed: {payload}")),
                "update_address" => address = Some(payload.clone()),
                "cancel" => canceled = true,
                _ => {}
            },
            // The step marker stays at the last business step reached, even
            // once the instance is terminal.
            EventKind::Completed { outcome } => match outcome {
                WorkflowOutcome::Success { .. } => {}
                WorkflowOutcome::Canceled { .. } => canceled = true,
                WorkflowOutcome::Failure { failure } if failure.kind == FailureKind::Canceled => {
                    canceled = true
                }
                WorkflowOutcome::Failure { .. } => {}
            },
            _ => {}
        }
    }

    let detail = serde_json::json!({
        "step": step,
        "errors": errors,
        "canceled": canceled,
        "shipping_attempts": shipping_attempts,
        "max_shipping_attempts": max_shipping_attempts,
        "address": address,
    });
    Some(detail.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RetryPolicy;

    fn event(seq: u64, kind: EventKind) -> Event {
        Event { seq, ts_ms: seq, kind }
    }

    fn sample_input() -> OrderInput {
        OrderInput {
            order_id: "o-1".into(),
            customer_id: "c-1".into(),
            items: vec![OrderItem {
                sku: "SKU-1".into(),
                quantity: 2,
                price_cents: 250,
            }],
            payment_id: "pay-1".into(),
            address: "1 Main St".into(),
            config: FulfillmentConfig::default(),
        }
    }

    #[test]
    fn total_sums_line_items() {
        let mut input = sample_input();
        input.items.push(OrderItem {
            sku: "SKU-2".into(),
            quantity: 1,
            price_cents: 100,
        });
        assert_eq!(input.total_cents(), 600);
    }

    #[test]
    fn projection_tracks_step_and_errors() {
        let input = codec::encode(&sample_input()).unwrap();
        let history = vec![
            event(
                1,
                EventKind::Started {
                    workflow: ORDER_WORKFLOW.into(),
                    version: "1.0.0".into(),
                    input,
                    parent: None,
                    deadline_ms: None,
                },
            ),
            event(
                2,
                EventKind::ActivityScheduled {
                    name: "ReceiveOrder".into(),
                    input: String::new(),
                    queue: "orders-tq".into(),
                    timeout_ms: 3_000,
                    policy: RetryPolicy::default(),
                    idempotency_key: None,
                },
            ),
            event(3, EventKind::ActivityCompleted { source: 2, result: String::new() }),
            event(
                4,
                EventKind::ActivityScheduled {
                    name: "ChargePayment".into(),
                    input: String::new(),
                    queue: "orders-tq".into(),
                    timeout_ms: 5_000,
                    policy: RetryPolicy::default(),
                    idempotency_key: Some("pay-1".into()),
                },
            ),
            event(5, EventKind::ActivityCompleted { source: 4, result: String::new() }),
            event(
                6,
                EventKind::ChildStarted {
                    workflow: "ShippingWorkflow".into(),
                    instance: "o-1::ship-1".into(),
                    input: String::new(),
                    queue: "shipping-tq".into(),
                },
            ),
            event(
                7,
                EventKind::SignalReceived {
                    name: "dispatch_failed".into(),
                    payload: "carrier unavailable".into(),
                },
            ),
        ];
        let detail: serde_json::Value = serde_json::from_str(&project_order(&history).unwrap()).unwrap();
        assert_eq!(detail["step"], "SHIP");
        assert_eq!(detail["shipping_attempts"], 1);
        assert_eq!(detail["errors"][0], "dispatch_failed: carrier unavailable");
        assert_eq!(detail["canceled"], false);
        assert_eq!(detail["address"], "1 Main St");
        assert_eq!(detail["max_shipping_attempts"], 3);
    }

    // Cancel lands after VALIDATE completes and before PAY is scheduled: the
    // order reports CANCELED at step VALIDATE with no payment activity.
    #[test]
    fn projection_marks_canceled_orders() {
        let history = vec![
            event(
                1,
                EventKind::Started {
                    workflow: ORDER_WORKFLOW.into(),
                    version: "1.0.0".into(),
                    input: "{}".into(),
                    parent: None,
                    deadline_ms: None,
                },
            ),
            event(
                2,
                EventKind::ActivityScheduled {
                    name: "ValidateOrder".into(),
                    input: String::new(),
                    queue: "orders-tq".into(),
                    timeout_ms: 3_000,
                    policy: RetryPolicy::default(),
                    idempotency_key: None,
                },
            ),
            event(3, EventKind::ActivityCompleted { source: 2, result: String::new() }),
            event(
                4,
                EventKind::SignalReceived {
                    name: "cancel".into(),
                    payload: "customer request".into(),
                },
            ),
            event(
                5,
                EventKind::Completed {
                    outcome: WorkflowOutcome::Canceled {
                        reason: "canceled at MANUAL_REVIEW: customer request".into(),
                    },
                },
            ),
        ];
        let detail: serde_json::Value = serde_json::from_str(&project_order(&history).unwrap()).unwrap();
        assert_eq!(detail["step"], "VALIDATE");
        assert_eq!(detail["canceled"], true);
    }
}
