//! Shipping child workflow: prepare the package, then hand it to the
//! carrier. One instance per shipping attempt; the parent decides whether
//! to retry with a fresh child.

use serde::{Deserialize, Serialize};

use crate::error::FailureInfo;
use crate::workflows::activities::{DispatchCarrierInput, DispatchCarrierOutput, PreparePackageInput};
use crate::workflows::config::FulfillmentConfig;
use crate::{codec, wf_info, wf_warn};
use crate::{ActivityOptions, Event, EventKind, WorkflowContext};

pub const SHIPPING_WORKFLOW: &str = "ShippingWorkflow";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShippingInput {
    pub order_id: String,
    pub address: String,
    /// Which shipping attempt this child is, 1-based. Informational.
    pub attempt: u32,
    #[serde(default)]
    pub config: FulfillmentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShippingResult {
    pub order_id: String,
    pub tracking_id: String,
    pub attempt: u32,
}

pub async fn shipping_workflow(ctx: WorkflowContext, input: ShippingInput) -> Result<ShippingResult, FailureInfo> {
    let cfg = &input.config;
    let policy = cfg.activity_policy();

    if let Some(reason) = ctx.cancel_requested() {
        wf_info!(ctx, order_id = %input.order_id, %reason, "shipping canceled before prepare");
        return Err(FailureInfo::canceled(format!("canceled at PREPARE: {reason}")));
    }

    let prepare_input = codec::encode(&PreparePackageInput {
        order_id: input.order_id.clone(),
        attempt: input.attempt,
    })
    .map_err(FailureInfo::permanent)?;
    ctx.schedule_activity(
        "PreparePackage",
        prepare_input,
        ActivityOptions {
            queue: cfg.shipping_queue.clone(),
            timeout_ms: cfg.shipping_timeout_ms,
            policy: policy.clone(),
            idempotency_key: None,
        },
    )
    .into_activity()
    .await?;

    if let Some(reason) = ctx.cancel_requested() {
        wf_info!(ctx, order_id = %input.order_id, %reason, "shipping canceled before dispatch");
        return Err(FailureInfo::canceled(format!("canceled at DISPATCH: {reason}")));
    }

    let dispatch_input = codec::encode(&DispatchCarrierInput {
        order_id: input.order_id.clone(),
        address: input.address.clone(),
        attempt: input.attempt,
    })
    .map_err(FailureInfo::permanent)?;
    let dispatched = ctx
        .schedule_activity(
            "DispatchCarrier",
            dispatch_input,
            ActivityOptions {
                queue: cfg.shipping_queue.clone(),
                timeout_ms: cfg.shipping_timeout_ms,
                policy,
                idempotency_key: None,
            },
        )
        .into_activity()
        .await;

    match dispatched {
        Ok(raw) => {
            let out: DispatchCarrierOutput = codec::decode(&raw).map_err(FailureInfo::permanent)?;
            wf_info!(
                ctx,
                order_id = %input.order_id,
                tracking_id = %out.tracking_id,
                attempt = input.attempt,
                "package dispatched"
            );
            Ok(ShippingResult {
                order_id: input.order_id,
                tracking_id: out.tracking_id,
                attempt: input.attempt,
            })
        }
        Err(failure) => {
            let reason = failure.message.clone();
            wf_warn!(ctx, order_id = %input.order_id, attempt = input.attempt, %reason, "carrier dispatch failed");
            // Tell the parent before failing. The send is recorded in this
            // history, so a crash between record and terminal still delivers
            // it exactly once.
            if let Some(parent) = ctx.parent() {
                ctx.notify_instance(parent.instance, "dispatch_failed", reason.clone());
            }
            Err(FailureInfo::permanent(format!("dispatch_failed: {reason}")))
        }
    }
}

/// Status detail for a shipping instance.
pub fn project_shipping(history: &[Event]) -> Option<String> {
    let mut step = "PREPARE";
    let mut attempt = None;
    for event in history {
        match &event.kind {
            EventKind::Started { input, .. } => {
                if let Ok(parsed) = codec::decode::<ShippingInput>(input) {
                    attempt = Some(parsed.attempt);
                }
            }
            EventKind::ActivityScheduled { name, .. } => match name.as_str() {
                "PreparePackage" => step = "PREPARE",
                "DispatchCarrier" => step = "DISPATCH",
                _ => {}
            },
            _ => {}
        }
    }
    let detail = serde_json::json!({
        "step": step,
        "attempt": attempt,
    });
    Some(detail.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RetryPolicy;

    #[test]
    fn projection_reports_dispatch_step() {
        let input = codec::encode(&ShippingInput {
            order_id: "o-1".into(),
            address: "1 Main St".into(),
            attempt: 2,
            config: FulfillmentConfig::default(),
        })
        .unwrap();
        let history = vec![
            Event {
                seq: 1,
                ts_ms: 1,
                kind: EventKind::Started {
                    workflow: SHIPPING_WORKFLOW.into(),
                    version: "1.0.0".into(),
                    input,
                    parent: None,
                    deadline_ms: None,
                },
            },
            Event {
                seq: 2,
                ts_ms: 2,
                kind: EventKind::ActivityScheduled {
                    name: "PreparePackage".into(),
                    input: String::new(),
                    queue: "shipping-tq".into(),
                    timeout_ms: 5_000,
                    policy: RetryPolicy::default(),
                    idempotency_key: None,
                },
            },
            Event {
                seq: 3,
                ts_ms: 3,
                kind: EventKind::ActivityCompleted { source: 2, result: String::new() },
            },
            Event {
                seq: 4,
                ts_ms: 4,
                kind: EventKind::ActivityScheduled {
                    name: "DispatchCarrier".into(),
                    input: String::new(),
                    queue: "shipping-tq".into(),
                    timeout_ms: 5_000,
                    policy: RetryPolicy::default(),
                    idempotency_key: None,
                },
            },
        ];
        let detail: serde_json::Value = serde_json::from_str(&project_shipping(&history).unwrap()).unwrap();
        assert_eq!(detail["step"], "DISPATCH");
        assert_eq!(detail["attempt"], 2);
    }
}
