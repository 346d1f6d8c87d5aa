//! End-to-end order flows over the in-memory provider.

mod common;

use common::{detail_json, fast_config, sample_order, start_env, TERMINAL_WAIT};
use ordex::codec;
use ordex::runtime::status::InstanceStatus;
use ordex::workflows::order::OrderResult;

#[tokio::test]
async fn order_completes_when_review_window_elapses() {
    let cfg = fast_config();
    let env = start_env(&cfg, 0).await;

    let input = sample_order("o-100", &cfg);
    let instance = env.client.start_order(None, &input).await.unwrap();
    let snapshot = env
        .client
        .inner()
        .wait_for_terminal(&instance, TERMINAL_WAIT)
        .await
        .unwrap();

    assert_eq!(snapshot.status, InstanceStatus::Completed);
    let result: OrderResult = codec::decode(snapshot.output.as_deref().unwrap()).unwrap();
    assert_eq!(result.order_id, "o-100");
    assert_eq!(result.shipping_attempts, 1);
    assert!(result.tracking_id.starts_with("TRK-o-100"));

    let detail = detail_json(&snapshot);
    assert_eq!(detail["step"], "SHIP");
    assert_eq!(detail["canceled"], false);

    assert!(env.store.has_order("o-100"));
    let payment = env.store.payment("pay-o-100").unwrap();
    assert_eq!(payment.order_id, "o-100");
    assert_eq!(payment.amount_cents, 2 * 1_250 + 4_000);
    assert_eq!(env.carrier.dispatches().len(), 1);

    env.runtime.shutdown();
}

#[tokio::test]
async fn approve_signal_ends_review_early() {
    let mut cfg = fast_config();
    // Too long to elapse within the test; only approval can move the order.
    cfg.review_delay_ms = 60_000;
    cfg.instance_deadline_ms = 60_000;
    let env = start_env(&cfg, 0).await;

    let input = sample_order("o-101", &cfg);
    let instance = env.client.start_order(Some("review-approved"), &input).await.unwrap();
    assert_eq!(instance, "review-approved");
    env.client.approve(&instance, "operator-7").await.unwrap();

    let snapshot = env
        .client
        .inner()
        .wait_for_terminal(&instance, TERMINAL_WAIT)
        .await
        .unwrap();
    assert_eq!(snapshot.status, InstanceStatus::Completed);

    env.runtime.shutdown();
}

#[tokio::test]
async fn duplicate_payment_id_is_charged_once() {
    let cfg = fast_config();
    let env = start_env(&cfg, 0).await;

    let mut first = sample_order("o-102", &cfg);
    let mut second = sample_order("o-103", &cfg);
    first.payment_id = "pay-shared".to_string();
    second.payment_id = "pay-shared".to_string();

    let a = env.client.start_order(None, &first).await.unwrap();
    let b = env.client.start_order(None, &second).await.unwrap();
    let (sa, sb) = futures::future::join(
        env.client.inner().wait_for_terminal(&a, TERMINAL_WAIT),
        env.client.inner().wait_for_terminal(&b, TERMINAL_WAIT),
    )
    .await;
    let (sa, sb) = (sa.unwrap(), sb.unwrap());

    // Both orders complete, but only one charge row exists.
    assert_eq!(sa.status, InstanceStatus::Completed);
    assert_eq!(sb.status, InstanceStatus::Completed);
    assert_eq!(env.store.payment_count(), 1);

    env.runtime.shutdown();
}

#[tokio::test]
async fn address_update_applies_to_next_shipping_attempt() {
    let mut cfg = fast_config();
    cfg.review_delay_ms = 200;
    let env = start_env(&cfg, 0).await;

    let input = sample_order("o-104", &cfg);
    let instance = env.client.start_order(None, &input).await.unwrap();
    // Lands in the inbox during the review window, well before SHIP.
    env.client.update_address(&instance, "9 New Quay").await.unwrap();

    let snapshot = env
        .client
        .inner()
        .wait_for_terminal(&instance, TERMINAL_WAIT)
        .await
        .unwrap();
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    let dispatches = env.carrier.dispatches();
    assert_eq!(dispatches.len(), 1);
    assert_eq!(dispatches[0].1, "9 New Quay");

    let detail = detail_json(&snapshot);
    assert_eq!(detail["address"], "9 New Quay");

    env.runtime.shutdown();
}

#[tokio::test]
async fn order_stalls_at_ship_without_shipping_workers() {
    use ordex::providers::{InMemoryProvider, Provider};
    use ordex::runtime::{Runtime, RuntimeOptions};
    use ordex::workflows::activities::{InMemoryFulfillmentStore, StubCarrier};
    use ordex::workflows::{fulfillment_registries, FulfillmentClient};
    use std::sync::Arc;

    let mut cfg = fast_config();
    cfg.instance_deadline_ms = 60_000;
    let provider: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let store = Arc::new(InMemoryFulfillmentStore::new());
    let carrier = Arc::new(StubCarrier::new());
    let (activities, workflows) = fulfillment_registries(store, carrier.clone());
    // Only the order queue is polled; shipping activities have no takers.
    let runtime = Runtime::start_with_options(
        provider.clone(),
        activities,
        workflows,
        RuntimeOptions {
            worker_queues: vec![cfg.order_queue.clone()],
            dispatcher_idle_sleep_ms: 5,
            ..RuntimeOptions::default()
        },
    )
    .await;
    let client = FulfillmentClient::new(provider);

    let input = sample_order("o-105", &cfg);
    let instance = client.start_order(None, &input).await.unwrap();

    // Give the order time to reach SHIP; it can go no further.
    let deadline = tokio::time::Instant::now() + TERMINAL_WAIT;
    loop {
        if let Some(s) = client.order_status(&instance).await.unwrap() {
            if detail_json(&s)["step"] == "SHIP" {
                assert_eq!(s.status, InstanceStatus::Running);
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "order never reached SHIP");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(carrier.dispatches().is_empty());

    runtime.shutdown();
}
