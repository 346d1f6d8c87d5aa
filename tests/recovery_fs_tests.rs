//! Crash recovery over the filesystem provider: a parked order survives a
//! full runtime restart and resumes from its recorded history.

mod common;

use std::sync::Arc;

use common::{detail_json, fast_config, sample_order, start_env_with_provider, TERMINAL_WAIT};
use ordex::providers::{FsProvider, Provider};
use ordex::runtime::status::InstanceStatus;

#[tokio::test]
async fn parked_order_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = fast_config();
    cfg.review_delay_ms = 60_000;
    cfg.instance_deadline_ms = 60_000;

    let provider: Arc<dyn Provider> = Arc::new(FsProvider::open(dir.path()).unwrap());
    let env = start_env_with_provider(provider, &cfg, 0).await;
    let input = sample_order("o-600", &cfg);
    let instance = env.client.start_order(Some("restart-survivor"), &input).await.unwrap();

    // Park in the review window.
    let deadline = tokio::time::Instant::now() + TERMINAL_WAIT;
    loop {
        if let Some(s) = env.client.order_status(&instance).await.unwrap() {
            if detail_json(&s)["step"] == "MANUAL_REVIEW" {
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "order never reached review");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    env.runtime.shutdown();
    drop(env);

    // Fresh process: reopen the same root and resume.
    let provider: Arc<dyn Provider> = Arc::new(FsProvider::open(dir.path()).unwrap());
    let env = start_env_with_provider(provider, &cfg, 0).await;
    env.client.approve(&instance, "operator-after-restart").await.unwrap();

    let snapshot = env
        .client
        .inner()
        .wait_for_terminal(&instance, TERMINAL_WAIT)
        .await
        .unwrap();
    assert_eq!(snapshot.status, InstanceStatus::Completed);

    // Activities before the restart are not re-executed: the restarted store
    // never saw the order being received, only the post-restart steps.
    assert!(!env.store.has_order("o-600"));
    assert_eq!(env.store.payment_count(), 1);

    // Exactly one Started event despite the restart.
    let history = env.provider.read_history(&instance).await.unwrap();
    let starts = history
        .iter()
        .filter(|e| matches!(e.kind, ordex::EventKind::Started { .. }))
        .count();
    assert_eq!(starts, 1);

    env.runtime.shutdown();
}

#[tokio::test]
async fn instance_listing_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = fast_config();

    let provider: Arc<dyn Provider> = Arc::new(FsProvider::open(dir.path()).unwrap());
    let env = start_env_with_provider(provider, &cfg, 0).await;
    let input = sample_order("o-601", &cfg);
    let instance = env.client.start_order(Some("listed"), &input).await.unwrap();
    env.client
        .inner()
        .wait_for_terminal(&instance, TERMINAL_WAIT)
        .await
        .unwrap();
    env.runtime.shutdown();
    drop(env);

    let provider: Arc<dyn Provider> = Arc::new(FsProvider::open(dir.path()).unwrap());
    let instances = provider.list_instances().await.unwrap();
    assert!(instances.contains(&"listed".to_string()));
    // The shipping child is listed under its own id.
    assert!(instances.contains(&"listed::ship-1".to_string()));
}
