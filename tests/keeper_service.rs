//! The keeper loop: stop requests, notification wake-ups and the
//! fallback to polling

mod common;

use common::{persisted, Harness, ASSIGNED_SQL};
use pgkeeper::common::StopMode;
use pgkeeper::keeper::{KeeperService, NodeState};
use pgkeeper::pgsql::notify::{LOG_CHANNEL, STATE_CHANNEL};
use pgkeeper::pgsql::Subscription;
use pgkeeper::testing::MockServer;
use std::time::Duration;

fn secondary() -> Harness {
    let h = Harness::new("1h", Some(persisted(2, NodeState::Secondary)), true);
    h.group(1);
    h.primary_sees("sync");
    h.assign(2, NodeState::Secondary);
    h
}

async fn wait_for_reports(server: &MockServer, count: usize, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if server.count(ASSIGNED_SQL) >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn test_graceful_stop_ends_the_loop() {
    let h = secondary();
    let mut service = KeeperService::new(h.keeper(), None, Duration::from_millis(20), h.stop.clone());
    let task = tokio::spawn(async move { service.run().await });

    assert!(wait_for_reports(&h.coordinator, 2, Duration::from_secs(2)).await);
    h.stop.stop(StopMode::Graceful);

    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("keeper loop did not stop")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(h.store.snapshot().unwrap().current_state, NodeState::Secondary);
}

#[tokio::test]
async fn test_notification_wakes_the_loop() {
    let h = secondary();
    let subscription = Subscription::new(h.coordinator_handle(), &[STATE_CHANNEL, LOG_CHANNEL]);
    let mut service = KeeperService::new(
        h.keeper(),
        Some(subscription),
        Duration::from_secs(30),
        h.stop.clone(),
    );
    let task = tokio::spawn(async move { service.run().await });

    assert!(wait_for_reports(&h.coordinator, 1, Duration::from_secs(2)).await);
    assert!(wait_for_listen(&h.coordinator).await);

    h.coordinator
        .notify(STATE_CHANNEL, "S:secondary:prepare_promotion:default.0:2:node2:5432");
    assert!(wait_for_reports(&h.coordinator, 2, Duration::from_secs(2)).await);

    h.stop.stop(StopMode::Fast);
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("keeper loop did not stop")
        .unwrap()
        .unwrap();
}

async fn wait_for_listen(server: &MockServer) -> bool {
    for _ in 0..400 {
        if server.count("LISTEN") >= 2 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn test_failed_listen_falls_back_to_polling() {
    let h = secondary();
    h.coordinator.fail_on("LISTEN", "42501", "permission denied");
    let subscription = Subscription::new(h.coordinator_handle(), &[STATE_CHANNEL]);
    let mut service = KeeperService::new(
        h.keeper(),
        Some(subscription),
        Duration::from_millis(20),
        h.stop.clone(),
    );
    let task = tokio::spawn(async move { service.run().await });

    assert!(wait_for_reports(&h.coordinator, 3, Duration::from_secs(2)).await);

    h.stop.stop(StopMode::Graceful);
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("keeper loop did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_stop_before_start() {
    let h = secondary();
    h.stop.stop(StopMode::Fast);
    let mut service = KeeperService::new(h.keeper(), None, Duration::from_millis(20), h.stop.clone());
    service.run().await.unwrap();
    assert_eq!(h.coordinator.count(ASSIGNED_SQL), 0);
}

#[tokio::test]
async fn test_notification_burst_runs_one_cycle() {
    let h = secondary();
    let subscription = Subscription::new(h.coordinator_handle(), &[STATE_CHANNEL, LOG_CHANNEL]);
    let mut service = KeeperService::new(
        h.keeper(),
        Some(subscription),
        Duration::from_secs(30),
        h.stop.clone(),
    );
    let task = tokio::spawn(async move { service.run().await });

    assert!(wait_for_reports(&h.coordinator, 1, Duration::from_secs(2)).await);
    assert!(wait_for_listen(&h.coordinator).await);

    for i in 0..20 {
        h.coordinator
            .notify(LOG_CHANNEL, &format!("node {} reported secondary", i));
    }
    assert!(wait_for_reports(&h.coordinator, 2, Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.coordinator.count(ASSIGNED_SQL), 2);

    h.stop.stop(StopMode::Fast);
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("keeper loop did not stop")
        .unwrap()
        .unwrap();
}
