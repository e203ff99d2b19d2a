//! Keeper cycles against in-memory servers: registration, promotion,
//! demotion and the synchronous replication grace period

mod common;

use common::{persisted, Harness, ASSIGNED_SQL};
use pgkeeper::keeper::NodeState::{self, *};
use pgkeeper::pgsql::SyncState;
use pgkeeper::Error;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_register_and_start_as_single() {
    let h = Harness::new("1h", None, false);
    h.assign(1, Single);

    let mut keeper = h.keeper();
    keeper.load_state().await.unwrap();
    assert_eq!(keeper.step().await.unwrap(), Single);

    let calls = h.coordinator.statements();
    assert!(calls[0].sql.contains("pgautofailover.register_node"));
    assert!(calls[1].sql.contains("pgautofailover.node_active"));

    assert!(h.postgres.called("start"));
    assert_eq!(h.local.count("CREATE USER \"pgkeeper_replicator\""), 1);

    let saved = h.store.snapshot().unwrap();
    assert_eq!(saved.node_id, 1);
    assert_eq!(saved.current_state, Single);
    assert_eq!(saved.assigned_state, Single);
    assert!(saved.last_monitor_contact.is_some());
}

#[tokio::test]
async fn test_secondary_promoted_through_prepare_promotion() {
    let h = Harness::new("1h", Some(persisted(2, Secondary)), true);
    h.group(1);
    h.primary_sees("sync");
    h.assign(2, Secondary);

    let mut keeper = h.keeper();
    keeper.load_state().await.unwrap();
    assert_eq!(keeper.step().await.unwrap(), Secondary);
    assert_eq!(keeper.node().replication.sync_state, SyncState::Sync);
    assert!(keeper.events().is_empty());

    h.assign(2, Primary);
    assert_eq!(keeper.step().await.unwrap(), Primary);

    let hops: Vec<(NodeState, NodeState)> = keeper.events().iter().map(|e| (e.from, e.to)).collect();
    assert_eq!(hops, vec![(Secondary, PreparePromotion), (PreparePromotion, Primary)]);
    assert!(h.postgres.called("promote"));
    assert_eq!(h.local.count("CHECKPOINT"), 1);
    assert_eq!(h.local.count("SELECT pg_create_physical_replication_slot"), 1);
    assert_eq!(h.store.snapshot().unwrap().current_state, Primary);
}

#[tokio::test]
async fn test_promotion_refused_without_sync_standby() {
    let h = Harness::new("1h", Some(persisted(2, Secondary)), true);
    h.group(1);
    h.primary_sees("async");
    h.assign(2, Primary);

    let mut keeper = h.keeper();
    keeper.load_state().await.unwrap();

    let err = keeper.step().await.unwrap_err();
    assert!(matches!(err, Error::NotPromotable(_)));
    assert_eq!(keeper.node().reported, Secondary);
    assert!(!h.postgres.called("promote"));
    assert!(keeper.events().last().unwrap().is_failure());
    assert!(keeper.last_error().is_some());
    assert_eq!(h.store.snapshot().unwrap().current_state, Secondary);

    // the standby caught up: the same transition goes through next cycle
    h.primary_sees("sync");
    assert_eq!(keeper.step().await.unwrap(), Primary);
    assert!(keeper.last_error().is_none());
}

#[tokio::test]
async fn test_guard_uses_last_known_sync_state() {
    let h = Harness::new("1h", Some(persisted(2, Secondary)), true);
    h.group(1);
    h.primary_sees("sync");
    h.assign(2, Secondary);

    let mut keeper = h.keeper();
    keeper.load_state().await.unwrap();
    keeper.step().await.unwrap();

    // the primary dies: its last answer still counts
    h.peer.set_down(true);
    h.assign(2, Primary);
    assert_eq!(keeper.step().await.unwrap(), Primary);
    assert_eq!(keeper.node().replication.sync_state, SyncState::Sync);
}

#[tokio::test]
async fn test_invalid_transition_keeps_state() {
    let h = Harness::new("1h", Some(persisted(2, Single)), true);
    h.local_standby(None);
    h.assign(2, Secondary);

    let mut keeper = h.keeper();
    keeper.load_state().await.unwrap();

    let err = keeper.step().await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: Single,
            to: Secondary
        }
    ));
    assert_eq!(keeper.node().reported, Single);
    assert_eq!(h.store.snapshot().unwrap().current_state, Single);
}

#[tokio::test]
async fn test_failed_action_is_retried_next_cycle() {
    let h = Harness::new("1h", Some(persisted(1, Init)), false);
    h.assign(1, Single);
    h.postgres.fail_next("start");

    let mut keeper = h.keeper();
    keeper.load_state().await.unwrap();

    assert!(matches!(keeper.step().await, Err(Error::Process(_))));
    assert_eq!(keeper.node().reported, Init);
    let failure = keeper.events().last().unwrap();
    assert_eq!((failure.from, failure.to), (Init, Single));
    assert!(failure.failure.is_some());

    assert_eq!(keeper.step().await.unwrap(), Single);
    assert!(!keeper.events().last().unwrap().is_failure());
}

#[tokio::test]
async fn test_unreachable_coordinator_fails_the_cycle() {
    let h = Harness::new("1h", Some(persisted(2, Secondary)), true);
    h.coordinator.set_down(true);

    let mut keeper = h.keeper();
    keeper.load_state().await.unwrap();

    let started = Instant::now();
    assert!(matches!(keeper.step().await, Err(Error::Unreachable(_))));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(keeper.node().reported, Secondary);

    h.coordinator.set_down(false);
    h.group(1);
    h.primary_sees("sync");
    h.assign(2, Secondary);
    assert_eq!(keeper.step().await.unwrap(), Secondary);
}

#[tokio::test]
async fn test_demoted_node_falls_back_to_base_backup() {
    let h = Harness::new("1h", Some(persisted(1, Demoted)), false);
    h.group(2);
    h.assign(1, Catchingup);
    h.postgres.fail_next("rewind");

    let mut keeper = h.keeper();
    keeper.load_state().await.unwrap();
    assert_eq!(keeper.step().await.unwrap(), Catchingup);

    let calls = h.postgres.calls();
    let rewind = calls.iter().position(|c| c == "rewind").unwrap();
    let backup = calls.iter().position(|c| c == "init_standby").unwrap();
    assert!(rewind < backup);
    assert!(h.postgres.running());
    assert_eq!(h.local.count("SELECT pg_drop_replication_slot"), 1);
}

#[tokio::test]
async fn test_old_primary_stops_on_demotion() {
    let h = Harness::new("1h", Some(persisted(1, Primary)), true);
    h.local_standby(Some("sync"));
    h.assign(1, Demoted);

    let mut keeper = h.keeper();
    keeper.load_state().await.unwrap();
    assert_eq!(keeper.step().await.unwrap(), Demoted);
    assert!(h.postgres.called("stop"));
    assert!(!h.postgres.running());
    assert!(!keeper.node().pg_is_running);
}

#[tokio::test]
async fn test_current_state_is_enforced() {
    let h = Harness::new("1h", Some(persisted(2, Secondary)), false);
    h.group(1);
    h.primary_sees("sync");
    h.assign(2, Secondary);

    let mut keeper = h.keeper();
    keeper.load_state().await.unwrap();
    assert_eq!(keeper.step().await.unwrap(), Secondary);
    assert!(h.postgres.called("start"));
    assert!(keeper.events().is_empty());
}

#[tokio::test]
async fn test_sync_rep_disabled_after_grace_period() {
    let h = Harness::new("200ms", Some(persisted(2, Primary)), true);
    h.local_standby(None);
    h.assign(2, Primary);

    let mut keeper = h.keeper();
    keeper.load_state().await.unwrap();

    keeper.step().await.unwrap();
    assert!(!keeper.is_sync_rep_disabled());
    assert_eq!(h.local.count("ALTER SYSTEM SET synchronous_standby_names"), 0);

    tokio::time::sleep(Duration::from_millis(250)).await;
    keeper.step().await.unwrap();
    assert!(keeper.is_sync_rep_disabled());
    assert_eq!(
        h.local.count("ALTER SYSTEM SET synchronous_standby_names TO ''"),
        1
    );
    assert!(h.store.snapshot().unwrap().sync_rep_disabled);

    // the standby is back
    h.local_standby(Some("sync"));
    keeper.step().await.unwrap();
    assert!(!keeper.is_sync_rep_disabled());
    assert_eq!(
        h.local.count("ALTER SYSTEM SET synchronous_standby_names TO '*'"),
        1
    );
}

#[tokio::test]
async fn test_healthy_standby_keeps_sync_rep() {
    let h = Harness::new("0ms", Some(persisted(2, Primary)), true);
    h.local_standby(Some("sync"));
    h.assign(2, Primary);

    let mut keeper = h.keeper();
    keeper.load_state().await.unwrap();
    for _ in 0..3 {
        keeper.step().await.unwrap();
    }
    assert!(!keeper.is_sync_rep_disabled());
    assert_eq!(h.local.count("ALTER SYSTEM"), 0);
    assert_eq!(h.coordinator.count(ASSIGNED_SQL), 3);
}

#[tokio::test]
async fn test_grace_period_restarts_after_demotion() {
    let h = Harness::new("200ms", Some(persisted(2, Primary)), true);
    h.local_standby(None);
    h.assign(2, Primary);

    let mut keeper = h.keeper();
    keeper.load_state().await.unwrap();
    keeper.step().await.unwrap();
    assert!(!keeper.is_sync_rep_disabled());

    h.assign(2, Demoted);
    assert_eq!(keeper.step().await.unwrap(), Demoted);
    tokio::time::sleep(Duration::from_millis(300)).await;

    h.group(1);
    h.primary_sees("sync");
    for state in [Catchingup, Secondary, Primary] {
        h.assign(2, state);
        assert_eq!(keeper.step().await.unwrap(), state);
    }

    // promoted again: the standby gets a fresh grace period
    assert!(!keeper.is_sync_rep_disabled());
    assert_eq!(
        h.local.count("ALTER SYSTEM SET synchronous_standby_names TO ''"),
        0
    );
}
