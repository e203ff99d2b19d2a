//! Shared harness: a keeper wired to in-memory servers

#![allow(dead_code)]

use pgkeeper::common::StopSignal;
use pgkeeper::keeper::coordinator::Coordinator;
use pgkeeper::keeper::{Keeper, KeeperStateData, MemoryStateStore, NodeState};
use pgkeeper::pgsql::{ConnectionClass, ConnectionHandle, RawRow, RetryPolicy};
use pgkeeper::testing::{MockConnector, MockPostgres, MockServer};
use pgkeeper::Config;
use std::sync::Arc;

pub const SYNC_STATE_SQL: &str = "select coalesce";
pub const RECEIVED_LSN_SQL: &str = "SELECT pg_last_wal_receive_lsn()";
pub const IN_RECOVERY_SQL: &str = "SELECT pg_is_in_recovery()";
pub const SETTINGS_SQL: &str = "select bool_and";
pub const ASSIGNED_SQL: &str = "SELECT assigned_node_id";
pub const NODES_SQL: &str = "SELECT node_id";

pub fn config(grace: &str) -> Config {
    let toml = format!(
        r#"
        node_name = "node2"

        [postgres]
        pgdata = "/tmp/pgkeeper-test/data"
        host = "node2"

        [coordinator]
        conninfo = "postgresql://autoctl@monitor/pg_auto_failover"

        [timeouts]
        loop_interval = "50ms"
        retry_poll_interval = "10ms"
        retry_timeout = "200ms"
        connect_timeout = "100ms"
        sync_rep_grace_period = "{}"
        "#,
        grace
    );
    Config::from_toml(&toml).unwrap()
}

pub fn persisted(node_id: i64, state: NodeState) -> KeeperStateData {
    KeeperStateData {
        node_id,
        current_state: state,
        assigned_state: state,
        ..Default::default()
    }
}

pub struct Harness {
    pub config: Arc<Config>,
    pub local: MockServer,
    pub coordinator: MockServer,
    pub peer: MockServer,
    pub postgres: MockPostgres,
    pub store: MemoryStateStore,
    pub stop: StopSignal,
}

impl Harness {
    pub fn new(grace: &str, state: Option<KeeperStateData>, running: bool) -> Self {
        let store = match state {
            Some(state) => MemoryStateStore::with_state(state),
            None => MemoryStateStore::new(),
        };
        let local = MockServer::new();
        local.on(SETTINGS_SQL, vec![RawRow::from_values(&["t"])]);
        local.on(IN_RECOVERY_SQL, vec![RawRow::from_values(&["t"])]);
        local.on(RECEIVED_LSN_SQL, vec![RawRow::from_values(&["0/3000060"])]);

        Self {
            config: Arc::new(config(grace)),
            local,
            coordinator: MockServer::new(),
            peer: MockServer::new(),
            postgres: MockPostgres::new(running),
            store,
            stop: StopSignal::new(),
        }
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.config.timeouts)
    }

    pub fn coordinator_handle(&self) -> ConnectionHandle {
        ConnectionHandle::new(
            ConnectionClass::Coordinator,
            &self.config.coordinator.conninfo,
            Arc::new(MockConnector::new(self.coordinator.clone())),
            self.retry(),
            self.stop.clone(),
        )
        .unwrap()
    }

    pub fn keeper(&self) -> Keeper {
        let local = ConnectionHandle::new(
            ConnectionClass::Local,
            &self.config.local_conninfo(),
            Arc::new(MockConnector::new(self.local.clone())),
            self.retry(),
            self.stop.clone(),
        )
        .unwrap();

        Keeper::new(
            self.config.clone(),
            local,
            Coordinator::new(self.coordinator_handle()),
            Arc::new(MockConnector::new(self.peer.clone())),
            Arc::new(self.postgres.clone()),
            Arc::new(self.store.clone()),
            self.stop.clone(),
        )
    }

    /// Have the coordinator assign `state` to node `node_id`.
    pub fn assign(&self, node_id: i64, state: NodeState) {
        let node_id = node_id.to_string();
        self.coordinator.on(
            ASSIGNED_SQL,
            vec![RawRow::from_values(&[node_id.as_str(), "0", state.as_str(), "50", "t"])],
        );
    }

    /// Two-node group where `primary` holds the primary role.
    pub fn group(&self, primary: i64) {
        let flag = |id: i64| if id == primary { "t" } else { "f" };
        self.coordinator.on(
            NODES_SQL,
            vec![
                RawRow::from_values(&["1", "node1", "5432", "0/3000060", flag(1)]),
                RawRow::from_values(&["2", "node2", "5432", "0/3000060", flag(2)]),
            ],
        );
    }

    /// What the primary's pg_stat_replication says about our slot.
    pub fn primary_sees(&self, sync_state: &str) {
        self.peer.on(
            SYNC_STATE_SQL,
            vec![RawRow::from_values(&[sync_state, "0/3000060"])],
        );
    }

    /// What the local primary's pg_stat_replication says; `None` for no standby.
    pub fn local_standby(&self, sync_state: Option<&str>) {
        let sync_state = sync_state.unwrap_or("");
        self.local.on(
            SYNC_STATE_SQL,
            vec![RawRow::from_values(&[sync_state, "0/3000060"])],
        );
    }
}
