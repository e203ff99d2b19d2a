//! Client side of the coordinator (monitor) SQL API

use crate::common::{Error, Result};
use crate::keeper::node::{Group, GroupMember, NodeAddress};
use crate::keeper::state::NodeState;
use crate::pgsql::connection::ConnectionHandle;
use crate::pgsql::replication::{Lsn, SyncState};
use crate::pgsql::result::{ParseError, RawRow, Rows};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Schema holding the coordinator's functions.
pub const COORDINATOR_SCHEMA: &str = "pgautofailover";

/// Extension that must be preloaded on the coordinator.
pub const COORDINATOR_EXTENSION: &str = "pgautofailover";

const REGISTER_NODE_SQL: &str = "\
SELECT assigned_node_id, assigned_group_id, assigned_group_state::text, \
assigned_candidate_priority, assigned_replication_quorum \
FROM pgautofailover.register_node($1, $2, $3::int, $4, $5::int, \
$6::pgautofailover.replication_state)";

const NODE_ACTIVE_SQL: &str = "\
SELECT assigned_node_id, assigned_group_id, assigned_group_state::text, \
assigned_candidate_priority, assigned_replication_quorum \
FROM pgautofailover.node_active($1, $2, $3::int, $4::int, $5::int, \
$6::pgautofailover.replication_state, $7::bool, $8::pg_lsn, $9)";

const GET_NODES_SQL: &str = "\
SELECT node_id, node_name, node_port, node_lsn, node_is_primary \
FROM pgautofailover.get_nodes($1, $2::int)";

const LAST_EVENTS_SQL: &str = "\
SELECT eventid, eventtime::text, formationid, nodeid, groupid, \
reportedstate::text, goalstate::text, description \
FROM pgautofailover.last_events($1, $2::int, $3::int)";

/// The coordinator's answer to a registration or a node report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedState {
    pub node_id: i64,
    pub group_id: i32,
    pub state: NodeState,
    pub candidate_priority: i32,
    pub replication_quorum: bool,
}

/// What a node tells the coordinator on every cycle.
#[derive(Debug, Clone)]
pub struct NodeReport<'a> {
    pub formation: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub node_id: i64,
    pub group_id: i32,
    pub current_state: NodeState,
    pub pg_is_running: bool,
    pub current_lsn: Option<Lsn>,
    pub sync_state: SyncState,
}

/// An entry of the coordinator's event table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorEvent {
    pub event_id: i64,
    pub event_time: String,
    pub formation: String,
    pub node_id: i64,
    pub group_id: i32,
    pub reported_state: NodeState,
    pub goal_state: NodeState,
    pub description: String,
}

fn parse_field<T: std::str::FromStr>(
    row: &RawRow,
    index: usize,
    column: &'static str,
) -> std::result::Result<T, ParseError> {
    let value = row.required(index, column)?;
    value.parse().map_err(|_| ParseError::InvalidValue {
        value: value.to_string(),
        expected: column,
    })
}

fn parse_bool(value: &str, column: &'static str) -> std::result::Result<bool, ParseError> {
    match value {
        "t" | "true" => Ok(true),
        "f" | "false" => Ok(false),
        other => Err(ParseError::InvalidValue {
            value: other.to_string(),
            expected: column,
        }),
    }
}

fn parse_assigned_state(rows: &[RawRow]) -> std::result::Result<AssignedState, ParseError> {
    if rows.len() != 1 {
        return Err(ParseError::RowCount {
            expected: 1,
            actual: rows.len(),
        });
    }
    let row = &rows[0];
    if row.len() != 5 {
        return Err(ParseError::ColumnCount {
            expected: 5,
            actual: row.len(),
        });
    }
    Ok(AssignedState {
        node_id: parse_field(row, 0, "assigned_node_id")?,
        group_id: parse_field(row, 1, "assigned_group_id")?,
        state: row.required(2, "assigned_group_state")?.parse()?,
        candidate_priority: parse_field(row, 3, "assigned_candidate_priority")?,
        replication_quorum: parse_bool(
            row.required(4, "assigned_replication_quorum")?,
            "assigned_replication_quorum",
        )?,
    })
}

fn parse_group_members(rows: &[RawRow]) -> std::result::Result<Vec<GroupMember>, ParseError> {
    rows.iter()
        .map(|row| {
            if row.len() != 5 {
                return Err(ParseError::ColumnCount {
                    expected: 5,
                    actual: row.len(),
                });
            }
            Ok(GroupMember {
                address: NodeAddress {
                    node_id: parse_field(row, 0, "node_id")?,
                    host: row.required(1, "node_name")?.to_string(),
                    port: parse_field(row, 2, "node_port")?,
                },
                lsn: row.get(3).map(str::parse).transpose()?,
                is_primary: parse_bool(row.required(4, "node_is_primary")?, "node_is_primary")?,
            })
        })
        .collect()
}

fn parse_events(rows: &[RawRow]) -> std::result::Result<Vec<CoordinatorEvent>, ParseError> {
    rows.iter()
        .map(|row| {
            if row.len() != 8 {
                return Err(ParseError::ColumnCount {
                    expected: 8,
                    actual: row.len(),
                });
            }
            Ok(CoordinatorEvent {
                event_id: parse_field(row, 0, "eventid")?,
                event_time: row.required(1, "eventtime")?.to_string(),
                formation: row.required(2, "formationid")?.to_string(),
                node_id: parse_field(row, 3, "nodeid")?,
                group_id: parse_field(row, 4, "groupid")?,
                reported_state: row.required(5, "reportedstate")?.parse()?,
                goal_state: row.required(6, "goalstate")?.parse()?,
                description: row.get(7).unwrap_or_default().to_string(),
            })
        })
        .collect()
}

/// Coordinator connection and the calls the keeper makes on it.
#[derive(Debug)]
pub struct Coordinator {
    handle: ConnectionHandle,
}

impl Coordinator {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self { handle }
    }

    /// Is the coordinator extension preloaded on the coordinator?
    pub async fn check_settings(&mut self) -> Result<bool> {
        self.handle
            .check_coordinator_settings(COORDINATOR_EXTENSION)
            .await
    }

    /// Register the node; `group_id` of `None` lets the coordinator pick.
    pub async fn register_node(
        &mut self,
        formation: &str,
        host: &str,
        port: u16,
        dbname: &str,
        group_id: Option<i32>,
        initial_state: NodeState,
    ) -> Result<AssignedState> {
        let port = port.to_string();
        let group = group_id.unwrap_or(-1).to_string();
        let assigned = self
            .handle
            .query_as(
                REGISTER_NODE_SQL,
                &[formation, host, &port, dbname, &group, initial_state.as_str()],
                Rows(parse_assigned_state),
            )
            .await?;

        info!(
            "Registered node {}:{} with id {} in formation \"{}\", group {}, assigned state \"{}\"",
            host, port, assigned.node_id, formation, assigned.group_id, assigned.state
        );
        Ok(assigned)
    }

    /// Report the node's state and get its assigned state back.
    pub async fn node_active(&mut self, report: &NodeReport<'_>) -> Result<AssignedState> {
        let port = report.port.to_string();
        let node_id = report.node_id.to_string();
        let group_id = report.group_id.to_string();
        let pg_is_running = report.pg_is_running.to_string();
        let lsn = report.current_lsn.unwrap_or(Lsn::ZERO).to_string();

        info!(
            "Calling node_active for node {}/{}/{} with current state: {}, \
             PostgreSQL is running is {}, sync_state is \"{}\", latest WAL LSN is {}.",
            report.formation,
            report.node_id,
            report.group_id,
            report.current_state,
            report.pg_is_running,
            report.sync_state.as_str(),
            lsn
        );

        let assigned = self
            .handle
            .query_as(
                NODE_ACTIVE_SQL,
                &[
                    report.formation,
                    report.host,
                    &port,
                    &node_id,
                    &group_id,
                    report.current_state.as_str(),
                    &pg_is_running,
                    &lsn,
                    report.sync_state.as_str(),
                ],
                Rows(parse_assigned_state),
            )
            .await?;

        if assigned.node_id != report.node_id && report.node_id >= 0 {
            return Err(Error::ProtocolViolation(format!(
                "coordinator answered for node {} instead of node {}",
                assigned.node_id, report.node_id
            )));
        }
        debug!("Assigned state is \"{}\"", assigned.state);
        Ok(assigned)
    }

    pub async fn get_nodes(&mut self, formation: &str, group_id: i32) -> Result<Group> {
        let group = group_id.to_string();
        let members = self
            .handle
            .query_as(GET_NODES_SQL, &[formation, &group], Rows(parse_group_members))
            .await?;
        Ok(Group {
            formation: formation.to_string(),
            group_id,
            members,
        })
    }

    pub async fn last_events(
        &mut self,
        formation: &str,
        group_id: i32,
        count: u32,
    ) -> Result<Vec<CoordinatorEvent>> {
        let group = group_id.to_string();
        let count = count.to_string();
        self.handle
            .query_as(LAST_EVENTS_SQL, &[formation, &group, &count], Rows(parse_events))
            .await
    }

    pub fn close(&mut self) {
        self.handle.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::shutdown::StopSignal;
    use crate::pgsql::connection::ConnectionClass;
    use crate::pgsql::retry::RetryPolicy;
    use crate::testing::{MockConnector, MockServer};
    use std::sync::Arc;

    fn coordinator(server: &MockServer) -> Coordinator {
        Coordinator::new(
            ConnectionHandle::new(
                ConnectionClass::Coordinator,
                "postgresql://autoctl@monitor/pg_auto_failover",
                Arc::new(MockConnector::new(server.clone())),
                RetryPolicy::default(),
                StopSignal::new(),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_node_active() {
        let server = MockServer::new();
        server.on(
            "SELECT assigned_node_id",
            vec![RawRow::from_values(&["2", "0", "prepare_promotion", "50", "t"])],
        );
        let mut c = coordinator(&server);

        let assigned = c
            .node_active(&NodeReport {
                formation: "default",
                host: "node2",
                port: 5432,
                node_id: 2,
                group_id: 0,
                current_state: NodeState::Secondary,
                pg_is_running: true,
                current_lsn: Some("0/3000060".parse().unwrap()),
                sync_state: SyncState::Sync,
            })
            .await
            .unwrap();

        assert_eq!(assigned.state, NodeState::PreparePromotion);
        assert_eq!(assigned.candidate_priority, 50);
        assert!(assigned.replication_quorum);

        let call = &server.statements()[0];
        assert!(call.sql.contains("pgautofailover.node_active"));
        assert_eq!(
            call.params,
            vec!["default", "node2", "5432", "2", "0", "secondary", "true", "0/3000060", "sync"]
        );
    }

    #[tokio::test]
    async fn test_node_active_unknown_state() {
        let server = MockServer::new();
        server.on(
            "SELECT assigned_node_id",
            vec![RawRow::from_values(&["2", "0", "promoted", "50", "t"])],
        );
        let mut c = coordinator(&server);
        let report = NodeReport {
            formation: "default",
            host: "node2",
            port: 5432,
            node_id: 2,
            group_id: 0,
            current_state: NodeState::Secondary,
            pg_is_running: true,
            current_lsn: None,
            sync_state: SyncState::NotConfigured,
        };
        assert!(matches!(c.node_active(&report).await, Err(Error::Parse(_))));
    }

    #[tokio::test]
    async fn test_register_node() {
        let server = MockServer::new();
        server.on(
            "SELECT assigned_node_id",
            vec![RawRow::from_values(&["1", "0", "single", "100", "t"])],
        );
        let mut c = coordinator(&server);
        let assigned = c
            .register_node("default", "node1", 5432, "postgres", None, NodeState::Init)
            .await
            .unwrap();
        assert_eq!(assigned.node_id, 1);
        assert_eq!(assigned.state, NodeState::Single);
        assert_eq!(server.statements()[0].params[4], "-1");
    }

    #[tokio::test]
    async fn test_get_nodes() {
        let server = MockServer::new();
        server.on(
            "SELECT node_id",
            vec![
                RawRow::from_values(&["1", "node1", "5432", "0/3000060", "t"]),
                RawRow::new(vec![
                    Some("2".into()),
                    Some("node2".into()),
                    Some("5432".into()),
                    None,
                    Some("f".into()),
                ]),
            ],
        );
        let mut c = coordinator(&server);
        let group = c.get_nodes("default", 0).await.unwrap();
        assert_eq!(group.members.len(), 2);
        assert_eq!(group.primary().unwrap().unwrap().address.host, "node1");
        assert_eq!(group.members[1].lsn, None);
    }

    #[tokio::test]
    async fn test_last_events() {
        let server = MockServer::new();
        server.on(
            "SELECT eventid",
            vec![RawRow::from_values(&[
                "12",
                "2026-10-19 10:00:00+00",
                "default",
                "1",
                "0",
                "wait_primary",
                "primary",
                "Setting goal state of node 1 to primary",
            ])],
        );
        let mut c = coordinator(&server);
        let events = c.last_events("default", 0, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].goal_state, NodeState::Primary);
    }

    #[tokio::test]
    async fn test_check_settings() {
        let server = MockServer::new();
        server.on("select exists", vec![RawRow::from_values(&["t"])]);
        let mut c = coordinator(&server);

        assert!(c.check_settings().await.unwrap());
        assert_eq!(
            server.statements()[0].params,
            vec![COORDINATOR_EXTENSION.to_string()]
        );
    }
}
