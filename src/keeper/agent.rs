//! The keeper: one node's agent
//!
//! Every cycle the keeper probes the local instance, reports to the
//! coordinator, reads back its assigned state and walks the transition
//! table towards it. Failures are logged and recorded; the same transition
//! is attempted again on the next cycle.

use crate::common::shutdown::StopSignal;
use crate::common::{Config, Error, Result};
use crate::keeper::coordinator::{AssignedState, Coordinator, NodeReport};
use crate::keeper::events::{EventLog, StateTransitionEvent};
use crate::keeper::fsm::{self, Action, Guard, Transition, MAX_HOPS};
use crate::keeper::node::{Node, NodeAddress};
use crate::keeper::pgctl::{LocalPostgres, ReplicationSource};
use crate::keeper::state::NodeState;
use crate::keeper::state_file::{KeeperStateData, StateStore};
use crate::pgsql::connection::{ConnectionClass, ConnectionHandle};
use crate::pgsql::replication::{
    self, probe_replication_status, ReplicationSide, ReplicationStatus, SyncState,
};
use crate::pgsql::retry::RetryPolicy;
use crate::pgsql::sql::UserOptions;
use crate::pgsql::transport::Connector;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub struct Keeper {
    config: Arc<Config>,
    node: Node,
    state: KeeperStateData,
    local: ConnectionHandle,
    coordinator: Coordinator,
    peer_connector: Arc<dyn Connector>,
    peer: Option<(i64, ConnectionHandle)>,
    postgres: Arc<dyn LocalPostgres>,
    store: Arc<dyn StateStore>,
    stop: StopSignal,
    events: EventLog,
    last_error: Option<String>,
    /// Since when a primary has had no healthy standby
    standby_unhealthy_since: Option<Instant>,
}

impl Keeper {
    pub fn new(
        config: Arc<Config>,
        local: ConnectionHandle,
        coordinator: Coordinator,
        peer_connector: Arc<dyn Connector>,
        postgres: Arc<dyn LocalPostgres>,
        store: Arc<dyn StateStore>,
        stop: StopSignal,
    ) -> Self {
        let node = Node::new(
            config.node_name.clone(),
            config.postgres.host.clone(),
            config.postgres.port,
            config.group_id,
        );
        let state = KeeperStateData {
            group_id: config.group_id,
            ..Default::default()
        };

        Self {
            config,
            node,
            state,
            local,
            coordinator,
            peer_connector,
            peer: None,
            postgres,
            store,
            stop,
            events: EventLog::default(),
            last_error: None,
            standby_unhealthy_since: None,
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn state_data(&self) -> &KeeperStateData {
        &self.state
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_sync_rep_disabled(&self) -> bool {
        self.state.sync_rep_disabled
    }

    /// Resume from the persisted state, if any.
    pub async fn load_state(&mut self) -> Result<()> {
        if let Some(state) = self.store.read_state().await? {
            info!(
                "Resuming as node {} in state \"{}\" (assigned \"{}\")",
                state.node_id, state.current_state, state.assigned_state
            );
            self.node.node_id = state.node_id;
            self.node.group_id = state.group_id;
            self.node.reported = state.current_state;
            self.node.assigned = state.assigned_state;
            self.state = state;
        }
        Ok(())
    }

    async fn save_state(&mut self) -> Result<()> {
        self.state.node_id = self.node.node_id;
        self.state.group_id = self.node.group_id;
        self.state.current_state = self.node.reported;
        self.state.assigned_state = self.node.assigned;
        self.store.write_state(&self.state).await
    }

    /// Register with the coordinator unless the node already has an id.
    pub async fn register(&mut self) -> Result<()> {
        if self.node.is_registered() {
            return Ok(());
        }
        let config = self.config.clone();
        let assigned = self
            .coordinator
            .register_node(
                &config.formation,
                &config.postgres.host,
                config.postgres.port,
                &config.postgres.dbname,
                Some(config.group_id),
                self.node.reported,
            )
            .await?;

        self.apply_assignment(&assigned);
        self.save_state().await
    }

    fn apply_assignment(&mut self, assigned: &AssignedState) {
        self.node.node_id = assigned.node_id;
        self.node.group_id = assigned.group_id;
        self.node.assigned = assigned.state;
        self.state.last_monitor_contact = Some(Utc::now());
    }

    /// One keeper cycle. Returns the state reached.
    pub async fn step(&mut self) -> Result<NodeState> {
        self.register().await?;

        // probe failures are not fatal, we report what we know
        self.update_pg_state().await;

        let assigned = match self.report().await {
            Ok(assigned) => assigned,
            Err(e) => {
                error!("Failed to get the assigned state from the coordinator: {}", e);
                self.last_error = Some(e.to_string());
                return Err(e);
            }
        };
        self.apply_assignment(&assigned);

        let result = if self.node.assigned != self.node.reported {
            self.reach_assigned_state().await
        } else {
            self.ensure_current_state().await;
            Ok(())
        };

        if self.node.reported != NodeState::Primary {
            // the grace period restarts from scratch on the next promotion
            self.standby_unhealthy_since = None;
        } else if result.is_ok() {
            if let Err(e) = self.check_sync_rep_grace().await {
                warn!("Failed to adjust synchronous replication: {}", e);
            }
        }

        if let Err(e) = self.save_state().await {
            error!("Failed to write the keeper state file: {}", e);
            return Err(e);
        }

        result.map(|_| self.node.reported)
    }

    async fn report(&mut self) -> Result<AssignedState> {
        let config = self.config.clone();
        let report = NodeReport {
            formation: &config.formation,
            host: &config.postgres.host,
            port: config.postgres.port,
            node_id: self.node.node_id,
            group_id: self.node.group_id,
            current_state: self.node.reported,
            pg_is_running: self.node.pg_is_running,
            current_lsn: self.node.replication.lsn(),
            sync_state: self.node.replication.sync_state,
        };
        self.coordinator.node_active(&report).await
    }

    /// Refresh `pg_is_running` and the replication status of the node.
    async fn update_pg_state(&mut self) {
        self.node.pg_is_running = match self.postgres.is_running().await {
            Ok(running) => running,
            Err(e) => {
                warn!("Failed to check whether Postgres is running: {}", e);
                false
            }
        };

        let side = match self.node.replication_side() {
            Some(side) if self.node.pg_is_running => side,
            _ => {
                let last_sync = self.node.replication.sync_state;
                self.node.replication = ReplicationStatus {
                    sync_state: last_sync,
                    ..Default::default()
                };
                return;
            }
        };

        let slot_name = self.config.replication.slot_name.clone();
        match side {
            ReplicationSide::Primary => {
                match probe_replication_status(&mut self.local, side, &slot_name).await {
                    Ok(status) => self.node.replication = status,
                    Err(Error::NoStandby(_)) => {
                        self.node.replication = ReplicationStatus::default();
                    }
                    Err(e) => {
                        warn!("Failed to probe replication on the primary: {}", e);
                        self.node.replication = ReplicationStatus::default();
                    }
                }
            }
            ReplicationSide::Standby => {
                let last_sync = self.node.replication.sync_state;
                let mut status =
                    match probe_replication_status(&mut self.local, side, &slot_name).await {
                        Ok(status) => status,
                        Err(Error::NoUpstream) => {
                            debug!("Standby is not receiving WAL yet");
                            ReplicationStatus::default()
                        }
                        Err(e) => {
                            warn!("Failed to probe replication on the standby: {}", e);
                            ReplicationStatus::default()
                        }
                    };
                status.sync_state = match self.probe_sync_state_on_primary(&slot_name).await {
                    Ok(sync_state) => sync_state,
                    Err(e) => {
                        debug!(
                            "Keeping last known sync state \"{}\": {}",
                            last_sync, e
                        );
                        last_sync
                    }
                };
                self.node.replication = status;
            }
        }
    }

    /// Ask the primary how it sees this standby.
    async fn probe_sync_state_on_primary(&mut self, slot_name: &str) -> Result<SyncState> {
        let primary = self.primary_address().await?;
        let peer = self.peer_handle(&primary)?;
        let probe = replication::get_sync_state_and_current_lsn(peer, slot_name, true).await?;
        Ok(probe.sync_state)
    }

    fn peer_handle(&mut self, primary: &NodeAddress) -> Result<&mut ConnectionHandle> {
        let reuse = matches!(&self.peer, Some((id, _)) if *id == primary.node_id);
        if !reuse {
            let conninfo = primary.conninfo(&self.config.postgres.dbname, None);
            let retry = RetryPolicy::new(
                self.config.timeouts.retry_poll_interval,
                self.config.timeouts.connect_timeout,
            );
            let handle = ConnectionHandle::new(
                ConnectionClass::Peer,
                &conninfo,
                self.peer_connector.clone(),
                retry,
                self.stop.clone(),
            )?;
            self.peer = Some((primary.node_id, handle));
        }
        match self.peer.as_mut() {
            Some((_, handle)) => Ok(handle),
            None => Err(Error::NoUpstream),
        }
    }

    /// Address of the other node currently acting as primary.
    async fn primary_address(&mut self) -> Result<NodeAddress> {
        let group = self
            .coordinator
            .get_nodes(&self.config.formation, self.node.group_id)
            .await?;
        match group.primary()? {
            Some(primary) if primary.address.node_id != self.node.node_id => {
                Ok(primary.address.clone())
            }
            _ => Err(Error::NoUpstream),
        }
    }

    /// Walk the transition table until the assigned state is reached.
    async fn reach_assigned_state(&mut self) -> Result<()> {
        for _ in 0..MAX_HOPS {
            if self.node.reported == self.node.assigned {
                return Ok(());
            }
            if self.stop.is_fast() {
                return Err(Error::Cancelled);
            }

            let transition = match fsm::find_transition(self.node.reported, self.node.assigned) {
                Some(transition) => transition,
                None => {
                    let e = Error::InvalidTransition {
                        from: self.node.reported,
                        to: self.node.assigned,
                    };
                    error!("{}", e);
                    self.last_error = Some(e.to_string());
                    return Err(e);
                }
            };

            info!(
                "FSM transition from \"{}\" to \"{}\": {}",
                transition.current, transition.next, transition.comment
            );

            let outcome = match self.check_guard(transition) {
                Ok(()) => self.run_action(transition).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    self.node.reported = transition.next;
                    self.last_error = None;
                    self.events.push(StateTransitionEvent::succeeded(
                        self.node.node_id,
                        transition.current,
                        transition.next,
                        transition.comment,
                    ));
                    info!(
                        "Transition complete: current state is now \"{}\"",
                        self.node.reported
                    );
                    self.save_state().await?;
                }
                Err(e) => {
                    error!(
                        "Failed to transition from state \"{}\" to state \"{}\": {}",
                        transition.current, transition.next, e
                    );
                    self.last_error = Some(e.to_string());
                    self.events.push(StateTransitionEvent::failed(
                        self.node.node_id,
                        transition.current,
                        transition.next,
                        transition.comment,
                        e.to_string(),
                    ));
                    return Err(e);
                }
            }
        }

        if self.node.reported == self.node.assigned {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.node.reported,
                to: self.node.assigned,
            })
        }
    }

    fn check_guard(&self, transition: &Transition) -> Result<()> {
        match transition.guard {
            Guard::None => Ok(()),
            Guard::SyncStandby => {
                let sync_state = self.node.replication.sync_state;
                if sync_state.is_synchronous() {
                    Ok(())
                } else {
                    Err(Error::NotPromotable(format!(
                        "last known sync state is \"{}\"",
                        sync_state
                    )))
                }
            }
        }
    }

    fn replication_source(&self) -> ReplicationSource {
        let replication = &self.config.replication;
        ReplicationSource {
            username: replication.username.clone(),
            password: replication.password.clone(),
            slot_name: replication.slot_name.clone(),
            dbname: self.config.postgres.dbname.clone(),
        }
    }

    async fn start_postgres(&mut self) -> Result<()> {
        if !self.postgres.is_running().await? {
            self.postgres.start().await?;
        }
        self.node.pg_is_running = true;
        Ok(())
    }

    async fn stop_postgres(&mut self) -> Result<()> {
        self.local.close();
        self.postgres.stop().await?;
        self.node.pg_is_running = false;
        Ok(())
    }

    async fn promote(&mut self) -> Result<()> {
        if self.local.is_in_recovery().await? {
            self.postgres.promote().await?;
            // a promoted server no longer answers on the old session reliably
            self.local.close();
        }
        self.peer = None;
        Ok(())
    }

    async fn init_primary(&mut self) -> Result<()> {
        self.start_postgres().await?;

        if !self.local.check_postgresql_settings().await? {
            warn!("Postgres settings are not ready for streaming replication");
        }

        let replication = self.config.replication.clone();
        self.local
            .create_user(
                &replication.username,
                &UserOptions {
                    password: replication.password.as_deref(),
                    login: true,
                    replication: true,
                    ..Default::default()
                },
            )
            .await?;

        if let Some(database) = &replication.database {
            let owner = self.local.current_setting("session_authorization").await?;
            self.local.create_database(database, &owner).await?;
        }
        for extension in &replication.extensions {
            self.local.create_extension(extension).await?;
        }
        Ok(())
    }

    async fn rewind_or_init(&mut self) -> Result<()> {
        let primary = self.primary_address().await?;
        let source = self.replication_source();

        self.local.close();
        if let Err(e) = self.postgres.rewind(&primary, &source).await {
            warn!("Failed to rewind, running a base backup instead: {}", e);
            self.postgres.init_standby(&primary, &source).await?;
        }
        self.node.pg_is_running = true;
        Ok(())
    }

    async fn set_sync_rep(&mut self, enabled: bool) -> Result<()> {
        if enabled {
            self.local.enable_synchronous_replication().await?;
        } else {
            self.local.disable_synchronous_replication().await?;
        }
        self.state.sync_rep_disabled = !enabled;
        self.state.last_sync_rep_change = Some(Utc::now());
        Ok(())
    }

    async fn run_action(&mut self, transition: &Transition) -> Result<()> {
        let slot_name = self.config.replication.slot_name.clone();

        match transition.action {
            Action::None | Action::ReportLsn => Ok(()),
            Action::InitPrimary => self.init_primary().await,
            Action::DisableReplication => {
                self.local.drop_replication_slot(&slot_name, true).await?;
                self.set_sync_rep(false).await
            }
            Action::StopPostgres | Action::StartMaintenance => self.stop_postgres().await,
            Action::StartPostgres => self.start_postgres().await,
            Action::RestartStandby => {
                self.local.close();
                if self.postgres.is_running().await? {
                    self.postgres.restart().await?;
                } else {
                    self.postgres.start().await?;
                }
                self.node.pg_is_running = true;
                Ok(())
            }
            Action::ResumeAsPrimary => {
                self.start_postgres().await?;
                self.set_sync_rep(false).await?;
                self.local.set_default_transaction_read_write().await
            }
            Action::PromoteStandby => {
                self.start_postgres().await?;
                self.promote().await?;
                if transition.next != NodeState::Single {
                    // the former primary will need it once it follows us
                    self.local.create_replication_slot(&slot_name).await?;
                }
                self.local.set_default_transaction_read_write().await
            }
            Action::PrepareReplication => self.local.create_replication_slot(&slot_name).await,
            Action::DisableSyncRep => self.set_sync_rep(false).await,
            Action::EnableSyncRep => self.set_sync_rep(true).await,
            Action::PromoteStandbyToPrimary => {
                self.local.set_default_transaction_read_write().await
            }
            Action::InitStandby => {
                let primary = self.primary_address().await?;
                let source = self.replication_source();
                self.local.close();
                self.postgres.init_standby(&primary, &source).await?;
                self.node.pg_is_running = true;
                Ok(())
            }
            Action::RewindOrInit => {
                self.rewind_or_init().await?;
                // the slot we kept as primary would retain WAL forever
                self.local.drop_replication_slot(&slot_name, true).await
            }
            Action::FollowNewPrimary => self.rewind_or_init().await,
            Action::PrepareStandbyForPromotion => {
                self.start_postgres().await?;
                self.local.checkpoint().await
            }
            Action::StopReplication => {
                self.promote().await?;
                self.local.set_default_transaction_read_only().await
            }
        }
    }

    /// Start or stop Postgres as the current state expects.
    async fn ensure_current_state(&mut self) {
        let result = match self.node.reported.expects_running() {
            Some(true) if !self.node.pg_is_running => {
                info!(
                    "Postgres should be running in state \"{}\", starting it",
                    self.node.reported
                );
                self.start_postgres().await
            }
            Some(false) if self.node.pg_is_running => {
                info!(
                    "Postgres should not be running in state \"{}\", stopping it",
                    self.node.reported
                );
                self.stop_postgres().await
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            warn!(
                "Failed to ensure current state \"{}\": Postgres {} running: {}",
                self.node.reported,
                if self.node.pg_is_running { "is" } else { "is not" },
                e
            );
        }
    }

    /// A primary without a healthy standby for longer than the grace period
    /// stops waiting for one; a standby coming back turns sync rep on again.
    async fn check_sync_rep_grace(&mut self) -> Result<()> {
        if !self.node.pg_is_running {
            return Ok(());
        }

        if self.node.replication.has_active_replica {
            self.standby_unhealthy_since = None;
            if self.state.sync_rep_disabled {
                info!("A standby is connected again, re-enabling synchronous replication");
                self.set_sync_rep(true).await?;
            }
            return Ok(());
        }

        let since = *self
            .standby_unhealthy_since
            .get_or_insert_with(Instant::now);
        let grace = self.config.timeouts.sync_rep_grace_period;
        if !self.state.sync_rep_disabled && since.elapsed() >= grace {
            warn!(
                "No healthy standby for {:?}, disabling synchronous replication",
                since.elapsed()
            );
            self.set_sync_rep(false).await?;
        }
        Ok(())
    }

    /// Close every connection held by the keeper.
    pub fn close(&mut self) {
        self.local.close();
        self.coordinator.close();
        self.peer = None;
    }
}
