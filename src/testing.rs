//! In-memory stand-ins for Postgres, used by the unit and integration tests
//!
//! A [`MockServer`] records every statement and answers from canned
//! replies matched by SQL prefix; [`MockConnector`] hands out transports
//! bound to it. [`MockPostgres`] plays the local instance's process.

use crate::common::{Error, Result};
use crate::keeper::node::NodeAddress;
use crate::keeper::pgctl::{LocalPostgres, ReplicationSource};
use crate::pgsql::conninfo::ConnInfo;
use crate::pgsql::result::RawRow;
use crate::pgsql::transport::{Connector, NoticeLevel, Notification, PingStatus, Transport};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// A statement as the server received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<String>,
    pub notice_level: NoticeLevel,
}

#[derive(Debug, Clone)]
struct Failure {
    prefix: String,
    sqlstate: String,
    message: String,
}

impl Failure {
    fn to_error(&self) -> Error {
        Error::QueryFailed {
            sqlstate: self.sqlstate.clone(),
            message: self.message.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct ServerState {
    replies: Vec<(String, Vec<RawRow>)>,
    failures: Vec<Failure>,
    one_shot_failures: Vec<Failure>,
    statements: Vec<Statement>,
    notifications: VecDeque<Notification>,
    down: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
    notify: Arc<Notify>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer statements starting with `prefix` with `rows`. The latest
    /// registration for a prefix wins.
    pub fn on(&self, prefix: &str, rows: Vec<RawRow>) {
        self.state().replies.push((prefix.to_string(), rows));
    }

    /// Fail every statement starting with `prefix`.
    pub fn fail_on(&self, prefix: &str, sqlstate: &str, message: &str) {
        self.state().failures.push(Failure {
            prefix: prefix.to_string(),
            sqlstate: sqlstate.to_string(),
            message: message.to_string(),
        });
    }

    /// Fail the next statement starting with `prefix`.
    pub fn fail_once(&self, prefix: &str, sqlstate: &str, message: &str) {
        self.state().one_shot_failures.push(Failure {
            prefix: prefix.to_string(),
            sqlstate: sqlstate.to_string(),
            message: message.to_string(),
        });
    }

    /// Forget persistent failures registered with [`Self::fail_on`].
    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// A down server answers no ping, accepts no connection and breaks
    /// the live ones.
    pub fn set_down(&self, down: bool) {
        self.state().down = down;
        self.notify.notify_waiters();
    }

    pub fn is_down(&self) -> bool {
        self.state().down
    }

    /// Number of received statements starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.state()
            .statements
            .iter()
            .filter(|s| s.sql.starts_with(prefix))
            .count()
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.state().statements.clone()
    }

    pub fn clear_statements(&self) {
        self.state().statements.clear();
    }

    /// Queue a notification for the next waiting transport.
    pub fn notify(&self, channel: &str, payload: &str) {
        self.state().notifications.push_back(Notification {
            process_id: 0,
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        self.notify.notify_waiters();
    }

    fn run(&self, sql: &str, params: &[&str], notice_level: NoticeLevel) -> Result<Vec<RawRow>> {
        let mut state = self.state();
        if state.down {
            return Err(Error::Unreachable("server closed the connection".into()));
        }

        state.statements.push(Statement {
            sql: sql.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            notice_level,
        });

        if let Some(pos) = state
            .one_shot_failures
            .iter()
            .position(|f| sql.starts_with(&f.prefix))
        {
            let failure = state.one_shot_failures.remove(pos);
            return Err(failure.to_error());
        }
        if let Some(failure) = state.failures.iter().find(|f| sql.starts_with(&f.prefix)) {
            return Err(failure.to_error());
        }

        Ok(state
            .replies
            .iter()
            .rev()
            .find(|(prefix, _)| sql.starts_with(prefix.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    fn pop_notification(&self) -> Option<Notification> {
        self.state().notifications.pop_front()
    }
}

/// A session on a [`MockServer`].
#[derive(Debug)]
pub struct MockTransport {
    server: MockServer,
    notice_level: NoticeLevel,
    closed: bool,
}

impl MockTransport {
    fn check_result<T>(&mut self, result: Result<T>) -> Result<T> {
        if matches!(result, Err(Error::Unreachable(_))) {
            self.closed = true;
        }
        result
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn query(&mut self, sql: &str, params: &[&str]) -> Result<Vec<RawRow>> {
        if self.closed {
            return Err(Error::Unreachable("connection is closed".into()));
        }
        let result = self.server.run(sql, params, self.notice_level);
        self.check_result(result)
    }

    async fn execute(&mut self, sql: &str, params: &[&str]) -> Result<()> {
        self.query(sql, params).await.map(|_| ())
    }

    async fn next_notification(&mut self, timeout: Duration) -> Result<Option<Notification>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let notify = self.server.notify.clone();
        loop {
            let notified = notify.notified();
            if let Some(notification) = self.server.pop_notification() {
                return Ok(Some(notification));
            }
            if self.server.is_down() {
                self.closed = true;
                return Err(Error::Unreachable("server closed the connection".into()));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    fn set_notice_level(&mut self, level: NoticeLevel) {
        self.notice_level = level;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[derive(Debug, Default)]
struct ConnectorState {
    pings: VecDeque<PingStatus>,
    failing_connects: usize,
    ping_count: usize,
    connect_count: usize,
}

#[derive(Debug, Clone)]
pub struct MockConnector {
    server: MockServer,
    state: Arc<Mutex<ConnectorState>>,
}

impl MockConnector {
    pub fn new(server: MockServer) -> Self {
        Self {
            server,
            state: Arc::new(Mutex::new(ConnectorState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, ConnectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn server(&self) -> &MockServer {
        &self.server
    }

    /// Answer the next pings with `statuses`, then with the server's
    /// actual reachability.
    pub fn script_pings(&self, statuses: &[PingStatus]) {
        self.state().pings.extend(statuses.iter().copied());
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_connects(&self, n: usize) {
        self.state().failing_connects = n;
    }

    pub fn ping_count(&self) -> usize {
        self.state().ping_count
    }

    pub fn connect_count(&self) -> usize {
        self.state().connect_count
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn ping(&self, _conninfo: &ConnInfo) -> PingStatus {
        let scripted = {
            let mut state = self.state();
            state.ping_count += 1;
            state.pings.pop_front()
        };
        match scripted {
            Some(status) => status,
            None if self.server.is_down() => PingStatus::NoResponse,
            None => PingStatus::Ok,
        }
    }

    async fn connect(&self, conninfo: &ConnInfo) -> Result<Box<dyn Transport>> {
        {
            let mut state = self.state();
            state.connect_count += 1;
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(Error::Unreachable(format!(
                    "could not connect to \"{}\"",
                    conninfo
                )));
            }
        }
        if self.server.is_down() {
            return Err(Error::Unreachable(format!(
                "could not connect to \"{}\"",
                conninfo
            )));
        }
        Ok(Box::new(MockTransport {
            server: self.server.clone(),
            notice_level: NoticeLevel::Warn,
            closed: false,
        }))
    }
}

#[derive(Debug, Default)]
struct PostgresState {
    running: bool,
    calls: Vec<String>,
    failures: Vec<String>,
}

/// The local instance as far as process control goes.
#[derive(Debug, Clone, Default)]
pub struct MockPostgres {
    state: Arc<Mutex<PostgresState>>,
}

impl MockPostgres {
    pub fn new(running: bool) -> Self {
        let postgres = Self::default();
        postgres.state().running = running;
        postgres
    }

    fn state(&self) -> MutexGuard<'_, PostgresState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn running(&self) -> bool {
        self.state().running
    }

    /// Simulate a crash or an external stop.
    pub fn set_running(&self, running: bool) {
        self.state().running = running;
    }

    /// Operations run so far, in order: `start`, `stop`, `promote`, ...
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn called(&self, call: &str) -> bool {
        self.state().calls.iter().any(|c| c == call)
    }

    /// Fail the next `call` operation.
    pub fn fail_next(&self, call: &str) {
        self.state().failures.push(call.to_string());
    }

    fn record(&self, call: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(call.to_string());
        if let Some(pos) = state.failures.iter().position(|f| f == call) {
            state.failures.remove(pos);
            return Err(Error::Process(format!("{} failed", call)));
        }
        Ok(())
    }
}

#[async_trait]
impl LocalPostgres for MockPostgres {
    async fn is_running(&self) -> Result<bool> {
        Ok(self.running())
    }

    async fn start(&self) -> Result<()> {
        self.record("start")?;
        self.set_running(true);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.record("stop")?;
        self.set_running(false);
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        self.record("restart")?;
        self.set_running(true);
        Ok(())
    }

    async fn promote(&self) -> Result<()> {
        self.record("promote")
    }

    async fn init_standby(&self, _primary: &NodeAddress, _source: &ReplicationSource) -> Result<()> {
        self.record("init_standby")?;
        self.set_running(true);
        Ok(())
    }

    async fn rewind(&self, _primary: &NodeAddress, _source: &ReplicationSource) -> Result<()> {
        self.set_running(false);
        self.record("rewind")?;
        self.set_running(true);
        Ok(())
    }
}
