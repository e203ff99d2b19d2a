//! Resilient connection handle
//!
//! A [`ConnectionHandle`] names one endpoint and owns at most one live
//! transport. It opens on demand, is reused across statements and is closed
//! after any failed statement so the next call starts from scratch.
//!
//! Local endpoints fail fast. Coordinator and peer endpoints ping at the
//! retry poll interval until the server answers, then connect exactly once.

use crate::common::shutdown::StopSignal;
use crate::common::{Error, Result};
use crate::pgsql::conninfo::ConnInfo;
use crate::pgsql::result::{RawRow, ResultContract};
use crate::pgsql::retry::{RetryPolicy, Verdict};
use crate::pgsql::transport::{Connector, NoticeLevel, Notification, PingStatus, Transport};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Which kind of endpoint a handle talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionClass {
    /// The Postgres instance this keeper manages
    Local,
    /// The cluster-wide coordinator (monitor)
    Coordinator,
    /// Another node of the group
    Peer,
}

impl fmt::Display for ConnectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionClass::Local => "local postgres",
            ConnectionClass::Coordinator => "coordinator",
            ConnectionClass::Peer => "peer",
        };
        f.write_str(name)
    }
}

pub struct ConnectionHandle {
    class: ConnectionClass,
    conninfo: ConnInfo,
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    stop: StopSignal,
    transport: Option<Box<dyn Transport>>,
    notice_level: NoticeLevel,
}

impl ConnectionHandle {
    /// Validate the connection string; no network activity happens here.
    pub fn new(
        class: ConnectionClass,
        conninfo: &str,
        connector: Arc<dyn Connector>,
        retry: RetryPolicy,
        stop: StopSignal,
    ) -> Result<Self> {
        Ok(Self {
            class,
            conninfo: ConnInfo::parse(conninfo)?,
            connector,
            retry,
            stop,
            transport: None,
            notice_level: NoticeLevel::Warn,
        })
    }

    pub fn class(&self) -> ConnectionClass {
        self.class
    }

    pub fn conninfo(&self) -> &ConnInfo {
        &self.conninfo
    }

    pub fn is_open(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| !t.is_closed())
    }

    /// Open the transport unless a live one is already held.
    pub async fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        self.transport = None;

        let mut transport = match self.class {
            ConnectionClass::Local => {
                connect_local(self.class, &self.conninfo, self.connector.as_ref()).await?
            }
            ConnectionClass::Coordinator | ConnectionClass::Peer => {
                connect_with_retry(
                    self.class,
                    &self.conninfo,
                    &self.connector,
                    &self.retry,
                    &self.stop,
                )
                .await?
            }
        };
        transport.set_notice_level(self.notice_level);
        self.transport = Some(transport);
        Ok(())
    }

    async fn transport(&mut self) -> Result<&mut Box<dyn Transport>> {
        self.open().await?;
        let conninfo = &self.conninfo;
        self.transport
            .as_mut()
            .ok_or_else(|| Error::Unreachable(format!("no connection to \"{}\"", conninfo)))
    }

    /// Run a statement and return its raw rows.
    pub async fn query(&mut self, sql: &str, params: &[&str]) -> Result<Vec<RawRow>> {
        let result = self.transport().await?.query(sql, params).await;
        self.after_statement(sql, result)
    }

    /// Run a statement and decode its rows through `contract`.
    pub async fn query_as<C: ResultContract>(
        &mut self,
        sql: &str,
        params: &[&str],
        contract: C,
    ) -> Result<C::Output> {
        let rows = self.query(sql, params).await?;
        contract.parse(&rows).map_err(|e| {
            error!("Failed to parse the result of \"{}\": {}", sql, e);
            Error::from(e)
        })
    }

    /// Run a statement whose rows are not needed.
    pub async fn execute(&mut self, sql: &str, params: &[&str]) -> Result<()> {
        let result = self.transport().await?.execute(sql, params).await;
        self.after_statement(sql, result)
    }

    fn after_statement<T>(&mut self, sql: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_duplicate() {
                debug!("{} reported an existing object for \"{}\": {}", self.class, sql, e);
            } else {
                error!("Failed to run SQL query on {} \"{}\": {}", self.class, sql, e);
            }
            self.close();
        }
        result
    }

    /// Log level for server notices on this handle, kept across reconnects.
    pub fn set_notice_level(&mut self, level: NoticeLevel) {
        self.notice_level = level;
        if let Some(transport) = self.transport.as_mut() {
            transport.set_notice_level(level);
        }
    }

    /// Wait for a notification on an open handle. Losing the connection
    /// closes the handle.
    pub(crate) async fn next_notification(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Notification>> {
        let transport = match self.transport.as_mut() {
            Some(transport) => transport,
            None => {
                return Err(Error::Unreachable(format!(
                    "not connected to \"{}\"",
                    self.conninfo
                )))
            }
        };
        let result = transport.next_notification(timeout).await;
        if result.is_err() {
            self.close();
        }
        result
    }

    /// Drop the live transport, if any. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            debug!("Closed connection to {} at \"{}\"", self.class, self.conninfo);
        }
    }
}

async fn connect_local(
    class: ConnectionClass,
    conninfo: &ConnInfo,
    connector: &dyn Connector,
) -> Result<Box<dyn Transport>> {
    connector.connect(conninfo).await.map_err(|e| {
        warn!("Failed to connect to {} at \"{}\": {}", class, conninfo, e);
        Error::LocalFailure(e.to_string())
    })
}

async fn connect_with_retry(
    class: ConnectionClass,
    conninfo: &ConnInfo,
    connector: &Arc<dyn Connector>,
    retry: &RetryPolicy,
    stop: &StopSignal,
) -> Result<Box<dyn Transport>> {
    let what = format!("connect to {} at \"{}\"", class, conninfo);

    retry
        .run(&what, stop, |_| {
            let connector = connector.clone();
            let conninfo = conninfo.clone();
            async move {
                match connector.ping(&conninfo).await {
                    PingStatus::Ok => Verdict::Done(()),
                    PingStatus::NoResponse => Verdict::Retry,
                    PingStatus::Reject => Verdict::Fail(Error::Rejected(format!(
                        "server at \"{}\" rejected the connection",
                        conninfo
                    ))),
                    PingStatus::NoAttempt => Verdict::Fail(Error::LocalFailure(format!(
                        "could not attempt a connection to \"{}\"",
                        conninfo
                    ))),
                }
            }
        })
        .await?;

    // the server answered the ping: one real attempt, failure is final
    connector.connect(conninfo).await.map_err(|e| {
        error!(
            "Failed to connect to {} at \"{}\" after a successful ping: {}",
            class, conninfo, e
        );
        Error::Rejected(e.to_string())
    })
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("class", &self.class)
            .field("conninfo", &self.conninfo)
            .field("open", &self.transport.is_some())
            .finish()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}
