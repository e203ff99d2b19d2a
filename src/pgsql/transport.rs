//! Transport seam between the connection layer and the database driver
//!
//! [`Connector`] pings and opens endpoints, [`Transport`] runs statements on
//! one live connection. [`PgConnector`] implements both over
//! `tokio-postgres`; the `testing` module provides scripted versions.

use crate::common::{Error, Result};
use crate::pgsql::conninfo::ConnInfo;
use crate::pgsql::result::RawRow;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::error::Error as StdError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_postgres::error::SqlState;
use tokio_postgres::tls::NoTlsStream;
use tokio_postgres::types::{FromSql, Kind, PgLsn, ToSql, Type};
use tokio_postgres::{AsyncMessage, Client, Connection, NoTls, Row, Socket};
use tracing::{debug, warn};

/// Outcome of a liveness probe, mirroring libpq's `PQping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingStatus {
    /// Server is accepting connections
    Ok,
    /// Server answered but refuses us (authentication, unknown database)
    Reject,
    /// Nothing answered yet, or the server is still starting up
    NoResponse,
    /// The client could not even try (bad connection parameters)
    NoAttempt,
}

/// Log level used for server notices received on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Warn,
    Debug,
}

/// Asynchronous notification received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

/// One live connection.
#[async_trait]
pub trait Transport: Send {
    /// Run a statement and return every row, fully drained.
    async fn query(&mut self, sql: &str, params: &[&str]) -> Result<Vec<RawRow>>;

    /// Run a statement whose rows are not needed.
    async fn execute(&mut self, sql: &str, params: &[&str]) -> Result<()>;

    /// Wait up to `timeout` for a notification. `Ok(None)` on timeout.
    async fn next_notification(&mut self, timeout: Duration) -> Result<Option<Notification>>;

    fn set_notice_level(&mut self, level: NoticeLevel);

    fn is_closed(&self) -> bool;
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Cheap liveness probe, no session is kept.
    async fn ping(&self, conninfo: &ConnInfo) -> PingStatus;

    async fn connect(&self, conninfo: &ConnInfo) -> Result<Box<dyn Transport>>;
}

/// Map a SQLSTATE received while pinging to a ping outcome.
pub fn classify_ping_sqlstate(sqlstate: Option<&str>) -> PingStatus {
    match sqlstate {
        None => PingStatus::NoResponse,
        Some(code) if code == SqlState::CANNOT_CONNECT_NOW.code() => PingStatus::NoResponse,
        Some(code) if code == SqlState::TOO_MANY_CONNECTIONS.code() => PingStatus::NoResponse,
        Some(_) => PingStatus::Reject,
    }
}

/// [`Connector`] over `tokio-postgres`, without TLS.
#[derive(Debug, Clone)]
pub struct PgConnector {
    connect_timeout: Duration,
}

impl PgConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for PgConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn ping(&self, conninfo: &ConnInfo) -> PingStatus {
        let mut config = match conninfo.to_config() {
            Ok(config) => config,
            Err(_) => return PingStatus::NoAttempt,
        };
        config.connect_timeout(self.connect_timeout);

        match config.connect(NoTls).await {
            // dropping the client and the connection closes the session
            Ok(_) => PingStatus::Ok,
            Err(e) => classify_ping_sqlstate(e.code().map(|c| c.code())),
        }
    }

    async fn connect(&self, conninfo: &ConnInfo) -> Result<Box<dyn Transport>> {
        let mut config = conninfo.to_config()?;
        config.connect_timeout(self.connect_timeout);

        debug!("Connecting to \"{}\"", conninfo);
        let (client, connection) = config.connect(NoTls).await.map_err(|e| match e.as_db_error() {
            Some(db) => Error::Rejected(format!("[{}] {}", db.code().code(), db.message())),
            None => Error::Unreachable(e.to_string()),
        })?;

        let quiet = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive_connection(
            connection,
            tx,
            quiet.clone(),
            conninfo.to_string(),
        ));

        Ok(Box::new(PgTransport {
            client,
            notifications: rx,
            quiet,
        }))
    }
}

/// Poll the connection: route notices into the logs and notifications to
/// the transport.
async fn drive_connection(
    mut connection: Connection<Socket, NoTlsStream>,
    notifications: mpsc::UnboundedSender<Notification>,
    quiet: Arc<AtomicBool>,
    endpoint: String,
) {
    let mut messages = futures_util::stream::poll_fn(move |cx| connection.poll_message(cx));

    while let Some(message) = messages.next().await {
        match message {
            Ok(AsyncMessage::Notice(notice)) => {
                if quiet.load(Ordering::Relaxed) {
                    debug!("{}: {}", notice.severity(), notice.message());
                } else {
                    warn!("{}: {}", notice.severity(), notice.message());
                }
            }
            Ok(AsyncMessage::Notification(n)) => {
                let _ = notifications.send(Notification {
                    process_id: n.process_id(),
                    channel: n.channel().to_string(),
                    payload: n.payload().to_string(),
                });
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Connection to \"{}\" failed: {}", endpoint, e);
                break;
            }
        }
    }

    debug!("Disconnected from \"{}\"", endpoint);
}

/// [`Transport`] over a `tokio-postgres` client.
pub struct PgTransport {
    client: Client,
    notifications: mpsc::UnboundedReceiver<Notification>,
    quiet: Arc<AtomicBool>,
}

impl PgTransport {
    async fn query_text_params(&self, sql: &str, params: &[&str]) -> Result<Vec<Row>> {
        // every parameter is sent as text and cast server side, like libpq
        // callers passing TEXTOID parameter types
        let typed: Vec<(&(dyn ToSql + Sync), Type)> = params
            .iter()
            .map(|p| (p as &(dyn ToSql + Sync), Type::TEXT))
            .collect();

        self.client
            .query_typed(sql, &typed)
            .await
            .map_err(map_driver_error)
    }
}

#[async_trait]
impl Transport for PgTransport {
    async fn query(&mut self, sql: &str, params: &[&str]) -> Result<Vec<RawRow>> {
        let rows = self.query_text_params(sql, params).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute(&mut self, sql: &str, params: &[&str]) -> Result<()> {
        if params.is_empty() {
            // simple protocol: drains every result of a multi-statement string
            self.client
                .batch_execute(sql)
                .await
                .map_err(map_driver_error)
        } else {
            self.query_text_params(sql, params).await.map(|_| ())
        }
    }

    async fn next_notification(&mut self, timeout: Duration) -> Result<Option<Notification>> {
        match tokio::time::timeout(timeout, self.notifications.recv()).await {
            Ok(Some(notification)) => Ok(Some(notification)),
            Ok(None) => Err(Error::Unreachable(
                "connection closed while waiting for notifications".into(),
            )),
            Err(_) => Ok(None),
        }
    }

    fn set_notice_level(&mut self, level: NoticeLevel) {
        self.quiet
            .store(level == NoticeLevel::Debug, Ordering::Relaxed);
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

fn map_driver_error(e: tokio_postgres::Error) -> Error {
    if let Some(db) = e.as_db_error() {
        return Error::QueryFailed {
            sqlstate: db.code().code().to_string(),
            message: db.message().to_string(),
        };
    }
    if e.is_closed() {
        return Error::Unreachable(format!("connection closed: {}", e));
    }
    match e.source() {
        Some(source) if source.is::<std::io::Error>() => Error::Unreachable(e.to_string()),
        _ => Error::ProtocolViolation(e.to_string()),
    }
}

fn decode_row(row: &Row) -> Result<RawRow> {
    let columns = (0..row.len())
        .map(|i| {
            row.try_get::<_, Option<TextValue>>(i)
                .map(|v| v.map(|t| t.0))
                .map_err(|e| {
                    Error::ProtocolViolation(format!(
                        "column \"{}\": {}",
                        row.columns()[i].name(),
                        e
                    ))
                })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(RawRow::new(columns))
}

/// Text rendering of a column, matching what `psql` would print.
struct TextValue(String);

impl<'a> FromSql<'a> for TextValue {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        let text = match *ty {
            Type::BOOL => {
                if bool::from_sql(ty, raw)? {
                    "t".to_string()
                } else {
                    "f".to_string()
                }
            }
            Type::INT2 => i16::from_sql(ty, raw)?.to_string(),
            Type::INT4 => i32::from_sql(ty, raw)?.to_string(),
            Type::INT8 => i64::from_sql(ty, raw)?.to_string(),
            Type::OID => u32::from_sql(ty, raw)?.to_string(),
            Type::FLOAT4 => f32::from_sql(ty, raw)?.to_string(),
            Type::FLOAT8 => f64::from_sql(ty, raw)?.to_string(),
            Type::PG_LSN => PgLsn::from_sql(ty, raw)?.to_string(),
            // enum labels travel as their text, even in binary format
            _ if matches!(ty.kind(), Kind::Enum(_)) => std::str::from_utf8(raw)?.to_string(),
            _ => <&str as FromSql>::from_sql(ty, raw)?.to_string(),
        };
        Ok(TextValue(text))
    }

    fn accepts(ty: &Type) -> bool {
        matches!(
            *ty,
            Type::BOOL
                | Type::INT2
                | Type::INT4
                | Type::INT8
                | Type::OID
                | Type::FLOAT4
                | Type::FLOAT8
                | Type::PG_LSN
        ) || matches!(ty.kind(), Kind::Enum(_))
            || <&str as FromSql>::accepts(ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_ping_sqlstate() {
        assert_eq!(classify_ping_sqlstate(None), PingStatus::NoResponse);
        assert_eq!(classify_ping_sqlstate(Some("57P03")), PingStatus::NoResponse);
        assert_eq!(classify_ping_sqlstate(Some("53300")), PingStatus::NoResponse);
        assert_eq!(classify_ping_sqlstate(Some("28P01")), PingStatus::Reject);
        assert_eq!(classify_ping_sqlstate(Some("28000")), PingStatus::Reject);
        assert_eq!(classify_ping_sqlstate(Some("3D000")), PingStatus::Reject);
    }

    #[test]
    fn test_text_value_bool_and_lsn() {
        let t = TextValue::from_sql(&Type::BOOL, &[1]).unwrap();
        assert_eq!(t.0, "t");

        let lsn = 0x0000_0001_0000_0A28u64.to_be_bytes();
        let t = TextValue::from_sql(&Type::PG_LSN, &lsn).unwrap();
        assert_eq!(t.0, "1/A28");
    }

    #[test]
    fn test_text_value_accepts() {
        assert!(TextValue::accepts(&Type::TEXT));
        assert!(TextValue::accepts(&Type::NAME));
        assert!(TextValue::accepts(&Type::PG_LSN));
        assert!(!TextValue::accepts(&Type::BYTEA));
    }
}
