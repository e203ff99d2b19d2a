//! Error types for pgkeeper

use crate::keeper::state::NodeState;
use crate::pgsql::result::ParseError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// SQLSTATE reported when an object such as a role, an extension or a
/// replication slot already exists.
pub const SQLSTATE_DUPLICATE_OBJECT: &str = "42710";

/// SQLSTATE reported by `CREATE DATABASE` when the database already exists.
pub const SQLSTATE_DUPLICATE_DATABASE: &str = "42P04";

#[derive(Error, Debug)]
pub enum Error {
    // === Connection Errors ===
    #[error("Server unreachable: {0}")]
    Unreachable(String),

    #[error("Connection rejected: {0}")]
    Rejected(String),

    #[error("Local connection failed: {0}")]
    LocalFailure(String),

    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("Cancelled by stop signal")]
    Cancelled,

    // === Statement Errors ===
    #[error("Query failed [{sqlstate}]: {message}")]
    QueryFailed { sqlstate: String, message: String },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Failed to parse result: {0}")]
    Parse(ParseError),

    // === Replication Probe Outcomes ===
    #[error("No standby is using replication slot \"{0}\"")]
    NoStandby(String),

    #[error("No upstream: this node is not receiving WAL")]
    NoUpstream,

    // === State Machine Errors ===
    #[error("No transition from \"{from}\" to \"{to}\"")]
    InvalidTransition { from: NodeState, to: NodeState },

    #[error("Not eligible for promotion: {0}")]
    NotPromotable(String),

    #[error("Postgres process control failed: {0}")]
    Process(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is it worth trying again later?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Unreachable(_) | Error::NoStandby(_) | Error::NoUpstream
        )
    }

    /// SQLSTATE of a failed statement, if any.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::QueryFailed { sqlstate, .. } => Some(sqlstate),
            _ => None,
        }
    }

    /// Did the server report that the object we tried to create exists?
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self.sqlstate(),
            Some(SQLSTATE_DUPLICATE_OBJECT) | Some(SQLSTATE_DUPLICATE_DATABASE)
        )
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::RowCount { .. } | ParseError::ColumnCount { .. } => {
                Error::ProtocolViolation(e.to_string())
            }
            _ => Error::Parse(e),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
