//! Replication probe
//!
//! Turns the replication views of a node into a [`ReplicationStatus`]. The
//! "nothing to report yet" cases come back as typed outcomes
//! ([`Error::NoStandby`], [`Error::NoUpstream`]) so callers can tell them
//! apart from real failures.

use crate::common::{Error, Result};
use crate::pgsql::connection::ConnectionHandle;
use crate::pgsql::result::{single_value, ParseError, RawRow};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, error};

/// Current sync state of the standby using `$1`, and the primary's current
/// WAL position. The outer join with a one-row relation keeps the LSN even
/// when no standby is attached.
const SYNC_STATE_AND_CURRENT_LSN_SQL: &str = "\
select coalesce(rep.sync_state, '') as sync_state, pg_current_wal_lsn() \
from (values(1)) as dummy full outer join \
(select sync_state from pg_replication_slots slot \
join pg_stat_replication rep on rep.pid = slot.active_pid \
where slot_name = $1) as rep on true";

const RECEIVED_LSN_SQL: &str = "SELECT pg_last_wal_receive_lsn()";

/// Position in the write-ahead log.
///
/// Only comparison and `X/Y` rendering are provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);
}

impl FromStr for Lsn {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, ParseError> {
        let invalid = || ParseError::InvalidValue {
            value: s.to_string(),
            expected: "LSN",
        };
        let (hi, lo) = s.trim().split_once('/').ok_or_else(invalid)?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// `sync_state` of a standby as shown by `pg_stat_replication`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// No standby attached to the slot
    #[default]
    #[serde(rename = "")]
    NotConfigured,
    Async,
    Sync,
    Quorum,
    Potential,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::NotConfigured => "",
            SyncState::Async => "async",
            SyncState::Sync => "sync",
            SyncState::Quorum => "quorum",
            SyncState::Potential => "potential",
        }
    }

    /// Would a commit on the primary wait for this standby?
    pub fn is_synchronous(&self) -> bool {
        matches!(self, SyncState::Sync | SyncState::Quorum)
    }
}

impl FromStr for SyncState {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, ParseError> {
        match s {
            "" => Ok(SyncState::NotConfigured),
            "async" => Ok(SyncState::Async),
            "sync" => Ok(SyncState::Sync),
            "quorum" => Ok(SyncState::Quorum),
            "potential" => Ok(SyncState::Potential),
            other => Err(ParseError::InvalidValue {
                value: other.to_string(),
                expected: "sync_state",
            }),
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::NotConfigured => f.write_str("not configured"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Replication signals of a node, produced fresh by every probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicationStatus {
    pub sync_state: SyncState,
    pub current_lsn: Option<Lsn>,
    pub received_lsn: Option<Lsn>,
    pub has_active_replica: bool,
}

impl ReplicationStatus {
    /// Best known WAL position of the node.
    pub fn lsn(&self) -> Option<Lsn> {
        self.current_lsn.or(self.received_lsn)
    }
}

/// Result of the sync state probe run on a primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStateAndLsn {
    pub sync_state: SyncState,
    pub current_lsn: Lsn,
    pub has_active_replica: bool,
}

/// Which side of replication a node is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationSide {
    Primary,
    Standby,
}

/// Sync state of the standby using `slot_name` and the primary's current
/// LSN. Zero rows mean no standby: [`Error::NoStandby`], logged as an error
/// unless `allow_missing`.
pub async fn get_sync_state_and_current_lsn(
    handle: &mut ConnectionHandle,
    slot_name: &str,
    allow_missing: bool,
) -> Result<SyncStateAndLsn> {
    let rows = handle
        .query(SYNC_STATE_AND_CURRENT_LSN_SQL, &[slot_name])
        .await?;
    parse_sync_state_rows(&rows, slot_name, allow_missing)
}

pub fn parse_sync_state_rows(
    rows: &[RawRow],
    slot_name: &str,
    allow_missing: bool,
) -> Result<SyncStateAndLsn> {
    match rows.len() {
        0 => {
            if allow_missing {
                debug!("No standby is attached to replication slot \"{}\"", slot_name);
            } else {
                error!(
                    "Failed to fetch the sync state of replication slot \"{}\": no rows",
                    slot_name
                );
            }
            return Err(Error::NoStandby(slot_name.to_string()));
        }
        1 => {}
        n => {
            error!(
                "BUG: the sync state query for replication slot \"{}\" returned {} rows, expected 1",
                slot_name, n
            );
            return Err(Error::ProtocolViolation(format!(
                "sync state query returned {} rows, expected 1",
                n
            )));
        }
    }

    let row = &rows[0];
    if row.len() != 2 {
        return Err(Error::ProtocolViolation(format!(
            "sync state query returned {} columns, expected 2",
            row.len()
        )));
    }

    let sync_state: SyncState = row.get(0).unwrap_or("").parse()?;
    let current_lsn: Lsn = row.required(1, "pg_current_wal_lsn")?.parse()?;

    Ok(SyncStateAndLsn {
        sync_state,
        current_lsn,
        has_active_replica: sync_state != SyncState::NotConfigured,
    })
}

/// Last WAL position received from the upstream, [`Error::NoUpstream`]
/// when the node is not streaming.
pub async fn get_received_lsn(handle: &mut ConnectionHandle) -> Result<Lsn> {
    let rows = handle.query(RECEIVED_LSN_SQL, &[]).await?;
    parse_received_lsn_rows(&rows)
}

pub fn parse_received_lsn_rows(rows: &[RawRow]) -> Result<Lsn> {
    if rows.is_empty() {
        return Err(Error::NoUpstream);
    }
    match single_value(rows)? {
        Some(value) => Ok(value.parse()?),
        None => Err(Error::NoUpstream),
    }
}

/// Probe the local node: sync state and current LSN on the primary side,
/// received LSN on the standby side.
pub async fn probe_replication_status(
    local: &mut ConnectionHandle,
    side: ReplicationSide,
    slot_name: &str,
) -> Result<ReplicationStatus> {
    match side {
        ReplicationSide::Primary => {
            let probe = get_sync_state_and_current_lsn(local, slot_name, true).await?;
            Ok(ReplicationStatus {
                sync_state: probe.sync_state,
                current_lsn: Some(probe.current_lsn),
                received_lsn: None,
                has_active_replica: probe.has_active_replica,
            })
        }
        ReplicationSide::Standby => {
            let received = get_received_lsn(local).await?;
            Ok(ReplicationStatus {
                received_lsn: Some(received),
                ..Default::default()
            })
        }
    }
}
