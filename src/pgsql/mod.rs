//! PostgreSQL client layer: resilient connections, typed statements,
//! replication probes and notifications.

pub mod connection;
pub mod conninfo;
pub mod notify;
pub mod replication;
pub mod result;
pub mod retry;
pub mod sql;
pub mod transport;

pub use connection::{ConnectionClass, ConnectionHandle};
pub use conninfo::ConnInfo;
pub use notify::{Event, StateChangeHint, Subscription};
pub use replication::{Lsn, ReplicationSide, ReplicationStatus, SyncState};
pub use result::{RawRow, ResultContract};
pub use retry::{RetryContext, RetryPolicy, Verdict};
pub use transport::{Connector, NoticeLevel, Notification, PgConnector, PingStatus, Transport};
