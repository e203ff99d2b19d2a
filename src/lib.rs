//! # pgkeeper
//!
//! A per-node agent that keeps one PostgreSQL instance in the replication
//! role a central coordinator assigns to it:
//! - Resilient connections to the local node, the coordinator and peers
//! - Typed statements for replication slots, synchronous replication and
//!   instance administration
//! - Replication probes (sync state, current and received LSN)
//! - Notification channel for coordinator state-change hints
//! - A node state machine walking the transition table towards the
//!   assigned state, one guarded action at a time
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              Coordinator                 │
//! │  (assigns a state to every node)         │
//! └───────┬───────────────────────┬──────────┘
//!         │ node_active / LISTEN  │
//! ┌───────▼────────┐      ┌───────▼────────┐
//! │ pgkeeper       │      │ pgkeeper       │
//! │  primary       │◄─────│  secondary     │
//! │  + Postgres    │ peer │  + Postgres    │
//! └────────────────┘      └────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Run the keeper loop
//! pgkeeper --config /etc/pgkeeper.toml run
//!
//! # Inspect
//! pgkeeper --config /etc/pgkeeper.toml show state
//! pgkeeper --config /etc/pgkeeper.toml show events --count 20
//! pgkeeper show fsm --dot | dot -Tsvg > fsm.svg
//! ```

pub mod common;
pub mod keeper;
pub mod pgsql;
pub mod testing;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use keeper::{Keeper, KeeperService, NodeState};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
