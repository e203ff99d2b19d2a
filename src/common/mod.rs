//! Common utilities and types shared across pgkeeper

pub mod config;
pub mod error;
pub mod shutdown;
pub mod utils;

pub use config::{
    Config, CoordinatorConfig, PostgresConfig, ReplicationConfig, TimeoutConfig,
};
pub use error::{Error, Result, SQLSTATE_DUPLICATE_DATABASE, SQLSTATE_DUPLICATE_OBJECT};
pub use shutdown::{StopMode, StopSignal};
pub use utils::{format_duration, parse_duration};
