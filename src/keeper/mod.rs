//! The keeper: node state machine, coordinator protocol and the loop
//! that drives them.

pub mod agent;
pub mod coordinator;
pub mod events;
pub mod fsm;
pub mod node;
pub mod pgctl;
pub mod report;
pub mod service;
pub mod state;
pub mod state_file;

pub use agent::Keeper;
pub use coordinator::{AssignedState, Coordinator, CoordinatorEvent, NodeReport};
pub use events::{EventLog, StateTransitionEvent};
pub use fsm::{Action, Guard, Transition};
pub use node::{Group, GroupMember, Node, NodeAddress};
pub use pgctl::{LocalPostgres, PgCtl, ReplicationSource};
pub use service::KeeperService;
pub use state::NodeState;
pub use state_file::{FileStateStore, KeeperStateData, MemoryStateStore, StateStore};
