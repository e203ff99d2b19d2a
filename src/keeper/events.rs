//! State transition history

use crate::keeper::state::NodeState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Number of transitions kept in memory.
pub const EVENT_LOG_CAPACITY: usize = 256;

/// One completed or attempted state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransitionEvent {
    pub node_id: i64,
    pub from: NodeState,
    pub to: NodeState,
    pub timestamp: DateTime<Utc>,
    pub cause: String,
    /// Error message when the transition failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl StateTransitionEvent {
    pub fn succeeded(node_id: i64, from: NodeState, to: NodeState, cause: &str) -> Self {
        Self {
            node_id,
            from,
            to,
            timestamp: Utc::now(),
            cause: cause.to_string(),
            failure: None,
        }
    }

    pub fn failed(node_id: i64, from: NodeState, to: NodeState, cause: &str, error: String) -> Self {
        Self {
            failure: Some(error),
            ..Self::succeeded(node_id, from, to, cause)
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }
}

/// Append-only, bounded log of transitions. The oldest entries are dropped
/// once the capacity is reached.
#[derive(Debug, Clone)]
pub struct EventLog {
    events: VecDeque<StateTransitionEvent>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(EVENT_LOG_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, event: StateTransitionEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last(&self) -> Option<&StateTransitionEvent> {
        self.events.back()
    }

    /// The `count` most recent events, oldest first.
    pub fn recent(&self, count: usize) -> Vec<StateTransitionEvent> {
        let skip = self.events.len().saturating_sub(count);
        self.events.iter().skip(skip).cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StateTransitionEvent> {
        self.events.iter()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(EVENT_LOG_CAPACITY)
    }
}
