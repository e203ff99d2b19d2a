//! Human and JSON renderings for the `show` commands

use crate::common::Result;
use crate::keeper::coordinator::CoordinatorEvent;
use crate::keeper::fsm;
use crate::keeper::state::NodeState;
use crate::keeper::state_file::KeeperStateData;
use serde::Serialize;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

fn or_never<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "never".into())
}

pub fn format_state(state: &KeeperStateData, format: OutputFormat) -> Result<String> {
    if format == OutputFormat::Json {
        return to_json(state);
    }

    let mut out = String::new();
    let _ = writeln!(out, "Keeper state:");
    let _ = writeln!(out, "  Node id: {}", state.node_id);
    let _ = writeln!(out, "  Group: {}", state.group_id);
    let _ = writeln!(out, "  Current state: {}", state.current_state);
    let _ = writeln!(out, "  Assigned state: {}", state.assigned_state);
    let _ = writeln!(
        out,
        "  Last coordinator contact: {}",
        or_never(state.last_monitor_contact)
    );
    let _ = writeln!(
        out,
        "  Synchronous replication: {}",
        if state.sync_rep_disabled { "disabled" } else { "enabled" }
    );
    let _ = writeln!(
        out,
        "  Last sync rep change: {}",
        or_never(state.last_sync_rep_change)
    );
    Ok(out)
}

pub fn format_events(events: &[CoordinatorEvent], format: OutputFormat) -> Result<String> {
    if format == OutputFormat::Json {
        return to_json(events);
    }

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>30} | {:>6} | {:>20} | {:>20} | Description",
        "Event Time", "Node", "Current State", "Assigned State"
    );
    let _ = writeln!(out, "{:->30}-+-{:->6}-+-{:->20}-+-{:->20}-+-{:->20}", "", "", "", "", "");
    for event in events {
        let _ = writeln!(
            out,
            "{:>30} | {:>6} | {:>20} | {:>20} | {}",
            event.event_time, event.node_id, event.reported_state, event.goal_state, event.description
        );
    }
    Ok(out)
}

#[derive(Serialize)]
struct TransitionRow {
    current: NodeState,
    assigned: NodeState,
    next: NodeState,
    comment: &'static str,
}

/// The transition table, optionally restricted to the rows leaving `from`.
pub fn format_fsm(from: Option<NodeState>, format: OutputFormat) -> Result<String> {
    let rows = fsm::TRANSITIONS
        .iter()
        .filter(|t| from.map_or(true, |state| t.current == state));

    if format == OutputFormat::Json {
        let rows: Vec<TransitionRow> = rows
            .map(|t| TransitionRow {
                current: t.current,
                assigned: t.assigned,
                next: t.next,
                comment: t.comment,
            })
            .collect();
        return to_json(&rows);
    }

    if let Some(state) = from {
        return Ok(fsm::format_reachable_states(state));
    }

    let mut out = String::new();
    let _ = writeln!(out, "{:>20} | {:>20} | {:>20} | Comment", "Current", "Assigned", "Next");
    let _ = writeln!(out, "{:->20}-+-{:->20}-+-{:->20}-+-{:->20}", "", "", "", "");
    for t in rows {
        let _ = writeln!(
            out,
            "{:>20} | {:>20} | {:>20} | {}",
            t.current, t.assigned, t.next, t.comment
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_text() {
        let state = KeeperStateData {
            node_id: 2,
            current_state: NodeState::Secondary,
            assigned_state: NodeState::PreparePromotion,
            ..Default::default()
        };
        let out = format_state(&state, OutputFormat::Text).unwrap();
        assert!(out.contains("Current state: secondary"));
        assert!(out.contains("Assigned state: prepare_promotion"));
        assert!(out.contains("Last coordinator contact: never"));
    }

    #[test]
    fn test_state_json() {
        let out = format_state(&KeeperStateData::default(), OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["current_state"], "init");
        assert_eq!(value["node_id"], -1);
    }

    #[test]
    fn test_events_text() {
        let events = vec![CoordinatorEvent {
            event_id: 1,
            event_time: "2024-01-01 00:00:00+00".into(),
            formation: "default".into(),
            node_id: 1,
            group_id: 0,
            reported_state: NodeState::Single,
            goal_state: NodeState::WaitPrimary,
            description: "Setting goal state of node 1 to wait_primary".into(),
        }];
        let out = format_events(&events, OutputFormat::Text).unwrap();
        assert_eq!(out.lines().count(), 3);
        assert!(out.contains("wait_primary"));
    }

    #[test]
    fn test_fsm_listing() {
        let all = format_fsm(None, OutputFormat::Text).unwrap();
        assert_eq!(all.lines().count(), fsm::TRANSITIONS.len() + 2);

        let json = format_fsm(Some(NodeState::Secondary), OutputFormat::Json).unwrap();
        let rows: Vec<serde_json::Value> = serde_json::from_str(&json).unwrap();
        assert!(!rows.is_empty());
        assert!(rows.iter().all(|r| r["current"] == "secondary"));
    }
}
