//! Live debug channel message shapes.
//!
//! This module defines only the payload *data*. The transport (socket
//! framing, the HTTP/WebSocket server, the HTML console) is an out-of-scope
//! collaborator. Everything here derives `Serialize`/
//! `Deserialize` so a collaborator transport can newline-delimit JSON
//! straight from these types without this crate knowing anything about
//! sockets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::{EventTag, MachineId, StateName};

/// Catalog of supported events per machine, derived from the builder-owned
/// transition/stay tables, never from reflection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// The state this metadata describes.
    pub state: StateName,
    /// Declared transitions out of `state`, keyed by event tag.
    pub transitions: BTreeMap<EventTag, StateName>,
    /// Event tags `state` handles with a stay action rather than a
    /// transition.
    pub stay_events: Vec<EventTag>,
}

/// A single transition notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    /// The machine that transitioned.
    pub id: MachineId,
    /// The state before the transition, `None` for the initial transition.
    pub old_state: Option<StateName>,
    /// The state after the transition.
    pub new_state: StateName,
    /// The wire tag of the event that caused the transition.
    pub event_tag: EventTag,
    /// Wall-clock time the transition took to process, in milliseconds.
    pub transition_duration_ms: u64,
    /// Unix timestamp in milliseconds of the transition.
    pub timestamp_ms: i64,
}

/// Per-machine summary entry within `COMPLETE_STATUS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSummary {
    /// The summarized machine.
    pub id: MachineId,
    /// Its state at the time of the snapshot.
    pub current_state: StateName,
}

/// Periodic registry-wide summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteStatus {
    /// Number of machines currently active.
    pub active_machine_count: usize,
    /// One entry per active machine.
    pub machines: Vec<MachineSummary>,
    /// The configured hard cap on active machines.
    pub max_concurrent_machines: usize,
}

/// On-demand single-machine snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentState {
    /// The snapshotted machine.
    pub id: MachineId,
    /// Its state at the time of the snapshot.
    pub current_state: StateName,
    /// Whether the machine has reached a final state.
    pub complete: bool,
}

/// Optional UI-assist message giving remaining time in a timed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutCountdown {
    /// The machine the countdown applies to.
    pub id: MachineId,
    /// The state whose timeout is counting down.
    pub state: StateName,
    /// Time remaining before the armed timeout fires, in milliseconds.
    pub remaining_ms: u64,
}

/// Outbound message shapes published by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DebugMessage {
    /// Full event-metadata catalog, published on connect and whenever the
    /// template's tables change.
    #[serde(rename = "EVENT_METADATA_UPDATE")]
    EventMetadataUpdate {
        /// One entry per declared state.
        machines: Vec<EventMetadata>,
    },
    /// A single transition just happened.
    #[serde(rename = "STATE_CHANGE")]
    StateChange(StateChange),
    /// Periodic registry-wide summary.
    #[serde(rename = "COMPLETE_STATUS")]
    CompleteStatus(CompleteStatus),
    /// Response to an on-demand single-machine state query.
    #[serde(rename = "CURRENT_STATE")]
    CurrentState(CurrentState),
    /// Remaining time before an armed timeout fires.
    #[serde(rename = "TIMEOUT_COUNTDOWN")]
    TimeoutCountdown(TimeoutCountdown),
}

/// Inbound message: `{action: "EVENT", machineId, eventType, payload}`.
/// `payload` is left as raw JSON; decoding it into a concrete
/// user event type is a collaborator concern (it knows the event enum, this
/// crate does not).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Always `"EVENT"`.
    pub action: String,
    /// The target machine.
    pub machine_id: MachineId,
    /// The wire tag of the event to dispatch.
    pub event_type: EventTag,
    /// Raw event payload, decoded by the collaborator that owns the event
    /// enum.
    pub payload: serde_json::Value,
}
