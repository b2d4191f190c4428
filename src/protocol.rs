//! Wire types and inbound command normalization.
//!
//! Clients speak two equivalent encodings: a structured JSON form with an
//! explicit `type` field and a delimited plain-text form (`status:3`,
//! `kurzstatus:...`). Both are normalized into [`Command`] at the boundary
//! so the manager and state machine never see wire-format differences.
//!
//! Outbound snapshots keep the original field names (`kurzstatus`,
//! `last_blitz_update`, `is_staffelfuehrer`, ...) for client compatibility.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::status::{PrimaryStatus, SpecialFlag, StatusCommand};

/// A directive from the leader to a vehicle, requiring acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    pub text: String,
    pub status: NoticeState,
    #[serde(default)]
    pub confirmed_at: Option<f64>,
}

impl Notice {
    pub fn pending(text: String) -> Self {
        Self {
            text,
            status: NoticeState::Pending,
            confirmed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeState {
    Pending,
    Confirmed,
}

/// One entry in a vehicle's bounded chat history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Sender tag: "LS" (dispatcher) or "SF" (leader).
    pub sender: String,
    pub text: String,
    pub timestamp: f64,
}

/// A vehicle's row in the broadcast snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleStatus {
    pub name: String,
    pub status: PrimaryStatus,
    pub special: Option<SpecialFlag>,
    #[serde(rename = "kurzstatus")]
    pub short_status: Option<String>,
    #[serde(rename = "last_update")]
    pub last_activity: f64,
    #[serde(rename = "last_status_update")]
    pub last_status_change: f64,
    #[serde(rename = "last_blitz_update")]
    pub last_urgent_change: Option<f64>,
    #[serde(rename = "last_sprechwunsch_update")]
    pub last_talk_request_change: Option<f64>,
    #[serde(rename = "is_staffelfuehrer")]
    pub is_leader: bool,
    /// Dispatcher-authored note for this identity.
    #[serde(default)]
    pub note: String,
    /// Leader-authored note for this identity.
    #[serde(default)]
    pub sf_note: String,
    pub is_online: bool,
    #[serde(rename = "talking_to_sf")]
    pub talking_to_leader: bool,
}

/// The full snapshot pushed to every live socket after each mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    #[serde(rename = "type")]
    pub kind: String,
    pub connections: Vec<VehicleStatus>,
    pub notices: HashMap<String, Notice>,
}

impl StatusUpdate {
    pub fn new(connections: Vec<VehicleStatus>, notices: HashMap<String, Notice>) -> Self {
        Self {
            kind: "status_update".to_string(),
            connections,
            notices,
        }
    }
}

/// Serialize the structured error frame sent before a policy close.
pub fn error_frame(message: &str) -> String {
    serde_json::json!({ "type": "error", "message": message }).to_string()
}

/// A normalized inbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Primary-status transition or special-flag toggle.
    Status(StatusCommand),
    /// Confirm the pending notice addressed to this identity.
    ConfirmNotice,
    /// Set or clear (`None`) the short free-text status.
    ShortStatus(Option<String>),
    /// Toggle the "requesting to talk to the leader" flag.
    ToggleTalkRequest,
    /// Refresh the activity timestamp; elicits an echo.
    Heartbeat,
}

/// Structured encoding. Unknown `type` values fail deserialization and the
/// message is ignored.
#[derive(Deserialize)]
#[serde(tag = "type")]
enum WireCommand {
    #[serde(rename = "status")]
    Status { value: Option<String> },
    #[serde(rename = "confirm_notice")]
    ConfirmNotice,
    #[serde(rename = "kurzstatus")]
    ShortStatus { value: Option<String> },
    #[serde(rename = "toggle_talking_to_sf")]
    ToggleTalkRequest,
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

impl Command {
    /// Normalize an inbound text frame from either encoding.
    ///
    /// Returns `None` for malformed payloads — unknown command types,
    /// invalid status tokens, or free-form garbage. Malformed input is a
    /// locally recovered condition: the caller ignores it and keeps the
    /// connection open.
    pub fn parse(text: &str) -> Option<Command> {
        // Anything that parses as JSON is handled as the structured form
        // and never falls back to the plain-text form.
        if serde_json::from_str::<serde_json::Value>(text).is_ok() {
            return match serde_json::from_str::<WireCommand>(text).ok()? {
                WireCommand::Status { value } => {
                    StatusCommand::parse(&value?).map(Command::Status)
                }
                WireCommand::ConfirmNotice => Some(Command::ConfirmNotice),
                WireCommand::ShortStatus { value } => {
                    Some(Command::ShortStatus(normalize_short_status(value)))
                }
                WireCommand::ToggleTalkRequest => Some(Command::ToggleTalkRequest),
                WireCommand::Heartbeat => Some(Command::Heartbeat),
            };
        }

        if let Some(token) = text.strip_prefix("status:") {
            return StatusCommand::parse(token).map(Command::Status);
        }
        if text.starts_with("confirm_notice") {
            return Some(Command::ConfirmNotice);
        }
        if let Some(rest) = text.strip_prefix("kurzstatus:") {
            return Some(Command::ShortStatus(normalize_short_status(Some(
                rest.to_string(),
            ))));
        }
        match text {
            "toggle_talking_to_sf" => Some(Command::ToggleTalkRequest),
            "heartbeat" => Some(Command::Heartbeat),
            _ => None,
        }
    }
}

/// An empty short status clears it.
fn normalize_short_status(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
