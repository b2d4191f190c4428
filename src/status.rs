//! Primary status values, the special flag, and the transition rules
//! between them.
//!
//! Status values travel on the wire as short strings ("1".."8"); the two
//! tokens "0" and "5" are not primary states at all but toggle the
//! independent special flag. Everything is validated into closed enums at
//! the boundary so the rest of the crate never sees raw strings.

use serde::{Deserialize, Serialize};

/// The eight primary operational states of a vehicle.
///
/// Status 2 is the default for a freshly connected vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrimaryStatus {
    #[serde(rename = "1")]
    S1,
    #[serde(rename = "2")]
    S2,
    #[serde(rename = "3")]
    S3,
    #[serde(rename = "4")]
    S4,
    #[serde(rename = "5")]
    S5,
    #[serde(rename = "6")]
    S6,
    #[serde(rename = "7")]
    S7,
    #[serde(rename = "8")]
    S8,
}

impl Default for PrimaryStatus {
    fn default() -> Self {
        Self::S2
    }
}

impl PrimaryStatus {
    /// The wire representation ("1".."8").
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S1 => "1",
            Self::S2 => "2",
            Self::S3 => "3",
            Self::S4 => "4",
            Self::S5 => "5",
            Self::S6 => "6",
            Self::S7 => "7",
            Self::S8 => "8",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "1" => Some(Self::S1),
            "2" => Some(Self::S2),
            "3" => Some(Self::S3),
            "4" => Some(Self::S4),
            "6" => Some(Self::S6),
            "7" => Some(Self::S7),
            "8" => Some(Self::S8),
            _ => None,
        }
    }

    /// Whether a transition from `current` to `self` is permitted.
    ///
    /// Targets 5 and 6 are never reached through a status command (5 is the
    /// talk-request flag token, 6 is only set through the dispatcher's
    /// direct override), so they accept no predecessors here.
    pub fn accepts_from(&self, current: PrimaryStatus) -> bool {
        use PrimaryStatus::*;
        match self {
            S1 => matches!(current, S2 | S3 | S4 | S6 | S8),
            S2 => matches!(current, S1 | S6),
            S3 => matches!(current, S1 | S2),
            S4 => matches!(current, S1 | S3),
            S7 => current == S4,
            S8 => current == S7,
            S5 | S6 => false,
        }
    }
}

/// The special indicator layered on top of the primary status.
///
/// At most one of the two variants is set at a time; the primary status is
/// never touched by flag changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpecialFlag {
    /// Wire token "0" ("Blitz" on the original wire).
    #[serde(rename = "0")]
    Urgent,
    /// Wire token "5" ("Sprechwunsch").
    #[serde(rename = "5")]
    TalkRequest,
}

/// A validated inbound status token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCommand {
    /// A primary-status transition request.
    Primary(PrimaryStatus),
    /// A special-flag toggle ("0" or "5").
    Toggle(SpecialFlag),
}

impl StatusCommand {
    /// Parse a wire token. Returns `None` for anything outside
    /// "0".."8" — unknown tokens are malformed input and must not reach
    /// the state machine.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "0" => Some(Self::Toggle(SpecialFlag::Urgent)),
            "5" => Some(Self::Toggle(SpecialFlag::TalkRequest)),
            other => PrimaryStatus::from_token(other).map(Self::Primary),
        }
    }
}
