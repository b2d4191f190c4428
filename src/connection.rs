//! Per-participant connection state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use crate::status::{PrimaryStatus, SpecialFlag};

/// Capacity of the per-connection outbound channel. A connection whose
/// channel fills up (dead or hopelessly slow client) is treated as
/// disconnected on the next send.
pub const OUTBOUND_CAPACITY: usize = 64;

/// Outbound frames are serialized text; the WebSocket task forwards them
/// to the socket verbatim.
pub type OutboundSender = mpsc::Sender<String>;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Current wall-clock time as fractional unix seconds, the timestamp
/// representation used on the wire.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Allocate an identity for a freshly attached socket. Cleanup paths
/// compare against this so a stale task cannot tear down a handle that a
/// reconnect has already replaced.
pub fn next_socket_id() -> u64 {
    NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed)
}

/// The role a participant resolved to through its access code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Non-privileged field unit; identity names are unique among live
    /// vehicles within a session.
    Vehicle,
    /// Unit leader ("Staffelführer"), privileged.
    Leader,
    /// Dispatch room ("Leitstelle"), privileged.
    Dispatcher,
}

impl Role {
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Leader | Role::Dispatcher)
    }
}

/// One participant's live or recently-live presence in a session.
///
/// A connection without a `socket` is in its post-disconnect grace period:
/// it keeps all state so a rapid reconnect under the same name resumes
/// where it left off.
#[derive(Debug, Clone)]
pub struct Connection {
    pub name: String,
    pub role: Role,
    /// Outbound handle of the live socket, if any.
    pub socket: Option<OutboundSender>,
    /// Identity of the socket the handle belongs to.
    pub socket_id: u64,
    pub status: PrimaryStatus,
    pub special: Option<SpecialFlag>,
    pub short_status: Option<String>,
    pub last_activity: f64,
    pub last_status_change: f64,
    pub last_urgent_change: Option<f64>,
    pub last_talk_request_change: Option<f64>,
    pub disconnected_at: Option<f64>,
    pub talking_to_leader: bool,
}

impl Connection {
    /// A fresh connection with default status and current timestamps.
    pub fn new(name: String, role: Role, socket: OutboundSender, socket_id: u64) -> Self {
        let now = unix_now();
        Self {
            name,
            role,
            socket: Some(socket),
            socket_id,
            status: PrimaryStatus::default(),
            special: None,
            short_status: None,
            last_activity: now,
            last_status_change: now,
            last_urgent_change: None,
            last_talk_request_change: None,
            disconnected_at: None,
            talking_to_leader: false,
        }
    }

    pub fn is_online(&self) -> bool {
        self.socket.is_some()
    }

    /// Re-attach a socket after a disconnect, keeping all other state.
    pub fn reattach(&mut self, socket: OutboundSender, socket_id: u64, role: Role) {
        self.socket = Some(socket);
        self.socket_id = socket_id;
        self.role = role;
        self.disconnected_at = None;
        self.last_activity = unix_now();
    }

    /// Drop the socket handle and stamp the disconnect time.
    pub fn mark_disconnected(&mut self) {
        self.socket = None;
        self.disconnected_at = Some(unix_now());
    }

    pub fn touch(&mut self) {
        self.last_activity = unix_now();
    }
}
