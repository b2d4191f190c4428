//! Mutation + broadcast orchestration for sessions.
//!
//! Every state-changing operation locks the owning session, applies the
//! mutation, and broadcasts a fresh snapshot before the lock is released.
//! That single rule gives every observer the same view after the same
//! sequence of mutations, and lets a client see its own mutation in the
//! very next snapshot it receives. Sessions are independent; operations on
//! different sessions proceed in parallel.

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::Timeouts;
use crate::connection::{next_socket_id, unix_now, Connection, OutboundSender, Role};
use crate::protocol::{ChatMessage, Notice, NoticeState, StatusUpdate, VehicleStatus};
use crate::session::{Session, SessionRegistry, SessionState};
use crate::status::{SpecialFlag, StatusCommand};

/// Handshake rejection reasons. The messages are the wire strings sent in
/// the error frame before the policy close.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AttachError {
    #[error("Invalid code")]
    UnknownCode,
    #[error("Name already taken")]
    NameTaken,
}

/// Failures of targeted dispatcher/leader operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OpError {
    #[error("Vehicle not found")]
    VehicleNotFound,
    #[error("Notice not found")]
    NoticeNotFound,
}

/// The result of a successful handshake attachment.
#[derive(Debug)]
pub struct Attached {
    pub session: Arc<Session>,
    pub name: String,
    pub role: Role,
    pub socket_id: u64,
}

/// Orchestrates mutations and snapshot broadcasts over the registry.
#[derive(Clone)]
pub struct ConnectionManager {
    registry: SessionRegistry,
    timeouts: Timeouts,
}

impl ConnectionManager {
    pub fn new(registry: SessionRegistry, timeouts: Timeouts) -> Self {
        Self { registry, timeouts }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Resolve a handshake to a new or existing connection.
    ///
    /// A live non-privileged identity is never overwritten; privileged
    /// roles may always attach. A previously disconnected identity is
    /// reused with all its state intact.
    pub async fn connect(
        &self,
        code: &str,
        name: Option<String>,
        socket: OutboundSender,
    ) -> Result<Attached, AttachError> {
        let (session, role) = self
            .registry
            .resolve(code)
            .map_err(|_| AttachError::UnknownCode)?;

        let name = match name {
            Some(n) if !n.is_empty() => n,
            _ if role == Role::Dispatcher => "Leitstelle".to_string(),
            _ => "Unknown".to_string(),
        };

        let socket_id = next_socket_id();
        {
            let mut state = session.state.lock().await;
            match state.find_mut(&name) {
                Some(existing) => {
                    if existing.is_online() && !role.is_privileged() {
                        return Err(AttachError::NameTaken);
                    }
                    existing.reattach(socket, socket_id, role);
                }
                None => {
                    state
                        .connections
                        .push(Connection::new(name.clone(), role, socket, socket_id));
                }
            }
            broadcast(&mut state);
        }

        tracing::info!(session = %session.session_code, name = %name, ?role, "connection attached");
        Ok(Attached {
            session,
            name,
            role,
            socket_id,
        })
    }

    /// Transport-termination cleanup. Runs exactly once per socket task,
    /// on every exit path; a stale `socket_id` (the identity was already
    /// taken over by a reconnect) leaves the new handle untouched.
    pub async fn disconnect(&self, session: &Session, name: &str, socket_id: u64) {
        let mut state = session.state.lock().await;
        if let Some(conn) = state.find_mut(name) {
            if conn.socket_id == socket_id {
                conn.mark_disconnected();
                tracing::debug!(session = %session.session_code, name = %name, "socket detached");
            }
        }
        broadcast(&mut state);
    }

    /// Apply an inbound status command from a vehicle.
    ///
    /// Flag tokens toggle the special flag and never touch the primary
    /// status. A primary transition outside the allowed-predecessor set
    /// leaves the status untouched but still bumps the activity timestamp,
    /// and a broadcast fires either way.
    pub async fn apply_status(&self, session: &Session, name: &str, command: StatusCommand) {
        let mut state = session.state.lock().await;
        let Some(conn) = state.find_mut(name) else {
            return;
        };
        let now = unix_now();
        match command {
            StatusCommand::Toggle(flag) => {
                if conn.special == Some(flag) {
                    conn.special = None;
                    match flag {
                        SpecialFlag::Urgent => conn.last_urgent_change = None,
                        SpecialFlag::TalkRequest => conn.last_talk_request_change = None,
                    }
                } else {
                    conn.special = Some(flag);
                    match flag {
                        SpecialFlag::Urgent => conn.last_urgent_change = Some(now),
                        SpecialFlag::TalkRequest => conn.last_talk_request_change = Some(now),
                    }
                }
            }
            StatusCommand::Primary(target) => {
                if target.accepts_from(conn.status) {
                    conn.status = target;
                    conn.last_status_change = now;
                }
                conn.last_activity = now;
            }
        }
        broadcast(&mut state);
    }

    /// Confirm the pending notice addressed to `name`.
    pub async fn confirm_notice(&self, session: &Session, name: &str) {
        let mut state = session.state.lock().await;
        let confirmed = match state.notices.get_mut(name) {
            Some(notice) => {
                notice.status = NoticeState::Confirmed;
                notice.confirmed_at = Some(unix_now());
                true
            }
            None => false,
        };
        if confirmed {
            broadcast(&mut state);
        }
    }

    /// Set or clear a vehicle's short free-text status.
    pub async fn set_short_status(&self, session: &Session, name: &str, value: Option<String>) {
        let mut state = session.state.lock().await;
        if let Some(conn) = state.find_mut(name) {
            conn.short_status = value;
            conn.touch();
        }
        broadcast(&mut state);
    }

    /// Toggle the "requesting to talk to the leader" flag.
    pub async fn toggle_talk_request(&self, session: &Session, name: &str) {
        let mut state = session.state.lock().await;
        if let Some(conn) = state.find_mut(name) {
            conn.talking_to_leader = !conn.talking_to_leader;
        }
        broadcast(&mut state);
    }

    /// Refresh the activity timestamp of a live-but-quiet connection.
    pub async fn heartbeat(&self, session: &Session, name: &str) {
        let mut state = session.state.lock().await;
        if let Some(conn) = state.find_mut(name) {
            conn.touch();
        }
    }

    /// Deliver a free-text message from the dispatcher ("LS") or leader
    /// ("SF") to one vehicle or to all of them.
    ///
    /// The message is appended to the targets' chat histories. A private
    /// message reaches only the target plus privileged roles.
    pub async fn send_message(
        &self,
        session: &Session,
        sender: &str,
        target: Option<&str>,
        message: &str,
    ) {
        let mut state = session.state.lock().await;
        let timestamp = unix_now();

        let targets: Vec<String> = match target {
            Some(t) => vec![t.to_string()],
            None => state
                .connections
                .iter()
                .filter(|c| !c.role.is_privileged())
                .map(|c| c.name.clone())
                .collect(),
        };
        for t in &targets {
            state.push_chat(
                t,
                ChatMessage {
                    sender: sender.to_string(),
                    text: message.to_string(),
                    timestamp,
                },
            );
        }

        let framed = format!("{sender}: {message}");
        let now = unix_now();
        for conn in &mut state.connections {
            let should_send = match target {
                None => true,
                Some(t) => conn.name == t || conn.role.is_privileged(),
            };
            if should_send {
                deliver(conn, &framed, now);
            }
        }
    }

    /// Dispatcher override: clear a vehicle's special flag.
    pub async fn clear_special(&self, session: &Session, target: &str) -> Result<(), OpError> {
        let mut state = session.state.lock().await;
        let conn = state.find_mut(target).ok_or(OpError::VehicleNotFound)?;
        conn.special = None;
        conn.last_urgent_change = None;
        conn.last_talk_request_change = None;
        broadcast(&mut state);
        Ok(())
    }

    /// Dispatcher override: set a vehicle's status directly, bypassing the
    /// transition rules.
    pub async fn set_status_direct(
        &self,
        session: &Session,
        target: &str,
        status: crate::status::PrimaryStatus,
    ) -> Result<(), OpError> {
        let mut state = session.state.lock().await;
        let conn = state.find_mut(target).ok_or(OpError::VehicleNotFound)?;
        let now = unix_now();
        conn.status = status;
        conn.last_status_change = now;
        conn.last_activity = now;
        broadcast(&mut state);
        Ok(())
    }

    /// Dispatcher override: clear a vehicle's short status.
    pub async fn clear_short_status(&self, session: &Session, target: &str) -> Result<(), OpError> {
        let mut state = session.state.lock().await;
        let conn = state.find_mut(target).ok_or(OpError::VehicleNotFound)?;
        conn.short_status = None;
        conn.touch();
        broadcast(&mut state);
        Ok(())
    }

    /// Leader: create (or replace) the pending notice for a vehicle.
    pub async fn create_notice(&self, session: &Session, target: &str, text: &str) {
        let mut state = session.state.lock().await;
        state
            .notices
            .insert(target.to_string(), Notice::pending(text.to_string()));
        broadcast(&mut state);
    }

    /// Leader: acknowledge (remove) a vehicle's notice.
    pub async fn acknowledge_notice(&self, session: &Session, target: &str) -> Result<(), OpError> {
        let mut state = session.state.lock().await;
        if state.notices.remove(target).is_none() {
            return Err(OpError::NoticeNotFound);
        }
        broadcast(&mut state);
        Ok(())
    }

    /// Update the dispatcher-authored or leader-authored note for an
    /// identity.
    pub async fn update_note(&self, session: &Session, target: &str, note: &str, leader: bool) {
        let mut state = session.state.lock().await;
        let map = if leader {
            &mut state.leader_notes
        } else {
            &mut state.notes
        };
        map.insert(target.to_string(), note.to_string());
        broadcast(&mut state);
    }

    /// Chat history for one identity.
    pub async fn chat_history(&self, session: &Session, target: &str) -> Vec<ChatMessage> {
        let state = session.state.lock().await;
        state.chat_history.get(target).cloned().unwrap_or_default()
    }

    /// One reaper sweep over all sessions.
    ///
    /// Removes live connections idle beyond the liveness timeout and
    /// disconnected ones past the grace window, drops notices whose
    /// identity no longer has a connection, and broadcasts once per
    /// session that lost anything.
    pub async fn cleanup_inactive(&self) {
        let now = unix_now();
        let liveness = self.timeouts.liveness_timeout_secs as f64;
        let grace = self.timeouts.disconnect_grace_secs as f64;

        for session in self.registry.sessions() {
            let mut state = session.state.lock().await;
            let before = state.connections.len();
            state.connections.retain(|c| {
                if c.is_online() {
                    now - c.last_activity < liveness
                } else {
                    matches!(c.disconnected_at, Some(at) if now - at < grace)
                }
            });
            let removed = before - state.connections.len();
            if removed > 0 {
                tracing::info!(
                    session = %session.session_code,
                    removed,
                    "reaped inactive connections"
                );
                let remaining: HashSet<String> =
                    state.connections.iter().map(|c| c.name.clone()).collect();
                state.notices.retain(|name, _| remaining.contains(name));
                broadcast(&mut state);
            }
        }
    }
}

/// Push `text` to a single connection, treating a full or closed channel
/// as a disconnect.
fn deliver(conn: &mut Connection, text: &str, now: f64) {
    if let Some(tx) = &conn.socket {
        if tx.try_send(text.to_string()).is_err() {
            tracing::warn!(name = %conn.name, "send failed, marking connection offline");
            conn.socket = None;
            conn.disconnected_at = Some(now);
        }
    }
}

/// Build the session snapshot and push it to every live socket.
///
/// Called with the session lock held, which is what serializes broadcasts
/// relative to mutations on the same session. A failed send marks that
/// connection offline and never aborts delivery to the rest.
pub(crate) fn broadcast(state: &mut SessionState) {
    let vehicles: Vec<VehicleStatus> = state
        .connections
        .iter()
        .filter(|c| !c.role.is_privileged())
        .map(|c| VehicleStatus {
            name: c.name.clone(),
            status: c.status,
            special: c.special,
            short_status: c.short_status.clone(),
            last_activity: c.last_activity,
            last_status_change: c.last_status_change,
            last_urgent_change: c.last_urgent_change,
            last_talk_request_change: c.last_talk_request_change,
            is_leader: c.role == Role::Leader,
            note: state.notes.get(&c.name).cloned().unwrap_or_default(),
            sf_note: state.leader_notes.get(&c.name).cloned().unwrap_or_default(),
            is_online: c.is_online(),
            talking_to_leader: c.talking_to_leader,
        })
        .collect();

    let update = StatusUpdate::new(vehicles, state.notices.clone());
    let message = match serde_json::to_string(&update) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize snapshot");
            return;
        }
    };

    let now = unix_now();
    for conn in &mut state.connections {
        deliver(conn, &message, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::OUTBOUND_CAPACITY;
    use crate::session::SessionCodes;
    use crate::status::PrimaryStatus;
    use tokio::sync::mpsc;

    fn manager() -> (ConnectionManager, SessionCodes) {
        let registry = SessionRegistry::new();
        let codes = registry.create_session("Alpha");
        (ConnectionManager::new(registry, Timeouts::default()), codes)
    }

    fn channel() -> (OutboundSender, mpsc::Receiver<String>) {
        mpsc::channel(OUTBOUND_CAPACITY)
    }

    async fn recv_snapshot(rx: &mut mpsc::Receiver<String>) -> serde_json::Value {
        loop {
            let text = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
                .await
                .expect("timeout waiting for frame")
                .expect("channel closed");
            let v: serde_json::Value = serde_json::from_str(&text).expect("invalid JSON frame");
            if v["type"] == "status_update" {
                return v;
            }
        }
    }

    fn vehicle<'a>(snapshot: &'a serde_json::Value, name: &str) -> &'a serde_json::Value {
        snapshot["connections"]
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["name"] == name)
            .unwrap_or_else(|| panic!("vehicle {name} missing from snapshot"))
    }

    async fn latest_snapshot(rx: &mut mpsc::Receiver<String>) -> serde_json::Value {
        let mut last = recv_snapshot(rx).await;
        while let Ok(text) = rx.try_recv() {
            if let Ok(v) = serde_json::from_str::<serde_json::Value>(&text) {
                if v["type"] == "status_update" {
                    last = v;
                }
            }
        }
        last
    }

    #[tokio::test]
    async fn connect_creates_default_vehicle() {
        let (mgr, codes) = manager();
        let (tx, mut rx) = channel();
        let attached = mgr
            .connect(&codes.vehicle, Some("Car1".into()), tx)
            .await
            .unwrap();
        assert_eq!(attached.name, "Car1");
        assert_eq!(attached.role, Role::Vehicle);

        let snap = recv_snapshot(&mut rx).await;
        let car = vehicle(&snap, "Car1");
        assert_eq!(car["status"], "2");
        assert_eq!(car["is_online"], true);
        assert_eq!(car["special"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn connect_unknown_code_rejected() {
        let (mgr, _) = manager();
        let (tx, _rx) = channel();
        let err = mgr
            .connect("WRONG123", Some("Car1".into()), tx)
            .await
            .unwrap_err();
        assert_eq!(err, AttachError::UnknownCode);
    }

    #[tokio::test]
    async fn live_vehicle_name_is_protected() {
        let (mgr, codes) = manager();
        let (tx1, _rx1) = channel();
        mgr.connect(&codes.vehicle, Some("Car1".into()), tx1)
            .await
            .unwrap();

        let (tx2, _rx2) = channel();
        let err = mgr
            .connect(&codes.vehicle, Some("Car1".into()), tx2)
            .await
            .unwrap_err();
        assert_eq!(err, AttachError::NameTaken);
    }

    #[tokio::test]
    async fn privileged_roles_bypass_name_conflict() {
        let (mgr, codes) = manager();
        let (tx1, _rx1) = channel();
        mgr.connect(&codes.session, None, tx1).await.unwrap();

        // Second dispatcher under the same default name takes over.
        let (tx2, _rx2) = channel();
        let attached = mgr.connect(&codes.session, None, tx2).await.unwrap();
        assert_eq!(attached.name, "Leitstelle");
        assert_eq!(attached.role, Role::Dispatcher);
    }

    #[tokio::test]
    async fn default_names() {
        let (mgr, codes) = manager();
        let (tx, _rx) = channel();
        let attached = mgr.connect(&codes.session, None, tx).await.unwrap();
        assert_eq!(attached.name, "Leitstelle");

        let (tx, _rx) = channel();
        let attached = mgr.connect(&codes.vehicle, None, tx).await.unwrap();
        assert_eq!(attached.name, "Unknown");
    }

    #[tokio::test]
    async fn reconnect_preserves_state() {
        let (mgr, codes) = manager();
        let (tx, rx) = channel();
        let attached = mgr
            .connect(&codes.vehicle, Some("Car1".into()), tx)
            .await
            .unwrap();
        mgr.apply_status(
            &attached.session,
            "Car1",
            StatusCommand::Primary(PrimaryStatus::S3),
        )
        .await;
        mgr.set_short_status(&attached.session, "Car1", Some("unterwegs".into()))
            .await;
        mgr.disconnect(&attached.session, "Car1", attached.socket_id)
            .await;
        drop(rx);

        let (tx2, mut rx2) = channel();
        mgr.connect(&codes.vehicle, Some("Car1".into()), tx2)
            .await
            .unwrap();
        let snap = recv_snapshot(&mut rx2).await;
        let car = vehicle(&snap, "Car1");
        assert_eq!(car["status"], "3");
        assert_eq!(car["kurzstatus"], "unterwegs");
        assert_eq!(car["is_online"], true);
    }

    #[tokio::test]
    async fn allowed_transition_updates_status_and_timestamps() {
        let (mgr, codes) = manager();
        let (tx, mut rx) = channel();
        let attached = mgr
            .connect(&codes.vehicle, Some("Car1".into()), tx)
            .await
            .unwrap();
        let snap = recv_snapshot(&mut rx).await;
        let before = vehicle(&snap, "Car1")["last_status_update"].as_f64().unwrap();

        mgr.apply_status(
            &attached.session,
            "Car1",
            StatusCommand::Primary(PrimaryStatus::S3),
        )
        .await;
        let snap = recv_snapshot(&mut rx).await;
        let car = vehicle(&snap, "Car1");
        assert_eq!(car["status"], "3");
        assert!(car["last_status_update"].as_f64().unwrap() >= before);
    }

    #[tokio::test]
    async fn rejected_transition_keeps_status_but_broadcasts() {
        let (mgr, codes) = manager();
        let (tx, mut rx) = channel();
        let attached = mgr
            .connect(&codes.vehicle, Some("Car1".into()), tx)
            .await
            .unwrap();
        let snap = recv_snapshot(&mut rx).await;
        let activity_before = vehicle(&snap, "Car1")["last_update"].as_f64().unwrap();

        // 2 -> 7 is not permitted (7 only follows 4).
        mgr.apply_status(
            &attached.session,
            "Car1",
            StatusCommand::Primary(PrimaryStatus::S7),
        )
        .await;
        // The broadcast still fires and carries the unchanged status.
        let snap = recv_snapshot(&mut rx).await;
        let car = vehicle(&snap, "Car1");
        assert_eq!(car["status"], "2");
        assert!(car["last_update"].as_f64().unwrap() >= activity_before);
    }

    #[tokio::test]
    async fn flag_toggle_is_independent_of_status() {
        let (mgr, codes) = manager();
        let (tx, mut rx) = channel();
        let attached = mgr
            .connect(&codes.vehicle, Some("Car1".into()), tx)
            .await
            .unwrap();
        mgr.apply_status(
            &attached.session,
            "Car1",
            StatusCommand::Primary(PrimaryStatus::S3),
        )
        .await;

        // Setting the talk-request flag leaves the status alone.
        mgr.apply_status(
            &attached.session,
            "Car1",
            StatusCommand::Toggle(SpecialFlag::TalkRequest),
        )
        .await;
        let snap = latest_snapshot(&mut rx).await;
        let car = vehicle(&snap, "Car1");
        assert_eq!(car["status"], "3");
        assert_eq!(car["special"], "5");
        assert!(car["last_sprechwunsch_update"].is_number());

        // Toggling the same flag again clears it.
        mgr.apply_status(
            &attached.session,
            "Car1",
            StatusCommand::Toggle(SpecialFlag::TalkRequest),
        )
        .await;
        let snap = recv_snapshot(&mut rx).await;
        let car = vehicle(&snap, "Car1");
        assert_eq!(car["special"], serde_json::Value::Null);
        assert_eq!(car["last_sprechwunsch_update"], serde_json::Value::Null);

        // The other flag replaces without touching the status.
        mgr.apply_status(
            &attached.session,
            "Car1",
            StatusCommand::Toggle(SpecialFlag::TalkRequest),
        )
        .await;
        mgr.apply_status(
            &attached.session,
            "Car1",
            StatusCommand::Toggle(SpecialFlag::Urgent),
        )
        .await;
        let snap = latest_snapshot(&mut rx).await;
        let car = vehicle(&snap, "Car1");
        assert_eq!(car["special"], "0");
        assert_eq!(car["status"], "3");
    }

    #[tokio::test]
    async fn stale_socket_id_does_not_tear_down_reconnect() {
        let (mgr, codes) = manager();
        let (tx, _rx) = channel();
        let old = mgr
            .connect(&codes.vehicle, Some("Car1".into()), tx)
            .await
            .unwrap();
        mgr.disconnect(&old.session, "Car1", old.socket_id).await;

        let (tx2, mut rx2) = channel();
        mgr.connect(&codes.vehicle, Some("Car1".into()), tx2)
            .await
            .unwrap();
        // The old task's cleanup runs again (late) with its stale id.
        mgr.disconnect(&old.session, "Car1", old.socket_id).await;

        let snap = latest_snapshot(&mut rx2).await;
        assert_eq!(vehicle(&snap, "Car1")["is_online"], true);
    }

    #[tokio::test]
    async fn broadcast_failure_marks_connection_offline() {
        let (mgr, codes) = manager();
        let (tx, rx) = channel();
        let attached = mgr
            .connect(&codes.vehicle, Some("Car1".into()), tx)
            .await
            .unwrap();
        // Dead client: its channel is gone.
        drop(rx);

        let (tx2, mut rx2) = channel();
        mgr.connect(&codes.vehicle, Some("Car2".into()), tx2)
            .await
            .unwrap();
        // Delivery to Car2 was not aborted by Car1's failure.
        let snap = recv_snapshot(&mut rx2).await;
        assert_eq!(vehicle(&snap, "Car2")["is_online"], true);

        let state = attached.session.state.lock().await;
        let car1 = state.find("Car1").unwrap();
        assert!(!car1.is_online());
        assert!(car1.disconnected_at.is_some());
    }

    #[tokio::test]
    async fn confirm_notice_marks_confirmed() {
        let (mgr, codes) = manager();
        let (tx, mut rx) = channel();
        let attached = mgr
            .connect(&codes.vehicle, Some("Car1".into()), tx)
            .await
            .unwrap();
        mgr.create_notice(&attached.session, "Car1", "Einrücken").await;
        let snap = latest_snapshot(&mut rx).await;
        assert_eq!(snap["notices"]["Car1"]["status"], "pending");

        mgr.confirm_notice(&attached.session, "Car1").await;
        let snap = recv_snapshot(&mut rx).await;
        assert_eq!(snap["notices"]["Car1"]["status"], "confirmed");
        assert!(snap["notices"]["Car1"]["confirmed_at"].is_number());
    }

    #[tokio::test]
    async fn acknowledge_removes_notice() {
        let (mgr, codes) = manager();
        let (tx, _rx) = channel();
        let attached = mgr
            .connect(&codes.vehicle, Some("Car1".into()), tx)
            .await
            .unwrap();
        mgr.create_notice(&attached.session, "Car1", "Einrücken").await;
        mgr.acknowledge_notice(&attached.session, "Car1").await.unwrap();
        assert_eq!(
            mgr.acknowledge_notice(&attached.session, "Car1").await,
            Err(OpError::NoticeNotFound)
        );
    }

    #[tokio::test]
    async fn notes_appear_in_snapshot() {
        let (mgr, codes) = manager();
        let (tx, mut rx) = channel();
        let attached = mgr
            .connect(&codes.vehicle, Some("Car1".into()), tx)
            .await
            .unwrap();
        mgr.update_note(&attached.session, "Car1", "Besatzung 1/8", false)
            .await;
        mgr.update_note(&attached.session, "Car1", "AGT", true).await;

        let snap = latest_snapshot(&mut rx).await;
        let car = vehicle(&snap, "Car1");
        assert_eq!(car["note"], "Besatzung 1/8");
        assert_eq!(car["sf_note"], "AGT");
    }

    #[tokio::test]
    async fn dispatcher_overrides() {
        let (mgr, codes) = manager();
        let (tx, mut rx) = channel();
        let attached = mgr
            .connect(&codes.vehicle, Some("Car1".into()), tx)
            .await
            .unwrap();

        // Direct set bypasses the transition table (2 -> 6 is not a
        // permitted self-service transition).
        mgr.set_status_direct(&attached.session, "Car1", PrimaryStatus::S6)
            .await
            .unwrap();
        let snap = latest_snapshot(&mut rx).await;
        assert_eq!(vehicle(&snap, "Car1")["status"], "6");

        mgr.apply_status(
            &attached.session,
            "Car1",
            StatusCommand::Toggle(SpecialFlag::Urgent),
        )
        .await;
        mgr.clear_special(&attached.session, "Car1").await.unwrap();
        let snap = latest_snapshot(&mut rx).await;
        let car = vehicle(&snap, "Car1");
        assert_eq!(car["special"], serde_json::Value::Null);
        assert_eq!(car["last_blitz_update"], serde_json::Value::Null);

        mgr.set_short_status(&attached.session, "Car1", Some("vor Ort".into()))
            .await;
        mgr.clear_short_status(&attached.session, "Car1").await.unwrap();
        let snap = latest_snapshot(&mut rx).await;
        assert_eq!(vehicle(&snap, "Car1")["kurzstatus"], serde_json::Value::Null);

        assert_eq!(
            mgr.clear_special(&attached.session, "Ghost").await,
            Err(OpError::VehicleNotFound)
        );
    }

    #[tokio::test]
    async fn private_message_reaches_target_and_privileged_only() {
        let (mgr, codes) = manager();
        let (tx_car1, mut rx_car1) = channel();
        let a = mgr
            .connect(&codes.vehicle, Some("Car1".into()), tx_car1)
            .await
            .unwrap();
        let (tx_car2, mut rx_car2) = channel();
        mgr.connect(&codes.vehicle, Some("Car2".into()), tx_car2)
            .await
            .unwrap();
        let (tx_sf, mut rx_sf) = channel();
        mgr.connect(&codes.leader, Some("SF".into()), tx_sf)
            .await
            .unwrap();

        // Drain attach-time snapshots.
        let _ = latest_snapshot(&mut rx_car1).await;
        let _ = latest_snapshot(&mut rx_car2).await;
        let _ = latest_snapshot(&mut rx_sf).await;

        mgr.send_message(&a.session, "LS", Some("Car1"), "Status prüfen")
            .await;

        let msg = rx_car1.recv().await.unwrap();
        assert_eq!(msg, "LS: Status prüfen");
        let msg = rx_sf.recv().await.unwrap();
        assert_eq!(msg, "LS: Status prüfen");
        // Car2 must not see the private message.
        assert!(rx_car2.try_recv().is_err());

        // History recorded only for the target.
        let history = mgr.chat_history(&a.session, "Car1").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sender, "LS");
        assert!(mgr.chat_history(&a.session, "Car2").await.is_empty());
    }

    #[tokio::test]
    async fn broadcast_message_reaches_all_vehicles() {
        let (mgr, codes) = manager();
        let (tx_car1, mut rx_car1) = channel();
        let a = mgr
            .connect(&codes.vehicle, Some("Car1".into()), tx_car1)
            .await
            .unwrap();
        let (tx_car2, mut rx_car2) = channel();
        mgr.connect(&codes.vehicle, Some("Car2".into()), tx_car2)
            .await
            .unwrap();
        let _ = latest_snapshot(&mut rx_car1).await;
        let _ = latest_snapshot(&mut rx_car2).await;

        mgr.send_message(&a.session, "SF", None, "Sammelplatz Nord").await;

        assert_eq!(rx_car1.recv().await.unwrap(), "SF: Sammelplatz Nord");
        assert_eq!(rx_car2.recv().await.unwrap(), "SF: Sammelplatz Nord");
        assert_eq!(mgr.chat_history(&a.session, "Car1").await.len(), 1);
        assert_eq!(mgr.chat_history(&a.session, "Car2").await.len(), 1);
    }

    #[tokio::test]
    async fn reaper_removes_idle_live_connection_and_its_notice() {
        let (mgr, codes) = manager();
        let (tx, _rx) = channel();
        let attached = mgr
            .connect(&codes.vehicle, Some("Car1".into()), tx)
            .await
            .unwrap();
        mgr.create_notice(&attached.session, "Car1", "Einrücken").await;

        // Backdate activity past the liveness timeout.
        {
            let mut state = attached.session.state.lock().await;
            state.find_mut("Car1").unwrap().last_activity =
                unix_now() - (Timeouts::default().liveness_timeout_secs as f64 + 20.0);
        }
        mgr.cleanup_inactive().await;

        let state = attached.session.state.lock().await;
        assert!(state.find("Car1").is_none());
        assert!(state.notices.is_empty());
    }

    #[tokio::test]
    async fn reaper_removes_disconnected_connection_after_grace() {
        let (mgr, codes) = manager();
        let (tx, _rx) = channel();
        let attached = mgr
            .connect(&codes.vehicle, Some("Car1".into()), tx)
            .await
            .unwrap();
        mgr.disconnect(&attached.session, "Car1", attached.socket_id)
            .await;

        // Within the grace window the connection survives.
        mgr.cleanup_inactive().await;
        assert!(attached.session.state.lock().await.find("Car1").is_some());

        {
            let mut state = attached.session.state.lock().await;
            state.find_mut("Car1").unwrap().disconnected_at =
                Some(unix_now() - (Timeouts::default().disconnect_grace_secs as f64 + 20.0));
        }
        mgr.cleanup_inactive().await;
        assert!(attached.session.state.lock().await.find("Car1").is_none());
    }

    #[tokio::test]
    async fn heartbeat_refreshes_activity() {
        let (mgr, codes) = manager();
        let (tx, _rx) = channel();
        let attached = mgr
            .connect(&codes.vehicle, Some("Car1".into()), tx)
            .await
            .unwrap();
        {
            let mut state = attached.session.state.lock().await;
            state.find_mut("Car1").unwrap().last_activity = unix_now() - 100.0;
        }
        mgr.heartbeat(&attached.session, "Car1").await;
        let state = attached.session.state.lock().await;
        assert!(unix_now() - state.find("Car1").unwrap().last_activity < 5.0);
    }
}
