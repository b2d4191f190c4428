//! Sessions ("Leitstellen") and the registry that maps access codes to them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::Mutex;

use crate::connection::{Connection, Role};
use crate::protocol::{ChatMessage, Notice};

/// Length of every issued access code.
pub const CODE_LEN: usize = 8;

/// Per-identity chat history cap; oldest entries are dropped first.
pub const CHAT_HISTORY_CAP: usize = 200;

/// The mutable interior of a session. Guarded by the session's async mutex
/// so mutation + broadcast form one critical section per session.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Roster of live and recently-live participants.
    pub connections: Vec<Connection>,
    /// Pending/confirmed notices keyed by identity name.
    pub notices: HashMap<String, Notice>,
    /// Dispatcher-authored notes keyed by identity name.
    pub notes: HashMap<String, String>,
    /// Leader-authored notes keyed by identity name.
    pub leader_notes: HashMap<String, String>,
    /// Bounded per-identity chat history.
    pub chat_history: HashMap<String, Vec<ChatMessage>>,
}

impl SessionState {
    pub fn find(&self, name: &str) -> Option<&Connection> {
        self.connections.iter().find(|c| c.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Connection> {
        self.connections.iter_mut().find(|c| c.name == name)
    }

    /// Append a chat message for `target`, dropping the oldest entries
    /// beyond [`CHAT_HISTORY_CAP`].
    pub fn push_chat(&mut self, target: &str, message: ChatMessage) {
        let history = self.chat_history.entry(target.to_string()).or_default();
        history.push(message);
        if history.len() > CHAT_HISTORY_CAP {
            let excess = history.len() - CHAT_HISTORY_CAP;
            history.drain(..excess);
        }
    }
}

/// One dispatch-room instance with its own roster, codes, notices and notes.
#[derive(Debug)]
pub struct Session {
    /// Display name chosen at creation.
    pub name: String,
    /// Primary (dispatcher) access code.
    pub session_code: String,
    /// Secondary code resolving to the vehicle role.
    pub vehicle_code: String,
    /// Secondary code resolving to the leader role.
    pub leader_code: String,
    pub state: Mutex<SessionState>,
}

/// The three codes issued for a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCodes {
    pub session: String,
    pub vehicle: String,
    pub leader: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown access code: {0}")]
    UnknownCode(String),
}

struct RegistryInner {
    /// Sessions keyed by their primary code.
    sessions: HashMap<String, Arc<Session>>,
    /// Secondary code -> (primary code, role).
    code_index: HashMap<String, (String, Role)>,
}

/// Maps opaque access codes to sessions and roles.
///
/// All three code kinds share one namespace: a code is only issued if it
/// collides with nothing already registered. Lookups are case-insensitive
/// (normalized to uppercase). Sessions live until process restart; there
/// is no explicit deletion.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                code_index: HashMap::new(),
            })),
        }
    }

    /// Create a session, issuing three pairwise-distinct codes that are
    /// also distinct from every code already registered.
    pub fn create_session(&self, name: &str) -> SessionCodes {
        let mut inner = self.inner.write();

        let codes = loop {
            let session = generate_code();
            let vehicle = generate_code();
            let leader = generate_code();
            let distinct = session != vehicle && session != leader && vehicle != leader;
            if distinct
                && !inner.is_registered(&session)
                && !inner.is_registered(&vehicle)
                && !inner.is_registered(&leader)
            {
                break SessionCodes {
                    session,
                    vehicle,
                    leader,
                };
            }
        };

        let session = Arc::new(Session {
            name: name.to_string(),
            session_code: codes.session.clone(),
            vehicle_code: codes.vehicle.clone(),
            leader_code: codes.leader.clone(),
            state: Mutex::new(SessionState::default()),
        });
        inner
            .code_index
            .insert(codes.vehicle.clone(), (codes.session.clone(), Role::Vehicle));
        inner
            .code_index
            .insert(codes.leader.clone(), (codes.session.clone(), Role::Leader));
        inner.sessions.insert(codes.session.clone(), session);

        tracing::info!(session = %codes.session, name = %name, "session created");
        codes
    }

    /// Resolve any access code to its session and the role it grants.
    pub fn resolve(&self, code: &str) -> Result<(Arc<Session>, Role), RegistryError> {
        let code = code.to_uppercase();
        let inner = self.inner.read();
        if let Some(session) = inner.sessions.get(&code) {
            return Ok((Arc::clone(session), Role::Dispatcher));
        }
        if let Some((session_code, role)) = inner.code_index.get(&code) {
            if let Some(session) = inner.sessions.get(session_code) {
                return Ok((Arc::clone(session), *role));
            }
        }
        Err(RegistryError::UnknownCode(code))
    }

    /// Look up a session by its primary code only.
    pub fn get(&self, session_code: &str) -> Option<Arc<Session>> {
        let code = session_code.to_uppercase();
        self.inner.read().sessions.get(&code).cloned()
    }

    /// Snapshot of all sessions, for the reaper's sweep.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.read().sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RegistryInner {
    fn is_registered(&self, code: &str) -> bool {
        self.sessions.contains_key(code) || self.code_index.contains_key(code)
    }
}

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}
