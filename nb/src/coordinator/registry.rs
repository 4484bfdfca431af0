//! Resource name to elected server mapping

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::session::{ClientSession, Role, SessionId};

/// Outcome of an election attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// The name already had a server; nothing changed
    AlreadyAssigned(SessionId),

    /// A candidate was promoted to server
    Elected(SessionId),

    /// No active candidate is registered for the name
    NoneEligible,
}

impl Selection {
    /// The server for the name after the attempt, if any
    pub fn server(&self) -> Option<SessionId> {
        match self {
            Selection::AlreadyAssigned(id) | Selection::Elected(id) => Some(*id),
            Selection::NoneEligible => None,
        }
    }
}

/// At most one server per resource name
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    servers: BTreeMap<String, SessionId>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Elect a server for `name` unless one is already assigned
    ///
    /// Among active candidates registered for `name`, the earliest registration
    /// wins, so the choice is stable for a fixed set of sessions.
    pub fn select_server(&mut self, name: &str, sessions: &mut BTreeMap<SessionId, ClientSession>) -> Selection {
        if let Some(&id) = self.servers.get(name) {
            debug!(resource = %name, session_id = id, "select_server: already assigned");
            return Selection::AlreadyAssigned(id);
        }

        let chosen = sessions
            .values()
            .filter(|s| s.is_candidate_for(name))
            .min_by_key(|s| s.registered_seq)
            .map(|s| s.id);

        match chosen.and_then(|id| sessions.get_mut(&id)) {
            Some(session) => {
                session.role = Role::Server;
                self.servers.insert(name.to_string(), session.id);
                info!(resource = %name, session_id = session.id, "Server elected");
                Selection::Elected(session.id)
            }
            None => {
                debug!(resource = %name, "select_server: no eligible session");
                Selection::NoneEligible
            }
        }
    }

    pub fn server_for(&self, name: &str) -> Option<SessionId> {
        self.servers.get(name).copied()
    }

    /// Clear every entry pointing at `id`, returning the names left unassigned
    pub fn release_session(&mut self, id: SessionId) -> Vec<String> {
        let released: Vec<String> = self
            .servers
            .iter()
            .filter(|(_, server)| **server == id)
            .map(|(name, _)| name.clone())
            .collect();

        for name in &released {
            self.servers.remove(name);
            info!(resource = %name, session_id = id, "Server released, resource unassigned");
        }
        released
    }

    pub fn assignments(&self) -> &BTreeMap<String, SessionId> {
        &self.servers
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
