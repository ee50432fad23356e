use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::net::{HOST_IDENTITY, NetworkIdentity, Packet, PlatformId};

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerSession {
    pub identity: NetworkIdentity,
    pub platform_id: PlatformId,
    /// Local label only, never sent on the wire.
    pub display_name: String,
    pub loadout_index: i32,
    pub is_ready: bool,
}

impl PlayerSession {
    pub fn new(identity: NetworkIdentity, platform_id: PlatformId) -> Self {
        Self {
            identity,
            platform_id,
            display_name: default_display_name(identity),
            loadout_index: 0,
            is_ready: false,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn to_sync_packet(&self) -> Packet {
        Packet::SessionSync {
            identity: self.identity,
            platform_id: self.platform_id,
            loadout_index: self.loadout_index,
            is_ready: self.is_ready,
        }
    }
}

pub fn default_display_name(identity: NetworkIdentity) -> String {
    if identity == HOST_IDENTITY {
        String::from("Host")
    } else {
        format!("Glorp {identity}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
    Unknown,
    Handshaking,
    Synced,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    Unchanged,
    Retired,
}

pub type DirectorySnapshot = Arc<[PlayerSession]>;

/// Every participant's lobby state, keyed by network identity. Readers take
/// an immutable [`DirectorySnapshot`] so they never observe a half-applied
/// update.
#[derive(Debug)]
pub struct SessionDirectory {
    sessions: BTreeMap<NetworkIdentity, PlayerSession>,
    states: BTreeMap<NetworkIdentity, ParticipantState>,
    retired: HashSet<NetworkIdentity>,
    next_identity: u16,
    snapshot: DirectorySnapshot,
}

impl Default for SessionDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            states: BTreeMap::new(),
            retired: HashSet::new(),
            next_identity: HOST_IDENTITY as u16 + 1,
            snapshot: Arc::from(Vec::new()),
        }
    }

    /// Hands out identities in increasing order, never reusing one for the
    /// lifetime of the directory.
    pub fn assign_identity(&mut self) -> Option<NetworkIdentity> {
        let identity = NetworkIdentity::try_from(self.next_identity).ok()?;
        self.next_identity += 1;
        Some(identity)
    }

    pub fn upsert(&mut self, session: PlayerSession) -> Upsert {
        if self.retired.contains(&session.identity) {
            return Upsert::Retired;
        }
        let outcome = match self.sessions.get_mut(&session.identity) {
            Some(existing) if *existing == session => return Upsert::Unchanged,
            Some(existing) => {
                *existing = session;
                Upsert::Updated
            }
            None => {
                self.sessions.insert(session.identity, session);
                Upsert::Inserted
            }
        };
        self.refresh();
        outcome
    }

    /// Returns `Some(true)` when the stored value changed, `None` for an
    /// unknown identity.
    pub fn set_loadout(&mut self, identity: NetworkIdentity, loadout_index: i32) -> Option<bool> {
        let session = self.sessions.get_mut(&identity)?;
        if session.loadout_index == loadout_index {
            return Some(false);
        }
        session.loadout_index = loadout_index;
        self.refresh();
        Some(true)
    }

    pub fn set_ready(&mut self, identity: NetworkIdentity, is_ready: bool) -> Option<bool> {
        let session = self.sessions.get_mut(&identity)?;
        if session.is_ready == is_ready {
            return Some(false);
        }
        session.is_ready = is_ready;
        self.refresh();
        Some(true)
    }

    pub fn remove(&mut self, identity: NetworkIdentity) -> Option<PlayerSession> {
        self.retire(identity);
        let removed = self.sessions.remove(&identity);
        if removed.is_some() {
            self.refresh();
        }
        removed
    }

    pub fn retire(&mut self, identity: NetworkIdentity) {
        self.retired.insert(identity);
        self.states.insert(identity, ParticipantState::Disconnected);
    }

    pub fn is_retired(&self, identity: NetworkIdentity) -> bool {
        self.retired.contains(&identity)
    }

    /// Forgets everything, including retired identities. Used when the
    /// session itself ends.
    pub fn clear(&mut self) {
        self.sessions.clear();
        self.states.clear();
        self.retired.clear();
        self.next_identity = HOST_IDENTITY as u16 + 1;
        self.refresh();
    }

    pub fn set_state(&mut self, identity: NetworkIdentity, state: ParticipantState) {
        self.states.insert(identity, state);
    }

    pub fn state(&self, identity: NetworkIdentity) -> ParticipantState {
        self.states
            .get(&identity)
            .copied()
            .unwrap_or(ParticipantState::Unknown)
    }

    pub fn get(&self, identity: NetworkIdentity) -> Option<&PlayerSession> {
        self.sessions.get(&identity)
    }

    pub fn contains(&self, identity: NetworkIdentity) -> bool {
        self.sessions.contains_key(&identity)
    }

    pub fn snapshot(&self) -> DirectorySnapshot {
        Arc::clone(&self.snapshot)
    }

    pub fn identities(&self) -> impl Iterator<Item = NetworkIdentity> + '_ {
        self.sessions.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn all_ready(&self) -> bool {
        !self.sessions.is_empty() && self.sessions.values().all(|s| s.is_ready)
    }

    fn refresh(&mut self) {
        self.snapshot = self.sessions.values().cloned().collect::<Vec<_>>().into();
    }
}
