use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use glam::Vec3;

use super::error::{ProtocolViolation, ReplicationError};
use super::events::{Destination, Outbound, ReplicationEvent};
use crate::config::{MovementAuthority, ReplicationConfig};
use crate::entity::{EntityReconciler, ReplicatedEntity, SnapshotOutcome, spawn_point};
use crate::loadout::LoadoutCatalog;
use crate::net::codec;
use crate::net::{
    HOST_IDENTITY, NetworkIdentity, Packet, PacketKind, PeerHandle, PlatformId, TransportEvent,
};
use crate::session::{DirectorySnapshot, ParticipantState, PlayerSession, SessionDirectory, Upsert};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Idle,
    Host,
    Client,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GamePhase {
    Lobby,
    InGame { map_path: String },
}

#[derive(Debug, Clone, Copy)]
struct PeerLink {
    platform_id: PlatformId,
    identity: Option<NetworkIdentity>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchStats {
    pub packets_handled: u64,
    pub decode_errors: u64,
    pub violations: u64,
    pub relayed: u64,
}

/// Host-authoritative replication state machine. Applies inbound packets
/// and local actions to the session directory and entities, queueing
/// outbound packets and presentation events for the driver to flush.
pub struct ReplicationDispatcher {
    config: ReplicationConfig,
    catalog: LoadoutCatalog,
    role: Role,
    local_platform_id: PlatformId,
    local_name: String,
    local_identity: Option<NetworkIdentity>,
    local_state: ParticipantState,
    directory: SessionDirectory,
    reconciler: EntityReconciler,
    peers: HashMap<PeerHandle, PeerLink>,
    host_peer: Option<PeerHandle>,
    phase: GamePhase,
    outbox: Vec<Outbound>,
    events: VecDeque<ReplicationEvent>,
    disconnects: Vec<PeerHandle>,
    stats: DispatchStats,
}

impl ReplicationDispatcher {
    pub fn new(
        config: ReplicationConfig,
        catalog: LoadoutCatalog,
        local_platform_id: PlatformId,
        local_name: impl Into<String>,
    ) -> Self {
        let reconciler = EntityReconciler::new(&config);
        Self {
            config,
            catalog,
            role: Role::Idle,
            local_platform_id,
            local_name: local_name.into(),
            local_identity: None,
            local_state: ParticipantState::Unknown,
            directory: SessionDirectory::new(),
            reconciler,
            peers: HashMap::new(),
            host_peer: None,
            phase: GamePhase::Lobby,
            outbox: Vec::new(),
            events: VecDeque::new(),
            disconnects: Vec::new(),
            stats: DispatchStats::default(),
        }
    }

    pub fn begin_hosting(&mut self) -> Result<(), ReplicationError> {
        if self.role != Role::Idle {
            return Err(ReplicationError::AlreadyInSession);
        }
        self.role = Role::Host;
        self.local_identity = Some(HOST_IDENTITY);
        self.local_state = ParticipantState::Synced;
        let session = PlayerSession::new(HOST_IDENTITY, self.local_platform_id)
            .with_display_name(self.local_name.clone());
        self.directory.upsert(session);
        self.directory
            .set_state(HOST_IDENTITY, ParticipantState::Synced);
        self.events.push_back(ReplicationEvent::LocalIdentityAssigned {
            identity: HOST_IDENTITY,
        });
        log::info!("hosting session as identity {HOST_IDENTITY}");
        Ok(())
    }

    pub fn begin_joining(&mut self) -> Result<(), ReplicationError> {
        if self.role != Role::Idle {
            return Err(ReplicationError::AlreadyInSession);
        }
        self.role = Role::Client;
        Ok(())
    }

    /// Drops all session state and returns to idle.
    pub fn end_session(&mut self) {
        self.directory.clear();
        self.reconciler.clear();
        self.peers.clear();
        self.host_peer = None;
        self.local_identity = None;
        self.local_state = ParticipantState::Unknown;
        self.phase = GamePhase::Lobby;
        self.outbox.clear();
        self.disconnects.clear();
        self.role = Role::Idle;
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerConnected { peer, platform_id } => {
                self.on_peer_connected(peer, platform_id)
            }
            TransportEvent::PeerDisconnected { peer, platform_id } => {
                self.on_peer_disconnected(peer, platform_id)
            }
            TransportEvent::MessageReceived { peer, data } => self.handle_message(peer, data),
        }
    }

    pub fn handle_message(&mut self, peer: PeerHandle, data: Bytes) {
        let packet = match Packet::decode(&data) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.decode_errors += 1;
                log::warn!("dropping undecodable message from {peer:?}: {e}");
                return;
            }
        };

        let kind = packet.kind();
        let result = match self.role {
            Role::Host => self.host_packet(peer, packet, data),
            Role::Client => self.client_packet(peer, packet),
            Role::Idle => Err(ProtocolViolation::NotInSession(kind)),
        };
        self.stats.packets_handled += 1;

        if let Err(violation) = result {
            self.stats.violations += 1;
            log::warn!("dropped {kind:?} from {peer:?}: {violation}");
        }
    }

    fn on_peer_connected(&mut self, peer: PeerHandle, platform_id: PlatformId) {
        match self.role {
            Role::Host => self.admit_peer(peer, platform_id),
            Role::Client => {
                if let Some(existing) = self.host_peer {
                    log::warn!("ignoring connection {peer:?}, already joined through {existing:?}");
                    self.disconnects.push(peer);
                    return;
                }
                log::info!("connected to host {platform_id} via {peer:?}");
                self.host_peer = Some(peer);
                self.local_state = ParticipantState::Handshaking;
                self.peers.insert(
                    peer,
                    PeerLink {
                        platform_id,
                        identity: Some(HOST_IDENTITY),
                    },
                );
            }
            Role::Idle => {
                log::warn!("connection {peer:?} from {platform_id} while idle");
                self.disconnects.push(peer);
            }
        }
    }

    fn admit_peer(&mut self, peer: PeerHandle, platform_id: PlatformId) {
        if self.peers.contains_key(&peer) {
            return;
        }
        let Some(identity) = self.directory.assign_identity() else {
            log::warn!("rejecting {platform_id}: network identities exhausted");
            self.events
                .push_back(ReplicationEvent::PeerRejected { peer });
            self.disconnects.push(peer);
            return;
        };

        let session = PlayerSession::new(identity, platform_id);
        self.directory.upsert(session.clone());
        self.directory
            .set_state(identity, ParticipantState::Handshaking);
        self.peers.insert(
            peer,
            PeerLink {
                platform_id,
                identity: Some(identity),
            },
        );
        log::info!("assigned identity {identity} to {platform_id}");

        self.queue(Destination::Peer(peer), &Packet::Handshake { identity });
        let roster = self.directory.snapshot();
        for existing in roster.iter().filter(|s| s.identity != identity) {
            self.queue(Destination::Peer(peer), &existing.to_sync_packet());
        }
        self.queue(Destination::AllPeers, &session.to_sync_packet());

        if let GamePhase::InGame { map_path } = self.phase.clone() {
            self.spawn_entity(identity);
            self.queue(Destination::Peer(peer), &Packet::GameStart { map_path });
        }

        self.events
            .push_back(ReplicationEvent::SessionJoined { identity });
    }

    fn on_peer_disconnected(&mut self, peer: PeerHandle, platform_id: PlatformId) {
        match self.role {
            Role::Host => {
                let Some(link) = self.peers.remove(&peer) else {
                    log::debug!("disconnect from {platform_id} before it was admitted");
                    return;
                };
                let Some(identity) = link.identity else {
                    return;
                };
                self.directory.remove(identity);
                self.reconciler.despawn(identity);
                log::info!("identity {identity} ({}) left", link.platform_id);
                self.queue(Destination::AllPeers, &Packet::PeerLeft { identity });
                self.events
                    .push_back(ReplicationEvent::SessionLeft { identity });
            }
            Role::Client if self.host_peer == Some(peer) => {
                log::warn!("lost connection to host {platform_id}");
                self.end_session();
                self.events.push_back(ReplicationEvent::HostLost);
            }
            Role::Client if self.host_peer.is_none() => {
                log::warn!("could not connect to {platform_id}");
                self.end_session();
                self.events
                    .push_back(ReplicationEvent::ConnectionFailed { platform_id });
            }
            Role::Client | Role::Idle => {}
        }
    }

    fn host_packet(
        &mut self,
        peer: PeerHandle,
        packet: Packet,
        raw: Bytes,
    ) -> Result<(), ProtocolViolation> {
        let link = self
            .peers
            .get(&peer)
            .copied()
            .ok_or(ProtocolViolation::UnknownPeer(peer))?;
        let owned = link.identity;
        let kind = packet.kind();

        if let Some(claimed) = packet.claimed_identity() {
            if owned != Some(claimed) {
                return Err(ProtocolViolation::IdentityMismatch {
                    peer,
                    claimed,
                    owned,
                });
            }
        }
        let synced = owned
            .is_some_and(|id| self.directory.state(id) == ParticipantState::Synced);
        if !synced && kind != PacketKind::Handshake {
            return Err(ProtocolViolation::NotSynced { peer, kind });
        }

        match packet {
            Packet::Handshake { identity } => {
                if owned != Some(identity) {
                    return Err(ProtocolViolation::IdentityMismatch {
                        peer,
                        claimed: identity,
                        owned,
                    });
                }
                if !synced {
                    self.directory
                        .set_state(identity, ParticipantState::Synced);
                    log::debug!("identity {identity} completed handshake");
                }
                Ok(())
            }
            Packet::SessionSync { .. } | Packet::GameStart { .. } | Packet::PeerLeft { .. } => {
                Err(ProtocolViolation::HostOnlyPacket(kind))
            }
            Packet::ClassSelected {
                identity,
                loadout_index,
            } => {
                if !self.catalog.contains(loadout_index) {
                    return Err(ProtocolViolation::InvalidLoadout(loadout_index));
                }
                self.apply_loadout(identity, loadout_index)?;
                self.relay(raw, kind);
                Ok(())
            }
            Packet::ReadyStatus { identity, is_ready } => {
                self.apply_ready(identity, is_ready)?;
                self.relay(raw, kind);
                Ok(())
            }
            Packet::MoveCommand { identity, target } => {
                if self.config.movement_authority != MovementAuthority::HostSimulated {
                    return Err(ProtocolViolation::NotAuthoritative { kind, identity });
                }
                let entity = self
                    .reconciler
                    .get_mut(identity)
                    .ok_or(ProtocolViolation::NoEntity(identity))?;
                if entity.vitals.alive {
                    entity.locomotion.set_target(target);
                }
                Ok(())
            }
            Packet::PositionUpdate {
                identity,
                position,
                rotation,
            } => match self.reconciler.apply_snapshot(identity, position, rotation) {
                SnapshotOutcome::Applied => {
                    self.relay(raw, kind);
                    Ok(())
                }
                SnapshotOutcome::LocallySimulated => {
                    Err(ProtocolViolation::NotAuthoritative { kind, identity })
                }
                SnapshotOutcome::UnknownEntity => Err(ProtocolViolation::NoEntity(identity)),
            },
            Packet::AbilityCast {
                identity,
                ability_name,
            } => {
                self.present_cast(identity, ability_name)?;
                self.relay(raw, kind);
                Ok(())
            }
            Packet::DamageEvent {
                target,
                damage,
                new_health,
            } => {
                self.apply_damage_event(target, damage, new_health)?;
                self.relay(raw, kind);
                Ok(())
            }
            Packet::DeathEvent { victim, killer } => {
                self.apply_death(victim, killer)?;
                self.relay(raw, kind);
                Ok(())
            }
        }
    }

    fn client_packet(&mut self, peer: PeerHandle, packet: Packet) -> Result<(), ProtocolViolation> {
        if self.host_peer != Some(peer) {
            return Err(ProtocolViolation::NotFromHost(peer));
        }
        let kind = packet.kind();

        match packet {
            Packet::Handshake { identity } => self.accept_identity(identity),
            Packet::SessionSync {
                identity,
                platform_id,
                loadout_index,
                is_ready,
            } => self.sync_session(identity, platform_id, loadout_index, is_ready),
            Packet::GameStart { map_path } => {
                self.enter_game(map_path);
                Ok(())
            }
            Packet::PositionUpdate {
                identity,
                position,
                rotation,
            } => match self.reconciler.apply_snapshot(identity, position, rotation) {
                SnapshotOutcome::Applied | SnapshotOutcome::LocallySimulated => Ok(()),
                SnapshotOutcome::UnknownEntity => Err(ProtocolViolation::NoEntity(identity)),
            },
            Packet::ClassSelected {
                identity,
                loadout_index,
            } => self.apply_loadout(identity, loadout_index),
            Packet::ReadyStatus { identity, is_ready } => self.apply_ready(identity, is_ready),
            Packet::AbilityCast {
                identity,
                ability_name,
            } => self.present_cast(identity, ability_name),
            Packet::MoveCommand { identity, .. } => {
                Err(ProtocolViolation::NotAuthoritative { kind, identity })
            }
            Packet::DamageEvent {
                target,
                damage,
                new_health,
            } => self.apply_damage_event(target, damage, new_health),
            Packet::DeathEvent { victim, killer } => self.apply_death(victim, killer),
            Packet::PeerLeft { identity } => {
                if Some(identity) == self.local_identity {
                    return Err(ProtocolViolation::IdentityMismatch {
                        peer,
                        claimed: identity,
                        owned: self.local_identity,
                    });
                }
                if self.directory.remove(identity).is_none() {
                    return Err(ProtocolViolation::UnknownIdentity(identity));
                }
                self.reconciler.despawn(identity);
                self.events
                    .push_back(ReplicationEvent::SessionLeft { identity });
                Ok(())
            }
        }
    }

    fn accept_identity(&mut self, identity: NetworkIdentity) -> Result<(), ProtocolViolation> {
        if self.directory.is_retired(identity) {
            return Err(ProtocolViolation::RetiredIdentity(identity));
        }
        if self.local_identity == Some(identity) {
            return Ok(());
        }
        if let Some(previous) = self.local_identity {
            log::warn!("host reassigned identity {previous} -> {identity}");
        }
        self.local_identity = Some(identity);
        self.local_state = ParticipantState::Synced;

        let mut session = self
            .directory
            .get(identity)
            .cloned()
            .unwrap_or_else(|| PlayerSession::new(identity, self.local_platform_id));
        session.display_name = self.local_name.clone();
        self.directory.upsert(session);
        self.directory
            .set_state(identity, ParticipantState::Synced);
        log::info!("joined session as identity {identity}");

        self.send_to_host(&Packet::Handshake { identity });
        self.events
            .push_back(ReplicationEvent::LocalIdentityAssigned { identity });
        Ok(())
    }

    fn sync_session(
        &mut self,
        identity: NetworkIdentity,
        platform_id: PlatformId,
        loadout_index: i32,
        is_ready: bool,
    ) -> Result<(), ProtocolViolation> {
        let previous = self.directory.get(identity).cloned();
        let display_name = match &previous {
            Some(existing) => existing.display_name.clone(),
            None if self.local_identity == Some(identity) => self.local_name.clone(),
            None => crate::session::default_display_name(identity),
        };
        let session = PlayerSession {
            identity,
            platform_id,
            display_name,
            loadout_index,
            is_ready,
        };

        match self.directory.upsert(session) {
            Upsert::Retired => Err(ProtocolViolation::RetiredIdentity(identity)),
            Upsert::Unchanged => Ok(()),
            Upsert::Inserted => {
                self.directory
                    .set_state(identity, ParticipantState::Synced);
                self.events
                    .push_back(ReplicationEvent::SessionJoined { identity });
                if self.is_in_game() {
                    self.spawn_entity(identity);
                }
                Ok(())
            }
            Upsert::Updated => {
                if let Some(previous) = previous {
                    if previous.loadout_index != loadout_index {
                        self.loadout_changed(identity, loadout_index);
                    }
                    if previous.is_ready != is_ready {
                        self.events
                            .push_back(ReplicationEvent::ReadyChanged { identity, is_ready });
                    }
                }
                Ok(())
            }
        }
    }

    fn apply_loadout(
        &mut self,
        identity: NetworkIdentity,
        loadout_index: i32,
    ) -> Result<(), ProtocolViolation> {
        match self.directory.set_loadout(identity, loadout_index) {
            None => Err(ProtocolViolation::UnknownIdentity(identity)),
            Some(changed) => {
                if changed {
                    self.loadout_changed(identity, loadout_index);
                }
                Ok(())
            }
        }
    }

    fn loadout_changed(&mut self, identity: NetworkIdentity, loadout_index: i32) {
        if let (Some(loadout), Some(entity)) = (
            self.catalog.resolve(loadout_index),
            self.reconciler.get_mut(identity),
        ) {
            entity.apply_loadout(loadout);
        }
        self.events.push_back(ReplicationEvent::LoadoutChanged {
            identity,
            loadout_index,
        });
    }

    fn apply_ready(
        &mut self,
        identity: NetworkIdentity,
        is_ready: bool,
    ) -> Result<(), ProtocolViolation> {
        match self.directory.set_ready(identity, is_ready) {
            None => Err(ProtocolViolation::UnknownIdentity(identity)),
            Some(changed) => {
                if changed {
                    self.events
                        .push_back(ReplicationEvent::ReadyChanged { identity, is_ready });
                }
                Ok(())
            }
        }
    }

    fn present_cast(
        &mut self,
        identity: NetworkIdentity,
        ability_name: String,
    ) -> Result<(), ProtocolViolation> {
        if !self.directory.contains(identity) {
            return Err(ProtocolViolation::UnknownIdentity(identity));
        }
        // The caster ran its own visuals when it cast.
        if self.local_identity != Some(identity) {
            self.events.push_back(ReplicationEvent::AbilityCast {
                caster: identity,
                ability_name,
            });
        }
        Ok(())
    }

    fn apply_damage_event(
        &mut self,
        target: NetworkIdentity,
        damage: i16,
        new_health: i16,
    ) -> Result<(), ProtocolViolation> {
        let entity = self
            .reconciler
            .get_mut(target)
            .ok_or(ProtocolViolation::NoEntity(target))?;
        entity.vitals.set_health(new_health);
        let new_health = entity.vitals.health;
        self.events.push_back(ReplicationEvent::DamageTaken {
            target,
            damage,
            new_health,
        });
        Ok(())
    }

    fn apply_death(
        &mut self,
        victim: NetworkIdentity,
        killer: NetworkIdentity,
    ) -> Result<(), ProtocolViolation> {
        let entity = self
            .reconciler
            .get_mut(victim)
            .ok_or(ProtocolViolation::NoEntity(victim))?;
        if entity.vitals.kill() {
            entity.locomotion.target = None;
            self.events
                .push_back(ReplicationEvent::Died { victim, killer });
        }
        Ok(())
    }

    fn enter_game(&mut self, map_path: String) {
        log::info!("entering {map_path}");
        self.phase = GamePhase::InGame {
            map_path: map_path.clone(),
        };
        let identities: Vec<NetworkIdentity> = self.directory.identities().collect();
        for identity in identities {
            self.spawn_entity(identity);
        }
        self.events
            .push_back(ReplicationEvent::SceneTransition { map_path });
    }

    fn spawn_entity(&mut self, identity: NetworkIdentity) {
        let Some(session) = self.directory.get(identity) else {
            return;
        };
        let Some(loadout) = self.catalog.resolve(session.loadout_index) else {
            return;
        };
        let is_local_player = self.local_identity == Some(identity);
        let is_locally_owned = match self.config.movement_authority {
            MovementAuthority::HostSimulated => self.role == Role::Host,
            MovementAuthority::OwnerSimulated => is_local_player,
        };
        let position = spawn_point(identity, self.config.spawn_radius, self.config.spawn_height);
        self.reconciler
            .spawn(identity, position, loadout, is_locally_owned, is_local_player);
    }

    fn queue(&mut self, destination: Destination, packet: &Packet) {
        match Outbound::new(destination, packet) {
            Ok(outbound) => self.outbox.push(outbound),
            Err(e) => log::warn!("not sending to {destination:?}: {e}"),
        }
    }

    fn relay(&mut self, raw: Bytes, kind: PacketKind) {
        self.stats.relayed += 1;
        self.outbox.push(Outbound {
            destination: Destination::AllPeers,
            payload: raw,
            reliability: kind.reliability(),
        });
    }

    fn send_to_host(&mut self, packet: &Packet) {
        if let Some(host) = self.host_peer {
            self.queue(Destination::Peer(host), packet);
        }
    }

    /// Host broadcasts to every peer; a client hands the packet to the host,
    /// which relays it.
    fn publish(&mut self, packet: &Packet) -> Result<(), ReplicationError> {
        let destination = match self.role {
            Role::Host => Destination::AllPeers,
            Role::Client => {
                Destination::Peer(self.host_peer.ok_or(ReplicationError::NotConnected)?)
            }
            Role::Idle => return Err(ReplicationError::NotConnected),
        };
        self.outbox.push(Outbound::new(destination, packet)?);
        Ok(())
    }

    fn require_identity(&self) -> Result<NetworkIdentity, ReplicationError> {
        self.local_identity.ok_or(ReplicationError::NotSynced)
    }

    fn require_game(&self) -> Result<(), ReplicationError> {
        if self.is_in_game() {
            Ok(())
        } else {
            Err(ReplicationError::GameNotStarted)
        }
    }

    pub fn select_loadout(&mut self, loadout_index: i32) -> Result<(), ReplicationError> {
        let identity = self.require_identity()?;
        if !self.catalog.contains(loadout_index) {
            return Err(ReplicationError::UnknownLoadout(loadout_index));
        }
        if self.directory.set_loadout(identity, loadout_index) == Some(true) {
            self.loadout_changed(identity, loadout_index);
        }
        self.publish(&Packet::ClassSelected {
            identity,
            loadout_index,
        })
    }

    pub fn set_ready(&mut self, is_ready: bool) -> Result<(), ReplicationError> {
        let identity = self.require_identity()?;
        if self.directory.set_ready(identity, is_ready) == Some(true) {
            self.events
                .push_back(ReplicationEvent::ReadyChanged { identity, is_ready });
        }
        self.publish(&Packet::ReadyStatus { identity, is_ready })
    }

    pub fn toggle_ready(&mut self) -> Result<bool, ReplicationError> {
        let identity = self.require_identity()?;
        let is_ready = !self
            .directory
            .get(identity)
            .is_some_and(|s| s.is_ready);
        self.set_ready(is_ready)?;
        Ok(is_ready)
    }

    pub fn start_game(&mut self, map_path: impl Into<String>) -> Result<(), ReplicationError> {
        if self.role != Role::Host {
            return Err(ReplicationError::NotHost("start the game"));
        }
        if self.is_in_game() {
            return Err(ReplicationError::GameInProgress);
        }
        if !self.directory.all_ready() {
            return Err(ReplicationError::NotAllReady);
        }
        let map_path = map_path.into();
        codec::check_string(PacketKind::GameStart, &map_path)?;
        self.enter_game(map_path.clone());
        self.publish(&Packet::GameStart { map_path })
    }

    /// Orders the local player's entity toward `target`. Entities simulated
    /// elsewhere get a move command sent to the host instead.
    pub fn issue_move(&mut self, target: Vec3) -> Result<(), ReplicationError> {
        let identity = self.require_identity()?;
        self.require_game()?;
        let entity = self
            .reconciler
            .get_mut(identity)
            .ok_or(ReplicationError::UnknownEntity(identity))?;
        if !entity.vitals.alive {
            return Err(ReplicationError::Dead(identity));
        }
        if entity.is_locally_owned {
            entity.locomotion.set_target(target);
            return Ok(());
        }
        self.publish(&Packet::MoveCommand { identity, target })
    }

    pub fn cast_ability(&mut self, slot: usize) -> Result<String, ReplicationError> {
        let identity = self.require_identity()?;
        self.require_game()?;
        let entity = self
            .reconciler
            .get_mut(identity)
            .ok_or(ReplicationError::UnknownEntity(identity))?;
        if !entity.vitals.alive {
            return Err(ReplicationError::Dead(identity));
        }
        let ability_name = entity.abilities.try_cast(slot)?.name.clone();

        self.publish(&Packet::AbilityCast {
            identity,
            ability_name: ability_name.clone(),
        })?;
        self.events.push_back(ReplicationEvent::AbilityCast {
            caster: identity,
            ability_name: ability_name.clone(),
        });
        Ok(ability_name)
    }

    /// Host only. Applies damage to `target` and announces it, followed by a
    /// death notice when health runs out. Returns the new health.
    pub fn apply_damage(
        &mut self,
        attacker: NetworkIdentity,
        target: NetworkIdentity,
        amount: i16,
    ) -> Result<i16, ReplicationError> {
        if self.role != Role::Host {
            return Err(ReplicationError::NotHost("apply damage"));
        }
        self.require_game()?;
        let entity = self
            .reconciler
            .get_mut(target)
            .ok_or(ReplicationError::UnknownEntity(target))?;
        if !entity.vitals.alive {
            return Err(ReplicationError::Dead(target));
        }
        let damage = amount.max(0);
        let depleted = entity
            .vitals
            .set_health(entity.vitals.health.saturating_sub(damage));
        let new_health = entity.vitals.health;
        let died = depleted && entity.vitals.kill();
        if died {
            entity.locomotion.target = None;
        }

        self.events.push_back(ReplicationEvent::DamageTaken {
            target,
            damage,
            new_health,
        });
        self.publish(&Packet::DamageEvent {
            target,
            damage,
            new_health,
        })?;

        if died {
            self.events.push_back(ReplicationEvent::Died {
                victim: target,
                killer: attacker,
            });
            self.publish(&Packet::DeathEvent {
                victim: target,
                killer: attacker,
            })?;
        }
        Ok(new_health)
    }

    /// Steps simulation and smoothing, then queues position snapshots for
    /// every entity simulated here.
    pub fn tick(&mut self, dt: f32) {
        self.reconciler.tick(dt);
        if !self.is_in_game() {
            return;
        }
        for snapshot in self.reconciler.collect_snapshots(dt) {
            match self.role {
                Role::Host => self.queue(Destination::AllPeers, &snapshot),
                Role::Client => self.send_to_host(&snapshot),
                Role::Idle => {}
            }
        }
    }

    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    pub fn drain_events(&mut self) -> Vec<ReplicationEvent> {
        self.events.drain(..).collect()
    }

    pub fn drain_disconnects(&mut self) -> Vec<PeerHandle> {
        std::mem::take(&mut self.disconnects)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    pub fn local_identity(&self) -> Option<NetworkIdentity> {
        self.local_identity
    }

    pub fn local_platform_id(&self) -> PlatformId {
        self.local_platform_id
    }

    pub fn host_peer(&self) -> Option<PeerHandle> {
        self.host_peer
    }

    /// Where the local participant stands in the join handshake.
    pub fn local_state(&self) -> ParticipantState {
        self.local_state
    }

    pub fn identity_of(&self, peer: PeerHandle) -> Option<NetworkIdentity> {
        self.peers.get(&peer).and_then(|link| link.identity)
    }

    pub fn phase(&self) -> &GamePhase {
        &self.phase
    }

    pub fn is_in_game(&self) -> bool {
        matches!(self.phase, GamePhase::InGame { .. })
    }

    pub fn sessions(&self) -> DirectorySnapshot {
        self.directory.snapshot()
    }

    pub fn directory(&self) -> &SessionDirectory {
        &self.directory
    }

    pub fn participant_state(&self, identity: NetworkIdentity) -> ParticipantState {
        self.directory.state(identity)
    }

    pub fn entity(&self, identity: NetworkIdentity) -> Option<&ReplicatedEntity> {
        self.reconciler.get(identity)
    }

    pub fn entities(&self) -> &EntityReconciler {
        &self.reconciler
    }

    pub fn catalog(&self) -> &LoadoutCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST_PLATFORM: PlatformId = 1000;

    fn host() -> ReplicationDispatcher {
        let mut host = ReplicationDispatcher::new(
            ReplicationConfig::default(),
            LoadoutCatalog::default(),
            HOST_PLATFORM,
            "Host",
        );
        host.begin_hosting().unwrap();
        host
    }

    fn client(platform_id: PlatformId) -> ReplicationDispatcher {
        let mut client = ReplicationDispatcher::new(
            ReplicationConfig::default(),
            LoadoutCatalog::default(),
            platform_id,
            "Client",
        );
        client.begin_joining().unwrap();
        client
    }

    fn packets(outbox: &[Outbound]) -> Vec<(Destination, Packet)> {
        outbox
            .iter()
            .map(|o| (o.destination, o.packet().unwrap()))
            .collect()
    }

    fn connect(host: &mut ReplicationDispatcher, peer: u32, platform_id: PlatformId) {
        host.handle_transport_event(TransportEvent::PeerConnected {
            peer: PeerHandle(peer),
            platform_id,
        });
    }

    fn deliver(dispatcher: &mut ReplicationDispatcher, peer: u32, packet: Packet) {
        dispatcher.handle_message(PeerHandle(peer), packet.encode().unwrap());
    }

    /// Admits a peer and completes its handshake echo.
    fn admit(host: &mut ReplicationDispatcher, peer: u32, platform_id: PlatformId) -> NetworkIdentity {
        connect(host, peer, platform_id);
        let identity = host.identity_of(PeerHandle(peer)).unwrap();
        deliver(host, peer, Packet::Handshake { identity });
        host.drain_outbox();
        identity
    }

    #[test]
    fn test_admission_sends_handshake_roster_and_broadcast() {
        let mut host = host();
        connect(&mut host, 1, 501);
        connect(&mut host, 2, 502);
        let sent = packets(&host.drain_outbox());

        let to_second: Vec<&Packet> = sent
            .iter()
            .filter(|(d, _)| *d == Destination::Peer(PeerHandle(2)))
            .map(|(_, p)| p)
            .collect();
        assert_eq!(to_second[0], &Packet::Handshake { identity: 2 });
        assert!(matches!(to_second[1], Packet::SessionSync { identity: 0, .. }));
        assert!(matches!(to_second[2], Packet::SessionSync { identity: 1, .. }));
        assert_eq!(to_second.len(), 3);

        let broadcast_identities: Vec<NetworkIdentity> = sent
            .iter()
            .filter(|(d, _)| *d == Destination::AllPeers)
            .filter_map(|(_, p)| match p {
                Packet::SessionSync { identity, .. } => Some(*identity),
                _ => None,
            })
            .collect();
        assert_eq!(broadcast_identities, vec![1, 2]);
        assert_eq!(host.participant_state(2), ParticipantState::Handshaking);
    }

    #[test]
    fn test_handshake_echo_marks_synced() {
        let mut host = host();
        let identity = admit(&mut host, 1, 501);
        assert_eq!(identity, 1);
        assert_eq!(host.participant_state(1), ParticipantState::Synced);
    }

    #[test]
    fn test_packets_before_handshake_are_dropped() {
        let mut host = host();
        connect(&mut host, 1, 501);
        host.drain_outbox();
        deliver(
            &mut host,
            1,
            Packet::ReadyStatus {
                identity: 1,
                is_ready: true,
            },
        );
        assert!(host.drain_outbox().is_empty());
        assert!(!host.directory().get(1).unwrap().is_ready);
        assert_eq!(host.stats().violations, 1);
    }

    #[test]
    fn test_host_relays_class_selection_to_everyone() {
        let mut host = host();
        admit(&mut host, 1, 501);
        deliver(
            &mut host,
            1,
            Packet::ClassSelected {
                identity: 1,
                loadout_index: 2,
            },
        );
        assert_eq!(host.directory().get(1).unwrap().loadout_index, 2);
        let sent = packets(&host.drain_outbox());
        assert_eq!(
            sent,
            vec![(
                Destination::AllPeers,
                Packet::ClassSelected {
                    identity: 1,
                    loadout_index: 2
                }
            )]
        );
    }

    #[test]
    fn test_host_rejects_spoofed_identity() {
        let mut host = host();
        admit(&mut host, 1, 501);
        admit(&mut host, 2, 502);
        deliver(
            &mut host,
            1,
            Packet::ReadyStatus {
                identity: 2,
                is_ready: true,
            },
        );
        assert!(!host.directory().get(2).unwrap().is_ready);
        assert!(host.drain_outbox().is_empty());
    }

    #[test]
    fn test_host_drops_host_only_packets() {
        let mut host = host();
        admit(&mut host, 1, 501);
        deliver(
            &mut host,
            1,
            Packet::GameStart {
                map_path: "res://maps/arena.tscn".into(),
            },
        );
        deliver(&mut host, 1, Packet::PeerLeft { identity: 0 });
        assert!(!host.is_in_game());
        assert!(host.directory().contains(0));
        assert!(host.drain_outbox().is_empty());
        assert_eq!(host.stats().violations, 2);
    }

    #[test]
    fn test_undecodable_message_dropped() {
        let mut host = host();
        admit(&mut host, 1, 501);
        host.handle_message(PeerHandle(1), Bytes::from_static(&[42, 1, 2]));
        assert_eq!(host.stats().decode_errors, 1);
        assert!(host.drain_outbox().is_empty());
    }

    #[test]
    fn test_start_requires_everyone_ready() {
        let mut host = host();
        admit(&mut host, 1, 501);
        host.set_ready(true).unwrap();
        assert_eq!(host.start_game("arena"), Err(ReplicationError::NotAllReady));

        deliver(
            &mut host,
            1,
            Packet::ReadyStatus {
                identity: 1,
                is_ready: true,
            },
        );
        host.drain_outbox();
        host.start_game("arena").unwrap();
        assert!(host.is_in_game());
        assert_eq!(host.entities().len(), 2);
        assert!(host.entity(1).unwrap().is_locally_owned);
        assert!(!host.entity(1).unwrap().is_local_player);
        assert!(host.entity(0).unwrap().is_local_player);
        assert_eq!(
            packets(&host.drain_outbox()),
            vec![(
                Destination::AllPeers,
                Packet::GameStart {
                    map_path: "arena".into()
                }
            )]
        );
    }

    #[test]
    fn test_client_cannot_start_game() {
        let mut client = client(501);
        assert_eq!(
            client.start_game("arena"),
            Err(ReplicationError::NotHost("start the game"))
        );
    }

    #[test]
    fn test_oversized_map_path_refused_before_starting() {
        let mut host = host();
        host.set_ready(true).unwrap();
        host.drain_outbox();

        let result = host.start_game("m".repeat(crate::net::MAX_STRING_LEN + 1));
        assert!(matches!(
            result,
            Err(ReplicationError::Encode(crate::net::EncodeError::StringTooLong { .. }))
        ));
        assert!(!host.is_in_game());
        assert!(host.entities().is_empty());
        assert!(host.drain_outbox().is_empty());

        host.start_game("m".repeat(crate::net::MAX_STRING_LEN)).unwrap();
        assert!(host.is_in_game());
    }

    #[test]
    fn test_client_cannot_apply_damage() {
        let mut client = client(501);
        connect(&mut client, 7, HOST_PLATFORM);
        deliver(&mut client, 7, Packet::Handshake { identity: 1 });
        client.drain_outbox();
        assert_eq!(
            client.apply_damage(1, 0, 10),
            Err(ReplicationError::NotHost("apply damage"))
        );
        assert!(client.drain_outbox().is_empty());
    }

    #[test]
    fn test_disconnect_broadcasts_peer_left() {
        let mut host = host();
        admit(&mut host, 1, 501);
        host.handle_transport_event(TransportEvent::PeerDisconnected {
            peer: PeerHandle(1),
            platform_id: 501,
        });
        assert!(!host.directory().contains(1));
        assert_eq!(host.participant_state(1), ParticipantState::Disconnected);
        assert_eq!(
            packets(&host.drain_outbox()),
            vec![(Destination::AllPeers, Packet::PeerLeft { identity: 1 })]
        );
    }

    #[test]
    fn test_disconnect_without_connect_is_noop() {
        let mut host = host();
        host.handle_transport_event(TransportEvent::PeerDisconnected {
            peer: PeerHandle(9),
            platform_id: 509,
        });
        assert!(host.drain_outbox().is_empty());
        assert_eq!(host.sessions().len(), 1);
    }

    #[test]
    fn test_client_adopts_identity_and_echoes() {
        let mut client = client(501);
        connect(&mut client, 7, HOST_PLATFORM);
        deliver(&mut client, 7, Packet::Handshake { identity: 3 });
        assert_eq!(client.local_identity(), Some(3));
        assert_eq!(
            packets(&client.drain_outbox()),
            vec![(
                Destination::Peer(PeerHandle(7)),
                Packet::Handshake { identity: 3 }
            )]
        );
        assert!(client.directory().contains(3));
    }

    #[test]
    fn test_client_tracks_its_own_handshake() {
        let mut client = client(501);
        assert_eq!(client.local_state(), ParticipantState::Unknown);

        connect(&mut client, 7, HOST_PLATFORM);
        assert_eq!(client.local_state(), ParticipantState::Handshaking);

        deliver(&mut client, 7, Packet::Handshake { identity: 2 });
        assert_eq!(client.local_state(), ParticipantState::Synced);

        client.handle_transport_event(TransportEvent::PeerDisconnected {
            peer: PeerHandle(7),
            platform_id: HOST_PLATFORM,
        });
        assert_eq!(client.local_state(), ParticipantState::Unknown);
    }

    #[test]
    fn test_client_ignores_move_commands() {
        let mut client = client(501);
        connect(&mut client, 7, HOST_PLATFORM);
        deliver(&mut client, 7, Packet::Handshake { identity: 1 });
        client.drain_outbox();
        deliver(
            &mut client,
            7,
            Packet::MoveCommand {
                identity: 1,
                target: Vec3::ONE,
            },
        );
        assert!(client.drain_outbox().is_empty());
        assert_eq!(client.stats().violations, 1);
    }

    #[test]
    fn test_client_selection_is_optimistic() {
        let mut client = client(501);
        connect(&mut client, 7, HOST_PLATFORM);
        deliver(&mut client, 7, Packet::Handshake { identity: 1 });
        client.drain_outbox();
        client.drain_events();

        client.select_loadout(1).unwrap();
        assert_eq!(client.directory().get(1).unwrap().loadout_index, 1);
        assert_eq!(
            packets(&client.drain_outbox()),
            vec![(
                Destination::Peer(PeerHandle(7)),
                Packet::ClassSelected {
                    identity: 1,
                    loadout_index: 1
                }
            )]
        );

        // The relay echo leaves the local copy alone.
        deliver(
            &mut client,
            7,
            Packet::ClassSelected {
                identity: 1,
                loadout_index: 1,
            },
        );
        let events = client.drain_events();
        assert_eq!(
            events,
            vec![ReplicationEvent::LoadoutChanged {
                identity: 1,
                loadout_index: 1
            }]
        );
        assert_eq!(client.select_loadout(9), Err(ReplicationError::UnknownLoadout(9)));
    }

    #[test]
    fn test_client_rejects_retired_identity() {
        let mut client = client(501);
        connect(&mut client, 7, HOST_PLATFORM);
        deliver(&mut client, 7, Packet::Handshake { identity: 1 });
        deliver(
            &mut client,
            7,
            Packet::SessionSync {
                identity: 2,
                platform_id: 502,
                loadout_index: 0,
                is_ready: false,
            },
        );
        deliver(&mut client, 7, Packet::PeerLeft { identity: 2 });
        assert!(!client.directory().contains(2));

        deliver(
            &mut client,
            7,
            Packet::SessionSync {
                identity: 2,
                platform_id: 502,
                loadout_index: 0,
                is_ready: true,
            },
        );
        assert!(!client.directory().contains(2));
    }

    #[test]
    fn test_client_ignores_packets_from_non_host() {
        let mut client = client(501);
        connect(&mut client, 7, HOST_PLATFORM);
        deliver(&mut client, 8, Packet::Handshake { identity: 1 });
        assert_eq!(client.local_identity(), None);
    }

    #[test]
    fn test_host_loss_clears_session() {
        let mut client = client(501);
        connect(&mut client, 7, HOST_PLATFORM);
        deliver(&mut client, 7, Packet::Handshake { identity: 1 });
        client.handle_transport_event(TransportEvent::PeerDisconnected {
            peer: PeerHandle(7),
            platform_id: HOST_PLATFORM,
        });
        assert_eq!(client.role(), Role::Idle);
        assert!(client.sessions().is_empty());
        assert!(client.drain_events().contains(&ReplicationEvent::HostLost));
    }

    #[test]
    fn test_identity_exhaustion_rejects_peer() {
        let mut host = host();
        for peer in 1..=255u32 {
            connect(&mut host, peer, 1000 + peer as u64);
        }
        host.drain_events();
        connect(&mut host, 300, 9999);
        assert_eq!(host.drain_disconnects(), vec![PeerHandle(300)]);
        assert_eq!(
            host.drain_events(),
            vec![ReplicationEvent::PeerRejected {
                peer: PeerHandle(300)
            }]
        );
    }

    #[test]
    fn test_damage_to_zero_announces_death() {
        let mut host = host();
        admit(&mut host, 1, 501);
        host.set_ready(true).unwrap();
        deliver(
            &mut host,
            1,
            Packet::ReadyStatus {
                identity: 1,
                is_ready: true,
            },
        );
        host.start_game("arena").unwrap();
        host.drain_outbox();

        let max = host.entity(1).unwrap().vitals.max_health;
        assert_eq!(host.apply_damage(0, 1, 30).unwrap(), max - 30);
        assert_eq!(host.apply_damage(0, 1, i16::MAX).unwrap(), 0);
        assert_eq!(host.apply_damage(0, 1, 5), Err(ReplicationError::Dead(1)));

        let sent: Vec<Packet> = packets(&host.drain_outbox())
            .into_iter()
            .map(|(_, p)| p)
            .collect();
        assert_eq!(
            sent,
            vec![
                Packet::DamageEvent {
                    target: 1,
                    damage: 30,
                    new_health: max - 30
                },
                Packet::DamageEvent {
                    target: 1,
                    damage: i16::MAX,
                    new_health: 0
                },
                Packet::DeathEvent {
                    victim: 1,
                    killer: 0
                },
            ]
        );
    }
}
