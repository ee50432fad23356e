use bytes::Bytes;
use glam::Vec3;

use super::codec::{self, DecodeError, EncodeError};

pub type NetworkIdentity = u8;
pub type PlatformId = u64;

pub const HOST_IDENTITY: NetworkIdentity = 0;
pub const MAX_STRING_LEN: usize = 1024;
pub const DEFAULT_MAX_MESSAGES_PER_POLL: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reliability {
    Reliable,
    Unreliable,
}

impl Reliability {
    pub fn is_reliable(&self) -> bool {
        matches!(self, Self::Reliable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Handshake = 0,
    SessionSync = 1,
    GameStart = 2,
    PositionUpdate = 3,
    ClassSelected = 4,
    AbilityCast = 5,
    MoveCommand = 6,
    ReadyStatus = 7,
    DamageEvent = 8,
    DeathEvent = 9,
    PeerLeft = 10,
}

impl PacketKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        let kind = match value {
            0 => Self::Handshake,
            1 => Self::SessionSync,
            2 => Self::GameStart,
            3 => Self::PositionUpdate,
            4 => Self::ClassSelected,
            5 => Self::AbilityCast,
            6 => Self::MoveCommand,
            7 => Self::ReadyStatus,
            8 => Self::DamageEvent,
            9 => Self::DeathEvent,
            10 => Self::PeerLeft,
            _ => return None,
        };
        Some(kind)
    }

    pub fn reliability(&self) -> Reliability {
        match self {
            Self::PositionUpdate => Reliability::Unreliable,
            _ => Reliability::Reliable,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Handshake {
        identity: NetworkIdentity,
    },
    SessionSync {
        identity: NetworkIdentity,
        platform_id: PlatformId,
        loadout_index: i32,
        is_ready: bool,
    },
    GameStart {
        map_path: String,
    },
    PositionUpdate {
        identity: NetworkIdentity,
        position: Vec3,
        rotation: Vec3,
    },
    ClassSelected {
        identity: NetworkIdentity,
        loadout_index: i32,
    },
    AbilityCast {
        identity: NetworkIdentity,
        ability_name: String,
    },
    MoveCommand {
        identity: NetworkIdentity,
        target: Vec3,
    },
    ReadyStatus {
        identity: NetworkIdentity,
        is_ready: bool,
    },
    DamageEvent {
        target: NetworkIdentity,
        damage: i16,
        new_health: i16,
    },
    DeathEvent {
        victim: NetworkIdentity,
        killer: NetworkIdentity,
    },
    PeerLeft {
        identity: NetworkIdentity,
    },
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Self::Handshake { .. } => PacketKind::Handshake,
            Self::SessionSync { .. } => PacketKind::SessionSync,
            Self::GameStart { .. } => PacketKind::GameStart,
            Self::PositionUpdate { .. } => PacketKind::PositionUpdate,
            Self::ClassSelected { .. } => PacketKind::ClassSelected,
            Self::AbilityCast { .. } => PacketKind::AbilityCast,
            Self::MoveCommand { .. } => PacketKind::MoveCommand,
            Self::ReadyStatus { .. } => PacketKind::ReadyStatus,
            Self::DamageEvent { .. } => PacketKind::DamageEvent,
            Self::DeathEvent { .. } => PacketKind::DeathEvent,
            Self::PeerLeft { .. } => PacketKind::PeerLeft,
        }
    }

    pub fn reliability(&self) -> Reliability {
        self.kind().reliability()
    }

    /// The participant whose own state this packet speaks for, when the
    /// packet is one a peer may only send about itself.
    pub fn claimed_identity(&self) -> Option<NetworkIdentity> {
        match self {
            Self::PositionUpdate { identity, .. }
            | Self::ClassSelected { identity, .. }
            | Self::AbilityCast { identity, .. }
            | Self::MoveCommand { identity, .. }
            | Self::ReadyStatus { identity, .. } => Some(*identity),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        codec::encode(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        codec::decode(data)
    }
}
