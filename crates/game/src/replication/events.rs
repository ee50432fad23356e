use bytes::Bytes;

use crate::net::{
    DecodeError, EncodeError, NetworkIdentity, Packet, PeerHandle, PlatformId, Reliability,
};

/// State changes for the presentation layer, in the order they were
/// applied.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationEvent {
    LocalIdentityAssigned {
        identity: NetworkIdentity,
    },
    SessionJoined {
        identity: NetworkIdentity,
    },
    SessionLeft {
        identity: NetworkIdentity,
    },
    LoadoutChanged {
        identity: NetworkIdentity,
        loadout_index: i32,
    },
    ReadyChanged {
        identity: NetworkIdentity,
        is_ready: bool,
    },
    SceneTransition {
        map_path: String,
    },
    AbilityCast {
        caster: NetworkIdentity,
        ability_name: String,
    },
    DamageTaken {
        target: NetworkIdentity,
        damage: i16,
        new_health: i16,
    },
    Died {
        victim: NetworkIdentity,
        killer: NetworkIdentity,
    },
    PeerRejected {
        peer: PeerHandle,
    },
    ConnectionFailed {
        platform_id: PlatformId,
    },
    HostLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Peer(PeerHandle),
    AllPeers,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub destination: Destination,
    pub payload: Bytes,
    pub reliability: Reliability,
}

impl Outbound {
    pub fn new(destination: Destination, packet: &Packet) -> Result<Self, EncodeError> {
        Ok(Self {
            destination,
            payload: packet.encode()?,
            reliability: packet.reliability(),
        })
    }

    pub fn packet(&self) -> Result<Packet, DecodeError> {
        Packet::decode(&self.payload)
    }
}
