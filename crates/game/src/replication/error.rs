use thiserror::Error;

use crate::entity::CastError;
use crate::net::{EncodeError, NetworkIdentity, PacketKind, PeerHandle, TransportError};

/// Why an inbound packet was dropped. Violations are logged and never
/// tear down the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("{0:?} may only be sent by the host")]
    HostOnlyPacket(PacketKind),
    #[error("{0:?} received outside of a session")]
    NotInSession(PacketKind),
    #[error("message from unregistered peer {0:?}")]
    UnknownPeer(PeerHandle),
    #[error("message from {0:?}, which is not the host")]
    NotFromHost(PeerHandle),
    #[error("{kind:?} from {peer:?} before its handshake completed")]
    NotSynced { peer: PeerHandle, kind: PacketKind },
    #[error("{peer:?} spoke for identity {claimed} but owns {owned:?}")]
    IdentityMismatch {
        peer: PeerHandle,
        claimed: NetworkIdentity,
        owned: Option<NetworkIdentity>,
    },
    #[error("no session for identity {0}")]
    UnknownIdentity(NetworkIdentity),
    #[error("identity {0} has already left")]
    RetiredIdentity(NetworkIdentity),
    #[error("no entity for identity {0}")]
    NoEntity(NetworkIdentity),
    #[error("loadout {0} does not exist")]
    InvalidLoadout(i32),
    #[error("{kind:?} for identity {identity} conflicts with local movement authority")]
    NotAuthoritative {
        kind: PacketKind,
        identity: NetworkIdentity,
    },
}

/// Errors returned to the caller of a local action.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplicationError {
    #[error("only the host can {0}")]
    NotHost(&'static str),
    #[error("already part of a session")]
    AlreadyInSession,
    #[error("no network identity assigned yet")]
    NotSynced,
    #[error("not connected to a host")]
    NotConnected,
    #[error("loadout {0} does not exist")]
    UnknownLoadout(i32),
    #[error("not every participant is ready")]
    NotAllReady,
    #[error("the game has not started")]
    GameNotStarted,
    #[error("the game is already running")]
    GameInProgress,
    #[error("no entity for identity {0}")]
    UnknownEntity(NetworkIdentity),
    #[error("entity {0} is dead")]
    Dead(NetworkIdentity),
    #[error(transparent)]
    Cast(#[from] CastError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}
