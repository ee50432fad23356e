pub mod config;
pub mod entity;
pub mod loadout;
pub mod net;
pub mod replication;
pub mod session;

pub use config::{MovementAuthority, ReplicationConfig};
pub use entity::{EntityReconciler, ReplicatedEntity};
pub use loadout::{AbilityDef, Loadout, LoadoutCatalog, LoadoutError};
pub use net::{
    DecodeError, EncodeError, HOST_IDENTITY, LoopbackHub, LoopbackProvider, MAX_STRING_LEN,
    NetworkIdentity, NetworkProvider, NetworkStats, Packet, PacketKind, PacketLossSimulation,
    PeerHandle, PlatformId, Reliability, TransportAdapter, TransportError, TransportEvent,
};
pub use replication::{
    GamePhase, ProtocolViolation, ReplicationDispatcher, ReplicationError, ReplicationEvent,
    ReplicationLoop, Role,
};
pub use session::{DirectorySnapshot, ParticipantState, PlayerSession, SessionDirectory};
