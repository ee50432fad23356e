mod dispatcher;
mod driver;
mod error;
mod events;

pub use dispatcher::{DispatchStats, GamePhase, ReplicationDispatcher, Role};
pub use driver::ReplicationLoop;
pub use error::{ProtocolViolation, ReplicationError};
pub use events::{Destination, Outbound, ReplicationEvent};
