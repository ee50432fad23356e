mod reconciler;
mod state;

pub use reconciler::{EntityReconciler, ReplicatedEntity, SnapshotOutcome, SnapshotThrottle};
pub use state::{
    AbilityState, CastError, Locomotion, PlayerStats, Vitals, angle_delta, normalize_angle,
    spawn_point, yaw_to_rotation,
};
