use serde::{Deserialize, Serialize};

use crate::net::DEFAULT_MAX_MESSAGES_PER_POLL;

/// Which side steps an entity's movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementAuthority {
    /// Peers send move commands; the host simulates every entity and
    /// streams position snapshots.
    #[default]
    HostSimulated,
    /// Each participant simulates its own entity and streams snapshots
    /// through the host.
    OwnerSimulated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub max_messages_per_peer_per_tick: usize,
    pub snapshot_interval_secs: f32,
    pub snapshot_min_distance: f32,
    pub snapshot_min_angle: f32,
    pub smoothing_rate: f32,
    pub arrival_distance: f32,
    pub spawn_radius: f32,
    pub spawn_height: f32,
    pub movement_authority: MovementAuthority,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_messages_per_peer_per_tick: DEFAULT_MAX_MESSAGES_PER_POLL,
            snapshot_interval_secs: 0.05,
            snapshot_min_distance: 0.1,
            snapshot_min_angle: 0.01,
            smoothing_rate: 10.0,
            arrival_distance: 0.2,
            spawn_radius: 10.0,
            spawn_height: 1.0,
            movement_authority: MovementAuthority::HostSimulated,
        }
    }
}

impl ReplicationConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
