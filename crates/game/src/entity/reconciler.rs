use std::collections::BTreeMap;

use glam::Vec3;

use super::state::{
    AbilityState, Locomotion, PlayerStats, Vitals, angle_delta, normalize_angle, yaw_to_rotation,
};
use crate::config::ReplicationConfig;
use crate::loadout::Loadout;
use crate::net::{NetworkIdentity, Packet};

const SNAP_EPSILON: f32 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapshotThrottle {
    interval: f32,
    min_distance: f32,
    min_angle: f32,
    elapsed: f32,
}

impl SnapshotThrottle {
    pub fn new(interval: f32, min_distance: f32, min_angle: f32) -> Self {
        Self {
            interval,
            min_distance,
            min_angle,
            elapsed: 0.0,
        }
    }

    /// Returns true when a snapshot of `position`/`yaw` should be sent this
    /// tick. The window restarts whenever it elapses, whether or not the
    /// entity moved far enough to be worth sending.
    pub fn poll(
        &mut self,
        dt: f32,
        position: Vec3,
        yaw: f32,
        last_position: Vec3,
        last_yaw: f32,
    ) -> bool {
        self.elapsed += dt;
        if self.elapsed < self.interval {
            return false;
        }
        self.elapsed = 0.0;
        position.distance(last_position) >= self.min_distance
            || angle_delta(last_yaw, yaw).abs() >= self.min_angle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Applied,
    /// The entity is simulated here; remote snapshots never override it.
    LocallySimulated,
    UnknownEntity,
}

#[derive(Debug, Clone)]
pub struct ReplicatedEntity {
    pub identity: NetworkIdentity,
    /// Movement is stepped on this participant.
    pub is_locally_owned: bool,
    /// Input for this entity comes from this participant.
    pub is_local_player: bool,
    pub position: Vec3,
    pub yaw: f32,
    pub target_position: Vec3,
    pub target_yaw: f32,
    pub last_sent_position: Vec3,
    pub last_sent_yaw: f32,
    pub stats: PlayerStats,
    pub vitals: Vitals,
    pub abilities: AbilityState,
    pub locomotion: Locomotion,
    throttle: SnapshotThrottle,
}

impl ReplicatedEntity {
    pub fn rotation(&self) -> Vec3 {
        yaw_to_rotation(self.yaw)
    }

    /// Swaps in a new loadout. Health refills to the new maximum.
    pub fn apply_loadout(&mut self, loadout: &Loadout) {
        self.stats = PlayerStats::from_loadout(loadout);
        self.abilities = AbilityState::from_loadout(loadout);
        self.locomotion.speed = self.stats.move_speed;
        if self.vitals.alive {
            self.vitals = Vitals::full(self.stats.max_health);
        }
    }

    fn smooth(&mut self, alpha: f32) {
        let offset = self.target_position - self.position;
        if offset.length() <= SNAP_EPSILON {
            self.position = self.target_position;
        } else {
            self.position += offset * alpha;
        }

        let turn = angle_delta(self.yaw, self.target_yaw);
        if turn.abs() <= SNAP_EPSILON {
            self.yaw = self.target_yaw;
        } else {
            self.yaw = normalize_angle(self.yaw + turn * alpha);
        }
    }

    fn simulate(&mut self, dt: f32) {
        if !self.vitals.alive {
            self.locomotion.target = None;
            return;
        }
        if let Some((position, yaw)) = self.locomotion.step(self.position, dt) {
            self.position = position;
            self.yaw = yaw;
        }
        self.target_position = self.position;
        self.target_yaw = self.yaw;
    }
}

/// Per-entity presentation state. Locally simulated entities are stepped
/// and throttled out as snapshots; everything else eases toward the last
/// snapshot received.
#[derive(Debug)]
pub struct EntityReconciler {
    entities: BTreeMap<NetworkIdentity, ReplicatedEntity>,
    smoothing_rate: f32,
    arrival_distance: f32,
    throttle: SnapshotThrottle,
}

impl EntityReconciler {
    pub fn new(config: &ReplicationConfig) -> Self {
        Self {
            entities: BTreeMap::new(),
            smoothing_rate: config.smoothing_rate,
            arrival_distance: config.arrival_distance,
            throttle: SnapshotThrottle::new(
                config.snapshot_interval_secs,
                config.snapshot_min_distance,
                config.snapshot_min_angle,
            ),
        }
    }

    pub fn spawn(
        &mut self,
        identity: NetworkIdentity,
        position: Vec3,
        loadout: &Loadout,
        is_locally_owned: bool,
        is_local_player: bool,
    ) -> &mut ReplicatedEntity {
        let stats = PlayerStats::from_loadout(loadout);
        let throttle = self.throttle;
        let arrival_distance = self.arrival_distance;
        self.entities
            .entry(identity)
            .or_insert_with(|| ReplicatedEntity {
                identity,
                is_locally_owned,
                is_local_player,
                position,
                yaw: 0.0,
                target_position: position,
                target_yaw: 0.0,
                last_sent_position: position,
                last_sent_yaw: 0.0,
                vitals: Vitals::full(stats.max_health),
                abilities: AbilityState::from_loadout(loadout),
                locomotion: Locomotion::new(stats.move_speed, arrival_distance),
                stats,
                throttle,
            })
    }

    pub fn despawn(&mut self, identity: NetworkIdentity) -> Option<ReplicatedEntity> {
        self.entities.remove(&identity)
    }

    pub fn clear(&mut self) {
        self.entities.clear();
    }

    pub fn apply_snapshot(
        &mut self,
        identity: NetworkIdentity,
        position: Vec3,
        rotation: Vec3,
    ) -> SnapshotOutcome {
        let Some(entity) = self.entities.get_mut(&identity) else {
            return SnapshotOutcome::UnknownEntity;
        };
        if entity.is_locally_owned {
            return SnapshotOutcome::LocallySimulated;
        }
        entity.target_position = position;
        entity.target_yaw = normalize_angle(rotation.y);
        SnapshotOutcome::Applied
    }

    /// Steps one locally simulated entity outside the regular tick. Returns
    /// false if the entity is unknown or simulated elsewhere.
    pub fn apply_local_simulation_step(&mut self, identity: NetworkIdentity, dt: f32) -> bool {
        match self.entities.get_mut(&identity) {
            Some(entity) if entity.is_locally_owned => {
                entity.simulate(dt);
                true
            }
            _ => false,
        }
    }

    pub fn tick(&mut self, dt: f32) {
        let alpha = 1.0 - (-self.smoothing_rate * dt).exp();
        for entity in self.entities.values_mut() {
            if entity.is_locally_owned {
                entity.simulate(dt);
            } else {
                entity.smooth(alpha);
            }
            entity.abilities.tick(dt);
        }
    }

    /// Position updates for locally simulated entities whose throttle
    /// window elapsed with enough movement to report.
    pub fn collect_snapshots(&mut self, dt: f32) -> Vec<Packet> {
        let mut snapshots = Vec::new();
        for entity in self.entities.values_mut() {
            if !entity.is_locally_owned {
                continue;
            }
            let due = entity.throttle.poll(
                dt,
                entity.position,
                entity.yaw,
                entity.last_sent_position,
                entity.last_sent_yaw,
            );
            if due {
                entity.last_sent_position = entity.position;
                entity.last_sent_yaw = entity.yaw;
                snapshots.push(Packet::PositionUpdate {
                    identity: entity.identity,
                    position: entity.position,
                    rotation: entity.rotation(),
                });
            }
        }
        snapshots
    }

    pub fn get(&self, identity: NetworkIdentity) -> Option<&ReplicatedEntity> {
        self.entities.get(&identity)
    }

    pub fn get_mut(&mut self, identity: NetworkIdentity) -> Option<&mut ReplicatedEntity> {
        self.entities.get_mut(&identity)
    }

    pub fn contains(&self, identity: NetworkIdentity) -> bool {
        self.entities.contains_key(&identity)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReplicatedEntity> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
