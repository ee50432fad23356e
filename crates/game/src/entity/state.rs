use std::f32::consts::{PI, TAU};

use glam::Vec3;
use thiserror::Error;

use crate::loadout::{AbilityDef, Loadout};
use crate::net::NetworkIdentity;

pub fn normalize_angle(angle: f32) -> f32 {
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped <= -PI { wrapped + TAU } else { wrapped }
}

/// Shortest signed rotation from `from` to `to`.
pub fn angle_delta(from: f32, to: f32) -> f32 {
    normalize_angle(to - from)
}

pub fn yaw_to_rotation(yaw: f32) -> Vec3 {
    Vec3::new(0.0, yaw, 0.0)
}

/// Spawn point on a ring around the origin, a quarter turn per identity.
pub fn spawn_point(identity: NetworkIdentity, radius: f32, height: f32) -> Vec3 {
    let angle = identity as f32 * TAU / 4.0;
    Vec3::new(angle.cos() * radius, height, angle.sin() * radius)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerStats {
    pub loadout_name: String,
    pub strength: i16,
    pub intelligence: i16,
    pub agility: i16,
    pub max_health: i16,
    pub move_speed: f32,
}

impl PlayerStats {
    pub fn from_loadout(loadout: &Loadout) -> Self {
        Self {
            loadout_name: loadout.name.clone(),
            strength: loadout.strength,
            intelligence: loadout.intelligence,
            agility: loadout.agility,
            max_health: loadout.max_health(),
            move_speed: loadout.move_speed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vitals {
    pub health: i16,
    pub max_health: i16,
    pub alive: bool,
}

impl Vitals {
    pub fn full(max_health: i16) -> Self {
        Self {
            health: max_health,
            max_health,
            alive: true,
        }
    }

    /// Returns true when health is depleted.
    pub fn set_health(&mut self, health: i16) -> bool {
        self.health = health.clamp(0, self.max_health.max(0));
        self.health == 0
    }

    /// Returns true only for the first call on a living entity.
    pub fn kill(&mut self) -> bool {
        self.health = 0;
        std::mem::replace(&mut self.alive, false)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CastError {
    #[error("no ability in slot {0}")]
    UnknownSlot(usize),
    #[error("{name} is cooling down for {remaining:.2}s")]
    OnCooldown { name: String, remaining: f32 },
}

#[derive(Debug, Clone, PartialEq)]
struct AbilitySlot {
    def: AbilityDef,
    remaining: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AbilityState {
    slots: Vec<AbilitySlot>,
}

impl AbilityState {
    pub fn from_loadout(loadout: &Loadout) -> Self {
        Self {
            slots: loadout
                .abilities
                .iter()
                .map(|def| AbilitySlot {
                    def: def.clone(),
                    remaining: 0.0,
                })
                .collect(),
        }
    }

    pub fn try_cast(&mut self, slot: usize) -> Result<&AbilityDef, CastError> {
        let entry = self.slots.get_mut(slot).ok_or(CastError::UnknownSlot(slot))?;
        if entry.remaining > 0.0 {
            return Err(CastError::OnCooldown {
                name: entry.def.name.clone(),
                remaining: entry.remaining,
            });
        }
        entry.remaining = entry.def.cooldown_secs;
        Ok(&entry.def)
    }

    pub fn tick(&mut self, dt: f32) {
        for slot in &mut self.slots {
            slot.remaining = (slot.remaining - dt).max(0.0);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Point-to-point ground movement toward a commanded target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Locomotion {
    pub target: Option<Vec3>,
    pub speed: f32,
    pub arrival_distance: f32,
}

impl Locomotion {
    pub fn new(speed: f32, arrival_distance: f32) -> Self {
        Self {
            target: None,
            speed,
            arrival_distance,
        }
    }

    pub fn set_target(&mut self, target: Vec3) {
        self.target = Some(target);
    }

    pub fn is_moving(&self) -> bool {
        self.target.is_some()
    }

    /// Advances `position` toward the target. Returns the new position and
    /// facing, or `None` once stopped.
    pub fn step(&mut self, position: Vec3, dt: f32) -> Option<(Vec3, f32)> {
        let target = self.target?;
        let offset = Vec3::new(target.x - position.x, 0.0, target.z - position.z);
        let distance = offset.length();
        if distance <= self.arrival_distance {
            self.target = None;
            return None;
        }

        let direction = offset / distance;
        let travel = (self.speed * dt).min(distance);
        let yaw = direction.x.atan2(direction.z);
        Some((position + direction * travel, yaw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_angle_range() {
        assert!((normalize_angle(TAU + 0.5) - 0.5).abs() < 1e-5);
        assert!((normalize_angle(-TAU - 0.5) + 0.5).abs() < 1e-5);
        assert!((normalize_angle(0.25) - 0.25).abs() < 1e-6);
        assert!((angle_delta(3.0, -3.0) - (TAU - 6.0)).abs() < 1e-5);
    }

    #[test]
    fn test_spawn_ring_quarter_turns() {
        let p0 = spawn_point(0, 10.0, 1.0);
        let p1 = spawn_point(1, 10.0, 1.0);
        let p2 = spawn_point(2, 10.0, 1.0);
        assert!((p0 - Vec3::new(10.0, 1.0, 0.0)).length() < 1e-4);
        assert!((p1 - Vec3::new(0.0, 1.0, 10.0)).length() < 1e-4);
        assert!((p2 - Vec3::new(-10.0, 1.0, 0.0)).length() < 1e-4);
    }

    #[test]
    fn test_cooldown_blocks_recast() {
        let loadout = crate::loadout::LoadoutCatalog::default();
        let mut abilities = AbilityState::from_loadout(loadout.get(1).unwrap());
        assert_eq!(abilities.try_cast(0).unwrap().name, "Firebolt");
        assert!(matches!(
            abilities.try_cast(0),
            Err(CastError::OnCooldown { .. })
        ));
        abilities.tick(1.0);
        assert!(abilities.try_cast(0).is_err());
        abilities.tick(0.5);
        assert!(abilities.try_cast(0).is_ok());
        assert_eq!(abilities.try_cast(7), Err(CastError::UnknownSlot(7)));
    }

    #[test]
    fn test_locomotion_reaches_target_and_stops() {
        let mut locomotion = Locomotion::new(5.0, 0.2);
        locomotion.set_target(Vec3::new(0.0, 0.0, 3.0));
        let mut position = Vec3::ZERO;
        let mut steps = 0;
        while let Some((next, yaw)) = locomotion.step(position, 0.1) {
            assert!(yaw.abs() < 1e-6);
            position = next;
            steps += 1;
            assert!(steps < 100);
        }
        assert!((position - Vec3::new(0.0, 0.0, 3.0)).length() <= 0.2);
        assert!(!locomotion.is_moving());
    }

    #[test]
    fn test_vitals_death_transition_once() {
        let mut vitals = Vitals::full(100);
        assert!(!vitals.set_health(40));
        assert!(vitals.set_health(-5));
        assert_eq!(vitals.health, 0);
        assert!(vitals.alive);
        assert!(vitals.kill());
        assert!(!vitals.kill());
        assert!(!vitals.alive);
        assert!(!vitals.set_health(500) && vitals.health == 100);
    }
}
