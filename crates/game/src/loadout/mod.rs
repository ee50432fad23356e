use serde::{Deserialize, Serialize};

use crate::net::codec::{self, EncodeError};
use crate::net::PacketKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbilityDef {
    pub name: String,
    pub cooldown_secs: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loadout {
    pub name: String,
    pub strength: i16,
    pub intelligence: i16,
    pub agility: i16,
    #[serde(default)]
    pub abilities: Vec<AbilityDef>,
}

impl Loadout {
    pub fn max_health(&self) -> i16 {
        100i16.saturating_add(self.strength.saturating_mul(10))
    }

    pub fn move_speed(&self) -> f32 {
        5.0 + self.agility as f32 * 0.1
    }
}

/// The selectable loadouts, ordered by name. A loadout index on the wire is
/// a position in this ordering, so every participant must load the same
/// catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadoutCatalog {
    loadouts: Vec<Loadout>,
}

impl Default for LoadoutCatalog {
    fn default() -> Self {
        Self::sorted(vec![
            Loadout {
                name: String::from("Ranger"),
                strength: 3,
                intelligence: 4,
                agility: 9,
                abilities: vec![
                    ability("Arrow Volley", 3.0),
                    ability("Dash", 6.0),
                ],
            },
            Loadout {
                name: String::from("Brawler"),
                strength: 8,
                intelligence: 2,
                agility: 5,
                abilities: vec![ability("Slam", 4.0), ability("Charge", 8.0)],
            },
            Loadout {
                name: String::from("Mystic"),
                strength: 2,
                intelligence: 9,
                agility: 5,
                abilities: vec![ability("Firebolt", 1.5), ability("Blink", 10.0)],
            },
        ])
    }
}

fn ability(name: &str, cooldown_secs: f32) -> AbilityDef {
    AbilityDef {
        name: name.to_string(),
        cooldown_secs,
    }
}

impl LoadoutCatalog {
    /// Rejects an empty list and ability names too long to cast over the
    /// wire.
    pub fn new(loadouts: Vec<Loadout>) -> Result<Self, LoadoutError> {
        if loadouts.is_empty() {
            return Err(LoadoutError::Empty);
        }
        for ability in loadouts.iter().flat_map(|l| &l.abilities) {
            codec::check_string(PacketKind::AbilityCast, &ability.name)?;
        }
        Ok(Self::sorted(loadouts))
    }

    fn sorted(mut loadouts: Vec<Loadout>) -> Self {
        loadouts.sort_by(|a, b| a.name.cmp(&b.name));
        Self { loadouts }
    }

    pub fn from_json(json: &str) -> Result<Self, LoadoutError> {
        let loadouts: Vec<Loadout> = serde_json::from_str(json)?;
        Self::new(loadouts)
    }

    pub fn get(&self, index: i32) -> Option<&Loadout> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.loadouts.get(i))
    }

    pub fn contains(&self, index: i32) -> bool {
        self.get(index).is_some()
    }

    /// Like [`get`](Self::get) but falls back to the first loadout.
    pub fn resolve(&self, index: i32) -> Option<&Loadout> {
        self.get(index).or_else(|| self.loadouts.first())
    }

    pub fn index_of(&self, name: &str) -> Option<i32> {
        self.loadouts
            .iter()
            .position(|l| l.name == name)
            .and_then(|i| i32::try_from(i).ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Loadout> {
        self.loadouts.iter()
    }

    pub fn len(&self) -> usize {
        self.loadouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loadouts.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadoutError {
    #[error("invalid loadout catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("loadout catalog is empty")]
    Empty,
    #[error(transparent)]
    AbilityName(#[from] EncodeError),
}
