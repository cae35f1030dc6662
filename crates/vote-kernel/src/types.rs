//! Identifier and ability types shared across the kernel.

use std::collections::HashMap;
use std::fmt;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a faction taking part in a battle.
pub type FactionId = Uuid;

/// Unique identifier for a viewer.
pub type UserId = Uuid;

/// Unique identifier for an ability (faction ability or battle ability).
pub type AbilityId = Uuid;

/// Opaque reference to a currency hold placed with the payment ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HoldRef(pub String);

impl HoldRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HoldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An ability a faction can push forward with currency contributions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactionAbility {
    pub id: AbilityId,
    pub faction_id: FactionId,
    pub label: String,
    /// Starting target price in the currency's smallest unit
    #[serde(with = "crate::currency::serde_units")]
    pub initial_price: BigUint,
}

/// The ability put to a vote across all factions for one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleAbility {
    pub id: AbilityId,
    pub label: String,
    /// Cooldown applied after this ability resolves
    pub cooldown_ms: u64,
}

/// A battle ability together with each faction's variant of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbilityCollection {
    pub battle_ability: BattleAbility,
    pub faction_abilities: HashMap<FactionId, FactionAbility>,
}

/// Map cell chosen by a winner when placing an ability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellLocation {
    pub x: i32,
    pub y: i32,
}

impl fmt::Display for CellLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(x: {}, y: {})", self.x, self.y)
    }
}
