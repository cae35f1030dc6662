//! Events emitted by the kernel and the payloads published to subscribers.
//!
//! Round events ([`KernelEvent`]) are both persisted through the round store
//! and published on [`topics::ROUND_EVENTS`]. Price and ratio updates are
//! published only.

use std::fmt;

use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::types::{AbilityId, CellLocation, FactionId, UserId};

/// Publisher topics.
pub mod topics {
    pub const ROUND_EVENTS: &str = "vote.round";
    pub const VOTE_PRICE: &str = "vote.price";
    pub const VOTE_PRICE_FORECAST: &str = "vote.price.forecast";
    pub const TARGET_PRICES: &str = "ability.target_prices";
    pub const ABILITY_RIGHT_RATIO: &str = "vote.ability_right_ratio";
}

/// Phases of the vote cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VotePhase {
    /// Idle until a battle starts
    Hold,
    WaitIntro,
    VoteCooldown,
    VoteAbilityRight,
    NextVoteWin,
    LocationSelect,
}

impl VotePhase {
    /// Whether votes are accepted in this phase.
    pub fn accepts_votes(self) -> bool {
        matches!(self, VotePhase::VoteAbilityRight | VotePhase::NextVoteWin)
    }
}

impl fmt::Display for VotePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VotePhase::Hold => "HOLD",
            VotePhase::WaitIntro => "WAIT_INTRO",
            VotePhase::VoteCooldown => "VOTE_COOLDOWN",
            VotePhase::VoteAbilityRight => "VOTE_ABILITY_RIGHT",
            VotePhase::NextVoteWin => "NEXT_VOTE_WIN",
            VotePhase::LocationSelect => "LOCATION_SELECT",
        };
        f.write_str(name)
    }
}

/// Where a triggered ability came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// A faction ability whose contributions reached its target price
    Contribution,
    /// A faction ability whose target price decayed below its contributions
    Decay,
    /// The round's battle ability, placed by a vote winner
    Vote,
}

/// An ability that fired, with the user it is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilityTrigger {
    pub source: TriggerSource,
    pub faction_id: FactionId,
    pub ability_id: AbilityId,
    pub user_id: Option<UserId>,
    pub location: Option<CellLocation>,
    /// Price paid for this trigger (smallest units)
    #[serde(with = "crate::currency::serde_units")]
    pub price: BigUint,
    pub at: DateTime<Utc>,
}

/// Round events, persisted and published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KernelEvent {
    PhaseChanged {
        battle_id: Uuid,
        phase: VotePhase,
        phase_end: Option<DateTime<Utc>>,
    },
    AbilityTriggered {
        battle_id: Option<Uuid>,
        trigger: AbilityTrigger,
    },
    WinnerAnnounced {
        battle_id: Uuid,
        faction_id: FactionId,
        ability_id: AbilityId,
        user_id: UserId,
        select_until: DateTime<Utc>,
    },
    Cancelled {
        battle_id: Uuid,
        ability_id: Option<AbilityId>,
        reason: String,
    },
}

impl KernelEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            KernelEvent::PhaseChanged { .. } => "phase_changed",
            KernelEvent::AbilityTriggered { .. } => "ability_triggered",
            KernelEvent::WinnerAnnounced { .. } => "winner_announced",
            KernelEvent::Cancelled { .. } => "cancelled",
        }
    }
}

/// Where actors send their events. Unbounded so an actor never blocks on it.
pub type EventSink = mpsc::UnboundedSender<KernelEvent>;

/// A faction's vote price, published per price tick and per forecast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotePriceUpdate {
    pub faction_id: FactionId,
    #[serde(with = "crate::currency::serde_units")]
    pub price: BigUint,
}

/// One ability's auction state, as broadcast to the faction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPriceEntry {
    pub ability_id: AbilityId,
    #[serde(with = "crate::currency::serde_units")]
    pub target_price: BigUint,
    #[serde(with = "crate::currency::serde_units")]
    pub current_contribution: BigUint,
    /// Set when the ability fired since the previous snapshot
    pub triggered: bool,
}

/// Per-faction share of ability-right votes, in whole percent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilityRightRatio {
    pub faction_id: FactionId,
    pub percent: u32,
}
