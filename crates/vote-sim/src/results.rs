//! Results collection and output for simulated battles.
//!
//! Captures per battle:
//! - Contributions and votes attempted vs accepted
//! - Abilities fired, split by what fired them
//! - Vote rounds won, cancelled, or left unclaimed
//! - Final vote prices and per-faction spend

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Configuration a simulation ran with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSettings {
    /// Number of factions
    pub factions: usize,
    /// Viewers per faction
    pub viewers_per_faction: usize,
    /// Battles run back to back
    pub battles: usize,
    /// Wall-clock length of each battle
    pub battle_ms: u64,
    /// Factor every kernel duration was divided by
    pub time_scale: u64,
    /// Random seed (if reproducible)
    pub seed: Option<u64>,
}

/// Tallies for one faction in one battle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactionTally {
    /// Committed spend by this faction's viewers, in whole units
    pub spent: f64,
    /// Vote price when the battle ended, in whole units
    pub final_vote_price: f64,
    /// Abilities this faction fired
    pub abilities_fired: usize,
    /// Vote rounds this faction won
    pub rounds_won: usize,
}

/// Results from a single battle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleResult {
    pub battle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub contributions: usize,
    pub rejected_contributions: usize,
    pub votes: usize,
    pub rejected_votes: usize,
    /// Abilities fired by contributions reaching the target
    pub contribution_triggers: usize,
    /// Abilities fired when a decaying target dropped under the contribution
    pub decay_triggers: usize,
    /// Battle abilities fired by a vote winner picking a location
    pub vote_triggers: usize,
    /// Vote rounds cancelled (tie, failed commit, or nobody picked)
    pub cancelled_rounds: usize,
    /// Winners who dropped out instead of picking
    pub disconnects: usize,
    /// Vote holds returned when the battle ended
    pub released_vote_holds: usize,
    /// Contribution holds returned when the battle ended
    pub released_contribution_holds: usize,
    /// Keyed by faction index
    pub factions: BTreeMap<usize, FactionTally>,
}

/// All battles from one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    pub settings: SimulationSettings,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub battles: Vec<BattleResult>,
}

impl SimulationResult {
    pub fn new(settings: SimulationSettings) -> Self {
        let now = Utc::now();
        Self {
            settings,
            started_at: now,
            ended_at: now,
            battles: Vec::new(),
        }
    }

    pub fn add(&mut self, battle: BattleResult) {
        self.ended_at = battle.ended_at;
        self.battles.push(battle);
    }

    pub fn total_triggers(&self) -> usize {
        self.battles
            .iter()
            .map(|b| b.contribution_triggers + b.decay_triggers + b.vote_triggers)
            .sum()
    }

    /// Save results to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load results from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let results = serde_json::from_str(&json)?;
        Ok(results)
    }

    /// Condensed per-battle table.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "  {:>6} {:>8} {:>6} {:>7} {:>6} {:>6} {:>9}",
            "Battle", "Contrib", "Votes", "Contrib", "Decay", "Vote", "Cancelled"
        )];
        for (i, b) in self.battles.iter().enumerate() {
            lines.push(format!(
                "  {:>6} {:>8} {:>6} {:>7} {:>6} {:>6} {:>9}",
                i + 1,
                b.contributions,
                b.votes,
                b.contribution_triggers,
                b.decay_triggers,
                b.vote_triggers,
                b.cancelled_rounds
            ));
        }
        lines
    }
}
