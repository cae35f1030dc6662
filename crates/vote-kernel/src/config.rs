//! Configuration types for the kernel.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::currency::{one_unit, serde_units};

/// Top-level kernel configuration.
///
/// Defines phase timings, auction decay, the vote price curve and broadcast
/// debouncing. Loaded from TOML/JSON at runtime; every field has a default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Vote cycle timings
    pub phase: PhaseConfig,

    /// Ability auction ledger settings
    pub auction: AuctionConfig,

    /// Vote price bonding curve
    pub vote_price: VotePriceConfig,

    /// Outbound update coalescing
    pub broadcast: BroadcastConfig,
}

impl KernelConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)
                .with_context(|| format!("parsing JSON config {}", path.display())),
            _ => toml::from_str(&text)
                .with_context(|| format!("parsing TOML config {}", path.display())),
        }
    }
}

/// Durations of the vote cycle phases (milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    /// Interval of the phase re-evaluation tick
    pub tick_interval_ms: u64,
    /// Intro time per intro element (e.g. per war machine) before voting opens
    pub intro_ms_per_element: u64,
    /// Cooldown before the first round, and after rounds with no ability
    pub cooldown_initial_ms: u64,
    /// Window during which votes accumulate
    pub vote_ability_right_ms: u64,
    /// Window during which the first vote wins outright
    pub next_vote_win_ms: u64,
    /// Time a winner has to pick a location
    pub location_select_ms: u64,
    /// Failed commits at window close before the round's holds are released
    pub max_commit_attempts: u32,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            intro_ms_per_element: 3_000,
            cooldown_initial_ms: 5_000,
            vote_ability_right_ms: 30_000,
            next_vote_win_ms: 30_000,
            location_select_ms: 15_000,
            max_commit_attempts: 3,
        }
    }
}

impl PhaseConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Ability auction ledger: decay curve, floor and payment timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuctionConfig {
    /// Interval between decay ticks
    pub decay_tick_ms: u64,
    /// Decay ratio numerator (target price × numerator / denominator per tick)
    pub decay_numerator: u64,
    pub decay_denominator: u64,
    /// Target price never decays below this (smallest units)
    #[serde(with = "serde_units")]
    pub floor_price: BigUint,
    /// Decimal places of the currency
    pub currency_decimals: u32,
    /// Timeout applied to every payment ledger call
    pub payment_timeout_ms: u64,
    /// Interval of the periodic target price snapshot
    pub snapshot_interval_ms: u64,
}

impl Default for AuctionConfig {
    fn default() -> Self {
        // 0.9772 per 10s tick halves the price in five minutes
        Self {
            decay_tick_ms: 10_000,
            decay_numerator: 9_772,
            decay_denominator: 10_000,
            floor_price: one_unit(18),
            currency_decimals: 18,
            payment_timeout_ms: 5_000,
            snapshot_interval_ms: 500,
        }
    }
}

impl AuctionConfig {
    /// Set the decay ratio so the target price halves after `ticks` ticks.
    pub fn with_half_life_ticks(mut self, ticks: u32) -> Self {
        if ticks > 0 {
            let ratio = 0.5f64.powf(1.0 / f64::from(ticks));
            self.decay_numerator = (ratio * self.decay_denominator as f64).round() as u64;
        }
        self
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_millis(self.payment_timeout_ms)
    }
}

/// Price-dependent damping applied when a faction's vote price falls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DampingTier {
    /// Applies while the current price is below this
    #[serde(with = "serde_units")]
    pub below: BigUint,
    /// Price decrease is divided by this
    pub divisor: u64,
}

/// Vote price bonding curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VotePriceConfig {
    /// Interval of the price tick
    pub tick_ms: u64,
    /// Interval of the forecast broadcast
    pub forecast_ms: u64,
    /// Starting price per vote (smallest units)
    #[serde(with = "serde_units")]
    pub initial_price: BigUint,
    /// Maximum price change per tick, percent of current price
    pub change_rate_percent: u64,
    /// Fixed-point scale used for the deviation ratio
    pub accuracy: u64,
    /// Number of ticks in the rolling global volume window
    pub window_slots: usize,
    /// Rises are multiplied by `boost_multiplier` while price is below this
    #[serde(with = "serde_units")]
    pub boost_below: BigUint,
    pub boost_multiplier: u64,
    /// Tiers checked in ascending `below` order; first match wins
    pub damping_tiers: Vec<DampingTier>,
    /// Divisor used when no tier matches
    pub default_damping_divisor: u64,
    /// Below this price, above-average-free ticks leave the price unchanged
    #[serde(with = "serde_units")]
    pub freeze_below: BigUint,
    /// Prices are clamped to at least this
    #[serde(with = "serde_units")]
    pub min_price: BigUint,
}

impl Default for VotePriceConfig {
    fn default() -> Self {
        let unit = one_unit(18);
        Self {
            tick_ms: 10_000,
            forecast_ms: 500,
            initial_price: unit.clone(),
            change_rate_percent: 10,
            accuracy: 10_000,
            window_slots: 100,
            boost_below: &unit / 10u32,
            boost_multiplier: 4,
            damping_tiers: vec![
                DampingTier {
                    below: &unit / 100u32,
                    divisor: 5,
                },
                DampingTier {
                    below: &unit / 10u32,
                    divisor: 3,
                },
            ],
            default_damping_divisor: 2,
            freeze_below: &unit / 1_000u32,
            min_price: &unit / 1_000u32,
        }
    }
}

/// Debounce window for outbound updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub debounce_ms: u64,
    /// Longest a continuous stream of changes can delay a publish
    pub max_wait_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            max_wait_ms: 2000,
        }
    }
}

impl BroadcastConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}
