//! Per-faction vote price driven by a bonding curve over recent volume.
//!
//! Each tick compares a faction's vote volume against the rolling per-faction
//! average over the last `window_slots` ticks. Above average the price rises,
//! otherwise it falls (damped at low prices). The tick is scheduled work and
//! takes every faction's gate at high priority, in key order, behind the
//! window lock; vote contributions bump a single faction's counter at low
//! priority, so a flood of votes can delay a tick by at most one volume
//! increment.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use num_bigint::BigUint;
use num_traits::Zero;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::config::VotePriceConfig;
use crate::error::{VoteError, VoteResult};
use crate::messages::VotePriceUpdate;
use crate::priority_gate::{lock_all_high, PriorityGate};
use crate::types::FactionId;

/// Price state for one faction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactionVotePrice {
    pub current_price: BigUint,
    /// Votes cast since the last tick
    pub current_tick_volume: i64,
}

/// Fixed-size ring of per-tick total volumes with a running sum.
#[derive(Debug, Clone)]
pub struct GlobalVoteWindow {
    slots: VecDeque<i64>,
    running_sum: i64,
}

impl GlobalVoteWindow {
    /// A window of `capacity` zeroed slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: std::iter::repeat(0).take(capacity.max(1)).collect(),
            running_sum: 0,
        }
    }

    /// Evict the oldest slot and append `volume`.
    pub fn push(&mut self, volume: i64) {
        let oldest = self.slots.pop_front().unwrap_or(0);
        self.running_sum = self.running_sum - oldest + volume;
        self.slots.push_back(volume);
    }

    /// The running sum as it would be after pushing `volume`.
    pub fn sum_after(&self, volume: i64) -> i64 {
        let oldest = self.slots.front().copied().unwrap_or(0);
        self.running_sum - oldest + volume
    }

    pub fn running_sum(&self) -> i64 {
        self.running_sum
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> impl Iterator<Item = &i64> {
        self.slots.iter()
    }
}

/// The bonding curve, independent of locking.
#[derive(Debug, Clone)]
pub struct PriceCurve {
    config: VotePriceConfig,
    /// `window_slots × faction_count`: scales one faction's tick volume up to
    /// the magnitude of the window's running sum. 300 with the default 100
    /// slots and three factions.
    volume_scale: i64,
}

impl PriceCurve {
    pub fn new(config: VotePriceConfig, faction_count: usize) -> Self {
        let volume_scale = (config.window_slots.max(1) * faction_count.max(1)) as i64;
        Self {
            config,
            volume_scale,
        }
    }

    /// Next price for a faction with `volume` votes this tick, given the
    /// window's running sum including this tick.
    pub fn next_price(&self, current: &BigUint, volume: i64, running_sum: i64) -> BigUint {
        let cfg = &self.config;
        let max_change = current * cfg.change_rate_percent / 100u32;

        let next = if volume == 0 {
            sub_floor(current, &max_change)
        } else {
            let scaled = volume.saturating_mul(self.volume_scale);
            let accuracy = cfg.accuracy.max(1);
            let deviation = if running_sum <= 0 {
                accuracy
            } else {
                let diff = (i128::from(scaled) - i128::from(running_sum)).unsigned_abs();
                let ratio = diff * u128::from(accuracy) / running_sum as u128;
                u64::try_from(ratio).unwrap_or(u64::MAX)
            };

            let price_change = if deviation == 0 || deviation >= accuracy {
                max_change.clone()
            } else {
                &max_change * (accuracy - deviation) / accuracy
            };

            if scaled > running_sum {
                let boost = if *current < cfg.boost_below {
                    cfg.boost_multiplier.max(1)
                } else {
                    1
                };
                current + price_change * boost
            } else if *current < cfg.freeze_below {
                current.clone()
            } else {
                let divisor = self.damping_divisor(current);
                sub_floor(current, &(price_change / divisor))
            }
        };

        if next < cfg.min_price {
            cfg.min_price.clone()
        } else {
            next
        }
    }

    fn damping_divisor(&self, current: &BigUint) -> u64 {
        self.config
            .damping_tiers
            .iter()
            .find(|tier| *current < tier.below)
            .map(|tier| tier.divisor)
            .unwrap_or(self.config.default_damping_divisor)
            .max(1)
    }
}

fn sub_floor(value: &BigUint, by: &BigUint) -> BigUint {
    if by >= value {
        BigUint::zero()
    } else {
        value - by
    }
}

/// Vote prices for every faction, with the shared volume window.
#[derive(Debug)]
pub struct VotePriceFeed {
    curve: PriceCurve,
    gates: HashMap<FactionId, Arc<PriorityGate<FactionVotePrice>>>,
    // Taken before any gate by the tick.
    window: Mutex<GlobalVoteWindow>,
}

impl VotePriceFeed {
    pub fn new(config: VotePriceConfig, factions: &[FactionId]) -> Self {
        let gates = factions
            .iter()
            .map(|faction| {
                let state = FactionVotePrice {
                    current_price: config.initial_price.clone(),
                    current_tick_volume: 0,
                };
                (*faction, Arc::new(PriorityGate::new(state)))
            })
            .collect();
        let window = Mutex::new(GlobalVoteWindow::new(config.window_slots));
        Self {
            curve: PriceCurve::new(config, factions.len()),
            gates,
            window,
        }
    }

    pub fn factions(&self) -> impl Iterator<Item = &FactionId> {
        self.gates.keys()
    }

    fn gate(&self, faction_id: FactionId) -> VoteResult<&Arc<PriorityGate<FactionVotePrice>>> {
        self.gates
            .get(&faction_id)
            .ok_or(VoteError::UnknownFaction(faction_id))
    }

    /// Add `amount` votes to the faction's current tick (low priority).
    pub async fn increase_faction_volume(&self, faction_id: FactionId, amount: i64) -> VoteResult<()> {
        let mut state = self.gate(faction_id)?.lock_low().await;
        state.current_tick_volume = state.current_tick_volume.saturating_add(amount);
        trace!(%faction_id, amount, tick_volume = state.current_tick_volume, "Faction volume increased");
        Ok(())
    }

    /// The faction's current price per vote (low priority).
    pub async fn current_price(&self, faction_id: FactionId) -> VoteResult<BigUint> {
        let state = self.gate(faction_id)?.lock_low().await;
        Ok(state.current_price.clone())
    }

    /// Advance the window by one tick and reprice every faction.
    ///
    /// The window lock is taken before any gate, so ticks run one at a time
    /// and only one batch locker ever walks the gates.
    pub async fn tick(&self) -> Vec<VotePriceUpdate> {
        let mut window = self.window.lock().await;
        let mut guards = lock_all_high(&self.gates).await;

        let total: i64 = guards
            .values()
            .map(|g| g.current_tick_volume)
            .fold(0i64, i64::saturating_add);
        window.push(total);
        let running_sum = window.running_sum();

        let mut updates: Vec<VotePriceUpdate> = guards
            .iter_mut()
            .map(|(faction_id, guard)| {
                let next = self.curve.next_price(
                    &guard.current_price,
                    guard.current_tick_volume,
                    running_sum,
                );
                guard.current_price = next.clone();
                guard.current_tick_volume = 0;
                VotePriceUpdate {
                    faction_id: *faction_id,
                    price: next,
                }
            })
            .collect();
        drop(guards);
        drop(window);

        updates.sort_by_key(|u| u.faction_id);
        debug!(total_volume = total, running_sum, factions = updates.len(), "Vote price tick");
        updates
    }

    /// Prices each faction would get if the tick ran now. Mutates nothing.
    ///
    /// Reads one gate at a time and never holds a gate while waiting on
    /// another lock, so it can run alongside a tick.
    pub async fn forecast(&self) -> Vec<VotePriceUpdate> {
        let mut snapshot: Vec<(FactionId, FactionVotePrice)> = Vec::with_capacity(self.gates.len());
        for (faction_id, gate) in &self.gates {
            let state = gate.lock_high().await.clone();
            snapshot.push((*faction_id, state));
        }

        let total: i64 = snapshot
            .iter()
            .map(|(_, s)| s.current_tick_volume)
            .fold(0i64, i64::saturating_add);
        let running_sum = self.window.lock().await.sum_after(total);

        let mut forecast: Vec<VotePriceUpdate> = snapshot
            .into_iter()
            .map(|(faction_id, state)| VotePriceUpdate {
                faction_id,
                price: self.curve.next_price(
                    &state.current_price,
                    state.current_tick_volume,
                    running_sum,
                ),
            })
            .collect();
        forecast.sort_by_key(|u| u.faction_id);
        forecast
    }

    /// The window's running sum and slot count.
    pub async fn window_summary(&self) -> (i64, usize) {
        let window = self.window.lock().await;
        (window.running_sum(), window.len())
    }
}
