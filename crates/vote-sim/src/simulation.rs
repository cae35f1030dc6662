//! Battle simulator: random viewers driving a live kernel.
//!
//! Every kernel duration is divided by `time_scale`, so a default 30 s vote
//! window passes in 300 ms at scale 100. The kernel runs its own tickers;
//! the simulator only plays the viewers:
//!
//! ```text
//! every step:
//!   drain round events ──► WinnerAnnounced? pick a cell / drop out / idle
//!   each viewer ─────────► contribute to a faction ability (contribute_chance)
//!                     └──► buy votes while voting is open (vote_chance)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use vote_kernel::collaborators::{AbilityCatalog, Collaborators};
use vote_kernel::currency::one_unit;
use vote_kernel::memory::{
    MemoryPaymentLedger, MemoryRoundStore, RecordingPublisher, StaticCatalog, StaticPresence,
};
use vote_kernel::messages::{topics, TriggerSource};
use vote_kernel::{
    AbilityId, CellLocation, FactionId, KernelConfig, KernelEvent, SystemClock, UserId,
    VoteKernel, VoteKernelBuilder,
};

use crate::results::{BattleResult, FactionTally, SimulationResult, SimulationSettings};

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub factions: usize,
    pub viewers_per_faction: usize,
    pub abilities_per_faction: usize,
    pub battles: usize,
    /// Wall-clock length of each battle
    pub battle_ms: u64,
    /// Every kernel duration is divided by this
    pub time_scale: u64,
    /// Pause between viewer rounds
    pub step_ms: u64,
    /// Whole units each viewer starts with
    pub starting_balance: u32,
    /// Whole units each faction ability starts at
    pub ability_price: u32,
    /// Battle ability cooldown before scaling
    pub ability_cooldown_ms: u64,
    /// Per step, chance a viewer contributes
    pub contribute_chance: f64,
    /// Per step, chance a viewer votes while voting is open
    pub vote_chance: f64,
    /// Chance a winner picks a location
    pub pick_chance: f64,
    /// Chance a winner drops out instead (otherwise they let the timer run)
    pub disconnect_chance: f64,
    pub kernel: KernelConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            factions: 3,
            viewers_per_faction: 5,
            abilities_per_faction: 2,
            battles: 1,
            battle_ms: 3_000,
            time_scale: 100,
            step_ms: 10,
            starting_balance: 10_000,
            ability_price: 200,
            ability_cooldown_ms: 20_000,
            contribute_chance: 0.3,
            vote_chance: 0.4,
            pick_chance: 0.7,
            disconnect_chance: 0.1,
            kernel: KernelConfig::default(),
        }
    }
}

/// Divide every kernel duration by `factor`. Payment timeouts are left alone.
pub fn scale_config(config: &KernelConfig, factor: u64) -> KernelConfig {
    let factor = factor.max(1);
    let s = |ms: u64| (ms / factor).max(1);
    let mut scaled = config.clone();

    let phase = &mut scaled.phase;
    phase.tick_interval_ms = s(phase.tick_interval_ms);
    phase.intro_ms_per_element = s(phase.intro_ms_per_element);
    phase.cooldown_initial_ms = s(phase.cooldown_initial_ms);
    phase.vote_ability_right_ms = s(phase.vote_ability_right_ms);
    phase.next_vote_win_ms = s(phase.next_vote_win_ms);
    phase.location_select_ms = s(phase.location_select_ms);

    let auction = &mut scaled.auction;
    auction.decay_tick_ms = s(auction.decay_tick_ms);
    auction.snapshot_interval_ms = s(auction.snapshot_interval_ms);

    let prices = &mut scaled.vote_price;
    prices.tick_ms = s(prices.tick_ms);
    prices.forecast_ms = s(prices.forecast_ms);

    let broadcast = &mut scaled.broadcast;
    broadcast.debounce_ms = s(broadcast.debounce_ms);
    broadcast.max_wait_ms = s(broadcast.max_wait_ms);

    scaled
}

#[derive(Debug, Clone, Copy)]
struct Viewer {
    id: UserId,
    faction: usize,
}

/// Everything one run shares across battles.
struct Arena {
    kernel: VoteKernel,
    payments: Arc<MemoryPaymentLedger>,
    publisher: Arc<RecordingPublisher>,
    factions: Vec<FactionId>,
    faction_index: HashMap<FactionId, usize>,
    abilities: Vec<Vec<AbilityId>>,
    viewers: Vec<Viewer>,
    decimals: u32,
}

pub struct BattleSimulator {
    config: SimulationConfig,
}

impl BattleSimulator {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    /// Run every battle and return the collected results.
    pub async fn run(&self, seed: Option<u64>) -> Result<SimulationResult> {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let arena = self.build_arena().await?;

        let mut result = SimulationResult::new(SimulationSettings {
            factions: self.config.factions,
            viewers_per_faction: self.config.viewers_per_faction,
            battles: self.config.battles,
            battle_ms: self.config.battle_ms,
            time_scale: self.config.time_scale,
            seed,
        });

        for battle in 0..self.config.battles {
            let battle_result = self.run_battle(&arena, &mut rng).await?;
            info!(
                battle = battle + 1,
                contributions = battle_result.contributions,
                votes = battle_result.votes,
                fired = battle_result.contribution_triggers
                    + battle_result.decay_triggers
                    + battle_result.vote_triggers,
                "Battle finished"
            );
            result.add(battle_result);
        }

        arena.kernel.shutdown().await;
        Ok(result)
    }

    async fn build_arena(&self) -> Result<Arena> {
        let cfg = &self.config;
        let kernel_config = scale_config(&cfg.kernel, cfg.time_scale);
        let decimals = kernel_config.auction.currency_decimals;

        let factions: Vec<FactionId> = (0..cfg.factions)
            .map(|i| Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("faction-{i}").as_bytes()))
            .collect();
        let faction_index = factions.iter().enumerate().map(|(i, f)| (*f, i)).collect();

        let payments = Arc::new(MemoryPaymentLedger::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let catalog = Arc::new(StaticCatalog::generated(
            &factions,
            cfg.abilities_per_faction,
            one_unit(decimals) * cfg.ability_price,
            (cfg.ability_cooldown_ms / cfg.time_scale.max(1)).max(1),
        ));

        let mut abilities = Vec::with_capacity(factions.len());
        for faction in &factions {
            let ids = catalog
                .faction_abilities(*faction)
                .await
                .context("loading faction abilities")?
                .into_iter()
                .map(|a| a.id)
                .collect();
            abilities.push(ids);
        }

        let viewers: Vec<Viewer> = (0..cfg.factions)
            .flat_map(|faction| {
                (0..cfg.viewers_per_faction).map(move |_| Viewer {
                    id: Uuid::new_v4(),
                    faction,
                })
            })
            .collect();
        for viewer in &viewers {
            payments.credit(viewer.id, one_unit(decimals) * cfg.starting_balance);
        }

        let collaborators = Collaborators {
            payments: payments.clone(),
            store: Arc::new(MemoryRoundStore::new()),
            publisher: publisher.clone(),
            presence: Arc::new(StaticPresence::new()),
            catalog,
            clock: Arc::new(SystemClock),
        };
        let kernel = VoteKernelBuilder::new(kernel_config, collaborators)
            .factions(factions.clone())
            .spawn();

        Ok(Arena {
            kernel,
            payments,
            publisher,
            factions,
            faction_index,
            abilities,
            viewers,
            decimals,
        })
    }

    async fn run_battle(&self, arena: &Arena, rng: &mut StdRng) -> Result<BattleResult> {
        let cfg = &self.config;
        let battle_id = Uuid::new_v4();
        let started_at = Utc::now();
        let spent_before: Vec<BigUint> = arena
            .viewers
            .iter()
            .map(|v| arena.payments.spent_by(v.id))
            .collect();

        let mut events = arena.publisher.subscribe();
        let mut result = BattleResult {
            battle_id,
            started_at,
            ended_at: started_at,
            contributions: 0,
            rejected_contributions: 0,
            votes: 0,
            rejected_votes: 0,
            contribution_triggers: 0,
            decay_triggers: 0,
            vote_triggers: 0,
            cancelled_rounds: 0,
            disconnects: 0,
            released_vote_holds: 0,
            released_contribution_holds: 0,
            factions: (0..cfg.factions).map(|i| (i, FactionTally::default())).collect(),
        };

        arena
            .kernel
            .start_battle(battle_id, arena.factions.len() as u32)
            .await?;

        let deadline = Instant::now() + Duration::from_millis(cfg.battle_ms);
        while Instant::now() < deadline {
            self.handle_events(arena, &mut events, rng, &mut result).await;

            let voting = arena
                .kernel
                .status()
                .await
                .map(|s| s.phase.accepts_votes())
                .unwrap_or(false);

            for viewer in &arena.viewers {
                let faction = arena.factions[viewer.faction];
                let abilities = &arena.abilities[viewer.faction];
                if !abilities.is_empty() && rng.gen_bool(cfg.contribute_chance) {
                    let ability = abilities[rng.gen_range(0..abilities.len())];
                    let amount = rng.gen_range(1..=50u32).to_string();
                    match arena
                        .kernel
                        .contribute(viewer.id, faction, ability, &amount)
                        .await
                    {
                        Ok(_) => result.contributions += 1,
                        Err(err) => {
                            debug!(viewer = %viewer.id, retryable = err.is_retryable(), error = %err, "Contribution rejected");
                            result.rejected_contributions += 1;
                        }
                    }
                }
                if voting && rng.gen_bool(cfg.vote_chance) {
                    let votes = rng.gen_range(1..=3u64);
                    match arena.kernel.cast_vote(viewer.id, faction, votes).await {
                        Ok(_) => result.votes += 1,
                        Err(err) => {
                            debug!(viewer = %viewer.id, retryable = err.is_retryable(), error = %err, "Vote rejected");
                            result.rejected_votes += 1;
                        }
                    }
                }
            }

            tokio::time::sleep(Duration::from_millis(cfg.step_ms.max(1))).await;
        }

        let summary = arena.kernel.end_battle().await?;
        result.released_vote_holds = summary.released_vote_holds;
        result.released_contribution_holds = summary
            .drained
            .iter()
            .map(|(_, report)| report.released_holds)
            .sum();
        if !summary.failed_drains.is_empty() {
            warn!(factions = ?summary.failed_drains, "Some ledgers kept holds at battle end");
        }

        // Let the fan-out deliver what the battle emitted last.
        tokio::time::sleep(Duration::from_millis(cfg.step_ms.max(1))).await;
        self.handle_events(arena, &mut events, rng, &mut result).await;

        for (i, viewer) in arena.viewers.iter().enumerate() {
            let spent = arena.payments.spent_by(viewer.id) - &spent_before[i];
            if let Some(tally) = result.factions.get_mut(&viewer.faction) {
                tally.spent += to_units(&spent, arena.decimals);
            }
        }
        for (i, faction) in arena.factions.iter().enumerate() {
            let price = arena.kernel.vote_price(*faction).await?;
            if let Some(tally) = result.factions.get_mut(&i) {
                tally.final_vote_price = to_units(&price, arena.decimals);
            }
        }

        result.ended_at = Utc::now();
        Ok(result)
    }

    async fn handle_events(
        &self,
        arena: &Arena,
        events: &mut broadcast::Receiver<(String, serde_json::Value)>,
        rng: &mut StdRng,
        result: &mut BattleResult,
    ) {
        loop {
            let (topic, payload) = match events.try_recv() {
                Ok(message) => message,
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Simulator fell behind the publisher");
                    continue;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return,
            };
            if topic != topics::ROUND_EVENTS {
                continue;
            }
            let event: KernelEvent = match serde_json::from_value(payload) {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, "Unreadable round event");
                    continue;
                }
            };
            self.on_event(arena, event, rng, result).await;
        }
    }

    async fn on_event(
        &self,
        arena: &Arena,
        event: KernelEvent,
        rng: &mut StdRng,
        result: &mut BattleResult,
    ) {
        match event {
            KernelEvent::AbilityTriggered { trigger, .. } => {
                match trigger.source {
                    TriggerSource::Contribution => result.contribution_triggers += 1,
                    TriggerSource::Decay => result.decay_triggers += 1,
                    TriggerSource::Vote => result.vote_triggers += 1,
                }
                if let Some(tally) = arena
                    .faction_index
                    .get(&trigger.faction_id)
                    .and_then(|i| result.factions.get_mut(i))
                {
                    tally.abilities_fired += 1;
                }
            }
            KernelEvent::WinnerAnnounced {
                user_id,
                faction_id,
                ..
            } => {
                if let Some(tally) = arena
                    .faction_index
                    .get(&faction_id)
                    .and_then(|i| result.factions.get_mut(i))
                {
                    tally.rounds_won += 1;
                }
                let roll: f64 = rng.gen();
                if roll < self.config.pick_chance {
                    let cell = CellLocation {
                        x: rng.gen_range(0..64),
                        y: rng.gen_range(0..64),
                    };
                    if let Err(err) = arena.kernel.select_location(user_id, cell).await {
                        debug!(user = %user_id, error = %err, "Location pick rejected");
                    }
                } else if roll < self.config.pick_chance + self.config.disconnect_chance {
                    if let Ok(true) = arena.kernel.user_disconnected(user_id).await {
                        result.disconnects += 1;
                    }
                }
            }
            KernelEvent::Cancelled { reason, .. } => {
                debug!(%reason, "Vote round cancelled");
                result.cancelled_rounds += 1;
            }
            KernelEvent::PhaseChanged { .. } => {}
        }
    }
}

fn to_units(value: &BigUint, decimals: u32) -> f64 {
    value.to_f64().unwrap_or(f64::MAX) / 10f64.powi(decimals as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_config_divides_durations() {
        let base = KernelConfig::default();
        let scaled = scale_config(&base, 100);

        assert_eq!(scaled.phase.vote_ability_right_ms, 300);
        assert_eq!(scaled.phase.tick_interval_ms, 10);
        assert_eq!(scaled.auction.decay_tick_ms, 100);
        assert_eq!(scaled.vote_price.forecast_ms, 5);
        assert_eq!(scaled.broadcast.debounce_ms, 5);
        assert_eq!(
            scaled.auction.payment_timeout_ms,
            base.auction.payment_timeout_ms
        );
    }

    #[test]
    fn test_scale_config_never_reaches_zero() {
        let scaled = scale_config(&KernelConfig::default(), 1_000_000);
        assert_eq!(scaled.phase.tick_interval_ms, 1);
        assert_eq!(scaled.vote_price.forecast_ms, 1);
    }

    #[test]
    fn test_to_units() {
        assert_eq!(to_units(&(one_unit(18) * 3u32), 18), 3.0);
        assert_eq!(to_units(&BigUint::from(5u32), 1), 0.5);
    }
}
