//! The vote kernel: wires the actors, the price feed and the periodic ticks.
//!
//! ## Usage
//!
//! ```ignore
//! use vote_kernel::{KernelConfig, VoteKernelBuilder};
//!
//! let kernel = VoteKernelBuilder::new(KernelConfig::default(), collaborators)
//!     .factions(faction_ids)
//!     .spawn();
//!
//! kernel.start_battle(battle_id, war_machines).await?;
//! kernel.contribute(user, faction, ability, "12.5").await?;
//! kernel.cast_vote(user, faction, 3).await?;
//! kernel.end_battle().await?;
//! kernel.shutdown().await;
//! ```
//!
//! ## Ticks
//!
//! | ticker    | default | does                                         |
//! |-----------|---------|----------------------------------------------|
//! | phase     | 1 s     | re-checks the vote cycle's phase deadline    |
//! | price     | 10 s    | reprices every faction's vote                |
//! | forecast  | 500 ms  | publishes what the next price tick would do  |
//! | decay     | 10 s    | decays ability target prices                 |
//! | snapshot  | 500 ms  | asks each faction to publish target prices   |
//!
//! Every ticker only submits commands; none of them touch actor state.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::actors::{
    AuctionLedger, ContributionOutcome, CycleDeps, CycleStatus, DrainReport, VoteCycle,
    VoteReceipt,
};
use crate::broadcast::Debouncer;
use crate::collaborators::{Collaborators, Publisher, RoundSnapshot};
use crate::config::KernelConfig;
use crate::error::{VoteError, VoteResult};
use crate::messages::{
    topics, AbilityRightRatio, AbilityTrigger, EventSink, KernelEvent, TargetPriceEntry,
    VotePhase, VotePriceUpdate,
};
use crate::registry::{FactionRegistry, FactionSlot};
use crate::types::{AbilityId, CellLocation, FactionId, UserId};
use crate::vote_price::VotePriceFeed;

/// Result of ending a battle.
#[derive(Debug, Clone, Default)]
pub struct BattleSummary {
    pub battle_id: Option<Uuid>,
    /// Uncommitted vote holds returned to voters
    pub released_vote_holds: usize,
    /// Per-faction ledger drains
    pub drained: Vec<(FactionId, DrainReport)>,
    /// Factions whose ledgers could not release their holds
    pub failed_drains: Vec<FactionId>,
    /// Target prices as the battle left them, for the next round
    pub final_prices: Vec<RoundSnapshot>,
}

/// Target prices for one faction, as published.
#[derive(Debug, Clone, Serialize)]
pub struct TargetPriceBroadcast {
    pub faction_id: FactionId,
    pub abilities: Vec<TargetPriceEntry>,
}

/// Builder for [`VoteKernel`].
pub struct VoteKernelBuilder {
    config: KernelConfig,
    collaborators: Collaborators,
    factions: Vec<FactionId>,
    tickers: bool,
}

impl VoteKernelBuilder {
    pub fn new(config: KernelConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
            factions: Vec::new(),
            tickers: true,
        }
    }

    /// Factions taking part. Fixed for the kernel's lifetime.
    pub fn factions(mut self, factions: impl IntoIterator<Item = FactionId>) -> Self {
        self.factions.extend(factions);
        self
    }

    /// Don't spawn periodic tickers; the caller drives `tick_*` by hand.
    pub fn manual_ticks(mut self) -> Self {
        self.tickers = false;
        self
    }

    /// Spawn the vote cycle, the broadcasters and (unless disabled) the tickers.
    pub fn spawn(self) -> VoteKernel {
        let Self {
            config,
            collaborators,
            factions,
            tickers,
        } = self;

        let (events, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let prices = Arc::new(VotePriceFeed::new(config.vote_price.clone(), &factions));

        let publisher = collaborators.publisher.clone();
        let (ratio, ratio_task) = Debouncer::spawn(
            "AbilityRightRatio",
            config.broadcast.debounce(),
            config.broadcast.max_wait(),
            move |ratios: Option<Vec<AbilityRightRatio>>| {
                let publisher = publisher.clone();
                async move {
                    if let Some(ratios) = ratios {
                        publish(&*publisher, topics::ABILITY_RIGHT_RATIO, &ratios).await;
                    }
                }
                .boxed()
            },
        );

        let (cycle, cycle_worker) = VoteCycle::spawn(
            factions.clone(),
            config.phase.clone(),
            config.auction.payment_timeout(),
            CycleDeps {
                payments: collaborators.payments.clone(),
                presence: collaborators.presence.clone(),
                catalog: collaborators.catalog.clone(),
                clock: collaborators.clock.clone(),
                prices: prices.clone(),
                events: events.clone(),
                ratio: Some(ratio),
            },
        );

        let kernel = VoteKernel {
            config: Arc::new(config),
            collaborators,
            factions: Arc::new(factions),
            prices,
            cycle,
            registry: Arc::new(FactionRegistry::new()),
            battle_lock: Arc::new(tokio::sync::Mutex::new(())),
            events,
            shutdown: Arc::new(shutdown),
            tasks: Arc::new(Mutex::new(Vec::new())),
        };

        let fan_out = tokio::spawn(fan_out_events(
            events_rx,
            kernel.collaborators.clone(),
            kernel.shutdown.subscribe(),
        ));
        let mut tasks = vec![fan_out, ratio_task, watch_worker("VoteCycle", cycle_worker)];
        if tickers {
            tasks.extend(kernel.spawn_tickers());
        }
        kernel.track(tasks);

        tracing::info!(
            factions = kernel.factions.len(),
            tickers,
            "Vote kernel started"
        );
        kernel
    }
}

/// Handle to a running kernel. Cheap to clone.
#[derive(Clone)]
pub struct VoteKernel {
    config: Arc<KernelConfig>,
    collaborators: Collaborators,
    factions: Arc<Vec<FactionId>>,
    prices: Arc<VotePriceFeed>,
    cycle: VoteCycle,
    registry: Arc<FactionRegistry>,
    /// Held for the whole of a battle start or end
    battle_lock: Arc<tokio::sync::Mutex<()>>,
    events: EventSink,
    shutdown: Arc<watch::Sender<bool>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for VoteKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoteKernel")
            .field("factions", &self.factions.len())
            .field("registry", &self.registry)
            .finish()
    }
}

impl VoteKernel {
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn factions(&self) -> &[FactionId] {
        &self.factions
    }

    fn track(&self, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.extend(handles),
            Err(poisoned) => poisoned.into_inner().extend(handles),
        }
    }

    fn spawn_tickers(&self) -> Vec<JoinHandle<()>> {
        let cfg = &self.config;
        vec![
            self.ticker("phase", cfg.phase.tick_interval(), |k| {
                async move { k.tick_phase().await.is_ok() }.boxed()
            }),
            self.ticker("price", Duration::from_millis(cfg.vote_price.tick_ms), |k| {
                async move {
                    k.tick_prices().await;
                    true
                }
                .boxed()
            }),
            self.ticker(
                "forecast",
                Duration::from_millis(cfg.vote_price.forecast_ms),
                |k| {
                    async move {
                        k.tick_forecast().await;
                        true
                    }
                    .boxed()
                },
            ),
            self.ticker("decay", Duration::from_millis(cfg.auction.decay_tick_ms), |k| {
                async move {
                    k.tick_decay().await;
                    true
                }
                .boxed()
            }),
            self.ticker(
                "snapshot",
                Duration::from_millis(cfg.auction.snapshot_interval_ms),
                |k| {
                    async move {
                        k.registry.snapshot_all_changed();
                        true
                    }
                    .boxed()
                },
            ),
        ]
    }

    /// Run `step` every `period` until shutdown or until it returns false.
    fn ticker<F, Fut>(&self, name: &'static str, period: Duration, step: F) -> JoinHandle<()>
    where
        F: Fn(VoteKernel) -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let kernel = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !step(kernel.clone()).await {
                            tracing::error!(ticker = name, "Ticker target gone, stopping");
                            break;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(ticker = name, "Ticker stopped");
        })
    }

    /// Start a battle: build each faction's ledger, restore stored prices,
    /// and move the vote cycle out of `HOLD`.
    ///
    /// The ledgers only become reachable once the vote cycle accepts the
    /// start. If it refuses, they are torn down again.
    pub async fn start_battle(&self, battle_id: Uuid, intro_elements: u32) -> VoteResult<()> {
        let _battle = self.battle_lock.lock().await;
        if !self.registry.is_empty() {
            let status = self.cycle.status().await?;
            return Err(VoteError::PhaseClosed {
                phase: status.phase.to_string(),
            });
        }

        let staged = FactionRegistry::new();
        for faction_id in self.factions.iter().copied() {
            match self.build_slot(battle_id, faction_id).await {
                Ok(slot) => staged.insert(faction_id, slot),
                Err(err) => {
                    staged.teardown(1).await;
                    return Err(err);
                }
            }
        }

        if let Err(err) = self.cycle.battle_started(battle_id, intro_elements).await {
            tracing::warn!(%battle_id, error = %err, "Vote cycle refused battle start");
            staged.teardown(1).await;
            return Err(err);
        }
        for (faction_id, slot) in staged.into_slots() {
            self.registry.insert(faction_id, slot);
        }
        tracing::info!(%battle_id, intro_elements, "Battle started");
        Ok(())
    }

    async fn build_slot(&self, battle_id: Uuid, faction_id: FactionId) -> VoteResult<FactionSlot> {
        let abilities = match self.collaborators.catalog.faction_abilities(faction_id).await {
            Ok(abilities) => abilities,
            Err(err) => {
                tracing::warn!(%faction_id, error = %err, "No faction abilities loaded");
                Vec::new()
            }
        };
        let ability_count = abilities.len();

        let (ledger, worker) = AuctionLedger::spawn(
            Some(battle_id),
            faction_id,
            abilities,
            self.config.auction.clone(),
            self.collaborators.payments.clone(),
            self.collaborators.clock.clone(),
            self.events.clone(),
        );
        match self.collaborators.store.load_active_round(faction_id).await {
            Ok(Some(snapshot)) => match ledger.seed(snapshot).await {
                Ok(seeded) => tracing::info!(%faction_id, seeded, "Restored target prices"),
                Err(err) => {
                    // Nothing has been held yet; stopping is enough.
                    let _ = ledger.stop();
                    return Err(err);
                }
            },
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(%faction_id, error = %err, "Failed to load active round")
            }
        }

        let snapshots = self.spawn_snapshot_broadcaster(faction_id, ledger.clone());
        tracing::debug!(%faction_id, abilities = ability_count, "Faction ledger ready");
        Ok(FactionSlot::new(ledger, snapshots, worker))
    }

    fn spawn_snapshot_broadcaster(
        &self,
        faction_id: FactionId,
        ledger: AuctionLedger,
    ) -> Debouncer<()> {
        let publisher = self.collaborators.publisher.clone();
        let (debouncer, task) = Debouncer::spawn(
            format!("TargetPrices[{faction_id}]"),
            self.config.broadcast.debounce(),
            self.config.broadcast.max_wait(),
            move |_: Option<()>| {
                let ledger = ledger.clone();
                let publisher = publisher.clone();
                async move {
                    match ledger.snapshot().await {
                        Ok(abilities) => {
                            let payload = TargetPriceBroadcast {
                                faction_id,
                                abilities,
                            };
                            publish(&*publisher, topics::TARGET_PRICES, &payload).await;
                        }
                        Err(err) => {
                            tracing::debug!(%faction_id, error = %err, "Skipping target price broadcast")
                        }
                    }
                }
                .boxed()
            },
        );
        self.track([task]);
        debouncer
    }

    /// End the battle: release open vote holds, drain every ledger, and return
    /// the vote cycle to `HOLD`.
    pub async fn end_battle(&self) -> VoteResult<BattleSummary> {
        let _battle = self.battle_lock.lock().await;
        let battle_id = self.cycle.status().await?.battle_id;
        let released_vote_holds = self.cycle.battle_ended().await?;

        let mut summary = BattleSummary {
            battle_id,
            released_vote_holds,
            ..BattleSummary::default()
        };
        for ledger in self.registry.ledgers() {
            match ledger.stored_prices().await {
                Ok(prices) => summary.final_prices.push(prices),
                Err(err) => tracing::warn!(
                    faction_id = %ledger.faction_id(),
                    error = %err,
                    "Could not read final target prices"
                ),
            }
        }
        for teardown in self
            .registry
            .teardown(self.config.phase.max_commit_attempts)
            .await
        {
            match teardown.drained {
                Some(report) => summary.drained.push((teardown.faction_id, report)),
                None => summary.failed_drains.push(teardown.faction_id),
            }
        }

        tracing::info!(
            battle_id = ?battle_id,
            released_vote_holds,
            drained = summary.drained.len(),
            failed = summary.failed_drains.len(),
            "Battle ended"
        );
        Ok(summary)
    }

    /// Contribute a decimal amount toward a faction ability.
    pub async fn contribute(
        &self,
        user: UserId,
        faction_id: FactionId,
        ability_id: AbilityId,
        amount: &str,
    ) -> VoteResult<ContributionOutcome> {
        let ledger = self.registry.ledger(faction_id)?;
        let outcome = ledger.contribute(user, ability_id, amount).await?;
        self.registry.snapshot_changed(faction_id);
        Ok(outcome)
    }

    pub async fn cast_vote(
        &self,
        user: UserId,
        faction_id: FactionId,
        votes: u64,
    ) -> VoteResult<VoteReceipt> {
        self.cycle.cast_vote(user, faction_id, votes).await
    }

    pub async fn select_location(
        &self,
        user: UserId,
        location: CellLocation,
    ) -> VoteResult<AbilityTrigger> {
        self.cycle.select_location(user, location).await
    }

    pub async fn user_disconnected(&self, user: UserId) -> VoteResult<bool> {
        self.cycle.user_disconnected(user).await
    }

    pub async fn status(&self) -> VoteResult<CycleStatus> {
        self.cycle.status().await
    }

    pub async fn vote_price(&self, faction_id: FactionId) -> VoteResult<num_bigint::BigUint> {
        self.prices.current_price(faction_id).await
    }

    pub async fn target_prices(&self, faction_id: FactionId) -> VoteResult<Vec<TargetPriceEntry>> {
        self.registry.ledger(faction_id)?.snapshot().await
    }

    /// One phase tick.
    pub async fn tick_phase(&self) -> VoteResult<VotePhase> {
        let result = self.cycle.tick().await;
        if let Err(err) = &result {
            tracing::error!(error = %err, "Phase tick failed");
        }
        result
    }

    /// One price tick; publishes and returns the new prices.
    pub async fn tick_prices(&self) -> Vec<VotePriceUpdate> {
        let updates = self.prices.tick().await;
        for update in &updates {
            publish(&*self.collaborators.publisher, topics::VOTE_PRICE, update).await;
        }
        updates
    }

    /// Publish the price forecast.
    pub async fn tick_forecast(&self) -> Vec<VotePriceUpdate> {
        let forecast = self.prices.forecast().await;
        publish(
            &*self.collaborators.publisher,
            topics::VOTE_PRICE_FORECAST,
            &forecast,
        )
        .await;
        forecast
    }

    /// One decay tick across every faction ledger; publishes each faction's
    /// target prices afterwards. Returns abilities fired by the decay.
    pub async fn tick_decay(&self) -> Vec<AbilityTrigger> {
        let mut fired = Vec::new();
        for ledger in self.registry.ledgers() {
            let faction_id = ledger.faction_id();
            match ledger.decay_tick().await {
                Ok(triggers) => fired.extend(triggers),
                Err(err) => {
                    tracing::error!(%faction_id, error = %err, "Decay tick failed");
                    continue;
                }
            }
            if let Ok(abilities) = ledger.snapshot().await {
                let payload = TargetPriceBroadcast {
                    faction_id,
                    abilities,
                };
                publish(&*self.collaborators.publisher, topics::TARGET_PRICES, &payload).await;
            }
        }
        fired
    }

    /// Stop every ticker and actor. Ends the current battle first if needed.
    pub async fn shutdown(&self) {
        if !self.registry.is_empty() {
            if let Err(err) = self.end_battle().await {
                tracing::warn!(error = %err, "Failed to end battle during shutdown");
            }
        }
        let _ = self.shutdown.send(true);
        if let Err(err) = self.cycle.stop() {
            tracing::debug!(error = %err, "Vote cycle already stopped");
        }

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            // Broadcasters exit once their last handle drops; don't wait on them.
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                tracing::debug!("Kernel task still running at shutdown");
            }
        }
        tracing::info!("Vote kernel stopped");
    }
}

/// Serialize and publish, logging failures. Delivery is best-effort.
async fn publish<T: Serialize + ?Sized>(publisher: &dyn Publisher, topic: &str, payload: &T) {
    let value = match serde_json::to_value(payload) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(topic, error = %err, "Failed to serialize payload");
            return;
        }
    };
    if let Err(err) = publisher.publish(topic, value).await {
        tracing::warn!(topic, error = %err, "Publish failed");
    }
}

/// Persist and publish every round event until shutdown.
async fn fan_out_events(
    mut rx: mpsc::UnboundedReceiver<KernelEvent>,
    collaborators: Collaborators,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => deliver(&collaborators, event).await,
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    while let Ok(event) = rx.try_recv() {
                        deliver(&collaborators, event).await;
                    }
                    break;
                }
            }
        }
    }
}

async fn deliver(collaborators: &Collaborators, event: KernelEvent) {
    if let Err(err) = collaborators.store.save_round_event(&event).await {
        tracing::warn!(kind = event.kind(), error = %err, "Failed to persist round event");
    }
    publish(&*collaborators.publisher, topics::ROUND_EVENTS, &event).await;
}

/// Log if an actor worker ends by panicking.
fn watch_worker<S: Send + 'static>(name: &'static str, worker: JoinHandle<S>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = worker.await {
            tracing::error!(actor = name, error = %err, "Actor worker panicked");
        }
    })
}
