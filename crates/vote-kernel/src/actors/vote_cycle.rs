//! VoteCycle: the tick-driven phase machine for a battle's ability vote.
//!
//! ```text
//! HOLD ──battle start──► WAIT_INTRO ──► VOTE_COOLDOWN ──► VOTE_ABILITY_RIGHT
//!                                            ▲                   │ window closes
//!                                            │     no votes ◄────┤
//!                                            │       │           │ votes: commit, rank
//!                                            │       ▼           ▼
//!                                            ├── NEXT_VOTE_WIN ─► LOCATION_SELECT
//!                                            │   (first vote wins)   │ pick / queue empty
//!                                            └───────────────────────┘
//! ```
//!
//! Phase deadlines are re-checked on every tick; the tick is the only thing
//! that moves the cycle on when a deadline passes. A vote arriving after the
//! deadline but before the tick is still counted. All state is owned by one
//! actor so votes, location picks and ticks never interleave.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use num_bigint::BigUint;
use num_traits::Zero;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::actor::ActorHandle;
use crate::broadcast::Debouncer;
use crate::clock::Clock;
use crate::collaborators::{AbilityCatalog, PaymentLedger, Presence};
use crate::config::PhaseConfig;
use crate::error::{VoteError, VoteResult};
use crate::messages::{
    AbilityRightRatio, AbilityTrigger, EventSink, KernelEvent, TriggerSource, VotePhase,
};
use crate::types::{AbilityCollection, BattleAbility, CellLocation, FactionId, HoldRef, UserId};
use crate::vote_price::VotePriceFeed;

/// Reason sent when every candidate in the winner queue has been exhausted.
pub const NO_PLAYER_REASON: &str = "cancelled, due to no one able to select the location";

/// Candidates for the location pick, best first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WinnerQueue {
    candidates: VecDeque<UserId>,
}

impl WinnerQueue {
    /// Rank users by total weight, heaviest first. Equal weights keep the
    /// order in which the users first voted.
    pub fn ranked(votes: impl IntoIterator<Item = (UserId, u64)>) -> Self {
        let mut totals: Vec<(UserId, u64)> = Vec::new();
        let mut index: HashMap<UserId, usize> = HashMap::new();
        for (user, weight) in votes {
            match index.get(&user) {
                Some(&i) => totals[i].1 = totals[i].1.saturating_add(weight),
                None => {
                    index.insert(user, totals.len());
                    totals.push((user, weight));
                }
            }
        }
        // Stable sort keeps first-vote order among equals.
        totals.sort_by(|a, b| b.1.cmp(&a.1));
        Self {
            candidates: totals.into_iter().map(|(user, _)| user).collect(),
        }
    }

    pub fn single(user: UserId) -> Self {
        Self {
            candidates: VecDeque::from([user]),
        }
    }

    pub fn front(&self) -> Option<UserId> {
        self.candidates.front().copied()
    }

    pub fn pop(&mut self) -> Option<UserId> {
        self.candidates.pop_front()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn clear(&mut self) {
        self.candidates.clear();
    }
}

/// A vote held during `VOTE_ABILITY_RIGHT`, committed when the window closes.
#[derive(Debug, Clone)]
struct Ballot {
    user: UserId,
    faction: FactionId,
    votes: u64,
    hold: HoldRef,
    amount: BigUint,
}

/// How a vote was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteReceipt {
    /// Held and counted toward the ability-right round.
    Counted { hold: HoldRef, amount: BigUint },
    /// Committed immediately; the voter won the next-vote-wins round.
    Won { amount: BigUint },
}

/// A read-only view of the cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleStatus {
    pub battle_id: Option<Uuid>,
    pub phase: VotePhase,
    pub phase_end: Option<DateTime<Utc>>,
    pub battle_ability: Option<BattleAbility>,
    pub winner: Option<UserId>,
    pub winner_faction: Option<FactionId>,
    pub queued_winners: usize,
    pub ballots: usize,
}

/// Services the cycle calls out to.
#[derive(Clone)]
pub struct CycleDeps {
    pub payments: Arc<dyn PaymentLedger>,
    pub presence: Arc<dyn Presence>,
    pub catalog: Arc<dyn AbilityCatalog>,
    pub clock: Arc<dyn Clock>,
    pub prices: Arc<VotePriceFeed>,
    pub events: EventSink,
    /// Receives per-faction vote shares while votes are open
    pub ratio: Option<Debouncer<Vec<AbilityRightRatio>>>,
}

/// Actor state owned by the cycle's worker.
pub struct VoteCycleState {
    battle_id: Option<Uuid>,
    factions: Vec<FactionId>,
    phase: VotePhase,
    phase_end: Option<DateTime<Utc>>,
    collection: Option<AbilityCollection>,
    next_cooldown_ms: u64,
    ballots: Vec<Ballot>,
    commit_attempts: u32,
    winners: WinnerQueue,
    winner_faction: Option<FactionId>,
    winner_spend: BigUint,
    config: PhaseConfig,
    payment_timeout: Duration,
    deps: CycleDeps,
}

impl std::fmt::Debug for VoteCycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoteCycleState")
            .field("battle_id", &self.battle_id)
            .field("phase", &self.phase)
            .field("phase_end", &self.phase_end)
            .field("ballots", &self.ballots.len())
            .field("winners", &self.winners.len())
            .finish()
    }
}

impl VoteCycleState {
    fn emit(&self, event: KernelEvent) {
        // Only fails once the kernel is shutting down.
        let _ = self.deps.events.send(event);
    }

    fn battle(&self) -> Uuid {
        self.battle_id.unwrap_or_default()
    }

    fn enter(&mut self, phase: VotePhase, duration_ms: u64) {
        let end = self.deps.clock.now() + chrono::Duration::milliseconds(duration_ms as i64);
        let previous = self.phase;
        self.phase = phase;
        self.phase_end = if phase == VotePhase::Hold {
            None
        } else {
            Some(end)
        };
        tracing::info!(
            battle_id = %self.battle(),
            from = %previous,
            to = %phase,
            duration_ms,
            "Vote phase changed"
        );
        self.emit(KernelEvent::PhaseChanged {
            battle_id: self.battle(),
            phase,
            phase_end: self.phase_end,
        });
    }

    fn status(&self) -> CycleStatus {
        CycleStatus {
            battle_id: self.battle_id,
            phase: self.phase,
            phase_end: self.phase_end,
            battle_ability: self.collection.as_ref().map(|c| c.battle_ability.clone()),
            winner: if self.phase == VotePhase::LocationSelect {
                self.winners.front()
            } else {
                None
            },
            winner_faction: self.winner_faction,
            queued_winners: self.winners.len(),
            ballots: self.ballots.len(),
        }
    }

    fn battle_started(&mut self, battle_id: Uuid, intro_elements: u32) -> VoteResult<()> {
        if self.phase != VotePhase::Hold {
            return Err(VoteError::PhaseClosed {
                phase: self.phase.to_string(),
            });
        }
        self.battle_id = Some(battle_id);
        self.next_cooldown_ms = self.config.cooldown_initial_ms;
        let intro_ms = u64::from(intro_elements) * self.config.intro_ms_per_element;
        self.enter(VotePhase::WaitIntro, intro_ms);
        Ok(())
    }

    async fn battle_ended(&mut self) -> usize {
        let holds: Vec<HoldRef> = self.ballots.iter().map(|b| b.hold.clone()).collect();
        if !holds.is_empty() {
            match timeout(
                self.payment_timeout,
                self.deps.payments.release_holds(&holds),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::error!(
                    battle_id = %self.battle(),
                    holds = ?holds,
                    error = %err,
                    "Failed to release vote holds at battle end"
                ),
                Err(_) => tracing::error!(
                    battle_id = %self.battle(),
                    holds = ?holds,
                    "Timed out releasing vote holds at battle end"
                ),
            }
        }

        self.ballots.clear();
        self.winners.clear();
        self.winner_faction = None;
        self.collection = None;
        self.commit_attempts = 0;
        self.enter(VotePhase::Hold, 0);
        self.battle_id = None;
        holds.len()
    }

    async fn tick(&mut self) -> VotePhase {
        if self.phase == VotePhase::Hold {
            return self.phase;
        }
        if let Some(end) = self.phase_end {
            if self.deps.clock.now() < end {
                return self.phase;
            }
        }

        match self.phase {
            VotePhase::Hold => {}
            VotePhase::WaitIntro => {
                let cooldown = self.config.cooldown_initial_ms;
                self.enter(VotePhase::VoteCooldown, cooldown);
            }
            VotePhase::VoteCooldown => self.open_vote().await,
            VotePhase::VoteAbilityRight => self.close_vote().await,
            VotePhase::NextVoteWin => {
                tracing::debug!(battle_id = %self.battle(), "Nobody claimed next vote win");
                let cooldown = self.config.cooldown_initial_ms;
                self.enter(VotePhase::VoteCooldown, cooldown);
            }
            VotePhase::LocationSelect => {
                if let Some(skipped) = self.winners.pop() {
                    tracing::info!(
                        battle_id = %self.battle(),
                        user = %skipped,
                        "Winner did not pick a location in time"
                    );
                }
                self.advance_winner().await;
            }
        }
        self.phase
    }

    async fn open_vote(&mut self) {
        match self.deps.catalog.next_collection(&self.factions).await {
            Ok(collection) => {
                tracing::info!(
                    battle_id = %self.battle(),
                    ability = %collection.battle_ability.label,
                    "Ability vote opened"
                );
                self.next_cooldown_ms = collection.battle_ability.cooldown_ms;
                self.collection = Some(collection);
                self.ballots.clear();
                self.commit_attempts = 0;
                self.winner_spend = BigUint::zero();
                let window = self.config.vote_ability_right_ms;
                self.enter(VotePhase::VoteAbilityRight, window);
                self.signal_ratio();
            }
            Err(err) => {
                tracing::warn!(
                    battle_id = %self.battle(),
                    error = %err,
                    "No ability collection available, extending cooldown"
                );
                let cooldown = self.config.cooldown_initial_ms;
                self.enter(VotePhase::VoteCooldown, cooldown);
            }
        }
    }

    async fn close_vote(&mut self) {
        let total = self
            .ballots
            .iter()
            .fold(0u64, |sum, b| sum.saturating_add(b.votes));
        if total == 0 {
            let window = self.config.next_vote_win_ms;
            self.enter(VotePhase::NextVoteWin, window);
            return;
        }

        let holds: Vec<HoldRef> = self.ballots.iter().map(|b| b.hold.clone()).collect();
        let committed = timeout(self.payment_timeout, self.deps.payments.commit_holds(&holds)).await;
        let failure = match committed {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => Some("timed out".to_string()),
        };
        if let Some(reason) = failure {
            self.commit_attempts += 1;
            tracing::warn!(
                battle_id = %self.battle(),
                attempt = self.commit_attempts,
                max_attempts = self.config.max_commit_attempts,
                holds = holds.len(),
                error = %reason,
                "Vote commit failed"
            );
            if self.commit_attempts >= self.config.max_commit_attempts {
                if let Err(err) = self.release(&holds).await {
                    tracing::error!(
                        battle_id = %self.battle(),
                        holds = ?holds,
                        error = %err,
                        "Failed to release vote holds after commit failures"
                    );
                }
                self.ballots.clear();
                self.emit(KernelEvent::Cancelled {
                    battle_id: self.battle(),
                    ability_id: self.ability_id(),
                    reason: "vote commit failed".to_string(),
                });
                let cooldown = self.config.cooldown_initial_ms;
                self.enter(VotePhase::VoteCooldown, cooldown);
            }
            // Otherwise stay in the phase; the next tick retries.
            return;
        }

        let mut faction_totals: Vec<(FactionId, u64)> = self
            .factions
            .iter()
            .map(|faction| {
                let votes = self
                    .ballots
                    .iter()
                    .filter(|b| b.faction == *faction)
                    .fold(0u64, |sum, b| sum.saturating_add(b.votes));
                (*faction, votes)
            })
            .collect();
        faction_totals.sort_by(|a, b| b.1.cmp(&a.1));

        let tied = faction_totals.len() > 1 && faction_totals[0].1 == faction_totals[1].1;
        if tied {
            tracing::info!(
                battle_id = %self.battle(),
                votes = faction_totals[0].1,
                "Top factions tied, no winner"
            );
            self.ballots.clear();
            self.emit(KernelEvent::Cancelled {
                battle_id: self.battle(),
                ability_id: self.ability_id(),
                reason: "tie between factions".to_string(),
            });
            let cooldown = self.next_cooldown_ms;
            self.enter(VotePhase::VoteCooldown, cooldown);
            return;
        }

        let winning = faction_totals[0].0;
        let ballots = std::mem::take(&mut self.ballots);
        self.winner_spend = ballots
            .iter()
            .filter(|b| b.faction == winning)
            .map(|b| b.amount.clone())
            .sum();
        self.winners = WinnerQueue::ranked(
            ballots
                .iter()
                .filter(|b| b.faction == winning)
                .map(|b| (b.user, b.votes)),
        );
        self.winner_faction = Some(winning);
        tracing::info!(
            battle_id = %self.battle(),
            faction_id = %winning,
            votes = faction_totals[0].1,
            candidates = self.winners.len(),
            "Ability right won"
        );
        self.advance_winner().await;
    }

    /// Offer the pick to the first reachable candidate, or cancel.
    async fn advance_winner(&mut self) {
        while let Some(user) = self.winners.front() {
            if self.deps.presence.is_online(user).await {
                let window = self.config.location_select_ms;
                self.enter(VotePhase::LocationSelect, window);
                if let (Some(faction_id), Some(select_until)) = (self.winner_faction, self.phase_end)
                {
                    self.emit(KernelEvent::WinnerAnnounced {
                        battle_id: self.battle(),
                        faction_id,
                        ability_id: self.ability_id().unwrap_or_default(),
                        user_id: user,
                        select_until,
                    });
                }
                return;
            }
            tracing::debug!(battle_id = %self.battle(), %user, "Skipping offline winner");
            self.winners.pop();
        }

        tracing::info!(battle_id = %self.battle(), "No winner left to pick a location");
        self.emit(KernelEvent::Cancelled {
            battle_id: self.battle(),
            ability_id: self.ability_id(),
            reason: NO_PLAYER_REASON.to_string(),
        });
        self.winner_faction = None;
        let cooldown = self.next_cooldown_ms;
        self.enter(VotePhase::VoteCooldown, cooldown);
    }

    fn ability_id(&self) -> Option<Uuid> {
        self.collection.as_ref().map(|c| c.battle_ability.id)
    }

    async fn release(&self, holds: &[HoldRef]) -> VoteResult<()> {
        match timeout(self.payment_timeout, self.deps.payments.release_holds(holds)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(VoteError::PaymentTimeout("release")),
        }
    }

    async fn cast_vote(
        &mut self,
        user: UserId,
        faction: FactionId,
        votes: u64,
    ) -> VoteResult<VoteReceipt> {
        if !self.phase.accepts_votes() {
            return Err(VoteError::PhaseClosed {
                phase: self.phase.to_string(),
            });
        }
        if !self.factions.contains(&faction) {
            return Err(VoteError::UnknownFaction(faction));
        }
        if votes == 0 {
            return Err(VoteError::InvalidAmount(votes.to_string()));
        }

        let price = self.deps.prices.current_price(faction).await?;
        let amount = price * votes;
        let reason = format!("battle_vote:{}", self.battle());
        let hold = match timeout(
            self.payment_timeout,
            self.deps.payments.hold(user, &amount, &reason),
        )
        .await
        {
            Ok(Ok(hold)) => hold,
            Ok(Err(err)) => {
                tracing::warn!(%user, %faction, votes, %amount, error = %err, "Vote hold failed");
                return Err(err.into());
            }
            Err(_) => {
                tracing::warn!(%user, %faction, votes, %amount, "Vote hold timed out");
                return Err(VoteError::PaymentTimeout("hold"));
            }
        };

        let volume = i64::try_from(votes).unwrap_or(i64::MAX);
        match self.phase {
            VotePhase::NextVoteWin => {
                let committed = timeout(
                    self.payment_timeout,
                    self.deps.payments.commit_holds(std::slice::from_ref(&hold)),
                )
                .await;
                let failure = match committed {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(VoteError::from(err)),
                    Err(_) => Some(VoteError::PaymentTimeout("commit")),
                };
                if let Some(err) = failure {
                    tracing::warn!(%user, %faction, hold = %hold, error = %err, "Next vote win commit failed");
                    let _ = self.release(std::slice::from_ref(&hold)).await;
                    return Err(err);
                }

                self.record_volume(faction, volume).await;
                self.winners = WinnerQueue::single(user);
                self.winner_faction = Some(faction);
                self.winner_spend = amount.clone();
                tracing::info!(battle_id = %self.battle(), %user, %faction, "Next vote won");
                let window = self.config.location_select_ms;
                self.enter(VotePhase::LocationSelect, window);
                if let Some(select_until) = self.phase_end {
                    self.emit(KernelEvent::WinnerAnnounced {
                        battle_id: self.battle(),
                        faction_id: faction,
                        ability_id: self.ability_id().unwrap_or_default(),
                        user_id: user,
                        select_until,
                    });
                }
                Ok(VoteReceipt::Won { amount })
            }
            _ => {
                self.ballots.push(Ballot {
                    user,
                    faction,
                    votes,
                    hold: hold.clone(),
                    amount: amount.clone(),
                });
                self.record_volume(faction, volume).await;
                self.signal_ratio();
                tracing::debug!(%user, %faction, votes, %amount, "Vote counted");
                Ok(VoteReceipt::Counted { hold, amount })
            }
        }
    }

    async fn record_volume(&self, faction: FactionId, volume: i64) {
        if let Err(err) = self.deps.prices.increase_faction_volume(faction, volume).await {
            tracing::warn!(%faction, error = %err, "Failed to record vote volume");
        }
    }

    fn signal_ratio(&self) {
        if let Some(ratio) = &self.deps.ratio {
            ratio.value(self.ratios());
        }
    }

    /// Whole-percent vote share per faction. Even split when nobody voted;
    /// rounding leftovers go to the leading faction.
    fn ratios(&self) -> Vec<AbilityRightRatio> {
        let count = self.factions.len() as u64;
        if count == 0 {
            return Vec::new();
        }
        let totals: Vec<u64> = self
            .factions
            .iter()
            .map(|f| {
                self.ballots
                    .iter()
                    .filter(|b| b.faction == *f)
                    .fold(0u64, |sum, b| sum.saturating_add(b.votes))
            })
            .collect();
        let sum: u128 = totals.iter().map(|&t| u128::from(t)).sum();

        let mut shares: Vec<u64> = if sum == 0 {
            vec![100 / count; self.factions.len()]
        } else {
            totals
                .iter()
                .map(|&t| (u128::from(t) * 100 / sum) as u64)
                .collect()
        };
        let leftover = 100 - shares.iter().sum::<u64>();
        if let Some(lead) = (0..shares.len()).max_by_key(|&i| (totals[i], std::cmp::Reverse(i))) {
            shares[lead] += leftover;
        }

        self.factions
            .iter()
            .zip(shares)
            .map(|(faction_id, percent)| AbilityRightRatio {
                faction_id: *faction_id,
                percent: percent as u32,
            })
            .collect()
    }

    fn select_location(&mut self, user: UserId, location: CellLocation) -> VoteResult<AbilityTrigger> {
        if self.phase != VotePhase::LocationSelect {
            return Err(VoteError::PhaseClosed {
                phase: self.phase.to_string(),
            });
        }
        if self.winners.front() != Some(user) {
            return Err(VoteError::NotWinner(user));
        }

        let faction_id = self.winner_faction.unwrap_or_default();
        let ability_id = self
            .collection
            .as_ref()
            .map(|c| {
                c.faction_abilities
                    .get(&faction_id)
                    .map(|a| a.id)
                    .unwrap_or(c.battle_ability.id)
            })
            .unwrap_or_default();
        let trigger = AbilityTrigger {
            source: TriggerSource::Vote,
            faction_id,
            ability_id,
            user_id: Some(user),
            location: Some(location),
            price: std::mem::take(&mut self.winner_spend),
            at: self.deps.clock.now(),
        };
        tracing::info!(
            battle_id = %self.battle(),
            %user,
            %faction_id,
            %location,
            "Location selected, ability triggered"
        );
        self.emit(KernelEvent::AbilityTriggered {
            battle_id: self.battle_id,
            trigger: trigger.clone(),
        });

        self.winners.clear();
        self.winner_faction = None;
        let cooldown = self.next_cooldown_ms;
        self.enter(VotePhase::VoteCooldown, cooldown);
        Ok(trigger)
    }

    async fn user_disconnected(&mut self, user: UserId) -> bool {
        if self.phase != VotePhase::LocationSelect || self.winners.front() != Some(user) {
            return false;
        }
        tracing::info!(battle_id = %self.battle(), %user, "Current winner disconnected");
        self.winners.pop();
        self.advance_winner().await;
        true
    }
}

/// Handle to the vote cycle actor.
#[derive(Debug, Clone)]
pub struct VoteCycle {
    handle: ActorHandle<VoteCycleState>,
}

impl VoteCycle {
    /// Spawn the cycle in `HOLD`.
    pub fn spawn(
        factions: Vec<FactionId>,
        config: PhaseConfig,
        payment_timeout: Duration,
        deps: CycleDeps,
    ) -> (Self, JoinHandle<VoteCycleState>) {
        let state = VoteCycleState {
            battle_id: None,
            factions,
            phase: VotePhase::Hold,
            phase_end: None,
            collection: None,
            next_cooldown_ms: config.cooldown_initial_ms,
            ballots: Vec::new(),
            commit_attempts: 0,
            winners: WinnerQueue::default(),
            winner_faction: None,
            winner_spend: BigUint::zero(),
            config,
            payment_timeout,
            deps,
        };
        let (handle, worker) = ActorHandle::spawn("VoteCycle", state);
        (Self { handle }, worker)
    }

    /// Leave `HOLD`: intro, then the first cooldown.
    pub async fn battle_started(&self, battle_id: Uuid, intro_elements: u32) -> VoteResult<()> {
        self.handle
            .ask(move |state| state.battle_started(battle_id, intro_elements))
            .await?
    }

    /// Return to `HOLD`, releasing uncommitted vote holds. Returns holds released.
    pub async fn battle_ended(&self) -> VoteResult<usize> {
        Ok(self
            .handle
            .ask_async(|state: &mut VoteCycleState| async move { state.battle_ended().await }.boxed())
            .await?)
    }

    /// Re-evaluate the current phase deadline. Returns the phase afterwards.
    pub async fn tick(&self) -> VoteResult<VotePhase> {
        Ok(self
            .handle
            .ask_async(|state: &mut VoteCycleState| async move { state.tick().await }.boxed())
            .await?)
    }

    pub async fn cast_vote(
        &self,
        user: UserId,
        faction: FactionId,
        votes: u64,
    ) -> VoteResult<VoteReceipt> {
        self.handle
            .ask_async(move |state: &mut VoteCycleState| {
                async move { state.cast_vote(user, faction, votes).await }.boxed()
            })
            .await?
    }

    pub async fn select_location(
        &self,
        user: UserId,
        location: CellLocation,
    ) -> VoteResult<AbilityTrigger> {
        self.handle
            .ask(move |state| state.select_location(user, location))
            .await?
    }

    /// Returns true if the user was the current winner and has been skipped.
    pub async fn user_disconnected(&self, user: UserId) -> VoteResult<bool> {
        Ok(self
            .handle
            .ask_async(move |state: &mut VoteCycleState| {
                async move { state.user_disconnected(user).await }.boxed()
            })
            .await?)
    }

    pub async fn status(&self) -> VoteResult<CycleStatus> {
        Ok(self.handle.ask(|state| state.status()).await?)
    }

    pub async fn ratios(&self) -> VoteResult<Vec<AbilityRightRatio>> {
        Ok(self.handle.ask(|state| state.ratios()).await?)
    }

    pub fn stop(&self) -> VoteResult<()> {
        Ok(self.handle.stop()?)
    }
}
