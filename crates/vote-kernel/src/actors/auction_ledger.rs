//! AuctionLedger: per-faction Dutch-auction state for faction abilities.
//!
//! Each ability carries a target price that decays every tick until the
//! faction's contributions reach it. Crossing the target commits every
//! pending hold as one batch, fires the ability and reprices it:
//!
//! ```text
//! new_target = max(target × 2, max_target / 2)
//! max_target = new_target
//! contribution = 0
//! ```
//!
//! The ledger is owned by one actor, so contributions, decay ticks and
//! snapshots for a faction are applied strictly one at a time. Payment calls
//! are the only awaits inside a command and each carries its own timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use num_bigint::BigUint;
use num_traits::Zero;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::actor::{ActorFault, ActorHandle};
use crate::clock::Clock;
use crate::collaborators::{PaymentLedger, RoundSnapshot, StoredPrice};
use crate::config::AuctionConfig;
use crate::currency::{scale, to_smallest_unit};
use crate::error::{VoteError, VoteResult};
use crate::messages::{AbilityTrigger, EventSink, KernelEvent, TargetPriceEntry, TriggerSource};
use crate::types::{AbilityId, FactionAbility, FactionId, HoldRef, UserId};

/// A hold counted toward an ability's contribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingHold {
    pub hold: HoldRef,
    pub user: UserId,
    pub amount: BigUint,
}

/// Auction state for one (faction, ability).
#[derive(Debug, Clone)]
pub struct FactionAuctionEntry {
    pub ability: FactionAbility,
    pub target_price: BigUint,
    pub max_target_price: BigUint,
    pub current_contribution: BigUint,
    pub pending_holds: Vec<PendingHold>,
    last_contributor: Option<UserId>,
    triggered_since_snapshot: bool,
}

impl FactionAuctionEntry {
    fn new(ability: FactionAbility, floor: &BigUint) -> Self {
        let target = if ability.initial_price.is_zero() {
            floor.clone()
        } else {
            ability.initial_price.clone()
        };
        Self {
            ability,
            max_target_price: target.clone(),
            target_price: target,
            current_contribution: BigUint::zero(),
            pending_holds: Vec::new(),
            last_contributor: None,
            triggered_since_snapshot: false,
        }
    }

    fn hold_refs(&self) -> Vec<HoldRef> {
        self.pending_holds.iter().map(|p| p.hold.clone()).collect()
    }
}

/// Result of a contribution that was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContributionOutcome {
    /// Held and counted; the target has not been reached.
    Pending {
        hold: HoldRef,
        current_contribution: BigUint,
        target_price: BigUint,
    },
    /// Held, committed with every other pending hold, and the ability fired.
    Triggered {
        trigger: AbilityTrigger,
        new_target_price: BigUint,
    },
}

/// Outcome of draining a ledger at battle end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub released_holds: usize,
    pub released_amount: BigUint,
}

/// Actor state owned by the ledger's worker.
pub struct AuctionLedgerState {
    battle_id: Option<Uuid>,
    faction_id: FactionId,
    entries: HashMap<AbilityId, FactionAuctionEntry>,
    config: AuctionConfig,
    payments: Arc<dyn PaymentLedger>,
    clock: Arc<dyn Clock>,
    events: EventSink,
    /// Set by the first drain; no new holds after that
    closed: bool,
}

impl std::fmt::Debug for AuctionLedgerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuctionLedgerState")
            .field("faction_id", &self.faction_id)
            .field("abilities", &self.entries.len())
            .finish()
    }
}

impl AuctionLedgerState {
    fn payment_timeout(&self) -> Duration {
        self.config.payment_timeout()
    }

    fn entry_mut(&mut self, ability_id: AbilityId) -> VoteResult<&mut FactionAuctionEntry> {
        self.entries
            .get_mut(&ability_id)
            .ok_or(VoteError::UnknownAbility(ability_id))
    }

    async fn release(&self, holds: &[HoldRef], context: &str) -> VoteResult<()> {
        if holds.is_empty() {
            return Ok(());
        }
        match timeout(self.payment_timeout(), self.payments.release_holds(holds)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                tracing::error!(
                    faction_id = %self.faction_id,
                    holds = ?holds,
                    error = %err,
                    context,
                    "Failed to release holds"
                );
                Err(err.into())
            }
            Err(_) => {
                tracing::error!(
                    faction_id = %self.faction_id,
                    holds = ?holds,
                    context,
                    "Timed out releasing holds"
                );
                Err(VoteError::PaymentTimeout("release"))
            }
        }
    }

    async fn contribute(
        &mut self,
        user: UserId,
        ability_id: AbilityId,
        amount: BigUint,
    ) -> Result<VoteResult<ContributionOutcome>, ActorFault> {
        if self.closed {
            return Ok(Err(VoteError::LedgerClosed(self.faction_id)));
        }
        if amount.is_zero() {
            return Ok(Err(VoteError::InvalidAmount(amount.to_string())));
        }
        if !self.entries.contains_key(&ability_id) {
            return Ok(Err(VoteError::UnknownAbility(ability_id)));
        }

        let reason = format!("ability_contribution:{}:{}", self.faction_id, ability_id);
        let hold = match timeout(
            self.payment_timeout(),
            self.payments.hold(user, &amount, &reason),
        )
        .await
        {
            Ok(Ok(hold)) => hold,
            Ok(Err(err)) => {
                tracing::warn!(
                    faction_id = %self.faction_id,
                    %ability_id,
                    %user,
                    %amount,
                    error = %err,
                    "Contribution hold failed"
                );
                return Ok(Err(err.into()));
            }
            Err(_) => {
                tracing::warn!(
                    faction_id = %self.faction_id,
                    %ability_id,
                    %user,
                    %amount,
                    "Contribution hold timed out"
                );
                return Ok(Err(VoteError::PaymentTimeout("hold")));
            }
        };

        let Some(entry) = self.entries.get_mut(&ability_id) else {
            return Ok(Err(VoteError::UnknownAbility(ability_id)));
        };
        entry.pending_holds.push(PendingHold {
            hold: hold.clone(),
            user,
            amount: amount.clone(),
        });
        entry.current_contribution += &amount;
        let previous_contributor = entry.last_contributor.replace(user);

        if entry.current_contribution < entry.target_price {
            tracing::debug!(
                faction_id = %self.faction_id,
                %ability_id,
                %user,
                %amount,
                contribution = %entry.current_contribution,
                target = %entry.target_price,
                "Contribution held"
            );
            return Ok(Ok(ContributionOutcome::Pending {
                hold,
                current_contribution: entry.current_contribution.clone(),
                target_price: entry.target_price.clone(),
            }));
        }

        match self.trigger(ability_id, TriggerSource::Contribution).await? {
            Ok(trigger) => {
                let new_target_price = self
                    .entries
                    .get(&ability_id)
                    .map(|e| e.target_price.clone())
                    .unwrap_or_default();
                Ok(Ok(ContributionOutcome::Triggered {
                    trigger,
                    new_target_price,
                }))
            }
            Err(err) => {
                // Undo only this contribution; earlier holds stay pending.
                if let Ok(entry) = self.entry_mut(ability_id) {
                    entry.pending_holds.retain(|p| p.hold != hold);
                    entry.current_contribution -= &amount;
                    entry.last_contributor = previous_contributor;
                }
                // A failed release is logged inside; the commit error is what
                // the caller needs to see.
                let _ = self.release(&[hold], "contribution rollback").await;
                Ok(Err(err))
            }
        }
    }

    /// Commit the ability's pending holds and reprice it.
    ///
    /// The outer result is a broken invariant; the inner one a payment failure
    /// that leaves the entry untouched.
    async fn trigger(
        &mut self,
        ability_id: AbilityId,
        source: TriggerSource,
    ) -> Result<VoteResult<AbilityTrigger>, ActorFault> {
        let (holds, paid) = match self.entries.get(&ability_id) {
            Some(entry) => (entry.hold_refs(), entry.current_contribution.clone()),
            None => return Ok(Err(VoteError::UnknownAbility(ability_id))),
        };

        let committed = timeout(self.payment_timeout(), self.payments.commit_holds(&holds)).await;
        let failure: Option<VoteError> = match committed {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.into()),
            Err(_) => Some(VoteError::PaymentTimeout("commit")),
        };
        if let Some(err) = failure {
            tracing::warn!(
                faction_id = %self.faction_id,
                %ability_id,
                holds = ?holds,
                amount = %paid,
                error = %err,
                "Trigger commit failed, ability not fired"
            );
            return Ok(Err(err));
        }

        let faction_id = self.faction_id;
        let now = self.clock.now();
        let Some(entry) = self.entries.get_mut(&ability_id) else {
            return Ok(Err(VoteError::UnknownAbility(ability_id)));
        };

        let old_max = entry.max_target_price.clone();
        let min_target = &old_max / 2u32;
        let doubled = &entry.target_price * 2u32;
        let new_target = doubled.max(min_target.clone());
        if new_target.is_zero() || new_target < min_target {
            return Err(ActorFault::new(format!(
                "ability {ability_id} repriced to {new_target} (max {old_max})"
            )));
        }

        entry.target_price = new_target.clone();
        entry.max_target_price = new_target.clone();
        entry.current_contribution = BigUint::zero();
        entry.pending_holds.clear();
        entry.triggered_since_snapshot = true;

        let trigger = AbilityTrigger {
            source,
            faction_id,
            ability_id,
            user_id: entry.last_contributor,
            location: None,
            price: paid,
            at: now,
        };

        tracing::info!(
            %faction_id,
            %ability_id,
            label = %entry.ability.label,
            user = ?trigger.user_id,
            paid = %trigger.price,
            new_target = %new_target,
            ?source,
            "Ability triggered"
        );
        let _ = self.events.send(KernelEvent::AbilityTriggered {
            battle_id: self.battle_id,
            trigger: trigger.clone(),
        });
        Ok(Ok(trigger))
    }

    async fn decay_tick(&mut self) -> Result<Vec<AbilityTrigger>, ActorFault> {
        let floor = self.config.floor_price.clone();
        let mut crossed = Vec::new();

        for (ability_id, entry) in self.entries.iter_mut() {
            if entry.target_price > floor {
                let decayed = scale(
                    &entry.target_price,
                    self.config.decay_numerator,
                    self.config.decay_denominator,
                );
                entry.target_price = decayed.max(floor.clone());
            }
            if entry.target_price.is_zero() {
                return Err(ActorFault::new(format!(
                    "ability {ability_id} decayed to zero"
                )));
            }
            if !entry.current_contribution.is_zero()
                && entry.current_contribution >= entry.target_price
            {
                crossed.push(*ability_id);
            }
        }

        let mut triggers = Vec::new();
        for ability_id in crossed {
            // A failed commit leaves the holds pending for the next attempt.
            if let Ok(trigger) = self.trigger(ability_id, TriggerSource::Decay).await? {
                triggers.push(trigger);
            }
        }
        Ok(triggers)
    }

    fn snapshot(&mut self) -> Vec<TargetPriceEntry> {
        let mut entries: Vec<TargetPriceEntry> = self
            .entries
            .iter_mut()
            .map(|(ability_id, entry)| {
                let triggered = std::mem::take(&mut entry.triggered_since_snapshot);
                TargetPriceEntry {
                    ability_id: *ability_id,
                    target_price: entry.target_price.clone(),
                    current_contribution: entry.current_contribution.clone(),
                    triggered,
                }
            })
            .collect();
        entries.sort_by_key(|e| e.ability_id);
        entries
    }

    fn seed(&mut self, snapshot: &RoundSnapshot) -> usize {
        let mut seeded = 0;
        for (ability_id, stored) in &snapshot.prices {
            if let Some(entry) = self.entries.get_mut(ability_id) {
                if stored.target_price.is_zero() {
                    continue;
                }
                entry.target_price = stored.target_price.clone();
                entry.max_target_price = stored.max_target_price.clone().max(stored.target_price.clone());
                seeded += 1;
            }
        }
        seeded
    }

    fn stored_prices(&self) -> RoundSnapshot {
        RoundSnapshot {
            faction_id: self.faction_id,
            prices: self
                .entries
                .iter()
                .map(|(id, e)| {
                    (
                        *id,
                        StoredPrice {
                            target_price: e.target_price.clone(),
                            max_target_price: e.max_target_price.clone(),
                        },
                    )
                })
                .collect(),
        }
    }

    async fn drain(&mut self) -> VoteResult<DrainReport> {
        self.closed = true;
        let holds: Vec<HoldRef> = self.entries.values().flat_map(|e| e.hold_refs()).collect();
        let amount: BigUint = self
            .entries
            .values()
            .flat_map(|e| e.pending_holds.iter().map(|p| p.amount.clone()))
            .sum();

        // On failure the entries keep their holds so the drain can be retried.
        self.release(&holds, "drain").await?;

        for entry in self.entries.values_mut() {
            entry.pending_holds.clear();
            entry.current_contribution = BigUint::zero();
            entry.last_contributor = None;
        }
        tracing::info!(
            faction_id = %self.faction_id,
            released = holds.len(),
            %amount,
            "Auction ledger drained"
        );
        Ok(DrainReport {
            released_holds: holds.len(),
            released_amount: amount,
        })
    }
}

/// Handle to a faction's auction ledger actor.
#[derive(Debug, Clone)]
pub struct AuctionLedger {
    faction_id: FactionId,
    decimals: u32,
    handle: ActorHandle<AuctionLedgerState>,
}

impl AuctionLedger {
    /// Spawn a ledger for `abilities`, all belonging to `faction_id`.
    pub fn spawn(
        battle_id: Option<Uuid>,
        faction_id: FactionId,
        abilities: Vec<FactionAbility>,
        config: AuctionConfig,
        payments: Arc<dyn PaymentLedger>,
        clock: Arc<dyn Clock>,
        events: EventSink,
    ) -> (Self, JoinHandle<AuctionLedgerState>) {
        let entries = abilities
            .into_iter()
            .map(|a| (a.id, FactionAuctionEntry::new(a, &config.floor_price)))
            .collect();
        let decimals = config.currency_decimals;
        let state = AuctionLedgerState {
            battle_id,
            faction_id,
            entries,
            config,
            payments,
            clock,
            events,
            closed: false,
        };
        let (handle, worker) = ActorHandle::spawn(format!("AuctionLedger[{faction_id}]"), state);
        (
            Self {
                faction_id,
                decimals,
                handle,
            },
            worker,
        )
    }

    pub fn faction_id(&self) -> FactionId {
        self.faction_id
    }

    /// Contribute a decimal amount of whole currency units (e.g. `"2.5"`).
    pub async fn contribute(
        &self,
        user: UserId,
        ability_id: AbilityId,
        amount: &str,
    ) -> VoteResult<ContributionOutcome> {
        let units = to_smallest_unit(amount, self.decimals)?;
        self.contribute_units(user, ability_id, units).await
    }

    /// Contribute an amount already in smallest units.
    pub async fn contribute_units(
        &self,
        user: UserId,
        ability_id: AbilityId,
        amount: BigUint,
    ) -> VoteResult<ContributionOutcome> {
        self.handle
            .ask_checked(move |state: &mut AuctionLedgerState| {
                async move { state.contribute(user, ability_id, amount).await }.boxed()
            })
            .await?
    }

    /// Decay every target price once. Returns abilities fired by the decay.
    pub async fn decay_tick(&self) -> VoteResult<Vec<AbilityTrigger>> {
        Ok(self
            .handle
            .ask_checked(|state: &mut AuctionLedgerState| {
                async move { state.decay_tick().await }.boxed()
            })
            .await?)
    }

    /// Current target prices. Clears each ability's `triggered` flag.
    pub async fn snapshot(&self) -> VoteResult<Vec<TargetPriceEntry>> {
        Ok(self.handle.ask(|state| state.snapshot()).await?)
    }

    /// Restore target prices from a stored round. Returns abilities seeded.
    pub async fn seed(&self, snapshot: RoundSnapshot) -> VoteResult<usize> {
        Ok(self.handle.ask(move |state| state.seed(&snapshot)).await?)
    }

    /// Current prices in storable form.
    pub async fn stored_prices(&self) -> VoteResult<RoundSnapshot> {
        Ok(self.handle.ask(|state| state.stored_prices()).await?)
    }

    /// Release every pending hold and zero all contributions. The ledger
    /// refuses contributions from then on, even if the release fails.
    pub async fn drain(&self) -> VoteResult<DrainReport> {
        self.handle
            .ask_async(|state: &mut AuctionLedgerState| async move { state.drain().await }.boxed())
            .await?
    }

    /// Stop the actor after the commands already queued.
    pub fn stop(&self) -> VoteResult<()> {
        Ok(self.handle.stop()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::PaymentError;
    use crate::memory::MemoryPaymentLedger;
    use tokio::sync::mpsc;

    struct Fixture {
        ledger: AuctionLedger,
        payments: Arc<MemoryPaymentLedger>,
        events: mpsc::UnboundedReceiver<KernelEvent>,
        ability: AbilityId,
        faction: FactionId,
    }

    fn fixture(initial: u32, floor: u32) -> Fixture {
        let faction = Uuid::new_v4();
        let ability = FactionAbility {
            id: Uuid::new_v4(),
            faction_id: faction,
            label: "ROBOT_DOGS".into(),
            initial_price: BigUint::from(initial),
        };
        let config = AuctionConfig {
            floor_price: BigUint::from(floor),
            ..AuctionConfig::default()
        };
        let payments = Arc::new(MemoryPaymentLedger::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let (ledger, _worker) = AuctionLedger::spawn(
            None,
            faction,
            vec![ability.clone()],
            config,
            payments.clone(),
            Arc::new(ManualClock::default()),
            tx,
        );
        Fixture {
            ledger,
            payments,
            events: rx,
            ability: ability.id,
            faction,
        }
    }

    fn funded(f: &Fixture, amount: u32) -> UserId {
        let user = Uuid::new_v4();
        f.payments.credit(user, BigUint::from(amount));
        user
    }

    #[tokio::test]
    async fn test_contributions_below_target_stay_pending() {
        let f = fixture(1000, 1);
        let user = funded(&f, 1000);

        let outcome = f
            .ledger
            .contribute_units(user, f.ability, BigUint::from(400u32))
            .await
            .unwrap();
        match outcome {
            ContributionOutcome::Pending {
                current_contribution,
                target_price,
                ..
            } => {
                assert_eq!(current_contribution, BigUint::from(400u32));
                assert_eq!(target_price, BigUint::from(1000u32));
            }
            other => panic!("expected pending, got {other:?}"),
        }
        assert_eq!(f.payments.outstanding_holds(), 1);
    }

    #[tokio::test]
    async fn test_crossing_target_commits_and_doubles() {
        let mut f = fixture(1000, 1);
        let a = funded(&f, 600);
        let b = funded(&f, 600);

        f.ledger
            .contribute_units(a, f.ability, BigUint::from(600u32))
            .await
            .unwrap();
        let outcome = f
            .ledger
            .contribute_units(b, f.ability, BigUint::from(500u32))
            .await
            .unwrap();

        let ContributionOutcome::Triggered {
            trigger,
            new_target_price,
        } = outcome
        else {
            panic!("expected trigger");
        };
        assert_eq!(new_target_price, BigUint::from(2000u32));
        assert_eq!(trigger.user_id, Some(b));
        assert_eq!(trigger.price, BigUint::from(1100u32));
        assert_eq!(trigger.faction_id, f.faction);
        assert_eq!(f.payments.committed_total(), BigUint::from(1100u32));
        assert_eq!(f.payments.outstanding_holds(), 0);

        let snapshot = f.ledger.snapshot().await.unwrap();
        assert!(snapshot[0].triggered);
        assert!(snapshot[0].current_contribution.is_zero());
        assert!(!f.ledger.snapshot().await.unwrap()[0].triggered);

        let event = f.events.recv().await.unwrap();
        assert_eq!(event.kind(), "ability_triggered");
    }

    #[tokio::test]
    async fn test_trigger_never_reprices_below_half_peak() {
        let f = fixture(1000, 1);
        let user = funded(&f, 1_000_000);

        // Trigger at 1000 -> 2000, decay far below 1000, trigger again.
        f.ledger
            .contribute_units(user, f.ability, BigUint::from(1000u32))
            .await
            .unwrap();
        for _ in 0..60 {
            f.ledger.decay_tick().await.unwrap();
        }
        let decayed = f.ledger.snapshot().await.unwrap()[0].target_price.clone();
        assert!(decayed < BigUint::from(1000u32));

        let outcome = f
            .ledger
            .contribute_units(user, f.ability, decayed.clone())
            .await
            .unwrap();
        let ContributionOutcome::Triggered {
            new_target_price, ..
        } = outcome
        else {
            panic!("expected trigger");
        };
        assert_eq!(new_target_price, (decayed * 2u32).max(BigUint::from(1000u32)));
        assert!(new_target_price >= BigUint::from(1000u32));
    }

    #[tokio::test]
    async fn test_decay_is_monotone_and_floored() {
        let f = fixture(1000, 900);
        let mut last = BigUint::from(1000u32);
        for _ in 0..20 {
            f.ledger.decay_tick().await.unwrap();
            let price = f.ledger.snapshot().await.unwrap()[0].target_price.clone();
            assert!(price <= last);
            assert!(price >= BigUint::from(900u32));
            last = price;
        }
        assert_eq!(last, BigUint::from(900u32));
    }

    #[tokio::test]
    async fn test_decay_crossing_triggers_for_last_contributor() {
        let f = fixture(1000, 1);
        let early = funded(&f, 500);
        let late = funded(&f, 500);
        f.ledger
            .contribute_units(early, f.ability, BigUint::from(490u32))
            .await
            .unwrap();
        f.ledger
            .contribute_units(late, f.ability, BigUint::from(490u32))
            .await
            .unwrap();

        // 1000 decays to 977, below the 980 already contributed.
        let triggers = f.ledger.decay_tick().await.unwrap();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].source, TriggerSource::Decay);
        assert_eq!(triggers[0].user_id, Some(late));
        assert_eq!(f.payments.committed_total(), BigUint::from(980u32));
    }

    #[tokio::test]
    async fn test_commit_failure_rolls_back_only_the_crossing_contribution() {
        let f = fixture(1000, 1);
        let a = funded(&f, 600);
        let b = funded(&f, 600);
        f.ledger
            .contribute_units(a, f.ability, BigUint::from(600u32))
            .await
            .unwrap();

        f.payments.fail_next_commits(1);
        let err = f
            .ledger
            .contribute_units(b, f.ability, BigUint::from(600u32))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        // b got the hold back; a's hold is still pending.
        assert_eq!(f.payments.balance(b), BigUint::from(600u32));
        assert_eq!(f.payments.outstanding_holds(), 1);
        let snapshot = f.ledger.snapshot().await.unwrap();
        assert_eq!(snapshot[0].current_contribution, BigUint::from(600u32));
        assert_eq!(snapshot[0].target_price, BigUint::from(1000u32));

        // Retrying succeeds.
        let outcome = f
            .ledger
            .contribute_units(b, f.ability, BigUint::from(600u32))
            .await
            .unwrap();
        assert!(matches!(outcome, ContributionOutcome::Triggered { .. }));
    }

    #[tokio::test]
    async fn test_rolled_back_contributor_is_not_credited_by_decay() {
        let f = fixture(1000, 1);
        let alice = funded(&f, 600);
        let bob = funded(&f, 600);
        f.ledger
            .contribute_units(alice, f.ability, BigUint::from(600u32))
            .await
            .unwrap();

        f.payments.fail_next_commits(1);
        f.ledger
            .contribute_units(bob, f.ability, BigUint::from(600u32))
            .await
            .unwrap_err();

        let mut fired = Vec::new();
        for _ in 0..60 {
            fired.extend(f.ledger.decay_tick().await.unwrap());
            if !fired.is_empty() {
                break;
            }
        }
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].source, TriggerSource::Decay);
        assert_eq!(fired[0].user_id, Some(alice));
        assert_eq!(fired[0].price, BigUint::from(600u32));
        assert!(f.payments.spent_by(bob).is_zero());
    }

    #[tokio::test]
    async fn test_drained_ledger_refuses_contributions() {
        let f = fixture(1000, 1);
        let user = funded(&f, 1000);
        f.ledger
            .contribute_units(user, f.ability, BigUint::from(100u32))
            .await
            .unwrap();

        let report = f.ledger.drain().await.unwrap();
        assert_eq!(report.released_holds, 1);

        let err = f
            .ledger
            .contribute_units(user, f.ability, BigUint::from(100u32))
            .await
            .unwrap_err();
        assert!(matches!(err, VoteError::LedgerClosed(faction) if faction == f.faction));
        assert_eq!(f.payments.outstanding_holds(), 0);
        assert_eq!(f.payments.balance(user), BigUint::from(1000u32));
    }

    #[tokio::test]
    async fn test_invalid_contributions_leave_state_untouched() {
        let f = fixture(1000, 1);
        let user = funded(&f, 1000);

        let err = f
            .ledger
            .contribute_units(user, Uuid::new_v4(), BigUint::from(10u32))
            .await
            .unwrap_err();
        assert!(matches!(err, VoteError::UnknownAbility(_)));

        let err = f.ledger.contribute(user, f.ability, "-3").await.unwrap_err();
        assert!(matches!(err, VoteError::InvalidAmount(_)));

        let poor = Uuid::new_v4();
        let err = f
            .ledger
            .contribute_units(poor, f.ability, BigUint::from(10u32))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VoteError::Payment(PaymentError::InsufficientFunds { .. })
        ));

        assert_eq!(f.payments.outstanding_holds(), 0);
        assert!(f.ledger.snapshot().await.unwrap()[0]
            .current_contribution
            .is_zero());
    }

    #[tokio::test]
    async fn test_failed_hold_counts_nothing() {
        let f = fixture(1000, 1);
        let user = funded(&f, 1000);
        f.payments.fail_next_holds(1);

        let err = f
            .ledger
            .contribute_units(user, f.ability, BigUint::from(10u32))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.payments.outstanding_holds(), 0);
        assert!(f.ledger.snapshot().await.unwrap()[0]
            .current_contribution
            .is_zero());

        f.ledger
            .contribute_units(user, f.ability, BigUint::from(10u32))
            .await
            .unwrap();
        assert_eq!(f.payments.outstanding_holds(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_timeout_surfaces_error() {
        let f = fixture(1000, 1);
        let user = funded(&f, 1000);
        f.payments.set_latency(Duration::from_secs(60));

        let err = f
            .ledger
            .contribute_units(user, f.ability, BigUint::from(10u32))
            .await
            .unwrap_err();
        assert!(matches!(err, VoteError::PaymentTimeout("hold")));
    }

    #[tokio::test]
    async fn test_drain_releases_pending_holds() {
        let f = fixture(1000, 1);
        let user = funded(&f, 1000);
        for _ in 0..3 {
            f.ledger
                .contribute_units(user, f.ability, BigUint::from(100u32))
                .await
                .unwrap();
        }

        f.payments.fail_next_releases(1);
        assert!(f.ledger.drain().await.is_err());
        assert_eq!(f.payments.outstanding_holds(), 3);

        let report = f.ledger.drain().await.unwrap();
        assert_eq!(report.released_holds, 3);
        assert_eq!(report.released_amount, BigUint::from(300u32));
        assert_eq!(f.payments.balance(user), BigUint::from(1000u32));
        assert!(f.ledger.snapshot().await.unwrap()[0]
            .current_contribution
            .is_zero());
    }

    #[tokio::test]
    async fn test_seed_restores_stored_prices() {
        let f = fixture(1000, 1);
        let mut prices = HashMap::new();
        prices.insert(
            f.ability,
            StoredPrice {
                target_price: BigUint::from(3000u32),
                max_target_price: BigUint::from(4000u32),
            },
        );
        let seeded = f
            .ledger
            .seed(RoundSnapshot {
                faction_id: f.faction,
                prices,
            })
            .await
            .unwrap();
        assert_eq!(seeded, 1);

        let stored = f.ledger.stored_prices().await.unwrap();
        let price = &stored.prices[&f.ability];
        assert_eq!(price.target_price, BigUint::from(3000u32));
        assert_eq!(price.max_target_price, BigUint::from(4000u32));
    }
}
