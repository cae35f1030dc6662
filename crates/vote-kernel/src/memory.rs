//! In-memory collaborators for tests and the simulator.
//!
//! These keep everything in process and expose knobs for injecting failures
//! (rejected commits, slow calls, offline users) so the kernel's error paths
//! can be exercised without a real payment service or database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use num_bigint::BigUint;
use num_traits::Zero;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::collaborators::{AbilityCatalog, PaymentLedger, Presence, Publisher, RoundSnapshot, RoundStore};
use crate::error::PaymentError;
use crate::messages::KernelEvent;
use crate::types::{
    AbilityCollection, BattleAbility, FactionAbility, FactionId, HoldRef, UserId,
};

#[derive(Debug, Clone)]
struct HeldFunds {
    user: UserId,
    amount: BigUint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Committed,
    Released,
}

/// Balances and holds kept in memory.
///
/// Commit and release are idempotent per hold reference: settling a hold a
/// second time the same way succeeds without effect.
#[derive(Debug, Default)]
pub struct MemoryPaymentLedger {
    balances: DashMap<UserId, BigUint>,
    holds: DashMap<HoldRef, HeldFunds>,
    settled: DashMap<HoldRef, Settlement>,
    spent: DashMap<UserId, BigUint>,
    fail_holds: AtomicU32,
    fail_commits: AtomicU32,
    fail_releases: AtomicU32,
    latency_ms: AtomicU64,
}

impl MemoryPaymentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credit(&self, user: UserId, amount: BigUint) {
        *self.balances.entry(user).or_default() += amount;
    }

    pub fn balance(&self, user: UserId) -> BigUint {
        self.balances
            .get(&user)
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    /// Total committed from this user's holds.
    pub fn spent_by(&self, user: UserId) -> BigUint {
        self.spent.get(&user).map(|s| s.clone()).unwrap_or_default()
    }

    pub fn committed_total(&self) -> BigUint {
        self.spent.iter().map(|s| s.value().clone()).sum()
    }

    /// Holds placed but neither committed nor released.
    pub fn outstanding_holds(&self) -> usize {
        self.holds.len()
    }

    /// Fail the next `n` hold calls with `Unavailable`.
    pub fn fail_next_holds(&self, n: u32) {
        self.fail_holds.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` commit calls with `Unavailable`.
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` release calls with `Unavailable`.
    pub fn fail_next_releases(&self, n: u32) {
        self.fail_releases.store(n, Ordering::SeqCst);
    }

    /// Delay every call by `latency` (used to provoke timeouts).
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_settle(&self, holds: &[HoldRef], as_: Settlement) -> Result<(), PaymentError> {
        for hold in holds {
            if self.holds.contains_key(hold) {
                continue;
            }
            match self.settled.get(hold).map(|s| *s) {
                Some(done) if done == as_ => continue,
                _ => return Err(PaymentError::UnknownHold(hold.clone())),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentLedger for MemoryPaymentLedger {
    async fn hold(
        &self,
        user: UserId,
        amount: &BigUint,
        reason: &str,
    ) -> Result<HoldRef, PaymentError> {
        self.simulate_latency().await;
        if Self::take_failure(&self.fail_holds) {
            return Err(PaymentError::Unavailable("injected hold failure".into()));
        }

        {
            let mut balance = self.balances.entry(user).or_default();
            if *balance < *amount {
                return Err(PaymentError::InsufficientFunds { user });
            }
            *balance -= amount;
        }

        let hold = HoldRef::new(Uuid::new_v4().to_string());
        self.holds.insert(
            hold.clone(),
            HeldFunds {
                user,
                amount: amount.clone(),
            },
        );
        tracing::trace!(%user, %amount, reason, hold = %hold, "Hold placed");
        Ok(hold)
    }

    async fn commit_holds(&self, holds: &[HoldRef]) -> Result<(), PaymentError> {
        self.simulate_latency().await;
        if Self::take_failure(&self.fail_commits) {
            return Err(PaymentError::Unavailable("injected commit failure".into()));
        }
        self.check_settle(holds, Settlement::Committed)?;

        for hold in holds {
            if let Some((hold, funds)) = self.holds.remove(hold) {
                *self.spent.entry(funds.user).or_default() += funds.amount;
                self.settled.insert(hold, Settlement::Committed);
            }
        }
        Ok(())
    }

    async fn release_holds(&self, holds: &[HoldRef]) -> Result<(), PaymentError> {
        self.simulate_latency().await;
        if Self::take_failure(&self.fail_releases) {
            return Err(PaymentError::Unavailable("injected release failure".into()));
        }
        self.check_settle(holds, Settlement::Released)?;

        for hold in holds {
            if let Some((hold, funds)) = self.holds.remove(hold) {
                *self.balances.entry(funds.user).or_default() += funds.amount;
                self.settled.insert(hold, Settlement::Released);
            }
        }
        Ok(())
    }
}

/// Round snapshots and an append-only event log.
#[derive(Debug, Default)]
pub struct MemoryRoundStore {
    rounds: DashMap<FactionId, RoundSnapshot>,
    events: Mutex<Vec<KernelEvent>>,
    fail_saves: AtomicBool,
}

impl MemoryRoundStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_round(&self, snapshot: RoundSnapshot) {
        self.rounds.insert(snapshot.faction_id, snapshot);
    }

    pub fn events(&self) -> Vec<KernelEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_saves.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl RoundStore for MemoryRoundStore {
    async fn load_active_round(&self, faction_id: FactionId) -> Result<Option<RoundSnapshot>> {
        Ok(self.rounds.get(&faction_id).map(|r| r.clone()))
    }

    async fn save_round_event(&self, event: &KernelEvent) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(anyhow!("round store unavailable"));
        }
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
        Ok(())
    }
}

/// Keeps every published message and re-broadcasts it to live subscribers.
#[derive(Debug)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<(String, serde_json::Value)>>,
    live: broadcast::Sender<(String, serde_json::Value)>,
}

impl Default for RecordingPublisher {
    fn default() -> Self {
        let (live, _) = broadcast::channel(1024);
        Self {
            messages: Mutex::new(Vec::new()),
            live,
        }
    }
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads published on `topic`, oldest first.
    pub fn messages(&self, topic: &str) -> Vec<serde_json::Value> {
        let all = match self.messages.lock() {
            Ok(messages) => messages.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        all.into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload)
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, serde_json::Value)> {
        self.live.subscribe()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<()> {
        match self.messages.lock() {
            Ok(mut messages) => messages.push((topic.to_string(), payload.clone())),
            Err(poisoned) => poisoned
                .into_inner()
                .push((topic.to_string(), payload.clone())),
        }
        // No live subscribers is fine.
        let _ = self.live.send((topic.to_string(), payload));
        Ok(())
    }
}

/// Everyone is online unless marked offline.
#[derive(Debug, Default)]
pub struct StaticPresence {
    offline: DashMap<UserId, ()>,
}

impl StaticPresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, user: UserId) {
        self.offline.insert(user, ());
    }
}

#[async_trait]
impl Presence for StaticPresence {
    async fn is_online(&self, user: UserId) -> bool {
        !self.offline.contains_key(&user)
    }
}

/// A fixed set of abilities. Battle abilities are handed out round-robin.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    battle_abilities: Vec<BattleAbility>,
    faction_abilities: HashMap<FactionId, Vec<FactionAbility>>,
    next: AtomicUsize,
}

impl StaticCatalog {
    pub fn new(
        battle_abilities: Vec<BattleAbility>,
        faction_abilities: HashMap<FactionId, Vec<FactionAbility>>,
    ) -> Self {
        Self {
            battle_abilities,
            faction_abilities,
            next: AtomicUsize::new(0),
        }
    }

    /// One battle ability and `per_faction` faction abilities per faction,
    /// all starting at `initial_price`.
    pub fn generated(
        factions: &[FactionId],
        per_faction: usize,
        initial_price: BigUint,
        cooldown_ms: u64,
    ) -> Self {
        let battle = BattleAbility {
            id: Uuid::new_v4(),
            label: "AIRSTRIKE".to_string(),
            cooldown_ms,
        };
        let faction_abilities = factions
            .iter()
            .map(|faction| {
                let abilities = (0..per_faction)
                    .map(|i| FactionAbility {
                        id: Uuid::new_v4(),
                        faction_id: *faction,
                        label: format!("ABILITY_{i}"),
                        initial_price: initial_price.clone(),
                    })
                    .collect();
                (*faction, abilities)
            })
            .collect();
        Self::new(vec![battle], faction_abilities)
    }
}

#[async_trait]
impl AbilityCatalog for StaticCatalog {
    async fn next_collection(&self, factions: &[FactionId]) -> Result<AbilityCollection> {
        if self.battle_abilities.is_empty() {
            return Err(anyhow!("no battle abilities configured"));
        }
        let idx = self.next.fetch_add(1, Ordering::SeqCst) % self.battle_abilities.len();
        let battle_ability = self.battle_abilities[idx].clone();

        let faction_abilities = factions
            .iter()
            .filter_map(|faction| {
                let variant = self.faction_abilities.get(faction)?.first()?;
                Some((
                    *faction,
                    FactionAbility {
                        id: battle_ability.id,
                        faction_id: *faction,
                        label: format!("{} ({})", battle_ability.label, variant.label),
                        initial_price: BigUint::zero(),
                    },
                ))
            })
            .collect();

        Ok(AbilityCollection {
            battle_ability,
            faction_abilities,
        })
    }

    async fn faction_abilities(&self, faction_id: FactionId) -> Result<Vec<FactionAbility>> {
        Ok(self
            .faction_abilities
            .get(&faction_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hold_commit_and_release_move_funds() {
        let ledger = MemoryPaymentLedger::new();
        let user = Uuid::new_v4();
        ledger.credit(user, BigUint::from(100u32));

        let a = ledger.hold(user, &BigUint::from(30u32), "a").await.unwrap();
        let b = ledger.hold(user, &BigUint::from(20u32), "b").await.unwrap();
        assert_eq!(ledger.balance(user), BigUint::from(50u32));

        ledger.commit_holds(&[a.clone()]).await.unwrap();
        ledger.release_holds(&[b.clone()]).await.unwrap();

        assert_eq!(ledger.balance(user), BigUint::from(70u32));
        assert_eq!(ledger.spent_by(user), BigUint::from(30u32));
        assert_eq!(ledger.outstanding_holds(), 0);

        // Settling again the same way is a no-op.
        ledger.commit_holds(&[a.clone()]).await.unwrap();
        ledger.release_holds(&[b]).await.unwrap();
        assert!(ledger.release_holds(&[a]).await.is_err());
    }

    #[tokio::test]
    async fn test_insufficient_funds_rejected() {
        let ledger = MemoryPaymentLedger::new();
        let user = Uuid::new_v4();
        ledger.credit(user, BigUint::from(5u32));

        let err = ledger
            .hold(user, &BigUint::from(6u32), "too much")
            .await
            .unwrap_err();
        assert_eq!(err, PaymentError::InsufficientFunds { user });
        assert_eq!(ledger.balance(user), BigUint::from(5u32));
    }

    #[tokio::test]
    async fn test_injected_commit_failure_is_consumed() {
        let ledger = MemoryPaymentLedger::new();
        let user = Uuid::new_v4();
        ledger.credit(user, BigUint::from(10u32));
        let hold = ledger.hold(user, &BigUint::from(10u32), "x").await.unwrap();

        ledger.fail_next_commits(1);
        assert!(ledger.commit_holds(&[hold.clone()]).await.is_err());
        assert!(ledger.commit_holds(&[hold]).await.is_ok());
    }

    #[tokio::test]
    async fn test_catalog_rotates_battle_abilities() {
        let faction = Uuid::new_v4();
        let abilities = vec![
            BattleAbility {
                id: Uuid::new_v4(),
                label: "A".into(),
                cooldown_ms: 1,
            },
            BattleAbility {
                id: Uuid::new_v4(),
                label: "B".into(),
                cooldown_ms: 2,
            },
        ];
        let catalog = StaticCatalog::new(abilities.clone(), HashMap::new());

        let first = catalog.next_collection(&[faction]).await.unwrap();
        let second = catalog.next_collection(&[faction]).await.unwrap();
        let third = catalog.next_collection(&[faction]).await.unwrap();
        assert_eq!(first.battle_ability, abilities[0]);
        assert_eq!(second.battle_ability, abilities[1]);
        assert_eq!(third.battle_ability, abilities[0]);
    }
}
