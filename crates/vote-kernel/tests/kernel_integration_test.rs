//! Integration tests for the vote kernel.
//!
//! Drives a kernel built on the in-memory collaborators through whole
//! battles:
//! - Faction contributions crossing a target, then decaying
//! - A vote round from intro to location pick
//! - Winner rotation when nobody picks a location
//! - Battle end returning every uncommitted hold
//! - Round restore and event persistence

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use num_bigint::BigUint;
use uuid::Uuid;

use vote_kernel::actors::{ContributionOutcome, VoteReceipt, NO_PLAYER_REASON};
use vote_kernel::collaborators::{AbilityCatalog, Collaborators, RoundSnapshot, StoredPrice};
use vote_kernel::currency::one_unit;
use vote_kernel::memory::{
    MemoryPaymentLedger, MemoryRoundStore, RecordingPublisher, StaticCatalog, StaticPresence,
};
use vote_kernel::messages::topics;
use vote_kernel::{
    CellLocation, FactionId, KernelConfig, KernelEvent, ManualClock, UserId, VoteError,
    VoteKernel, VoteKernelBuilder, VotePhase,
};

fn units(n: u32) -> BigUint {
    one_unit(18) * n
}

struct Harness {
    kernel: VoteKernel,
    clock: Arc<ManualClock>,
    payments: Arc<MemoryPaymentLedger>,
    store: Arc<MemoryRoundStore>,
    publisher: Arc<RecordingPublisher>,
    presence: Arc<StaticPresence>,
    catalog: Arc<StaticCatalog>,
    factions: Vec<FactionId>,
    config: KernelConfig,
}

impl Harness {
    fn new(faction_count: usize) -> Self {
        Self::with_store(faction_count, MemoryRoundStore::new())
    }

    fn with_store(faction_count: usize, store: MemoryRoundStore) -> Self {
        let factions: Vec<FactionId> = (0..faction_count).map(|_| Uuid::new_v4()).collect();
        let clock = Arc::new(ManualClock::default());
        let payments = Arc::new(MemoryPaymentLedger::new());
        let store = Arc::new(store);
        let publisher = Arc::new(RecordingPublisher::new());
        let presence = Arc::new(StaticPresence::new());
        let catalog = Arc::new(StaticCatalog::generated(&factions, 1, units(1000), 7_000));
        let config = KernelConfig::default();

        let collaborators = Collaborators {
            payments: payments.clone(),
            store: store.clone(),
            publisher: publisher.clone(),
            presence: presence.clone(),
            catalog: catalog.clone(),
            clock: clock.clone(),
        };
        let kernel = VoteKernelBuilder::new(config.clone(), collaborators)
            .factions(factions.clone())
            .manual_ticks()
            .spawn();

        Self {
            kernel,
            clock,
            payments,
            store,
            publisher,
            presence,
            catalog,
            factions,
            config,
        }
    }

    fn viewer(&self) -> UserId {
        let user = Uuid::new_v4();
        self.payments.credit(user, units(1000));
        user
    }

    async fn ability(&self, faction: FactionId) -> Uuid {
        self.catalog.faction_abilities(faction).await.unwrap()[0].id
    }

    async fn advance(&self, ms: u64) -> VotePhase {
        self.clock.advance_ms(ms);
        self.kernel.tick_phase().await.unwrap()
    }

    /// Start a battle with one intro element and open the first vote.
    async fn open_votes(&self) {
        self.kernel.start_battle(Uuid::new_v4(), 1).await.unwrap();
        assert_eq!(
            self.advance(self.config.phase.intro_ms_per_element).await,
            VotePhase::VoteCooldown
        );
        assert_eq!(
            self.advance(self.config.phase.cooldown_initial_ms).await,
            VotePhase::VoteAbilityRight
        );
    }

    async fn wait_for_event(&self, pred: impl Fn(&KernelEvent) -> bool) -> KernelEvent {
        for _ in 0..200 {
            if let Some(event) = self.store.events().into_iter().find(|e| pred(e)) {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("event never persisted; have {:?}", self.store.events());
    }
}

#[tokio::test]
async fn test_contributions_trigger_then_target_decays() {
    let h = Harness::new(1);
    let faction = h.factions[0];
    let ability = h.ability(faction).await;
    h.kernel.start_battle(Uuid::new_v4(), 1).await.unwrap();

    let alice = h.viewer();
    let bob = h.viewer();
    let first = h.kernel.contribute(alice, faction, ability, "400").await.unwrap();
    assert!(matches!(first, ContributionOutcome::Pending { .. }));

    let second = h.kernel.contribute(bob, faction, ability, "600").await.unwrap();
    let (trigger, new_target_price) = match second {
        ContributionOutcome::Triggered {
            trigger,
            new_target_price,
        } => (trigger, new_target_price),
        other => panic!("expected trigger, got {other:?}"),
    };
    assert_eq!(trigger.price, units(1000));
    assert_eq!(trigger.user_id, Some(bob));
    assert_eq!(new_target_price, units(2000));
    assert_eq!(h.payments.committed_total(), units(1000));
    assert_eq!(h.payments.outstanding_holds(), 0);

    for _ in 0..10 {
        h.kernel.tick_decay().await;
    }
    let target = h.kernel.target_prices(faction).await.unwrap()[0]
        .target_price
        .clone();
    assert!(target > units(1580), "decayed too far: {target}");
    assert!(target < units(1595), "decayed too little: {target}");

    h.wait_for_event(|e| matches!(e, KernelEvent::AbilityTriggered { .. }))
        .await;
    assert!(h.publisher.messages(topics::TARGET_PRICES).len() >= 10);
}

#[tokio::test]
async fn test_vote_round_from_intro_to_location_pick() {
    let h = Harness::new(2);
    let (red, blue) = (h.factions[0], h.factions[1]);
    h.open_votes().await;

    let big = h.viewer();
    let small = h.viewer();
    let rival = h.viewer();
    let receipt = h.kernel.cast_vote(big, red, 3).await.unwrap();
    assert!(matches!(receipt, VoteReceipt::Counted { ref amount, .. } if *amount == units(3)));
    h.kernel.cast_vote(small, red, 1).await.unwrap();
    h.kernel.cast_vote(rival, blue, 2).await.unwrap();

    assert_eq!(
        h.advance(h.config.phase.vote_ability_right_ms).await,
        VotePhase::LocationSelect
    );
    let status = h.kernel.status().await.unwrap();
    assert_eq!(status.winner, Some(big));
    assert_eq!(status.winner_faction, Some(red));
    assert_eq!(h.payments.committed_total(), units(6));

    assert!(matches!(
        h.kernel.select_location(small, CellLocation { x: 1, y: 1 }).await,
        Err(VoteError::NotWinner(_))
    ));
    let trigger = h
        .kernel
        .select_location(big, CellLocation { x: 4, y: 9 })
        .await
        .unwrap();
    assert_eq!(trigger.faction_id, red);
    assert_eq!(trigger.location, Some(CellLocation { x: 4, y: 9 }));
    assert_eq!(trigger.price, units(4));
    assert_eq!(h.kernel.status().await.unwrap().phase, VotePhase::VoteCooldown);

    let announced = h
        .wait_for_event(|e| matches!(e, KernelEvent::WinnerAnnounced { .. }))
        .await;
    if let KernelEvent::WinnerAnnounced { user_id, .. } = announced {
        assert_eq!(user_id, big);
    }
    h.wait_for_event(|e| matches!(e, KernelEvent::AbilityTriggered { .. }))
        .await;
    let published = h.publisher.messages(topics::ROUND_EVENTS);
    assert!(published.iter().any(|m| m["kind"] == "winner_announced"));
}

#[tokio::test]
async fn test_winner_rotation_cancels_once_every_candidate_times_out() {
    let h = Harness::new(2);
    let (red, blue) = (h.factions[0], h.factions[1]);
    h.open_votes().await;

    let first = h.viewer();
    let second = h.viewer();
    let offline = h.viewer();
    h.kernel.cast_vote(first, red, 5).await.unwrap();
    h.kernel.cast_vote(offline, red, 3).await.unwrap();
    h.kernel.cast_vote(second, red, 2).await.unwrap();
    h.kernel.cast_vote(h.viewer(), blue, 1).await.unwrap();
    h.presence.set_offline(offline);

    let select_ms = h.config.phase.location_select_ms;
    h.advance(h.config.phase.vote_ability_right_ms).await;
    assert_eq!(h.kernel.status().await.unwrap().winner, Some(first));

    assert_eq!(h.advance(select_ms).await, VotePhase::LocationSelect);
    assert_eq!(h.kernel.status().await.unwrap().winner, Some(second));

    assert_eq!(h.advance(select_ms).await, VotePhase::VoteCooldown);
    let cancelled = h
        .wait_for_event(|e| matches!(e, KernelEvent::Cancelled { .. }))
        .await;
    if let KernelEvent::Cancelled { reason, .. } = cancelled {
        assert_eq!(reason, NO_PLAYER_REASON);
    }
    // Votes stay spent even though nobody picked.
    assert_eq!(h.payments.spent_by(offline), units(3));
}

#[tokio::test]
async fn test_end_battle_returns_uncommitted_holds() {
    let h = Harness::new(2);
    let faction = h.factions[0];
    let ability = h.ability(faction).await;
    h.open_votes().await;

    let backer = h.viewer();
    let voter = h.viewer();
    h.kernel
        .contribute(backer, faction, ability, "250")
        .await
        .unwrap();
    h.kernel.cast_vote(voter, faction, 2).await.unwrap();
    assert_eq!(h.payments.outstanding_holds(), 2);

    let summary = h.kernel.end_battle().await.unwrap();
    assert_eq!(summary.released_vote_holds, 1);
    assert_eq!(summary.drained.len(), 2);
    assert!(summary.failed_drains.is_empty());
    assert_eq!(summary.final_prices.len(), 2);
    let released: usize = summary.drained.iter().map(|(_, r)| r.released_holds).sum();
    assert_eq!(released, 1);

    assert_eq!(h.payments.outstanding_holds(), 0);
    assert_eq!(h.payments.balance(backer), units(1000));
    assert_eq!(h.payments.balance(voter), units(1000));
    assert_eq!(h.kernel.status().await.unwrap().phase, VotePhase::Hold);
    assert!(matches!(
        h.kernel.contribute(backer, faction, ability, "1").await,
        Err(VoteError::UnknownFaction(_))
    ));
}

#[tokio::test]
async fn test_start_battle_restores_stored_target_prices() {
    let h = Harness::new(1);
    let faction = h.factions[0];
    let ability = h.ability(faction).await;

    // Same catalog, with a round already in the store.
    h.store.put_round(RoundSnapshot {
        faction_id: faction,
        prices: HashMap::from([(
            ability,
            StoredPrice {
                target_price: units(1500),
                max_target_price: units(2000),
            },
        )]),
    });
    h
        .kernel
        .start_battle(Uuid::new_v4(), 1)
        .await
        .unwrap();

    let prices = h.kernel.target_prices(faction).await.unwrap();
    assert_eq!(prices[0].target_price, units(1500));
}

#[tokio::test]
async fn test_failing_store_does_not_block_publishing() {
    let store = MemoryRoundStore::new();
    store.set_failing(true);
    let h = Harness::with_store(2, store);

    h.kernel.start_battle(Uuid::new_v4(), 1).await.unwrap();

    let mut published = Vec::new();
    for _ in 0..200 {
        published = h.publisher.messages(topics::ROUND_EVENTS);
        if !published.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(published[0]["kind"], "phase_changed");
    assert_eq!(published[0]["phase"], "WAIT_INTRO");
    assert!(h.store.events().is_empty());
}

#[tokio::test]
async fn test_price_tick_publishes_every_faction() {
    let h = Harness::new(3);
    h.open_votes().await;
    let voter = h.viewer();
    h.kernel.cast_vote(voter, h.factions[0], 10).await.unwrap();

    let updates = h.kernel.tick_prices().await;
    assert_eq!(updates.len(), 3);
    assert_eq!(h.publisher.messages(topics::VOTE_PRICE).len(), 3);

    let voted = updates
        .iter()
        .find(|u| u.faction_id == h.factions[0])
        .unwrap();
    let idle = updates
        .iter()
        .find(|u| u.faction_id == h.factions[1])
        .unwrap();
    assert!(voted.price > idle.price);
    assert_eq!(
        h.kernel.vote_price(h.factions[0]).await.unwrap(),
        voted.price
    );
}

#[tokio::test]
async fn test_second_start_rejected_while_battle_runs() {
    let h = Harness::new(2);
    h.kernel.start_battle(Uuid::new_v4(), 1).await.unwrap();
    assert!(matches!(
        h.kernel.start_battle(Uuid::new_v4(), 1).await,
        Err(VoteError::PhaseClosed { .. })
    ));
    h.kernel.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_build_one_set_of_ledgers() {
    let h = Harness::new(3);

    let starts: Vec<_> = (0..4)
        .map(|_| {
            let kernel = h.kernel.clone();
            tokio::spawn(async move { kernel.start_battle(Uuid::new_v4(), 1).await })
        })
        .collect();
    let mut started = 0;
    for start in starts {
        match start.await.unwrap() {
            Ok(()) => started += 1,
            Err(err) => assert!(matches!(err, VoteError::PhaseClosed { .. }), "{err}"),
        }
    }
    assert_eq!(started, 1);

    let summary = h.kernel.end_battle().await.unwrap();
    assert_eq!(summary.drained.len(), 3);
    assert!(summary.failed_drains.is_empty());

    // The registry is clean again: a fresh battle starts.
    h.kernel.start_battle(Uuid::new_v4(), 1).await.unwrap();
    h.kernel.shutdown().await;
}

#[tokio::test]
async fn test_refused_start_leaves_no_ledgers_behind() {
    let h = Harness::new(2);
    let faction = h.factions[0];
    let ability = h.ability(faction).await;
    h.kernel.shutdown().await;

    let err = h.kernel.start_battle(Uuid::new_v4(), 1).await.unwrap_err();
    assert!(matches!(err, VoteError::Actor(_)), "{err}");
    assert!(matches!(
        h.kernel.contribute(h.viewer(), faction, ability, "1").await,
        Err(VoteError::UnknownFaction(_))
    ));
    assert_eq!(h.payments.outstanding_holds(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_contributions_racing_battle_end_leave_no_holds() {
    let h = Harness::new(2);
    let faction = h.factions[0];
    let ability = h.ability(faction).await;
    h.kernel.start_battle(Uuid::new_v4(), 1).await.unwrap();
    h.payments.set_latency(Duration::from_millis(5));

    let backers: Vec<_> = (0..16)
        .map(|_| {
            let kernel = h.kernel.clone();
            let user = h.viewer();
            tokio::spawn(async move {
                for _ in 0..10 {
                    if kernel.contribute(user, faction, ability, "1").await.is_err() {
                        break;
                    }
                }
            })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let summary = h.kernel.end_battle().await.unwrap();
    for backer in backers {
        backer.await.unwrap();
    }
    assert!(summary.failed_drains.is_empty());
    assert_eq!(h.payments.outstanding_holds(), 0);
    assert_eq!(h.payments.committed_total(), units(0));
}

#[tokio::test(start_paused = true)]
async fn test_tickers_publish_forecasts_until_shutdown() {
    let factions = vec![Uuid::new_v4(), Uuid::new_v4()];
    let publisher = Arc::new(RecordingPublisher::new());
    let collaborators = Collaborators {
        payments: Arc::new(MemoryPaymentLedger::new()),
        store: Arc::new(MemoryRoundStore::new()),
        publisher: publisher.clone(),
        presence: Arc::new(StaticPresence::new()),
        catalog: Arc::new(StaticCatalog::generated(&factions, 1, units(10), 1_000)),
        clock: Arc::new(ManualClock::default()),
    };
    let kernel = VoteKernelBuilder::new(KernelConfig::default(), collaborators)
        .factions(factions)
        .spawn();

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let forecasts = publisher.messages(topics::VOTE_PRICE_FORECAST).len();
    assert!(forecasts >= 2, "only {forecasts} forecasts");

    kernel.shutdown().await;
    let after = publisher.messages(topics::VOTE_PRICE_FORECAST).len();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(publisher.messages(topics::VOTE_PRICE_FORECAST).len(), after);
}
