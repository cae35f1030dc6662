//! Faction registry: faction ID → that faction's auction ledger for the
//! current battle.
//!
//! Built when a battle starts and torn down when it ends. Teardown drains
//! every ledger before stopping it so no hold is left stranded. A drained
//! ledger refuses contributions, so a handle cloned out before teardown
//! cannot place a hold between the drain and the stop.

use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::actors::{AuctionLedger, AuctionLedgerState, DrainReport};
use crate::broadcast::Debouncer;
use crate::error::{VoteError, VoteResult};
use crate::types::FactionId;

/// Everything the kernel keeps for one faction during a battle.
pub struct FactionSlot {
    pub ledger: AuctionLedger,
    /// Coalesces target-price broadcasts for this faction
    pub snapshots: Debouncer<()>,
    worker: JoinHandle<AuctionLedgerState>,
}

impl FactionSlot {
    pub fn new(
        ledger: AuctionLedger,
        snapshots: Debouncer<()>,
        worker: JoinHandle<AuctionLedgerState>,
    ) -> Self {
        Self {
            ledger,
            snapshots,
            worker,
        }
    }
}

/// Outcome of tearing down one faction.
#[derive(Debug, Clone)]
pub struct FactionTeardown {
    pub faction_id: FactionId,
    /// `None` if the ledger could not be drained after every attempt
    pub drained: Option<DrainReport>,
}

#[derive(Default)]
pub struct FactionRegistry {
    slots: DashMap<FactionId, FactionSlot>,
}

impl std::fmt::Debug for FactionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactionRegistry")
            .field("factions", &self.slots.len())
            .finish()
    }
}

impl FactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, faction_id: FactionId, slot: FactionSlot) {
        self.slots.insert(faction_id, slot);
    }

    /// Take every slot out, consuming the registry.
    pub fn into_slots(self) -> Vec<(FactionId, FactionSlot)> {
        self.slots.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn ledger(&self, faction_id: FactionId) -> VoteResult<AuctionLedger> {
        self.slots
            .get(&faction_id)
            .map(|slot| slot.ledger.clone())
            .ok_or(VoteError::UnknownFaction(faction_id))
    }

    /// Ask the faction's broadcaster to publish fresh target prices.
    pub fn snapshot_changed(&self, faction_id: FactionId) {
        if let Some(slot) = self.slots.get(&faction_id) {
            slot.snapshots.changed();
        }
    }

    pub fn snapshot_all_changed(&self) {
        for slot in self.slots.iter() {
            slot.snapshots.changed();
        }
    }

    /// Every ledger, cloned out so no map guard is held across awaits.
    pub fn ledgers(&self) -> Vec<AuctionLedger> {
        self.slots.iter().map(|slot| slot.ledger.clone()).collect()
    }

    /// Drain and stop every ledger, emptying the registry.
    ///
    /// Each drain is attempted up to `attempts` times. A ledger that still
    /// cannot release its holds is stopped anyway and reported with
    /// `drained: None` so the holds can be reconciled.
    pub async fn teardown(&self, attempts: u32) -> Vec<FactionTeardown> {
        let factions: Vec<FactionId> = self.slots.iter().map(|slot| *slot.key()).collect();
        let mut results = Vec::with_capacity(factions.len());

        for faction_id in factions {
            let Some((_, slot)) = self.slots.remove(&faction_id) else {
                continue;
            };

            let mut drained = None;
            for attempt in 1..=attempts.max(1) {
                match slot.ledger.drain().await {
                    Ok(report) => {
                        drained = Some(report);
                        break;
                    }
                    Err(err) => tracing::warn!(
                        %faction_id,
                        attempt,
                        error = %err,
                        "Ledger drain failed"
                    ),
                }
            }
            if drained.is_none() {
                tracing::error!(%faction_id, "Ledger stopped with holds outstanding");
            }

            if let Err(err) = slot.ledger.stop() {
                tracing::debug!(%faction_id, error = %err, "Ledger already stopped");
            }
            if let Err(err) = slot.worker.await {
                tracing::error!(%faction_id, error = %err, "Ledger worker panicked");
            }
            results.push(FactionTeardown {
                faction_id,
                drained,
            });
        }
        results
    }
}
