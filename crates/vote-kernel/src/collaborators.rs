//! Interfaces to the services the kernel depends on but does not implement.
//!
//! - [`PaymentLedger`]: places, commits and releases currency holds
//! - [`RoundStore`]: restores round state and records round events
//! - [`Publisher`]: best-effort fan-out to subscribed clients
//! - [`Presence`]: whether a viewer is still connected
//! - [`AbilityCatalog`]: which abilities are in play
//!
//! Every payment call is wrapped in a timeout by the caller; implementations
//! must tolerate a call being retried after a timeout.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::PaymentError;
use crate::messages::KernelEvent;
use crate::types::{AbilityCollection, AbilityId, FactionAbility, FactionId, HoldRef, UserId};

#[async_trait]
pub trait PaymentLedger: Send + Sync {
    /// Reserve `amount` of the user's currency. `reason` is recorded with the hold.
    async fn hold(&self, user: UserId, amount: &BigUint, reason: &str)
        -> Result<HoldRef, PaymentError>;

    /// Settle every hold in `holds` as one batch.
    async fn commit_holds(&self, holds: &[HoldRef]) -> Result<(), PaymentError>;

    /// Return every hold in `holds` to its owner.
    async fn release_holds(&self, holds: &[HoldRef]) -> Result<(), PaymentError>;
}

/// Persisted auction prices for one faction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSnapshot {
    pub faction_id: FactionId,
    pub prices: HashMap<AbilityId, StoredPrice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPrice {
    #[serde(with = "crate::currency::serde_units")]
    pub target_price: BigUint,
    #[serde(with = "crate::currency::serde_units")]
    pub max_target_price: BigUint,
}

#[async_trait]
pub trait RoundStore: Send + Sync {
    /// The faction's last active round, or `None` if nothing is stored.
    async fn load_active_round(&self, faction_id: FactionId) -> Result<Option<RoundSnapshot>>;

    async fn save_round_event(&self, event: &KernelEvent) -> Result<()>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<()>;
}

#[async_trait]
pub trait Presence: Send + Sync {
    async fn is_online(&self, user: UserId) -> bool;
}

#[async_trait]
pub trait AbilityCatalog: Send + Sync {
    /// The battle ability for the next vote round, with each faction's variant.
    async fn next_collection(&self, factions: &[FactionId]) -> Result<AbilityCollection>;

    /// The abilities a faction can fund through contributions this battle.
    async fn faction_abilities(&self, faction_id: FactionId) -> Result<Vec<FactionAbility>>;
}

/// Every collaborator the kernel needs, bundled for wiring.
#[derive(Clone)]
pub struct Collaborators {
    pub payments: Arc<dyn PaymentLedger>,
    pub store: Arc<dyn RoundStore>,
    pub publisher: Arc<dyn Publisher>,
    pub presence: Arc<dyn Presence>,
    pub catalog: Arc<dyn AbilityCatalog>,
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
