//! Actors owning the kernel's per-battle state.
//!
//! ```text
//! contribute ──► AuctionLedger (one per faction)
//!                  ├─ hold → pending → commit on target crossing
//!                  └─ AbilityTriggered ──► event sink
//! cast_vote ───► VoteCycle (one per kernel)
//!   tick ──────►   ├─ phase deadlines
//!                  ├─ IncreaseFactionVolume ──► VotePriceFeed (low priority)
//!                  └─ PhaseChanged / WinnerAnnounced / Cancelled ──► event sink
//! ```
//!
//! Both are built on [`ActorHandle`](crate::actor::ActorHandle): every
//! operation is a command applied to the owned state in submission order.

mod auction_ledger;
mod vote_cycle;

pub use auction_ledger::{
    AuctionLedger, AuctionLedgerState, ContributionOutcome, DrainReport, FactionAuctionEntry,
    PendingHold,
};
pub use vote_cycle::{
    CycleDeps, CycleStatus, VoteCycle, VoteCycleState, VoteReceipt, WinnerQueue, NO_PLAYER_REASON,
};
