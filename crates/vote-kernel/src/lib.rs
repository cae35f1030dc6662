//! Vote Kernel: real-time faction votes and ability auctions for live battles
//!
//! Viewers back their faction in two ways. They contribute currency toward a
//! faction ability until its target price is met, or they buy votes on the
//! shared battle ability during a timed vote window. Vote prices follow
//! demand across a rolling window; ability target prices double on trigger and
//! decay back toward a floor.

pub mod actor;
pub mod actors;
pub mod broadcast;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod currency;
pub mod error;
pub mod kernel;
pub mod memory;
pub mod messages;
pub mod priority_gate;
pub mod registry;
pub mod types;
pub mod vote_price;

pub use actors::{AuctionLedger, ContributionOutcome, CycleStatus, VoteCycle, VoteReceipt};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{AbilityCatalog, Collaborators, PaymentLedger, Presence, Publisher, RoundStore};
pub use config::KernelConfig;
pub use error::{PaymentError, VoteError, VoteResult};
pub use kernel::{BattleSummary, VoteKernel, VoteKernelBuilder};
pub use messages::{AbilityTrigger, KernelEvent, VotePhase};
pub use types::{AbilityId, CellLocation, FactionId, HoldRef, UserId};
pub use vote_price::VotePriceFeed;
