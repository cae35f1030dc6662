//! Error taxonomy for the vote kernel.
//!
//! Variants fall into three groups: invalid input (rejected before any state
//! is touched), collaborator failures (the contribution is rolled back), and
//! invariant violations (the owning actor stops accepting commands).

use thiserror::Error;

use crate::actor::ActorError;
use crate::types::{AbilityId, FactionId, HoldRef, UserId};

/// Errors reported by a payment ledger implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PaymentError {
    #[error("insufficient funds for user {user}")]
    InsufficientFunds { user: UserId },
    #[error("unknown hold {0}")]
    UnknownHold(HoldRef),
    #[error("payment ledger unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced to callers of kernel operations.
#[derive(Debug, Error)]
pub enum VoteError {
    #[error("invalid amount {0:?}")]
    InvalidAmount(String),
    #[error("unknown ability {0}")]
    UnknownAbility(AbilityId),
    #[error("unknown faction {0}")]
    UnknownFaction(FactionId),
    #[error("operation not allowed in phase {phase}")]
    PhaseClosed { phase: String },
    #[error("user {0} is not the current winner")]
    NotWinner(UserId),
    #[error("payment failed: {0}")]
    Payment(#[from] PaymentError),
    #[error("payment ledger timed out during {0}")]
    PaymentTimeout(&'static str),
    #[error("faction {0} is closed for the battle")]
    LedgerClosed(FactionId),
    #[error(transparent)]
    Actor(#[from] ActorError),
}

impl VoteError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VoteError::Payment(_) | VoteError::PaymentTimeout(_))
    }
}

pub type VoteResult<T> = Result<T, VoteError>;
