//! Vote Simulator: random viewers playing whole battles against the vote kernel.
//!
//! This crate drives the kernel end to end on its in-memory collaborators:
//! - Time-scaled kernel config so a battle passes in seconds
//! - Viewers contributing to faction abilities and buying votes
//! - Winners picking locations, timing out, or dropping out

pub mod results;
pub mod simulation;
