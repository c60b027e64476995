//! Training tooling for the move-prediction network.
//!
//! Turns multi-gigabyte PGN archives into mini-batches for
//! [`prophet_core::Network`] under a fixed memory ceiling, with periodic
//! binary checkpoints and non-blocking progress reporting.

pub mod common;
pub mod trainer;
