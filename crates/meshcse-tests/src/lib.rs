//! meshcse Test & Validation
//!
//! Multi-node federation scenarios run against simulated peers: registration
//! with a registrar, child liveliness, announcement bookkeeping, transit
//! routing and the subsystem lifecycle.

pub mod harness;

#[cfg(test)]
mod registration_tests;
#[cfg(test)]
mod transit_tests;

pub use harness::{record_for, wait_until, SimTopology, TestNode};
