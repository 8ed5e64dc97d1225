//! Windowguard - Distributed Sliding-Window Rate Limiting
//!
//! This crate decides whether an entity (a user, a realm, an address) may
//! make its next call under a set of "at most N calls in the last W seconds"
//! rules. Call history lives in a shared store, so every process consulting
//! the same store enforces the same limits.

pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod ratelimit;

pub use error::{Result, WindowguardError};
