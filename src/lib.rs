//! Ratekeeper - Rate Limiting Engine
//!
//! This crate decides whether a caller may invoke a protected operation,
//! counting hits per (identifier, rate) in a pluggable counter store: an
//! in-process map, a Redis server, or a gossip mesh of peer nodes.

pub mod clock;
pub mod config;
pub mod error;
pub mod mesh;
pub mod ratelimit;
pub mod registry;
pub mod store;

pub use error::{RatekeeperError, Result};
pub use ratelimit::parse as parse_rate;
pub use ratelimit::{build_identifier, Guard, RateLimiter, RateSpec, Strategy, WindowStats};
pub use store::CounterStore;
