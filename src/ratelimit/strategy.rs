//! Rate limiting strategy selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RatekeeperError, Result};

/// The counting algorithm a [`RateLimiter`](super::RateLimiter) applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Window pinned to the first hit; the deadline never moves.
    #[default]
    FixedWindow,
    /// Like `FixedWindow`, but every hit pushes the deadline out again.
    FixedWindowElasticExpiry,
    /// Weighted two-window estimate of a trailing window ending now.
    MovingWindow,
}

impl Strategy {
    /// Every supported strategy.
    pub const ALL: [Strategy; 3] = [
        Strategy::FixedWindow,
        Strategy::FixedWindowElasticExpiry,
        Strategy::MovingWindow,
    ];

    /// The configuration name of this strategy.
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::FixedWindow => "fixed-window",
            Strategy::FixedWindowElasticExpiry => "fixed-window-elastic-expiry",
            Strategy::MovingWindow => "moving-window",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = RatekeeperError;

    fn from_str(s: &str) -> Result<Self> {
        Strategy::ALL
            .into_iter()
            .find(|strategy| strategy.name() == s)
            .ok_or_else(|| RatekeeperError::UnknownStrategy(s.to_string()))
    }
}
