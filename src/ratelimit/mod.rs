//! Rate limiting engine: rate parsing, identifiers, strategies and guards.

mod guard;
mod identifier;
mod limiter;
mod rate;
mod strategy;

pub use guard::{CallContext, Guard, GuardBuilder, Guarded, Verdict};
pub use identifier::{build_identifier, methods_tag, Identifier};
pub use limiter::{RateLimiter, WindowStats};
pub use rate::{parse, parse_many, IntoRateSpec, Period, RateSpec};
pub use strategy::Strategy;
