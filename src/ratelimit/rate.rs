//! Rate specifications and the rate string parser.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RatekeeperError, Result};

/// Granularity of a rate limit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
    /// Per-month rate limiting (30 days)
    Month,
    /// Per-year rate limiting (12 months)
    Year,
}

impl Period {
    /// Length of one period in seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            Period::Second => 1,
            Period::Minute => 60,
            Period::Hour => 3600,
            Period::Day => 86400,
            Period::Month => 30 * 86400,
            Period::Year => 12 * 30 * 86400,
        }
    }

    /// Get the duration of this period.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.seconds())
    }

    /// The singular unit name.
    pub fn name(&self) -> &'static str {
        match self {
            Period::Second => "second",
            Period::Minute => "minute",
            Period::Hour => "hour",
            Period::Day => "day",
            Period::Month => "month",
            Period::Year => "year",
        }
    }

    /// Look up a unit by name, singular or plural. Expects lowercase input.
    fn from_name(name: &str) -> Option<Self> {
        let singular = name.strip_suffix('s').unwrap_or(name);
        match singular {
            "second" => Some(Period::Second),
            "minute" => Some(Period::Minute),
            "hour" => Some(Period::Hour),
            "day" => Some(Period::Day),
            "month" => Some(Period::Month),
            "year" => Some(Period::Year),
            _ => None,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A parsed rate: `amount` hits per `multiples` x `period`.
///
/// `"5/2 minutes"` is five hits per two-minute window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RateSpec {
    amount: u64,
    period: Period,
    multiples: u64,
}

impl RateSpec {
    /// Build a rate directly. Both `amount` and `multiples` must be positive.
    pub fn new(amount: u64, multiples: u64, period: Period) -> Result<Self> {
        if amount == 0 {
            return Err(RatekeeperError::InvalidRateFormat(
                "amount must be a positive integer".to_string(),
            ));
        }
        if multiples == 0 {
            return Err(RatekeeperError::InvalidRateFormat(
                "multiples must be a positive integer".to_string(),
            ));
        }
        Ok(Self {
            amount,
            period,
            multiples,
        })
    }

    /// Shorthand for a single-period rate such as `10/second`.
    pub fn per(amount: u64, period: Period) -> Result<Self> {
        Self::new(amount, 1, period)
    }

    /// Maximum hits allowed per window.
    pub fn amount(&self) -> u64 {
        self.amount
    }

    /// The window granularity.
    pub fn period(&self) -> Period {
        self.period
    }

    /// How many periods make up one window.
    pub fn multiples(&self) -> u64 {
        self.multiples
    }

    /// Total window length in seconds.
    pub fn window_seconds(&self) -> u64 {
        self.period.seconds().saturating_mul(self.multiples)
    }

    /// Total window length as the signed TTL counter stores expect.
    pub fn expiry_seconds(&self) -> i64 {
        i64::try_from(self.window_seconds()).unwrap_or(i64::MAX)
    }

    /// The rate-dependent suffix of a storage key: `<amount>/<multiples>/<period>`.
    pub fn key_suffix(&self) -> String {
        format!("{}/{}/{}", self.amount, self.multiples, self.period)
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.multiples == 1 {
            write!(f, "{}/{}", self.amount, self.period)
        } else {
            write!(f, "{}/{} {}s", self.amount, self.multiples, self.period)
        }
    }
}

impl FromStr for RateSpec {
    type Err = RatekeeperError;

    fn from_str(s: &str) -> Result<Self> {
        parse_rate_str(s)
    }
}

impl TryFrom<String> for RateSpec {
    type Error = RatekeeperError;

    fn try_from(value: String) -> Result<Self> {
        parse_rate_str(&value)
    }
}

impl From<RateSpec> for String {
    fn from(rate: RateSpec) -> Self {
        rate.to_string()
    }
}

/// Anything that can be turned into a [`RateSpec`]: rate strings, or an
/// already parsed rate which passes through unchanged.
pub trait IntoRateSpec {
    /// Perform the conversion.
    fn into_rate_spec(self) -> Result<RateSpec>;
}

impl IntoRateSpec for RateSpec {
    fn into_rate_spec(self) -> Result<RateSpec> {
        Ok(self)
    }
}

impl IntoRateSpec for &RateSpec {
    fn into_rate_spec(self) -> Result<RateSpec> {
        Ok(*self)
    }
}

impl IntoRateSpec for &str {
    fn into_rate_spec(self) -> Result<RateSpec> {
        parse_rate_str(self)
    }
}

impl IntoRateSpec for String {
    fn into_rate_spec(self) -> Result<RateSpec> {
        parse_rate_str(&self)
    }
}

impl IntoRateSpec for &String {
    fn into_rate_spec(self) -> Result<RateSpec> {
        parse_rate_str(self)
    }
}

/// Parse a rate such as `"5/minute"`, `"100/2 hours"` or `"10 per second"`.
pub fn parse<R: IntoRateSpec>(rate: R) -> Result<RateSpec> {
    rate.into_rate_spec()
}

/// Parse a `;` or `,` separated list of rates, e.g. `"5/second; 100/hour"`.
pub fn parse_many(text: &str) -> Result<Vec<RateSpec>> {
    let rates = text
        .split([';', ','])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(parse_rate_str)
        .collect::<Result<Vec<_>>>()?;

    if rates.is_empty() {
        return Err(invalid(text));
    }
    Ok(rates)
}

fn parse_rate_str(text: &str) -> Result<RateSpec> {
    let normalized = text.trim().to_ascii_lowercase();

    let (amount, rest) = normalized
        .split_once('/')
        .or_else(|| normalized.split_once(" per "))
        .ok_or_else(|| invalid(text))?;

    let amount = parse_positive(amount.trim()).ok_or_else(|| invalid(text))?;

    let mut parts = rest.split_whitespace();
    let (multiples, unit) = match (parts.next(), parts.next(), parts.next()) {
        (Some(unit), None, None) => (1, unit),
        (Some(multiples), Some(unit), None) => {
            (parse_positive(multiples).ok_or_else(|| invalid(text))?, unit)
        }
        _ => return Err(invalid(text)),
    };

    let period = Period::from_name(unit).ok_or_else(|| invalid(text))?;

    RateSpec::new(amount, multiples, period)
}

fn parse_positive(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|n| *n > 0)
}

fn invalid(text: &str) -> RatekeeperError {
    RatekeeperError::InvalidRateFormat(format!(
        "couldn't parse rate string '{}', expected <amount>/[<multiples> ]<period>",
        text
    ))
}
