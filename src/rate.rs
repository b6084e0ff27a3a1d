//! Rate values and rate groups.
//!
//! A [`Rate`] is an immutable "uses per period" value. Rates compose:
//!
//! - [`Rate::scaled_by`] multiplies the period (`Rate::SECOND.scaled_by(10.0)` is 1 use per 10s)
//! - [`Rate::with_uses`] sets the number of uses ("5 per 10 seconds")
//! - [`Rate::checked_add`] adds two single-use periods ("1 per 1 minute 2 seconds")
//! - [`Rate::grouped_with`] (or `|`) combines rates into a [`RateGroup`] enforced jointly
//!
//! # Examples
//!
//! ```
//! use uprate::{Rate, RateGroup};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), uprate::RateError> {
//! // 2 uses per 2 seconds, and also 30 uses per 2 minutes 30 seconds
//! let burst = Rate::SECOND.scaled_by(2.0)?.with_uses(2)?;
//! let sustained = Rate::MINUTE.scaled_by(2.0)?.checked_add(Rate::SECOND.scaled_by(30.0)?)?.with_uses(30)?;
//! let group: RateGroup = burst | sustained;
//!
//! assert_eq!(group.len(), 2);
//! assert_eq!(sustained.period(), Duration::from_secs(150));
//! # Ok(())
//! # }
//! ```

use crate::error::RateError;
use std::fmt;
use std::ops::BitOr;
use std::time::Duration;

/// A cap of `uses` per fixed `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "RateRepr", into = "RateRepr")
)]
pub struct Rate {
    uses: u32,
    period: Duration,
}

const SECS_PER_DAY: u64 = 60 * 60 * 24;

impl Rate {
    /// 1 use per second.
    pub const SECOND: Rate = Rate { uses: 1, period: Duration::from_secs(1) };
    /// 1 use per minute.
    pub const MINUTE: Rate = Rate { uses: 1, period: Duration::from_secs(60) };
    /// 1 use per hour.
    pub const HOUR: Rate = Rate { uses: 1, period: Duration::from_secs(60 * 60) };
    /// 1 use per day.
    pub const DAY: Rate = Rate { uses: 1, period: Duration::from_secs(SECS_PER_DAY) };
    /// 1 use per week.
    pub const WEEK: Rate = Rate { uses: 1, period: Duration::from_secs(SECS_PER_DAY * 7) };
    /// 1 use per 30 days.
    ///
    /// Longer periods can be built from the smaller units, e.g.
    /// `Rate::DAY.scaled_by(365.0)?.with_uses(5)?` for 5 uses per year.
    pub const MONTH: Rate = Rate { uses: 1, period: Duration::from_secs(SECS_PER_DAY * 30) };

    /// Create a rate of `uses` per `period`.
    ///
    /// # Errors
    /// [`RateError::ZeroUses`] if `uses == 0`, [`RateError::ZeroPeriod`] if `period` is zero.
    pub fn new(uses: u32, period: Duration) -> Result<Self, RateError> {
        if uses == 0 {
            return Err(RateError::ZeroUses);
        }
        if period.is_zero() {
            return Err(RateError::ZeroPeriod);
        }
        Ok(Self { uses, period })
    }

    /// `uses` per second.
    pub fn per_second(uses: u32) -> Result<Self, RateError> {
        Self::SECOND.with_uses(uses)
    }

    /// `uses` per minute.
    pub fn per_minute(uses: u32) -> Result<Self, RateError> {
        Self::MINUTE.with_uses(uses)
    }

    /// `uses` per hour.
    pub fn per_hour(uses: u32) -> Result<Self, RateError> {
        Self::HOUR.with_uses(uses)
    }

    /// Number of uses allowed per window.
    pub fn uses(&self) -> u32 {
        self.uses
    }

    /// Length of each window.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Same period, `uses` uses per window.
    pub fn with_uses(self, uses: u32) -> Result<Self, RateError> {
        Self::new(uses, self.period)
    }

    /// Same uses, period multiplied by `factor`.
    ///
    /// # Errors
    /// [`RateError::InvalidScale`] if `factor` is not finite and positive, or the
    /// resulting period is zero or does not fit in a `Duration`.
    pub fn scaled_by(self, factor: f64) -> Result<Self, RateError> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(RateError::InvalidScale(factor));
        }
        let period = Duration::try_from_secs_f64(self.period.as_secs_f64() * factor)
            .map_err(|_| RateError::InvalidScale(factor))?;
        if period.is_zero() {
            return Err(RateError::InvalidScale(factor));
        }
        Ok(Self { uses: self.uses, period })
    }

    /// Add two single-use rates: "1 per A" + "1 per B" = "1 per (A + B)".
    ///
    /// # Errors
    /// [`RateError::InvalidRateComposition`] unless both rates have exactly one use.
    pub fn checked_add(self, other: Rate) -> Result<Self, RateError> {
        if self.uses != 1 || other.uses != 1 {
            return Err(RateError::InvalidRateComposition { left: self, right: other });
        }
        let period = self.period.checked_add(other.period).ok_or(RateError::PeriodOverflow)?;
        Ok(Self { uses: 1, period })
    }

    /// Combine this rate with another rate or group; see [`RateGroup::grouped_with`].
    pub fn grouped_with(self, other: impl Into<RateGroup>) -> RateGroup {
        RateGroup::from(self).grouped_with(other)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.uses, self.period)
    }
}

#[cfg(feature = "serde")]
#[derive(serde::Serialize, serde::Deserialize)]
struct RateRepr {
    uses: u32,
    /// Period in seconds.
    period: f64,
}

#[cfg(feature = "serde")]
impl TryFrom<RateRepr> for Rate {
    type Error = RateError;

    fn try_from(repr: RateRepr) -> Result<Self, Self::Error> {
        let period = Duration::try_from_secs_f64(repr.period).map_err(|_| RateError::ZeroPeriod)?;
        Rate::new(repr.uses, period)
    }
}

#[cfg(feature = "serde")]
impl From<Rate> for RateRepr {
    fn from(rate: Rate) -> Self {
        RateRepr { uses: rate.uses, period: rate.period.as_secs_f64() }
    }
}

/// Rates enforced jointly on the same key space.
///
/// Groups are built by union: nested groups are flattened and exact duplicates are
/// skipped, so a group never holds the same rate twice. Insertion order is kept
/// until [`RateGroup::normalize`] sorts the rates by ascending period.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(from = "Vec<Rate>", into = "Vec<Rate>")
)]
pub struct RateGroup {
    rates: Vec<Rate>,
}

impl RateGroup {
    /// An empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Union of this group with another rate or group.
    pub fn grouped_with(mut self, other: impl Into<RateGroup>) -> RateGroup {
        for rate in other.into().rates {
            self.push(rate);
        }
        self
    }

    fn push(&mut self, rate: Rate) {
        if !self.rates.contains(&rate) {
            self.rates.push(rate);
        }
    }

    /// Sort rates by ascending period. Ties keep their insertion order.
    pub fn normalize(&mut self) {
        self.rates.sort_by_key(|rate| rate.period);
    }

    /// Consume and return the normalized group.
    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    /// Rates in the group.
    pub fn rates(&self) -> &[Rate] {
        &self.rates
    }

    /// Iterate over the rates.
    pub fn iter(&self) -> std::slice::Iter<'_, Rate> {
        self.rates.iter()
    }

    /// The rate with the longest period.
    pub fn longest(&self) -> Option<Rate> {
        self.rates.iter().copied().max_by_key(|rate| rate.period)
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

impl From<Rate> for RateGroup {
    fn from(rate: Rate) -> Self {
        Self { rates: vec![rate] }
    }
}

impl FromIterator<Rate> for RateGroup {
    fn from_iter<I: IntoIterator<Item = Rate>>(iter: I) -> Self {
        let mut group = RateGroup::new();
        for rate in iter {
            group.push(rate);
        }
        group
    }
}

impl From<Vec<Rate>> for RateGroup {
    fn from(rates: Vec<Rate>) -> Self {
        rates.into_iter().collect()
    }
}

impl From<RateGroup> for Vec<Rate> {
    fn from(group: RateGroup) -> Self {
        group.rates
    }
}

impl<'a> IntoIterator for &'a RateGroup {
    type Item = &'a Rate;
    type IntoIter = std::slice::Iter<'a, Rate>;

    fn into_iter(self) -> Self::IntoIter {
        self.rates.iter()
    }
}

impl BitOr<Rate> for Rate {
    type Output = RateGroup;
    fn bitor(self, rhs: Rate) -> RateGroup {
        self.grouped_with(rhs)
    }
}

impl BitOr<RateGroup> for Rate {
    type Output = RateGroup;
    fn bitor(self, rhs: RateGroup) -> RateGroup {
        self.grouped_with(rhs)
    }
}

impl BitOr<Rate> for RateGroup {
    type Output = RateGroup;
    fn bitor(self, rhs: Rate) -> RateGroup {
        self.grouped_with(rhs)
    }
}

impl BitOr<RateGroup> for RateGroup {
    type Output = RateGroup;
    fn bitor(self, rhs: RateGroup) -> RateGroup {
        self.grouped_with(rhs)
    }
}
