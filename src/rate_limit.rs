//! Rate limiting primitives.
//!
//! This module provides the building blocks for rate limiting:
//! - [`RateLimit`]: binds a normalized [`RateGroup`] to a store and turns denials into
//!   [`AcquireError::RateLimited`].
//! - [`Store`] / [`AsyncStore`]: per-key usage state (in-memory or external backends).
//! - [`Decision`]: the result of a store check (Allowed/Denied).
//! - [`RateLimitLayer`] / [`BucketLayer`]: Tower middleware that enforces the limit.
//!
//! # Architecture
//!
//! - **Middleware** wraps your service. It only knows how to derive a key from a
//!   request and ask a `RateLimit` or [`Bucket`](crate::Bucket).
//! - **RateLimit** owns the rates and exactly one store.
//! - **Storage** (`store` module) holds the fixed-window counters and does the math.

use crate::error::{AcquireError, RateError, StoreError};
use crate::rate::{Rate, RateGroup};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::time::Duration;

pub mod middleware;
pub mod store;
pub use middleware::{BucketLayer, BucketService, RateLimitLayer, RateLimitService};
pub use store::{AsyncStore, MemoryStore, Store};

/// The decision returned by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// A token was taken from every rate.
    Allowed,
    /// At least one rate has no token left in its current window.
    Denied {
        /// How long until the slowest denying window resets.
        retry_after: Duration,
        /// The rate that window belongs to.
        rate: Rate,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    /// Wait reported by a denial.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Decision::Allowed => None,
            Decision::Denied { retry_after, .. } => Some(*retry_after),
        }
    }
}

/// A group of rates enforced over a key space through one store.
///
/// `RateLimit` answers immediately: a denied key gets
/// [`AcquireError::RateLimited`] with the time to wait. Use a
/// [`Bucket`](crate::Bucket) to wait automatically.
///
/// ```
/// use uprate::{AcquireError, Rate, RateLimit};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let limit = RateLimit::new(Rate::per_second(2)? | Rate::per_minute(10)?)?;
///
/// limit.acquire_sync(&"alice")?;
/// limit.acquire_sync(&"alice")?;
/// let err = limit.acquire_sync(&"alice").unwrap_err();
/// assert!(matches!(err, AcquireError::RateLimited { .. }));
///
/// // Keys are independent.
/// limit.acquire_sync(&"bob")?;
/// # Ok(())
/// # }
/// ```
pub struct RateLimit<K, S = MemoryStore<K>> {
    rates: RateGroup,
    store: S,
    _key: PhantomData<fn(&K)>,
}

impl<K> RateLimit<K, MemoryStore<K>>
where
    K: Hash + Eq + Clone + Send + Sync,
{
    /// Rate limit backed by a fresh [`MemoryStore`].
    ///
    /// # Errors
    /// [`RateError::InvalidArgumentType`] if the group holds no rates.
    pub fn new(rate: impl Into<RateGroup>) -> Result<Self, RateError> {
        Self::with_store(rate, MemoryStore::new())
    }
}

impl<K, S> RateLimit<K, S>
where
    K: Send + Sync,
    S: AsyncStore<K>,
{
    /// Rate limit backed by `store`. The rates are sorted by period and the store is
    /// bound to them; any usage the store held is discarded.
    ///
    /// # Errors
    /// [`RateError::InvalidArgumentType`] if the group holds no rates.
    pub fn with_store(rate: impl Into<RateGroup>, mut store: S) -> Result<Self, RateError> {
        let rates = rate.into().normalized();
        if rates.is_empty() {
            return Err(RateError::InvalidArgumentType("rate group must hold at least one rate"));
        }
        AsyncStore::setup(&mut store, &rates);
        Ok(Self { rates, store, _key: PhantomData })
    }

    /// Take one usage token for `key` from every rate.
    ///
    /// # Errors
    /// [`AcquireError::RateLimited`] if any rate is exhausted for `key`,
    /// [`AcquireError::Store`] if the store fails.
    pub async fn acquire(&self, key: &K) -> Result<(), AcquireError> {
        let decision = AsyncStore::acquire(&self.store, key).await?;
        settle(decision)
    }

    /// Forget usage for `key`, or for every key when `key` is `None`.
    pub async fn reset(&self, key: Option<&K>) -> Result<(), StoreError> {
        match key {
            Some(key) => AsyncStore::reset(&self.store, key).await,
            None => AsyncStore::clear(&self.store).await,
        }
    }
}

impl<K, S> RateLimit<K, S>
where
    S: Store<K>,
{
    /// Blocking-safe variant of [`RateLimit::acquire`] for synchronous stores.
    pub fn acquire_sync(&self, key: &K) -> Result<(), AcquireError> {
        let decision = Store::acquire(&self.store, key)?;
        settle(decision)
    }

    /// Blocking-safe variant of [`RateLimit::reset`] for synchronous stores.
    pub fn reset_sync(&self, key: Option<&K>) -> Result<(), StoreError> {
        match key {
            Some(key) => Store::reset(&self.store, key),
            None => Store::clear(&self.store),
        }
    }
}

impl<K, S> RateLimit<K, S> {
    /// Rates in ascending period order.
    pub fn rates(&self) -> &[Rate] {
        self.rates.rates()
    }

    /// The backing store.
    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<K, S: fmt::Debug> fmt::Debug for RateLimit<K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimit").field("rates", &self.rates).field("store", &self.store).finish()
    }
}

fn settle(decision: Decision) -> Result<(), AcquireError> {
    match decision {
        Decision::Allowed => Ok(()),
        Decision::Denied { retry_after, rate } => {
            tracing::debug!(?retry_after, %rate, "rate limit denied acquisition");
            Err(AcquireError::RateLimited { retry_after, rate })
        }
    }
}
