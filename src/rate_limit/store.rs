use crate::clock::{Clock, MonotonicClock};
use crate::error::StoreError;
use crate::rate::{Rate, RateGroup};
use crate::rate_limit::Decision;
use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Synchronous storage interface for per-key usage state.
///
/// A store is bound once to the (sorted) rates of the rate limit that owns it via
/// [`Store::setup`]; every other operation fails with [`StoreError::NotBound`] before that.
///
/// Every `Store` is also an [`AsyncStore`], so it can back both the async and the
/// blocking APIs.
pub trait Store<K>: Send + Sync {
    /// Bind the store to a rate limit's rates, sorted by ascending period.
    fn setup(&mut self, rates: &RateGroup);

    /// Try to take one usage token for `key` from every bound rate.
    ///
    /// On denial the decision carries the longest wait among the denying rates and
    /// the rate it belongs to.
    fn acquire(&self, key: &K) -> Result<Decision, StoreError>;

    /// Forget all usage for `key`. Resetting an unknown key is a no-op.
    fn reset(&self, key: &K) -> Result<(), StoreError>;

    /// Forget all usage for every key.
    fn clear(&self) -> Result<(), StoreError>;
}

/// Async storage interface for per-key usage state, for backends that do I/O
/// (e.g. an external cache). Same contract as [`Store`].
#[async_trait]
pub trait AsyncStore<K>: Send + Sync {
    /// Bind the store to a rate limit's rates, sorted by ascending period.
    fn setup(&mut self, rates: &RateGroup);

    /// Try to take one usage token for `key` from every bound rate.
    async fn acquire(&self, key: &K) -> Result<Decision, StoreError>;

    /// Forget all usage for `key`. Resetting an unknown key is a no-op.
    async fn reset(&self, key: &K) -> Result<(), StoreError>;

    /// Forget all usage for every key.
    async fn clear(&self) -> Result<(), StoreError>;
}

#[async_trait]
impl<K, S> AsyncStore<K> for S
where
    K: Send + Sync,
    S: Store<K>,
{
    fn setup(&mut self, rates: &RateGroup) {
        Store::setup(self, rates)
    }

    async fn acquire(&self, key: &K) -> Result<Decision, StoreError> {
        Store::acquire(self, key)
    }

    async fn reset(&self, key: &K) -> Result<(), StoreError> {
        Store::reset(self, key)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        Store::clear(self)
    }
}

/// Usage of one rate's current fixed window.
#[derive(Debug, Clone, Copy)]
struct UsageRecord {
    uses_left: u32,
    window_start: Duration,
}

impl UsageRecord {
    /// A window opened at `now` with this call's token already taken.
    fn opened(rate: &Rate, now: Duration) -> Self {
        Self { uses_left: rate.uses() - 1, window_start: now }
    }
}

#[derive(Debug)]
struct Binding {
    rates: Arc<[Rate]>,
    max_period: Duration,
}

#[derive(Debug)]
struct MemoryState<K> {
    records: HashMap<K, Box<[UsageRecord]>>,
    last_verified: Duration,
}

/// In-memory store.
///
/// Keys are held in a `HashMap` behind one mutex. Stale keys (untouched for longer
/// than the longest bound period) are evicted lazily: at most once per longest
/// period, an `acquire` scans the whole map before deciding.
#[derive(Debug)]
pub struct MemoryStore<K> {
    state: Mutex<MemoryState<K>>,
    binding: Option<Binding>,
    clock: Arc<dyn Clock>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            state: Mutex::new(MemoryState { records: HashMap::new(), last_verified: Duration::ZERO }),
            binding: None,
            clock: Arc::new(MonotonicClock::default()),
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Hash + Eq + Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` currently has usage records.
    pub fn contains_key(&self, key: &K) -> bool {
        self.lock().records.contains_key(key)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState<K>> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("memory store mutex poisoned; recovering");
            poisoned.into_inner()
        })
    }

    /// Drop keys whose longest window went stale, at most once per longest period.
    fn evict_stale(&self, state: &mut MemoryState<K>, now: Duration, max_period: Duration) {
        if now.saturating_sub(state.last_verified) < max_period {
            return;
        }

        let before = state.records.len();
        state.records.retain(|_, records| match records.last() {
            Some(longest) => now.saturating_sub(longest.window_start) <= max_period,
            None => false,
        });
        let evicted = before - state.records.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = state.records.len(), "memory store evicted stale keys");
        }

        // Fresh reading: the scan itself may take a while.
        state.last_verified = self.clock.now();
    }
}

impl<K> Store<K> for MemoryStore<K>
where
    K: Hash + Eq + Clone + Send + Sync,
{
    fn setup(&mut self, rates: &RateGroup) {
        let rates: Arc<[Rate]> = rates.rates().into();
        let max_period = rates.iter().map(Rate::period).max().unwrap_or_default();
        if self.binding.is_some() {
            tracing::debug!(rates = rates.len(), "memory store re-bound; discarding usage");
        }
        self.lock().records.clear();
        self.binding = Some(Binding { rates, max_period });
    }

    fn acquire(&self, key: &K) -> Result<Decision, StoreError> {
        let binding = self.binding.as_ref().ok_or(StoreError::NotBound)?;
        let mut guard = self.lock();
        // Read under the lock so decisions are made in clock order.
        let now = self.clock.now();
        let state = &mut *guard;
        self.evict_stale(state, now, binding.max_period);

        let Some(records) = state.records.get_mut(key) else {
            let fresh = binding.rates.iter().map(|rate| UsageRecord::opened(rate, now)).collect();
            state.records.insert(key.clone(), fresh);
            return Ok(Decision::Allowed);
        };

        // Only exhausted windows are checked for expiry; records with tokens left
        // just spend one, even when another rate denies the call.
        let mut worst: Option<(Duration, Rate)> = None;
        for (record, rate) in records.iter_mut().zip(binding.rates.iter()) {
            if record.uses_left > 0 {
                record.uses_left -= 1;
                continue;
            }
            let reset_at = record.window_start.saturating_add(rate.period());
            if reset_at <= now {
                *record = UsageRecord::opened(rate, now);
            } else {
                let retry = reset_at - now;
                let longer = match worst {
                    Some((longest, _)) => retry > longest,
                    None => true,
                };
                if longer {
                    worst = Some((retry, *rate));
                }
            }
        }

        Ok(match worst {
            None => Decision::Allowed,
            Some((retry_after, rate)) => Decision::Denied { retry_after, rate },
        })
    }

    fn reset(&self, key: &K) -> Result<(), StoreError> {
        if self.binding.is_none() {
            return Err(StoreError::NotBound);
        }
        self.lock().records.remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        if self.binding.is_none() {
            return Err(StoreError::NotBound);
        }
        self.lock().records.clear();
        Ok(())
    }
}
