//! Buckets: rate limits plus an optional concurrency gate, waiting instead of failing.
//!
//! Semantics:
//! - `concurrency` bounds how many permits are alive at once; `0` disables the gate.
//! - `acquire` first waits for a free slot, then retries the rate limit, sleeping for the
//!   reported `retry_after` after each denial, until a token is granted.
//! - Store failures abort the wait and are returned to the caller.
//! - Sleepers control how waits are applied (production uses `TokioSleeper` or
//!   `ThreadSleeper`; tests can inject `ManualSleeper`/`TrackingSleeper`).
//!
//! Invariants:
//! - A slot is held from the moment it is granted until the permit is dropped, including
//!   while waiting on the rate limit.
//! - Every slot taken is released exactly once: on drop, early return, panic, or
//!   cancellation of the `acquire` future.
//! - Releasing a slot never touches the rate limit.
//!
//! Example
//! ```rust
//! use uprate::{Bucket, Rate};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let bucket = Bucket::builder(Rate::per_second(30).unwrap())
//!     .concurrency(2)
//!     .build()
//!     .unwrap();
//!
//! let permit = bucket.acquire(&"api").await.unwrap();
//! assert_eq!(bucket.available_slots(), Some(1));
//! drop(permit);
//!
//! let answer = bucket.execute(&"api", || async { 42 }).await.unwrap();
//! assert_eq!(answer, 42);
//! # });
//! ```

use crate::error::{AcquireError, BuildError, RateError, StoreError};
use crate::rate::{Rate, RateGroup};
use crate::rate_limit::{AsyncStore, MemoryStore, RateLimit, Store};
use crate::sleeper::{BlockingSleeper, Sleeper, ThreadSleeper, TokioSleeper};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Outcome of one pass through the wait loop.
enum Step {
    Proceed,
    Wait(Duration),
}

/// Turns rate limit outcomes into wait steps, shared by both bucket flavors.
#[derive(Debug, Default)]
struct WaitLoop {
    attempt: u32,
}

impl WaitLoop {
    fn step(&mut self, outcome: Result<(), AcquireError>) -> Result<Step, AcquireError> {
        match outcome {
            Ok(()) => Ok(Step::Proceed),
            Err(AcquireError::RateLimited { retry_after, rate }) => {
                self.attempt += 1;
                tracing::trace!(attempt = self.attempt, wait = ?retry_after, %rate, "bucket waiting for rate window");
                Ok(Step::Wait(retry_after))
            }
            Err(err) => Err(err),
        }
    }
}

fn checked_concurrency(requested: usize) -> Result<usize, BuildError> {
    if requested > Semaphore::MAX_PERMITS {
        return Err(BuildError::ConcurrencyTooLarge { requested, max: Semaphore::MAX_PERMITS });
    }
    Ok(requested)
}

/// Async bucket: waits on a tokio semaphore for a slot and sleeps on denials.
pub struct Bucket<K, S = MemoryStore<K>> {
    limit: Arc<RateLimit<K, S>>,
    slots: Option<Arc<Semaphore>>,
    concurrency: usize,
    sleeper: Arc<dyn Sleeper>,
}

impl<K, S> Clone for Bucket<K, S> {
    fn clone(&self) -> Self {
        Self {
            limit: Arc::clone(&self.limit),
            slots: self.slots.clone(),
            concurrency: self.concurrency,
            sleeper: Arc::clone(&self.sleeper),
        }
    }
}

impl<K, S: fmt::Debug> fmt::Debug for Bucket<K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("limit", &self.limit)
            .field("concurrency", &self.concurrency)
            .field("available_slots", &self.available_slots())
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

/// Proof of admission from a [`Bucket`]. Dropping it frees the concurrency slot.
#[must_use = "the slot is released as soon as the permit is dropped"]
#[derive(Debug)]
pub struct BucketPermit {
    _slot: Option<OwnedSemaphorePermit>,
}

impl<K> Bucket<K, MemoryStore<K>>
where
    K: Hash + Eq + Clone + Send + Sync,
{
    /// Bucket without a concurrency gate, backed by a fresh [`MemoryStore`].
    pub fn new(rate: impl Into<RateGroup>) -> Result<Self, RateError> {
        Ok(Self::from_limit(Arc::new(RateLimit::new(rate)?)))
    }

    /// Construct a builder with defaults: in-memory store, no gate, `TokioSleeper`.
    pub fn builder(rate: impl Into<RateGroup>) -> BucketBuilder<K, MemoryStore<K>> {
        BucketBuilder::new(rate, MemoryStore::new())
    }
}

impl<K, S> Bucket<K, S> {
    /// Ungated bucket over an existing, possibly shared, rate limit.
    pub fn from_limit(limit: Arc<RateLimit<K, S>>) -> Self {
        Self { limit, slots: None, concurrency: 0, sleeper: Arc::new(TokioSleeper) }
    }

    /// Rates in ascending period order.
    pub fn rates(&self) -> &[Rate] {
        self.limit.rates()
    }

    pub fn limit(&self) -> &Arc<RateLimit<K, S>> {
        &self.limit
    }

    /// Configured concurrency; `0` means ungated.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Free slots, or `None` when ungated.
    pub fn available_slots(&self) -> Option<usize> {
        self.slots.as_ref().map(|slots| slots.available_permits())
    }

    /// Close the concurrency gate, shared by every clone of this bucket.
    ///
    /// Pending and future acquisitions fail with [`AcquireError::GateClosed`];
    /// permits already handed out stay valid. An ungated bucket has no gate to close.
    pub fn close(&self) {
        if let Some(slots) = &self.slots {
            slots.close();
            tracing::debug!("bucket gate closed");
        }
    }

    /// Whether the concurrency gate was closed.
    pub fn is_closed(&self) -> bool {
        self.slots.as_ref().is_some_and(|slots| slots.is_closed())
    }
}

impl<K, S> Bucket<K, S>
where
    K: Send + Sync,
    S: AsyncStore<K>,
{
    /// Wait for a slot and a usage token for `key`.
    ///
    /// # Errors
    /// [`AcquireError::Store`] if the store fails (the slot is released),
    /// [`AcquireError::GateClosed`] if the slot pool was closed.
    pub async fn acquire(&self, key: &K) -> Result<BucketPermit, AcquireError> {
        let slot = match &self.slots {
            Some(slots) => {
                let permit =
                    Arc::clone(slots).acquire_owned().await.map_err(|_| AcquireError::GateClosed)?;
                tracing::trace!(available = slots.available_permits(), "bucket slot acquired");
                Some(permit)
            }
            None => None,
        };

        let mut wait = WaitLoop::default();
        loop {
            match wait.step(self.limit.acquire(key).await)? {
                Step::Proceed => return Ok(BucketPermit { _slot: slot }),
                Step::Wait(delay) => self.sleeper.sleep(delay).await,
            }
        }
    }

    /// Acquire, run `operation`, and release the slot when it completes.
    pub async fn execute<T, Fut, Op>(&self, key: &K, operation: Op) -> Result<T, AcquireError>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.acquire(key).await?;
        Ok(operation().await)
    }

    /// Forget usage for `key`, or for every key when `key` is `None`.
    pub async fn reset(&self, key: Option<&K>) -> Result<(), StoreError> {
        self.limit.reset(key).await
    }
}

/// Builder for [`Bucket`] and [`BlockingBucket`].
pub struct BucketBuilder<K, S = MemoryStore<K>> {
    rates: RateGroup,
    store: S,
    concurrency: usize,
    sleeper: Arc<dyn Sleeper>,
    blocking_sleeper: Arc<dyn BlockingSleeper>,
    _key: PhantomData<fn(&K)>,
}

impl<K, S> BucketBuilder<K, S> {
    fn new(rate: impl Into<RateGroup>, store: S) -> Self {
        Self {
            rates: rate.into(),
            store,
            concurrency: 0,
            sleeper: Arc::new(TokioSleeper),
            blocking_sleeper: Arc::new(ThreadSleeper),
            _key: PhantomData,
        }
    }

    /// Use `store` instead of a fresh in-memory store.
    pub fn store<S2>(self, store: S2) -> BucketBuilder<K, S2> {
        BucketBuilder {
            rates: self.rates,
            store,
            concurrency: self.concurrency,
            sleeper: self.sleeper,
            blocking_sleeper: self.blocking_sleeper,
            _key: PhantomData,
        }
    }

    /// Maximum number of live permits. `0` (the default) disables the gate.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sleeper used by [`Bucket`] between denied attempts.
    pub fn sleeper<T>(mut self, sleeper: T) -> Self
    where
        T: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Sleeper used by [`BlockingBucket`] between denied attempts.
    pub fn blocking_sleeper<T>(mut self, sleeper: T) -> Self
    where
        T: BlockingSleeper + 'static,
    {
        self.blocking_sleeper = Arc::new(sleeper);
        self
    }

    /// Build an async bucket.
    ///
    /// # Errors
    /// [`BuildError::ConcurrencyTooLarge`] above [`Semaphore::MAX_PERMITS`],
    /// [`BuildError::Rate`] for an empty rate group.
    pub fn build(self) -> Result<Bucket<K, S>, BuildError>
    where
        K: Send + Sync,
        S: AsyncStore<K>,
    {
        let concurrency = checked_concurrency(self.concurrency)?;
        let limit = RateLimit::with_store(self.rates, self.store)?;
        let slots = (concurrency > 0).then(|| Arc::new(Semaphore::new(concurrency)));
        Ok(Bucket { limit: Arc::new(limit), slots, concurrency, sleeper: self.sleeper })
    }

    /// Build a thread-blocking bucket over a synchronous store.
    ///
    /// # Errors
    /// Same as [`BucketBuilder::build`].
    pub fn build_blocking(self) -> Result<BlockingBucket<K, S>, BuildError>
    where
        K: Send + Sync,
        S: Store<K>,
    {
        let concurrency = checked_concurrency(self.concurrency)?;
        let limit = RateLimit::with_store(self.rates, self.store)?;
        let slots = (concurrency > 0).then(|| Arc::new(SlotPool::new(concurrency)));
        Ok(BlockingBucket {
            limit: Arc::new(limit),
            slots,
            concurrency,
            sleeper: self.blocking_sleeper,
        })
    }
}

impl<K, S: fmt::Debug> fmt::Debug for BucketBuilder<K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketBuilder")
            .field("rates", &self.rates)
            .field("store", &self.store)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

/// Counting gate for OS threads.
#[derive(Debug)]
struct SlotPool {
    available: Mutex<usize>,
    freed: Condvar,
}

impl SlotPool {
    fn new(size: usize) -> Self {
        Self { available: Mutex::new(size), freed: Condvar::new() }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.available.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("slot pool mutex poisoned; recovering");
            poisoned.into_inner()
        })
    }

    fn take(self: &Arc<Self>) -> SlotGuard {
        let mut available = self.lock();
        while *available == 0 {
            available = self.freed.wait(available).unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *available -= 1;
        tracing::trace!(available = *available, "bucket slot acquired");
        SlotGuard { pool: Arc::clone(self) }
    }

    fn available(&self) -> usize {
        *self.lock()
    }
}

#[derive(Debug)]
struct SlotGuard {
    pool: Arc<SlotPool>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        *self.pool.lock() += 1;
        self.pool.freed.notify_one();
    }
}

/// Thread-blocking bucket over a synchronous [`Store`].
pub struct BlockingBucket<K, S = MemoryStore<K>> {
    limit: Arc<RateLimit<K, S>>,
    slots: Option<Arc<SlotPool>>,
    concurrency: usize,
    sleeper: Arc<dyn BlockingSleeper>,
}

impl<K, S> Clone for BlockingBucket<K, S> {
    fn clone(&self) -> Self {
        Self {
            limit: Arc::clone(&self.limit),
            slots: self.slots.clone(),
            concurrency: self.concurrency,
            sleeper: Arc::clone(&self.sleeper),
        }
    }
}

impl<K, S: fmt::Debug> fmt::Debug for BlockingBucket<K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingBucket")
            .field("limit", &self.limit)
            .field("concurrency", &self.concurrency)
            .field("available_slots", &self.available_slots())
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

/// Proof of admission from a [`BlockingBucket`]. Dropping it frees the concurrency slot.
#[must_use = "the slot is released as soon as the permit is dropped"]
#[derive(Debug)]
pub struct BlockingPermit {
    _slot: Option<SlotGuard>,
}

impl<K> BlockingBucket<K, MemoryStore<K>>
where
    K: Hash + Eq + Clone + Send + Sync,
{
    /// Blocking bucket without a concurrency gate, backed by a fresh [`MemoryStore`].
    pub fn new(rate: impl Into<RateGroup>) -> Result<Self, RateError> {
        Ok(Self::from_limit(Arc::new(RateLimit::new(rate)?)))
    }
}

impl<K, S> BlockingBucket<K, S> {
    /// Ungated bucket over an existing, possibly shared, rate limit.
    pub fn from_limit(limit: Arc<RateLimit<K, S>>) -> Self {
        Self { limit, slots: None, concurrency: 0, sleeper: Arc::new(ThreadSleeper) }
    }

    /// Rates in ascending period order.
    pub fn rates(&self) -> &[Rate] {
        self.limit.rates()
    }

    pub fn limit(&self) -> &Arc<RateLimit<K, S>> {
        &self.limit
    }

    /// Configured concurrency; `0` means ungated.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Free slots, or `None` when ungated.
    pub fn available_slots(&self) -> Option<usize> {
        self.slots.as_ref().map(|slots| slots.available())
    }
}

impl<K, S> BlockingBucket<K, S>
where
    S: Store<K>,
{
    /// Block until a slot and a usage token for `key` are available.
    ///
    /// # Errors
    /// [`AcquireError::Store`] if the store fails (the slot is released).
    pub fn acquire(&self, key: &K) -> Result<BlockingPermit, AcquireError> {
        let slot = self.slots.as_ref().map(SlotPool::take);

        let mut wait = WaitLoop::default();
        loop {
            match wait.step(self.limit.acquire_sync(key))? {
                Step::Proceed => return Ok(BlockingPermit { _slot: slot }),
                Step::Wait(delay) => self.sleeper.sleep(delay),
            }
        }
    }

    /// Acquire, run `operation`, and release the slot when it returns or panics.
    pub fn execute<T, Op>(&self, key: &K, operation: Op) -> Result<T, AcquireError>
    where
        Op: FnOnce() -> T,
    {
        let _permit = self.acquire(key)?;
        Ok(operation())
    }

    /// Forget usage for `key`, or for every key when `key` is `None`.
    pub fn reset(&self, key: Option<&K>) -> Result<(), StoreError> {
        self.limit.reset_sync(key)
    }
}
