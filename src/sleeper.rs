//! Abstraction for sleeping/waiting
//!
//! Buckets wait for rate windows through these traits: [`Sleeper`] suspends a task,
//! [`BlockingSleeper`] blocks a thread. Test sleepers enable fast, deterministic tests
//! without real time delays.

use crate::clock::ManualClock;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Abstraction for sleeping/waiting inside an async runtime
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Abstraction for waiting outside an async runtime by blocking the current thread
pub trait BlockingSleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration);
}

/// Production sleeper using tokio runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Production sleeper blocking the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl BlockingSleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Test sleeper that doesn't actually sleep
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

impl BlockingSleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) {}
}

/// Test sleeper that tracks all sleep calls
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn record(&self, duration: Duration) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(duration);
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.record(duration);
        Box::pin(async {})
    }
}

impl BlockingSleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) {
        self.record(duration);
    }
}

/// Test sleeper that advances a [`ManualClock`] instead of waiting, and tracks calls.
///
/// Pair it with a store reading the same clock to drive wait loops deterministically.
#[derive(Debug, Clone)]
pub struct ManualSleeper {
    clock: ManualClock,
    tracker: TrackingSleeper,
}

impl ManualSleeper {
    pub fn new(clock: ManualClock) -> Self {
        Self { clock, tracker: TrackingSleeper::new() }
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.tracker.calls()
    }
}

impl Sleeper for ManualSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.tracker.record(duration);
        self.clock.advance(duration);
        Box::pin(async {})
    }
}

impl BlockingSleeper for ManualSleeper {
    fn sleep(&self, duration: Duration) {
        self.tracker.record(duration);
        self.clock.advance(duration);
    }
}
