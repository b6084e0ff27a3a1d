#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # uprate
//!
//! Multi-rate admission control for Rust: enforce several "uses per period" limits
//! on the same key space at once, and wait (or fail fast) when any of them is spent.
//!
//! ## Features
//!
//! - **Composable rates**: `Rate::per_second(5)? | Rate::per_hour(1000)?`
//! - **Fixed-window counting** per key and per rate, reporting the longest wait
//! - **Pluggable stores** through the [`Store`] and [`AsyncStore`] traits, with an
//!   in-memory store that evicts stale keys
//! - **Buckets** that add a concurrency gate and wait out denials, for tokio tasks
//!   ([`Bucket`]) or OS threads ([`BlockingBucket`])
//! - **Tower middleware** via [`RateLimitLayer`] and [`BucketLayer`]
//!
//! ## Quick Start
//!
//! ```rust
//! use uprate::{Bucket, Rate, RateLimit};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Fail fast: at most 2 calls per second and 100 per hour for each user.
//!     let limit = RateLimit::new(Rate::per_second(2)? | Rate::per_hour(100)?)?;
//!     limit.acquire(&"alice").await?;
//!
//!     // Or wait: at most 4 in flight, 10 per second.
//!     let bucket = Bucket::builder(Rate::per_second(10)?).concurrency(4).build()?;
//!     let _permit = bucket.acquire(&"alice").await?;
//!     Ok(())
//! }
//! ```

pub mod bucket;
pub mod clock;
pub mod error;
pub mod prelude;
pub mod rate;
pub mod rate_limit;
pub mod sleeper;

// Re-exports
pub use bucket::{BlockingBucket, BlockingPermit, Bucket, BucketBuilder, BucketPermit};
pub use clock::{Clock, ManualClock, MonotonicClock, TokioClock};
pub use error::{AcquireError, BuildError, LimitError, RateError, StoreError};
pub use rate::{Rate, RateGroup};
pub use rate_limit::{
    AsyncStore, BucketLayer, BucketService, Decision, MemoryStore, RateLimit, RateLimitLayer,
    RateLimitService, Store,
};
pub use sleeper::{
    BlockingSleeper, InstantSleeper, ManualSleeper, Sleeper, ThreadSleeper, TokioSleeper,
    TrackingSleeper,
};
