//! Convenient re-exports for common uprate types.
pub use crate::{
    bucket::{BlockingBucket, Bucket, BucketBuilder},
    error::{AcquireError, BuildError, LimitError, RateError, StoreError},
    rate::{Rate, RateGroup},
    rate_limit::{AsyncStore, BucketLayer, Decision, MemoryStore, RateLimit, RateLimitLayer, Store},
};
