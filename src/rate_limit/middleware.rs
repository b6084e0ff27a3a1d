//! Tower middleware that rate-limits services per request key.
//!
//! - [`RateLimitLayer`] rejects over-limit requests with [`LimitError::RateLimited`]
//!   without calling the inner service.
//! - [`BucketLayer`] waits for a token (and a concurrency slot) and holds the permit
//!   until the inner call completes.

use crate::bucket::Bucket;
use crate::error::LimitError;
use crate::rate_limit::{AsyncStore, MemoryStore, RateLimit};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that enforces a [`RateLimit`] on requests, keyed by `key_fn`.
pub struct RateLimitLayer<K, F, S = MemoryStore<K>> {
    limit: Arc<RateLimit<K, S>>,
    key_fn: Arc<F>,
}

impl<K, F, S> RateLimitLayer<K, F, S> {
    /// Create a new rate limit layer. `key_fn` maps each request to its rate limit key.
    pub fn new(limit: Arc<RateLimit<K, S>>, key_fn: F) -> Self {
        Self { limit, key_fn: Arc::new(key_fn) }
    }
}

impl<K, F, S> Clone for RateLimitLayer<K, F, S> {
    fn clone(&self) -> Self {
        Self { limit: Arc::clone(&self.limit), key_fn: Arc::clone(&self.key_fn) }
    }
}

impl<K, F, S: fmt::Debug> fmt::Debug for RateLimitLayer<K, F, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer").field("limit", &self.limit).finish_non_exhaustive()
    }
}

impl<Svc, K, F, S> Layer<Svc> for RateLimitLayer<K, F, S> {
    type Service = RateLimitService<Svc, K, F, S>;

    fn layer(&self, service: Svc) -> Self::Service {
        RateLimitService {
            inner: service,
            limit: Arc::clone(&self.limit),
            key_fn: Arc::clone(&self.key_fn),
        }
    }
}

/// Middleware service that rejects requests over the limit.
pub struct RateLimitService<Svc, K, F, S = MemoryStore<K>> {
    inner: Svc,
    limit: Arc<RateLimit<K, S>>,
    key_fn: Arc<F>,
}

impl<Svc: Clone, K, F, S> Clone for RateLimitService<Svc, K, F, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limit: Arc::clone(&self.limit),
            key_fn: Arc::clone(&self.key_fn),
        }
    }
}

impl<Svc: fmt::Debug, K, F, S: fmt::Debug> fmt::Debug for RateLimitService<Svc, K, F, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitService")
            .field("inner", &self.inner)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl<Svc, K, F, S, Req> Service<Req> for RateLimitService<Svc, K, F, S>
where
    Svc: Service<Req> + Clone + Send + 'static,
    Svc::Future: Send + 'static,
    F: Fn(&Req) -> K + Send + Sync + 'static,
    K: Send + Sync + 'static,
    S: AsyncStore<K> + 'static,
    Req: Send + 'static,
{
    type Response = Svc::Response;
    type Error = LimitError<Svc::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(LimitError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let key = (self.key_fn)(&req);
        let limit = Arc::clone(&self.limit);
        // The readied service goes into the future; a fresh clone takes its place.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            limit.acquire(&key).await?;
            inner.call(req).await.map_err(LimitError::Inner)
        })
    }
}

/// A layer that routes requests through a [`Bucket`], waiting instead of rejecting.
pub struct BucketLayer<K, F, S = MemoryStore<K>> {
    bucket: Bucket<K, S>,
    key_fn: Arc<F>,
}

impl<K, F, S> BucketLayer<K, F, S> {
    /// Create a new bucket layer. `key_fn` maps each request to its rate limit key.
    pub fn new(bucket: Bucket<K, S>, key_fn: F) -> Self {
        Self { bucket, key_fn: Arc::new(key_fn) }
    }
}

impl<K, F, S> Clone for BucketLayer<K, F, S> {
    fn clone(&self) -> Self {
        Self { bucket: self.bucket.clone(), key_fn: Arc::clone(&self.key_fn) }
    }
}

impl<K, F, S: fmt::Debug> fmt::Debug for BucketLayer<K, F, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketLayer").field("bucket", &self.bucket).finish_non_exhaustive()
    }
}

impl<Svc, K, F, S> Layer<Svc> for BucketLayer<K, F, S> {
    type Service = BucketService<Svc, K, F, S>;

    fn layer(&self, service: Svc) -> Self::Service {
        BucketService {
            inner: service,
            bucket: self.bucket.clone(),
            key_fn: Arc::clone(&self.key_fn),
        }
    }
}

/// Middleware service that waits on a [`Bucket`] before each call.
pub struct BucketService<Svc, K, F, S = MemoryStore<K>> {
    inner: Svc,
    bucket: Bucket<K, S>,
    key_fn: Arc<F>,
}

impl<Svc: Clone, K, F, S> Clone for BucketService<Svc, K, F, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            bucket: self.bucket.clone(),
            key_fn: Arc::clone(&self.key_fn),
        }
    }
}

impl<Svc: fmt::Debug, K, F, S: fmt::Debug> fmt::Debug for BucketService<Svc, K, F, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketService")
            .field("inner", &self.inner)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl<Svc, K, F, S, Req> Service<Req> for BucketService<Svc, K, F, S>
where
    Svc: Service<Req> + Clone + Send + 'static,
    Svc::Future: Send + 'static,
    F: Fn(&Req) -> K + Send + Sync + 'static,
    K: Send + Sync + 'static,
    S: AsyncStore<K> + 'static,
    Req: Send + 'static,
{
    type Response = Svc::Response;
    type Error = LimitError<Svc::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(LimitError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let key = (self.key_fn)(&req);
        let bucket = self.bucket.clone();
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let _permit = bucket.acquire(&key).await?;
            inner.call(req).await.map_err(LimitError::Inner)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::StoreError;
    use crate::rate::Rate;
    use crate::sleeper::ManualSleeper;
    use futures::future::{ready, Ready};
    use std::convert::Infallible;
    use std::time::Duration;
    use tower::{service_fn, ServiceExt};

    #[derive(Debug)]
    struct Request {
        user: &'static str,
    }

    fn echo(req: Request) -> Ready<Result<&'static str, Infallible>> {
        ready(Ok(req.user))
    }

    #[tokio::test]
    async fn rejects_without_calling_inner() {
        let clock = ManualClock::new();
        let limit = Arc::new(
            RateLimit::with_store(
                Rate::MINUTE,
                MemoryStore::<&'static str>::new().with_clock(clock.clone()),
            )
            .unwrap(),
        );
        let layer = RateLimitLayer::new(limit, |req: &Request| req.user);
        let svc = layer.layer(service_fn(echo));

        let ok = svc.clone().oneshot(Request { user: "ann" }).await.unwrap();
        assert_eq!(ok, "ann");

        clock.advance(Duration::from_secs(20));
        let err = svc.clone().oneshot(Request { user: "ann" }).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(40)));

        // Other keys are unaffected.
        assert_eq!(svc.oneshot(Request { user: "bo" }).await.unwrap(), "bo");
    }

    #[tokio::test]
    async fn inner_errors_are_wrapped() {
        let limit = Arc::new(RateLimit::new(Rate::per_second(10).unwrap()).unwrap());
        let failing = service_fn(|_req: Request| async {
            Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "down"))
        });
        let svc = RateLimitLayer::new(limit, |req: &Request| req.user).layer(failing);

        let err = svc.oneshot(Request { user: "ann" }).await.unwrap_err();
        assert!(err.is_inner());
        assert_eq!(err.to_string(), "down");
    }

    #[tokio::test]
    async fn bucket_layer_waits_for_window() {
        let clock = ManualClock::new();
        let sleeper = ManualSleeper::new(clock.clone());
        let bucket = Bucket::builder(Rate::per_minute(2).unwrap())
            .store(MemoryStore::<&'static str>::new().with_clock(clock.clone()))
            .sleeper(sleeper.clone())
            .concurrency(1)
            .build()
            .unwrap();
        let mut svc = BucketLayer::new(bucket.clone(), |req: &Request| req.user).layer(service_fn(echo));

        for _ in 0..3 {
            let out = svc.ready().await.unwrap().call(Request { user: "ann" }).await.unwrap();
            assert_eq!(out, "ann");
        }
        assert_eq!(sleeper.calls(), vec![Duration::from_secs(60)]);
        assert_eq!(bucket.available_slots(), Some(1));
    }

    #[tokio::test]
    async fn bucket_layer_surfaces_store_failures() {
        #[derive(Debug)]
        struct Offline;

        #[async_trait::async_trait]
        impl AsyncStore<&'static str> for Offline {
            fn setup(&mut self, _rates: &crate::rate::RateGroup) {}

            async fn acquire(
                &self,
                _key: &&'static str,
            ) -> Result<crate::rate_limit::Decision, StoreError> {
                Err(StoreError::Backend("offline".into()))
            }

            async fn reset(&self, _key: &&'static str) -> Result<(), StoreError> {
                Ok(())
            }

            async fn clear(&self) -> Result<(), StoreError> {
                Ok(())
            }
        }

        let bucket = Bucket::<&'static str>::builder(Rate::SECOND).store(Offline).build().unwrap();
        let svc = BucketLayer::new(bucket, |req: &Request| req.user).layer(service_fn(echo));

        let err = svc.oneshot(Request { user: "ann" }).await.unwrap_err();
        assert!(matches!(err, LimitError::Store(StoreError::Backend(ref msg)) if msg == "offline"));
    }
}
