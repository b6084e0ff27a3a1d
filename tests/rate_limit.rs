use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uprate::{
    AcquireError, AsyncStore, Decision, ManualClock, MemoryStore, Rate, RateError, RateGroup,
    RateLimit, StoreError,
};

fn rate(uses: u32, secs: u64) -> Rate {
    Rate::new(uses, Duration::from_secs(secs)).expect("valid rate")
}

fn limit_with_clock(group: impl Into<RateGroup>) -> (RateLimit<String>, ManualClock) {
    let clock = ManualClock::new();
    let limit = RateLimit::with_store(group, MemoryStore::new().with_clock(clock.clone()))
        .expect("non-empty group");
    (limit, clock)
}

fn key(name: &str) -> String {
    name.to_string()
}

#[test]
fn single_rate_grants_uses_then_denies_until_window_ends() {
    let (limit, clock) = limit_with_clock(rate(5, 10));

    for _ in 0..5 {
        limit.acquire_sync(&key("k")).expect("within limit");
    }

    clock.advance(Duration::from_secs(2));
    let err = limit.acquire_sync(&key("k")).unwrap_err();
    assert_eq!(err, AcquireError::RateLimited { retry_after: Duration::from_secs(8), rate: rate(5, 10) });

    clock.advance(Duration::from_secs(8));
    limit.acquire_sync(&key("k")).expect("new window");
}

#[test]
fn every_rate_must_have_capacity() {
    // 2 per second and 3 per 10 seconds.
    let (limit, clock) = limit_with_clock(rate(2, 1) | rate(3, 10));

    limit.acquire_sync(&key("k")).unwrap();
    limit.acquire_sync(&key("k")).unwrap();
    let err = limit.acquire_sync(&key("k")).unwrap_err();
    assert_eq!(err.rate(), Some(rate(2, 1)));

    clock.advance(Duration::from_secs(1));
    // Second rate was charged by the denied call above and is now spent.
    let err = limit.acquire_sync(&key("k")).unwrap_err();
    assert_eq!(err.rate(), Some(rate(3, 10)));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(9)));
}

#[test]
fn denial_reports_the_longest_wait() {
    let (limit, clock) = limit_with_clock(rate(1, 1) | rate(1, 60) | rate(1, 5));

    limit.acquire_sync(&key("k")).unwrap();
    clock.advance(Duration::from_millis(500));
    let err = limit.acquire_sync(&key("k")).unwrap_err();
    assert_eq!(err.retry_after(), Some(Duration::from_millis(59_500)));
    assert_eq!(err.rate(), Some(rate(1, 60)));
}

#[test]
fn keys_are_isolated() {
    let (limit, _clock) = limit_with_clock(rate(1, 60));

    limit.acquire_sync(&key("a")).unwrap();
    assert!(limit.acquire_sync(&key("a")).unwrap_err().is_rate_limited());
    limit.acquire_sync(&key("b")).unwrap();
    limit.acquire_sync(&key("")).unwrap();
}

#[test]
fn reset_one_key_or_everything() {
    let (limit, _clock) = limit_with_clock(rate(1, 60));

    for name in ["a", "b", "c"] {
        limit.acquire_sync(&key(name)).unwrap();
    }

    limit.reset_sync(Some(&key("a"))).unwrap();
    limit.acquire_sync(&key("a")).unwrap();
    assert!(limit.acquire_sync(&key("b")).is_err());

    // Unknown keys are ignored.
    limit.reset_sync(Some(&key("zzz"))).unwrap();

    limit.reset_sync(None).unwrap();
    assert!(limit.store().is_empty());
    limit.acquire_sync(&key("b")).unwrap();
    limit.acquire_sync(&key("c")).unwrap();
}

#[test]
fn stale_keys_are_evicted_after_the_longest_period() {
    let (limit, clock) = limit_with_clock(rate(2, 1) | rate(10, 30));

    limit.acquire_sync(&key("old")).unwrap();
    assert_eq!(limit.store().len(), 1);

    clock.advance(Duration::from_secs(31));
    limit.acquire_sync(&key("new")).unwrap();
    assert!(!limit.store().contains_key(&key("old")));
    assert!(limit.store().contains_key(&key("new")));

    // An evicted key starts over with full capacity in every window.
    limit.acquire_sync(&key("old")).expect("first insert");
    limit.acquire_sync(&key("old")).expect("second use of 2 per second");
    let err = limit.acquire_sync(&key("old")).unwrap_err();
    assert_eq!(err.rate(), Some(rate(2, 1)));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));
}

#[test]
fn construction_is_independent_of_declaration_order() {
    let a = rate(2, 1);
    let b = rate(30, 150);
    let (first, first_clock) = limit_with_clock(a | b);
    let (second, second_clock) = limit_with_clock(b | a);
    assert_eq!(first.rates(), second.rates());

    for step in 0..40 {
        let left = first.acquire_sync(&key("k"));
        let right = second.acquire_sync(&key("k"));
        assert_eq!(left, right, "diverged at step {step}");
        first_clock.advance(Duration::from_millis(300));
        second_clock.advance(Duration::from_millis(300));
    }
}

#[test]
fn empty_group_is_rejected() {
    let err = RateLimit::<String>::new(RateGroup::new()).unwrap_err();
    assert!(matches!(err, RateError::InvalidArgumentType(_)));
}

#[test]
fn unbound_store_is_a_precondition_failure() {
    use uprate::Store;

    let store: MemoryStore<String> = MemoryStore::new();
    assert_eq!(Store::acquire(&store, &key("k")), Err(StoreError::NotBound));
}

/// Store backed by an "external" counter, to exercise the async extension point.
#[derive(Debug, Default)]
struct CountingStore {
    bound: bool,
    uses: u32,
    calls: AtomicU32,
}

#[async_trait::async_trait]
impl AsyncStore<String> for CountingStore {
    fn setup(&mut self, rates: &RateGroup) {
        self.bound = true;
        self.uses = rates.rates().iter().map(Rate::uses).min().unwrap_or(0);
    }

    async fn acquire(&self, _key: &String) -> Result<Decision, StoreError> {
        if !self.bound {
            return Err(StoreError::NotBound);
        }
        tokio::task::yield_now().await;
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.uses {
            Ok(Decision::Allowed)
        } else {
            Ok(Decision::Denied { retry_after: Duration::from_secs(1), rate: Rate::SECOND })
        }
    }

    async fn reset(&self, _key: &String) -> Result<(), StoreError> {
        self.calls.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        Err(StoreError::Backend("clear not supported".into()))
    }
}

#[tokio::test]
async fn async_stores_plug_into_rate_limits() {
    let limit = RateLimit::with_store(rate(2, 1), CountingStore::default()).unwrap();

    limit.acquire(&key("k")).await.unwrap();
    limit.acquire(&key("k")).await.unwrap();
    assert!(limit.acquire(&key("k")).await.unwrap_err().is_rate_limited());

    limit.reset(Some(&key("k"))).await.unwrap();
    limit.acquire(&key("k")).await.unwrap();

    let err = limit.reset(None).await.unwrap_err();
    assert_eq!(err, StoreError::Backend("clear not supported".into()));
}

#[tokio::test]
async fn shared_limit_is_safe_across_tasks() {
    let limit = Arc::new(RateLimit::<u32>::new(Rate::per_minute(10).unwrap()).unwrap());

    let handles = (0..50).map(|_| {
        let limit = Arc::clone(&limit);
        tokio::spawn(async move { limit.acquire(&7).await.is_ok() })
    });
    let granted = futures::future::join_all(handles)
        .await
        .into_iter()
        .filter(|ok| *ok.as_ref().unwrap())
        .count();
    assert_eq!(granted, 10);
}

#[test]
fn shared_limit_is_safe_across_threads() {
    let limit = RateLimit::<u32>::new(Rate::per_minute(25).unwrap()).unwrap();
    let granted = AtomicU32::new(0);

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..10 {
                    if limit.acquire_sync(&1).is_ok() {
                        granted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
        }
    });
    assert_eq!(granted.load(Ordering::SeqCst), 25);
}
