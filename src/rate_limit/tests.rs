use super::*;

const KEY: &str = "channels/100/messages";

#[test]
fn test_bucket_starts_full_and_drains() {
    let now = Instant::now();
    let mut bucket = RateLimitBucket::new(KEY, 2, Duration::from_secs(60));

    assert_eq!(bucket.try_admit(now), Admission::Admitted);
    assert_eq!(bucket.remaining, 1);
    assert_eq!(bucket.try_admit(now), Admission::Admitted);
    assert_eq!(bucket.remaining, 0);

    // Exhausted: must wait for the window opened by the first call
    assert_eq!(
        bucket.try_admit(now),
        Admission::WaitUntil(now + Duration::from_secs(60))
    );
    assert_eq!(bucket.remaining, 0);
}

#[test]
fn test_bucket_resets_after_window() {
    let now = Instant::now();
    let mut bucket = RateLimitBucket::new(KEY, 1, Duration::from_secs(1));

    assert_eq!(bucket.try_admit(now), Admission::Admitted);
    assert!(matches!(bucket.try_admit(now), Admission::WaitUntil(_)));

    let later = now + Duration::from_secs(1);
    assert_eq!(bucket.try_admit(later), Admission::Admitted);
    assert_eq!(bucket.reset_at, Some(later + Duration::from_secs(1)));
}

#[test]
fn test_zero_limit_is_clamped_to_one() {
    let mut bucket = RateLimitBucket::new(KEY, 0, Duration::from_secs(1));
    assert_eq!(bucket.limit, 1);
    assert_eq!(bucket.try_admit(Instant::now()), Admission::Admitted);
}

#[test]
fn test_header_update_is_authoritative() {
    let now = Instant::now();
    let mut bucket = RateLimitBucket::new(KEY, 5, Duration::from_secs(1));

    bucket.update(
        &RateLimitHeaders {
            limit: Some(10),
            remaining: Some(0),
            reset_after: Some(Duration::from_secs(7)),
            ..Default::default()
        },
        now,
    );

    assert_eq!(bucket.limit, 10);
    assert_eq!(bucket.remaining, 0);
    assert_eq!(
        bucket.try_admit(now),
        Admission::WaitUntil(now + Duration::from_secs(7))
    );
}

#[test]
fn test_remaining_zero_without_reset_gets_local_window() {
    let now = Instant::now();
    let mut bucket = RateLimitBucket::new(KEY, 5, Duration::from_secs(2));
    bucket.update(
        &RateLimitHeaders {
            remaining: Some(0),
            ..Default::default()
        },
        now,
    );
    assert_eq!(bucket.reset_at, Some(now + Duration::from_secs(2)));
}

#[test]
fn test_penalize_overrides_budget() {
    let now = Instant::now();
    let mut bucket = RateLimitBucket::new(KEY, 5, Duration::from_secs(1));

    bucket.penalize(Duration::from_secs(3), now);
    assert_eq!(bucket.remaining, 0);
    assert_eq!(
        bucket.try_admit(now + Duration::from_secs(1)),
        Admission::WaitUntil(now + Duration::from_secs(3))
    );

    // Override expired: full budget restored
    assert_eq!(
        bucket.try_admit(now + Duration::from_secs(3)),
        Admission::Admitted
    );
    assert_eq!(bucket.remaining, 4);
    assert!(bucket.retry_after.is_none());
}

/// budget=2, window=60s: first two calls are immediate, the third waits for reset.
#[tokio::test(start_paused = true)]
async fn test_third_call_blocks_until_reset() {
    let limiter = RateLimiter::new(2, Duration::from_secs(60));
    let start = Instant::now();

    limiter.acquire(KEY).await;
    limiter.acquire(KEY).await;
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(limiter.remaining(KEY).await, Some(0));

    // Still blocked just before the reset
    let early = tokio::time::timeout(Duration::from_secs(59), limiter.acquire(KEY)).await;
    assert!(early.is_err());

    limiter.acquire(KEY).await;
    assert!(start.elapsed() >= Duration::from_secs(60));
    assert_eq!(limiter.remaining(KEY).await, Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_buckets_are_independent() {
    let limiter = RateLimiter::new(1, Duration::from_secs(60));
    let start = Instant::now();

    limiter.acquire("channels/1/messages").await;
    limiter.acquire("channels/2/messages").await;

    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(limiter.bucket_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_never_overdraw() {
    let limiter = Arc::new(RateLimiter::new(3, Duration::from_secs(1)));
    let start = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let limiter = Arc::clone(&limiter);
        handles.push(tokio::spawn(async move {
            limiter.acquire(KEY).await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // 10 calls at 3 per window need four windows
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(4), "elapsed {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_global_pause_holds_every_bucket() {
    let limiter = RateLimiter::new(10, Duration::from_secs(1));
    let start = Instant::now();

    limiter.pause_all(Duration::from_secs(5));
    limiter.acquire("users/1").await;

    assert!(start.elapsed() >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_penalize_delays_next_acquire() {
    let limiter = RateLimiter::new(10, Duration::from_secs(1));
    let start = Instant::now();

    limiter.acquire(KEY).await;
    limiter.penalize(KEY, Duration::from_secs(2)).await;
    limiter.acquire(KEY).await;

    assert!(start.elapsed() >= Duration::from_secs(2));
}
