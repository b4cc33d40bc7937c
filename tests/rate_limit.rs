use std::sync::Arc;
use std::time::Duration;

use batchline::rate_limit::{LimiterKey, MicroLimiter, Pacer, RateLimiters};
use batchline::{PipelineError, RateConstraint};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn request_spacing_is_at_least_sixty_over_rpm() {
    let limiter = MicroLimiter::new();
    let constraint = RateConstraint::new(30);
    let cancel = CancellationToken::new();

    let mut admitted = Vec::new();
    for _ in 0..4 {
        limiter.acquire(&constraint, 0, &cancel).await.unwrap();
        admitted.push(Instant::now());
    }
    for pair in admitted.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(2));
    }
}

#[tokio::test(start_paused = true)]
async fn token_budget_spacing_scales_with_estimate() {
    let limiter = MicroLimiter::new();
    // 600 RPM would allow 100ms spacing; 60k TPM with 5k-token requests
    // needs 5s between admissions.
    let constraint = RateConstraint::new(600).with_tokens_per_minute(60_000);
    let cancel = CancellationToken::new();

    limiter.acquire(&constraint, 5_000, &cancel).await.unwrap();
    let first = Instant::now();
    let waited = limiter.acquire(&constraint, 5_000, &cancel).await.unwrap();
    assert!(Instant::now() - first >= Duration::from_secs(5));
    assert_eq!(waited, Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn waits_are_not_double_counted() {
    let limiter = MicroLimiter::new();
    let constraint = RateConstraint::new(60).with_tokens_per_minute(60_000);
    let cancel = CancellationToken::new();

    limiter.acquire(&constraint, 1_000, &cancel).await.unwrap();
    let waited = limiter.acquire(&constraint, 1_000, &cancel).await.unwrap();
    // Both budgets want one second; the second step finds it already covered.
    assert_eq!(waited, Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn elapsed_time_counts_toward_spacing() {
    let limiter = MicroLimiter::new();
    let constraint = RateConstraint::new(60);
    let cancel = CancellationToken::new();

    limiter.acquire(&constraint, 0, &cancel).await.unwrap();
    tokio::time::advance(Duration::from_millis(700)).await;
    let waited = limiter.acquire(&constraint, 0, &cancel).await.unwrap();
    assert_eq!(waited, Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn concurrent_acquisitions_on_one_key_are_serialized() {
    let limiters = Arc::new(RateLimiters::new());
    let key = LimiterKey::new("gemini", "gemini-2.5-flash", "FREE");
    let constraint = RateConstraint::new(60);
    let start = Instant::now();

    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let limiters = Arc::clone(&limiters);
            let key = key.clone();
            let constraint = constraint.clone();
            tokio::spawn(async move {
                limiters
                    .limiter(&key)
                    .acquire(&constraint, 0, &CancellationToken::new())
                    .await
                    .unwrap();
                Instant::now()
            })
        })
        .collect();

    let mut times = Vec::new();
    for task in tasks {
        times.push(task.await.unwrap() - start);
    }
    times.sort();
    assert_eq!(times[0], Duration::ZERO);
    assert!(times[1] >= Duration::from_secs(1));
    assert!(times[2] >= Duration::from_secs(2));
    assert_eq!(limiters.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn keys_are_independent() {
    let limiters = RateLimiters::new();
    let constraint = RateConstraint::new(1);
    let cancel = CancellationToken::new();
    let flash = LimiterKey::new("gemini", "gemini-2.5-flash", "free");
    let pro = LimiterKey::new("gemini", "gemini-2.5-pro", "free");

    limiters.limiter(&flash).acquire(&constraint, 0, &cancel).await.unwrap();
    let waited = limiters
        .limiter(&pro)
        .acquire(&constraint, 0, &cancel)
        .await
        .unwrap();
    assert_eq!(waited, Duration::ZERO);
    assert_eq!(limiters.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_a_wait() {
    let limiter = Arc::new(MicroLimiter::new());
    let constraint = RateConstraint::new(1);
    let cancel = CancellationToken::new();

    limiter.acquire(&constraint, 0, &cancel).await.unwrap();
    let pending = tokio::spawn({
        let limiter = Arc::clone(&limiter);
        let cancel = cancel.clone();
        async move { limiter.acquire(&constraint, 0, &cancel).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();
    assert_eq!(pending.await.unwrap(), Err(PipelineError::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn burst_factor_tightens_request_spacing() {
    let limiter = MicroLimiter::new();
    let constraint = RateConstraint::new(60).with_burst_factor(2.0);
    let cancel = CancellationToken::new();

    limiter.acquire(&constraint, 0, &cancel).await.unwrap();
    let waited = limiter.acquire(&constraint, 0, &cancel).await.unwrap();
    assert_eq!(waited, Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn min_interval_applies_when_stricter() {
    let limiter = MicroLimiter::new();
    let cancel = CancellationToken::new();

    let strict = RateConstraint::new(60).with_min_interval(1_500);
    limiter.acquire(&strict, 0, &cancel).await.unwrap();
    let waited = limiter.acquire(&strict, 0, &cancel).await.unwrap();
    assert_eq!(waited, Duration::from_millis(1_500));

    // Looser than the request spacing: no extra wait.
    let loose = RateConstraint::new(60).with_min_interval(200);
    let waited = limiter.acquire(&loose, 0, &cancel).await.unwrap();
    assert_eq!(waited, Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn pacers_on_one_key_share_the_limiter() {
    let limiters = RateLimiters::new();
    let key = LimiterKey::new("gemini", "gemini-2.5-flash", "free");
    let constraint = RateConstraint::new(30);
    let cancel = CancellationToken::new();

    let first = Pacer::new(&limiters, key.clone(), constraint.clone(), 0);
    first.admit_first(&cancel).await.unwrap();
    first.admit(&cancel).await.unwrap();

    // A second plan on the same key waits out the first plan's request.
    let second = Pacer::new(&limiters, key, constraint, 0);
    let waited = second.admit_first(&cancel).await.unwrap();
    assert_eq!(waited, Duration::from_secs(2));
    assert_eq!(second.waited(), Duration::from_secs(2));
}
