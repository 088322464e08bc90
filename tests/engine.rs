use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::future::join_all;

use ratekeeper::clock::ManualClock;
use ratekeeper::ratelimit::{parse, Identifier, RateLimiter, Strategy};
use ratekeeper::store::{CounterStore, MemoryStore};
use ratekeeper::{build_identifier, parse_rate, RatekeeperError};

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn setup(strategy: Strategy) -> (RateLimiter, Arc<MemoryStore>, ManualClock) {
    let clock = ManualClock::new(start());
    let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    (RateLimiter::new(strategy, store.clone()), store, clock)
}

fn view(caller: &str) -> Identifier {
    build_identifier(&["shop.views", "checkout"], Some(&["POST"][..]), Some(&caller)).unwrap()
}

#[tokio::test]
async fn test_five_per_minute_end_to_end() {
    let (limiter, store, clock) = setup(Strategy::FixedWindow);
    let rate = parse_rate("5/minute").unwrap();
    let id = view("alice");

    for expected in (0..5).rev() {
        assert!(limiter.hit(&rate, &id).await.unwrap());
        let stats = limiter.get_window_stats(&rate, &id).await.unwrap();
        assert_eq!(stats.remaining, expected);
        assert_eq!(stats.reset_time, start() + Duration::seconds(60));
    }
    assert!(!limiter.hit(&rate, &id).await.unwrap());

    let key = id.storage_key(&rate);
    assert_eq!(key, "LIMITER/shop.views/checkout/POST/alice/5/1/minute");
    assert_eq!(store.get(&key).await.unwrap(), 6);

    clock.advance(Duration::seconds(60));
    assert!(limiter.hit(&rate, &id).await.unwrap());
    assert_eq!(store.get(&key).await.unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_hits_admit_exactly_amount() {
    for strategy in Strategy::ALL {
        let (limiter, store, _clock) = setup(strategy);
        let rate = parse("10/minute").unwrap();
        let id = view("bob");

        let hits = (0..50).map(|_| {
            let limiter = limiter.clone();
            let id = id.clone();
            tokio::spawn(async move { limiter.hit(&rate, &id).await.unwrap() })
        });
        let allowed = join_all(hits)
            .await
            .into_iter()
            .map(|result| result.unwrap())
            .filter(|allowed| *allowed)
            .count();

        assert_eq!(allowed, 10, "strategy {}", strategy);
        assert!(!store.is_empty());
    }
}

#[tokio::test]
async fn test_distinct_rates_do_not_share_counters() {
    let (limiter, _store, _clock) = setup(Strategy::FixedWindow);
    let id = view("carol");
    let per_second = parse("1/second").unwrap();
    let per_two_seconds = parse("1/2 seconds").unwrap();

    assert!(limiter.hit(&per_second, &id).await.unwrap());
    assert!(limiter.hit(&per_two_seconds, &id).await.unwrap());
    assert!(!limiter.hit(&per_second, &id).await.unwrap());
    assert!(!limiter.hit(&per_two_seconds, &id).await.unwrap());
}

#[tokio::test]
async fn test_moving_window_slides() {
    let (limiter, _store, clock) = setup(Strategy::MovingWindow);
    let rate = parse("4/minute").unwrap();
    let id = view("dave");

    for _ in 0..4 {
        assert!(limiter.hit(&rate, &id).await.unwrap());
    }
    assert!(!limiter.hit(&rate, &id).await.unwrap());

    // Halfway through the next window the five recorded hits weigh in at half.
    clock.advance(Duration::seconds(90));
    assert!(limiter.test(&rate, &id).await.unwrap());
    assert_eq!(
        limiter.get_window_stats(&rate, &id).await.unwrap().remaining,
        2
    );

    clock.advance(Duration::seconds(60));
    let stats = limiter.get_window_stats(&rate, &id).await.unwrap();
    assert_eq!(stats.remaining, 4);
    assert_eq!(stats.reset_time, clock_now(&limiter));
}

#[tokio::test]
async fn test_moving_window_does_not_accumulate_sub_windows() {
    let (limiter, store, clock) = setup(Strategy::MovingWindow);
    let rate = parse("5/second").unwrap();
    let id = view("erin");

    for _ in 0..1000 {
        assert!(limiter.hit(&rate, &id).await.unwrap());
        clock.advance(Duration::seconds(1));
    }

    assert!(store.len() <= 61, "held {} counters", store.len());
}

fn clock_now(limiter: &RateLimiter) -> DateTime<Utc> {
    limiter.store().now()
}

#[tokio::test]
async fn test_error_taxonomy() {
    assert!(matches!(
        parse_rate("5/fortnight"),
        Err(RatekeeperError::InvalidRateFormat(_))
    ));
    assert!(matches!(
        RateLimiter::from_name("token-bucket", Arc::new(MemoryStore::new())),
        Err(RatekeeperError::UnknownStrategy(_))
    ));
    assert!(matches!(
        Identifier::new(Vec::<String>::new()),
        Err(RatekeeperError::InvalidIdentifier(_))
    ));
}
