use quotagate::{
    Admission, AdmissionEngine, ClientKey, DegradationPolicy, EvictionPolicy, InMemoryCounterStore,
    Limit, ManualClock, MemorySink, RejectCause, RouteRule, RuleRegistry, UnregisteredRoutes,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

fn registry(quota: u32, window: Duration) -> RuleRegistry {
    RuleRegistry::builder()
        .rule(RouteRule::new("/chat", quota, window).unwrap())
        .unregistered(UnregisteredRoutes::Unlimited)
        .build()
        .unwrap()
}

fn key(s: &str) -> ClientKey {
    ClientKey::new(s).unwrap()
}

#[tokio::test]
async fn quota_plus_one_is_rejected_until_the_window_passes() {
    for quota in [1u32, 3, 7] {
        let clock = ManualClock::new();
        let engine = AdmissionEngine::builder(registry(quota, Duration::from_secs(10)))
            .degradation(DegradationPolicy::FailClosed)
            .clock(clock.clone())
            .build()
            .unwrap();

        for _ in 0..quota {
            assert!(engine.check_key(&key("K"), "/chat").await.is_ok());
        }
        clock.advance(Duration::from_millis(9_999));
        let rejection = engine.check_key(&key("K"), "/chat").await.unwrap_err();
        assert_eq!(rejection.retry_after, Duration::from_millis(1));

        clock.advance(Duration::from_millis(1));
        assert!(engine.check_key(&key("K"), "/chat").await.is_ok(), "quota {}", quota);
    }
}

#[tokio::test]
async fn worked_example_five_per_minute() {
    let clock = ManualClock::new();
    let engine = AdmissionEngine::builder(registry(5, Duration::from_secs(60)))
        .degradation(DegradationPolicy::FailOpen)
        .clock(clock.clone())
        .build()
        .unwrap();

    let mut remaining = Vec::new();
    for _ in 0..5 {
        match engine.check_key(&key("K"), "/chat").await.unwrap() {
            Admission::Limited(decision) => remaining.push(decision.remaining),
            other => panic!("unexpected admission {:?}", other),
        }
    }
    assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

    clock.set(Duration::from_secs(10));
    let rejection = engine.check_key(&key("K"), "/chat").await.unwrap_err();
    assert_eq!(rejection.cause, RejectCause::Quota);
    assert_eq!(rejection.retry_after, Duration::from_secs(50));
    assert_eq!(rejection.retry_after_secs(), 50);

    clock.set(Duration::from_secs(61));
    let admission = engine.check_key(&key("K"), "/chat").await.unwrap();
    assert_eq!(admission.decision().map(|d| d.remaining), Some(4));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_requests_admit_exactly_quota() {
    const QUOTA: u32 = 25;
    const EXTRA: usize = 75;

    let engine = Arc::new(
        AdmissionEngine::builder(registry(QUOTA, Duration::from_secs(60)))
            .degradation(DegradationPolicy::FailClosed)
            .clock(ManualClock::new())
            .build()
            .unwrap(),
    );
    let total = QUOTA as usize + EXTRA;
    let barrier = Arc::new(Barrier::new(total));

    let mut handles = Vec::with_capacity(total);
    for _ in 0..total {
        let engine = engine.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            engine.check_key(&key("K"), "/chat").await.is_ok()
        }));
    }

    let results = futures::future::join_all(handles).await;
    let admitted = results.iter().filter(|r| *r.as_ref().unwrap()).count();
    assert_eq!(admitted, QUOTA as usize);
    assert_eq!(total - admitted, EXTRA);
    assert_eq!(engine.store().entry(&key("K"), "/chat").unwrap().count(), QUOTA);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn busy_keys_do_not_affect_each_other() {
    let engine = Arc::new(
        AdmissionEngine::builder(registry(5, Duration::from_secs(60)))
            .degradation(DegradationPolicy::FailClosed)
            .clock(ManualClock::new())
            .build()
            .unwrap(),
    );

    let mut handles = Vec::new();
    for name in ["A", "B"] {
        for _ in 0..5 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.check_key(&key(name), "/chat").await.is_ok()
            }));
        }
    }
    let results = futures::future::join_all(handles).await;
    assert!(results.into_iter().all(|r| r.unwrap()));
    assert_eq!(engine.store().entry(&key("A"), "/chat").unwrap().count(), 5);
    assert_eq!(engine.store().entry(&key("B"), "/chat").unwrap().count(), 5);

    // exhausting A leaves a fresh key untouched
    assert!(engine.check_key(&key("A"), "/chat").await.is_err());
    assert!(engine.check_key(&key("C"), "/chat").await.is_ok());
}

#[tokio::test]
async fn evicted_caller_starts_over() {
    let clock = ManualClock::new();
    let store = Arc::new(InMemoryCounterStore::with_eviction(EvictionPolicy {
        idle_multiple: 10,
        ..EvictionPolicy::default()
    }));
    let sink = MemorySink::new();
    let engine = AdmissionEngine::builder(registry(2, Duration::from_secs(1)))
        .shared_store(store.clone())
        .degradation(DegradationPolicy::FailClosed)
        .clock(clock.clone())
        .sink(sink.clone())
        .build()
        .unwrap();

    engine.check_key(&key("K"), "/chat").await.unwrap();
    engine.check_key(&key("K"), "/chat").await.unwrap();
    assert!(engine.check_key(&key("K"), "/chat").await.is_err());

    clock.set(Duration::from_secs(15));
    assert_eq!(store.sweep_idle(15_000), 1);
    assert!(store.is_empty());

    let admission = engine.check_key(&key("K"), "/chat").await.unwrap();
    assert_eq!(admission.decision().map(|d| d.remaining), Some(1));
    assert_eq!(sink.events_of("rejected").len(), 1);
    assert_eq!(sink.events_of("admitted").len(), 3);
}

#[tokio::test(start_paused = true)]
async fn background_sweeper_bounds_memory() {
    let clock = ManualClock::new();
    let sink = MemorySink::new();
    let rules = RuleRegistry::builder()
        .default_limit(Limit::per_second(100))
        .unwrap()
        .build()
        .unwrap();
    let engine = AdmissionEngine::builder(rules)
        .degradation(DegradationPolicy::FailOpen)
        .clock(clock.clone())
        .sink(sink.clone())
        .build()
        .unwrap();

    for i in 0..50 {
        engine.check_key(&key(&format!("caller-{}", i)), "/any").await.unwrap();
    }
    assert_eq!(engine.store().len(), 50);

    let _sweeper = engine.spawn_sweeper(Duration::from_secs(1)).unwrap();
    clock.set(Duration::from_secs(11));
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert!(engine.store().is_empty());
    assert_eq!(sink.events_of("evicted").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn engine_owned_sweeper_runs_until_engine_drops() {
    let clock = ManualClock::new();
    let sink = MemorySink::new();
    let rules = RuleRegistry::builder()
        .default_limit(Limit::per_second(100))
        .unwrap()
        .build()
        .unwrap();
    let engine = AdmissionEngine::builder(rules)
        .degradation(DegradationPolicy::FailOpen)
        .clock(clock.clone())
        .sink(sink.clone())
        .sweep_interval(Duration::from_secs(1))
        .build()
        .unwrap();
    assert!(engine.has_sweeper());

    for i in 0..20 {
        engine.check_key(&key(&format!("caller-{}", i)), "/any").await.unwrap();
    }
    clock.set(Duration::from_secs(11));
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(engine.store().is_empty());
    assert_eq!(sink.events_of("evicted").len(), 1);

    let store = engine.store().clone();
    drop(engine);
    let rule = RouteRule::new("/r", 1, Duration::from_secs(1)).unwrap();
    store.record(&key("late"), &rule, 11_000).unwrap();
    clock.set(Duration::from_secs(60));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn stacked_default_limits_apply_per_route() {
    let clock = ManualClock::new();
    let rules = RuleRegistry::builder()
        .default_limits([Limit::per_second(2), Limit::per_minute(3)])
        .unwrap()
        .build()
        .unwrap();
    let engine = AdmissionEngine::builder(rules)
        .degradation(DegradationPolicy::FailClosed)
        .clock(clock.clone())
        .build()
        .unwrap();

    engine.check_key(&key("K"), "/a").await.unwrap();
    engine.check_key(&key("K"), "/a").await.unwrap();
    let burst = engine.check_key(&key("K"), "/a").await.unwrap_err();
    assert_eq!(burst.limit, Some(2));
    assert_eq!(burst.retry_after, Duration::from_secs(1));

    clock.set(Duration::from_secs(1));
    let last = engine.check_key(&key("K"), "/a").await.unwrap();
    assert_eq!(last.decision().map(|d| (d.limit, d.remaining)), Some((3, 0)));

    clock.set(Duration::from_secs(2));
    let capped = engine.check_key(&key("K"), "/a").await.unwrap_err();
    assert_eq!(capped.limit, Some(3));
    assert_eq!(capped.retry_after, Duration::from_secs(58));
    assert!(engine.check_key(&key("K"), "/b").await.is_ok());
}
