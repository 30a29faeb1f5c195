use consul_balance::{
    ChangeNotifier, InstanceSnapshot, RefreshEvent, RefreshOutcome, ServiceEngineCache,
    ServiceInstance, TracingLogger, REFRESHING_SERVICES,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tests::counting_engine::CountingFactory;
use tokio::time::Duration;

fn cache_with(factory: &CountingFactory) -> ServiceEngineCache {
    ServiceEngineCache::new(
        Arc::new(factory.clone()),
        Arc::new(ChangeNotifier::new()),
        Arc::new(TracingLogger),
    )
}

fn record_events(cache: &ServiceEngineCache) -> Arc<Mutex<Vec<RefreshEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    cache.notifier().on(REFRESHING_SERVICES, move |event: &RefreshEvent| {
        sink.lock().push(event.clone());
        Ok(())
    });
    events
}

fn snapshot(addresses: &[&str]) -> InstanceSnapshot {
    addresses
        .iter()
        .map(|address| ServiceInstance::from_parts(address, 8080))
        .collect()
}

#[tokio::test]
async fn first_delivery_creates_the_entry() {
    let factory = CountingFactory::default();
    let cache = cache_with(&factory);
    let events = record_events(&cache);
    let orders = snapshot(&["10.0.0.1", "10.0.0.2"]);

    assert_eq!(
        cache.apply_update("orders", &orders).await,
        RefreshOutcome::Created
    );

    let entry = cache.get("orders").await.expect("entry was created");
    assert_eq!(entry.fingerprint(), &orders.fingerprint());
    assert_eq!(factory.built(), 1);
    let events = events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].previous, None);
    assert!(events[0].changed());
}

#[tokio::test]
async fn applying_the_same_snapshot_twice_updates_once() {
    let factory = CountingFactory::default();
    let cache = cache_with(&factory);
    cache.apply_update("orders", &snapshot(&["10.0.0.1"])).await;

    let changed = snapshot(&["10.0.0.1", "10.0.0.2"]);
    assert_eq!(
        cache.apply_update("orders", &changed).await,
        RefreshOutcome::Updated
    );
    assert_eq!(
        cache.apply_update("orders", &changed).await,
        RefreshOutcome::Unchanged
    );

    assert_eq!(factory.updates(), 1);
    assert_eq!(
        cache.get("orders").await.unwrap().fingerprint(),
        &changed.fingerprint()
    );
}

#[tokio::test]
async fn changed_snapshot_updates_the_existing_engine_in_place() {
    let factory = CountingFactory::default();
    let cache = cache_with(&factory);
    let events = record_events(&cache);
    let first = snapshot(&["10.0.0.1"]);
    let second = snapshot(&["10.0.0.2"]);

    cache.apply_update("orders", &first).await;
    let before = cache.get("orders").await.unwrap();
    cache.apply_update("orders", &second).await;
    let after = cache.get("orders").await.unwrap();

    assert!(Arc::ptr_eq(before.engine(), after.engine()));
    assert_eq!(factory.built(), 1);
    assert_eq!(factory.updates(), 1);
    assert_eq!(after.pick().unwrap().address(), "10.0.0.2");

    let events = events.lock();
    assert_eq!(events[1].previous.as_ref(), Some(&first.fingerprint()));
    assert_eq!(events[1].current, second.fingerprint());
    assert_eq!(events[1].outcome, RefreshOutcome::Updated);
}

#[tokio::test]
async fn ensure_seeded_runs_the_loader_once() {
    let factory = CountingFactory::default();
    let cache = cache_with(&factory);
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
        cache
            .ensure_seeded("orders", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(snapshot(&["10.0.0.1"]))
            })
            .await
            .expect("seeding succeeds");
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(factory.built(), 1);
}

#[tokio::test]
async fn ensure_seeded_returns_the_entry_created_by_the_watch() {
    let factory = CountingFactory::default();
    let cache = cache_with(&factory);
    let orders = snapshot(&["10.0.0.1"]);
    cache.apply_update("orders", &orders).await;

    let entry = cache
        .ensure_seeded("orders", || async {
            Err::<InstanceSnapshot, _>(anyhow::anyhow!("loader must not run"))
        })
        .await
        .expect("the watch already created the entry");

    assert_eq!(entry.fingerprint(), &orders.fingerprint());
    assert_eq!(factory.built(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_seed_and_watch_leave_a_single_engine() {
    for _ in 0..50 {
        let factory = CountingFactory::default();
        let cache = Arc::new(cache_with(&factory));
        let seeded = snapshot(&["10.0.0.1", "10.0.0.2"]);
        let watched = snapshot(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

        let seeding = {
            let cache = Arc::clone(&cache);
            let seeded = seeded.clone();
            tokio::spawn(async move {
                cache
                    .ensure_seeded("orders", || async move {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        Ok::<_, anyhow::Error>(seeded)
                    })
                    .await
                    .map(|entry| entry.engine().clone())
            })
        };
        let watching = {
            let cache = Arc::clone(&cache);
            let watched = watched.clone();
            tokio::spawn(async move { cache.apply_update("orders", &watched).await })
        };

        let seeded_engine = seeding.await.unwrap().unwrap();
        watching.await.unwrap();

        assert_eq!(cache.len().await, 1);
        assert_eq!(factory.built(), 1);
        let entry = cache.get("orders").await.unwrap();
        assert!(Arc::ptr_eq(entry.engine(), &seeded_engine));
        // Whichever ran last, the stored fingerprint and engine agree on the newest snapshot.
        assert_eq!(entry.fingerprint(), &watched.fingerprint());
    }
}
