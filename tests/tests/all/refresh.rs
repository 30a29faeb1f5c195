use consul_balance::{
    LoadBalancingClient, RefreshEvent, RefreshOrigin, RefreshOutcome, ServiceInstance,
    REFRESHING_SERVICES,
};
use tests::counting_engine::CountingFactory;
use tests::test_registry::TestRegistry;
use tests::test_transport::RecordingTransport;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

fn instance(address: &str) -> ServiceInstance {
    ServiceInstance::from_parts(address, 8080)
}

fn two_instances() -> Vec<ServiceInstance> {
    vec![instance("10.0.0.1"), instance("10.0.0.2")]
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<RefreshEvent>) -> RefreshEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a refresh event")
        .expect("notifier dropped")
}

async fn client_with_events(
    registry: TestRegistry,
    factory: CountingFactory,
) -> (
    LoadBalancingClient<TestRegistry, RecordingTransport>,
    mpsc::UnboundedReceiver<RefreshEvent>,
) {
    let client = LoadBalancingClient::builder("orders", registry, RecordingTransport::default())
        .engine_factory(factory)
        .build()
        .await
        .expect("failed to build client");

    let (sender, receiver) = mpsc::unbounded_channel();
    client.on(REFRESHING_SERVICES, move |event: &RefreshEvent| {
        sender.send(event.clone())?;
        Ok(())
    });
    (client, receiver)
}

#[tokio::test]
async fn identical_delivery_does_not_touch_the_engine() {
    let registry = TestRegistry::with_instances(two_instances());
    let factory = CountingFactory::default();
    let (client, mut events) = client_with_events(registry.clone(), factory.clone()).await;

    client.resolve_endpoint().await.unwrap();
    let seeded = next_event(&mut events).await;
    assert_eq!(seeded.origin, RefreshOrigin::Seed);
    assert_eq!(seeded.outcome, RefreshOutcome::Created);

    // Same instances, different order.
    registry.deliver(vec![instance("10.0.0.2"), instance("10.0.0.1")]);
    let event = next_event(&mut events).await;

    assert_eq!(event.origin, RefreshOrigin::Watch);
    assert_eq!(event.outcome, RefreshOutcome::Unchanged);
    assert!(!event.changed());
    assert_eq!(event.previous.as_ref(), Some(&seeded.current));
    assert_eq!(factory.built(), 1);
    assert_eq!(factory.updates(), 0);
}

#[tokio::test]
async fn changed_delivery_updates_the_engine_in_place() {
    let registry = TestRegistry::with_instances(two_instances());
    let factory = CountingFactory::default();
    let (client, mut events) = client_with_events(registry.clone(), factory.clone()).await;

    client.resolve_endpoint().await.unwrap();
    let seeded = next_event(&mut events).await;

    let mut grown = two_instances();
    grown.push(instance("10.0.0.3"));
    registry.deliver(grown);
    let event = next_event(&mut events).await;

    assert_eq!(event.outcome, RefreshOutcome::Updated);
    assert!(event.changed());
    assert_ne!(event.current, seeded.current);
    assert_eq!(event.snapshot.len(), 3);
    assert_eq!(factory.built(), 1);
    assert_eq!(factory.updates(), 1);

    let mut seen_new_instance = false;
    for _ in 0..500 {
        if client.resolve_endpoint().await.unwrap() == "http://10.0.0.3:8080" {
            seen_new_instance = true;
            break;
        }
    }
    assert!(seen_new_instance);
}

#[tokio::test]
async fn watch_delivery_before_any_request_creates_the_engine() {
    let registry = TestRegistry::with_instances(two_instances());
    let factory = CountingFactory::default();
    let (client, mut events) = client_with_events(registry.clone(), factory.clone()).await;

    registry.deliver(vec![instance("10.0.0.9")]);
    let event = next_event(&mut events).await;

    assert_eq!(event.origin, RefreshOrigin::Watch);
    assert_eq!(event.outcome, RefreshOutcome::Created);
    assert_eq!(event.previous, None);
    assert_eq!(
        client.resolve_endpoint().await.unwrap(),
        "http://10.0.0.9:8080"
    );
    assert_eq!(registry.query_count(), 0);
    assert_eq!(factory.built(), 1);
}

#[tokio::test]
async fn watch_errors_reach_listeners_and_the_watch_keeps_going() {
    let registry = TestRegistry::with_instances(two_instances());
    let (client, mut events) =
        client_with_events(registry.clone(), CountingFactory::default()).await;

    let (error_sender, mut errors) = mpsc::unbounded_channel();
    client.on_watch_error(move |error: &anyhow::Error| {
        let _ = error_sender.send(error.to_string());
    });

    registry.deliver_error("blocking query timed out");
    let error = timeout(Duration::from_secs(5), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(error, "blocking query timed out");

    registry.deliver(two_instances());
    assert_eq!(next_event(&mut events).await.outcome, RefreshOutcome::Created);
}

#[tokio::test]
async fn failing_handler_does_not_starve_the_others() {
    let registry = TestRegistry::with_instances(two_instances());
    let (client, mut events) =
        client_with_events(registry.clone(), CountingFactory::default()).await;
    client.on(REFRESHING_SERVICES, |_: &RefreshEvent| {
        anyhow::bail!("handler is broken")
    });

    registry.deliver(two_instances());
    let first = next_event(&mut events).await;
    registry.deliver(vec![instance("10.0.0.3")]);
    let second = next_event(&mut events).await;

    assert_eq!(first.outcome, RefreshOutcome::Created);
    assert_eq!(second.outcome, RefreshOutcome::Updated);
}

#[tokio::test]
async fn panicking_handler_does_not_stop_the_watch() {
    let registry = TestRegistry::with_instances(two_instances());
    let (client, mut events) =
        client_with_events(registry.clone(), CountingFactory::default()).await;
    let broken = client.on(REFRESHING_SERVICES, |_: &RefreshEvent| -> Result<(), anyhow::Error> {
        panic!("handler blew up")
    });

    registry.deliver(vec![instance("10.0.0.1")]);
    assert_eq!(next_event(&mut events).await.outcome, RefreshOutcome::Created);

    assert!(client.off(REFRESHING_SERVICES, broken));
    assert_eq!(registry.deliver(vec![instance("10.0.0.2")]), 1);
    assert_eq!(next_event(&mut events).await.outcome, RefreshOutcome::Updated);

    assert_eq!(
        client.resolve_endpoint().await.unwrap(),
        "http://10.0.0.2:8080"
    );
}

#[tokio::test]
async fn off_stops_notifications() {
    let registry = TestRegistry::with_instances(two_instances());
    let client =
        LoadBalancingClient::builder("orders", registry.clone(), RecordingTransport::default())
            .build()
            .await
            .unwrap();

    let (sender, mut events) = mpsc::unbounded_channel();
    let id = client.on(REFRESHING_SERVICES, move |event: &RefreshEvent| {
        sender.send(event.outcome)?;
        Ok(())
    });
    assert!(client.off(REFRESHING_SERVICES, id));
    assert!(!client.off(REFRESHING_SERVICES, id));

    client.resolve_endpoint().await.unwrap();
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn shutdown_ends_the_watch() {
    let registry = TestRegistry::with_instances(two_instances());
    let factory = CountingFactory::default();
    let (client, mut events) = client_with_events(registry.clone(), factory.clone()).await;

    client.shutdown();
    registry.deliver(vec![instance("10.0.0.3")]);

    assert!(timeout(Duration::from_millis(100), events.recv())
        .await
        .map_or(true, |event| event.is_none()));
    assert_eq!(factory.built(), 0);

    // Requests still work from direct queries.
    assert!(client.resolve_endpoint().await.is_ok());
}
