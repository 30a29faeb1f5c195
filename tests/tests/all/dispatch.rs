use consul_balance::{Error, LoadBalancingClient, RequestSpec, ServiceInstance};
use http::header::{HeaderValue, AUTHORIZATION};
use http::{HeaderMap, Method};
use serde_json::json;
use tests::test_registry::TestRegistry;
use tests::test_transport::RecordingTransport;

fn single_instance() -> TestRegistry {
    TestRegistry::with_instances(vec![ServiceInstance::from_parts("10.0.0.1", 8080)])
}

#[tokio::test]
async fn verbs_set_the_method_and_target_the_resolved_instance() {
    let transport = RecordingTransport::default();
    let client = LoadBalancingClient::builder("orders", single_instance(), transport.clone())
        .build()
        .await
        .unwrap();

    let response = client.get(RequestSpec::path("/orders/42")).await.unwrap();
    assert_eq!(response.body(), "http://10.0.0.1:8080/orders/42");

    client.post(RequestSpec::path("/orders")).await.unwrap();
    client.put(RequestSpec::path("/orders/42")).await.unwrap();
    client.delete(RequestSpec::path("/orders/42")).await.unwrap();

    let methods: Vec<_> = transport
        .sent()
        .into_iter()
        .map(|request| request.method.unwrap())
        .collect();
    assert_eq!(
        methods,
        vec![Method::GET, Method::POST, Method::PUT, Method::DELETE]
    );
}

#[tokio::test]
async fn default_request_fills_in_what_the_caller_left_out() {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer token"));
    let transport = RecordingTransport::default();
    let client = LoadBalancingClient::builder("orders", single_instance(), transport.clone())
        .default_request(
            RequestSpec::new()
                .headers(headers.clone())
                .extra("timeout", json!(500))
                .extra("json", json!(true)),
        )
        .scheme("https")
        .build()
        .await
        .unwrap();

    client
        .send(
            RequestSpec::path("/orders")
                .method(Method::PATCH)
                .extra("timeout", json!(100)),
        )
        .await
        .unwrap();

    let sent = transport.sent().remove(0);
    assert_eq!(sent.url.as_deref(), Some("https://10.0.0.1:8080/orders"));
    assert_eq!(sent.method, Some(Method::PATCH));
    assert_eq!(sent.headers, Some(headers));
    assert_eq!(sent.extra["timeout"], json!(100));
    assert_eq!(sent.extra["json"], json!(true));
}

#[tokio::test]
async fn request_without_target_is_invalid() {
    let transport = RecordingTransport::default();
    let client = LoadBalancingClient::builder("orders", single_instance(), transport.clone())
        .build()
        .await
        .unwrap();

    let error = client.get(RequestSpec::new()).await.unwrap_err();

    assert!(matches!(error, Error::InvalidRequest(_)));
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn transport_failures_are_passed_through() {
    let transport = RecordingTransport::default();
    transport.fail_with(Some("connection reset by peer"));
    let client = LoadBalancingClient::builder("orders", single_instance(), transport.clone())
        .build()
        .await
        .unwrap();

    let error = client.get(RequestSpec::path("/orders")).await.unwrap_err();

    assert!(matches!(error, Error::Transport(_)));
    assert_eq!(error.to_string(), "connection reset by peer");
}

#[tokio::test]
async fn no_instances_fails_before_reaching_the_transport() {
    let transport = RecordingTransport::default();
    let client = LoadBalancingClient::builder("orders", TestRegistry::default(), transport.clone())
        .build()
        .await
        .unwrap();

    let error = client.get(RequestSpec::path("/orders")).await.unwrap_err();

    assert!(matches!(error, Error::ServiceNotFound(_)));
    assert!(transport.sent().is_empty());
}
