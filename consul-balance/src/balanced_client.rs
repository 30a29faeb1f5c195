//! Provides the builder and implementation of [`LoadBalancingClient`], which keeps
//! its view of a service current through a registry watch.

use crate::{
    ChangeListener, ChangeNotifier, DeliveryMeta, EngineFactory, Error, ErrorListener, HandlerId,
    InstanceSnapshot, ListenerId, Logger, RefreshEvent, Registry, RegistryWatchSubscription,
    RequestSpec, ServiceEngineCache, ServiceQuery, Strategy, TracingLogger, Transport,
};
use anyhow::Context as _;
use http::Method;
use std::{
    error::Error as StdError,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::time::Duration;
use tower_service::Service;

/// Enumerates the different seeding strategies that
/// the [`LoadBalancingClientBuilder`] supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    /// Creates the client without querying the registry; the first request
    /// (or the first watch delivery) seeds the engine.
    Lazy,
    /// Queries the registry before the client is returned in order to start
    /// with a non-empty set of instances.
    Eager { timeout: Duration },
}

/// An HTTP client that load balances every request across the healthy instances of one service.
///
/// ```rust
/// use consul_balance::{
///     InstanceSnapshot, LoadBalancingClient, RequestSpec, Registry, ServiceInstance, ServiceQuery,
///     Transport, WatchStream,
/// };
///
/// struct StaticRegistry;
///
/// #[async_trait::async_trait]
/// impl Registry for StaticRegistry {
///     async fn query(&self, _query: &ServiceQuery) -> Result<InstanceSnapshot, anyhow::Error> {
///         Ok(InstanceSnapshot::new(vec![ServiceInstance::from_parts("10.0.0.1", 8080)]))
///     }
///
///     fn watch(&self, _query: &ServiceQuery) -> Result<WatchStream, anyhow::Error> {
///         Ok(Box::pin(futures::stream::pending()))
///     }
/// }
///
/// struct EchoTransport;
///
/// #[async_trait::async_trait]
/// impl Transport for EchoTransport {
///     type Response = String;
///
///     async fn send(&self, request: RequestSpec) -> Result<String, anyhow::Error> {
///         Ok(request.url.unwrap_or_default())
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     let client = LoadBalancingClient::builder("orders", StaticRegistry, EchoTransport)
///         .build()
///         .await
///         .expect("failed to construct LoadBalancingClient");
///
///     let url = client.get(RequestSpec::path("/orders/42")).await.unwrap();
///     assert_eq!(url, "http://10.0.0.1:8080/orders/42");
/// }
/// ```
pub struct LoadBalancingClient<R, T> {
    inner: Arc<Inner<R, T>>,
}

struct Inner<R, T> {
    query: ServiceQuery,
    registry: R,
    transport: T,
    cache: Arc<ServiceEngineCache>,
    subscription: RegistryWatchSubscription,
    default_request: RequestSpec,
    scheme: String,
    logger: Arc<dyn Logger>,
}

impl<R, T> Clone for LoadBalancingClient<R, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, T> std::fmt::Debug for LoadBalancingClient<R, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancingClient")
            .field("query", &self.inner.query)
            .field("scheme", &self.inner.scheme)
            .field("subscription", &self.inner.subscription)
            .finish_non_exhaustive()
    }
}

impl<R: Registry, T: Transport> LoadBalancingClient<R, T> {
    /// Start configuring a `LoadBalancingClient` for the service registered as `service`.
    pub fn builder<S: ToString>(
        service: S,
        registry: R,
        transport: T,
    ) -> LoadBalancingClientBuilder<R, T> {
        LoadBalancingClientBuilder::new(ServiceQuery::new(service), registry, transport)
    }

    pub fn service(&self) -> &str {
        self.inner.query.service()
    }

    /// The cache holding the selection engine of this client's service.
    pub fn engine_cache(&self) -> &ServiceEngineCache {
        &self.inner.cache
    }

    /// Resolve the base URL (`scheme://address:port`) of one healthy instance.
    pub async fn resolve_endpoint(&self) -> Result<String, Error> {
        self.inner.resolve_endpoint().await
    }

    /// Send `request` to one healthy instance of the service.
    ///
    /// Fields left unset are taken from the default request. The `url` must hold the
    /// path of the target; it is prefixed with the resolved endpoint.
    pub async fn send(&self, request: RequestSpec) -> Result<T::Response, Error> {
        self.inner.send(request).await
    }

    pub async fn get(&self, request: RequestSpec) -> Result<T::Response, Error> {
        self.send(request.method(Method::GET)).await
    }

    pub async fn post(&self, request: RequestSpec) -> Result<T::Response, Error> {
        self.send(request.method(Method::POST)).await
    }

    pub async fn put(&self, request: RequestSpec) -> Result<T::Response, Error> {
        self.send(request.method(Method::PUT)).await
    }

    pub async fn delete(&self, request: RequestSpec) -> Result<T::Response, Error> {
        self.send(request.method(Method::DELETE)).await
    }

    /// Register `handler` on a notification channel, e.g.
    /// [`REFRESHING_SERVICES`](crate::REFRESHING_SERVICES).
    pub fn on<F>(&self, channel: &str, handler: F) -> HandlerId
    where
        F: Fn(&RefreshEvent) -> Result<(), anyhow::Error> + Send + Sync + 'static,
    {
        self.inner.cache.notifier().on(channel, handler)
    }

    pub fn off(&self, channel: &str, id: HandlerId) -> bool {
        self.inner.cache.notifier().off(channel, id)
    }

    /// Register a listener for the errors reported by the registry watch.
    pub fn on_watch_error<L: ErrorListener + 'static>(&self, listener: L) -> ListenerId {
        self.inner.subscription.on_error(listener)
    }

    pub fn remove_watch_error_listener(&self, id: ListenerId) -> bool {
        self.inner.subscription.remove_error_listener(id)
    }

    /// Stop watching the registry. The cached engine keeps serving requests.
    pub fn shutdown(&self) {
        self.inner.subscription.end();
    }
}

impl<R: Registry, T: Transport> Inner<R, T> {
    #[tracing::instrument(level = "debug", skip(self), fields(service = self.query.service()))]
    async fn resolve_endpoint(&self) -> Result<String, Error> {
        let service = self.query.service();
        let entry = self
            .cache
            .ensure_seeded(service, || self.registry.query(&self.query))
            .await
            .map_err(|err| {
                self.logger.error(
                    &format!("failed to resolve service '{}'", service),
                    Some(&err as &(dyn StdError + 'static)),
                );
                err
            })?;

        let instance = entry.pick().map_err(|err| {
            self.logger.warn(
                &format!("no instance of '{}' to pick from", service),
                Some(&err as &(dyn StdError + 'static)),
            );
            Error::ServiceNotFound(service.to_string())
        })?;

        Ok(format!("{}://{}", self.scheme, instance.authority()))
    }

    async fn send(&self, request: RequestSpec) -> Result<T::Response, Error> {
        let mut request = request.merge_defaults(&self.default_request);
        let path = request
            .url
            .take()
            .ok_or_else(|| Error::InvalidRequest("no target url was given".to_string()))?;

        let endpoint = self.resolve_endpoint().await?;
        request.url = Some(format!("{}{}", endpoint, path));
        tracing::debug!(method = ?request.method, url = ?request.url, "dispatching request");

        self.transport.send(request).await.map_err(Error::Transport)
    }
}

impl<R: Registry, T: Transport> Service<RequestSpec> for LoadBalancingClient<R, T> {
    type Response = T::Response;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<T::Response, Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: RequestSpec) -> Self::Future {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { inner.send(request).await })
    }
}

/// Applies every watch delivery to the engine cache.
struct CacheUpdater {
    service: String,
    cache: Arc<ServiceEngineCache>,
}

#[async_trait::async_trait]
impl ChangeListener for CacheUpdater {
    async fn on_change(
        &self,
        snapshot: &InstanceSnapshot,
        meta: &DeliveryMeta,
    ) -> Result<(), anyhow::Error> {
        tracing::debug!(index = ?meta.index, "watch delivered {} instances", snapshot.len());
        self.cache.apply_update(&self.service, snapshot).await;
        Ok(())
    }
}

/// Builder to configure and create a [`LoadBalancingClient`].
pub struct LoadBalancingClientBuilder<R, T> {
    query: ServiceQuery,
    registry: R,
    transport: T,
    engine_factory: Arc<dyn EngineFactory>,
    default_request: RequestSpec,
    scheme: String,
    logger: Arc<dyn Logger>,
    resolution_strategy: ResolutionStrategy,
}

impl<R: Registry, T: Transport> LoadBalancingClientBuilder<R, T> {
    /// Configure a client for the instances matching `query`.
    pub fn new(query: ServiceQuery, registry: R, transport: T) -> Self {
        Self {
            query,
            registry,
            transport,
            engine_factory: Arc::new(Strategy::default()),
            default_request: RequestSpec::default(),
            scheme: "http".to_string(),
            logger: Arc::new(TracingLogger),
            resolution_strategy: ResolutionStrategy::Lazy,
        }
    }

    /// Set the selection [`Strategy`].
    ///
    /// Default set to [`Strategy::Random`].
    pub fn strategy(self, strategy: Strategy) -> Self {
        self.engine_factory(strategy)
    }

    /// Build selection engines with a custom [`EngineFactory`].
    pub fn engine_factory<F: EngineFactory + 'static>(self, factory: F) -> Self {
        Self {
            engine_factory: Arc::new(factory),
            ..self
        }
    }

    /// Set whether only instances with passing health checks are used.
    /// Defaults to `true`.
    pub fn passing(self, passing: bool) -> Self {
        Self {
            query: self.query.with_passing(passing),
            ..self
        }
    }

    /// Add a filter option forwarded verbatim to the registry.
    pub fn filter<K: ToString, V: ToString>(self, key: K, value: V) -> Self {
        Self {
            query: self.query.filter(key, value),
            ..self
        }
    }

    /// Set the request whose fields fill in what callers leave unset.
    pub fn default_request(self, default_request: RequestSpec) -> Self {
        Self {
            default_request,
            ..self
        }
    }

    /// Set the URL scheme of resolved endpoints. Defaults to `http`.
    pub fn scheme<S: ToString>(self, scheme: S) -> Self {
        Self {
            scheme: scheme.to_string(),
            ..self
        }
    }

    /// Set the [`Logger`] receiving the client's operational messages.
    ///
    /// Defaults to [`TracingLogger`].
    pub fn logger<L: Logger + 'static>(self, logger: L) -> Self {
        Self {
            logger: Arc::new(logger),
            ..self
        }
    }

    /// Set the [`ResolutionStrategy`].
    ///
    /// Default set to [`ResolutionStrategy::Lazy`].
    ///
    /// If [`ResolutionStrategy::Eager`] is set the registry is queried once before the
    /// [`LoadBalancingClient`] is returned, which ensures that the client starts
    /// with a non-empty set of instances. If it fails the client creation will also fail.
    pub fn resolution_strategy(self, resolution_strategy: ResolutionStrategy) -> Self {
        Self {
            resolution_strategy,
            ..self
        }
    }

    /// Construct a [`LoadBalancingClient`] and start watching the registry.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn build(self) -> Result<LoadBalancingClient<R, T>, anyhow::Error> {
        let service = self.query.service().to_string();
        let notifier = Arc::new(ChangeNotifier::new());
        let cache = Arc::new(ServiceEngineCache::new(
            self.engine_factory,
            notifier,
            Arc::clone(&self.logger),
        ));

        let stream = self
            .registry
            .watch(&self.query)
            .with_context(|| format!("failed to watch service '{}'", service))?;
        let subscription = RegistryWatchSubscription::new(self.query.clone(), stream);

        subscription.on_change(CacheUpdater {
            service: service.clone(),
            cache: Arc::clone(&cache),
        });
        let logger = Arc::clone(&self.logger);
        let watched = service.clone();
        subscription.on_error(move |err: &anyhow::Error| {
            logger.error(
                &format!("failed to watch service '{}'", watched),
                Some(&**err as &(dyn StdError + 'static)),
            );
        });
        subscription.start();

        let inner = Arc::new(Inner {
            query: self.query,
            registry: self.registry,
            transport: self.transport,
            cache,
            subscription,
            default_request: self.default_request,
            scheme: self.scheme,
            logger: self.logger,
        });

        if let ResolutionStrategy::Eager { timeout } = self.resolution_strategy {
            // Make sure the service is seeded once before handing out the client.
            tokio::time::timeout(
                timeout,
                inner
                    .cache
                    .ensure_seeded(&service, || inner.registry.query(&inner.query)),
            )
            .await
            .context("timed out while attempting to query the registry")?
            .context("failed to seed the service instances")?;
        }

        Ok(LoadBalancingClient { inner })
    }
}

const _: () = {
    const fn assert_is_send<T: Send + Sync>() {}
    assert_is_send::<ServiceEngineCache>();
    assert_is_send::<RegistryWatchSubscription>();
};
