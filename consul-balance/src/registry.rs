//! Defines the interface that [`LoadBalancingClient`](crate::LoadBalancingClient) requires in order
//! to query and watch the healthy instances of a service.

use crate::InstanceSnapshot;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{Duration, Interval};

/// How often [`polling_watch`] queries the registry when no interval is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Parameters of a health query against the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceQuery {
    /// The service name.
    service: String,
    /// Only return instances whose health checks are all passing.
    #[serde(default = "default_passing")]
    passing: bool,
    /// Extra filter options, forwarded verbatim to the registry (e.g. `tag`, `dc`, `near`).
    #[serde(default)]
    filters: BTreeMap<String, String>,
}

fn default_passing() -> bool {
    true
}

impl ServiceQuery {
    /// Query the passing instances of `service`.
    ///
    /// ```
    /// let query = consul_balance::ServiceQuery::new("orders").filter("dc", "eu-west-1");
    /// assert_eq!(query.service(), "orders");
    /// assert!(query.passing());
    /// assert_eq!(query.filters().get("dc").map(String::as_str), Some("eu-west-1"));
    /// ```
    pub fn new<T: ToString>(service: T) -> Self {
        Self {
            service: service.to_string(),
            passing: true,
            filters: BTreeMap::new(),
        }
    }

    /// Set whether only passing instances are returned.
    pub fn with_passing(self, passing: bool) -> Self {
        Self { passing, ..self }
    }

    /// Add a pass-through filter option.
    pub fn filter<K: ToString, V: ToString>(mut self, key: K, value: V) -> Self {
        self.filters.insert(key.to_string(), value.to_string());
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn passing(&self) -> bool {
        self.passing
    }

    pub fn filters(&self) -> &BTreeMap<String, String> {
        &self.filters
    }
}

/// Metadata accompanying a watch delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryMeta {
    /// The registry's blocking query index, if it exposes one.
    pub index: Option<u64>,
}

/// One snapshot pushed by a registry watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchDelivery {
    pub snapshot: InstanceSnapshot,
    pub meta: DeliveryMeta,
}

impl WatchDelivery {
    pub fn new(snapshot: InstanceSnapshot) -> Self {
        Self {
            snapshot,
            meta: DeliveryMeta::default(),
        }
    }

    pub fn with_index(self, index: u64) -> Self {
        Self {
            meta: DeliveryMeta { index: Some(index) },
            ..self
        }
    }
}

/// A continuous watch on the instances of one service.
///
/// Errors are transient: the stream keeps yielding after an `Err` item.
pub type WatchStream = BoxStream<'static, Result<WatchDelivery, anyhow::Error>>;

/// Interface to the service-discovery registry.
#[async_trait::async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Return the instances currently matching `query`.
    async fn query(&self, query: &ServiceQuery) -> Result<InstanceSnapshot, anyhow::Error>;

    /// Open a continuous watch for `query`.
    fn watch(&self, query: &ServiceQuery) -> Result<WatchStream, anyhow::Error>;
}

#[async_trait::async_trait]
impl<R: Registry + ?Sized> Registry for Arc<R> {
    async fn query(&self, query: &ServiceQuery) -> Result<InstanceSnapshot, anyhow::Error> {
        (**self).query(query).await
    }

    fn watch(&self, query: &ServiceQuery) -> Result<WatchStream, anyhow::Error> {
        (**self).watch(query)
    }
}

/// Build a [`WatchStream`] out of periodic direct queries.
///
/// For registries that can not push changes. The first query runs immediately,
/// later ones every `interval`; the cache downstream takes care of dropping
/// deliveries that did not change anything.
pub fn polling_watch<R>(registry: R, query: ServiceQuery, interval: Duration) -> WatchStream
where
    R: Registry,
{
    let registry = Arc::new(registry);

    // The ticker is created on first poll, from within the runtime.
    futures::stream::unfold(None, move |ticker: Option<Interval>| {
        let registry = Arc::clone(&registry);
        let query = query.clone();
        async move {
            let mut ticker = ticker.unwrap_or_else(|| tokio::time::interval(interval));
            ticker.tick().await;
            let delivery = probe(registry.as_ref(), &query).await;
            Some((delivery, Some(ticker)))
        }
    })
    .boxed()
}

#[tracing::instrument(level = "debug", skip(registry), fields(service = query.service()))]
async fn probe<R: Registry>(
    registry: &R,
    query: &ServiceQuery,
) -> Result<WatchDelivery, anyhow::Error> {
    let snapshot = registry.query(query).await?;
    tracing::debug!("probe returned {} instances", snapshot.len());
    Ok(WatchDelivery::new(snapshot))
}
