//! `consul-balance` offers a load balanced HTTP client that resolves a logical service name
//! to one of its healthy instances, keeping the instance list current through a registry watch.
//!
//! # Simple example
//!
//! ```rust,no_run
//! # use consul_balance::{
//! #     InstanceSnapshot, Registry, RequestSpec, ServiceQuery, Transport, WatchStream,
//! # };
//! # struct ConsulRegistry;
//! # #[async_trait::async_trait]
//! # impl Registry for ConsulRegistry {
//! #     async fn query(&self, _: &ServiceQuery) -> Result<InstanceSnapshot, anyhow::Error> {
//! #         unimplemented!()
//! #     }
//! #     fn watch(&self, _: &ServiceQuery) -> Result<WatchStream, anyhow::Error> {
//! #         unimplemented!()
//! #     }
//! # }
//! # struct HttpTransport;
//! # #[async_trait::async_trait]
//! # impl Transport for HttpTransport {
//! #     type Response = ();
//! #     async fn send(&self, _: RequestSpec) -> Result<(), anyhow::Error> { Ok(()) }
//! # }
//! #[tokio::main]
//! async fn main() {
//!     use consul_balance::{LoadBalancingClient, RequestSpec};
//!
//!     let client = LoadBalancingClient::builder("orders", ConsulRegistry, HttpTransport)
//!         .build()
//!         .await
//!         .expect("failed to construct LoadBalancingClient");
//!
//!     client
//!         .get(RequestSpec::path("/orders/42"))
//!         .await
//!         .expect("request failed");
//! }
//! ```
//!
//! The registry and the transport are plugged in through the [`Registry`] and [`Transport`]
//! traits. Registries that can not push changes can be watched by polling them:
//!
//! ```rust
//! use consul_balance::{
//!     polling_watch, InstanceSnapshot, Registry, ServiceQuery, WatchStream, DEFAULT_POLL_INTERVAL,
//! };
//!
//! #[derive(Clone)]
//! struct StaticRegistry(InstanceSnapshot);
//!
//! #[async_trait::async_trait]
//! impl Registry for StaticRegistry {
//!     async fn query(&self, _query: &ServiceQuery) -> Result<InstanceSnapshot, anyhow::Error> {
//!         Ok(self.0.clone())
//!     }
//!
//!     fn watch(&self, query: &ServiceQuery) -> Result<WatchStream, anyhow::Error> {
//!         Ok(polling_watch(self.clone(), query.clone(), DEFAULT_POLL_INTERVAL))
//!     }
//! }
//! ```
//!
//! It's also possible to eagerly query the registry once before
//! [`LoadBalancingClient`] is constructed, and to observe every refresh of the instance list.
//!
//! ```rust,no_run
//! # use consul_balance::{
//! #     InstanceSnapshot, Registry, RequestSpec, ServiceQuery, Transport, WatchStream,
//! # };
//! # struct ConsulRegistry;
//! # #[async_trait::async_trait]
//! # impl Registry for ConsulRegistry {
//! #     async fn query(&self, _: &ServiceQuery) -> Result<InstanceSnapshot, anyhow::Error> {
//! #         unimplemented!()
//! #     }
//! #     fn watch(&self, _: &ServiceQuery) -> Result<WatchStream, anyhow::Error> {
//! #         unimplemented!()
//! #     }
//! # }
//! # struct HttpTransport;
//! # #[async_trait::async_trait]
//! # impl Transport for HttpTransport {
//! #     type Response = ();
//! #     async fn send(&self, _: RequestSpec) -> Result<(), anyhow::Error> { Ok(()) }
//! # }
//! #[tokio::main]
//! async fn main() {
//!     use consul_balance::{
//!         LoadBalancingClient, RefreshEvent, ResolutionStrategy, REFRESHING_SERVICES,
//!     };
//!     use std::time::Duration;
//!
//!     let client = LoadBalancingClient::builder("orders", ConsulRegistry, HttpTransport)
//!         .filter("tag", "primary")
//!         .resolution_strategy(ResolutionStrategy::Eager {
//!             timeout: Duration::from_secs(5),
//!         })
//!         .build()
//!         .await
//!         .expect("failed to construct LoadBalancingClient");
//!
//!     client.on(REFRESHING_SERVICES, |event: &RefreshEvent| {
//!         println!("{} now has {} instances", event.service, event.snapshot.len());
//!         Ok(())
//!     });
//! }
//! ```
//!
//! # Internals
//! Every watch delivery is fingerprinted (SHA-256 over the sorted instance list) and compared
//! with the fingerprint of the snapshot the current selection engine was built from. The
//! engine is only touched when the two differ. The first request and the first watch delivery
//! race to create the engine; a per-service lock makes sure only one of them does.

mod balanced_client;
mod change_notifier;
mod engine_cache;
mod error;
mod logger;
mod registry;
mod request;
mod selection_engine;
mod service_instance;
mod watch_subscription;

pub use balanced_client::*;
pub use change_notifier::*;
pub use engine_cache::*;
pub use error::*;
pub use logger::*;
pub use registry::*;
pub use request::*;
pub use selection_engine::*;
pub use service_instance::*;
pub use watch_subscription::*;
