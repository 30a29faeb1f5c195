//! Fans the deliveries of a registry watch out to multiple listeners.

use crate::change_notifier::panic_message;
use crate::{DeliveryMeta, InstanceSnapshot, ServiceQuery, WatchStream};
use futures::{FutureExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

/// Identifies a listener registered on a [`RegistryWatchSubscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Receives every snapshot delivered by the watch.
#[async_trait::async_trait]
pub trait ChangeListener: Send + Sync {
    async fn on_change(
        &self,
        snapshot: &InstanceSnapshot,
        meta: &DeliveryMeta,
    ) -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
impl<F> ChangeListener for F
where
    F: Fn(&InstanceSnapshot, &DeliveryMeta) -> Result<(), anyhow::Error> + Send + Sync,
{
    async fn on_change(
        &self,
        snapshot: &InstanceSnapshot,
        meta: &DeliveryMeta,
    ) -> Result<(), anyhow::Error> {
        self(snapshot, meta)
    }
}

/// Receives every transport error reported by the watch.
pub trait ErrorListener: Send + Sync {
    fn on_error(&self, error: &anyhow::Error);
}

impl<F> ErrorListener for F
where
    F: Fn(&anyhow::Error) + Send + Sync,
{
    fn on_error(&self, error: &anyhow::Error) {
        self(error)
    }
}

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    change: RwLock<Vec<(ListenerId, Arc<dyn ChangeListener>)>>,
    error: RwLock<Vec<(ListenerId, Arc<dyn ErrorListener>)>>,
}

impl Listeners {
    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// A long-lived watch on the healthy instances of one service.
///
/// Listeners can be registered at any time; register them before [`start`](Self::start)
/// to observe the first delivery. Dropping the subscription ends it.
pub struct RegistryWatchSubscription {
    query: ServiceQuery,
    listeners: Arc<Listeners>,
    ended: Arc<AtomicBool>,
    stream: Mutex<Option<WatchStream>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl RegistryWatchSubscription {
    /// Wrap the `stream` opened for `query`. Nothing is delivered until [`start`](Self::start).
    pub fn new(query: ServiceQuery, stream: WatchStream) -> Self {
        Self {
            query,
            listeners: Arc::new(Listeners::default()),
            ended: Arc::new(AtomicBool::new(false)),
            stream: Mutex::new(Some(stream)),
            driver: Mutex::new(None),
        }
    }

    pub fn query(&self) -> &ServiceQuery {
        &self.query
    }

    /// Register a listener invoked with every delivered snapshot.
    pub fn on_change<L: ChangeListener + 'static>(&self, listener: L) -> ListenerId {
        let id = self.listeners.next_id();
        self.listeners.change.write().push((id, Arc::new(listener)));
        id
    }

    /// Register a listener invoked with every watch error.
    pub fn on_error<L: ErrorListener + 'static>(&self, listener: L) -> ListenerId {
        let id = self.listeners.next_id();
        self.listeners.error.write().push((id, Arc::new(listener)));
        id
    }

    pub fn remove_change_listener(&self, id: ListenerId) -> bool {
        remove(&self.listeners.change, id)
    }

    pub fn remove_error_listener(&self, id: ListenerId) -> bool {
        remove(&self.listeners.error, id)
    }

    /// Spawn the task driving the watch. Has no effect if already started or ended.
    pub fn start(&self) {
        if self.is_ended() {
            return;
        }
        let Some(stream) = self.stream.lock().take() else {
            return;
        };

        let span = tracing::info_span!("registry_watch", service = self.query.service());
        let handle = tokio::spawn(
            drive(
                stream,
                Arc::clone(&self.listeners),
                Arc::clone(&self.ended),
            )
            .instrument(span),
        );
        *self.driver.lock() = Some(handle);

        // `end` may have raced with the spawn above.
        if self.is_ended() {
            self.abort_driver();
        }
    }

    /// Stop watching and release the underlying stream.
    ///
    /// Safe to call more than once. Deliveries not yet dispatched are dropped; a listener
    /// call racing with `end` may still run up to its next await point.
    pub fn end(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stream.lock().take();
        self.abort_driver();
        tracing::debug!(service = self.query.service(), "registry watch ended");
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    fn abort_driver(&self) {
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for RegistryWatchSubscription {
    fn drop(&mut self) {
        self.end();
    }
}

impl std::fmt::Debug for RegistryWatchSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryWatchSubscription")
            .field("query", &self.query)
            .field("ended", &self.is_ended())
            .finish()
    }
}

fn remove<T: ?Sized>(listeners: &RwLock<Vec<(ListenerId, Arc<T>)>>, id: ListenerId) -> bool {
    let mut listeners = listeners.write();
    let before = listeners.len();
    listeners.retain(|(listener_id, _)| *listener_id != id);
    listeners.len() != before
}

async fn drive(mut stream: WatchStream, listeners: Arc<Listeners>, ended: Arc<AtomicBool>) {
    while let Some(event) = stream.next().await {
        match event {
            Ok(delivery) => {
                let change_listeners = listeners.change.read().clone();
                for (id, listener) in change_listeners {
                    if ended.load(Ordering::SeqCst) {
                        return;
                    }
                    let outcome =
                        AssertUnwindSafe(listener.on_change(&delivery.snapshot, &delivery.meta))
                            .catch_unwind()
                            .await;
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            tracing::warn!(listener = id.0, "change listener failed: {:#}", err)
                        }
                        Err(panic) => tracing::error!(
                            listener = id.0,
                            "change listener panicked: {}",
                            panic_message(panic.as_ref())
                        ),
                    }
                }
            }
            Err(err) => {
                tracing::debug!("watch error: {:#}", err);
                let error_listeners = listeners.error.read().clone();
                for (id, listener) in error_listeners {
                    if ended.load(Ordering::SeqCst) {
                        return;
                    }
                    let call = AssertUnwindSafe(|| listener.on_error(&err));
                    if let Err(panic) = catch_unwind(call) {
                        tracing::error!(
                            listener = id.0,
                            "error listener panicked: {}",
                            panic_message(panic.as_ref())
                        );
                    }
                }
            }
        }
    }
    tracing::debug!("registry watch stream closed");
}
