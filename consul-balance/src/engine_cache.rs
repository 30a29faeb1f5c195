//! Per-service table of live [`SelectionEngine`]s and the fingerprint of the
//! snapshot each one was last built or updated from.
//!
//! The table is populated by two independent paths: a cold lookup the first
//! time a service is resolved ([`ServiceEngineCache::ensure_seeded`]) and the
//! registry watch ([`ServiceEngineCache::apply_update`]). Both go through the
//! same per-service async mutex, so whichever runs first creates the entry and
//! the other reconciles against it.

use crate::{
    ChangeNotifier, EmptyPoolError, EngineFactory, Error, Fingerprint, InstanceSnapshot, Logger,
    SelectionEngine, ServiceInstance,
};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Channel on which [`RefreshEvent`]s are published.
pub const REFRESHING_SERVICES: &str = "refreshing-services";

type Slot = Arc<Mutex<Option<EngineCacheEntry>>>;

/// Which path produced a [`RefreshEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOrigin {
    /// The direct registry query run on first use.
    Seed,
    /// A registry watch delivery.
    Watch,
}

/// What applying a snapshot did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// No entry existed; a new engine was built.
    Created,
    /// The fingerprint differed; the existing engine was updated in place.
    Updated,
    /// The fingerprint matched; nothing was touched.
    Unchanged,
}

/// Published on [`REFRESHING_SERVICES`] every time a snapshot reaches the cache.
#[derive(Debug, Clone)]
pub struct RefreshEvent {
    pub service: String,
    pub snapshot: InstanceSnapshot,
    pub previous: Option<Fingerprint>,
    pub current: Fingerprint,
    pub origin: RefreshOrigin,
    pub outcome: RefreshOutcome,
}

impl RefreshEvent {
    /// Whether the engine was created or mutated.
    pub fn changed(&self) -> bool {
        self.outcome != RefreshOutcome::Unchanged
    }
}

/// A cached engine together with the fingerprint of the snapshot backing it.
#[derive(Clone)]
pub struct EngineCacheEntry {
    engine: Arc<dyn SelectionEngine>,
    fingerprint: Fingerprint,
}

impl EngineCacheEntry {
    pub fn engine(&self) -> &Arc<dyn SelectionEngine> {
        &self.engine
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn pick(&self) -> Result<ServiceInstance, EmptyPoolError> {
        self.engine.pick()
    }
}

impl std::fmt::Debug for EngineCacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineCacheEntry")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Owns at most one [`EngineCacheEntry`] per service name.
pub struct ServiceEngineCache {
    slots: DashMap<String, Slot>,
    factory: Arc<dyn EngineFactory>,
    notifier: Arc<ChangeNotifier<RefreshEvent>>,
    logger: Arc<dyn Logger>,
}

impl ServiceEngineCache {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        notifier: Arc<ChangeNotifier<RefreshEvent>>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            factory,
            notifier,
            logger,
        }
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier<RefreshEvent>> {
        &self.notifier
    }

    /// Return the entry for `service`, if one exists.
    pub async fn get(&self, service: &str) -> Option<EngineCacheEntry> {
        let slot = self.slots.get(service).map(|slot| Arc::clone(&slot))?;
        let entry = slot.lock().await;
        entry.clone()
    }

    /// Return the entry for `service`, seeding it with `loader` if there is none yet.
    ///
    /// The loader runs while the service is locked: a watch delivery racing with
    /// it waits, then finds the seeded entry and compares fingerprints against it.
    /// Nothing is stored when the loader fails or returns no instance.
    #[tracing::instrument(level = "debug", skip(self, loader))]
    pub async fn ensure_seeded<F, Fut>(
        &self,
        service: &str,
        loader: F,
    ) -> Result<EngineCacheEntry, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<InstanceSnapshot, anyhow::Error>>,
    {
        let slot = self.slot(service);
        let mut entry = slot.lock().await;
        if let Some(existing) = entry.as_ref() {
            return Ok(existing.clone());
        }

        let snapshot = loader().await.map_err(|source| Error::RegistryQuery {
            service: service.to_string(),
            source,
        })?;
        if snapshot.is_empty() {
            return Err(Error::ServiceNotFound(service.to_string()));
        }

        let seeded = EngineCacheEntry {
            engine: self.factory.build(&snapshot),
            fingerprint: snapshot.fingerprint(),
        };
        *entry = Some(seeded.clone());

        self.logger.debug(
            &format!(
                "seeded '{}' with {} instances ({})",
                service,
                snapshot.len(),
                seeded.fingerprint
            ),
            None,
        );
        self.publish(RefreshEvent {
            service: service.to_string(),
            snapshot,
            previous: None,
            current: seeded.fingerprint.clone(),
            origin: RefreshOrigin::Seed,
            outcome: RefreshOutcome::Created,
        });

        Ok(seeded)
    }

    /// Reconcile the entry for `service` with a freshly delivered `snapshot`.
    #[tracing::instrument(
        level = "debug",
        skip(self, snapshot),
        fields(instances = snapshot.len())
    )]
    pub async fn apply_update(&self, service: &str, snapshot: &InstanceSnapshot) -> RefreshOutcome {
        let current = snapshot.fingerprint();
        let slot = self.slot(service);
        let mut entry = slot.lock().await;

        let (previous, outcome) = match entry.as_mut() {
            None => {
                *entry = Some(EngineCacheEntry {
                    engine: self.factory.build(snapshot),
                    fingerprint: current.clone(),
                });
                (None, RefreshOutcome::Created)
            }
            Some(existing) if existing.fingerprint != current => {
                existing.engine.update(snapshot);
                let previous = std::mem::replace(&mut existing.fingerprint, current.clone());
                (Some(previous), RefreshOutcome::Updated)
            }
            Some(existing) => (Some(existing.fingerprint.clone()), RefreshOutcome::Unchanged),
        };

        match outcome {
            RefreshOutcome::Unchanged => self
                .logger
                .debug(&format!("'{}' instance list unchanged", service), None),
            _ => self.logger.info(
                &format!(
                    "'{}' instance list refreshed: {} instances ({})",
                    service,
                    snapshot.len(),
                    current
                ),
                None,
            ),
        }

        // Published while the service is still locked so observers see refreshes in order.
        self.publish(RefreshEvent {
            service: service.to_string(),
            snapshot: snapshot.clone(),
            previous,
            current,
            origin: RefreshOrigin::Watch,
            outcome,
        });

        outcome
    }

    /// Number of services with a live engine.
    pub async fn len(&self) -> usize {
        let slots: Vec<Slot> = self.slots.iter().map(|slot| Arc::clone(slot.value())).collect();
        let mut live = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                live += 1;
            }
        }
        live
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn slot(&self, service: &str) -> Slot {
        Arc::clone(&self.slots.entry(service.to_string()).or_default())
    }

    fn publish(&self, event: RefreshEvent) {
        self.notifier.emit(REFRESHING_SERVICES, &event);
    }
}

impl std::fmt::Debug for ServiceEngineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEngineCache")
            .field("services", &self.slots.len())
            .finish_non_exhaustive()
    }
}
