//! Strategies used to pick one instance out of the current [`InstanceSnapshot`].

use crate::{EmptyPoolError, InstanceSnapshot, ServiceInstance};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A stateful strategy bound to the instance set backing one cache entry.
pub trait SelectionEngine: Send + Sync {
    /// Pick one instance out of the last applied snapshot.
    fn pick(&self) -> Result<ServiceInstance, EmptyPoolError>;

    /// Replace the working instance set. Any cursor state is reset.
    fn update(&self, snapshot: &InstanceSnapshot);
}

/// Builds a fresh [`SelectionEngine`] for a service seen for the first time.
pub trait EngineFactory: Send + Sync {
    fn build(&self, snapshot: &InstanceSnapshot) -> Arc<dyn SelectionEngine>;
}

/// Enumerates the selection strategies a client can be configured with.
///
/// Unknown flags fall back to [`Strategy::Random`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Strategy {
    /// Uniformly pick one instance on every call.
    #[default]
    Random,
}

impl Strategy {
    /// Map a configuration flag to a [`Strategy`].
    ///
    /// ```
    /// use consul_balance::Strategy;
    ///
    /// assert_eq!(Strategy::from_flag("random"), Strategy::Random);
    /// assert_eq!(Strategy::from_flag("RANDOM_ENGINE"), Strategy::Random);
    /// assert_eq!(Strategy::from_flag("does-not-exist"), Strategy::Random);
    /// ```
    pub fn from_flag(flag: &str) -> Self {
        match flag.trim().to_ascii_lowercase().as_str() {
            "random" | "random_engine" => Strategy::Random,
            other => {
                tracing::debug!("unknown strategy '{}', falling back to random", other);
                Strategy::Random
            }
        }
    }
}

impl EngineFactory for Strategy {
    fn build(&self, snapshot: &InstanceSnapshot) -> Arc<dyn SelectionEngine> {
        match self {
            Strategy::Random => Arc::new(RandomEngine::new(snapshot)),
        }
    }
}

/// Uniformly selects among the current instance set on each [`pick`](SelectionEngine::pick).
#[derive(Debug, Default)]
pub struct RandomEngine {
    instances: RwLock<Vec<ServiceInstance>>,
}

impl RandomEngine {
    pub fn new(snapshot: &InstanceSnapshot) -> Self {
        Self {
            instances: RwLock::new(snapshot.instances().to_vec()),
        }
    }
}

impl SelectionEngine for RandomEngine {
    fn pick(&self) -> Result<ServiceInstance, EmptyPoolError> {
        self.instances
            .read()
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(EmptyPoolError)
    }

    fn update(&self, snapshot: &InstanceSnapshot) {
        *self.instances.write() = snapshot.instances().to_vec();
    }
}
