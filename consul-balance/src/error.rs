//! Failures surfaced by [`LoadBalancingClient`](crate::LoadBalancingClient) and
//! [`ServiceEngineCache`](crate::ServiceEngineCache).

/// Error returned to callers of the client and the engine cache.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The direct registry query used to seed an engine failed.
    #[error("failed to query the registry for service '{service}'")]
    RegistryQuery {
        service: String,
        #[source]
        source: anyhow::Error,
    },
    /// The registry answered, but reported no eligible instance.
    #[error("no service '{0}' was found")]
    ServiceNotFound(String),
    /// The request can not be dispatched as given.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Opaque failure reported by the outbound transport.
    #[error(transparent)]
    Transport(anyhow::Error),
}

/// Raised by a [`SelectionEngine`](crate::SelectionEngine) that has no instance to pick from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("the selection engine has no instance to pick from")]
pub struct EmptyPoolError;
