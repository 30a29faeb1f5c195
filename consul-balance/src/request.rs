//! The request shape handed to the outbound [`Transport`].

use http::{HeaderMap, Method};
use serde_json::{Map, Value};

/// An outbound request whose `url` is a path relative to the service.
///
/// Every field is optional so that a partial request can be merged over the client defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestSpec {
    pub method: Option<Method>,
    /// Path (and query) of the target, e.g. `/orders/42?expand=lines`.
    ///
    /// Rewritten to an absolute URL before reaching the transport.
    pub url: Option<String>,
    pub headers: Option<HeaderMap>,
    /// Transport specific options forwarded verbatim (e.g. `timeout`, `json`).
    pub extra: Map<String, Value>,
}

impl RequestSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a request targeting `path`.
    pub fn path<T: Into<String>>(path: T) -> Self {
        Self {
            url: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn method(self, method: Method) -> Self {
        Self {
            method: Some(method),
            ..self
        }
    }

    pub fn url<T: Into<String>>(self, url: T) -> Self {
        Self {
            url: Some(url.into()),
            ..self
        }
    }

    pub fn headers(self, headers: HeaderMap) -> Self {
        Self {
            headers: Some(headers),
            ..self
        }
    }

    /// Set a pass-through option.
    pub fn extra<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Fill every field the caller left unset with the one from `defaults`.
    ///
    /// A field set on `self` always wins. Pass-through options are merged key by key,
    /// `null` counting as unset.
    ///
    /// ```
    /// use consul_balance::RequestSpec;
    /// use http::Method;
    ///
    /// let defaults = RequestSpec::path("/health").method(Method::GET);
    /// let merged = RequestSpec::path("/orders").merge_defaults(&defaults);
    ///
    /// assert_eq!(merged.url.as_deref(), Some("/orders"));
    /// assert_eq!(merged.method, Some(Method::GET));
    /// ```
    pub fn merge_defaults(mut self, defaults: &RequestSpec) -> Self {
        if self.method.is_none() {
            self.method = defaults.method.clone();
        }
        if self.url.is_none() {
            self.url = defaults.url.clone();
        }
        if self.headers.is_none() {
            self.headers = defaults.headers.clone();
        }
        for (key, value) in &defaults.extra {
            match self.extra.get(key) {
                Some(existing) if !existing.is_null() => {}
                _ => {
                    self.extra.insert(key.clone(), value.clone());
                }
            }
        }
        self
    }
}

/// The outbound dispatcher performing the actual network call.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    type Response: Send + 'static;

    /// Send a request whose `url` is absolute.
    async fn send(&self, request: RequestSpec) -> Result<Self::Response, anyhow::Error>;
}

#[async_trait::async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    type Response = T::Response;

    async fn send(&self, request: RequestSpec) -> Result<Self::Response, anyhow::Error> {
        (**self).send(request).await
    }
}
