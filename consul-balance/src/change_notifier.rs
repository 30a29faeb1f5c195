//! Synchronous, named-channel fan-out of events to external observers.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifies a handler registered on a [`ChangeNotifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler<E> = Arc<dyn Fn(&E) -> Result<(), anyhow::Error> + Send + Sync>;

/// Delivers events to every handler registered on a channel, in registration order.
///
/// A handler returning an error or panicking is logged and skipped: it neither
/// prevents the remaining handlers from running nor future emissions.
pub struct ChangeNotifier<E> {
    next_id: AtomicU64,
    channels: RwLock<HashMap<String, Vec<(HandlerId, Handler<E>)>>>,
}

impl<E> Default for ChangeNotifier<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            channels: RwLock::new(HashMap::new()),
        }
    }
}

impl<E> ChangeNotifier<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` on `channel`.
    pub fn on<F>(&self, channel: &str, handler: F) -> HandlerId
    where
        F: Fn(&E) -> Result<(), anyhow::Error> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.channels
            .write()
            .entry(channel.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Deregister a handler. Returns `false` if it was not registered on `channel`.
    pub fn off(&self, channel: &str, id: HandlerId) -> bool {
        let mut channels = self.channels.write();
        let Some(handlers) = channels.get_mut(channel) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            channels.remove(channel);
        }
        removed
    }

    /// Number of handlers currently registered on `channel`.
    pub fn listener_count(&self, channel: &str) -> usize {
        self.channels.read().get(channel).map_or(0, Vec::len)
    }

    /// Deliver `event` to the handlers of `channel` and return how many succeeded.
    pub fn emit(&self, channel: &str, event: &E) -> usize {
        // Release the lock before dispatching so handlers can call `on`/`off`.
        let handlers: Vec<(HandlerId, Handler<E>)> = match self.channels.read().get(channel) {
            Some(handlers) => handlers.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(err)) => {
                    tracing::warn!(channel, handler = id.0, "event handler failed: {:#}", err)
                }
                Err(panic) => tracing::error!(
                    channel,
                    handler = id.0,
                    "event handler panicked: {}",
                    panic_message(panic.as_ref())
                ),
            }
        }
        delivered
    }
}

/// Best effort rendering of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

impl<E> std::fmt::Debug for ChangeNotifier<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels: HashMap<String, usize> = self
            .channels
            .read()
            .iter()
            .map(|(channel, handlers)| (channel.clone(), handlers.len()))
            .collect();
        f.debug_struct("ChangeNotifier")
            .field("channels", &channels)
            .finish()
    }
}
