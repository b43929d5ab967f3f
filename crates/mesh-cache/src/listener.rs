//! Listener registry for cache change events.
//!
//! The listener system provides:
//! - Unique listener identifiers ([`ListenerId`])
//! - The callback contract ([`Listener`])
//! - Synchronous fan-out with failure isolation ([`ListenerManager`])

use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use mesh_core::{MeshError, MeshResult};
use tracing::{debug, trace, warn};

use crate::event::CacheEvent;

/// Unique identifier for a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric value of this listener ID.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Receives change events from one cache.
///
/// Callbacks run inline on the merging task, after the index has been
/// updated. They should be quick; anything slow belongs on a channel.
pub trait Listener<T>: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Handle one event. Errors are logged and counted, never propagated.
    fn on_event(&self, event: &CacheEvent<T>) -> MeshResult<()>;
}

struct FnListener<T, F> {
    name: String,
    callback: F,
    _marker: PhantomData<fn(&T)>,
}

impl<T, F> Listener<T> for FnListener<T, F>
where
    F: Fn(&CacheEvent<T>) -> MeshResult<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, event: &CacheEvent<T>) -> MeshResult<()> {
        (self.callback)(event)
    }
}

/// Wrap a closure as a listener.
///
/// # Example
///
/// ```rust
/// use mesh_cache::{listener_fn, CacheEvent, Listener};
/// use mesh_core::Instance;
///
/// let listener = listener_fn("audit", |event: &CacheEvent<Instance>| {
///     println!("{:?} x{}", event.kind(), event.len());
///     Ok(())
/// });
/// assert_eq!(listener.name(), "audit");
/// ```
pub fn listener_fn<T, F>(name: impl Into<String>, callback: F) -> Arc<dyn Listener<T>>
where
    T: 'static,
    F: Fn(&CacheEvent<T>) -> MeshResult<()> + Send + Sync + 'static,
{
    Arc::new(FnListener {
        name: name.into(),
        callback,
        _marker: PhantomData,
    })
}

type Registered<T> = (ListenerId, Arc<dyn Listener<T>>);

/// Ordered set of listeners for one cache.
///
/// Uses an `RwLock` internally; registration is rare and emission only
/// clones the listener list before calling out.
pub struct ListenerManager<T> {
    listeners: RwLock<Vec<Registered<T>>>,
}

impl<T> fmt::Debug for ListenerManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerManager")
            .field("listeners", &self.len())
            .finish()
    }
}

impl<T> Default for ListenerManager<T> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl<T> ListenerManager<T> {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn add(&self, listener: Arc<dyn Listener<T>>) -> ListenerId {
        let id = ListenerId::next();
        let name = listener.name().to_string();
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        debug!(listener_id = %id, listener = %name, "registered listener");
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        match listeners.iter().position(|(lid, _)| *lid == id) {
            Some(pos) => {
                listeners.remove(pos);
                debug!(listener_id = %id, "removed listener");
                true
            }
            None => {
                warn!(listener_id = %id, "attempted to remove unknown listener");
                false
            }
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every listener and return how many failed.
    ///
    /// A listener that returns an error or panics is logged at `warn`; the
    /// remaining listeners still run.
    pub fn emit(&self, event: &CacheEvent<T>) -> u64 {
        let listeners: Vec<Registered<T>> = {
            let guard = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            if guard.is_empty() {
                return 0;
            }
            guard.clone()
        };

        let mut failures = 0;
        for (id, listener) in &listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener.on_event(event)))
                .unwrap_or_else(|panic| {
                    Err(MeshError::ListenerFailed {
                        listener: listener.name().to_string(),
                        message: panic_message(panic.as_ref()),
                    })
                });
            if let Err(error) = result {
                failures += 1;
                warn!(
                    listener_id = %id,
                    listener = listener.name(),
                    event = event.kind().as_str(),
                    %error,
                    "listener failed"
                );
            }
        }

        trace!(
            event = event.kind().as_str(),
            entities = event.len(),
            listeners = listeners.len(),
            failures,
            "emitted cache event"
        );
        failures
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "listener panicked".to_string()
    }
}
