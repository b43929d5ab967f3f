//! Deduplication of concurrent calls.
//!
//! [`SingleFlight`] keeps a registry of in-flight calls keyed by name. The
//! first caller for a key runs the work; callers that arrive while it is in
//! flight wait on a `watch` channel and receive the same result instead of
//! issuing their own call. A leader that is cancelled before finishing
//! closes its channel, and the waiting callers elect a new leader.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use mesh_core::{MeshError, MeshResult};
use tokio::sync::watch;
use tracing::trace;

type Outcome<T> = Option<Result<T, String>>;

/// Result of a deduplicated call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flight<T> {
    /// This caller ran the work.
    Led(T),
    /// This caller joined a call already in flight.
    Joined(T),
}

impl<T> Flight<T> {
    /// Whether this caller joined someone else's call.
    pub fn is_joined(&self) -> bool {
        matches!(self, Flight::Joined(_))
    }

    /// Take the value.
    pub fn into_inner(self) -> T {
        match self {
            Flight::Led(v) | Flight::Joined(v) => v,
        }
    }
}

/// Registry of in-flight calls keyed by name.
#[derive(Debug)]
pub struct SingleFlight<T> {
    calls: Mutex<HashMap<String, watch::Receiver<Outcome<T>>>>,
    led: AtomicU64,
    joined: AtomicU64,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            led: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }
}

enum Role<T> {
    Leader(watch::Sender<Outcome<T>>, watch::Receiver<Outcome<T>>),
    Follower(watch::Receiver<Outcome<T>>),
}

/// Removes the registry entry when the leader finishes or is dropped.
struct FlightGuard<'a, T> {
    calls: &'a Mutex<HashMap<String, watch::Receiver<Outcome<T>>>>,
    key: &'a str,
    marker: watch::Receiver<Outcome<T>>,
}

impl<T> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        if calls
            .get(self.key)
            .is_some_and(|rx| rx.same_channel(&self.marker))
        {
            calls.remove(self.key);
        }
    }
}

impl<T: Clone + Send + Sync> SingleFlight<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key`, or join the call already in flight.
    ///
    /// Joined callers that observe a failure get
    /// [`MeshError::InFlightFailed`] carrying the leader's message; the
    /// leader gets the original error.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> MeshResult<Flight<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = MeshResult<T>>,
    {
        let mut work = Some(work);
        loop {
            let role = {
                let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
                match calls.get(key) {
                    Some(rx) => Role::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        calls.insert(key.to_string(), rx.clone());
                        Role::Leader(tx, rx)
                    }
                }
            };

            match role {
                Role::Leader(tx, marker) => {
                    let Some(work) = work.take() else {
                        return Err(MeshError::Internal {
                            message: format!("single flight {key} lost its work"),
                            source: None,
                        });
                    };
                    self.led.fetch_add(1, Ordering::Relaxed);
                    let guard = FlightGuard {
                        calls: &self.calls,
                        key,
                        marker,
                    };
                    let result = work().await;
                    drop(guard);

                    let shared = match &result {
                        Ok(value) => Ok(value.clone()),
                        Err(err) => Err(err.to_string()),
                    };
                    // No receivers left is fine; nobody joined.
                    let _ = tx.send(Some(shared));
                    return result.map(Flight::Led);
                }
                Role::Follower(mut rx) => {
                    trace!(key, "joining in-flight call");
                    let outcome = match rx.wait_for(Option::is_some).await {
                        Ok(outcome) => (*outcome).clone(),
                        // Leader dropped without a result; try to lead.
                        Err(_) => continue,
                    };
                    self.joined.fetch_add(1, Ordering::Relaxed);
                    return match outcome {
                        Some(Ok(value)) => Ok(Flight::Joined(value)),
                        Some(Err(message)) => Err(MeshError::InFlightFailed {
                            key: key.to_string(),
                            message,
                        }),
                        None => continue,
                    };
                }
            }
        }
    }

    /// Whether a call for `key` is in flight.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    /// Number of calls that ran the work.
    pub fn led(&self) -> u64 {
        self.led.load(Ordering::Relaxed)
    }

    /// Number of calls that joined another call.
    pub fn joined(&self) -> u64 {
        self.joined.load(Ordering::Relaxed)
    }
}
