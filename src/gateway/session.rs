//! Per-handle discovery cache with staleness tracking
//!
//! A [`Session`] owns what a backend learned during discovery (its control
//! endpoint plus the internal and external addresses seen at that time) and
//! the handle's lifecycle state:
//!
//! ```text
//! Uninitialized -> Discovering -> Ready <-> Stale
//!                       ^                     |
//!                       +---------------------+
//! ```
//!
//! Discovery is single-flight: the session lock is held while it runs, so
//! callers arriving meanwhile wait and then share its outcome, including a
//! failure, instead of sending their own discovery traffic.

use super::types::{GatewayError, Result};
use std::fmt::Debug;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Lifecycle state of a gateway handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Nothing discovered yet
    Uninitialized = 0,
    /// A discovery attempt is in flight
    Discovering = 1,
    /// The cache holds a usable endpoint
    Ready = 2,
    /// The cached endpoint failed and was dropped; next call rediscovers
    Stale = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Discovering,
            2 => Self::Ready,
            3 => Self::Stale,
            _ => Self::Uninitialized,
        }
    }
}

/// Discovery results, consistent as of the last successful discovery
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCache<E> {
    /// Control endpoint (control URL or gateway address)
    pub endpoint: E,
    /// Local address used to reach the gateway
    pub internal_ip: Option<Ipv4Addr>,
    /// Last external address reported by the gateway
    pub external_ip: Option<Ipv4Addr>,
}

/// Cache contents handed to an operation
#[derive(Debug, Clone)]
pub struct Acquired<E> {
    /// The cached discovery results
    pub cache: SessionCache<E>,
    /// True when discovery ran for this call
    pub discovered: bool,
}

struct Inner<E> {
    cache: Option<SessionCache<E>>,
    /// Most recent failed discovery, tagged with its completion number
    last_failure: Option<(u64, GatewayError)>,
}

/// Discovery cache and state machine for one gateway handle
pub struct Session<E> {
    inner: Mutex<Inner<E>>,
    state: AtomicU8,
    attempts: AtomicU64,
    completed: AtomicU64,
}

impl<E> Session<E>
where
    E: Clone + PartialEq + Debug,
{
    /// Create an empty session
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                cache: None,
                last_failure: None,
            }),
            state: AtomicU8::new(SessionState::Uninitialized as u8),
            attempts: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Number of discovery attempts started so far
    pub fn discoveries(&self) -> u64 {
        self.attempts.load(Ordering::Acquire)
    }

    fn set_state(&self, state: SessionState) {
        let previous = SessionState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            debug!("Gateway session {:?} -> {:?}", previous, state);
        }
    }

    /// Copy of the cache, if discovery has succeeded
    pub async fn snapshot(&self) -> Option<SessionCache<E>> {
        self.inner.lock().await.cache.clone()
    }

    /// Return the cached endpoint, running `discover` if there is none
    pub async fn acquire<F, Fut>(&self, discover: F) -> Result<Acquired<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SessionCache<E>>>,
    {
        let seen = self.completed.load(Ordering::Acquire);
        let mut inner = self.inner.lock().await;

        if let Some(cache) = &inner.cache {
            return Ok(Acquired {
                cache: cache.clone(),
                discovered: false,
            });
        }

        // A discovery finished while we waited for the lock and failed
        if let Some((finished, err)) = &inner.last_failure {
            if *finished > seen {
                return Err(err.clone());
            }
        }

        let fallback = match self.state() {
            SessionState::Stale => SessionState::Stale,
            _ => SessionState::Uninitialized,
        };
        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        self.set_state(SessionState::Discovering);
        let mut restore = RestoreOnDrop {
            state: &self.state,
            fallback,
            armed: true,
        };

        let outcome = discover().await;
        restore.armed = false;
        let finished = self.completed.fetch_add(1, Ordering::AcqRel) + 1;

        match outcome {
            Ok(cache) => {
                debug!("Gateway discovery #{} succeeded: {:?}", attempt, cache);
                inner.cache = Some(cache.clone());
                inner.last_failure = None;
                self.set_state(SessionState::Ready);
                Ok(Acquired {
                    cache,
                    discovered: true,
                })
            }
            Err(err) => {
                debug!("Gateway discovery #{} failed: {}", attempt, err);
                inner.last_failure = Some((finished, err.clone()));
                self.set_state(fallback);
                Err(err)
            }
        }
    }

    /// Drop the cache if it still points at `endpoint`
    ///
    /// A concurrent caller may already have rediscovered a new endpoint, which
    /// is left in place.
    pub async fn invalidate(&self, endpoint: &E) {
        let mut inner = self.inner.lock().await;
        if inner.cache.as_ref().is_some_and(|c| &c.endpoint == endpoint) {
            inner.cache = None;
            self.set_state(SessionState::Stale);
        }
    }

    /// Update the cached external address for `endpoint`
    pub async fn record_external_ip(&self, endpoint: &E, external_ip: Ipv4Addr) {
        let mut inner = self.inner.lock().await;
        if let Some(cache) = inner.cache.as_mut().filter(|c| &c.endpoint == endpoint) {
            if cache.external_ip != Some(external_ip) {
                debug!(
                    "External address changed: {:?} -> {}",
                    cache.external_ip, external_ip
                );
                cache.external_ip = Some(external_ip);
            }
        }
    }

    /// Forget everything and return to `Uninitialized`
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.cache = None;
        inner.last_failure = None;
        self.set_state(SessionState::Uninitialized);
    }

    /// Run `op` against the cached endpoint with one rediscovery on staleness
    ///
    /// If `op` fails with a stale signal the cache is invalidated, discovery
    /// runs again and `op` is retried once against whatever it found, even
    /// the same endpoint. The second failure is returned as-is.
    pub async fn run<D, DFut, F, Fut, T>(&self, discover: D, op: F) -> Result<T>
    where
        D: Fn() -> DFut,
        DFut: Future<Output = Result<SessionCache<E>>>,
        F: Fn(Acquired<E>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let first = self.acquire(&discover).await?;
        let endpoint = first.cache.endpoint.clone();
        let discovered_now = first.discovered;

        let err = match op(first).await {
            Err(err) if err.is_stale_signal() => err,
            other => return other,
        };

        if let GatewayError::Parse(detail) = &err {
            warn!("Malformed response from {:?}: {}", endpoint, detail);
        }

        self.invalidate(&endpoint).await;
        if discovered_now {
            // Found moments ago, so rediscovering now would return it again
            return Err(err);
        }

        warn!("Cached gateway endpoint {:?} failed ({}), rediscovering", endpoint, err);

        // Retried even when the endpoint is unchanged
        let fresh = self.acquire(&discover).await?;
        if fresh.cache.endpoint == endpoint {
            debug!("Rediscovery returned the same endpoint {:?}", endpoint);
        }

        op(fresh).await
    }
}

impl<E> Default for Session<E>
where
    E: Clone + PartialEq + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Resets the state if a discovery future is dropped before completing
struct RestoreOnDrop<'a> {
    state: &'a AtomicU8,
    fallback: SessionState,
    armed: bool,
}

impl Drop for RestoreOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.store(self.fallback as u8, Ordering::Release);
        }
    }
}
