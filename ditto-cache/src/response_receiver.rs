//! Correlation-id keyed cache of response receivers
//!
//! When a live command or message is dispatched, the receiver of its eventual
//! response is registered here under the command's correlation id. Each entry
//! expires after the command's own timeout (or the fallback expiry when the
//! command declares none), counted from insertion. A timer removes the entry
//! proactively once it expires.

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use ditto_model::{AuthorizationContext, Signal};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Fallback expiry for entries whose signal declares no timeout
pub const DEFAULT_FALLBACK_EXPIRY: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResponseReceiverCacheError {
    #[error("signal '{0}' has no correlation-id header")]
    MissingCorrelationId(String),
}

/// Registered receiver and the authorization it was registered with
#[derive(Debug, Clone)]
pub struct ResponseReceiverEntry<R> {
    pub receiver: R,
    pub authorization_context: AuthorizationContext,
}

struct Slot<R> {
    entry: ResponseReceiverEntry<R>,
    expires_at: Instant,
    token: u64,
}

struct Inner<R> {
    slots: DashMap<String, Slot<R>>,
    fallback_expiry: Duration,
    tokens: AtomicU64,
}

pub struct ResponseReceiverCache<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for ResponseReceiverCache<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Clone + Send + Sync + 'static> Default for ResponseReceiverCache<R> {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_EXPIRY)
    }
}

impl<R: Clone + Send + Sync + 'static> ResponseReceiverCache<R> {
    pub fn new(fallback_expiry: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: DashMap::new(),
                fallback_expiry,
                tokens: AtomicU64::new(0),
            }),
        }
    }

    pub fn fallback_expiry(&self) -> Duration {
        self.inner.fallback_expiry
    }

    /// Register `receiver` under the signal's correlation id, replacing any
    /// receiver already registered for it
    pub fn cache_signal_response_receiver(
        &self,
        signal: &Signal,
        receiver: R,
    ) -> Result<(), ResponseReceiverCacheError> {
        let correlation_id = correlation_id_of(signal)?;
        let slot = self.new_slot(signal, receiver);
        let token = slot.token;
        let expiry = self.expiry_of(signal);
        self.inner.slots.insert(correlation_id.clone(), slot);
        self.schedule_invalidation(correlation_id, token, expiry);
        Ok(())
    }

    /// Register a receiver under a correlation id nobody else holds
    ///
    /// If the signal's correlation id is taken, the signal gets the id
    /// `<original>_<uuid>` instead. `receiver_creator` sees the signal with
    /// its final id; `response_handler` gets the signal and the receiver.
    pub fn insert_response_receiver_conflict_free<F, H, T>(
        &self,
        mut signal: Signal,
        receiver_creator: F,
        response_handler: H,
    ) -> Result<T, ResponseReceiverCacheError>
    where
        F: FnOnce(&Signal) -> R,
        H: FnOnce(Signal, R) -> T,
    {
        let original = correlation_id_of(&signal)?;
        let mut candidate = original.clone();
        let now = Instant::now();
        loop {
            match self.inner.slots.entry(candidate.clone()) {
                MapEntry::Occupied(occupied) if occupied.get().expires_at > now => {
                    drop(occupied);
                    candidate = format!("{}_{}", original, Uuid::new_v4());
                    debug!(%original, %candidate, "correlation id taken, retrying");
                }
                MapEntry::Occupied(mut occupied) => {
                    signal.headers_mut().set_correlation_id(candidate.clone());
                    let receiver = receiver_creator(&signal);
                    let slot = self.new_slot(&signal, receiver.clone());
                    let token = slot.token;
                    occupied.insert(slot);
                    drop(occupied);
                    self.schedule_invalidation(candidate, token, self.expiry_of(&signal));
                    return Ok(response_handler(signal, receiver));
                }
                MapEntry::Vacant(vacant) => {
                    signal.headers_mut().set_correlation_id(candidate.clone());
                    let receiver = receiver_creator(&signal);
                    let slot = self.new_slot(&signal, receiver.clone());
                    let token = slot.token;
                    vacant.insert(slot);
                    self.schedule_invalidation(candidate, token, self.expiry_of(&signal));
                    return Ok(response_handler(signal, receiver));
                }
            }
        }
    }

    /// Receiver registered for `correlation_id`, unless expired
    pub fn get(&self, correlation_id: &str) -> Option<ResponseReceiverEntry<R>> {
        let now = Instant::now();
        self.inner
            .slots
            .get(correlation_id)
            .filter(|slot| slot.expires_at > now)
            .map(|slot| slot.entry.clone())
    }

    /// Remove and return the receiver; at most one caller gets it
    pub fn take(&self, correlation_id: &str) -> Option<ResponseReceiverEntry<R>> {
        let now = Instant::now();
        self.inner
            .slots
            .remove(correlation_id)
            .filter(|(_, slot)| slot.expires_at > now)
            .map(|(_, slot)| slot.entry)
    }

    pub fn invalidate(&self, correlation_id: &str) -> bool {
        self.inner.slots.remove(correlation_id).is_some()
    }

    /// Number of unexpired entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .slots
            .iter()
            .filter(|slot| slot.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expiry_of(&self, signal: &Signal) -> Duration {
        signal
            .headers()
            .timeout()
            .unwrap_or(self.inner.fallback_expiry)
    }

    fn new_slot(&self, signal: &Signal, receiver: R) -> Slot<R> {
        Slot {
            entry: ResponseReceiverEntry {
                receiver,
                authorization_context: signal.headers().authorization_context().clone(),
            },
            expires_at: expiry_instant(Instant::now(), self.expiry_of(signal)),
            token: self.inner.tokens.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn schedule_invalidation(&self, correlation_id: String, token: u64, after: Duration) {
        let inner: Weak<Inner<R>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(inner) = inner.upgrade() {
                if inner
                    .slots
                    .remove_if(&correlation_id, |_, slot| slot.token == token)
                    .is_some()
                {
                    debug!(%correlation_id, "response receiver expired");
                }
            }
        });
    }
}

/// `now + expiry`, saturating at roughly thirty years ahead
fn expiry_instant(now: Instant, expiry: Duration) -> Instant {
    now.checked_add(expiry)
        .unwrap_or_else(|| now + Duration::from_secs(86400 * 365 * 30))
}

fn correlation_id_of(signal: &Signal) -> Result<String, ResponseReceiverCacheError> {
    signal
        .correlation_id()
        .map(str::to_string)
        .ok_or_else(|| ResponseReceiverCacheError::MissingCorrelationId(signal.name().to_string()))
}
