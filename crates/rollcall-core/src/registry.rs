//! Memoized, TTL-bounded snapshot of the known-face registry.
//!
//! Replaces the original design's single-slot cache with external
//! "minutes since last clear" bookkeeping: the cache owns its own load
//! timestamp and reload logic, exposing only `get` and `invalidate`.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;

use crate::types::{BoxError, RegistrySnapshot, RegistrySource};

#[derive(Debug, Error)]
pub enum CacheError {
    /// The underlying load failed. `stale` carries the previous snapshot
    /// when one exists, so callers can decide whether to keep serving it;
    /// with no snapshot at all, matching cannot proceed.
    #[error("registry load failed: {cause}")]
    LoadFailed {
        cause: BoxError,
        stale: Option<Arc<RegistrySnapshot>>,
    },
}

/// TTL-bounded memoization of a full registry load.
///
/// `get` within the TTL window returns the memoized snapshot without
/// touching storage; the TTL is wall-clock elapsed time since the last
/// successful load, never a call count. Readers always observe either
/// the old snapshot or the fully built new one.
pub struct RegistryCache<S> {
    source: S,
    ttl: Duration,
    slot: Mutex<Option<Arc<RegistrySnapshot>>>,
}

impl<S: RegistrySource> RegistryCache<S> {
    pub fn new(source: S, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            slot: Mutex::new(None),
        }
    }

    /// Return the current snapshot, reloading from the source if none is
    /// memoized or the memoized one has outlived the TTL.
    pub fn get(&self) -> Result<Arc<RegistrySnapshot>, CacheError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(snapshot) = slot.as_ref() {
            if snapshot.loaded_at().elapsed() < self.ttl {
                return Ok(Arc::clone(snapshot));
            }
        }

        match self.source.load_known_faces() {
            Ok(entries) => {
                let snapshot = Arc::new(RegistrySnapshot::new(entries));
                tracing::info!(entries = snapshot.len(), "reloaded known-face registry");
                *slot = Some(Arc::clone(&snapshot));
                Ok(snapshot)
            }
            Err(cause) => {
                tracing::warn!(error = %cause, "registry reload failed");
                Err(CacheError::LoadFailed {
                    cause,
                    stale: slot.clone(),
                })
            }
        }
    }

    /// Force the next `get` to reload, regardless of TTL. Idempotent and
    /// safe to call before any snapshot exists.
    pub fn invalidate(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.take().is_some() {
            tracing::debug!("registry cache invalidated");
        }
    }
}
