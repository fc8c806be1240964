// # Common Types and Utilities
//
// Shared infrastructure used across all keyplane modules: the stable
// identifier stringifier/hasher that produces routing hash codes, the
// process-wide trip switch, and the cancellation token threaded through
// blocking waits.

pub mod hashing;
pub mod tripswitch;

pub use hashing::{fnv1a_hash32, Fnv1aKeyHasher, KeyHasher};
pub use tripswitch::{process_trip_switch, TripSwitch};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::{AccessError, Result};

/// Cooperative cancellation token. Cloned into every blocking wait and RPC
/// loop; once cancelled, waiters surface `AccessError::Cancelled` without
/// further side effects.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Fail fast if cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(AccessError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, returning `Cancelled` if the token fires first.
    pub async fn sleep(&self, duration: std::time::Duration) -> Result<()> {
        self.check()?;
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.inner.notify.notified() => Err(AccessError::Cancelled),
        }
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.inner.notify.notified().await;
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
