// Trip switch
//
// A write-once, process-wide latch. Once tripped, every externally facing
// entry point fails fast with `ServiceUnavailable` until the process is
// restarted. Tripping is idempotent; only the first reason is retained.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{AccessError, Result};

pub struct TripSwitch {
    tripped: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl TripSwitch {
    pub fn new() -> Self {
        Self {
            tripped: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    /// Trip the switch. The first caller's reason wins; later calls are
    /// no-ops.
    pub fn trip(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self
            .tripped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::error!("trip switch actuated: {}", reason);
            *self.reason.lock() = Some(reason);
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Entry-point gate. Returns `ServiceUnavailable` carrying the trip
    /// reason once the switch has fired.
    pub fn guard(&self) -> Result<()> {
        if self.is_tripped() {
            let reason = self
                .reason
                .lock()
                .clone()
                .unwrap_or_else(|| "trip switch actuated".to_string());
            Err(AccessError::ServiceUnavailable(reason))
        } else {
            Ok(())
        }
    }
}

impl Default for TripSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TripSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TripSwitch")
            .field("tripped", &self.is_tripped())
            .finish()
    }
}

static PROCESS_SWITCH: Lazy<Arc<TripSwitch>> = Lazy::new(|| Arc::new(TripSwitch::new()));

/// The process-level switch the server binary threads through its nodes.
/// Initialized once at startup; tests construct their own instances instead.
pub fn process_trip_switch() -> Arc<TripSwitch> {
    PROCESS_SWITCH.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_passes_until_tripped() {
        let switch = TripSwitch::new();
        assert!(switch.guard().is_ok());
        switch.trip("storage unrecoverable");
        assert!(switch.is_tripped());
        match switch.guard() {
            Err(AccessError::ServiceUnavailable(reason)) => {
                assert_eq!(reason, "storage unrecoverable")
            }
            other => panic!("expected ServiceUnavailable, got {:?}", other),
        }
    }

    #[test]
    fn test_first_reason_wins() {
        let switch = TripSwitch::new();
        switch.trip("first");
        switch.trip("second");
        match switch.guard() {
            Err(AccessError::ServiceUnavailable(reason)) => assert_eq!(reason, "first"),
            other => panic!("expected ServiceUnavailable, got {:?}", other),
        }
    }
}
