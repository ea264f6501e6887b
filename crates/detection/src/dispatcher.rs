//! Callback dispatcher
//!
//! Holds at most one "added" and one "removed" callback. Callbacks run on the
//! dispatch thread, one at a time, in the order events were handed off.

use protocol::{DeviceEvent, DeviceRecord, Direction};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error};

/// Callback invoked with the record of an added or removed device
pub type DeviceCallback = Arc<dyn Fn(&DeviceRecord) + Send + Sync + 'static>;

/// Routes device events to the registered callbacks
#[derive(Default)]
pub struct Dispatcher {
    added: RwLock<Option<DeviceCallback>>,
    removed: RwLock<Option<DeviceCallback>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("added", &self.slot(Direction::Added).is_some())
            .field("removed", &self.slot(Direction::Removed).is_some())
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher with no callbacks
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the callback for added devices, replacing any previous one
    ///
    /// Returns true if a callback was replaced.
    pub fn register_added<F>(&self, callback: F) -> bool
    where
        F: Fn(&DeviceRecord) + Send + Sync + 'static,
    {
        self.register(Direction::Added, Arc::new(callback))
    }

    /// Set the callback for removed devices, replacing any previous one
    ///
    /// Returns true if a callback was replaced.
    pub fn register_removed<F>(&self, callback: F) -> bool
    where
        F: Fn(&DeviceRecord) + Send + Sync + 'static,
    {
        self.register(Direction::Removed, Arc::new(callback))
    }

    /// Set the callback for one direction
    pub fn register(&self, direction: Direction, callback: DeviceCallback) -> bool {
        let lock = match direction {
            Direction::Added => &self.added,
            Direction::Removed => &self.removed,
        };
        lock.write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(callback)
            .is_some()
    }

    /// Check if a callback is registered for `direction`
    pub fn has_callback(&self, direction: Direction) -> bool {
        self.slot(direction).is_some()
    }

    /// Invoke the callback matching the event's direction
    ///
    /// Returns true if a callback ran to completion. Events with no
    /// registered callback are dropped. A panicking callback is logged and
    /// does not take the dispatch thread down.
    pub fn dispatch(&self, event: &DeviceEvent) -> bool {
        // Clone out of the lock so a callback may re-register itself
        let Some(callback) = self.slot(event.direction) else {
            debug!("No {} callback registered, dropping event", event.direction);
            return false;
        };

        match catch_unwind(AssertUnwindSafe(|| callback(&event.record))) {
            Ok(()) => true,
            Err(panic) => {
                error!(
                    "Device {} callback panicked for {}: {}",
                    event.direction,
                    event.record.id_string(),
                    panic_message(&panic)
                );
                false
            }
        }
    }

    fn slot(&self, direction: Direction) -> Option<DeviceCallback> {
        let lock = match direction {
            Direction::Added => &self.added,
            Direction::Removed => &self.removed,
        };
        lock.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
