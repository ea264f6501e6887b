//! Single-slot notification handoff
//!
//! Delivers one event at a time from the platform event source thread
//! (producer) to the dispatch thread (consumer). The slot is guarded by one
//! mutex and two condition variables:
//!
//! - `event_handled`: the producer waits here until the previous event has
//!   been moved out of the slot, so it can never overwrite an undelivered
//!   event.
//! - `event_available`: the consumer waits here until the producer has
//!   filled the slot.
//!
//! Closing the handoff wakes both sides unconditionally. A waiting consumer
//! returns `None`, a waiting producer gets its event back, and an event left
//! in the slot is dropped. Every open period is numbered (its epoch), and a
//! consumer only takes events from the epoch it asked for, so an event
//! offered after a restart is never handed out under an earlier run.
//!
//! A long-lived consumer parks in [`Handoff::wait_open`] between runs.
//! [`Handoff::retire`] closes the handoff for good and releases it.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tracing::trace;

#[derive(Debug)]
struct Slot<T> {
    pending: Option<T>,
    handled: bool,
    closed: bool,
    retired: bool,
    epoch: u64,
}

/// Single-slot blocking channel between one producer and one consumer
#[derive(Debug)]
pub struct Handoff<T> {
    slot: Mutex<Slot<T>>,
    event_available: Condvar,
    event_handled: Condvar,
}

impl<T> Default for Handoff<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Handoff<T> {
    /// Create a closed handoff; call [`Handoff::open`] before use
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                pending: None,
                handled: true,
                closed: true,
                retired: false,
                epoch: 0,
            }),
            event_available: Condvar::new(),
            event_handled: Condvar::new(),
        }
    }

    /// Open the handoff and return the epoch consumers must use
    ///
    /// Opening an already open handoff returns the current epoch. A retired
    /// handoff stays closed and returns `None`.
    pub fn open(&self) -> Option<u64> {
        let mut slot = self.lock();
        if slot.retired {
            return None;
        }
        if slot.closed {
            slot.closed = false;
            slot.handled = true;
            slot.pending = None;
            slot.epoch += 1;
            trace!("Handoff opened (epoch {})", slot.epoch);
        }
        let epoch = slot.epoch;
        drop(slot);

        self.event_available.notify_all();
        Some(epoch)
    }

    /// Close the handoff and wake every waiter
    ///
    /// Returns the undelivered event, if one was waiting in the slot.
    pub fn close(&self) -> Option<T> {
        let mut slot = self.lock();
        slot.closed = true;
        slot.handled = true;
        let dropped = slot.pending.take();
        drop(slot);

        self.event_available.notify_all();
        self.event_handled.notify_all();
        dropped
    }

    /// Close the handoff permanently
    ///
    /// Wakes every waiter, including consumers parked in
    /// [`Handoff::wait_open`], and returns the undelivered event if any.
    pub fn retire(&self) -> Option<T> {
        let mut slot = self.lock();
        slot.retired = true;
        slot.closed = true;
        slot.handled = true;
        let dropped = slot.pending.take();
        drop(slot);

        self.event_available.notify_all();
        self.event_handled.notify_all();
        dropped
    }

    /// Wait for an open period newer than `seen` (consumer side)
    ///
    /// Returns its epoch, or `None` once the handoff is retired.
    pub fn wait_open(&self, seen: u64) -> Option<u64> {
        let mut slot = self.lock();
        loop {
            if slot.retired {
                return None;
            }
            if !slot.closed && slot.epoch != seen {
                return Some(slot.epoch);
            }
            slot = self
                .event_available
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Hand an event to the consumer (producer side)
    ///
    /// Blocks until the previous event has been taken. Returns the event
    /// back if the handoff is closed, either on entry or while waiting.
    pub fn offer(&self, event: T) -> Result<(), T> {
        let mut slot = self.lock();
        while !slot.handled && !slot.closed {
            slot = self
                .event_handled
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if slot.closed {
            return Err(event);
        }

        slot.pending = Some(event);
        slot.handled = false;
        drop(slot);

        // Consumers of a stale epoch may also be waiting; wake all of them
        self.event_available.notify_all();
        Ok(())
    }

    /// Take the next event (consumer side)
    ///
    /// Blocks until an event is available. Returns `None` once the handoff
    /// is closed or reopened under a different epoch.
    pub fn take(&self, epoch: u64) -> Option<T> {
        let mut slot = self.lock();
        loop {
            if slot.closed || slot.epoch != epoch {
                return None;
            }
            if let Some(event) = slot.pending.take() {
                slot.handled = true;
                drop(slot);
                self.event_handled.notify_one();
                return Some(event);
            }
            slot = self
                .event_available
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Check if `epoch` is the current open period
    pub fn is_current(&self, epoch: u64) -> bool {
        let slot = self.lock();
        !slot.closed && slot.epoch == epoch
    }

    /// Check if an event is waiting in the slot
    pub fn has_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
