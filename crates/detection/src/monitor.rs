//! Device monitor
//!
//! [`DeviceMonitor`] owns the whole detection pipeline:
//!
//! ```text
//! usb-source thread            usb-dispatch thread         usb-query thread
//! PlatformEventSource::run     Handoff::take               QueryWorker::recv_command
//!   -> DeviceRegistry::add       -> Lifecycle check          -> DeviceRegistry::find
//!   -> Handoff::offer            -> Dispatcher::dispatch     -> Responder::respond
//! ```
//!
//! The registry is always kept current. Start and stop only control whether
//! events reach the registered callbacks. There is exactly one dispatch
//! thread for the life of the monitor; it parks between runs and picks up
//! the epoch of the next start, so callbacks never overlap, even when a
//! callback restarts monitoring.

use crate::dispatcher::Dispatcher;
use crate::handoff::Handoff;
use crate::lifecycle::{Lifecycle, MonitorState};
use crate::query::QueryEngine;
use crate::registry::DeviceRegistry;
use crate::source::{EventSink, PlatformEventSource};
use common::{DEFAULT_QUERY_QUEUE_DEPTH, QueryBridge};
use protocol::{DeviceEvent, DeviceRecord, QueryResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, info, warn};

/// Library-side monitor settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Start monitoring as soon as the monitor is created
    pub auto_start: bool,
    /// Maximum number of queued device queries
    pub query_queue_depth: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            auto_start: true,
            query_queue_depth: DEFAULT_QUERY_QUEUE_DEPTH,
        }
    }
}

/// State shared with the dispatch thread
struct MonitorShared {
    registry: Arc<DeviceRegistry>,
    handoff: Arc<Handoff<DeviceEvent>>,
    lifecycle: Lifecycle,
    dispatcher: Dispatcher,
    shutdown: Arc<AtomicBool>,
    /// Serializes start/stop so lifecycle and handoff change together
    control: Mutex<()>,
    /// Held by the dispatch thread while a callback runs
    delivering: Mutex<()>,
    dispatch_id: OnceLock<ThreadId>,
}

impl MonitorShared {
    fn start(&self) -> bool {
        let _control = lock(&self.control);

        if self.shutdown.load(Ordering::Acquire) {
            warn!("Cannot start monitoring after shutdown");
            return false;
        }
        if !self.lifecycle.start() {
            return false;
        }
        if self.handoff.open().is_none() {
            self.lifecycle.stop();
            return false;
        }
        true
    }

    fn stop(&self) -> bool {
        {
            let _control = lock(&self.control);
            if !self.lifecycle.stop() {
                return false;
            }
            if let Some(event) = self.handoff.close() {
                debug!("Monitoring stopped, discarding event: {}", event);
            }
        }

        // A callback stopping its own monitor must not wait for itself
        if self.on_dispatch_thread() {
            debug!("Stopped from a callback; no further events are delivered");
        } else {
            drop(lock(&self.delivering));
        }
        true
    }

    fn on_dispatch_thread(&self) -> bool {
        self.dispatch_id.get() == Some(&thread::current().id())
    }
}

fn lock(mutex: &Mutex<()>) -> MutexGuard<'_, ()> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn run_dispatch_loop(shared: Arc<MonitorShared>) {
    let mut epoch = 0;

    while let Some(current) = shared.handoff.wait_open(epoch) {
        epoch = current;
        debug!("Dispatching events (epoch {})", epoch);

        while let Some(event) = shared.handoff.take(epoch) {
            let _delivering = lock(&shared.delivering);
            // Stop may have landed between the take and here
            if !shared.lifecycle.is_running() || !shared.handoff.is_current(epoch) {
                debug!("Monitoring stopped, discarding event: {}", event);
                continue;
            }
            shared.dispatcher.dispatch(&event);
        }
    }

    debug!("Dispatch loop finished");
}

/// USB device presence monitor
///
/// Enumerates the attached devices on creation, then keeps the registry in
/// sync with the platform event source. While monitoring is running, every
/// change is reported to the registered callbacks on the `usb-dispatch`
/// thread. Queries run on the `usb-query` thread.
///
/// Dropping the monitor shuts it down.
pub struct DeviceMonitor {
    shared: Arc<MonitorShared>,
    query: QueryEngine,
    source_name: String,
    source_thread: Mutex<Option<JoinHandle<()>>>,
    dispatch_thread: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceMonitor {
    /// Create a monitor over `source`
    ///
    /// Runs the initial enumeration (without notifications), spawns the
    /// query worker plus the dispatch and source threads, and starts
    /// monitoring if `config.auto_start` is set.
    pub fn new<S>(mut source: S, config: MonitorConfig) -> common::Result<Self>
    where
        S: PlatformEventSource,
    {
        let source_name = source.name().to_string();
        let registry = Arc::new(DeviceRegistry::new());

        let count = registry.replace_all(source.enumerate()?);
        info!(
            "Initial enumeration via {} found {} device(s)",
            source_name, count
        );

        let query = QueryEngine::spawn(Arc::clone(&registry), config.query_queue_depth)?;

        let shared = Arc::new(MonitorShared {
            registry,
            handoff: Arc::new(Handoff::new()),
            lifecycle: Lifecycle::new(),
            dispatcher: Dispatcher::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            control: Mutex::new(()),
            delivering: Mutex::new(()),
            dispatch_id: OnceLock::new(),
        });

        let dispatch = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("usb-dispatch".to_string())
                .spawn(move || run_dispatch_loop(shared))
                .map_err(|e| {
                    common::Error::Thread(format!("Failed to spawn dispatch thread: {}", e))
                })?
        };
        let _ = shared.dispatch_id.set(dispatch.thread().id());

        let monitor = Self {
            shared,
            query,
            source_name,
            source_thread: Mutex::new(None),
            dispatch_thread: Mutex::new(Some(dispatch)),
        };

        if config.auto_start {
            monitor.start_monitoring();
        }

        let sink = EventSink::new(
            Arc::clone(&monitor.shared.registry),
            Arc::clone(&monitor.shared.handoff),
            Arc::clone(&monitor.shared.shutdown),
        );
        // On failure, dropping the monitor stops the other threads
        let source_thread = thread::Builder::new()
            .name("usb-source".to_string())
            .spawn(move || {
                if let Err(e) = source.run(sink) {
                    error!("Event source failed: {}", e);
                }
            })
            .map_err(|e| {
                common::Error::Thread(format!("Failed to spawn event source thread: {}", e))
            })?;
        *monitor
            .source_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(source_thread);

        Ok(monitor)
    }

    /// Start delivering events to the callbacks
    ///
    /// Returns false if already running or shut down.
    pub fn start_monitoring(&self) -> bool {
        self.shared.start()
    }

    /// Stop delivering events to the callbacks
    ///
    /// Blocks until a callback already running returns, unless called from
    /// a callback. Returns false if already stopped.
    pub fn stop_monitoring(&self) -> bool {
        self.shared.stop()
    }

    /// Check if events are delivered to the callbacks
    pub fn is_monitoring(&self) -> bool {
        self.shared.lifecycle.is_running()
    }

    /// Current lifecycle state
    pub fn state(&self) -> MonitorState {
        self.shared.lifecycle.state()
    }

    /// Set the callback for added devices; returns true if one was replaced
    pub fn register_added<F>(&self, callback: F) -> bool
    where
        F: Fn(&DeviceRecord) + Send + Sync + 'static,
    {
        self.shared.dispatcher.register_added(callback)
    }

    /// Set the callback for removed devices; returns true if one was replaced
    pub fn register_removed<F>(&self, callback: F) -> bool
    where
        F: Fn(&DeviceRecord) + Send + Sync + 'static,
    {
        self.shared.dispatcher.register_removed(callback)
    }

    /// Find connected devices (0 = unspecified)
    ///
    /// A product ID given without a vendor ID matches nothing.
    pub async fn find(&self, vendor_id: u16, product_id: u16) -> QueryResult<Vec<DeviceRecord>> {
        self.query.find(vendor_id, product_id).await
    }

    /// Blocking variant of [`DeviceMonitor::find`]
    pub fn find_blocking(&self, vendor_id: u16, product_id: u16) -> QueryResult<Vec<DeviceRecord>> {
        self.query.find_blocking(vendor_id, product_id)
    }

    /// Callback variant of [`DeviceMonitor::find`]; `callback` runs exactly once
    pub fn find_with<F>(&self, vendor_id: u16, product_id: u16, callback: F)
    where
        F: FnOnce(QueryResult<Vec<DeviceRecord>>) + Send + 'static,
    {
        self.query.find_with(vendor_id, product_id, callback);
    }

    /// Shared device registry
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.shared.registry
    }

    /// Query handle that outlives borrows of the monitor
    pub fn query_bridge(&self) -> QueryBridge {
        self.query.bridge()
    }

    /// Name of the platform event source
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Check if the monitor has been shut down
    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Stop monitoring and every background thread
    ///
    /// Safe to call more than once; later queries report the engine as
    /// unavailable.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down device monitor");

        // Closing the handoff also releases a producer blocked in offer
        self.shared.stop();
        if let Some(event) = self.shared.handoff.retire() {
            debug!("Shutting down, discarding event: {}", event);
        }

        let source = self
            .source_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = source
            && handle.join().is_err()
        {
            error!("Event source thread panicked");
        }

        let dispatch = self
            .dispatch_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = dispatch {
            if self.shared.on_dispatch_thread() {
                debug!("Shut down from a callback; dispatch loop exits after it returns");
            } else if handle.join().is_err() {
                error!("Dispatch thread panicked");
            }
        }

        self.query.shutdown();
        info!("Device monitor stopped");
    }
}

impl Drop for DeviceMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::scripted_source;
    use common::test_utils::{RecordLog, create_mock_device_list, create_mock_record, wait_until};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn manual() -> MonitorConfig {
        MonitorConfig {
            auto_start: false,
            ..MonitorConfig::default()
        }
    }

    #[test]
    fn test_initial_enumeration_is_silent() {
        let (source, _handle) = scripted_source(create_mock_device_list(3));
        let monitor = DeviceMonitor::new(source, MonitorConfig::default()).unwrap();
        let added = RecordLog::new();
        monitor.register_added(added.callback());

        assert_eq!(monitor.registry().len(), 3);
        assert!(monitor.is_monitoring());
        assert_eq!(monitor.source_name(), "scripted");

        thread::sleep(Duration::from_millis(20));
        assert!(added.is_empty());
    }

    #[test]
    fn test_start_stop_idempotent() {
        let (source, _handle) = scripted_source(Vec::new());
        let monitor = DeviceMonitor::new(source, manual()).unwrap();

        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert!(!monitor.stop_monitoring());
        assert!(monitor.start_monitoring());
        assert!(!monitor.start_monitoring());
        assert!(monitor.stop_monitoring());
        assert!(!monitor.stop_monitoring());
    }

    #[test]
    fn test_removed_callback_gets_registry_record() {
        let (source, handle) = scripted_source(create_mock_device_list(1));
        let monitor = DeviceMonitor::new(source, MonitorConfig::default()).unwrap();
        let removed = RecordLog::new();
        monitor.register_removed(removed.callback());

        handle.leave("usb-1-1").unwrap();

        assert!(wait_until(WAIT, || removed.len() == 1));
        assert_eq!(removed.records()[0], create_mock_device_list(1)[0].1);
        assert!(monitor.registry().is_empty());
    }

    #[test]
    fn test_stop_from_callback_does_not_deadlock() {
        let (source, handle) = scripted_source(Vec::new());
        let monitor = Arc::new(DeviceMonitor::new(source, MonitorConfig::default()).unwrap());
        let weak = Arc::downgrade(&monitor);
        monitor.register_added(move |_| {
            if let Some(monitor) = weak.upgrade() {
                monitor.stop_monitoring();
            }
        });

        handle.arrive("usb-1-1", create_mock_record(1, 1, 1)).unwrap();

        assert!(wait_until(WAIT, || !monitor.is_monitoring()));
        assert!(monitor.start_monitoring());
    }

    #[test]
    fn test_shutdown_rejects_start_and_queries() {
        let (source, _handle) = scripted_source(create_mock_device_list(2));
        let monitor = DeviceMonitor::new(source, MonitorConfig::default()).unwrap();

        monitor.shutdown();
        monitor.shutdown();

        assert!(monitor.is_shutdown());
        assert!(!monitor.is_monitoring());
        assert!(!monitor.start_monitoring());
        assert!(monitor.find_blocking(0, 0).is_err());
    }

    #[test]
    fn test_restart_from_callback_keeps_one_dispatcher() {
        let (source, handle) = scripted_source(Vec::new());
        let monitor = Arc::new(DeviceMonitor::new(source, MonitorConfig::default()).unwrap());
        let weak = Arc::downgrade(&monitor);
        let running = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let overlap = Arc::new(AtomicBool::new(false));
        let calls = RecordLog::new();
        let log = calls.callback();

        {
            let running = Arc::clone(&running);
            let overlap = Arc::clone(&overlap);
            monitor.register_added(move |record| {
                if running.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlap.store(true, Ordering::SeqCst);
                }
                if record.product_id == 1
                    && let Some(monitor) = weak.upgrade()
                {
                    monitor.stop_monitoring();
                    monitor.start_monitoring();
                    thread::sleep(Duration::from_millis(150));
                }
                log(record);
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        handle.arrive("usb-1-1", create_mock_record(1, 1, 1)).unwrap();
        thread::sleep(Duration::from_millis(30));
        handle.arrive("usb-1-2", create_mock_record(2, 1, 2)).unwrap();

        assert!(wait_until(WAIT, || calls.len() == 2));
        assert!(!overlap.load(Ordering::SeqCst));
        assert_eq!(
            calls.records().iter().map(|r| r.product_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }
}
