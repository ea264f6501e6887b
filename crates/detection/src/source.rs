//! Platform event sources
//!
//! A [`PlatformEventSource`] discovers devices and reports arrivals and
//! removals. It runs on its own thread (`usb-source`) and talks to the rest
//! of the detector only through an [`EventSink`], which keeps the registry
//! up to date and hands events to the dispatcher.

use crate::handoff::Handoff;
use crate::registry::DeviceRegistry;
use async_channel::{Receiver, Sender, TryRecvError};
use protocol::{DeviceEvent, DeviceKey, DeviceRecord};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// OS-specific device discovery and change notification
pub trait PlatformEventSource: Send + 'static {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Initial pass over the devices attached right now
    ///
    /// Per-device failures are logged and skipped; an error means the
    /// platform could not be queried at all.
    fn enumerate(&mut self) -> common::Result<Vec<(DeviceKey, DeviceRecord)>>;

    /// Blocking event loop
    ///
    /// Reports changes through `sink` and returns once
    /// [`EventSink::is_shutdown`] is true.
    fn run(&mut self, sink: EventSink) -> common::Result<()>;
}

/// Producer side of the detection pipeline
///
/// Every report updates the registry first and then offers the event to the
/// dispatcher. While monitoring is stopped the offer is discarded, but the
/// registry is still kept current.
#[derive(Clone)]
pub struct EventSink {
    registry: Arc<DeviceRegistry>,
    handoff: Arc<Handoff<DeviceEvent>>,
    shutdown: Arc<AtomicBool>,
}

impl EventSink {
    pub(crate) fn new(
        registry: Arc<DeviceRegistry>,
        handoff: Arc<Handoff<DeviceEvent>>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            registry,
            handoff,
            shutdown,
        }
    }

    /// Record an arrival and notify
    pub fn device_arrived(&self, key: DeviceKey, record: DeviceRecord) {
        debug!("Device arrived: {} ({})", key, record);
        self.registry.add(key, record.clone());
        self.notify(DeviceEvent::added(record));
    }

    /// Record a removal and notify
    ///
    /// The reported record is the one evicted from the registry, else
    /// `fallback`, else an empty record. A Removed event is always emitted.
    pub fn device_left(&self, key: &DeviceKey, fallback: Option<DeviceRecord>) {
        let record = self
            .registry
            .remove(key)
            .or(fallback)
            .unwrap_or_default();
        debug!("Device left: {} ({})", key, record);
        self.notify(DeviceEvent::removed(record));
    }

    /// Check if the source should return from [`PlatformEventSource::run`]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Registry the sink writes to
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    fn notify(&self, event: DeviceEvent) {
        // Blocks while the dispatcher is busy with the previous event
        if let Err(event) = self.handoff.offer(event) {
            debug!("Monitoring stopped, discarding event: {}", event);
        }
    }
}

/// One scripted change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// Device plugged in
    Arrived {
        /// Key the device is registered under
        key: DeviceKey,
        /// Record to register and report
        record: DeviceRecord,
    },
    /// Device unplugged
    Left {
        /// Key to evict
        key: DeviceKey,
        /// Record to report if the key is unknown
        fallback: Option<DeviceRecord>,
    },
}

/// Event source driven by a [`SourceHandle`] instead of hardware
pub struct ScriptedEventSource {
    initial: Vec<(DeviceKey, DeviceRecord)>,
    events: Receiver<SourceEvent>,
}

/// Feeds changes into a [`ScriptedEventSource`]
#[derive(Clone)]
pub struct SourceHandle {
    events: Sender<SourceEvent>,
}

/// Create a scripted source that starts with `initial` devices attached
pub fn scripted_source(
    initial: Vec<(DeviceKey, DeviceRecord)>,
) -> (ScriptedEventSource, SourceHandle) {
    let (tx, rx) = async_channel::unbounded();
    (
        ScriptedEventSource {
            initial,
            events: rx,
        },
        SourceHandle { events: tx },
    )
}

impl SourceHandle {
    /// Plug in a device
    pub fn arrive(&self, key: impl Into<DeviceKey>, record: DeviceRecord) -> common::Result<()> {
        self.send(SourceEvent::Arrived {
            key: key.into(),
            record,
        })
    }

    /// Unplug a device
    pub fn leave(&self, key: impl Into<DeviceKey>) -> common::Result<()> {
        self.send(SourceEvent::Left {
            key: key.into(),
            fallback: None,
        })
    }

    /// Queue any scripted change
    pub fn send(&self, event: SourceEvent) -> common::Result<()> {
        self.events
            .try_send(event)
            .map_err(|e| common::Error::Channel(format!("Scripted source is gone: {}", e)))
    }
}

const SCRIPT_POLL_INTERVAL: Duration = Duration::from_millis(5);

impl PlatformEventSource for ScriptedEventSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn enumerate(&mut self) -> common::Result<Vec<(DeviceKey, DeviceRecord)>> {
        Ok(std::mem::take(&mut self.initial))
    }

    fn run(&mut self, sink: EventSink) -> common::Result<()> {
        while !sink.is_shutdown() {
            match self.events.try_recv() {
                Ok(SourceEvent::Arrived { key, record }) => sink.device_arrived(key, record),
                Ok(SourceEvent::Left { key, fallback }) => sink.device_left(&key, fallback),
                Err(TryRecvError::Empty) => std::thread::sleep(SCRIPT_POLL_INTERVAL),
                Err(TryRecvError::Closed) => {
                    info!("Every scripted source handle dropped, source finished");
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{create_mock_key, create_mock_record};

    fn sink() -> (EventSink, Arc<Handoff<DeviceEvent>>) {
        let handoff = Arc::new(Handoff::new());
        let sink = EventSink::new(
            Arc::new(DeviceRegistry::new()),
            Arc::clone(&handoff),
            Arc::new(AtomicBool::new(false)),
        );
        (sink, handoff)
    }

    #[test]
    fn test_stopped_sink_updates_registry_only() {
        let (sink, handoff) = sink();
        let key = create_mock_key(1);

        sink.device_arrived(key.clone(), create_mock_record(1, 1, 2));

        assert!(sink.registry().contains(&key));
        assert!(!handoff.has_pending());
    }

    #[test]
    fn test_left_reports_evicted_record() {
        let (sink, handoff) = sink();
        let epoch = handoff.open().unwrap();
        let key = create_mock_key(1);
        let record = create_mock_record(1, 0x04e8, 0x503b);
        sink.registry().add(key.clone(), record.clone());

        sink.device_left(&key, Some(DeviceRecord::with_ids(9, 9)));

        assert_eq!(handoff.take(epoch), Some(DeviceEvent::removed(record)));
        assert!(sink.registry().is_empty());
    }

    #[test]
    fn test_left_unknown_key_synthesizes_record() {
        let (sink, handoff) = sink();
        let epoch = handoff.open().unwrap();

        sink.device_left(&create_mock_key(7), None);
        assert_eq!(
            handoff.take(epoch),
            Some(DeviceEvent::removed(DeviceRecord::default()))
        );

        let fallback = DeviceRecord::with_ids(1, 2);
        sink.device_left(&create_mock_key(7), Some(fallback.clone()));
        assert_eq!(handoff.take(epoch), Some(DeviceEvent::removed(fallback)));
    }

    #[test]
    fn test_scripted_source_replays_events() {
        let initial = vec![(create_mock_key(1), create_mock_record(1, 1, 1))];
        let (mut source, handle) = scripted_source(initial);
        assert_eq!(source.enumerate().unwrap().len(), 1);
        assert!(source.enumerate().unwrap().is_empty());

        handle.arrive("usb-1-2", create_mock_record(2, 2, 2)).unwrap();
        handle.leave("usb-1-2").unwrap();
        drop(handle);

        let (sink, _handoff) = sink();
        source.run(sink.clone()).unwrap();

        // Arrival registered, removal evicted it again
        assert!(sink.registry().is_empty());
    }

    #[test]
    fn test_scripted_source_stops_on_shutdown() {
        let (mut source, _handle) = scripted_source(Vec::new());
        let shutdown = Arc::new(AtomicBool::new(true));
        let sink = EventSink::new(
            Arc::new(DeviceRegistry::new()),
            Arc::new(Handoff::new()),
            shutdown,
        );

        assert!(source.run(sink).is_ok());
    }
}
