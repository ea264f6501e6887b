//! libusb event source
//!
//! Uses libusb hotplug notifications when the platform supports them and
//! falls back to polling the device list otherwise.
//!
//! In hotplug mode the callback is registered before the initial scan, so a
//! device plugged in while the monitor starts up is never missed. Notices
//! that overlap the scan are reconciled against the devices already known:
//! a repeated arrival is ignored and a departure of a device that was never
//! reported is dropped.

use super::device::{DeviceIdentity, describe_device, identify};
use crate::source::{EventSink, PlatformEventSource};
use protocol::{DeviceKey, DeviceRecord};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default interval between device list scans in polling mode
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Timeout for one `handle_events` call; bounds shutdown latency
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

/// How device changes are discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionMode {
    /// libusb hotplug callbacks
    Hotplug,
    /// Periodic device list diff
    Polling,
}

/// [`PlatformEventSource`] backed by libusb
pub struct UsbEventSource {
    context: Context,
    mode: DetectionMode,
    poll_interval: Duration,
    include_root_hubs: bool,
    /// Last known record per key
    known: BTreeMap<DeviceKey, DeviceRecord>,
    /// (bus, address) -> key, for devices whose port chain is gone on removal
    addresses: HashMap<(u8, u8), DeviceKey>,
    /// Hotplug notices waiting to be handled on the source thread
    notices: Arc<Mutex<VecDeque<HotplugNotice>>>,
    registration: Option<Registration<Context>>,
}

/// How a hotplug arrival relates to what the source already reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArrivalKind {
    /// Not known yet
    New,
    /// Same device already reported (seen by the initial scan)
    Duplicate,
    /// A different device now sits on a known port
    Replacement,
}

fn classify_arrival(
    known: &BTreeMap<DeviceKey, DeviceRecord>,
    key: &DeviceKey,
    record: &DeviceRecord,
) -> ArrivalKind {
    match known.get(key) {
        None => ArrivalKind::New,
        Some(previous) => {
            if DeviceIdentity::of_record(previous) == DeviceIdentity::of_record(record) {
                ArrivalKind::Duplicate
            } else {
                ArrivalKind::Replacement
            }
        }
    }
}

impl UsbEventSource {
    /// Create a libusb source
    ///
    /// Hotplug is used if `prefer_hotplug` is set and libusb supports it on
    /// this platform; otherwise the device list is scanned every
    /// `poll_interval`.
    pub fn new(prefer_hotplug: bool, poll_interval: Duration) -> common::Result<Self> {
        let context = Context::new()
            .map_err(|e| common::Error::Platform(format!("Failed to create USB context: {}", e)))?;

        let mode = if prefer_hotplug && rusb::has_hotplug() {
            DetectionMode::Hotplug
        } else {
            DetectionMode::Polling
        };
        info!("USB event source using {:?} mode", mode);

        Ok(Self {
            context,
            mode,
            poll_interval: poll_interval.max(EVENT_TIMEOUT),
            include_root_hubs: false,
            known: BTreeMap::new(),
            addresses: HashMap::new(),
            notices: Arc::default(),
            registration: None,
        })
    }

    /// Report root hubs as devices too
    pub fn with_root_hubs(mut self, include: bool) -> Self {
        self.include_root_hubs = include;
        self
    }

    /// Detection mode in use
    pub fn mode(&self) -> DetectionMode {
        self.mode
    }

    fn remember(&mut self, device: &Device<Context>, key: &DeviceKey, record: &DeviceRecord) {
        self.addresses
            .insert((device.bus_number(), device.address()), key.clone());
        self.known.insert(key.clone(), record.clone());
    }

    fn forget(&mut self, key: &DeviceKey) -> Option<DeviceRecord> {
        self.addresses.retain(|_, known_key| known_key != key);
        self.known.remove(key)
    }

    fn handle_arrival(&mut self, device: &Device<Context>, sink: &EventSink) {
        match describe_device(device, self.include_root_hubs) {
            Ok(Some((key, record))) => match classify_arrival(&self.known, &key, &record) {
                ArrivalKind::Duplicate => {
                    debug!("Ignoring repeated arrival of {}", key);
                    self.remember(device, &key, &record);
                }
                ArrivalKind::Replacement => {
                    let previous = self.forget(&key);
                    sink.device_left(&key, previous);
                    self.remember(device, &key, &record);
                    sink.device_arrived(key, record);
                }
                ArrivalKind::New => {
                    self.remember(device, &key, &record);
                    sink.device_arrived(key, record);
                }
            },
            Ok(None) => {}
            Err(e) => warn!(
                "Failed to describe arrived device bus={}, addr={}: {}",
                device.bus_number(),
                device.address(),
                e
            ),
        }
    }

    fn handle_departure(&mut self, device: &Device<Context>, sink: &EventSink) {
        let slot = (device.bus_number(), device.address());
        let key = match self.addresses.get(&slot) {
            Some(key) => key.clone(),
            None => match identify(device, self.include_root_hubs) {
                Ok(Some((key, _))) => key,
                Ok(None) => return,
                Err(e) => {
                    debug!("Ignoring departure of unknown device {:?}: {}", slot, e);
                    return;
                }
            },
        };
        // Left between hotplug registration and the initial scan
        let Some(previous) = self.forget(&key) else {
            debug!("Ignoring departure of unreported device {}", key);
            return;
        };
        sink.device_left(&key, Some(previous));
    }

    /// Register the hotplug callback once; notices queue up until `run`
    fn register_hotplug(&mut self) -> common::Result<()> {
        if self.registration.is_some() {
            return Ok(());
        }
        let registration: Registration<Context> = HotplugBuilder::new()
            .enumerate(false)
            .register(
                &self.context,
                Box::new(HotplugForwarder::new(Arc::clone(&self.notices))),
            )
            .map_err(|e| common::Error::Platform(format!("Failed to register hotplug: {}", e)))?;
        self.registration = Some(registration);
        debug!("Hot-plug callbacks registered");
        Ok(())
    }

    fn run_hotplug(&mut self, sink: &EventSink) -> common::Result<()> {
        self.register_hotplug()?;

        while !sink.is_shutdown() {
            // Device access is not allowed inside the libusb callback
            let notices: Vec<HotplugNotice> = self
                .notices
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..)
                .collect();
            for notice in notices {
                match notice {
                    HotplugNotice::Arrived(device) => self.handle_arrival(&device, sink),
                    HotplugNotice::Left(device) => self.handle_departure(&device, sink),
                }
            }

            match self.context.handle_events(Some(EVENT_TIMEOUT)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => debug!("USB event handling interrupted"),
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    std::thread::sleep(EVENT_TIMEOUT);
                }
            }
        }

        self.registration = None;
        Ok(())
    }

    fn run_polling(&mut self, sink: &EventSink) -> common::Result<()> {
        let mut next_scan = Instant::now() + self.poll_interval;

        while !sink.is_shutdown() {
            let now = Instant::now();
            if now < next_scan {
                std::thread::sleep((next_scan - now).min(EVENT_TIMEOUT));
                continue;
            }
            next_scan = now + self.poll_interval;

            if let Err(e) = self.poll_once(sink) {
                warn!("Failed to scan USB devices: {}", e);
            }
        }
        Ok(())
    }

    /// Diff the attached devices against the last scan
    fn poll_once(&mut self, sink: &EventSink) -> rusb::Result<()> {
        let mut present: HashMap<DeviceKey, (DeviceIdentity, Device<Context>)> = HashMap::new();
        for device in self.context.devices()?.iter() {
            match identify(&device, self.include_root_hubs) {
                Ok(Some((key, identity))) => {
                    present.insert(key, (identity, device));
                }
                Ok(None) => {}
                Err(e) => debug!("Skipping unreadable device: {}", e),
            }
        }

        // A device swapped on the same port shows up as left + arrived
        let departed: Vec<DeviceKey> = self
            .known
            .iter()
            .filter(|(key, record)| match present.get(*key) {
                Some((identity, _)) => *identity != DeviceIdentity::of_record(record),
                None => true,
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in departed {
            let fallback = self.forget(&key);
            sink.device_left(&key, fallback);
        }

        for (key, (_, device)) in present {
            if !self.known.contains_key(&key) {
                self.handle_arrival(&device, sink);
            }
        }
        Ok(())
    }
}

impl PlatformEventSource for UsbEventSource {
    fn name(&self) -> &str {
        match self.mode {
            DetectionMode::Hotplug => "libusb-hotplug",
            DetectionMode::Polling => "libusb-polling",
        }
    }

    fn enumerate(&mut self) -> common::Result<Vec<(DeviceKey, DeviceRecord)>> {
        if self.mode == DetectionMode::Hotplug {
            self.register_hotplug()?;
        }

        let devices = self
            .context
            .devices()
            .map_err(|e| common::Error::Platform(format!("Failed to list USB devices: {}", e)))?;

        let mut found = Vec::new();
        for device in devices.iter() {
            match describe_device(&device, self.include_root_hubs) {
                Ok(Some((key, record))) => {
                    self.remember(&device, &key, &record);
                    found.push((key, record));
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to add device during enumeration: {}", e),
            }
        }

        debug!("Enumerated {} devices", found.len());
        Ok(found)
    }

    fn run(&mut self, sink: EventSink) -> common::Result<()> {
        info!("USB event source started ({})", self.name());
        let result = match self.mode {
            DetectionMode::Hotplug => self.run_hotplug(&sink),
            DetectionMode::Polling => self.run_polling(&sink),
        };
        info!("USB event source stopped");
        result
    }
}

enum HotplugNotice {
    Arrived(Device<Context>),
    Left(Device<Context>),
}

/// Queues libusb hotplug callbacks for the source loop
struct HotplugForwarder {
    queue: Arc<Mutex<VecDeque<HotplugNotice>>>,
}

impl HotplugForwarder {
    fn new(queue: Arc<Mutex<VecDeque<HotplugNotice>>>) -> Self {
        Self { queue }
    }

    fn push(&self, notice: HotplugNotice) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(notice);
    }
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        self.push(HotplugNotice::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        self.push(HotplugNotice::Left(device));
    }
}
