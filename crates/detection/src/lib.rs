//! USB device presence detection
//!
//! Keeps a live registry of attached USB devices, reports arrivals and
//! removals to registered callbacks, and answers filtered device queries.
//!
//! # Example
//!
//! ```
//! use detection::{DeviceMonitor, MonitorConfig, scripted_source};
//! use protocol::DeviceRecord;
//!
//! let (source, handle) = scripted_source(Vec::new());
//! let monitor = DeviceMonitor::new(source, MonitorConfig::default()).unwrap();
//!
//! monitor.register_added(|record| println!("added {}", record));
//! handle.arrive("usb-1-1", DeviceRecord::with_ids(0x04e8, 0x503b)).unwrap();
//!
//! // Every device from this vendor
//! let devices = monitor.find_blocking(0x04e8, 0).unwrap();
//! # let _ = devices;
//! monitor.shutdown();
//! ```

pub mod dispatcher;
pub mod handoff;
pub mod lifecycle;
pub mod monitor;
pub mod query;
pub mod registry;
pub mod source;
pub mod subscriptions;
pub mod usb;

pub use dispatcher::{DeviceCallback, Dispatcher};
pub use handoff::Handoff;
pub use lifecycle::{Lifecycle, MonitorState};
pub use monitor::{DeviceMonitor, MonitorConfig};
pub use query::QueryEngine;
pub use registry::{DeviceFilter, DeviceRegistry, RegistryEntry};
pub use source::{
    EventSink, PlatformEventSource, ScriptedEventSource, SourceEvent, SourceHandle,
    scripted_source,
};
pub use subscriptions::{EventBus, Listener, SubscriptionId};
pub use usb::{DetectionMode, UsbEventSource};
