//! libusb platform support
//!
//! Device discovery and change notification through `rusb`. Hotplug
//! callbacks are used where libusb supports them; other platforms fall back
//! to scanning the device list.

pub mod device;
pub mod source;

pub use device::{DeviceIdentity, describe_device, device_key, is_root_hub, location_id};
pub use source::{DEFAULT_POLL_INTERVAL, DetectionMode, UsbEventSource};
