//! Device presence type definitions
//!
//! This module defines the values that flow through the detection pipeline:
//! the opaque device key, the device record handed to consumers, and the
//! add/remove event that carries a record across the notification handoff.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque per-session device identifier
///
/// Derived from the device's enumeration path by the platform event source.
/// Unique among currently connected devices and stable for the lifetime of
/// one attachment, but replugging a device may produce a different key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceKey(pub String);

impl DeviceKey {
    /// Create a key from any string-like value
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Borrow the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for DeviceKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Metadata describing one attached USB device
///
/// Built once by the platform event source and never edited afterwards;
/// a re-enumerated device gets a fresh record. No single field is unique,
/// uniqueness is carried by [`DeviceKey`], which is deliberately not part
/// of the record.
///
/// Field names are serialized in camelCase (`locationId`, `vendorId`, ...),
/// the names consumers of the event stream rely on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Platform-defined location identifier (0 if unknown)
    pub location_id: u32,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Product string (may be empty)
    pub device_name: String,
    /// Manufacturer string (may be empty)
    pub manufacturer: String,
    /// Serial number string (may be empty)
    pub serial_number: String,
    /// Platform-defined device address (0 if unknown)
    pub device_address: u32,
}

impl DeviceRecord {
    /// Create a record with only the vendor and product IDs filled in
    pub fn with_ids(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            ..Self::default()
        }
    }

    /// `VID:PID` in the usual lowercase hex notation
    pub fn id_string(&self) -> String {
        format!("{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id_string())?;
        if !self.manufacturer.is_empty() {
            write!(f, " {}", self.manufacturer)?;
        }
        if !self.device_name.is_empty() {
            write!(f, " {}", self.device_name)?;
        }
        Ok(())
    }
}

/// Connection state tag stored alongside each registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    /// Device is attached
    Connected,
    /// Device removal has been observed
    Disconnected,
}

/// Direction of a presence change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Device arrived
    Added,
    /// Device left
    Removed,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Added => write!(f, "added"),
            Direction::Removed => write!(f, "removed"),
        }
    }
}

/// A presence change waiting to be delivered
///
/// Exactly one of these is in flight between the event source and the
/// dispatcher at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEvent {
    /// Whether the device arrived or left
    pub direction: Direction,
    /// Record to report
    pub record: DeviceRecord,
}

impl DeviceEvent {
    /// Create an arrival event
    pub fn added(record: DeviceRecord) -> Self {
        Self {
            direction: Direction::Added,
            record,
        }
    }

    /// Create a removal event
    pub fn removed(record: DeviceRecord) -> Self {
        Self {
            direction: Direction::Removed,
            record,
        }
    }

    /// Check if this is an arrival event
    pub fn is_added(&self) -> bool {
        matches!(self.direction, Direction::Added)
    }

    /// Event topic names, most specific first
    ///
    /// Arrivals publish `add` and its `insert` alias, removals publish
    /// `remove`; both finish with the `change` family. IDs are decimal.
    pub fn topics(&self) -> Vec<String> {
        let vid = self.record.vendor_id;
        let pid = self.record.product_id;
        let mut topics = match self.direction {
            Direction::Added => vec![
                format!("add:{}:{}", vid, pid),
                format!("insert:{}:{}", vid, pid),
                format!("add:{}", vid),
                format!("insert:{}", vid),
                "add".to_string(),
                "insert".to_string(),
            ],
            Direction::Removed => vec![
                format!("remove:{}:{}", vid, pid),
                format!("remove:{}", vid),
                "remove".to_string(),
            ],
        };
        topics.push(format!("change:{}:{}", vid, pid));
        topics.push(format!("change:{}", vid));
        topics.push("change".to_string());
        topics
    }
}

impl fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.direction, self.record)
    }
}
