//! libusb device description
//!
//! Turns an `rusb::Device` into the key and record the registry stores.

use protocol::{DeviceKey, DeviceRecord};
use rusb::{Device, DeviceDescriptor, DeviceHandle, UsbContext};
use tracing::debug;

/// Linux Foundation vendor ID, used by root hubs
const ROOT_HUB_VENDOR_ID: u16 = 0x1d6b;

/// USB hub device class
const HUB_CLASS: u8 = 9;

/// Ports that fit into a location ID below the bus byte
const MAX_LOCATION_DEPTH: usize = 6;

/// Identity used to notice a device being swapped between two polls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Bus address
    pub address: u8,
}

impl DeviceIdentity {
    /// Identity stored in a record
    pub fn of_record(record: &DeviceRecord) -> Self {
        Self {
            vendor_id: record.vendor_id,
            product_id: record.product_id,
            address: record.device_address as u8,
        }
    }
}

/// Key for a device at `bus` reached through `ports`
///
/// `usb-<bus>-<port>.<port>...`, or `usb-<bus>-addr<address>` when the port
/// chain is unknown.
pub fn device_key(bus: u8, ports: &[u8], address: u8) -> DeviceKey {
    if ports.is_empty() {
        return DeviceKey(format!("usb-{}-addr{}", bus, address));
    }
    let path = ports
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(".");
    DeviceKey(format!("usb-{}-{}", bus, path))
}

/// Location ID packed with the bus in the top byte and one nibble per port
///
/// Bus 0x14, port 1 gives `0x14100000`. Chains deeper than six ports are
/// truncated.
pub fn location_id(bus: u8, ports: &[u8]) -> u32 {
    ports
        .iter()
        .take(MAX_LOCATION_DEPTH)
        .enumerate()
        .fold(u32::from(bus) << 24, |id, (depth, port)| {
            id | (u32::from(port & 0x0f) << (20 - 4 * depth))
        })
}

/// Check if a descriptor belongs to a root hub
pub fn is_root_hub(vendor_id: u16, class_code: u8) -> bool {
    vendor_id == ROOT_HUB_VENDOR_ID && class_code == HUB_CLASS
}

/// Key and identity of a device without opening it
///
/// Root hubs yield `None` unless `include_root_hubs` is set.
pub fn identify<T: UsbContext>(
    device: &Device<T>,
    include_root_hubs: bool,
) -> rusb::Result<Option<(DeviceKey, DeviceIdentity)>> {
    let descriptor = device.device_descriptor()?;
    if !include_root_hubs && is_root_hub(descriptor.vendor_id(), descriptor.class_code()) {
        return Ok(None);
    }

    let ports = device.port_numbers().unwrap_or_default();
    let address = device.address();

    Ok(Some((
        device_key(device.bus_number(), &ports, address),
        DeviceIdentity {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            address,
        },
    )))
}

/// Build the registry key and record for a device
///
/// Root hubs yield `None` unless `include_root_hubs` is set. String
/// descriptors are read when the device can be opened and left empty
/// otherwise.
pub fn describe_device<T: UsbContext>(
    device: &Device<T>,
    include_root_hubs: bool,
) -> rusb::Result<Option<(DeviceKey, DeviceRecord)>> {
    let descriptor = device.device_descriptor()?;
    let bus = device.bus_number();
    let address = device.address();

    if !include_root_hubs && is_root_hub(descriptor.vendor_id(), descriptor.class_code()) {
        debug!(
            "Skipping root hub: bus={}, addr={}, vid={:#x}, pid={:#x}",
            bus,
            address,
            descriptor.vendor_id(),
            descriptor.product_id()
        );
        return Ok(None);
    }

    let ports = device.port_numbers().unwrap_or_default();
    let strings = match device.open() {
        Ok(handle) => read_string_descriptors(&handle, &descriptor),
        Err(e) => {
            debug!(
                "Cannot open device bus={}, addr={} for strings: {}",
                bus, address, e
            );
            DeviceStrings::default()
        }
    };

    let record = DeviceRecord {
        location_id: location_id(bus, &ports),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        device_name: strings.product,
        manufacturer: strings.manufacturer,
        serial_number: strings.serial_number,
        device_address: u32::from(address),
    };

    Ok(Some((device_key(bus, &ports, address), record)))
}

#[derive(Debug, Default)]
struct DeviceStrings {
    manufacturer: String,
    product: String,
    serial_number: String,
}

fn read_string_descriptors<T: UsbContext>(
    handle: &DeviceHandle<T>,
    descriptor: &DeviceDescriptor,
) -> DeviceStrings {
    let read = |index: Option<u8>| {
        index
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
            .unwrap_or_default()
    };

    DeviceStrings {
        manufacturer: read(descriptor.manufacturer_string_index()),
        product: read(descriptor.product_string_index()),
        serial_number: read(descriptor.serial_number_string_index()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_key() {
        assert_eq!(device_key(1, &[2], 5).as_str(), "usb-1-2");
        assert_eq!(device_key(3, &[1, 4, 2], 17).as_str(), "usb-3-1.4.2");
        assert_eq!(device_key(2, &[], 1).as_str(), "usb-2-addr1");
    }

    #[test]
    fn test_location_id() {
        assert_eq!(location_id(0x14, &[1]), 0x1410_0000);
        assert_eq!(location_id(0x14, &[1, 2, 3]), 0x1412_3000);
        assert_eq!(location_id(2, &[]), 0x0200_0000);
        assert_eq!(location_id(1, &[1, 2, 3, 4, 5, 6, 7]), 0x0112_3456);
    }

    #[test]
    fn test_root_hub_detection() {
        assert!(is_root_hub(0x1d6b, 9));
        assert!(!is_root_hub(0x1d6b, 0));
        assert!(!is_root_hub(0x05e3, 9));
    }

    #[test]
    fn test_identity_of_record() {
        let mut record = DeviceRecord::with_ids(0x04e8, 0x503b);
        record.device_address = 11;
        assert_eq!(
            DeviceIdentity::of_record(&record),
            DeviceIdentity {
                vendor_id: 0x04e8,
                product_id: 0x503b,
                address: 11,
            }
        );
    }
}
