//! Device presence registry
//!
//! The registry is the single source of truth for "what is connected now".
//! It is shared between the platform event source (which mutates it) and the
//! query worker (which snapshots it), so every operation takes one short
//! critical section and returns owned copies; nothing borrowed from the map
//! ever escapes the lock.

use protocol::{DeviceKey, DeviceRecord, DeviceState};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// One live registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    key: DeviceKey,
    record: DeviceRecord,
    state: DeviceState,
}

impl RegistryEntry {
    /// Create an entry for a freshly arrived device
    pub fn new(key: DeviceKey, record: DeviceRecord) -> Self {
        Self {
            key,
            record,
            state: DeviceState::Connected,
        }
    }

    /// Get the device key
    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    /// Get the device record
    pub fn record(&self) -> &DeviceRecord {
        &self.record
    }

    /// Get the connection state tag
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Take the device record out of the entry
    pub fn into_record(self) -> DeviceRecord {
        self.record
    }
}

/// Vendor/product filter used by device queries
///
/// A zero ID means "unspecified". A product ID without a vendor ID matches
/// nothing; callers that want every device of a product must also give
/// the vendor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DeviceFilter {
    /// Vendor ID (0 = unspecified)
    pub vendor_id: u16,
    /// Product ID (0 = unspecified)
    pub product_id: u16,
}

impl DeviceFilter {
    /// Create a filter from raw query arguments
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    /// Filter that matches every device
    pub fn all() -> Self {
        Self::default()
    }

    /// Check a record against the filter
    pub fn matches(&self, record: &DeviceRecord) -> bool {
        match (self.vendor_id, self.product_id) {
            (0, 0) => true,
            (0, _) => false,
            (vid, 0) => record.vendor_id == vid,
            (vid, pid) => record.vendor_id == vid && record.product_id == pid,
        }
    }
}

/// Registry of currently connected devices keyed by [`DeviceKey`]
///
/// Iteration order is sorted by key, so snapshots taken from the same
/// registry state are always identical.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    entries: Mutex<BTreeMap<DeviceKey, RegistryEntry>>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `key`
    ///
    /// Returns true when an existing entry was replaced (a device
    /// re-enumerated with fresh metadata).
    pub fn add(&self, key: DeviceKey, record: DeviceRecord) -> bool {
        debug!(
            "Registry add {}: vid={:#06x}, pid={:#06x}",
            key, record.vendor_id, record.product_id
        );
        let entry = RegistryEntry::new(key.clone(), record);
        self.lock().insert(key, entry).is_some()
    }

    /// Remove the entry for `key`, returning its record
    ///
    /// `None` means the key was not present; that is not an error.
    pub fn remove(&self, key: &DeviceKey) -> Option<DeviceRecord> {
        self.remove_entry(key).map(RegistryEntry::into_record)
    }

    /// Remove the entry for `key`, returning it tagged `Disconnected`
    pub fn remove_entry(&self, key: &DeviceKey) -> Option<RegistryEntry> {
        let removed = self.lock().remove(key);
        match removed {
            Some(mut entry) => {
                entry.state = DeviceState::Disconnected;
                debug!("Registry remove {}", key);
                Some(entry)
            }
            None => {
                debug!("Registry remove {}: not found", key);
                None
            }
        }
    }

    /// Copy of the record stored for `key`
    pub fn lookup(&self, key: &DeviceKey) -> Option<DeviceRecord> {
        self.lock().get(key).map(|entry| entry.record.clone())
    }

    /// Check if `key` is present
    pub fn contains(&self, key: &DeviceKey) -> bool {
        self.lock().contains_key(key)
    }

    /// Deep copies of every record satisfying `predicate`
    ///
    /// The copy is taken atomically with respect to `add` and `remove`.
    pub fn snapshot<F>(&self, predicate: F) -> Vec<DeviceRecord>
    where
        F: Fn(&DeviceRecord) -> bool,
    {
        self.lock()
            .values()
            .filter(|entry| predicate(&entry.record))
            .map(|entry| entry.record.clone())
            .collect()
    }

    /// Snapshot filtered by vendor/product ID
    pub fn find(&self, filter: DeviceFilter) -> Vec<DeviceRecord> {
        self.snapshot(|record| filter.matches(record))
    }

    /// Deep copy of every entry with its key
    pub fn entries(&self) -> Vec<RegistryEntry> {
        self.lock().values().cloned().collect()
    }

    /// Replace the whole contents, returning the new entry count
    ///
    /// Used for the initial enumeration pass.
    pub fn replace_all<I>(&self, devices: I) -> usize
    where
        I: IntoIterator<Item = (DeviceKey, DeviceRecord)>,
    {
        let fresh: BTreeMap<DeviceKey, RegistryEntry> = devices
            .into_iter()
            .map(|(key, record)| (key.clone(), RegistryEntry::new(key, record)))
            .collect();
        let count = fresh.len();
        *self.lock() = fresh;
        count
    }

    /// Number of connected devices
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if no device is connected
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // Every critical section leaves the map consistent, so a panic while
    // holding the lock cannot corrupt it.
    fn lock(&self) -> MutexGuard<'_, BTreeMap<DeviceKey, RegistryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{create_mock_key, create_mock_record};

    #[test]
    fn test_add_lookup_remove() {
        let registry = DeviceRegistry::new();
        let key = create_mock_key(1);
        let record = create_mock_record(1, 0x04e8, 0x503b);

        assert!(!registry.add(key.clone(), record.clone()));
        assert_eq!(registry.lookup(&key), Some(record.clone()));
        assert_eq!(registry.remove(&key), Some(record));
        assert_eq!(registry.lookup(&key), None);
        assert_eq!(registry.remove(&key), None);
    }

    #[test]
    fn test_add_replaces_silently() {
        let registry = DeviceRegistry::new();
        let key = create_mock_key(1);

        registry.add(key.clone(), create_mock_record(1, 1, 1));
        assert!(registry.add(key.clone(), create_mock_record(2, 2, 2)));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(&key).map(|r| r.vendor_id), Some(2));
    }

    #[test]
    fn test_filter_logic() {
        let record = DeviceRecord::with_ids(0x1234, 0x5678);

        assert!(DeviceFilter::all().matches(&record));
        assert!(DeviceFilter::new(0x1234, 0).matches(&record));
        assert!(DeviceFilter::new(0x1234, 0x5678).matches(&record));

        assert!(!DeviceFilter::new(0x1234, 0x9999).matches(&record));
        assert!(!DeviceFilter::new(0x9999, 0).matches(&record));

        // Product without vendor never matches
        assert!(!DeviceFilter::new(0, 0x5678).matches(&record));
    }

    #[test]
    fn test_snapshot_is_sorted_and_detached() {
        let registry = DeviceRegistry::new();
        registry.add(DeviceKey::from("usb-2-1"), create_mock_record(2, 1, 2));
        registry.add(DeviceKey::from("usb-1-1"), create_mock_record(1, 1, 1));

        let snapshot = registry.find(DeviceFilter::all());
        registry.remove(&DeviceKey::from("usb-1-1"));

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].product_id, 1);
        assert_eq!(snapshot[1].product_id, 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_replace_all() {
        let registry = DeviceRegistry::new();
        registry.add(create_mock_key(99), create_mock_record(99, 9, 9));

        let count = registry.replace_all(common::test_utils::create_mock_device_list(3));

        assert_eq!(count, 3);
        assert!(!registry.contains(&create_mock_key(99)));
        assert!(
            registry
                .entries()
                .iter()
                .all(|e| e.state() == DeviceState::Connected)
        );
    }

    #[test]
    fn test_removed_entry_is_disconnected() {
        let registry = DeviceRegistry::new();
        let key = create_mock_key(1);
        let record = create_mock_record(1, 0x04e8, 0x503b);
        registry.add(key.clone(), record.clone());
        assert_eq!(registry.entries()[0].state(), DeviceState::Connected);

        let entry = registry.remove_entry(&key).unwrap();
        assert_eq!(entry.key(), &key);
        assert_eq!(entry.state(), DeviceState::Disconnected);
        assert_eq!(entry.into_record(), record);
        assert!(registry.remove_entry(&key).is_none());
    }
}
