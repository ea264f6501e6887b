//! Test utilities for usb-detect
//!
//! Provides mock records and helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_key, create_mock_record};
//!
//! # fn main() {
//! let record = create_mock_record(1, 0x1234, 0x5678);
//! assert_eq!(record.vendor_id, 0x1234);
//! assert_eq!(create_mock_key(1).as_str(), "usb-1-1");
//! # }
//! ```

use protocol::{DeviceKey, DeviceRecord};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock DeviceRecord for testing
///
/// # Arguments
/// * `id` - Number used to derive the descriptive fields
/// * `vendor_id` - USB Vendor ID
/// * `product_id` - USB Product ID
pub fn create_mock_record(id: u32, vendor_id: u16, product_id: u16) -> DeviceRecord {
    DeviceRecord {
        location_id: 0x0100_0000 | id,
        vendor_id,
        product_id,
        device_name: format!("Test Product {}", id),
        manufacturer: format!("Test Manufacturer {}", id),
        serial_number: format!("SN{:06}", id),
        device_address: id % 128,
    }
}

/// Create a mock DeviceKey for testing
pub fn create_mock_key(id: u32) -> DeviceKey {
    DeviceKey(format!("usb-1-{}", id))
}

/// Create a list of keyed mock devices for testing
///
/// # Example
/// ```
/// use common::test_utils::create_mock_device_list;
///
/// let devices = create_mock_device_list(5);
/// assert_eq!(devices.len(), 5);
/// ```
pub fn create_mock_device_list(count: u32) -> Vec<(DeviceKey, DeviceRecord)> {
    (1..=count)
        .map(|i| {
            (
                create_mock_key(i),
                create_mock_record(i, 0x1000 + (i as u16), 0x2000 + (i as u16)),
            )
        })
        .collect()
}

/// Collects records passed to a device callback
///
/// # Example
/// ```
/// use common::test_utils::{RecordLog, create_mock_record};
///
/// let log = RecordLog::new();
/// let callback = log.callback();
/// callback(&create_mock_record(1, 1, 2));
/// assert_eq!(log.len(), 1);
/// ```
#[derive(Clone, Default)]
pub struct RecordLog {
    records: Arc<Mutex<Vec<DeviceRecord>>>,
}

impl RecordLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback that appends every record it receives
    pub fn callback(&self) -> impl Fn(&DeviceRecord) + Send + Sync + 'static {
        let records = Arc::clone(&self.records);
        move |record| {
            records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(record.clone());
        }
    }

    /// Copy of everything recorded so far
    pub fn records(&self) -> Vec<DeviceRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of records seen
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Poll `condition` until it holds or `timeout` elapses
///
/// Returns the final value of the condition.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
