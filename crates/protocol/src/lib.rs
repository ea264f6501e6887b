//! Shared types for usb-detect
//!
//! This crate defines the values exchanged between the detection pipeline and
//! its consumers: device keys, device records, presence events, and the error
//! type reported by device queries.
//!
//! # Example
//!
//! ```
//! use protocol::{DeviceEvent, DeviceRecord, Direction};
//!
//! let record = DeviceRecord::with_ids(0x04e8, 0x503b);
//! let event = DeviceEvent::added(record);
//!
//! assert_eq!(event.direction, Direction::Added);
//! assert_eq!(event.topics()[0], "add:1256:20539");
//! ```

pub mod error;
pub mod types;

pub use error::{QueryError, QueryResult};
pub use types::{DeviceEvent, DeviceKey, DeviceRecord, DeviceState, Direction};
