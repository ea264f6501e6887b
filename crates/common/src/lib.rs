//! Common utilities for usb-detect
//!
//! This crate provides functionality shared between the detection library and
//! the command-line detector: error handling, logging setup, the async channel
//! bridge used to run device queries off the caller's thread, and test helpers.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{
    DEFAULT_QUERY_QUEUE_DEPTH, QueryBridge, QueryCallback, QueryCommand, QueryWorker, Responder,
    create_query_bridge,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
