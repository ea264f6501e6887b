//! Query engine
//!
//! Runs device queries on a dedicated worker thread fed by the
//! [`common::QueryBridge`]. The worker only ever takes the registry lock, so a
//! query can never block behind the notification handoff.

use crate::dispatcher::panic_message;
use crate::registry::{DeviceFilter, DeviceRegistry};
use common::{QueryBridge, QueryCommand, QueryWorker, Responder, create_query_bridge};
use protocol::{DeviceRecord, QueryError, QueryResult};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Query worker thread plus its caller-side bridge
pub struct QueryEngine {
    bridge: QueryBridge,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl QueryEngine {
    /// Spawn the query worker over `registry`
    ///
    /// `queue_depth` bounds the number of requests waiting for the worker.
    pub fn spawn(registry: Arc<DeviceRegistry>, queue_depth: usize) -> common::Result<Self> {
        let (bridge, worker) = create_query_bridge(queue_depth);

        let handle = std::thread::Builder::new()
            .name("usb-query".to_string())
            .spawn(move || run_query_worker(worker, registry))
            .map_err(|e| common::Error::Thread(format!("Failed to spawn query worker: {}", e)))?;

        Ok(Self {
            bridge,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Caller-side handle, usable from any thread or task
    pub fn bridge(&self) -> QueryBridge {
        self.bridge.clone()
    }

    /// Find connected devices matching `vendor_id`/`product_id` (0 = unspecified)
    pub async fn find(&self, vendor_id: u16, product_id: u16) -> QueryResult<Vec<DeviceRecord>> {
        self.bridge.find(vendor_id, product_id).await
    }

    /// Blocking variant of [`QueryEngine::find`]
    ///
    /// Must not be called from within an async runtime.
    pub fn find_blocking(&self, vendor_id: u16, product_id: u16) -> QueryResult<Vec<DeviceRecord>> {
        self.bridge.find_blocking(vendor_id, product_id)
    }

    /// Callback variant of [`QueryEngine::find`]
    ///
    /// `callback` runs exactly once, on the query worker thread, or on the
    /// calling thread if the worker is already gone.
    pub fn find_with<F>(&self, vendor_id: u16, product_id: u16, callback: F)
    where
        F: FnOnce(QueryResult<Vec<DeviceRecord>>) + Send + 'static,
    {
        self.bridge
            .submit_blocking(vendor_id, product_id, Responder::Callback(Box::new(callback)));
    }

    /// Stop the worker after the queued requests and wait for it
    ///
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };

        if let Err(e) = self.bridge.shutdown() {
            debug!("Query worker already gone: {}", e);
        }
        if handle.join().is_err() {
            error!("Query worker thread panicked");
        }
    }
}

impl Drop for QueryEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_query_worker(worker: QueryWorker, registry: Arc<DeviceRegistry>) {
    info!("Query worker started");

    while let Ok(cmd) = worker.recv_command() {
        match cmd {
            QueryCommand::Find {
                vendor_id,
                product_id,
                responder,
            } => {
                let result = execute_find(&registry, DeviceFilter::new(vendor_id, product_id));
                deliver(responder, result);
            }
            QueryCommand::Shutdown => {
                info!("Query worker shutting down");
                break;
            }
        }
    }

    worker.close();
    info!("Query worker stopped");
}

/// Snapshot the registry; a panic is reported as a query failure
fn execute_find(registry: &DeviceRegistry, filter: DeviceFilter) -> QueryResult<Vec<DeviceRecord>> {
    match catch_unwind(AssertUnwindSafe(|| registry.find(filter))) {
        Ok(records) => {
            debug!(
                "Query vid={:#06x} pid={:#06x} matched {} device(s)",
                filter.vendor_id,
                filter.product_id,
                records.len()
            );
            Ok(records)
        }
        Err(panic) => {
            let message = panic_message(&panic);
            error!("Panic while executing device query: {}", message);
            Err(QueryError::Failed(message))
        }
    }
}

// A panicking user callback must not take the worker down with it
fn deliver(responder: Responder, result: QueryResult<Vec<DeviceRecord>>) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| responder.respond(result))) {
        warn!("Query result callback panicked: {}", panic_message(&panic));
    }
}
