//! Async channel bridge between callers and the query worker thread
//!
//! Device queries are enqueued here and executed on a dedicated thread, so a
//! caller (async or blocking) never touches the registry lock itself. Every
//! request is answered exactly once: by the worker, or with
//! [`QueryError::Unavailable`] when the worker is gone.

use async_channel::{Receiver, Sender, bounded};
use protocol::{DeviceRecord, QueryError, QueryResult};
use std::fmt;
use tracing::debug;

/// Default depth of the query request queue
pub const DEFAULT_QUERY_QUEUE_DEPTH: usize = 64;

/// Callback form of a query response
pub type QueryCallback = Box<dyn FnOnce(QueryResult<Vec<DeviceRecord>>) + Send + 'static>;

/// Where a query result is delivered
pub enum Responder {
    /// Resolve a future awaiting the result
    Async(tokio::sync::oneshot::Sender<QueryResult<Vec<DeviceRecord>>>),
    /// Invoke a callback on the query worker thread
    Callback(QueryCallback),
}

impl Responder {
    /// Deliver the result, consuming the responder
    pub fn respond(self, result: QueryResult<Vec<DeviceRecord>>) {
        match self {
            Responder::Async(tx) => {
                if tx.send(result).is_err() {
                    debug!("Query caller went away before the result arrived");
                }
            }
            Responder::Callback(callback) => callback(result),
        }
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Responder::Async(_) => f.write_str("Responder::Async"),
            Responder::Callback(_) => f.write_str("Responder::Callback"),
        }
    }
}

/// Commands from callers to the query worker
#[derive(Debug)]
pub enum QueryCommand {
    /// Snapshot the registry filtered by vendor/product ID
    Find {
        /// Vendor ID (0 = unspecified)
        vendor_id: u16,
        /// Product ID (0 = unspecified)
        product_id: u16,
        /// Where to send the result
        responder: Responder,
    },

    /// Stop the query worker
    Shutdown,
}

impl QueryCommand {
    /// Answer a command that could not be enqueued
    fn reject(self, reason: &str) {
        if let QueryCommand::Find { responder, .. } = self {
            responder.respond(Err(QueryError::Unavailable(reason.to_string())));
        }
    }
}

/// Caller-side handle (async or blocking)
#[derive(Clone)]
pub struct QueryBridge {
    cmd_tx: Sender<QueryCommand>,
}

impl QueryBridge {
    /// Enqueue a find request; the responder is answered exactly once
    pub async fn submit(&self, vendor_id: u16, product_id: u16, responder: Responder) {
        let cmd = QueryCommand::Find {
            vendor_id,
            product_id,
            responder,
        };
        if let Err(e) = self.cmd_tx.send(cmd).await {
            e.into_inner().reject("query worker is not running");
        }
    }

    /// Blocking variant of [`QueryBridge::submit`]
    pub fn submit_blocking(&self, vendor_id: u16, product_id: u16, responder: Responder) {
        let cmd = QueryCommand::Find {
            vendor_id,
            product_id,
            responder,
        };
        if let Err(e) = self.cmd_tx.send_blocking(cmd) {
            e.into_inner().reject("query worker is not running");
        }
    }

    /// Run a find request and await its result
    pub async fn find(&self, vendor_id: u16, product_id: u16) -> QueryResult<Vec<DeviceRecord>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.submit(vendor_id, product_id, Responder::Async(tx)).await;
        rx.await.unwrap_or_else(|_| {
            Err(QueryError::Unavailable(
                "query worker dropped the request".to_string(),
            ))
        })
    }

    /// Run a find request, blocking the current thread
    ///
    /// Must not be called from within an async runtime.
    pub fn find_blocking(&self, vendor_id: u16, product_id: u16) -> QueryResult<Vec<DeviceRecord>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.submit_blocking(vendor_id, product_id, Responder::Async(tx));
        rx.blocking_recv().unwrap_or_else(|_| {
            Err(QueryError::Unavailable(
                "query worker dropped the request".to_string(),
            ))
        })
    }

    /// Ask the worker to stop after the requests already queued
    pub fn shutdown(&self) -> crate::Result<()> {
        self.cmd_tx
            .send_blocking(QueryCommand::Shutdown)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Check if the worker side has gone away
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

/// Worker-side handle (blocking)
pub struct QueryWorker {
    cmd_rx: Receiver<QueryCommand>,
}

impl QueryWorker {
    /// Receive a command (blocking)
    ///
    /// Fails once every [`QueryBridge`] has been dropped.
    pub fn recv_command(&self) -> crate::Result<QueryCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<QueryCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Close the queue and answer everything still waiting in it
    pub fn close(&self) {
        self.cmd_rx.close();
        while let Some(cmd) = self.try_recv_command() {
            cmd.reject("query worker stopped");
        }
    }
}

/// Create the channel bridge between callers and the query worker
///
/// Returns (QueryBridge for callers, QueryWorker for the worker thread)
pub fn create_query_bridge(capacity: usize) -> (QueryBridge, QueryWorker) {
    let (cmd_tx, cmd_rx) = bounded(capacity.max(1));

    (QueryBridge { cmd_tx }, QueryWorker { cmd_rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_bridge() {
        let (bridge, worker) = create_query_bridge(DEFAULT_QUERY_QUEUE_DEPTH);

        // Spawn a thread to simulate the query worker
        let handle = std::thread::spawn(move || {
            if let Ok(QueryCommand::Find {
                vendor_id,
                product_id,
                responder,
            }) = worker.recv_command()
            {
                responder.respond(Ok(vec![DeviceRecord::with_ids(vendor_id, product_id)]));
            }
        });

        let result = bridge.find(0x1234, 0x5678).await.unwrap();
        assert_eq!(result, vec![DeviceRecord::with_ids(0x1234, 0x5678)]);

        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_find_after_worker_dropped() {
        let (bridge, worker) = create_query_bridge(4);
        drop(worker);

        let result = bridge.find(0, 0).await;
        assert!(matches!(result, Err(QueryError::Unavailable(_))));
    }

    #[test]
    fn test_close_answers_pending_requests() {
        let (bridge, worker) = create_query_bridge(4);
        let (tx, rx) = std::sync::mpsc::channel();

        bridge.submit_blocking(
            1,
            0,
            Responder::Callback(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        );
        worker.close();

        let result = rx.recv().unwrap();
        assert!(matches!(result, Err(QueryError::Unavailable(_))));
        assert!(bridge.is_closed());
    }
}
