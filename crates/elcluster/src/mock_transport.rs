//! Mock transports for testing.
//!
//! Used by the test suites; not part of the stable API.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::transport;
use crate::transport::Connector;
use crate::transport::Transport;

/// A duplex channel transport using tokio mpsc channels.
///
/// Messages sent via send() appear on the peer's recv() and vice versa.
pub struct DuplexChannelTransport {
    tx: SyncMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl DuplexChannelTransport {
    pub fn new(tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            tx: SyncMutex::new(Some(tx)),
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Creates a pair of transports connected to each other.
    ///
    /// Messages sent on `a` are received by `b` and vice versa.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (Self::new(tx_a, rx_b), Self::new(tx_b, rx_a))
    }
}

#[async_trait::async_trait]
impl Transport for DuplexChannelTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(transport::Error::ConnectionLost("Transport closed".into()));
        };
        tx.send(payload.to_vec())
            .map_err(|_| transport::Error::ConnectionLost("Channel closed".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn close(&self) {
        self.tx.lock().take();
    }
}

/// Hands out pre-registered transports by address.
///
/// Each `connect(address)` pops the next transport queued under that address; an
/// address with nothing queued fails with `ConnectionLost`.
#[derive(Default)]
pub struct MockConnector {
    queued: SyncMutex<HashMap<String, VecDeque<Box<dyn Transport>>>>,
    connects: SyncMutex<Vec<String>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the client end of a fresh pair under `address` and returns the server end.
    pub fn expect(&self, address: &str) -> DuplexChannelTransport {
        let (client, server) = DuplexChannelTransport::pair();
        self.queued
            .lock()
            .entry(address.to_string())
            .or_default()
            .push_back(Box::new(client));
        server
    }

    /// Every address `connect` was called with, in order.
    pub fn connects(&self) -> Vec<String> {
        self.connects.lock().clone()
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn connect(&self, address: &str) -> transport::Result<Box<dyn Transport>> {
        self.connects.lock().push(address.to_string());
        self.queued
            .lock()
            .get_mut(address)
            .and_then(|queue| queue.pop_front())
            .ok_or_else(|| transport::Error::ConnectionLost(format!("No route to {}", address)))
    }
}
