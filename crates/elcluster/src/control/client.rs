//! # Control Client
//!
//! The caller side of a control connection: status queries and routing commands
//! against one remote instance.
//!
//! The server answers strictly in request order, so replies are correlated by
//! position. A background pump reads replies and completes the oldest pending
//! request; when the connection dies every pending request fails with the same error
//! and `closed()` resolves.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use elwire::ControlFrame;
use elwire::RoutingBody;
use elwire::RoutingCommandAck;
use elwire::StatusRequest;
use elwire::StatusResponse;
use elwire::WireError;

use crate::error::ClusterError;
use crate::error::Result;
use crate::transport::TcpTransport;
use crate::transport::Transport;
use crate::transport::TransportError;

type Pending = Arc<SyncMutex<VecDeque<oneshot::Sender<Result<ControlFrame>>>>>;

pub struct ControlClient {
    address: String,
    transport: Arc<dyn Transport>,
    pending: Pending,
    send_lock: Mutex<()>,
    closed_tx: Arc<watch::Sender<bool>>,
    closed: watch::Receiver<bool>,
    pump: JoinHandle<()>,
    timeout: Duration,
}

impl ControlClient {
    /// Connects to the control server at `address`.
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self> {
        let transport = TcpTransport::connect(address, timeout).await?;
        Ok(Self::new(address, Box::new(transport), timeout))
    }

    /// Wraps an already connected transport and spawns the reply pump.
    pub fn new(address: impl Into<String>, transport: Box<dyn Transport>, timeout: Duration) -> Self {
        let address = address.into();
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let pending: Pending = Arc::new(SyncMutex::new(VecDeque::new()));
        let (closed_tx, closed) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);

        let pump_transport = transport.clone();
        let pump_pending = pending.clone();
        let pump_address = address.clone();
        let pump_closed = closed_tx.clone();
        let pump = tokio::spawn(async move {
            let error = loop {
                match pump_transport.recv().await {
                    Ok(Some(msg)) => {
                        if let Err(e) = Self::handle_message(&msg, &pump_pending) {
                            break e;
                        }
                    }
                    Ok(None) => break TransportError::ConnectionLost("Stream closed".into()).into(),
                    Err(e) => break e.into(),
                }
            };

            debug!(address = %pump_address, error = %error, "Control connection ended.");
            Self::notify_all_pending(&pump_pending, error);
            let _ = pump_closed.send(true);
        });

        Self {
            address,
            transport,
            pending,
            send_lock: Mutex::new(()),
            closed_tx,
            closed,
            pump,
            timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn notify_all_pending(pending: &Pending, error: ClusterError) {
        let waiting: Vec<_> = pending.lock().drain(..).collect();
        for tx in waiting {
            let _ = tx.send(Err(error.clone()));
        }
    }

    fn handle_message(msg: &[u8], pending: &Pending) -> Result<()> {
        let frame = ControlFrame::decode(msg)?;
        match &frame {
            ControlFrame::Ack(_) | ControlFrame::StatusResponse(_) => {}
            other => return Err(WireError::UnexpectedFrame(other.command_type()).into()),
        }

        // Nothing waiting means the reply outlived a caller that already gave up.
        if let Some(tx) = pending.lock().pop_front() {
            let _ = tx.send(Ok(frame));
        }
        Ok(())
    }

    async fn request(&self, frame: &ControlFrame) -> Result<ControlFrame> {
        let payload = frame.encode()?;
        let (tx, rx) = oneshot::channel();

        {
            let _order = self.send_lock.lock().await;
            if *self.closed.borrow() {
                return Err(TransportError::ConnectionLost(format!("{} is closed", self.address)).into());
            }
            self.pending.lock().push_back(tx);
            if let Err(e) = self.transport.send(&payload).await {
                self.pending.lock().pop_back();
                return Err(e.into());
            }
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionLost("Response channel closed".into()).into()),
            Err(_) => Err(ClusterError::Timeout(format!("No reply from {}", self.address))),
        }
    }

    /// Asks the remote instance for its identity, load, and hosted nodes.
    pub async fn status(&self) -> Result<StatusResponse> {
        let correlation = Uuid::new_v4();
        match self.request(&ControlFrame::StatusRequest(StatusRequest::new(correlation))).await? {
            ControlFrame::StatusResponse(resp) if resp.correlation == correlation => Ok(resp),
            ControlFrame::StatusResponse(resp) => Err(ClusterError::illegal_state(format!(
                "Status correlation mismatch: expected {}, received {}",
                correlation, resp.correlation
            ))),
            other => Err(WireError::UnexpectedFrame(other.command_type()).into()),
        }
    }

    /// Issues one routing record on the remote instance and returns its ack.
    pub async fn issue(&self, body: RoutingBody) -> Result<RoutingCommandAck> {
        match self.request(&ControlFrame::Routing(body)).await? {
            ControlFrame::Ack(ack) => Ok(ack),
            other => Err(WireError::UnexpectedFrame(other.command_type()).into()),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection has died.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub async fn close(&self) {
        self.transport.close().await;
        self.pump.abort();
        let _ = self.closed_tx.send(true);
        Self::notify_all_pending(
            &self.pending,
            TransportError::ConnectionLost(format!("{} was closed locally", self.address)).into(),
        );
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
