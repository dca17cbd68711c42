//! Remote access to the control plane.
//!
//! Peers connect here to ask for status and to issue routing commands. Every request
//! frame is handed to the `ControlService` loop unchanged and its reply written back
//! on the same connection, in request order.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use elwire::CommandType;
use elwire::ControlFrame;
use elwire::WireError;
use elwire::command::split_preamble;

use super::ControlService;
use crate::error::Result;
use crate::transport::read_frame;
use crate::transport::tcp_authority;
use crate::transport::write_frame;

/// Listens for control connections.
pub struct ControlServer {
    address: String,
    task: JoinHandle<()>,
}

impl ControlServer {
    /// Binds `address` and starts accepting. Port 0 picks a free port; see `address()`.
    pub async fn bind(address: &str, service: Arc<ControlService>) -> Result<Self> {
        let listener = TcpListener::bind(tcp_authority(address)?).await?;
        let address = format!("tcp://{}", listener.local_addr()?);
        info!(address = %address, "Control server listening.");

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Control connection accepted.");
                        let service = service.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve(stream, service).await {
                                warn!(peer = %peer, error = %e, "Control connection closed.");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Control accept failed.");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(Self { address, task })
    }

    /// The address actually bound, as `tcp://host:port`.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn stop(self) {
        self.task.abort();
        info!(address = %self.address, "Control server stopped.");
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, service: Arc<ControlService>) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let (mut read, mut write) = stream.into_split();

    while let Some(frame) = read_frame(&mut read).await? {
        let (command_type, body) = split_preamble(&frame)?;
        match command_type {
            CommandType::RoutingCommand | CommandType::StatusRequest => {}
            other => return Err(WireError::UnexpectedFrame(other).into()),
        }

        let reply = service.issue_command(command_type, body).await?;
        write_frame(&mut write, &ControlFrame::encode(&reply)?).await?;
    }

    debug!("Control connection closed by peer.");
    Ok(())
}
