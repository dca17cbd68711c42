//! # Control Connection Service
//!
//! One connection-processing loop owns every data-plane socket of this process and the
//! `RouteHandleRegistry` that indexes them. Everything else talks to the loop by
//! message: routing commands arrive as encoded control frames through
//! `issue_command`, and in-process routes exchange data frames through attached
//! `InprocTransport`s.
//!
//! ## Responsibilities
//!
//! - **Listen**: `BIND_ADDRESS` opens the data-plane listener; inbound calls for nodes
//!   bound with `BIND_NODE` go to the `InvocationDispatcher`.
//! - **Connect**: `CONNECT_ADDRESS` (or the combined `CONNECT_INSTANCE`) opens a backend
//!   link to a remote data plane; `CONNECT_NODE` multiplexes an in-process route over it.
//! - **Teardown**: losing or disconnecting a backend closes every route under it.
//!
//! ## Invariants
//! - The registry is touched only by the loop task.
//! - A malformed frame closes the link it arrived on and nothing else.

pub mod client;
pub mod local;
pub mod server;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use elwire::ApplicationId;
use elwire::CommandType;
use elwire::ControlFrame;
use elwire::DataFrame;
use elwire::ErrorKind;
use elwire::InstanceConnectionCommand;
use elwire::InstanceAction;
use elwire::NodeId;
use elwire::ResponseCode;
use elwire::RoutingAction;
use elwire::RoutingBody;
use elwire::RoutingCommand;
use elwire::RoutingCommandAck;
use elwire::StatusRequest;
use elwire::StatusResponse;
use elwire::WireError;
use elwire::command::with_preamble;
use elwire::frame::open_envelope;
use elwire::frame::wrap_envelope;

use crate::error::ClusterError;
use crate::error::Result;
use crate::routes::RouteHandleRegistry;
use crate::routes::SocketHandle;
use crate::routes::Teardown;
use crate::transport;
use crate::transport::Connector;
use crate::transport::Transport;
use crate::transport::TransportError;
use crate::transport::read_frame;
use crate::transport::tcp_authority;
use crate::transport::write_frame;

pub use local::InvocationDispatcher;
pub use local::LocalInstance;
pub use local::RejectingDispatcher;
pub use local::ReplySink;

const INPROC_SCHEME: &str = "inproc://";

/// The connect address of an in-process route.
pub fn inproc_address(route: &Uuid) -> String {
    format!("{}{}", INPROC_SCHEME, route)
}

/// The route named by an `inproc://` address.
pub fn parse_inproc(address: &str) -> Option<Uuid> {
    address.strip_prefix(INPROC_SCHEME).and_then(|raw| Uuid::parse_str(raw).ok())
}

/// Counters reported by the loop, for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub listeners: usize,
    pub links: usize,
    pub addresses: usize,
    pub routes: usize,
    pub attached: usize,
    pub bound_nodes: usize,
}

type CommandReply = oneshot::Sender<Result<ControlFrame>>;

enum LoopEvent {
    Command { frame: Vec<u8>, reply: CommandReply },
    Connected {
        address: String,
        control: Option<String>,
        body: RoutingBody,
        result: transport::Result<TcpStream>,
        reply: CommandReply,
    },
    Attach { route: Uuid, inbox: mpsc::UnboundedSender<Vec<u8>>, reply: oneshot::Sender<Result<u64>> },
    Detach { route: Uuid, attachment: u64 },
    Outbound { route: Uuid, frame: Vec<u8> },
    Accepted { stream: TcpStream, peer: SocketAddr },
    Inbound { handle: SocketHandle, frame: Vec<u8> },
    LinkClosed { handle: SocketHandle, reason: String },
    Reply { handle: SocketHandle, frame: Vec<u8> },
    Inspect { reply: oneshot::Sender<LoopStats> },
    Shutdown { done: oneshot::Sender<()> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkKind {
    /// We connected out to a remote data plane.
    Backend,
    /// A remote invoker connected in to our listener.
    Accepted,
}

struct Link {
    kind: LinkKind,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
}

impl Link {
    fn close(self) {
        self.reader.abort();
        // Dropping the outbox lets the writer drain and shut the socket down.
    }
}

/// The attached end of an in-process route. A later attach replaces it.
struct Frontend {
    attachment: u64,
    inbox: mpsc::UnboundedSender<Vec<u8>>,
}

struct Listener {
    requested: String,
    actual: String,
    task: JoinHandle<()>,
}

/// Handle to the connection-processing loop.
pub struct ControlService {
    events: mpsc::UnboundedSender<LoopEvent>,
    local: Arc<LocalInstance>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ControlService {
    /// Spawns the loop.
    pub fn start(
        local: Arc<LocalInstance>,
        dispatcher: Arc<dyn InvocationDispatcher>,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        let control_loop = ControlLoop {
            local: local.clone(),
            dispatcher,
            connect_timeout,
            registry: RouteHandleRegistry::new(),
            links: HashMap::new(),
            listeners: Vec::new(),
            bound_nodes: HashMap::new(),
            frontends: HashMap::new(),
            next_attachment: 0,
            events: events.clone(),
        };
        let task = tokio::spawn(control_loop.run(rx));
        info!(instance = %local.instance_id(), "Control service started.");

        Arc::new(Self {
            events,
            local,
            task: parking_lot::Mutex::new(Some(task)),
        })
    }

    /// Closes every socket and ends the loop, waiting at most `timeout`.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let Some(mut task) = self.task.lock().take() else {
            return Err(ClusterError::illegal_state("Not running."));
        };

        let (done, finished) = oneshot::channel();
        let _ = self.events.send(LoopEvent::Shutdown { done });
        if tokio::time::timeout(timeout, finished).await.is_err() {
            warn!(timeout = ?timeout, "Control loop did not stop in time. Aborting.");
            task.abort();
        }
        let _ = tokio::time::timeout(timeout, &mut task).await;
        info!("Control service stopped.");
        Ok(())
    }

    pub fn local(&self) -> &Arc<LocalInstance> {
        &self.local
    }

    /// Sends one encoded command body to the loop and returns its reply frame.
    pub async fn issue_command(&self, command_type: CommandType, payload: &[u8]) -> Result<ControlFrame> {
        let (reply, rx) = oneshot::channel();
        let frame = with_preamble(command_type, payload);
        self.events
            .send(LoopEvent::Command { frame, reply })
            .map_err(|_| loop_gone())?;
        rx.await.map_err(|_| loop_gone())?
    }

    /// Issues a routing record and checks its ack.
    pub async fn route(&self, body: RoutingBody) -> Result<()> {
        let payload = ControlFrame::Routing(body).encode_body()?;
        match self.issue_command(CommandType::RoutingCommand, &payload).await? {
            ControlFrame::Ack(ack) => ack_result(&ack),
            other => Err(WireError::UnexpectedFrame(other.command_type()).into()),
        }
    }

    async fn route_command(&self, action: RoutingAction, address: &str, id: Uuid) -> Result<()> {
        self.route(RoutingBody::Route(RoutingCommand::new(action, address, id))).await
    }

    /// Opens the data-plane listener and returns the address it actually bound.
    pub async fn bind_address(&self, address: &str) -> Result<String> {
        self.route_command(RoutingAction::BindAddress, address, Uuid::nil()).await?;
        Ok(self.local.invoker_address())
    }

    pub async fn unbind_address(&self, address: &str) -> Result<()> {
        self.route_command(RoutingAction::UnbindAddress, address, Uuid::nil()).await
    }

    pub async fn connect_address(&self, address: &str) -> Result<()> {
        self.route_command(RoutingAction::ConnectAddress, address, Uuid::nil()).await
    }

    pub async fn disconnect_address(&self, address: &str) -> Result<()> {
        self.route_command(RoutingAction::DisconnectAddress, address, Uuid::nil()).await
    }

    /// Serves `application` on this instance and returns its node.
    pub async fn bind_node(&self, application: ApplicationId) -> Result<NodeId> {
        self.route_command(RoutingAction::BindNode, "", application.0).await?;
        Ok(NodeId::new(self.local.instance_id(), application))
    }

    pub async fn unbind_node(&self, application: ApplicationId) -> Result<()> {
        self.route_command(RoutingAction::UnbindNode, "", application.0).await
    }

    /// Opens an in-process route to `node` over the link to `address`.
    ///
    /// Returns the `inproc://` address an invoker connects to.
    pub async fn connect_node(&self, address: &str, node: &NodeId) -> Result<String> {
        let route = node.route_id();
        self.route_command(RoutingAction::ConnectNode, address, route).await?;
        Ok(inproc_address(&route))
    }

    pub async fn disconnect_node(&self, address: &str, node: &NodeId) -> Result<()> {
        self.route_command(RoutingAction::DisconnectNode, address, node.route_id()).await
    }

    /// Opens the data plane of one instance and pairs it with its control address.
    pub async fn connect_instance(&self, invoker_address: &str, control_address: &str) -> Result<()> {
        let cmd = InstanceConnectionCommand::connect(invoker_address, control_address);
        self.route(RoutingBody::Instance(cmd)).await
    }

    /// Closes the data plane paired with `control_address` and every route under it.
    pub async fn disconnect_instance(&self, control_address: &str) -> Result<()> {
        let cmd = InstanceConnectionCommand::disconnect("", control_address);
        self.route(RoutingBody::Instance(cmd)).await
    }

    pub async fn status(&self) -> Result<StatusResponse> {
        let request = ControlFrame::StatusRequest(StatusRequest::new(Uuid::new_v4()));
        match self.issue_command(CommandType::StatusRequest, &request.encode_body()?).await? {
            ControlFrame::StatusResponse(resp) => Ok(resp),
            other => Err(WireError::UnexpectedFrame(other.command_type()).into()),
        }
    }

    pub async fn stats(&self) -> Result<LoopStats> {
        let (reply, rx) = oneshot::channel();
        self.events.send(LoopEvent::Inspect { reply }).map_err(|_| loop_gone())?;
        rx.await.map_err(|_| loop_gone())
    }

    /// Attaches a frontend to an open in-process route.
    pub async fn attach(&self, route: Uuid) -> Result<InprocTransport> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (reply, rx) = oneshot::channel();
        self.events
            .send(LoopEvent::Attach { route, inbox: inbox_tx, reply })
            .map_err(|_| loop_gone())?;
        let attachment = rx.await.map_err(|_| loop_gone())??;
        Ok(InprocTransport {
            route,
            attachment,
            events: self.events.clone(),
            inbox: Mutex::new(inbox_rx),
        })
    }
}

impl Drop for ControlService {
    fn drop(&mut self) {
        if self.task.lock().is_some() {
            let (done, _) = oneshot::channel();
            let _ = self.events.send(LoopEvent::Shutdown { done });
        }
    }
}

#[async_trait::async_trait]
impl Connector for ControlService {
    async fn connect(&self, address: &str) -> transport::Result<Box<dyn Transport>> {
        let route = parse_inproc(address).ok_or_else(|| TransportError::InvalidAddress(address.to_string()))?;
        let transport = self
            .attach(route)
            .await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;
        Ok(Box::new(transport))
    }
}

fn loop_gone() -> ClusterError {
    ClusterError::illegal_state("Control loop is not running.")
}

fn ack_result(ack: &RoutingCommandAck) -> Result<()> {
    match ack.code {
        ResponseCode::Ok => Ok(()),
        ResponseCode::NoSuchRoute => Err(ClusterError::not_found(format!("No such route for action {}", ack.action))),
        ResponseCode::ProtocolError => Err(ClusterError::Remote {
            kind: ErrorKind::Protocol,
            message: format!("Routing command {} rejected", ack.action),
        }),
        ResponseCode::SocketError => Err(ClusterError::Transport(TransportError::Io(format!(
            "Socket error on routing command {}",
            ack.action
        )))),
    }
}

/// One frontend of an in-process route. Frames sent here leave through the backend
/// link that owns the route.
pub struct InprocTransport {
    route: Uuid,
    attachment: u64,
    events: mpsc::UnboundedSender<LoopEvent>,
    inbox: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl InprocTransport {
    pub fn route(&self) -> Uuid {
        self.route
    }
}

#[async_trait::async_trait]
impl Transport for InprocTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        self.events
            .send(LoopEvent::Outbound { route: self.route, frame: payload.to_vec() })
            .map_err(|_| TransportError::ConnectionLost("Control loop stopped".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let mut inbox = self.inbox.lock().await;
        Ok(inbox.recv().await)
    }

    async fn close(&self) {
        let _ = self.events.send(LoopEvent::Detach { route: self.route, attachment: self.attachment });
    }
}

// ============================================================================
//  THE LOOP
// ============================================================================

struct ControlLoop {
    local: Arc<LocalInstance>,
    dispatcher: Arc<dyn InvocationDispatcher>,
    connect_timeout: Duration,
    registry: RouteHandleRegistry,
    links: HashMap<SocketHandle, Link>,
    listeners: Vec<Listener>,
    bound_nodes: HashMap<Uuid, NodeId>,
    frontends: HashMap<Uuid, Frontend>,
    next_attachment: u64,
    events: mpsc::UnboundedSender<LoopEvent>,
}

impl ControlLoop {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<LoopEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                LoopEvent::Shutdown { done } => {
                    self.shutdown();
                    let _ = done.send(());
                    return;
                }
                event => self.handle(event).await,
            }
        }
        self.shutdown();
    }

    async fn handle(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Command { frame, reply } => self.handle_command(&frame, reply).await,
            LoopEvent::Connected { address, control, body, result, reply } => {
                self.finish_connect(address, control, &body, result, reply)
            }
            LoopEvent::Attach { route, inbox, reply } => {
                let result = if self.registry.handle_for_route(&route).is_some() {
                    self.next_attachment += 1;
                    let attachment = self.next_attachment;
                    self.frontends.insert(route, Frontend { attachment, inbox });
                    Ok(attachment)
                } else {
                    Err(ClusterError::not_found(format!("No in-process route {}", route)))
                };
                let _ = reply.send(result);
            }
            LoopEvent::Detach { route, attachment } => {
                if self.frontends.get(&route).is_some_and(|f| f.attachment == attachment) {
                    self.frontends.remove(&route);
                }
            }
            LoopEvent::Outbound { route, frame } => self.forward_outbound(route, frame),
            LoopEvent::Accepted { stream, peer } => {
                let handle = self.registry.allocate();
                let link = self.spawn_link(handle, stream, LinkKind::Accepted);
                self.links.insert(handle, link);
                debug!(peer = %peer, handle = %handle, "Accepted data-plane connection.");
            }
            LoopEvent::Inbound { handle, frame } => self.handle_inbound(handle, frame),
            LoopEvent::LinkClosed { handle, reason } => self.handle_link_closed(handle, &reason),
            LoopEvent::Reply { handle, frame } => {
                if let Some(link) = self.links.get(&handle) {
                    let _ = link.outbox.send(frame);
                } else {
                    debug!(handle = %handle, "Dropping reply for closed link.");
                }
            }
            LoopEvent::Inspect { reply } => {
                let _ = reply.send(self.stats());
            }
            LoopEvent::Shutdown { .. } => {}
        }
    }

    fn stats(&self) -> LoopStats {
        LoopStats {
            listeners: self.listeners.len(),
            links: self.links.len(),
            addresses: self.registry.address_count(),
            routes: self.registry.route_count(),
            attached: self.frontends.len(),
            bound_nodes: self.bound_nodes.len(),
        }
    }

    // --- Commands ---

    async fn handle_command(&mut self, frame: &[u8], reply: CommandReply) {
        let decoded = match ControlFrame::decode(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "Malformed control command.");
                let _ = reply.send(Err(e.into()));
                return;
            }
        };

        match decoded {
            ControlFrame::StatusRequest(req) => {
                let _ = reply.send(Ok(ControlFrame::StatusResponse(self.local.status(req.correlation))));
            }
            ControlFrame::Routing(body) => self.handle_routing(body, reply).await,
            other => {
                let _ = reply.send(Err(WireError::UnexpectedFrame(other.command_type()).into()));
            }
        }
    }

    async fn handle_routing(&mut self, body: RoutingBody, reply: CommandReply) {
        let code = match &body {
            RoutingBody::Route(cmd) => match cmd.action {
                RoutingAction::BindAddress => self.bind(&cmd.address).await,
                RoutingAction::UnbindAddress => self.unbind(&cmd.address),
                RoutingAction::ConnectAddress => {
                    self.start_connect(cmd.address.clone(), None, body.clone(), reply);
                    return;
                }
                RoutingAction::DisconnectAddress => match self.teardown_address(&cmd.address) {
                    Some(_) => ResponseCode::Ok,
                    None => ResponseCode::NoSuchRoute,
                },
                RoutingAction::BindNode => {
                    let node = NodeId::new(self.local.instance_id(), ApplicationId(cmd.id));
                    self.bound_nodes.insert(node.route_id(), node);
                    self.local.add_node(node);
                    info!(node = %node, "Bound node.");
                    ResponseCode::Ok
                }
                RoutingAction::UnbindNode => {
                    let node = NodeId::new(self.local.instance_id(), ApplicationId(cmd.id));
                    self.local.remove_node(&node);
                    match self.bound_nodes.remove(&node.route_id()) {
                        Some(_) => ResponseCode::Ok,
                        None => ResponseCode::NoSuchRoute,
                    }
                }
                RoutingAction::ConnectNode => self.open_route(&cmd.address, cmd.id),
                RoutingAction::DisconnectNode => match self.registry.unregister_route(&cmd.id) {
                    Some(_) => {
                        self.frontends.remove(&cmd.id);
                        ResponseCode::Ok
                    }
                    None => ResponseCode::NoSuchRoute,
                },
            },
            RoutingBody::Instance(cmd) => match cmd.action {
                InstanceAction::ConnectInstance => {
                    self.start_connect(
                        cmd.invoker_address.clone(),
                        Some(cmd.control_address.clone()),
                        body.clone(),
                        reply,
                    );
                    return;
                }
                InstanceAction::DisconnectInstance => {
                    let paired = self.registry.unpair_instance(&cmd.control_address);
                    let invoker = Some(cmd.invoker_address.clone()).filter(|a| !a.is_empty()).or(paired);
                    match invoker.and_then(|address| self.teardown_address(&address)) {
                        Some(_) => ResponseCode::Ok,
                        None => ResponseCode::NoSuchRoute,
                    }
                }
            },
        };

        let _ = reply.send(Ok(ControlFrame::Ack(RoutingCommandAck::for_command(&body, code))));
    }

    async fn bind(&mut self, address: &str) -> ResponseCode {
        if self.listeners.iter().any(|l| l.requested == address || l.actual == address) {
            return ResponseCode::Ok;
        }

        let listener = match tcp_authority(address) {
            Ok(authority) => TcpListener::bind(authority).await,
            Err(e) => {
                warn!(address, error = %e, "Cannot bind address.");
                return ResponseCode::ProtocolError;
            }
        };
        let listener = match listener {
            Ok(listener) => listener,
            Err(e) => {
                warn!(address, error = %e, "Bind failed.");
                return ResponseCode::SocketError;
            }
        };
        let actual = match listener.local_addr() {
            Ok(addr) => format!("tcp://{}", addr),
            Err(_) => address.to_string(),
        };

        let events = self.events.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if events.send(LoopEvent::Accepted { stream, peer }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed.");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        info!(address = %actual, "Bound data-plane listener.");
        self.local.set_invoker_address(actual.clone());
        self.listeners.push(Listener { requested: address.to_string(), actual, task });
        ResponseCode::Ok
    }

    fn unbind(&mut self, address: &str) -> ResponseCode {
        let Some(idx) = self.listeners.iter().position(|l| l.requested == address || l.actual == address) else {
            return ResponseCode::NoSuchRoute;
        };
        let listener = self.listeners.remove(idx);
        listener.task.abort();
        info!(address = %listener.actual, "Unbound data-plane listener.");
        ResponseCode::Ok
    }

    fn start_connect(&mut self, address: String, control: Option<String>, body: RoutingBody, reply: CommandReply) {
        if self.registry.handle_for_address(&address).is_some() {
            if let Some(control) = &control {
                self.registry.pair_instance(control, &address);
            }
            let _ = reply.send(Ok(ControlFrame::Ack(RoutingCommandAck::for_command(&body, ResponseCode::Ok))));
            return;
        }

        let events = self.events.clone();
        let timeout = self.connect_timeout;
        tokio::spawn(async move {
            let result: transport::Result<TcpStream> = async {
                let authority = tcp_authority(&address)?;
                let stream = tokio::time::timeout(timeout, TcpStream::connect(authority))
                    .await
                    .map_err(|_| TransportError::Timeout)??;
                Ok(stream)
            }
            .await;
            let _ = events.send(LoopEvent::Connected { address, control, body, result, reply });
        });
    }

    fn finish_connect(
        &mut self,
        address: String,
        control: Option<String>,
        body: &RoutingBody,
        result: transport::Result<TcpStream>,
        reply: CommandReply,
    ) {
        let code = match result {
            Ok(stream) if self.registry.handle_for_address(&address).is_some() => {
                drop(stream);
                ResponseCode::Ok
            }
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                let handle = self.registry.allocate();
                let link = self.spawn_link(handle, stream, LinkKind::Backend);
                match self.registry.register_address(handle, &address) {
                    Ok(()) => {
                        self.links.insert(handle, link);
                        info!(address = %address, handle = %handle, "Connected backend.");
                        ResponseCode::Ok
                    }
                    Err(e) => {
                        warn!(address = %address, error = %e, "Could not register backend.");
                        link.close();
                        ResponseCode::SocketError
                    }
                }
            }
            Err(e) => {
                warn!(address = %address, error = %e, "Backend connect failed.");
                ResponseCode::SocketError
            }
        };

        if code == ResponseCode::Ok {
            if let Some(control) = &control {
                self.registry.pair_instance(control, &address);
            }
        }
        let _ = reply.send(Ok(ControlFrame::Ack(RoutingCommandAck::for_command(body, code))));
    }

    fn open_route(&mut self, address: &str, route: Uuid) -> ResponseCode {
        if let Some(owner) = self.registry.owner_of(&route) {
            return if owner == address { ResponseCode::Ok } else { ResponseCode::ProtocolError };
        }
        let handle = self.registry.allocate();
        match self.registry.register_route(handle, route, address) {
            Ok(()) => {
                debug!(address, route = %route, "Opened in-process route.");
                ResponseCode::Ok
            }
            Err(ClusterError::NotFound(_)) => ResponseCode::NoSuchRoute,
            Err(e) => {
                warn!(address, route = %route, error = %e, "Could not open route.");
                ResponseCode::ProtocolError
            }
        }
    }

    /// Removes the address, its link, and every route under it.
    fn teardown_address(&mut self, address: &str) -> Option<Teardown> {
        let teardown = self.registry.unregister_address(address);
        if teardown.address.is_none() && teardown.routes.is_empty() {
            return None;
        }
        for (route, _) in &teardown.routes {
            self.frontends.remove(route);
        }
        if let Some(link) = teardown.address.and_then(|handle| self.links.remove(&handle)) {
            link.close();
        }
        info!(address, routes = teardown.routes.len(), "Tore down backend.");
        Some(teardown)
    }

    // --- Links ---

    fn spawn_link(&self, handle: SocketHandle, stream: TcpStream, kind: LinkKind) -> Link {
        let (mut read, mut write) = stream.into_split();
        let (outbox, mut pending) = mpsc::unbounded_channel::<Vec<u8>>();

        let events = self.events.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match read_frame(&mut read).await {
                    Ok(Some(frame)) => {
                        if events.send(LoopEvent::Inbound { handle, frame }).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break "closed by peer".to_string(),
                    Err(e) => break e.to_string(),
                }
            };
            let _ = events.send(LoopEvent::LinkClosed { handle, reason });
        });

        tokio::spawn(async move {
            while let Some(frame) = pending.recv().await {
                if let Err(e) = write_frame(&mut write, &frame).await {
                    debug!(handle = %handle, error = %e, "Write failed.");
                    break;
                }
            }
            let _ = write.shutdown().await;
        });

        Link { kind, outbox, reader }
    }

    fn handle_link_closed(&mut self, handle: SocketHandle, reason: &str) {
        let Some(kind) = self.links.get(&handle).map(|l| l.kind) else {
            return;
        };
        match kind {
            LinkKind::Backend => {
                let address = self.registry.address_for_handle(handle).map(str::to_string);
                warn!(handle = %handle, address = ?address, reason, "Backend link lost.");
                match address {
                    Some(address) => {
                        self.teardown_address(&address);
                    }
                    None => {
                        if let Some(link) = self.links.remove(&handle) {
                            link.close();
                        }
                    }
                }
            }
            LinkKind::Accepted => {
                debug!(handle = %handle, reason, "Inbound link closed.");
                if let Some(link) = self.links.remove(&handle) {
                    link.close();
                }
            }
        }
    }

    fn close_for_protocol_error(&mut self, handle: SocketHandle, error: &WireError) {
        warn!(handle = %handle, error = %error, "Protocol error. Closing link.");
        let kind = self.links.get(&handle).map(|l| l.kind);
        match kind {
            Some(LinkKind::Backend) => {
                if let Some(address) = self.registry.address_for_handle(handle).map(str::to_string) {
                    self.teardown_address(&address);
                }
            }
            Some(LinkKind::Accepted) => {
                if let Some(link) = self.links.remove(&handle) {
                    link.close();
                }
            }
            None => {}
        }
    }

    // --- Data plane ---

    fn forward_outbound(&mut self, route: Uuid, frame: Vec<u8>) {
        let link = self
            .registry
            .owner_of(&route)
            .and_then(|owner| self.registry.handle_for_address(owner))
            .and_then(|handle| self.links.get(&handle));

        match link {
            Some(link) => {
                let _ = link.outbox.send(wrap_envelope(&route, &frame));
            }
            None => self.bounce(route, &frame),
        }
    }

    /// Answers an unroutable call on its own frontend so the caller fails fast.
    fn bounce(&self, route: Uuid, frame: &[u8]) {
        let Ok(DataFrame::Call { seq, .. }) = DataFrame::decode(frame) else {
            debug!(route = %route, "Dropping unroutable frame.");
            return;
        };
        let error = DataFrame::Error {
            seq,
            part: 0,
            kind: ErrorKind::NoSuchRoute,
            message: format!("No backend for route {}", route),
        };
        if let (Some(frontend), Ok(bytes)) = (self.frontends.get(&route), error.encode()) {
            let _ = frontend.inbox.send(bytes);
        }
    }

    fn handle_inbound(&mut self, handle: SocketHandle, frame: Vec<u8>) {
        let Some(kind) = self.links.get(&handle).map(|l| l.kind) else {
            return;
        };
        let (route, body) = match open_envelope(&frame) {
            Ok(parts) => parts,
            Err(e) => {
                self.close_for_protocol_error(handle, &e);
                return;
            }
        };

        match kind {
            LinkKind::Backend => {
                let delivered = self
                    .frontends
                    .get(&route)
                    .map(|frontend| frontend.inbox.send(body.to_vec()).is_ok());
                match delivered {
                    Some(true) => {}
                    Some(false) => {
                        self.frontends.remove(&route);
                    }
                    None => debug!(route = %route, "No frontend attached. Dropping reply."),
                }
            }
            LinkKind::Accepted => self.serve_call(handle, route, body),
        }
    }

    fn serve_call(&mut self, handle: SocketHandle, route: Uuid, body: &[u8]) {
        let (seq, invocation) = match DataFrame::decode(body) {
            Ok(DataFrame::Call { seq, invocation }) => (seq, invocation),
            Ok(other) => {
                let error = WireError::UnknownTag { field: "call", tag: frame_tag(&other) };
                self.close_for_protocol_error(handle, &error);
                return;
            }
            Err(e) => {
                self.close_for_protocol_error(handle, &e);
                return;
            }
        };

        let sink = self.reply_sink(handle, route, seq);
        let Some(node) = self.bound_nodes.get(&route).copied() else {
            sink.failure(0, ErrorKind::NoSuchRoute, format!("Route {} is not bound here", route));
            return;
        };

        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            dispatcher.dispatch(node, invocation, sink).await;
        });
    }

    fn reply_sink(&self, handle: SocketHandle, route: Uuid, seq: u64) -> ReplySink {
        let events = self.events.clone();
        ReplySink::new(seq, move |frame: DataFrame| match frame.encode() {
            Ok(bytes) => {
                let _ = events.send(LoopEvent::Reply { handle, frame: wrap_envelope(&route, &bytes) });
            }
            Err(e) => warn!(error = %e, "Could not encode reply."),
        })
    }

    fn shutdown(&mut self) {
        for listener in self.listeners.drain(..) {
            listener.task.abort();
        }
        for (_, link) in self.links.drain() {
            link.close();
        }
        self.frontends.clear();
        self.bound_nodes.clear();
        self.registry = RouteHandleRegistry::new();
    }
}

fn frame_tag(frame: &DataFrame) -> u8 {
    match frame {
        DataFrame::Call { .. } => 1,
        DataFrame::Result { .. } => 2,
        DataFrame::Error { .. } => 3,
    }
}
