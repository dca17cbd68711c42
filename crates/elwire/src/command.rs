//! # Control Records
//!
//! Fixed-layout binary records exchanged on the control channel.
//!
//! ## Layout
//!
//! Every frame starts with a 4-byte command type. The body layout is fixed per type,
//! so no length prefix is needed. All integers are big-endian; address fields are
//! UTF-8, NUL-padded to `ADDRESS_WIDTH`.
//!
//! | type | body |
//! |------|------|
//! | `ROUTING_COMMAND` | `RoutingCommand` (276 bytes) or `InstanceConnectionCommand` (516 bytes), told apart by the leading action code |
//! | `ROUTING_COMMAND_ACK` | `RoutingCommandAck` (24 bytes) |
//! | `STATUS_REQUEST` | `StatusRequest` (16 bytes) |
//! | `STATUS_RESPONSE` | `StatusResponse` (300-byte header, then 32 bytes per node) |
//!
//! ## Invariants
//! - **Panic Safety**: every decoding path returns `Result`; short or oversized input is a
//!   `WireError`, never a panic.
//! - **Exactness**: a record decodes only if every byte of its body is consumed.

use uuid::Uuid;

use crate::cursor::Reader;
use crate::cursor::Writer;
use crate::error::Result;
use crate::error::WireError;
use crate::ids::InstanceId;
use crate::ids::NodeId;

/// Width of every fixed address field.
pub const ADDRESS_WIDTH: usize = 256;

/// Width of the command-type preamble.
pub const PREAMBLE_LEN: usize = 4;

/// The 4-byte tag at the start of every control frame.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    RoutingCommand = 1,
    RoutingCommandAck = 2,
    StatusRequest = 3,
    StatusResponse = 4,
}

impl CommandType {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::RoutingCommand),
            2 => Some(Self::RoutingCommandAck),
            3 => Some(Self::StatusRequest),
            4 => Some(Self::StatusResponse),
            _ => None,
        }
    }
}

/// Actions carried by the generic routing record.
///
/// The `*Address` actions act on network endpoints, the `*Node` actions on in-process
/// routes named by the record's 128-bit identifier.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingAction {
    BindAddress = 1,
    UnbindAddress = 2,
    ConnectAddress = 3,
    DisconnectAddress = 4,
    BindNode = 5,
    UnbindNode = 6,
    ConnectNode = 7,
    DisconnectNode = 8,
}

impl RoutingAction {
    pub const ALL: [RoutingAction; 8] = [
        Self::BindAddress,
        Self::UnbindAddress,
        Self::ConnectAddress,
        Self::DisconnectAddress,
        Self::BindNode,
        Self::UnbindNode,
        Self::ConnectNode,
        Self::DisconnectNode,
    ];

    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::BindAddress),
            2 => Some(Self::UnbindAddress),
            3 => Some(Self::ConnectAddress),
            4 => Some(Self::DisconnectAddress),
            5 => Some(Self::BindNode),
            6 => Some(Self::UnbindNode),
            7 => Some(Self::ConnectNode),
            8 => Some(Self::DisconnectNode),
            _ => None,
        }
    }
}

/// Actions carried by the combined instance record.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceAction {
    ConnectInstance = 16,
    DisconnectInstance = 17,
}

impl InstanceAction {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            16 => Some(Self::ConnectInstance),
            17 => Some(Self::DisconnectInstance),
            _ => None,
        }
    }
}

/// Generic routing record: `[action:4][address:256][id:16]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingCommand {
    pub action: RoutingAction,
    pub address: String,
    pub id: Uuid,
}

impl RoutingCommand {
    pub const LEN: usize = 4 + ADDRESS_WIDTH + 16;

    pub fn new(action: RoutingAction, address: impl Into<String>, id: Uuid) -> Self {
        Self { action, address: address.into(), id }
    }

    fn write(&self, w: &mut Writer) -> Result<()> {
        w.u32(self.action as u32);
        w.fixed_str("address", &self.address, ADDRESS_WIDTH)?;
        w.uuid(&self.id);
        Ok(())
    }

    fn read(action: RoutingAction, r: &mut Reader<'_>) -> Result<Self> {
        let address = r.fixed_str("address", ADDRESS_WIDTH)?.to_string();
        let id = r.uuid()?;
        Ok(Self { action, address, id })
    }
}

/// Combined instance record: `[action:4][invoker address:256][control address:256]`.
///
/// Opens or closes both planes of one instance in a single command, so the data-plane
/// address can be correlated with the control address the instance was discovered by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConnectionCommand {
    pub action: InstanceAction,
    pub invoker_address: String,
    pub control_address: String,
}

impl InstanceConnectionCommand {
    pub const LEN: usize = 4 + ADDRESS_WIDTH + ADDRESS_WIDTH;

    pub fn connect(invoker_address: impl Into<String>, control_address: impl Into<String>) -> Self {
        Self {
            action: InstanceAction::ConnectInstance,
            invoker_address: invoker_address.into(),
            control_address: control_address.into(),
        }
    }

    pub fn disconnect(invoker_address: impl Into<String>, control_address: impl Into<String>) -> Self {
        Self {
            action: InstanceAction::DisconnectInstance,
            invoker_address: invoker_address.into(),
            control_address: control_address.into(),
        }
    }

    fn write(&self, w: &mut Writer) -> Result<()> {
        w.u32(self.action as u32);
        w.fixed_str("invoker_address", &self.invoker_address, ADDRESS_WIDTH)?;
        w.fixed_str("control_address", &self.control_address, ADDRESS_WIDTH)?;
        Ok(())
    }

    fn read(action: InstanceAction, r: &mut Reader<'_>) -> Result<Self> {
        let invoker_address = r.fixed_str("invoker_address", ADDRESS_WIDTH)?.to_string();
        let control_address = r.fixed_str("control_address", ADDRESS_WIDTH)?.to_string();
        Ok(Self { action, invoker_address, control_address })
    }
}

/// Body of a `ROUTING_COMMAND` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingBody {
    Route(RoutingCommand),
    Instance(InstanceConnectionCommand),
}

impl RoutingBody {
    /// The raw action code, shared by both layouts.
    pub fn action_code(&self) -> u32 {
        match self {
            Self::Route(cmd) => cmd.action as u32,
            Self::Instance(cmd) => cmd.action as u32,
        }
    }

    /// The identifier echoed back in the ack.
    pub fn id(&self) -> Uuid {
        match self {
            Self::Route(cmd) => cmd.id,
            Self::Instance(_) => Uuid::nil(),
        }
    }

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        let code = r.u32()?;
        if let Some(action) = RoutingAction::from_u32(code) {
            return Ok(Self::Route(RoutingCommand::read(action, r)?));
        }
        if let Some(action) = InstanceAction::from_u32(code) {
            return Ok(Self::Instance(InstanceConnectionCommand::read(action, r)?));
        }
        Err(WireError::UnknownAction(code))
    }
}

/// Outcome of a routing command.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Ok = 0,
    NoSuchRoute = 1,
    ProtocolError = 2,
    SocketError = 3,
}

impl ResponseCode {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Ok),
            1 => Some(Self::NoSuchRoute),
            2 => Some(Self::ProtocolError),
            3 => Some(Self::SocketError),
            _ => None,
        }
    }
}

/// Ack record: `[action:4][id:16][code:4]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingCommandAck {
    /// Raw action code of the acknowledged command.
    pub action: u32,
    pub id: Uuid,
    pub code: ResponseCode,
}

impl RoutingCommandAck {
    pub const LEN: usize = 4 + 16 + 4;

    pub fn for_command(body: &RoutingBody, code: ResponseCode) -> Self {
        Self { action: body.action_code(), id: body.id(), code }
    }

    fn write(&self, w: &mut Writer) {
        w.u32(self.action);
        w.uuid(&self.id);
        w.u32(self.code as u32);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        let action = r.u32()?;
        let id = r.uuid()?;
        let raw = r.u32()?;
        let code = ResponseCode::from_u32(raw).ok_or(WireError::UnknownResponseCode(raw))?;
        Ok(Self { action, id, code })
    }
}

/// Status request record: `[correlation:16]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRequest {
    pub correlation: Uuid,
}

impl StatusRequest {
    pub const LEN: usize = 16;

    pub fn new(correlation: Uuid) -> Self {
        Self { correlation }
    }
}

/// Status response record.
///
/// `[correlation:16][instance:16][invoker address:256][load:8][count:4][nodes:32*count]`
#[derive(Debug, Clone, PartialEq)]
pub struct StatusResponse {
    pub correlation: Uuid,
    pub instance_id: InstanceId,
    pub invoker_address: String,
    pub load: f64,
    pub nodes: Vec<NodeId>,
}

impl StatusResponse {
    pub const HEADER_LEN: usize = 16 + 16 + ADDRESS_WIDTH + 8 + 4;

    fn write(&self, w: &mut Writer) -> Result<()> {
        w.uuid(&self.correlation);
        w.uuid(&self.instance_id.0);
        w.fixed_str("invoker_address", &self.invoker_address, ADDRESS_WIDTH)?;
        w.f64(self.load);
        let count = u32::try_from(self.nodes.len()).map_err(|_| WireError::FieldTooLong {
            field: "nodes",
            len: self.nodes.len(),
            max: u32::MAX as usize,
        })?;
        w.u32(count);
        for node in &self.nodes {
            node.write(w);
        }
        Ok(())
    }

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        let correlation = r.uuid()?;
        let instance_id = InstanceId(r.uuid()?);
        let invoker_address = r.fixed_str("invoker_address", ADDRESS_WIDTH)?.to_string();
        let load = r.f64()?;
        let count = r.u32()? as usize;

        // Bound the allocation by what the buffer can actually hold.
        let needed = count.saturating_mul(NodeId::PACKED_LEN);
        if needed > r.remaining() {
            return Err(WireError::Truncated { offset: r.pos(), needed, available: r.remaining() });
        }

        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            nodes.push(NodeId::read(r)?);
        }

        Ok(Self { correlation, instance_id, invoker_address, load, nodes })
    }
}

/// Any frame on the control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    Routing(RoutingBody),
    Ack(RoutingCommandAck),
    StatusRequest(StatusRequest),
    StatusResponse(StatusResponse),
}

impl ControlFrame {
    pub fn command_type(&self) -> CommandType {
        match self {
            Self::Routing(_) => CommandType::RoutingCommand,
            Self::Ack(_) => CommandType::RoutingCommandAck,
            Self::StatusRequest(_) => CommandType::StatusRequest,
            Self::StatusResponse(_) => CommandType::StatusResponse,
        }
    }

    /// Encodes just the body, without the preamble.
    pub fn encode_body(&self) -> Result<Vec<u8>> {
        let mut w = Writer::with_capacity(InstanceConnectionCommand::LEN);
        match self {
            Self::Routing(RoutingBody::Route(cmd)) => cmd.write(&mut w)?,
            Self::Routing(RoutingBody::Instance(cmd)) => cmd.write(&mut w)?,
            Self::Ack(ack) => ack.write(&mut w),
            Self::StatusRequest(req) => w.uuid(&req.correlation),
            Self::StatusResponse(resp) => resp.write(&mut w)?,
        }
        Ok(w.into_bytes())
    }

    /// Encodes preamble and body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(with_preamble(self.command_type(), &self.encode_body()?))
    }

    /// Decodes a body whose preamble was already read.
    pub fn decode_body(command_type: CommandType, body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let frame = match command_type {
            CommandType::RoutingCommand => Self::Routing(RoutingBody::read(&mut r)?),
            CommandType::RoutingCommandAck => Self::Ack(RoutingCommandAck::read(&mut r)?),
            CommandType::StatusRequest => Self::StatusRequest(StatusRequest::new(r.uuid()?)),
            CommandType::StatusResponse => Self::StatusResponse(StatusResponse::read(&mut r)?),
        };
        r.finish()?;
        Ok(frame)
    }

    /// Decodes a full frame, preamble included.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (command_type, body) = split_preamble(bytes)?;
        Self::decode_body(command_type, body)
    }
}

/// Prepends the 4-byte command type to an encoded body.
pub fn with_preamble(command_type: CommandType, body: &[u8]) -> Vec<u8> {
    let mut w = Writer::with_capacity(PREAMBLE_LEN + body.len());
    w.u32(command_type as u32);
    w.raw(body);
    w.into_bytes()
}

/// Reads the command type and returns it with the remaining body.
pub fn split_preamble(bytes: &[u8]) -> Result<(CommandType, &[u8])> {
    let mut r = Reader::new(bytes);
    let raw = r.u32()?;
    let command_type = CommandType::from_u32(raw).ok_or(WireError::UnknownCommandType(raw))?;
    Ok((command_type, r.rest()))
}
