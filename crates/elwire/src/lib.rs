//! # Elwire
//!
//! Wire formats for the cluster: fixed-layout control records, data-plane frames, and
//! the invocation payload.
//!
//! ## Philosophy
//!
//! - **Explicit Layout**: every record has a documented offset and width per field, packed
//!   and unpacked by hand. No reflection, no schema compiler.
//! - **Bounded**: decoders are bounds-checked views that never allocate more than the
//!   buffer can justify.
//! - **No I/O**: this crate moves bytes in and out of values. Sockets live elsewhere.

pub mod command;
pub mod cursor;
pub mod error;
pub mod frame;
pub mod ids;
pub mod invocation;

pub use command::ADDRESS_WIDTH;
pub use command::CommandType;
pub use command::ControlFrame;
pub use command::InstanceAction;
pub use command::InstanceConnectionCommand;
pub use command::ResponseCode;
pub use command::RoutingAction;
pub use command::RoutingBody;
pub use command::RoutingCommand;
pub use command::RoutingCommandAck;
pub use command::StatusRequest;
pub use command::StatusResponse;
pub use error::Result;
pub use error::WireError;
pub use frame::DataFrame;
pub use frame::ErrorKind;
pub use ids::ApplicationId;
pub use ids::InstanceId;
pub use ids::NodeId;
pub use invocation::DispatchType;
pub use invocation::Invocation;

pub use uuid::Uuid;
