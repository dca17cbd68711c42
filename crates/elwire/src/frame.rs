//! # Data-Plane Frames
//!
//! Frames exchanged between a remote invoker and the instance hosting its node.
//!
//! ## Format
//!
//! - **Envelope**: `[route id:16][frame]`, added by whoever forwards frames across a
//!   multiplexed link. The route id names the destination node.
//! - **Frame**: `[tag:1][seq:8]` followed by the tag's fields.
//!
//! A call may be answered by several `Result` frames, one per part. Part 0 is the
//! primary result, higher parts feed result-handler parameters.

use uuid::Uuid;

use crate::cursor::Reader;
use crate::cursor::Writer;
use crate::error::Result;
use crate::error::WireError;
use crate::invocation::Invocation;

/// Largest frame accepted from a stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Length of the route envelope header.
pub const ENVELOPE_LEN: usize = 16;

/// Where an error originated.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The remote method itself failed.
    Remote = 1,
    /// The destination route is not served by the receiving instance.
    NoSuchRoute = 2,
    /// The receiving side could not parse the call.
    Protocol = 3,
    /// Serialization of arguments or results failed.
    Serialization = 4,
}

impl ErrorKind {
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Remote),
            2 => Some(Self::NoSuchRoute),
            3 => Some(Self::Protocol),
            4 => Some(Self::Serialization),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataFrame {
    Call { seq: u64, invocation: Invocation },
    Result { seq: u64, part: u32, payload: Vec<u8> },
    Error { seq: u64, part: u32, kind: ErrorKind, message: String },
}

const TAG_CALL: u8 = 0x01;
const TAG_RESULT: u8 = 0x02;
const TAG_ERROR: u8 = 0x03;

impl DataFrame {
    pub fn seq(&self) -> u64 {
        match self {
            Self::Call { seq, .. } | Self::Result { seq, .. } | Self::Error { seq, .. } => *seq,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::with_capacity(64);
        match self {
            Self::Call { seq, invocation } => {
                w.u8(TAG_CALL);
                w.u64(*seq);
                invocation.write(&mut w)?;
            }
            Self::Result { seq, part, payload } => {
                w.u8(TAG_RESULT);
                w.u64(*seq);
                w.u32(*part);
                w.blob("payload", payload)?;
            }
            Self::Error { seq, part, kind, message } => {
                w.u8(TAG_ERROR);
                w.u64(*seq);
                w.u32(*part);
                w.u8(*kind as u8);
                w.str("message", message)?;
            }
        }
        Ok(w.into_bytes())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let frame = match r.u8()? {
            TAG_CALL => {
                let seq = r.u64()?;
                let invocation = Invocation::read(&mut r)?;
                Self::Call { seq, invocation }
            }
            TAG_RESULT => {
                let seq = r.u64()?;
                let part = r.u32()?;
                let payload = r.blob()?.to_vec();
                Self::Result { seq, part, payload }
            }
            TAG_ERROR => {
                let seq = r.u64()?;
                let part = r.u32()?;
                let tag = r.u8()?;
                let kind = ErrorKind::from_u8(tag).ok_or(WireError::UnknownTag { field: "kind", tag })?;
                let message = r.str("message")?.to_string();
                Self::Error { seq, part, kind, message }
            }
            tag => return Err(WireError::UnknownFrameTag(tag)),
        };
        r.finish()?;
        Ok(frame)
    }
}

/// Prefixes a frame with its destination route.
pub fn wrap_envelope(route: &Uuid, frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENVELOPE_LEN + frame.len());
    out.extend_from_slice(route.as_bytes());
    out.extend_from_slice(frame);
    out
}

/// Splits an enveloped frame into its route and the frame bytes.
pub fn open_envelope(bytes: &[u8]) -> Result<(Uuid, &[u8])> {
    let mut r = Reader::new(bytes);
    let route = r.uuid()?;
    Ok((route, r.rest()))
}
