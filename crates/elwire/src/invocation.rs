//! The invocation payload: what to call, on what, with which arguments.

use crate::cursor::Reader;
use crate::cursor::Writer;
use crate::error::Result;
use crate::error::WireError;

/// Calling convention the caller used; carried so the hosting side can log and
/// account for it.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchType {
    /// Caller waits for the primary result.
    Synchronous = 1,
    /// Result and error consumers are invoked; the call returns nothing.
    Callback = 2,
    /// Caller receives a cancellable pending result.
    Future = 3,
    /// Caller receives a composable pending result.
    Staged = 4,
    /// Picked per method from its return shape.
    Hybrid = 5,
}

impl DispatchType {
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Synchronous),
            2 => Some(Self::Callback),
            3 => Some(Self::Future),
            4 => Some(Self::Staged),
            5 => Some(Self::Hybrid),
            _ => None,
        }
    }
}

/// One remote method call.
///
/// Arguments are opaque payloads; this layer never interprets them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub type_name: String,
    pub name: Option<String>,
    pub method: String,
    pub parameters: Vec<String>,
    pub arguments: Vec<Vec<u8>>,
    pub dispatch: DispatchType,
    pub routing: String,
}

impl Invocation {
    pub fn new(type_name: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            name: None,
            method: method.into(),
            parameters: Vec::new(),
            arguments: Vec::new(),
            dispatch: DispatchType::Synchronous,
            routing: String::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchType) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_routing(mut self, routing: impl Into<String>) -> Self {
        self.routing = routing.into();
        self
    }

    pub fn with_argument(mut self, parameter: impl Into<String>, argument: Vec<u8>) -> Self {
        self.parameters.push(parameter.into());
        self.arguments.push(argument);
        self
    }

    pub(crate) fn write(&self, w: &mut Writer) -> Result<()> {
        w.str("type_name", &self.type_name)?;
        match &self.name {
            Some(name) => {
                w.u8(1);
                w.str("name", name)?;
            }
            None => w.u8(0),
        }
        w.str("method", &self.method)?;

        w.u32(count("parameters", self.parameters.len())?);
        for parameter in &self.parameters {
            w.str("parameters", parameter)?;
        }

        w.u32(count("arguments", self.arguments.len())?);
        for argument in &self.arguments {
            w.blob("arguments", argument)?;
        }

        w.u8(self.dispatch as u8);
        w.str("routing", &self.routing)?;
        Ok(())
    }

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self> {
        let type_name = r.str("type_name")?.to_string();
        let name = match r.u8()? {
            0 => None,
            1 => Some(r.str("name")?.to_string()),
            tag => return Err(WireError::UnknownTag { field: "name", tag }),
        };
        let method = r.str("method")?.to_string();

        // Each entry takes at least its 4-byte length, which bounds the counts.
        let n = bounded_count(r)?;
        let mut parameters = Vec::with_capacity(n);
        for _ in 0..n {
            parameters.push(r.str("parameters")?.to_string());
        }

        let n = bounded_count(r)?;
        let mut arguments = Vec::with_capacity(n);
        for _ in 0..n {
            arguments.push(r.blob()?.to_vec());
        }

        let tag = r.u8()?;
        let dispatch = DispatchType::from_u8(tag).ok_or(WireError::UnknownTag { field: "dispatch", tag })?;
        let routing = r.str("routing")?.to_string();

        Ok(Self { type_name, name, method, parameters, arguments, dispatch, routing })
    }
}

fn count(field: &'static str, len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| WireError::FieldTooLong { field, len, max: u32::MAX as usize })
}

fn bounded_count(r: &mut Reader<'_>) -> Result<usize> {
    let n = r.u32()? as usize;
    let needed = n.saturating_mul(4);
    if needed > r.remaining() {
        return Err(WireError::Truncated { offset: r.pos(), needed, available: r.remaining() });
    }
    Ok(n)
}
