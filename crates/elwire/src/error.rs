//! # Error Definitions
//!
//! Every decoding failure in this crate is a protocol failure: the bytes did not
//! match the layout the receiver expected.

/// Malformed or unrepresentable wire data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// The buffer ended before the field at `offset` could be read.
    #[error("frame truncated: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated { offset: usize, needed: usize, available: usize },
    /// A command-type preamble outside the known set.
    #[error("unknown command type: {0:#010x}")]
    UnknownCommandType(u32),
    /// A well-formed frame that the receiver does not accept in its position.
    #[error("unexpected {0:?} frame")]
    UnexpectedFrame(crate::command::CommandType),
    /// A routing action code outside the known set.
    #[error("unknown routing action: {0}")]
    UnknownAction(u32),
    /// An ack response code outside the known set.
    #[error("unknown response code: {0}")]
    UnknownResponseCode(u32),
    /// A data frame tag outside the known set.
    #[error("unknown data frame tag: {0:#04x}")]
    UnknownFrameTag(u8),
    /// A tag byte in an invocation field that does not name a known value.
    #[error("unknown {field} tag: {tag}")]
    UnknownTag { field: &'static str, tag: u8 },
    /// A string field was not valid UTF-8.
    #[error("invalid utf-8 in field {0}")]
    InvalidUtf8(&'static str),
    /// A value does not fit in its fixed-width field.
    #[error("field {field} too long: {len} bytes exceeds {max}")]
    FieldTooLong { field: &'static str, len: usize, max: usize },
    /// Bytes were left over after a fixed-layout record was fully read.
    #[error("trailing bytes after record: {0}")]
    TrailingBytes(usize),
}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, WireError>;
