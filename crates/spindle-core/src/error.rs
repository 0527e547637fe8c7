//! Error types for the transport.
//!
//! Capacity exhaustion (full ring, full allocator) is deliberately *not*
//! represented here: it is backpressure, signalled by
//! `SendOutcome::Backpressure` and `None` returns, and callers queue and
//! retry.

use core::fmt;

use crate::codec::Payload;

/// Fixed reason delivered to every in-flight call when the pool shuts down.
pub const CLOSED_REASON: &str = "pool closed";

/// Stable codes for encoding failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncodeCode {
    /// Symbol key not present in the process-wide registry.
    Symbol,
    /// JSON serialization failed.
    Json,
    /// Binary (native) serialization failed.
    Native,
}

impl EncodeCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Symbol => "SPN_ENC_SYMBOL",
            Self::Json => "SPN_ENC_JSON",
            Self::Native => "SPN_ENC_NATIVE",
        }
    }
}

/// A payload could not be encoded into shared memory.
///
/// Delivered as an asynchronous rejection of the task's future, at most once
/// per task; never a synchronous panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeError {
    pub code: EncodeCode,
    pub detail: String,
}

impl EncodeError {
    pub fn new(code: EncodeCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.code.as_str())
        } else {
            write!(f, "{}: {}", self.code.as_str(), self.detail)
        }
    }
}

impl std::error::Error for EncodeError {}

/// A header or payload read back from shared memory was malformed.
///
/// Under the ring protocol this indicates a contract violation on the other
/// side, not a recoverable condition; the task carrying it is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnknownTag(u32),
    PayloadOutOfBounds { start: u32, len: u32, max: u32 },
    /// Byte length does not divide into the kind's element width.
    Truncated { len: usize, elem: usize },
    Utf8,
    Json(String),
    Native(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownTag(tag) => write!(f, "unknown type tag {tag}"),
            Self::PayloadOutOfBounds { start, len, max } => {
                write!(f, "payload [{start}..{start}+{len}] exceeds capacity {max}")
            }
            Self::Truncated { len, elem } => {
                write!(f, "{len} payload bytes do not divide into {elem}-byte elements")
            }
            Self::Utf8 => write!(f, "payload is not valid UTF-8"),
            Self::Json(detail) => write!(f, "JSON parse failed: {detail}"),
            Self::Native(detail) => write!(f, "native deserialize failed: {detail}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Why a call future was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// The task function rejected; the thrown value is forwarded verbatim.
    Value(Payload),
    /// The arguments could not be encoded.
    Encode(EncodeError),
    /// A malformed frame came back.
    Decode(DecodeError),
    /// The pool was shut down with the call in flight.
    Closed,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(payload) => write!(f, "task rejected: {payload:?}"),
            Self::Encode(e) => write!(f, "{e}"),
            Self::Decode(e) => write!(f, "{e}"),
            Self::Closed => write!(f, "{CLOSED_REASON}"),
        }
    }
}

impl std::error::Error for Rejection {}

impl From<EncodeError> for Rejection {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

impl From<DecodeError> for Rejection {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

/// Fatal contract violations at worker startup. These abort the worker and
/// fail pool construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapError {
    /// A required shared segment handle was not provided or is undersized.
    MissingSegment(&'static str),
    /// The header segment cannot hold the fixed slot layout.
    HeaderSegmentTooSmall { have: usize, need: usize },
    /// The worker resolved no task functions.
    NoTasks,
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSegment(which) => write!(f, "worker missing {which} segment"),
            Self::HeaderSegmentTooSmall { have, need } => {
                write!(f, "header segment too small: {have} bytes, need {need}")
            }
            Self::NoTasks => write!(f, "no task functions were found"),
        }
    }
}

impl std::error::Error for BootstrapError {}
