//! Typed result codes
//!
//! Every recoverable outcome crossing the client request surface or the
//! hardware abstraction boundary is reported as a [`Status`].

use std::error::Error;
use std::fmt;

/// Recoverable result of a request or a hardware call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// An argument named an unknown resource or was out of range
    InvalidArgs,
    /// The resource is not ready yet; the caller may retry later
    ShouldWait,
    /// An allocation failed
    NoMemory,
    /// A fixed capacity limit was reached
    NoResources,
    /// The identifier is already in use
    AlreadyExists,
    /// The connection slot for this client kind is already taken
    AlreadyBound,
    /// The named object does not exist
    NotFound,
    /// The hardware does not support the operation
    NotSupported,
    /// The caller is not allowed to perform the operation right now
    AccessDenied,
    /// The operation is not valid in the current state
    BadState,
    /// The session was torn down
    PeerClosed,
    /// A hardware or driver fault
    Internal(String),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::InvalidArgs => write!(f, "invalid arguments"),
            Status::ShouldWait => write!(f, "resource not ready, retry later"),
            Status::NoMemory => write!(f, "out of memory"),
            Status::NoResources => write!(f, "resource limit reached"),
            Status::AlreadyExists => write!(f, "identifier already in use"),
            Status::AlreadyBound => write!(f, "a client of this kind is already connected"),
            Status::NotFound => write!(f, "not found"),
            Status::NotSupported => write!(f, "operation not supported by the display engine"),
            Status::AccessDenied => write!(f, "access denied"),
            Status::BadState => write!(f, "operation not valid in the current state"),
            Status::PeerClosed => write!(f, "session closed"),
            Status::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl Error for Status {}

pub type Result<T> = std::result::Result<T, Status>;
