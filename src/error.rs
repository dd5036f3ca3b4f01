use thiserror::Error;

use crate::statistics::lock::LockError;

/// Errors raised to the caller of a fleet mutation.
///
/// These are configuration and validation failures. Transient daemon failures
/// never surface here; they degrade to an "unknown" or "not accessible" state.
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Port {port} is outside the configured range {begin}-{end}")]
    PortOutOfRange { port: u16, begin: u16, end: u16 },

    #[error("Node {node} has no address for the {interface} interface")]
    MissingInterfaceIp { node: String, interface: String },

    #[error("Address required: {0}")]
    AddressRequired(String),

    #[error("A local server can only be enabled for the python edition")]
    ServerEditionMismatch,

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Lock(#[from] LockError),
}
