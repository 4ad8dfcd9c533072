//! Server startup errors.

use std::fmt;
use std::io;

/// Errors raised while bringing a server up.
///
/// Per-connection failures never surface here; they close the connection
/// and are logged.
#[derive(Debug)]
pub enum ServerError {
    /// The listen address could not be parsed.
    Address(String),
    /// Binding or listening on the address failed.
    Bind(String, io::Error),
    /// Setting up a network thread (poll, waker, listener clone) failed.
    Setup(io::Error),
    /// A thread could not be spawned.
    Spawn(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Address(addr) => write!(f, "Invalid listen address '{addr}'"),
            ServerError::Bind(addr, e) => write!(f, "Failed to bind '{addr}': {e}"),
            ServerError::Setup(e) => write!(f, "Failed to set up network thread: {e}"),
            ServerError::Spawn(e) => write!(f, "Failed to spawn thread: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Address(_) => None,
            ServerError::Bind(_, e) | ServerError::Setup(e) | ServerError::Spawn(e) => Some(e),
        }
    }
}
