use std::{io, sync::Arc};

use lunar_literal::LiteralError;
use thiserror::Error;

use crate::session::SessionState;

pub type Result<T, E = DebugError> = std::result::Result<T, E>;

/// Coarse classification of a [`DebugError`].
///
/// `Network` failures are fatal to the connection. `Protocol` failures are
/// local to the operation unless they were raised while decoding the stream.
/// `Debuggee` failures were reported by the game itself; the session stays
/// usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Protocol,
    Debuggee,
}

#[derive(Debug, Clone, Error)]
pub enum DebugError {
    #[error("i/o error talking to the debuggee: {0}")]
    Io(Arc<io::Error>),
    #[error("timed out waiting for the debuggee")]
    Timeout,
    #[error("connection to the debuggee closed")]
    ConnectionClosed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid state: cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("protocol error: command channel closed")]
    ChannelClosed,
    #[error(transparent)]
    Literal(#[from] LiteralError),
    #[error("debuggee error ({status}): {message}")]
    Debuggee { status: u16, message: String },
}

impl DebugError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DebugError::Io(_) | DebugError::Timeout | DebugError::ConnectionClosed => {
                ErrorKind::Network
            }
            DebugError::Protocol(_)
            | DebugError::InvalidState { .. }
            | DebugError::ChannelClosed
            | DebugError::Literal(_) => ErrorKind::Protocol,
            DebugError::Debuggee { .. } => ErrorKind::Debuggee,
        }
    }

    /// The debuggee's own error text, when it reported one.
    pub fn debuggee_message(&self) -> Option<&str> {
        match self {
            DebugError::Debuggee { message, .. } => Some(message),
            _ => None,
        }
    }
}

impl From<io::Error> for DebugError {
    fn from(err: io::Error) -> Self {
        DebugError::Io(Arc::new(err))
    }
}
