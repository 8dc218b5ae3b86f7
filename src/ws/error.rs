#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

/// WebSocket error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// Error parsing a WebSocket message
    MessageParse(serde_json::Error),
    /// WebSocket connection was closed
    ConnectionClosed,
    /// Operation timed out
    Timeout {
        /// What was being waited on
        operation: &'static str,
    },
    /// A packet was submitted while no socket was connected; it has been dropped
    NotConnected,
    /// Packets accepted just before a connection failed were never written
    Discarded {
        /// How many packets were dropped
        packets: usize,
    },
    /// The HTTP proxy refused or failed to establish a tunnel
    Proxy(String),
    /// A configured handshake header has an invalid name or value
    InvalidHeader(String),
    /// TLS could not be configured for the connection
    Tls(rustls::Error),
    /// A handler callback panicked
    HandlerPanicked {
        /// Callback that panicked
        callback: &'static str,
        /// Panic payload, when it was a string
        message: String,
    },
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::MessageParse(e) => write!(f, "Failed to parse WebSocket message: {e}"),
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
            Self::Timeout { operation } => write!(f, "WebSocket {operation} timed out"),
            Self::NotConnected => write!(f, "WebSocket is not connected, packet dropped"),
            Self::Discarded { packets } => {
                write!(f, "{packets} queued packet(s) discarded, the connection was lost")
            }
            Self::Proxy(reason) => write!(f, "Proxy tunnel failed: {reason}"),
            Self::InvalidHeader(reason) => write!(f, "Invalid handshake header: {reason}"),
            Self::Tls(e) => write!(f, "TLS configuration error: {e}"),
            Self::HandlerPanicked { callback, message } => {
                write!(f, "Handler panicked in {callback}: {message}")
            }
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::MessageParse(e) => Some(e),
            Self::Tls(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        let kind = match e {
            WsError::HandlerPanicked { .. } => crate::error::Kind::Callback,
            _ => crate::error::Kind::WebSocket,
        };
        crate::error::Error::with_source(kind, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, WsError::Connection(e))
    }
}
