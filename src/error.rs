//! Error types for the gateway.
//!
//! Authentication has its own result type because a challenge is a normal
//! control-flow outcome of the NTLM handshake, not a failure. Everything in
//! `GatewayError` is fatal at session granularity.

use std::fmt;
use std::io;

/// Outcome of an authentication attempt that did not produce a user.
#[derive(Debug)]
pub enum AuthError {
    /// No `Authorization` header was present.
    MissingCredentials,
    /// Basic credentials did not match any configured user.
    InvalidCredentials,
    /// The NTLM exchange is in flight; the carried value is a complete
    /// `WWW-Authenticate` header value (e.g. `NTLM <base64>`).
    Challenge(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingCredentials => write!(f, "missing credentials"),
            Self::InvalidCredentials => write!(f, "invalid username or password"),
            Self::Challenge(_) => write!(f, "authentication challenge"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Top-level session error type.
#[derive(Debug)]
pub enum GatewayError {
    /// Malformed packet, NTLM message, or UTF-16 payload.
    Decode(String),
    /// A packet arrived in a state that disallows it.
    WrongState {
        packet: u16,
        state: &'static str,
    },
    /// TCP connect to the RDP target failed or timed out.
    BackendDial(io::Error),
    /// Read/write error on the established backend socket.
    BackendIo(io::Error),
    /// Read/write error on the client transport.
    TransportIo(io::Error),
    /// A verifier hook rejected the session.
    PolicyDeny(String),
    /// Connection closed by peer.
    ConnectionClosed,
}

impl GatewayError {
    pub fn decode(msg: impl Into<String>) -> Self {
        GatewayError::Decode(msg.into())
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(msg) => write!(f, "decode error: {}", msg),
            Self::WrongState { packet, state } => {
                write!(f, "packet type 0x{:x} not allowed in state {}", packet, state)
            }
            Self::BackendDial(e) => write!(f, "backend dial failed: {}", e),
            Self::BackendIo(e) => write!(f, "backend I/O error: {}", e),
            Self::TransportIo(e) => write!(f, "transport I/O error: {}", e),
            Self::PolicyDeny(msg) => write!(f, "denied by policy: {}", msg),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BackendDial(e) | Self::BackendIo(e) | Self::TransportIo(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for GatewayError {
    fn from(e: io::Error) -> Self {
        GatewayError::TransportIo(e)
    }
}
