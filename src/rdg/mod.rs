//! RDG (MS-TSGU) protocol types: packet framing, session state, and the
//! UTF-16LE string codec used throughout tunnel payloads.
//!
//! Reference: [MS-TSGU] — Terminal Services Gateway Server Protocol

pub mod packet;
pub mod registry;
pub mod server;
pub mod transport;

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::GatewayError;
use self::transport::Transport;

/// RDG packet types.
/// MS-TSGU Section 2.2.5.3.3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PacketType {
    HandshakeRequest = 0x01,
    HandshakeResponse = 0x02,
    ExtendedAuth = 0x03,
    TunnelCreate = 0x04,
    TunnelResponse = 0x05,
    TunnelAuth = 0x06,
    TunnelAuthResponse = 0x07,
    ChannelCreate = 0x08,
    ChannelResponse = 0x09,
    Data = 0x0A,
    Keepalive = 0x0D,
    CloseChannel = 0x10,
}

impl PacketType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x01 => Some(Self::HandshakeRequest),
            0x02 => Some(Self::HandshakeResponse),
            0x03 => Some(Self::ExtendedAuth),
            0x04 => Some(Self::TunnelCreate),
            0x05 => Some(Self::TunnelResponse),
            0x06 => Some(Self::TunnelAuth),
            0x07 => Some(Self::TunnelAuthResponse),
            0x08 => Some(Self::ChannelCreate),
            0x09 => Some(Self::ChannelResponse),
            0x0A => Some(Self::Data),
            0x0D => Some(Self::Keepalive),
            0x10 => Some(Self::CloseChannel),
            _ => None,
        }
    }
}

// Handshake response extended auth capability bits.
// MS-TSGU 2.2.5.3.5
pub const HTTP_EXTENDED_AUTH_SC: u16 = 0x1;
pub const HTTP_EXTENDED_AUTH_PAA: u16 = 0x2;

// Tunnel create request fields-present bits.
pub const HTTP_TUNNEL_PACKET_FIELD_PAA_COOKIE: u16 = 0x1;

// Tunnel response fields-present bits and capability flags.
pub const HTTP_TUNNEL_RESPONSE_FIELD_TUNNEL_ID: u16 = 0x1;
pub const HTTP_TUNNEL_RESPONSE_FIELD_CAPS: u16 = 0x2;
pub const HTTP_CAPABILITY_IDLE_TIMEOUT: u32 = 0x2;

// Tunnel auth response fields-present bits.
pub const HTTP_TUNNEL_AUTH_RESPONSE_FIELD_REDIR_FLAGS: u16 = 0x1;
pub const HTTP_TUNNEL_AUTH_RESPONSE_FIELD_IDLE_TIMEOUT: u16 = 0x2;

// Channel response fields-present bits.
pub const HTTP_CHANNEL_RESPONSE_FIELD_CHANNELID: u16 = 0x1;

// Device redirection flags carried in the tunnel auth response.
pub const HTTP_TUNNEL_REDIR_ENABLE_ALL: u32 = 0x8000_0000;
pub const HTTP_TUNNEL_REDIR_DISABLE_ALL: u32 = 0x4000_0000;
pub const HTTP_TUNNEL_REDIR_DISABLE_DRIVE: u32 = 0x1;
pub const HTTP_TUNNEL_REDIR_DISABLE_PRINTER: u32 = 0x2;
pub const HTTP_TUNNEL_REDIR_DISABLE_PORT: u32 = 0x4;
pub const HTTP_TUNNEL_REDIR_DISABLE_CLIPBOARD: u32 = 0x8;
pub const HTTP_TUNNEL_REDIR_DISABLE_PNP: u32 = 0x10;

/// Outbound transport handle shared between the state machine and the
/// backend forwarder. A single `write_packet` holds the lock for the whole
/// write, so concurrent writers never interleave bytes.
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// One logical RDG connection, either a single duplex WebSocket or a pair
/// of hijacked legacy half-streams joined on `Rdg-Connection-Id`.
pub struct SessionInfo {
    /// The connection id (Rdg-Connection-Id) as reported by the client
    pub conn_id: String,
    /// Client IP from the X-Forwarded-For front, falling back to peer address
    pub client_ip: String,
    /// Inbound transport; for WebSocket sessions this is the read half of
    /// the same stream `transport_out` writes to
    pub transport_in: Box<dyn Transport>,
    pub transport_out: SharedTransport,
}

/// Encode a Rust string as UTF-16LE bytes.
pub fn encode_utf16(s: &str) -> Vec<u8> {
    s.encode_utf16()
        .flat_map(|u| u.to_le_bytes())
        .collect()
}

/// Decode a UTF-16LE byte slice into a Rust string.
///
/// Odd-length input is a decode error. Trailing NUL code units are
/// preserved; callers that want C-string semantics trim them.
pub fn decode_utf16(data: &[u8]) -> Result<String, GatewayError> {
    if data.len() % 2 != 0 {
        return Err(GatewayError::decode("invalid UTF-16LE length"));
    }
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&units))
}
