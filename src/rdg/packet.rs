//! RDG packet framing.
//!
//! Every packet starts with an 8-byte header: type (u16 LE), reserved
//! (u16), total size including the header (u32 LE). Transports deliver
//! chunks that may split a packet anywhere, including inside the header,
//! so `read_message` reassembles before parsing.
//! MS-TSGU Section 2.2.10.9

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::GatewayError;
use crate::rdg::transport::Transport;

/// Size of the packet header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Maximum packet size we accept. The client never legitimately sends
/// more than a DATA packet wrapping a 32 KiB chunk.
pub const MAX_PACKET_SIZE: u32 = 64 * 1024;

/// Wrap a packet body in the framing header.
pub fn create_packet(packet_type: u16, data: &[u8]) -> Bytes {
    let size = HEADER_SIZE + data.len();
    let mut buf = BytesMut::with_capacity(size);
    buf.put_u16_le(packet_type);
    buf.put_u16_le(0); // reserved
    buf.put_u32_le(size as u32);
    buf.put_slice(data);
    buf.freeze()
}

/// Result of attempting to parse an accumulated prefix.
enum Frame {
    /// A full packet is available: type, on-wire size, body extent.
    Complete { packet_type: u16, size: u32, body_end: usize },
    /// More bytes are needed before the packet can be parsed.
    Partial,
}

/// Parse a packet header and verify its reported size against the bytes
/// accumulated so far. A size below the header length or above the
/// protocol maximum is a hard error, not a fragment.
fn parse_frame(data: &[u8]) -> Result<Frame, GatewayError> {
    if data.len() < HEADER_SIZE {
        return Ok(Frame::Partial);
    }
    let packet_type = u16::from_le_bytes([data[0], data[1]]);
    let size = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if (size as usize) < HEADER_SIZE {
        return Err(GatewayError::decode(format!(
            "packet size {} below header size",
            size
        )));
    }
    if size > MAX_PACKET_SIZE {
        return Err(GatewayError::decode(format!(
            "packet size {} exceeds maximum {}",
            size, MAX_PACKET_SIZE
        )));
    }
    if data.len() < size as usize {
        return Ok(Frame::Partial);
    }
    Ok(Frame::Complete { packet_type, size, body_end: size as usize })
}

/// Read and defragment one packet from a transport.
///
/// `carry` persists between calls on the same stream: it accumulates
/// fragments until a full packet is present, and it retains any bytes of
/// a following packet that arrived in the same chunk.
pub async fn read_message(
    transport: &mut (dyn Transport + '_),
    carry: &mut BytesMut,
) -> Result<(u16, u32, Bytes), GatewayError> {
    loop {
        if let Frame::Complete { packet_type, size, body_end } = parse_frame(carry)? {
            let packet = carry.split_to(body_end).freeze();
            return Ok((packet_type, size, packet.slice(HEADER_SIZE..)));
        }

        let chunk = transport.read_packet().await?;

        // Common case: a whole packet in a single chunk, no copy.
        if carry.is_empty() {
            match parse_frame(&chunk)? {
                Frame::Complete { packet_type, size, body_end } => {
                    if body_end < chunk.len() {
                        carry.extend_from_slice(&chunk[body_end..]);
                    }
                    return Ok((
                        packet_type,
                        size,
                        chunk.slice(HEADER_SIZE..body_end),
                    ));
                }
                Frame::Partial => carry.extend_from_slice(&chunk),
            }
        } else {
            carry.extend_from_slice(&chunk);
        }
    }
}
