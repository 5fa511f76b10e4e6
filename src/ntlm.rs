//! NTLMSSP message codec.
//!
//! Parses NEGOTIATE and AUTHENTICATE messages from `Authorization` headers
//! and builds the CHALLENGE message the gateway returns, including the
//! TargetInfo AV pair list. Tokens may arrive wrapped in a SPNEGO
//! `Negotiate` blob; the NTLMSSP payload is located by signature.
//!
//! References:
//! - [MS-NLMP] NT LAN Manager Authentication Protocol
//! - [MS-SPNG] SPNEGO Extension

use bytes::{BufMut, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::GatewayError;
use crate::rdg::{decode_utf16, encode_utf16};

/// NTLMSSP signature: `NTLMSSP\0`
pub const NTLMSSP_SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

pub const MESSAGE_TYPE_NEGOTIATE: u32 = 1;
pub const MESSAGE_TYPE_CHALLENGE: u32 = 2;
pub const MESSAGE_TYPE_AUTHENTICATE: u32 = 3;

// Negotiate flags. MS-NLMP 2.2.2.5
pub const NEGOTIATE_UNICODE: u32 = 1 << 0;
pub const NEGOTIATE_OEM: u32 = 1 << 1;
pub const REQUEST_TARGET: u32 = 1 << 2;
pub const NEGOTIATE_SIGN: u32 = 1 << 4;
pub const NEGOTIATE_SEAL: u32 = 1 << 5;
pub const NEGOTIATE_DATAGRAM: u32 = 1 << 6;
pub const NEGOTIATE_LM_KEY: u32 = 1 << 7;
pub const NEGOTIATE_NTLM: u32 = 1 << 9;
pub const NEGOTIATE_ALWAYS_SIGN: u32 = 1 << 15;
pub const TARGET_TYPE_DOMAIN: u32 = 1 << 16;
pub const TARGET_TYPE_SERVER: u32 = 1 << 17;
pub const NEGOTIATE_EXTENDED_SESSION_SECURITY: u32 = 1 << 19;
pub const NEGOTIATE_IDENTIFY: u32 = 1 << 20;
pub const NEGOTIATE_NON_NT_SESSION_KEY: u32 = 1 << 22;
pub const NEGOTIATE_TARGET_INFO: u32 = 1 << 23;
pub const NEGOTIATE_128: u32 = 1 << 29;
pub const NEGOTIATE_KEY_EXCH: u32 = 1 << 30;
pub const NEGOTIATE_56: u32 = 1 << 31;

/// Flags the gateway is willing to mirror back from the client.
pub const SUPPORTED_FLAGS: u32 = NEGOTIATE_UNICODE
    | NEGOTIATE_OEM
    | REQUEST_TARGET
    | NEGOTIATE_SIGN
    | NEGOTIATE_SEAL
    | NEGOTIATE_DATAGRAM
    | NEGOTIATE_LM_KEY
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | TARGET_TYPE_DOMAIN
    | TARGET_TYPE_SERVER
    | NEGOTIATE_EXTENDED_SESSION_SECURITY
    | NEGOTIATE_IDENTIFY
    | NEGOTIATE_NON_NT_SESSION_KEY
    | NEGOTIATE_TARGET_INFO
    | NEGOTIATE_128
    | NEGOTIATE_KEY_EXCH
    | NEGOTIATE_56;

/// Fallback set when the client negotiated nothing we support.
pub const DEFAULT_FLAGS: u32 =
    NEGOTIATE_UNICODE | NEGOTIATE_NTLM | REQUEST_TARGET | NEGOTIATE_EXTENDED_SESSION_SECURITY;

/// Target name used when the request carries no usable Host.
pub const DEFAULT_TARGET_NAME: &str = "RDPGW";

// TargetInfo AV pair ids. MS-NLMP 2.2.2.1
const AV_ID_EOL: u16 = 0;
const AV_ID_NB_COMPUTER_NAME: u16 = 1;
const AV_ID_NB_DOMAIN_NAME: u16 = 2;
const AV_ID_DNS_COMPUTER_NAME: u16 = 3;
const AV_ID_DNS_DOMAIN_NAME: u16 = 4;
const AV_ID_DNS_TREE_NAME: u16 = 5;
const AV_ID_TIMESTAMP: u16 = 7;

/// Windows FILETIME epoch offset from Unix epoch (100-ns intervals).
const FILETIME_UNIX_DIFF: u64 = 116444736000000000;

pub fn now_as_filetime() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64 / 100 + FILETIME_UNIX_DIFF)
        .unwrap_or(FILETIME_UNIX_DIFF)
}

/// Validate the signature and return the message type (1, 2 or 3).
pub fn message_type(data: &[u8]) -> Result<u32, GatewayError> {
    if data.len() < 12 {
        return Err(GatewayError::decode("NTLM message too short"));
    }
    if &data[0..8] != NTLMSSP_SIGNATURE {
        return Err(GatewayError::decode("invalid NTLM signature"));
    }
    let msg_type = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    if msg_type == 0 || msg_type > 3 {
        return Err(GatewayError::decode("unknown NTLM message type"));
    }
    Ok(msg_type)
}

/// Locate the NTLMSSP payload inside a possibly SPNEGO-wrapped token.
/// There is no Kerberos fallback: a `Negotiate` blob without an embedded
/// NTLMSSP signature fails the exchange.
pub fn extract_token(data: &[u8]) -> Result<&[u8], GatewayError> {
    if data.len() >= 12 && &data[0..8] == NTLMSSP_SIGNATURE {
        return Ok(data);
    }
    let pos = data
        .windows(NTLMSSP_SIGNATURE.len())
        .position(|w| w == NTLMSSP_SIGNATURE)
        .ok_or_else(|| GatewayError::decode("NTLM signature not found"))?;
    let token = &data[pos..];
    message_type(token)?;
    Ok(token)
}

/// Extract the negotiate flags from a NEGOTIATE (type 1) message.
pub fn parse_negotiate_flags(data: &[u8]) -> Result<u32, GatewayError> {
    if data.len() < 16 {
        return Err(GatewayError::decode("NTLM negotiate message too short"));
    }
    if message_type(data)? != MESSAGE_TYPE_NEGOTIATE {
        return Err(GatewayError::decode("NTLM negotiate message type mismatch"));
    }
    Ok(u32::from_le_bytes([data[12], data[13], data[14], data[15]]))
}

/// A variable field record: length, max length, buffer offset.
/// MS-NLMP 2.2.2.10
#[derive(Debug, Clone, Copy)]
struct VarField {
    len: u16,
    offset: u32,
}

impl VarField {
    /// Parse from the 8 bytes at `pos` in the fixed message header.
    fn parse(data: &[u8], pos: usize) -> Self {
        VarField {
            len: u16::from_le_bytes([data[pos], data[pos + 1]]),
            // max_len at pos+2 is ignored
            offset: u32::from_le_bytes([
                data[pos + 4],
                data[pos + 5],
                data[pos + 6],
                data[pos + 7],
            ]),
        }
    }

    /// Slice the payload out of the full message buffer, bounds-checked.
    fn read<'a>(&self, buffer: &'a [u8]) -> Result<&'a [u8], GatewayError> {
        let start = self.offset as usize;
        let end = start
            .checked_add(self.len as usize)
            .ok_or_else(|| GatewayError::decode("NTLM var field overflow"))?;
        if end > buffer.len() {
            return Err(GatewayError::decode("NTLM var field exceeds buffer"));
        }
        Ok(&buffer[start..end])
    }

    fn read_string(&self, buffer: &[u8], unicode: bool) -> Result<String, GatewayError> {
        let raw = self.read(buffer)?;
        if unicode {
            decode_utf16(raw)
        } else {
            Ok(String::from_utf8_lossy(raw).into_owned())
        }
    }
}

/// Parsed AUTHENTICATE (type 3) message.
#[derive(Debug)]
pub struct AuthenticateMessage {
    pub user_name: String,
    pub domain_name: String,
    pub lm_response: Vec<u8>,
    pub nt_response: Vec<u8>,
    pub negotiate_flags: u32,
}

/// Parse an AUTHENTICATE message. MS-NLMP 2.2.1.3
///
/// Fixed header layout (64 bytes):
///   0..8   signature        36..44 user name field
///   8..12  type = 3         44..52 workstation field
///   12..20 LM response      52..60 session key field
///   20..28 NT response      60..64 negotiate flags
///   28..36 domain field
pub fn parse_authenticate(data: &[u8]) -> Result<AuthenticateMessage, GatewayError> {
    if data.len() < 64 {
        return Err(GatewayError::decode("NTLM authenticate message too short"));
    }
    if message_type(data)? != MESSAGE_TYPE_AUTHENTICATE {
        return Err(GatewayError::decode("invalid NTLM authenticate message"));
    }

    let lm_field = VarField::parse(data, 12);
    let nt_field = VarField::parse(data, 20);
    let domain_field = VarField::parse(data, 28);
    let user_field = VarField::parse(data, 36);
    let negotiate_flags = u32::from_le_bytes([data[60], data[61], data[62], data[63]]);

    let unicode = negotiate_flags & NEGOTIATE_UNICODE != 0;
    let domain_name = domain_field.read_string(data, unicode)?;
    let user_name = user_field.read_string(data, unicode)?;
    let lm_response = lm_field.read(data)?.to_vec();
    let nt_response = nt_field.read(data)?.to_vec();
    if nt_response.len() < 16 {
        return Err(GatewayError::decode("NTLM response too short"));
    }

    Ok(AuthenticateMessage {
        user_name,
        domain_name,
        lm_response,
        nt_response,
        negotiate_flags,
    })
}

/// Build the CHALLENGE (type 2) message.
///
/// The emitted flags mirror the client's negotiated flags intersected with
/// `SUPPORTED_FLAGS`; if the client negotiated nothing usable (or no
/// NEGOTIATE was seen), `DEFAULT_FLAGS` apply. TargetInfo is always
/// advertised. MS-NLMP 2.2.1.2
pub fn build_challenge_message(
    server_challenge: &[u8; 8],
    target_name: &str,
    client_flags: Option<u32>,
) -> Vec<u8> {
    let mut flags = match client_flags {
        Some(f) if f & SUPPORTED_FLAGS != 0 => f & SUPPORTED_FLAGS,
        _ => DEFAULT_FLAGS,
    };

    let target_name_bytes: Vec<u8> = if flags & REQUEST_TARGET != 0 {
        if flags & NEGOTIATE_UNICODE != 0 {
            encode_utf16(target_name)
        } else {
            target_name.as_bytes().to_vec()
        }
    } else {
        Vec::new()
    };
    let target_info = build_target_info(
        now_as_filetime(),
        target_name,
        flags & REQUEST_TARGET != 0,
    );
    flags |= NEGOTIATE_TARGET_INFO;

    // Fixed header is 48 bytes; TargetName payload first, TargetInfo after.
    let payload_offset = 48u32;
    let target_name_offset = payload_offset;
    let target_info_offset = payload_offset + target_name_bytes.len() as u32;

    let mut msg = BytesMut::with_capacity(48 + target_name_bytes.len() + target_info.len());
    msg.put_slice(NTLMSSP_SIGNATURE);                      // 0..8:   Signature
    msg.put_u32_le(MESSAGE_TYPE_CHALLENGE);                // 8..12:  MessageType
    msg.put_u16_le(target_name_bytes.len() as u16);        // 12..14: TargetNameLen
    msg.put_u16_le(target_name_bytes.len() as u16);        // 14..16: TargetNameMaxLen
    msg.put_u32_le(target_name_offset);                    // 16..20: TargetNameOffset
    msg.put_u32_le(flags);                                 // 20..24: NegotiateFlags
    msg.put_slice(server_challenge);                       // 24..32: ServerChallenge
    msg.put_slice(&[0u8; 8]);                              // 32..40: Reserved
    msg.put_u16_le(target_info.len() as u16);              // 40..42: TargetInfoLen
    msg.put_u16_le(target_info.len() as u16);              // 42..44: TargetInfoMaxLen
    msg.put_u32_le(target_info_offset);                    // 44..48: TargetInfoOffset
    msg.put_slice(&target_name_bytes);                     // Payload: TargetName
    msg.put_slice(&target_info);                           // Payload: TargetInfo
    msg.to_vec()
}

/// Build the TargetInfo AV pair list: the server name pairs (when the
/// client requested a target and a name exists), a FILETIME timestamp,
/// and the EOL terminator.
fn build_target_info(filetime: u64, target_name: &str, include_names: bool) -> Vec<u8> {
    let mut buf = BytesMut::new();
    let write_av = |buf: &mut BytesMut, id: u16, value: &[u8]| {
        buf.put_u16_le(id);
        buf.put_u16_le(value.len() as u16);
        buf.put_slice(value);
    };

    let mut normalized = target_name.trim();
    if normalized.is_empty() {
        normalized = DEFAULT_TARGET_NAME;
    }
    if include_names {
        let name_bytes = encode_utf16(normalized);
        write_av(&mut buf, AV_ID_NB_DOMAIN_NAME, &name_bytes);
        write_av(&mut buf, AV_ID_NB_COMPUTER_NAME, &name_bytes);
        write_av(&mut buf, AV_ID_DNS_DOMAIN_NAME, &name_bytes);
        write_av(&mut buf, AV_ID_DNS_COMPUTER_NAME, &name_bytes);
        write_av(&mut buf, AV_ID_DNS_TREE_NAME, &name_bytes);
    }
    write_av(&mut buf, AV_ID_TIMESTAMP, &filetime.to_le_bytes());
    write_av(&mut buf, AV_ID_EOL, &[]);
    buf.to_vec()
}

// ---- Test support ----

/// Build a minimal AUTHENTICATE message for tests and the NTLM test
/// vectors: real LM/NT payloads, no workstation or session key.
#[cfg(test)]
pub(crate) fn build_test_authenticate_message(
    user: &str,
    domain: &str,
    nt_response: &[u8],
    unicode: bool,
) -> Vec<u8> {
    let lm_response: &[u8] = &[0x01, 0x02, 0x03];
    let (domain_bytes, user_bytes) = if unicode {
        (encode_utf16(domain), encode_utf16(user))
    } else {
        (domain.as_bytes().to_vec(), user.as_bytes().to_vec())
    };

    let mut offset = 64u32;
    let mut field = |len: usize| {
        let f = (len as u16, offset);
        offset += len as u32;
        f
    };
    let lm = field(lm_response.len());
    let nt = field(nt_response.len());
    let dom = field(domain_bytes.len());
    let usr = field(user_bytes.len());
    let wks = field(0);
    let key = field(0);

    let mut msg = BytesMut::new();
    msg.put_slice(NTLMSSP_SIGNATURE);
    msg.put_u32_le(MESSAGE_TYPE_AUTHENTICATE);
    for (len, off) in [lm, nt, dom, usr, wks, key] {
        msg.put_u16_le(len);
        msg.put_u16_le(len);
        msg.put_u32_le(off);
    }
    msg.put_u32_le(if unicode { NEGOTIATE_UNICODE } else { 0 });
    msg.put_slice(lm_response);
    msg.put_slice(nt_response);
    msg.put_slice(&domain_bytes);
    msg.put_slice(&user_bytes);
    msg.to_vec()
}

#[cfg(test)]
pub(crate) fn build_test_token(msg_type: u32) -> Vec<u8> {
    let mut token = BytesMut::new();
    token.put_slice(NTLMSSP_SIGNATURE);
    token.put_u32_le(msg_type);
    token.to_vec()
}
