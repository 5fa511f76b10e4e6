//! The RDG session state machine and the backend forwarder.
//!
//! One `GatewayServer` drives one authenticated client connection through
//! the MS-TSGU choreography: handshake, tunnel create, tunnel auth,
//! channel create, then full-duplex DATA relay against the backend RDP
//! socket. The inbound loop runs on the caller's task; the backend→client
//! direction runs on a task spawned at channel creation, sharing the
//! outbound transport behind its lock.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{GatewayConfig, RedirectConfig};
use crate::error::GatewayError;
use crate::rdg::packet::{create_packet, read_message};
use crate::rdg::{self, decode_utf16, PacketType, SessionInfo, SharedTransport};

/// Deadline for the TCP connect to the RDP target.
const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Read chunk size for backend→client forwarding.
const FORWARD_BUF_SIZE: usize = 32 * 1024;

/// Tunnel id reported in the tunnel response.
const TUNNEL_ID: u32 = 10;

/// Policy hooks consulted while the session advances. Implementations
/// decide per authenticated user; the state machine only carries the
/// verdicts.
pub trait GatewayPolicy: Send + Sync {
    /// PAA cookie check on tunnel create. Defaults to allow.
    fn verify_tunnel_create(&self, _user: &str, _paa_cookie: &str) -> bool {
        true
    }

    /// Client machine name check on tunnel auth.
    fn verify_tunnel_auth(&self, user: &str, client_name: &str) -> bool;

    /// Optionally rewrite the requested host to the final "ip:port".
    /// `None` leaves the client-requested endpoint in place.
    fn resolve_target(&self, user: &str, requested_host: &str) -> Option<String>;

    /// Final gate on the resolved "host:port" before dialing.
    fn verify_server(&self, user: &str, host_port: &str) -> bool;
}

/// Session lifecycle states. Transitions not listed in `run` terminate
/// the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Initial,
    Handshake,
    TunnelCreate,
    TunnelAuthorize,
    ChannelCreate,
    Opened,
    Closed,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Initial => "INITIAL",
            State::Handshake => "HANDSHAKE",
            State::TunnelCreate => "TUNNEL_CREATE",
            State::TunnelAuthorize => "TUNNEL_AUTHORIZE",
            State::ChannelCreate => "CHANNEL_CREATE",
            State::Opened => "OPENED",
            State::Closed => "CLOSED",
        }
    }
}

/// Per-session state machine.
pub struct GatewayServer {
    session: SessionInfo,
    policy: Arc<dyn GatewayPolicy>,
    auth_user: String,
    redirect_flags: u32,
    idle_timeout: i32,
    smart_card_auth: bool,
    token_auth: bool,
    pub(crate) state: State,
    /// Fragment/coalescing carry-over for the inbound framer.
    read_buf: BytesMut,
    backend: Option<OwnedWriteHalf>,
    /// Backend read half parked between dial and forwarder spawn, so the
    /// channel response hits the wire before backend traffic does.
    pending_backend_read: Option<OwnedReadHalf>,
    forwarder: Option<JoinHandle<()>>,
}

impl GatewayServer {
    pub fn new(
        session: SessionInfo,
        conf: &GatewayConfig,
        policy: Arc<dyn GatewayPolicy>,
        auth_user: String,
    ) -> Self {
        GatewayServer {
            session,
            policy,
            auth_user,
            redirect_flags: make_redirect_flags(&conf.redirect),
            idle_timeout: conf.idle_timeout,
            smart_card_auth: conf.smart_card_auth,
            token_auth: conf.token_auth,
            state: State::Initial,
            read_buf: BytesMut::new(),
            backend: None,
            pending_backend_read: None,
            forwarder: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Drive the session until the channel closes or a fatal error. The
    /// caller must invoke `shutdown` afterwards regardless of outcome.
    pub async fn run(&mut self) -> Result<(), GatewayError> {
        loop {
            let (pt_raw, size, body) =
                read_message(self.session.transport_in.as_mut(), &mut self.read_buf).await?;

            let Some(pt) = PacketType::from_u16(pt_raw) else {
                warn!(packet_type = pt_raw, size, "unknown packet, skipping");
                continue;
            };

            match pt {
                PacketType::HandshakeRequest => {
                    self.expect_state(State::Initial, pt_raw)?;
                    let (major, minor, version, ext_auth) = parse_handshake_request(&body)?;
                    debug!(major, minor, version, ext_auth, "client handshake");
                    let resp = self.handshake_response(major, minor);
                    self.write_response(resp).await?;
                    self.state = State::Handshake;
                }
                PacketType::TunnelCreate => {
                    self.expect_state(State::Handshake, pt_raw)?;
                    let (caps, cookie) = parse_tunnel_request(&body)?;
                    debug!(caps, cookie_present = !cookie.is_empty(), "tunnel create");
                    if !self.policy.verify_tunnel_create(&self.auth_user, &cookie) {
                        warn!(client_ip = %self.session.client_ip, "invalid PAA cookie");
                        return Err(GatewayError::PolicyDeny("invalid PAA cookie".into()));
                    }
                    let resp = self.tunnel_response();
                    self.write_response(resp).await?;
                    self.state = State::TunnelCreate;
                }
                PacketType::TunnelAuth => {
                    self.expect_state(State::TunnelCreate, pt_raw)?;
                    let client_name = parse_tunnel_auth_request(&body)?;
                    debug!(client_name = %client_name, "tunnel auth");
                    if !self.policy.verify_tunnel_auth(&self.auth_user, &client_name) {
                        warn!(client_name = %client_name, "invalid client name");
                        return Err(GatewayError::PolicyDeny("invalid client name".into()));
                    }
                    let resp = self.tunnel_auth_response();
                    self.write_response(resp).await?;
                    self.state = State::TunnelAuthorize;
                }
                PacketType::ChannelCreate => {
                    self.expect_state(State::TunnelAuthorize, pt_raw)?;
                    let (server, port) = parse_channel_request(&body)?;
                    self.open_channel(&server, port).await?;
                    let resp = self.channel_response();
                    self.write_response(resp).await?;
                    self.spawn_forwarder();
                    self.state = State::ChannelCreate;
                }
                PacketType::Data => {
                    if self.state < State::ChannelCreate {
                        return Err(self.wrong_state(pt_raw));
                    }
                    self.state = State::Opened;
                    self.relay_to_backend(&body).await?;
                }
                PacketType::Keepalive => {
                    // keepalives may arrive before the first DATA but not
                    // before the channel exists; no echo is required
                    if self.state < State::ChannelCreate {
                        return Err(self.wrong_state(pt_raw));
                    }
                }
                PacketType::CloseChannel => {
                    if self.state != State::Opened {
                        return Err(self.wrong_state(pt_raw));
                    }
                    info!(conn_id = %self.session.conn_id, "close channel");
                    self.state = State::Closed;
                    self.shutdown().await;
                    return Ok(());
                }
                PacketType::ExtendedAuth
                | PacketType::HandshakeResponse
                | PacketType::TunnelResponse
                | PacketType::TunnelAuthResponse
                | PacketType::ChannelResponse => {
                    warn!(packet_type = pt_raw, size, "unexpected packet, skipping");
                }
            }
        }
    }

    /// Release everything the session holds: both transports, the backend
    /// socket, and the forwarder task. Idempotent.
    pub async fn shutdown(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            let _ = backend.shutdown().await;
        }
        if let Err(e) = self.session.transport_in.close().await {
            debug!("inbound transport close: {}", e);
        }
        if let Err(e) = self.session.transport_out.lock().await.close().await {
            debug!("outbound transport close: {}", e);
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }

    fn expect_state(&self, expected: State, packet: u16) -> Result<(), GatewayError> {
        if self.state != expected {
            warn!(
                packet_type = packet,
                state = self.state.name(),
                expected = expected.name(),
                "packet in wrong state"
            );
            return Err(self.wrong_state(packet));
        }
        Ok(())
    }

    fn wrong_state(&self, packet: u16) -> GatewayError {
        GatewayError::WrongState {
            packet,
            state: self.state.name(),
        }
    }

    async fn write_response(&mut self, packet: Bytes) -> Result<(), GatewayError> {
        self.session
            .transport_out
            .lock()
            .await
            .write_packet(&packet)
            .await?;
        Ok(())
    }

    // ---- Response builders ----

    fn handshake_response(&self, major: u8, minor: u8) -> Bytes {
        let mut caps: u16 = 0;
        if self.smart_card_auth {
            caps |= rdg::HTTP_EXTENDED_AUTH_SC;
        }
        if self.token_auth {
            caps |= rdg::HTTP_EXTENDED_AUTH_PAA;
        }
        // NTLM runs at the HTTP layer, not inside the tunnel

        let mut buf = BytesMut::with_capacity(10);
        buf.put_u32_le(0); // error code
        buf.put_u8(major);
        buf.put_u8(minor);
        buf.put_u16_le(0); // server version
        buf.put_u16_le(caps);
        create_packet(PacketType::HandshakeResponse as u16, &buf)
    }

    fn tunnel_response(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u16_le(0); // server version
        buf.put_u32_le(0); // error code
        buf.put_u16_le(
            rdg::HTTP_TUNNEL_RESPONSE_FIELD_TUNNEL_ID | rdg::HTTP_TUNNEL_RESPONSE_FIELD_CAPS,
        );
        buf.put_u16_le(0); // reserved
        buf.put_u32_le(TUNNEL_ID);
        buf.put_u32_le(rdg::HTTP_CAPABILITY_IDLE_TIMEOUT);
        create_packet(PacketType::TunnelResponse as u16, &buf)
    }

    fn tunnel_auth_response(&self) -> Bytes {
        let idle_timeout = self.idle_timeout.max(0) as u32;

        let mut buf = BytesMut::with_capacity(16);
        buf.put_u32_le(0); // error code
        buf.put_u16_le(
            rdg::HTTP_TUNNEL_AUTH_RESPONSE_FIELD_REDIR_FLAGS
                | rdg::HTTP_TUNNEL_AUTH_RESPONSE_FIELD_IDLE_TIMEOUT,
        );
        buf.put_u16_le(0); // reserved
        buf.put_u32_le(self.redirect_flags);
        buf.put_u32_le(idle_timeout); // minutes
        create_packet(PacketType::TunnelAuthResponse as u16, &buf)
    }

    fn channel_response(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u32_le(0); // error code
        buf.put_u16_le(rdg::HTTP_CHANNEL_RESPONSE_FIELD_CHANNELID);
        buf.put_u16_le(0); // reserved
        buf.put_u32_le(1); // channel id, required by Windows clients
        create_packet(PacketType::ChannelResponse as u16, &buf)
    }

    // ---- Channel handling ----

    /// Resolve, authorize, and dial the backend RDP endpoint.
    async fn open_channel(&mut self, server: &str, port: u16) -> Result<(), GatewayError> {
        let host_port = match self.policy.resolve_target(&self.auth_user, server) {
            Some(resolved) => resolved,
            None => format!("{}:{}", server, port),
        };

        if !self.policy.verify_server(&self.auth_user, &host_port) {
            warn!(user = %self.auth_user, target = %host_port, "target denied by policy");
            return Err(GatewayError::PolicyDeny("target not allowed".into()));
        }

        info!(user = %self.auth_user, target = %host_port, "establishing connection to RDP server");
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&host_port))
            .await
            .map_err(|_| {
                GatewayError::BackendDial(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", host_port),
                ))
            })?
            .map_err(GatewayError::BackendDial)?;

        let (read_half, write_half) = stream.into_split();
        self.backend = Some(write_half);
        self.pending_backend_read = Some(read_half);
        Ok(())
    }

    /// Start the backend→client direction. The RDP server speaks first,
    /// so this runs as soon as the channel response is written.
    fn spawn_forwarder(&mut self) {
        if let Some(read_half) = self.pending_backend_read.take() {
            let out = self.session.transport_out.clone();
            self.forwarder = Some(tokio::spawn(forward(read_half, out)));
        }
    }

    /// Unwrap one DATA packet and push its payload to the backend.
    async fn relay_to_backend(&mut self, body: &[u8]) -> Result<(), GatewayError> {
        if body.len() < 2 {
            return Err(GatewayError::decode("DATA packet too short"));
        }
        let cblen = u16::from_le_bytes([body[0], body[1]]) as usize;
        if cblen > body.len() - 2 {
            return Err(GatewayError::decode("DATA length exceeds packet"));
        }
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| GatewayError::decode("DATA before channel established"))?;
        backend
            .write_all(&body[2..2 + cblen])
            .await
            .map_err(GatewayError::BackendIo)?;
        Ok(())
    }
}

/// Copy backend bytes to the client, one DATA packet per read. Exits on
/// backend EOF/error or a transport write failure, closing the outbound
/// transport so the client observes the end of the session.
async fn forward(mut backend: OwnedReadHalf, out: SharedTransport) {
    let mut buf = vec![0u8; FORWARD_BUF_SIZE];
    loop {
        let n = match backend.read(&mut buf).await {
            Ok(0) => {
                debug!("backend closed");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("backend read error: {}", e);
                break;
            }
        };
        let mut body = BytesMut::with_capacity(2 + n);
        body.put_u16_le(n as u16);
        body.put_slice(&buf[..n]);
        let packet = create_packet(PacketType::Data as u16, &body);

        let mut guard = out.lock().await;
        if let Err(e) = guard.write_packet(&packet).await {
            debug!("transport write error: {}", e);
            break;
        }
    }
    let _ = out.lock().await.close().await;
}

// ---- Request parsers ----

fn parse_handshake_request(body: &[u8]) -> Result<(u8, u8, u16, u16), GatewayError> {
    if body.len() < 6 {
        return Err(GatewayError::decode("handshake request too short"));
    }
    let major = body[0];
    let minor = body[1];
    let version = u16::from_le_bytes([body[2], body[3]]);
    let ext_auth = u16::from_le_bytes([body[4], body[5]]);
    Ok((major, minor, version, ext_auth))
}

fn parse_tunnel_request(body: &[u8]) -> Result<(u32, String), GatewayError> {
    if body.len() < 8 {
        return Err(GatewayError::decode("tunnel request too short"));
    }
    let caps = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let fields = u16::from_le_bytes([body[4], body[5]]);
    // body[6..8] reserved

    let mut cookie = String::new();
    if fields & rdg::HTTP_TUNNEL_PACKET_FIELD_PAA_COOKIE != 0 {
        if body.len() < 10 {
            return Err(GatewayError::decode("tunnel request cookie truncated"));
        }
        let size = u16::from_le_bytes([body[8], body[9]]) as usize;
        if body.len() < 10 + size {
            return Err(GatewayError::decode("tunnel request cookie truncated"));
        }
        cookie = decode_utf16(&body[10..10 + size])?
            .trim_end_matches('\0')
            .to_string();
    }
    Ok((caps, cookie))
}

fn parse_tunnel_auth_request(body: &[u8]) -> Result<String, GatewayError> {
    if body.len() < 2 {
        return Err(GatewayError::decode("tunnel auth request too short"));
    }
    let size = u16::from_le_bytes([body[0], body[1]]) as usize;
    if body.len() < 2 + size {
        return Err(GatewayError::decode("tunnel auth client name truncated"));
    }
    let client_name = decode_utf16(&body[2..2 + size])?
        .trim_end_matches('\0')
        .to_string();
    Ok(client_name)
}

fn parse_channel_request(body: &[u8]) -> Result<(String, u16), GatewayError> {
    if body.len() < 8 {
        return Err(GatewayError::decode("channel request too short"));
    }
    // body[0] resource count, body[1] alternative count
    let port = u16::from_le_bytes([body[2], body[3]]);
    // body[4..6] protocol
    let name_size = u16::from_le_bytes([body[6], body[7]]) as usize;
    if body.len() < 8 + name_size {
        return Err(GatewayError::decode("channel request name truncated"));
    }
    let server = decode_utf16(&body[8..8 + name_size])?
        .trim_end_matches('\0')
        .to_string();
    Ok((server, port))
}

/// Assemble the redirect flag word from the configured policy.
/// `disable_all` overrides everything; `enable_all` overrides the
/// individual toggles; otherwise each disabled capability contributes
/// its bit.
pub fn make_redirect_flags(flags: &RedirectConfig) -> u32 {
    if flags.disable_all {
        return rdg::HTTP_TUNNEL_REDIR_DISABLE_ALL;
    }
    if flags.enable_all {
        return rdg::HTTP_TUNNEL_REDIR_ENABLE_ALL;
    }

    let mut redir = 0;
    if !flags.port {
        redir |= rdg::HTTP_TUNNEL_REDIR_DISABLE_PORT;
    }
    if !flags.clipboard {
        redir |= rdg::HTTP_TUNNEL_REDIR_DISABLE_CLIPBOARD;
    }
    if !flags.drive {
        redir |= rdg::HTTP_TUNNEL_REDIR_DISABLE_DRIVE;
    }
    if !flags.pnp {
        redir |= rdg::HTTP_TUNNEL_REDIR_DISABLE_PNP;
    }
    if !flags.printer {
        redir |= rdg::HTTP_TUNNEL_REDIR_DISABLE_PRINTER;
    }
    redir
}
