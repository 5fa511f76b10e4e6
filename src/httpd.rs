//! HTTP/1.1 front end and request dispatcher.
//!
//! The gateway drives HTTP itself on the owned TLS stream: the legacy RDG
//! methods hijack the connection into raw half-streams, which a framework
//! server cannot hand over. Request heads are parsed with `httparse`;
//! keep-alive is supported so the NTLM 401 round trips stay on one
//! connection, which is what ties the challenge cache key to the exchange.
//!
//! Routing:
//!   GET /api/health                       liveness probe, unauthenticated
//!   GET|RDG_OUT_DATA (websocket upgrade)  duplex session on this stream
//!   RDG_OUT_DATA                          park server→client half-stream
//!   RDG_IN_DATA                           join client→server half-stream,
//!                                         run the state machine
//!   anything else                         404

use bytes::{Buf, BytesMut};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::auth::{challenge_key, split_auth_header, target_name_from_host, Authenticator};
use crate::config::GatewayConfig;
use crate::error::{AuthError, GatewayError};
use crate::rdg::registry::SessionRegistry;
use crate::rdg::server::GatewayServer;
use crate::rdg::transport::{split_websocket, LegacyTransport, Transport};
use crate::rdg::{SessionInfo, SharedTransport};
use crate::users::StaticPolicy;

/// Mount point for RDG traffic (exact or prefix match).
pub const RDG_PATH: &str = "/remoteDesktopGateway";

pub const METHOD_RDG_IN: &str = "RDG_IN_DATA";
pub const METHOD_RDG_OUT: &str = "RDG_OUT_DATA";

/// Upper bound on a request head before the connection is dropped.
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Everything the dispatcher needs, wired once at startup.
pub struct AppState {
    pub gateway: GatewayConfig,
    pub authenticator: Authenticator,
    pub policy: Arc<StaticPolicy>,
    pub registry: SessionRegistry,
}

/// A parsed request head.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    headers: Vec<(String, String)>,
    pub remote_addr: String,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn conn_id(&self) -> Option<&str> {
        self.header("Rdg-Connection-Id").map(str::trim)
    }

    /// First X-Forwarded-For entry, else the peer address without port.
    pub fn client_ip(&self) -> String {
        if let Some(xff) = self.header("X-Forwarded-For") {
            if let Some(first) = xff.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
        match self.remote_addr.rsplit_once(':') {
            Some((host, _)) => host.to_string(),
            None => self.remote_addr.clone(),
        }
    }

    fn is_rdg_path(&self) -> bool {
        self.path == RDG_PATH || self.path.starts_with(&format!("{}/", RDG_PATH))
    }

    fn wants_websocket(&self) -> bool {
        let upgrade = self
            .header("Upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        upgrade && self.header("Sec-WebSocket-Key").is_some()
    }

    fn has_body(&self) -> bool {
        if self.header("Transfer-Encoding").is_some() {
            return true;
        }
        self.header("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|n| n > 0)
            .unwrap_or(false)
    }
}

/// Routing verdict for one request. Pure decision, no I/O.
#[derive(Debug)]
enum Action {
    Respond {
        status: u16,
        reason: &'static str,
        headers: Vec<(String, String)>,
        body: &'static [u8],
        close: bool,
    },
    Websocket { user: String },
    LegacyOut { user: String },
    LegacyIn { user: String },
}

fn respond(status: u16, reason: &'static str, body: &'static [u8]) -> Action {
    Action::Respond {
        status,
        reason,
        headers: Vec::new(),
        body,
        close: false,
    }
}

fn route_request(req: &Request, state: &AppState) -> Action {
    if !req.is_rdg_path() {
        if req.method == "GET" && req.path == "/api/health" {
            return respond(200, "OK", b"ok\n");
        }
        return respond(404, "Not Found", b"not found\n");
    }

    let key = challenge_key(req.conn_id(), &req.remote_addr);
    let target_name = target_name_from_host(req.header("Host"));
    match state
        .authenticator
        .authenticate(req.header("Authorization"), &key, &target_name)
    {
        Ok(user) => {
            info!(
                user = %user,
                method = %req.method,
                path = %req.path,
                client_ip = %req.client_ip(),
                conn_id = req.conn_id().unwrap_or(""),
                "gateway connect"
            );
            if req.wants_websocket() {
                Action::Websocket { user }
            } else if req.method == METHOD_RDG_OUT {
                Action::LegacyOut { user }
            } else if req.method == METHOD_RDG_IN {
                Action::LegacyIn { user }
            } else {
                respond(405, "Method Not Allowed", b"method not allowed\n")
            }
        }
        Err(err) => {
            debug!(
                method = %req.method,
                path = %req.path,
                conn_id = req.conn_id().unwrap_or(""),
                "gateway auth: {}",
                err
            );
            let headers = challenge_headers(&err, true)
                .into_iter()
                .map(|v| ("WWW-Authenticate".to_string(), v))
                .collect();
            Action::Respond {
                status: 401,
                reason: "Unauthorized",
                headers,
                body: b"unauthorized\n",
                // a request body we never consumed poisons keep-alive
                close: req.has_body(),
            }
        }
    }
}

/// `WWW-Authenticate` values for a failed or in-flight authentication.
/// RDG paths advertise NTLM and Negotiate; when a challenge token was
/// issued under `Negotiate`, its NTLM twin is added so older clients can
/// drop the SPNEGO wrapping. Non-RDG paths also offer Basic for the
/// browser surfaces.
fn challenge_headers(err: &AuthError, is_rdg: bool) -> Vec<String> {
    let mut headers = Vec::new();
    match err {
        AuthError::Challenge(header) => {
            headers.push(header.clone());
            let (scheme, token) = split_auth_header(header);
            if scheme.eq_ignore_ascii_case("Negotiate") && !token.is_empty() {
                headers.push(format!("NTLM {}", token));
            }
            if !is_rdg {
                headers.push(r#"Basic realm="rdpgw""#.to_string());
            }
        }
        AuthError::MissingCredentials | AuthError::InvalidCredentials => {
            if is_rdg {
                headers.push("NTLM".to_string());
                headers.push("Negotiate".to_string());
            } else {
                headers.push(r#"Basic realm="rdpgw""#.to_string());
            }
        }
    }
    headers
}

/// Drive one client connection: parse requests, answer the auxiliary
/// routes, and hand the stream over once an RDG action claims it.
pub async fn serve_connection<S>(
    mut stream: S,
    remote_addr: String,
    state: Arc<AppState>,
) -> Result<(), GatewayError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        let Some(req) = read_request_head(&mut stream, &mut buf, &remote_addr).await? else {
            return Ok(());
        };
        let started = Instant::now();

        match route_request(&req, &state) {
            Action::Respond { status, reason, headers, body, close } => {
                write_response(&mut stream, status, reason, &headers, body).await?;
                info!(
                    status,
                    dur_ms = started.elapsed().as_millis() as u64,
                    method = %req.method,
                    path = %req.path,
                    remote = %remote_addr,
                    xff = req.header("X-Forwarded-For").unwrap_or(""),
                    conn_id = req.conn_id().unwrap_or(""),
                    "request"
                );
                if close {
                    return Ok(());
                }
            }
            Action::Websocket { user } => {
                return handle_websocket(stream, buf, req, user, state).await;
            }
            Action::LegacyOut { user: _ } => {
                return handle_legacy_out(stream, buf, req, state).await;
            }
            Action::LegacyIn { user } => {
                return handle_legacy_in(stream, buf, req, user, state).await;
            }
        }
    }
}

/// Complete the WebSocket upgrade on the owned stream and run the state
/// machine over the duplex transport.
async fn handle_websocket<S>(
    mut stream: S,
    leftover: BytesMut,
    req: Request,
    user: String,
    state: Arc<AppState>,
) -> Result<(), GatewayError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let key = req.header("Sec-WebSocket-Key").unwrap_or_default();
    let accept = derive_accept_key(key.as_bytes());
    let head = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept
    );
    stream
        .write_all(head.as_bytes())
        .await
        .map_err(GatewayError::TransportIo)?;
    stream.flush().await.map_err(GatewayError::TransportIo)?;

    let ws =
        WebSocketStream::from_partially_read(stream, leftover.to_vec(), Role::Server, None).await;
    let (read_half, write_half) = split_websocket(ws);

    let session = SessionInfo {
        conn_id: req.conn_id().unwrap_or_default().to_string(),
        client_ip: req.client_ip(),
        transport_in: Box::new(read_half),
        transport_out: Arc::new(Mutex::new(Box::new(write_half) as Box<dyn Transport>)),
    };
    run_session(session, user, &state).await
}

/// Park the hijacked OUT half-stream for its IN counterpart.
async fn handle_legacy_out<S>(
    stream: S,
    leftover: BytesMut,
    req: Request,
    state: Arc<AppState>,
) -> Result<(), GatewayError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let conn_id = req.conn_id().unwrap_or_default().to_string();
    let client_ip = req.client_ip();
    info!(conn_id = %conn_id, client_ip = %client_ip, "opening RDG OUT channel");

    let mut out = LegacyTransport::new(stream, leftover);
    out.send_accept(true).await?;

    let shared: SharedTransport = Arc::new(Mutex::new(Box::new(out) as Box<dyn Transport>));
    state.registry.register(&conn_id, shared, client_ip);
    Ok(())
}

/// Join the hijacked IN half-stream with its parked OUT counterpart and
/// run the state machine on this task.
async fn handle_legacy_in<S>(
    stream: S,
    leftover: BytesMut,
    req: Request,
    user: String,
    state: Arc<AppState>,
) -> Result<(), GatewayError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let conn_id = req.conn_id().unwrap_or_default().to_string();
    let client_ip = req.client_ip();
    info!(conn_id = %conn_id, client_ip = %client_ip, "opening RDG IN channel");

    let mut transport_in = LegacyTransport::new(stream, leftover);
    transport_in.send_accept(false).await?;
    transport_in.drain().await;

    let Some(pending) = state.registry.take(&conn_id) else {
        warn!(conn_id = %conn_id, "no RDG OUT transport for connection id");
        return Err(GatewayError::decode("RDG IN without matching OUT stream"));
    };

    let session = SessionInfo {
        conn_id,
        client_ip: pending.client_ip,
        transport_in: Box::new(transport_in),
        transport_out: pending.transport_out,
    };
    run_session(session, user, &state).await
}

async fn run_session(
    session: SessionInfo,
    user: String,
    state: &AppState,
) -> Result<(), GatewayError> {
    let conn_id = session.conn_id.clone();
    let mut server = GatewayServer::new(session, &state.gateway, state.policy.clone(), user);
    let result = server.run().await;
    server.shutdown().await;
    match &result {
        Ok(()) => info!(conn_id = %conn_id, "session closed"),
        Err(e) => info!(conn_id = %conn_id, "session ended: {}", e),
    }
    result
}

/// Accumulate and parse one request head. Returns `None` on a clean
/// close between requests. Body bytes past the head stay in `buf`.
async fn read_request_head<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    remote_addr: &str,
) -> Result<Option<Request>, GatewayError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            let mut headers = [httparse::EMPTY_HEADER; 64];
            let mut parsed = httparse::Request::new(&mut headers);
            match parsed.parse(&buf[..]) {
                Ok(httparse::Status::Complete(head_len)) => {
                    let request = Request {
                        method: parsed.method.unwrap_or_default().to_string(),
                        path: parsed.path.unwrap_or_default().to_string(),
                        headers: parsed
                            .headers
                            .iter()
                            .map(|h| {
                                (
                                    h.name.to_string(),
                                    String::from_utf8_lossy(h.value).into_owned(),
                                )
                            })
                            .collect(),
                        remote_addr: remote_addr.to_string(),
                    };
                    buf.advance(head_len);
                    return Ok(Some(request));
                }
                Ok(httparse::Status::Partial) => {}
                Err(e) => {
                    return Err(GatewayError::decode(format!("bad request head: {}", e)));
                }
            }
            if buf.len() > MAX_HEAD_SIZE {
                return Err(GatewayError::decode("request head too large"));
            }
        }

        let mut chunk = [0u8; 4096];
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(GatewayError::TransportIo)?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(GatewayError::ConnectionClosed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn write_response<S>(
    stream: &mut S,
    status: u16,
    reason: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> Result<(), GatewayError>
where
    S: AsyncWrite + Unpin,
{
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason);
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

    stream
        .write_all(head.as_bytes())
        .await
        .map_err(GatewayError::TransportIo)?;
    stream
        .write_all(body)
        .await
        .map_err(GatewayError::TransportIo)?;
    stream.flush().await.map_err(GatewayError::TransportIo)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, TlsConfig, UserConfig};
    use crate::rdg::packet::create_packet;
    use crate::rdg::{encode_utf16, PacketType};
    use crate::users::UserStore;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    fn test_state(target: Option<String>) -> Arc<AppState> {
        let users = vec![UserConfig {
            username: "testuser".to_string(),
            password: "dogood".to_string(),
            domain: "DOMAIN".to_string(),
        }];
        let config = Config {
            bind: ":0".to_string(),
            tls: TlsConfig {
                cert: "c".to_string(),
                key: "k".to_string(),
            },
            gateway: GatewayConfig::default(),
            users: users.clone(),
            targets: target
                .map(|t| [("testuser".to_string(), t)].into_iter().collect())
                .unwrap_or_default(),
        };
        let store = Arc::new(UserStore::from_config(&config.users));
        Arc::new(AppState {
            gateway: config.gateway.clone(),
            authenticator: Authenticator::new(store),
            policy: StaticPolicy::from_config(&config),
            registry: SessionRegistry::default(),
        })
    }

    fn basic_auth() -> String {
        format!("Basic {}", BASE64.encode("testuser:dogood"))
    }

    fn request(method: &str, path: &str, headers: &[(&str, &str)]) -> Request {
        Request {
            method: method.to_string(),
            path: path.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            remote_addr: "192.0.2.55:4242".to_string(),
        }
    }

    #[test]
    fn test_route_health_and_not_found() {
        let state = test_state(None);
        let action = route_request(&request("GET", "/api/health", &[]), &state);
        assert!(matches!(action, Action::Respond { status: 200, .. }));

        let action = route_request(&request("GET", "/login", &[]), &state);
        assert!(matches!(action, Action::Respond { status: 404, .. }));
    }

    #[test]
    fn test_route_rdg_requires_auth() {
        let state = test_state(None);
        let action = route_request(
            &request(METHOD_RDG_OUT, "/remoteDesktopGateway/", &[]),
            &state,
        );
        let Action::Respond { status, headers, .. } = action else {
            panic!("expected 401");
        };
        assert_eq!(status, 401);
        let values: Vec<&str> = headers.iter().map(|(_, v)| v.as_str()).collect();
        assert_eq!(values, vec!["NTLM", "Negotiate"]);
    }

    #[test]
    fn test_route_rdg_methods_with_basic_auth() {
        let state = test_state(None);
        let auth = basic_auth();
        let hdrs = [("Authorization", auth.as_str()), ("Rdg-Connection-Id", "c1")];

        let action = route_request(
            &request(METHOD_RDG_OUT, "/remoteDesktopGateway/", &hdrs),
            &state,
        );
        assert!(matches!(action, Action::LegacyOut { .. }));

        let action = route_request(
            &request(METHOD_RDG_IN, "/remoteDesktopGateway/", &hdrs),
            &state,
        );
        assert!(matches!(action, Action::LegacyIn { .. }));

        let action = route_request(
            &request("POST", "/remoteDesktopGateway/", &hdrs),
            &state,
        );
        assert!(matches!(action, Action::Respond { status: 405, .. }));
    }

    #[test]
    fn test_route_websocket_upgrade() {
        let state = test_state(None);
        let auth = basic_auth();
        let action = route_request(
            &request(
                "GET",
                "/remoteDesktopGateway/",
                &[
                    ("Authorization", auth.as_str()),
                    ("Upgrade", "websocket"),
                    ("Connection", "Upgrade"),
                    ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
                ],
            ),
            &state,
        );
        assert!(matches!(action, Action::Websocket { .. }));
    }

    #[test]
    fn test_ntlm_negotiate_produces_challenge_header() {
        let state = test_state(None);
        let mut token = crate::ntlm::build_test_token(crate::ntlm::MESSAGE_TYPE_NEGOTIATE);
        token.extend_from_slice(&crate::ntlm::NEGOTIATE_UNICODE.to_le_bytes());
        let auth = format!("NTLM {}", BASE64.encode(&token));

        let action = route_request(
            &request(
                METHOD_RDG_OUT,
                "/remoteDesktopGateway/",
                &[
                    ("Authorization", auth.as_str()),
                    ("Rdg-Connection-Id", "conn-9"),
                    ("Host", "gw.example.com:8443"),
                ],
            ),
            &state,
        );
        let Action::Respond { status, headers, .. } = action else {
            panic!("expected 401 challenge");
        };
        assert_eq!(status, 401);
        assert_eq!(headers.len(), 1);
        assert!(headers[0].1.starts_with("NTLM "));
    }

    #[test]
    fn test_challenge_headers_policy() {
        let challenge = AuthError::Challenge("Negotiate abcd".to_string());
        assert_eq!(
            challenge_headers(&challenge, true),
            vec!["Negotiate abcd".to_string(), "NTLM abcd".to_string()]
        );
        assert_eq!(
            challenge_headers(&challenge, false),
            vec![
                "Negotiate abcd".to_string(),
                "NTLM abcd".to_string(),
                r#"Basic realm="rdpgw""#.to_string()
            ]
        );
        assert_eq!(
            challenge_headers(&AuthError::MissingCredentials, false),
            vec![r#"Basic realm="rdpgw""#.to_string()]
        );
    }

    #[test]
    fn test_client_ip() {
        let req = request(
            "GET",
            "/",
            &[("X-Forwarded-For", "198.51.100.10, 203.0.113.1")],
        );
        assert_eq!(req.client_ip(), "198.51.100.10");

        let req = request("GET", "/", &[]);
        assert_eq!(req.client_ip(), "192.0.2.55");
    }

    #[tokio::test]
    async fn test_read_request_head_keeps_body_bytes() {
        let (mut client, mut server) = duplex(4096);
        client
            .write_all(b"GET /api/health HTTP/1.1\r\nHost: gw\r\n\r\nEXTRA")
            .await
            .unwrap();

        let mut buf = BytesMut::new();
        let req = read_request_head(&mut server, &mut buf, "1.2.3.4:5")
            .await
            .unwrap()
            .expect("request");
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/api/health");
        assert_eq!(req.header("host"), Some("gw"));
        assert_eq!(&buf[..], b"EXTRA");
    }

    #[tokio::test]
    async fn test_health_roundtrip_and_keep_alive() {
        let (mut client, server) = duplex(4096);
        let state = test_state(None);
        let task = tokio::spawn(serve_connection(server, "1.2.3.4:5".to_string(), state));

        for _ in 0..2 {
            client
                .write_all(b"GET /api/health HTTP/1.1\r\nHost: gw\r\n\r\n")
                .await
                .unwrap();
            let mut buf = [0u8; 512];
            let n = client.read(&mut buf).await.unwrap();
            let resp = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(resp.starts_with("HTTP/1.1 200 OK"));
            assert!(resp.ends_with("ok\n"));
        }

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_websocket_session_end_to_end() {
        let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend_listener.local_addr().unwrap();
        let backend = tokio::spawn(async move {
            let (mut stream, _) = backend_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            stream.write_all(b"world").await.unwrap();
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        });

        let state = test_state(Some(backend_addr.to_string()));
        let (client_side, server_side) = duplex(16 * 1024);
        let server_task = tokio::spawn(serve_connection(
            server_side,
            "192.0.2.55:4242".to_string(),
            state,
        ));

        let ws_request = tokio_tungstenite::tungstenite::http::Request::builder()
            .method("GET")
            .uri("ws://gw.example.com/remoteDesktopGateway/")
            .header("Authorization", basic_auth())
            .header("Rdg-Connection-Id", "ws-conn-1")
            .header("Host", "gw.example.com")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .body(())
            .unwrap();
        let (mut ws, _resp) = tokio_tungstenite::client_async(ws_request, client_side)
            .await
            .expect("websocket handshake");

        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message;

        let bin = |payload: bytes::Bytes| Message::Binary(payload.to_vec());

        // handshake
        ws.send(bin(create_packet(
            PacketType::HandshakeRequest as u16,
            &[1, 0, 0, 0, 0, 0],
        )))
        .await
        .unwrap();
        let resp = ws.next().await.unwrap().unwrap().into_data();
        assert_eq!(
            u16::from_le_bytes([resp[0], resp[1]]),
            PacketType::HandshakeResponse as u16
        );

        // tunnel create / tunnel auth / channel create
        ws.send(bin(create_packet(PacketType::TunnelCreate as u16, &[0u8; 8])))
            .await
            .unwrap();
        let resp = ws.next().await.unwrap().unwrap().into_data();
        assert_eq!(
            u16::from_le_bytes([resp[0], resp[1]]),
            PacketType::TunnelResponse as u16
        );

        let name = encode_utf16("testuser\0");
        let mut body = (name.len() as u16).to_le_bytes().to_vec();
        body.extend_from_slice(&name);
        ws.send(bin(create_packet(PacketType::TunnelAuth as u16, &body)))
            .await
            .unwrap();
        let resp = ws.next().await.unwrap().unwrap().into_data();
        assert_eq!(
            u16::from_le_bytes([resp[0], resp[1]]),
            PacketType::TunnelAuthResponse as u16
        );

        let server_name = encode_utf16("anything\0");
        let mut body = vec![1, 0];
        body.extend_from_slice(&3389u16.to_le_bytes());
        body.extend_from_slice(&3u16.to_le_bytes());
        body.extend_from_slice(&(server_name.len() as u16).to_le_bytes());
        body.extend_from_slice(&server_name);
        ws.send(bin(create_packet(PacketType::ChannelCreate as u16, &body)))
            .await
            .unwrap();
        let resp = ws.next().await.unwrap().unwrap().into_data();
        assert_eq!(
            u16::from_le_bytes([resp[0], resp[1]]),
            PacketType::ChannelResponse as u16
        );

        // relay client → backend
        let mut data = vec![5, 0];
        data.extend_from_slice(b"hello");
        ws.send(bin(create_packet(PacketType::Data as u16, &data)))
            .await
            .unwrap();

        // backend → client
        let resp = ws.next().await.unwrap().unwrap().into_data();
        assert_eq!(
            u16::from_le_bytes([resp[0], resp[1]]),
            PacketType::Data as u16
        );
        assert_eq!(&resp[10..], b"world");

        ws.send(bin(create_packet(PacketType::CloseChannel as u16, &[])))
            .await
            .unwrap();

        let result = server_task.await.unwrap();
        assert!(result.is_ok());
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn test_legacy_session_end_to_end() {
        let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend_listener.local_addr().unwrap();
        let backend = tokio::spawn(async move {
            let (mut stream, _) = backend_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            stream.write_all(b"world").await.unwrap();
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        });

        let state = test_state(Some(backend_addr.to_string()));
        let auth = basic_auth();

        // OUT stream arrives first and parks its transport
        let (mut out_client, out_server) = duplex(16 * 1024);
        let out_task = tokio::spawn(serve_connection(
            out_server,
            "192.0.2.55:4242".to_string(),
            state.clone(),
        ));
        out_client
            .write_all(
                format!(
                    "{} /remoteDesktopGateway/ HTTP/1.1\r\nHost: gw\r\n\
                     Authorization: {}\r\nRdg-Connection-Id: legacy-1\r\n\r\n",
                    METHOD_RDG_OUT, auth
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        let mut head = [0u8; 256];
        let n = out_client.read(&mut head).await.unwrap();
        let accept = String::from_utf8_lossy(&head[..n]).to_string();
        assert!(accept.starts_with("HTTP/1.1 200 OK"));
        assert!(accept.contains("Transfer-Encoding: chunked"));
        out_task.await.unwrap().unwrap();

        // IN stream joins and runs the state machine
        let (mut in_client, in_server) = duplex(16 * 1024);
        let in_task = tokio::spawn(serve_connection(
            in_server,
            "192.0.2.55:4243".to_string(),
            state.clone(),
        ));
        in_client
            .write_all(
                format!(
                    "{} /remoteDesktopGateway/ HTTP/1.1\r\nHost: gw\r\n\
                     Authorization: {}\r\nRdg-Connection-Id: legacy-1\r\n\r\n",
                    METHOD_RDG_IN, auth
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        let n = in_client.read(&mut head).await.unwrap();
        let accept = String::from_utf8_lossy(&head[..n]).to_string();
        assert!(accept.contains("Content-Length: 9223372036854775807"));

        // let the post-accept drain window pass before real frames
        tokio::time::sleep(Duration::from_millis(120)).await;

        in_client
            .write_all(&create_packet(
                PacketType::HandshakeRequest as u16,
                &[1, 0, 0, 0, 0, 0],
            ))
            .await
            .unwrap();
        // responses flow on the OUT stream
        let n = out_client.read(&mut head).await.unwrap();
        assert_eq!(
            u16::from_le_bytes([head[0], head[1]]),
            PacketType::HandshakeResponse as u16
        );
        assert_eq!(n, 18);

        in_client
            .write_all(&create_packet(PacketType::TunnelCreate as u16, &[0u8; 8]))
            .await
            .unwrap();
        let _ = out_client.read(&mut head).await.unwrap();

        let name = encode_utf16("testuser\0");
        let mut body = (name.len() as u16).to_le_bytes().to_vec();
        body.extend_from_slice(&name);
        in_client
            .write_all(&create_packet(PacketType::TunnelAuth as u16, &body))
            .await
            .unwrap();
        let _ = out_client.read(&mut head).await.unwrap();

        let server_name = encode_utf16("anything\0");
        let mut body = vec![1, 0];
        body.extend_from_slice(&3389u16.to_le_bytes());
        body.extend_from_slice(&3u16.to_le_bytes());
        body.extend_from_slice(&(server_name.len() as u16).to_le_bytes());
        body.extend_from_slice(&server_name);
        in_client
            .write_all(&create_packet(PacketType::ChannelCreate as u16, &body))
            .await
            .unwrap();
        let _ = out_client.read(&mut head).await.unwrap();

        let mut data = vec![5, 0];
        data.extend_from_slice(b"hello");
        in_client
            .write_all(&create_packet(PacketType::Data as u16, &data))
            .await
            .unwrap();

        let n = out_client.read(&mut head).await.unwrap();
        assert_eq!(
            u16::from_le_bytes([head[0], head[1]]),
            PacketType::Data as u16
        );
        assert_eq!(&head[10..n], b"world");

        in_client
            .write_all(&create_packet(PacketType::CloseChannel as u16, &[]))
            .await
            .unwrap();
        let result = in_task.await.unwrap();
        assert!(result.is_ok());
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn test_legacy_in_without_out_is_rejected() {
        let state = test_state(None);
        let (mut in_client, in_server) = duplex(4096);
        let task = tokio::spawn(serve_connection(
            in_server,
            "192.0.2.55:4243".to_string(),
            state,
        ));
        in_client
            .write_all(
                format!(
                    "{} /remoteDesktopGateway/ HTTP/1.1\r\nHost: gw\r\n\
                     Authorization: {}\r\nRdg-Connection-Id: orphan\r\n\r\n",
                    METHOD_RDG_IN,
                    basic_auth()
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let result = task.await.unwrap();
        assert!(result.is_err());
    }
}
