//! Client-side transports for the gateway session.
//!
//! A transport delivers opaque chunks in both directions; packet framing is
//! layered on top (see `rdg::packet`). Two implementations exist: a duplex
//! WebSocket split into read/write halves, and the legacy pair of hijacked
//! HTTP half-streams (`RDG_IN_DATA` read-only, `RDG_OUT_DATA` write-only).

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::error::GatewayError;

/// A bidirectional packet pipe to the RDG client. Implementations that
/// only serve one direction report `Unsupported` for the other.
#[async_trait]
pub trait Transport: Send {
    /// Read one transport chunk as delivered by the underlying stream.
    async fn read_packet(&mut self) -> Result<Bytes, GatewayError>;
    /// Write already-framed bytes. A single call is atomic with respect
    /// to other writers holding the same transport.
    async fn write_packet(&mut self, data: &[u8]) -> Result<usize, GatewayError>;
    async fn close(&mut self) -> Result<(), GatewayError>;
}

fn ws_err(e: tokio_tungstenite::tungstenite::Error) -> GatewayError {
    GatewayError::TransportIo(io::Error::new(io::ErrorKind::Other, e))
}

fn unsupported(dir: &str) -> GatewayError {
    GatewayError::TransportIo(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("transport is {}-only", dir),
    ))
}

// ---- WebSocket ----

/// Read half of a duplex WebSocket session. Each binary message is one
/// transport chunk; pings and pongs are handled below this layer.
pub struct WsReadTransport<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

/// Write half of a duplex WebSocket session.
pub struct WsWriteTransport<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

/// Split an accepted WebSocket into the two transport halves.
pub fn split_websocket<S>(ws: WebSocketStream<S>) -> (WsReadTransport<S>, WsWriteTransport<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (sink, stream) = ws.split();
    (WsReadTransport { inner: stream }, WsWriteTransport { inner: sink })
}

#[async_trait]
impl<S> Transport for WsReadTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_packet(&mut self) -> Result<Bytes, GatewayError> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Bytes::from(data)),
                Some(Ok(Message::Text(text))) => return Ok(Bytes::from(text.into_bytes())),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Err(GatewayError::ConnectionClosed),
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(e)) => return Err(ws_err(e)),
            }
        }
    }

    async fn write_packet(&mut self, _data: &[u8]) -> Result<usize, GatewayError> {
        Err(unsupported("read"))
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        // the write half owns the close frame
        Ok(())
    }
}

#[async_trait]
impl<S> Transport for WsWriteTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_packet(&mut self) -> Result<Bytes, GatewayError> {
        Err(unsupported("write"))
    }

    async fn write_packet(&mut self, data: &[u8]) -> Result<usize, GatewayError> {
        self.inner
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(ws_err)?;
        Ok(data.len())
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        if let Err(e) = self.inner.send(Message::Close(None)).await {
            debug!("WebSocket close frame not delivered: {}", e);
        }
        self.inner.close().await.map_err(ws_err)
    }
}

// ---- Legacy hijacked half-streams ----

/// Accept head for the server→client half; the framed stream that follows
/// never actually uses chunked encoding, but clients require the header.
const ACCEPT_CHUNKED: &[u8] =
    b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
/// Accept head for the client→server half: an effectively unbounded body.
const ACCEPT_UNBOUNDED: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Length: 9223372036854775807\r\n\r\n";

/// How long the post-accept drain waits for preamble bytes that some
/// pre-WebSocket clients send on the IN stream.
const DRAIN_GRACE: Duration = Duration::from_millis(50);

/// A hijacked HTTP half-stream. Constructed once the request head has been
/// consumed; any body bytes already buffered are surfaced first.
pub struct LegacyTransport<S> {
    stream: S,
    leftover: BytesMut,
}

impl<S> LegacyTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, leftover: BytesMut) -> Self {
        LegacyTransport { stream, leftover }
    }

    /// One-shot: write the HTTP accept head for this half-stream. Must be
    /// called before any framed traffic.
    pub async fn send_accept(&mut self, chunked: bool) -> Result<(), GatewayError> {
        let head = if chunked { ACCEPT_CHUNKED } else { ACCEPT_UNBOUNDED };
        self.stream
            .write_all(head)
            .await
            .map_err(GatewayError::TransportIo)?;
        self.stream.flush().await.map_err(GatewayError::TransportIo)?;
        Ok(())
    }

    /// Consume and discard any handshake preamble on the IN stream: bytes
    /// already buffered past the request head, plus anything that arrives
    /// within a short grace window.
    pub async fn drain(&mut self) {
        let buffered = self.leftover.len();
        self.leftover.clear();

        let mut buf = [0u8; 4096];
        let grace = tokio::time::timeout(DRAIN_GRACE, self.stream.read(&mut buf)).await;
        let extra = match grace {
            Ok(Ok(n)) => n,
            _ => 0,
        };
        if buffered > 0 || extra > 0 {
            debug!(buffered, extra, "drained legacy preamble");
        }
    }
}

#[async_trait]
impl<S> Transport for LegacyTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_packet(&mut self) -> Result<Bytes, GatewayError> {
        if !self.leftover.is_empty() {
            return Ok(self.leftover.split().freeze());
        }
        let mut buf = vec![0u8; 4096];
        let n = self
            .stream
            .read(&mut buf)
            .await
            .map_err(GatewayError::TransportIo)?;
        if n == 0 {
            return Err(GatewayError::ConnectionClosed);
        }
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn write_packet(&mut self, data: &[u8]) -> Result<usize, GatewayError> {
        self.stream
            .write_all(data)
            .await
            .map_err(GatewayError::TransportIo)?;
        self.stream.flush().await.map_err(GatewayError::TransportIo)?;
        Ok(data.len())
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        self.stream
            .shutdown()
            .await
            .map_err(GatewayError::TransportIo)
    }
}

// ---- Test support ----
