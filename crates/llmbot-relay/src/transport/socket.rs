//! WebSocket connection driven by a background task

use super::keepalive::{aligned_interval, HEARTBEAT_PERIOD};
use super::Dialect;
use crate::error::{RelayError, Result};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Largest proxy CONNECT response head we are willing to buffer
const MAX_PROXY_RESPONSE: usize = 8 * 1024;

/// Connection settings shared by every socket a backend opens
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Handshake budget
    pub connect_timeout: Duration,
    /// HTTP proxy tunnelled through with `CONNECT`
    pub proxy: Option<String>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            proxy: None,
        }
    }
}

/// Handle that closes a socket from outside its owner
#[derive(Debug, Clone)]
pub struct SocketCloser(CancellationToken);

impl SocketCloser {
    /// Signal the driver to close; idempotent
    pub fn close(&self) {
        self.0.cancel();
    }
}

/// Bidirectional, dialect-framed WebSocket
///
/// A spawned driver task owns the stream. It answers ping frames and sends
/// heartbeats on its own, so callers only see decoded events.
pub struct FramedSocket<D: Dialect> {
    dialect: Arc<D>,
    outbound: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedReceiver<D::Event>,
    shutdown: CancellationToken,
}

impl<D: Dialect> FramedSocket<D> {
    /// Connect to `url` with extra request headers
    pub async fn open(
        url: &str,
        headers: &[(&str, String)],
        dialect: D,
        options: &SocketOptions,
    ) -> Result<Self> {
        let mut request = url
            .into_client_request()
            .map_err(|e| RelayError::Connection(format!("invalid socket url {url}: {e}")))?;
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| RelayError::Connection(format!("invalid header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| RelayError::Connection(format!("invalid header value: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let connect = async {
            match options.proxy.as_deref() {
                Some(proxy) => connect_via_proxy(request, proxy).await,
                None => tokio_tungstenite::connect_async(request)
                    .await
                    .map(|(stream, _)| stream)
                    .map_err(|e| RelayError::Connection(e.to_string())),
            }
        };
        let stream = tokio::time::timeout(options.connect_timeout, connect)
            .await
            .map_err(|_| {
                RelayError::Connection(format!(
                    "timed out after {:?} connecting to {url}",
                    options.connect_timeout
                ))
            })??;

        debug!(dialect = dialect.name(), %url, "socket open");
        Ok(Self::spawn(stream, dialect))
    }

    fn spawn(stream: Stream, dialect: D) -> Self {
        let dialect = Arc::new(dialect);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        // Queued ahead of anything the caller sends
        for frame in dialect.handshake() {
            let _ = outbound.send(frame);
        }

        tokio::spawn(drive(
            stream,
            dialect.clone(),
            outbound_rx,
            events_tx,
            shutdown.clone(),
        ));

        Self {
            dialect,
            outbound,
            events,
            shutdown,
        }
    }

    /// Send a JSON value wrapped in the dialect envelope
    pub fn send(&self, value: &serde_json::Value) -> Result<()> {
        self.send_raw(self.dialect.encode(value))
    }

    /// Send an already framed payload
    pub fn send_raw(&self, frame: String) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(RelayError::Connection("socket is closed".to_string()));
        }
        self.outbound
            .send(frame)
            .map_err(|_| RelayError::Connection("socket is closed".to_string()))
    }

    /// Next decoded event, `None` once the socket closed
    ///
    /// Events that arrived before the peer closed are still delivered; after
    /// [`close`](Self::close) nothing is.
    pub async fn next_event(&mut self) -> Option<D::Event> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    /// Close the connection; later calls are no-ops
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Whether `close` was called or the driver stopped
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.outbound.is_closed()
    }

    /// Cloneable handle for closing from another task
    pub fn closer(&self) -> SocketCloser {
        SocketCloser(self.shutdown.clone())
    }
}

impl<D: Dialect> Drop for FramedSocket<D> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn drive<D: Dialect>(
    stream: Stream,
    dialect: Arc<D>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<D::Event>,
    shutdown: CancellationToken,
) {
    let (mut sink, mut source) = stream.split();
    let heartbeat_frame = dialect.heartbeat();
    let mut heartbeat = aligned_interval(HEARTBEAT_PERIOD);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            Some(frame) = outbound.recv() => {
                trace!(dialect = dialect.name(), %frame, "send");
                if let Err(e) = sink.send(Message::Text(frame.into())).await {
                    debug!(dialect = dialect.name(), error = %e, "send failed");
                    break;
                }
            }

            _ = heartbeat.tick(), if heartbeat_frame.is_some() => {
                if let Some(frame) = &heartbeat_frame {
                    if let Err(e) = sink.send(Message::Text(frame.clone().into())).await {
                        debug!(dialect = dialect.name(), error = %e, "heartbeat failed");
                        break;
                    }
                }
            }

            incoming = source.next() => {
                let payload = match incoming {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(dialect = dialect.name(), ?frame, "closed by peer");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(dialect = dialect.name(), error = %e, "read failed");
                        break;
                    }
                    None => break,
                };

                trace!(dialect = dialect.name(), %payload, "recv");
                for event in dialect.decode(&payload) {
                    if let Some(reply) = dialect.reply_to(&event) {
                        if let Err(e) = sink.send(Message::Text(reply.into())).await {
                            debug!(dialect = dialect.name(), error = %e, "pong failed");
                        }
                    }
                    // Receiver gone means the owner stopped listening; keep
                    // answering pings until it closes us.
                    let _ = events.send(event);
                }
            }
        }
    }

    let _ = sink.close().await;
    debug!(dialect = dialect.name(), "socket driver stopped");
}

async fn connect_via_proxy(request: Request, proxy: &str) -> Result<Stream> {
    let proxy_url = reqwest::Url::parse(proxy)
        .map_err(|e| RelayError::Config(format!("invalid proxy url {proxy}: {e}")))?;
    let proxy_host = proxy_url
        .host_str()
        .ok_or_else(|| RelayError::Config(format!("proxy url has no host: {proxy}")))?;
    let proxy_port = proxy_url.port_or_known_default().unwrap_or(8080);

    let target_host = request
        .uri()
        .host()
        .ok_or_else(|| RelayError::Connection("socket url has no host".to_string()))?
        .to_string();
    let target_port = request
        .uri()
        .port_u16()
        .unwrap_or(match request.uri().scheme_str() {
            Some("wss") => 443,
            _ => 80,
        });

    let mut tcp = TcpStream::connect((proxy_host, proxy_port))
        .await
        .map_err(|e| RelayError::Connection(format!("proxy {proxy} unreachable: {e}")))?;
    let connect = format!(
        "CONNECT {target_host}:{target_port} HTTP/1.1\r\nHost: {target_host}:{target_port}\r\n\r\n"
    );
    tcp.write_all(connect.as_bytes())
        .await
        .map_err(|e| RelayError::Connection(format!("proxy write failed: {e}")))?;

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > MAX_PROXY_RESPONSE {
            return Err(RelayError::Connection(
                "proxy response head too large".to_string(),
            ));
        }
        tcp.read_exact(&mut byte)
            .await
            .map_err(|e| RelayError::Connection(format!("proxy read failed: {e}")))?;
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    if status_line.split_whitespace().nth(1) != Some("200") {
        return Err(RelayError::Connection(format!(
            "proxy refused tunnel: {status_line}"
        )));
    }

    let (stream, _) = tokio_tungstenite::client_async_tls(request, tcp)
        .await
        .map_err(|e| RelayError::Connection(e.to_string()))?;
    Ok(stream)
}
