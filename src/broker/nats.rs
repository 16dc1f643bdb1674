//! NATS broker client
//!
//! Speaks the NATS text protocol over a single shared TCP connection.
//!
//! ## Connection lifecycle
//!
//! 1. `connect` dials the server, reads `INFO`, sends `CONNECT` and waits for
//!    the `PONG` answering its first `PING`. Failure here is fatal to startup.
//! 2. A supervisor task owns the socket: it forwards client ops from the
//!    writer queue, answers server `PING`s and dispatches `MSG`s to the
//!    delivery task of the matching subscription id.
//! 3. When the socket fails the supervisor reports every live subscription
//!    as lost, marks the facade `Reconnecting` and redials with exponential
//!    backoff. Publish and subscribe fail fast with `BrokerUnavailable`
//!    while reconnecting. Subscriptions are not resumed.

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;

use super::{
    spawn_delivery, BrokerStatus, MessageHandler, PubSub, RawDelivery, SubscriptionHandle,
};
use crate::channel::Channel;
use crate::envelope::{Envelope, EnvelopeCodec};
use crate::error::{AdapterError, AdapterResult};

const DEFAULT_PORT: u16 = 4222;
const MAX_CONTROL_LINE: usize = 4096;
/// Payload limit assumed until the server's `INFO` says otherwise
const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;
const MAX_OUTSTANDING_PINGS: u32 = 2;

/// Connection settings for [`NatsBroker`]
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// Server URL, e.g. `nats://localhost:4222`
    pub url: String,
    /// Client name announced in `CONNECT`
    pub name: String,
    /// Dial + handshake timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// First reconnect delay in milliseconds
    pub reconnect_wait_ms: u64,
    /// Upper bound of the reconnect delay in milliseconds
    pub max_reconnect_wait_ms: u64,
    /// Client keepalive ping interval in milliseconds
    pub ping_interval_ms: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: format!("nats://localhost:{}", DEFAULT_PORT),
            name: "ws-adapter".to_string(),
            connect_timeout_ms: 5_000,
            reconnect_wait_ms: 500,
            max_reconnect_wait_ms: 10_000,
            ping_interval_ms: 30_000,
        }
    }
}

/// Shared NATS connection implementing the broker facade
#[derive(Clone)]
pub struct NatsBroker {
    inner: Arc<Inner>,
}

struct Inner {
    config: NatsConfig,
    codec: EnvelopeCodec,
    status: RwLock<BrokerStatus>,
    /// Queue of the live connection's writer; `None` while disconnected
    writer: Mutex<Option<mpsc::UnboundedSender<ClientOp>>>,
    /// Subscription id → slot
    subscriptions: RwLock<HashMap<u64, Slot>>,
    next_sid: AtomicU64,
    shutdown: CancellationToken,
}

struct Slot {
    subject: String,
    tx: mpsc::UnboundedSender<RawDelivery>,
}

impl NatsBroker {
    /// Dial the server and start the connection supervisor
    pub async fn connect(config: NatsConfig, codec: EnvelopeCodec) -> AdapterResult<Self> {
        let framed = establish(&config).await?;
        tracing::info!(url = %config.url, "Connected to NATS");

        let inner = Arc::new(Inner {
            config,
            codec,
            status: RwLock::new(BrokerStatus::Connected),
            writer: Mutex::new(None),
            subscriptions: RwLock::new(HashMap::new()),
            next_sid: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        *inner.writer.lock() = Some(tx);
        tokio::spawn(supervise(Arc::clone(&inner), framed, rx));

        Ok(Self { inner })
    }

    fn writer(&self) -> AdapterResult<mpsc::UnboundedSender<ClientOp>> {
        self.inner
            .writer
            .lock()
            .clone()
            .ok_or_else(|| AdapterError::BrokerUnavailable(format!("broker is {}", self.status())))
    }
}

#[async_trait]
impl PubSub for NatsBroker {
    async fn publish(&self, envelope: &Envelope) -> AdapterResult<()> {
        let payload = self.inner.codec.encode(envelope)?;
        let writer = self.writer()?;

        writer
            .send(ClientOp::Pub {
                subject: envelope.channel.subject(),
                payload,
            })
            .map_err(|_| AdapterError::BrokerUnavailable("connection lost".to_string()))
    }

    async fn subscribe(
        &self,
        channel: &Channel,
        handler: MessageHandler,
    ) -> AdapterResult<SubscriptionHandle> {
        let sid = self.inner.next_sid.fetch_add(1, Ordering::Relaxed);
        let subject = channel.subject();
        let (tx, rx) = mpsc::unbounded_channel();

        // Registering under the writer lock orders this against the
        // supervisor's disconnect: either the slot is drained as lost or the
        // subscribe fails.
        {
            let writer = self.inner.writer.lock();
            let writer = writer.as_ref().ok_or_else(|| {
                AdapterError::BrokerUnavailable(format!("broker is {}", self.status()))
            })?;
            writer
                .send(ClientOp::Sub {
                    subject: subject.clone(),
                    sid,
                })
                .map_err(|_| AdapterError::BrokerUnavailable("connection lost".to_string()))?;
            self.inner.subscriptions.write().insert(
                sid,
                Slot {
                    subject: subject.clone(),
                    tx,
                },
            );
        }

        let active = Arc::new(AtomicBool::new(true));
        spawn_delivery(
            subject.clone(),
            self.inner.codec.clone(),
            Arc::clone(&active),
            rx,
            handler,
        );

        tracing::debug!(subject = %subject, sid, "NATS subscription created");

        let inner = Arc::clone(&self.inner);
        Ok(SubscriptionHandle::new(subject, active, move || {
            let removed = inner.subscriptions.write().remove(&sid);
            if removed.is_some() {
                if let Some(writer) = inner.writer.lock().as_ref() {
                    let _ = writer.send(ClientOp::Unsub { sid });
                }
            }
        }))
    }

    async fn close(&self) {
        self.inner.shutdown.cancel();
        *self.inner.status.write() = BrokerStatus::Closed;
        self.inner.writer.lock().take();
        let lost = self.inner.drain();
        tracing::info!(subscriptions = lost, "NATS connection closed");
    }

    fn status(&self) -> BrokerStatus {
        *self.inner.status.read()
    }
}

impl Inner {
    /// Report every subscription lost and forget it
    fn drain(&self) -> usize {
        let drained: Vec<Slot> = self
            .subscriptions
            .write()
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in &drained {
            tracing::debug!(subject = %slot.subject, "Subscription lost with broker connection");
            let _ = slot.tx.send(RawDelivery::Lost);
        }
        drained.len()
    }

    fn dispatch(&self, sid: u64, payload: Vec<u8>) {
        if let Some(slot) = self.subscriptions.read().get(&sid) {
            let _ = slot.tx.send(RawDelivery::Bytes(payload));
        }
    }
}

/// Own the socket for the broker's lifetime, reconnecting on failure
async fn supervise(
    inner: Arc<Inner>,
    mut framed: Framed<TcpStream, NatsCodec>,
    mut ops: mpsc::UnboundedReceiver<ClientOp>,
) {
    loop {
        let reason = run_connection(&inner, framed, ops).await;

        inner.writer.lock().take();
        if inner.shutdown.is_cancelled() {
            *inner.status.write() = BrokerStatus::Closed;
            inner.drain();
            return;
        }

        *inner.status.write() = BrokerStatus::Reconnecting;
        let lost = inner.drain();
        tracing::warn!(
            reason = %reason,
            lost_subscriptions = lost,
            "NATS connection lost, reconnecting"
        );

        let mut wait = Duration::from_millis(inner.config.reconnect_wait_ms);
        let max_wait = Duration::from_millis(inner.config.max_reconnect_wait_ms);
        framed = loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => {
                    *inner.status.write() = BrokerStatus::Closed;
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            match establish(&inner.config).await {
                Ok(framed) => break framed,
                Err(e) => {
                    tracing::debug!(error = %e, wait_ms = wait.as_millis() as u64, "NATS reconnect failed");
                    wait = (wait * 2).min(max_wait);
                }
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *inner.writer.lock() = Some(tx);
        ops = rx;
        *inner.status.write() = BrokerStatus::Connected;
        tracing::info!(url = %inner.config.url, "Reconnected to NATS");
    }
}

/// Pump one live connection until it fails; returns the reason
async fn run_connection(
    inner: &Inner,
    framed: Framed<TcpStream, NatsCodec>,
    mut ops: mpsc::UnboundedReceiver<ClientOp>,
) -> String {
    let (mut sink, mut stream) = framed.split();
    let mut keepalive =
        tokio::time::interval(Duration::from_millis(inner.config.ping_interval_ms.max(1)));
    keepalive.tick().await;
    let mut outstanding_pings = 0u32;

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                let _ = sink.close().await;
                return "shutdown".to_string();
            }
            op = ops.recv() => {
                let Some(op) = op else {
                    return "writer closed".to_string();
                };
                if let Err(e) = sink.send(op).await {
                    return e.to_string();
                }
            }
            _ = keepalive.tick() => {
                if outstanding_pings >= MAX_OUTSTANDING_PINGS {
                    return "stale connection".to_string();
                }
                outstanding_pings += 1;
                if let Err(e) = sink.send(ClientOp::Ping).await {
                    return e.to_string();
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(ServerOp::Msg { sid, payload, .. })) => inner.dispatch(sid, payload),
                Some(Ok(ServerOp::Ping)) => {
                    if let Err(e) = sink.send(ClientOp::Pong).await {
                        return e.to_string();
                    }
                }
                Some(Ok(ServerOp::Pong)) => outstanding_pings = 0,
                Some(Ok(ServerOp::Err(message))) => {
                    tracing::warn!(error = %message, "NATS server error");
                }
                Some(Ok(ServerOp::Info(_))) | Some(Ok(ServerOp::Ok)) => {}
                Some(Err(e)) => return e.to_string(),
                None => return "connection closed by server".to_string(),
            }
        }
    }
}

#[derive(Serialize)]
struct ConnectOptions<'a> {
    verbose: bool,
    pedantic: bool,
    name: &'a str,
    lang: &'a str,
    version: &'a str,
    protocol: u8,
}

/// Dial and complete the INFO / CONNECT / PING / PONG handshake
async fn establish(config: &NatsConfig) -> AdapterResult<Framed<TcpStream, NatsCodec>> {
    let address = parse_address(&config.url)?;
    let timeout = Duration::from_millis(config.connect_timeout_ms);

    match tokio::time::timeout(timeout, handshake(&address, &config.name)).await {
        Ok(Ok(framed)) => Ok(framed),
        Ok(Err(e)) => Err(AdapterError::BrokerUnavailable(format!(
            "{}: {}",
            config.url, e
        ))),
        Err(_) => Err(AdapterError::BrokerUnavailable(format!(
            "{}: handshake timed out",
            config.url
        ))),
    }
}

async fn handshake(address: &str, name: &str) -> io::Result<Framed<TcpStream, NatsCodec>> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, NatsCodec::default());

    match framed.next().await {
        Some(Ok(ServerOp::Info(info))) => framed.codec_mut().apply_info(&info),
        Some(Ok(other)) => {
            return Err(invalid(format!("expected INFO, got {:?}", other)));
        }
        Some(Err(e)) => return Err(e),
        None => return Err(io::ErrorKind::UnexpectedEof.into()),
    }

    let options = serde_json::to_string(&ConnectOptions {
        verbose: false,
        pedantic: false,
        name,
        lang: "rust",
        version: env!("CARGO_PKG_VERSION"),
        protocol: 1,
    })?;
    framed.send(ClientOp::Connect(options)).await?;
    framed.send(ClientOp::Ping).await?;

    loop {
        match framed.next().await {
            Some(Ok(ServerOp::Pong)) => return Ok(framed),
            Some(Ok(ServerOp::Err(message))) => {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, message));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e),
            None => return Err(io::ErrorKind::UnexpectedEof.into()),
        }
    }
}

/// `nats://host:port` → `host:port`
fn parse_address(url: &str) -> AdapterResult<String> {
    let rest = match url.split_once("://") {
        Some(("nats", rest)) | Some(("tcp", rest)) => rest,
        Some((scheme, _)) => {
            return Err(AdapterError::BrokerUnavailable(format!(
                "unsupported broker scheme '{}'",
                scheme
            )))
        }
        None => url,
    };
    let host = rest.trim_end_matches('/');
    if host.is_empty() {
        return Err(AdapterError::BrokerUnavailable(format!(
            "invalid broker url '{}'",
            url
        )));
    }
    if host.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok()) {
        Ok(host.to_string())
    } else {
        Ok(format!("{}:{}", host, DEFAULT_PORT))
    }
}

/// Operations sent by the client
#[derive(Debug, Clone, PartialEq, Eq)]
enum ClientOp {
    Connect(String),
    Pub { subject: String, payload: Vec<u8> },
    Sub { subject: String, sid: u64 },
    Unsub { sid: u64 },
    Ping,
    Pong,
}

/// Operations sent by the server
#[derive(Debug, Clone, PartialEq, Eq)]
enum ServerOp {
    Info(String),
    Msg {
        subject: String,
        sid: u64,
        payload: Vec<u8>,
    },
    Ping,
    Pong,
    Ok,
    Err(String),
}

/// Fields of the server `INFO` the client acts on
#[derive(Debug, Deserialize)]
struct ServerInfo {
    #[serde(default)]
    max_payload: Option<usize>,
}

/// Line-oriented framing of the NATS protocol
#[derive(Debug)]
struct NatsCodec {
    max_payload: usize,
}

impl Default for NatsCodec {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl NatsCodec {
    /// Adopt the payload limit announced by the server
    fn apply_info(&mut self, info: &str) {
        match serde_json::from_str::<ServerInfo>(info) {
            Ok(ServerInfo {
                max_payload: Some(max),
            }) if max > 0 => self.max_payload = max,
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "Ignoring unparsable NATS INFO"),
        }
    }
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

impl Decoder for NatsCodec {
    type Item = ServerOp;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<ServerOp>> {
        let Some(line_end) = src.windows(2).position(|w| w == b"\r\n") else {
            if src.len() > MAX_CONTROL_LINE {
                return Err(invalid("control line too long"));
            }
            return Ok(None);
        };

        let line = std::str::from_utf8(&src[..line_end])
            .map_err(|_| invalid("control line is not UTF-8"))?
            .to_string();
        let (op, args) = match line.split_once(' ') {
            Some((op, args)) => (op.to_ascii_uppercase(), args.trim()),
            None => (line.trim().to_ascii_uppercase(), ""),
        };

        if op == "MSG" {
            let parts: Vec<&str> = args.split_whitespace().collect();
            let (subject, sid, len) = match parts.as_slice() {
                [subject, sid, len] | [subject, sid, _, len] => (*subject, *sid, *len),
                _ => return Err(invalid(format!("malformed MSG: {}", line))),
            };
            let sid: u64 = sid.parse().map_err(|_| invalid("invalid MSG sid"))?;
            let len: usize = len.parse().map_err(|_| invalid("invalid MSG size"))?;

            if len > self.max_payload {
                return Err(invalid(format!(
                    "MSG payload of {} bytes exceeds limit of {}",
                    len, self.max_payload
                )));
            }

            let start = line_end + 2;
            let total = start
                .checked_add(len)
                .and_then(|n| n.checked_add(2))
                .ok_or_else(|| invalid("MSG size overflows"))?;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }
            let payload = src[start..start + len].to_vec();
            let subject = subject.to_string();
            src.advance(total);
            return Ok(Some(ServerOp::Msg {
                subject,
                sid,
                payload,
            }));
        }

        let parsed = match op.as_str() {
            "PING" => ServerOp::Ping,
            "PONG" => ServerOp::Pong,
            "+OK" => ServerOp::Ok,
            "-ERR" => ServerOp::Err(args.trim_matches('\'').to_string()),
            "INFO" => ServerOp::Info(args.to_string()),
            other => return Err(invalid(format!("unknown server op '{}'", other))),
        };
        src.advance(line_end + 2);
        Ok(Some(parsed))
    }
}

impl Encoder<ClientOp> for NatsCodec {
    type Error = io::Error;

    fn encode(&mut self, item: ClientOp, dst: &mut BytesMut) -> io::Result<()> {
        match item {
            ClientOp::Connect(options) => {
                dst.put_slice(b"CONNECT ");
                dst.put_slice(options.as_bytes());
            }
            ClientOp::Pub { subject, payload } => {
                dst.put_slice(format!("PUB {} {}\r\n", subject, payload.len()).as_bytes());
                dst.put_slice(&payload);
            }
            ClientOp::Sub { subject, sid } => {
                dst.put_slice(format!("SUB {} {}", subject, sid).as_bytes());
            }
            ClientOp::Unsub { sid } => {
                dst.put_slice(format!("UNSUB {}", sid).as_bytes());
            }
            ClientOp::Ping => dst.put_slice(b"PING"),
            ClientOp::Pong => dst.put_slice(b"PONG"),
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
