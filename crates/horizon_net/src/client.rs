//! Client connector.
//!
//! A minimal client for bots, load tests and integration tests. It performs
//! the handshake, matches responses to requests by message id, dispatches
//! pushes to registered callbacks and answers server heartbeats.

use crate::codec::{self, Decoder};
use crate::error::NetError;
use crate::message::{self, Message, MessageType, RouteDictionary};
use crate::packet::{Packet, PacketType};
use crate::scheduler::signalled;
use crate::serializer::{self, JsonSerializer, Serializer};
use crate::transport::{TransportRead, TransportWrite};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Callback invoked with the payload of a push.
pub type PushCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Connector settings.
#[derive(Clone)]
pub struct ConnectorOptions {
    pub serializer: Arc<dyn Serializer>,
    /// Must match the server's dictionary when route compression is used
    pub dictionary: Arc<RouteDictionary>,
    /// Payload of the handshake packet
    pub handshake: Value,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            serializer: Arc::new(JsonSerializer::new()),
            dictionary: Arc::new(RouteDictionary::new()),
            handshake: json!({
                "sys": { "type": "rust", "version": env!("CARGO_PKG_VERSION") },
                "user": {},
            }),
        }
    }
}

struct ConnectorInner {
    options: ConnectorOptions,
    chsend: mpsc::UnboundedSender<Bytes>,
    mid: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Bytes>>>,
    events: Mutex<HashMap<String, PushCallback>>,
    die: watch::Sender<bool>,
}

impl ConnectorInner {
    fn send_frame(&self, frame: Bytes) -> Result<(), NetError> {
        self.chsend.send(frame).map_err(|_| NetError::BrokenPipe)
    }

    fn send_message(&self, msg: &Message) -> Result<(), NetError> {
        let encoded = message::encode(msg, &self.options.dictionary)?;
        self.send_frame(codec::encode(PacketType::Data, &encoded)?)
    }

    fn process_packet(&self, packet: Packet) -> Result<bool, NetError> {
        match packet.kind {
            PacketType::Data => {
                let msg = message::decode(&packet.data, &self.options.dictionary)?;
                match msg.kind {
                    MessageType::Response => match self.pending.lock().remove(&msg.id) {
                        Some(tx) => {
                            let _ = tx.send(msg.data);
                        }
                        None => debug!("Response {} has no pending request", msg.id),
                    },
                    MessageType::Push => {
                        let callback = self.events.lock().get(&msg.route).cloned();
                        match callback {
                            Some(callback) => callback(msg.data),
                            None => debug!("No callback for push {}", msg.route),
                        }
                    }
                    other => warn!("Unexpected {} message from server", other),
                }
            }
            PacketType::Heartbeat => {
                self.send_frame(codec::encode(PacketType::Heartbeat, &[])?)?;
            }
            PacketType::Kick => {
                info!("👢 Kicked by server");
                return Ok(false);
            }
            other => debug!("Ignoring {:?} packet", other),
        }
        Ok(true)
    }
}

/// A connection to a server.
pub struct Connector {
    inner: Arc<ConnectorInner>,
    heartbeat: Duration,
}

impl Connector {
    /// Connects over TCP with default options.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, NetError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Self::handshake(reader, writer, ConnectorOptions::default()).await
    }

    /// Performs the handshake over an established transport and starts the
    /// read and write tasks.
    pub async fn handshake<R, W>(mut reader: R, mut writer: W, options: ConnectorOptions) -> Result<Self, NetError>
    where
        R: TransportRead + 'static,
        W: TransportWrite + 'static,
    {
        let hello = serde_json::to_vec(&options.handshake)?;
        writer.write_frame(&codec::encode(PacketType::Handshake, &hello)?).await?;

        let mut decoder = Decoder::new();
        let mut buf = [0u8; 2048];
        let (response, backlog) = loop {
            let n = reader.read_chunk(&mut buf).await?;
            if n == 0 {
                return Err(NetError::BrokenPipe);
            }
            let mut packets = decoder.decode(&buf[..n])?;
            if let Some(pos) = packets.iter().position(|p| p.kind == PacketType::Handshake) {
                let backlog = packets.split_off(pos + 1);
                break (packets.remove(pos), backlog);
            }
        };

        let body: Value = serde_json::from_slice(&response.data)?;
        if body["code"] != 200 {
            return Err(NetError::HandshakeRejected(body.to_string()));
        }
        let heartbeat = body["sys"]["heartbeat"]
            .as_f64()
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or_default();
        writer.write_frame(&codec::encode(PacketType::HandshakeAck, &[])?).await?;

        let (chsend, chrecv) = mpsc::unbounded_channel();
        let (die, _) = watch::channel(false);
        let inner = Arc::new(ConnectorInner {
            options,
            chsend,
            mid: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            die,
        });

        tokio::spawn(write_loop(inner.clone(), writer, chrecv));
        tokio::spawn(read_loop(inner.clone(), reader, decoder, backlog));

        debug!("Handshake completed, heartbeat {:?}", heartbeat);
        Ok(Self { inner, heartbeat })
    }

    /// Heartbeat interval announced by the server.
    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    /// Sends a request and waits for its response.
    pub async fn request<Req, Resp>(&self, route: &str, v: &Req) -> Result<Resp, NetError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let data = self.request_raw(route, serializer::serialize(self.inner.options.serializer.as_ref(), v)?).await?;
        serializer::deserialize(self.inner.options.serializer.as_ref(), &data)
    }

    /// Sends a request with an already encoded payload.
    pub async fn request_raw(&self, route: &str, data: Bytes) -> Result<Bytes, NetError> {
        if self.is_closed() {
            return Err(NetError::BrokenPipe);
        }
        let mid = self.inner.mid.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(mid, tx);

        if let Err(e) = self.inner.send_message(&Message::request(mid, route, data)) {
            self.inner.pending.lock().remove(&mid);
            return Err(e);
        }
        rx.await.map_err(|_| NetError::BrokenPipe)
    }

    /// Sends a notify; no response is expected.
    pub fn notify<T: Serialize + ?Sized>(&self, route: &str, v: &T) -> Result<(), NetError> {
        let data = serializer::serialize(self.inner.options.serializer.as_ref(), v)?;
        self.inner.send_message(&Message::notify(route, data))
    }

    /// Registers the callback for pushes on `route`, replacing any previous one.
    pub fn on<F>(&self, route: impl Into<String>, callback: F)
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        self.inner.events.lock().insert(route.into(), Arc::new(callback));
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.die.borrow()
    }

    /// Closes the connection. Pending requests fail with `BrokenPipe`.
    pub fn close(&self) {
        self.inner.die.send_replace(true);
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write_loop<W: TransportWrite>(inner: Arc<ConnectorInner>, mut writer: W, mut chrecv: mpsc::UnboundedReceiver<Bytes>) {
    let dead = signalled(inner.die.subscribe());
    tokio::pin!(dead);

    loop {
        tokio::select! {
            frame = chrecv.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = writer.write_frame(&frame).await {
                    debug!("Connector write failed: {}", e);
                    break;
                }
            }
            _ = &mut dead => break,
        }
    }

    let _ = writer.shutdown().await;
    inner.die.send_replace(true);
}

async fn read_loop<R: TransportRead>(
    inner: Arc<ConnectorInner>,
    mut reader: R,
    mut decoder: Decoder,
    backlog: Vec<Packet>,
) {
    let dead = signalled(inner.die.subscribe());
    tokio::pin!(dead);
    let mut buf = [0u8; 2048];
    let mut packets = backlog;

    'read: loop {
        for packet in packets.drain(..) {
            match inner.process_packet(packet) {
                Ok(true) => {}
                Ok(false) => break 'read,
                Err(e) => {
                    warn!("Connector dropping connection: {}", e);
                    break 'read;
                }
            }
        }

        let n = tokio::select! {
            result = reader.read_chunk(&mut buf) => match result {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
            _ = &mut dead => break,
        };
        packets = match decoder.decode(&buf[..n]) {
            Ok(packets) => packets,
            Err(e) => {
                warn!("Connector decode failed: {}", e);
                break;
            }
        };
    }

    inner.die.send_replace(true);
    // fail every request still waiting
    inner.pending.lock().clear();
}
