//! Connection agent: the per-connection state machine.
//!
//! Each accepted connection gets one [`Agent`] driven by two tokio tasks. The
//! read task decodes packets and feeds them through [`Agent::process_packet`];
//! the write task is the only one touching the socket writer and multiplexes
//! the outbound queue, the heartbeat ticker and the die signal.
//!
//! ```text
//!  Start ──Handshake──▶ Handshake ──HandshakeAck──▶ Working
//!    │                      │                          │
//!    └──────────────────────┴──────── close() ─────────┴──▶ Closed
//! ```
//!
//! Sending never blocks: messages go through a bounded queue and a full queue
//! is reported to the caller as [`NetError::BufferExceeded`].

use crate::codec::{self, Decoder};
use crate::error::NetError;
use crate::handler::HandlerService;
use crate::message::{self, Message, MessageType};
use crate::packet::{Packet, PacketType};
use crate::scheduler::signalled;
use crate::session::{NetworkEntity, Session};
use crate::transport::{TransportRead, TransportWrite};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Size of the read buffer of each connection.
const AGENT_READ_BUFFER: usize = 2048;

/// Connection states. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum AgentState {
    Start = 0,
    Handshake = 1,
    Working = 2,
    Closed = 3,
}

impl AgentState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => AgentState::Start,
            1 => AgentState::Handshake,
            2 => AgentState::Working,
            _ => AgentState::Closed,
        }
    }
}

/// Entries of the outbound queue.
#[derive(Debug)]
pub(crate) enum Outbound {
    Message {
        kind: MessageType,
        route: String,
        mid: u64,
        payload: Bytes,
    },
    /// Already framed packet, written as is
    Raw(Bytes),
    /// Kick payload; the connection closes once it is written
    Kick(Bytes),
}

/// A client connection.
pub struct Agent {
    session: Arc<Session>,
    handler: Arc<HandlerService>,
    remote_addr: Option<SocketAddr>,
    state: AtomicU8,
    created: Instant,
    // millis since `created`
    last_at: AtomicU64,
    last_mid: AtomicU64,
    chsend: mpsc::Sender<Outbound>,
    die: watch::Sender<bool>,
}

impl Agent {
    /// Creates an agent and its session. The returned receiver is the outbound
    /// queue drained by the write loop.
    pub(crate) fn new(
        handler: Arc<HandlerService>,
        remote_addr: Option<SocketAddr>,
    ) -> (Arc<Agent>, mpsc::Receiver<Outbound>) {
        let ctx = handler.context().clone();
        let (chsend, chrecv) = mpsc::channel(ctx.config().write_backlog.max(1));
        let (die, _) = watch::channel(false);
        let sid = ctx.connections().session_id();

        let agent = Arc::new_cyclic(|weak: &Weak<Agent>| {
            let entity: Weak<dyn NetworkEntity> = weak.clone();
            Agent {
                session: Arc::new(Session::new(sid, entity, ctx.serializer().clone())),
                handler,
                remote_addr,
                state: AtomicU8::new(AgentState::Start as u8),
                created: Instant::now(),
                last_at: AtomicU64::new(0),
                last_mid: AtomicU64::new(0),
                chsend,
                die,
            }
        });

        (agent, chrecv)
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn state(&self) -> AgentState {
        AgentState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_last_mid(&self, mid: u64) {
        self.last_mid.store(mid, Ordering::Release);
    }

    fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_at.store(elapsed, Ordering::Release);
    }

    fn idle_millis(&self) -> u64 {
        let now = self.created.elapsed().as_millis() as u64;
        now.saturating_sub(self.last_at.load(Ordering::Acquire))
    }

    fn send(&self, out: Outbound) -> Result<(), NetError> {
        if self.state() == AgentState::Closed {
            return Err(NetError::BrokenPipe);
        }

        self.chsend.try_send(out).map_err(|e| match e {
            TrySendError::Full(_) => {
                warn!("Session {} send buffer exceeded", self.session.id());
                NetError::BufferExceeded
            }
            TrySendError::Closed(_) => NetError::BrokenPipe,
        })
    }

    /// Handles one decoded packet. Errors for which [`NetError::is_fatal`]
    /// holds close the connection.
    pub(crate) fn process_packet(self: &Arc<Self>, packet: Packet) -> Result<(), NetError> {
        self.touch();
        let ctx = self.handler.context();

        match packet.kind {
            PacketType::Handshake => {
                if let Some(validator) = ctx.validator() {
                    validator(&packet.data).map_err(|e| NetError::HandshakeRejected(e.to_string()))?;
                }
                if let Err(state) = self.state.compare_exchange(
                    AgentState::Start as u8,
                    AgentState::Handshake as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    warn!(
                        "Ignoring handshake in state {:?}, Id={}",
                        AgentState::from_u8(state),
                        self.session.id()
                    );
                    return Ok(());
                }
                self.send(Outbound::Raw(ctx.handshake_response().clone()))?;
                debug!(
                    "Session handshake Id={}, Remote={:?}",
                    self.session.id(),
                    self.remote_addr
                );
            }
            PacketType::HandshakeAck => {
                match self.state.compare_exchange(
                    AgentState::Handshake as u8,
                    AgentState::Working as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => debug!("Receive handshake ACK Id={}", self.session.id()),
                    Err(state) => warn!(
                        "Ignoring handshake ACK in state {:?}, Id={}",
                        AgentState::from_u8(state),
                        self.session.id()
                    ),
                }
            }
            PacketType::Data => {
                let state = self.state();
                if state != AgentState::Working {
                    return Err(NetError::UnexpectedPacket(format!(
                        "data packet in state {:?}",
                        state
                    )));
                }
                let msg = message::decode(&packet.data, ctx.dictionary())?;
                self.handler.process_message(self, msg);
            }
            PacketType::Heartbeat => {}
            PacketType::Kick => {
                debug!("Client sent kick packet, Id={}", self.session.id());
            }
        }

        Ok(())
    }

    async fn read_loop<R: TransportRead>(self: Arc<Self>, mut reader: R) {
        let mut decoder = Decoder::new();
        let mut buf = [0u8; AGENT_READ_BUFFER];
        let dead = signalled(self.die.subscribe());
        tokio::pin!(dead);

        'read: loop {
            let n = tokio::select! {
                result = reader.read_chunk(&mut buf) => match result {
                    Ok(0) => {
                        debug!("Peer closed session {}", self.session.id());
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Read message error: {}, session will be closed", e);
                        break;
                    }
                },
                _ = &mut dead => break,
            };

            let packets = match decoder.decode(&buf[..n]) {
                Ok(packets) => packets,
                Err(e) => {
                    warn!("Decode packet failed on session {}: {}", self.session.id(), e);
                    break;
                }
            };

            for packet in packets {
                match self.process_packet(packet) {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => {
                        warn!("Session {} closed: {}", self.session.id(), e);
                        break 'read;
                    }
                    Err(e) => warn!("Process packet on session {} failed: {}", self.session.id(), e),
                }
            }
        }

        let _ = self.close();
    }

    async fn write_loop<W: TransportWrite>(self: Arc<Self>, mut writer: W, mut chrecv: mpsc::Receiver<Outbound>) {
        let ctx = self.handler.context().clone();
        let heartbeat = ctx.config().heartbeat;
        let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let dead = signalled(self.die.subscribe());
        tokio::pin!(dead);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.idle_millis() > (heartbeat * 2).as_millis() as u64 {
                        debug!("Session heartbeat timeout, Id={}", self.session.id());
                        break;
                    }
                    if let Err(e) = writer.write_frame(ctx.heartbeat_packet()).await {
                        debug!("Write heartbeat failed: {}", e);
                        break;
                    }
                }
                out = chrecv.recv() => {
                    let Some(out) = out else { break };
                    let (frame, last) = match out {
                        Outbound::Raw(frame) => (frame, false),
                        Outbound::Kick(data) => match codec::encode(PacketType::Kick, &data) {
                            Ok(frame) => (frame, true),
                            Err(e) => {
                                warn!("Encode kick packet failed: {}", e);
                                break;
                            }
                        },
                        Outbound::Message { kind, route, mid, payload } => {
                            match self.encode_message(kind, route, mid, payload) {
                                Ok(frame) => (frame, false),
                                Err(e) => {
                                    warn!("Dropping outbound message on session {}: {}", self.session.id(), e);
                                    continue;
                                }
                            }
                        }
                    };

                    if let Err(e) = writer.write_frame(&frame).await {
                        debug!("Write message failed: {}", e);
                        break;
                    }
                    if last {
                        debug!("Session {} kicked", self.session.id());
                        break;
                    }
                }
                _ = &mut dead => break,
            }
        }

        chrecv.close();
        if let Err(e) = writer.shutdown().await {
            debug!("Shutdown writer failed: {}", e);
        }
        let _ = self.close();

        let session = self.session.clone();
        let lifetime = ctx.lifetime().clone();
        ctx.scheduler().push_task(move || {
            lifetime.close(&session);
            session.clear();
        });

        ctx.connections().decrement();
        debug!(
            "Session write goroutine exit, SessionID={}, UID={}",
            self.session.id(),
            self.session.uid()
        );
    }

    fn encode_message(&self, kind: MessageType, route: String, mid: u64, payload: Bytes) -> Result<Bytes, NetError> {
        let ctx = self.handler.context();
        let msg = Message::new(kind, mid, route, payload);
        let msg = ctx.pipeline().outbound().process(&self.session, msg)?;
        let encoded = message::encode(&msg, ctx.dictionary())?;
        codec::encode(PacketType::Data, &encoded)
    }
}

impl NetworkEntity for Agent {
    fn push(&self, route: &str, data: Bytes) -> Result<(), NetError> {
        self.send(Outbound::Message {
            kind: MessageType::Push,
            route: route.to_string(),
            mid: 0,
            payload: data,
        })
    }

    fn response(&self, data: Bytes) -> Result<(), NetError> {
        self.response_mid(self.last_mid(), data)
    }

    fn response_mid(&self, mid: u64, data: Bytes) -> Result<(), NetError> {
        if mid == 0 {
            return Err(NetError::NotifyMode);
        }
        self.send(Outbound::Message {
            kind: MessageType::Response,
            route: String::new(),
            mid,
            payload: data,
        })
    }

    fn kick(&self, data: Bytes) -> Result<(), NetError> {
        self.send(Outbound::Kick(data))
    }

    fn close(&self) -> Result<(), NetError> {
        if self.state.swap(AgentState::Closed as u8, Ordering::AcqRel) == AgentState::Closed as u8 {
            return Err(NetError::AlreadyClosed("agent"));
        }
        debug!(
            "Session closed, Id={}, UID={}, Remote={:?}",
            self.session.id(),
            self.session.uid(),
            self.remote_addr
        );
        self.die.send_replace(true);
        Ok(())
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn last_mid(&self) -> u64 {
        self.last_mid.load(Ordering::Acquire)
    }
}

/// Runs a connection to completion on the current task.
///
/// Spawns the write loop, drives the read loop until the peer disconnects or
/// the agent is closed, and returns once both sides are done.
pub async fn serve<R, W>(handler: Arc<HandlerService>, reader: R, writer: W, remote_addr: Option<SocketAddr>)
where
    R: TransportRead + 'static,
    W: TransportWrite + 'static,
{
    let ctx = handler.context().clone();
    ctx.connections().increment();

    let (agent, chrecv) = Agent::new(handler, remote_addr);
    info!(
        "🔗 New session established, Id={}, Remote={:?}",
        agent.session().id(),
        remote_addr
    );

    let writer_task = tokio::spawn(agent.clone().write_loop(writer, chrecv));
    agent.read_loop(reader).await;

    if let Err(e) = writer_task.await {
        warn!("Write loop task failed: {}", e);
    }
}
