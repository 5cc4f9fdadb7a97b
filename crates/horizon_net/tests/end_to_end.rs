//! End-to-end tests against a real listener on 127.0.0.1.

use bytes::Bytes;
use horizon_net::client::ConnectorOptions;
use horizon_net::codec::{self, Decoder};
use horizon_net::serializer::JsonSerializer;
use horizon_net::transport::split_websocket;
use horizon_net::{
    Connector, Group, Message, MessageType, NetServer, Packet, PacketType, RouteDictionary, ServerBuilder,
    ServerConfig, Service, TransportKind,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

fn local_config() -> ServerConfig {
    ServerConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..ServerConfig::default()
    }
}

fn echo() -> Service {
    Service::new("Echo").handle("Ping", |session, _text: String| session.response(&"pong"))
}

async fn start(builder: ServerBuilder) -> (Arc<NetServer>, SocketAddr, JoinHandle<()>) {
    let server = Arc::new(builder.build().unwrap());
    let listener = server.listen().unwrap();
    let addr = listener.local_addr().unwrap();

    let running = server.clone();
    let handle = tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });
    (server, addr, handle)
}

async fn stop(server: Arc<NetServer>, handle: JoinHandle<()>) {
    server.shutdown();
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
}

/// Speaks the wire protocol by hand.
struct RawClient {
    stream: TcpStream,
    decoder: Decoder,
    queue: VecDeque<Packet>,
}

impl RawClient {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            decoder: Decoder::new(),
            queue: VecDeque::new(),
        }
    }

    async fn send(&mut self, kind: PacketType, data: &[u8]) {
        let frame = codec::encode(kind, data).unwrap();
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn send_message(&mut self, msg: &Message, dict: &RouteDictionary) {
        let encoded = horizon_net::message::encode(msg, dict).unwrap();
        self.send(PacketType::Data, &encoded).await;
    }

    /// Next packet that is not a heartbeat, or None on EOF.
    async fn next(&mut self) -> Option<Packet> {
        loop {
            while let Some(packet) = self.queue.pop_front() {
                if packet.kind != PacketType::Heartbeat {
                    return Some(packet);
                }
            }
            let mut buf = [0u8; 1024];
            let n = tokio::time::timeout(WAIT, self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for packet")
                .ok()?;
            if n == 0 {
                return None;
            }
            self.queue.extend(self.decoder.decode(&buf[..n]).unwrap());
        }
    }

    async fn handshake(&mut self) -> Value {
        self.send(PacketType::Handshake, br#"{"sys":{"type":"test"}}"#).await;
        let packet = self.next().await.expect("handshake response");
        assert_eq!(packet.kind, PacketType::Handshake);
        self.send(PacketType::HandshakeAck, &[]).await;
        serde_json::from_slice(&packet.data).unwrap()
    }
}

#[tokio::test]
async fn test_raw_echo_request() {
    let (server, addr, handle) = start(NetServer::builder(local_config()).service(echo())).await;

    let mut client = RawClient::connect(addr).await;
    let body = client.handshake().await;
    assert_eq!(body["code"], 200);
    assert_eq!(body["sys"]["heartbeat"], 30);

    let dict = RouteDictionary::new();
    client
        .send_message(&Message::request(1, "Echo.Ping", Bytes::from_static(b"\"hi\"")), &dict)
        .await;

    let packet = client.next().await.expect("response packet");
    assert_eq!(packet.kind, PacketType::Data);
    let msg = horizon_net::message::decode(&packet.data, &dict).unwrap();
    assert_eq!(msg.kind, MessageType::Response);
    assert_eq!(msg.id, 1);
    assert_eq!(msg.data.as_ref(), b"\"pong\"");

    stop(server, handle).await;
}

#[tokio::test]
async fn test_data_before_handshake_closes_connection() {
    let (server, addr, handle) = start(NetServer::builder(local_config()).service(echo())).await;

    let mut client = RawClient::connect(addr).await;
    client
        .send_message(
            &Message::request(1, "Echo.Ping", Bytes::from_static(b"\"hi\"")),
            &RouteDictionary::new(),
        )
        .await;
    assert!(client.next().await.is_none());

    stop(server, handle).await;
}

#[tokio::test]
async fn test_connector_request_and_push() {
    let group = Arc::new(Group::new("lobby", Arc::new(JsonSerializer::new())));
    let lobby = group.clone();
    let room = Service::new("Room").handle("Join", move |session, _: Value| {
        lobby.add(session.clone())?;
        session.response(&json!({ "code": 0 }))?;
        lobby.broadcast("onJoin", &json!({ "sid": session.id() }))
    });

    let (server, addr, handle) = start(NetServer::builder(local_config()).service(echo()).service(room)).await;

    let client = Connector::connect(addr).await.unwrap();
    assert_eq!(client.heartbeat(), Duration::from_secs(30));

    let pong: String = client.request("Echo.Ping", "hi").await.unwrap();
    assert_eq!(pong, "pong");

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on("onJoin", move |data| {
        let _ = tx.send(data);
    });
    let reply: Value = client.request("Room.Join", &json!({})).await.unwrap();
    assert_eq!(reply["code"], 0);

    let push = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    let push: Value = serde_json::from_slice(&push).unwrap();
    assert!(push["sid"].as_i64().unwrap() > 0);
    assert_eq!(group.count(), 1);

    client.close();
    stop(server, handle).await;
}

#[tokio::test]
async fn test_lifetime_hook_fires_on_disconnect() {
    let (server, addr, handle) = start(NetServer::builder(local_config()).service(echo())).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.context().lifetime().on_closed(move |session| {
        let _ = tx.send(session.id());
    });

    let client = Connector::connect(addr).await.unwrap();
    let _: String = client.request("Echo.Ping", "hi").await.unwrap();
    assert_eq!(server.context().connections().count(), 1);
    client.close();

    let sid = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(sid > 0);

    stop(server, handle).await;
}

#[tokio::test]
async fn test_silent_client_times_out() {
    let config = ServerConfig {
        heartbeat: Duration::from_millis(300),
        ..local_config()
    };
    let (server, addr, handle) = start(NetServer::builder(config).service(echo())).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.context().lifetime().on_closed(move |session| {
        let _ = tx.send(session.id());
    });

    let mut client = RawClient::connect(addr).await;
    let body = client.handshake().await;
    assert_eq!(body["sys"]["heartbeat"].as_f64(), Some(0.3));

    // never answer heartbeats; the server drops us after two silent periods
    let started = tokio::time::Instant::now();
    assert!(client.next().await.is_none());
    assert!(started.elapsed() >= Duration::from_millis(600));

    let sid = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(sid > 0);

    stop(server, handle).await;
}

#[test]
fn test_zero_heartbeat_fails_build() {
    let config = ServerConfig {
        heartbeat: Duration::ZERO,
        ..local_config()
    };
    assert!(matches!(
        NetServer::builder(config).service(echo()).build(),
        Err(horizon_net::NetError::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn test_kick_then_close() {
    let admin = Service::new("Admin").handle("Kick", |session, _: Value| session.kick(&json!({ "reason": "bye" })));
    let (server, addr, handle) = start(NetServer::builder(local_config()).service(admin)).await;

    let mut client = RawClient::connect(addr).await;
    client.handshake().await;
    client
        .send_message(&Message::notify("Admin.Kick", Bytes::from_static(b"{}")), &RouteDictionary::new())
        .await;

    let packet = client.next().await.expect("kick packet");
    assert_eq!(packet.kind, PacketType::Kick);
    assert_eq!(packet.data.as_ref(), br#"{"reason":"bye"}"#);
    assert!(client.next().await.is_none());

    stop(server, handle).await;
}

#[tokio::test]
async fn test_compressed_routes() {
    let dict = RouteDictionary::from_entries([("Echo.Ping", 1u16)]);
    let (server, addr, handle) =
        start(NetServer::builder(local_config()).route_dictionary(dict.clone()).service(echo())).await;

    let mut client = RawClient::connect(addr).await;
    client.handshake().await;

    let request = Message::request(9, "Echo.Ping", Bytes::from_static(b"\"hi\""));
    let encoded = horizon_net::message::encode(&request, &dict).unwrap();
    // flag byte carries the compress bit
    assert_eq!(encoded[0] & 0x01, 0x01);
    client.send(PacketType::Data, &encoded).await;

    let packet = client.next().await.expect("response packet");
    let msg = horizon_net::message::decode(&packet.data, &dict).unwrap();
    assert_eq!(msg.id, 9);
    assert_eq!(msg.data.as_ref(), b"\"pong\"");

    stop(server, handle).await;
}

#[tokio::test]
async fn test_websocket_transport() {
    let config = ServerConfig {
        transport: TransportKind::WebSocket,
        ws_path: "/ws".to_string(),
        ..local_config()
    };
    let (server, addr, handle) = start(NetServer::builder(config).service(echo())).await;

    assert!(tokio_tungstenite::connect_async(format!("ws://{}/other", addr))
        .await
        .is_err());

    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();
    let (reader, writer) = split_websocket(ws);
    let client = Connector::handshake(reader, writer, ConnectorOptions::default())
        .await
        .unwrap();

    let pong: String = client.request("Echo.Ping", "hi").await.unwrap();
    assert_eq!(pong, "pong");

    client.close();
    stop(server, handle).await;
}
