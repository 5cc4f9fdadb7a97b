//! Chat room demo built on the networking layer.
//!
//! Every connection that calls `Room.Join` enters a single shared room.
//! Messages sent to `Room.Message` are broadcast to everyone in it.

use horizon_net::pipeline::Pipeline;
use horizon_net::scheduler::Timer;
use horizon_net::serializer::JsonSerializer;
use horizon_net::{Component, Group, NetError, NetServer, ServerConfig, Service, ServiceOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize, Deserialize)]
pub struct UserMessage {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct NewUser {
    content: String,
}

#[derive(Debug, Serialize)]
struct AllMembers {
    members: Vec<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinResponse {
    pub code: i32,
    pub result: String,
}

/// Traffic counters fed by the server pipeline.
#[derive(Debug, Default)]
pub struct Stats {
    inbound: AtomicU64,
    outbound: AtomicU64,
}

impl Stats {
    pub fn inbound(&self) -> u64 {
        self.inbound.load(Ordering::Relaxed)
    }

    pub fn outbound(&self) -> u64 {
        self.outbound.load(Ordering::Relaxed)
    }

    /// Pipeline that counts every message in both directions.
    pub fn pipeline(self: &Arc<Self>) -> Pipeline {
        let pipeline = Pipeline::new();

        let stats = self.clone();
        pipeline.inbound().push_back(move |session, msg| {
            stats.inbound.fetch_add(1, Ordering::Relaxed);
            debug!("⬇️ session {} -> {}", session.id(), msg.route);
            Ok(msg)
        });

        let stats = self.clone();
        pipeline.outbound().push_back(move |_session, msg| {
            stats.outbound.fetch_add(1, Ordering::Relaxed);
            Ok(msg)
        });

        pipeline
    }
}

/// Component owning the chat room.
pub struct RoomManager {
    group: Arc<Group>,
    stats: Arc<Stats>,
    timer: OnceLock<Timer>,
}

impl RoomManager {
    pub fn new(stats: Arc<Stats>) -> Arc<Self> {
        Arc::new(Self {
            group: Arc::new(Group::new("room", Arc::new(JsonSerializer::new()))),
            stats,
            timer: OnceLock::new(),
        })
    }

    pub fn group(&self) -> &Arc<Group> {
        &self.group
    }

    /// Hooks the room into a built server: members leave when their
    /// connection closes and a periodic timer reports room statistics.
    pub fn install(&self, server: &NetServer) -> Result<(), NetError> {
        let group = self.group.clone();
        server.context().lifetime().on_closed(move |session| {
            if let Err(e) = group.leave(session.id()) {
                debug!("session {} was not in the room: {}", session.id(), e);
            }
        });

        let group = self.group.clone();
        let stats = self.stats.clone();
        // the scheduler owning this timer lives in the context
        let context = Arc::downgrade(server.context());
        let timer = server.context().scheduler().new_timer(STATS_INTERVAL, move || {
            let Some(context) = context.upgrade() else { return };
            info!(
                "📊 Room members: {}, connections: {}, messages in/out: {}/{}",
                group.count(),
                context.connections().count(),
                stats.inbound(),
                stats.outbound()
            );
        })?;
        if self.timer.set(timer).is_err() {
            warn!("Room statistics timer was already installed");
        }
        Ok(())
    }
}

impl Component for RoomManager {
    fn after_init(&self) {
        info!("💬 Chat room '{}' ready", self.group.name());
    }

    fn shutdown(&self) {
        if let Some(timer) = self.timer.get() {
            timer.stop();
        }
        if let Err(e) = self.group.close() {
            warn!("Failed to close chat room: {}", e);
        }
    }

    fn service(&self) -> Service {
        let join_group = self.group.clone();
        let message_group = self.group.clone();

        Service::new("Room")
            .handle("Join", move |session, _: Value| {
                // demo server: the session id doubles as the user id
                let uid = session.id();
                session.bind(uid)?;
                session.push("onMembers", &AllMembers { members: join_group.members() })?;
                join_group.broadcast("onNewUser", &NewUser { content: format!("New user: {uid}") })?;
                join_group.add(session.clone())?;
                session.response(&JoinResponse { code: 0, result: "success".to_string() })
            })
            .handle("Message", move |_session, msg: UserMessage| message_group.broadcast("onMessage", &msg))
    }
}

/// Builds the chat server with its room component installed.
///
/// # Arguments
/// * `config` - Network settings, usually from [`AppConfig::to_server_config`](crate::config::AppConfig::to_server_config)
///
/// # Returns
/// The server, ready for [`NetServer::start`], and the room so callers can
/// inspect its members.
pub fn build_server(config: ServerConfig) -> Result<(NetServer, Arc<RoomManager>), NetError> {
    let stats = Arc::new(Stats::default());
    let room = RoomManager::new(stats.clone());

    let server = NetServer::builder(config)
        .pipeline(Arc::new(stats.pipeline()))
        .component(room.clone(), ServiceOptions::new())
        .build()?;
    room.install(&server)?;

    Ok((server, room))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use horizon_net::Connector;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_join_and_broadcast() {
        let config = ServerConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..ServerConfig::default()
        };
        let (server, room) = build_server(config).unwrap();
        let server = Arc::new(server);
        let listener = server.listen().unwrap();
        let addr = listener.local_addr().unwrap();
        let running = server.clone();
        let handle = tokio::spawn(async move { running.serve(listener).await });

        let alice = Connector::connect(addr).await.unwrap();
        let (new_user_tx, mut new_users) = mpsc::unbounded_channel();
        alice.on("onNewUser", move |data| {
            let _ = new_user_tx.send(data);
        });
        let (message_tx, mut messages) = mpsc::unbounded_channel();
        alice.on("onMessage", move |data| {
            let _ = message_tx.send(data);
        });

        let joined: JoinResponse = alice.request("Room.Join", &serde_json::json!({})).await.unwrap();
        assert_eq!(joined.code, 0);
        assert_eq!(joined.result, "success");

        let bob = Connector::connect(addr).await.unwrap();
        let (members_tx, mut members) = mpsc::unbounded_channel();
        bob.on("onMembers", move |data| {
            let _ = members_tx.send(data);
        });
        let _: JoinResponse = bob.request("Room.Join", &serde_json::json!({})).await.unwrap();

        let existing = tokio::time::timeout(WAIT, members.recv()).await.unwrap().unwrap();
        let existing: Value = serde_json::from_slice(&existing).unwrap();
        assert_eq!(existing["members"].as_array().unwrap().len(), 1);

        let announced = tokio::time::timeout(WAIT, new_users.recv()).await.unwrap().unwrap();
        let announced: Value = serde_json::from_slice(&announced).unwrap();
        assert!(announced["content"].as_str().unwrap().starts_with("New user: "));
        assert_eq!(room.group().count(), 2);

        bob.notify(
            "Room.Message",
            &UserMessage {
                name: "bob".to_string(),
                content: "hello".to_string(),
            },
        )
        .unwrap();
        let received = tokio::time::timeout(WAIT, messages.recv()).await.unwrap().unwrap();
        let received: UserMessage = serde_json::from_slice(&received).unwrap();
        assert_eq!(received.content, "hello");

        // disconnecting leaves the room
        bob.close();
        tokio::time::timeout(WAIT, async {
            while room.group().count() != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        alice.close();
        server.shutdown();
        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
    }

    #[test]
    fn test_stats_pipeline_counts_messages() {
        let stats = Arc::new(Stats::default());
        let pipeline = stats.pipeline();
        let (_entity, session) = horizon_net::mock::MockEntity::session(1);

        let msg = horizon_net::Message::notify("Room.Message", Bytes::from_static(b"{}"));
        pipeline.inbound().process(&session, msg.clone()).unwrap();
        pipeline.outbound().process(&session, msg).unwrap();

        assert_eq!(stats.inbound(), 1);
        assert_eq!(stats.outbound(), 1);
    }

    #[test]
    fn test_stats_timer_does_not_keep_context_alive() {
        let config = ServerConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..ServerConfig::default()
        };
        let (server, _room) = build_server(config).unwrap();
        let context = Arc::downgrade(server.context());

        drop(server);
        assert!(context.upgrade().is_none());
    }
}
