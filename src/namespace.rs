/// Namespaces: named logical channel spaces multiplexed over shared
/// connections.
///
/// A namespace owns its sessions, its broadcast adapter and its "connect"
/// subscribers. The root namespace `/` always exists; others are created
/// lazily on first reference or on demand through parent-namespace
/// matchers.
use crate::adapter::{Adapter, BroadcastOptions, EmitStage};
use crate::client::{Client, Handshake};
use crate::error::Error;
use crate::parser::{Packet, PacketType};
use crate::payload::Payload;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock, Weak};
use tokio::sync::RwLock;

/// Subscriber invoked when a session finishes connecting to a namespace.
pub type ConnectCallback = Arc<dyn Fn(Arc<Socket>) + Send + Sync>;

/// Asynchronous predicate deciding whether a requested namespace name may
/// be served by a parent namespace.
pub type MatcherFn =
    Arc<dyn Fn(&str, &Handshake) -> BoxFuture<'static, Result<bool, Error>> + Send + Sync>;

use crate::socket::Socket;

pub struct Namespace {
    name: String,
    adapter: Adapter,
    /// Every session added to this namespace, by session id.
    sockets: RwLock<HashMap<String, Arc<Socket>>>,
    /// Sessions that completed the connect handshake; the adapter resolves
    /// broadcast targets against this set.
    connected: RwLock<HashMap<String, Arc<Socket>>>,
    /// Correlates outbound ack requests across all sessions of this
    /// namespace.
    ids: AtomicU64,
    connect_subs: StdRwLock<Vec<ConnectCallback>>,
    stage: Mutex<EmitStage>,
}

impl Namespace {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Namespace>| Self {
            name: name.to_string(),
            adapter: Adapter::new(me.clone()),
            sockets: RwLock::new(HashMap::new()),
            connected: RwLock::new(HashMap::new()),
            ids: AtomicU64::new(0),
            connect_subs: StdRwLock::new(Vec::new()),
            stage: Mutex::new(EmitStage::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Subscribe to session connects on this namespace.
    pub fn on_connect<F>(&self, handler: F)
    where
        F: Fn(Arc<Socket>) + Send + Sync + 'static,
    {
        self.connect_subs.write().unwrap().push(Arc::new(handler));
    }

    /// Stage a room target for the next broadcast.
    pub fn to(&self, room: &str) -> &Self {
        let mut stage = self.stage.lock().unwrap();
        if !stage.rooms.iter().any(|r| r == room) {
            stage.rooms.push(room.to_string());
        }
        drop(stage);
        self
    }

    /// Alias of [`to`](Self::to).
    pub fn in_(&self, room: &str) -> &Self {
        self.to(room)
    }

    pub fn volatile(&self) -> &Self {
        self.stage.lock().unwrap().flags.volatile = true;
        self
    }

    pub fn compress(&self, on: bool) -> &Self {
        self.stage.lock().unwrap().flags.compress = Some(on);
        self
    }

    pub fn binary(&self, on: bool) -> &Self {
        self.stage.lock().unwrap().flags.binary = Some(on);
        self
    }

    /// Broadcast a named event to the staged rooms (every connected
    /// session when none are staged). Broadcast-only: there is no
    /// acknowledgement variant, because a fan-out has no single responder.
    pub async fn emit(&self, event: &str, args: Vec<Payload>) {
        let EmitStage { rooms, flags } = std::mem::take(&mut *self.stage.lock().unwrap());
        let mut packet = Packet::event(&self.name, event, args);
        if let Some(forced) = flags.binary {
            packet.packet_type = if forced {
                PacketType::BinaryEvent
            } else {
                PacketType::Event
            };
        }
        self.adapter
            .broadcast(
                packet,
                BroadcastOptions {
                    rooms,
                    except: Vec::new(),
                    flags,
                },
            )
            .await;
    }

    /// Broadcast the reserved `"message"` event.
    pub async fn send(&self, args: Vec<Payload>) {
        self.emit("message", args).await;
    }

    /// Construct a session for `client` and defer its activation by one
    /// scheduling turn, so the caller finishes wiring before "connect"
    /// subscribers observe it. Activation is skipped silently when the
    /// transport closed in the meantime.
    pub(crate) async fn add_socket(
        self: &Arc<Self>,
        client: &Arc<Client>,
        auth: Option<Payload>,
    ) -> Arc<Socket> {
        let socket = Socket::new(self, client, auth);

        let nsp = Arc::clone(self);
        let client = Arc::clone(client);
        let pending = Arc::clone(&socket);
        tokio::spawn(async move {
            if !client.transport().is_open() {
                tracing::debug!(
                    nsp = %nsp.name,
                    session = %pending.id(),
                    "transport closed before activation, skipping"
                );
                return;
            }

            nsp.sockets
                .write()
                .await
                .insert(pending.id().to_string(), Arc::clone(&pending));
            pending.onconnect().await;
            client.register_socket(&pending).await;

            let subs = nsp.connect_subs.read().unwrap().clone();
            for sub in subs {
                sub(Arc::clone(&pending));
            }
        });

        socket
    }

    pub(crate) async fn register_connected(&self, socket: &Arc<Socket>) {
        self.connected
            .write()
            .await
            .insert(socket.id().to_string(), Arc::clone(socket));
    }

    pub(crate) async fn remove_socket(&self, id: &str) {
        self.sockets.write().await.remove(id);
        self.connected.write().await.remove(id);
    }

    /// Connected-session lookup used for broadcast delivery.
    pub(crate) async fn socket(&self, id: &str) -> Option<Arc<Socket>> {
        self.connected.read().await.get(id).cloned()
    }

    pub(crate) async fn connected_ids(&self) -> Vec<String> {
        self.connected.read().await.keys().cloned().collect()
    }

    pub(crate) async fn all_sockets(&self) -> Vec<Arc<Socket>> {
        self.sockets.read().await.values().cloned().collect()
    }

    pub(crate) fn next_ack_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::SeqCst)
    }

    fn adopt_subscribers(&self, subs: Vec<ConnectCallback>) {
        self.connect_subs.write().unwrap().extend(subs);
    }
}

/// A matcher-backed namespace template. When an unregistered namespace name
/// is requested, parents are consulted in registration order; the first
/// whose predicate allows instantiates a concrete child namespace for that
/// exact name, copying the parent's "connect" subscribers onto it.
pub struct ParentNamespace {
    name: String,
    matcher: MatcherFn,
    connect_subs: StdRwLock<Vec<ConnectCallback>>,
    children: Mutex<Vec<Weak<Namespace>>>,
    stage: Mutex<EmitStage>,
}

impl ParentNamespace {
    pub(crate) fn new(name: String, matcher: MatcherFn) -> Arc<Self> {
        Arc::new(Self {
            name,
            matcher,
            connect_subs: StdRwLock::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            stage: Mutex::new(EmitStage::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribers registered here are copied onto every child created
    /// afterwards. Already-created children are not retrofitted, so
    /// subscribe before connections arrive.
    pub fn on_connect<F>(&self, handler: F)
    where
        F: Fn(Arc<Socket>) + Send + Sync + 'static,
    {
        self.connect_subs.write().unwrap().push(Arc::new(handler));
    }

    pub fn to(&self, room: &str) -> &Self {
        let mut stage = self.stage.lock().unwrap();
        if !stage.rooms.iter().any(|r| r == room) {
            stage.rooms.push(room.to_string());
        }
        drop(stage);
        self
    }

    /// Broadcast to every child namespace created from this parent.
    pub async fn emit(&self, event: &str, args: Vec<Payload>) {
        let EmitStage { rooms, flags } = std::mem::take(&mut *self.stage.lock().unwrap());
        let children: Vec<Arc<Namespace>> = {
            let mut children = self.children.lock().unwrap();
            children.retain(|c| c.strong_count() > 0);
            children.iter().filter_map(Weak::upgrade).collect()
        };
        for child in children {
            let mut packet = Packet::event(child.name(), event, args.clone());
            if let Some(forced) = flags.binary {
                packet.packet_type = if forced {
                    PacketType::BinaryEvent
                } else {
                    PacketType::Event
                };
            }
            child
                .adapter()
                .broadcast(
                    packet,
                    BroadcastOptions {
                        rooms: rooms.clone(),
                        except: Vec::new(),
                        flags: flags.clone(),
                    },
                )
                .await;
        }
    }

    pub(crate) async fn allows(&self, name: &str, handshake: &Handshake) -> bool {
        match (self.matcher)(name, handshake).await {
            Ok(allow) => allow,
            Err(err) => {
                // A failing predicate counts as a deny; consultation moves
                // on to the next parent.
                tracing::warn!(parent = %self.name, nsp = name, error = %err, "namespace matcher failed");
                false
            }
        }
    }

    /// Instantiate the concrete namespace for `name`, copying this
    /// parent's connect subscribers onto it.
    pub(crate) fn create_child(&self, name: &str) -> Arc<Namespace> {
        let child = Namespace::new(name);
        child.adopt_subscribers(self.connect_subs.read().unwrap().clone());
        self.children.lock().unwrap().push(Arc::downgrade(&child));
        tracing::debug!(parent = %self.name, nsp = name, "created dynamic namespace");
        child
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;
    use crate::test_util;
    use crate::transport::{ChannelTransport, Transport};
    use std::time::Duration;

    #[tokio::test]
    async fn activation_skipped_when_transport_closed() {
        let server = Server::new();
        let (transport, _frames) = ChannelTransport::new();
        transport.close();

        let _client = server.on_connection(transport, Handshake::default()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(server.of("/").await.all_sockets().await.is_empty());
    }

    #[tokio::test]
    async fn connect_subscriber_observes_registered_session() {
        let server = Server::new();
        let conn = test_util::connect(&server).await;

        let nsp = server.of("/").await;
        // By the time subscribers fired, the session was already queryable.
        assert!(nsp.socket(conn.socket.id()).await.is_some());
        assert!(conn.socket.is_connected());
    }

    #[tokio::test]
    async fn stage_resets_between_broadcasts() {
        let server = Server::new();
        let mut conn = test_util::connect(&server).await;
        test_util::drain(&mut conn.frames);

        let nsp = server.of("/").await;
        nsp.to("ghost").emit("a", vec![]).await;
        assert!(test_util::drain_text(&mut conn.frames).is_empty());

        // The staged room filter was consumed above.
        nsp.emit("b", vec![]).await;
        assert_eq!(
            test_util::drain_text(&mut conn.frames),
            vec![r#"2["b"]"#.to_string()]
        );
    }

    #[tokio::test]
    async fn sessions_are_scoped_per_namespace() {
        let server = Server::new();
        let mut conn = test_util::connect(&server).await;
        let chat = test_util::connect_nsp(&server, &conn.client, "/chat").await;

        assert_eq!(chat.nsp_name(), "/chat");
        assert_eq!(chat.id(), format!("/chat#{}", conn.client.id()));
        test_util::drain(&mut conn.frames);

        server.of("/chat").await.emit("evt", vec![]).await;

        // The namespace name travels on the wire; the root session got
        // nothing.
        assert_eq!(
            test_util::drain_text(&mut conn.frames),
            vec![r#"2/chat,["evt"]"#.to_string()]
        );
    }

    #[tokio::test]
    async fn namespace_send_uses_the_message_event() {
        let server = Server::new();
        let mut conn = test_util::connect(&server).await;
        test_util::drain(&mut conn.frames);

        server.of("/").await.send(vec![Payload::from("hi")]).await;

        assert_eq!(
            test_util::drain_text(&mut conn.frames),
            vec![r#"2["message","hi"]"#.to_string()]
        );
    }
}
