/// One (connection, namespace) session.
///
/// A socket owns its room memberships and pending-acknowledgement table,
/// and stages transient per-call emit options that apply to exactly the
/// next outbound packet. Its namespace and client are reached through
/// non-owning back-references; the namespace and client registries are the
/// sole owners of the socket's lifetime.
use crate::adapter::{BroadcastOptions, EmitFlags, EmitStage};
use crate::client::{Client, Handshake};
use crate::error::Error;
use crate::handlers::EventHandlers;
use crate::namespace::Namespace;
use crate::parser::{Frame, Packet, PacketType};
use crate::payload::Payload;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Options applied when writing one packet's frames to the transport.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub compress: bool,
    pub volatile: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            compress: true,
            volatile: false,
        }
    }
}

/// Session lifecycle. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Callback resolving one outbound acknowledgement.
pub type AckCallback = Box<dyn FnOnce(Vec<Payload>) + Send>;

/// Lifecycle notification: the session and the disconnect reason.
pub type LifecycleCallback = Arc<dyn Fn(Arc<Socket>, String) + Send + Sync>;

/// Error notification for ERROR packets and transport failures.
pub type ErrorCallback = Arc<dyn Fn(Arc<Socket>, Payload) + Send + Sync>;

/// Single-use responder for an inbound event that requested an
/// acknowledgement. Appended as the final handler argument.
pub struct AckSender {
    socket: Weak<Socket>,
    id: u64,
    sent: AtomicBool,
}

impl AckSender {
    fn new(socket: &Arc<Socket>, id: u64) -> Self {
        Self {
            socket: Arc::downgrade(socket),
            id,
            sent: AtomicBool::new(false),
        }
    }

    /// Send the acknowledgement. Repeat calls are no-ops.
    pub fn send(&self, args: Vec<Payload>) {
        if self.sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(socket) = self.socket.upgrade() else {
            return;
        };
        let id = self.id;
        tokio::spawn(async move {
            let packet = Packet::ack(socket.nsp_name(), id, args);
            socket.packet(packet, &WriteOptions::default()).await;
        });
    }
}

pub struct Socket {
    id: String,
    nsp_name: String,
    nsp: Weak<Namespace>,
    client: Weak<Client>,
    handshake: Arc<Handshake>,
    auth: Option<Payload>,
    connected_at: i64,
    state: Mutex<SessionState>,
    rooms: Mutex<HashSet<String>>,
    acks: Mutex<HashMap<u64, AckCallback>>,
    stage: Mutex<EmitStage>,
    handlers: EventHandlers,
    disconnecting_subs: Mutex<Vec<LifecycleCallback>>,
    disconnect_subs: Mutex<Vec<LifecycleCallback>>,
    error_subs: Mutex<Vec<ErrorCallback>>,
}

impl Socket {
    pub(crate) fn new(
        nsp: &Arc<Namespace>,
        client: &Arc<Client>,
        auth: Option<Payload>,
    ) -> Arc<Self> {
        // Distinct session ids per namespace for the same physical
        // connection; the adapter keys its bookkeeping on these.
        let id = if nsp.name() == "/" {
            client.id().to_string()
        } else {
            format!("{}#{}", nsp.name(), client.id())
        };
        Arc::new(Self {
            id,
            nsp_name: nsp.name().to_string(),
            nsp: Arc::downgrade(nsp),
            client: Arc::downgrade(client),
            handshake: client.handshake(),
            auth,
            connected_at: chrono::Utc::now().timestamp(),
            state: Mutex::new(SessionState::Connecting),
            rooms: Mutex::new(HashSet::new()),
            acks: Mutex::new(HashMap::new()),
            stage: Mutex::new(EmitStage::default()),
            handlers: EventHandlers::new(),
            disconnecting_subs: Mutex::new(Vec::new()),
            disconnect_subs: Mutex::new(Vec::new()),
            error_subs: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn nsp_name(&self) -> &str {
        &self.nsp_name
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    pub fn auth(&self) -> Option<&Payload> {
        self.auth.as_ref()
    }

    pub fn connected_at(&self) -> i64 {
        self.connected_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Room names this session has joined.
    pub fn rooms(&self) -> Vec<String> {
        self.rooms.lock().unwrap().iter().cloned().collect()
    }

    /// Register an application handler for a named inbound event.
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(Arc<Socket>, Vec<Payload>, Option<AckSender>) + Send + Sync + 'static,
    {
        self.handlers.on(event, Arc::new(handler));
    }

    pub fn on_disconnecting<F>(&self, handler: F)
    where
        F: Fn(Arc<Socket>, String) + Send + Sync + 'static,
    {
        self.disconnecting_subs.lock().unwrap().push(Arc::new(handler));
    }

    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn(Arc<Socket>, String) + Send + Sync + 'static,
    {
        self.disconnect_subs.lock().unwrap().push(Arc::new(handler));
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(Arc<Socket>, Payload) + Send + Sync + 'static,
    {
        self.error_subs.lock().unwrap().push(Arc::new(handler));
    }

    /// Stage a room target for the next emission.
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

    /// Force the next emission through the adapter even without staged
    /// rooms (the session itself is excluded from delivery).
    pub fn broadcast(&self) -> &Self {
        self.stage.lock().unwrap().flags.broadcast = true;
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

    /// Emit a named event, honoring whatever rooms and flags were staged
    /// since the last emission. With staged rooms or the broadcast flag the
    /// event fans out through the adapter, excluding this session; plain
    /// emissions unicast to the peer.
    pub async fn emit(&self, event: &str, args: Vec<Payload>) {
        let EmitStage { rooms, flags } = self.take_stage();
        let packet = build_event(&self.nsp_name, event, args, &flags);

        if !rooms.is_empty() || flags.broadcast {
            let Some(nsp) = self.nsp.upgrade() else {
                return;
            };
            nsp.adapter()
                .broadcast(
                    packet,
                    BroadcastOptions {
                        rooms,
                        except: vec![self.id.clone()],
                        flags,
                    },
                )
                .await;
            return;
        }

        self.packet(packet, &flags.write_options()).await;
    }

    /// Emit a named event carrying an acknowledgement request. The callback
    /// resolves when the peer answers with the correlated ACK. Rejected
    /// when a room filter or the broadcast flag is staged: a broadcast has
    /// no single responder.
    pub async fn emit_with_ack(
        &self,
        event: &str,
        args: Vec<Payload>,
        ack: AckCallback,
    ) -> Result<(), Error> {
        let EmitStage { rooms, flags } = self.take_stage();
        if !rooms.is_empty() || flags.broadcast {
            return Err(Error::AckOnBroadcast);
        }
        let Some(nsp) = self.nsp.upgrade() else {
            return Err(Error::TransportClosed);
        };

        let id = nsp.next_ack_id();
        self.acks.lock().unwrap().insert(id, ack);

        let mut packet = build_event(&self.nsp_name, event, args, &flags);
        packet.id = Some(id);
        self.packet(packet, &flags.write_options()).await;
        Ok(())
    }

    /// Emit the reserved `"message"` event.
    pub async fn send(&self, args: Vec<Payload>) {
        self.emit("message", args).await;
    }

    /// Idempotently join the given rooms.
    pub async fn join(&self, rooms: Vec<String>) {
        let fresh: Vec<String> = {
            let joined = self.rooms.lock().unwrap();
            rooms.into_iter().filter(|r| !joined.contains(r)).collect()
        };
        if fresh.is_empty() {
            return;
        }
        if let Some(nsp) = self.nsp.upgrade() {
            nsp.adapter().add_all(&self.id, &fresh).await;
        }
        self.rooms.lock().unwrap().extend(fresh);
    }

    pub async fn leave(&self, room: &str) {
        if let Some(nsp) = self.nsp.upgrade() {
            nsp.adapter().del(&self.id, room).await;
        }
        self.rooms.lock().unwrap().remove(room);
    }

    pub async fn leave_all(&self) {
        if let Some(nsp) = self.nsp.upgrade() {
            nsp.adapter().del_all(&self.id).await;
        }
        self.rooms.lock().unwrap().clear();
    }

    /// Push an ERROR packet to the peer.
    pub async fn error(&self, data: impl Into<Payload>) {
        self.packet(
            Packet::error(&self.nsp_name, data),
            &WriteOptions::default(),
        )
        .await;
    }

    /// Disconnect this session. With `close` the whole connection is torn
    /// down; otherwise only this namespace detaches, after telling the
    /// peer.
    pub async fn disconnect(self: &Arc<Self>, close: bool) {
        if !self.is_connected() {
            return;
        }
        if close {
            if let Some(client) = self.client.upgrade() {
                client.close().await;
            }
        } else {
            self.packet(Packet::disconnect(&self.nsp_name), &WriteOptions::default())
                .await;
            self.on_close("server namespace disconnect").await;
        }
    }

    /// The single path into disconnecting/disconnected. Idempotent.
    pub(crate) async fn on_close(self: &Arc<Self>, reason: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != SessionState::Connected {
                return;
            }
            *state = SessionState::Disconnecting;
        }

        let subs = self.disconnecting_subs.lock().unwrap().clone();
        for sub in subs {
            sub(Arc::clone(self), reason.to_string());
        }

        self.leave_all().await;
        if let Some(nsp) = self.nsp.upgrade() {
            nsp.remove_socket(&self.id).await;
        }
        if let Some(client) = self.client.upgrade() {
            client.remove_socket(&self.id, &self.nsp_name).await;
        }

        *self.state.lock().unwrap() = SessionState::Disconnected;
        tracing::info!(session = %self.id, nsp = %self.nsp_name, reason, "session disconnected");

        let subs = self.disconnect_subs.lock().unwrap().clone();
        for sub in subs {
            sub(Arc::clone(self), reason.to_string());
        }
    }

    /// Activation: mark connected, register with the namespace's connected
    /// set, join the own-id room, and send the CONNECT handshake reply
    /// carrying the session id.
    pub(crate) async fn onconnect(self: &Arc<Self>) {
        *self.state.lock().unwrap() = SessionState::Connected;
        if let Some(nsp) = self.nsp.upgrade() {
            nsp.register_connected(self).await;
        }
        self.join(vec![self.id.clone()]).await;
        self.packet(
            Packet::connect(&self.nsp_name, Some(&self.id)),
            &WriteOptions::default(),
        )
        .await;
        tracing::info!(session = %self.id, nsp = %self.nsp_name, "session connected");
    }

    /// Inbound packet dispatch for this session.
    pub(crate) async fn on_packet(self: &Arc<Self>, packet: Packet) {
        match packet.packet_type {
            PacketType::Event | PacketType::BinaryEvent => self.on_event(packet),
            PacketType::Ack | PacketType::BinaryAck => self.on_ack(packet),
            PacketType::Disconnect => self.on_close("client namespace disconnect").await,
            PacketType::Error => {
                self.notify_error(packet.data.unwrap_or_default());
            }
            PacketType::Connect => {
                tracing::debug!(session = %self.id, "duplicate connect packet ignored");
            }
        }
    }

    fn on_event(self: &Arc<Self>, packet: Packet) {
        let Some((event, args)) = packet.event_args() else {
            tracing::warn!(session = %self.id, "event packet without a name, dropped");
            return;
        };
        let event = event.to_string();
        let args = args.to_vec();
        let ack = packet.id.map(|id| AckSender::new(self, id));

        // Handler execution must never block this connection's decode
        // pipeline.
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let invoked = this.handlers.notify(&this, &event, &args, ack);
            if invoked == 0 {
                tracing::debug!(session = %this.id, event = %event, "no handler for event");
            }
        });
    }

    fn on_ack(&self, packet: Packet) {
        let Some(id) = packet.id else {
            return;
        };
        let callback = self.acks.lock().unwrap().remove(&id);
        match callback {
            Some(callback) => {
                let args = match packet.data {
                    Some(Payload::Array(items)) => items,
                    Some(other) => vec![other],
                    None => Vec::new(),
                };
                callback(args);
            }
            // Late or duplicate acks are tolerated.
            None => tracing::debug!(session = %self.id, ack = id, "no pending ack for id"),
        }
    }

    /// Surface an error to subscribers; unobserved errors are dropped
    /// rather than crashing the connection.
    pub(crate) fn notify_error(self: &Arc<Self>, data: Payload) {
        let subs = self.error_subs.lock().unwrap().clone();
        if subs.is_empty() {
            tracing::debug!(session = %self.id, "unobserved session error dropped");
            return;
        }
        for sub in subs {
            sub(Arc::clone(self), data.clone());
        }
    }

    pub(crate) async fn packet(&self, mut packet: Packet, opts: &WriteOptions) {
        packet.nsp = self.nsp_name.clone();
        if let Some(client) = self.client.upgrade() {
            client.packet(&packet, opts).await;
        }
    }

    /// Pre-encoded delivery path used by the adapter's fan-out.
    pub(crate) async fn send_frames(&self, frames: &[Frame], opts: &WriteOptions) {
        if let Some(client) = self.client.upgrade() {
            client.write_frames(frames, opts).await;
        }
    }

    fn take_stage(&self) -> EmitStage {
        std::mem::take(&mut *self.stage.lock().unwrap())
    }
}

/// Event packet honoring an explicit binary-hint override.
fn build_event(nsp: &str, event: &str, args: Vec<Payload>, flags: &EmitFlags) -> Packet {
    let mut packet = Packet::event(nsp, event, args);
    if let Some(forced) = flags.binary {
        packet.packet_type = if forced {
            PacketType::BinaryEvent
        } else {
            PacketType::Event
        };
    }
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;
    use crate::test_util;
    use crate::transport::Transport;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn ack_callbacks_rejected_when_broadcasting() {
        let server = Server::new();
        let mut conn = test_util::connect(&server).await;

        for room in ["r1", "r2"] {
            let result = conn
                .socket
                .to(room)
                .emit_with_ack("evt", vec![], Box::new(|_| {}))
                .await;
            assert!(matches!(result, Err(Error::AckOnBroadcast)));
        }
        let result = conn
            .socket
            .broadcast()
            .emit_with_ack("evt", vec![], Box::new(|_| {}))
            .await;
        assert!(matches!(result, Err(Error::AckOnBroadcast)));

        // The stage is consumed even by a rejected call: the next plain
        // emit unicasts again.
        test_util::drain(&mut conn.frames);
        conn.socket.emit("evt", vec![]).await;
        let texts = test_util::drain_text(&mut conn.frames);
        assert_eq!(texts, vec![r#"2["evt"]"#.to_string()]);
    }

    #[tokio::test]
    async fn ack_round_trip_resolves_pending_entry() {
        let server = Server::new();
        let mut conn = test_util::connect(&server).await;
        test_util::drain(&mut conn.frames);

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.socket
            .emit_with_ack(
                "ping",
                vec![Payload::from("hi")],
                Box::new(move |args| {
                    let _ = tx.send(args);
                }),
            )
            .await
            .unwrap();

        let texts = test_util::drain_text(&mut conn.frames);
        assert_eq!(texts, vec![r#"20["ping","hi"]"#.to_string()]);

        conn.client
            .on_data(Frame::Text(r#"30["pong"]"#.to_string()))
            .await;
        assert_eq!(rx.recv().await.unwrap(), vec![Payload::from("pong")]);

        // A duplicate ack for the same id is tolerated and ignored.
        conn.client
            .on_data(Frame::Text(r#"30["again"]"#.to_string()))
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn on_close_is_idempotent() {
        let server = Server::new();
        let conn = test_util::connect(&server).await;
        let socket = Arc::clone(&conn.socket);

        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disconnects);
        socket.on_disconnect(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        socket.join(vec!["r1".to_string(), "r2".to_string()]).await;
        socket.on_close("forced server close").await;
        socket.on_close("forced server close").await;

        assert_eq!(socket.state(), SessionState::Disconnected);
        assert!(socket.rooms().is_empty());
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(server.of("/").await.socket(socket.id()).await.is_none());
        assert!(conn.client.socket_of("/").await.is_none());
    }

    #[tokio::test]
    async fn inbound_disconnect_packet_closes_session() {
        let server = Server::new();
        let conn = test_util::connect(&server).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.socket.on_disconnect(move |_, reason| {
            let _ = tx.send(reason);
        });

        conn.client.on_data(Frame::Text("1".to_string())).await;
        assert_eq!(rx.recv().await.unwrap(), "client namespace disconnect");
        assert_eq!(conn.socket.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn inbound_event_dispatches_with_ack_sender() {
        let server = Server::new();
        let mut conn = test_util::connect(&server).await;

        conn.socket.on("hello", |_socket, args, ack| {
            assert_eq!(args, vec![Payload::from("there")]);
            if let Some(ack) = ack {
                ack.send(vec![Payload::from("world")]);
            }
        });
        test_util::drain(&mut conn.frames);

        conn.client
            .on_data(Frame::Text(r#"21["hello","there"]"#.to_string()))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let texts = test_util::drain_text(&mut conn.frames);
        assert_eq!(texts, vec![r#"31["world"]"#.to_string()]);
    }

    #[tokio::test]
    async fn room_broadcast_excludes_the_sender() {
        let server = Server::new();
        let mut first = test_util::connect(&server).await;
        let mut second = test_util::connect(&server).await;

        first.socket.join(vec!["room".to_string()]).await;
        second.socket.join(vec!["room".to_string()]).await;
        test_util::drain(&mut first.frames);
        test_util::drain(&mut second.frames);

        first.socket.to("room").emit("ping", vec![]).await;

        assert!(test_util::drain_text(&mut first.frames).is_empty());
        assert_eq!(
            test_util::drain_text(&mut second.frames),
            vec![r#"2["ping"]"#.to_string()]
        );
    }

    #[tokio::test]
    async fn server_side_disconnect_notifies_peer() {
        let server = Server::new();
        let mut conn = test_util::connect(&server).await;
        test_util::drain(&mut conn.frames);

        conn.socket.disconnect(false).await;

        let texts = test_util::drain_text(&mut conn.frames);
        assert_eq!(texts, vec!["1".to_string()]);
        assert_eq!(conn.socket.state(), SessionState::Disconnected);
        // The connection itself stays alive.
        assert!(conn.client.transport().is_open());
    }

    #[tokio::test]
    async fn rejoining_a_room_is_a_noop() {
        let server = Server::new();
        let conn = test_util::connect(&server).await;

        conn.socket.join(vec!["r1".to_string()]).await;
        conn.socket.join(vec!["r1".to_string()]).await;

        let nsp = server.of("/").await;
        let mut rooms = nsp.adapter().rooms_of(conn.socket.id()).await;
        rooms.sort();
        // Own-id room plus r1, each exactly once.
        assert_eq!(rooms.len(), 2);
        assert!(rooms.contains(&"r1".to_string()));
    }
}
