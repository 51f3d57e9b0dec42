/// Per-connection multiplexer.
///
/// One client per accepted transport: it owns the connection's single
/// decoder, demultiplexes decoded packets to the session attached for
/// their namespace, and serializes the connect sequence — requests for
/// auxiliary namespaces are buffered until the root namespace session
/// activates, because the default channel must exist before other channels
/// can share the connection.
use crate::error::Error;
use crate::parser::{Decoder, Frame, Packet, PacketType};
use crate::payload::Payload;
use crate::server::ServerInner;
use crate::socket::{Socket, WriteOptions};
use crate::transport::{SendOptions, Transport};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use uuid::Uuid;

/// Connection-scoped handshake metadata captured by the acceptance layer.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Handshake {
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    /// Unix timestamp of connection acceptance.
    pub issued: i64,
}

impl Handshake {
    pub fn new(headers: HashMap<String, String>, query: HashMap<String, String>) -> Self {
        Self {
            headers,
            query,
            issued: chrono::Utc::now().timestamp(),
        }
    }
}

pub struct Client {
    id: String,
    server: Weak<ServerInner>,
    transport: Arc<dyn Transport>,
    handshake: Arc<Handshake>,
    decoder: Mutex<Decoder>,
    /// Attached sessions by session id.
    sockets: RwLock<HashMap<String, Arc<Socket>>>,
    /// Attached sessions by namespace name, the routing index.
    nsps: RwLock<HashMap<String, Arc<Socket>>>,
    /// Namespace connect requests received before the root session
    /// activated, replayed FIFO once it does.
    connect_buffer: Mutex<Vec<(String, Option<Payload>)>>,
    /// Serializes multi-frame writes: a binary packet's header and
    /// attachment frames must land contiguously on the shared transport.
    write_lock: AsyncMutex<()>,
}

impl Client {
    pub(crate) fn new(
        server: Weak<ServerInner>,
        transport: Arc<dyn Transport>,
        handshake: Handshake,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Self::generate_id(),
            server,
            transport,
            handshake: Arc::new(handshake),
            decoder: Mutex::new(Decoder::new()),
            sockets: RwLock::new(HashMap::new()),
            nsps: RwLock::new(HashMap::new()),
            connect_buffer: Mutex::new(Vec::new()),
            write_lock: AsyncMutex::new(()),
        })
    }

    /// Collision-resistant connection id.
    fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn handshake(&self) -> Arc<Handshake> {
        Arc::clone(&self.handshake)
    }

    /// The session attached for a namespace, if any.
    pub async fn socket_of(&self, nsp: &str) -> Option<Arc<Socket>> {
        self.nsps.read().await.get(nsp).cloned()
    }

    /// Request attachment to a namespace. Statically known namespaces
    /// attach immediately; otherwise the dynamic matchers are consulted,
    /// and a denial is answered with an "Invalid namespace" ERROR packet
    /// while the connection stays alive.
    pub async fn connect(self: &Arc<Self>, name: &str, auth: Option<Payload>) {
        let Some(server) = self.server.upgrade() else {
            return;
        };

        if server.nsp(name).await.is_some() {
            self.do_connect(&server, name, auth).await;
            return;
        }

        match server.check_namespace(name, &self.handshake).await {
            Some(_) => self.do_connect(&server, name, auth).await,
            None => {
                tracing::debug!(client = %self.id, nsp = name, "namespace request denied");
                self.packet(&Packet::error(name, "Invalid namespace"), &WriteOptions::default())
                    .await;
            }
        }
    }

    async fn do_connect(self: &Arc<Self>, server: &Arc<ServerInner>, name: &str, auth: Option<Payload>) {
        // Protocol ordering: the root namespace connects first. Requests
        // for other namespaces wait in arrival order until it has.
        if name != "/" && !self.nsps.read().await.contains_key("/") {
            self.connect_buffer
                .lock()
                .unwrap()
                .push((name.to_string(), auth));
            tracing::debug!(client = %self.id, nsp = name, "connect buffered until root attaches");
            return;
        }

        let nsp = server.of(name).await;
        nsp.add_socket(self, auth).await;
    }

    /// Feed one raw inbound frame to the connection's decoder. A fatal
    /// decode error is propagated to every attached session's error path
    /// and tears the whole connection down.
    pub async fn on_data(self: &Arc<Self>, frame: Frame) {
        let result = self.decoder.lock().unwrap().add(frame);
        match result {
            Ok(Some(packet)) => self.on_decoded(packet).await,
            Ok(None) => {}
            Err(err) => self.on_decode_error(err).await,
        }
    }

    async fn on_decoded(self: &Arc<Self>, packet: Packet) {
        if packet.packet_type == PacketType::Connect {
            let nsp = packet.nsp.clone();
            self.connect(&nsp, packet.data).await;
            return;
        }

        let socket = self.nsps.read().await.get(&packet.nsp).cloned();
        match socket {
            Some(socket) => socket.on_packet(packet).await,
            // A race where the namespace was never (yet) joined; not
            // fatal.
            None => tracing::debug!(
                client = %self.id,
                nsp = %packet.nsp,
                "packet for unattached namespace dropped"
            ),
        }
    }

    async fn on_decode_error(self: &Arc<Self>, err: Error) {
        tracing::warn!(client = %self.id, error = %err, "fatal decode error, closing connection");
        let sockets: Vec<_> = self.sockets.read().await.values().cloned().collect();
        for socket in sockets {
            socket.notify_error(Payload::from(err.to_string()));
        }
        self.close_with_reason("transport error").await;
    }

    /// Transport failure reported by the embedder: terminal for the whole
    /// connection.
    pub async fn on_transport_error(self: &Arc<Self>, message: &str) {
        let sockets: Vec<_> = self.sockets.read().await.values().cloned().collect();
        for socket in sockets {
            socket.notify_error(Payload::from(message));
        }
        self.close_with_reason("transport error").await;
    }

    /// Transport closure reported by the embedder.
    pub async fn on_transport_close(self: &Arc<Self>, reason: &str) {
        self.close_with_reason(reason).await;
    }

    /// Forced close: shuts the transport, cascades `on_close` to every
    /// still-open session before returning, then invalidates the decoder,
    /// abandoning any in-flight binary reconstruction.
    pub async fn close(self: &Arc<Self>) {
        self.close_with_reason("forced server close").await;
    }

    async fn close_with_reason(self: &Arc<Self>, reason: &str) {
        if self.transport.is_open() {
            self.transport.close();
        }
        let sockets: Vec<_> = self.sockets.read().await.values().cloned().collect();
        for socket in sockets {
            socket.on_close(reason).await;
        }
        self.decoder.lock().unwrap().destroy();
    }

    /// Encode-and-write path shared by every session of this connection.
    pub(crate) async fn packet(&self, packet: &Packet, opts: &WriteOptions) {
        if !self.transport.is_open() {
            if opts.volatile {
                tracing::debug!(client = %self.id, "volatile packet dropped, transport not writable");
            }
            return;
        }
        self.write_frames(&packet.encode(), opts).await;
    }

    pub(crate) async fn write_frames(&self, frames: &[Frame], opts: &WriteOptions) {
        if !self.transport.is_open() {
            return;
        }
        let send_opts = SendOptions {
            compress: opts.compress,
        };
        let _guard = self.write_lock.lock().await;
        for frame in frames {
            self.transport.send(frame.clone(), &send_opts);
        }
    }

    /// Session activation callback: index the session, and once the root
    /// namespace is attached, replay buffered connect requests in arrival
    /// order.
    ///
    /// Boxed: the replay re-enters the connect path, which loops back here
    /// through session activation.
    pub(crate) fn register_socket<'a>(
        self: &'a Arc<Self>,
        socket: &'a Arc<Socket>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.sockets
                .write()
                .await
                .insert(socket.id().to_string(), Arc::clone(socket));
            self.nsps
                .write()
                .await
                .insert(socket.nsp_name().to_string(), Arc::clone(socket));

            if socket.nsp_name() == "/" {
                let buffered: Vec<_> = {
                    let mut buffer = self.connect_buffer.lock().unwrap();
                    buffer.drain(..).collect()
                };
                for (name, auth) in buffered {
                    self.connect(&name, auth).await;
                }
            }
        })
    }

    pub(crate) async fn remove_socket(&self, socket_id: &str, nsp: &str) {
        self.sockets.write().await.remove(socket_id);
        self.nsps.write().await.remove(nsp);
    }
}
