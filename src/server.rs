/// Server: namespace registry and connection entry point.
///
/// Owns the static namespace map (the root namespace `/` always exists),
/// the ordered dynamic-namespace matchers, and the handshake parameters
/// advertised to connecting peers. The HTTP upgrade layer hands accepted
/// transports to [`Server::on_connection`].
use crate::client::{Client, Handshake};
use crate::error::Error;
use crate::namespace::{MatcherFn, Namespace, ParentNamespace};
use crate::parser::Frame;
use crate::socket::WriteOptions;
use crate::transport::Transport;
use futures::future::BoxFuture;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Keep-alive hints advertised in the connection handshake. Liveness
/// enforcement itself is a transport-level concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub ping_interval: u64,
    pub ping_timeout: u64,
    pub max_payload: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ping_interval: 25_000,
            ping_timeout: 20_000,
            max_payload: 1_000_000,
        }
    }
}

pub struct Server {
    inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    config: ServerConfig,
    nsps: RwLock<HashMap<String, Arc<Namespace>>>,
    parents: RwLock<Vec<Arc<ParentNamespace>>>,
    /// Names anonymous parent namespaces (`/_0`, `/_1`, ...).
    parent_ids: AtomicU64,
}

impl Server {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let nsps = HashMap::from([("/".to_string(), Namespace::new("/"))]);
        Self {
            inner: Arc::new(ServerInner {
                config,
                nsps: RwLock::new(nsps),
                parents: RwLock::new(Vec::new()),
                parent_ids: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// The namespace registered under `name` (a `/` prefix is added when
    /// missing), created lazily on first reference.
    pub async fn of(&self, name: &str) -> Arc<Namespace> {
        self.inner.of(name).await
    }

    /// Register a dynamic-namespace matcher. Matchers are consulted in
    /// registration order; the first that allows a requested name
    /// instantiates a concrete namespace for it.
    pub async fn of_matcher<F, Fut>(&self, predicate: F) -> Arc<ParentNamespace>
    where
        F: Fn(String, Handshake) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, Error>> + Send + 'static,
    {
        let matcher: MatcherFn = Arc::new(move |name: &str, handshake: &Handshake| {
            Box::pin(predicate(name.to_string(), handshake.clone())) as BoxFuture<'static, _>
        });
        self.inner.add_parent(matcher).await
    }

    /// Register a pattern-based dynamic-namespace matcher.
    pub async fn of_pattern(&self, pattern: Regex) -> Arc<ParentNamespace> {
        self.of_matcher(move |name, _handshake| {
            let allow = pattern.is_match(&name);
            async move { Ok(allow) }
        })
        .await
    }

    /// Entry point for the connection acceptor: constructs the client,
    /// emits the handshake data (session id and keep-alive hints), then
    /// requests root-namespace attachment.
    pub async fn on_connection(
        &self,
        transport: Arc<dyn Transport>,
        handshake: Handshake,
    ) -> Arc<Client> {
        let client = Client::new(Arc::downgrade(&self.inner), transport, handshake);
        tracing::info!(client = %client.id(), "connection accepted");

        let open = serde_json::json!({
            "sid": client.id(),
            "upgrades": ["websocket"],
            "pingInterval": self.inner.config.ping_interval,
            "pingTimeout": self.inner.config.ping_timeout,
            "maxPayload": self.inner.config.max_payload,
        });
        client
            .write_frames(&[Frame::Text(open.to_string())], &WriteOptions::default())
            .await;

        client.connect("/", None).await;
        client
    }

    /// Force-close every session of every namespace.
    pub async fn close(&self) {
        let nsps: Vec<_> = self.inner.nsps.read().await.values().cloned().collect();
        for nsp in nsps {
            for socket in nsp.all_sockets().await {
                socket.on_close("server shutting down").await;
            }
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerInner {
    fn normalize(name: &str) -> String {
        if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/{}", name)
        }
    }

    pub(crate) async fn nsp(&self, name: &str) -> Option<Arc<Namespace>> {
        self.nsps.read().await.get(&Self::normalize(name)).cloned()
    }

    pub(crate) async fn of(&self, name: &str) -> Arc<Namespace> {
        let name = Self::normalize(name);
        let mut nsps = self.nsps.write().await;
        nsps.entry(name.clone())
            .or_insert_with(|| Namespace::new(&name))
            .clone()
    }

    async fn add_parent(&self, matcher: MatcherFn) -> Arc<ParentNamespace> {
        let n = self.parent_ids.fetch_add(1, Ordering::SeqCst);
        let parent = ParentNamespace::new(format!("/_{}", n), matcher);
        self.parents.write().await.push(Arc::clone(&parent));
        parent
    }

    /// Consult dynamic matchers for an unregistered namespace name, in
    /// registration order, stopping at the first that allows. The created
    /// child is memoized in the registry so later requests for the same
    /// name skip re-resolution.
    pub(crate) async fn check_namespace(
        &self,
        name: &str,
        handshake: &Handshake,
    ) -> Option<Arc<Namespace>> {
        let name = Self::normalize(name);
        if let Some(existing) = self.nsp(&name).await {
            return Some(existing);
        }

        let parents: Vec<_> = self.parents.read().await.clone();
        for parent in parents {
            if parent.allows(&name, handshake).await {
                let mut nsps = self.nsps.write().await;
                let nsp = nsps
                    .entry(name.clone())
                    .or_insert_with(|| parent.create_child(&name))
                    .clone();
                return Some(nsp);
            }
        }
        None
    }
}
