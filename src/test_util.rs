/// Shared test plumbing: a server wired to channel-backed transports, with
/// activation captured through connect subscribers.
use crate::client::{Client, Handshake};
use crate::parser::Frame;
use crate::server::Server;
use crate::socket::Socket;
use crate::transport::ChannelTransport;
use std::sync::Arc;
use tokio::sync::mpsc;

pub(crate) struct TestConn {
    pub client: Arc<Client>,
    pub socket: Arc<Socket>,
    pub frames: mpsc::UnboundedReceiver<Frame>,
}

/// Install the log subscriber once, honoring `RUST_LOG`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Accept one connection and wait for its root session to activate.
pub(crate) async fn connect(server: &Server) -> TestConn {
    init_tracing();
    let (transport, frames) = ChannelTransport::new();
    let nsp = server.of("/").await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    nsp.on_connect(move |socket| {
        let _ = tx.send(socket);
    });
    let client = server.on_connection(transport, Handshake::default()).await;
    let socket = rx.recv().await.expect("root session failed to activate");
    TestConn {
        client,
        socket,
        frames,
    }
}

/// Attach `client` to an additional namespace and wait for the session.
pub(crate) async fn connect_nsp(server: &Server, client: &Arc<Client>, name: &str) -> Arc<Socket> {
    let nsp = server.of(name).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    nsp.on_connect(move |socket| {
        let _ = tx.send(socket);
    });
    client.connect(name, None).await;
    rx.recv().await.expect("session failed to activate")
}

/// Frames delivered so far, without waiting.
pub(crate) fn drain(frames: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
    let mut out = Vec::new();
    while let Ok(frame) = frames.try_recv() {
        out.push(frame);
    }
    out
}

/// Text of frames delivered so far.
pub(crate) fn drain_text(frames: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<String> {
    drain(frames)
        .into_iter()
        .filter_map(|f| f.as_text().map(str::to_string))
        .collect()
}
