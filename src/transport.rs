/// The narrow duplex-transport capability consumed by the core.
///
/// The core never inspects transport details beyond open/closed state:
/// framing, liveness pings and the HTTP upgrade all belong to the embedder.
/// Inbound traffic is pushed by the embedder into `Client::on_data`; this
/// trait only covers the outbound half and lifecycle.
use crate::parser::Frame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Per-send options forwarded to the transport.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub compress: bool,
}

/// Outbound half of a duplex message transport.
///
/// `send` is fire-and-forget: delivery is best-effort and failures on a
/// closing transport are silently dropped, matching the broadcast policy of
/// skipping dead targets.
pub trait Transport: Send + Sync {
    fn is_open(&self) -> bool;
    fn send(&self, frame: Frame, opts: &SendOptions);
    fn close(&self);
}

/// Channel-backed transport: frames are pushed onto an unbounded queue the
/// embedder drains into the real socket. Doubles as the test transport.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Frame>,
    open: AtomicBool,
}

impl ChannelTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                open: AtomicBool::new(true),
            }),
            rx,
        )
    }
}

impl Transport for ChannelTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, frame: Frame, _opts: &SendOptions) {
        if !self.is_open() {
            return;
        }
        if self.tx.send(frame).is_err() {
            tracing::debug!("transport receiver dropped, frame discarded");
        }
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drops_frames_after_close() {
        let (transport, mut rx) = ChannelTransport::new();
        transport.send(Frame::Text("a".to_string()), &SendOptions::default());
        transport.close();
        transport.send(Frame::Text("b".to_string()), &SendOptions::default());

        assert_eq!(rx.recv().await, Some(Frame::Text("a".to_string())));
        assert!(rx.try_recv().is_err());
        assert!(!transport.is_open());
    }
}
