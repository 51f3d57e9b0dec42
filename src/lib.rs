//! Connection-multiplexing messaging layer over a single duplex transport.
//!
//! Many logical channels ("namespaces"), each with dynamically joinable
//! "rooms", share one underlying connection per client. A typed packet
//! protocol provides request/response correlation (acknowledgements) and
//! inline binary payload transport.
//!
//! Architecture, leaf first:
//! - [`parser`]: packet codec — text-framed wire grammar plus binary
//!   attachment deconstruction/reconstruction.
//! - [`adapter`]: per-namespace room registry and encode-once broadcast
//!   fan-out.
//! - [`socket`] / [`namespace`]: the session model — one session per
//!   (connection, namespace) pair, with rooms, acks and connect
//!   subscribers.
//! - [`client`]: per-connection multiplexer routing decoded packets to the
//!   session for their namespace, with root-first connect sequencing.
//! - [`server`]: namespace registry, dynamic namespace matchers, and the
//!   connection-acceptance entry point.
//!
//! The HTTP upgrade layer, transport framing and liveness, and message
//! persistence are all external concerns: delivery is best-effort,
//! in-memory, and scoped to currently-attached sessions.

pub mod adapter;
pub mod client;
pub mod error;
pub mod handlers;
pub mod namespace;
pub mod parser;
pub mod payload;
pub mod server;
pub mod socket;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_util;

pub use adapter::{Adapter, BroadcastOptions, EmitFlags};
pub use client::{Client, Handshake};
pub use error::Error;
pub use namespace::{Namespace, ParentNamespace};
pub use parser::{Decoder, Frame, Packet, PacketType};
pub use payload::Payload;
pub use server::{Server, ServerConfig};
pub use socket::{AckSender, SessionState, Socket};
pub use transport::{ChannelTransport, SendOptions, Transport};
