use thiserror::Error;

/// Crate-level error taxonomy.
///
/// Recoverable protocol problems (unknown packet type, invalid payload,
/// non-serializable data) never surface here: the codec degrades them into
/// ERROR packets instead. Only conditions that are fatal to a connection or
/// that reject an API call are reported as errors.
#[derive(Error, Debug)]
pub enum Error {
    /// The attachment count of a binary packet header was malformed.
    /// Fatal to the connection.
    #[error("illegal attachments")]
    IllegalAttachments,

    /// A binary frame arrived while no binary reconstruction was in
    /// progress. Fatal to the connection.
    #[error("got binary data when not reconstructing a packet")]
    UnexpectedBinaryData,

    /// An acknowledgement callback was supplied for a broadcast emission.
    /// Acks correlate one request with one response; a broadcast has no
    /// single responder.
    #[error("callbacks are not supported when broadcasting")]
    AckOnBroadcast,

    /// No registered or dynamic namespace matched the requested name.
    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    /// The underlying transport is no longer open.
    #[error("transport is closed")]
    TransportClosed,
}
