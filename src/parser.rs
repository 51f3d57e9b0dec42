/// Wire protocol codec.
///
/// Packets travel as text frames with the grammar
/// `<type digit>[<attachment count>-][<namespace>,][<ack id>][<json payload>]`,
/// followed by one raw binary frame per attachment for the BINARY_* types.
/// Encoding never fails: a non-serializable payload degrades into a single
/// ERROR frame. Decoding recovers malformed input into ERROR packets, except
/// for a malformed attachment count or an unexpected binary frame, both of
/// which are fatal to the connection.
use crate::error::Error;
use crate::payload::Payload;
use bytes::Bytes;
use serde_json::Value as JsonValue;

/// Packet types, in wire-digit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Connect = 0,
    Disconnect = 1,
    Event = 2,
    Ack = 3,
    Error = 4,
    BinaryEvent = 5,
    BinaryAck = 6,
}

impl PacketType {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(Self::Connect),
            1 => Some(Self::Disconnect),
            2 => Some(Self::Event),
            3 => Some(Self::Ack),
            4 => Some(Self::Error),
            5 => Some(Self::BinaryEvent),
            6 => Some(Self::BinaryAck),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Whether this type carries binary attachments as separate frames.
    pub fn is_binary(self) -> bool {
        matches!(self, Self::BinaryEvent | Self::BinaryAck)
    }
}

/// One discrete unit of data passed across the underlying transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(s) => Some(s),
            Frame::Binary(_) => None,
        }
    }
}

/// The decoded, structured representation of one or more frames.
///
/// `attachments` is only meaningful for BINARY_* packets: it is set while a
/// decoded packet still awaits its attachment frames and cleared once
/// reconstruction completes. Outbound packets leave it unset; the encoder
/// derives the count from the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub nsp: String,
    pub id: Option<u64>,
    pub data: Option<Payload>,
    pub attachments: Option<usize>,
}

impl Packet {
    pub fn new(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            nsp: "/".to_string(),
            id: None,
            data: None,
            attachments: None,
        }
    }

    /// CONNECT handshake reply, carrying the session id when present.
    pub fn connect(nsp: &str, sid: Option<&str>) -> Self {
        Self {
            packet_type: PacketType::Connect,
            nsp: nsp.to_string(),
            id: None,
            data: sid.map(|s| Payload::from(serde_json::json!({ "sid": s }))),
            attachments: None,
        }
    }

    pub fn disconnect(nsp: &str) -> Self {
        Self {
            packet_type: PacketType::Disconnect,
            nsp: nsp.to_string(),
            id: None,
            data: None,
            attachments: None,
        }
    }

    /// Named event packet. Picks BINARY_EVENT when any argument holds a
    /// binary buffer.
    pub fn event(nsp: &str, event: &str, args: Vec<Payload>) -> Self {
        let mut items = Vec::with_capacity(args.len() + 1);
        items.push(Payload::from(event));
        items.extend(args);
        let data = Payload::Array(items);
        Self {
            packet_type: if data.has_binary() {
                PacketType::BinaryEvent
            } else {
                PacketType::Event
            },
            nsp: nsp.to_string(),
            id: None,
            data: Some(data),
            attachments: None,
        }
    }

    /// Acknowledgement reply correlated to an inbound event id.
    pub fn ack(nsp: &str, id: u64, args: Vec<Payload>) -> Self {
        let data = Payload::Array(args);
        Self {
            packet_type: if data.has_binary() {
                PacketType::BinaryAck
            } else {
                PacketType::Ack
            },
            nsp: nsp.to_string(),
            id: Some(id),
            data: Some(data),
            attachments: None,
        }
    }

    pub fn error(nsp: &str, data: impl Into<Payload>) -> Self {
        Self {
            packet_type: PacketType::Error,
            nsp: nsp.to_string(),
            id: None,
            data: Some(data.into()),
            attachments: None,
        }
    }

    /// Event name and arguments of an EVENT/BINARY_EVENT payload.
    pub fn event_args(&self) -> Option<(&str, &[Payload])> {
        let items = self.data.as_ref()?.as_array()?;
        let (first, rest) = items.split_first()?;
        Some((first.as_str()?, rest))
    }

    /// Encode into wire frames: one text frame for plain types, a text
    /// header followed by the attachment frames for binary types.
    pub fn encode(&self) -> Vec<Frame> {
        if self.packet_type.is_binary() {
            let mut buffers = Vec::new();
            let json = self.data.as_ref().map(|d| d.deconstruct(&mut buffers));
            let header = self.encode_header(json.as_ref(), Some(buffers.len()));
            let mut frames = Vec::with_capacity(buffers.len() + 1);
            frames.push(Frame::Text(header));
            frames.extend(buffers.into_iter().map(Frame::Binary));
            frames
        } else {
            let json = self.data.as_ref().map(|d| d.to_json());
            vec![Frame::Text(self.encode_header(json.as_ref(), None))]
        }
    }

    fn encode_header(&self, json: Option<&JsonValue>, attachments: Option<usize>) -> String {
        let mut out = String::new();
        out.push_str(&self.packet_type.to_u8().to_string());

        if let Some(count) = attachments {
            out.push_str(&count.to_string());
            out.push('-');
        }

        if self.nsp != "/" {
            out.push_str(&self.nsp);
            out.push(',');
        }

        if let Some(id) = self.id {
            out.push_str(&id.to_string());
        }

        if let Some(json) = json {
            match serde_json::to_string(json) {
                Ok(payload) => out.push_str(&payload),
                Err(_) => {
                    return format!("{}\"encode error\"", PacketType::Error.to_u8());
                }
            }
        }

        out
    }
}

/// Pending reassembly of one binary packet's attachment frames.
struct BinaryReconstructor {
    packet: Packet,
    buffers: Vec<Bytes>,
}

impl BinaryReconstructor {
    fn take_binary_data(&mut self, buf: Bytes) -> Option<Packet> {
        self.buffers.push(buf);
        if self.buffers.len() == self.packet.attachments.unwrap_or(0) {
            let mut packet = self.packet.clone();
            packet.data = packet.data.map(|d| d.resolve_placeholders(&self.buffers));
            packet.attachments = None;
            Some(packet)
        } else {
            None
        }
    }
}

/// Per-connection, two-phase packet decoder.
///
/// In the text phase each frame decodes to at most one packet. A binary
/// header with a non-zero attachment count switches to the binary phase:
/// the packet is withheld until all attachment frames have arrived, then
/// reconstructed and returned. The decoder is strictly single-flight.
#[derive(Default)]
pub struct Decoder {
    reconstructor: Option<BinaryReconstructor>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one inbound frame. Returns the decoded packet once complete.
    ///
    /// Malformed text input yields an ERROR packet with a
    /// `"parser error: ..."` payload. The two fatal conditions — a
    /// malformed attachment count and a binary frame outside the binary
    /// phase — are returned as errors instead.
    pub fn add(&mut self, frame: Frame) -> Result<Option<Packet>, Error> {
        match frame {
            Frame::Text(text) => {
                if self.reconstructor.take().is_some() {
                    tracing::warn!("text frame interrupted binary reconstruction, dropping partial packet");
                }

                let packet = Self::decode_string(&text)?;
                if packet.packet_type.is_binary() {
                    if packet.attachments.unwrap_or(0) == 0 {
                        let mut packet = packet;
                        packet.attachments = None;
                        return Ok(Some(packet));
                    }
                    self.reconstructor = Some(BinaryReconstructor {
                        packet,
                        buffers: Vec::new(),
                    });
                    return Ok(None);
                }
                Ok(Some(packet))
            }
            Frame::Binary(buf) => {
                let reconstructor = self
                    .reconstructor
                    .as_mut()
                    .ok_or(Error::UnexpectedBinaryData)?;
                let packet = reconstructor.take_binary_data(buf);
                if packet.is_some() {
                    self.reconstructor = None;
                }
                Ok(packet)
            }
        }
    }

    /// Abandon any in-flight reconstruction without emitting, releasing the
    /// held buffers. Used when the owning connection closes mid-packet.
    pub fn destroy(&mut self) {
        if self.reconstructor.take().is_some() {
            tracing::debug!("decoder destroyed mid-reconstruction");
        }
    }

    fn decode_string(text: &str) -> Result<Packet, Error> {
        let bytes = text.as_bytes();

        let packet_type = match bytes
            .first()
            .and_then(|b| (*b as char).to_digit(10))
            .and_then(|d| PacketType::from_u8(d as u8))
        {
            Some(t) => t,
            None => return Ok(Self::error_packet("unknown packet type")),
        };

        let mut packet = Packet::new(packet_type);
        let mut i = 1;

        // Attachment count, terminated by '-'.
        if packet_type.is_binary() {
            let start = i;
            while i < bytes.len() && bytes[i] != b'-' {
                i += 1;
            }
            if i >= bytes.len() || i == start {
                return Err(Error::IllegalAttachments);
            }
            let count: usize = text[start..i]
                .parse()
                .map_err(|_| Error::IllegalAttachments)?;
            packet.attachments = Some(count);
            i += 1;
        }

        // Namespace, signalled by a leading '/', terminated by ','.
        if bytes.get(i) == Some(&b'/') {
            let start = i;
            while i < bytes.len() && bytes[i] != b',' {
                i += 1;
            }
            packet.nsp = text[start..i].to_string();
            if i < bytes.len() {
                i += 1;
            }
        }

        // Ack id, signalled by a leading digit.
        if bytes.get(i).is_some_and(|b| b.is_ascii_digit()) {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            packet.id = text[start..i].parse().ok();
        }

        // Remaining bytes are the JSON payload. Every type except ERROR
        // requires a list.
        if i < bytes.len() {
            match serde_json::from_str::<JsonValue>(&text[i..]) {
                Ok(value) if packet_type == PacketType::Error || value.is_array() => {
                    packet.data = Some(Payload::from(value));
                }
                _ => return Ok(Self::error_packet("invalid payload")),
            }
        }

        Ok(packet)
    }

    fn error_packet(msg: &str) -> Packet {
        Packet::error("/", format!("parser error: {}", msg))
    }
}
