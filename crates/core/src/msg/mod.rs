//! The dual-protocol message model.
//!
//! Every event leaving the bridge is wrapped in a [`Message`]: a category,
//! a type, a process-wide monotonic id, a millisecond timestamp and up to
//! two encodings of the payload. Clients pick one wire protocol at
//! subscribe time; producers only build the encodings some client is
//! actually using.
//!
//! The numeric values of categories, types and protocols are part of the
//! wire contract. Changing any of them is a major API bump.

pub mod de;
pub mod ser;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{json, Value};

use ser::ToSerial;

/// Bytes reserved at the front of every binary message for the header:
/// category (u8) | type (u8) | id (u64 LE) | timestamp (u64 LE).
pub const HEADER_BYTES: usize = 18;

/// Coarse message grouping used for subscriptions.
///
/// The values double as subscription mask bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageCategory {
    /// Handshake and bridge lifecycle messages. Not subscribable, every
    /// client receives these.
    Info = 1,
    /// Combat telemetry events.
    Combat = 2,
    /// Events from the cooperating extras module.
    Extras = 4,
    /// Squad roster deltas and snapshots.
    Squad = 8,
}

impl MessageCategory {
    /// Wire name of the category.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageCategory::Info => "Info",
            MessageCategory::Combat => "Combat",
            MessageCategory::Extras => "Extras",
            MessageCategory::Squad => "Squad",
        }
    }

    /// Subscription mask bit for this category.
    pub fn bit(self) -> u8 {
        self as u8
    }
}

/// Mask over the subscribable categories (Combat, Extras, Squad).
pub const SUBSCRIBABLE_CATEGORIES: u8 =
    MessageCategory::Combat as u8 | MessageCategory::Extras as u8 | MessageCategory::Squad as u8;

/// Concrete message types.
///
/// Each type belongs to exactly one category (see
/// [`MessageType::category`]), which makes an invalid (category, type)
/// combination unrepresentable at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// First message on every connection, also used to reject clients.
    ConnectionStatus = 1,
    /// Bridge metadata, re-sent whenever it changes.
    BridgeInfo = 2,
    /// Subscription outcome.
    Status = 3,
    /// Server-side goodbye before the pipe closes.
    Closing = 4,
    /// One combat telemetry event.
    CombatEvent = 5,
    /// Squad membership data from the extras module.
    ExtrasSquadUpdate = 6,
    /// Game language change.
    ExtrasLanguageChanged = 7,
    /// Key binding change.
    ExtrasKeyBindChanged = 8,
    /// In-game chat message.
    ExtrasChatMessage = 9,
    /// Full roster snapshot sent on subscribe.
    SquadStatus = 10,
    /// A player entered the roster.
    SquadAdd = 11,
    /// A roster entry changed.
    SquadUpdate = 12,
    /// A player left the roster.
    SquadRemove = 13,
}

/// Wire names of every message type, in value order. Sent to clients in
/// the `ConnectionStatus` handshake as the closed set of types.
pub const MESSAGE_TYPE_NAMES: [&str; 13] = [
    "ConnectionStatus",
    "BridgeInfo",
    "Status",
    "Closing",
    "CombatEvent",
    "ExtrasSquadUpdate",
    "ExtrasLanguageChanged",
    "ExtrasKeyBindChanged",
    "ExtrasChatMessage",
    "SquadStatus",
    "SquadAdd",
    "SquadUpdate",
    "SquadRemove",
];

impl MessageType {
    /// Wire name of the type.
    pub fn as_str(self) -> &'static str {
        MESSAGE_TYPE_NAMES[(self as u8 - 1) as usize]
    }

    /// The category this type belongs to.
    pub fn category(self) -> MessageCategory {
        use MessageType::*;
        match self {
            ConnectionStatus | BridgeInfo | Status | Closing => MessageCategory::Info,
            CombatEvent => MessageCategory::Combat,
            ExtrasSquadUpdate | ExtrasLanguageChanged | ExtrasKeyBindChanged
            | ExtrasChatMessage => MessageCategory::Extras,
            SquadStatus | SquadAdd | SquadUpdate | SquadRemove => MessageCategory::Squad,
        }
    }
}

/// Wire encodings a client can choose between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageProtocol {
    /// Compact little-endian binary framing.
    Binary = 1,
    /// One structured text object per message.
    Text = 2,
}

impl MessageProtocol {
    /// Wire name of the protocol, as used in subscription requests.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageProtocol::Binary => "Binary",
            MessageProtocol::Text => "Text",
        }
    }

    /// Parse a subscription request protocol name.
    pub fn from_name(name: &str) -> Option<MessageProtocol> {
        match name {
            "Binary" => Some(MessageProtocol::Binary),
            "Text" => Some(MessageProtocol::Text),
            _ => None,
        }
    }

    /// Protocol bit used in [`ProtocolMask`].
    pub fn bit(self) -> u8 {
        self as u8
    }
}

/// Set of protocols currently in use by at least one client.
///
/// Producers consult this to skip encoding work nobody would consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolMask(u8);

impl ProtocolMask {
    /// Both protocols. Handshake messages are built unconditionally.
    pub const ALL: ProtocolMask = ProtocolMask(
        MessageProtocol::Binary as u8 | MessageProtocol::Text as u8,
    );

    /// Mask from raw bits.
    pub fn from_bits(bits: u8) -> ProtocolMask {
        ProtocolMask(bits & ProtocolMask::ALL.0)
    }

    /// Is the given protocol in the set?
    pub fn contains(self, protocol: MessageProtocol) -> bool {
        self.0 & protocol.bit() != 0
    }

    /// True when no client wants any encoding.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// A payload that can be carried in both wire encodings.
pub trait Encode: ToSerial {
    /// The text (`data` member) representation.
    fn to_text(&self) -> Value;
}

/// Monotonic per-process message id source. First id handed out is 1.
#[derive(Debug)]
pub struct MessageIds(AtomicU64);

impl Default for MessageIds {
    fn default() -> Self {
        MessageIds(AtomicU64::new(1))
    }
}

impl MessageIds {
    /// Take the next id.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Milliseconds since the Unix epoch, the timestamp domain of all messages.
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Allocate a binary message buffer with the header area reserved.
///
/// The returned buffer already holds [`HEADER_BYTES`] zero bytes; append
/// the payload after them. [`Message::new`] fills the header in.
pub fn serial_buffer(payload_size: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_BYTES + payload_size);
    buf.put_bytes(0, HEADER_BYTES);
    buf
}

/// One immutable, reference-shared bridge message.
///
/// Constructed once by a producer and then shared by every matching client
/// queue; the encodings are cheap to clone (`Bytes` / `Arc<str>`).
#[derive(Debug, Clone)]
pub struct Message {
    mtype: MessageType,
    id: u64,
    timestamp: u64,
    serial: Option<Bytes>,
    text: Option<Arc<str>>,
}

impl Message {
    /// Build a message from raw parts.
    ///
    /// `serial`, when present, must have been allocated through
    /// [`serial_buffer`] (or otherwise start with [`HEADER_BYTES`] reserved
    /// bytes); the binary header is written over that area here. `text`,
    /// when present, becomes the `data` member of the text object.
    pub fn new(
        mtype: MessageType,
        id: u64,
        timestamp: u64,
        serial: Option<BytesMut>,
        text: Option<Value>,
    ) -> Message {
        let serial = serial.map(|mut buf| {
            debug_assert!(buf.len() >= HEADER_BYTES);
            write_header(&mut buf[..HEADER_BYTES], mtype, id, timestamp);
            buf.freeze()
        });

        let text = text.map(|data| {
            let obj = json!({
                "category": mtype.category().as_str(),
                "type": mtype.as_str(),
                "id": id,
                "timestamp": timestamp,
                "data": data,
            });
            Arc::from(obj.to_string().into_boxed_str())
        });

        Message {
            mtype,
            id,
            timestamp,
            serial,
            text,
        }
    }

    /// Build a message from an [`Encode`] payload, producing only the
    /// encodings listed in `protocols`.
    pub fn from_payload<T: Encode>(
        mtype: MessageType,
        id: u64,
        timestamp: u64,
        protocols: ProtocolMask,
        payload: &T,
    ) -> Message {
        let serial = if protocols.contains(MessageProtocol::Binary) {
            let mut buf = serial_buffer(payload.serial_size());
            payload.to_serial(&mut buf);
            Some(buf)
        } else {
            None
        };

        let text = if protocols.contains(MessageProtocol::Text) {
            Some(payload.to_text())
        } else {
            None
        };

        Message::new(mtype, id, timestamp, serial, text)
    }

    /// Build a payload-free message (e.g. `Closing`) in the encodings
    /// listed in `protocols`. The binary form is the bare header; the text
    /// form carries no `data` member.
    pub fn header_only(
        mtype: MessageType,
        id: u64,
        timestamp: u64,
        protocols: ProtocolMask,
    ) -> Message {
        let serial = if protocols.contains(MessageProtocol::Binary) {
            let mut buf = serial_buffer(0);
            write_header(&mut buf[..HEADER_BYTES], mtype, id, timestamp);
            Some(buf.freeze())
        } else {
            None
        };

        let text = if protocols.contains(MessageProtocol::Text) {
            let obj = json!({
                "category": mtype.category().as_str(),
                "type": mtype.as_str(),
                "id": id,
                "timestamp": timestamp,
            });
            Some(Arc::from(obj.to_string().into_boxed_str()))
        } else {
            None
        };

        Message {
            mtype,
            id,
            timestamp,
            serial,
            text,
        }
    }

    /// Message category, derived from the type.
    pub fn category(&self) -> MessageCategory {
        self.mtype.category()
    }

    /// Message type.
    pub fn mtype(&self) -> MessageType {
        self.mtype
    }

    /// Process-wide monotonic id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Milliseconds since the Unix epoch at production time.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Does the message carry the binary encoding?
    pub fn has_serial(&self) -> bool {
        self.serial.is_some()
    }

    /// Does the message carry the text encoding?
    pub fn has_text(&self) -> bool {
        self.text.is_some()
    }

    /// The binary frame, if built.
    pub fn serial(&self) -> Option<&Bytes> {
        self.serial.as_ref()
    }

    /// The text frame, if built.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Bytes to put on the wire for the given protocol.
    pub fn encoded(&self, protocol: MessageProtocol) -> Option<&[u8]> {
        match protocol {
            MessageProtocol::Binary => self.serial.as_deref(),
            MessageProtocol::Text => self.text.as_deref().map(str::as_bytes),
        }
    }
}

fn write_header(header: &mut [u8], mtype: MessageType, id: u64, timestamp: u64) {
    header[0] = mtype.category() as u8;
    header[1] = mtype as u8;
    header[2..10].copy_from_slice(&id.to_le_bytes());
    header[10..18].copy_from_slice(&timestamp.to_le_bytes());
}
