//! Core data structures for the rc_link protocol
//!
//! Every frame exchanged between two nodes is a fixed 32-byte [`Message`]:
//!
//! ```text
//! offset 0      : type       (1 byte)   0=DATA, 3=HEARTBEAT, 4=IP_DISCOVERY
//! offset 1..6   : from_addr  (6 bytes)  sender's canonical node address
//! offset 7..31  : payload    (25 bytes) opaque; a `Payload` when type=DATA
//! ```
//!
//! Both structures carry compile-time size assertions; a layout change that
//! alters either total breaks the build.
use std::fmt;

use rand::Rng;

use crate::errors::{RcError, Result};
use crate::{ADDR_SIZE, MESSAGE_SIZE, PAYLOAD_SIZE};

/// Canonical 6-byte node identity (MAC-like)
///
/// Used unchanged across every transport. Adapters that need a narrower
/// physical address derive it internally and never hand it back out.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeAddress(pub [u8; ADDR_SIZE]);

impl NodeAddress {
    /// All-ones broadcast address
    pub const BROADCAST: Self = Self([0xFF; ADDR_SIZE]);

    /// All-zero address, "no peer"
    pub const NULL: Self = Self([0; ADDR_SIZE]);

    pub const fn new(bytes: [u8; ADDR_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDR_SIZE] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0; ADDR_SIZE]
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xFF; ADDR_SIZE]
    }

    /// Random locally-administered unicast address
    pub fn random() -> Self {
        let mut bytes = [0u8; ADDR_SIZE];
        rand::thread_rng().fill(&mut bytes[..]);
        bytes[0] = (bytes[0] & 0xFC) | 0x02;
        Self(bytes)
    }
}

impl From<[u8; ADDR_SIZE]> for NodeAddress {
    fn from(bytes: [u8; ADDR_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddress({})", self)
    }
}

/// Message type byte
///
/// Gaps in the numbering are reserved; a frame carrying any other value is
/// rejected at the parse boundary.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Application payload
    Data = 0,

    /// Liveness signal, never queued or counted
    Heartbeat = 3,

    /// Wi-Fi handshake carrying the sender's IPv4 address
    IpDiscovery = 4,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = RcError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Data),
            3 => Ok(Self::Heartbeat),
            4 => Ok(Self::IpDiscovery),
            other => Err(RcError::UnknownMessageType(other)),
        }
    }
}

/// Payload - user data carried by a DATA message
///
/// # Memory Layout
/// Total size: 25 bytes (packed, no padding)
/// - id1..id4: 4 bytes (u8 each)
/// - value1..value5: 20 bytes (f32 each, little-endian on the wire)
/// - flags: 1 byte (caller-defined bitfield)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Payload {
    pub id1: u8,
    pub id2: u8,
    pub id3: u8,
    pub id4: u8,
    pub value1: f32,
    pub value2: f32,
    pub value3: f32,
    pub value4: f32,
    pub value5: f32,
    pub flags: u8,
}

const _: () = assert!(std::mem::size_of::<Payload>() == PAYLOAD_SIZE);

impl Payload {
    pub fn new(ids: [u8; 4], values: [f32; 5], flags: u8) -> Self {
        Self {
            id1: ids[0],
            id2: ids[1],
            id3: ids[2],
            id4: ids[3],
            value1: values[0],
            value2: values[1],
            value3: values[2],
            value4: values[3],
            value5: values[4],
            flags,
        }
    }

    pub fn ids(&self) -> [u8; 4] {
        [self.id1, self.id2, self.id3, self.id4]
    }

    pub fn values(&self) -> [f32; 5] {
        let Payload {
            value1,
            value2,
            value3,
            value4,
            value5,
            ..
        } = *self;
        [value1, value2, value3, value4, value5]
    }

    /// Serialize to the 25-byte wire layout
    pub fn to_bytes(&self) -> [u8; PAYLOAD_SIZE] {
        let mut out = [0u8; PAYLOAD_SIZE];
        out[..4].copy_from_slice(&self.ids());
        for (i, value) in self.values().iter().enumerate() {
            let start = 4 + i * 4;
            out[start..start + 4].copy_from_slice(&value.to_le_bytes());
        }
        out[24] = self.flags;
        out
    }

    /// Deserialize from the 25-byte wire layout
    pub fn from_bytes(bytes: &[u8; PAYLOAD_SIZE]) -> Self {
        let value_at = |i: usize| {
            let start = 4 + i * 4;
            f32::from_le_bytes([bytes[start], bytes[start + 1], bytes[start + 2], bytes[start + 3]])
        };
        Self::new(
            [bytes[0], bytes[1], bytes[2], bytes[3]],
            [value_at(0), value_at(1), value_at(2), value_at(3), value_at(4)],
            bytes[24],
        )
    }
}

/// Message - the fixed 32-byte unit exchanged between nodes
///
/// Immutable once enqueued; constructed through [`Message::data`],
/// [`Message::system`] or the parse boundary.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Message {
    kind: MessageType,
    from_addr: NodeAddress,
    payload: [u8; PAYLOAD_SIZE],
}

const _: () = assert!(std::mem::size_of::<Message>() == MESSAGE_SIZE);

impl Message {
    pub fn new(kind: MessageType, from_addr: NodeAddress, payload: [u8; PAYLOAD_SIZE]) -> Self {
        Self {
            kind,
            from_addr,
            payload,
        }
    }

    /// Wrap a user payload into a DATA message
    pub fn data(from_addr: NodeAddress, payload: &Payload) -> Self {
        Self::new(MessageType::Data, from_addr, payload.to_bytes())
    }

    /// System message (heartbeat, handshake) with a zeroed payload
    pub fn system(kind: MessageType, from_addr: NodeAddress) -> Self {
        Self::new(kind, from_addr, [0; PAYLOAD_SIZE])
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn from_addr(&self) -> NodeAddress {
        self.from_addr
    }

    /// Replace the sender address with the one reported by the driver
    pub fn set_from_addr(&mut self, addr: NodeAddress) {
        self.from_addr = addr;
    }

    pub fn payload_bytes(&self) -> &[u8; PAYLOAD_SIZE] {
        &self.payload
    }

    /// Decoded user payload, only for DATA messages
    pub fn payload(&self) -> Option<Payload> {
        match self.kind {
            MessageType::Data => Some(Payload::from_bytes(&self.payload)),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> [u8; MESSAGE_SIZE] {
        let mut out = [0u8; MESSAGE_SIZE];
        out[0] = self.kind.as_u8();
        out[1..1 + ADDR_SIZE].copy_from_slice(self.from_addr.as_bytes());
        out[1 + ADDR_SIZE..].copy_from_slice(&self.payload);
        out
    }

    /// Decode a raw frame
    ///
    /// # Errors
    /// - `InvalidPacketLength` unless `data` is exactly 32 bytes
    /// - `UnknownMessageType` for an unrecognised type byte
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != MESSAGE_SIZE {
            return Err(RcError::InvalidPacketLength {
                expected: MESSAGE_SIZE,
                received: data.len(),
            });
        }

        let kind = MessageType::try_from(data[0])?;
        let mut from = [0u8; ADDR_SIZE];
        from.copy_from_slice(&data[1..1 + ADDR_SIZE]);
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload.copy_from_slice(&data[1 + ADDR_SIZE..]);

        Ok(Self::new(kind, NodeAddress(from), payload))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("from_addr", &self.from_addr)
            .finish_non_exhaustive()
    }
}

/// Connection state of a link, owned by the core
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Error = 3,
}

impl ConnectionState {
    /// Short form used on the operator metrics line
    pub fn abbreviation(self) -> &'static str {
        match self {
            Self::Disconnected => "DISC",
            Self::Connecting => "CONN?",
            Self::Connected => "CONN",
            Self::Error => "ERR",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Physical transport identifier
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    EspNow = 0,
    Wifi = 1,
    Ble = 2,
    Nrf24 = 3,
}

impl Protocol {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::EspNow => "ESPNOW",
            Self::Wifi => "WIFI",
            Self::Ble => "BLE",
            Self::Nrf24 => "NRF24",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Last peer reported by a transport's discovery phase
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryResult {
    pub discovered: bool,
    pub peer_addr: NodeAddress,
    /// Transport-specific detail, e.g. the peer's IP address
    pub info: String,
}
