//! Raw-frame validation boundary
//!
//! Every adapter funnels bytes from its driver through here before anything
//! reaches the link. A frame of the wrong size or with a type the adapter does
//! not accept is discarded with a debug log and never seen by the core.
use tracing::debug;

use crate::contracts::{Message, MessageType};
use crate::errors::{RcError, Result};

/// Message types accepted by the radio adapters
pub const RADIO_TYPES: &[MessageType] = &[MessageType::Data, MessageType::Heartbeat];

/// Message types accepted on the Wi-Fi/UDP path
pub const NETWORK_TYPES: &[MessageType] = &[
    MessageType::Data,
    MessageType::Heartbeat,
    MessageType::IpDiscovery,
];

pub struct Receiver;

impl Receiver {
    pub fn parse_frame(data: &[u8], accepted: &[MessageType]) -> Result<Message> {
        let msg = Message::from_bytes(data)?;

        if !accepted.contains(&msg.kind()) {
            return Err(RcError::UnknownMessageType(msg.kind().as_u8()));
        }

        Ok(msg)
    }

    /// Parse, logging and swallowing any rejection
    pub fn parse_or_discard(data: &[u8], accepted: &[MessageType]) -> Option<Message> {
        match Self::parse_frame(data, accepted) {
            Ok(msg) => Some(msg),
            Err(err) => {
                debug!(len = data.len(), error = %err, "discarding malformed frame");
                None
            }
        }
    }
}
