//! Transport capability contract
//!
//! A transport owns everything physical: addressing, discovery, framing onto
//! the medium and dispatching received frames. The core only sees this trait
//! and talks back through the [`Link`] handed to [`Transport::attach`].
//!
//! Adapters:
//! - [`espnow`]: broadcast-capable, directly addressed radio
//! - [`nrf24`]: hardware-acknowledged point-to-point radio with two pipes
//! - [`wifi`]: role negotiation, IP discovery handshake, UDP datagrams
use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::contracts::{Message, NodeAddress, Protocol};
use crate::errors::{RcError, Result};
use crate::receiver::{Receiver, RADIO_TYPES};
use crate::remote_control::Link;
use crate::ADDR_SIZE;

pub mod espnow;
pub mod nrf24;
pub mod wifi;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn protocol(&self) -> Protocol;

    /// This node's canonical address
    fn local_address(&self) -> NodeAddress;

    fn address_size(&self) -> usize {
        ADDR_SIZE
    }

    fn broadcast_address(&self) -> NodeAddress {
        NodeAddress::BROADCAST
    }

    /// Validate a raw frame; `None` for anything malformed
    fn parse_raw(&self, data: &[u8]) -> Option<Message> {
        Receiver::parse_or_discard(data, RADIO_TYPES)
    }

    /// Wire driver events to `link`; called once from `RemoteControl::new`
    fn attach(&self, link: Weak<Link>) -> Result<()>;

    /// Transport-specific discovery phase run by `connect()`
    ///
    /// An `Err` puts the link into ERROR.
    async fn discover(&self, _link: &Arc<Link>) -> Result<()> {
        Ok(())
    }

    /// Put one framed message on the medium
    ///
    /// Routes to the peer while CONNECTED and to broadcast otherwise, and
    /// records the outcome in the link's send metrics (heartbeats excluded).
    async fn low_level_send(&self, msg: &Message, link: &Link);

    /// A peer address was adopted or set
    fn bind_peer(&self, _peer: NodeAddress) -> Result<()> {
        Ok(())
    }

    /// The peer slot was cleared (explicitly or by heartbeat timeout)
    fn unbind_peer(&self, _peer: NodeAddress) {}

    /// Runs after every heartbeat/liveness check
    fn on_heartbeat_tick(&self, _link: &Link) {}

    fn set_protocol_config(&self, key: &str, _value: i32) -> Result<()> {
        Err(RcError::UnsupportedConfig(format!(
            "{} on {}",
            key,
            self.protocol()
        )))
    }

    fn protocol_config(&self, key: &str) -> Option<i32> {
        match key {
            "protocol" => Some(i32::from(self.protocol().id())),
            _ => None,
        }
    }

    /// Stop background work and release the hardware
    fn detach(&self) {}
}
