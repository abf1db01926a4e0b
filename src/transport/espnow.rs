//! Adapter A - ESP-NOW style broadcast-capable radio
//!
//! Frames go to the broadcast MAC until the link is CONNECTED, then straight
//! to the peer. There is no pairing handshake: the core adopts the first
//! sender it hears. Unicast destinations must be in the driver's peer table,
//! so peer changes register and deregister addresses before use.
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::config::EspNowConfig;
use crate::contracts::{Message, MessageType, NodeAddress, Protocol};
use crate::errors::{RcError, Result};
use crate::receiver::{Receiver, RADIO_TYPES};
use crate::remote_control::Link;
use crate::transmitter::RetryPolicy;
use crate::transport::Transport;

/// Driver receive callback: sender MAC and raw bytes
pub type RecvCallback = Box<dyn Fn(NodeAddress, &[u8]) + Send + Sync>;

/// Driver send-complete callback: destination and delivery status
pub type SentCallback = Box<dyn Fn(NodeAddress, bool) + Send + Sync>;

/// Minimal ESP-NOW driver surface
///
/// Callbacks may fire from interrupt-like context and must only do
/// non-blocking work.
pub trait EspNowDriver: Send + Sync + 'static {
    /// Bring up the radio and return this node's MAC
    fn init(&self, channel: u8, tx_power: u8) -> Result<NodeAddress>;

    fn add_peer(&self, addr: NodeAddress) -> Result<()>;

    fn del_peer(&self, addr: NodeAddress) -> Result<()>;

    fn has_peer(&self, addr: NodeAddress) -> bool;

    fn send(&self, dest: NodeAddress, data: &[u8]) -> Result<()>;

    fn set_receive_callback(&self, callback: Option<RecvCallback>);

    fn set_sent_callback(&self, callback: Option<SentCallback>);

    fn set_channel(&self, channel: u8) -> Result<()>;

    fn set_tx_power(&self, tx_power: u8) -> Result<()>;
}

pub struct EspNowTransport<D: EspNowDriver> {
    driver: Arc<D>,
    local: NodeAddress,
    config: Mutex<EspNowConfig>,
    retry: RetryPolicy,
    registered_peer: Mutex<Option<NodeAddress>>,
}

impl<D: EspNowDriver> EspNowTransport<D> {
    /// Initialise the radio and register the broadcast peer
    ///
    /// # Errors
    /// `DriverInit` if the radio cannot be brought up
    pub fn new(driver: D, config: EspNowConfig) -> Result<Self> {
        config.validate()?;

        let local = driver
            .init(config.channel, config.tx_power)
            .map_err(|err| RcError::DriverInit(format!("esp-now init: {}", err)))?;

        if !driver.has_peer(NodeAddress::BROADCAST) {
            driver
                .add_peer(NodeAddress::BROADCAST)
                .map_err(|err| RcError::DriverInit(format!("broadcast peer: {}", err)))?;
        }

        driver.set_sent_callback(Some(Box::new(|dest, delivered| {
            trace!(dest = %dest, delivered, "esp-now send complete");
        })));

        info!(
            local = %local,
            channel = config.channel,
            tx_power = config.tx_power,
            "esp-now initialised"
        );

        let retry = RetryPolicy::new(config.max_send_attempts, config.retry_delay_ms);
        Ok(Self {
            driver: Arc::new(driver),
            local,
            config: Mutex::new(config),
            retry,
            registered_peer: Mutex::new(None),
        })
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn config(&self) -> EspNowConfig {
        self.config.lock().clone()
    }
}

#[async_trait]
impl<D: EspNowDriver> Transport for EspNowTransport<D> {
    fn protocol(&self) -> Protocol {
        Protocol::EspNow
    }

    fn local_address(&self) -> NodeAddress {
        self.local
    }

    fn attach(&self, link: Weak<Link>) -> Result<()> {
        self.driver
            .set_receive_callback(Some(Box::new(move |sender: NodeAddress, data: &[u8]| {
                let Some(link) = link.upgrade() else {
                    return;
                };
                if let Some(mut msg) = Receiver::parse_or_discard(data, RADIO_TYPES) {
                    msg.set_from_addr(sender);
                    link.on_data_received(msg);
                }
            })));
        Ok(())
    }

    async fn low_level_send(&self, msg: &Message, link: &Link) {
        let dest = link.connected_peer().unwrap_or(NodeAddress::BROADCAST);
        let bytes = msg.to_bytes();
        let driver = self.driver.clone();

        let result = self
            .retry
            .run(|_| {
                let sent = driver.send(dest, &bytes);
                async move { sent }
            })
            .await;

        let counted = msg.kind() != MessageType::Heartbeat;
        match result {
            Ok(attempts) => {
                if attempts > 1 {
                    debug!(attempts, "esp-now send succeeded after retry");
                }
                if counted {
                    link.send_metrics().add_success();
                }
            }
            Err(err) => {
                error!(
                    dest = %dest,
                    attempts = self.retry.max_attempts(),
                    error = %err,
                    "esp-now send failed"
                );
                if counted {
                    link.send_metrics().add_failure();
                }
            }
        }
    }

    fn bind_peer(&self, peer: NodeAddress) -> Result<()> {
        if peer.is_null() {
            return Err(RcError::InvalidAddress(peer.to_string()));
        }
        if peer.is_broadcast() {
            return Ok(());
        }

        let mut registered = self.registered_peer.lock();
        if let Some(previous) = *registered {
            if previous != peer {
                if let Err(err) = self.driver.del_peer(previous) {
                    debug!(peer = %previous, error = %err, "stale peer not removed");
                }
            }
        }

        if !self.driver.has_peer(peer) {
            self.driver.add_peer(peer)?;
            debug!(peer = %peer, "esp-now peer added");
        }
        *registered = Some(peer);
        Ok(())
    }

    fn unbind_peer(&self, peer: NodeAddress) {
        if peer.is_broadcast() || peer.is_null() {
            return;
        }
        if let Err(err) = self.driver.del_peer(peer) {
            warn!(peer = %peer, error = %err, "failed to remove esp-now peer");
        }
        let mut registered = self.registered_peer.lock();
        if *registered == Some(peer) {
            *registered = None;
        }
    }

    fn set_protocol_config(&self, key: &str, value: i32) -> Result<()> {
        let mut config = self.config.lock();
        match key {
            "channel" => {
                let channel = u8::try_from(value)
                    .ok()
                    .filter(|c| EspNowConfig::CHANNEL_RANGE.contains(c))
                    .ok_or_else(|| {
                        RcError::InvalidConfig(format!("channel {} outside 1..=14", value))
                    })?;
                self.driver.set_channel(channel)?;
                config.channel = channel;
                info!(channel, "esp-now channel set");
                Ok(())
            }
            "tx_power" => {
                let tx_power = u8::try_from(value)
                    .ok()
                    .filter(|p| EspNowConfig::TX_POWER_RANGE.contains(p))
                    .ok_or_else(|| {
                        RcError::InvalidConfig(format!("tx_power {} outside 8..=84", value))
                    })?;
                self.driver.set_tx_power(tx_power)?;
                config.tx_power = tx_power;
                info!(tx_power, "esp-now tx power set");
                Ok(())
            }
            other => Err(RcError::UnsupportedConfig(format!("{} on ESPNOW", other))),
        }
    }

    fn protocol_config(&self, key: &str) -> Option<i32> {
        let config = self.config.lock();
        match key {
            "protocol" => Some(i32::from(Protocol::EspNow.id())),
            "channel" => Some(i32::from(config.channel)),
            "tx_power" => Some(i32::from(config.tx_power)),
            _ => None,
        }
    }

    fn detach(&self) {
        self.driver.set_receive_callback(None);
        self.driver.set_sent_callback(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::EspNowAir;

    #[test]
    fn test_init_registers_broadcast_peer() {
        let air = EspNowAir::new();
        let transport = EspNowTransport::new(air.radio(), EspNowConfig::default()).unwrap();
        assert!(transport.driver().has_peer(NodeAddress::BROADCAST));
        assert_eq!(transport.local_address(), transport.driver().address());
    }

    #[test]
    fn test_rejects_invalid_config() {
        let air = EspNowAir::new();
        let result = EspNowTransport::new(air.radio(), EspNowConfig::default().with_channel(0));
        assert!(matches!(result, Err(RcError::InvalidConfig(_))));
    }

    #[test]
    fn test_init_failure_is_fatal() {
        let air = EspNowAir::new();
        let radio = air.radio();
        air.set_powered(radio.address(), false);
        assert!(matches!(
            EspNowTransport::new(radio, EspNowConfig::default()),
            Err(RcError::DriverInit(_))
        ));
    }

    #[test]
    fn test_bind_and_unbind_peer() {
        let air = EspNowAir::new();
        let transport = EspNowTransport::new(air.radio(), EspNowConfig::default()).unwrap();
        let first = NodeAddress::new([0x02, 1, 1, 1, 1, 1]);
        let second = NodeAddress::new([0x02, 2, 2, 2, 2, 2]);

        assert!(transport.bind_peer(NodeAddress::NULL).is_err());
        transport.bind_peer(first).unwrap();
        assert!(transport.driver().has_peer(first));

        transport.bind_peer(second).unwrap();
        assert!(!transport.driver().has_peer(first), "previous peer replaced");
        assert!(transport.driver().has_peer(second));

        transport.unbind_peer(second);
        assert!(!transport.driver().has_peer(second));
        assert!(transport.driver().has_peer(NodeAddress::BROADCAST));
    }

    #[test]
    fn test_protocol_config() {
        let air = EspNowAir::new();
        let transport = EspNowTransport::new(air.radio(), EspNowConfig::default()).unwrap();

        assert_eq!(transport.protocol_config("protocol"), Some(0));
        assert_eq!(transport.protocol_config("channel"), Some(2));

        transport.set_protocol_config("channel", 11).unwrap();
        assert_eq!(transport.protocol_config("channel"), Some(11));
        assert_eq!(transport.driver().channel(), 11);

        transport.set_protocol_config("tx_power", 40).unwrap();
        assert_eq!(transport.protocol_config("tx_power"), Some(40));

        assert!(matches!(
            transport.set_protocol_config("channel", 15),
            Err(RcError::InvalidConfig(_))
        ));
        assert!(transport.set_protocol_config("tx_power", 85).is_err());
        assert!(matches!(
            transport.set_protocol_config("bitrate", 1),
            Err(RcError::UnsupportedConfig(_))
        ));
        assert_eq!(transport.protocol_config("bitrate"), None);
    }
}
