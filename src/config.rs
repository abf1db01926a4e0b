//! Startup configuration
//!
//! Values are resolved once, before a link is constructed, and never change
//! while it runs. Every struct deserializes from TOML with all fields optional:
//!
//! ```toml
//! [link]
//! fast_mode = true
//! heartbeat_timeout_ms = 500
//!
//! [espnow]
//! channel = 6
//!
//! [wifi]
//! passphrase = "secret-pass"
//! ```
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{RcError, Result};
use crate::{
    HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS, LOCK_TIMEOUT_MS, METRICS_HEADER_EVERY,
    METRICS_INTERVAL_MS, QUEUE_DEPTH_RECV, QUEUE_DEPTH_SEND, RECV_MSG_TIMEOUT_MS,
};

/// Core link settings shared by every transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Depth-1 overwrite queues, lowest latency, no delivery guarantee
    pub fast_mode: bool,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub send_queue_depth: usize,
    pub recv_queue_depth: usize,
    pub recv_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    pub metrics_interval_ms: u64,
    pub metrics_header_every: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            fast_mode: false,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: HEARTBEAT_TIMEOUT_MS,
            send_queue_depth: QUEUE_DEPTH_SEND,
            recv_queue_depth: QUEUE_DEPTH_RECV,
            recv_timeout_ms: RECV_MSG_TIMEOUT_MS,
            lock_timeout_ms: LOCK_TIMEOUT_MS,
            metrics_interval_ms: METRICS_INTERVAL_MS,
            metrics_header_every: METRICS_HEADER_EVERY,
        }
    }
}

impl LinkConfig {
    /// Reliable-mode defaults
    pub fn reliable() -> Self {
        Self::default()
    }

    /// Fast-mode defaults
    pub fn fast() -> Self {
        Self {
            fast_mode: true,
            ..Self::default()
        }
    }

    pub fn with_fast_mode(mut self, fast: bool) -> Self {
        self.fast_mode = fast;
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    pub fn with_heartbeat_timeout_ms(mut self, ms: u64) -> Self {
        self.heartbeat_timeout_ms = ms;
        self
    }

    pub fn with_queue_depths(mut self, send: usize, recv: usize) -> Self {
        self.send_queue_depth = send;
        self.recv_queue_depth = recv;
        self
    }

    pub fn with_recv_timeout_ms(mut self, ms: u64) -> Self {
        self.recv_timeout_ms = ms;
        self
    }

    pub fn with_metrics_interval_ms(mut self, ms: u64) -> Self {
        self.metrics_interval_ms = ms;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(RcError::InvalidConfig(
                "heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(RcError::InvalidConfig(format!(
                "heartbeat_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if self.send_queue_depth == 0 || self.recv_queue_depth == 0 {
            return Err(RcError::InvalidConfig(
                "queue depths must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn effective_send_depth(&self) -> usize {
        if self.fast_mode {
            1
        } else {
            self.send_queue_depth
        }
    }

    pub fn effective_recv_depth(&self) -> usize {
        if self.fast_mode {
            1
        } else {
            self.recv_queue_depth
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// ESP-NOW radio settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EspNowConfig {
    /// 1..=14
    pub channel: u8,
    /// Quarter-dBm units, 8..=84
    pub tx_power: u8,
    pub max_send_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for EspNowConfig {
    fn default() -> Self {
        Self {
            channel: 2,
            tx_power: 82,
            max_send_attempts: 3,
            retry_delay_ms: 10,
        }
    }
}

impl EspNowConfig {
    pub const CHANNEL_RANGE: std::ops::RangeInclusive<u8> = 1..=14;
    pub const TX_POWER_RANGE: std::ops::RangeInclusive<u8> = 8..=84;

    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_tx_power(mut self, tx_power: u8) -> Self {
        self.tx_power = tx_power;
        self
    }

    pub fn with_retries(mut self, attempts: u32, delay_ms: u64) -> Self {
        self.max_send_attempts = attempts;
        self.retry_delay_ms = delay_ms;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !Self::CHANNEL_RANGE.contains(&self.channel) {
            return Err(RcError::InvalidConfig(format!(
                "espnow channel {} outside 1..=14",
                self.channel
            )));
        }
        if !Self::TX_POWER_RANGE.contains(&self.tx_power) {
            return Err(RcError::InvalidConfig(format!(
                "espnow tx_power {} outside 8..=84",
                self.tx_power
            )));
        }
        if self.max_send_attempts == 0 {
            return Err(RcError::InvalidConfig(
                "espnow max_send_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// nRF24 power amplifier level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaLevel {
    Min,
    Low,
    High,
    Max,
}

/// nRF24 radio settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Nrf24Config {
    /// RF channel 0..=125
    pub channel: u8,
    pub pa_level: PaLevel,
    /// Auto-retransmit delay in 250 µs steps, 0..=15
    pub retry_delay: u8,
    /// Auto-retransmit count, 0..=15
    pub retry_count: u8,
    pub poll_interval_ms: u64,
}

impl Default for Nrf24Config {
    fn default() -> Self {
        Self {
            channel: 76,
            pa_level: PaLevel::High,
            retry_delay: 5,
            retry_count: 15,
            poll_interval_ms: 5,
        }
    }
}

impl Nrf24Config {
    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_pa_level(mut self, level: PaLevel) -> Self {
        self.pa_level = level;
        self
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel > 125 {
            return Err(RcError::InvalidConfig(format!(
                "nrf24 channel {} outside 0..=125",
                self.channel
            )));
        }
        if self.retry_delay > 15 || self.retry_count > 15 {
            return Err(RcError::InvalidConfig(
                "nrf24 retry_delay and retry_count must be 0..=15".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(RcError::InvalidConfig(
                "nrf24 poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Wi-Fi bootstrap and UDP settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiConfig {
    pub ssid_prefix: String,
    pub passphrase: String,
    pub port: u16,
    pub channel: u8,
    /// First three octets of the link-local network
    pub subnet: [u8; 3],
    pub discovery_timeout_ms: u64,
    pub announce_interval_ms: u64,
    pub join_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub handshake_interval_ms: u64,
    pub peer_silence_timeout_ms: u64,
    pub max_bootstrap_attempts: u32,
    pub monitor_interval_ms: u64,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            ssid_prefix: "rc-".to_string(),
            passphrase: "rcpassword".to_string(),
            port: 12345,
            channel: 6,
            subnet: [192, 168, 4],
            discovery_timeout_ms: 3000,
            announce_interval_ms: 500,
            join_timeout_ms: 5000,
            handshake_timeout_ms: 5000,
            handshake_interval_ms: 200,
            peer_silence_timeout_ms: 3000,
            max_bootstrap_attempts: 3,
            monitor_interval_ms: 100,
        }
    }
}

impl WifiConfig {
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = passphrase.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_subnet(mut self, subnet: [u8; 3]) -> Self {
        self.subnet = subnet;
        self
    }

    pub fn with_discovery_timeout_ms(mut self, ms: u64) -> Self {
        self.discovery_timeout_ms = ms;
        self
    }

    pub fn with_handshake_timeout_ms(mut self, ms: u64) -> Self {
        self.handshake_timeout_ms = ms;
        self
    }

    pub fn with_peer_silence_timeout_ms(mut self, ms: u64) -> Self {
        self.peer_silence_timeout_ms = ms;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.passphrase.len() < 8 || self.passphrase.len() > 63 {
            return Err(RcError::InvalidConfig(
                "wifi passphrase must be 8..=63 characters".to_string(),
            ));
        }
        if !(1..=13).contains(&self.channel) {
            return Err(RcError::InvalidConfig(format!(
                "wifi channel {} outside 1..=13",
                self.channel
            )));
        }
        if self.max_bootstrap_attempts == 0 {
            return Err(RcError::InvalidConfig(
                "wifi max_bootstrap_attempts must be at least 1".to_string(),
            ));
        }
        if self.announce_interval_ms == 0
            || self.handshake_interval_ms == 0
            || self.monitor_interval_ms == 0
        {
            return Err(RcError::InvalidConfig(
                "wifi intervals must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn handshake_interval(&self) -> Duration {
        Duration::from_millis(self.handshake_interval_ms)
    }

    pub fn peer_silence_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_silence_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

/// Full node configuration as loaded from a TOML file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RcConfig {
    pub link: LinkConfig,
    pub espnow: EspNowConfig,
    pub nrf24: Nrf24Config,
    pub wifi: WifiConfig,
}

impl RcConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.link.validate()?;
        self.espnow.validate()?;
        self.nrf24.validate()?;
        self.wifi.validate()
    }
}
