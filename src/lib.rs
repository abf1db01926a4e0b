//! rc_link - symmetric peer-to-peer remote-control link
//!
//! **Creator**: Shayan Golmezerji
//! **License**: Creative Commons Attribution 4.0 International (CC BY 4.0)
//!
//! Two identical nodes pair up over one of several physical transports and
//! exchange fixed 32-byte frames with no pre-assigned leader/follower role.
//!
//! # Design Principles
//! - One state machine (connection, heartbeat, queues, metrics) for all media
//! - Transports plug in through the small [`Transport`] capability trait
//! - Fixed-size wire frames, no allocation on the hot path
//! - Steady-state errors are state (connection, metrics, booleans), not panics
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use rc_link::{LinkConfig, Payload, RemoteControl};
//! use rc_link::sim::EspNowAir;
//! use rc_link::transport::espnow::EspNowTransport;
//!
//! # async fn run() -> rc_link::Result<()> {
//! let air = EspNowAir::new();
//! let transport = EspNowTransport::new(air.radio(), Default::default())?;
//! let rc = RemoteControl::new(Arc::new(transport), LinkConfig::default())?;
//! rc.connect().await?;
//! rc.send_data(&Payload::new([1, 0, 0, 0], [0.5, 0.0, 0.0, 0.0, 0.0], 0));
//! # Ok(())
//! # }
//! ```

pub mod errors;
pub mod contracts;
pub mod receiver;
pub mod transmitter;
pub mod queue;
pub mod metrics;
pub mod config;
pub mod remote_control;
pub mod transport;
pub mod sim;

pub use config::{EspNowConfig, LinkConfig, Nrf24Config, PaLevel, RcConfig, WifiConfig};
pub use contracts::{
    ConnectionState, DiscoveryResult, Message, MessageType, NodeAddress, Payload, Protocol,
};
pub use errors::{RcError, Result};
pub use metrics::{Metrics, MetricsSnapshot};
pub use remote_control::{Link, RemoteControl};
pub use transport::Transport;

/// Fixed wire frame size in bytes
pub const MESSAGE_SIZE: usize = 32;

/// User payload size in bytes
pub const PAYLOAD_SIZE: usize = 25;

/// Canonical node address size in bytes
pub const ADDR_SIZE: usize = 6;

/// Heartbeat period in milliseconds
pub const HEARTBEAT_INTERVAL_MS: u64 = 100;

/// Silence after which a CONNECTED link drops to DISCONNECTED
pub const HEARTBEAT_TIMEOUT_MS: u64 = 300;

/// Send queue depth in reliable mode
pub const QUEUE_DEPTH_SEND: usize = 10;

/// Receive queue depth in reliable mode
pub const QUEUE_DEPTH_RECV: usize = 10;

/// Bounded wait for `recv_msg` / `recv_data`
pub const RECV_MSG_TIMEOUT_MS: u64 = 5;

/// Bounded wait for the link-state lock on the receive path
pub const LOCK_TIMEOUT_MS: u64 = 5;

/// Number of slots in the metrics activity window
pub const METRICS_SLOT_COUNT: usize = 10;

/// Duration of one metrics activity slot in milliseconds
pub const METRICS_SLOT_MS: u64 = 100;

/// Default rate limit for the operator metrics line
pub const METRICS_INTERVAL_MS: u64 = 1000;

/// Operator metrics header is repeated every this many lines
pub const METRICS_HEADER_EVERY: u32 = 20;
