//! Adapter B - nRF24L01 style point-to-point radio
//!
//! The radio speaks 5-byte addresses and has no receive interrupt worth
//! using, so this adapter:
//! - derives the 5-byte radio address from the canonical node address
//! - listens on two pipes: pipe 0 is its own address (auto-ack), pipe 1 the
//!   shared broadcast address (no ack)
//! - writes through either the broadcast pipe or the peer pipe depending on
//!   connection state
//! - polls the radio from a background task
//!
//! DATA frames from a sender are dropped until a heartbeat from that sender
//! has been seen, so a stray data frame never seeds a connection.
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::{Nrf24Config, PaLevel};
use crate::contracts::{Message, MessageType, NodeAddress, Protocol};
use crate::errors::{RcError, Result};
use crate::receiver::{Receiver, RADIO_TYPES};
use crate::remote_control::Link;
use crate::transport::Transport;
use crate::{ADDR_SIZE, MESSAGE_SIZE};

/// Native nRF24 address width
pub const RADIO_ADDR_SIZE: usize = 5;

/// Prefix byte of every node address minted from a chip id
pub const NODE_PREFIX: u8 = 0xD2;

/// 0xF0F0F0F0AA, least significant byte first as the radio expects
pub const BROADCAST_PIPE: RadioAddress = RadioAddress([0xAA, 0xF0, 0xF0, 0xF0, 0xF0]);

const OWN_PIPE: u8 = 0;
const BROADCAST_READING_PIPE: u8 = 1;

/// 5-byte on-air address
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RadioAddress(pub [u8; RADIO_ADDR_SIZE]);

impl RadioAddress {
    /// Fold byte 0 into byte 1 and drop it
    pub fn from_node(addr: NodeAddress) -> Self {
        let b = addr.as_bytes();
        Self([b[1] ^ b[0], b[2], b[3], b[4], b[5]])
    }

    /// Best-effort inverse of [`from_node`](Self::from_node), display only
    ///
    /// Assumes the address was minted with [`NODE_PREFIX`].
    pub fn approximate_node(&self) -> NodeAddress {
        let a = self.0;
        NodeAddress::new([NODE_PREFIX, a[0] ^ NODE_PREFIX, a[1], a[2], a[3], a[4]])
    }
}

impl fmt::Debug for RadioAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RadioAddress(")?;
        for byte in self.0 {
            write!(f, "{:02X}", byte)?;
        }
        write!(f, ")")
    }
}

/// Node identity derived from the chip's factory id
pub fn node_address_from_chip(chip_id: u64) -> NodeAddress {
    let id = chip_id.to_le_bytes();
    let mut bytes = [0u8; ADDR_SIZE];
    bytes[0] = NODE_PREFIX;
    bytes[1..].copy_from_slice(&id[..ADDR_SIZE - 1]);
    NodeAddress::new(bytes)
}

/// Register-level nRF24 operations the adapter needs
pub trait Nrf24Driver: Send + 'static {
    fn begin(&mut self) -> Result<()>;

    /// Factory-unique id used to mint the node address
    fn chip_id(&self) -> u64;

    fn set_channel(&mut self, channel: u8);

    fn set_pa_level(&mut self, level: PaLevel);

    fn set_retries(&mut self, delay: u8, count: u8);

    fn open_reading_pipe(&mut self, pipe: u8, addr: RadioAddress, auto_ack: bool);

    fn open_writing_pipe(&mut self, addr: RadioAddress);

    fn start_listening(&mut self);

    fn stop_listening(&mut self);

    /// Transmit one frame; `multicast` skips waiting for an ack
    fn write(&mut self, data: &[u8], multicast: bool) -> bool;

    fn available(&mut self) -> bool;

    /// Read the next frame, returning its length
    fn read(&mut self, buf: &mut [u8; MESSAGE_SIZE]) -> usize;

    fn power_down(&mut self);
}

/// Active transmit pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipe {
    Broadcast,
    Peer(NodeAddress),
}

struct RadioState<D> {
    driver: D,
    pipe: Pipe,
}

struct Nrf24Inner<D> {
    radio: Mutex<RadioState<D>>,
    local: NodeAddress,
    /// Sender whose heartbeat opened the data gate
    handshake: Mutex<Option<NodeAddress>>,
    config: Nrf24Config,
}

impl<D: Nrf24Driver> Nrf24Inner<D> {
    fn switch_to_broadcast(&self) {
        let mut radio = self.radio.lock();
        if radio.pipe == Pipe::Broadcast {
            return;
        }
        radio.driver.open_writing_pipe(BROADCAST_PIPE);
        radio.pipe = Pipe::Broadcast;
        info!("switched to BROADCAST pipe");
    }

    fn switch_to_peer(&self, peer: NodeAddress) {
        let mut radio = self.radio.lock();
        if radio.pipe == Pipe::Peer(peer) {
            return;
        }
        let addr = RadioAddress::from_node(peer);
        radio.driver.open_writing_pipe(addr);
        radio.pipe = Pipe::Peer(peer);
        info!(peer = %peer, radio_addr = ?addr, "switched to PEER pipe");
    }

    /// Drain every frame the radio is holding
    fn read_pending(&self) -> Vec<([u8; MESSAGE_SIZE], usize)> {
        let mut radio = self.radio.lock();
        let mut frames = Vec::new();
        while radio.driver.available() {
            let mut buf = [0u8; MESSAGE_SIZE];
            let len = radio.driver.read(&mut buf);
            frames.push((buf, len));
        }
        frames
    }

    fn handle_frame(&self, link: &Link, data: &[u8]) {
        let Some(msg) = Receiver::parse_or_discard(data, RADIO_TYPES) else {
            return;
        };
        let from = msg.from_addr();
        if from == self.local {
            return;
        }
        trace!(kind = ?msg.kind(), from = %from, "nrf24 frame");

        match msg.kind() {
            MessageType::Heartbeat => {
                *self.handshake.lock() = Some(from);
            }
            _ => {
                if *self.handshake.lock() != Some(from) {
                    debug!(from = %from, "data before handshake, discarding");
                    return;
                }
            }
        }

        link.on_data_received(msg);
        if let Some(peer) = link.connected_peer() {
            self.switch_to_peer(peer);
        }
    }

    async fn poll_loop(self: Arc<Self>, link: Weak<Link>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(link) = link.upgrade() else {
                debug!("link gone, nrf24 receive task exiting");
                return;
            };
            for (buf, len) in self.read_pending() {
                self.handle_frame(&link, &buf[..len.min(MESSAGE_SIZE)]);
            }
        }
    }
}

pub struct Nrf24Transport<D: Nrf24Driver> {
    inner: Arc<Nrf24Inner<D>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Nrf24Driver> Nrf24Transport<D> {
    /// Configure the radio, open both reading pipes and start on the broadcast pipe
    ///
    /// # Errors
    /// `DriverInit` if the radio does not respond
    pub fn new(mut driver: D, config: Nrf24Config) -> Result<Self> {
        config.validate()?;
        driver
            .begin()
            .map_err(|err| RcError::DriverInit(format!("nrf24 begin: {}", err)))?;

        let local = node_address_from_chip(driver.chip_id());
        driver.set_channel(config.channel);
        driver.set_pa_level(config.pa_level);
        driver.set_retries(config.retry_delay, config.retry_count);

        driver.stop_listening();
        driver.open_reading_pipe(BROADCAST_READING_PIPE, BROADCAST_PIPE, false);
        driver.open_reading_pipe(OWN_PIPE, RadioAddress::from_node(local), true);
        driver.start_listening();
        driver.open_writing_pipe(BROADCAST_PIPE);

        info!(
            local = %local,
            radio_addr = ?RadioAddress::from_node(local),
            channel = config.channel,
            "nrf24 initialised"
        );

        Ok(Self {
            inner: Arc::new(Nrf24Inner {
                radio: Mutex::new(RadioState {
                    driver,
                    pipe: Pipe::Broadcast,
                }),
                local,
                handshake: Mutex::new(None),
                config,
            }),
            receive_task: Mutex::new(None),
        })
    }

    pub fn active_pipe(&self) -> Pipe {
        self.inner.radio.lock().pipe
    }
}

#[async_trait]
impl<D: Nrf24Driver> Transport for Nrf24Transport<D> {
    fn protocol(&self) -> Protocol {
        Protocol::Nrf24
    }

    fn local_address(&self) -> NodeAddress {
        self.inner.local
    }

    fn address_size(&self) -> usize {
        RADIO_ADDR_SIZE
    }

    fn attach(&self, link: Weak<Link>) -> Result<()> {
        let runtime = Handle::try_current().map_err(|err| RcError::Runtime(err.to_string()))?;
        let task = runtime.spawn(self.inner.clone().poll_loop(link));
        if let Some(previous) = self.receive_task.lock().replace(task) {
            previous.abort();
        }
        debug!("nrf24 receive task started");
        Ok(())
    }

    async fn low_level_send(&self, msg: &Message, link: &Link) {
        let bytes = msg.to_bytes();
        let (delivered, pipe) = {
            let mut radio = self.inner.radio.lock();
            let multicast = radio.pipe == Pipe::Broadcast;
            radio.driver.stop_listening();
            let delivered = radio.driver.write(&bytes, multicast);
            radio.driver.start_listening();
            (delivered, radio.pipe)
        };

        if !delivered {
            warn!(kind = ?msg.kind(), pipe = ?pipe, "nrf24 send failed");
        }
        if msg.kind() != MessageType::Heartbeat {
            if delivered {
                link.send_metrics().add_success();
            } else {
                link.send_metrics().add_failure();
            }
        }
    }

    fn unbind_peer(&self, _peer: NodeAddress) {
        self.inner.switch_to_broadcast();
    }

    fn on_heartbeat_tick(&self, link: &Link) {
        if !link.is_connected() {
            self.inner.switch_to_broadcast();
            *self.inner.handshake.lock() = None;
        }
    }

    fn detach(&self) {
        if let Some(task) = self.receive_task.lock().take() {
            task.abort();
        }
        self.inner.radio.lock().driver.power_down();
        debug!("nrf24 powered down");
    }
}
