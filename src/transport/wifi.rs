//! Adapter C - Wi-Fi role negotiation, IP handshake and UDP datagrams
//!
//! Nothing about the peer is known up front, so `discover` bootstraps it:
//!
//! 1. Presence beacons are exchanged for a bounded window. The node with the
//!    higher MAC hosts a network, the other joins it.
//! 2. Once associated, both sides broadcast an `IP_DISCOVERY` request
//!    carrying their IPv4 address. A request is answered with a unicast
//!    reply, so each side learns the other's address.
//!
//! After that, frames go to the peer's IP (or the subnet broadcast while it
//! is unknown). A monitor task re-runs the bootstrap when the association
//! drops or the peer has been silent for too long.
use std::cmp::Ordering as CmpOrdering;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::WifiConfig;
use crate::contracts::{ConnectionState, Message, MessageType, NodeAddress, Protocol};
use crate::errors::{RcError, Result};
use crate::receiver::{Receiver, NETWORK_TYPES};
use crate::remote_control::Link;
use crate::transmitter::RetryPolicy;
use crate::transport::Transport;
use crate::{MESSAGE_SIZE, PAYLOAD_SIZE};

/// Handshake payload byte 4: request, answered by the receiver
pub const HANDSHAKE_REQUEST: u8 = 0;

/// Handshake payload byte 4: reply, never answered
pub const HANDSHAKE_REPLY: u8 = 1;

const JOIN_RETRY_DELAY_MS: u64 = 250;

/// Presence announcement exchanged before any network exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceBeacon {
    pub node: NodeAddress,
    pub priority: u8,
}

impl PresenceBeacon {
    pub fn for_node(node: NodeAddress) -> Self {
        Self {
            node,
            priority: priority_for(node),
        }
    }
}

/// Byte sum of the MAC, mod 256
pub fn priority_for(mac: NodeAddress) -> u8 {
    let sum: u32 = mac.as_bytes().iter().map(|b| u32::from(*b)).sum();
    (sum % 256) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Join,
}

/// Decide this node's role from the first peer beacon heard
///
/// Host when no peer was heard or our MAC compares higher; equal MACs fall
/// back to the beacon priority.
pub fn negotiate_role(
    local: NodeAddress,
    local_priority: u8,
    peer: Option<&PresenceBeacon>,
) -> Role {
    let Some(peer) = peer else {
        return Role::Host;
    };
    match local.as_bytes().cmp(peer.node.as_bytes()) {
        CmpOrdering::Greater => Role::Host,
        CmpOrdering::Less => Role::Join,
        CmpOrdering::Equal if local_priority > peer.priority => Role::Host,
        CmpOrdering::Equal => Role::Join,
    }
}

/// Network name hosted by `mac`
pub fn ssid_for(prefix: &str, mac: NodeAddress) -> String {
    let b = mac.as_bytes();
    format!("{}{:02x}{:02x}{:02x}", prefix, b[3], b[4], b[5])
}

pub fn host_ip(subnet: [u8; 3]) -> Ipv4Addr {
    Ipv4Addr::new(subnet[0], subnet[1], subnet[2], 1)
}

/// Stable joiner address in `.2..=.251`
pub fn joiner_ip(subnet: [u8; 3], mac: NodeAddress) -> Ipv4Addr {
    let host = 2 + (crc32fast::hash(mac.as_bytes()) % 250) as u8;
    Ipv4Addr::new(subnet[0], subnet[1], subnet[2], host)
}

pub fn broadcast_ip(subnet: [u8; 3]) -> Ipv4Addr {
    Ipv4Addr::new(subnet[0], subnet[1], subnet[2], 255)
}

/// Build an `IP_DISCOVERY` frame carrying `ip`
pub fn handshake_message(from: NodeAddress, ip: Ipv4Addr, kind: u8) -> Message {
    let mut payload = [0u8; PAYLOAD_SIZE];
    payload[..4].copy_from_slice(&ip.octets());
    payload[4] = kind;
    Message::new(MessageType::IpDiscovery, from, payload)
}

/// Unpack an `IP_DISCOVERY` payload into the advertised address and request/reply flag
pub fn parse_handshake(msg: &Message) -> (Ipv4Addr, u8) {
    let p = msg.payload_bytes();
    (Ipv4Addr::new(p[0], p[1], p[2], p[3]), p[4])
}

/// Connectionless datagram endpoint
#[async_trait]
pub trait Datagram: Send + Sync {
    async fn send_to(&self, buf: &[u8], target: SocketAddrV4) -> Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4)>;
}

#[async_trait]
impl Datagram for UdpSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddrV4) -> Result<usize> {
        Ok(UdpSocket::send_to(self, buf, target).await?)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4)> {
        match UdpSocket::recv_from(self, buf).await? {
            (len, SocketAddr::V4(from)) => Ok((len, from)),
            (_, SocketAddr::V6(from)) => Err(RcError::from(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected IPv6 sender {}", from),
            ))),
        }
    }
}

/// Station/soft-AP control plus socket creation
#[async_trait]
pub trait WifiDriver: Send + Sync + 'static {
    fn mac_address(&self) -> NodeAddress;

    async fn announce(&self, beacon: PresenceBeacon) -> Result<()>;

    /// Beacons heard since the previous scan
    async fn scan(&self) -> Result<Vec<PresenceBeacon>>;

    /// Start hosting a network; returns the address assigned to this node
    async fn host(
        &self,
        ssid: &str,
        passphrase: &str,
        channel: u8,
        ip: Ipv4Addr,
    ) -> Result<Ipv4Addr>;

    /// Join an existing network requesting `ip`
    async fn join(&self, ssid: &str, passphrase: &str, ip: Ipv4Addr) -> Result<Ipv4Addr>;

    fn is_associated(&self) -> bool;

    /// Drop any hosted or joined network
    fn leave(&self);

    async fn bind(&self, addr: SocketAddrV4) -> Result<Arc<dyn Datagram>>;
}

#[derive(Default)]
struct Session {
    socket: Option<Arc<dyn Datagram>>,
    role: Option<Role>,
    my_ip: Option<Ipv4Addr>,
    peer_ip: Option<Ipv4Addr>,
}

struct WifiInner<D> {
    driver: D,
    config: WifiConfig,
    local: NodeAddress,
    session: Mutex<Session>,
    /// Last frame from anyone but ourselves; starts at bootstrap completion
    last_peer_rx: Mutex<Option<Instant>>,
    link: Mutex<Weak<Link>>,
    rx_task: Mutex<Option<JoinHandle<()>>>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
    bootstrap_lock: tokio::sync::Mutex<()>,
}

impl<D: WifiDriver> WifiInner<D> {
    fn beacon(&self) -> PresenceBeacon {
        PresenceBeacon::for_node(self.local)
    }

    fn link(&self) -> Option<Arc<Link>> {
        self.link.lock().upgrade()
    }

    fn teardown(&self) {
        if let Some(task) = self.rx_task.lock().take() {
            task.abort();
        }
        self.driver.leave();
        *self.session.lock() = Session::default();
    }

    /// Announce and listen until another node is heard or the window closes
    async fn discovery_window(&self) -> Option<PresenceBeacon> {
        let deadline = Instant::now() + self.config.discovery_timeout();
        let beacon = self.beacon();
        loop {
            if let Err(err) = self.driver.announce(beacon).await {
                debug!(error = %err, "presence announce failed");
            }
            match self.driver.scan().await {
                Ok(heard) => {
                    if let Some(peer) = heard.into_iter().find(|b| b.node != self.local) {
                        info!(peer = %peer.node, priority = peer.priority, "peer beacon heard");
                        return Some(peer);
                    }
                }
                Err(err) => debug!(error = %err, "presence scan failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            sleep_until((now + self.config.announce_interval()).min(deadline)).await;
        }
    }

    async fn associate(&self, role: Role, peer: Option<&PresenceBeacon>) -> Result<Ipv4Addr> {
        let config = &self.config;
        match role {
            Role::Host => {
                let ssid = ssid_for(&config.ssid_prefix, self.local);
                let ip = self
                    .driver
                    .host(&ssid, &config.passphrase, config.channel, host_ip(config.subnet))
                    .await?;
                info!(ssid = %ssid, ip = %ip, "hosting network");
                Ok(ip)
            }
            Role::Join => {
                let peer = peer
                    .ok_or_else(|| RcError::DiscoveryFailed("no host to join".to_string()))?;
                let ssid = ssid_for(&config.ssid_prefix, peer.node);
                let wanted = joiner_ip(config.subnet, self.local);
                let attempts = (config.join_timeout_ms / JOIN_RETRY_DELAY_MS).max(1) as u32;

                let joined = Mutex::new(None);
                let (driver, ssid_ref, joined_ref) = (&self.driver, ssid.as_str(), &joined);
                RetryPolicy::new(attempts, JOIN_RETRY_DELAY_MS)
                    .run(move |_| async move {
                        let ip = driver.join(ssid_ref, &config.passphrase, wanted).await?;
                        *joined_ref.lock() = Some(ip);
                        Ok(())
                    })
                    .await?;

                let ip = joined
                    .into_inner()
                    .ok_or_else(|| RcError::Driver("join reported no address".to_string()))?;
                info!(ssid = %ssid, ip = %ip, "joined network");
                Ok(ip)
            }
        }
    }

    /// Full bootstrap: role negotiation, association, socket, IP handshake
    async fn bootstrap(self: &Arc<Self>) -> Result<()> {
        let _running = self.bootstrap_lock.lock().await;
        self.teardown();

        let mut associated = None;
        for attempt in 1..=self.config.max_bootstrap_attempts {
            let peer = self.discovery_window().await;
            let role = negotiate_role(self.local, priority_for(self.local), peer.as_ref());
            debug!(attempt, role = ?role, "role negotiated");
            match self.associate(role, peer.as_ref()).await {
                Ok(ip) => {
                    associated = Some((role, ip));
                    break;
                }
                Err(err) => {
                    warn!(attempt, role = ?role, error = %err, "bootstrap attempt failed");
                    self.driver.leave();
                }
            }
        }

        let (role, my_ip) = match associated {
            Some(found) => found,
            None => {
                warn!("bootstrap attempts exhausted, falling back to hosting");
                let ip = self.associate(Role::Host, None).await.map_err(|err| {
                    RcError::DiscoveryFailed(format!("fallback hosting failed: {}", err))
                })?;
                (Role::Host, ip)
            }
        };

        let socket = self
            .driver
            .bind(SocketAddrV4::new(my_ip, self.config.port))
            .await?;
        {
            let mut session = self.session.lock();
            session.socket = Some(socket.clone());
            session.role = Some(role);
            session.my_ip = Some(my_ip);
            session.peer_ip = None;
        }
        *self.last_peer_rx.lock() = Some(Instant::now());

        let task = tokio::spawn(self.clone().receive_loop(socket.clone()));
        if let Some(previous) = self.rx_task.lock().replace(task) {
            previous.abort();
        }

        self.handshake(socket.as_ref(), my_ip).await;
        Ok(())
    }

    async fn handshake(&self, socket: &dyn Datagram, my_ip: Ipv4Addr) {
        let deadline = Instant::now() + self.config.handshake_timeout();
        let target = SocketAddrV4::new(broadcast_ip(self.config.subnet), self.config.port);
        let request = handshake_message(self.local, my_ip, HANDSHAKE_REQUEST).to_bytes();

        loop {
            let peer_ip = self.session.lock().peer_ip;
            if let Some(peer_ip) = peer_ip {
                info!(ip = %my_ip, peer_ip = %peer_ip, "ip handshake complete");
                return;
            }
            if let Err(err) = socket.send_to(&request, target).await {
                debug!(error = %err, "handshake broadcast failed");
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("no handshake reply, running broadcast-only");
                return;
            }
            sleep_until((now + self.config.handshake_interval()).min(deadline)).await;
        }
    }

    async fn receive_loop(self: Arc<Self>, socket: Arc<dyn Datagram>) {
        let mut buf = [0u8; 2 * MESSAGE_SIZE];
        loop {
            let (len, source) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    debug!(error = %err, "socket closed, wifi receive task exiting");
                    return;
                }
            };
            let Some(link) = self.link() else {
                return;
            };
            self.handle_datagram(&link, &buf[..len], source, socket.as_ref())
                .await;
        }
    }

    async fn handle_datagram(
        &self,
        link: &Link,
        data: &[u8],
        source: SocketAddrV4,
        socket: &dyn Datagram,
    ) {
        let Some(msg) = Receiver::parse_or_discard(data, NETWORK_TYPES) else {
            return;
        };
        let from = msg.from_addr();
        if from == self.local {
            return;
        }
        trace!(kind = ?msg.kind(), from = %from, source = %source, "wifi frame");
        *self.last_peer_rx.lock() = Some(Instant::now());

        if msg.kind() != MessageType::IpDiscovery {
            let learned = {
                let mut session = self.session.lock();
                match session.peer_ip {
                    Some(_) => None,
                    None => {
                        session.peer_ip = Some(*source.ip());
                        session.peer_ip
                    }
                }
            };
            if let Some(ip) = learned {
                debug!(peer_ip = %ip, "peer address learned from traffic");
            }
            link.on_data_received(msg);
            return;
        }

        let (peer_ip, kind) = parse_handshake(&msg);
        let my_ip = {
            let mut session = self.session.lock();
            if session.my_ip == Some(peer_ip) {
                return;
            }
            session.peer_ip = Some(peer_ip);
            session.my_ip
        };
        link.on_peer_discovered(from, &peer_ip.to_string());

        if kind != HANDSHAKE_REQUEST {
            return;
        }
        let Some(my_ip) = my_ip else {
            return;
        };
        let reply = handshake_message(self.local, my_ip, HANDSHAKE_REPLY).to_bytes();
        let target = SocketAddrV4::new(peer_ip, self.config.port);
        if let Err(err) = socket.send_to(&reply, target).await {
            warn!(peer_ip = %peer_ip, error = %err, "handshake reply failed");
        }
    }

    /// Why the current network should be rebuilt, if it should
    fn rebootstrap_reason(&self) -> Option<&'static str> {
        if !self.driver.is_associated() {
            return Some("association lost");
        }
        let silent = self
            .last_peer_rx
            .lock()
            .map_or(true, |at| at.elapsed() > self.config.peer_silence_timeout());
        silent.then_some("peer silent")
    }

    async fn monitor_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.monitor_interval(),
            self.config.monitor_interval(),
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let announce_every = self.config.announce_interval() * 2;
        let mut last_announce = Instant::now();

        loop {
            ticker.tick().await;
            let Some(link) = self.link() else {
                debug!("link gone, wifi monitor exiting");
                return;
            };

            if last_announce.elapsed() >= announce_every {
                last_announce = Instant::now();
                if let Err(err) = self.driver.announce(self.beacon()).await {
                    trace!(error = %err, "presence announce failed");
                }
            }

            let Some(reason) = self.rebootstrap_reason() else {
                continue;
            };
            warn!(reason, "re-running wifi bootstrap");
            if link.is_connected() {
                link.unset_peer_addr();
            }
            link.set_state(ConnectionState::Connecting);

            match self.bootstrap().await {
                Ok(()) => info!("wifi bootstrap recovered"),
                Err(err) => {
                    error!(error = %err, "wifi bootstrap failed");
                    link.set_state(ConnectionState::Error);
                    // Restart the silence clock so the next attempt waits a full period
                    *self.last_peer_rx.lock() = Some(Instant::now());
                }
            }
        }
    }
}

pub struct WifiTransport<D: WifiDriver> {
    inner: Arc<WifiInner<D>>,
}

impl<D: WifiDriver> WifiTransport<D> {
    pub fn new(driver: D, config: WifiConfig) -> Result<Self> {
        config.validate()?;
        let local = driver.mac_address();
        if local.is_null() || local.is_broadcast() {
            return Err(RcError::DriverInit(format!("unusable wifi mac {}", local)));
        }
        info!(local = %local, ssid = %ssid_for(&config.ssid_prefix, local), "wifi initialised");

        Ok(Self {
            inner: Arc::new(WifiInner {
                driver,
                config,
                local,
                session: Mutex::new(Session::default()),
                last_peer_rx: Mutex::new(None),
                link: Mutex::new(Weak::new()),
                rx_task: Mutex::new(None),
                monitor_task: Mutex::new(None),
                bootstrap_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn role(&self) -> Option<Role> {
        self.inner.session.lock().role
    }

    pub fn local_ip(&self) -> Option<Ipv4Addr> {
        self.inner.session.lock().my_ip
    }

    pub fn peer_ip(&self) -> Option<Ipv4Addr> {
        self.inner.session.lock().peer_ip
    }
}

#[async_trait]
impl<D: WifiDriver> Transport for WifiTransport<D> {
    fn protocol(&self) -> Protocol {
        Protocol::Wifi
    }

    fn local_address(&self) -> NodeAddress {
        self.inner.local
    }

    fn parse_raw(&self, data: &[u8]) -> Option<Message> {
        Receiver::parse_or_discard(data, NETWORK_TYPES)
    }

    fn attach(&self, link: Weak<Link>) -> Result<()> {
        *self.inner.link.lock() = link;
        Ok(())
    }

    async fn discover(&self, _link: &Arc<Link>) -> Result<()> {
        self.inner.bootstrap().await?;

        let mut monitor = self.inner.monitor_task.lock();
        if monitor.as_ref().map_or(true, |task| task.is_finished()) {
            *monitor = Some(tokio::spawn(self.inner.clone().monitor_loop()));
            debug!("wifi monitor started");
        }
        Ok(())
    }

    async fn low_level_send(&self, msg: &Message, link: &Link) {
        let (socket, peer_ip) = {
            let session = self.inner.session.lock();
            (session.socket.clone(), session.peer_ip)
        };
        let counted = msg.kind() != MessageType::Heartbeat;

        let Some(socket) = socket else {
            trace!(kind = ?msg.kind(), "no socket yet, frame dropped");
            if counted {
                link.send_metrics().add_failure();
            }
            return;
        };

        let ip = peer_ip.unwrap_or_else(|| broadcast_ip(self.inner.config.subnet));
        let target = SocketAddrV4::new(ip, self.inner.config.port);
        match socket.send_to(&msg.to_bytes(), target).await {
            Ok(_) => {
                if counted {
                    link.send_metrics().add_success();
                }
            }
            Err(err) => {
                warn!(target = %target, error = %err, "udp send failed");
                if counted {
                    link.send_metrics().add_failure();
                }
            }
        }
    }

    fn unbind_peer(&self, _peer: NodeAddress) {
        self.inner.session.lock().peer_ip = None;
    }

    fn detach(&self) {
        if let Some(task) = self.inner.monitor_task.lock().take() {
            task.abort();
        }
        self.inner.teardown();
        debug!("wifi detached");
    }
}
