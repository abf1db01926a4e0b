//! Remote-control core
//!
//! [`Link`] is the transport-independent state machine: connection state,
//! single peer slot, liveness clock, bounded queues and metrics. Adapters
//! report into it. [`RemoteControl`] is the application handle that owns the
//! link, its transport and the background heartbeat and send-drain tasks.
//!
//! ```text
//! DISCONNECTED --connect()--> CONNECTING --first valid frame--> CONNECTED
//!      ^                                                           |
//!      +------------------- heartbeat timeout ---------------------+
//! ERROR: discovery failure reported by the transport
//! ```
use std::cell::RefCell;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::LinkConfig;
use crate::contracts::{
    ConnectionState, DiscoveryResult, Message, MessageType, NodeAddress, Payload, Protocol,
};
use crate::errors::{RcError, Result};
use crate::metrics::{self, Metrics, MetricsDisplay, MetricsRow, MetricsSnapshot};
use crate::queue::{MessageQueue, PushOutcome};
use crate::transmitter::Transmitter;
use crate::transport::Transport;

/// Callback for every DATA message accepted into the receive queue
pub type ReceiveHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Callback for every peer reported by a transport's discovery
pub type DiscoveryHandler = Arc<dyn Fn(&DiscoveryResult) + Send + Sync>;

/// State guarded by the link lock
#[derive(Debug, Default)]
struct LinkState {
    connection: ConnectionState,
    peer: Option<NodeAddress>,
    last_rx: Option<Instant>,
}

/// Shared state machine between the application handle and a transport
pub struct Link {
    config: LinkConfig,
    local: NodeAddress,
    protocol: Protocol,
    started_at: Instant,
    state: ReentrantMutex<RefCell<LinkState>>,
    transport: Weak<dyn Transport>,
    send_queue: MessageQueue,
    recv_queue: MessageQueue,
    send_ready: Notify,
    on_receive: RwLock<Option<ReceiveHandler>>,
    on_discovery: RwLock<Option<DiscoveryHandler>>,
    discovery: Mutex<DiscoveryResult>,
    send_metrics: Metrics,
    recv_metrics: Metrics,
}

impl Link {
    fn new(config: LinkConfig, transport: &Arc<dyn Transport>) -> Self {
        let send_queue = MessageQueue::new(config.effective_send_depth());
        let recv_queue = MessageQueue::new(config.effective_recv_depth());
        Self {
            local: transport.local_address(),
            protocol: transport.protocol(),
            started_at: Instant::now(),
            state: ReentrantMutex::new(RefCell::new(LinkState::default())),
            transport: Arc::downgrade(transport),
            send_queue,
            recv_queue,
            send_ready: Notify::new(),
            on_receive: RwLock::new(None),
            on_discovery: RwLock::new(None),
            discovery: Mutex::new(DiscoveryResult::default()),
            send_metrics: Metrics::new(),
            recv_metrics: Metrics::new(),
            config,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn local_address(&self) -> NodeAddress {
        self.local
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn is_fast_mode(&self) -> bool {
        self.config.fast_mode
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().borrow().connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn peer_address(&self) -> Option<NodeAddress> {
        self.state.lock().borrow().peer
    }

    /// Peer to unicast to, only while CONNECTED
    pub fn connected_peer(&self) -> Option<NodeAddress> {
        let guard = self.state.lock();
        let state = guard.borrow();
        match state.connection {
            ConnectionState::Connected => state.peer,
            _ => None,
        }
    }

    pub fn send_metrics(&self) -> &Metrics {
        &self.send_metrics
    }

    pub fn recv_metrics(&self) -> &Metrics {
        &self.recv_metrics
    }

    pub(crate) fn send_queue(&self) -> &MessageQueue {
        &self.send_queue
    }

    pub(crate) fn send_ready(&self) -> &Notify {
        &self.send_ready
    }

    pub(crate) fn set_state(&self, connection: ConnectionState) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if state.connection != connection {
            debug!(from = %state.connection, to = %connection, "connection state change");
            state.connection = connection;
        }
    }

    /// Entry point for every successfully parsed frame
    ///
    /// Any message resets the liveness clock and, unless already CONNECTED,
    /// makes its sender the peer. Heartbeats stop there; everything else is
    /// queued for the application.
    pub fn on_data_received(&self, msg: Message) {
        debug!(kind = ?msg.kind(), from = %msg.from_addr(), "message received");

        let adopted = match self.state.try_lock_for(self.config.lock_timeout()) {
            Some(guard) => {
                let mut state = guard.borrow_mut();
                let mut adopted = None;
                if state.connection != ConnectionState::Connected {
                    state.peer = Some(msg.from_addr());
                    state.connection = ConnectionState::Connected;
                    adopted = Some(msg.from_addr());
                }
                state.last_rx = Some(Instant::now());
                adopted
            }
            None => {
                warn!("link state busy, skipping liveness update");
                None
            }
        };

        if let Some(peer) = adopted {
            info!(peer = %peer, "peer set and connected");
            self.bind_transport_peer(peer);
        }

        if msg.kind() == MessageType::Heartbeat {
            return;
        }

        if self.config.fast_mode {
            self.recv_queue.overwrite(msg);
        } else if self.recv_queue.push_evict_oldest(msg) == PushOutcome::Evicted {
            debug!("receive queue full, dropped oldest message");
        }

        let handler = self.on_receive.read().clone();
        if let Some(handler) = handler {
            handler(&msg);
        }
        self.recv_metrics.add_success();
    }

    /// Record a peer found by the transport's discovery phase
    pub fn on_peer_discovered(&self, addr: NodeAddress, info: &str) {
        let result = {
            let mut discovery = self.discovery.lock();
            discovery.discovered = true;
            discovery.peer_addr = addr;
            discovery.info = info.to_string();
            discovery.clone()
        };
        info!(peer = %addr, info, "peer discovered");

        let handler = self.on_discovery.read().clone();
        if let Some(handler) = handler {
            handler(&result);
        }
    }

    pub fn discovery_result(&self) -> DiscoveryResult {
        self.discovery.lock().clone()
    }

    /// Overwrite the peer slot and register it with the transport
    pub fn set_peer_addr(&self, peer: NodeAddress) -> Result<()> {
        if peer.is_null() {
            return Err(RcError::InvalidAddress(peer.to_string()));
        }
        {
            let guard = self.state.lock();
            guard.borrow_mut().peer = Some(peer);
        }
        match self.transport.upgrade() {
            Some(transport) => transport.bind_peer(peer),
            None => Ok(()),
        }
    }

    /// Clear the peer slot, returning the transport to broadcast mode
    pub fn unset_peer_addr(&self) {
        let previous = {
            let guard = self.state.lock();
            let previous = guard.borrow_mut().peer.take();
            previous
        };
        if let (Some(peer), Some(transport)) = (previous, self.transport.upgrade()) {
            transport.unbind_peer(peer);
        }
    }

    fn bind_transport_peer(&self, peer: NodeAddress) {
        if let Some(transport) = self.transport.upgrade() {
            if let Err(err) = transport.bind_peer(peer) {
                warn!(peer = %peer, error = %err, "failed to register peer with transport");
            }
        }
    }

    /// Queue a message for the send-drain task
    ///
    /// Fast mode overwrites the single slot and always succeeds. Reliable
    /// mode returns `false` when the queue is full.
    pub fn send_msg(&self, msg: Message) -> bool {
        let queued = if self.config.fast_mode {
            self.send_queue.overwrite(msg);
            true
        } else {
            self.send_queue.try_push(msg)
        };

        if queued {
            self.send_ready.notify_one();
        } else {
            debug!(kind = ?msg.kind(), "send queue full");
        }
        queued
    }

    pub fn send_sys_msg(&self, kind: MessageType) -> bool {
        self.send_msg(Message::system(kind, self.local))
    }

    /// Liveness check run on every heartbeat tick
    ///
    /// Returns the cleared peer when a CONNECTED link has been silent for
    /// longer than the heartbeat timeout.
    pub(crate) fn check_heartbeat(&self) -> Option<NodeAddress> {
        let guard = self.state.try_lock_for(self.config.lock_timeout())?;
        let mut state = guard.borrow_mut();
        if state.connection != ConnectionState::Connected {
            return None;
        }

        let silent = state
            .last_rx
            .map_or(true, |at| at.elapsed() > self.config.heartbeat_timeout());
        if !silent {
            return None;
        }

        state.connection = ConnectionState::Disconnected;
        let peer = state.peer.take().unwrap_or(NodeAddress::NULL);
        warn!(peer = %peer, "connection lost, no message received in timeout period");
        Some(peer)
    }

    async fn recv_msg(&self) -> Option<Message> {
        self.recv_queue.pop_timeout(self.config.recv_timeout()).await
    }

    fn reset_metrics(&self) {
        self.send_metrics.reset();
        self.recv_metrics.reset();
    }

    fn metrics_row(&self) -> MetricsRow {
        MetricsRow {
            uptime: self.uptime(),
            protocol: self.protocol,
            state: self.connection_state(),
            send: self.send_metrics.snapshot(),
            recv: self.recv_metrics.snapshot(),
        }
    }
}

/// Application handle for one node
///
/// Construct with a transport, call [`connect`](Self::connect), then exchange
/// payloads with [`send_data`](Self::send_data) and [`recv_data`](Self::recv_data).
/// Dropping the handle stops every background task and detaches the transport.
pub struct RemoteControl {
    link: Arc<Link>,
    transport: Arc<dyn Transport>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    drain: JoinHandle<()>,
    display: Mutex<MetricsDisplay>,
}

impl RemoteControl {
    /// Bind a transport to a new link
    ///
    /// Must run inside a tokio runtime, which hosts the heartbeat and
    /// send-drain tasks.
    ///
    /// # Errors
    /// - `Runtime` outside a tokio runtime
    /// - `InvalidConfig` for an inconsistent `config`
    /// - whatever the transport's `attach` reports
    pub fn new(transport: Arc<dyn Transport>, config: LinkConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|err| RcError::Runtime(err.to_string()))?;
        config.validate()?;

        let header_every = config.metrics_header_every;
        let metrics_interval = Duration::from_millis(config.metrics_interval_ms);
        let link = Arc::new(Link::new(config, &transport));
        transport.attach(Arc::downgrade(&link))?;

        let drain = runtime.spawn(Transmitter::drain_loop(link.clone(), transport.clone()));

        let mut display = MetricsDisplay::new(header_every);
        display.set_enabled(false, metrics_interval, Instant::now());

        info!(
            protocol = %link.protocol(),
            local = %link.local_address(),
            fast_mode = link.is_fast_mode(),
            "remote control initialised"
        );

        Ok(Self {
            link,
            transport,
            heartbeat: Mutex::new(None),
            drain,
            display: Mutex::new(display),
        })
    }

    /// Start the heartbeat and run the transport's discovery phase
    ///
    /// Calling again while the heartbeat runs does not start a second one.
    pub async fn connect(&self) -> Result<()> {
        self.start_heartbeat();
        self.link.set_state(ConnectionState::Connecting);
        info!(protocol = %self.link.protocol(), "starting connection process");

        if let Err(err) = self.transport.discover(&self.link).await {
            error!(error = %err, "discovery failed");
            self.link.set_state(ConnectionState::Error);
            return Err(err);
        }
        Ok(())
    }

    fn start_heartbeat(&self) {
        let mut heartbeat = self.heartbeat.lock();
        if heartbeat.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let link = self.link.clone();
        let transport = self.transport.clone();
        let period = link.config().heartbeat_interval();
        *heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                Self::heartbeat_tick(&link, transport.as_ref());
            }
        }));
        info!(period_ms = period.as_millis() as u64, "heartbeat timer started");
    }

    fn heartbeat_tick(link: &Link, transport: &dyn Transport) {
        link.send_sys_msg(MessageType::Heartbeat);
        if let Some(peer) = link.check_heartbeat() {
            if !peer.is_null() {
                transport.unbind_peer(peer);
            }
        }
        transport.on_heartbeat_tick(link);
    }

    /// Wrap `payload` in a DATA message from this node and queue it
    pub fn send_data(&self, payload: &Payload) -> bool {
        self.link
            .send_msg(Message::data(self.link.local_address(), payload))
    }

    pub fn send_msg(&self, msg: Message) -> bool {
        self.link.send_msg(msg)
    }

    /// Next received message, waiting at most the configured receive timeout
    pub async fn recv_msg(&self) -> Option<Message> {
        self.link.recv_msg().await
    }

    /// Like [`recv_msg`](Self::recv_msg) but only yields DATA payloads
    pub async fn recv_data(&self) -> Option<Payload> {
        self.link.recv_msg().await.and_then(|msg| msg.payload())
    }

    /// Runs on the receive path; keep it short
    pub fn set_on_receive_msg_handler<F>(&self, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        *self.link.on_receive.write() = Some(Arc::new(handler));
    }

    pub fn clear_on_receive_msg_handler(&self) {
        *self.link.on_receive.write() = None;
    }

    /// Runs on the discovery path; keep it short
    pub fn set_on_discovery_handler<F>(&self, handler: F)
    where
        F: Fn(&DiscoveryResult) + Send + Sync + 'static,
    {
        *self.link.on_discovery.write() = Some(Arc::new(handler));
    }

    pub fn clear_on_discovery_handler(&self) {
        *self.link.on_discovery.write() = None;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.link.connection_state()
    }

    pub fn discovery_result(&self) -> DiscoveryResult {
        self.link.discovery_result()
    }

    pub fn protocol(&self) -> Protocol {
        self.link.protocol()
    }

    pub fn local_address(&self) -> NodeAddress {
        self.link.local_address()
    }

    pub fn peer_address(&self) -> Option<NodeAddress> {
        self.link.peer_address()
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub fn send_metrics(&self) -> MetricsSnapshot {
        self.link.send_metrics().snapshot()
    }

    pub fn receive_metrics(&self) -> MetricsSnapshot {
        self.link.recv_metrics().snapshot()
    }

    pub fn reset_metrics(&self) {
        self.link.reset_metrics();
        info!("metrics reset");
    }

    /// Emit the operator metrics line if due; returns the lines logged
    pub fn print_metrics(&self, force_header: bool) -> Vec<String> {
        let row = self.link.metrics_row();
        let lines = self.display.lock().render(
            Instant::now(),
            force_header,
            metrics::is_global_metrics_enabled(),
            &row,
        );
        for line in &lines {
            info!("{}", line);
        }
        lines
    }

    pub fn enable_metrics_display(&self, enable: bool, interval_ms: u64) {
        self.display
            .lock()
            .set_enabled(enable, Duration::from_millis(interval_ms), Instant::now());
        if enable {
            info!(interval_ms, protocol = %self.link.protocol(), "metrics display enabled");
        } else {
            info!("metrics display disabled");
        }
    }

    pub fn disable_metrics_display(&self) {
        let interval = self.display.lock().interval().as_millis() as u64;
        self.enable_metrics_display(false, interval);
    }

    /// Process-wide; affects every link
    pub fn enable_global_metrics(enable: bool) {
        metrics::enable_global_metrics(enable);
    }

    pub fn disable_global_metrics() {
        metrics::disable_global_metrics();
    }

    pub fn is_global_metrics_enabled() -> bool {
        metrics::is_global_metrics_enabled()
    }

    pub fn set_protocol_config(&self, key: &str, value: i32) -> Result<()> {
        self.transport.set_protocol_config(key, value)
    }

    pub fn protocol_config(&self, key: &str) -> Option<i32> {
        self.transport.protocol_config(key)
    }
}

impl Drop for RemoteControl {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeat.lock().take() {
            task.abort();
        }
        self.drain.abort();
        self.transport.detach();
        debug!(protocol = %self.link.protocol(), "remote control shut down");
    }
}
