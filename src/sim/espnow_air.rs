//! Simulated ESP-NOW medium
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::contracts::NodeAddress;
use crate::errors::{RcError, Result};
use crate::transport::espnow::{EspNowDriver, RecvCallback, SentCallback};

type SharedRecv = Arc<dyn Fn(NodeAddress, &[u8]) + Send + Sync>;
type SharedSent = Arc<dyn Fn(NodeAddress, bool) + Send + Sync>;

struct Station {
    powered: bool,
    initialised: bool,
    channel: u8,
    tx_power: u8,
    peers: HashSet<NodeAddress>,
    on_recv: Option<SharedRecv>,
    on_sent: Option<SharedSent>,
    failing_sends: u32,
    frames_sent: u64,
}

impl Station {
    fn new() -> Self {
        Self {
            powered: true,
            initialised: false,
            channel: 1,
            tx_power: 0,
            peers: HashSet::new(),
            on_recv: None,
            on_sent: None,
            failing_sends: 0,
            frames_sent: 0,
        }
    }

    fn hears(&self, channel: u8) -> bool {
        self.powered && self.initialised && self.channel == channel
    }
}

#[derive(Default)]
struct AirState {
    stations: HashMap<NodeAddress, Station>,
}

/// Shared broadcast medium for any number of simulated ESP-NOW radios
///
/// Delivery is synchronous: a successful `send` has already run every
/// receiver's callback when it returns.
#[derive(Clone, Default)]
pub struct EspNowAir {
    state: Arc<Mutex<AirState>>,
}

impl EspNowAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// New radio with a random MAC
    pub fn radio(&self) -> SimEspNowRadio {
        self.radio_with_address(NodeAddress::random())
    }

    pub fn radio_with_address(&self, addr: NodeAddress) -> SimEspNowRadio {
        self.state.lock().stations.insert(addr, Station::new());
        SimEspNowRadio {
            state: self.state.clone(),
            addr,
        }
    }

    /// A powered-off radio neither sends nor receives
    pub fn set_powered(&self, addr: NodeAddress, powered: bool) {
        if let Some(station) = self.state.lock().stations.get_mut(&addr) {
            station.powered = powered;
        }
    }

    /// Make the next `count` sends from `addr` fail at the driver
    pub fn fail_next_sends(&self, addr: NodeAddress, count: u32) {
        if let Some(station) = self.state.lock().stations.get_mut(&addr) {
            station.failing_sends = count;
        }
    }

    pub fn frames_sent(&self, addr: NodeAddress) -> u64 {
        self.state
            .lock()
            .stations
            .get(&addr)
            .map_or(0, |station| station.frames_sent)
    }

    /// Deliver arbitrary bytes to `to` as if `from` had sent them
    pub fn inject(&self, from: NodeAddress, to: NodeAddress, data: &[u8]) {
        let callback = self
            .state
            .lock()
            .stations
            .get(&to)
            .and_then(|station| station.on_recv.clone());
        if let Some(callback) = callback {
            callback(from, data);
        }
    }
}

/// One radio on an [`EspNowAir`]
pub struct SimEspNowRadio {
    state: Arc<Mutex<AirState>>,
    addr: NodeAddress,
}

impl SimEspNowRadio {
    pub fn address(&self) -> NodeAddress {
        self.addr
    }

    pub fn channel(&self) -> u8 {
        self.with_station(|station| station.channel).unwrap_or(0)
    }

    pub fn tx_power(&self) -> u8 {
        self.with_station(|station| station.tx_power).unwrap_or(0)
    }

    fn with_station<T>(&self, f: impl FnOnce(&mut Station) -> T) -> Option<T> {
        self.state.lock().stations.get_mut(&self.addr).map(f)
    }

    fn powered_station<T>(&self, f: impl FnOnce(&mut Station) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        let station = state
            .stations
            .get_mut(&self.addr)
            .ok_or_else(|| RcError::Driver("radio removed".to_string()))?;
        if !station.powered {
            return Err(RcError::Driver("radio powered off".to_string()));
        }
        f(station)
    }
}

impl EspNowDriver for SimEspNowRadio {
    fn init(&self, channel: u8, tx_power: u8) -> Result<NodeAddress> {
        self.powered_station(|station| {
            station.initialised = true;
            station.channel = channel;
            station.tx_power = tx_power;
            Ok(())
        })?;
        Ok(self.addr)
    }

    fn add_peer(&self, addr: NodeAddress) -> Result<()> {
        self.powered_station(|station| {
            station.peers.insert(addr);
            Ok(())
        })
    }

    fn del_peer(&self, addr: NodeAddress) -> Result<()> {
        self.powered_station(|station| {
            if station.peers.remove(&addr) {
                Ok(())
            } else {
                Err(RcError::PeerNotFound(addr.to_string()))
            }
        })
    }

    fn has_peer(&self, addr: NodeAddress) -> bool {
        self.with_station(|station| station.peers.contains(&addr))
            .unwrap_or(false)
    }

    fn send(&self, dest: NodeAddress, data: &[u8]) -> Result<()> {
        let (receivers, on_sent) = {
            let mut state = self.state.lock();
            let sender = state
                .stations
                .get_mut(&self.addr)
                .ok_or_else(|| RcError::Driver("radio removed".to_string()))?;
            if !sender.powered || !sender.initialised {
                return Err(RcError::Driver("radio not running".to_string()));
            }
            if !sender.peers.contains(&dest) {
                return Err(RcError::PeerNotFound(dest.to_string()));
            }
            if sender.failing_sends > 0 {
                sender.failing_sends -= 1;
                return Err(RcError::Driver("injected send failure".to_string()));
            }
            sender.frames_sent += 1;
            let channel = sender.channel;
            let on_sent = sender.on_sent.clone();

            let receivers: Vec<SharedRecv> = state
                .stations
                .iter()
                .filter(|(addr, station)| {
                    **addr != self.addr
                        && station.hears(channel)
                        && (dest.is_broadcast() || **addr == dest)
                })
                .filter_map(|(_, station)| station.on_recv.clone())
                .collect();
            (receivers, on_sent)
        };

        let delivered = !receivers.is_empty();
        for receiver in receivers {
            receiver(self.addr, data);
        }
        if let Some(on_sent) = on_sent {
            on_sent(dest, delivered || dest.is_broadcast());
        }

        if dest.is_broadcast() || delivered {
            Ok(())
        } else {
            Err(RcError::Driver(format!("no ack from {}", dest)))
        }
    }

    fn set_receive_callback(&self, callback: Option<RecvCallback>) {
        let callback: Option<SharedRecv> = callback.map(Arc::from);
        self.with_station(|station| station.on_recv = callback);
    }

    fn set_sent_callback(&self, callback: Option<SentCallback>) {
        let callback: Option<SharedSent> = callback.map(Arc::from);
        self.with_station(|station| station.on_sent = callback);
    }

    fn set_channel(&self, channel: u8) -> Result<()> {
        self.powered_station(|station| {
            station.channel = channel;
            Ok(())
        })
    }

    fn set_tx_power(&self, tx_power: u8) -> Result<()> {
        self.powered_station(|station| {
            station.tx_power = tx_power;
            Ok(())
        })
    }
}
