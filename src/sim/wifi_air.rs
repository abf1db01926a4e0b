//! Simulated Wi-Fi medium: presence beacons, soft-AP networks and UDP
//!
//! Every powered device hears every beacon. Networks are keyed by SSID;
//! datagrams only travel between sockets whose owners share a network.
//! Tearing down a hosted network disassociates its members and closes
//! their sockets, as does powering a device off.
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::contracts::NodeAddress;
use crate::errors::{RcError, Result};
use crate::transport::wifi::{Datagram, PresenceBeacon, WifiDriver};

type Datagrams = mpsc::UnboundedSender<(Vec<u8>, SocketAddrV4)>;

#[derive(Default)]
struct Device {
    powered: bool,
    heard: HashMap<NodeAddress, PresenceBeacon>,
    network: Option<String>,
    failing_sends: u32,
}

struct Network {
    passphrase: String,
    host: NodeAddress,
    members: HashMap<NodeAddress, Ipv4Addr>,
}

struct Endpoint {
    owner: NodeAddress,
    addr: SocketAddrV4,
    tx: Datagrams,
}

#[derive(Default)]
struct AirState {
    devices: HashMap<NodeAddress, Device>,
    networks: HashMap<String, Network>,
    endpoints: Vec<Endpoint>,
}

impl AirState {
    fn device(&mut self, mac: NodeAddress) -> Result<&mut Device> {
        match self.devices.get_mut(&mac) {
            Some(device) if device.powered => Ok(device),
            Some(_) => Err(RcError::Driver(format!("{} powered off", mac))),
            None => Err(RcError::Driver(format!("{} unknown", mac))),
        }
    }

    fn disassociate(&mut self, mac: NodeAddress) {
        self.endpoints.retain(|endpoint| endpoint.owner != mac);
        let Some(ssid) = self.devices.get_mut(&mac).and_then(|d| d.network.take()) else {
            return;
        };

        let hosted = self
            .networks
            .get(&ssid)
            .is_some_and(|network| network.host == mac);
        if hosted {
            if let Some(network) = self.networks.remove(&ssid) {
                for member in network.members.keys().filter(|m| **m != mac) {
                    self.endpoints.retain(|endpoint| endpoint.owner != *member);
                    if let Some(device) = self.devices.get_mut(member) {
                        device.network = None;
                    }
                }
            }
        } else if let Some(network) = self.networks.get_mut(&ssid) {
            network.members.remove(&mac);
        }
    }

    fn network_of(&self, mac: NodeAddress) -> Option<&Network> {
        let ssid = self.devices.get(&mac)?.network.as_ref()?;
        self.networks.get(ssid)
    }
}

#[derive(Clone, Default)]
pub struct WifiAir {
    state: Arc<Mutex<AirState>>,
}

impl WifiAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// New powered device with a random MAC
    pub fn device(&self) -> SimWifiDevice {
        self.device_with_mac(NodeAddress::random())
    }

    pub fn device_with_mac(&self, mac: NodeAddress) -> SimWifiDevice {
        self.state.lock().devices.insert(
            mac,
            Device {
                powered: true,
                ..Device::default()
            },
        );
        SimWifiDevice {
            state: self.state.clone(),
            mac,
        }
    }

    /// Powering off drops the device's network and sockets
    pub fn set_powered(&self, mac: NodeAddress, powered: bool) {
        let mut state = self.state.lock();
        if !powered {
            state.disassociate(mac);
        }
        if let Some(device) = state.devices.get_mut(&mac) {
            device.powered = powered;
            device.heard.clear();
        }
    }

    /// Make the next `count` datagrams sent by `mac` fail
    pub fn fail_next_sends(&self, mac: NodeAddress, count: u32) {
        if let Some(device) = self.state.lock().devices.get_mut(&mac) {
            device.failing_sends = count;
        }
    }

    /// SSID of the network `mac` is hosting
    pub fn hosted_network(&self, mac: NodeAddress) -> Option<String> {
        let state = self.state.lock();
        state
            .networks
            .iter()
            .find(|(_, network)| network.host == mac)
            .map(|(ssid, _)| ssid.clone())
    }

    pub fn member_ip(&self, mac: NodeAddress) -> Option<Ipv4Addr> {
        let state = self.state.lock();
        state.network_of(mac)?.members.get(&mac).copied()
    }
}

/// One Wi-Fi capable device on a [`WifiAir`]
pub struct SimWifiDevice {
    state: Arc<Mutex<AirState>>,
    mac: NodeAddress,
}

#[async_trait]
impl WifiDriver for SimWifiDevice {
    fn mac_address(&self) -> NodeAddress {
        self.mac
    }

    async fn announce(&self, beacon: PresenceBeacon) -> Result<()> {
        let mut state = self.state.lock();
        state.device(self.mac)?;
        for (mac, device) in state.devices.iter_mut() {
            if *mac != self.mac && device.powered {
                device.heard.insert(beacon.node, beacon);
            }
        }
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<PresenceBeacon>> {
        let mut state = self.state.lock();
        let device = state.device(self.mac)?;
        Ok(device.heard.drain().map(|(_, beacon)| beacon).collect())
    }

    async fn host(
        &self,
        ssid: &str,
        passphrase: &str,
        _channel: u8,
        ip: Ipv4Addr,
    ) -> Result<Ipv4Addr> {
        let mut state = self.state.lock();
        state.device(self.mac)?;
        if state.networks.contains_key(ssid) {
            return Err(RcError::Driver(format!("ssid {} already in use", ssid)));
        }
        state.disassociate(self.mac);
        state.networks.insert(
            ssid.to_string(),
            Network {
                passphrase: passphrase.to_string(),
                host: self.mac,
                members: HashMap::from([(self.mac, ip)]),
            },
        );
        state.device(self.mac)?.network = Some(ssid.to_string());
        Ok(ip)
    }

    async fn join(&self, ssid: &str, passphrase: &str, ip: Ipv4Addr) -> Result<Ipv4Addr> {
        let mut state = self.state.lock();
        state.device(self.mac)?;
        let network = state
            .networks
            .get(ssid)
            .ok_or_else(|| RcError::Driver(format!("network {} not found", ssid)))?;
        if network.passphrase != passphrase {
            return Err(RcError::Driver(format!("authentication to {} failed", ssid)));
        }
        if network.members.iter().any(|(mac, used)| *used == ip && *mac != self.mac) {
            return Err(RcError::Driver(format!("address {} in use", ip)));
        }

        state.disassociate(self.mac);
        if let Some(network) = state.networks.get_mut(ssid) {
            network.members.insert(self.mac, ip);
        }
        state.device(self.mac)?.network = Some(ssid.to_string());
        Ok(ip)
    }

    fn is_associated(&self) -> bool {
        let state = self.state.lock();
        let powered = state.devices.get(&self.mac).is_some_and(|d| d.powered);
        powered && state.network_of(self.mac).is_some()
    }

    fn leave(&self) {
        self.state.lock().disassociate(self.mac);
    }

    async fn bind(&self, addr: SocketAddrV4) -> Result<Arc<dyn Datagram>> {
        let mut state = self.state.lock();
        state.device(self.mac)?;
        let assigned = state
            .network_of(self.mac)
            .and_then(|network| network.members.get(&self.mac).copied());
        if assigned != Some(*addr.ip()) {
            return Err(RcError::Io(format!("cannot bind {}: address not assigned", addr)));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.endpoints.retain(|endpoint| endpoint.addr != addr);
        state.endpoints.push(Endpoint {
            owner: self.mac,
            addr,
            tx,
        });
        Ok(Arc::new(SimSocket {
            state: self.state.clone(),
            owner: self.mac,
            addr,
            rx: tokio::sync::Mutex::new(rx),
        }))
    }
}

struct SimSocket {
    state: Arc<Mutex<AirState>>,
    owner: NodeAddress,
    addr: SocketAddrV4,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddrV4)>>,
}

#[async_trait]
impl Datagram for SimSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddrV4) -> Result<usize> {
        let mut state = self.state.lock();
        let device = state
            .device(self.owner)
            .map_err(|err| RcError::Io(err.to_string()))?;
        if device.failing_sends > 0 {
            device.failing_sends -= 1;
            return Err(RcError::Io("injected send failure".to_string()));
        }
        let network = state
            .network_of(self.owner)
            .ok_or_else(|| RcError::Io("network unreachable".to_string()))?;

        let broadcast = target.ip().octets()[3] == 255;
        for endpoint in &state.endpoints {
            let reachable = endpoint.owner != self.owner
                && network.members.contains_key(&endpoint.owner)
                && endpoint.addr.port() == target.port()
                && (broadcast || endpoint.addr == target);
            if reachable {
                let _ = endpoint.tx.send((buf.to_vec(), self.addr));
            }
        }
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4)> {
        let (datagram, from) = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| RcError::Io("socket closed".to_string()))?;
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok((len, from))
    }
}
