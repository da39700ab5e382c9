use std::collections::HashMap;
use std::fs::{create_dir_all, read_to_string, remove_file};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use ipnetwork::Ipv4Network;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::{BridgeDriver, Error, Ipam, Pid};

pub const DEFAULT_NETWORK_ROOT: &str = "/var/lib/miniker/network/networks";

/// A named host-private L2 network. The address of `ip_range` is the
/// gateway; the prefix describes the subnet the gateway was allocated from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Network {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "IpRange")]
    pub ip_range: Ipv4Network,
    #[serde(rename = "Driver")]
    pub driver: String,
}

impl Network {
    pub fn gateway(&self) -> Ipv4Addr {
        self.ip_range.ip()
    }

    fn dump(&self, root: &Path) -> Result<(), Error> {
        create_dir_all(root)?;
        let data = serde_json::to_string(self)?;
        Ok(std::fs::write(root.join(&self.name), data)?)
    }

    fn load(path: &Path) -> Result<Self, Error> {
        let data = read_to_string(path)?;
        let mut network: Network = serde_json::from_str(&data)?;
        if let Some(name) = path.file_name() {
            network.name = name.to_string_lossy().into_owned();
        }
        Ok(network)
    }
}

/// One attachment of a container to a network. Endpoints are not persisted;
/// they live for the duration of a single invocation.
#[derive(Debug)]
pub struct Endpoint<'a> {
    pub id: String,
    pub ip: Ipv4Addr,
    pub port_mappings: Vec<String>,
    pub network: &'a Network,
}

impl<'a> Endpoint<'a> {
    pub fn new(
        container: &str,
        network: &'a Network,
        ip: Ipv4Addr,
        port_mappings: Vec<String>,
    ) -> Self {
        Self {
            id: format!("{container}-{}", network.name),
            ip,
            port_mappings,
            network,
        }
    }

    /// Host-side interface name of the veth pair.
    pub fn veth_name(&self) -> String {
        self.id.chars().take(5).collect()
    }

    /// Container-side interface name of the veth pair.
    pub fn peer_name(&self) -> String {
        format!("cif-{}", self.veth_name())
    }
}

pub trait NetworkDriver {
    fn name(&self) -> &'static str;

    /// Builds the network's backing interface. The subnet argument carries
    /// the gateway address in the host bits.
    fn create(&self, subnet: Ipv4Network, name: &str) -> Result<Network, Error>;

    fn delete(&self, network: &Network) -> Result<(), Error>;

    /// Creates the endpoint's veth pair attached to the network.
    fn connect(&self, network: &Network, endpoint: &Endpoint) -> Result<(), Error>;

    fn disconnect(&self, network: &Network, endpoint: &Endpoint) -> Result<(), Error>;
}

/// Name-keyed map of networks loaded from one file per network, plus the
/// driver table. A single administrative process per host is assumed; no
/// cross-process locking is done.
pub struct NetworkRegistry {
    root: PathBuf,
    ipam: Ipam,
    drivers: HashMap<String, Box<dyn NetworkDriver>>,
    networks: HashMap<String, Network>,
}

impl NetworkRegistry {
    pub fn new(root: impl Into<PathBuf>, ipam: Ipam) -> Result<Self, Error> {
        let mut drivers: HashMap<String, Box<dyn NetworkDriver>> = HashMap::new();
        let bridge = BridgeDriver;
        drivers.insert(bridge.name().to_string(), Box::new(bridge));
        let mut registry = Self {
            root: root.into(),
            ipam,
            drivers,
            networks: HashMap::new(),
        };
        registry.load_networks()?;
        Ok(registry)
    }

    pub fn from_default_paths() -> Result<Self, Error> {
        Self::new(DEFAULT_NETWORK_ROOT, Ipam::default())
    }

    fn load_networks(&mut self) -> Result<(), Error> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(v) => v,
            Err(v) if v.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(v) => return Err(v.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            match Network::load(&entry.path()) {
                Ok(network) => {
                    self.networks.insert(network.name.clone(), network);
                }
                Err(err) => warn!("Cannot load network {:?}: {err}", entry.file_name()),
            }
        }
        Ok(())
    }

    /// Creates a network: allocates the gateway out of the subnet, builds
    /// the backing interface and persists the network file.
    pub fn create(&mut self, driver: &str, subnet: &str, name: &str) -> Result<(), Error> {
        let subnet: Ipv4Network = subnet
            .parse()
            .map_err(|v| format!("Cannot parse subnet {subnet}: {v}"))?;
        let gateway = self.ipam.allocate(subnet)?;
        let gateway_net = Ipv4Network::new(gateway, subnet.prefix())?;
        let driver = self
            .drivers
            .get(driver)
            .ok_or_else(|| format!("No such network driver: {driver}"))?;
        let network = driver.create(gateway_net, name)?;
        network.dump(&self.root)?;
        self.networks.insert(network.name.clone(), network);
        Ok(())
    }

    /// Deletes a network: releases the gateway, removes the backing
    /// interface and the network file.
    pub fn delete(&mut self, name: &str) -> Result<(), Error> {
        let network = self
            .networks
            .get(name)
            .ok_or_else(|| format!("No such network: {name}"))?;
        self.ipam.release(network.ip_range, network.gateway())?;
        let driver = self
            .drivers
            .get(&network.driver)
            .ok_or_else(|| format!("No such network driver: {}", network.driver))?;
        driver.delete(network)?;
        let path = self.root.join(name);
        if path.exists() {
            remove_file(path)?;
        }
        self.networks.remove(name);
        Ok(())
    }

    /// Attaches a container to a network: allocates an address, injects a
    /// veth pair, programs the address and default route inside the
    /// container's network namespace, and installs the port mappings.
    pub fn connect(
        &mut self,
        network_name: &str,
        container: &str,
        port_mappings: Vec<String>,
        pid: Pid,
    ) -> Result<(), Error> {
        let network = self
            .networks
            .get(network_name)
            .ok_or_else(|| format!("No such network: {network_name}"))?;
        let ip = self.ipam.allocate(network.ip_range)?;
        let endpoint = Endpoint::new(container, network, ip, port_mappings);
        let driver = self
            .drivers
            .get(&network.driver)
            .ok_or_else(|| format!("No such network driver: {}", network.driver))?;
        driver.connect(network, &endpoint)?;
        crate::bridge::configure_endpoint(&endpoint, pid)?;
        crate::bridge::setup_port_mappings(&endpoint);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Network> {
        self.networks.get(name)
    }

    pub fn list(&self) -> Vec<&Network> {
        let mut networks: Vec<_> = self.networks.values().collect();
        networks.sort_by(|a, b| a.name.cmp(&b.name));
        networks
    }
}
