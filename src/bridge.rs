use std::fs::File;
use std::path::Path;
use std::process::Command;

use ipnetwork::Ipv4Network;
use log::error;
use nix::sched::{setns, CloneFlags};

use crate::{Endpoint, Error, Network, NetworkDriver, Pid};

const SYS_CLASS_NET: &str = "/sys/class/net";

/// Splits a `<host-port>:<container-port>` mapping. Returns `None` when
/// either side is missing or empty.
pub fn split_port_mapping(mapping: &str) -> Option<(&str, &str)> {
    let mut parts = mapping.splitn(2, ':');
    let host = parts.next()?;
    let container = parts.next()?;
    if host.is_empty() || container.is_empty() {
        return None;
    }
    Some((host, container))
}

/// Local bridge driver: the network's backing interface is a kernel bridge
/// named after the network, and container endpoints are veth pairs slaved
/// to it.
pub struct BridgeDriver;

impl NetworkDriver for BridgeDriver {
    fn name(&self) -> &'static str {
        "bridge"
    }

    fn create(&self, subnet: Ipv4Network, name: &str) -> Result<Network, Error> {
        let network = Network {
            name: name.to_string(),
            ip_range: subnet,
            driver: self.name().to_string(),
        };
        init_bridge(&network).map_err(|v| format!("Cannot init bridge {name}: {v}"))?;
        Ok(network)
    }

    fn delete(&self, network: &Network) -> Result<(), Error> {
        run_command("ip", &["link", "del", &network.name])
    }

    fn connect(&self, network: &Network, endpoint: &Endpoint) -> Result<(), Error> {
        let veth = endpoint.veth_name();
        let peer = endpoint.peer_name();
        run_command("ip", &["link", "add", &veth, "type", "veth", "peer", "name", &peer])
            .map_err(|v| format!("Cannot add endpoint device: {v}"))?;
        run_command("ip", &["link", "set", &veth, "master", &network.name])?;
        run_command("ip", &["link", "set", &veth, "up"])
    }

    fn disconnect(&self, _network: &Network, endpoint: &Endpoint) -> Result<(), Error> {
        run_command("ip", &["link", "del", &endpoint.veth_name()])
    }
}

fn init_bridge(network: &Network) -> Result<(), Error> {
    let name = &network.name;
    if Path::new(SYS_CLASS_NET).join(name).exists() {
        return Err(format!("Interface {name} already exists").into());
    }
    run_command("ip", &["link", "add", name, "type", "bridge"])?;
    run_command("ip", &["addr", "add", &network.ip_range.to_string(), "dev", name])?;
    run_command("ip", &["link", "set", name, "up"])?;
    let subnet = Ipv4Network::new(network.ip_range.network(), network.ip_range.prefix())?;
    run_command(
        "iptables",
        &[
            "-t",
            "nat",
            "-A",
            "POSTROUTING",
            "-s",
            &subnet.to_string(),
            "!",
            "-o",
            name,
            "-j",
            "MASQUERADE",
        ],
    )
}

/// Scoped entry into another process's network namespace. Entering swaps
/// the calling thread in; dropping the guard restores the original
/// namespace on every exit path.
pub struct NetnsGuard {
    origin: File,
}

impl NetnsGuard {
    pub fn enter(pid: Pid) -> Result<Self, Error> {
        let target = File::open(format!("/proc/{pid}/ns/net"))
            .map_err(|v| format!("Cannot open container net namespace: {v}"))?;
        let origin = File::open("/proc/self/ns/net")?;
        setns(&target, CloneFlags::CLONE_NEWNET)
            .map_err(|v| format!("Cannot enter container net namespace: {v}"))?;
        Ok(Self { origin })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(err) = setns(&self.origin, CloneFlags::CLONE_NEWNET) {
            error!("Cannot restore network namespace: {err}");
        }
    }
}

/// Programs the container side of the endpoint: moves the veth peer into
/// the container's network namespace, then assigns its address, brings the
/// peer and loopback up, and installs the default route via the gateway.
pub(crate) fn configure_endpoint(endpoint: &Endpoint, pid: Pid) -> Result<(), Error> {
    let peer = endpoint.peer_name();
    run_command("ip", &["link", "set", &peer, "netns", &pid.to_string()])
        .map_err(|v| format!("Cannot move endpoint device: {v}"))?;
    let _guard = NetnsGuard::enter(pid)?;
    let address = format!("{}/{}", endpoint.ip, endpoint.network.ip_range.prefix());
    run_command("ip", &["addr", "add", &address, "dev", &peer])?;
    run_command("ip", &["link", "set", &peer, "up"])?;
    run_command("ip", &["link", "set", "lo", "up"])?;
    run_command(
        "ip",
        &[
            "route",
            "add",
            "default",
            "via",
            &endpoint.network.gateway().to_string(),
            "dev",
            &peer,
        ],
    )
}

/// Installs one DNAT rule per `host:container` mapping. Malformed or
/// failing entries are logged and skipped.
pub(crate) fn setup_port_mappings(endpoint: &Endpoint) {
    for mapping in &endpoint.port_mappings {
        let (host, container) = match split_port_mapping(mapping) {
            Some(v) => v,
            None => {
                error!("Wrong port mapping format: {mapping}");
                continue;
            }
        };
        let destination = format!("{}:{container}", endpoint.ip);
        if let Err(err) = run_command(
            "iptables",
            &[
                "-t",
                "nat",
                "-A",
                "PREROUTING",
                "-p",
                "tcp",
                "-m",
                "tcp",
                "--dport",
                host,
                "-j",
                "DNAT",
                "--to-destination",
                &destination,
            ],
        ) {
            error!("Cannot map port {mapping}: {err}");
        }
    }
}

fn run_command(binary: &str, args: &[&str]) -> Result<(), Error> {
    let output = Command::new(binary).args(args).output()?;
    if !output.status.success() {
        let code = output.status.code().unwrap_or(0);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("{binary} exited with code {code}: {}", stderr.trim()).into());
    }
    Ok(())
}
