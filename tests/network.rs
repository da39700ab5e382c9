use std::net::Ipv4Addr;

use common::TempDir;
use miniker::{split_port_mapping, Endpoint, Ipam, Network, NetworkRegistry};

mod common;

fn testnet() -> Network {
    Network {
        name: "testnet".to_string(),
        ip_range: "192.168.10.1/24".parse().unwrap(),
        driver: "bridge".to_string(),
    }
}

#[test]
fn test_endpoint_names() {
    let network = testnet();
    let endpoint = Endpoint::new("web", &network, Ipv4Addr::new(192, 168, 10, 2), Vec::new());
    assert_eq!(endpoint.id, "web-testnet");
    assert_eq!(endpoint.veth_name(), "web-t");
    assert_eq!(endpoint.peer_name(), "cif-web-t");
}

#[test]
fn test_network_gateway() {
    let network = testnet();
    assert_eq!(network.gateway(), Ipv4Addr::new(192, 168, 10, 1));
    assert_eq!(network.ip_range.prefix(), 24);
}

#[test]
fn test_network_json_shape() {
    let value = serde_json::to_value(testnet()).unwrap();
    assert_eq!(value["Name"], "testnet");
    assert_eq!(value["IpRange"], "192.168.10.1/24");
    assert_eq!(value["Driver"], "bridge");
}

#[test]
fn test_registry_loads_persisted_networks() {
    let tmpdir = TempDir::new().unwrap();
    let root = tmpdir.join("networks");
    std::fs::create_dir_all(&root).unwrap();
    let data = serde_json::to_string(&testnet()).unwrap();
    std::fs::write(root.join("testnet"), data).unwrap();
    let registry =
        NetworkRegistry::new(&root, Ipam::new(tmpdir.join("subnet.json"))).unwrap();
    let network = registry.get("testnet").unwrap();
    assert_eq!(*network, testnet());
    let names: Vec<_> = registry.list().into_iter().map(|v| v.name.clone()).collect();
    assert_eq!(names, ["testnet"]);
}

#[test]
fn test_registry_network_name_follows_file_name() {
    let tmpdir = TempDir::new().unwrap();
    let root = tmpdir.join("networks");
    std::fs::create_dir_all(&root).unwrap();
    let data = serde_json::to_string(&testnet()).unwrap();
    std::fs::write(root.join("renamed"), data).unwrap();
    let registry =
        NetworkRegistry::new(&root, Ipam::new(tmpdir.join("subnet.json"))).unwrap();
    assert!(registry.get("testnet").is_none());
    assert_eq!(registry.get("renamed").unwrap().name, "renamed");
}

#[test]
fn test_registry_missing_root_is_empty() {
    let tmpdir = TempDir::new().unwrap();
    let registry = NetworkRegistry::new(
        tmpdir.join("does-not-exist"),
        Ipam::new(tmpdir.join("subnet.json")),
    )
    .unwrap();
    assert!(registry.list().is_empty());
}

#[test]
fn test_split_port_mapping() {
    assert_eq!(split_port_mapping("8080:80"), Some(("8080", "80")));
    assert_eq!(split_port_mapping("8080"), None);
    assert_eq!(split_port_mapping(":80"), None);
    assert_eq!(split_port_mapping("8080:"), None);
}
