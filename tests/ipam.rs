use std::net::Ipv4Addr;

use common::TempDir;
use ipnetwork::Ipv4Network;
use miniker::Ipam;

mod common;

fn subnet(cidr: &str) -> Ipv4Network {
    cidr.parse().unwrap()
}

#[test]
fn test_allocate_starts_after_network_address() {
    let tmpdir = TempDir::new().unwrap();
    let mut ipam = Ipam::new(tmpdir.join("subnet.json"));
    let subnet = subnet("192.168.10.0/24");
    assert_eq!(ipam.subnet_bitmap(subnet).unwrap(), None);
    let gateway = ipam.allocate(subnet).unwrap();
    assert_eq!(gateway, Ipv4Addr::new(192, 168, 10, 1));
    let bitmap = ipam.subnet_bitmap(subnet).unwrap().unwrap();
    assert_eq!(bitmap.len(), 256);
    assert!(bitmap.starts_with('1'));
    assert_eq!(bitmap.matches('1').count(), 1);
}

#[test]
fn test_allocate_release_round_trip() {
    let tmpdir = TempDir::new().unwrap();
    let mut ipam = Ipam::new(tmpdir.join("subnet.json"));
    let subnet = subnet("10.20.0.0/24");
    let gateway = ipam.allocate(subnet).unwrap();
    let before = ipam.subnet_bitmap(subnet).unwrap().unwrap();
    let ip = ipam.allocate(subnet).unwrap();
    assert_eq!(ip, Ipv4Addr::new(10, 20, 0, 2));
    ipam.release(subnet, ip).unwrap();
    assert_eq!(ipam.subnet_bitmap(subnet).unwrap().unwrap(), before);
    ipam.release(subnet, gateway).unwrap();
    let bitmap = ipam.subnet_bitmap(subnet).unwrap().unwrap();
    assert_eq!(bitmap, "0".repeat(256));
}

#[test]
fn test_allocate_uniqueness() {
    let tmpdir = TempDir::new().unwrap();
    let mut ipam = Ipam::new(tmpdir.join("subnet.json"));
    let subnet = subnet("172.18.0.0/24");
    let mut seen = std::collections::HashSet::new();
    for _ in 0..16 {
        assert!(seen.insert(ipam.allocate(subnet).unwrap()));
    }
    let bitmap = ipam.subnet_bitmap(subnet).unwrap().unwrap();
    assert_eq!(bitmap.matches('1').count(), 16);
}

#[test]
fn test_exhaustion() {
    let tmpdir = TempDir::new().unwrap();
    let mut ipam = Ipam::new(tmpdir.join("subnet.json"));
    let subnet = subnet("192.168.30.0/30");
    for i in 1..=4 {
        let ip = ipam.allocate(subnet).unwrap();
        assert_eq!(ip, Ipv4Addr::new(192, 168, 30, i));
    }
    let err = ipam.allocate(subnet).unwrap_err();
    assert!(err.to_string().contains("exhausted"), "{err}");
    ipam.release(subnet, Ipv4Addr::new(192, 168, 30, 2)).unwrap();
    assert_eq!(ipam.allocate(subnet).unwrap(), Ipv4Addr::new(192, 168, 30, 2));
}

#[test]
fn test_release_accepts_gateway_form_subnet() {
    let tmpdir = TempDir::new().unwrap();
    let mut ipam = Ipam::new(tmpdir.join("subnet.json"));
    let canonical = subnet("192.168.40.0/24");
    let gateway = ipam.allocate(canonical).unwrap();
    // Networks persist their subnet with the gateway in the host bits.
    let gateway_form = subnet("192.168.40.1/24");
    ipam.release(gateway_form, gateway).unwrap();
    let bitmap = ipam.subnet_bitmap(canonical).unwrap().unwrap();
    assert_eq!(bitmap, "0".repeat(256));
}

#[test]
fn test_persistence_reload() {
    let tmpdir = TempDir::new().unwrap();
    let path = tmpdir.join("subnet.json");
    let subnet = subnet("10.30.0.0/28");
    {
        let mut ipam = Ipam::new(&path);
        ipam.allocate(subnet).unwrap();
        ipam.allocate(subnet).unwrap();
    }
    let mut ipam = Ipam::new(&path);
    assert_eq!(ipam.allocate(subnet).unwrap(), Ipv4Addr::new(10, 30, 0, 3));
    let bitmap = ipam.subnet_bitmap(subnet).unwrap().unwrap();
    assert_eq!(bitmap.len(), 16);
    assert_eq!(bitmap.matches('1').count(), 3);
}

#[test]
fn test_release_rejects_foreign_address() {
    let tmpdir = TempDir::new().unwrap();
    let mut ipam = Ipam::new(tmpdir.join("subnet.json"));
    let subnet = subnet("10.40.0.0/24");
    ipam.allocate(subnet).unwrap();
    assert!(ipam.release(subnet, Ipv4Addr::new(10, 40, 0, 0)).is_err());
    assert!(ipam.release(subnet, Ipv4Addr::new(10, 41, 0, 5)).is_err());
}
