use std::collections::HashMap;
use std::fs::{create_dir_all, read_to_string};
use std::net::Ipv4Addr;
use std::path::PathBuf;

use ipnetwork::Ipv4Network;

use crate::Error;

pub const DEFAULT_ALLOCATOR_PATH: &str = "/var/lib/miniker/network/ipam/subnet.json";

/// Bitmap-per-subnet IP address allocator. Each known subnet maps to a
/// string of `'0'`/`'1'` characters, one per address slot counting from the
/// network address; the whole map is persisted as a single JSON file.
///
/// The first allocation of a fresh subnet yields the address right after
/// the network address, which consumers use as the gateway.
#[derive(Debug)]
pub struct Ipam {
    allocator_path: PathBuf,
    subnets: Option<HashMap<String, String>>,
}

impl Default for Ipam {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOCATOR_PATH)
    }
}

impl Ipam {
    pub fn new(allocator_path: impl Into<PathBuf>) -> Self {
        Self {
            allocator_path: allocator_path.into(),
            subnets: None,
        }
    }

    /// Marks the lowest free address of the subnet as used and returns it.
    /// Fails with an exhaustion error once every slot is taken.
    pub fn allocate(&mut self, subnet: Ipv4Network) -> Result<Ipv4Addr, Error> {
        let subnet = canonical(subnet)?;
        let key = subnet.to_string();
        let subnets = self.load()?;
        let bitmap = subnets
            .entry(key.clone())
            .or_insert_with(|| "0".repeat(subnet_size(subnet)));
        let index = match bitmap.bytes().position(|v| v == b'0') {
            Some(v) => v,
            None => return Err(format!("Subnet {key} is exhausted").into()),
        };
        bitmap.replace_range(index..index + 1, "1");
        self.dump()?;
        let ip = u32::from(subnet.network()) + index as u32 + 1;
        Ok(Ipv4Addr::from(ip))
    }

    /// Returns an address to the subnet's free pool.
    pub fn release(&mut self, subnet: Ipv4Network, ip: Ipv4Addr) -> Result<(), Error> {
        let subnet = canonical(subnet)?;
        let key = subnet.to_string();
        let subnets = self.load()?;
        let bitmap = subnets
            .get_mut(&key)
            .ok_or_else(|| format!("Cannot get {key} info"))?;
        let index = u32::from(ip)
            .checked_sub(u32::from(subnet.network()))
            .and_then(|v| v.checked_sub(1))
            .ok_or_else(|| format!("Address {ip} does not belong to {key}"))?
            as usize;
        if index >= bitmap.len() {
            return Err(format!("Address {ip} does not belong to {key}").into());
        }
        bitmap.replace_range(index..index + 1, "0");
        self.dump()
    }

    /// Current bitmap of the subnet, if it is known to the allocator.
    pub fn subnet_bitmap(&mut self, subnet: Ipv4Network) -> Result<Option<String>, Error> {
        let subnet = canonical(subnet)?;
        let key = subnet.to_string();
        Ok(self.load()?.get(&key).cloned())
    }

    fn load(&mut self) -> Result<&mut HashMap<String, String>, Error> {
        if self.subnets.is_none() {
            let subnets = match read_to_string(&self.allocator_path) {
                Ok(data) => serde_json::from_str(&data)?,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
                Err(err) => return Err(err.into()),
            };
            self.subnets = Some(subnets);
        }
        Ok(self.subnets.as_mut().unwrap())
    }

    fn dump(&self) -> Result<(), Error> {
        if let Some(dir) = self.allocator_path.parent() {
            create_dir_all(dir)?;
        }
        let data = serde_json::to_string(self.subnets.as_ref().unwrap())?;
        Ok(std::fs::write(&self.allocator_path, data)?)
    }
}

fn canonical(subnet: Ipv4Network) -> Result<Ipv4Network, Error> {
    Ok(Ipv4Network::new(subnet.network(), subnet.prefix())?)
}

fn subnet_size(subnet: Ipv4Network) -> usize {
    (1u64 << (32 - subnet.prefix())) as usize
}
