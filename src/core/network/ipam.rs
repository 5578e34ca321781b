use std::{
    collections::BTreeMap,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use anyhow::Context;
use bitvec::prelude::*;
use ipnet::Ipv4Net;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::lock::{write_atomic, FileLock};
use crate::core::error::NetError;

/// Shortest prefix accepted; a /8 already needs 2^24 bitmap slots.
pub const MIN_PREFIX_LEN: u8 = 8;

/// File-backed address allocator.
///
/// Every call takes the table lock, loads the whole table, changes one bit and
/// writes the whole table back. Address at bitmap offset `c` is
/// `network + c + 1`, so the network address itself is never handed out. The
/// top slot of a subnet is not reserved: the last offsets map to the broadcast
/// address and to the address just past it.
#[derive(Debug, Clone)]
pub struct IPAM {
    path: PathBuf,
    lock_path: PathBuf,
}

impl IPAM {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();

        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");

        Self {
            path,
            lock_path: PathBuf::from(lock_path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leases the lowest free address of `subnet`.
    pub fn allocate(&self, subnet: &Ipv4Net) -> anyhow::Result<Ipv4Addr> {
        let subnet = checked_subnet(subnet)?;
        let _lock = FileLock::exclusive(&self.lock_path)?;

        let mut table = self.load()?;
        let ip = table.allocate(&subnet)?;
        self.dump(&table)?;

        debug!("[IPAM]: Allocated {} from {}", ip, subnet);
        Ok(ip)
    }

    /// Returns `ip` to `subnet`. Releasing an address that is not allocated
    /// leaves the table as it was.
    pub fn release(&self, subnet: &Ipv4Net, ip: Ipv4Addr) -> anyhow::Result<()> {
        let subnet = checked_subnet(subnet)?;
        let _lock = FileLock::exclusive(&self.lock_path)?;

        let mut table = self.load()?;
        table.release(&subnet, ip)?;
        self.dump(&table)?;

        debug!("[IPAM]: Released {} to {}", ip, subnet);
        Ok(())
    }

    /// Marks `ip` as allocated again, e.g. to undo a release whose follow-up
    /// failed.
    pub fn reserve(&self, subnet: &Ipv4Net, ip: Ipv4Addr) -> anyhow::Result<()> {
        let subnet = checked_subnet(subnet)?;
        let _lock = FileLock::exclusive(&self.lock_path)?;

        let mut table = self.load()?;
        table.reserve(&subnet, ip)?;
        self.dump(&table)?;

        debug!("[IPAM]: Reserved {} in {}", ip, subnet);
        Ok(())
    }

    /// Reads the table without locking. A missing file is an empty table.
    pub fn load(&self) -> anyhow::Result<AllocationTable> {
        let contents = match std::fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(AllocationTable::default())
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };

        serde_json::from_slice(&contents).map_err(|e| {
            NetError::MalformedTable(format!("{}: {}", self.path.display(), e)).into()
        })
    }

    fn dump(&self, table: &AllocationTable) -> anyhow::Result<()> {
        let contents = serde_json::to_vec(table)?;
        write_atomic(&self.path, &contents)
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

/// Subnet CIDR -> one bit per address slot, `1` meaning allocated.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct AllocationTable {
    #[serde(serialize_with = "serialize_subnets")]
    #[serde(deserialize_with = "deserialize_subnets")]
    subnets: BTreeMap<String, BitVec<u8>>,
}

impl AllocationTable {
    pub fn allocate(&mut self, subnet: &Ipv4Net) -> anyhow::Result<Ipv4Addr> {
        let key = subnet.to_string();
        let bitmap = self.bitmap_mut(subnet)?;

        let pos = bitmap
            .first_zero()
            .ok_or(NetError::SubnetExhausted(key.clone()))?;
        let ip = offset_to_ip(subnet, pos).ok_or(NetError::SubnetExhausted(key))?;
        bitmap.set(pos, true);

        Ok(ip)
    }

    pub fn release(&mut self, subnet: &Ipv4Net, ip: Ipv4Addr) -> anyhow::Result<()> {
        let key = subnet.to_string();
        let capacity = capacity(subnet);

        let pos = ip_to_offset(subnet, ip).ok_or(NetError::AddressOutOfRange {
            subnet: key.clone(),
            address: ip,
        })?;

        let Some(bitmap) = self.subnets.get_mut(&key) else {
            warn!("[IPAM]: Release of {} ignored, {} has no allocations", ip, key);
            return Ok(());
        };
        check_len(&key, bitmap, capacity)?;

        if !bitmap[pos] {
            warn!("[IPAM]: Release of {} ignored, it is not allocated", ip);
            return Ok(());
        }
        bitmap.set(pos, false);

        Ok(())
    }

    pub fn reserve(&mut self, subnet: &Ipv4Net, ip: Ipv4Addr) -> anyhow::Result<()> {
        let pos = ip_to_offset(subnet, ip).ok_or(NetError::AddressOutOfRange {
            subnet: subnet.to_string(),
            address: ip,
        })?;

        let bitmap = self.bitmap_mut(subnet)?;
        if bitmap[pos] {
            warn!("[IPAM]: {} is already allocated", ip);
        }
        bitmap.set(pos, true);

        Ok(())
    }

    fn bitmap_mut(&mut self, subnet: &Ipv4Net) -> anyhow::Result<&mut BitVec<u8>> {
        let key = subnet.to_string();
        let capacity = capacity(subnet);

        let bitmap = self.subnets.entry(key.clone()).or_insert_with(|| {
            let mut bitmap = BitVec::new();
            bitmap.resize(capacity, false);
            bitmap
        });
        check_len(&key, bitmap, capacity)?;

        Ok(bitmap)
    }

    pub fn is_allocated(&self, subnet: &Ipv4Net, ip: Ipv4Addr) -> bool {
        let Some(pos) = ip_to_offset(subnet, ip) else {
            return false;
        };

        self.subnets
            .get(&subnet.to_string())
            .and_then(|bitmap| bitmap.get(pos).map(|bit| *bit))
            .unwrap_or(false)
    }

    pub fn allocated(&self, subnet: &Ipv4Net) -> usize {
        self.subnets
            .get(&subnet.to_string())
            .map_or(0, |bitmap| bitmap.count_ones())
    }
}

/// Parses a CIDR string and checks it is one the allocator can manage. The
/// address part is kept as given; callers truncate when they need the subnet.
pub fn parse_subnet(cidr: &str) -> anyhow::Result<Ipv4Net> {
    let net = cidr
        .trim()
        .parse::<Ipv4Net>()
        .map_err(|e| NetError::invalid_subnet(cidr, e))?;

    checked_subnet(&net)?;
    Ok(net)
}

fn checked_subnet(subnet: &Ipv4Net) -> anyhow::Result<Ipv4Net> {
    if subnet.prefix_len() < MIN_PREFIX_LEN {
        return Err(NetError::invalid_subnet(
            &subnet.to_string(),
            format!("prefix shorter than /{}", MIN_PREFIX_LEN),
        )
        .into());
    }

    Ok(subnet.trunc())
}

fn capacity(subnet: &Ipv4Net) -> usize {
    1usize << (32 - subnet.prefix_len())
}

fn check_len(key: &str, bitmap: &BitVec<u8>, capacity: usize) -> anyhow::Result<()> {
    if bitmap.len() != capacity {
        return Err(NetError::MalformedTable(format!(
            "{} has {} slots, expected {}",
            key,
            bitmap.len(),
            capacity
        ))
        .into());
    }

    Ok(())
}

fn offset_to_ip(subnet: &Ipv4Net, pos: usize) -> Option<Ipv4Addr> {
    u32::from(subnet.network())
        .checked_add(u32::try_from(pos).ok()?)?
        .checked_add(1)
        .map(Ipv4Addr::from)
}

fn ip_to_offset(subnet: &Ipv4Net, ip: Ipv4Addr) -> Option<usize> {
    let pos = u32::from(ip)
        .checked_sub(u32::from(subnet.network()))?
        .checked_sub(1)? as usize;

    (pos < capacity(subnet)).then_some(pos)
}

fn serialize_subnets<S>(
    subnets: &BTreeMap<String, BitVec<u8>>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let mut map = BTreeMap::new();
    for (cidr, bitmap) in subnets {
        let bits: String = bitmap
            .iter()
            .map(|bit| if *bit { '1' } else { '0' })
            .collect();
        map.insert(cidr, bits);
    }
    map.serialize(serializer)
}

fn deserialize_subnets<'de, D>(deserializer: D) -> Result<BTreeMap<String, BitVec<u8>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let map: BTreeMap<String, String> = BTreeMap::deserialize(deserializer)?;
    let mut subnets = BTreeMap::new();
    for (cidr, bits) in map {
        let mut bitmap = BitVec::with_capacity(bits.len());
        for c in bits.chars() {
            match c {
                '0' => bitmap.push(false),
                '1' => bitmap.push(true),
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "unexpected {:?} in bitmap of {}",
                        other, cidr
                    )))
                }
            }
        }
        subnets.insert(cidr, bitmap);
    }
    Ok(subnets)
}
