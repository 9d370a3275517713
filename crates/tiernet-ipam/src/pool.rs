//! Address pools: one monotonic counter plus a free list per address space.
//!
//! Each pool is described by a [`PoolLayout`]: the blocks it may allocate
//! from and the stepping rule that produces the successor of an address.
//! Once the successor falls outside every block, the persisted `next` sits
//! on the layout's limit and the pool reports exhaustion until addresses are
//! released back into the free list.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Mutex, PoisonError};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use tiernet_state::StateStore;
use tracing::{debug, error, warn};

use crate::codec::{self, Family};
use crate::error::{IpamError, IpamResult};

// ── Pool kinds ─────────────────────────────────────────────────────

/// The six pools a tier manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    InstanceV4,
    InstanceV6,
    RoundRobinV4,
    RoundRobinV6,
    SubnetV4,
    SubnetV6,
}

impl PoolKind {
    pub const ALL: [PoolKind; 6] = [
        PoolKind::InstanceV4,
        PoolKind::InstanceV6,
        PoolKind::RoundRobinV4,
        PoolKind::RoundRobinV6,
        PoolKind::SubnetV4,
        PoolKind::SubnetV6,
    ];

    /// Storage name used for the `next_<name>` / `free_<name>` records.
    pub fn name(self) -> &'static str {
        match self {
            PoolKind::InstanceV4 => "service_ip",
            PoolKind::InstanceV6 => "service_ip_v6",
            PoolKind::RoundRobinV4 => "rr_ip",
            PoolKind::RoundRobinV6 => "rr_ip_v6",
            PoolKind::SubnetV4 => "subnet_ip",
            PoolKind::SubnetV6 => "subnet_ip_v6",
        }
    }

    pub fn family(self) -> Family {
        match self {
            PoolKind::InstanceV4 | PoolKind::RoundRobinV4 | PoolKind::SubnetV4 => Family::V4,
            PoolKind::InstanceV6 | PoolKind::RoundRobinV6 | PoolKind::SubnetV6 => Family::V6,
        }
    }

    /// Instance and RR addresses are checked against the job registry
    /// before being handed out; subnets are not.
    pub fn checks_collisions(self) -> bool {
        !matches!(self, PoolKind::SubnetV4 | PoolKind::SubnetV6)
    }

    /// Address-space layout of this pool.
    pub fn layout(self) -> PoolLayout {
        match self {
            PoolKind::InstanceV4 => PoolLayout::octet_wrap(Ipv4Net::new_assert(
                Ipv4Addr::new(172, 30, 0, 0),
                16,
            )),
            PoolKind::RoundRobinV4 => PoolLayout::octet_wrap(Ipv4Net::new_assert(
                Ipv4Addr::new(10, 30, 0, 0),
                16,
            )),
            PoolKind::InstanceV6 => PoolLayout::stride(
                Family::V6,
                vec![
                    AddressBlock::from_net(
                        Ipv6Net::new_assert(Ipv6Addr::new(0xfdff, 0, 0, 0, 0, 0, 0, 0), 21)
                            .into(),
                    ),
                    AddressBlock::from_net(
                        Ipv6Net::new_assert(Ipv6Addr::new(0xfdff, 0x0800, 0, 0, 0, 0, 0, 0), 21)
                            .into(),
                    ),
                ],
                1,
            ),
            PoolKind::RoundRobinV6 => PoolLayout::stride(
                Family::V6,
                vec![AddressBlock::from_net(
                    Ipv6Net::new_assert(Ipv6Addr::new(0xfdff, 0x2000, 0, 0, 0, 0, 0, 0), 21)
                        .into(),
                )],
                1,
            ),
            // 172.18.0.0 up to (excluding) 172.30.0.0, one /26 per worker.
            PoolKind::SubnetV4 => PoolLayout::stride(
                Family::V4,
                vec![AddressBlock::span(
                    Ipv4Addr::new(172, 18, 0, 0).into(),
                    Ipv4Addr::new(172, 30, 0, 0).into(),
                )],
                64,
            ),
            // fc00:: up to (excluding) the reserved fdfe::/16, one /120 per worker.
            PoolKind::SubnetV6 => PoolLayout::stride(
                Family::V6,
                vec![AddressBlock::span(
                    Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0).into(),
                    Ipv6Addr::new(0xfdfe, 0, 0, 0, 0, 0, 0, 0).into(),
                )],
                256,
            ),
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Layouts ────────────────────────────────────────────────────────

/// Half-open numeric range `[start, end)` of addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressBlock {
    pub start: u128,
    pub end: u128,
}

impl AddressBlock {
    /// Every address of a CIDR network, network and broadcast included.
    pub fn from_net(net: IpNet) -> Self {
        match net {
            IpNet::V4(net) => Self {
                start: u128::from(u32::from(net.network())),
                end: u128::from(u32::from(net.broadcast())) + 1,
            },
            IpNet::V6(net) => Self {
                start: u128::from(net.network()),
                end: u128::from(net.broadcast()).saturating_add(1),
            },
        }
    }

    /// Addresses from `start` up to but excluding `end`.
    pub fn span(start: IpAddr, end: IpAddr) -> Self {
        Self {
            start: ip_value(start),
            end: ip_value(end),
        }
    }

    pub fn contains(&self, value: u128) -> bool {
        (self.start..self.end).contains(&value)
    }
}

fn ip_value(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// How the successor of an address is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stepping {
    /// Increment the last octet modulo `modulus`, carrying into the third
    /// octet modulo `modulus`. Wrapping the third octet exhausts the pool.
    OctetWrap { modulus: u8 },
    /// Add a fixed stride. Leaving a block jumps to the start of the next
    /// one; leaving the last block exhausts the pool.
    Stride(u128),
}

/// Address space a pool may allocate from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolLayout {
    pub family: Family,
    pub blocks: Vec<AddressBlock>,
    pub stepping: Stepping,
}

impl PoolLayout {
    /// IPv4 /16 stepped on its two low octets, each kept below 254.
    pub fn octet_wrap(net: Ipv4Net) -> Self {
        Self {
            family: Family::V4,
            blocks: vec![AddressBlock::from_net(net.into())],
            stepping: Stepping::OctetWrap { modulus: 254 },
        }
    }

    pub fn stride(family: Family, blocks: Vec<AddressBlock>, stride: u128) -> Self {
        Self {
            family,
            blocks,
            stepping: Stepping::Stride(stride),
        }
    }

    /// First address handed out by a fresh pool.
    pub fn start(&self) -> u128 {
        self.blocks.first().map_or(0, |block| block.start)
    }

    /// The value `next` takes once the pool is exhausted. It lies outside
    /// every block and above every allocatable address.
    pub fn limit(&self) -> u128 {
        self.blocks.last().map_or(0, |block| block.end)
    }

    fn block_of(&self, value: u128) -> Option<(usize, &AddressBlock)> {
        self.blocks
            .iter()
            .enumerate()
            .find(|(_, block)| block.contains(value))
    }

    /// Whether `value` falls inside one of the blocks.
    pub fn covers(&self, value: u128) -> bool {
        self.block_of(value).is_some()
    }

    /// Whether `value` is an address this pool can hand out.
    pub fn contains(&self, value: u128) -> bool {
        if self.block_of(value).is_none() {
            return false;
        }
        match self.stepping {
            Stepping::OctetWrap { modulus } => {
                let modulus = u128::from(modulus);
                (value & 0xff) < modulus && ((value >> 8) & 0xff) < modulus
            }
            Stepping::Stride(_) => true,
        }
    }

    /// Whether `value` lies on a stride boundary of its block.
    pub fn is_aligned(&self, value: u128) -> bool {
        match (self.stepping, self.block_of(value)) {
            (Stepping::Stride(stride), Some((_, block))) => (value - block.start) % stride == 0,
            (Stepping::OctetWrap { .. }, Some(_)) => true,
            (_, None) => false,
        }
    }

    /// Successor of an allocatable address, or [`limit`](Self::limit) when
    /// the space has run out.
    pub fn successor(&self, value: u128) -> u128 {
        let Some((index, block)) = self.block_of(value) else {
            return self.limit();
        };
        match self.stepping {
            Stepping::OctetWrap { modulus } => {
                let modulus = u128::from(modulus);
                let base = value & !0xffff;
                let third = (value >> 8) & 0xff;
                let fourth = (value + 1) & 0xff;
                if fourth % modulus != 0 {
                    return base | (third << 8) | fourth;
                }
                let third = (third + 1) % modulus;
                if third == 0 {
                    self.limit()
                } else {
                    base | (third << 8)
                }
            }
            Stepping::Stride(stride) => match value.checked_add(stride) {
                Some(candidate) if candidate < block.end => candidate,
                _ => self
                    .blocks
                    .get(index + 1)
                    .map_or(self.limit(), |next| next.start),
            },
        }
    }
}

// ── Pool ───────────────────────────────────────────────────────────

/// One address pool, persisted in the `netcache` table.
///
/// All multi-step operations (read `next`, compute successor, write `next`)
/// run under the pool's own lock, so two allocations never observe the same
/// `next`. Pools never share a lock.
pub struct AddressPool {
    kind: PoolKind,
    layout: PoolLayout,
    store: StateStore,
    lock: Mutex<()>,
}

impl AddressPool {
    pub fn new(kind: PoolKind, store: StateStore) -> Self {
        Self::with_layout(kind, kind.layout(), store)
    }

    pub fn with_layout(kind: PoolKind, layout: PoolLayout, store: StateStore) -> Self {
        Self {
            kind,
            layout,
            store,
            lock: Mutex::new(()),
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn layout(&self) -> &PoolLayout {
        &self.layout
    }

    fn load_next(&self) -> IpamResult<u128> {
        match self.store.pool_next(self.kind.name())? {
            Some(bytes) if bytes.len() == self.kind.family().width() => Ok(codec::to_value(&bytes)),
            Some(bytes) => Err(IpamError::MalformedAddress(format!(
                "stored next of pool {} has {} bytes",
                self.kind,
                bytes.len()
            ))),
            None => Ok(self.layout.start()),
        }
    }

    /// The address the counter will hand out next (ignoring the free list).
    pub fn next_address(&self) -> IpamResult<String> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(codec::render(self.load_next()?, self.kind.family()))
    }

    /// Hand out an address: the most recently released one if any,
    /// otherwise the current `next`, skipping addresses already bound to a
    /// job for instance and RR pools.
    pub fn allocate(&self) -> IpamResult<String> {
        let family = self.kind.family();
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(bytes) = self.store.pop_free_address(self.kind.name())? {
            let address = codec::stringify(&bytes)?;
            debug!(pool = %self.kind, %address, "address reused from free list");
            return Ok(address);
        }

        loop {
            let current = self.load_next()?;
            if !self.layout.contains(current) {
                error!(pool = %self.kind, "address space exhausted");
                return Err(IpamError::AddressSpaceExhausted(self.kind.name().to_string()));
            }
            let successor = self.layout.successor(current);
            self.store
                .set_pool_next(self.kind.name(), &codec::from_value(successor, family))?;

            let address = codec::render(current, family);
            if self.kind.checks_collisions() {
                if let Some(owner) = self.store.find_job_by_address(&address)? {
                    warn!(pool = %self.kind, %address, job_name = %owner.job_name, "address already bound, skipping");
                    continue;
                }
            }
            debug!(pool = %self.kind, %address, "address allocated");
            return Ok(address);
        }
    }

    /// Return an address to the free list.
    ///
    /// The address must belong to this pool, sit on a block boundary, lie
    /// strictly below `next` and not already be on the free list.
    pub fn release(&self, address: &str) -> IpamResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let bytes = self.verify_release(address)?;
        self.store.push_free_address(self.kind.name(), &bytes)?;
        debug!(pool = %self.kind, %address, "address released");
        Ok(())
    }

    /// Run the checks of [`release`](Self::release) without touching the
    /// free list.
    pub fn check_release(&self, address: &str) -> IpamResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.verify_release(address).map(|_| ())
    }

    /// Caller holds the pool lock.
    fn verify_release(&self, address: &str) -> IpamResult<Vec<u8>> {
        let bytes = codec::parse(address, self.kind.family())?;
        let value = codec::to_value(&bytes);
        if !self.layout.contains(value) {
            return Err(IpamError::AddressOutOfRange {
                address: address.to_string(),
                pool: self.kind.name().to_string(),
            });
        }
        if !self.layout.is_aligned(value) {
            return Err(IpamError::MisalignedAddress {
                address: address.to_string(),
                pool: self.kind.name().to_string(),
            });
        }

        let next = self.load_next()?;
        if value >= next {
            let next = codec::render(next, self.kind.family());
            error!(pool = %self.kind, %address, %next, "release of an address that was never allocated");
            return Err(IpamError::ReleaseAheadOfNext {
                address: address.to_string(),
                pool: self.kind.name().to_string(),
                next,
            });
        }
        if self
            .store
            .free_addresses(self.kind.name())?
            .contains(&bytes)
        {
            error!(pool = %self.kind, %address, "address released twice");
            return Err(IpamError::AlreadyReleased {
                address: address.to_string(),
                pool: self.kind.name().to_string(),
            });
        }
        Ok(bytes)
    }
}
