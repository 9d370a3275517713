//! tiernet-ipam — virtual address management for a tiernet tier.
//!
//! Hands out and recycles addresses from six independent pools: instance
//! and round-robin (RR) service addresses, and per-worker subnets, each in
//! IPv4 and IPv6. Pool state (`next` counter and free list) lives in the
//! `netcache` table of the [`StateStore`](tiernet_state::StateStore).
//!
//! # Architecture
//!
//! ```text
//! AddressPoolManager
//!   ├── instance-v4 / instance-v6 pools   (collision-checked against jobs)
//!   ├── rr-v4 / rr-v6 pools               (collision-checked against jobs)
//!   └── subnet-v4 / subnet-v6 pools       (/26 and /120 carving)
//!        each: AddressPool { PoolLayout, Mutex, StateStore }
//! ```

pub mod codec;
pub mod error;
pub mod manager;
pub mod pool;

pub use codec::Family;
pub use error::{IpamError, IpamResult};
pub use manager::AddressPoolManager;
pub use pool::{AddressBlock, AddressPool, PoolKind, PoolLayout, Stepping};
