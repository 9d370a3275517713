//! The six address pools of a tier behind one handle.
//!
//! Constructed once per process and shared (`Arc`) with every request
//! handler. Each pool carries its own lock, so operations on different pools
//! never block each other.

use tiernet_state::StateStore;
use tracing::{info, warn};

use crate::codec::{self, Family};
use crate::error::{IpamError, IpamResult};
use crate::pool::{AddressPool, PoolKind};

pub struct AddressPoolManager {
    store: StateStore,
    instance_v4: AddressPool,
    instance_v6: AddressPool,
    rr_v4: AddressPool,
    rr_v6: AddressPool,
    subnet_v4: AddressPool,
    subnet_v6: AddressPool,
}

impl AddressPoolManager {
    pub fn new(store: StateStore) -> Self {
        Self {
            instance_v4: AddressPool::new(PoolKind::InstanceV4, store.clone()),
            instance_v6: AddressPool::new(PoolKind::InstanceV6, store.clone()),
            rr_v4: AddressPool::new(PoolKind::RoundRobinV4, store.clone()),
            rr_v6: AddressPool::new(PoolKind::RoundRobinV6, store.clone()),
            subnet_v4: AddressPool::new(PoolKind::SubnetV4, store.clone()),
            subnet_v6: AddressPool::new(PoolKind::SubnetV6, store.clone()),
            store,
        }
    }

    pub fn pool(&self, kind: PoolKind) -> &AddressPool {
        match kind {
            PoolKind::InstanceV4 => &self.instance_v4,
            PoolKind::InstanceV6 => &self.instance_v6,
            PoolKind::RoundRobinV4 => &self.rr_v4,
            PoolKind::RoundRobinV6 => &self.rr_v6,
            PoolKind::SubnetV4 => &self.subnet_v4,
            PoolKind::SubnetV6 => &self.subnet_v6,
        }
    }

    fn rr_pool(&self, family: Family) -> &AddressPool {
        match family {
            Family::V4 => &self.rr_v4,
            Family::V6 => &self.rr_v6,
        }
    }

    fn instance_pool(&self, family: Family) -> &AddressPool {
        match family {
            Family::V4 => &self.instance_v4,
            Family::V6 => &self.instance_v6,
        }
    }

    fn subnet_pool(&self, family: Family) -> &AddressPool {
        match family {
            Family::V4 => &self.subnet_v4,
            Family::V6 => &self.subnet_v6,
        }
    }

    /// Round-robin address for `job_name`.
    ///
    /// A user-supplied `requested` address must lie in the RR range of its
    /// family and, if it is already bound, belong to the same job. Without
    /// one, the RR pool allocates.
    pub fn assign_job_rr_address(
        &self,
        job_name: &str,
        requested: Option<&str>,
        family: Family,
    ) -> IpamResult<String> {
        if job_name.is_empty() {
            return Err(IpamError::InvalidArguments("job name is empty".to_string()));
        }
        let pool = self.rr_pool(family);
        let Some(requested) = requested.map(str::trim).filter(|r| !r.is_empty()) else {
            return pool.allocate();
        };

        let bytes = codec::parse(requested, family)?;
        if !pool.layout().covers(codec::to_value(&bytes)) {
            warn!(%job_name, address = %requested, "requested RR address outside the RR range");
            return Err(IpamError::AddressOutOfRange {
                address: requested.to_string(),
                pool: pool.kind().name().to_string(),
            });
        }
        let address = codec::stringify(&bytes)?;
        if let Some(owner) = self.store.find_job_by_address(&address)? {
            if owner.job_name != job_name {
                return Err(IpamError::AddressConflict {
                    address,
                    owner: owner.job_name,
                });
            }
        }
        info!(%job_name, %address, "user-supplied RR address accepted");
        Ok(address)
    }

    /// Return a pool-allocated RR address. User-supplied overrides were
    /// never taken from the pool and must not be released.
    pub fn release_rr_address(&self, address: &str, family: Family) -> IpamResult<()> {
        self.rr_pool(family).release(address)
    }

    pub fn assign_instance_address(&self, family: Family) -> IpamResult<String> {
        self.instance_pool(family).allocate()
    }

    pub fn release_instance_address(&self, address: &str, family: Family) -> IpamResult<()> {
        self.instance_pool(family).release(address)
    }

    /// Whether `release_instance_address` would accept `address` right now.
    pub fn check_instance_release(&self, address: &str, family: Family) -> IpamResult<()> {
        self.instance_pool(family).check_release(address)
    }

    pub fn assign_subnet(&self, family: Family) -> IpamResult<String> {
        self.subnet_pool(family).allocate()
    }

    pub fn release_subnet(&self, address: &str, family: Family) -> IpamResult<()> {
        self.subnet_pool(family).release(address)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use tiernet_state::{Job, ServiceIpEntry};

    fn manager() -> AddressPoolManager {
        AddressPoolManager::new(StateStore::open_in_memory().unwrap())
    }

    fn job_with_rr(name: &str, rr: &str) -> Job {
        let mut job = Job::new(name, "1");
        job.service_ip_list
            .push(ServiceIpEntry::round_robin(Some(rr.to_string()), None));
        job
    }

    #[test]
    fn rr_without_override_uses_rr_pools() {
        let manager = manager();
        assert_eq!(
            manager.assign_job_rr_address("a.a.a.a", None, Family::V4).unwrap(),
            "10.30.0.0"
        );
        assert_eq!(
            manager.assign_job_rr_address("a.a.a.a", Some(""), Family::V4).unwrap(),
            "10.30.0.1"
        );
        assert_eq!(
            manager.assign_job_rr_address("a.a.a.a", None, Family::V6).unwrap(),
            "fdff:2000::"
        );
    }

    #[test]
    fn rr_override_must_be_in_rr_range() {
        let manager = manager();
        assert_eq!(
            manager
                .assign_job_rr_address("a.a.a.a", Some("10.30.5.7"), Family::V4)
                .unwrap(),
            "10.30.5.7"
        );
        assert!(matches!(
            manager.assign_job_rr_address("a.a.a.a", Some("10.31.0.1"), Family::V4),
            Err(IpamError::AddressOutOfRange { .. })
        ));
        assert!(matches!(
            manager.assign_job_rr_address("a.a.a.a", Some("fdff::1"), Family::V6),
            Err(IpamError::AddressOutOfRange { .. })
        ));
        assert!(matches!(
            manager.assign_job_rr_address("a.a.a.a", Some("10.30.1"), Family::V4),
            Err(IpamError::MalformedAddress(_))
        ));
    }

    #[test]
    fn rr_override_conflicts_with_other_job() {
        let manager = manager();
        manager
            .store
            .put_job(&job_with_rr("owner.a.b.c", "10.30.0.9"))
            .unwrap();

        let err = manager
            .assign_job_rr_address("other.a.b.c", Some("10.30.0.9"), Family::V4)
            .unwrap_err();
        assert!(matches!(err, IpamError::AddressConflict { ref owner, .. } if owner == "owner.a.b.c"));

        assert_eq!(
            manager
                .assign_job_rr_address("owner.a.b.c", Some("10.30.0.9"), Family::V4)
                .unwrap(),
            "10.30.0.9"
        );
    }

    #[test]
    fn rr_requires_job_name() {
        let manager = manager();
        assert!(matches!(
            manager.assign_job_rr_address("", None, Family::V4),
            Err(IpamError::InvalidArguments(_))
        ));
    }

    #[test]
    fn pools_are_independent() {
        let manager = manager();
        assert_eq!(manager.assign_instance_address(Family::V4).unwrap(), "172.30.0.0");
        assert_eq!(manager.assign_instance_address(Family::V6).unwrap(), "fdff::");
        assert_eq!(manager.assign_subnet(Family::V4).unwrap(), "172.18.0.0");
        assert_eq!(manager.assign_subnet(Family::V6).unwrap(), "fc00::");
        assert_eq!(manager.assign_instance_address(Family::V4).unwrap(), "172.30.0.1");
        assert_eq!(manager.assign_subnet(Family::V4).unwrap(), "172.18.0.64");
    }

    #[test]
    fn release_routes_to_matching_pool() {
        let manager = manager();
        let instance = manager.assign_instance_address(Family::V4).unwrap();
        manager.assign_instance_address(Family::V4).unwrap();
        let subnet = manager.assign_subnet(Family::V4).unwrap();
        manager.assign_subnet(Family::V4).unwrap();

        assert!(manager.release_subnet(&instance, Family::V4).is_err());
        manager.release_instance_address(&instance, Family::V4).unwrap();
        manager.release_subnet(&subnet, Family::V4).unwrap();

        assert_eq!(manager.assign_instance_address(Family::V4).unwrap(), instance);
        assert_eq!(manager.assign_subnet(Family::V4).unwrap(), subnet);
    }

    #[test]
    fn concurrent_allocations_never_collide() {
        let manager = Arc::new(manager());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| manager.assign_subnet(Family::V6).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for address in handle.join().unwrap() {
                assert!(seen.insert(address), "duplicate subnet handed out");
            }
        }
        assert_eq!(seen.len(), 100);
    }
}
