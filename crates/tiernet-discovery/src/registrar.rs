//! The root tier's entry point for deployments.
//!
//! The root owns instance and RR addresses: a service registration gets its
//! round-robin addresses here, every scheduled replica its instance
//! addresses, and an undeployment hands them back.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tiernet_ipam::{AddressPoolManager, Family};
use tiernet_state::{Instance, IpType, Job, ServiceIpEntry, StateStore};
use tracing::{info, warn};

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::relay::{DeploymentStatusRelay, UndeployOutcome};
use crate::resolution::Selector;

/// The naming and addressing part of a service deployment descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServiceDescriptor {
    pub app_name: String,
    pub app_ns: String,
    pub service_name: String,
    pub service_ns: String,
    /// User-supplied round-robin addresses.
    #[serde(rename = "RR_ip", default, skip_serializing_if = "Option::is_none")]
    pub rr_ip: Option<String>,
    #[serde(rename = "RR_ip_v6", default, skip_serializing_if = "Option::is_none")]
    pub rr_ip_v6: Option<String>,
}

impl ServiceDescriptor {
    /// `app_name.app_ns.service_name.service_ns`.
    pub fn job_name(&self) -> DiscoveryResult<String> {
        let parts = [&self.app_name, &self.app_ns, &self.service_name, &self.service_ns];
        if parts.iter().any(|p| p.trim().is_empty()) {
            return Err(DiscoveryError::InvalidArguments(
                "app_name, app_ns, service_name and service_ns are required".to_string(),
            ));
        }
        Ok(parts.map(|p| p.trim()).join("."))
    }
}

pub struct JobRegistrar {
    store: StateStore,
    pools: Arc<AddressPoolManager>,
    relay: Arc<DeploymentStatusRelay>,
}

impl JobRegistrar {
    pub fn new(
        store: StateStore,
        pools: Arc<AddressPoolManager>,
        relay: Arc<DeploymentStatusRelay>,
    ) -> Self {
        Self {
            store,
            pools,
            relay,
        }
    }

    fn find_by_system_id(&self, system_job_id: &str) -> DiscoveryResult<Job> {
        self.store
            .find_job_by_system_id(system_job_id)?
            .ok_or_else(|| DiscoveryError::JobNotFound(system_job_id.to_string()))
    }

    /// Create or update the job for a service and give it RR addresses.
    ///
    /// An already registered job keeps its RR addresses unless the
    /// descriptor overrides them.
    pub fn register_job(
        &self,
        descriptor: &ServiceDescriptor,
        system_job_id: &str,
    ) -> DiscoveryResult<Job> {
        let job_name = descriptor.job_name()?;
        if system_job_id.trim().is_empty() {
            return Err(DiscoveryError::InvalidArguments("system_job_id is required".to_string()));
        }

        let mut job = self
            .store
            .get_job(&job_name)?
            .unwrap_or_else(|| Job::new(job_name.clone(), system_job_id));
        let existing = job
            .service_ip_list
            .iter()
            .find(|sip| sip.ip_type == IpType::RoundRobin)
            .cloned();

        let rr_v4 = self.rr_address(
            &job_name,
            descriptor.rr_ip.as_deref(),
            existing.as_ref().and_then(|sip| sip.address.clone()),
            Family::V4,
        )?;
        let rr_v6 = match self.rr_address(
            &job_name,
            descriptor.rr_ip_v6.as_deref(),
            existing.as_ref().and_then(|sip| sip.address_v6.clone()),
            Family::V6,
        ) {
            Ok(rr_v6) => rr_v6,
            Err(e) => {
                if rr_v4.allocated {
                    self.return_rr_address(&rr_v4.address, Family::V4);
                }
                return Err(e);
            }
        };

        job.system_job_id = system_job_id.to_string();
        job.service_ip_list = vec![ServiceIpEntry::round_robin(
            Some(rr_v4.address),
            Some(rr_v6.address),
        )];
        self.store.put_job(&job)?;
        info!(%job_name, %system_job_id, "service registered");
        Ok(job)
    }

    /// The current RR address unless one is requested, otherwise the
    /// requested or a pool-allocated one.
    fn rr_address(
        &self,
        job_name: &str,
        requested: Option<&str>,
        current: Option<String>,
        family: Family,
    ) -> DiscoveryResult<RrAddress> {
        let requested = requested.map(str::trim).filter(|r| !r.is_empty());
        match (requested, current) {
            (None, Some(current)) => Ok(RrAddress {
                address: current,
                allocated: false,
            }),
            (requested, _) => Ok(RrAddress {
                address: self.pools.assign_job_rr_address(job_name, requested, family)?,
                allocated: requested.is_none(),
            }),
        }
    }

    fn return_rr_address(&self, address: &str, family: Family) {
        if let Err(e) = self.pools.release_rr_address(address, family) {
            warn!(%address, error = %e, "failed to return RR address");
        }
    }

    /// One v4 and one v6 instance address, or neither.
    fn allocate_instance_pair(&self) -> DiscoveryResult<(String, String)> {
        let v4 = self.pools.assign_instance_address(Family::V4)?;
        match self.pools.assign_instance_address(Family::V6) {
            Ok(v6) => Ok((v4, v6)),
            Err(e) => {
                self.return_instance_addresses(&[(v4, Family::V4)]);
                Err(e.into())
            }
        }
    }

    fn return_instance_addresses(&self, addresses: &[(String, Family)]) {
        for (address, family) in addresses {
            if let Err(e) = self.pools.release_instance_address(address, *family) {
                warn!(%address, error = %e, "failed to return instance address");
            }
        }
    }

    /// Append `replicas` instances scheduled on `cluster_id`, each with fresh
    /// instance addresses. Numbers continue after the highest existing one.
    pub fn add_instances(
        &self,
        system_job_id: &str,
        replicas: u32,
        cluster_id: &str,
    ) -> DiscoveryResult<Vec<Instance>> {
        if replicas == 0 || cluster_id.trim().is_empty() {
            return Err(DiscoveryError::InvalidArguments(
                "replicas must be positive and cluster_id set".to_string(),
            ));
        }
        let job = self.find_by_system_id(system_job_id)?;

        let mut addresses: Vec<(String, String)> = Vec::with_capacity(replicas as usize);
        for _ in 0..replicas {
            match self.allocate_instance_pair() {
                Ok(pair) => addresses.push(pair),
                Err(e) => {
                    self.return_instance_addresses(&flatten(&addresses));
                    return Err(e);
                }
            }
        }

        let added = self.store.update_job(&job.job_name, |job| {
            let mut added = Vec::with_capacity(addresses.len());
            for (v4, v6) in &addresses {
                let instance = Instance {
                    instance_number: job.take_instance_number(),
                    instance_ip: Some(v4.clone()),
                    instance_ip_v6: Some(v6.clone()),
                    cluster_id: Some(cluster_id.to_string()),
                    ..Default::default()
                };
                job.upsert_instance(instance.clone());
                added.push(instance);
            }
            Ok::<_, DiscoveryError>(added)
        })?;

        match added {
            Some(added) => {
                info!(job_name = %job.job_name, %cluster_id, replicas, "instances added");
                Ok(added)
            }
            None => {
                warn!(%system_job_id, "job vanished while adding instances");
                self.return_instance_addresses(&flatten(&addresses));
                Err(DiscoveryError::JobNotFound(system_job_id.to_string()))
            }
        }
    }

    /// Remove one instance of the job identified by its scheduler id.
    pub async fn undeploy_instance(
        &self,
        system_job_id: &str,
        instance_number: u32,
    ) -> DiscoveryResult<UndeployOutcome> {
        let job = self.find_by_system_id(system_job_id)?;
        self.relay
            .report_undeployment(&Selector::Name(job.job_name), instance_number)
            .await
    }
}

/// An RR address and whether it was just taken from the pool.
struct RrAddress {
    address: String,
    allocated: bool,
}

fn flatten(pairs: &[(String, String)]) -> Vec<(String, Family)> {
    pairs
        .iter()
        .flat_map(|(v4, v6)| [(v4.clone(), Family::V4), (v6.clone(), Family::V6)])
        .collect()
}
