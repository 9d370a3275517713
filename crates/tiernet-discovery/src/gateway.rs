//! Edge gateways registered at the root tier.
//!
//! A gateway takes its instance addresses from the same pools as service
//! instances and is entered into the registry as a one-instance job, so
//! table queries for `{host}.tiernet.gateway.0` resolve to it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tiernet_ipam::{AddressPoolManager, Family};
use tiernet_state::{ExposedService, Gateway, Instance, Job, StateStore};
use tracing::{info, warn};

use crate::error::{DiscoveryError, DiscoveryResult};

/// Body of a gateway deployment. An instance address is assigned for each
/// family the gateway host has a public address in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GatewayDeployment {
    pub gateway_id: String,
    pub host: String,
    pub cluster_id: String,
    #[serde(default)]
    pub gateway_ipv4: Option<String>,
    #[serde(default)]
    pub gateway_ipv6: Option<String>,
    #[serde(default)]
    pub host_port: Option<u16>,
}

/// Namespace addresses reported by the gateway host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GatewayNamespace {
    #[serde(default)]
    pub namespace_ip: Option<String>,
    #[serde(default)]
    pub namespace_ip_v6: Option<String>,
}

pub struct GatewayRegistrar {
    store: StateStore,
    pools: Arc<AddressPoolManager>,
}

impl GatewayRegistrar {
    pub fn new(store: StateStore, pools: Arc<AddressPoolManager>) -> Self {
        Self { store, pools }
    }

    /// Register a gateway and return its job. Deploying a known gateway id
    /// again returns the existing job without allocating.
    pub fn deploy(&self, deployment: &GatewayDeployment) -> DiscoveryResult<Job> {
        let required = [&deployment.gateway_id, &deployment.host, &deployment.cluster_id];
        if required.iter().any(|field| field.trim().is_empty()) {
            return Err(DiscoveryError::InvalidArguments(
                "gateway_id, host and cluster_id are required".to_string(),
            ));
        }
        if deployment.gateway_ipv4.is_none() && deployment.gateway_ipv6.is_none() {
            return Err(DiscoveryError::InvalidArguments(
                "gateway needs gateway_ipv4 or gateway_ipv6".to_string(),
            ));
        }
        if let Some(existing) = self.store.get_gateway(&deployment.gateway_id)? {
            info!(gateway_id = %existing.gateway_id, "gateway already deployed");
            return Ok(gateway_job(&existing));
        }

        let mut gateway = Gateway {
            gateway_id: deployment.gateway_id.clone(),
            host: deployment.host.clone(),
            cluster_id: deployment.cluster_id.clone(),
            gateway_ipv4: deployment.gateway_ipv4.clone(),
            gateway_ipv6: deployment.gateway_ipv6.clone(),
            host_port: deployment.host_port,
            ..Default::default()
        };
        let job_name = gateway.job_name();
        if let Some(taken) = self.store.get_job(&job_name)? {
            return Err(DiscoveryError::InvalidArguments(format!(
                "job {job_name} already belongs to {}",
                taken.system_job_id
            )));
        }

        if gateway.gateway_ipv4.is_some() {
            gateway.instance_ip = Some(self.pools.assign_instance_address(Family::V4)?);
        }
        if gateway.gateway_ipv6.is_some() {
            match self.pools.assign_instance_address(Family::V6) {
                Ok(address) => gateway.instance_ip_v6 = Some(address),
                Err(e) => {
                    self.return_addresses(&gateway);
                    return Err(e.into());
                }
            }
        }

        let job = gateway_job(&gateway);
        let stored = self
            .store
            .put_job(&job)
            .and_then(|_| self.store.put_gateway(&gateway));
        if let Err(e) = stored {
            self.return_addresses(&gateway);
            return Err(e.into());
        }
        info!(
            gateway_id = %gateway.gateway_id,
            %job_name,
            instance_ip = ?gateway.instance_ip,
            instance_ip_v6 = ?gateway.instance_ip_v6,
            "gateway deployed"
        );
        Ok(job)
    }

    /// Record the namespace addresses of a gateway, in its record and its job.
    pub fn update_namespace(
        &self,
        gateway_id: &str,
        namespace: &GatewayNamespace,
    ) -> DiscoveryResult<Gateway> {
        let gateway = self
            .store
            .update_gateway(gateway_id, |gateway| {
                gateway.namespace_ip = namespace.namespace_ip.clone();
                gateway.namespace_ip_v6 = namespace.namespace_ip_v6.clone();
                Ok::<_, DiscoveryError>(gateway.clone())
            })?
            .ok_or_else(|| DiscoveryError::GatewayNotFound(gateway_id.to_string()))?;

        let job_name = gateway.job_name();
        let updated = self.store.update_job(&job_name, |job| {
            if let Some(instance) = job.instance_mut(0) {
                instance.namespace_ip = namespace.namespace_ip.clone();
                instance.namespace_ip_v6 = namespace.namespace_ip_v6.clone();
            }
            Ok::<_, DiscoveryError>(())
        })?;
        if updated.is_none() {
            warn!(%gateway_id, %job_name, "gateway job missing, recreated");
            self.store.put_job(&gateway_job(&gateway))?;
        }
        info!(%gateway_id, "gateway namespace updated");
        Ok(gateway)
    }

    /// Replace the services a gateway exposes.
    pub fn update_services(
        &self,
        gateway_id: &str,
        services: Vec<ExposedService>,
    ) -> DiscoveryResult<Gateway> {
        let count = services.len();
        let gateway = self
            .store
            .update_gateway(gateway_id, |gateway| {
                gateway.services = services;
                Ok::<_, DiscoveryError>(gateway.clone())
            })?
            .ok_or_else(|| DiscoveryError::GatewayNotFound(gateway_id.to_string()))?;
        info!(%gateway_id, services = count, "gateway services updated");
        Ok(gateway)
    }

    pub fn list(&self) -> DiscoveryResult<Vec<Gateway>> {
        Ok(self.store.list_gateways()?)
    }

    fn return_addresses(&self, gateway: &Gateway) {
        let addresses = [
            (gateway.instance_ip.as_deref(), Family::V4),
            (gateway.instance_ip_v6.as_deref(), Family::V6),
        ];
        for (address, family) in addresses {
            let Some(address) = address else { continue };
            if let Err(e) = self.pools.release_instance_address(address, family) {
                warn!(%address, error = %e, "failed to return gateway address");
            }
        }
    }
}

/// The one-instance job through which a gateway is resolved. Gateways have
/// no RR addresses.
fn gateway_job(gateway: &Gateway) -> Job {
    let mut job = Job::new(gateway.job_name(), gateway.gateway_id.clone());
    job.upsert_instance(Instance {
        instance_number: 0,
        instance_ip: gateway.instance_ip.clone(),
        instance_ip_v6: gateway.instance_ip_v6.clone(),
        namespace_ip: gateway.namespace_ip.clone(),
        namespace_ip_v6: gateway.namespace_ip_v6.clone(),
        host_ip: gateway.gateway_ipv4.clone(),
        host_port: gateway.host_port,
        cluster_id: Some(gateway.cluster_id.clone()),
        ..Default::default()
    });
    job.next_instance_number = 1;
    job
}
