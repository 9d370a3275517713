//! Record types for the tiernet registry.
//!
//! These types represent the persisted state of jobs, their instances and
//! virtual addresses, registered clusters and worker subnets. Fields that
//! are only populated later in an instance's lifecycle are `Option`s rather
//! than empty-string sentinels.

use std::collections::BTreeSet;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Globally unique, dot-segmented job name (`app.app_ns.service.service_ns`).
pub type JobName = String;

/// Identifier of a downstream party (worker node id or cluster id).
pub type PartyId = String;

// ── Job ───────────────────────────────────────────────────────────

/// One named service and everything a tier knows about its location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Job {
    pub job_name: JobName,
    /// Opaque identifier assigned by the owning scheduler.
    #[serde(default)]
    pub system_job_id: String,
    /// Job-level virtual (round-robin) addresses.
    #[serde(default)]
    pub service_ip_list: Vec<ServiceIpEntry>,
    #[serde(default)]
    pub instance_list: Vec<Instance>,
    /// Number the next created instance receives. Only ever grows, so a
    /// number is not handed out twice while the record exists.
    #[serde(default)]
    pub next_instance_number: u32,
    /// Downstream parties relying on this job's location.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub interested_parties: BTreeSet<PartyId>,
}

impl Job {
    /// Create an empty job record.
    pub fn new(job_name: impl Into<String>, system_job_id: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            system_job_id: system_job_id.into(),
            ..Default::default()
        }
    }

    /// Look up an instance by its number.
    pub fn instance(&self, instance_number: u32) -> Option<&Instance> {
        self.instance_list
            .iter()
            .find(|i| i.instance_number == instance_number)
    }

    /// Mutable lookup of an instance by its number.
    pub fn instance_mut(&mut self, instance_number: u32) -> Option<&mut Instance> {
        self.instance_list
            .iter_mut()
            .find(|i| i.instance_number == instance_number)
    }

    /// Reserve a number for a new instance and advance the counter.
    ///
    /// Records written before the counter existed start above the highest
    /// live instance.
    pub fn take_instance_number(&mut self) -> u32 {
        let above_live = self
            .instance_list
            .iter()
            .map(|i| i.instance_number + 1)
            .max()
            .unwrap_or(0);
        let number = self.next_instance_number.max(above_live);
        self.next_instance_number = number + 1;
        number
    }

    /// Insert the instance, replacing any existing one with the same number.
    pub fn upsert_instance(&mut self, instance: Instance) {
        match self.instance_mut(instance.instance_number) {
            Some(existing) => *existing = instance,
            None => self.instance_list.push(instance),
        }
    }

    /// Remove an instance, returning it if it existed.
    pub fn remove_instance(&mut self, instance_number: u32) -> Option<Instance> {
        let pos = self
            .instance_list
            .iter()
            .position(|i| i.instance_number == instance_number)?;
        Some(self.instance_list.remove(pos))
    }

    /// Whether any job-level or instance address equals `address`.
    ///
    /// Both sides are canonicalised, so `fdff:0::1` matches `fdff::1`.
    pub fn has_address(&self, address: &str) -> bool {
        let wanted = canonical_address(address);
        let same = |candidate: &Option<String>| {
            candidate
                .as_deref()
                .is_some_and(|c| canonical_address(c) == wanted)
        };
        self.service_ip_list
            .iter()
            .any(|sip| same(&sip.address) || same(&sip.address_v6))
            || self
                .instance_list
                .iter()
                .any(|i| same(&i.instance_ip) || same(&i.instance_ip_v6))
    }

    /// Copy of this job without the interest bookkeeping, as handed to
    /// other tiers.
    pub fn without_interests(&self) -> Self {
        Self {
            interested_parties: BTreeSet::new(),
            ..self.clone()
        }
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// One replica of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Instance {
    pub instance_number: u32,
    /// Static addresses bound for the instance's whole lifetime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_ip_v6: Option<String>,
    /// Set during network setup on the hosting worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_ip_v6: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
}

impl Instance {
    /// The network fields written by the hosting worker.
    pub fn network(&self) -> NetworkConfig {
        NetworkConfig {
            namespace_ip: self.namespace_ip.clone(),
            namespace_ip_v6: self.namespace_ip_v6.clone(),
            host_ip: self.host_ip.clone(),
            host_port: self.host_port,
        }
    }

    /// Overwrite the worker-assigned network fields.
    pub fn set_network(&mut self, network: &NetworkConfig) {
        self.namespace_ip = network.namespace_ip.clone();
        self.namespace_ip_v6 = network.namespace_ip_v6.clone();
        self.host_ip = network.host_ip.clone();
        self.host_port = network.host_port;
    }

    /// Whether the hosting worker has reported its network setup.
    pub fn is_network_configured(&self) -> bool {
        !self.network().is_empty()
    }

    /// Lifecycle position derived from which address fields are populated.
    pub fn phase(&self) -> InstancePhase {
        if self.is_network_configured() {
            InstancePhase::NetworkConfigured
        } else if self.instance_ip.is_some() || self.instance_ip_v6.is_some() {
            InstancePhase::AddressAssigned
        } else {
            InstancePhase::Unassigned
        }
    }
}

/// Lifecycle of an instance as seen by the network control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePhase {
    Unassigned,
    AddressAssigned,
    NetworkConfigured,
}

/// Worker-assigned network fields of an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NetworkConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_ip_v6: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
}

impl NetworkConfig {
    pub fn is_empty(&self) -> bool {
        self.namespace_ip.is_none()
            && self.namespace_ip_v6.is_none()
            && self.host_ip.is_none()
            && self.host_port.is_none()
    }
}

// ── Service IPs ───────────────────────────────────────────────────

/// Kind of a service address entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpType {
    /// Round-robin virtual address shared by all instances of a job.
    #[serde(rename = "RR")]
    RoundRobin,
    /// Address of one specific instance; only ever produced when formatting
    /// a resolution response.
    #[serde(rename = "instance_ip")]
    InstanceIp,
}

/// One virtual address of a job, in both families.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceIpEntry {
    #[serde(rename = "IpType")]
    pub ip_type: IpType,
    #[serde(rename = "Address", default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(rename = "Address_v6", default, skip_serializing_if = "Option::is_none")]
    pub address_v6: Option<String>,
}

impl ServiceIpEntry {
    /// A round-robin entry.
    pub fn round_robin(address: Option<String>, address_v6: Option<String>) -> Self {
        Self {
            ip_type: IpType::RoundRobin,
            address,
            address_v6,
        }
    }
}

// ── Clusters ──────────────────────────────────────────────────────

/// Reachability status of a registered cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Active,
    Error,
}

/// A child cluster registered at the root tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterInfo {
    pub cluster_id: PartyId,
    pub address: String,
    pub port: u16,
    pub status: ClusterStatus,
}

// ── Worker nodes ──────────────────────────────────────────────────

/// Subnets handed to a worker node by the cluster tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerNode {
    pub node_id: PartyId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_v6: Option<String>,
}

// ── Gateways ──────────────────────────────────────────────────────

/// An edge gateway exposing overlay services to the outside.
///
/// The gateway holds instance addresses from the root's instance pools and
/// is resolvable through its gateway job (see [`Gateway::job_name`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Gateway {
    pub gateway_id: String,
    pub host: String,
    pub cluster_id: String,
    /// Public addresses of the gateway host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_ipv4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_ipv6: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_ip_v6: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_ip_v6: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ExposedService>,
}

impl Gateway {
    /// Name of the job that makes the gateway resolvable.
    pub fn job_name(&self) -> JobName {
        format!("{}.tiernet.gateway.0", self.host)
    }
}

/// A service port published by a gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExposedService {
    pub job_name: JobName,
    #[serde(rename = "microserviceID")]
    pub service_id: String,
    pub exposed_port: u16,
    pub internal_port: u16,
}

/// Canonical textual form of an address: valid IPs are re-rendered (so IPv6
/// shorthand variants compare equal), anything else is returned as-is.
pub fn canonical_address(address: &str) -> String {
    address
        .trim()
        .parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| address.trim().to_string())
}
