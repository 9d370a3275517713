//! Wire payloads exchanged with parent and child tiers.

use serde::{Deserialize, Serialize};
use tiernet_state::{Instance, IpType, Job, NetworkConfig, ServiceIpEntry};

use crate::error::{DiscoveryError, DiscoveryResult};

// ── Resolution results ─────────────────────────────────────────────

/// An instance as handed to a requester: its record plus the job's service
/// addresses followed by its own `instance_ip` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedInstance {
    #[serde(flatten)]
    pub instance: Instance,
    #[serde(default)]
    pub service_ip: Vec<ServiceIpEntry>,
}

/// A job formatted for a resolution response. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResolvedJob {
    pub job_name: String,
    #[serde(default)]
    pub system_job_id: String,
    #[serde(default)]
    pub instance_list: Vec<ResolvedInstance>,
    #[serde(default)]
    pub service_ip_list: Vec<ServiceIpEntry>,
}

impl ResolvedJob {
    /// The "not found anywhere" result: no name, no instances.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.job_name.is_empty()
    }

    /// Denormalise a stored job: every instance gets a copy of the job's
    /// service addresses with its own address appended as `instance_ip`.
    pub fn from_job(job: &Job) -> Self {
        let instance_list = job
            .instance_list
            .iter()
            .map(|instance| {
                let mut service_ip = job.service_ip_list.clone();
                if instance.instance_ip.is_some() || instance.instance_ip_v6.is_some() {
                    service_ip.push(ServiceIpEntry {
                        ip_type: IpType::InstanceIp,
                        address: instance.instance_ip.clone(),
                        address_v6: instance.instance_ip_v6.clone(),
                    });
                }
                ResolvedInstance {
                    instance: instance.clone(),
                    service_ip,
                }
            })
            .collect();
        Self {
            job_name: job.job_name.clone(),
            system_job_id: job.system_job_id.clone(),
            instance_list,
            service_ip_list: job.service_ip_list.clone(),
        }
    }
}

// ── Parent-tier payloads ───────────────────────────────────────────

/// Network status of one instance, as reported upward.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceNetworkStatus {
    pub instance_number: u32,
    #[serde(flatten)]
    pub network: NetworkConfig,
}

/// Body of `POST /api/net/instance/deploy_status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployStatusReport {
    /// The job's `system_job_id`.
    pub job_id: String,
    pub instances: Vec<InstanceNetworkStatus>,
}

/// A pair of worker subnets, as returned by `GET /api/net/subnet`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SubnetAssignment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_addr_v6: Option<String>,
}

/// Body of `POST /api/net/cluster`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterRegistration {
    pub cluster_id: String,
    pub cluster_address: String,
    pub cluster_port: u16,
}

// ── Child-tier payloads ────────────────────────────────────────────

/// Kind of change announced for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UpdateKind {
    Deployment,
    Undeployment,
}

/// A job instance changed. Sent to interested children, and the body of
/// the cluster tier's `POST /api/net/job/update`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobUpdate {
    pub job_name: String,
    pub instance_number: u32,
    #[serde(rename = "type")]
    pub kind: UpdateKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TableQueryResult {
    pub app_name: String,
    pub instance_list: Vec<ResolvedInstance>,
    pub query_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SubnetResult {
    pub address: Option<String>,
    pub address_v6: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterestRemoved {
    pub job_name: String,
}

/// A message for one downstream identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload")]
pub enum ChildMessage {
    #[serde(rename = "tablequery/result")]
    TableQueryResult(TableQueryResult),
    #[serde(rename = "subnetwork/result")]
    SubnetResult(SubnetResult),
    #[serde(rename = "deploy/notify")]
    DeployNotify(JobUpdate),
    #[serde(rename = "interest/removed")]
    InterestRemoved(InterestRemoved),
}

impl ChildMessage {
    /// Topic suffix of this message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ChildMessage::TableQueryResult(_) => "tablequery/result",
            ChildMessage::SubnetResult(_) => "subnetwork/result",
            ChildMessage::DeployNotify(_) => "deploy/notify",
            ChildMessage::InterestRemoved(_) => "interest/removed",
        }
    }

    /// Per-recipient channel the message is published on.
    pub fn topic(&self, recipient: &str) -> String {
        format!("nodes/{recipient}/net/{}", self.kind())
    }

    /// The message body without the kind tag.
    pub fn payload(&self) -> DiscoveryResult<serde_json::Value> {
        let value = match self {
            ChildMessage::TableQueryResult(body) => serde_json::to_value(body),
            ChildMessage::SubnetResult(body) => serde_json::to_value(body),
            ChildMessage::DeployNotify(body) => serde_json::to_value(body),
            ChildMessage::InterestRemoved(body) => serde_json::to_value(body),
        };
        value.map_err(|e| DiscoveryError::Notify(format!("encoding {}: {e}", self.kind())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc1() -> Job {
        let mut job = Job::new("svc1", "sys-1");
        job.service_ip_list.push(ServiceIpEntry::round_robin(
            Some("172.30.0.1".to_string()),
            None,
        ));
        job.upsert_instance(Instance {
            instance_number: 0,
            instance_ip: Some("172.30.0.2".to_string()),
            ..Default::default()
        });
        job
    }

    #[test]
    fn from_job_appends_instance_entry() {
        let job = svc1();
        let resolved = ResolvedJob::from_job(&job);

        let service_ip = &resolved.instance_list[0].service_ip;
        assert_eq!(service_ip.len(), 2);
        assert_eq!(service_ip[0].ip_type, IpType::RoundRobin);
        assert_eq!(service_ip[1].ip_type, IpType::InstanceIp);
        assert_eq!(service_ip[1].address.as_deref(), Some("172.30.0.2"));
        // The job-level list is left untouched.
        assert_eq!(resolved.service_ip_list, job.service_ip_list);
    }

    #[test]
    fn resolved_instance_flattens_record() {
        let resolved = ResolvedJob::from_job(&svc1());
        let json = serde_json::to_value(&resolved.instance_list[0]).unwrap();
        assert_eq!(json["instance_number"], 0);
        assert_eq!(json["instance_ip"], "172.30.0.2");
        assert_eq!(json["service_ip"][1]["IpType"], "instance_ip");
    }

    #[test]
    fn empty_result_has_no_name() {
        let empty = ResolvedJob::empty();
        assert!(empty.is_empty());
        assert!(empty.instance_list.is_empty());
    }

    #[test]
    fn job_update_uses_uppercase_type() {
        let update = JobUpdate {
            job_name: "svc1".to_string(),
            instance_number: 2,
            kind: UpdateKind::Undeployment,
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "UNDEPLOYMENT");
    }

    #[test]
    fn child_message_topic_and_payload() {
        let message = ChildMessage::SubnetResult(SubnetResult {
            address: Some("172.18.0.64".to_string()),
            address_v6: Some("fc00::100".to_string()),
        });
        assert_eq!(message.topic("w1"), "nodes/w1/net/subnetwork/result");
        let payload = message.payload().unwrap();
        assert_eq!(payload["address"], "172.18.0.64");
        assert!(payload.get("kind").is_none());

        let tagged = serde_json::to_value(&message).unwrap();
        assert_eq!(tagged["kind"], "subnetwork/result");
    }

    #[test]
    fn deploy_status_report_flattens_network() {
        let report = DeployStatusReport {
            job_id: "sys-1".to_string(),
            instances: vec![InstanceNetworkStatus {
                instance_number: 0,
                network: NetworkConfig {
                    namespace_ip: Some("172.18.0.3".to_string()),
                    host_ip: Some("192.168.1.4".to_string()),
                    host_port: Some(50103),
                    ..Default::default()
                },
            }],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["instances"][0]["namespace_ip"], "172.18.0.3");
        assert_eq!(json["instances"][0]["host_port"], 50103);
    }
}
