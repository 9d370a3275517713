//! Recording fakes shared by the unit tests.

use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;
use tiernet_state::{Instance, Job, ServiceIpEntry};

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::messages::{ChildMessage, ClusterRegistration, DeployStatusReport, SubnetAssignment};
use crate::notify::ChildNotifier;
use crate::parent::ParentClient;
use crate::resolution::Selector;

/// The `svc1` job of the end-to-end scenario.
pub fn svc1() -> Job {
    let mut job = Job::new("svc1", "sys-1");
    job.service_ip_list.push(ServiceIpEntry::round_robin(
        Some("172.30.0.1".to_string()),
        None,
    ));
    job.upsert_instance(Instance {
        instance_number: 0,
        instance_ip: Some("172.30.0.2".to_string()),
        cluster_id: Some("c1".to_string()),
        ..Default::default()
    });
    job
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParentCall {
    FetchJob(Selector),
    ReportDeployStatus(DeployStatusReport),
    RequestSubnet,
    ReleaseSubnet(SubnetAssignment),
    RemoveInterest(String),
    RegisterCluster(ClusterRegistration),
}

/// Parent tier that knows a fixed set of jobs and records every call.
#[derive(Default)]
pub struct RecordingParent {
    jobs: Vec<Job>,
    unreachable: bool,
    calls: Mutex<Vec<ParentCall>>,
}

impl RecordingParent {
    pub fn with_job(job: Job) -> Self {
        Self {
            jobs: vec![job],
            ..Default::default()
        }
    }

    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Default::default()
        }
    }

    fn record(&self, call: ParentCall) -> DiscoveryResult<()> {
        self.calls.lock().unwrap().push(call);
        if self.unreachable {
            Err(DiscoveryError::EscalationFailed("connection refused".to_string()))
        } else {
            Ok(())
        }
    }

    pub fn calls(&self) -> Vec<ParentCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ParentCall::FetchJob(_)))
            .count()
    }

    pub fn removed_interests(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ParentCall::RemoveInterest(job_name) => Some(job_name),
                _ => None,
            })
            .collect()
    }

    pub fn reports(&self) -> Vec<DeployStatusReport> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ParentCall::ReportDeployStatus(report) => Some(report),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ParentClient for RecordingParent {
    async fn fetch_job(&self, selector: &Selector) -> DiscoveryResult<Option<Job>> {
        self.record(ParentCall::FetchJob(selector.clone()))?;
        Ok(self
            .jobs
            .iter()
            .find(|job| match selector {
                Selector::Name(name) => &job.job_name == name,
                Selector::Address(address) => job.has_address(address),
            })
            .cloned())
    }

    async fn report_deploy_status(&self, report: &DeployStatusReport) -> DiscoveryResult<()> {
        self.record(ParentCall::ReportDeployStatus(report.clone()))
    }

    async fn request_subnet(&self) -> DiscoveryResult<SubnetAssignment> {
        self.record(ParentCall::RequestSubnet)?;
        Ok(SubnetAssignment {
            subnet_addr: Some("172.18.0.0".to_string()),
            subnet_addr_v6: Some("fc00::".to_string()),
        })
    }

    async fn release_subnet(&self, subnet: &SubnetAssignment) -> DiscoveryResult<()> {
        self.record(ParentCall::ReleaseSubnet(subnet.clone()))
    }

    async fn remove_interest(&self, job_name: &str) -> DiscoveryResult<()> {
        self.record(ParentCall::RemoveInterest(job_name.to_string()))
    }

    async fn register_cluster(&self, registration: &ClusterRegistration) -> DiscoveryResult<()> {
        self.record(ParentCall::RegisterCluster(registration.clone()))
    }
}

/// Notifier that records deliveries and fails for chosen recipients.
#[derive(Default)]
pub struct RecordingNotifier {
    failing: BTreeSet<String>,
    sent: Mutex<Vec<(String, ChildMessage)>>,
}

impl RecordingNotifier {
    pub fn failing_for(recipients: &[&str]) -> Self {
        Self {
            failing: recipients.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<(String, ChildMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, recipient: &str) -> Vec<ChildMessage> {
        self.sent()
            .into_iter()
            .filter(|(to, _)| to == recipient)
            .map(|(_, message)| message)
            .collect()
    }
}

#[async_trait]
impl ChildNotifier for RecordingNotifier {
    async fn notify(&self, recipient: &str, message: &ChildMessage) -> DiscoveryResult<()> {
        if self.failing.contains(recipient) {
            return Err(DiscoveryError::Notify(format!("{recipient} unreachable")));
        }
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), message.clone()));
        Ok(())
    }
}
