//! One level of the hierarchy with its components wired together.
//!
//! The root tier owns the address pools and the job registrar and has no
//! parent. A cluster tier caches jobs from its parent and serves workers.

use std::sync::Arc;

use tiernet_ipam::{AddressPoolManager, Family};
use tiernet_state::{ClusterInfo, ClusterStatus, Job, StateStore, WorkerNode};
use tracing::{debug, info, warn};

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::gateway::GatewayRegistrar;
use crate::inbound::{self, ChildRequest, SubnetMethod, TableQuery};
use crate::interest::InterestTracker;
use crate::messages::{
    ChildMessage, ClusterRegistration, InterestRemoved, SubnetAssignment, SubnetResult,
    TableQueryResult,
};
use crate::notify::ChildNotifier;
use crate::parent::ParentClient;
use crate::registrar::JobRegistrar;
use crate::relay::DeploymentStatusRelay;
use crate::resolution::{ResolutionEngine, Selector};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierRole {
    Root,
    Cluster { cluster_id: String },
}

pub struct Tier {
    role: TierRole,
    store: StateStore,
    pools: Option<Arc<AddressPoolManager>>,
    parent: Option<Arc<dyn ParentClient>>,
    notifier: Arc<dyn ChildNotifier>,
    resolution: ResolutionEngine,
    interests: InterestTracker,
    relay: Arc<DeploymentStatusRelay>,
    registrar: Option<JobRegistrar>,
    gateways: Option<GatewayRegistrar>,
}

impl Tier {
    /// The root tier: owns every address pool, notifies clusters.
    pub fn root(store: StateStore, notifier: Arc<dyn ChildNotifier>) -> Self {
        let pools = Arc::new(AddressPoolManager::new(store.clone()));
        let relay = Arc::new(DeploymentStatusRelay::new(
            store.clone(),
            Some(pools.clone()),
            None,
            notifier.clone(),
        ));
        let registrar = JobRegistrar::new(store.clone(), pools.clone(), relay.clone());
        let gateways = GatewayRegistrar::new(store.clone(), pools.clone());
        Self {
            role: TierRole::Root,
            resolution: ResolutionEngine::new(store.clone(), None),
            interests: InterestTracker::new(store.clone(), None),
            store,
            pools: Some(pools),
            parent: None,
            notifier,
            relay,
            registrar: Some(registrar),
            gateways: Some(gateways),
        }
    }

    /// A cluster tier below `parent`, notifying its workers.
    pub fn cluster(
        cluster_id: impl Into<String>,
        store: StateStore,
        parent: Arc<dyn ParentClient>,
        notifier: Arc<dyn ChildNotifier>,
    ) -> Self {
        let relay = Arc::new(DeploymentStatusRelay::new(
            store.clone(),
            None,
            Some(parent.clone()),
            notifier.clone(),
        ));
        Self {
            role: TierRole::Cluster {
                cluster_id: cluster_id.into(),
            },
            resolution: ResolutionEngine::new(store.clone(), Some(parent.clone())),
            interests: InterestTracker::new(store.clone(), Some(parent.clone())),
            store,
            pools: None,
            parent: Some(parent),
            notifier,
            relay,
            registrar: None,
            gateways: None,
        }
    }

    pub fn role(&self) -> &TierRole {
        &self.role
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn resolution(&self) -> &ResolutionEngine {
        &self.resolution
    }

    pub fn interests(&self) -> &InterestTracker {
        &self.interests
    }

    pub fn relay(&self) -> &DeploymentStatusRelay {
        &self.relay
    }

    /// Job registration is only possible on the tier owning the pools.
    pub fn registrar(&self) -> DiscoveryResult<&JobRegistrar> {
        self.registrar.as_ref().ok_or_else(|| {
            DiscoveryError::InvalidArguments("jobs are registered at the root tier".to_string())
        })
    }

    pub fn gateways(&self) -> DiscoveryResult<&GatewayRegistrar> {
        self.gateways.as_ref().ok_or_else(|| {
            DiscoveryError::InvalidArguments("gateways are deployed at the root tier".to_string())
        })
    }

    fn parent(&self) -> DiscoveryResult<&Arc<dyn ParentClient>> {
        self.parent
            .as_ref()
            .ok_or_else(|| DiscoveryError::InvalidArguments("root tier has no parent".to_string()))
    }

    // ── Resolution ─────────────────────────────────────────────────

    /// Answer a child's table query. Never fails: anything that goes wrong
    /// is answered with an empty instance list.
    pub async fn table_query(&self, requester: &str, query: &TableQuery) -> TableQueryResult {
        let Some(selector) = query.selector() else {
            warn!(%requester, "table query without name or address");
            return TableQueryResult::default();
        };
        let query_key = selector.key().to_string();

        let job = match self.resolution.resolve(&selector).await {
            Ok(resolution) => resolution.job,
            Err(e) => {
                warn!(%requester, %selector, error = %e, "table query answered empty");
                return TableQueryResult {
                    query_key,
                    ..Default::default()
                };
            }
        };
        if let Err(e) = self.interests.add_interest(&job.job_name, requester) {
            warn!(%requester, job_name = %job.job_name, error = %e, "failed to record interest");
        }
        TableQueryResult {
            app_name: job.job_name,
            instance_list: job.instance_list,
            query_key,
        }
    }

    /// A child tier asks for a job record. The child becomes interested in
    /// the job; the returned copy carries no interest bookkeeping.
    pub async fn child_lookup(&self, child: &str, selector: &Selector) -> DiscoveryResult<Option<Job>> {
        let resolution = self.resolution.resolve(selector).await?;
        if resolution.job.is_empty() {
            return Ok(None);
        }
        let job_name = resolution.job.job_name;
        self.interests.add_interest(&job_name, child)?;
        Ok(self
            .store
            .get_job(&job_name)?
            .map(|job| job.without_interests()))
    }

    // ── Subnets ────────────────────────────────────────────────────

    /// A fresh worker subnet pair, from the local pools or the parent.
    pub async fn request_subnet(&self) -> DiscoveryResult<SubnetAssignment> {
        match &self.pools {
            Some(pools) => {
                let subnet_v4 = pools.assign_subnet(Family::V4)?;
                let subnet_v6 = match pools.assign_subnet(Family::V6) {
                    Ok(subnet_v6) => subnet_v6,
                    Err(e) => {
                        if let Err(release) = pools.release_subnet(&subnet_v4, Family::V4) {
                            warn!(subnet = %subnet_v4, error = %release, "failed to return subnet");
                        }
                        return Err(e.into());
                    }
                };
                Ok(SubnetAssignment {
                    subnet_addr: Some(subnet_v4),
                    subnet_addr_v6: Some(subnet_v6),
                })
            }
            None => self.parent()?.request_subnet().await,
        }
    }

    pub async fn release_subnet(&self, subnet: &SubnetAssignment) -> DiscoveryResult<()> {
        match &self.pools {
            Some(pools) => {
                if let Some(address) = &subnet.subnet_addr {
                    pools.release_subnet(address, Family::V4)?;
                }
                if let Some(address) = &subnet.subnet_addr_v6 {
                    pools.release_subnet(address, Family::V6)?;
                }
                Ok(())
            }
            None => self.parent()?.release_subnet(subnet).await,
        }
    }

    /// Subnet of a worker node, handed out once and remembered.
    async fn node_subnet(&self, node_id: &str) -> DiscoveryResult<SubnetResult> {
        if let Some(node) = self.store.get_node(node_id)? {
            debug!(%node_id, "worker already has a subnet");
            return Ok(SubnetResult {
                address: node.subnet,
                address_v6: node.subnet_v6,
            });
        }
        let subnet = self.request_subnet().await?;
        self.store.put_node(&WorkerNode {
            node_id: node_id.to_string(),
            subnet: subnet.subnet_addr.clone(),
            subnet_v6: subnet.subnet_addr_v6.clone(),
        })?;
        info!(%node_id, subnet = ?subnet.subnet_addr, subnet_v6 = ?subnet.subnet_addr_v6, "worker subnet assigned");
        Ok(SubnetResult {
            address: subnet.subnet_addr,
            address_v6: subnet.subnet_addr_v6,
        })
    }

    async fn release_node_subnet(&self, node_id: &str) -> DiscoveryResult<()> {
        let Some(node) = self.store.get_node(node_id)? else {
            debug!(%node_id, "no subnet to release");
            return Ok(());
        };
        self.release_subnet(&SubnetAssignment {
            subnet_addr: node.subnet,
            subnet_addr_v6: node.subnet_v6,
        })
        .await?;
        self.store.delete_node(node_id)?;
        info!(%node_id, "worker subnet released");
        Ok(())
    }

    // ── Clusters ───────────────────────────────────────────────────

    /// Register (or re-register) a child cluster. Re-registration clears
    /// an error status.
    pub fn register_cluster(&self, registration: &ClusterRegistration) -> DiscoveryResult<ClusterInfo> {
        if self.role != TierRole::Root {
            return Err(DiscoveryError::InvalidArguments(
                "clusters register at the root tier".to_string(),
            ));
        }
        if registration.cluster_id.is_empty() || registration.cluster_address.is_empty() {
            return Err(DiscoveryError::InvalidArguments(
                "cluster_id and cluster_address are required".to_string(),
            ));
        }
        let cluster = ClusterInfo {
            cluster_id: registration.cluster_id.clone(),
            address: registration.cluster_address.clone(),
            port: registration.cluster_port,
            status: ClusterStatus::Active,
        };
        self.store.put_cluster(&cluster)?;
        info!(cluster_id = %cluster.cluster_id, address = %cluster.address, port = cluster.port, "cluster registered");
        Ok(cluster)
    }

    /// Fail unless `cluster_id` is a registered child cluster.
    pub fn require_cluster(&self, cluster_id: &str) -> DiscoveryResult<ClusterInfo> {
        self.store.get_cluster(cluster_id)?.ok_or_else(|| {
            DiscoveryError::InvalidArguments(format!("cluster {cluster_id} is not registered"))
        })
    }

    /// Announce this cluster tier to its parent.
    pub async fn register_with_parent(&self, address: &str, port: u16) -> DiscoveryResult<()> {
        let TierRole::Cluster { cluster_id } = &self.role else {
            return Err(DiscoveryError::InvalidArguments(
                "root tier has no parent".to_string(),
            ));
        };
        self.parent()?
            .register_cluster(&ClusterRegistration {
                cluster_id: cluster_id.clone(),
                cluster_address: address.to_string(),
                cluster_port: port,
            })
            .await?;
        info!(%cluster_id, "registered with parent tier");
        Ok(())
    }

    // ── Child requests ─────────────────────────────────────────────

    /// Map one child request onto the core operations. A reply, if any, is
    /// published to the client and also returned.
    pub async fn handle_child_request(
        &self,
        client: &str,
        request: ChildRequest,
    ) -> DiscoveryResult<Option<ChildMessage>> {
        if client.is_empty() {
            return Err(DiscoveryError::InvalidArguments("client id is empty".to_string()));
        }
        let reply = match request {
            ChildRequest::Deployed(report) => {
                self.relay
                    .report_network_configured(
                        &Selector::Name(report.appname.clone()),
                        report.instance_number,
                        &report.network(),
                        client,
                    )
                    .await?;
                None
            }
            ChildRequest::Undeployed(report) => {
                self.relay
                    .report_undeployment(&Selector::Name(report.appname), report.instance_number)
                    .await?;
                None
            }
            ChildRequest::TableQuery(query) => Some(ChildMessage::TableQueryResult(
                self.table_query(client, &query).await,
            )),
            ChildRequest::Subnet(request) => match request.method {
                SubnetMethod::Get => Some(ChildMessage::SubnetResult(self.node_subnet(client).await?)),
                SubnetMethod::Delete => {
                    self.release_node_subnet(client).await?;
                    None
                }
            },
            ChildRequest::InterestRemove(request) => {
                match self.interests.remove_interest(&request.appname, client).await {
                    Ok(_) | Err(DiscoveryError::JobNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                Some(ChildMessage::InterestRemoved(InterestRemoved {
                    job_name: request.appname,
                }))
            }
        };

        if let Some(message) = &reply {
            if let Err(e) = self.notifier.notify(client, message).await {
                warn!(%client, kind = message.kind(), error = %e, "failed to publish reply");
            }
        }
        Ok(reply)
    }

    /// Entry point for a raw publication on a child topic.
    pub async fn handle_publication(
        &self,
        topic: &str,
        payload: serde_json::Value,
    ) -> DiscoveryResult<Option<ChildMessage>> {
        let (client, request) = inbound::parse_topic(topic, payload)?;
        self.handle_child_request(&client, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbound::{DeployedReport, InterestRemove, SubnetRequest};
    use crate::messages::{JobUpdate, UpdateKind};
    use crate::testing::{ParentCall, RecordingNotifier, RecordingParent, svc1};
    use serde_json::json;
    use tiernet_state::IpType;

    fn cluster_tier() -> (Tier, Arc<RecordingParent>, Arc<RecordingNotifier>) {
        let store = StateStore::open_in_memory().unwrap();
        let parent = Arc::new(RecordingParent::with_job(svc1()));
        let notifier = Arc::new(RecordingNotifier::default());
        let tier = Tier::cluster("c1", store, parent.clone(), notifier.clone());
        (tier, parent, notifier)
    }

    fn root_tier() -> (Tier, Arc<RecordingNotifier>) {
        let store = StateStore::open_in_memory().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        (Tier::root(store, notifier.clone()), notifier)
    }

    #[tokio::test]
    async fn table_query_escalates_caches_and_records_interest() {
        let (tier, parent, notifier) = cluster_tier();

        let reply = tier
            .handle_publication("nodes/w1/net/tablequery/request", json!({"sname": "svc1"}))
            .await
            .unwrap();
        let Some(ChildMessage::TableQueryResult(result)) = reply else {
            panic!("expected a table query result");
        };

        assert_eq!(result.app_name, "svc1");
        assert_eq!(result.query_key, "svc1");
        assert_eq!(result.instance_list.len(), 1);
        let instance = &result.instance_list[0];
        assert_eq!(instance.instance.instance_number, 0);
        assert_eq!(instance.instance.instance_ip.as_deref(), Some("172.30.0.2"));
        assert_eq!(instance.service_ip.len(), 2);
        assert_eq!(instance.service_ip[0].ip_type, IpType::RoundRobin);
        assert_eq!(instance.service_ip[0].address.as_deref(), Some("172.30.0.1"));
        assert_eq!(instance.service_ip[1].ip_type, IpType::InstanceIp);
        assert_eq!(instance.service_ip[1].address.as_deref(), Some("172.30.0.2"));

        let cached = tier.store().get_job("svc1").unwrap().unwrap();
        assert_eq!(cached.interested_parties.len(), 1);
        assert!(cached.interested_parties.contains("w1"));
        assert_eq!(notifier.sent_to("w1").len(), 1);
        assert_eq!(parent.fetch_count(), 1);

        // Served from the cache this time.
        tier.table_query("w2", &TableQuery {
            sname: Some("svc1".to_string()),
            sip: None,
        })
        .await;
        assert_eq!(parent.fetch_count(), 1);
        assert!(tier.interests().is_relevant("svc1").unwrap());
    }

    #[tokio::test]
    async fn unknown_job_is_answered_empty_without_interest() {
        let (tier, _, _) = cluster_tier();
        let result = tier
            .table_query("w1", &TableQuery {
                sname: Some("ghost".to_string()),
                sip: None,
            })
            .await;
        assert!(result.app_name.is_empty());
        assert!(result.instance_list.is_empty());
        assert_eq!(result.query_key, "ghost");
        assert!(tier.store().list_jobs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_parent_still_answers() {
        let store = StateStore::open_in_memory().unwrap();
        let tier = Tier::cluster(
            "c1",
            store,
            Arc::new(RecordingParent::unreachable()),
            Arc::new(RecordingNotifier::default()),
        );
        let result = tier
            .table_query("w1", &TableQuery {
                sname: None,
                sip: Some("172.30.0.2".to_string()),
            })
            .await;
        assert!(result.instance_list.is_empty());
        assert_eq!(result.query_key, "172.30.0.2");
    }

    #[tokio::test]
    async fn worker_deploy_report_climbs_to_parent() {
        let (tier, parent, notifier) = cluster_tier();
        tier.table_query("w1", &TableQuery {
            sname: Some("svc1".to_string()),
            sip: None,
        })
        .await;

        let request = ChildRequest::Deployed(DeployedReport {
            appname: "svc1".to_string(),
            instance_number: 0,
            nsip: Some("10.18.0.5".to_string()),
            nsipv6: None,
            host_ip: Some("192.168.1.10".to_string()),
            host_port: Some(50100),
        });
        assert!(tier.handle_child_request("w7", request).await.unwrap().is_none());

        let reports = parent.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].job_id, "sys-1");
        assert_eq!(reports[0].instances[0].network.host_port, Some(50100));
        assert!(notifier.sent_to("w1").iter().any(|m| matches!(
            m,
            ChildMessage::DeployNotify(JobUpdate { kind: UpdateKind::Deployment, .. })
        )));
    }

    #[tokio::test]
    async fn worker_subnet_is_requested_once_and_released() {
        let (tier, parent, notifier) = cluster_tier();
        let get = || ChildRequest::Subnet(SubnetRequest { method: SubnetMethod::Get });

        let reply = tier.handle_child_request("w1", get()).await.unwrap();
        assert_eq!(
            reply,
            Some(ChildMessage::SubnetResult(SubnetResult {
                address: Some("172.18.0.0".to_string()),
                address_v6: Some("fc00::".to_string()),
            }))
        );
        tier.handle_child_request("w1", get()).await.unwrap();
        let requests = parent
            .calls()
            .into_iter()
            .filter(|c| *c == ParentCall::RequestSubnet)
            .count();
        assert_eq!(requests, 1);
        assert_eq!(notifier.sent_to("w1").len(), 2);

        let delete = ChildRequest::Subnet(SubnetRequest { method: SubnetMethod::Delete });
        tier.handle_child_request("w1", delete).await.unwrap();
        assert!(tier.store().get_node("w1").unwrap().is_none());
        assert!(parent.calls().iter().any(|c| matches!(c, ParentCall::ReleaseSubnet(_))));
    }

    #[tokio::test]
    async fn interest_removal_replies_and_cascades() {
        let (tier, parent, notifier) = cluster_tier();
        tier.table_query("w1", &TableQuery {
            sname: Some("svc1".to_string()),
            sip: None,
        })
        .await;

        let request = ChildRequest::InterestRemove(InterestRemove {
            appname: "svc1".to_string(),
        });
        let reply = tier.handle_child_request("w1", request.clone()).await.unwrap();
        assert!(matches!(reply, Some(ChildMessage::InterestRemoved(_))));
        assert_eq!(parent.removed_interests(), vec!["svc1".to_string()]);
        assert!(tier.store().get_job("svc1").unwrap().is_none());

        // Removing again is answered the same way.
        assert!(tier.handle_child_request("w1", request).await.unwrap().is_some());
        assert_eq!(notifier.sent_to("w1").len(), 2);
    }

    #[tokio::test]
    async fn failed_subnet_request_returns_v4_half() {
        let (tier, _) = root_tier();
        let store = tier.store().clone();
        // The v6 subnet space ends just before fdfe::.
        let limit = tiernet_ipam::codec::parse("fdfe::", Family::V6).unwrap();
        store.set_pool_next("subnet_ip_v6", &limit).unwrap();

        assert!(matches!(
            tier.request_subnet().await,
            Err(DiscoveryError::Ipam(tiernet_ipam::IpamError::AddressSpaceExhausted(_)))
        ));
        assert_eq!(
            store.free_addresses("subnet_ip").unwrap(),
            vec![vec![172, 18, 0, 0]]
        );
    }

    #[tokio::test]
    async fn root_serves_child_lookups_and_subnets() {
        let (tier, _) = root_tier();
        tier.store().put_job(&svc1()).unwrap();

        let job = tier
            .child_lookup("c1", &Selector::Address("172.30.0.1".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.job_name, "svc1");
        assert!(job.interested_parties.is_empty());
        assert_eq!(
            tier.interests().interested_parties("svc1").unwrap(),
            vec!["c1".to_string()]
        );
        assert!(tier
            .child_lookup("c1", &Selector::Name("ghost".to_string()))
            .await
            .unwrap()
            .is_none());

        let first = tier.request_subnet().await.unwrap();
        let second = tier.request_subnet().await.unwrap();
        assert_eq!(first.subnet_addr.as_deref(), Some("172.18.0.0"));
        assert_eq!(second.subnet_addr.as_deref(), Some("172.18.0.64"));
        assert_eq!(second.subnet_addr_v6.as_deref(), Some("fc00::100"));
        tier.release_subnet(&second).await.unwrap();
        assert_eq!(tier.request_subnet().await.unwrap(), second);
    }

    #[tokio::test]
    async fn cluster_registration_is_root_only() {
        let (root, _) = root_tier();
        let registration = ClusterRegistration {
            cluster_id: "c1".to_string(),
            cluster_address: "10.0.0.2".to_string(),
            cluster_port: 10100,
        };
        let info = root.register_cluster(&registration).unwrap();
        assert_eq!(info.status, ClusterStatus::Active);
        assert!(root.require_cluster("c1").is_ok());
        assert!(root.require_cluster("c2").is_err());
        assert!(root.registrar().is_ok());

        let (cluster, parent, _) = cluster_tier();
        assert!(cluster.register_cluster(&registration).is_err());
        assert!(cluster.registrar().is_err());
        cluster.register_with_parent("10.0.0.2", 10100).await.unwrap();
        assert!(parent
            .calls()
            .iter()
            .any(|c| matches!(c, ParentCall::RegisterCluster(r) if r.cluster_id == "c1")));
    }
}
