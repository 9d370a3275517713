//! Parent-tier client: how a cluster tier talks to the tier above it.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tiernet_state::Job;
use tracing::{debug, info, warn};

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::messages::{ClusterRegistration, DeployStatusReport, SubnetAssignment};
use crate::resolution::Selector;
use crate::retry::RetryPolicy;

/// Header identifying the calling child tier on every parent request.
pub const CLUSTER_HEADER: &str = "x-tiernet-cluster";

/// Operations a tier escalates to its parent.
#[async_trait]
pub trait ParentClient: Send + Sync {
    /// Look a job up at the parent. `Ok(None)` means the parent does not
    /// know it either.
    async fn fetch_job(&self, selector: &Selector) -> DiscoveryResult<Option<Job>>;

    async fn report_deploy_status(&self, report: &DeployStatusReport) -> DiscoveryResult<()>;

    async fn request_subnet(&self) -> DiscoveryResult<SubnetAssignment>;

    async fn release_subnet(&self, subnet: &SubnetAssignment) -> DiscoveryResult<()>;

    /// Withdraw this tier's interest in `job_name` at the parent.
    async fn remove_interest(&self, job_name: &str) -> DiscoveryResult<()>;

    async fn register_cluster(&self, registration: &ClusterRegistration) -> DiscoveryResult<()>;
}

/// `{success, data, error}` envelope returned by every tiernet endpoint.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    error: Option<String>,
}

/// HTTP implementation against a parent's `/api/net` routes.
#[derive(Clone)]
pub struct HttpParentClient {
    client: Client,
    base_url: String,
    cluster_id: String,
    retry: RetryPolicy,
}

impl HttpParentClient {
    pub fn new(
        base_url: impl Into<String>,
        cluster_id: impl Into<String>,
        retry: RetryPolicy,
    ) -> DiscoveryResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| DiscoveryError::InvalidArguments(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cluster_id: cluster_id.into(),
            retry,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/net{path}", self.base_url)
    }

    async fn send(
        &self,
        build: impl Fn(&Client) -> reqwest::RequestBuilder,
    ) -> DiscoveryResult<Response> {
        self.retry
            .send(|| build(&self.client).header(CLUSTER_HEADER, &self.cluster_id))
            .await
            .map_err(|e| {
                warn!(error = %e, "parent tier unreachable");
                DiscoveryError::EscalationFailed(e.to_string())
            })
    }

    /// Decode an envelope, turning non-success statuses into errors.
    async fn decode<T: DeserializeOwned>(response: Response) -> DiscoveryResult<Option<T>> {
        let status = response.status();
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| DiscoveryError::EscalationFailed(format!("decoding {status}: {e}")))?;
        if status.is_success() {
            Ok(envelope.data)
        } else {
            Err(DiscoveryError::EscalationFailed(format!(
                "parent returned {status}: {}",
                envelope.error.unwrap_or_default()
            )))
        }
    }

    async fn expect_success(response: Response) -> DiscoveryResult<()> {
        Self::decode::<serde_json::Value>(response).await.map(|_| ())
    }
}

#[async_trait]
impl ParentClient for HttpParentClient {
    async fn fetch_job(&self, selector: &Selector) -> DiscoveryResult<Option<Job>> {
        let url = match selector {
            Selector::Name(name) => self.url(&format!("/service/{name}/instances")),
            Selector::Address(address) => self.url(&format!("/service/ip/{address}/instances")),
        };
        let response = self.send(|client| client.get(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(%selector, "parent does not know the job");
            return Ok(None);
        }
        let job = Self::decode::<Job>(response).await?;
        debug!(%selector, found = job.is_some(), "job fetched from parent");
        Ok(job)
    }

    async fn report_deploy_status(&self, report: &DeployStatusReport) -> DiscoveryResult<()> {
        let url = self.url("/instance/deploy_status");
        let response = self.send(|client| client.post(&url).json(report)).await?;
        Self::expect_success(response).await?;
        debug!(job_id = %report.job_id, instances = report.instances.len(), "deploy status reported upward");
        Ok(())
    }

    async fn request_subnet(&self) -> DiscoveryResult<SubnetAssignment> {
        let url = self.url("/subnet");
        let response = self.send(|client| client.get(&url)).await?;
        Self::decode::<SubnetAssignment>(response)
            .await?
            .ok_or_else(|| DiscoveryError::EscalationFailed("parent returned no subnet".to_string()))
    }

    async fn release_subnet(&self, subnet: &SubnetAssignment) -> DiscoveryResult<()> {
        let url = self.url("/subnet");
        let response = self.send(|client| client.delete(&url).json(subnet)).await?;
        Self::expect_success(response).await
    }

    async fn remove_interest(&self, job_name: &str) -> DiscoveryResult<()> {
        let url = self.url(&format!("/interest/{job_name}"));
        let response = self.send(|client| client.delete(&url)).await?;
        Self::expect_success(response).await?;
        debug!(%job_name, "interest withdrawn at parent");
        Ok(())
    }

    async fn register_cluster(&self, registration: &ClusterRegistration) -> DiscoveryResult<()> {
        let url = self.url("/cluster");
        let response = self.send(|client| client.post(&url).json(registration)).await?;
        Self::expect_success(response).await?;
        info!(cluster_id = %registration.cluster_id, "registered with parent tier");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_base_and_prefix() {
        let client =
            HttpParentClient::new("http://root.local:10099/", "c1", RetryPolicy::default()).unwrap();
        assert_eq!(
            client.url("/service/svc1/instances"),
            "http://root.local:10099/api/net/service/svc1/instances"
        );
    }

    #[test]
    fn envelope_fields_are_optional() {
        #[derive(Debug, Deserialize)]
        struct Ack {
            accepted: bool,
        }

        let failed: Envelope<Ack> =
            serde_json::from_str(r#"{"success":false,"error":"job not found"}"#).unwrap();
        assert!(failed.data.is_none());
        assert_eq!(failed.error.as_deref(), Some("job not found"));

        let ok: Envelope<Ack> =
            serde_json::from_str(r#"{"success":true,"data":{"accepted":true}}"#).unwrap();
        assert!(ok.data.unwrap().accepted);
        assert!(ok.error.is_none());
    }

    #[tokio::test]
    async fn unreachable_parent_is_escalation_failure() {
        let client = HttpParentClient::new(
            "http://127.0.0.1:9",
            "c1",
            RetryPolicy::new(1).with_timeout(200),
        )
        .unwrap();
        let result = client.fetch_job(&Selector::Name("svc1".to_string())).await;
        assert!(matches!(result, Err(DiscoveryError::EscalationFailed(_))));
    }
}
