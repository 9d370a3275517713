//! Delivering messages to downstream identities.
//!
//! The cluster tier publishes to its workers on per-worker topics through a
//! [`TopicBus`]; the root tier calls its clusters' REST callback through an
//! [`HttpClusterNotifier`].

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tiernet_ipam::codec;
use tiernet_state::{ClusterStatus, StateStore};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::messages::ChildMessage;
use crate::retry::RetryPolicy;

/// Delivers a message to one downstream identity.
#[async_trait]
pub trait ChildNotifier: Send + Sync {
    async fn notify(&self, recipient: &str, message: &ChildMessage) -> DiscoveryResult<()>;
}

// ── Topic bus ──────────────────────────────────────────────────────

/// One message published on a topic.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Publication {
    pub topic: String,
    pub payload: serde_json::Value,
}

/// In-process publish/subscribe bus standing in for the broker connection.
///
/// Publishing never blocks; subscribers that fall behind lose the oldest
/// publications, and publishing with no subscriber drops the message.
#[derive(Clone)]
pub struct TopicBus {
    sender: broadcast::Sender<Publication>,
}

impl TopicBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Publication> {
        self.sender.subscribe()
    }

    /// Publish and return the number of subscribers reached.
    pub fn publish(&self, topic: impl Into<String>, payload: serde_json::Value) -> usize {
        let publication = Publication {
            topic: topic.into(),
            payload,
        };
        let topic = publication.topic.clone();
        match self.sender.send(publication) {
            Ok(receivers) => {
                debug!(%topic, receivers, "published");
                receivers
            }
            Err(_) => {
                debug!(%topic, "published with no subscriber");
                0
            }
        }
    }
}

impl Default for TopicBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ChildNotifier for TopicBus {
    async fn notify(&self, recipient: &str, message: &ChildMessage) -> DiscoveryResult<()> {
        self.publish(message.topic(recipient), message.payload()?);
        Ok(())
    }
}

// ── HTTP cluster notifier ──────────────────────────────────────────

/// Root-tier notifier calling `POST /api/net/job/update` on each cluster.
///
/// A cluster whose callback fails after the retry budget is marked `error`
/// and skipped until it registers again.
pub struct HttpClusterNotifier {
    client: Client,
    store: StateStore,
    retry: RetryPolicy,
}

impl HttpClusterNotifier {
    pub fn new(store: StateStore, retry: RetryPolicy) -> DiscoveryResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| DiscoveryError::InvalidArguments(format!("http client: {e}")))?;
        Ok(Self {
            client,
            store,
            retry,
        })
    }

    fn mark_error(&self, cluster_id: &str) {
        if let Err(e) = self.store.set_cluster_status(cluster_id, ClusterStatus::Error) {
            warn!(%cluster_id, error = %e, "failed to mark cluster as error");
        }
    }
}

#[async_trait]
impl ChildNotifier for HttpClusterNotifier {
    async fn notify(&self, recipient: &str, message: &ChildMessage) -> DiscoveryResult<()> {
        let ChildMessage::DeployNotify(update) = message else {
            debug!(cluster_id = %recipient, kind = message.kind(), "message kind not delivered to clusters");
            return Ok(());
        };
        let cluster = self
            .store
            .get_cluster(recipient)?
            .ok_or_else(|| DiscoveryError::Notify(format!("cluster {recipient} is not registered")))?;
        if cluster.status == ClusterStatus::Error {
            debug!(cluster_id = %recipient, "cluster in error state, skipped");
            return Ok(());
        }

        let url = format!(
            "http://{}:{}/api/net/job/update",
            codec::url_host(&cluster.address),
            cluster.port
        );
        match self.retry.send(|| self.client.post(&url).json(update)).await {
            Ok(response) if response.status().is_success() => {
                debug!(cluster_id = %recipient, job_name = %update.job_name, "cluster notified");
                Ok(())
            }
            Ok(response) => {
                self.mark_error(recipient);
                Err(DiscoveryError::Notify(format!(
                    "cluster {recipient} answered {}",
                    response.status()
                )))
            }
            Err(e) => {
                self.mark_error(recipient);
                Err(DiscoveryError::Notify(format!("cluster {recipient}: {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{InterestRemoved, JobUpdate, UpdateKind};
    use tiernet_state::ClusterInfo;

    #[tokio::test]
    async fn bus_publishes_on_recipient_topic() {
        let bus = TopicBus::new(8);
        let mut rx = bus.subscribe();

        let message = ChildMessage::InterestRemoved(InterestRemoved {
            job_name: "svc1".to_string(),
        });
        bus.notify("w1", &message).await.unwrap();

        let publication = rx.recv().await.unwrap();
        assert_eq!(publication.topic, "nodes/w1/net/interest/removed");
        assert_eq!(publication.payload["job_name"], "svc1");
    }

    #[tokio::test]
    async fn bus_without_subscribers_does_not_fail() {
        let bus = TopicBus::default();
        let message = ChildMessage::InterestRemoved(InterestRemoved {
            job_name: "svc1".to_string(),
        });
        assert!(bus.notify("w1", &message).await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_cluster_is_marked_error() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_cluster(&ClusterInfo {
                cluster_id: "c1".to_string(),
                address: "127.0.0.1".to_string(),
                port: 9,
                status: ClusterStatus::Active,
            })
            .unwrap();
        let notifier =
            HttpClusterNotifier::new(store.clone(), RetryPolicy::new(1).with_timeout(200)).unwrap();

        let message = ChildMessage::DeployNotify(JobUpdate {
            job_name: "svc1".to_string(),
            instance_number: 0,
            kind: UpdateKind::Deployment,
        });
        assert!(matches!(
            notifier.notify("c1", &message).await,
            Err(DiscoveryError::Notify(_))
        ));
        assert_eq!(
            store.get_cluster("c1").unwrap().unwrap().status,
            ClusterStatus::Error
        );

        // Clusters in error are skipped quietly.
        assert!(notifier.notify("c1", &message).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_cluster_is_an_error() {
        let store = StateStore::open_in_memory().unwrap();
        let notifier = HttpClusterNotifier::new(store, RetryPolicy::new(1)).unwrap();
        let message = ChildMessage::DeployNotify(JobUpdate {
            job_name: "svc1".to_string(),
            instance_number: 0,
            kind: UpdateKind::Deployment,
        });
        assert!(notifier.notify("nope", &message).await.is_err());
    }
}
