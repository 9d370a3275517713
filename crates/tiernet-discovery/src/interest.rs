//! Tracks who downstream relies on a job's location.
//!
//! Interest sets scope both cache lifetime and change fan-out. At a cluster
//! tier the job record is only a cache of the parent's copy: once its last
//! interested worker leaves, the cluster withdraws its own interest upstream
//! and drops the cache entry. The root tier only does the bookkeeping.

use std::sync::Arc;

use tiernet_state::{InterestChange, PartyId, StateStore};
use tracing::{debug, info, warn};

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::parent::ParentClient;

pub struct InterestTracker {
    store: StateStore,
    parent: Option<Arc<dyn ParentClient>>,
}

impl InterestTracker {
    /// `parent` is `None` at the root tier.
    pub fn new(store: StateStore, parent: Option<Arc<dyn ParentClient>>) -> Self {
        Self { store, parent }
    }

    /// Record `requester` as interested in `job_name`.
    ///
    /// Returns whether the requester was newly added. Empty job names and
    /// unknown jobs record nothing.
    pub fn add_interest(&self, job_name: &str, requester: &str) -> DiscoveryResult<bool> {
        if job_name.is_empty() {
            return Ok(false);
        }
        if requester.is_empty() {
            return Err(DiscoveryError::InvalidArguments(
                "requester id is empty".to_string(),
            ));
        }
        match self.store.add_interest(job_name, requester)? {
            Some(added) => {
                if added {
                    debug!(%job_name, %requester, "interest added");
                }
                Ok(added)
            }
            None => {
                debug!(%job_name, %requester, "interest for unknown job ignored");
                Ok(false)
            }
        }
    }

    /// Withdraw `requester`'s interest in `job_name`.
    ///
    /// At a cluster tier, removing the last interest deletes the cached job
    /// and withdraws this tier's interest at the parent exactly once. A
    /// failing parent is logged; the cache entry is gone either way.
    pub async fn remove_interest(
        &self,
        job_name: &str,
        requester: &str,
    ) -> DiscoveryResult<InterestChange> {
        let is_cache = self.parent.is_some();
        let change = self
            .store
            .remove_interest(job_name, requester, is_cache)?
            .ok_or_else(|| DiscoveryError::JobNotFound(job_name.to_string()))?;

        if change.job_deleted {
            info!(%job_name, "job no longer relevant, cache dropped");
            if let Some(parent) = &self.parent {
                if let Err(e) = parent.remove_interest(job_name).await {
                    warn!(%job_name, error = %e, "failed to withdraw interest upstream");
                }
            }
        } else {
            debug!(%job_name, %requester, remaining = change.remaining, "interest removed");
        }
        Ok(change)
    }

    /// Whether anyone downstream still relies on `job_name`.
    pub fn is_relevant(&self, job_name: &str) -> DiscoveryResult<bool> {
        Ok(!self.store.interested_parties(job_name)?.is_empty())
    }

    pub fn interested_parties(&self, job_name: &str) -> DiscoveryResult<Vec<PartyId>> {
        Ok(self.store.interested_parties(job_name)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingParent, svc1};

    fn cluster_tracker() -> (InterestTracker, StateStore, Arc<RecordingParent>) {
        let store = StateStore::open_in_memory().unwrap();
        store.put_job(&svc1()).unwrap();
        let parent = Arc::new(RecordingParent::default());
        let tracker = InterestTracker::new(store.clone(), Some(parent.clone()));
        (tracker, store, parent)
    }

    #[test]
    fn add_is_idempotent() {
        let (tracker, store, _) = cluster_tracker();
        assert!(tracker.add_interest("svc1", "w1").unwrap());
        assert!(!tracker.add_interest("svc1", "w1").unwrap());
        assert_eq!(store.interested_parties("svc1").unwrap().len(), 1);
        assert!(tracker.is_relevant("svc1").unwrap());
    }

    #[test]
    fn empty_job_name_records_nothing() {
        let (tracker, _, _) = cluster_tracker();
        assert!(!tracker.add_interest("", "w1").unwrap());
        assert!(!tracker.add_interest("ghost", "w1").unwrap());
        assert!(!tracker.is_relevant("ghost").unwrap());
    }

    #[tokio::test]
    async fn last_removal_cascades_once_and_drops_cache() {
        let (tracker, store, parent) = cluster_tracker();
        tracker.add_interest("svc1", "w1").unwrap();
        tracker.add_interest("svc1", "w2").unwrap();

        let change = tracker.remove_interest("svc1", "w1").await.unwrap();
        assert!(!change.job_deleted);
        assert!(parent.removed_interests().is_empty());

        let change = tracker.remove_interest("svc1", "w2").await.unwrap();
        assert!(change.job_deleted);
        assert_eq!(parent.removed_interests(), vec!["svc1".to_string()]);
        assert!(store.get_job("svc1").unwrap().is_none());
        assert!(!tracker.is_relevant("svc1").unwrap());
    }

    #[tokio::test]
    async fn unknown_requester_leaves_cache_alone() {
        let (tracker, store, parent) = cluster_tracker();

        let change = tracker.remove_interest("svc1", "w9").await.unwrap();
        assert!(!change.was_present);
        assert!(!change.job_deleted);
        assert!(parent.removed_interests().is_empty());
        assert!(store.get_job("svc1").unwrap().is_some());
    }

    #[tokio::test]
    async fn failing_parent_still_drops_cache() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_job(&svc1()).unwrap();
        let tracker = InterestTracker::new(
            store.clone(),
            Some(Arc::new(RecordingParent::unreachable())),
        );
        tracker.add_interest("svc1", "w1").unwrap();

        tracker.remove_interest("svc1", "w1").await.unwrap();
        assert!(store.get_job("svc1").unwrap().is_none());
    }

    #[tokio::test]
    async fn root_keeps_authoritative_record() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_job(&svc1()).unwrap();
        let tracker = InterestTracker::new(store.clone(), None);
        tracker.add_interest("svc1", "c1").unwrap();

        let change = tracker.remove_interest("svc1", "c1").await.unwrap();
        assert_eq!(change.remaining, 0);
        assert!(!change.job_deleted);
        assert!(store.get_job("svc1").unwrap().is_some());
    }

    #[tokio::test]
    async fn removal_from_unknown_job() {
        let (tracker, _, _) = cluster_tracker();
        assert!(matches!(
            tracker.remove_interest("ghost", "w1").await,
            Err(DiscoveryError::JobNotFound(_))
        ));
    }
}
