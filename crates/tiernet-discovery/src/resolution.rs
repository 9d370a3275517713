//! Answers "where does service X live", local cache first.
//!
//! A lookup is answered from the local registry when possible. On a miss
//! the parent tier is asked, and a found job is merged into the local
//! registry as a cache entry so the next lookup stays local.

use std::fmt;
use std::sync::Arc;

use tiernet_state::{Job, StateStore};
use tracing::{debug, warn};

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::messages::ResolvedJob;
use crate::parent::ParentClient;

/// What a requester asks for: a job name or one of its addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Name(String),
    Address(String),
}

impl Selector {
    /// Build a selector from optional request fields. An address wins over
    /// a name; empty strings count as absent.
    pub fn from_parts(name: Option<&str>, address: Option<&str>) -> Option<Self> {
        fn present(s: Option<&str>) -> Option<&str> {
            s.map(str::trim).filter(|s| !s.is_empty())
        }
        match (present(name), present(address)) {
            (_, Some(address)) => Some(Selector::Address(address.to_string())),
            (Some(name), None) => Some(Selector::Name(name.to_string())),
            (None, None) => None,
        }
    }

    /// The raw name or address.
    pub fn key(&self) -> &str {
        match self {
            Selector::Name(name) => name,
            Selector::Address(address) => address,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Name(name) => write!(f, "name:{name}"),
            Selector::Address(address) => write!(f, "address:{address}"),
        }
    }
}

/// Outcome of a resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub job: ResolvedJob,
    pub found_locally: bool,
}

pub struct ResolutionEngine {
    store: StateStore,
    parent: Option<Arc<dyn ParentClient>>,
}

impl ResolutionEngine {
    /// `parent` is `None` at the root tier, which never escalates.
    pub fn new(store: StateStore, parent: Option<Arc<dyn ParentClient>>) -> Self {
        Self { store, parent }
    }

    /// Look the selector up in the local registry only.
    pub fn lookup_local(&self, selector: &Selector) -> DiscoveryResult<Option<Job>> {
        let job = match selector {
            Selector::Name(name) => self.store.get_job(name)?,
            Selector::Address(address) => self.store.find_job_by_address(address)?,
        };
        Ok(job)
    }

    /// Resolve locally, escalating to the parent tier on a miss.
    ///
    /// A job unknown everywhere is an empty result, not an error. A parent
    /// that cannot be reached yields `ResolutionFailed` and nothing is
    /// cached.
    pub async fn resolve(&self, selector: &Selector) -> DiscoveryResult<Resolution> {
        if let Some(job) = self.lookup_local(selector)? {
            debug!(%selector, job_name = %job.job_name, "resolved locally");
            return Ok(Resolution {
                job: ResolvedJob::from_job(&job),
                found_locally: true,
            });
        }

        let Some(parent) = &self.parent else {
            debug!(%selector, "unknown job at root tier");
            return Ok(Resolution {
                job: ResolvedJob::empty(),
                found_locally: false,
            });
        };

        let fetched = parent.fetch_job(selector).await.map_err(|e| {
            warn!(%selector, error = %e, "escalation failed");
            DiscoveryError::ResolutionFailed(e.to_string())
        })?;

        let job = match fetched {
            Some(job) if !job.job_name.is_empty() => {
                let cached = self.store.merge_job(&job)?;
                debug!(%selector, job_name = %cached.job_name, "resolved by parent, cached");
                ResolvedJob::from_job(&cached)
            }
            _ => {
                debug!(%selector, "unknown job at parent tier");
                ResolvedJob::empty()
            }
        };
        Ok(Resolution {
            job,
            found_locally: false,
        })
    }
}
