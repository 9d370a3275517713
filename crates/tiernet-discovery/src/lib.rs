//! tiernet-discovery — hierarchical service resolution for tiernet.
//!
//! Every tier answers "where does service X live" from its own registry and
//! escalates to its parent on a miss, caching what comes back. Children that
//! asked are recorded as interested parties; interest scopes both the
//! lifetime of cache entries and the fan-out of later changes.
//!
//! # Components
//!
//! - [`ResolutionEngine`]: local-first lookup with escalation.
//! - [`InterestTracker`]: per-job interest sets, cascading removal upward.
//! - [`DeploymentStatusRelay`]: network status climbing the hierarchy,
//!   change notifications fanning out to interested parties.
//! - [`JobRegistrar`]: root-tier registration of jobs and instances.
//! - [`Tier`]: the components of one tier wired together, plus the
//!   dispatcher for requests arriving from children.
//!
//! Parent tiers are reached through [`ParentClient`] (REST over reqwest in
//! production); children are reached through [`ChildNotifier`].

pub mod error;
pub mod gateway;
pub mod inbound;
pub mod interest;
pub mod messages;
pub mod notify;
pub mod parent;
pub mod registrar;
pub mod relay;
pub mod resolution;
pub mod retry;
pub mod tier;

#[cfg(test)]
mod testing;

pub use error::{DiscoveryError, DiscoveryResult};
pub use gateway::{GatewayDeployment, GatewayNamespace, GatewayRegistrar};
pub use inbound::{ChildRequest, TableQuery};
pub use interest::InterestTracker;
pub use messages::{
    ChildMessage, ClusterRegistration, DeployStatusReport, JobUpdate, ResolvedJob,
    SubnetAssignment, UpdateKind,
};
pub use notify::{ChildNotifier, HttpClusterNotifier, Publication, TopicBus};
pub use parent::{CLUSTER_HEADER, HttpParentClient, ParentClient};
pub use registrar::{JobRegistrar, ServiceDescriptor};
pub use relay::{DeploymentStatusRelay, ReportOutcome, UndeployOutcome};
pub use resolution::{Resolution, ResolutionEngine, Selector};
pub use retry::RetryPolicy;
pub use tier::{Tier, TierRole};
