//! Discovery error types.

use thiserror::Error;

/// Errors that can occur while resolving, tracking interest or relaying
/// deployment status.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("instance {instance_number} not found in job {job_name}")]
    InstanceNotFound {
        job_name: String,
        instance_number: u32,
    },

    #[error("gateway not found: {0}")]
    GatewayNotFound(String),

    #[error("parent tier unreachable: {0}")]
    EscalationFailed(String),

    #[error("resolution failed: {0}")]
    ResolutionFailed(String),

    #[error("conflicting network report for instance {instance_number} of job {job_name}")]
    ConflictingReport {
        job_name: String,
        instance_number: u32,
    },

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("child notification failed: {0}")]
    Notify(String),

    #[error("address management error: {0}")]
    Ipam(#[from] tiernet_ipam::IpamError),

    #[error("state store error: {0}")]
    State(#[from] tiernet_state::StateError),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
