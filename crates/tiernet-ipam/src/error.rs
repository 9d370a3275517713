//! Address management error types.

use thiserror::Error;

/// Errors that can occur while allocating or releasing addresses.
#[derive(Debug, Error)]
pub enum IpamError {
    #[error("malformed address: {0}")]
    MalformedAddress(String),

    #[error("address space exhausted for pool {0}")]
    AddressSpaceExhausted(String),

    #[error("address {address} already used by job {owner}")]
    AddressConflict { address: String, owner: String },

    #[error("address {address} is outside pool {pool}")]
    AddressOutOfRange { address: String, pool: String },

    #[error("address {address} was never handed out by pool {pool} (next is {next})")]
    ReleaseAheadOfNext {
        address: String,
        pool: String,
        next: String,
    },

    #[error("address {address} is already on the free list of pool {pool}")]
    AlreadyReleased { address: String, pool: String },

    #[error("address {address} is not a block boundary of pool {pool}")]
    MisalignedAddress { address: String, pool: String },

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("state store error: {0}")]
    State(#[from] tiernet_state::StateError),
}

pub type IpamResult<T> = Result<T, IpamError>;
