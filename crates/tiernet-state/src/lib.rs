//! tiernet-state — the registry every tier keeps for jobs and addresses.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for jobs (with their instances and interested parties), the
//! address-pool counters and free lists, registered clusters, and worker
//! subnets.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Jobs are keyed by their dot-segmented `job_name`; pool state is keyed by
//! `next_<pool>` / `free_<pool>`.
//!
//! Operations that must be atomic read-modify-write sequences (interest
//! add/remove, free-list pop, cache merges) run inside a single redb write
//! transaction, so concurrent callers never observe a half-applied update.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{InterestChange, StateStore};
pub use types::*;
