//! redb table definitions for the tiernet registry.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Jobs keyed by `job_name` (`app.app_ns.service.service_ns`).
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Address-pool state keyed by `next_<pool>` and `free_<pool>`.
pub const NETCACHE: TableDefinition<&str, &[u8]> = TableDefinition::new("netcache");

/// Registered child clusters keyed by `cluster_id` (root tier).
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");

/// Worker subnets keyed by `node_id` (cluster tier).
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Edge gateways keyed by `gateway_id` (root tier).
pub const GATEWAYS: TableDefinition<&str, &[u8]> = TableDefinition::new("gateways");
