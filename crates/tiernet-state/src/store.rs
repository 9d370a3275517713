//! redb-backed registry for a tiernet tier.
//!
//! Provides typed CRUD over jobs, address-pool state, clusters and worker
//! nodes. All values are JSON-serialized into redb's `&[u8]` value columns.
//! The store supports both on-disk and in-memory backends (the latter for
//! testing).
//!
//! redb serialises write transactions, so every method that reads, mutates
//! and writes back inside one write transaction is atomic with respect to
//! concurrent callers.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn next_key(pool: &str) -> String {
    format!("next_{pool}")
}

fn free_key(pool: &str) -> String {
    format!("free_{pool}")
}

/// Result of an interest removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterestChange {
    /// Whether the party was in the set before the call.
    pub was_present: bool,
    /// Number of parties left in the set.
    pub remaining: usize,
    /// Whether the job record was deleted because the set became empty.
    pub job_deleted: bool,
}

/// Thread-safe registry backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.open_table(NETCACHE).map_err(map_err!(Table))?;
        txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(GATEWAYS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic record access ──────────────────────────────────────

    fn get_record<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|guard| decode(guard.value()))
            .transpose()
    }

    fn put_record<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let value = encode(value)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Read-modify-write of one record in a single write transaction.
    /// Returns `Ok(None)` when the key is absent; nothing is written if
    /// `edit` fails.
    fn update_record<T, R, E>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        edit: impl FnOnce(&mut T) -> Result<R, E>,
    ) -> Result<Option<R>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<StateError>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            let current = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| decode::<T>(guard.value()))
                .transpose()?;
            let Some(mut record) = current else {
                return Ok(None);
            };
            let outcome = edit(&mut record)?;
            let value = encode(&record)?;
            table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
            outcome
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(Some(outcome))
    }

    fn list_records<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    fn delete_record(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Insert or replace a job.
    pub fn put_job(&self, job: &Job) -> StateResult<()> {
        self.put_record(JOBS, &job.job_name, job)?;
        debug!(job_name = %job.job_name, "job stored");
        Ok(())
    }

    /// Get a job by name.
    pub fn get_job(&self, job_name: &str) -> StateResult<Option<Job>> {
        self.get_record(JOBS, job_name)
    }

    /// List all jobs.
    pub fn list_jobs(&self) -> StateResult<Vec<Job>> {
        self.list_records(JOBS)
    }

    /// Find the job owning `address`, either as a service (RR) address or
    /// as an instance address, in either family.
    pub fn find_job_by_address(&self, address: &str) -> StateResult<Option<Job>> {
        Ok(self
            .list_jobs()?
            .into_iter()
            .find(|job| job.has_address(address)))
    }

    /// Find a job by the scheduler-assigned identifier.
    pub fn find_job_by_system_id(&self, system_job_id: &str) -> StateResult<Option<Job>> {
        Ok(self
            .list_jobs()?
            .into_iter()
            .find(|job| job.system_job_id == system_job_id))
    }

    /// Delete a job by name. Returns true if it existed.
    pub fn delete_job(&self, job_name: &str) -> StateResult<bool> {
        let existed = self.delete_record(JOBS, job_name)?;
        debug!(%job_name, existed, "job deleted");
        Ok(existed)
    }

    /// Atomically read, modify and write back a job.
    ///
    /// Returns `Ok(None)` when the job does not exist. If `edit` fails, the
    /// transaction is dropped and nothing is written.
    pub fn update_job<T, E>(
        &self,
        job_name: &str,
        edit: impl FnOnce(&mut Job) -> Result<T, E>,
    ) -> Result<Option<T>, E>
    where
        E: From<StateError>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let current = table
                .get(job_name)
                .map_err(map_err!(Read))?
                .map(|guard| decode::<Job>(guard.value()))
                .transpose()?;
            let Some(mut job) = current else {
                return Ok(None);
            };
            let outcome = edit(&mut job)?;
            let value = encode(&job)?;
            table
                .insert(job_name, value.as_slice())
                .map_err(map_err!(Write))?;
            outcome
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%job_name, "job updated");
        Ok(Some(outcome))
    }

    /// Merge a job received from another tier into the local copy.
    ///
    /// A new job is inserted with an empty interest set. An existing job
    /// keeps its interest set, gets its service addresses replaced and its
    /// instances upserted by `instance_number` (a locally known `worker_id`
    /// survives). Returns the stored record.
    pub fn merge_job(&self, incoming: &Job) -> StateResult<Job> {
        let key = incoming.job_name.as_str();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let merged = {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let current = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| decode::<Job>(guard.value()))
                .transpose()?;
            let merged = match current {
                Some(mut job) => {
                    job.system_job_id = incoming.system_job_id.clone();
                    job.service_ip_list = incoming.service_ip_list.clone();
                    for instance in &incoming.instance_list {
                        let mut instance = instance.clone();
                        // The hosting worker is only known below the parent.
                        if instance.worker_id.is_none() {
                            instance.worker_id = job
                                .instance(instance.instance_number)
                                .and_then(|i| i.worker_id.clone());
                        }
                        job.upsert_instance(instance);
                    }
                    job
                }
                None => incoming.without_interests(),
            };
            let value = encode(&merged)?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
            merged
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(job_name = %key, instances = merged.instance_list.len(), "job merged");
        Ok(merged)
    }

    // ── Interests ──────────────────────────────────────────────────

    /// Add `party` to the job's interest set.
    ///
    /// Returns `None` if the job does not exist, otherwise whether the
    /// party was newly added.
    pub fn add_interest(&self, job_name: &str, party: &str) -> StateResult<Option<bool>> {
        self.update_job(job_name, |job| {
            Ok::<_, StateError>(job.interested_parties.insert(party.to_string()))
        })
    }

    /// Remove `party` from the job's interest set.
    ///
    /// With `delete_when_empty`, the job record is deleted in the same
    /// transaction once the last party leaves. Removing a party that is not
    /// in the set changes nothing. Returns `None` if the job does not exist.
    pub fn remove_interest(
        &self,
        job_name: &str,
        party: &str,
        delete_when_empty: bool,
    ) -> StateResult<Option<InterestChange>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let change = {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let current = table
                .get(job_name)
                .map_err(map_err!(Read))?
                .map(|guard| decode::<Job>(guard.value()))
                .transpose()?;
            let Some(mut job) = current else {
                return Ok(None);
            };
            let was_present = job.interested_parties.remove(party);
            let remaining = job.interested_parties.len();
            // A party that was never interested cannot make the job irrelevant.
            let job_deleted = was_present && delete_when_empty && remaining == 0;
            if job_deleted {
                table.remove(job_name).map_err(map_err!(Write))?;
            } else if was_present {
                let value = encode(&job)?;
                table
                    .insert(job_name, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            InterestChange {
                was_present,
                remaining,
                job_deleted,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%job_name, %party, remaining = change.remaining, deleted = change.job_deleted, "interest removed");
        Ok(Some(change))
    }

    /// Parties currently interested in a job (empty if the job is unknown).
    pub fn interested_parties(&self, job_name: &str) -> StateResult<Vec<PartyId>> {
        Ok(self
            .get_job(job_name)?
            .map(|job| job.interested_parties.into_iter().collect())
            .unwrap_or_default())
    }

    // ── Address pools ──────────────────────────────────────────────

    /// The persisted `next` vector of a pool, if initialised.
    pub fn pool_next(&self, pool: &str) -> StateResult<Option<Vec<u8>>> {
        self.get_record(NETCACHE, &next_key(pool))
    }

    /// Persist a pool's `next` vector.
    pub fn set_pool_next(&self, pool: &str, next: &[u8]) -> StateResult<()> {
        self.put_record(NETCACHE, &next_key(pool), &next)?;
        debug!(%pool, ?next, "pool next advanced");
        Ok(())
    }

    /// Pop the most recently released address of a pool.
    pub fn pop_free_address(&self, pool: &str) -> StateResult<Option<Vec<u8>>> {
        let key = free_key(pool);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let popped = {
            let mut table = txn.open_table(NETCACHE).map_err(map_err!(Table))?;
            let mut free: Vec<Vec<u8>> = table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| decode(guard.value()))
                .transpose()?
                .unwrap_or_default();
            let popped = free.pop();
            if popped.is_some() {
                let value = encode(&free)?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            popped
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(popped)
    }

    /// Append an address to a pool's free list.
    pub fn push_free_address(&self, pool: &str, address: &[u8]) -> StateResult<()> {
        let key = free_key(pool);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NETCACHE).map_err(map_err!(Table))?;
            let mut free: Vec<Vec<u8>> = table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| decode(guard.value()))
                .transpose()?
                .unwrap_or_default();
            free.push(address.to_vec());
            let value = encode(&free)?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%pool, ?address, "address returned to free list");
        Ok(())
    }

    /// All addresses currently on a pool's free list, oldest first.
    pub fn free_addresses(&self, pool: &str) -> StateResult<Vec<Vec<u8>>> {
        Ok(self
            .get_record::<Vec<Vec<u8>>>(NETCACHE, &free_key(pool))?
            .unwrap_or_default())
    }

    // ── Clusters ───────────────────────────────────────────────────

    /// Insert or update a registered cluster.
    pub fn put_cluster(&self, cluster: &ClusterInfo) -> StateResult<()> {
        self.put_record(CLUSTERS, &cluster.cluster_id, cluster)
    }

    /// Get a cluster by ID.
    pub fn get_cluster(&self, cluster_id: &str) -> StateResult<Option<ClusterInfo>> {
        self.get_record(CLUSTERS, cluster_id)
    }

    /// List all registered clusters.
    pub fn list_clusters(&self) -> StateResult<Vec<ClusterInfo>> {
        self.list_records(CLUSTERS)
    }

    /// Change a cluster's status. Returns false if the cluster is unknown.
    pub fn set_cluster_status(&self, cluster_id: &str, status: ClusterStatus) -> StateResult<bool> {
        let changed = self
            .update_record(CLUSTERS, cluster_id, |cluster: &mut ClusterInfo| {
                cluster.status = status;
                Ok::<_, StateError>(())
            })?
            .is_some();
        if changed {
            debug!(%cluster_id, ?status, "cluster status changed");
        }
        Ok(changed)
    }

    // ── Worker nodes ───────────────────────────────────────────────

    /// Insert or update a worker node's subnets.
    pub fn put_node(&self, node: &WorkerNode) -> StateResult<()> {
        self.put_record(NODES, &node.node_id, node)
    }

    /// Get a worker node by ID.
    pub fn get_node(&self, node_id: &str) -> StateResult<Option<WorkerNode>> {
        self.get_record(NODES, node_id)
    }

    /// Delete a worker node. Returns true if it existed.
    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        self.delete_record(NODES, node_id)
    }

    // ── Gateways ───────────────────────────────────────────────────

    pub fn put_gateway(&self, gateway: &Gateway) -> StateResult<()> {
        self.put_record(GATEWAYS, &gateway.gateway_id, gateway)
    }

    pub fn get_gateway(&self, gateway_id: &str) -> StateResult<Option<Gateway>> {
        self.get_record(GATEWAYS, gateway_id)
    }

    pub fn list_gateways(&self) -> StateResult<Vec<Gateway>> {
        self.list_records(GATEWAYS)
    }

    pub fn delete_gateway(&self, gateway_id: &str) -> StateResult<bool> {
        self.delete_record(GATEWAYS, gateway_id)
    }

    /// Atomically edit a gateway. Returns `Ok(None)` if it does not exist.
    pub fn update_gateway<T, E>(
        &self,
        gateway_id: &str,
        edit: impl FnOnce(&mut Gateway) -> Result<T, E>,
    ) -> Result<Option<T>, E>
    where
        E: From<StateError>,
    {
        self.update_record(GATEWAYS, gateway_id, edit)
    }
}
