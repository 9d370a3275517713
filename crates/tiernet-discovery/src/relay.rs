//! Instance status moving up the hierarchy, changes fanning out.
//!
//! An instance's lifecycle is implicit in which of its fields are set:
//! `instance_ip` once addresses are assigned, the namespace/host fields once
//! the hosting worker has configured its network. Network reports climb one
//! tier at a time; every applied change is pushed to the parties interested
//! in the job, and to nobody else.

use std::sync::Arc;

use tiernet_ipam::{AddressPoolManager, Family};
use tiernet_state::{Instance, Job, NetworkConfig, PartyId, StateStore};
use tracing::{debug, error, info, warn};

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::messages::{ChildMessage, DeployStatusReport, InstanceNetworkStatus, JobUpdate, UpdateKind};
use crate::notify::ChildNotifier;
use crate::parent::ParentClient;
use crate::resolution::Selector;

/// Effect of a network report on the stored instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The fields were empty and are now set.
    Applied,
    /// The same data was already stored.
    Unchanged,
}

/// Result of removing an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct UndeployOutcome {
    pub job_name: String,
    pub removed: Instance,
    /// Whether the (cached) job record went away with its last instance.
    pub job_deleted: bool,
    /// Interested parties that were notified successfully.
    pub notified: usize,
}

pub struct DeploymentStatusRelay {
    store: StateStore,
    pools: Option<Arc<AddressPoolManager>>,
    parent: Option<Arc<dyn ParentClient>>,
    notifier: Arc<dyn ChildNotifier>,
}

impl DeploymentStatusRelay {
    /// `pools` is set on the tier that owns instance addresses (root);
    /// `parent` on every tier below the root.
    pub fn new(
        store: StateStore,
        pools: Option<Arc<AddressPoolManager>>,
        parent: Option<Arc<dyn ParentClient>>,
        notifier: Arc<dyn ChildNotifier>,
    ) -> Self {
        Self {
            store,
            pools,
            parent,
            notifier,
        }
    }

    fn lookup_local(&self, selector: &Selector) -> DiscoveryResult<Option<Job>> {
        Ok(match selector {
            Selector::Name(name) => self.store.get_job(name)?,
            Selector::Address(address) => self.store.find_job_by_address(address)?,
        })
    }

    /// Local record, or the parent's copy merged into the local registry.
    async fn locate(&self, selector: &Selector) -> DiscoveryResult<Job> {
        if let Some(job) = self.lookup_local(selector)? {
            return Ok(job);
        }
        let not_found = || DiscoveryError::JobNotFound(selector.key().to_string());
        let Some(parent) = &self.parent else {
            return Err(not_found());
        };
        let job = parent.fetch_job(selector).await?.ok_or_else(not_found)?;
        Ok(self.store.merge_job(&job)?)
    }

    /// Write the worker-assigned fields of each listed instance if they are
    /// still empty. Identical data is accepted as a retry; different data is
    /// a conflict. All statuses are applied in one transaction, so a single
    /// conflict leaves the whole record untouched.
    fn apply_networks(
        &self,
        job_name: &str,
        statuses: &[InstanceNetworkStatus],
        worker_id: Option<&str>,
    ) -> DiscoveryResult<Vec<(u32, ReportOutcome)>> {
        if let Some(empty) = statuses.iter().find(|status| status.network.is_empty()) {
            return Err(DiscoveryError::InvalidArguments(format!(
                "empty network report for instance {} of {job_name}",
                empty.instance_number
            )));
        }
        self.store
            .update_job(job_name, |job| {
                statuses
                    .iter()
                    .map(|status| {
                        let instance_number = status.instance_number;
                        let instance = job.instance_mut(instance_number).ok_or_else(|| {
                            DiscoveryError::InstanceNotFound {
                                job_name: job_name.to_string(),
                                instance_number,
                            }
                        })?;
                        let current = instance.network();
                        if current.is_empty() {
                            instance.set_network(&status.network);
                            if let Some(worker_id) = worker_id {
                                instance.worker_id = Some(worker_id.to_string());
                            }
                            Ok((instance_number, ReportOutcome::Applied))
                        } else if current == status.network {
                            Ok((instance_number, ReportOutcome::Unchanged))
                        } else {
                            warn!(%job_name, instance_number, "conflicting network report rejected");
                            Err(DiscoveryError::ConflictingReport {
                                job_name: job_name.to_string(),
                                instance_number,
                            })
                        }
                    })
                    .collect::<DiscoveryResult<Vec<_>>>()
            })?
            .ok_or_else(|| DiscoveryError::JobNotFound(job_name.to_string()))
    }

    /// A worker (or child tier) reports that an instance's network is set up.
    ///
    /// Applied changes are fanned out to the job's interested parties. The
    /// reporter's configured instances are then forwarded to the parent tier
    /// once, even for an unchanged retry.
    pub async fn report_network_configured(
        &self,
        selector: &Selector,
        instance_number: u32,
        network: &NetworkConfig,
        reporter: &str,
    ) -> DiscoveryResult<ReportOutcome> {
        let job = self.locate(selector).await?;
        let status = InstanceNetworkStatus {
            instance_number,
            network: network.clone(),
        };
        let outcome = self
            .apply_networks(&job.job_name, &[status], Some(reporter))?
            .first()
            .map_or(ReportOutcome::Unchanged, |(_, outcome)| *outcome);
        info!(job_name = %job.job_name, instance_number, %reporter, ?outcome, "network status reported");

        if outcome == ReportOutcome::Applied {
            self.fan_out(
                &job.job_name,
                ChildMessage::DeployNotify(JobUpdate {
                    job_name: job.job_name.clone(),
                    instance_number,
                    kind: UpdateKind::Deployment,
                }),
            )
            .await?;
        }

        if let Some(parent) = &self.parent {
            let report = self.upward_report(&job.job_name, reporter)?;
            if let Err(e) = parent.report_deploy_status(&report).await {
                warn!(job_name = %job.job_name, error = %e, "failed to forward deploy status upward");
            }
        }
        Ok(outcome)
    }

    /// Configured instances hosted by `reporter`, in the parent's format.
    fn upward_report(&self, job_name: &str, reporter: &str) -> DiscoveryResult<DeployStatusReport> {
        let job = self
            .store
            .get_job(job_name)?
            .ok_or_else(|| DiscoveryError::JobNotFound(job_name.to_string()))?;
        let instances = job
            .instance_list
            .iter()
            .filter(|i| i.worker_id.as_deref() == Some(reporter) && i.is_network_configured())
            .map(|i| InstanceNetworkStatus {
                instance_number: i.instance_number,
                network: i.network(),
            })
            .collect();
        Ok(DeployStatusReport {
            job_id: job.system_job_id,
            instances,
        })
    }

    /// A child tier forwards the network status of its instances
    /// (`POST /instance/deploy_status`). The report is applied as a whole or
    /// not at all. Returns the instance numbers that changed.
    pub async fn apply_deploy_status(&self, report: &DeployStatusReport) -> DiscoveryResult<Vec<u32>> {
        if report.job_id.is_empty() || report.instances.is_empty() {
            return Err(DiscoveryError::InvalidArguments(
                "deploy status needs a job id and at least one instance".to_string(),
            ));
        }
        let job = self
            .store
            .find_job_by_system_id(&report.job_id)?
            .ok_or_else(|| DiscoveryError::JobNotFound(report.job_id.clone()))?;

        let applied: Vec<u32> = self
            .apply_networks(&job.job_name, &report.instances, None)?
            .into_iter()
            .filter(|(_, outcome)| *outcome == ReportOutcome::Applied)
            .map(|(instance_number, _)| instance_number)
            .collect();
        for instance_number in &applied {
            self.fan_out(
                &job.job_name,
                ChildMessage::DeployNotify(JobUpdate {
                    job_name: job.job_name.clone(),
                    instance_number: *instance_number,
                    kind: UpdateKind::Deployment,
                }),
            )
            .await?;
        }
        info!(job_name = %job.job_name, applied = applied.len(), "deploy status applied");
        Ok(applied)
    }

    /// Remove an instance, return its addresses to the pools (on the tier
    /// that owns them) and tell every interested party.
    ///
    /// A cached job whose last instance goes is deleted; the tier owning the
    /// addresses keeps the job record.
    pub async fn report_undeployment(
        &self,
        selector: &Selector,
        instance_number: u32,
    ) -> DiscoveryResult<UndeployOutcome> {
        let job = self
            .lookup_local(selector)?
            .ok_or_else(|| DiscoveryError::JobNotFound(selector.key().to_string()))?;
        let job_name = job.job_name.clone();
        let instance_missing = || DiscoveryError::InstanceNotFound {
            job_name: job_name.clone(),
            instance_number,
        };
        let instance = job.instance(instance_number).ok_or_else(instance_missing)?;

        // Both addresses must be returnable before anything changes.
        if let Some(pools) = &self.pools {
            for (address, family) in instance_addresses(instance) {
                pools.check_instance_release(address, family)?;
            }
        }

        let parties = self.store.interested_parties(&job_name)?;
        let (removed, remaining) = self
            .store
            .update_job(&job_name, |job| {
                let removed = job.remove_instance(instance_number).ok_or_else(instance_missing)?;
                Ok::<_, DiscoveryError>((removed, job.instance_list.len()))
            })?
            .ok_or_else(|| DiscoveryError::JobNotFound(job_name.clone()))?;

        if let Some(pools) = &self.pools {
            for (address, family) in instance_addresses(&removed) {
                if let Err(e) = pools.release_instance_address(address, family) {
                    error!(%job_name, instance_number, %address, error = %e, "instance address not returned to its pool");
                }
            }
        }

        let job_deleted = remaining == 0 && self.pools.is_none();
        if job_deleted {
            self.store.delete_job(&job_name)?;
        }
        info!(%job_name, instance_number, job_deleted, "instance undeployed");

        let message = ChildMessage::DeployNotify(JobUpdate {
            job_name: job_name.clone(),
            instance_number,
            kind: UpdateKind::Undeployment,
        });
        let notified = self.notify_all(&parties, &message).await;
        Ok(UndeployOutcome {
            job_name,
            removed,
            job_deleted,
            notified,
        })
    }

    /// The parent tier announces a change to a job instance. Jobs nobody
    /// here is interested in are ignored; others are refreshed and the
    /// change is passed on. Returns whether the job was relevant.
    pub async fn apply_upstream_update(&self, update: &JobUpdate) -> DiscoveryResult<bool> {
        if self.store.interested_parties(&update.job_name)?.is_empty() {
            debug!(job_name = %update.job_name, "update for irrelevant job ignored");
            return Ok(false);
        }

        match update.kind {
            UpdateKind::Deployment => {
                if let Some(parent) = &self.parent {
                    let selector = Selector::Name(update.job_name.clone());
                    if let Some(job) = parent.fetch_job(&selector).await? {
                        self.store.merge_job(&job)?;
                    }
                }
            }
            UpdateKind::Undeployment => {
                self.store.update_job(&update.job_name, |job| {
                    Ok::<_, DiscoveryError>(job.remove_instance(update.instance_number))
                })?;
            }
        }
        info!(job_name = %update.job_name, instance_number = update.instance_number, kind = ?update.kind, "upstream update applied");

        self.fan_out(&update.job_name, ChildMessage::DeployNotify(update.clone()))
            .await?;
        Ok(true)
    }

    /// Notify every party interested in `job_name`.
    async fn fan_out(&self, job_name: &str, message: ChildMessage) -> DiscoveryResult<usize> {
        let parties = self.store.interested_parties(job_name)?;
        Ok(self.notify_all(&parties, &message).await)
    }

    /// Deliver to each party; one failure does not stop the others.
    async fn notify_all(&self, parties: &[PartyId], message: &ChildMessage) -> usize {
        let mut delivered = 0;
        for party in parties {
            match self.notifier.notify(party, message).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(%party, kind = message.kind(), error = %e, "child notification failed"),
            }
        }
        delivered
    }
}

/// The static addresses of an instance with their families.
pub(crate) fn instance_addresses(instance: &Instance) -> Vec<(&str, Family)> {
    [
        (instance.instance_ip.as_deref(), Family::V4),
        (instance.instance_ip_v6.as_deref(), Family::V6),
    ]
    .into_iter()
    .filter_map(|(address, family)| Some((address?, family)))
    .collect()
}
