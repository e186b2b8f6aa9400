use std::collections::BTreeMap;

use hostq_core::{
    ActivityType, DeliveryStatus, Error, ExecutionId, HostDeliveryRecord, HostId, OperationType,
    Result, TargetId, Transition,
};
use hostq_storage::DeliveryUpdate;

use crate::queue::{software_activity, software_payload};
use crate::reconcile::profile_payload;
use crate::{Engine, EnqueueRequest};

impl Engine {
    /// Applies one verification batch to the host's profile installs.
    ///
    /// Each row moves only if its status allows the transition. Retried
    /// profiles go back to pending and are queued again.
    pub fn update_verification(
        &self,
        host: HostId,
        to_verify: &[String],
        to_fail: &[(String, String)],
        to_retry: &[String],
    ) -> Result<usize> {
        let mut updates = Vec::with_capacity(to_fail.len() + 2);
        if !to_verify.is_empty() {
            updates.push(DeliveryUpdate {
                identifiers: to_verify.to_vec(),
                transition: Transition::Verify,
            });
        }
        for (identifier, detail) in to_fail {
            updates.push(DeliveryUpdate {
                identifiers: vec![identifier.clone()],
                transition: Transition::Fail {
                    detail: detail.clone(),
                },
            });
        }
        if !to_retry.is_empty() {
            updates.push(DeliveryUpdate {
                identifiers: to_retry.to_vec(),
                transition: Transition::Retry,
            });
        }
        if updates.is_empty() {
            return Ok(0);
        }
        let applied = self
            .store
            .transition_deliveries(host, OperationType::Install, &updates, self.now())?;

        if !to_retry.is_empty() {
            let retried: Vec<HostDeliveryRecord> = self
                .store
                .host_deliveries(host)?
                .into_iter()
                .filter(|r| {
                    r.operation == OperationType::Install
                        && !r.is_hidden()
                        && r.status == Some(DeliveryStatus::Pending)
                        && to_retry.contains(&r.identifier)
                })
                .collect();
            for record in &retried {
                self.redeliver(record)?;
            }
            self.activate_next_for_host(host)?;
        }
        tracing::debug!(
            host_id = %host,
            verified = to_verify.len(),
            failed = to_fail.len(),
            retried = to_retry.len(),
            applied,
            "verification batch"
        );
        Ok(applied)
    }

    /// Operator retry of one delivery. Fails with `InvalidState` if nothing
    /// was ever sent or the delivery is verified.
    pub fn retry(&self, host: HostId, target: &TargetId) -> Result<HostDeliveryRecord> {
        let record = self
            .store
            .update_delivery(host, target, &Transition::Retry, true, self.now())?;
        self.redeliver(&record)?;
        self.activate_next_for_host(host)?;
        Ok(record)
    }

    /// Clears the status so the delivery goes out again, without counting a
    /// retry.
    pub fn resend(&self, host: HostId, target: &TargetId) -> Result<HostDeliveryRecord> {
        let record = self
            .store
            .update_delivery(host, target, &Transition::Resend, false, self.now())?;
        self.redeliver(&record)?;
        self.activate_next_for_host(host)?;
        Ok(record)
    }

    /// Resends every visible delivery of the target currently in `status`.
    pub fn batch_resend(&self, target: &TargetId, status: DeliveryStatus) -> Result<usize> {
        let count = self.store.resend_deliveries(target, status, self.now())?;
        if count == 0 {
            return Ok(0);
        }
        let mut hosts = Vec::new();
        for record in self.store.target_deliveries(target)? {
            if record.is_hidden() || record.status.is_some() {
                continue;
            }
            if self.redeliver(&record)?.is_some() {
                hosts.push(record.host_id);
            }
        }
        self.activate_next_for_hosts(&hosts)?;
        tracing::info!(target_id = %target, status = %status, count, "batch resend");
        Ok(count)
    }

    /// Reported status of one delivery; no status yet reads as pending.
    pub fn delivery_status(&self, host: HostId, target: &TargetId) -> Result<DeliveryStatus> {
        self.store
            .get_delivery(host, target)?
            .filter(|r| !r.is_hidden())
            .map(|r| r.effective_status())
            .ok_or_else(|| Error::not_found("delivery", format!("{target} on host {host}")))
    }

    /// Retry counts of the host's visible deliveries, by identifier.
    pub fn retry_counts(&self, host: HostId) -> Result<BTreeMap<String, u32>> {
        Ok(self
            .store
            .host_deliveries(host)?
            .into_iter()
            .filter(|r| !r.is_hidden())
            .map(|r| (r.identifier, r.retries))
            .collect())
    }

    pub fn retry_count_by_command(&self, host: HostId, execution_id: &ExecutionId) -> Result<u32> {
        self.store
            .find_delivery(execution_id)?
            .filter(|r| r.host_id == host)
            .map(|r| r.retries)
            .ok_or_else(|| Error::not_found("delivery", execution_id))
    }

    /// Deletes canceled and removed records for good.
    pub fn purge_hidden(&self) -> Result<usize> {
        let purged = self.store.purge_hidden_deliveries()?;
        tracing::info!(purged, "purged hidden deliveries");
        Ok(purged)
    }

    /// Queues the activity that delivers `record` again, unless one is
    /// already queued for that target on the host.
    pub(crate) fn redeliver(&self, record: &HostDeliveryRecord) -> Result<Option<ExecutionId>> {
        let queued = self
            .store
            .host_activities(record.host_id)?
            .iter()
            .any(|a| a.target.as_ref() == Some(&record.target));
        if queued {
            return Ok(None);
        }
        let req = if record.target.is_software() {
            let target = self.target(&record.target)?;
            EnqueueRequest::new(
                record.host_id,
                software_activity(&record.target, record.operation)?,
            )
            .payload(software_payload(&target, record.operation)?)
        } else {
            let checksum = match self.store.get_target(&record.target)? {
                Some(t) => t.content().map(|(c, _)| c.to_string()),
                None => None,
            };
            EnqueueRequest::new(record.host_id, ActivityType::MdmCommand).payload(profile_payload(
                record.operation,
                &record.identifier,
                checksum.as_deref(),
            ))
        };
        self.enqueue(
            req.target(record.target.clone())
                .operation(record.operation),
        )
        .map(Some)
    }
}
