use hostq_core::{
    ActivityResult, ActivityType, CancelReport, DeliveryStatus, Error, ExecutionId,
    HostDeliveryRecord, HostId, HostLastInstall, NewActivity, OperationType, PolicyId, Priority,
    Result, SoftwareStatus, Target, TargetId, Transition, UpcomingActivity,
};
use hostq_storage::QueuedWork;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::Engine;

/// A request to queue one unit of work for a host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub host_id: HostId,
    pub activity_type: ActivityType,
    /// Generated when absent.
    #[serde(default)]
    pub execution_id: Option<ExecutionId>,
    #[serde(default)]
    pub target: Option<TargetId>,
    pub operation: OperationType,
    #[serde(default)]
    pub policy_id: Option<PolicyId>,
    #[serde(default)]
    pub setup_experience: bool,
    #[serde(default)]
    pub payload: Value,
}

impl EnqueueRequest {
    pub fn new(host_id: HostId, activity_type: ActivityType) -> Self {
        Self {
            host_id,
            activity_type,
            execution_id: None,
            target: None,
            operation: activity_type.operation(),
            policy_id: None,
            setup_experience: false,
            payload: Value::Null,
        }
    }

    pub fn target(mut self, target: TargetId) -> Self {
        self.target = Some(target);
        self
    }

    pub fn operation(mut self, operation: OperationType) -> Self {
        self.operation = operation;
        self
    }

    pub fn policy(mut self, policy: PolicyId) -> Self {
        self.policy_id = Some(policy);
        self
    }

    pub fn setup_experience(mut self, on: bool) -> Self {
        self.setup_experience = on;
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn execution_id(mut self, id: ExecutionId) -> Self {
        self.execution_id = Some(id);
        self
    }
}

/// What the host needs to run a software install or uninstall.
pub(crate) fn software_payload(target: &Target, operation: OperationType) -> Result<Value> {
    match (target, operation) {
        (Target::SoftwareInstaller(i), OperationType::Install) => Ok(json!({
            "title": i.title,
            "version": i.version,
            "package_sha256": i.package_sha256,
            "pre_install_query": i.pre_install_query,
            "install_script": i.install_script,
            "post_install_script": i.post_install_script,
        })),
        (Target::SoftwareInstaller(i), OperationType::Remove) => Ok(json!({
            "title": i.title,
            "uninstall_script": i.uninstall_script,
        })),
        (Target::VppApp(a), OperationType::Install) => Ok(json!({ "adam_id": a.adam_id })),
        (other, op) => Err(Error::InvalidState(format!(
            "cannot {op} {} as software",
            other.id()
        ))),
    }
}

pub(crate) fn software_activity(target: &TargetId, operation: OperationType) -> Result<ActivityType> {
    match (target, operation) {
        (TargetId::SoftwareInstaller(_), OperationType::Install) => Ok(ActivityType::SoftwareInstall),
        (TargetId::SoftwareInstaller(_), OperationType::Remove) => Ok(ActivityType::SoftwareUninstall),
        (TargetId::VppApp(_), OperationType::Install) => Ok(ActivityType::VppAppInstall),
        (other, op) => Err(Error::InvalidState(format!("no {op} activity for {other}"))),
    }
}

impl Engine {
    /// Queues an activity without activating it.
    ///
    /// An activity with a target also refreshes the host's delivery record
    /// for that target: a visible record for the same operation keeps its
    /// status and retry count, anything else starts over with no status.
    /// The activity and the record are written in one transaction.
    pub fn enqueue(&self, req: EnqueueRequest) -> Result<ExecutionId> {
        let now = self.now();
        let work = self.prepare_enqueue(req, now)?;
        self.store.insert_activities(std::slice::from_ref(&work), &[], now)?;
        let activity = work.activity;
        tracing::debug!(
            host_id = %activity.host_id,
            execution_id = %activity.execution_id,
            activity_type = %activity.activity_type,
            "enqueued"
        );
        Ok(activity.execution_id)
    }

    /// Resolves a request into the activity and delivery record to write.
    pub(crate) fn prepare_enqueue(&self, req: EnqueueRequest, now: i64) -> Result<QueuedWork> {
        self.host(req.host_id)?;
        let existing = match &req.target {
            Some(target) => self.store.get_delivery(req.host_id, target)?,
            None => None,
        };
        let resolved = match &req.target {
            Some(target) => self.store.get_target(target)?,
            None => None,
        };
        let identifier = match (&req.target, &resolved) {
            (Some(_), Some(t)) => Some(t.identifier()),
            // Removal of a deleted profile still has the identifier on record.
            (Some(_), None) if req.operation == OperationType::Remove => {
                existing.as_ref().map(|r| r.identifier.clone())
            }
            (Some(target), None) => return Err(Error::not_found("target", target)),
            (None, _) => None,
        };
        let checksum = match (&resolved, req.operation) {
            (Some(t), OperationType::Install) => t.content().map(|(c, _)| c.to_string()),
            _ => None,
        };

        let priority = if req.setup_experience {
            self.config.setup_priority()
        } else {
            Priority::DEFAULT
        };
        let execution_id = req.execution_id.clone().unwrap_or_else(ExecutionId::new);
        let work = QueuedWork::new(NewActivity {
            host_id: req.host_id,
            activity_type: req.activity_type,
            execution_id: execution_id.clone(),
            priority,
            target: req.target.clone(),
            policy_id: req.policy_id,
            payload: req.payload,
        });

        let (Some(target), Some(identifier)) = (req.target, identifier) else {
            return Ok(work);
        };
        let mut record = match existing {
            Some(r) if !r.is_hidden() && r.operation == req.operation => r,
            Some(r) => {
                let mut fresh = HostDeliveryRecord::new(req.host_id, target, identifier, req.operation, now);
                fresh.variables_updated_at = r.variables_updated_at;
                fresh
            }
            None => HostDeliveryRecord::new(req.host_id, target, identifier, req.operation, now),
        };
        if record.checksum != checksum {
            // New content is a new delivery; the retry budget carries over.
            record.status = None;
            record.detail.clear();
            record.checksum = checksum;
        }
        record.execution_id = Some(execution_id);
        record.updated_at = now;
        Ok(work.with_record(record))
    }

    /// Queues a software install and activates the host's queue.
    pub fn request_install(&self, host: HostId, target: &TargetId, during_setup: bool) -> Result<ExecutionId> {
        self.request_software(host, target, OperationType::Install, during_setup)
    }

    pub fn request_uninstall(&self, host: HostId, target: &TargetId) -> Result<ExecutionId> {
        self.request_software(host, target, OperationType::Remove, false)
    }

    fn request_software(
        &self,
        host: HostId,
        target: &TargetId,
        operation: OperationType,
        during_setup: bool,
    ) -> Result<ExecutionId> {
        let activity_type = software_activity(target, operation)?;
        let resolved = self.target(target)?;
        if operation == OperationType::Install && !self.is_target_in_scope(target, host)? {
            return Err(Error::InvalidState(format!(
                "host {host} is not in the label scope of {target}"
            )));
        }
        let exec = self.enqueue(
            EnqueueRequest::new(host, activity_type)
                .target(target.clone())
                .operation(operation)
                .setup_experience(during_setup)
                .payload(software_payload(&resolved, operation)?),
        )?;
        self.activate_next_for_host(host)?;
        Ok(exec)
    }

    /// Activates the host's next activity and dispatches it.
    ///
    /// Returns `None` when the queue is empty or an activity is already
    /// activated. A dispatch failure leaves the activity activated.
    pub fn activate_next_for_host(&self, host: HostId) -> Result<Option<ExecutionId>> {
        let now = self.now();
        let Some(activity) = self.store.activate_next(host, now)?.newly_activated() else {
            return Ok(None);
        };
        self.on_activated(&activity, now)?;
        Ok(Some(activity.execution_id))
    }

    /// Batch form; hosts with an activated activity are skipped.
    pub fn activate_next_for_hosts(&self, hosts: &[HostId]) -> Result<Vec<ExecutionId>> {
        if hosts.is_empty() {
            return Ok(Vec::new());
        }
        let now = self.now();
        let activated = self.store.activate_next_for_hosts(hosts, now)?;
        let mut ids = Vec::with_capacity(activated.len());
        for activity in activated {
            self.on_activated(&activity, now)?;
            ids.push(activity.execution_id);
        }
        Ok(ids)
    }

    fn on_activated(&self, activity: &UpcomingActivity, now: i64) -> Result<()> {
        if let Some(target) = &activity.target {
            if let Some(mut record) = self.store.get_delivery(activity.host_id, target)? {
                // Dispatch marks the delivery in flight; later transitions
                // go through the state machine.
                if record.execution_id.as_ref() == Some(&activity.execution_id) && !record.is_hidden() {
                    record.status = Some(DeliveryStatus::Pending);
                    record.updated_at = now;
                    self.store.upsert_delivery(&record)?;
                }
            }
        }
        tracing::info!(
            host_id = %activity.host_id,
            execution_id = %activity.execution_id,
            activity_type = %activity.activity_type,
            "activated"
        );
        if let Err(err) = self.transport.dispatch(activity) {
            tracing::warn!(
                host_id = %activity.host_id,
                execution_id = %activity.execution_id,
                error = %err,
                "dispatch failed; activity stays activated"
            );
        }
        Ok(())
    }

    /// Records the terminal result of an activity, moves it to history and
    /// activates the host's next one.
    pub fn complete(&self, execution_id: &ExecutionId, result: ActivityResult) -> Result<UpcomingActivity> {
        let now = self.now();
        let record = self.store.find_delivery(execution_id)?;
        let activity = self
            .store
            .complete_activity(execution_id, &result, now)?
            .ok_or_else(|| Error::not_found("activity", execution_id))?;

        if let Some(record) = record.filter(|r| !r.is_hidden()) {
            let transition = match (&result, record.operation) {
                // A removal has nothing left to verify once the host has it.
                (ActivityResult::Acknowledged, OperationType::Remove) => Transition::Verify,
                (ActivityResult::Acknowledged, OperationType::Install) => Transition::Acknowledge,
                (ActivityResult::Installed, _) => Transition::Verify,
                (ActivityResult::Failed { detail }, _) => Transition::Fail {
                    detail: detail.clone(),
                },
            };
            self.store
                .update_delivery(record.host_id, &record.target, &transition, false, now)?;
        }
        tracing::info!(
            host_id = %activity.host_id,
            execution_id = %execution_id,
            result = result.label(),
            "completed"
        );
        self.activate_next_for_host(activity.host_id)?;
        Ok(activity)
    }

    /// Drops queued activities for the target. Hosts running an activity for
    /// it are reported in `hosts_with_active`; that command cannot be
    /// recalled and completes normally.
    pub fn cancel_for_target(&self, target: &TargetId) -> Result<CancelReport> {
        let report = self.store.cancel_queued_for_target(target, self.now())?;
        if !report.hosts_with_active.is_empty() {
            tracing::info!(
                target_id = %target,
                hosts = report.hosts_with_active.len(),
                "activated activities left to complete"
            );
        }
        Ok(report)
    }

    /// The host's queue, activated activity first.
    pub fn list_upcoming(&self, host: HostId) -> Result<Vec<UpcomingActivity>> {
        self.host(host)?;
        self.store.host_activities(host)
    }

    pub fn list_pending_installs(&self, host: HostId) -> Result<Vec<ExecutionId>> {
        Ok(hostq_queue::pending_installs(&self.list_upcoming(host)?))
    }

    pub fn list_ready_installs(&self, host: HostId) -> Result<Vec<ExecutionId>> {
        Ok(hostq_queue::ready_installs(&self.list_upcoming(host)?))
    }

    /// Forgets a deleted host. Nothing is re-activated or cancelled elsewhere.
    pub fn drop_host(&self, host: HostId) -> Result<bool> {
        let dropped = self.store.delete_host(host)?;
        if dropped {
            tracing::info!(host_id = %host, "host dropped");
        }
        Ok(dropped)
    }

    /// Removes work started by a deleted policy and unblocks affected hosts.
    pub fn on_policy_deleted(&self, policy: PolicyId) -> Result<CancelReport> {
        let report = self.store.cancel_policy_activities(policy, self.now())?;
        let hosts: Vec<HostId> = report.hosts_to_activate.iter().copied().collect();
        self.activate_next_for_hosts(&hosts)?;
        Ok(report)
    }

    /// Latest install of the target on the host: a queued one if any, else
    /// the most recent completed one that was not canceled.
    pub fn host_last_install(&self, host: HostId, target: &TargetId) -> Result<Option<HostLastInstall>> {
        let install_type = software_activity(target, OperationType::Install)?;
        let queued = self
            .store
            .host_activities(host)?
            .into_iter()
            .filter(|a| a.activity_type == install_type && a.target.as_ref() == Some(target))
            .max_by_key(|a| a.seq);
        if let Some(activity) = queued {
            return Ok(Some(HostLastInstall {
                execution_id: activity.execution_id,
                status: SoftwareStatus::PendingInstall,
            }));
        }

        let record = self.store.get_delivery(host, target)?;
        let mut past: Vec<_> = self
            .store
            .past_activities(host)?
            .into_iter()
            .filter(|p| {
                p.activity.activity_type == install_type && p.activity.target.as_ref() == Some(target)
            })
            .collect();
        past.sort_by_key(|p| (p.completed_at, p.activity.seq));
        for entry in past.into_iter().rev() {
            let exec = entry.activity.execution_id;
            let status = match &record {
                Some(r) if r.execution_id.as_ref() == Some(&exec) => {
                    if r.canceled {
                        continue;
                    }
                    SoftwareStatus::derive(r.operation, r.status)
                }
                _ => match entry.result {
                    ActivityResult::Installed => Some(SoftwareStatus::Installed),
                    ActivityResult::Failed { .. } => Some(SoftwareStatus::FailedInstall),
                    ActivityResult::Acknowledged => Some(SoftwareStatus::PendingInstall),
                },
            };
            if let Some(status) = status {
                return Ok(Some(HostLastInstall {
                    execution_id: exec,
                    status,
                }));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use hostq_core::{Activation, Platform};

    fn seeded() -> Harness {
        let h = harness();
        let store = h.engine.store();
        store.upsert_host(&host(1, Platform::Darwin)).unwrap();
        store.upsert_host(&host(2, Platform::Darwin)).unwrap();
        store.upsert_target(&installer(10)).unwrap();
        store.upsert_target(&installer(11)).unwrap();
        h
    }

    fn app(id: u64) -> TargetId {
        TargetId::SoftwareInstaller(hostq_core::InstallerId(id))
    }

    #[test]
    fn enqueue_never_activates() {
        let h = seeded();
        let exec = h
            .engine
            .enqueue(EnqueueRequest::new(HostId(1), ActivityType::ScriptRun))
            .unwrap();
        let queue = h.engine.list_upcoming(HostId(1)).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].execution_id, exec);
        assert!(!queue[0].is_activated());
    }

    #[test]
    fn enqueue_unknown_host_is_not_found() {
        let h = seeded();
        let err = h
            .engine
            .enqueue(EnqueueRequest::new(HostId(99), ActivityType::ScriptRun))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn activation_round_trip() {
        let h = seeded();
        let exec = h
            .engine
            .enqueue(
                EnqueueRequest::new(HostId(1), ActivityType::SoftwareInstall)
                    .target(app(10))
                    .execution_id(ExecutionId::from_str("exec-1")),
            )
            .unwrap();
        assert_eq!(h.engine.activate_next_for_host(HostId(1)).unwrap(), Some(exec.clone()));
        assert_eq!(h.engine.activate_next_for_host(HostId(1)).unwrap(), None);

        let queue = h.engine.list_upcoming(HostId(1)).unwrap();
        assert_eq!(queue[0].activated_at, Some(1_000));
        assert_eq!(h.transport.sent(), vec![exec.clone()]);
        let record = h.engine.store().get_delivery(HostId(1), &app(10)).unwrap().unwrap();
        assert_eq!(record.status, Some(DeliveryStatus::Pending));
        assert_eq!(record.execution_id, Some(exec));
    }

    #[test]
    fn setup_experience_preempts_older_work() {
        let h = seeded();
        h.engine
            .enqueue(EnqueueRequest::new(HostId(1), ActivityType::ScriptRun))
            .unwrap();
        h.clock.advance(10);
        let urgent = h
            .engine
            .enqueue(
                EnqueueRequest::new(HostId(1), ActivityType::SoftwareInstall)
                    .target(app(10))
                    .setup_experience(true),
            )
            .unwrap();
        assert_eq!(h.engine.activate_next_for_host(HostId(1)).unwrap(), Some(urgent));
    }

    #[test]
    fn dispatch_failure_keeps_activity_activated() {
        let h = seeded();
        h.transport.set_offline(true);
        let exec = h.engine.request_install(HostId(1), &app(10), false).unwrap();
        let activity = h.engine.store().get_activity(&exec).unwrap().unwrap();
        assert!(activity.is_activated());
        assert!(h.transport.sent().is_empty());
    }

    #[test]
    fn completion_activates_next_and_updates_record() {
        let h = seeded();
        let first = h.engine.request_install(HostId(1), &app(10), false).unwrap();
        let second = h.engine.request_install(HostId(1), &app(11), false).unwrap();
        h.engine.complete(&first, ActivityResult::Installed).unwrap();

        let record = h.engine.store().get_delivery(HostId(1), &app(10)).unwrap().unwrap();
        assert_eq!(record.status, Some(DeliveryStatus::Verified));
        let active = h.engine.store().get_activity(&second).unwrap().unwrap();
        assert!(active.is_activated());
        assert!(h.engine.complete(&first, ActivityResult::Installed).unwrap_err().is_not_found());
    }

    #[test]
    fn queued_activity_cannot_be_completed() {
        let h = seeded();
        h.engine.request_install(HostId(1), &app(10), false).unwrap();
        let waiting = h.engine.request_install(HostId(1), &app(11), false).unwrap();

        let err = h.engine.complete(&waiting, ActivityResult::Installed).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(!h.engine.store().get_activity(&waiting).unwrap().unwrap().is_activated());
        let record = h.engine.store().get_delivery(HostId(1), &app(11)).unwrap().unwrap();
        assert_eq!(record.status, None);
        assert!(h.engine.store().past_activities(HostId(1)).unwrap().is_empty());
    }

    #[test]
    fn acknowledged_uninstall_is_done() {
        let h = seeded();
        let install = h.engine.request_install(HostId(1), &app(10), false).unwrap();
        h.engine.complete(&install, ActivityResult::Installed).unwrap();
        let uninstall = h.engine.request_uninstall(HostId(1), &app(10)).unwrap();
        h.engine.complete(&uninstall, ActivityResult::Acknowledged).unwrap();
        let record = h.engine.store().get_delivery(HostId(1), &app(10)).unwrap().unwrap();
        assert_eq!(record.operation, OperationType::Remove);
        assert_eq!(record.status, Some(DeliveryStatus::Verified));
    }

    #[test]
    fn batch_activation_skips_busy_hosts() {
        let h = seeded();
        h.engine.request_install(HostId(1), &app(10), false).unwrap();
        h.engine
            .enqueue(EnqueueRequest::new(HostId(1), ActivityType::ScriptRun))
            .unwrap();
        let idle = h
            .engine
            .enqueue(EnqueueRequest::new(HostId(2), ActivityType::ScriptRun))
            .unwrap();
        let activated = h.engine.activate_next_for_hosts(&[HostId(1), HostId(2)]).unwrap();
        assert_eq!(activated, vec![idle]);
        assert!(matches!(
            h.engine.store().activate_next(HostId(1), 2_000).unwrap(),
            Activation::AlreadyActive(_)
        ));
    }

    #[test]
    fn cancel_for_target_reports_running_hosts() {
        let h = seeded();
        h.engine.request_install(HostId(1), &app(10), false).unwrap();
        let queued = h
            .engine
            .enqueue(EnqueueRequest::new(HostId(2), ActivityType::SoftwareInstall).target(app(10)))
            .unwrap();
        let report = h.engine.cancel_for_target(&app(10)).unwrap();
        assert_eq!(report.cancelled, vec![queued]);
        assert!(report.hosts_with_active.contains(&HostId(1)));
        assert_eq!(report.records_canceled, 1);
        assert!(h.engine.store().get_delivery(HostId(2), &app(10)).unwrap().unwrap().canceled);
    }

    #[test]
    fn pending_installs_list_active_first() {
        let h = seeded();
        let running = h.engine.request_install(HostId(1), &app(10), false).unwrap();
        let waiting = h.engine.request_install(HostId(1), &app(11), false).unwrap();
        assert_eq!(
            h.engine.list_pending_installs(HostId(1)).unwrap(),
            vec![running.clone(), waiting]
        );
        assert_eq!(h.engine.list_ready_installs(HostId(1)).unwrap(), vec![running]);
    }

    #[test]
    fn deleted_policy_unblocks_host() {
        let h = seeded();
        let store = h.engine.store();
        store.set_policy_target(PolicyId(7), Some(&app(10))).unwrap();
        let from_policy = h
            .engine
            .enqueue(
                EnqueueRequest::new(HostId(1), ActivityType::SoftwareInstall)
                    .target(app(10))
                    .policy(PolicyId(7)),
            )
            .unwrap();
        h.engine.activate_next_for_host(HostId(1)).unwrap();
        let next = h
            .engine
            .enqueue(EnqueueRequest::new(HostId(1), ActivityType::ScriptRun))
            .unwrap();

        let report = h.engine.on_policy_deleted(PolicyId(7)).unwrap();
        assert_eq!(report.cancelled, vec![from_policy]);
        assert!(h.engine.store().get_activity(&next).unwrap().unwrap().is_activated());
        assert!(h.engine.store().target_dependents(&app(10)).unwrap().policies.is_empty());
    }

    #[test]
    fn last_install_prefers_queued_then_history() {
        let h = seeded();
        assert_eq!(h.engine.host_last_install(HostId(1), &app(10)).unwrap(), None);
        let first = h.engine.request_install(HostId(1), &app(10), false).unwrap();
        h.engine
            .complete(
                &first,
                ActivityResult::Failed {
                    detail: "exit 1".into(),
                },
            )
            .unwrap();
        let last = h.engine.host_last_install(HostId(1), &app(10)).unwrap().unwrap();
        assert_eq!(last.execution_id, first);
        assert_eq!(last.status, SoftwareStatus::FailedInstall);

        let second = h.engine.request_install(HostId(1), &app(10), false).unwrap();
        let last = h.engine.host_last_install(HostId(1), &app(10)).unwrap().unwrap();
        assert_eq!(last.execution_id, second);
        assert_eq!(last.status, SoftwareStatus::PendingInstall);
    }

    #[test]
    fn dropped_host_takes_its_queue() {
        let h = seeded();
        let exec = h.engine.request_install(HostId(1), &app(10), false).unwrap();
        assert!(h.engine.drop_host(HostId(1)).unwrap());
        assert!(h.engine.store().get_activity(&exec).unwrap().is_none());
        assert!(h.engine.list_upcoming(HostId(1)).unwrap_err().is_not_found());
    }
}
