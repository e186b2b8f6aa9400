use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use hostq_core::{
    check_deletable, delivery, display_order, plan_next_activation, Activation, ActivationPlan,
    ActivityResult, CancelReport, DeliveryStatus, Error, ExecutionId, Host, HostDeliveryRecord,
    HostId, HostLabelState, HostQueueSnapshot, LabelId, LabelInfo, LabelScope,
    OperationType, PastActivity, PolicyId, Result, SideEffectPlan, Target, TargetDependents,
    TargetId, TeamId, Transition, UpcomingActivity,
};

use crate::traits::{DeliveryUpdate, QueuedWork, Store, TargetWrite};

/// In-memory store for tests and fixtures. Not durable; one mutex makes every
/// method a transaction.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    hosts: BTreeMap<HostId, Host>,
    labels: HashMap<LabelId, LabelInfo>,
    memberships: BTreeSet<(HostId, LabelId)>,
    targets: BTreeMap<TargetId, Target>,
    scopes: HashMap<TargetId, LabelScope>,
    policies: BTreeMap<PolicyId, Option<TargetId>>,
    upcoming: BTreeMap<u64, UpcomingActivity>,
    past: Vec<PastActivity>,
    deliveries: BTreeMap<(HostId, TargetId), HostDeliveryRecord>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::TransientStore("in-memory store lock poisoned".into()))
    }
}

impl Inner {
    fn host_queue(&self, host: HostId, now: i64) -> HostQueueSnapshot {
        HostQueueSnapshot {
            host_id: host,
            now_unix: now,
            activities: self
                .upcoming
                .values()
                .filter(|a| a.host_id == host)
                .cloned()
                .collect(),
        }
    }

    fn activate_next(&mut self, host: HostId, now: i64) -> Activation {
        match plan_next_activation(&self.host_queue(host, now)) {
            ActivationPlan::Idle => Activation::Idle,
            ActivationPlan::AlreadyActive(exec) => match self.find_seq(&exec) {
                Some(seq) => Activation::AlreadyActive(self.upcoming[&seq].clone()),
                None => Activation::Idle,
            },
            ActivationPlan::Activate(exec) => {
                let Some(seq) = self.find_seq(&exec) else {
                    return Activation::Idle;
                };
                let Some(activity) = self.upcoming.get_mut(&seq) else {
                    return Activation::Idle;
                };
                activity.activated_at = Some(now);
                Activation::Activated(activity.clone())
            }
        }
    }

    fn find_seq(&self, exec: &ExecutionId) -> Option<u64> {
        self.upcoming
            .iter()
            .find(|(_, a)| &a.execution_id == exec)
            .map(|(seq, _)| *seq)
    }

    /// Removes matching activities; activated ones are reported per host.
    fn drop_activities(
        &mut self,
        report: &mut CancelReport,
        now: i64,
        matches: impl Fn(&UpcomingActivity) -> bool,
    ) {
        let doomed: Vec<u64> = self
            .upcoming
            .iter()
            .filter(|(_, a)| matches(a))
            .map(|(seq, _)| *seq)
            .collect();
        for seq in doomed {
            if let Some(a) = self.upcoming.remove(&seq) {
                if a.is_activated() {
                    report.hosts_to_activate.insert(a.host_id);
                }
                if self.cancel_unsent_record(&a, now) {
                    report.records_canceled += 1;
                }
                report.cancelled.push(a.execution_id);
            }
        }
    }

    /// Marks the activity's record canceled if its command never went out.
    fn cancel_unsent_record(&mut self, activity: &UpcomingActivity, now: i64) -> bool {
        let Some(target) = &activity.target else {
            return false;
        };
        let Some(record) = self.deliveries.get_mut(&(activity.host_id, target.clone())) else {
            return false;
        };
        if record.execution_id.as_ref() != Some(&activity.execution_id)
            || record.is_hidden()
            || record.status.is_some()
        {
            return false;
        }
        record.canceled = true;
        record.updated_at = now;
        true
    }

    fn is_taken(&self, exec: &ExecutionId) -> bool {
        self.find_seq(exec).is_some() || self.past.iter().any(|p| &p.activity.execution_id == exec)
    }

    fn dependents(&self, target: &TargetId) -> TargetDependents {
        TargetDependents {
            policies: self
                .policies
                .iter()
                .filter(|(_, t)| t.as_ref() == Some(target))
                .map(|(p, _)| *p)
                .collect(),
            install_during_setup: self
                .targets
                .get(target)
                .is_some_and(|t| t.install_during_setup()),
        }
    }
}

impl Store for InMemoryStore {
    fn upsert_host(&self, host: &Host) -> Result<()> {
        self.lock()?.hosts.insert(host.id, host.clone());
        Ok(())
    }

    fn get_host(&self, id: HostId) -> Result<Option<Host>> {
        Ok(self.lock()?.hosts.get(&id).cloned())
    }

    fn list_hosts(&self, team: Option<TeamId>) -> Result<Vec<Host>> {
        Ok(self
            .lock()?
            .hosts
            .values()
            .filter(|h| h.team_id == team)
            .cloned()
            .collect())
    }

    fn delete_host(&self, id: HostId) -> Result<bool> {
        let mut inner = self.lock()?;
        if inner.hosts.remove(&id).is_none() {
            return Ok(false);
        }
        inner.upcoming.retain(|_, a| a.host_id != id);
        inner.deliveries.retain(|(h, _), _| *h != id);
        inner.memberships.retain(|(h, _)| *h != id);
        Ok(true)
    }

    fn upsert_label(&self, label: &LabelInfo) -> Result<()> {
        self.lock()?.labels.insert(label.id, label.clone());
        Ok(())
    }

    fn mark_label_broken(&self, id: LabelId) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.labels.get_mut(&id) {
            Some(label) => {
                label.broken = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn get_labels(&self, ids: &[LabelId]) -> Result<BTreeMap<LabelId, LabelInfo>> {
        let inner = self.lock()?;
        Ok(ids
            .iter()
            .filter_map(|id| inner.labels.get(id).map(|l| (*id, l.clone())))
            .collect())
    }

    fn set_label_membership(&self, host: HostId, label: LabelId, member: bool) -> Result<()> {
        let mut inner = self.lock()?;
        if member {
            inner.memberships.insert((host, label));
        } else {
            inner.memberships.remove(&(host, label));
        }
        Ok(())
    }

    fn host_label_states(&self, hosts: &[HostId]) -> Result<BTreeMap<HostId, HostLabelState>> {
        let inner = self.lock()?;
        let mut states = BTreeMap::new();
        for id in hosts {
            let Some(host) = inner.hosts.get(id) else {
                continue;
            };
            let memberships = inner
                .memberships
                .range((*id, LabelId(0))..=(*id, LabelId(u64::MAX)))
                .map(|(_, l)| *l)
                .collect();
            states.insert(
                *id,
                HostLabelState {
                    label_updated_at: host.label_updated_at,
                    memberships,
                },
            );
        }
        Ok(states)
    }

    fn upsert_target(&self, target: &Target) -> Result<()> {
        self.lock()?.targets.insert(target.id(), target.clone());
        Ok(())
    }

    fn get_target(&self, id: &TargetId) -> Result<Option<Target>> {
        Ok(self.lock()?.targets.get(id).cloned())
    }

    fn list_targets(&self, team: Option<TeamId>) -> Result<Vec<Target>> {
        Ok(self
            .lock()?
            .targets
            .values()
            .filter(|t| t.team_id() == team)
            .cloned()
            .collect())
    }

    fn content_uploads(&self) -> Result<Vec<(String, i64)>> {
        Ok(self
            .lock()?
            .targets
            .values()
            .filter_map(|t| t.content().map(|(c, at)| (c.to_string(), at)))
            .collect())
    }

    fn set_label_scope(&self, target: &TargetId, scope: Option<&LabelScope>) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.targets.contains_key(target) {
            return Err(Error::not_found("target", target));
        }
        match scope {
            Some(scope) => inner.scopes.insert(target.clone(), scope.clone()),
            None => inner.scopes.remove(target),
        };
        Ok(())
    }

    fn label_scope(&self, target: &TargetId) -> Result<Option<LabelScope>> {
        Ok(self.lock()?.scopes.get(target).cloned())
    }

    fn set_policy_target(&self, policy: PolicyId, target: Option<&TargetId>) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(t) = target {
            if !inner.targets.contains_key(t) {
                return Err(Error::not_found("target", t));
            }
        }
        inner.policies.insert(policy, target.cloned());
        Ok(())
    }

    fn target_dependents(&self, target: &TargetId) -> Result<TargetDependents> {
        Ok(self.lock()?.dependents(target))
    }

    fn insert_activities(
        &self,
        work: &[QueuedWork],
        records: &[HostDeliveryRecord],
        now: i64,
    ) -> Result<Vec<UpcomingActivity>> {
        let mut inner = self.lock()?;
        let mut seen = BTreeSet::new();
        for w in work {
            let exec = &w.activity.execution_id;
            if inner.is_taken(exec) || !seen.insert(exec) {
                return Err(Error::InvalidState(format!("execution id {exec} already exists")));
            }
        }
        let mut inserted = Vec::with_capacity(work.len());
        for w in work {
            let new = &w.activity;
            inner.next_seq += 1;
            let activity = UpcomingActivity {
                seq: inner.next_seq,
                host_id: new.host_id,
                activity_type: new.activity_type,
                execution_id: new.execution_id.clone(),
                priority: new.priority,
                created_at: now,
                activated_at: None,
                target: new.target.clone(),
                policy_id: new.policy_id,
                payload: new.payload.clone(),
            };
            inner.upcoming.insert(activity.seq, activity.clone());
            if let Some(record) = &w.record {
                inner
                    .deliveries
                    .insert((record.host_id, record.target.clone()), record.clone());
            }
            inserted.push(activity);
        }
        for record in records {
            inner
                .deliveries
                .insert((record.host_id, record.target.clone()), record.clone());
        }
        Ok(inserted)
    }

    fn get_activity(&self, execution_id: &ExecutionId) -> Result<Option<UpcomingActivity>> {
        let inner = self.lock()?;
        Ok(inner.find_seq(execution_id).map(|seq| inner.upcoming[&seq].clone()))
    }

    fn host_activities(&self, host: HostId) -> Result<Vec<UpcomingActivity>> {
        let mut activities = self.lock()?.host_queue(host, 0).activities;
        activities.sort_by(display_order);
        Ok(activities)
    }

    fn target_activities(&self, target: &TargetId) -> Result<Vec<UpcomingActivity>> {
        Ok(self
            .lock()?
            .upcoming
            .values()
            .filter(|a| a.target.as_ref() == Some(target))
            .cloned()
            .collect())
    }

    fn past_activities(&self, host: HostId) -> Result<Vec<PastActivity>> {
        Ok(self
            .lock()?
            .past
            .iter()
            .filter(|p| p.activity.host_id == host)
            .cloned()
            .collect())
    }

    fn activate_next(&self, host: HostId, now: i64) -> Result<Activation> {
        Ok(self.lock()?.activate_next(host, now))
    }

    fn activate_next_for_hosts(&self, hosts: &[HostId], now: i64) -> Result<Vec<UpcomingActivity>> {
        let mut inner = self.lock()?;
        let unique: BTreeSet<HostId> = hosts.iter().copied().collect();
        Ok(unique
            .into_iter()
            .filter_map(|h| inner.activate_next(h, now).newly_activated())
            .collect())
    }

    fn complete_activity(
        &self,
        execution_id: &ExecutionId,
        result: &ActivityResult,
        now: i64,
    ) -> Result<Option<UpcomingActivity>> {
        let mut inner = self.lock()?;
        let Some(seq) = inner.find_seq(execution_id) else {
            return Ok(None);
        };
        if !inner.upcoming[&seq].is_activated() {
            return Err(Error::InvalidState(format!(
                "activity {execution_id} was never activated"
            )));
        }
        let Some(activity) = inner.upcoming.remove(&seq) else {
            return Ok(None);
        };
        inner.past.push(PastActivity {
            activity: activity.clone(),
            completed_at: now,
            result: result.clone(),
        });
        Ok(Some(activity))
    }

    fn cancel_queued_for_target(&self, target: &TargetId, now: i64) -> Result<CancelReport> {
        let mut inner = self.lock()?;
        let mut report = CancelReport::default();
        for a in inner.upcoming.values() {
            if a.is_activated() && a.target.as_ref() == Some(target) {
                report.hosts_with_active.insert(a.host_id);
            }
        }
        inner.drop_activities(&mut report, now, |a| {
            !a.is_activated() && a.target.as_ref() == Some(target)
        });
        Ok(report)
    }

    fn cancel_policy_activities(&self, policy: PolicyId, now: i64) -> Result<CancelReport> {
        let mut inner = self.lock()?;
        let mut report = CancelReport::default();
        inner.drop_activities(&mut report, now, |a| a.policy_id == Some(policy));
        inner.policies.remove(&policy);
        Ok(report)
    }

    fn apply_side_effects(
        &self,
        plan: &SideEffectPlan,
        write: TargetWrite<'_>,
        now: i64,
    ) -> Result<CancelReport> {
        let mut inner = self.lock()?;
        let needs_target = plan.delete_target || matches!(write, TargetWrite::Scope(_));
        if needs_target && !inner.targets.contains_key(&plan.target) {
            return Err(Error::not_found("target", &plan.target));
        }
        if plan.require_no_dependents {
            check_deletable(&inner.dependents(&plan.target))?;
        }
        match write {
            TargetWrite::Nothing => {}
            TargetWrite::Upsert(target) => {
                inner.targets.insert(target.id(), target.clone());
            }
            TargetWrite::Scope(Some(scope)) => {
                inner.scopes.insert(plan.target.clone(), scope.clone());
            }
            TargetWrite::Scope(None) => {
                inner.scopes.remove(&plan.target);
            }
        }

        let mut report = CancelReport::default();
        inner.drop_activities(&mut report, now, |a| {
            a.target.as_ref() == Some(&plan.target) && plan.cancel_types.contains(&a.activity_type)
        });

        for record in inner.deliveries.values_mut() {
            if record.target != plan.target || record.is_hidden() {
                continue;
            }
            let completed = matches!(
                record.status,
                Some(DeliveryStatus::Verified | DeliveryStatus::Failed)
            );
            if completed && plan.remove_completed_records {
                record.removed = true;
                record.updated_at = now;
                report.records_removed += 1;
            } else if !completed && plan.cancel_pending_records {
                record.canceled = true;
                record.updated_at = now;
                report.records_canceled += 1;
            }
        }

        if plan.delete_target {
            inner.targets.remove(&plan.target);
            inner.scopes.remove(&plan.target);
            report.target_deleted = true;
        }
        Ok(report)
    }

    fn upsert_delivery(&self, record: &HostDeliveryRecord) -> Result<()> {
        self.lock()?
            .deliveries
            .insert((record.host_id, record.target.clone()), record.clone());
        Ok(())
    }

    fn get_delivery(&self, host: HostId, target: &TargetId) -> Result<Option<HostDeliveryRecord>> {
        Ok(self.lock()?.deliveries.get(&(host, target.clone())).cloned())
    }

    fn find_delivery(&self, execution_id: &ExecutionId) -> Result<Option<HostDeliveryRecord>> {
        Ok(self
            .lock()?
            .deliveries
            .values()
            .find(|r| r.execution_id.as_ref() == Some(execution_id))
            .cloned())
    }

    fn host_deliveries(&self, host: HostId) -> Result<Vec<HostDeliveryRecord>> {
        Ok(self
            .lock()?
            .deliveries
            .values()
            .filter(|r| r.host_id == host)
            .cloned()
            .collect())
    }

    fn target_deliveries(&self, target: &TargetId) -> Result<Vec<HostDeliveryRecord>> {
        Ok(self
            .lock()?
            .deliveries
            .values()
            .filter(|r| &r.target == target)
            .cloned()
            .collect())
    }

    fn update_delivery(
        &self,
        host: HostId,
        target: &TargetId,
        transition: &Transition,
        strict: bool,
        now: i64,
    ) -> Result<HostDeliveryRecord> {
        let mut inner = self.lock()?;
        let record = inner
            .deliveries
            .get_mut(&(host, target.clone()))
            .ok_or_else(|| Error::not_found("delivery", format!("{target} on host {host}")))?;
        if strict {
            delivery::apply_strict(record, transition, now)?;
        } else {
            delivery::apply(record, transition, now);
        }
        Ok(record.clone())
    }

    fn transition_deliveries(
        &self,
        host: HostId,
        operation: OperationType,
        updates: &[DeliveryUpdate],
        now: i64,
    ) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut applied = 0;
        for update in updates {
            for record in inner.deliveries.values_mut() {
                if record.host_id == host
                    && record.operation == operation
                    && !record.is_hidden()
                    && update.identifiers.contains(&record.identifier)
                    && delivery::apply(record, &update.transition, now)
                {
                    applied += 1;
                }
            }
        }
        Ok(applied)
    }

    fn resend_deliveries(&self, target: &TargetId, status: DeliveryStatus, now: i64) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut count = 0;
        for record in inner.deliveries.values_mut() {
            if &record.target == target
                && !record.is_hidden()
                && record.status == Some(status)
                && delivery::apply(record, &Transition::Resend, now)
            {
                count += 1;
            }
        }
        Ok(count)
    }

    fn purge_hidden_deliveries(&self) -> Result<usize> {
        let mut inner = self.lock()?;
        let before = inner.deliveries.len();
        inner.deliveries.retain(|_, r| !r.is_hidden());
        Ok(before - inner.deliveries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostq_core::{
        ActivityType, InstallerId, LabelScopeKind, NewActivity, Platform, Priority, SoftwareInstaller,
        TargetChange,
    };

    fn host(id: u64) -> Host {
        Host {
            id: HostId(id),
            uuid: format!("uuid-{id}"),
            platform: Platform::Darwin,
            team_id: Some(TeamId(1)),
            label_updated_at: 0,
        }
    }

    fn installer(id: u64) -> Target {
        Target::SoftwareInstaller(SoftwareInstaller {
            id: InstallerId(id),
            team_id: Some(TeamId(1)),
            title: format!("App {id}"),
            version: "1.0".into(),
            platform: Platform::Darwin,
            install_script: "install".into(),
            uninstall_script: "uninstall".into(),
            pre_install_query: String::new(),
            post_install_script: String::new(),
            package_sha256: String::new(),
            self_service: false,
            install_during_setup: false,
        })
    }

    fn activity(host: u64, exec: &str, priority: i32) -> NewActivity {
        NewActivity {
            host_id: HostId(host),
            activity_type: ActivityType::SoftwareInstall,
            execution_id: ExecutionId::from_str(exec),
            priority: Priority(priority),
            target: Some(TargetId::SoftwareInstaller(InstallerId(1))),
            policy_id: None,
            payload: serde_json::Value::Null,
        }
    }

    fn enqueue(store: &InMemoryStore, host: u64, exec: &str, priority: i32, now: i64) -> UpcomingActivity {
        store
            .insert_activities(&[QueuedWork::new(activity(host, exec, priority))], &[], now)
            .unwrap()
            .remove(0)
    }

    /// Queues an install together with its unsent delivery record.
    fn enqueue_with_record(store: &InMemoryStore, host: u64, exec: &str, now: i64) {
        let mut record = HostDeliveryRecord::new(
            HostId(host),
            TargetId::SoftwareInstaller(InstallerId(1)),
            "App 1",
            OperationType::Install,
            now,
        );
        record.execution_id = Some(ExecutionId::from_str(exec));
        store
            .insert_activities(&[QueuedWork::new(activity(host, exec, 0)).with_record(record)], &[], now)
            .unwrap();
    }

    #[test]
    fn test_new_store_is_empty() {
        let store = InMemoryStore::new();
        assert!(store.list_hosts(Some(TeamId(1))).unwrap().is_empty());
        assert!(store.host_activities(HostId(1)).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_execution_id_rejected() {
        let store = InMemoryStore::new();
        enqueue(&store, 1, "e1", 0, 10);
        let dup = store.insert_activities(
            &[QueuedWork::new(NewActivity {
                host_id: HostId(2),
                activity_type: ActivityType::ScriptRun,
                execution_id: ExecutionId::from_str("e1"),
                priority: Priority::DEFAULT,
                target: None,
                policy_id: None,
                payload: serde_json::Value::Null,
            })],
            &[],
            11,
        );
        assert!(matches!(dup, Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_batch_with_taken_id_writes_nothing() {
        let store = InMemoryStore::new();
        enqueue(&store, 1, "e1", 0, 10);
        let target = TargetId::SoftwareInstaller(InstallerId(1));
        let discarded = HostDeliveryRecord::new(HostId(3), target.clone(), "App 1", OperationType::Install, 0);
        let res = store.insert_activities(
            &[
                QueuedWork::new(activity(2, "fresh", 0)).with_record(HostDeliveryRecord::new(
                    HostId(2),
                    target.clone(),
                    "App 1",
                    OperationType::Install,
                    11,
                )),
                QueuedWork::new(activity(2, "e1", 0)),
            ],
            &[discarded],
            11,
        );
        assert!(matches!(res, Err(Error::InvalidState(_))));
        assert!(store.host_activities(HostId(2)).unwrap().is_empty());
        assert!(store.get_delivery(HostId(2), &target).unwrap().is_none());
        assert!(store.get_delivery(HostId(3), &target).unwrap().is_none());
    }

    #[test]
    fn test_activate_next_is_exclusive() {
        let store = InMemoryStore::new();
        enqueue(&store, 1, "e1", 0, 10);
        enqueue(&store, 1, "e2", 0, 10);
        let first = store.activate_next(HostId(1), 20).unwrap();
        assert!(matches!(first, Activation::Activated(ref a) if a.execution_id.as_str() == "e1"));
        let second = store.activate_next(HostId(1), 21).unwrap();
        assert!(matches!(second, Activation::AlreadyActive(ref a) if a.execution_id.as_str() == "e1"));
        let active = store
            .host_activities(HostId(1))
            .unwrap()
            .into_iter()
            .filter(|a| a.is_activated())
            .count();
        assert_eq!(active, 1);
    }

    #[test]
    fn test_complete_moves_to_history() {
        let store = InMemoryStore::new();
        enqueue(&store, 1, "e1", 0, 10);
        store.activate_next(HostId(1), 11).unwrap();
        let done = store
            .complete_activity(&ExecutionId::from_str("e1"), &ActivityResult::Installed, 12)
            .unwrap();
        assert!(done.is_some());
        assert!(store.host_activities(HostId(1)).unwrap().is_empty());
        assert_eq!(store.past_activities(HostId(1)).unwrap().len(), 1);
        assert!(store
            .complete_activity(&ExecutionId::from_str("e1"), &ActivityResult::Installed, 13)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_complete_requires_activation() {
        let store = InMemoryStore::new();
        enqueue(&store, 1, "e1", 0, 10);
        let err = store
            .complete_activity(&ExecutionId::from_str("e1"), &ActivityResult::Installed, 11)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(store.host_activities(HostId(1)).unwrap().len(), 1);
        assert!(store.past_activities(HostId(1)).unwrap().is_empty());
    }

    #[test]
    fn test_cancel_queued_reports_active_hosts() {
        let store = InMemoryStore::new();
        enqueue(&store, 1, "e1", 0, 10);
        enqueue(&store, 1, "e2", 0, 11);
        enqueue_with_record(&store, 2, "e3", 11);
        store.activate_next(HostId(1), 12).unwrap();
        let target = TargetId::SoftwareInstaller(InstallerId(1));
        let report = store.cancel_queued_for_target(&target, 13).unwrap();
        assert_eq!(
            report.cancelled,
            vec![ExecutionId::from_str("e2"), ExecutionId::from_str("e3")]
        );
        assert!(report.hosts_with_active.contains(&HostId(1)));
        assert_eq!(report.records_canceled, 1);
        assert!(store.get_delivery(HostId(2), &target).unwrap().unwrap().canceled);
        assert_eq!(store.host_activities(HostId(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_scope_write_and_cancellation_land_together() {
        let store = InMemoryStore::new();
        store.upsert_target(&installer(1)).unwrap();
        let target = TargetId::SoftwareInstaller(InstallerId(1));
        enqueue_with_record(&store, 1, "e1", 10);

        let scope = LabelScope::new(LabelScopeKind::IncludeAny, [LabelId(4)]).unwrap();
        let plan = hostq_core::plan_side_effects(&target, TargetChange::Metadata);
        let report = store
            .apply_side_effects(&plan, TargetWrite::Scope(Some(&scope)), 20)
            .unwrap();
        assert_eq!(report.cancelled, vec![ExecutionId::from_str("e1")]);
        assert_eq!(report.records_canceled, 1);
        assert_eq!(store.label_scope(&target).unwrap(), Some(scope));

        let ghost = TargetId::SoftwareInstaller(InstallerId(404));
        let plan = hostq_core::plan_side_effects(&ghost, TargetChange::Metadata);
        let err = store
            .apply_side_effects(&plan, TargetWrite::Scope(None), 21)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_delete_guarded_by_policy() {
        let store = InMemoryStore::new();
        store.upsert_target(&installer(1)).unwrap();
        let target = TargetId::SoftwareInstaller(InstallerId(1));
        store.set_policy_target(PolicyId(9), Some(&target)).unwrap();
        enqueue(&store, 1, "e1", 0, 10);

        let plan = hostq_core::plan_side_effects(&target, TargetChange::Deleted);
        let err = store.apply_side_effects(&plan, TargetWrite::Nothing, 20).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(store.host_activities(HostId(1)).unwrap().len(), 1);

        store.set_policy_target(PolicyId(9), None).unwrap();
        let report = store.apply_side_effects(&plan, TargetWrite::Nothing, 21).unwrap();
        assert!(report.target_deleted);
        assert_eq!(report.cancelled.len(), 1);
        assert!(store.get_target(&target).unwrap().is_none());
    }

    #[test]
    fn test_transition_skips_non_matching_rows() {
        let store = InMemoryStore::new();
        let target = TargetId::SoftwareInstaller(InstallerId(1));
        let mut record = HostDeliveryRecord::new(HostId(1), target.clone(), "App 1", OperationType::Install, 0);
        record.status = Some(DeliveryStatus::Verifying);
        store.upsert_delivery(&record).unwrap();

        let updates = [
            DeliveryUpdate {
                identifiers: vec!["App 1".into()],
                transition: Transition::Acknowledge,
            },
            DeliveryUpdate {
                identifiers: vec!["App 1".into(), "Missing".into()],
                transition: Transition::Verify,
            },
        ];
        let applied = store
            .transition_deliveries(HostId(1), OperationType::Install, &updates, 5)
            .unwrap();
        assert_eq!(applied, 1);
        let stored = store.get_delivery(HostId(1), &target).unwrap().unwrap();
        assert_eq!(stored.status, Some(DeliveryStatus::Verified));
    }

    #[test]
    fn test_purge_drops_hidden_rows() {
        let store = InMemoryStore::new();
        let mut hidden = HostDeliveryRecord::new(
            HostId(1),
            TargetId::SoftwareInstaller(InstallerId(1)),
            "App 1",
            OperationType::Install,
            0,
        );
        hidden.canceled = true;
        store.upsert_delivery(&hidden).unwrap();
        store
            .upsert_delivery(&HostDeliveryRecord::new(
                HostId(2),
                TargetId::SoftwareInstaller(InstallerId(1)),
                "App 1",
                OperationType::Install,
                0,
            ))
            .unwrap();
        assert_eq!(store.purge_hidden_deliveries().unwrap(), 1);
        assert_eq!(
            store
                .target_deliveries(&TargetId::SoftwareInstaller(InstallerId(1)))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_delete_host_drops_queue() {
        let store = InMemoryStore::new();
        store.upsert_host(&host(1)).unwrap();
        enqueue(&store, 1, "e1", 0, 10);
        assert!(store.delete_host(HostId(1)).unwrap());
        assert!(store.host_activities(HostId(1)).unwrap().is_empty());
        assert!(!store.delete_host(HostId(1)).unwrap());
    }
}
