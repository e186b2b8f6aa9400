use std::collections::BTreeMap;

use hostq_core::{
    Activation, ActivityResult, CancelReport, DeliveryStatus, ExecutionId, Host,
    HostDeliveryRecord, HostId, HostLabelState, LabelId, LabelInfo, LabelScope, NewActivity,
    OperationType, PastActivity, PolicyId, Result, SideEffectPlan, Target, TargetDependents,
    TargetId, TeamId, Transition, UpcomingActivity,
};

/// One conditional status change over a set of identifiers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryUpdate {
    pub identifiers: Vec<String>,
    pub transition: Transition,
}

/// An activity to queue together with the delivery record it refreshes.
#[derive(Clone, Debug)]
pub struct QueuedWork {
    pub activity: NewActivity,
    pub record: Option<HostDeliveryRecord>,
}

impl QueuedWork {
    pub fn new(activity: NewActivity) -> Self {
        Self {
            activity,
            record: None,
        }
    }

    pub fn with_record(mut self, record: HostDeliveryRecord) -> Self {
        self.record = Some(record);
        self
    }
}

/// A change to the target written in the same transaction as the side
/// effects it causes.
#[derive(Clone, Copy, Debug, Default)]
pub enum TargetWrite<'a> {
    #[default]
    Nothing,
    Upsert(&'a Target),
    /// Replaces the label scope; `None` clears it.
    Scope(Option<&'a LabelScope>),
}

/// Typed persistence for the engine.
///
/// Every method is one transaction. Composite methods (`insert_activities`,
/// `activate_next`, `complete_activity`, `apply_side_effects`,
/// `transition_deliveries`) are atomic so that concurrent callers never
/// observe half-applied state.
///
/// Whenever an activity is dropped, its delivery record is marked canceled
/// in the same transaction if the command was never sent.
pub trait Store: Send + Sync {
    fn upsert_host(&self, host: &Host) -> Result<()>;
    fn get_host(&self, id: HostId) -> Result<Option<Host>>;
    /// Hosts of a team; `None` lists hosts without a team.
    fn list_hosts(&self, team: Option<TeamId>) -> Result<Vec<Host>>;
    /// Drops the host with its queued activities and delivery records.
    fn delete_host(&self, id: HostId) -> Result<bool>;

    fn upsert_label(&self, label: &LabelInfo) -> Result<()>;
    fn mark_label_broken(&self, id: LabelId) -> Result<bool>;
    /// Known labels among `ids`; unknown ids are simply absent.
    fn get_labels(&self, ids: &[LabelId]) -> Result<BTreeMap<LabelId, LabelInfo>>;
    fn set_label_membership(&self, host: HostId, label: LabelId, member: bool) -> Result<()>;
    /// Batch fetch of membership and label refresh time per host.
    fn host_label_states(&self, hosts: &[HostId]) -> Result<BTreeMap<HostId, HostLabelState>>;

    fn upsert_target(&self, target: &Target) -> Result<()>;
    fn get_target(&self, id: &TargetId) -> Result<Option<Target>>;
    fn list_targets(&self, team: Option<TeamId>) -> Result<Vec<Target>>;
    /// (checksum, uploaded_at) for every profile and declaration of every team.
    fn content_uploads(&self) -> Result<Vec<(String, i64)>>;
    /// Replaces the target's label rows; `None` clears them.
    fn set_label_scope(&self, target: &TargetId, scope: Option<&LabelScope>) -> Result<()>;
    fn label_scope(&self, target: &TargetId) -> Result<Option<LabelScope>>;

    /// Points a policy's automatic install at a target, or clears it.
    fn set_policy_target(&self, policy: PolicyId, target: Option<&TargetId>) -> Result<()>;
    fn target_dependents(&self, target: &TargetId) -> Result<TargetDependents>;

    /// Queues every activity, writes each one's delivery record, then writes
    /// `records`. A taken execution id fails the whole batch with
    /// `InvalidState` and nothing is written.
    fn insert_activities(
        &self,
        work: &[QueuedWork],
        records: &[HostDeliveryRecord],
        now: i64,
    ) -> Result<Vec<UpcomingActivity>>;
    fn get_activity(&self, execution_id: &ExecutionId) -> Result<Option<UpcomingActivity>>;
    fn host_activities(&self, host: HostId) -> Result<Vec<UpcomingActivity>>;
    fn target_activities(&self, target: &TargetId) -> Result<Vec<UpcomingActivity>>;
    fn past_activities(&self, host: HostId) -> Result<Vec<PastActivity>>;

    /// Activates the host's next activity unless one is already activated.
    fn activate_next(&self, host: HostId, now: i64) -> Result<Activation>;
    /// Batch form; returns only the activities it activated.
    fn activate_next_for_hosts(&self, hosts: &[HostId], now: i64) -> Result<Vec<UpcomingActivity>>;
    /// Moves the activity into history. `None` if it was not queued;
    /// `InvalidState` if it was never activated.
    fn complete_activity(
        &self,
        execution_id: &ExecutionId,
        result: &ActivityResult,
        now: i64,
    ) -> Result<Option<UpcomingActivity>>;
    /// Drops queued (not activated) activities referencing the target.
    fn cancel_queued_for_target(&self, target: &TargetId, now: i64) -> Result<CancelReport>;
    /// Drops every activity, queued or activated, started by the policy and
    /// forgets the policy.
    fn cancel_policy_activities(&self, policy: PolicyId, now: i64) -> Result<CancelReport>;
    /// Writes the target change, then applies the side-effect plan. With
    /// `require_no_dependents` set, fails with `Conflict` without writing
    /// anything.
    fn apply_side_effects(
        &self,
        plan: &SideEffectPlan,
        write: TargetWrite<'_>,
        now: i64,
    ) -> Result<CancelReport>;

    fn upsert_delivery(&self, record: &HostDeliveryRecord) -> Result<()>;
    fn get_delivery(&self, host: HostId, target: &TargetId) -> Result<Option<HostDeliveryRecord>>;
    fn find_delivery(&self, execution_id: &ExecutionId) -> Result<Option<HostDeliveryRecord>>;
    fn host_deliveries(&self, host: HostId) -> Result<Vec<HostDeliveryRecord>>;
    fn target_deliveries(&self, target: &TargetId) -> Result<Vec<HostDeliveryRecord>>;
    /// Applies one transition to a single record. `NotFound` if there is no
    /// record; with `strict`, `InvalidState` if the status does not allow it.
    fn update_delivery(
        &self,
        host: HostId,
        target: &TargetId,
        transition: &Transition,
        strict: bool,
        now: i64,
    ) -> Result<HostDeliveryRecord>;
    /// Conditional batch update of the host's records for one operation.
    /// Records whose status does not allow a transition are skipped.
    fn transition_deliveries(
        &self,
        host: HostId,
        operation: OperationType,
        updates: &[DeliveryUpdate],
        now: i64,
    ) -> Result<usize>;
    /// Clears the status of every visible record of the target in `status`.
    fn resend_deliveries(&self, target: &TargetId, status: DeliveryStatus, now: i64) -> Result<usize>;
    fn purge_hidden_deliveries(&self) -> Result<usize>;
}
