use hostq_core::{
    plan_side_effects, CancelReport, Error, HostId, LabelScope, PolicyId, Result, Target,
    TargetChange, TargetId,
};

use hostq_storage::TargetWrite;

use crate::Engine;

impl Engine {
    /// Stores a new version of a software installer or VPP app and cancels
    /// work made stale by the change.
    ///
    /// A package change also hides completed delivery records; a metadata
    /// change leaves them alone. The new version and its side effects are
    /// stored in one transaction.
    pub fn process_installer_update(
        &self,
        updated: &Target,
        metadata_changed: bool,
        package_changed: bool,
    ) -> Result<CancelReport> {
        let id = updated.id();
        if !id.is_software() {
            return Err(Error::InvalidState(format!("{id} is not software")));
        }
        self.target(&id)?;
        let change = match (metadata_changed, package_changed) {
            (_, true) => TargetChange::Package,
            (true, false) => TargetChange::Metadata,
            (false, false) => {
                self.store.upsert_target(updated)?;
                return Ok(CancelReport::default());
            }
        };
        self.apply_change(&id, change, TargetWrite::Upsert(updated))
    }

    /// Replaces the target's label scope. Software already queued under the
    /// old scope is cancelled; profiles converge on the next reconcile.
    pub fn set_label_scope(&self, target: &TargetId, scope: Option<&LabelScope>) -> Result<CancelReport> {
        self.target(target)?;
        if self.store.label_scope(target)?.as_ref() == scope {
            return Ok(CancelReport::default());
        }
        self.apply_change(target, TargetChange::Metadata, TargetWrite::Scope(scope))
    }

    /// Deletes a target. Software still used by policy automation or the
    /// setup experience is refused with `Conflict` and nothing changes.
    pub fn delete_target(&self, target: &TargetId) -> Result<CancelReport> {
        match self.apply_change(target, TargetChange::Deleted, TargetWrite::Nothing) {
            Err(Error::Conflict(reason)) => {
                tracing::info!(target_id = %target, %reason, "delete refused");
                Err(Error::Conflict(reason))
            }
            other => other,
        }
    }

    /// Points a policy's automatic install at software, or clears it.
    pub fn set_policy_automation(&self, policy: PolicyId, target: Option<&TargetId>) -> Result<()> {
        if let Some(t) = target {
            if !t.is_software() {
                return Err(Error::InvalidState(format!(
                    "policy automation cannot install {t}"
                )));
            }
            self.target(t)?;
        }
        self.store.set_policy_target(policy, target)
    }

    pub fn set_install_during_setup(&self, target: &TargetId, on: bool) -> Result<()> {
        let mut resolved = self.target(target)?;
        if !resolved.set_install_during_setup(on) {
            return Err(Error::InvalidState(format!(
                "{target} cannot be installed during setup"
            )));
        }
        self.store.upsert_target(&resolved)
    }

    fn apply_change(&self, target: &TargetId, change: TargetChange, write: TargetWrite<'_>) -> Result<CancelReport> {
        let plan = plan_side_effects(target, change);
        if plan.is_noop() && matches!(write, TargetWrite::Nothing) {
            return Ok(CancelReport::default());
        }
        let report = self.store.apply_side_effects(&plan, write, self.now())?;
        let hosts: Vec<HostId> = report.hosts_to_activate.iter().copied().collect();
        self.activate_next_for_hosts(&hosts)?;
        tracing::info!(
            target_id = %target,
            change = ?change,
            cancelled = report.cancelled.len(),
            reactivated = hosts.len(),
            records_canceled = report.records_canceled,
            records_removed = report.records_removed,
            "side effects applied"
        );
        Ok(report)
    }
}
