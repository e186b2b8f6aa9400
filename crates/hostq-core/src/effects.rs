//! Rules for what happens to queued work and delivery history when a target
//! changes or goes away. The store applies a plan atomically.

use serde::{Deserialize, Serialize};

use crate::error::{ConflictReason, Error, Result};
use crate::{ActivityType, PolicyId, TargetId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetChange {
    /// Label scope, scripts or pre-install query changed; the payload did not.
    Metadata,
    /// The installer package or profile content changed.
    Package,
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideEffectPlan {
    pub target: TargetId,
    /// Activity types referencing the target to drop, queued or activated.
    pub cancel_types: Vec<ActivityType>,
    /// Mark in-flight delivery records canceled.
    pub cancel_pending_records: bool,
    /// Hide completed delivery records from status counts.
    pub remove_completed_records: bool,
    pub delete_target: bool,
    /// Refuse the whole plan if the target still has dependents.
    pub require_no_dependents: bool,
}

impl SideEffectPlan {
    pub fn is_noop(&self) -> bool {
        self.cancel_types.is_empty()
            && !self.cancel_pending_records
            && !self.remove_completed_records
            && !self.delete_target
    }
}

pub fn plan_side_effects(target: &TargetId, change: TargetChange) -> SideEffectPlan {
    let cancel_types = match target {
        TargetId::SoftwareInstaller(_) => vec![ActivityType::SoftwareInstall, ActivityType::SoftwareUninstall],
        TargetId::VppApp(_) => vec![ActivityType::VppAppInstall],
        TargetId::MdmProfile(_) | TargetId::MdmDeclaration(_) => vec![ActivityType::MdmCommand],
    };
    let software = target.is_software();

    match change {
        // Profiles are re-reconciled on metadata changes; nothing queued goes stale.
        TargetChange::Metadata if !software => SideEffectPlan {
            target: target.clone(),
            cancel_types: vec![],
            cancel_pending_records: false,
            remove_completed_records: false,
            delete_target: false,
            require_no_dependents: false,
        },
        TargetChange::Metadata => SideEffectPlan {
            target: target.clone(),
            cancel_types,
            cancel_pending_records: true,
            remove_completed_records: false,
            delete_target: false,
            require_no_dependents: false,
        },
        TargetChange::Package => SideEffectPlan {
            target: target.clone(),
            cancel_types,
            cancel_pending_records: software,
            remove_completed_records: software,
            delete_target: false,
            require_no_dependents: false,
        },
        // Deleted profiles keep their records so reconciliation can send removals.
        TargetChange::Deleted => SideEffectPlan {
            target: target.clone(),
            cancel_types,
            cancel_pending_records: software,
            remove_completed_records: software,
            delete_target: true,
            require_no_dependents: software,
        },
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDependents {
    pub policies: Vec<PolicyId>,
    pub install_during_setup: bool,
}

/// Policy automation is reported before setup-experience usage.
pub fn check_deletable(dependents: &TargetDependents) -> Result<()> {
    if !dependents.policies.is_empty() {
        return Err(Error::Conflict(ConflictReason::PolicyAutomation {
            policies: dependents.policies.clone(),
        }));
    }
    if dependents.install_during_setup {
        return Err(Error::Conflict(ConflictReason::SetupExperience));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InstallerId, ProfileUuid};

    #[test]
    fn metadata_change_keeps_history() {
        let plan = plan_side_effects(&TargetId::SoftwareInstaller(InstallerId(1)), TargetChange::Metadata);
        assert!(plan.cancel_pending_records);
        assert!(!plan.remove_completed_records);
        assert_eq!(plan.cancel_types.len(), 2);
    }

    #[test]
    fn package_change_hides_history() {
        let plan = plan_side_effects(&TargetId::SoftwareInstaller(InstallerId(1)), TargetChange::Package);
        assert!(plan.remove_completed_records);
    }

    #[test]
    fn profile_metadata_change_is_noop() {
        let plan = plan_side_effects(
            &TargetId::MdmProfile(ProfileUuid::from_str("p")),
            TargetChange::Metadata,
        );
        assert!(plan.is_noop());
    }

    #[test]
    fn deleting_profile_skips_guards() {
        let plan = plan_side_effects(&TargetId::MdmProfile(ProfileUuid::from_str("p")), TargetChange::Deleted);
        assert!(plan.delete_target);
        assert!(!plan.require_no_dependents);
        assert!(!plan.remove_completed_records);
    }

    #[test]
    fn policy_guard_wins_over_setup_guard() {
        let deps = TargetDependents {
            policies: vec![PolicyId(4)],
            install_during_setup: true,
        };
        match check_deletable(&deps) {
            Err(Error::Conflict(ConflictReason::PolicyAutomation { policies })) => {
                assert_eq!(policies, vec![PolicyId(4)])
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(check_deletable(&TargetDependents::default()).is_ok());
    }
}
