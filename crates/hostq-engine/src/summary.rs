use std::collections::BTreeMap;

use hostq_core::{
    ActivityType, DeliveryStatus, HostId, InstallerStatusSummary, OperationType,
    ProfileStatusSummary, Result, SoftwareStatus, TargetId,
};

use crate::Engine;

impl Engine {
    /// Per-host software status for one installer or VPP app.
    ///
    /// Work still queued for a host wins over that host's last delivery
    /// record; hosts with neither are not counted.
    pub fn installer_status_summary(&self, target: &TargetId) -> Result<InstallerStatusSummary> {
        self.target(target)?;
        let mut latest: BTreeMap<HostId, SoftwareStatus> = BTreeMap::new();

        for record in self.store.target_deliveries(target)? {
            if record.is_hidden() {
                continue;
            }
            if let Some(status) = SoftwareStatus::derive(record.operation, record.status) {
                latest.insert(record.host_id, status);
            }
        }

        let mut upcoming = self.store.target_activities(target)?;
        upcoming.sort_by_key(|a| (a.created_at, a.seq));
        for activity in upcoming {
            let status = match activity.activity_type {
                ActivityType::SoftwareUninstall => SoftwareStatus::PendingUninstall,
                ActivityType::SoftwareInstall | ActivityType::VppAppInstall => {
                    SoftwareStatus::PendingInstall
                }
                ActivityType::ScriptRun | ActivityType::MdmCommand => continue,
            };
            latest.insert(activity.host_id, status);
        }

        let mut summary = InstallerStatusSummary::default();
        for status in latest.into_values() {
            summary.add(status);
        }
        Ok(summary)
    }

    /// Delivery counts for one profile or declaration. A removal that went
    /// through leaves nothing to count.
    pub fn profile_status_summary(&self, target: &TargetId) -> Result<ProfileStatusSummary> {
        let mut summary = ProfileStatusSummary::default();
        for record in self.store.target_deliveries(target)? {
            if record.is_hidden() {
                continue;
            }
            let status = record.effective_status();
            if record.operation == OperationType::Remove && status == DeliveryStatus::Verified {
                continue;
            }
            match status {
                DeliveryStatus::Pending => summary.pending += 1,
                DeliveryStatus::Verifying => summary.verifying += 1,
                DeliveryStatus::Verified => summary.verified += 1,
                DeliveryStatus::Failed => summary.failed += 1,
            }
        }
        Ok(summary)
    }
}
