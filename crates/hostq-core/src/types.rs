use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{ids::*, model::*};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub uuid: String,
    pub platform: Platform,
    #[serde(default)]
    pub team_id: Option<TeamId>,
    /// When label membership for this host was last refreshed.
    #[serde(default)]
    pub label_updated_at: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelInfo {
    pub id: LabelId,
    pub name: String,
    pub created_at: i64,
    #[serde(default)]
    pub membership_type: LabelMembershipType,
    /// The label was deleted while still referenced by a target's scope.
    #[serde(default)]
    pub broken: bool,
}

impl LabelInfo {
    /// A dynamic label created after the host last reported cannot have
    /// membership data for that host yet. Manual labels are never stale.
    pub fn is_stale_for(&self, label_updated_at: i64) -> bool {
        self.membership_type != LabelMembershipType::Manual && self.created_at > label_updated_at
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftwareInstaller {
    pub id: InstallerId,
    #[serde(default)]
    pub team_id: Option<TeamId>,
    pub title: String,
    #[serde(default)]
    pub version: String,
    pub platform: Platform,
    #[serde(default)]
    pub install_script: String,
    #[serde(default)]
    pub uninstall_script: String,
    #[serde(default)]
    pub pre_install_query: String,
    #[serde(default)]
    pub post_install_script: String,
    #[serde(default)]
    pub package_sha256: String,
    #[serde(default)]
    pub self_service: bool,
    #[serde(default)]
    pub install_during_setup: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdmProfile {
    pub uuid: ProfileUuid,
    #[serde(default)]
    pub team_id: Option<TeamId>,
    pub platform: ProfilePlatform,
    /// PayloadIdentifier for Apple, profile name for Windows.
    pub identifier: String,
    pub name: String,
    pub checksum: String,
    pub uploaded_at: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdmDeclaration {
    pub uuid: DeclarationUuid,
    #[serde(default)]
    pub team_id: Option<TeamId>,
    pub identifier: String,
    pub name: String,
    pub checksum: String,
    pub uploaded_at: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VppApp {
    pub id: VppAppId,
    #[serde(default)]
    pub team_id: Option<TeamId>,
    pub adam_id: String,
    pub platform: Platform,
    #[serde(default)]
    pub self_service: bool,
    #[serde(default)]
    pub install_during_setup: bool,
}

/// Hex SHA-256 of raw profile or package bytes.
pub fn content_checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    SoftwareInstaller(SoftwareInstaller),
    MdmProfile(MdmProfile),
    MdmDeclaration(MdmDeclaration),
    VppApp(VppApp),
}

impl Target {
    pub fn id(&self) -> TargetId {
        match self {
            Self::SoftwareInstaller(i) => TargetId::SoftwareInstaller(i.id),
            Self::MdmProfile(p) => TargetId::MdmProfile(p.uuid.clone()),
            Self::MdmDeclaration(d) => TargetId::MdmDeclaration(d.uuid.clone()),
            Self::VppApp(a) => TargetId::VppApp(a.id),
        }
    }

    pub fn team_id(&self) -> Option<TeamId> {
        match self {
            Self::SoftwareInstaller(i) => i.team_id,
            Self::MdmProfile(p) => p.team_id,
            Self::MdmDeclaration(d) => d.team_id,
            Self::VppApp(a) => a.team_id,
        }
    }

    /// The name delivery records carry for conditional status updates.
    pub fn identifier(&self) -> String {
        match self {
            Self::SoftwareInstaller(i) => i.title.clone(),
            Self::MdmProfile(p) => p.identifier.clone(),
            Self::MdmDeclaration(d) => d.identifier.clone(),
            Self::VppApp(a) => a.adam_id.clone(),
        }
    }

    pub fn install_during_setup(&self) -> bool {
        match self {
            Self::SoftwareInstaller(i) => i.install_during_setup,
            Self::VppApp(a) => a.install_during_setup,
            Self::MdmProfile(_) | Self::MdmDeclaration(_) => false,
        }
    }

    pub fn set_install_during_setup(&mut self, on: bool) -> bool {
        match self {
            Self::SoftwareInstaller(i) => {
                i.install_during_setup = on;
                true
            }
            Self::VppApp(a) => {
                a.install_during_setup = on;
                true
            }
            Self::MdmProfile(_) | Self::MdmDeclaration(_) => false,
        }
    }

    /// Content checksum and upload time for profile-like targets.
    pub fn content(&self) -> Option<(&str, i64)> {
        match self {
            Self::MdmProfile(p) => Some((&p.checksum, p.uploaded_at)),
            Self::MdmDeclaration(d) => Some((&d.checksum, d.uploaded_at)),
            Self::SoftwareInstaller(_) | Self::VppApp(_) => None,
        }
    }
}

/// Scheduling weight. Larger values are activated first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub i32);

impl Priority {
    pub const DEFAULT: Priority = Priority(0);
    pub const SETUP_EXPERIENCE: Priority = Priority(100);
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpcomingActivity {
    /// Store-assigned insertion order; breaks ties between equal timestamps.
    pub seq: u64,
    pub host_id: HostId,
    pub activity_type: ActivityType,
    pub execution_id: ExecutionId,
    pub priority: Priority,
    pub created_at: i64,
    pub activated_at: Option<i64>,
    pub target: Option<TargetId>,
    pub policy_id: Option<PolicyId>,
    pub payload: serde_json::Value,
}

impl UpcomingActivity {
    pub fn is_activated(&self) -> bool {
        self.activated_at.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewActivity {
    pub host_id: HostId,
    pub activity_type: ActivityType,
    pub execution_id: ExecutionId,
    pub priority: Priority,
    pub target: Option<TargetId>,
    pub policy_id: Option<PolicyId>,
    pub payload: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PastActivity {
    pub activity: UpcomingActivity,
    pub completed_at: i64,
    pub result: ActivityResult,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDeliveryRecord {
    pub host_id: HostId,
    pub target: TargetId,
    pub identifier: String,
    pub operation: OperationType,
    pub status: Option<DeliveryStatus>,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub execution_id: Option<ExecutionId>,
    pub updated_at: i64,
    /// The target's package changed after this record completed.
    #[serde(default)]
    pub removed: bool,
    /// The pending delivery was dropped before it ran.
    #[serde(default)]
    pub canceled: bool,
    /// Last time a variable embedded in the profile changed for this host.
    #[serde(default)]
    pub variables_updated_at: Option<i64>,
    /// Content checksum of the profile sent by this record's install.
    #[serde(default)]
    pub checksum: Option<String>,
}

impl HostDeliveryRecord {
    pub fn new(
        host_id: HostId,
        target: TargetId,
        identifier: impl Into<String>,
        operation: OperationType,
        now: i64,
    ) -> Self {
        Self {
            host_id,
            target,
            identifier: identifier.into(),
            operation,
            status: None,
            detail: String::new(),
            retries: 0,
            execution_id: None,
            updated_at: now,
            removed: false,
            canceled: false,
            variables_updated_at: None,
            checksum: None,
        }
    }

    /// Status as reported to users; a missing status counts as pending.
    pub fn effective_status(&self) -> DeliveryStatus {
        self.status.unwrap_or(DeliveryStatus::Pending)
    }

    /// Removed and canceled records stay in storage but are never reported.
    pub fn is_hidden(&self) -> bool {
        self.removed || self.canceled
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedProfile {
    pub target: TargetId,
    pub identifier: String,
    pub checksum: String,
    /// Earliest time any profile with this content was uploaded, pushed
    /// forward by later variable changes.
    pub earliest_install_date: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileStatusSummary {
    pub pending: u64,
    pub verifying: u64,
    pub verified: u64,
    pub failed: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerStatusSummary {
    pub installed: u64,
    pub pending_install: u64,
    pub failed_install: u64,
    pub pending_uninstall: u64,
    pub failed_uninstall: u64,
}

impl InstallerStatusSummary {
    pub fn add(&mut self, status: SoftwareStatus) {
        match status {
            SoftwareStatus::Installed => self.installed += 1,
            SoftwareStatus::PendingInstall => self.pending_install += 1,
            SoftwareStatus::FailedInstall => self.failed_install += 1,
            SoftwareStatus::PendingUninstall => self.pending_uninstall += 1,
            SoftwareStatus::FailedUninstall => self.failed_uninstall += 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostLastInstall {
    pub execution_id: ExecutionId,
    pub status: SoftwareStatus,
}
