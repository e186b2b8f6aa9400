use std::collections::{BTreeMap, BTreeSet};

use crate::{
    scope::{HostLabelState, LabelScope},
    types::*,
    HostId, LabelId, TargetId,
};

/// Read-only view of one host's queue, produced by the shell from storage.
#[derive(Clone, Debug, Default)]
pub struct HostQueueSnapshot {
    pub host_id: HostId,
    pub now_unix: i64,
    pub activities: Vec<UpcomingActivity>,
}

/// A profile-like target of the host's team together with its label scope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopedProfile {
    pub target: TargetId,
    pub identifier: String,
    pub checksum: String,
    pub uploaded_at: i64,
    pub scope: Option<LabelScope>,
}

/// Everything reconciliation needs to know about one host.
#[derive(Clone, Debug)]
pub struct ProfileSnapshot {
    pub host: Host,
    pub host_labels: HostLabelState,
    pub labels: BTreeMap<LabelId, LabelInfo>,
    /// Profiles and declarations of the host's team for its platform family.
    pub candidates: Vec<ScopedProfile>,
    /// Minimum upload time per content checksum, across every team.
    pub earliest_uploads: BTreeMap<String, i64>,
    pub deliveries: Vec<HostDeliveryRecord>,
    /// Targets that already have a queued or activated activity for the host.
    pub queued: BTreeSet<TargetId>,
}
