use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{ids::*, types::*};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActivationPlan {
    Idle,
    AlreadyActive(ExecutionId),
    Activate(ExecutionId),
}

/// Result of an atomic activate-next in the store.
#[derive(Clone, Debug, PartialEq)]
pub enum Activation {
    Idle,
    AlreadyActive(UpcomingActivity),
    Activated(UpcomingActivity),
}

impl Activation {
    pub fn newly_activated(self) -> Option<UpcomingActivity> {
        match self {
            Self::Activated(a) => Some(a),
            Self::Idle | Self::AlreadyActive(_) => None,
        }
    }
}

/// What a cancellation pass touched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelReport {
    pub cancelled: Vec<ExecutionId>,
    /// Hosts whose activated activity was dropped; they need re-activation.
    pub hosts_to_activate: BTreeSet<HostId>,
    /// Queued-only cancellations leave activated work running on these hosts.
    pub hosts_with_active: BTreeSet<HostId>,
    pub records_canceled: usize,
    pub records_removed: usize,
    pub target_deleted: bool,
}

impl CancelReport {
    pub fn merge(&mut self, other: CancelReport) {
        self.cancelled.extend(other.cancelled);
        self.hosts_to_activate.extend(other.hosts_to_activate);
        self.hosts_with_active.extend(other.hosts_with_active);
        self.records_canceled += other.records_canceled;
        self.records_removed += other.records_removed;
        self.target_deleted |= other.target_deleted;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDiff {
    pub to_install: Vec<ExpectedProfile>,
    pub to_remove: Vec<HostDeliveryRecord>,
    /// Installs never sent for targets that are no longer expected.
    pub to_discard: Vec<TargetId>,
}

impl ProfileDiff {
    pub fn is_empty(&self) -> bool {
        self.to_install.is_empty() && self.to_remove.is_empty() && self.to_discard.is_empty()
    }
}

/// Identifiers to move in one verification batch, per outcome.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationBatch {
    pub verify: Vec<String>,
    pub fail: Vec<String>,
    pub retry: Vec<String>,
}

impl VerificationBatch {
    pub fn is_empty(&self) -> bool {
        self.verify.is_empty() && self.fail.is_empty() && self.retry.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub hosts: usize,
    pub installs_enqueued: usize,
    pub removals_enqueued: usize,
    pub discarded: usize,
}

impl ReconcileReport {
    pub fn merge(&mut self, other: ReconcileReport) {
        self.hosts += other.hosts;
        self.installs_enqueued += other.installs_enqueued;
        self.removals_enqueued += other.removals_enqueued;
        self.discarded += other.discarded;
    }
}
