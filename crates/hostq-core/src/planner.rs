use std::cmp::Ordering;

use crate::{ActivationPlan, HostQueueSnapshot, UpcomingActivity};

/// Activation order: higher priority first, then oldest, then insertion order.
pub fn activation_order(a: &UpcomingActivity, b: &UpcomingActivity) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.seq.cmp(&b.seq))
}

/// Listing order: the activated activity first, the rest in activation order.
pub fn display_order(a: &UpcomingActivity, b: &UpcomingActivity) -> Ordering {
    b.is_activated()
        .cmp(&a.is_activated())
        .then_with(|| activation_order(a, b))
}

/// Decides what the shell should activate for one host.
///
/// At most one activity per host may be activated; if one already is, the
/// plan is to leave it alone.
pub fn plan_next_activation(snapshot: &HostQueueSnapshot) -> ActivationPlan {
    if let Some(active) = snapshot.activities.iter().find(|a| a.is_activated()) {
        return ActivationPlan::AlreadyActive(active.execution_id.clone());
    }
    snapshot
        .activities
        .iter()
        .min_by(|a, b| activation_order(a, b))
        .map(|a| ActivationPlan::Activate(a.execution_id.clone()))
        .unwrap_or(ActivationPlan::Idle)
}
