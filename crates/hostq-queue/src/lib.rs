use std::collections::BTreeMap;

use hostq_core::{
    display_order, ActivityType, DeliveryStatus, ExecutionId, ExpectedProfile, HostDeliveryRecord,
    OperationType, UpcomingActivity, VerificationBatch,
};

/// What a host's profile report says about one expected profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    Confirmed,
    /// Present, but installed before the content we expect was uploaded.
    Outdated,
    Missing,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Fail { detail: String },
}

pub fn observe(expected: &ExpectedProfile, reported_installed_at: Option<i64>) -> Observation {
    match reported_installed_at {
        None => Observation::Missing,
        Some(at) if at < expected.earliest_install_date => Observation::Outdated,
        Some(_) => Observation::Confirmed,
    }
}

/// Verification retry policy: an unconfirmed profile is re-sent until it has
/// been retried `max_retries` times, then marked failed.
pub fn decide_retry(observation: Observation, retries: u32, max_retries: u32) -> RetryDecision {
    if retries < max_retries {
        return RetryDecision::Retry;
    }
    let detail = match observation {
        Observation::Outdated => "installed profile is older than the expected content",
        Observation::Missing | Observation::Confirmed => "profile not reported by host",
    };
    RetryDecision::Fail {
        detail: detail.to_string(),
    }
}

/// Sorts expected profiles into verify/fail/retry from a host report.
///
/// Only installs the host has acknowledged are checked. Installs of content
/// that has since changed wait for reconciliation to send the new version.
/// A verified profile that disappears is a regression and fails without
/// retrying.
pub fn classify_verification(
    expected: &BTreeMap<String, ExpectedProfile>,
    reported: &BTreeMap<String, i64>,
    deliveries: &[HostDeliveryRecord],
    max_retries: u32,
) -> (VerificationBatch, Vec<(String, String)>) {
    let mut batch = VerificationBatch::default();
    let mut failure_details = Vec::new();

    for record in deliveries {
        if record.operation != OperationType::Install || record.is_hidden() {
            continue;
        }
        let Some(profile) = expected.get(&record.identifier) else {
            continue;
        };
        let stale = record.checksum.as_ref().is_some_and(|c| *c != profile.checksum);
        if profile.target != record.target || stale {
            continue;
        }
        let observation = observe(profile, reported.get(&record.identifier).copied());
        match (record.status, observation) {
            (Some(DeliveryStatus::Verifying), Observation::Confirmed) => {
                batch.verify.push(record.identifier.clone())
            }
            (Some(DeliveryStatus::Verifying), obs) => {
                match decide_retry(obs, record.retries, max_retries) {
                    RetryDecision::Retry => batch.retry.push(record.identifier.clone()),
                    RetryDecision::Fail { detail } => {
                        batch.fail.push(record.identifier.clone());
                        failure_details.push((record.identifier.clone(), detail));
                    }
                }
            }
            (Some(DeliveryStatus::Verified), Observation::Missing | Observation::Outdated) => {
                batch.fail.push(record.identifier.clone());
                failure_details.push((
                    record.identifier.clone(),
                    "profile no longer reported by host".to_string(),
                ));
            }
            _ => {}
        }
    }
    (batch, failure_details)
}

fn is_software_install(a: &UpcomingActivity) -> bool {
    matches!(
        a.activity_type,
        ActivityType::SoftwareInstall | ActivityType::VppAppInstall
    )
}

/// Software installs still waiting for the host, activated one first.
pub fn pending_installs(activities: &[UpcomingActivity]) -> Vec<ExecutionId> {
    let mut installs: Vec<&UpcomingActivity> =
        activities.iter().filter(|a| is_software_install(a)).collect();
    installs.sort_by(|a, b| display_order(a, b));
    installs.into_iter().map(|a| a.execution_id.clone()).collect()
}

/// Software installs the host may run right now.
pub fn ready_installs(activities: &[UpcomingActivity]) -> Vec<ExecutionId> {
    activities
        .iter()
        .filter(|a| is_software_install(a) && a.is_activated())
        .map(|a| a.execution_id.clone())
        .collect()
}
