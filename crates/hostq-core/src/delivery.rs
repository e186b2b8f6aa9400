//! Delivery status state machine.
//!
//! Every status change goes through [`next_status`], so the in-memory and
//! SQLite stores apply exactly the same conditional updates.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::DeliveryStatus;
use crate::types::HostDeliveryRecord;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum Transition {
    /// Transport acknowledged receipt.
    Acknowledge,
    /// An observation confirmed the target is applied.
    Verify,
    Fail { detail: String },
    /// Send again and count the attempt.
    Retry,
    /// Clear the status so the target is dispatched again, without counting.
    Resend,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Acknowledge => "acknowledge",
            Self::Verify => "verify",
            Self::Fail { .. } => "fail",
            Self::Retry => "retry",
            Self::Resend => "resend",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Step {
    pub status: Option<DeliveryStatus>,
    pub detail: Option<String>,
    pub bump_retries: bool,
}

/// The status a record moves to, or `None` when the transition does not
/// apply from `current`.
pub fn next_status(current: Option<DeliveryStatus>, transition: &Transition) -> Option<Step> {
    use DeliveryStatus::*;

    let step = |status, detail: Option<String>, bump_retries| {
        Some(Step {
            status,
            detail,
            bump_retries,
        })
    };
    match (transition, current) {
        (Transition::Acknowledge, Some(Pending)) => step(Some(Verifying), None, false),
        (Transition::Verify, Some(Pending | Verifying)) => {
            step(Some(Verified), Some(String::new()), false)
        }
        (Transition::Fail { detail }, Some(Pending)) => step(Some(Failed), Some(detail.clone()), false),
        (Transition::Fail { detail }, Some(Verifying)) => step(
            Some(Failed),
            Some(regression_detail(detail, "was verifying")),
            false,
        ),
        (Transition::Fail { detail }, Some(Verified)) => step(
            Some(Failed),
            Some(regression_detail(detail, "was verified")),
            false,
        ),
        (Transition::Retry, Some(Pending | Verifying | Failed)) => {
            step(Some(Pending), Some(String::new()), true)
        }
        (Transition::Resend, _) => step(None, Some(String::new()), false),
        _ => None,
    }
}

fn regression_detail(detail: &str, was: &str) -> String {
    if detail.is_empty() {
        format!("failed, {was}")
    } else {
        format!("{detail} (failed, {was})")
    }
}

/// Conditional update: applies the transition if the record's status allows
/// it and reports whether anything changed.
pub fn apply(record: &mut HostDeliveryRecord, transition: &Transition, now: i64) -> bool {
    let Some(step) = next_status(record.status, transition) else {
        return false;
    };
    record.status = step.status;
    if let Some(detail) = step.detail {
        record.detail = detail;
    }
    if step.bump_retries {
        record.retries += 1;
    }
    record.updated_at = now;
    true
}

/// Like [`apply`], but a transition that does not fit the current status is
/// an error rather than a no-op.
pub fn apply_strict(record: &mut HostDeliveryRecord, transition: &Transition, now: i64) -> Result<()> {
    if apply(record, transition, now) {
        return Ok(());
    }
    let current = record.status.map_or("null", |s| s.as_str());
    Err(Error::InvalidState(format!(
        "cannot {} delivery of {} to host {} from status {current}",
        transition.name(),
        record.target,
        record.host_id,
    )))
}
