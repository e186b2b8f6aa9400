//! Label scoping: decides whether a host is targeted by something that
//! carries an include/exclude label rule.
//!
//! A target without a scope applies to every host of its team. Broken and
//! stale labels never cause a target to be withheld on the basis of data the
//! host could not have reported yet; when in doubt the target is applied.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::LabelId;
use crate::model::LabelScopeKind;
use crate::types::LabelInfo;

/// A non-empty set of labels sharing one scope kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawLabelScope")]
pub struct LabelScope {
    kind: LabelScopeKind,
    labels: Vec<LabelId>,
}

#[derive(Deserialize)]
struct RawLabelScope {
    kind: LabelScopeKind,
    labels: Vec<LabelId>,
}

impl TryFrom<RawLabelScope> for LabelScope {
    type Error = Error;

    fn try_from(raw: RawLabelScope) -> Result<Self> {
        LabelScope::new(raw.kind, raw.labels)
    }
}

/// One persisted association between a target and a label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelScopeRow {
    pub label_id: LabelId,
    pub kind: LabelScopeKind,
}

impl LabelScope {
    pub fn new(kind: LabelScopeKind, labels: impl IntoIterator<Item = LabelId>) -> Result<Self> {
        let labels: BTreeSet<LabelId> = labels.into_iter().collect();
        if labels.is_empty() {
            return Err(Error::InvalidState(format!(
                "{kind} label scope needs at least one label"
            )));
        }
        Ok(Self {
            kind,
            labels: labels.into_iter().collect(),
        })
    }

    /// Rebuilds a scope from its stored association rows. No rows means the
    /// target is unscoped; rows of different kinds are a corrupt scope.
    pub fn from_rows(rows: &[LabelScopeRow]) -> Result<Option<Self>> {
        let Some(first) = rows.first() else {
            return Ok(None);
        };
        if let Some(other) = rows.iter().find(|r| r.kind != first.kind) {
            return Err(Error::InvalidState(format!(
                "label scope mixes {} and {}",
                first.kind, other.kind
            )));
        }
        Self::new(first.kind, rows.iter().map(|r| r.label_id)).map(Some)
    }

    pub fn to_rows(&self) -> Vec<LabelScopeRow> {
        self.labels
            .iter()
            .map(|&label_id| LabelScopeRow {
                label_id,
                kind: self.kind,
            })
            .collect()
    }

    pub fn kind(&self) -> LabelScopeKind {
        self.kind
    }

    pub fn labels(&self) -> &[LabelId] {
        &self.labels
    }
}

/// What is known about one host's labels at evaluation time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostLabelState {
    pub label_updated_at: i64,
    pub memberships: BTreeSet<LabelId>,
}

impl HostLabelState {
    pub fn is_member(&self, label: LabelId) -> bool {
        self.memberships.contains(&label)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeDecision {
    Unscoped,
    Included,
    NotIncluded,
    Excluded(LabelId),
    /// An exclude label is broken and the host has reported since it was
    /// created, so the exclusion cannot be trusted.
    UnreliableExclusion(LabelId),
    NoReliableExclusion,
}

impl ScopeDecision {
    pub fn in_scope(&self) -> bool {
        !matches!(self, Self::NotIncluded | Self::Excluded(_))
    }
}

/// Labels missing from `labels` are treated as broken and not stale.
pub fn evaluate(
    scope: Option<&LabelScope>,
    labels: &BTreeMap<LabelId, LabelInfo>,
    host: &HostLabelState,
) -> ScopeDecision {
    let Some(scope) = scope else {
        return ScopeDecision::Unscoped;
    };
    let usable = |id: &LabelId| labels.get(id).is_some_and(|l| !l.broken) && host.is_member(*id);

    match scope.kind {
        LabelScopeKind::IncludeAll => {
            if scope.labels.iter().all(usable) {
                ScopeDecision::Included
            } else {
                ScopeDecision::NotIncluded
            }
        }
        LabelScopeKind::IncludeAny => {
            if scope.labels.iter().any(usable) {
                ScopeDecision::Included
            } else {
                ScopeDecision::NotIncluded
            }
        }
        LabelScopeKind::ExcludeAny => {
            let mut excluded_by = None;
            for &id in &scope.labels {
                match labels.get(&id) {
                    None => return ScopeDecision::UnreliableExclusion(id),
                    Some(l) if l.is_stale_for(host.label_updated_at) => {}
                    Some(l) if l.broken => return ScopeDecision::UnreliableExclusion(id),
                    Some(_) if host.is_member(id) => {
                        excluded_by.get_or_insert(id);
                    }
                    Some(_) => {}
                }
            }
            match excluded_by {
                Some(id) => ScopeDecision::Excluded(id),
                None => ScopeDecision::NoReliableExclusion,
            }
        }
    }
}

pub fn is_in_scope(
    scope: Option<&LabelScope>,
    labels: &BTreeMap<LabelId, LabelInfo>,
    host: &HostLabelState,
) -> bool {
    evaluate(scope, labels, host).in_scope()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LabelMembershipType;

    fn label(id: u64, created_at: i64) -> LabelInfo {
        LabelInfo {
            id: LabelId(id),
            name: format!("label-{id}"),
            created_at,
            membership_type: LabelMembershipType::Dynamic,
            broken: false,
        }
    }

    fn catalog(labels: Vec<LabelInfo>) -> BTreeMap<LabelId, LabelInfo> {
        labels.into_iter().map(|l| (l.id, l)).collect()
    }

    fn host(updated: i64, members: &[u64]) -> HostLabelState {
        HostLabelState {
            label_updated_at: updated,
            memberships: members.iter().map(|&m| LabelId(m)).collect(),
        }
    }

    fn scope(kind: LabelScopeKind, ids: &[u64]) -> LabelScope {
        LabelScope::new(kind, ids.iter().map(|&i| LabelId(i))).unwrap()
    }

    #[test]
    fn empty_scope_is_rejected() {
        assert!(LabelScope::new(LabelScopeKind::IncludeAny, Vec::<LabelId>::new()).is_err());
    }

    #[test]
    fn rows_with_mixed_kinds_are_invalid() {
        let rows = [
            LabelScopeRow { label_id: LabelId(1), kind: LabelScopeKind::IncludeAny },
            LabelScopeRow { label_id: LabelId(2), kind: LabelScopeKind::ExcludeAny },
        ];
        assert!(matches!(LabelScope::from_rows(&rows), Err(Error::InvalidState(_))));
        assert_eq!(LabelScope::from_rows(&[]).unwrap(), None);
    }

    #[test]
    fn unscoped_target_applies_everywhere() {
        assert!(is_in_scope(None, &BTreeMap::new(), &host(0, &[])));
    }

    #[test]
    fn include_all_needs_every_label() {
        let labels = catalog(vec![label(1, 0), label(2, 0)]);
        let s = scope(LabelScopeKind::IncludeAll, &[1, 2]);
        assert!(is_in_scope(Some(&s), &labels, &host(10, &[1, 2])));
        assert!(!is_in_scope(Some(&s), &labels, &host(10, &[1])));
    }

    #[test]
    fn include_all_fails_on_broken_label() {
        let mut broken = label(2, 0);
        broken.broken = true;
        let labels = catalog(vec![label(1, 0), broken]);
        let s = scope(LabelScopeKind::IncludeAll, &[1, 2]);
        assert!(!is_in_scope(Some(&s), &labels, &host(10, &[1, 2])));
    }

    #[test]
    fn include_any_ignores_broken_labels() {
        let mut broken = label(2, 0);
        broken.broken = true;
        let labels = catalog(vec![label(1, 0), broken]);
        let s = scope(LabelScopeKind::IncludeAny, &[1, 2]);
        assert!(is_in_scope(Some(&s), &labels, &host(10, &[1])));
        assert!(!is_in_scope(Some(&s), &labels, &host(10, &[2])));
    }

    #[test]
    fn exclude_any_with_membership_is_out() {
        let labels = catalog(vec![label(1, 5), label(2, 5)]);
        let s = scope(LabelScopeKind::ExcludeAny, &[1, 2]);
        assert!(!is_in_scope(Some(&s), &labels, &host(10, &[2])));
        assert!(is_in_scope(Some(&s), &labels, &host(10, &[3])));
    }

    #[test]
    fn exclude_any_ignores_labels_newer_than_host_data() {
        let labels = catalog(vec![label(1, 100)]);
        let s = scope(LabelScopeKind::ExcludeAny, &[1]);
        assert!(is_in_scope(Some(&s), &labels, &host(50, &[])));
        assert!(is_in_scope(Some(&s), &labels, &host(50, &[1])));
    }

    #[test]
    fn manual_labels_are_never_stale() {
        let mut manual = label(1, 100);
        manual.membership_type = LabelMembershipType::Manual;
        let labels = catalog(vec![manual]);
        let s = scope(LabelScopeKind::ExcludeAny, &[1]);
        assert!(!is_in_scope(Some(&s), &labels, &host(50, &[1])));
    }

    #[test]
    fn broken_exclude_label_makes_exclusion_unreliable() {
        let mut broken = label(2, 5);
        broken.broken = true;
        let labels = catalog(vec![label(1, 5), broken]);
        let s = scope(LabelScopeKind::ExcludeAny, &[1, 2]);
        let decision = evaluate(Some(&s), &labels, &host(10, &[1]));
        assert_eq!(decision, ScopeDecision::UnreliableExclusion(LabelId(2)));
        assert!(decision.in_scope());
    }

    #[test]
    fn broken_label_newer_than_host_data_is_ignored() {
        let mut broken = label(2, 50);
        broken.broken = true;
        let labels = catalog(vec![label(1, 5), broken]);
        let s = scope(LabelScopeKind::ExcludeAny, &[1, 2]);
        assert_eq!(
            evaluate(Some(&s), &labels, &host(10, &[1])),
            ScopeDecision::Excluded(LabelId(1))
        );
    }
}
