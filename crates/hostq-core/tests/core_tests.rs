use std::collections::BTreeMap;

use hostq_core::{
    delivery, scope, DeliveryStatus, HostDeliveryRecord, HostId, HostLabelState, LabelId,
    LabelInfo, LabelMembershipType, LabelScope, LabelScopeKind, OperationType, ProfileUuid,
    Target, TargetId, Transition,
};

fn labels(entries: &[(u64, i64, bool)]) -> BTreeMap<LabelId, LabelInfo> {
    entries
        .iter()
        .map(|&(id, created_at, broken)| {
            (
                LabelId(id),
                LabelInfo {
                    id: LabelId(id),
                    name: format!("L{id}"),
                    created_at,
                    membership_type: LabelMembershipType::Dynamic,
                    broken,
                },
            )
        })
        .collect()
}

fn host(updated: i64, members: &[u64]) -> HostLabelState {
    HostLabelState {
        label_updated_at: updated,
        memberships: members.iter().map(|&m| LabelId(m)).collect(),
    }
}

#[test]
fn test_include_all_with_broken_label_never_matches() {
    let catalog = labels(&[(1, 0, true), (2, 0, false)]);
    let s = LabelScope::new(LabelScopeKind::IncludeAll, [LabelId(1), LabelId(2)]).unwrap();
    assert!(!scope::is_in_scope(Some(&s), &catalog, &host(10, &[2])));
}

#[test]
fn test_exclude_label_newer_than_host_data_is_in_scope() {
    let catalog = labels(&[(1, 50, false)]);
    let s = LabelScope::new(LabelScopeKind::ExcludeAny, [LabelId(1)]).unwrap();
    assert!(scope::is_in_scope(Some(&s), &catalog, &host(20, &[1])));
    assert!(scope::is_in_scope(Some(&s), &catalog, &host(20, &[])));
}

#[test]
fn test_scope_evaluation_is_deterministic() {
    let catalog = labels(&[(1, 0, false), (2, 0, true), (3, 90, false)]);
    let state = host(50, &[1, 3]);
    for kind in [
        LabelScopeKind::IncludeAll,
        LabelScopeKind::IncludeAny,
        LabelScopeKind::ExcludeAny,
    ] {
        let s = LabelScope::new(kind, [LabelId(1), LabelId(2), LabelId(3)]).unwrap();
        let first = scope::evaluate(Some(&s), &catalog, &state);
        let second = scope::evaluate(Some(&s), &catalog, &state);
        assert_eq!(first, second);
    }
}

#[test]
fn test_label_scope_deserialize_rejects_empty() {
    let ok: LabelScope = serde_json::from_str(r#"{"kind":"include_any","labels":[3,1,3]}"#).unwrap();
    assert_eq!(ok.labels(), &[LabelId(1), LabelId(3)]);
    assert!(serde_json::from_str::<LabelScope>(r#"{"kind":"include_any","labels":[]}"#).is_err());
}

#[test]
fn test_target_id_serializes_as_string() {
    let id = TargetId::MdmProfile(ProfileUuid::from_str("abc"));
    assert_eq!(serde_json::to_string(&id).unwrap(), r#""profile:abc""#);
    let back: TargetId = serde_json::from_str(r#""installer:5""#).unwrap();
    assert_eq!(back.kind(), "installer");
}

#[test]
fn test_target_serde_is_tagged() {
    let json = r#"{"kind":"software_installer","id":3,"title":"Firefox","platform":"darwin"}"#;
    let target: Target = serde_json::from_str(json).unwrap();
    assert_eq!(target.id().to_string(), "installer:3");
    assert_eq!(target.team_id(), None);
    assert!(!target.install_during_setup());
}

#[test]
fn test_retry_idempotence() {
    let mut record = HostDeliveryRecord::new(
        HostId(1),
        TargetId::MdmProfile(ProfileUuid::from_str("p")),
        "com.example",
        OperationType::Install,
        0,
    );
    assert!(delivery::apply_strict(&mut record, &Transition::Retry, 1).is_err());
    assert_eq!(record.retries, 0);

    record.status = Some(DeliveryStatus::Failed);
    delivery::apply_strict(&mut record, &Transition::Retry, 2).unwrap();
    delivery::apply_strict(&mut record, &Transition::Retry, 3).unwrap();
    assert_eq!(record.retries, 2);
    assert_eq!(record.effective_status(), DeliveryStatus::Pending);
}
