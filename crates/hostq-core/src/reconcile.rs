//! Desired-state maths for configuration profiles.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    scope, ExpectedProfile, HostDeliveryRecord, OperationType, ProfileDiff, ProfileSnapshot,
    TargetId,
};

/// Minimum upload time per checksum. Re-uploading identical content under a
/// new name must not make hosts look out of date.
pub fn earliest_uploads<'a, I>(contents: I) -> BTreeMap<String, i64>
where
    I: IntoIterator<Item = (&'a str, i64)>,
{
    let mut earliest = BTreeMap::new();
    for (checksum, uploaded_at) in contents {
        earliest
            .entry(checksum.to_string())
            .and_modify(|t: &mut i64| *t = (*t).min(uploaded_at))
            .or_insert(uploaded_at);
    }
    earliest
}

/// The profiles a host should have, keyed by identifier.
///
/// A profile is expected when it belongs to the host's team and platform
/// family and the host is in its label scope. Profiles sharing an identifier
/// resolve to the first by target id.
pub fn expected_profiles(snapshot: &ProfileSnapshot) -> BTreeMap<String, ExpectedProfile> {
    let variables: BTreeMap<&TargetId, i64> = snapshot
        .deliveries
        .iter()
        .filter_map(|r| r.variables_updated_at.map(|t| (&r.target, t)))
        .collect();

    let mut candidates: Vec<_> = snapshot.candidates.iter().collect();
    candidates.sort_by(|a, b| a.target.cmp(&b.target));

    let mut expected = BTreeMap::new();
    for profile in candidates {
        if !scope::is_in_scope(profile.scope.as_ref(), &snapshot.labels, &snapshot.host_labels) {
            continue;
        }
        let uploaded = snapshot
            .earliest_uploads
            .get(&profile.checksum)
            .copied()
            .unwrap_or(profile.uploaded_at)
            .min(profile.uploaded_at);
        let earliest_install_date = match variables.get(&profile.target) {
            Some(&changed) => uploaded.max(changed),
            None => uploaded,
        };
        expected
            .entry(profile.identifier.clone())
            .or_insert_with(|| ExpectedProfile {
                target: profile.target.clone(),
                identifier: profile.identifier.clone(),
                checksum: profile.checksum.clone(),
                earliest_install_date,
            });
    }
    expected
}

/// Splits the host's profile deliveries against the expected set.
///
/// Installs are skipped while a command is queued, in flight, verified or
/// terminally failed; a record with no status is sent again, and so is any
/// install whose sent checksum no longer matches the content. Removal is only
/// sent for installs that went out; installs never sent are discarded.
pub fn diff_profiles(
    expected: &BTreeMap<String, ExpectedProfile>,
    deliveries: &[HostDeliveryRecord],
    queued: &BTreeSet<TargetId>,
) -> ProfileDiff {
    let records: BTreeMap<&TargetId, &HostDeliveryRecord> = deliveries
        .iter()
        .filter(|r| r.target.is_mdm_profile() && !r.is_hidden())
        .map(|r| (&r.target, r))
        .collect();

    let mut diff = ProfileDiff::default();
    for profile in expected.values() {
        if queued.contains(&profile.target) {
            continue;
        }
        let send = match records.get(&profile.target) {
            None => true,
            Some(r) if r.operation == OperationType::Remove => true,
            Some(r) if r.checksum.as_ref().is_some_and(|c| *c != profile.checksum) => true,
            Some(r) => r.status.is_none(),
        };
        if send {
            diff.to_install.push(profile.clone());
        }
    }

    let expected_targets: BTreeSet<&TargetId> = expected.values().map(|p| &p.target).collect();
    for record in records.values() {
        if record.operation != OperationType::Install
            || expected_targets.contains(&record.target)
            || expected.contains_key(&record.identifier)
            || queued.contains(&record.target)
        {
            continue;
        }
        match record.status {
            None => diff.to_discard.push(record.target.clone()),
            Some(_) => diff.to_remove.push((*record).clone()),
        }
    }
    diff
}
