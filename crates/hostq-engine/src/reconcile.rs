use std::collections::{BTreeMap, BTreeSet};

use hostq_core::{
    reconcile as rules, scope, ActivityType, Error, ExpectedProfile, Host, HostDeliveryRecord,
    HostId, HostLabelState, LabelId, LabelScope, OperationType, ProfileDiff, ProfilePlatform,
    ProfileSnapshot, ReconcileReport, Result, ScopeDecision, ScopedProfile, Target, TargetId,
    TeamId, VerificationBatch,
};
use serde_json::{json, Value};

use crate::{Engine, EnqueueRequest};

/// MDM command body for installing or removing a profile.
pub(crate) fn profile_payload(operation: OperationType, identifier: &str, checksum: Option<&str>) -> Value {
    match operation {
        OperationType::Install => json!({
            "command": "InstallProfile",
            "identifier": identifier,
            "checksum": checksum,
        }),
        OperationType::Remove => json!({
            "command": "RemoveProfile",
            "identifier": identifier,
        }),
    }
}

impl Engine {
    /// Everything reconciliation needs about one host, read in one pass.
    pub fn profile_snapshot(&self, host_id: HostId) -> Result<ProfileSnapshot> {
        let host = self.host(host_id)?;
        let platform = host.platform.profile_platform().ok_or_else(|| {
            Error::InvalidState(format!(
                "host {host_id} ({}) does not take configuration profiles",
                host.platform
            ))
        })?;

        let mut candidates = Vec::new();
        for target in self.store.list_targets(host.team_id)? {
            let (identifier, checksum, uploaded_at) = match &target {
                Target::MdmProfile(p) if p.platform == platform => {
                    (p.identifier.clone(), p.checksum.clone(), p.uploaded_at)
                }
                Target::MdmDeclaration(d) if platform == ProfilePlatform::Apple => {
                    (d.identifier.clone(), d.checksum.clone(), d.uploaded_at)
                }
                _ => continue,
            };
            let id = target.id();
            let scope = self.store.label_scope(&id)?;
            candidates.push(ScopedProfile {
                target: id,
                identifier,
                checksum,
                uploaded_at,
                scope,
            });
        }

        let label_ids = scope_labels(candidates.iter().filter_map(|c| c.scope.as_ref()));
        let uploads = self.store.content_uploads()?;
        Ok(ProfileSnapshot {
            labels: self.store.get_labels(&label_ids)?,
            host_labels: self.host_label_state(host_id)?,
            candidates,
            earliest_uploads: rules::earliest_uploads(uploads.iter().map(|(c, at)| (c.as_str(), *at))),
            deliveries: self.store.host_deliveries(host_id)?,
            queued: self
                .store
                .host_activities(host_id)?
                .into_iter()
                .filter_map(|a| a.target)
                .collect(),
            host,
        })
    }

    /// Profiles and declarations the host should have, keyed by identifier.
    pub fn expected_profiles_for_host(&self, host: HostId) -> Result<BTreeMap<String, ExpectedProfile>> {
        Ok(rules::expected_profiles(&self.profile_snapshot(host)?))
    }

    pub fn diff_for_host(&self, host: HostId) -> Result<ProfileDiff> {
        let snapshot = self.profile_snapshot(host)?;
        let expected = rules::expected_profiles(&snapshot);
        Ok(rules::diff_profiles(&expected, &snapshot.deliveries, &snapshot.queued))
    }

    /// Queues install and remove commands so the host converges on its
    /// expected profiles. Every command and discarded record of one host is
    /// written in a single transaction.
    pub fn reconcile_host(&self, host: HostId) -> Result<ReconcileReport> {
        let diff = self.diff_for_host(host)?;
        let now = self.now();
        let mut report = ReconcileReport {
            hosts: 1,
            ..Default::default()
        };
        let mut work = Vec::with_capacity(diff.to_install.len() + diff.to_remove.len());
        for profile in &diff.to_install {
            work.push(self.prepare_enqueue(
                EnqueueRequest::new(host, ActivityType::MdmCommand)
                    .target(profile.target.clone())
                    .payload(profile_payload(
                        OperationType::Install,
                        &profile.identifier,
                        Some(&profile.checksum),
                    )),
                now,
            )?);
            report.installs_enqueued += 1;
        }
        for record in &diff.to_remove {
            work.push(self.prepare_enqueue(
                EnqueueRequest::new(host, ActivityType::MdmCommand)
                    .target(record.target.clone())
                    .operation(OperationType::Remove)
                    .payload(profile_payload(OperationType::Remove, &record.identifier, None)),
                now,
            )?);
            report.removals_enqueued += 1;
        }
        let mut discarded = Vec::with_capacity(diff.to_discard.len());
        for target in &diff.to_discard {
            if let Some(mut record) = self.store.get_delivery(host, target)? {
                record.canceled = true;
                record.updated_at = now;
                discarded.push(record);
            }
        }
        report.discarded = discarded.len();

        if !diff.is_empty() {
            self.store.insert_activities(&work, &discarded, now)?;
            self.activate_next_for_host(host)?;
        }
        tracing::debug!(
            host_id = %host,
            installs = report.installs_enqueued,
            removals = report.removals_enqueued,
            discarded = report.discarded,
            "reconciled"
        );
        Ok(report)
    }

    /// Reconciles every profile-capable host of a team; `None` is "no team".
    pub fn reconcile_team(&self, team: Option<TeamId>) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for host in self.store.list_hosts(team)? {
            if host.platform.profile_platform().is_none() {
                continue;
            }
            report.merge(self.reconcile_host(host.id)?);
        }
        tracing::info!(
            team = ?team,
            hosts = report.hosts,
            installs = report.installs_enqueued,
            removals = report.removals_enqueued,
            "team reconciled"
        );
        Ok(report)
    }

    /// Checks the host's profile report (identifier to install time) against
    /// the expected set and applies the outcome.
    pub fn verify_host_profiles(&self, host: HostId, reported: &BTreeMap<String, i64>) -> Result<VerificationBatch> {
        let snapshot = self.profile_snapshot(host)?;
        let expected = rules::expected_profiles(&snapshot);
        let (batch, failures) = hostq_queue::classify_verification(
            &expected,
            reported,
            &snapshot.deliveries,
            self.config.delivery.max_profile_retries,
        );
        if !batch.is_empty() {
            self.update_verification(host, &batch.verify, &failures, &batch.retry)?;
        }
        Ok(batch)
    }

    /// Records that variables embedded in the profile changed for this host,
    /// so installs from before `at` no longer count.
    pub fn mark_variables_updated(&self, host: HostId, target: &TargetId, at: i64) -> Result<HostDeliveryRecord> {
        let mut record = self
            .store
            .get_delivery(host, target)?
            .ok_or_else(|| Error::not_found("delivery", format!("{target} on host {host}")))?;
        record.variables_updated_at = Some(at);
        record.updated_at = self.now();
        self.store.upsert_delivery(&record)?;
        Ok(record)
    }

    /// Whether the host is targeted by `target`: same team and inside its
    /// label scope.
    pub fn is_target_in_scope(&self, target: &TargetId, host: HostId) -> Result<bool> {
        let resolved = self.target(target)?;
        let host = self.host(host)?;
        if resolved.team_id() != host.team_id {
            return Ok(false);
        }
        let scope = self.store.label_scope(target)?;
        let decisions = self.scope_decisions(scope.as_ref(), std::slice::from_ref(&host))?;
        Ok(decisions.first().is_some_and(|(_, d)| d.in_scope()))
    }

    /// Every target of the host's team, of any kind, that applies to it.
    pub fn in_scope_targets(&self, host: HostId) -> Result<Vec<TargetId>> {
        let host = self.host(host)?;
        let state = self.host_label_state(host.id)?;
        let mut scoped = Vec::new();
        for target in self.store.list_targets(host.team_id)? {
            let id = target.id();
            let scope = self.store.label_scope(&id)?;
            let labels = self.store.get_labels(&scope_labels(scope.iter()))?;
            if scope::is_in_scope(scope.as_ref(), &labels, &state) {
                scoped.push(id);
            }
        }
        Ok(scoped)
    }

    /// Hosts of the target's team inside its label scope.
    pub fn included_hosts(&self, target: &TargetId) -> Result<Vec<HostId>> {
        self.partition_hosts(target, true)
    }

    /// Hosts of the target's team left out by its label scope.
    pub fn excluded_hosts(&self, target: &TargetId) -> Result<Vec<HostId>> {
        self.partition_hosts(target, false)
    }

    fn partition_hosts(&self, target: &TargetId, included: bool) -> Result<Vec<HostId>> {
        let resolved = self.target(target)?;
        let hosts = self.store.list_hosts(resolved.team_id())?;
        let scope = self.store.label_scope(target)?;
        Ok(self
            .scope_decisions(scope.as_ref(), &hosts)?
            .into_iter()
            .filter(|(_, d)| d.in_scope() == included)
            .map(|(h, _)| h)
            .collect())
    }

    fn scope_decisions(&self, scope: Option<&LabelScope>, hosts: &[Host]) -> Result<Vec<(HostId, ScopeDecision)>> {
        let labels = self.store.get_labels(&scope_labels(scope.into_iter()))?;
        let ids: Vec<HostId> = hosts.iter().map(|h| h.id).collect();
        let mut states = self.store.host_label_states(&ids)?;
        Ok(ids
            .into_iter()
            .map(|id| {
                let state = states.remove(&id).unwrap_or_default();
                (id, scope::evaluate(scope, &labels, &state))
            })
            .collect())
    }

    fn host_label_state(&self, host: HostId) -> Result<HostLabelState> {
        Ok(self
            .store
            .host_label_states(&[host])?
            .remove(&host)
            .unwrap_or_default())
    }
}

fn scope_labels<'a>(scopes: impl Iterator<Item = &'a LabelScope>) -> Vec<LabelId> {
    scopes
        .flat_map(|s| s.labels().iter().copied())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
