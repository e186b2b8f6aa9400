//! Loads a YAML description of hosts, labels and targets into a store.
//! Used by `hostq seed` and by the scenario fixtures.

use std::path::Path;

use anyhow::{Context, Result};
use hostq_core::{Host, HostId, LabelId, LabelInfo, LabelScope, PolicyId, Target, TargetId};
use hostq_storage::Store;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct World {
    #[serde(default)]
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub labels: Vec<LabelInfo>,
    #[serde(default)]
    pub memberships: Vec<Membership>,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub scopes: Vec<ScopeAssignment>,
    #[serde(default)]
    pub policies: Vec<PolicyAutomation>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Membership {
    pub label: LabelId,
    pub hosts: Vec<HostId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScopeAssignment {
    pub target: TargetId,
    pub scope: LabelScope,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyAutomation {
    pub id: PolicyId,
    pub target: TargetId,
}

pub fn load_world(path: &Path) -> Result<World> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("read world file: {}", path.display()))?;
    let world: World = serde_yaml::from_str(&s)
        .with_context(|| format!("parse world file: {}", path.display()))?;
    Ok(world)
}

/// Writes every entity of `world` into `store`. Labels go in before the
/// memberships and scopes that reference them.
pub fn seed_store(store: &dyn Store, world: &World) -> Result<()> {
    for host in &world.hosts {
        store.upsert_host(host).with_context(|| format!("seed host {}", host.id))?;
    }
    for label in &world.labels {
        store.upsert_label(label).with_context(|| format!("seed label {}", label.id))?;
    }
    for m in &world.memberships {
        for host in &m.hosts {
            store
                .set_label_membership(*host, m.label, true)
                .with_context(|| format!("seed membership of host {host} in label {}", m.label))?;
        }
    }
    for target in &world.targets {
        store.upsert_target(target).with_context(|| format!("seed target {}", target.id()))?;
    }
    for s in &world.scopes {
        store
            .set_label_scope(&s.target, Some(&s.scope))
            .with_context(|| format!("seed label scope of {}", s.target))?;
    }
    for p in &world.policies {
        store
            .set_policy_target(p.id, Some(&p.target))
            .with_context(|| format!("seed policy {}", p.id))?;
    }
    tracing::info!(
        hosts = world.hosts.len(),
        labels = world.labels.len(),
        targets = world.targets.len(),
        "seeded store"
    );
    Ok(())
}
