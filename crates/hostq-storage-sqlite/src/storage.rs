use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use hostq_core::{
    check_deletable, delivery, display_order, plan_next_activation, Activation, ActivationPlan,
    ActivityResult, ActivityType, CancelReport, DeliveryStatus, Error, ExecutionId, Host,
    HostDeliveryRecord, HostId, HostLabelState, HostQueueSnapshot, LabelId, LabelInfo,
    LabelMembershipType, LabelScope, LabelScopeKind, LabelScopeRow, NewActivity, OperationType,
    PastActivity, Platform, PolicyId, Priority, Result, SideEffectPlan, Target, TargetDependents,
    TargetId, TeamId, Transition, UpcomingActivity,
};
use hostq_storage::{DeliveryUpdate, QueuedWork, Store, TargetWrite};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Params};

/// Maps driver errors onto the store error taxonomy.
trait DbResultExt<T> {
    fn db(self) -> Result<T>;
}

impl<T> DbResultExt<T> for rusqlite::Result<T> {
    fn db(self) -> Result<T> {
        self.map_err(|err| match &err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
                Error::InvalidState(err.to_string())
            }
            _ => Error::TransientStore(err.to_string()),
        })
    }
}

const ACTIVITY_COLS: &str = "seq, host_id, activity_type, execution_id, priority, created_at, \
     activated_at, target_key, policy_id, payload_json";

const DELIVERY_COLS: &str = "host_id, target_key, identifier, operation, status, detail, retries, \
     execution_id, updated_at, removed, canceled, variables_updated_at, checksum";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::TransientStore(format!("create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(db_path).db()?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().db()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5)).db()?;
        conn.execute_batch(include_str!("../migrations/0001_init.sql"))
            .db()?;
        tracing::debug!("sqlite schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::TransientStore("sqlite connection lock poisoned".into()))
    }
}

struct ActivityRow {
    seq: i64,
    host_id: i64,
    activity_type: String,
    execution_id: String,
    priority: i32,
    created_at: i64,
    activated_at: Option<i64>,
    target_key: Option<String>,
    policy_id: Option<i64>,
    payload_json: String,
}

impl ActivityRow {
    fn read(r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: r.get(0)?,
            host_id: r.get(1)?,
            activity_type: r.get(2)?,
            execution_id: r.get(3)?,
            priority: r.get(4)?,
            created_at: r.get(5)?,
            activated_at: r.get(6)?,
            target_key: r.get(7)?,
            policy_id: r.get(8)?,
            payload_json: r.get(9)?,
        })
    }

    fn into_activity(self) -> Result<UpcomingActivity> {
        Ok(UpcomingActivity {
            seq: self.seq as u64,
            host_id: HostId(self.host_id as u64),
            activity_type: ActivityType::parse(&self.activity_type)?,
            execution_id: ExecutionId::from_str(self.execution_id),
            priority: Priority(self.priority),
            created_at: self.created_at,
            activated_at: self.activated_at,
            target: self.target_key.as_deref().map(TargetId::parse).transpose()?,
            policy_id: self.policy_id.map(|p| PolicyId(p as u64)),
            payload: serde_json::from_str(&self.payload_json)?,
        })
    }
}

struct DeliveryRow {
    host_id: i64,
    target_key: String,
    identifier: String,
    operation: String,
    status: Option<String>,
    detail: String,
    retries: i64,
    execution_id: Option<String>,
    updated_at: i64,
    removed: bool,
    canceled: bool,
    variables_updated_at: Option<i64>,
    checksum: Option<String>,
}

impl DeliveryRow {
    fn read(r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            host_id: r.get(0)?,
            target_key: r.get(1)?,
            identifier: r.get(2)?,
            operation: r.get(3)?,
            status: r.get(4)?,
            detail: r.get(5)?,
            retries: r.get(6)?,
            execution_id: r.get(7)?,
            updated_at: r.get(8)?,
            removed: r.get(9)?,
            canceled: r.get(10)?,
            variables_updated_at: r.get(11)?,
            checksum: r.get(12)?,
        })
    }

    fn into_record(self) -> Result<HostDeliveryRecord> {
        Ok(HostDeliveryRecord {
            host_id: HostId(self.host_id as u64),
            target: TargetId::parse(&self.target_key)?,
            identifier: self.identifier,
            operation: OperationType::parse(&self.operation)?,
            status: self.status.as_deref().map(DeliveryStatus::parse).transpose()?,
            detail: self.detail,
            retries: self.retries as u32,
            execution_id: self.execution_id.map(ExecutionId::from_str),
            updated_at: self.updated_at,
            removed: self.removed,
            canceled: self.canceled,
            variables_updated_at: self.variables_updated_at,
            checksum: self.checksum,
        })
    }
}

fn load_activities<P: Params>(conn: &Connection, filter: &str, params: P) -> Result<Vec<UpcomingActivity>> {
    let sql = format!("SELECT {ACTIVITY_COLS} FROM upcoming_activities WHERE {filter} ORDER BY seq");
    let mut stmt = conn.prepare(&sql).db()?;
    let rows = stmt.query_map(params, ActivityRow::read).db()?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.db()?.into_activity()?);
    }
    Ok(out)
}

fn load_deliveries<P: Params>(conn: &Connection, filter: &str, params: P) -> Result<Vec<HostDeliveryRecord>> {
    let sql = format!(
        "SELECT {DELIVERY_COLS} FROM host_deliveries WHERE {filter} ORDER BY host_id, target_key"
    );
    let mut stmt = conn.prepare(&sql).db()?;
    let rows = stmt.query_map(params, DeliveryRow::read).db()?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.db()?.into_record()?);
    }
    Ok(out)
}

fn write_delivery(conn: &Connection, r: &HostDeliveryRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO host_deliveries(host_id, target_key, identifier, operation, status, detail, retries,
                                     execution_id, updated_at, removed, canceled, variables_updated_at,
                                     checksum)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(host_id, target_key) DO UPDATE SET
           identifier=excluded.identifier, operation=excluded.operation, status=excluded.status,
           detail=excluded.detail, retries=excluded.retries, execution_id=excluded.execution_id,
           updated_at=excluded.updated_at, removed=excluded.removed, canceled=excluded.canceled,
           variables_updated_at=excluded.variables_updated_at, checksum=excluded.checksum",
        params![
            r.host_id.0 as i64,
            r.target.to_string(),
            r.identifier,
            r.operation.as_str(),
            r.status.map(|s| s.as_str()),
            r.detail,
            r.retries as i64,
            r.execution_id.as_ref().map(|e| e.as_str()),
            r.updated_at,
            r.removed,
            r.canceled,
            r.variables_updated_at,
            r.checksum,
        ],
    )
    .db()?;
    Ok(())
}

fn write_target(conn: &Connection, target: &Target) -> Result<()> {
    let id = target.id();
    let (checksum, uploaded_at) = match target.content() {
        Some((c, at)) => (Some(c.to_string()), Some(at)),
        None => (None, None),
    };
    conn.execute(
        "INSERT INTO targets(target_key, kind, team_id, checksum, uploaded_at, body_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(target_key) DO UPDATE SET kind=excluded.kind, team_id=excluded.team_id,
           checksum=excluded.checksum, uploaded_at=excluded.uploaded_at, body_json=excluded.body_json",
        params![
            id.to_string(),
            id.kind(),
            target.team_id().map(|t| t.0 as i64),
            checksum,
            uploaded_at,
            serde_json::to_string(target)?,
        ],
    )
    .db()?;
    Ok(())
}

/// Replaces the target's label rows. The caller checks the target exists.
fn write_scope(conn: &Connection, target: &TargetId, scope: Option<&LabelScope>) -> Result<()> {
    let key = target.to_string();
    conn.execute("DELETE FROM target_labels WHERE target_key=?1", params![key])
        .db()?;
    if let Some(scope) = scope {
        for row in scope.to_rows() {
            conn.execute(
                "INSERT INTO target_labels(target_key, label_id, scope_kind) VALUES (?1, ?2, ?3)",
                params![key, row.label_id.0 as i64, row.kind.as_str()],
            )
            .db()?;
        }
    }
    Ok(())
}

fn load_target(conn: &Connection, id: &TargetId) -> Result<Option<Target>> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body_json FROM targets WHERE target_key=?1",
            params![id.to_string()],
            |r| r.get(0),
        )
        .optional()
        .db()?;
    match body {
        Some(body) => Ok(Some(serde_json::from_str(&body)?)),
        None => Ok(None),
    }
}

fn dependents(conn: &Connection, target: &TargetId) -> Result<TargetDependents> {
    let mut stmt = conn
        .prepare("SELECT id FROM policies WHERE target_key=?1 ORDER BY id")
        .db()?;
    let rows = stmt
        .query_map(params![target.to_string()], |r| r.get::<_, i64>(0))
        .db()?;
    let mut policies = Vec::new();
    for row in rows {
        policies.push(PolicyId(row.db()? as u64));
    }
    let install_during_setup = load_target(conn, target)?.is_some_and(|t| t.install_during_setup());
    Ok(TargetDependents {
        policies,
        install_during_setup,
    })
}

fn activate_next_in(conn: &Connection, host: HostId, now: i64) -> Result<Activation> {
    let snapshot = HostQueueSnapshot {
        host_id: host,
        now_unix: now,
        activities: load_activities(conn, "host_id=?1", params![host.0 as i64])?,
    };
    let exec = match plan_next_activation(&snapshot) {
        ActivationPlan::Idle => return Ok(Activation::Idle),
        ActivationPlan::AlreadyActive(exec) => {
            let active = snapshot.activities.into_iter().find(|a| a.execution_id == exec);
            return Ok(active.map_or(Activation::Idle, Activation::AlreadyActive));
        }
        ActivationPlan::Activate(exec) => exec,
    };
    let res = conn.execute(
        "UPDATE upcoming_activities SET activated_at=?1
         WHERE execution_id=?2 AND activated_at IS NULL",
        params![now, exec.as_str()],
    );
    match res {
        Ok(1) => {}
        Ok(_) => return Ok(Activation::Idle),
        // The partial unique index refused a second activated row for this host.
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            tracing::warn!(host_id = %host, execution_id = %exec, "concurrent activation lost the race");
            let active = load_activities(
                conn,
                "host_id=?1 AND activated_at IS NOT NULL",
                params![host.0 as i64],
            )?;
            return Ok(active
                .into_iter()
                .next()
                .map_or(Activation::Idle, Activation::AlreadyActive));
        }
        Err(e) => return Err(e).db(),
    }
    let activated = load_activities(conn, "execution_id=?1", params![exec.as_str()])?;
    Ok(activated
        .into_iter()
        .next()
        .map_or(Activation::Idle, Activation::Activated))
}

/// Deletes the listed activities and reports activated ones per host.
/// Records of commands that never went out are canceled with them.
fn drop_activities(
    conn: &Connection,
    doomed: Vec<UpcomingActivity>,
    report: &mut CancelReport,
    now: i64,
) -> Result<()> {
    for a in doomed {
        conn.execute(
            "DELETE FROM upcoming_activities WHERE seq=?1",
            params![a.seq as i64],
        )
        .db()?;
        if a.is_activated() {
            report.hosts_to_activate.insert(a.host_id);
        }
        if let Some(target) = &a.target {
            report.records_canceled += conn
                .execute(
                    "UPDATE host_deliveries SET canceled=1, updated_at=?1
                     WHERE host_id=?2 AND target_key=?3 AND execution_id=?4
                       AND removed=0 AND canceled=0 AND status IS NULL",
                    params![now, a.host_id.0 as i64, target.to_string(), a.execution_id.as_str()],
                )
                .db()?;
        }
        report.cancelled.push(a.execution_id);
    }
    Ok(())
}

fn insert_activity_in(conn: &Connection, new: &NewActivity, now: i64) -> Result<UpcomingActivity> {
    let taken: i64 = conn
        .query_row(
            "SELECT (SELECT COUNT(1) FROM past_activities WHERE execution_id=?1)
                  + (SELECT COUNT(1) FROM upcoming_activities WHERE execution_id=?1)",
            params![new.execution_id.as_str()],
            |r| r.get(0),
        )
        .db()?;
    if taken > 0 {
        return Err(Error::InvalidState(format!(
            "execution id {} already exists",
            new.execution_id
        )));
    }
    conn.execute(
        "INSERT INTO upcoming_activities(host_id, activity_type, execution_id, priority, created_at,
                                         activated_at, target_key, policy_id, payload_json)
         VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7, ?8)",
        params![
            new.host_id.0 as i64,
            new.activity_type.as_str(),
            new.execution_id.as_str(),
            new.priority.0,
            now,
            new.target.as_ref().map(|t| t.to_string()),
            new.policy_id.map(|p| p.0 as i64),
            serde_json::to_string(&new.payload)?,
        ],
    )
    .db()?;
    Ok(UpcomingActivity {
        seq: conn.last_insert_rowid() as u64,
        host_id: new.host_id,
        activity_type: new.activity_type,
        execution_id: new.execution_id.clone(),
        priority: new.priority,
        created_at: now,
        activated_at: None,
        target: new.target.clone(),
        policy_id: new.policy_id,
        payload: new.payload.clone(),
    })
}

impl Store for SqliteStore {
    fn upsert_host(&self, host: &Host) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO hosts(id, uuid, platform, team_id, label_updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET uuid=excluded.uuid, platform=excluded.platform,
               team_id=excluded.team_id, label_updated_at=excluded.label_updated_at",
            params![
                host.id.0 as i64,
                host.uuid,
                host.platform.as_str(),
                host.team_id.map(|t| t.0 as i64),
                host.label_updated_at,
            ],
        )
        .db()?;
        Ok(())
    }

    fn get_host(&self, id: HostId) -> Result<Option<Host>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, uuid, platform, team_id, label_updated_at FROM hosts WHERE id=?1",
                params![id.0 as i64],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, Option<i64>>(3)?,
                        r.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()
            .db()?;
        row.map(|(id, uuid, platform, team, updated)| {
            Ok(Host {
                id: HostId(id as u64),
                uuid,
                platform: Platform::parse(&platform)?,
                team_id: team.map(|t| TeamId(t as u64)),
                label_updated_at: updated,
            })
        })
        .transpose()
    }

    fn list_hosts(&self, team: Option<TeamId>) -> Result<Vec<Host>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, uuid, platform, team_id, label_updated_at FROM hosts
                 WHERE team_id IS ?1 ORDER BY id",
            )
            .db()?;
        let rows = stmt
            .query_map(params![team.map(|t| t.0 as i64)], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, i64>(4)?,
                ))
            })
            .db()?;
        let mut hosts = Vec::new();
        for row in rows {
            let (id, uuid, platform, updated) = row.db()?;
            hosts.push(Host {
                id: HostId(id as u64),
                uuid,
                platform: Platform::parse(&platform)?,
                team_id: team,
                label_updated_at: updated,
            });
        }
        Ok(hosts)
    }

    fn delete_host(&self, id: HostId) -> Result<bool> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().db()?;
        let key = id.0 as i64;
        let deleted = tx.execute("DELETE FROM hosts WHERE id=?1", params![key]).db()?;
        if deleted > 0 {
            tx.execute("DELETE FROM upcoming_activities WHERE host_id=?1", params![key])
                .db()?;
            tx.execute("DELETE FROM host_deliveries WHERE host_id=?1", params![key])
                .db()?;
            tx.execute("DELETE FROM label_membership WHERE host_id=?1", params![key])
                .db()?;
        }
        tx.commit().db()?;
        Ok(deleted > 0)
    }

    fn upsert_label(&self, label: &LabelInfo) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO labels(id, name, created_at, membership_type, broken) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET name=excluded.name, created_at=excluded.created_at,
               membership_type=excluded.membership_type, broken=excluded.broken",
            params![
                label.id.0 as i64,
                label.name,
                label.created_at,
                label.membership_type.as_str(),
                label.broken,
            ],
        )
        .db()?;
        Ok(())
    }

    fn mark_label_broken(&self, id: LabelId) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn
            .execute("UPDATE labels SET broken=1 WHERE id=?1", params![id.0 as i64])
            .db()?;
        Ok(n > 0)
    }

    fn get_labels(&self, ids: &[LabelId]) -> Result<BTreeMap<LabelId, LabelInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT name, created_at, membership_type, broken FROM labels WHERE id=?1")
            .db()?;
        let mut out = BTreeMap::new();
        for id in ids {
            let row = stmt
                .query_row(params![id.0 as i64], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, i64>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, bool>(3)?,
                    ))
                })
                .optional()
                .db()?;
            if let Some((name, created_at, membership, broken)) = row {
                out.insert(
                    *id,
                    LabelInfo {
                        id: *id,
                        name,
                        created_at,
                        membership_type: LabelMembershipType::parse(&membership)?,
                        broken,
                    },
                );
            }
        }
        Ok(out)
    }

    fn set_label_membership(&self, host: HostId, label: LabelId, member: bool) -> Result<()> {
        let conn = self.conn()?;
        let sql = if member {
            "INSERT OR IGNORE INTO label_membership(host_id, label_id) VALUES (?1, ?2)"
        } else {
            "DELETE FROM label_membership WHERE host_id=?1 AND label_id=?2"
        };
        conn.execute(sql, params![host.0 as i64, label.0 as i64]).db()?;
        Ok(())
    }

    fn host_label_states(&self, hosts: &[HostId]) -> Result<BTreeMap<HostId, HostLabelState>> {
        let conn = self.conn()?;
        let mut host_stmt = conn
            .prepare("SELECT label_updated_at FROM hosts WHERE id=?1")
            .db()?;
        let mut label_stmt = conn
            .prepare("SELECT label_id FROM label_membership WHERE host_id=?1")
            .db()?;
        let mut states = BTreeMap::new();
        for id in hosts {
            let updated: Option<i64> = host_stmt
                .query_row(params![id.0 as i64], |r| r.get(0))
                .optional()
                .db()?;
            let Some(label_updated_at) = updated else {
                continue;
            };
            let rows = label_stmt
                .query_map(params![id.0 as i64], |r| r.get::<_, i64>(0))
                .db()?;
            let mut state = HostLabelState {
                label_updated_at,
                ..Default::default()
            };
            for row in rows {
                state.memberships.insert(LabelId(row.db()? as u64));
            }
            states.insert(*id, state);
        }
        Ok(states)
    }

    fn upsert_target(&self, target: &Target) -> Result<()> {
        let conn = self.conn()?;
        write_target(&conn, target)
    }

    fn get_target(&self, id: &TargetId) -> Result<Option<Target>> {
        let conn = self.conn()?;
        load_target(&conn, id)
    }

    fn list_targets(&self, team: Option<TeamId>) -> Result<Vec<Target>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT body_json FROM targets WHERE team_id IS ?1 ORDER BY target_key")
            .db()?;
        let rows = stmt
            .query_map(params![team.map(|t| t.0 as i64)], |r| r.get::<_, String>(0))
            .db()?;
        let mut targets = Vec::new();
        for row in rows {
            targets.push(serde_json::from_str(&row.db()?)?);
        }
        Ok(targets)
    }

    fn content_uploads(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT checksum, uploaded_at FROM targets WHERE checksum IS NOT NULL")
            .db()?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
            .db()?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.db()?);
        }
        Ok(out)
    }

    fn set_label_scope(&self, target: &TargetId, scope: Option<&LabelScope>) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().db()?;
        if load_target(&tx, target)?.is_none() {
            return Err(Error::not_found("target", target));
        }
        write_scope(&tx, target, scope)?;
        tx.commit().db()?;
        Ok(())
    }

    fn label_scope(&self, target: &TargetId) -> Result<Option<LabelScope>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT label_id, scope_kind FROM target_labels WHERE target_key=?1")
            .db()?;
        let rows = stmt
            .query_map(params![target.to_string()], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?))
            })
            .db()?;
        let mut scope_rows = Vec::new();
        for row in rows {
            let (label, kind) = row.db()?;
            scope_rows.push(LabelScopeRow {
                label_id: LabelId(label as u64),
                kind: LabelScopeKind::parse(&kind)?,
            });
        }
        LabelScope::from_rows(&scope_rows)
    }

    fn set_policy_target(&self, policy: PolicyId, target: Option<&TargetId>) -> Result<()> {
        let conn = self.conn()?;
        if let Some(t) = target {
            if load_target(&conn, t)?.is_none() {
                return Err(Error::not_found("target", t));
            }
        }
        conn.execute(
            "INSERT INTO policies(id, target_key) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET target_key=excluded.target_key",
            params![policy.0 as i64, target.map(|t| t.to_string())],
        )
        .db()?;
        Ok(())
    }

    fn target_dependents(&self, target: &TargetId) -> Result<TargetDependents> {
        let conn = self.conn()?;
        dependents(&conn, target)
    }

    fn insert_activities(
        &self,
        work: &[QueuedWork],
        records: &[HostDeliveryRecord],
        now: i64,
    ) -> Result<Vec<UpcomingActivity>> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().db()?;
        let mut inserted = Vec::with_capacity(work.len());
        for w in work {
            inserted.push(insert_activity_in(&tx, &w.activity, now)?);
            if let Some(record) = &w.record {
                write_delivery(&tx, record)?;
            }
        }
        for record in records {
            write_delivery(&tx, record)?;
        }
        tx.commit().db()?;
        Ok(inserted)
    }

    fn get_activity(&self, execution_id: &ExecutionId) -> Result<Option<UpcomingActivity>> {
        let conn = self.conn()?;
        Ok(load_activities(&conn, "execution_id=?1", params![execution_id.as_str()])?
            .into_iter()
            .next())
    }

    fn host_activities(&self, host: HostId) -> Result<Vec<UpcomingActivity>> {
        let conn = self.conn()?;
        let mut activities = load_activities(&conn, "host_id=?1", params![host.0 as i64])?;
        activities.sort_by(display_order);
        Ok(activities)
    }

    fn target_activities(&self, target: &TargetId) -> Result<Vec<UpcomingActivity>> {
        let conn = self.conn()?;
        load_activities(&conn, "target_key=?1", params![target.to_string()])
    }

    fn past_activities(&self, host: HostId) -> Result<Vec<PastActivity>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {ACTIVITY_COLS}, completed_at, result, result_detail FROM past_activities
             WHERE host_id=?1 ORDER BY completed_at, seq"
        );
        let mut stmt = conn.prepare(&sql).db()?;
        let rows = stmt
            .query_map(params![host.0 as i64], |r| {
                Ok((
                    ActivityRow::read(r)?,
                    r.get::<_, i64>(10)?,
                    r.get::<_, String>(11)?,
                    r.get::<_, Option<String>>(12)?,
                ))
            })
            .db()?;
        let mut out = Vec::new();
        for row in rows {
            let (activity, completed_at, result, detail) = row.db()?;
            out.push(PastActivity {
                activity: activity.into_activity()?,
                completed_at,
                result: ActivityResult::from_parts(&result, detail)?,
            });
        }
        Ok(out)
    }

    fn activate_next(&self, host: HostId, now: i64) -> Result<Activation> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().db()?;
        let activation = activate_next_in(&tx, host, now)?;
        tx.commit().db()?;
        Ok(activation)
    }

    fn activate_next_for_hosts(&self, hosts: &[HostId], now: i64) -> Result<Vec<UpcomingActivity>> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().db()?;
        let mut unique = hosts.to_vec();
        unique.sort();
        unique.dedup();
        let mut activated = Vec::new();
        for host in unique {
            if let Some(a) = activate_next_in(&tx, host, now)?.newly_activated() {
                activated.push(a);
            }
        }
        tx.commit().db()?;
        Ok(activated)
    }

    fn complete_activity(
        &self,
        execution_id: &ExecutionId,
        result: &ActivityResult,
        now: i64,
    ) -> Result<Option<UpcomingActivity>> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().db()?;
        let Some(activity) = load_activities(&tx, "execution_id=?1", params![execution_id.as_str()])?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };
        if !activity.is_activated() {
            return Err(Error::InvalidState(format!(
                "activity {execution_id} was never activated"
            )));
        }
        tx.execute(
            &format!(
                "INSERT INTO past_activities({ACTIVITY_COLS}, completed_at, result, result_detail)
                 SELECT {ACTIVITY_COLS}, ?2, ?3, ?4 FROM upcoming_activities WHERE seq=?1"
            ),
            params![activity.seq as i64, now, result.label(), result.detail()],
        )
        .db()?;
        tx.execute(
            "DELETE FROM upcoming_activities WHERE seq=?1",
            params![activity.seq as i64],
        )
        .db()?;
        tx.commit().db()?;
        Ok(Some(activity))
    }

    fn cancel_queued_for_target(&self, target: &TargetId, now: i64) -> Result<CancelReport> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().db()?;
        let mut report = CancelReport::default();
        let (active, queued): (Vec<_>, Vec<_>) =
            load_activities(&tx, "target_key=?1", params![target.to_string()])?
                .into_iter()
                .partition(|a| a.is_activated());
        report.hosts_with_active = active.into_iter().map(|a| a.host_id).collect();
        drop_activities(&tx, queued, &mut report, now)?;
        tx.commit().db()?;
        Ok(report)
    }

    fn cancel_policy_activities(&self, policy: PolicyId, now: i64) -> Result<CancelReport> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().db()?;
        let mut report = CancelReport::default();
        let doomed = load_activities(&tx, "policy_id=?1", params![policy.0 as i64])?;
        drop_activities(&tx, doomed, &mut report, now)?;
        tx.execute("DELETE FROM policies WHERE id=?1", params![policy.0 as i64])
            .db()?;
        tx.commit().db()?;
        Ok(report)
    }

    fn apply_side_effects(
        &self,
        plan: &SideEffectPlan,
        write: TargetWrite<'_>,
        now: i64,
    ) -> Result<CancelReport> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().db()?;
        let key = plan.target.to_string();
        let needs_target = plan.delete_target || matches!(write, TargetWrite::Scope(_));
        if needs_target && load_target(&tx, &plan.target)?.is_none() {
            return Err(Error::not_found("target", &plan.target));
        }
        if plan.require_no_dependents {
            check_deletable(&dependents(&tx, &plan.target)?)?;
        }
        match write {
            TargetWrite::Nothing => {}
            TargetWrite::Upsert(target) => write_target(&tx, target)?,
            TargetWrite::Scope(scope) => write_scope(&tx, &plan.target, scope)?,
        }

        let mut report = CancelReport::default();
        let doomed: Vec<UpcomingActivity> = load_activities(&tx, "target_key=?1", params![key])?
            .into_iter()
            .filter(|a| plan.cancel_types.contains(&a.activity_type))
            .collect();
        drop_activities(&tx, doomed, &mut report, now)?;

        if plan.remove_completed_records {
            report.records_removed = tx
                .execute(
                    "UPDATE host_deliveries SET removed=1, updated_at=?2
                     WHERE target_key=?1 AND removed=0 AND canceled=0 AND status IN ('verified', 'failed')",
                    params![key, now],
                )
                .db()?;
        }
        if plan.cancel_pending_records {
            report.records_canceled += tx
                .execute(
                    "UPDATE host_deliveries SET canceled=1, updated_at=?2
                     WHERE target_key=?1 AND removed=0 AND canceled=0
                       AND (status IS NULL OR status IN ('pending', 'verifying'))",
                    params![key, now],
                )
                .db()?;
        }
        if plan.delete_target {
            tx.execute("DELETE FROM target_labels WHERE target_key=?1", params![key])
                .db()?;
            tx.execute("DELETE FROM targets WHERE target_key=?1", params![key])
                .db()?;
            report.target_deleted = true;
        }
        tx.commit().db()?;
        Ok(report)
    }

    fn upsert_delivery(&self, record: &HostDeliveryRecord) -> Result<()> {
        let conn = self.conn()?;
        write_delivery(&conn, record)
    }

    fn get_delivery(&self, host: HostId, target: &TargetId) -> Result<Option<HostDeliveryRecord>> {
        let conn = self.conn()?;
        Ok(load_deliveries(
            &conn,
            "host_id=?1 AND target_key=?2",
            params![host.0 as i64, target.to_string()],
        )?
        .into_iter()
        .next())
    }

    fn find_delivery(&self, execution_id: &ExecutionId) -> Result<Option<HostDeliveryRecord>> {
        let conn = self.conn()?;
        Ok(load_deliveries(&conn, "execution_id=?1", params![execution_id.as_str()])?
            .into_iter()
            .next())
    }

    fn host_deliveries(&self, host: HostId) -> Result<Vec<HostDeliveryRecord>> {
        let conn = self.conn()?;
        load_deliveries(&conn, "host_id=?1", params![host.0 as i64])
    }

    fn target_deliveries(&self, target: &TargetId) -> Result<Vec<HostDeliveryRecord>> {
        let conn = self.conn()?;
        load_deliveries(&conn, "target_key=?1", params![target.to_string()])
    }

    fn update_delivery(
        &self,
        host: HostId,
        target: &TargetId,
        transition: &Transition,
        strict: bool,
        now: i64,
    ) -> Result<HostDeliveryRecord> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().db()?;
        let mut record = load_deliveries(
            &tx,
            "host_id=?1 AND target_key=?2",
            params![host.0 as i64, target.to_string()],
        )?
        .into_iter()
        .next()
        .ok_or_else(|| Error::not_found("delivery", format!("{target} on host {host}")))?;
        if strict {
            delivery::apply_strict(&mut record, transition, now)?;
        } else if !delivery::apply(&mut record, transition, now) {
            return Ok(record);
        }
        write_delivery(&tx, &record)?;
        tx.commit().db()?;
        Ok(record)
    }

    fn transition_deliveries(
        &self,
        host: HostId,
        operation: OperationType,
        updates: &[DeliveryUpdate],
        now: i64,
    ) -> Result<usize> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().db()?;
        let mut applied = 0;
        for update in updates {
            for identifier in &update.identifiers {
                let records = load_deliveries(
                    &tx,
                    "host_id=?1 AND operation=?2 AND identifier=?3 AND removed=0 AND canceled=0",
                    params![host.0 as i64, operation.as_str(), identifier],
                )?;
                for mut record in records {
                    if delivery::apply(&mut record, &update.transition, now) {
                        write_delivery(&tx, &record)?;
                        applied += 1;
                    }
                }
            }
        }
        tx.commit().db()?;
        Ok(applied)
    }

    fn resend_deliveries(&self, target: &TargetId, status: DeliveryStatus, now: i64) -> Result<usize> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction().db()?;
        let records = load_deliveries(
            &tx,
            "target_key=?1 AND status=?2 AND removed=0 AND canceled=0",
            params![target.to_string(), status.as_str()],
        )?;
        let mut count = 0;
        for mut record in records {
            if delivery::apply(&mut record, &Transition::Resend, now) {
                write_delivery(&tx, &record)?;
                count += 1;
            }
        }
        tx.commit().db()?;
        Ok(count)
    }

    fn purge_hidden_deliveries(&self) -> Result<usize> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM host_deliveries WHERE removed=1 OR canceled=1", [])
            .db()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostq_core::{
        plan_side_effects, InstallerId, ProfilePlatform, ProfileUuid, MdmProfile, SoftwareInstaller,
        TargetChange,
    };
    use tempfile::tempdir;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn host(id: u64, team: Option<u64>) -> Host {
        Host {
            id: HostId(id),
            uuid: format!("uuid-{id}"),
            platform: Platform::Darwin,
            team_id: team.map(TeamId),
            label_updated_at: 100,
        }
    }

    fn installer() -> Target {
        Target::SoftwareInstaller(SoftwareInstaller {
            id: InstallerId(1),
            team_id: Some(TeamId(1)),
            title: "Firefox".into(),
            version: "120".into(),
            platform: Platform::Darwin,
            install_script: "installer -pkg".into(),
            uninstall_script: "rm -rf".into(),
            pre_install_query: String::new(),
            post_install_script: String::new(),
            package_sha256: "abc".into(),
            self_service: false,
            install_during_setup: false,
        })
    }

    fn new_activity(host: u64, exec: &str, priority: Priority) -> NewActivity {
        NewActivity {
            host_id: HostId(host),
            activity_type: ActivityType::SoftwareInstall,
            execution_id: ExecutionId::from_str(exec),
            priority,
            target: Some(TargetId::SoftwareInstaller(InstallerId(1))),
            policy_id: None,
            payload: serde_json::json!({"script": "install"}),
        }
    }

    fn insert(s: &SqliteStore, new: NewActivity, now: i64) -> Result<UpcomingActivity> {
        s.insert_activities(&[QueuedWork::new(new)], &[], now)
            .map(|mut v| v.remove(0))
    }

    #[test]
    fn open_creates_schema_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("hostq.db");
        let s = SqliteStore::open(&path).unwrap();
        s.upsert_host(&host(1, Some(1))).unwrap();
        drop(s);
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.get_host(HostId(1)).unwrap(), Some(host(1, Some(1))));
    }

    #[test]
    fn hosts_filter_by_team() {
        let s = store();
        s.upsert_host(&host(1, Some(1))).unwrap();
        s.upsert_host(&host(2, None)).unwrap();
        assert_eq!(s.list_hosts(Some(TeamId(1))).unwrap().len(), 1);
        assert_eq!(s.list_hosts(None).unwrap()[0].id, HostId(2));
    }

    #[test]
    fn activation_prefers_priority_then_age() {
        let s = store();
        insert(&s, new_activity(1, "old", Priority::DEFAULT), 10).unwrap();
        insert(&s, new_activity(1, "setup", Priority::SETUP_EXPERIENCE), 20).unwrap();
        let first = s.activate_next(HostId(1), 30).unwrap().newly_activated().unwrap();
        assert_eq!(first.execution_id.as_str(), "setup");
        assert_eq!(first.activated_at, Some(30));
        assert!(matches!(s.activate_next(HostId(1), 31).unwrap(), Activation::AlreadyActive(_)));
    }

    #[test]
    fn unique_index_refuses_second_active_row() {
        let s = store();
        insert(&s, new_activity(1, "a", Priority::DEFAULT), 10).unwrap();
        insert(&s, new_activity(1, "b", Priority::DEFAULT), 11).unwrap();
        s.activate_next(HostId(1), 12).unwrap();
        let conn = s.conn().unwrap();
        let res = conn.execute(
            "UPDATE upcoming_activities SET activated_at=13 WHERE execution_id='b'",
            [],
        );
        assert!(res.is_err());
    }

    #[test]
    fn complete_round_trips_through_history() {
        let s = store();
        insert(&s, new_activity(1, "a", Priority::DEFAULT), 10).unwrap();
        s.activate_next(HostId(1), 11).unwrap();
        let failed = ActivityResult::Failed {
            detail: "exit 1".into(),
        };
        assert!(s.complete_activity(&ExecutionId::from_str("a"), &failed, 12).unwrap().is_some());
        let past = s.past_activities(HostId(1)).unwrap();
        assert_eq!(past.len(), 1);
        assert_eq!(past[0].result, failed);
        assert_eq!(past[0].activity.payload["script"], "install");
        let dup = insert(&s, new_activity(1, "a", Priority::DEFAULT), 13);
        assert!(matches!(dup, Err(Error::InvalidState(_))));
    }

    #[test]
    fn unactivated_activity_cannot_complete() {
        let s = store();
        insert(&s, new_activity(1, "a", Priority::DEFAULT), 10).unwrap();
        let res = s.complete_activity(&ExecutionId::from_str("a"), &ActivityResult::Installed, 11);
        assert!(matches!(res, Err(Error::InvalidState(_))));
        assert!(s.past_activities(HostId(1)).unwrap().is_empty());
        assert!(s.get_activity(&ExecutionId::from_str("a")).unwrap().is_some());
    }

    #[test]
    fn failed_batch_rolls_back() {
        let s = store();
        insert(&s, new_activity(1, "taken", Priority::DEFAULT), 10).unwrap();
        let id = TargetId::SoftwareInstaller(InstallerId(1));
        let record = HostDeliveryRecord::new(HostId(2), id.clone(), "Firefox", OperationType::Install, 11);
        let res = s.insert_activities(
            &[
                QueuedWork::new(new_activity(2, "fresh", Priority::DEFAULT)).with_record(record),
                QueuedWork::new(new_activity(2, "taken", Priority::DEFAULT)),
            ],
            &[],
            11,
        );
        assert!(matches!(res, Err(Error::InvalidState(_))));
        assert!(s.get_activity(&ExecutionId::from_str("fresh")).unwrap().is_none());
        assert!(s.get_delivery(HostId(2), &id).unwrap().is_none());
    }

    #[test]
    fn scope_write_cancels_unsent_records_in_one_go() {
        let s = store();
        s.upsert_target(&installer()).unwrap();
        let id = TargetId::SoftwareInstaller(InstallerId(1));
        let mut record = HostDeliveryRecord::new(HostId(1), id.clone(), "Firefox", OperationType::Install, 10);
        record.execution_id = Some(ExecutionId::from_str("a"));
        record.checksum = Some("abc".into());
        s.insert_activities(
            &[QueuedWork::new(new_activity(1, "a", Priority::DEFAULT)).with_record(record)],
            &[],
            10,
        )
        .unwrap();

        let scope = LabelScope::new(LabelScopeKind::ExcludeAny, [LabelId(3)]).unwrap();
        let report = s
            .apply_side_effects(
                &plan_side_effects(&id, TargetChange::Metadata),
                TargetWrite::Scope(Some(&scope)),
                12,
            )
            .unwrap();
        assert_eq!(report.cancelled, vec![ExecutionId::from_str("a")]);
        assert_eq!(report.records_canceled, 1);
        assert_eq!(s.label_scope(&id).unwrap(), Some(scope));
        let stored = s.get_delivery(HostId(1), &id).unwrap().unwrap();
        assert!(stored.canceled);
        assert_eq!(stored.checksum.as_deref(), Some("abc"));
        assert_eq!(stored.updated_at, 12);
    }

    #[test]
    fn label_scope_replaces_rows() {
        let s = store();
        s.upsert_target(&installer()).unwrap();
        let id = TargetId::SoftwareInstaller(InstallerId(1));
        let include = LabelScope::new(LabelScopeKind::IncludeAny, [LabelId(1), LabelId(2)]).unwrap();
        s.set_label_scope(&id, Some(&include)).unwrap();
        let exclude = LabelScope::new(LabelScopeKind::ExcludeAny, [LabelId(3)]).unwrap();
        s.set_label_scope(&id, Some(&exclude)).unwrap();
        assert_eq!(s.label_scope(&id).unwrap(), Some(exclude));
        s.set_label_scope(&id, None).unwrap();
        assert_eq!(s.label_scope(&id).unwrap(), None);
    }

    #[test]
    fn mixed_scope_rows_are_invalid() {
        let s = store();
        s.upsert_target(&installer()).unwrap();
        let conn = s.conn().unwrap();
        conn.execute_batch(
            "INSERT INTO target_labels VALUES ('installer:1', 1, 'include_any');
             INSERT INTO target_labels VALUES ('installer:1', 2, 'exclude_any');",
        )
        .unwrap();
        drop(conn);
        let res = s.label_scope(&TargetId::SoftwareInstaller(InstallerId(1)));
        assert!(matches!(res, Err(Error::InvalidState(_))));
    }

    #[test]
    fn package_change_hides_completed_records() {
        let s = store();
        s.upsert_target(&installer()).unwrap();
        let id = TargetId::SoftwareInstaller(InstallerId(1));
        let mut done = HostDeliveryRecord::new(HostId(1), id.clone(), "Firefox", OperationType::Install, 0);
        done.status = Some(DeliveryStatus::Verified);
        let mut pending = HostDeliveryRecord::new(HostId(2), id.clone(), "Firefox", OperationType::Install, 0);
        pending.status = Some(DeliveryStatus::Pending);
        s.upsert_delivery(&done).unwrap();
        s.upsert_delivery(&pending).unwrap();

        let report = s
            .apply_side_effects(&plan_side_effects(&id, TargetChange::Package), TargetWrite::Nothing, 5)
            .unwrap();
        assert_eq!(report.records_removed, 1);
        assert_eq!(report.records_canceled, 1);
        assert!(s.get_delivery(HostId(1), &id).unwrap().unwrap().removed);
        assert_eq!(s.purge_hidden_deliveries().unwrap(), 2);
    }

    #[test]
    fn profile_content_uploads_are_listed() {
        let s = store();
        s.upsert_target(&installer()).unwrap();
        s.upsert_target(&Target::MdmProfile(MdmProfile {
            uuid: ProfileUuid::from_str("p1"),
            team_id: None,
            platform: ProfilePlatform::Apple,
            identifier: "com.example.wifi".into(),
            name: "Wi-Fi".into(),
            checksum: "c1".into(),
            uploaded_at: 42,
        }))
        .unwrap();
        assert_eq!(s.content_uploads().unwrap(), vec![("c1".to_string(), 42)]);
    }

    #[test]
    fn batch_transition_is_conditional() {
        let s = store();
        let id = TargetId::SoftwareInstaller(InstallerId(1));
        let mut r = HostDeliveryRecord::new(HostId(1), id.clone(), "Firefox", OperationType::Install, 0);
        r.status = Some(DeliveryStatus::Failed);
        s.upsert_delivery(&r).unwrap();
        let n = s
            .transition_deliveries(
                HostId(1),
                OperationType::Install,
                &[DeliveryUpdate {
                    identifiers: vec!["Firefox".into()],
                    transition: Transition::Acknowledge,
                }],
                3,
            )
            .unwrap();
        assert_eq!(n, 0);
        let retried = s
            .update_delivery(HostId(1), &id, &Transition::Retry, true, 4)
            .unwrap();
        assert_eq!(retried.retries, 1);
        assert_eq!(retried.status, Some(DeliveryStatus::Pending));
    }
}
