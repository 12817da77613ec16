//! Labour repository implementation
//!
//! Every status transition that touches more than one row (batch fan-out,
//! propagation from a representative to its bundle members, replace) runs
//! inside a single transaction. Each of those transactions opens with a
//! write, since worker processes share the database through separate pools.

use chrono::{DateTime, Utc};
use sqlx::{Pool, QueryBuilder, Sqlite, SqliteConnection};
use tracing::debug;

use crate::errors::{RepositoryError, RepositoryResult};
use crate::models::{Labour, LabourRow, LabourStatus, NewLabour, Rule};

const COLUMNS: &str = "id, parent_id, worker, identity, payload, status, priority, attempts, pid, \
     by_recurring, last_error, created_at, updated_at, execute_at, started_at, finished_at";

/// Statuses a bundle member can be in while its representative is still active
const BUNDLE_MEMBER_STATUSES: &str = "('pending', 'deployed', 'running')";

/// A representative labour plus the members dispatched on its behalf
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    pub representative: Labour,
    pub members: Vec<Labour>,
}

impl Bundle {
    pub fn id(&self) -> i64 {
        self.representative.id
    }

    pub fn member_ids(&self) -> Vec<i64> {
        self.members.iter().map(|m| m.id).collect()
    }

    /// Payloads of the representative followed by every member
    pub fn payloads(&self) -> Vec<&serde_json::Value> {
        std::iter::once(&self.representative.payload)
            .chain(self.members.iter().map(|m| &m.payload))
            .collect()
    }
}

/// Position of the last row seen by a keyset scan over pending labours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanPosition {
    pub priority: i64,
    pub execute_at: i64,
    pub id: i64,
}

impl From<&Labour> for ScanPosition {
    fn from(labour: &Labour) -> Self {
        Self {
            priority: labour.priority,
            execute_at: labour.execute_at.timestamp(),
            id: labour.id,
        }
    }
}

/// State change applied to a representative and its bundle members together
#[derive(Debug, Clone)]
pub enum Transition {
    Start {
        pid: Option<u32>,
    },
    Finish,
    Fail {
        error: String,
    },
    Reschedule {
        execute_at: DateTime<Utc>,
        detach: bool,
        error: Option<String>,
    },
    AssignPid {
        pid: u32,
    },
    /// Count an execution attempt that never reached the worker process
    CountAttempt,
}

impl Transition {
    fn status(&self) -> Option<LabourStatus> {
        match self {
            Transition::Start { .. } => Some(LabourStatus::Running),
            Transition::Finish => Some(LabourStatus::Finished),
            Transition::Fail { .. } => Some(LabourStatus::Failed),
            Transition::Reschedule { .. } => Some(LabourStatus::Pending),
            Transition::AssignPid { .. } | Transition::CountAttempt => None,
        }
    }
}

/// Repository implementation for labours
#[derive(Clone)]
pub struct LabourRepository {
    pool: Pool<Sqlite>,
}

impl LabourRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: i64) -> RepositoryResult<Option<Labour>> {
        let mut conn = self.pool.acquire().await?;
        fetch_one_row(&mut conn, id).await
    }

    pub async fn get(&self, id: i64) -> RepositoryResult<Labour> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| RepositoryError::record_not_found("labours", "id", id))
    }

    /// Insert a labour, honouring the enqueue-time rules.
    ///
    /// `ignore` returns `None` when a pending labour with the same
    /// worker+identity already exists; `replace` marks such labours
    /// `replaced` first. Other rules always insert.
    pub async fn insert(
        &self,
        labour: &NewLabour,
        rule: Rule,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Option<Labour>> {
        let payload = serde_json::to_string(&labour.payload)
            .map_err(|e| RepositoryError::decode("payload", e.to_string()))?;

        let mut tx = self.pool.begin().await?;

        if rule == Rule::Replace {
            let replaced = sqlx::query(
                "UPDATE labours SET status = 'replaced', updated_at = ?
                 WHERE worker = ? AND identity = ? AND status = 'pending'",
            )
            .bind(now.timestamp())
            .bind(&labour.worker)
            .bind(&labour.identity)
            .execute(&mut *tx)
            .await?;

            if replaced.rows_affected() > 0 {
                debug!(
                    "Replaced {} pending labour(s) for {}-{}",
                    replaced.rows_affected(),
                    labour.worker,
                    labour.identity
                );
            }
        }

        // `ignore` folds its duplicate check into the insert itself
        let guard = if rule == Rule::Ignore {
            "WHERE NOT EXISTS (
                 SELECT 1 FROM labours WHERE worker = ?1 AND identity = ?2 AND status = 'pending'
             )"
        } else {
            ""
        };
        let sql = format!(
            "INSERT INTO labours (worker, identity, payload, status, priority, attempts, by_recurring, created_at, updated_at, execute_at)
             SELECT ?1, ?2, ?3, 'pending', ?4, 0, ?5, ?6, ?6, ?7 {guard}
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, LabourRow>(&sql)
            .bind(&labour.worker)
            .bind(&labour.identity)
            .bind(payload)
            .bind(labour.priority)
            .bind(labour.by_recurring)
            .bind(now.timestamp())
            .bind(labour.execute_at.timestamp())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            debug!(
                "Ignoring labour for {}-{}: already pending",
                labour.worker, labour.identity
            );
            return Ok(None);
        };

        tx.commit().await?;
        Ok(Some(Labour::try_from(row)?))
    }

    /// Labours handed to a worker process and not yet reported back
    pub async fn find_in_flight(&self, include_unknown: bool) -> RepositoryResult<Vec<Labour>> {
        let statuses = if include_unknown {
            "('deployed', 'running', 'unknown')"
        } else {
            "('deployed', 'running')"
        };
        let sql = format!("SELECT {COLUMNS} FROM labours WHERE status IN {statuses} ORDER BY id");
        let rows = sqlx::query_as::<_, LabourRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Labour::try_from).collect()
    }

    /// One page of eligible pending labours ordered by (priority, execute_at, id)
    pub async fn find_pending_page(
        &self,
        now: DateTime<Utc>,
        after: Option<ScanPosition>,
        limit: u32,
    ) -> RepositoryResult<Vec<Labour>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {COLUMNS} FROM labours WHERE status = 'pending' AND execute_at <= "
        ));
        builder.push_bind(now.timestamp());

        if let Some(position) = after {
            builder
                .push(" AND (priority, execute_at, id) > (")
                .push_bind(position.priority)
                .push(", ")
                .push_bind(position.execute_at)
                .push(", ")
                .push_bind(position.id)
                .push(")");
        }

        builder
            .push(" ORDER BY priority ASC, execute_at ASC, id ASC LIMIT ")
            .push_bind(i64::from(limit));

        let rows = builder
            .build_query_as::<LabourRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Labour::try_from).collect()
    }

    /// Move a pending labour to `deployed`, pulling its pending siblings
    /// into the bundle when `batch` is set.
    ///
    /// Returns `None` when the labour is no longer pending.
    pub async fn deploy(
        &self,
        id: i64,
        batch: bool,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Option<Bundle>> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE labours SET status = 'deployed', updated_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(now.timestamp())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let representative = fetch_one_row(&mut tx, id)
            .await?
            .ok_or_else(|| RepositoryError::record_not_found("labours", "id", id))?;

        let mut member_ids: Vec<i64> = Vec::new();
        if batch {
            member_ids = sqlx::query_scalar(
                "SELECT id FROM labours
                 WHERE worker = ? AND identity = ? AND status = 'pending' AND id != ?
                 ORDER BY id",
            )
            .bind(&representative.worker)
            .bind(&representative.identity)
            .bind(id)
            .fetch_all(&mut *tx)
            .await?;

            if !member_ids.is_empty() {
                let mut builder = QueryBuilder::<Sqlite>::new(
                    "UPDATE labours SET status = 'deployed', parent_id = ",
                );
                builder
                    .push_bind(id)
                    .push(", updated_at = ")
                    .push_bind(now.timestamp());
                push_id_filter(&mut builder, &member_ids);
                builder.build().execute(&mut *tx).await?;
            }
        }

        let members = fetch_rows(&mut tx, &member_ids).await?;
        tx.commit().await?;

        Ok(Some(Bundle {
            representative,
            members,
        }))
    }

    /// Load a labour together with its active bundle members
    pub async fn find_bundle(&self, id: i64) -> RepositoryResult<Option<Bundle>> {
        let mut conn = self.pool.acquire().await?;
        let Some(representative) = fetch_one_row(&mut conn, id).await? else {
            return Ok(None);
        };
        let member_ids = bundle_member_ids(&mut conn, &representative).await?;
        let members = fetch_rows(&mut conn, &member_ids).await?;
        Ok(Some(Bundle {
            representative,
            members,
        }))
    }

    /// Apply a transition to a labour and its bundle members atomically
    pub async fn transition(
        &self,
        id: i64,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Bundle> {
        let mut tx = self.pool.begin().await?;

        // Must write before reading: a deferred transaction that reads first
        // cannot take the write lock once another process has committed
        let touched = sqlx::query("UPDATE labours SET updated_at = ? WHERE id = ?")
            .bind(now.timestamp())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(RepositoryError::record_not_found("labours", "id", id));
        }

        let current = fetch_one_row(&mut tx, id)
            .await?
            .ok_or_else(|| RepositoryError::record_not_found("labours", "id", id))?;

        let member_ids = bundle_member_ids(&mut tx, &current).await?;
        let mut ids = Vec::with_capacity(member_ids.len() + 1);
        ids.push(id);
        ids.extend(member_ids.iter().copied());

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE labours SET updated_at = ");
        builder.push_bind(now.timestamp());
        if let Some(status) = transition.status() {
            builder.push(", status = ").push_bind(status);
        }

        match transition {
            Transition::Start { pid } => {
                builder
                    .push(", attempts = attempts + 1, started_at = ")
                    .push_bind(now.timestamp())
                    .push(", pid = ")
                    .push_bind(pid.map(i64::from));
            }
            Transition::Finish => {
                builder
                    .push(", finished_at = ")
                    .push_bind(now.timestamp());
            }
            Transition::Fail { error } => {
                builder
                    .push(", finished_at = ")
                    .push_bind(now.timestamp())
                    .push(", last_error = ")
                    .push_bind(error.clone());
            }
            Transition::Reschedule {
                execute_at,
                detach,
                error,
            } => {
                builder
                    .push(", execute_at = ")
                    .push_bind(execute_at.timestamp())
                    .push(", last_error = ")
                    .push_bind(error.clone())
                    .push(", pid = NULL");
                // Each row keeps its own id as retry lineage
                builder.push(if *detach {
                    ", parent_id = NULL"
                } else {
                    ", parent_id = id"
                });
            }
            Transition::AssignPid { pid } => {
                builder.push(", pid = ").push_bind(i64::from(*pid));
            }
            Transition::CountAttempt => {
                builder.push(", attempts = attempts + 1");
            }
        }

        push_id_filter(&mut builder, &ids);
        builder.build().execute(&mut *tx).await?;

        let representative = fetch_one_row(&mut tx, id)
            .await?
            .ok_or_else(|| RepositoryError::record_not_found("labours", "id", id))?;
        let members = fetch_rows(&mut tx, &member_ids).await?;
        tx.commit().await?;

        Ok(Bundle {
            representative,
            members,
        })
    }

    pub async fn mark_unknown(&self, id: i64, now: DateTime<Utc>) -> RepositoryResult<()> {
        sqlx::query(
            "UPDATE labours SET status = 'unknown', updated_at = ?
             WHERE id = ? AND status IN ('deployed', 'running')",
        )
        .bind(now.timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark pending recurring labours scheduled before `before` as skipped
    pub async fn skip_missed_recurring(
        &self,
        before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<u64> {
        let result = sqlx::query(
            "UPDATE labours SET status = 'skipped', updated_at = ?, finished_at = ?
             WHERE status = 'pending' AND by_recurring = 1 AND execute_at < ?",
        )
        .bind(now.timestamp())
        .bind(now.timestamp())
        .bind(before.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Number of labours per status, including statuses with no rows
    pub async fn count_by_status(&self) -> RepositoryResult<Vec<(LabourStatus, i64)>> {
        let rows: Vec<(LabourStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM labours GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        Ok(LabourStatus::ALL
            .into_iter()
            .map(|status| {
                let count = rows
                    .iter()
                    .find(|(s, _)| *s == status)
                    .map(|(_, count)| *count)
                    .unwrap_or(0);
                (status, count)
            })
            .collect())
    }

    /// Labours of one worker+identity, most recent first
    pub async fn find_by_identity(
        &self,
        worker: &str,
        identity: &str,
    ) -> RepositoryResult<Vec<Labour>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM labours WHERE worker = ? AND identity = ? ORDER BY id DESC"
        );
        let rows = sqlx::query_as::<_, LabourRow>(&sql)
            .bind(worker)
            .bind(identity)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Labour::try_from).collect()
    }
}

fn push_id_filter(builder: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    builder.push(" WHERE id IN (");
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}

async fn fetch_one_row(conn: &mut SqliteConnection, id: i64) -> RepositoryResult<Option<Labour>> {
    let sql = format!("SELECT {COLUMNS} FROM labours WHERE id = ?");
    let row = sqlx::query_as::<_, LabourRow>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(Labour::try_from).transpose()
}

async fn fetch_rows(conn: &mut SqliteConnection, ids: &[i64]) -> RepositoryResult<Vec<Labour>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {COLUMNS} FROM labours"));
    push_id_filter(&mut builder, ids);
    builder.push(" ORDER BY id");
    let rows = builder
        .build_query_as::<LabourRow>()
        .fetch_all(&mut *conn)
        .await?;
    rows.into_iter().map(Labour::try_from).collect()
}

async fn bundle_member_ids(
    conn: &mut SqliteConnection,
    representative: &Labour,
) -> RepositoryResult<Vec<i64>> {
    let sql = format!(
        "SELECT id FROM labours
         WHERE parent_id = ? AND id != ? AND worker = ? AND identity = ?
           AND status IN {BUNDLE_MEMBER_STATUSES}
         ORDER BY id"
    );
    let ids: Vec<i64> = sqlx::query_scalar(&sql)
        .bind(representative.id)
        .bind(representative.id)
        .bind(&representative.worker)
        .bind(&representative.identity)
        .fetch_all(&mut *conn)
        .await?;
    Ok(ids)
}
