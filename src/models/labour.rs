use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

use crate::errors::{RepositoryError, RepositoryResult};

/// Lifecycle state of a labour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LabourStatus {
    Pending,
    Deployed,
    Running,
    Finished,
    Failed,
    Skipped,
    Unknown,
    Replaced,
}

impl LabourStatus {
    pub const ALL: [LabourStatus; 8] = [
        LabourStatus::Pending,
        LabourStatus::Deployed,
        LabourStatus::Running,
        LabourStatus::Finished,
        LabourStatus::Failed,
        LabourStatus::Skipped,
        LabourStatus::Unknown,
        LabourStatus::Replaced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LabourStatus::Pending => "pending",
            LabourStatus::Deployed => "deployed",
            LabourStatus::Running => "running",
            LabourStatus::Finished => "finished",
            LabourStatus::Failed => "failed",
            LabourStatus::Skipped => "skipped",
            LabourStatus::Unknown => "unknown",
            LabourStatus::Replaced => "replaced",
        }
    }

    /// Handed to a worker process and not yet reported back
    pub fn is_in_flight(&self) -> bool {
        matches!(self, LabourStatus::Deployed | LabourStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LabourStatus::Finished
                | LabourStatus::Failed
                | LabourStatus::Skipped
                | LabourStatus::Replaced
        )
    }
}

impl fmt::Display for LabourStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LabourStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        LabourStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.to_lowercase())
            .ok_or_else(|| anyhow::anyhow!("Invalid labour status: {}", s))
    }
}

/// Per-worker concurrency and deduplication policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rule {
    /// No deduplication
    #[default]
    #[serde(alias = "none")]
    Run,
    /// At most one labour per worker+identity in flight
    Wait,
    /// Like `wait`, and pending siblings ride along with the one dispatched
    Batch,
    /// Drop new labours while one with the same worker+identity is pending
    Ignore,
    /// New labours supersede pending ones with the same worker+identity
    Replace,
}

impl Rule {
    /// Rules that keep a worker+identity pair from running twice at once
    pub fn excludes_in_flight(&self) -> bool {
        matches!(self, Rule::Wait | Rule::Batch)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Rule::Run => "run",
            Rule::Wait => "wait",
            Rule::Batch => "batch",
            Rule::Ignore => "ignore",
            Rule::Replace => "replace",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Rule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "run" | "none" => Ok(Rule::Run),
            "wait" => Ok(Rule::Wait),
            "batch" => Ok(Rule::Batch),
            "ignore" => Ok(Rule::Ignore),
            "replace" => Ok(Rule::Replace),
            _ => Err(anyhow::anyhow!("Invalid rule: {}", s)),
        }
    }
}

/// A persisted unit of work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Labour {
    pub id: i64,
    /// Representative id for bundle members, own id for retry lineage
    pub parent_id: Option<i64>,
    pub worker: String,
    pub identity: String,
    pub payload: serde_json::Value,
    pub status: LabourStatus,
    pub priority: i64,
    pub attempts: u32,
    pub pid: Option<u32>,
    pub by_recurring: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub execute_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Labour {
    /// `worker-identity` key used for in-flight deduplication
    pub fn in_flight_key(&self) -> String {
        in_flight_key(&self.worker, &self.identity)
    }

    /// Dispatched as part of another labour's bundle
    pub fn is_bundle_member(&self) -> bool {
        self.parent_id.is_some_and(|parent| parent != self.id)
    }
}

pub fn in_flight_key(worker: &str, identity: &str) -> String {
    format!("{worker}-{identity}")
}

/// Raw `labours` row as stored in SQLite
#[derive(Debug, Clone, FromRow)]
pub struct LabourRow {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub worker: String,
    pub identity: String,
    pub payload: String,
    pub status: LabourStatus,
    pub priority: i64,
    pub attempts: i64,
    pub pid: Option<i64>,
    pub by_recurring: bool,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub execute_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

pub(crate) fn from_unix(column: &str, seconds: i64) -> RepositoryResult<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| RepositoryError::decode(column, format!("timestamp {seconds} out of range")))
}

fn from_unix_opt(column: &str, seconds: Option<i64>) -> RepositoryResult<Option<DateTime<Utc>>> {
    seconds.map(|s| from_unix(column, s)).transpose()
}

impl TryFrom<LabourRow> for Labour {
    type Error = RepositoryError;

    fn try_from(row: LabourRow) -> RepositoryResult<Self> {
        let payload = serde_json::from_str(&row.payload)
            .map_err(|e| RepositoryError::decode("payload", e.to_string()))?;
        let attempts = u32::try_from(row.attempts)
            .map_err(|e| RepositoryError::decode("attempts", e.to_string()))?;
        let pid = row
            .pid
            .map(u32::try_from)
            .transpose()
            .map_err(|e| RepositoryError::decode("pid", e.to_string()))?;

        Ok(Labour {
            id: row.id,
            parent_id: row.parent_id,
            worker: row.worker,
            identity: row.identity,
            payload,
            status: row.status,
            priority: row.priority,
            attempts,
            pid,
            by_recurring: row.by_recurring,
            last_error: row.last_error,
            created_at: from_unix("created_at", row.created_at)?,
            updated_at: from_unix("updated_at", row.updated_at)?,
            execute_at: from_unix("execute_at", row.execute_at)?,
            started_at: from_unix_opt("started_at", row.started_at)?,
            finished_at: from_unix_opt("finished_at", row.finished_at)?,
        })
    }
}

/// Values for a labour about to be inserted
#[derive(Debug, Clone)]
pub struct NewLabour {
    pub worker: String,
    pub identity: String,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub by_recurring: bool,
    pub execute_at: DateTime<Utc>,
}
