use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};

use crate::create_timestamp;
use crate::error::{Error, Result};

/// Lifecycle of the per-job micro-VM. Transitions only advance along
/// `pending -> ready -> running -> (exited | failed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Pending,
    Ready,
    Running,
    Exited,
    Failed,
}

impl VmState {
    pub fn as_str(self) -> &'static str {
        match self {
            VmState::Pending => "pending",
            VmState::Ready => "ready",
            VmState::Running => "running",
            VmState::Exited => "exited",
            VmState::Failed => "failed",
        }
    }

    /// Whether `next` is a legal forward transition. Self-transitions are
    /// permitted so that duplicated notifications converge.
    pub fn can_advance(self, next: VmState) -> bool {
        use VmState::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Pending, Ready) | (Ready, Running) | (Running, Exited) => true,
            (Pending | Ready | Running, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(VmState::Pending),
            "ready" => Ok(VmState::Ready),
            "running" => Ok(VmState::Running),
            "exited" => Ok(VmState::Exited),
            "failed" => Ok(VmState::Failed),
            other => Err(format!("unknown vm state '{other}'")),
        }
    }
}

impl Serialize for VmState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for VmState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Static-scan verdict for a job. `Suspicious` carries the match count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Pending,
    Scanning,
    Clean,
    Suspicious(u32),
    Critical,
    Error,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanState::Pending => f.write_str("pending"),
            ScanState::Scanning => f.write_str("scanning"),
            ScanState::Clean => f.write_str("clean"),
            ScanState::Suspicious(n) => write!(f, "suspicious({n})"),
            ScanState::Critical => f.write_str("critical"),
            ScanState::Error => f.write_str("error"),
        }
    }
}

impl FromStr for ScanState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => return Ok(ScanState::Pending),
            "scanning" => return Ok(ScanState::Scanning),
            "clean" => return Ok(ScanState::Clean),
            "critical" => return Ok(ScanState::Critical),
            "error" => return Ok(ScanState::Error),
            _ => {}
        }
        if let Some(count) = s
            .strip_prefix("suspicious(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            return count
                .parse()
                .map(ScanState::Suspicious)
                .map_err(|_| format!("bad suspicious count in '{s}'"));
        }
        Err(format!("unknown scan state '{s}'"))
    }
}

impl Serialize for ScanState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ScanState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One submission and its lifecycle, as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub content_hash: String,
    pub original_name: String,
    pub size_bytes: i64,
    pub disk_path: String,
    pub vm_state: VmState,
    pub scan_state: ScanState,
    pub created_at: String,
    pub updated_at: String,
}

/// Optional filters for job listings; all absent means "everything".
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub limit: Option<u32>,
    pub vm_state: Option<VmState>,
    pub hash: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VmTotals {
    pub pending: i64,
    pub ready: i64,
    pub running: i64,
    pub exited: i64,
    pub failed: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ScanTotals {
    pub pending: i64,
    pub scanning: i64,
    pub clean: i64,
    pub suspicious: i64,
    pub critical: i64,
    pub error: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct JobStats {
    pub total: i64,
    pub vm: VmTotals,
    pub scan: ScanTotals,
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = SqlitePoolOptions::new()
        .max_connections(2)
        .connect(&db_url)
        .await?;

    // PRAGMA statements cannot run inside a transaction
    for pragma_sql in &[
        "PRAGMA foreign_keys = ON;",
        "PRAGMA busy_timeout = 2000;",
        "PRAGMA journal_mode = WAL;",
        "PRAGMA synchronous = NORMAL;",
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    let mut tx = db_pool.begin().await?;

    for sql in &[
        r"
        CREATE TABLE IF NOT EXISTS jobs (
            id            TEXT     PRIMARY KEY,
            content_hash  TEXT     NOT NULL,
            original_name TEXT     NOT NULL,
            size_bytes    INTEGER  NOT NULL,
            disk_path     TEXT     NOT NULL,
            vm_state      TEXT     NOT NULL,
            scan_state    TEXT     NOT NULL,
            created_at    TEXT     NOT NULL,
            updated_at    TEXT     NOT NULL
        );",
        "CREATE INDEX IF NOT EXISTS idx_jobs_hash ON jobs (content_hash);",
        "CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs (created_at);",
    ] {
        sqlx::query(sql).execute(tx.as_mut()).await?;
    }

    tx.commit().await?;

    log::info!("Initialized job store at {}", db_path.as_ref().display());

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // Remove WAL and SHM files first (they might not exist)
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove job store at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed job store at {}", db_path.as_ref().display());
    }
}

const JOB_COLUMNS: &str = "id, content_hash, original_name, size_bytes, disk_path, \
                           vm_state, scan_state, created_at, updated_at";

fn decode_error(detail: String) -> Error {
    Error::Store(sqlx::Error::Decode(detail.into()))
}

fn row_to_job(row: &SqliteRow) -> Result<Job> {
    let vm_state: VmState = row
        .try_get::<String, _>("vm_state")?
        .parse()
        .map_err(decode_error)?;
    let scan_state: ScanState = row
        .try_get::<String, _>("scan_state")?
        .parse()
        .map_err(decode_error)?;

    Ok(Job {
        id: row.try_get("id")?,
        content_hash: row.try_get("content_hash")?,
        original_name: row.try_get("original_name")?,
        size_bytes: row.try_get("size_bytes")?,
        disk_path: row.try_get("disk_path")?,
        vm_state,
        scan_state,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Inserts a new job row. Fails if the id is already present; ids are never
/// reused, so a duplicate means the caller is broken.
pub async fn create_job(pool: &SqlitePool, job: &Job) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO jobs (id, content_hash, original_name, size_bytes, disk_path,
                          vm_state, scan_state, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&job.id)
    .bind(&job.content_hash)
    .bind(&job.original_name)
    .bind(job.size_bytes)
    .bind(&job.disk_path)
    .bind(job.vm_state.as_str())
    .bind(job.scan_state.to_string())
    .bind(&job.created_at)
    .bind(&job.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn fetch_job(pool: &SqlitePool, id: &str) -> Result<Job> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => row_to_job(&row),
        None => Err(Error::NotFound(id.to_string())),
    }
}

/// Advances `vm_state` along the legal path; anything else is refused so a
/// late notification can never rewind a job.
pub async fn update_vm_state(pool: &SqlitePool, id: &str, next: VmState) -> Result<()> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query("SELECT vm_state FROM jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(tx.as_mut())
        .await?;
    let Some(row) = row else {
        return Err(Error::NotFound(id.to_string()));
    };
    let current: VmState = row
        .try_get::<String, _>("vm_state")?
        .parse()
        .map_err(decode_error)?;

    if current == next {
        return Ok(());
    }
    if !current.can_advance(next) {
        return Err(Error::InvalidState {
            id: id.to_string(),
            state: current.as_str().to_string(),
            expected: next.as_str(),
        });
    }

    sqlx::query("UPDATE jobs SET vm_state = ?, updated_at = ? WHERE id = ?")
        .bind(next.as_str())
        .bind(create_timestamp())
        .bind(id)
        .execute(tx.as_mut())
        .await?;

    tx.commit().await?;
    Ok(())
}

pub async fn update_scan_state(pool: &SqlitePool, id: &str, state: &ScanState) -> Result<()> {
    let result = sqlx::query("UPDATE jobs SET scan_state = ?, updated_at = ? WHERE id = ?")
        .bind(state.to_string())
        .bind(create_timestamp())
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(id.to_string()));
    }
    Ok(())
}

/// Removes the job row. Returns whether a row was actually deleted.
pub async fn delete_job(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn fetch_jobs_by_query(pool: &SqlitePool, filter: &JobFilter) -> Result<Vec<Job>> {
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE 1=1"));

    if let Some(state) = filter.vm_state {
        qb.push(" AND vm_state = ").push_bind(state.as_str());
    }
    if let Some(ref hash) = filter.hash {
        qb.push(" AND content_hash = ").push_bind(hash.clone());
    }
    qb.push(" ORDER BY created_at DESC, id");
    if let Some(limit) = filter.limit {
        qb.push(" LIMIT ").push_bind(limit as i64);
    }

    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(row_to_job).collect()
}

pub async fn list_recent(pool: &SqlitePool, limit: u32) -> Result<Vec<Job>> {
    fetch_jobs_by_query(
        pool,
        &JobFilter {
            limit: Some(limit),
            ..JobFilter::default()
        },
    )
    .await
}

pub async fn list_by_vm_state(pool: &SqlitePool, state: VmState) -> Result<Vec<Job>> {
    fetch_jobs_by_query(
        pool,
        &JobFilter {
            vm_state: Some(state),
            ..JobFilter::default()
        },
    )
    .await
}

pub async fn list_by_hash(pool: &SqlitePool, hash: &str) -> Result<Vec<Job>> {
    fetch_jobs_by_query(
        pool,
        &JobFilter {
            hash: Some(hash.to_string()),
            ..JobFilter::default()
        },
    )
    .await
}

/// Totals by scan verdict and by VM state.
pub async fn job_stats(pool: &SqlitePool) -> Result<JobStats> {
    let mut stats = JobStats::default();

    let vm_rows = sqlx::query("SELECT vm_state, COUNT(*) AS n FROM jobs GROUP BY vm_state")
        .fetch_all(pool)
        .await?;
    for row in &vm_rows {
        let state: String = row.try_get("vm_state")?;
        let n: i64 = row.try_get("n")?;
        stats.total += n;
        match state.parse().map_err(decode_error)? {
            VmState::Pending => stats.vm.pending = n,
            VmState::Ready => stats.vm.ready = n,
            VmState::Running => stats.vm.running = n,
            VmState::Exited => stats.vm.exited = n,
            VmState::Failed => stats.vm.failed = n,
        }
    }

    let scan_rows = sqlx::query("SELECT scan_state, COUNT(*) AS n FROM jobs GROUP BY scan_state")
        .fetch_all(pool)
        .await?;
    for row in &scan_rows {
        let state: String = row.try_get("scan_state")?;
        let n: i64 = row.try_get("n")?;
        match state.parse().map_err(decode_error)? {
            ScanState::Pending => stats.scan.pending += n,
            ScanState::Scanning => stats.scan.scanning += n,
            ScanState::Clean => stats.scan.clean += n,
            ScanState::Suspicious(_) => stats.scan.suspicious += n,
            ScanState::Critical => stats.scan.critical += n,
            ScanState::Error => stats.scan.error += n,
        }
    }

    Ok(stats)
}
