use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::models::{AgentLane, JobRecord, LaneState, LaneStatus, Run, Stage, is_valid_transition};

/// Async-safe handle to the state database.
///
/// Wraps `StateDb` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<StateDb>>,
}

impl DbHandle {
    pub fn new(db: StateDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&StateDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// Lane changes applied together with a state transition.
#[derive(Debug, Clone, Default)]
pub struct LaneUpdate {
    /// Replaces the lane's current job.
    pub job_name: Option<String>,
    pub reason: Option<String>,
}

/// One accepted transition, in the order it was applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub state: LaneState,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

pub struct StateDb {
    conn: Connection,
}

impl StateDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing and dry runs).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure SQLite")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                prompt TEXT NOT NULL,
                agent_count INTEGER NOT NULL,
                run_dir TEXT NOT NULL,
                repository_root TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS lanes (
                run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                agent_id INTEGER NOT NULL,
                branch TEXT NOT NULL,
                worktree_path TEXT NOT NULL,
                stage TEXT NOT NULL,
                status TEXT NOT NULL,
                job_name TEXT,
                stage_started_at TEXT NOT NULL,
                reason TEXT,
                PRIMARY KEY (run_id, agent_id),
                UNIQUE (run_id, branch),
                UNIQUE (worktree_path)
            );

            CREATE TABLE IF NOT EXISTS jobs (
                job_name TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                agent_id INTEGER NOT NULL,
                stage TEXT NOT NULL,
                base_sha TEXT,
                submitted_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS lane_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
                agent_id INTEGER NOT NULL,
                stage TEXT NOT NULL,
                status TEXT NOT NULL,
                reason TEXT,
                at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_lanes_status ON lanes(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_lane ON jobs(run_id, agent_id, stage);
            CREATE INDEX IF NOT EXISTS idx_history_lane ON lane_history(run_id, agent_id);
            ",
        )?;
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    /// Persist a run and its lanes atomically, recording each lane's initial state.
    pub fn insert_run(&self, run: &Run, lanes: &[AgentLane]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO runs (run_id, prompt, agent_count, run_dir, repository_root, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.run_id,
                run.prompt,
                run.agent_count,
                run.run_dir.to_string_lossy(),
                run.repository_root.to_string_lossy(),
                run.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert run")?;

        for lane in lanes {
            tx.execute(
                "INSERT INTO lanes (run_id, agent_id, branch, worktree_path, stage, status, job_name, stage_started_at, reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    lane.run_id,
                    lane.agent_id,
                    lane.branch,
                    lane.worktree_path.to_string_lossy(),
                    lane.stage.as_str(),
                    lane.status.as_str(),
                    lane.job_name,
                    lane.stage_started_at.to_rfc3339(),
                    lane.reason,
                ],
            )
            .with_context(|| format!("Failed to insert lane {}", lane.agent_id))?;
            insert_history(&tx, &lane.run_id, lane.agent_id, lane.state(), None)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let row = self
            .conn
            .query_row(
                "SELECT run_id, prompt, agent_count, run_dir, repository_root, created_at
                 FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(run_id, prompt, agent_count, run_dir, root, created_at)| {
            Ok(Run {
                run_id,
                prompt,
                agent_count,
                run_dir: PathBuf::from(run_dir),
                repository_root: PathBuf::from(root),
                created_at: parse_time(&created_at)?,
            })
        })
        .transpose()
    }

    /// Runs with at least one lane that can still move: running, or a finished
    /// worker/reviewer waiting for its job to exit before the next stage starts.
    pub fn active_run_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT run_id FROM lanes
             WHERE status = 'running' OR (status = 'done' AND stage != 'committer')
             ORDER BY run_id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    // ── Lanes ─────────────────────────────────────────────────────────

    pub fn list_lanes(&self, run_id: &str) -> Result<Vec<AgentLane>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, agent_id, branch, worktree_path, stage, status, job_name, stage_started_at, reason
             FROM lanes WHERE run_id = ?1 ORDER BY agent_id",
        )?;
        let rows = stmt
            .query_map(params![run_id], LaneRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(LaneRow::into_lane).collect()
    }

    pub fn get_lane(&self, run_id: &str, agent_id: u32) -> Result<Option<AgentLane>> {
        let row = self
            .conn
            .query_row(
                "SELECT run_id, agent_id, branch, worktree_path, stage, status, job_name, stage_started_at, reason
                 FROM lanes WHERE run_id = ?1 AND agent_id = ?2",
                params![run_id, agent_id],
                LaneRow::from_row,
            )
            .optional()?;
        row.map(LaneRow::into_lane).transpose()
    }

    /// Compare-and-set a lane from `from` to `to`.
    ///
    /// Returns false, changing nothing, when the lane is no longer at `from`.
    /// Entering a new stage restarts the stage clock.
    pub fn transition_lane(
        &self,
        run_id: &str,
        agent_id: u32,
        from: LaneState,
        to: LaneState,
        update: LaneUpdate,
    ) -> Result<bool> {
        if !is_valid_transition(&from, &to) {
            bail!("Invalid lane transition {} -> {}", from, to);
        }

        let tx = self.conn.unchecked_transaction()?;
        let now = Utc::now().to_rfc3339();
        let changed = tx.execute(
            "UPDATE lanes SET
                stage = ?1,
                status = ?2,
                job_name = COALESCE(?3, job_name),
                reason = COALESCE(?4, reason),
                stage_started_at = CASE WHEN stage = ?1 THEN stage_started_at ELSE ?5 END
             WHERE run_id = ?6 AND agent_id = ?7 AND stage = ?8 AND status = ?9",
            params![
                to.stage.as_str(),
                to.status.as_str(),
                update.job_name,
                update.reason,
                now,
                run_id,
                agent_id,
                from.stage.as_str(),
                from.status.as_str(),
            ],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        insert_history(&tx, run_id, agent_id, to, update.reason.as_deref())?;
        tx.commit()?;
        Ok(true)
    }

    /// Every state the lane has been in, oldest first.
    pub fn lane_history(&self, run_id: &str, agent_id: u32) -> Result<Vec<HistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT stage, status, reason, at FROM lane_history
             WHERE run_id = ?1 AND agent_id = ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![run_id, agent_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(stage, status, reason, at)| {
                Ok(HistoryEntry {
                    state: LaneState::new(parse_stage(&stage)?, parse_status(&status)?),
                    reason,
                    at: parse_time(&at)?,
                })
            })
            .collect()
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    pub fn insert_job(&self, job: &JobRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO jobs (job_name, run_id, agent_id, stage, base_sha, submitted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    job.job_name,
                    job.run_id,
                    job.agent_id,
                    job.stage.as_str(),
                    job.base_sha,
                    job.submitted_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("Failed to record job {}", job.job_name))?;
        Ok(())
    }

    pub fn get_job(&self, job_name: &str) -> Result<Option<JobRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT job_name, run_id, agent_id, stage, base_sha, submitted_at
                 FROM jobs WHERE job_name = ?1",
                params![job_name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(job_name, run_id, agent_id, stage, base_sha, submitted_at)| {
            Ok(JobRecord {
                job_name,
                run_id,
                agent_id,
                stage: parse_stage(&stage)?,
                base_sha,
                submitted_at: parse_time(&submitted_at)?,
            })
        })
        .transpose()
    }
}

fn insert_history(
    conn: &Connection,
    run_id: &str,
    agent_id: u32,
    state: LaneState,
    reason: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO lane_history (run_id, agent_id, stage, status, reason, at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            run_id,
            agent_id,
            state.stage.as_str(),
            state.status.as_str(),
            reason,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp '{}'", value))?
        .with_timezone(&Utc))
}

fn parse_stage(value: &str) -> Result<Stage> {
    Stage::from_str(value)
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to parse lane stage")
}

fn parse_status(value: &str) -> Result<LaneStatus> {
    LaneStatus::from_str(value)
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to parse lane status")
}

/// Intermediate row struct for lanes.
struct LaneRow {
    run_id: String,
    agent_id: u32,
    branch: String,
    worktree_path: String,
    stage: String,
    status: String,
    job_name: Option<String>,
    stage_started_at: String,
    reason: Option<String>,
}

impl LaneRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            agent_id: row.get(1)?,
            branch: row.get(2)?,
            worktree_path: row.get(3)?,
            stage: row.get(4)?,
            status: row.get(5)?,
            job_name: row.get(6)?,
            stage_started_at: row.get(7)?,
            reason: row.get(8)?,
        })
    }

    fn into_lane(self) -> Result<AgentLane> {
        Ok(AgentLane {
            run_id: self.run_id,
            agent_id: self.agent_id,
            branch: self.branch,
            worktree_path: PathBuf::from(self.worktree_path),
            stage: parse_stage(&self.stage)?,
            status: parse_status(&self.status)?,
            job_name: self.job_name,
            stage_started_at: parse_time(&self.stage_started_at)?,
            reason: self.reason,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
