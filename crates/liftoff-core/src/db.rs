use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::types::{
    Build, BuildType, BuildUploadStatus, CiRunType, CronJob, CronStatus, CronToggles, CycleStatus,
    PauseType, Platform, PlatformTarget, RegressionCycle, RegressionSlot, Release, ReleaseConfig,
    ReleaseStatus, ReleaseTask, ReleaseUpload, Stage, StageStatus, TaskStatus, TaskType,
    UploadStage, WorkflowStatus,
};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

pub struct Db {
    conn: Mutex<Connection>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn fmt_ts(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn now_str() -> String {
    fmt_ts(Utc::now())
}

fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_ts(&s))
}

// ── Column helpers ────────────────────────────────────────────────────────

fn parse_col<T>(idx: usize, s: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    s.parse().map_err(|e: T::Err| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::<dyn std::error::Error + Send + Sync>::from(e.to_string()),
        )
    })
}

fn parse_opt_col<T>(idx: usize, s: Option<String>) -> rusqlite::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match s {
        Some(s) => parse_col(idx, s).map(Some),
        None => Ok(None),
    }
}

/// JSON columns are lenient on read: a malformed blob falls back to the
/// type default rather than poisoning the whole row.
fn parse_json<T: serde::de::DeserializeOwned + Default>(s: &str) -> T {
    serde_json::from_str(s).unwrap_or_default()
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_release(row: &rusqlite::Row<'_>) -> rusqlite::Result<Release> {
    let release_type: String = row.get(5)?;
    let status: String = row.get(6)?;
    let kick_off: String = row.get(7)?;
    let target: String = row.get(8)?;
    let release_date: Option<String> = row.get(9)?;
    let manual: i64 = row.get(10)?;
    let created_at: String = row.get(15)?;
    Ok(Release {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        release_branch: row.get(3)?,
        base_branch: row.get(4)?,
        release_type: parse_col(5, release_type)?,
        status: parse_col(6, status)?,
        kick_off_date: parse_ts(&kick_off),
        target_release_date: parse_ts(&target),
        release_date: parse_opt_ts(release_date),
        has_manual_build_upload: manual != 0,
        release_config_id: row.get(11)?,
        created_by: row.get(12)?,
        release_pilot: row.get(13)?,
        last_updated_by: row.get(14)?,
        created_at: parse_ts(&created_at),
    })
}

fn row_to_cron_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<CronJob> {
    let cron_status: String = row.get(2)?;
    let s1: String = row.get(3)?;
    let s2: String = row.get(4)?;
    let s3: String = row.get(5)?;
    let toggles: String = row.get(6)?;
    let upcoming: String = row.get(7)?;
    let auto2: i64 = row.get(8)?;
    let auto3: i64 = row.get(9)?;
    let pause: String = row.get(10)?;
    let stopped: Option<String> = row.get(11)?;
    Ok(CronJob {
        id: row.get(0)?,
        release_id: row.get(1)?,
        cron_status: parse_col(2, cron_status)?,
        stage1_status: parse_col(3, s1)?,
        stage2_status: parse_col(4, s2)?,
        stage3_status: parse_col(5, s3)?,
        toggles: parse_json::<CronToggles>(&toggles),
        upcoming_regressions: parse_json::<Vec<RegressionSlot>>(&upcoming),
        auto_transition_to_stage2: auto2 != 0,
        auto_transition_to_stage3: auto3 != 0,
        pause_type: parse_col(10, pause)?,
        cron_stopped_at: parse_opt_ts(stopped),
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReleaseTask> {
    let task_type: String = row.get(3)?;
    let stage: String = row.get(4)?;
    let status: String = row.get(5)?;
    let external_data: String = row.get(7)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;
    Ok(ReleaseTask {
        id: row.get(0)?,
        release_id: row.get(1)?,
        cycle_id: row.get(2)?,
        task_type: parse_col(3, task_type)?,
        stage: parse_col(4, stage)?,
        status: parse_col(5, status)?,
        external_id: row.get(6)?,
        external_data: serde_json::from_str(&external_data)
            .unwrap_or(serde_json::Value::Null),
        account_id: row.get(8)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn row_to_cycle(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegressionCycle> {
    let status: String = row.get(3)?;
    let is_latest: i64 = row.get(4)?;
    let created_at: String = row.get(5)?;
    Ok(RegressionCycle {
        id: row.get(0)?,
        release_id: row.get(1)?,
        cycle_tag: row.get(2)?,
        status: parse_col(3, status)?,
        is_latest: is_latest != 0,
        created_at: parse_ts(&created_at),
    })
}

fn row_to_build(row: &rusqlite::Row<'_>) -> rusqlite::Result<Build> {
    let platform: String = row.get(3)?;
    let build_type: String = row.get(4)?;
    let ci_run_type: Option<String> = row.get(5)?;
    let workflow: String = row.get(8)?;
    let upload: String = row.get(9)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;
    Ok(Build {
        id: row.get(0)?,
        release_id: row.get(1)?,
        task_id: row.get(2)?,
        platform: parse_col(3, platform)?,
        build_type: parse_col(4, build_type)?,
        ci_run_type: parse_opt_col(5, ci_run_type)?,
        queue_location: row.get(6)?,
        ci_run_id: row.get(7)?,
        workflow_status: parse_col(8, workflow)?,
        build_upload_status: parse_col(9, upload)?,
        artifact_path: row.get(10)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn row_to_upload(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReleaseUpload> {
    let platform: String = row.get(3)?;
    let stage: String = row.get(4)?;
    let is_used: i64 = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok(ReleaseUpload {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        release_id: row.get(2)?,
        platform: parse_col(3, platform)?,
        stage: parse_col(4, stage)?,
        artifact_path: row.get(5)?,
        is_used: is_used != 0,
        created_at: parse_ts(&created_at),
    })
}

fn row_to_target(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlatformTarget> {
    let platform: String = row.get(2)?;
    let target: String = row.get(3)?;
    Ok(PlatformTarget {
        id: row.get(0)?,
        release_id: row.get(1)?,
        platform: parse_col(2, platform)?,
        target: parse_col(3, target)?,
        version: row.get(4)?,
    })
}

fn row_to_release_config(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReleaseConfig> {
    let ci_provider: String = row.get(3)?;
    let toggles: String = row.get(8)?;
    Ok(ReleaseConfig {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        ci_provider: parse_col(3, ci_provider)?,
        ci_workflow_id: row.get(4)?,
        pm_project_key: row.get(5)?,
        test_mgmt_project: row.get(6)?,
        notification_channel: row.get(7)?,
        default_toggles: parse_json::<CronToggles>(&toggles),
    })
}

const RELEASE_COLS: &str = "id, tenant_id, name, release_branch, base_branch, release_type, \
     status, kick_off_date, target_release_date, release_date, has_manual_build_upload, \
     release_config_id, created_by, release_pilot, last_updated_by, created_at";

const CRON_COLS: &str = "id, release_id, cron_status, stage1_status, stage2_status, \
     stage3_status, cron_config, upcoming_regressions, auto_transition_to_stage2, \
     auto_transition_to_stage3, pause_type, cron_stopped_at";

const TASK_COLS: &str = "id, release_id, cycle_id, task_type, stage, status, external_id, \
     external_data, account_id, created_at, updated_at";

const CYCLE_COLS: &str = "id, release_id, cycle_tag, status, is_latest, created_at";

const BUILD_COLS: &str = "id, release_id, task_id, platform, build_type, ci_run_type, \
     queue_location, ci_run_id, workflow_status, build_upload_status, artifact_path, \
     created_at, updated_at";

const UPLOAD_COLS: &str =
    "id, tenant_id, release_id, platform, stage, artifact_path, is_used, created_at";

const TARGET_COLS: &str = "id, release_id, platform, target, version";

const CONFIG_COLS: &str = "id, tenant_id, name, ci_provider, ci_workflow_id, pm_project_key, \
     test_mgmt_project, notification_channel, default_toggles";

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&mut self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;
        // Idempotent column additions for DBs created before these columns existed.
        // ALTER TABLE fails if the column already exists; ignore that error.
        let alters = [
            "ALTER TABLE releases ADD COLUMN release_pilot TEXT NOT NULL DEFAULT ''",
            "ALTER TABLE builds ADD COLUMN artifact_path TEXT",
        ];
        for sql in alters {
            let _ = conn.execute(sql, []);
        }
        Ok(())
    }

    // ── Releases ──────────────────────────────────────────────────────────

    pub fn insert_release(&self, release: &Release) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO releases \
             (tenant_id, name, release_branch, base_branch, release_type, status, \
              kick_off_date, target_release_date, release_date, has_manual_build_upload, \
              release_config_id, created_by, release_pilot, last_updated_by, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
            params![
                release.tenant_id,
                release.name,
                release.release_branch,
                release.base_branch,
                release.release_type.as_str(),
                release.status.as_str(),
                fmt_ts(release.kick_off_date),
                fmt_ts(release.target_release_date),
                release.release_date.map(fmt_ts),
                release.has_manual_build_upload as i64,
                release.release_config_id,
                release.created_by,
                release.release_pilot,
                release.last_updated_by,
                fmt_ts(release.created_at),
            ],
        )
        .context("insert_release")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_release(&self, id: i64) -> Result<Option<Release>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!("SELECT {RELEASE_COLS} FROM releases WHERE id = ?1"),
            params![id],
            row_to_release,
        )
        .optional()
        .context("get_release")
    }

    pub fn list_releases(&self, tenant_id: Option<&str>) -> Result<Vec<Release>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {RELEASE_COLS} FROM releases \
             WHERE (?1 IS NULL OR tenant_id = ?1) ORDER BY id DESC"
        ))?;
        let releases = stmt
            .query_map(params![tenant_id], row_to_release)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_releases")?;
        Ok(releases)
    }

    pub fn update_release_status(&self, id: i64, status: ReleaseStatus, by: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE releases SET status = ?1, last_updated_by = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.as_str(), by, now_str(), id],
        )
        .context("update_release_status")?;
        Ok(())
    }

    pub fn set_release_date(&self, id: i64, date: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE releases SET release_date = ?1, updated_at = ?2 WHERE id = ?3",
            params![fmt_ts(date), now_str(), id],
        )
        .context("set_release_date")?;
        Ok(())
    }

    // ── Cron jobs ─────────────────────────────────────────────────────────

    pub fn insert_cron_job(&self, job: &CronJob) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO cron_jobs \
             (release_id, cron_status, stage1_status, stage2_status, stage3_status, \
              cron_config, upcoming_regressions, auto_transition_to_stage2, \
              auto_transition_to_stage3, pause_type, cron_stopped_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                job.release_id,
                job.cron_status.as_str(),
                job.stage1_status.as_str(),
                job.stage2_status.as_str(),
                job.stage3_status.as_str(),
                serde_json::to_string(&job.toggles).unwrap_or_else(|_| "{}".into()),
                serde_json::to_string(&job.upcoming_regressions).unwrap_or_else(|_| "[]".into()),
                job.auto_transition_to_stage2 as i64,
                job.auto_transition_to_stage3 as i64,
                job.pause_type.as_str(),
                job.cron_stopped_at.map(fmt_ts),
            ],
        )
        .context("insert_cron_job")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_cron_job(&self, release_id: i64) -> Result<Option<CronJob>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!("SELECT {CRON_COLS} FROM cron_jobs WHERE release_id = ?1"),
            params![release_id],
            row_to_cron_job,
        )
        .optional()
        .context("get_cron_job")
    }

    pub fn update_cron_status(&self, release_id: i64, status: CronStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE cron_jobs SET cron_status = ?1 WHERE release_id = ?2",
            params![status.as_str(), release_id],
        )
        .context("update_cron_status")?;
        Ok(())
    }

    pub fn update_stage_status(
        &self,
        release_id: i64,
        stage: Stage,
        status: StageStatus,
    ) -> Result<()> {
        let column = match stage {
            Stage::Kickoff => "stage1_status",
            Stage::Regression => "stage2_status",
            Stage::PostRegression => "stage3_status",
        };
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            &format!("UPDATE cron_jobs SET {column} = ?1 WHERE release_id = ?2"),
            params![status.as_str(), release_id],
        )
        .context("update_stage_status")?;
        Ok(())
    }

    pub fn update_pause_type(&self, release_id: i64, pause: PauseType) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE cron_jobs SET pause_type = ?1 WHERE release_id = ?2",
            params![pause.as_str(), release_id],
        )
        .context("update_pause_type")?;
        Ok(())
    }

    pub fn set_upcoming_regressions(
        &self,
        release_id: i64,
        slots: &[RegressionSlot],
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE cron_jobs SET upcoming_regressions = ?1 WHERE release_id = ?2",
            params![
                serde_json::to_string(slots).unwrap_or_else(|_| "[]".into()),
                release_id
            ],
        )
        .context("set_upcoming_regressions")?;
        Ok(())
    }

    pub fn set_cron_stopped_at(&self, release_id: i64, at: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE cron_jobs SET cron_stopped_at = ?1 WHERE release_id = ?2",
            params![at.map(fmt_ts), release_id],
        )
        .context("set_cron_stopped_at")?;
        Ok(())
    }

    // ── Release tasks ─────────────────────────────────────────────────────

    pub fn insert_task(&self, task: &ReleaseTask) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO release_tasks \
             (release_id, cycle_id, task_type, stage, status, external_id, external_data, \
              account_id, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                task.release_id,
                task.cycle_id,
                task.task_type.as_str(),
                task.stage.as_str(),
                task.status.as_str(),
                task.external_id,
                task.external_data.to_string(),
                task.account_id,
                fmt_ts(task.created_at),
            ],
        )
        .context("insert_task")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_task(&self, id: i64) -> Result<Option<ReleaseTask>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!("SELECT {TASK_COLS} FROM release_tasks WHERE id = ?1"),
            params![id],
            row_to_task,
        )
        .optional()
        .context("get_task")
    }

    pub fn list_tasks_for_release(&self, release_id: i64) -> Result<Vec<ReleaseTask>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLS} FROM release_tasks WHERE release_id = ?1 ORDER BY id ASC"
        ))?;
        let tasks = stmt
            .query_map(params![release_id], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_tasks_for_release")?;
        Ok(tasks)
    }

    /// Tasks of one stage group. `cycle_id` scopes cycle tasks; `None`
    /// selects the release-level tasks of the stage.
    pub fn list_tasks_for_stage(
        &self,
        release_id: i64,
        stage: Stage,
        cycle_id: Option<i64>,
    ) -> Result<Vec<ReleaseTask>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLS} FROM release_tasks \
             WHERE release_id = ?1 AND stage = ?2 \
             AND ((?3 IS NULL AND cycle_id IS NULL) OR cycle_id = ?3) \
             ORDER BY id ASC"
        ))?;
        let tasks = stmt
            .query_map(params![release_id, stage.as_str(), cycle_id], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_tasks_for_stage")?;
        Ok(tasks)
    }

    /// Most recent task of a given type for a release, any cycle.
    pub fn find_task_by_type(
        &self,
        release_id: i64,
        task_type: TaskType,
    ) -> Result<Option<ReleaseTask>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!(
                "SELECT {TASK_COLS} FROM release_tasks \
                 WHERE release_id = ?1 AND task_type = ?2 ORDER BY id DESC LIMIT 1"
            ),
            params![release_id, task_type.as_str()],
            row_to_task,
        )
        .optional()
        .context("find_task_by_type")
    }

    pub fn list_tasks_by_status(
        &self,
        release_id: i64,
        status: TaskStatus,
    ) -> Result<Vec<ReleaseTask>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLS} FROM release_tasks \
             WHERE release_id = ?1 AND status = ?2 ORDER BY id ASC"
        ))?;
        let tasks = stmt
            .query_map(params![release_id, status.as_str()], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_tasks_by_status")?;
        Ok(tasks)
    }

    /// Re-arms tasks stranded IN_PROGRESS by a crash mid-dispatch. Approval
    /// tasks are excluded; they park IN_PROGRESS until their sign-off.
    pub fn reset_stranded_tasks(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute(
                "UPDATE release_tasks SET status = 'PENDING', updated_at = ?1 \
                 WHERE status = 'IN_PROGRESS' \
                 AND task_type NOT IN ('TESTFLIGHT_BUILD_VERIFIED', 'REGRESSION_STAGE_APPROVAL')",
                params![now_str()],
            )
            .context("reset_stranded_tasks")?;
        Ok(n)
    }

    pub fn update_task_status(&self, id: i64, status: TaskStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE release_tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now_str(), id],
        )
        .context("update_task_status")?;
        Ok(())
    }

    pub fn update_task_external(
        &self,
        id: i64,
        external_id: Option<&str>,
        external_data: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE release_tasks SET external_id = COALESCE(?1, external_id), \
             external_data = ?2, updated_at = ?3 WHERE id = ?4",
            params![external_id, external_data.to_string(), now_str(), id],
        )
        .context("update_task_external")?;
        Ok(())
    }

    // ── Regression cycles ─────────────────────────────────────────────────

    /// Creates a new latest cycle, clearing `is_latest` on all prior cycles
    /// of the release.
    pub fn insert_cycle(&self, release_id: i64, cycle_tag: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE regression_cycles SET is_latest = 0 WHERE release_id = ?1",
            params![release_id],
        )
        .context("insert_cycle clear latest")?;
        conn.execute(
            "INSERT INTO regression_cycles (release_id, cycle_tag, status, is_latest, created_at) \
             VALUES (?1, ?2, 'IN_PROGRESS', 1, ?3)",
            params![release_id, cycle_tag, now_str()],
        )
        .context("insert_cycle")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn latest_cycle(&self, release_id: i64) -> Result<Option<RegressionCycle>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!(
                "SELECT {CYCLE_COLS} FROM regression_cycles \
                 WHERE release_id = ?1 AND is_latest = 1 ORDER BY id DESC LIMIT 1"
            ),
            params![release_id],
            row_to_cycle,
        )
        .optional()
        .context("latest_cycle")
    }

    pub fn list_cycles(&self, release_id: i64) -> Result<Vec<RegressionCycle>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {CYCLE_COLS} FROM regression_cycles WHERE release_id = ?1 ORDER BY id ASC"
        ))?;
        let cycles = stmt
            .query_map(params![release_id], row_to_cycle)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_cycles")?;
        Ok(cycles)
    }

    pub fn update_cycle_status(&self, id: i64, status: CycleStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE regression_cycles SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )
        .context("update_cycle_status")?;
        Ok(())
    }

    /// Count of cycles still pending work (NOT_STARTED or IN_PROGRESS).
    pub fn active_cycle_count(&self, release_id: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT COUNT(*) FROM regression_cycles \
             WHERE release_id = ?1 AND status IN ('NOT_STARTED', 'IN_PROGRESS')",
            params![release_id],
            |r| r.get(0),
        )
        .context("active_cycle_count")
    }

    // ── Builds ────────────────────────────────────────────────────────────

    pub fn insert_build(&self, build: &Build) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO builds \
             (release_id, task_id, platform, build_type, ci_run_type, queue_location, \
              ci_run_id, workflow_status, build_upload_status, artifact_path, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                build.release_id,
                build.task_id,
                build.platform.as_str(),
                build.build_type.as_str(),
                build.ci_run_type.map(|c| c.as_str()),
                build.queue_location,
                build.ci_run_id,
                build.workflow_status.as_str(),
                build.build_upload_status.as_str(),
                build.artifact_path,
                fmt_ts(build.created_at),
            ],
        )
        .context("insert_build")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_builds_for_task(&self, task_id: i64) -> Result<Vec<Build>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {BUILD_COLS} FROM builds WHERE task_id = ?1 ORDER BY id ASC"
        ))?;
        let builds = stmt
            .query_map(params![task_id], row_to_build)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_builds_for_task")?;
        Ok(builds)
    }

    pub fn find_build(&self, task_id: i64, platform: Platform) -> Result<Option<Build>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!(
                "SELECT {BUILD_COLS} FROM builds \
                 WHERE task_id = ?1 AND platform = ?2 ORDER BY id DESC LIMIT 1"
            ),
            params![task_id, platform.as_str()],
            row_to_build,
        )
        .optional()
        .context("find_build")
    }

    pub fn list_cicd_builds_by_workflow_status(
        &self,
        release_id: i64,
        status: WorkflowStatus,
    ) -> Result<Vec<Build>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {BUILD_COLS} FROM builds \
             WHERE release_id = ?1 AND build_type = 'CICD' AND workflow_status = ?2 \
             ORDER BY id ASC"
        ))?;
        let builds = stmt
            .query_map(params![release_id, status.as_str()], row_to_build)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_cicd_builds_by_workflow_status")?;
        Ok(builds)
    }

    pub fn update_build_queue(
        &self,
        id: i64,
        queue_location: &str,
        ci_run_type: CiRunType,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE builds SET queue_location = ?1, ci_run_type = ?2, updated_at = ?3 \
             WHERE id = ?4",
            params![queue_location, ci_run_type.as_str(), now_str(), id],
        )
        .context("update_build_queue")?;
        Ok(())
    }

    pub fn update_build_workflow(
        &self,
        id: i64,
        status: WorkflowStatus,
        ci_run_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE builds SET workflow_status = ?1, ci_run_id = COALESCE(?2, ci_run_id), \
             updated_at = ?3 WHERE id = ?4",
            params![status.as_str(), ci_run_id, now_str(), id],
        )
        .context("update_build_workflow")?;
        Ok(())
    }

    pub fn update_build_upload(
        &self,
        id: i64,
        status: BuildUploadStatus,
        artifact_path: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE builds SET build_upload_status = ?1, \
             artifact_path = COALESCE(?2, artifact_path), updated_at = ?3 WHERE id = ?4",
            params![status.as_str(), artifact_path, now_str(), id],
        )
        .context("update_build_upload")?;
        Ok(())
    }

    /// Clears failed build rows for a task so a retry can re-trigger them.
    /// Returns the number of rows removed.
    pub fn reset_failed_builds_for_task(&self, task_id: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute(
                "DELETE FROM builds WHERE task_id = ?1 AND \
                 (workflow_status = 'FAILED' OR build_upload_status = 'FAILED')",
                params![task_id],
            )
            .context("reset_failed_builds_for_task")?;
        Ok(n)
    }

    // ── Release uploads ───────────────────────────────────────────────────

    /// Last upload wins per (release, platform, stage); a re-upload resets
    /// `is_used` so a retried task can consume it again.
    pub fn upsert_upload(&self, upload: &ReleaseUpload) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO release_uploads \
             (tenant_id, release_id, platform, stage, artifact_path, is_used, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6) \
             ON CONFLICT (release_id, platform, stage) DO UPDATE SET \
             artifact_path = excluded.artifact_path, is_used = 0, \
             created_at = excluded.created_at",
            params![
                upload.tenant_id,
                upload.release_id,
                upload.platform.as_str(),
                upload.stage.as_str(),
                upload.artifact_path,
                fmt_ts(upload.created_at),
            ],
        )
        .context("upsert_upload")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_unused_uploads(
        &self,
        release_id: i64,
        stage: UploadStage,
    ) -> Result<Vec<ReleaseUpload>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {UPLOAD_COLS} FROM release_uploads \
             WHERE release_id = ?1 AND stage = ?2 AND is_used = 0 ORDER BY id ASC"
        ))?;
        let uploads = stmt
            .query_map(params![release_id, stage.as_str()], row_to_upload)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_unused_uploads")?;
        Ok(uploads)
    }

    pub fn mark_upload_used(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE release_uploads SET is_used = 1 WHERE id = ?1",
            params![id],
        )
        .context("mark_upload_used")?;
        Ok(())
    }

    // ── Platform targets ──────────────────────────────────────────────────

    pub fn insert_platform_target(&self, target: &PlatformTarget) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO platform_targets (release_id, platform, target, version) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                target.release_id,
                target.platform.as_str(),
                target.target.as_str(),
                target.version,
            ],
        )
        .context("insert_platform_target")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_platform_targets(&self, release_id: i64) -> Result<Vec<PlatformTarget>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {TARGET_COLS} FROM platform_targets WHERE release_id = ?1 ORDER BY id ASC"
        ))?;
        let targets = stmt
            .query_map(params![release_id], row_to_target)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_platform_targets")?;
        Ok(targets)
    }

    // ── Release configs ───────────────────────────────────────────────────

    pub fn insert_release_config(&self, config: &ReleaseConfig) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO release_configs \
             (tenant_id, name, ci_provider, ci_workflow_id, pm_project_key, \
              test_mgmt_project, notification_channel, default_toggles) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                config.tenant_id,
                config.name,
                config.ci_provider.as_str(),
                config.ci_workflow_id,
                config.pm_project_key,
                config.test_mgmt_project,
                config.notification_channel,
                serde_json::to_string(&config.default_toggles).unwrap_or_else(|_| "{}".into()),
            ],
        )
        .context("insert_release_config")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_release_config(&self, id: i64) -> Result<Option<ReleaseConfig>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!("SELECT {CONFIG_COLS} FROM release_configs WHERE id = ?1"),
            params![id],
            row_to_release_config,
        )
        .optional()
        .context("get_release_config")
    }
}

/// Convenience constructor for a new build row pending insertion.
pub fn new_build(
    release_id: i64,
    task_id: i64,
    platform: Platform,
    build_type: BuildType,
    ci_run_type: Option<CiRunType>,
) -> Build {
    Build {
        id: 0,
        release_id,
        task_id,
        platform,
        build_type,
        ci_run_type,
        queue_location: None,
        ci_run_id: None,
        workflow_status: WorkflowStatus::Pending,
        build_upload_status: BuildUploadStatus::Pending,
        artifact_path: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}
