use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnection, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::FromRow;

use crate::config::ProblemConfig;
use crate::create_timestamp;
use crate::submission::{
    JudgeContext, Limits, NewSubmission, Status, StatusView, Submission, SubmissionId, TestCase,
    Verdict,
};

const DATABASE_NAME: &str = "judge.sqlite3";

pub fn get_db_path() -> anyhow::Result<PathBuf> {
    use anyhow::Context;
    use directories::ProjectDirs;

    let proj_dirs =
        ProjectDirs::from("", "", "judge").context("Unable to find user directory")?;
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir).context("Failed to create local data dir")?;

    Ok(data_dir.join(DATABASE_NAME))
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    // Applied to every pooled connection, not just the first one
    let options = SqliteConnectOptions::new()
        .filename(db_path.as_ref())
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5)) // dispatchers contend on the queue table
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);

    let db_pool = SqlitePoolOptions::new()
        .max_connections(4)
        .min_connections(0)
        .connect_with(options)
        .await?;

    let mut tx = db_pool.begin().await?;

    for sql in &[
        r"
        CREATE TABLE IF NOT EXISTS problems (
            id               INTEGER  PRIMARY KEY,
            name             TEXT     NOT NULL,
            time_limit_ms    INTEGER  NOT NULL,
            memory_limit_mb  INTEGER
        );",
        r"
        CREATE TABLE IF NOT EXISTS test_cases (
            problem_id       INTEGER  NOT NULL,
            order_index      INTEGER  NOT NULL,
            input            TEXT     NOT NULL,
            expected_output  TEXT     NOT NULL,
            is_sample        INTEGER  NOT NULL DEFAULT 0,
            PRIMARY KEY (problem_id, order_index),
            FOREIGN KEY (problem_id)  REFERENCES problems (id)
        );",
        r"
        CREATE TABLE IF NOT EXISTS submissions (
            id               INTEGER  PRIMARY KEY AUTOINCREMENT,
            created_time     TEXT     NOT NULL,
            updated_time     TEXT     NOT NULL,
            problem_id       INTEGER  NOT NULL,
            contest_id       INTEGER,
            language         TEXT     NOT NULL,
            source_code      TEXT     NOT NULL,
            status           TEXT     NOT NULL DEFAULT 'PENDING',
            verdict          TEXT,
            diagnostic_text  TEXT,
            FOREIGN KEY (problem_id)  REFERENCES problems (id)
        );",
        r"
        CREATE TABLE IF NOT EXISTS submission_queue (
            seq              INTEGER  PRIMARY KEY AUTOINCREMENT,
            submission_id    INTEGER  NOT NULL
        );",
    ] {
        sqlx::query(sql).execute(tx.as_mut()).await?;
    }

    tx.commit().await?;

    log::info!("Initialized database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // Remove WAL and SHM files (ignore errors as they might not exist)
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

/// Inserts or replaces a problem and all of its test cases
pub async fn upsert_problem(pool: &SqlitePool, problem: &ProblemConfig) -> sqlx::Result<()> {
    let memory_limit = problem.memory_limit_mb.map(|m| m as i64);
    let mut tx = pool.begin().await?;

    sqlx::query(
        r"
        INSERT INTO problems (id, name, time_limit_ms, memory_limit_mb)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (id) DO UPDATE SET
            name = excluded.name,
            time_limit_ms = excluded.time_limit_ms,
            memory_limit_mb = excluded.memory_limit_mb
        ",
    )
    .bind(problem.id)
    .bind(&problem.name)
    .bind(problem.time_limit_ms as i64)
    .bind(memory_limit)
    .execute(tx.as_mut())
    .await?;

    sqlx::query("DELETE FROM test_cases WHERE problem_id = ?")
        .bind(problem.id)
        .execute(&mut *tx)
        .await?;

    for case in &problem.cases {
        sqlx::query(
            r"
            INSERT INTO test_cases (problem_id, order_index, input, expected_output, is_sample)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(problem.id)
        .bind(case.order)
        .bind(&case.input)
        .bind(&case.expected_output)
        .bind(case.sample)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    log::debug!(
        "Stored problem {} with {} test cases",
        problem.id,
        problem.cases.len()
    );
    Ok(())
}

pub async fn problem_exists(pool: &SqlitePool, problem_id: i64) -> sqlx::Result<bool> {
    let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM problems WHERE id = ?")
        .bind(problem_id)
        .fetch_optional(pool)
        .await?;
    Ok(found.is_some())
}

async fn insert_submission(
    conn: &mut SqliteConnection,
    submission: &NewSubmission<'_>,
) -> sqlx::Result<SubmissionId> {
    let now = create_timestamp();
    let result = sqlx::query(
        r"
        INSERT INTO submissions (created_time, updated_time, problem_id, contest_id, language, source_code, status)
        VALUES (?, ?, ?, ?, ?, ?, 'PENDING')
        ",
    )
    .bind(&now)
    .bind(&now)
    .bind(submission.problem_id)
    .bind(submission.contest_id)
    .bind(submission.language)
    .bind(submission.source_code)
    .execute(conn)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Creates a pending submission and returns its id
pub async fn create_submission(
    pool: &SqlitePool,
    submission: &NewSubmission<'_>,
) -> sqlx::Result<SubmissionId> {
    let mut conn = pool.acquire().await?;
    insert_submission(&mut conn, submission).await
}

/// Creates a pending submission and appends it to `submission_queue` atomically
pub async fn create_queued_submission(
    pool: &SqlitePool,
    submission: &NewSubmission<'_>,
) -> sqlx::Result<SubmissionId> {
    let mut tx = pool.begin().await?;

    let id = insert_submission(&mut tx, submission).await?;
    sqlx::query("INSERT INTO submission_queue (submission_id) VALUES (?)")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(id)
}

/// Removes a submission that was never handed to a dispatcher
pub async fn delete_submission(pool: &SqlitePool, id: SubmissionId) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM submissions WHERE id = ? AND status = 'PENDING'")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[derive(FromRow)]
struct SubmissionRow {
    id: i64,
    created_time: String,
    problem_id: i64,
    contest_id: Option<i64>,
    language: String,
    source_code: String,
    status: String,
    verdict: Option<String>,
    diagnostic_text: Option<String>,
}

impl TryFrom<SubmissionRow> for Submission {
    type Error = sqlx::Error;

    fn try_from(row: SubmissionRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<Status>()
            .map_err(|e| sqlx::Error::Decode(e.into()))?;
        let verdict = row
            .verdict
            .as_deref()
            .map(str::parse::<Verdict>)
            .transpose()
            .map_err(|e| sqlx::Error::Decode(e.into()))?;

        Ok(Submission {
            id: row.id,
            source_code: row.source_code,
            language: row.language,
            problem_id: row.problem_id,
            contest_id: row.contest_id,
            status,
            verdict,
            diagnostic_text: row.diagnostic_text,
            created_time: row.created_time,
        })
    }
}

#[derive(FromRow)]
struct LimitsRow {
    time_limit_ms: i64,
    memory_limit_mb: Option<i64>,
}

#[derive(FromRow)]
struct TestCaseRow {
    order_index: i64,
    input: String,
    expected_output: String,
    is_sample: bool,
}

pub async fn fetch_submission(
    pool: &SqlitePool,
    id: SubmissionId,
) -> sqlx::Result<Option<Submission>> {
    let row = sqlx::query_as::<_, SubmissionRow>(
        r"
        SELECT id, created_time, problem_id, contest_id, language, source_code, status, verdict, diagnostic_text
        FROM submissions
        WHERE id = ?
        ",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(Submission::try_from).transpose()
}

/// Loads a submission together with its problem limits and ordered test cases
///
/// Returns `Ok(None)` when either the submission or its problem is missing.
pub async fn fetch_judge_context(
    pool: &SqlitePool,
    id: SubmissionId,
) -> sqlx::Result<Option<JudgeContext>> {
    log::debug!("Trying to fetch submission {id} context from database");

    let Some(submission) = fetch_submission(pool, id).await? else {
        return Ok(None);
    };

    let limits = sqlx::query_as::<_, LimitsRow>(
        "SELECT time_limit_ms, memory_limit_mb FROM problems WHERE id = ?",
    )
    .bind(submission.problem_id)
    .fetch_optional(pool)
    .await?;
    let Some(limits) = limits else {
        log::warn!(
            "Problem {} of submission {id} does not exist",
            submission.problem_id
        );
        return Ok(None);
    };

    let test_cases = sqlx::query_as::<_, TestCaseRow>(
        r"
        SELECT order_index, input, expected_output, is_sample
        FROM test_cases
        WHERE problem_id = ?
        ORDER BY order_index
        ",
    )
    .bind(submission.problem_id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|row| TestCase {
        order_index: row.order_index,
        input: row.input,
        expected_output: row.expected_output,
        is_sample: row.is_sample,
    })
    .collect();

    Ok(Some(JudgeContext {
        submission,
        limits: Limits {
            time_limit_ms: limits.time_limit_ms.max(0) as u64,
            memory_limit_mb: limits.memory_limit_mb.map(|m| m.max(0) as u64),
        },
        test_cases,
    }))
}

/// Moves a submission from PENDING to RUNNING
///
/// Returns `false` without writing if the submission is not pending anymore.
pub async fn update_submission_to_running(
    pool: &SqlitePool,
    id: SubmissionId,
) -> sqlx::Result<bool> {
    let now = create_timestamp();
    let affected = sqlx::query(
        r"
        UPDATE submissions
        SET status = 'RUNNING', updated_time = ?
        WHERE id = ? AND status = 'PENDING'
        ",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(affected == 1)
}

/// Writes the terminal state of a submission
///
/// Guarded by `status != 'DONE'`, so a second writer cannot overwrite the
/// first verdict. Returns whether this call wrote it.
pub async fn save_verdict(
    pool: &SqlitePool,
    id: SubmissionId,
    verdict: Verdict,
    diagnostic_text: Option<&str>,
) -> sqlx::Result<bool> {
    let now = create_timestamp();
    let affected = sqlx::query(
        r"
        UPDATE submissions
        SET status = 'DONE', verdict = ?, diagnostic_text = ?, updated_time = ?
        WHERE id = ? AND status != 'DONE'
        ",
    )
    .bind(verdict.code())
    .bind(diagnostic_text)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(affected == 1)
}

pub async fn fetch_status_view(
    pool: &SqlitePool,
    id: SubmissionId,
) -> sqlx::Result<Option<StatusView>> {
    Ok(fetch_submission(pool, id)
        .await?
        .as_ref()
        .map(StatusView::from))
}
