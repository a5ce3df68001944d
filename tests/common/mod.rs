#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use sqlx::sqlite::SqlitePool;

use judge::config::{ProblemCaseConfig, ProblemConfig};
use judge::database as db;
use judge::language::{LanguageRegistry, LanguageSpec};
use judge::sandbox::{CommandOutput, Environment, EnvironmentProvider, INPUT_FILE, RunLimits};
use judge::store::SubmissionStore;
use judge::submission::{JudgeContext, NewSubmission, StatusView, SubmissionId, Verdict};

// Global counter to ensure unique test database names
static TEST_DB_COUNTER: AtomicU32 = AtomicU32::new(0);

/// A throwaway database under `data/`, removed on drop
pub struct TestDb {
    pub pool: SqlitePool,
    db_path: String,
}

impl TestDb {
    pub async fn new(prefix: &str) -> Self {
        let test_id = TEST_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
        let db_path = format!("data/test_{prefix}_{test_id}.db");

        // Remove leftovers of an aborted run
        db::remove_db(&db_path);

        let pool = db::init_db(&db_path).await.unwrap();
        Self { pool, db_path }
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.db_path);
        let _ = fs::remove_file(format!("{}-wal", self.db_path));
        let _ = fs::remove_file(format!("{}-shm", self.db_path));
    }
}

/// The "A + B" problem: two ordered cases, 2 s limit
pub fn sum_problem(id: i64) -> ProblemConfig {
    ProblemConfig {
        id,
        name: "A + B".to_string(),
        time_limit_ms: 2000,
        memory_limit_mb: Some(256),
        cases: vec![
            ProblemCaseConfig {
                order: 1,
                input: "3 4\n".to_string(),
                expected_output: "7\n".to_string(),
                sample: true,
            },
            ProblemCaseConfig {
                order: 2,
                input: "10 -2\n".to_string(),
                expected_output: "8\n".to_string(),
                sample: false,
            },
        ],
    }
}

pub async fn submit(pool: &SqlitePool, problem_id: i64, language: &str, source: &str) -> SubmissionId {
    let submission = NewSubmission {
        problem_id,
        contest_id: None,
        language,
        source_code: source,
    };
    db::create_submission(pool, &submission).await.unwrap()
}

/// Source file and commands understood by [`ScriptedProvider`]
pub const FAKE_LANGUAGE: &str = "fake";
pub const FAKE_COMPILE: &str = "build main.src";
pub const FAKE_RUN: &str = "run main.src";

pub fn fake_language() -> LanguageSpec {
    LanguageSpec::new(FAKE_LANGUAGE, "main.src", Some(FAKE_COMPILE), FAKE_RUN)
}

pub fn languages_with_fake() -> LanguageRegistry {
    let mut registry = LanguageRegistry::builtin();
    registry.insert(fake_language());
    registry
}

pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(0),
        stdout: stdout.to_string(),
        ..CommandOutput::default()
    }
}

pub fn failed(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(code),
        stderr: stderr.to_string(),
        ..CommandOutput::default()
    }
}

/// Called with the source code, the command and the current stdin file
type Script = dyn Fn(&str, &str, &str) -> Result<CommandOutput> + Send + Sync;

#[derive(Default)]
struct Calls {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    commands: Mutex<Vec<String>>,
    inputs: Mutex<Vec<String>>,
}

/// Provider whose commands are answered by a closure instead of a process
pub struct ScriptedProvider {
    script: Arc<Script>,
    calls: Arc<Calls>,
    create_error: Option<String>,
}

pub struct ScriptedEnvironment {
    files: HashMap<String, String>,
    script: Arc<Script>,
    calls: Arc<Calls>,
}

impl ScriptedProvider {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&str, &str, &str) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        Self {
            script: Arc::new(script),
            calls: Arc::default(),
            create_error: None,
        }
    }

    /// Answers every run by interpreting the source as a tiny program:
    /// `sum` adds the input numbers, `print N` prints N, `loop` times out,
    /// `crash` exits with 1 and `syntax error` fails to compile.
    pub fn interpreter() -> Self {
        Self::new(|source, command, input| {
            if command == FAKE_COMPILE {
                return Ok(if source.contains("syntax error") {
                    failed(1, "main.src:1: expected `;`")
                } else {
                    ok("")
                });
            }
            if source == "sum" {
                let sum: i64 = input
                    .split_whitespace()
                    .map(|n| n.parse::<i64>().unwrap())
                    .sum();
                Ok(ok(&format!("{sum}\n")))
            } else if let Some(value) = source.strip_prefix("print ") {
                Ok(ok(&format!("{value}\n")))
            } else if source == "loop" {
                Ok(CommandOutput::timed_out())
            } else if source == "crash" {
                Ok(failed(1, "Traceback: boom"))
            } else if source == "panic" {
                panic!("scripted panic")
            } else {
                Err(anyhow!("unknown program {source}"))
            }
        })
    }

    pub fn failing_create(message: &str) -> Self {
        Self {
            create_error: Some(message.to_string()),
            ..Self::interpreter()
        }
    }

    pub fn created(&self) -> usize {
        self.calls.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.calls.destroyed.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls.commands.lock().clone()
    }

    /// Stdin content of every run, in execution order
    pub fn inputs(&self) -> Vec<String> {
        self.calls.inputs.lock().clone()
    }

    pub fn runs(&self) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.ends_with(INPUT_FILE))
            .count()
    }
}

impl EnvironmentProvider for ScriptedProvider {
    type Env = ScriptedEnvironment;

    async fn create(&self) -> Result<ScriptedEnvironment> {
        if let Some(message) = &self.create_error {
            return Err(anyhow!("{message}"));
        }
        self.calls.created.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedEnvironment {
            files: HashMap::new(),
            script: Arc::clone(&self.script),
            calls: Arc::clone(&self.calls),
        })
    }

    async fn destroy(&self, _env: ScriptedEnvironment) -> Result<()> {
        self.calls.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Environment for ScriptedEnvironment {
    async fn write_file(&mut self, name: &str, content: &str) -> Result<()> {
        self.files.insert(name.to_string(), content.to_string());
        Ok(())
    }

    async fn run(&mut self, command: &str, _limits: &RunLimits) -> Result<CommandOutput> {
        self.calls.commands.lock().push(command.to_string());

        let input = if command.ends_with(INPUT_FILE) {
            let input = self.files.get(INPUT_FILE).cloned().unwrap_or_default();
            self.calls.inputs.lock().push(input.clone());
            input
        } else {
            String::new()
        };
        let source = self
            .files
            .get(&fake_language().source_file)
            .cloned()
            .unwrap_or_default();

        (self.script)(&source, command, &input)
    }
}

/// Store backed by a real database whose writes can be made to fail
pub struct FlakyStore {
    pool: SqlitePool,
    fail_mark_running: bool,
    finish_failures: AtomicUsize,
    finish_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            fail_mark_running: false,
            finish_failures: AtomicUsize::new(0),
            finish_calls: AtomicUsize::new(0),
        }
    }

    /// Every `mark_running` call fails
    pub fn failing_mark_running(mut self) -> Self {
        self.fail_mark_running = true;
        self
    }

    /// The next `count` calls to `finish` fail
    pub fn failing_finish(self, count: usize) -> Self {
        self.finish_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn finish_calls(&self) -> usize {
        self.finish_calls.load(Ordering::SeqCst)
    }
}

impl SubmissionStore for FlakyStore {
    async fn load_context(&self, id: SubmissionId) -> Result<Option<JudgeContext>> {
        self.pool.load_context(id).await
    }

    async fn mark_running(&self, id: SubmissionId) -> Result<bool> {
        if self.fail_mark_running {
            return Err(anyhow!("database is locked"));
        }
        self.pool.mark_running(id).await
    }

    async fn finish(
        &self,
        id: SubmissionId,
        verdict: Verdict,
        diagnostic_text: Option<&str>,
    ) -> Result<bool> {
        self.finish_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .finish_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow!("disk I/O error"));
        }
        self.pool.finish(id, verdict, diagnostic_text).await
    }

    async fn status_view(&self, id: SubmissionId) -> Result<Option<StatusView>> {
        self.pool.status_view(id).await
    }
}
