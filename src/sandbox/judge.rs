use std::time::Duration;

use anyhow::Result;

use crate::language::LanguageSpec;
use crate::submission::{Limits, TestCase, Verdict};

use super::{CommandOutput, Environment, EnvironmentProvider, RunLimits};

/// Every test case's input is written here and redirected into stdin
pub const INPUT_FILE: &str = "input.txt";

/// Verdict of one judging run plus the text shown to the submitter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Judgement {
    pub verdict: Verdict,
    pub diagnostic: Option<String>,
}

impl Judgement {
    pub fn new(verdict: Verdict, diagnostic: Option<String>) -> Self {
        Self {
            verdict,
            diagnostic,
        }
    }

    fn accepted() -> Self {
        Self::new(Verdict::Accepted, None)
    }
}

/// Drives compile, run and compare for one submission inside a fresh environment
pub struct Judge<P> {
    provider: P,
}

impl<P: EnvironmentProvider> Judge<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Judges `source_code` against `test_cases` and always returns a verdict
    ///
    /// The environment is destroyed before returning, whatever the outcome.
    pub async fn judge(
        &self,
        source_code: &str,
        language: &LanguageSpec,
        test_cases: &[TestCase],
        limits: &Limits,
    ) -> Judgement {
        let mut env = match self.provider.create().await {
            Ok(env) => env,
            Err(e) => {
                log::error!("Failed to create execution environment: {e:#}");
                return classify_error(&e);
            }
        };

        let result = judge_in(&mut env, source_code, language, test_cases, limits).await;

        if let Err(e) = self.provider.destroy(env).await {
            log::warn!("Failed to destroy execution environment: {e:#}");
        }

        result.unwrap_or_else(|e| {
            log::warn!("Judging aborted by an unexpected error: {e:#}");
            classify_error(&e)
        })
    }
}

async fn judge_in<E: Environment>(
    env: &mut E,
    source_code: &str,
    language: &LanguageSpec,
    test_cases: &[TestCase],
    limits: &Limits,
) -> Result<Judgement> {
    // Step 1: Write the source code
    env.write_file(&language.source_file, source_code).await?;

    // Step 2: Compile, if the language needs it
    if let Some(compile_command) = language.compile_command() {
        if let Some(failure) = compile(env, &compile_command).await {
            return Ok(failure);
        }
        log::debug!("Compilation succeeded");
    }

    // Step 3: Run test cases in ascending order, stopping at the first failure
    let mut ordered: Vec<&TestCase> = test_cases.iter().collect();
    ordered.sort_by_key(|case| case.order_index);

    let run_command = format!("{} < {INPUT_FILE}", language.run_command());
    let run_limits = RunLimits {
        timeout: Some(run_timeout(limits.time_limit_ms)),
        memory_limit_mb: limits.memory_limit_mb,
    };

    for case in ordered {
        env.write_file(INPUT_FILE, &case.input).await?;
        let output = env.run(&run_command, &run_limits).await?;

        if let Some(failure) = check_run(&output, &case.expected_output) {
            log::debug!("Test case {} failed: {}", case.order_index, failure.verdict);
            return Ok(failure);
        }
    }

    Ok(Judgement::accepted())
}

/// Runs the compile command, returning the verdict if it failed
async fn compile<E: Environment>(env: &mut E, command: &str) -> Option<Judgement> {
    match env.run(command, &RunLimits::default()).await {
        Ok(output) if output.success() => None,
        Ok(output) if output.timed_out => Some(Judgement::new(
            Verdict::CompileError,
            Some("Compilation timed out".to_string()),
        )),
        Ok(output) => {
            // Some toolchains report errors on stdout
            let text = if output.stderr.trim().is_empty() {
                output.stdout
            } else {
                output.stderr
            };
            Some(Judgement::new(Verdict::CompileError, Some(text)))
        }
        Err(e) => Some(Judgement::new(
            Verdict::CompileError,
            Some(format!("{e:#}")),
        )),
    }
}

fn check_run(output: &CommandOutput, expected_output: &str) -> Option<Judgement> {
    if output.timed_out {
        return Some(Judgement::new(Verdict::TimeLimitExceeded, None));
    }
    if output.memory_exceeded {
        return Some(Judgement::new(Verdict::MemoryLimitExceeded, None));
    }
    if output.exit_code != Some(0) {
        let diagnostic = if output.stderr.trim().is_empty() {
            match output.exit_code {
                Some(code) => format!("Process exited with code {code}"),
                None => "Process terminated by a signal".to_string(),
            }
        } else {
            output.stderr.clone()
        };
        return Some(Judgement::new(Verdict::RuntimeError, Some(diagnostic)));
    }
    if !outputs_match(&output.stdout, expected_output) {
        return Some(Judgement::new(Verdict::WrongAnswer, None));
    }
    None
}

/// Wall-clock bound of one run: the time limit rounded up to whole seconds
pub fn run_timeout(time_limit_ms: u64) -> Duration {
    Duration::from_secs(time_limit_ms.div_ceil(1000).max(1))
}

/// Strips trailing whitespace on every line and trailing blank lines
pub fn normalize(output: &str) -> String {
    output
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}

pub fn outputs_match(actual: &str, expected: &str) -> bool {
    normalize(actual) == normalize(expected)
}

/// Maps an error nobody classified yet onto a verdict
fn classify_error(error: &anyhow::Error) -> Judgement {
    if signals_timeout(error) {
        Judgement::new(Verdict::TimeLimitExceeded, None)
    } else {
        Judgement::new(Verdict::RuntimeError, Some(format!("{error:#}")))
    }
}

fn signals_timeout(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        if cause.is::<tokio::time::error::Elapsed>() {
            return true;
        }
        if let Some(io_error) = cause.downcast_ref::<std::io::Error>()
            && io_error.kind() == std::io::ErrorKind::TimedOut
        {
            return true;
        }
        let message = cause.to_string().to_lowercase();
        message.contains("timeout") || message.contains("timed out")
    })
}
