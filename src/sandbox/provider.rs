use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};

/// Limits applied to a single command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunLimits {
    /// Wall-clock bound, `None` falls back to the provider's hard timeout
    pub timeout: Option<Duration>,
    /// Only honored by providers that account memory
    pub memory_limit_mb: Option<u64>,
}

/// Captured result of one command run inside an environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub memory_exceeded: bool,
}

impl CommandOutput {
    pub fn timed_out() -> Self {
        Self {
            timed_out: true,
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        !self.timed_out && !self.memory_exceeded && self.exit_code == Some(0)
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out: false,
            memory_exceeded: false,
        }
    }
}

/// An isolated, disposable runtime owned by exactly one submission
pub trait Environment: Send {
    /// Writes `content` to `name`, relative to the environment's working directory
    fn write_file(&mut self, name: &str, content: &str) -> impl Future<Output = Result<()>> + Send;

    /// Runs a shell command in the working directory
    ///
    /// Running past the timeout is reported through [`CommandOutput::timed_out`],
    /// not as an error.
    fn run(
        &mut self,
        command: &str,
        limits: &RunLimits,
    ) -> impl Future<Output = Result<CommandOutput>> + Send;
}

/// Creates and destroys execution environments
pub trait EnvironmentProvider: Send + Sync + 'static {
    type Env: Environment;

    fn create(&self) -> impl Future<Output = Result<Self::Env>> + Send;

    fn destroy(&self, env: Self::Env) -> impl Future<Output = Result<()>> + Send;
}

/// Resolves a file name inside an environment root, refusing to escape it
pub(super) fn resolve_in(root: &Path, name: &str) -> Result<PathBuf> {
    let relative = Path::new(name);
    if name.is_empty() || !relative.components().all(|c| matches!(c, Component::Normal(_))) {
        bail!("Refusing to write outside the environment: {name:?}");
    }
    Ok(root.join(relative))
}
