use std::fs;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::time::timeout;

use super::provider::resolve_in;
use super::{CommandOutput, Environment, EnvironmentProvider, RunLimits};

/// A provider that runs code without sandboxing
///
/// Each environment is a fresh temporary directory and commands run through
/// `/bin/sh` in their own process group. Only wall-clock limits are enforced:
/// there are no memory, file system or permission controls. This is intended
/// for development and trusted deployments.
pub struct SimpleProvider {
    /// Directory holding one subdirectory per live environment
    root: PathBuf,
    /// Hard upper bound of any single command
    command_timeout: Duration,
}

pub struct SimpleEnvironment {
    dir: TempDir,
    command_timeout: Duration,
}

impl SimpleProvider {
    pub fn build(root: Option<PathBuf>, command_timeout: Duration) -> Result<Self> {
        let root = match root {
            Some(root) => root,
            None => Self::default_root()?,
        };
        fs::create_dir_all(&root)?;

        log::info!("SimpleProvider initialized at {}", root.display());
        log::warn!(
            "SimpleProvider provides NO security isolation - use only in trusted environments"
        );

        Ok(Self {
            root,
            command_timeout,
        })
    }

    fn default_root() -> Result<PathBuf> {
        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "judge")
            .ok_or_else(|| anyhow!("Unable to find user directory"))?;

        Ok(proj_dirs.cache_dir().join("simple"))
    }
}

impl EnvironmentProvider for SimpleProvider {
    type Env = SimpleEnvironment;

    async fn create(&self) -> Result<SimpleEnvironment> {
        let dir = tempfile::Builder::new()
            .prefix("submission-")
            .tempdir_in(&self.root)?;
        log::debug!("Created environment at {}", dir.path().display());

        Ok(SimpleEnvironment {
            dir,
            command_timeout: self.command_timeout,
        })
    }

    async fn destroy(&self, env: SimpleEnvironment) -> Result<()> {
        let path = env.dir.path().to_path_buf();
        tokio::task::spawn_blocking(move || env.dir.close()).await??;
        log::debug!("Destroyed environment at {}", path.display());
        Ok(())
    }
}

impl Environment for SimpleEnvironment {
    async fn write_file(&mut self, name: &str, content: &str) -> Result<()> {
        let path = resolve_in(self.dir.path(), name)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    async fn run(&mut self, command: &str, limits: &RunLimits) -> Result<CommandOutput> {
        let limit = limits
            .timeout
            .map_or(self.command_timeout, |t| t.min(self.command_timeout));

        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .current_dir(self.dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();

        match timeout(limit, child.wait_with_output()).await {
            Ok(output) => Ok(CommandOutput::from(output?)),
            Err(_) => {
                // The shell is gone with the dropped child, its descendants are not
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                log::debug!("Command exceeded {}s and was killed", limit.as_secs_f64());
                Ok(CommandOutput::timed_out())
            }
        }
    }
}

fn kill_process_group(pgid: u32) {
    // SAFETY: kill(2) takes no pointers; a negative pid addresses the whole group
    let ret = unsafe { libc::kill(-(pgid as libc::pid_t), libc::SIGKILL) };
    if ret != 0 {
        log::debug!(
            "Process group {pgid} was already gone: {}",
            std::io::Error::last_os_error()
        );
    }
}
