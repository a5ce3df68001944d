use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use parking_lot::Mutex;
use tokio::process::Command;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::provider::resolve_in;
use super::{CommandOutput, Environment, EnvironmentProvider, RunLimits};

const ISOLATE: &str = "isolate";

// Sandbox configuration constants
const PROCESSES: u32 = 64; // shell wrapper, compilers and JVM threads
const OPEN_FILES: u32 = 128;
const FILE_SIZE: u32 = 65536; // KB
const DEFAULT_MEMORY_LIMIT: u64 = 524288; // KB, compile steps and unlimited problems
const PATH_ENV: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Extra time isolate gets on top of the wall-time limit before we give up on it
const ISOLATE_GRACE: Duration = Duration::from_secs(5);

// Captured inside the box, hidden from `ls` in user programs
const STDOUT_FILE: &str = ".stdout";
const STDERR_FILE: &str = ".stderr";

// Sandbox meta directory permissions
const META_DIR_PERMISSIONS: u32 = 0o700;

/// A provider handing out boxes of the `isolate` sandbox
///
/// Boxes come from a fixed pool of ids, which bounds the number of live
/// environments; `create` waits for a free box rather than failing. Memory is
/// accounted through cgroups, so this provider is the one able to report
/// exceeded memory limits.
pub struct IsolateProvider {
    pool: Arc<BoxPool>,
    meta_dir: PathBuf,
    command_timeout: Duration,
}

pub struct IsolateEnvironment {
    box_id: u32,
    box_dir: PathBuf,
    meta_path: PathBuf,
    command_timeout: Duration,
    /// `None` once the box went back to the pool
    lease: Option<BoxLease>,
}

/// Free box ids, with one semaphore permit per free id
struct BoxPool {
    free: Mutex<Vec<u32>>,
    available: Arc<Semaphore>,
}

/// Exclusive use of one box id, returned to the pool on drop
struct BoxLease {
    box_id: u32,
    pool: Arc<BoxPool>,
    _permit: OwnedSemaphorePermit,
}

impl BoxPool {
    fn new(first_box_id: u32, box_count: u32) -> Self {
        // Popped from the back, so the lowest id is handed out first
        let free: Vec<u32> = (first_box_id..first_box_id + box_count).rev().collect();
        Self {
            available: Arc::new(Semaphore::new(free.len())),
            free: Mutex::new(free),
        }
    }

    /// Waits until a box is free and takes it
    async fn acquire(self: &Arc<Self>) -> Result<BoxLease> {
        let permit = Arc::clone(&self.available)
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("Isolate box pool closed"))?;
        let box_id = self
            .free
            .lock()
            .pop()
            .ok_or_else(|| anyhow!("Isolate box pool out of sync with its permits"))?;

        Ok(BoxLease {
            box_id,
            pool: Arc::clone(self),
            _permit: permit,
        })
    }
}

impl Drop for BoxLease {
    fn drop(&mut self) {
        // The id is back before the permit is released
        self.pool.free.lock().push(self.box_id);
    }
}

/// Fields of an isolate meta file the judge cares about
#[derive(Debug, Default, PartialEq, Eq)]
struct Meta {
    status: Option<String>,
    exit_code: Option<i32>,
    oom_killed: bool,
    message: Option<String>,
}

impl IsolateProvider {
    /// Whether the `isolate` binary is on the PATH
    pub fn is_available() -> bool {
        std::process::Command::new("which")
            .arg(ISOLATE)
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    pub fn build(first_box_id: u32, box_count: u32, command_timeout: Duration) -> Result<Self> {
        if box_count == 0 {
            bail!("The isolate box pool must not be empty");
        }

        let meta_dir = Self::setup_meta_directory()?;

        log::info!(
            "IsolateProvider initialized with boxes {first_box_id}..{}",
            first_box_id + box_count
        );
        Ok(Self {
            pool: Arc::new(BoxPool::new(first_box_id, box_count)),
            meta_dir,
            command_timeout,
        })
    }

    /// Sets up the directory receiving meta files, outside of any box
    fn setup_meta_directory() -> Result<PathBuf> {
        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "judge")
            .ok_or_else(|| anyhow!("Unable to find user directory"))?;

        let meta_dir = proj_dirs.cache_dir().join("isolate");
        fs::create_dir_all(&meta_dir)?;
        fs::set_permissions(&meta_dir, fs::Permissions::from_mode(META_DIR_PERMISSIONS))?;

        Ok(meta_dir)
    }
}

impl EnvironmentProvider for IsolateProvider {
    type Env = IsolateEnvironment;

    async fn create(&self) -> Result<IsolateEnvironment> {
        let lease = self.pool.acquire().await?;
        let box_id = lease.box_id;

        // On failure the lease drops and the id goes back to the pool
        let box_dir = init_box(box_id).await?;
        log::debug!("Isolate box {box_id} initialized at {}", box_dir.display());

        Ok(IsolateEnvironment {
            box_id,
            box_dir,
            meta_path: self.meta_dir.join(format!("{box_id}.meta")),
            command_timeout: self.command_timeout,
            lease: Some(lease),
        })
    }

    async fn destroy(&self, mut env: IsolateEnvironment) -> Result<()> {
        let output = Command::new(ISOLATE)
            .args(["-b", &env.box_id.to_string(), "--cg", "--cleanup"])
            .output()
            .await;
        env.release();

        match output {
            Ok(output) if output.status.success() => {
                log::debug!("Isolate box {} cleaned up", env.box_id);
                Ok(())
            }
            Ok(output) => bail!(
                "isolate --cleanup failed for box {}: {}",
                env.box_id,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => Err(anyhow!("Failed to spawn isolate --cleanup: {e}")),
        }
    }
}

impl IsolateEnvironment {
    /// Hands the box id back to the pool
    fn release(&mut self) {
        if let Some(lease) = self.lease.take() {
            let _ = fs::remove_file(&self.meta_path);
            drop(lease);
        }
    }
}

impl Environment for IsolateEnvironment {
    async fn write_file(&mut self, name: &str, content: &str) -> Result<()> {
        let path = resolve_in(&self.box_dir, name)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    async fn run(&mut self, command: &str, limits: &RunLimits) -> Result<CommandOutput> {
        let limit = limits
            .timeout
            .map_or(self.command_timeout, |t| t.min(self.command_timeout));
        let memory_kb = limits
            .memory_limit_mb
            .map_or(DEFAULT_MEMORY_LIMIT, |mb| mb * 1024);

        let sandbox_id = self.box_id.to_string();
        let wall_time_arg = format!("--wall-time={:.3}", limit.as_secs_f64());
        let memory_arg = format!("--cg-mem={memory_kb}");
        let processes_arg = format!("--processes={PROCESSES}");
        let open_files_arg = format!("--open-files={OPEN_FILES}");
        let fsize_arg = format!("--fsize={FILE_SIZE}");
        let meta_path = self.meta_path.to_string_lossy().into_owned();

        // isolate enforces the wall time itself, this only guards against it hanging
        let output = tokio::time::timeout(
            limit + ISOLATE_GRACE,
            Command::new(ISOLATE)
                .args([
                    "-b", &sandbox_id,
                    "--cg", "--run",
                    &wall_time_arg,
                    &memory_arg,
                    &processes_arg,
                    &open_files_arg,
                    &fsize_arg,
                    "-E", PATH_ENV,
                    "-M", &meta_path,
                    "-o", STDOUT_FILE,
                    "-r", STDERR_FILE,
                    "--silent",
                    "--",
                    "/bin/sh", "-c", command,
                ])
                .kill_on_drop(true)
                .output(),
        )
        .await??;

        // 0: program succeeded, 1: program failed, anything else: isolate itself failed
        if !matches!(output.status.code(), Some(0 | 1)) {
            bail!(
                "isolate --run failed on box {}: {}",
                self.box_id,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let meta = parse_meta(&tokio::fs::read_to_string(&self.meta_path).await?);
        let stdout = take_capture(&self.box_dir.join(STDOUT_FILE)).await;
        let stderr = take_capture(&self.box_dir.join(STDERR_FILE)).await;

        if meta.status.as_deref() == Some("XX") {
            bail!(
                "isolate internal error: {}",
                meta.message.unwrap_or_default()
            );
        }

        let exit_code = match meta.status.as_deref() {
            None => Some(meta.exit_code.unwrap_or(0)),
            Some("SG") => None,
            Some(_) => meta.exit_code,
        };

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
            timed_out: meta.status.as_deref() == Some("TO"),
            memory_exceeded: meta.oom_killed,
        })
    }
}

impl Drop for IsolateEnvironment {
    fn drop(&mut self) {
        if self.lease.is_none() {
            return;
        }

        // Not destroyed through the provider, e.g. the judging task panicked
        let out = std::process::Command::new(ISOLATE)
            .args(["-b", &self.box_id.to_string(), "--cg", "--cleanup"])
            .output();

        if out.is_ok_and(|c| c.status.success()) {
            log::info!("Isolate box {} cleaned up on drop", self.box_id);
        } else {
            log::error!("Isolate box {} failed to clean up", self.box_id);
        }
        self.release();
    }
}

/// Initializes a box and returns the directory programs run in
async fn init_box(box_id: u32) -> Result<PathBuf> {
    let output = Command::new(ISOLATE)
        .args(["-b", &box_id.to_string(), "--cg", "--init"])
        .output()
        .await
        .map_err(|e| anyhow!("Failed to spawn isolate --init: {e}"))?;

    if !output.status.success() {
        bail!(
            "isolate --init exited with non-zero status: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let root_dir_absolute = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if root_dir_absolute.is_empty() {
        bail!(
            "isolate --init produced empty stdout; stderr={}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    Ok(PathBuf::from(root_dir_absolute).join("box"))
}

/// Reads a captured output file and removes it
async fn take_capture(path: &Path) -> String {
    let content = tokio::fs::read(path).await.unwrap_or_default();
    let _ = tokio::fs::remove_file(path).await;
    String::from_utf8_lossy(&content).into_owned()
}

fn parse_meta(meta_content: &str) -> Meta {
    let mut meta = Meta::default();
    for line in meta_content.lines() {
        if let Some((key, value)) = line.split_once(':') {
            match key {
                "status" => meta.status = Some(value.to_string()),
                "exitcode" => meta.exit_code = value.parse().ok(),
                "cg-oom-killed" => meta.oom_killed = value == "1",
                "message" => meta.message = Some(value.to_string()),
                _ => {}
            }
        }
    }
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn box_pool_waits_for_a_free_box() {
        let pool = Arc::new(BoxPool::new(10, 2));

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_eq!((first.box_id, second.box_id), (10, 11));

        let waiting = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.acquire().await.map(|lease| lease.box_id) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        drop(second);
        let box_id = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(box_id, 11);
        assert_eq!(*pool.free.lock(), vec![11]);

        drop(first);
        assert_eq!(pool.available.available_permits(), 2);
    }

    #[test]
    fn meta_of_clean_run() {
        let meta = parse_meta("time:0.012\ntime-wall:0.030\nmax-rss:3120\ncg-mem:2048\nexitcode:0\n");
        assert_eq!(
            meta,
            Meta {
                exit_code: Some(0),
                ..Meta::default()
            }
        );
    }

    #[test]
    fn meta_of_timeout_and_oom() {
        let timed_out = parse_meta("status:TO\nmessage:Time limit exceeded (wall clock)\nkilled:1\n");
        assert_eq!(timed_out.status.as_deref(), Some("TO"));
        assert_eq!(timed_out.exit_code, None);

        let oom = parse_meta("cg-oom-killed:1\nstatus:SG\nexitsig:9\nmessage:Caught fatal signal 9\n");
        assert!(oom.oom_killed);
        assert_eq!(oom.status.as_deref(), Some("SG"));
    }

    #[test]
    fn meta_of_runtime_error() {
        let meta = parse_meta("status:RE\nexitcode:3\nmessage:Exited with error status 3\n");
        assert_eq!(meta.status.as_deref(), Some("RE"));
        assert_eq!(meta.exit_code, Some(3));
        assert!(!meta.oom_killed);
    }
}
