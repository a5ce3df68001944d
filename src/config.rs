use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "judge", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Whether to flush the existing database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,

    /// Number of dispatcher workers, overrides the configuration file
    #[arg(long = "workers", short = 'w')]
    pub workers: Option<u8>,

    /// Dispatch mode, overrides the configuration file
    #[arg(long = "mode", short = 'm', value_enum)]
    pub mode: Option<DispatchMode>,
}

impl CliArgs {
    /// Load the configuration from the specified file and apply CLI overrides
    pub fn to_config(&self) -> std::io::Result<Config> {
        let file = std::fs::File::open(&self.config_path)?;
        let reader = std::io::BufReader::new(file);
        let mut config: Config = serde_json::from_reader(reader)?;

        if let Some(workers) = self.workers {
            config.dispatcher.workers = workers;
        }
        if let Some(mode) = self.mode {
            config.dispatcher.mode = mode;
        }

        Ok(config)
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub languages: Vec<LanguageConfig>,
    #[serde(default)]
    pub problems: Vec<ProblemConfig>,
}

#[derive(Deserialize, Debug)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Workers block on the queue and judge one submission at a time
    Continuous,
    /// A batch is claimed and judged concurrently on every wake signal
    Triggered,
}

#[derive(Deserialize, Debug)]
pub struct DispatcherConfig {
    #[serde(default = "default_mode")]
    pub mode: DispatchMode,
    #[serde(default = "default_workers")]
    pub workers: u8,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            workers: default_workers(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    Memory,
    Sqlite,
}

#[derive(Deserialize, Debug)]
pub struct QueueConfig {
    #[serde(default = "default_queue_backend")]
    pub backend: QueueBackend,
    /// How often a blocked pop re-checks a queue shared with other processes
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: default_queue_backend(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Simple,
    Isolate,
}

#[derive(Deserialize, Debug)]
pub struct SandboxConfig {
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,
    /// Hard upper bound for any single command, compile steps included
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Root for simple-provider environments, defaults to the user cache dir
    pub work_root: Option<PathBuf>,
    /// First isolate box id handed out by the isolate provider
    #[serde(default)]
    pub first_box_id: u32,
    /// Number of isolate boxes, bounds concurrent environments
    #[serde(default = "default_box_count")]
    pub box_count: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            command_timeout_secs: default_command_timeout_secs(),
            work_root: None,
            first_box_id: 0,
            box_count: default_box_count(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct LanguageConfig {
    pub name: String,
    pub file_name: String,
    pub compile: Option<String>,
    pub run: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ProblemConfig {
    pub id: i64,
    pub name: String,
    pub time_limit_ms: u64,
    pub memory_limit_mb: Option<u64>,
    pub cases: Vec<ProblemCaseConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ProblemCaseConfig {
    pub order: i64,
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub sample: bool,
}

fn default_mode() -> DispatchMode {
    DispatchMode::Continuous
}

fn default_workers() -> u8 {
    2
}

fn default_batch_size() -> usize {
    5
}

fn default_queue_backend() -> QueueBackend {
    QueueBackend::Sqlite
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_provider() -> ProviderKind {
    ProviderKind::Simple
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_box_count() -> u32 {
    8
}
