//! Orchestrator configuration.
//!
//! Every tunable resolves through [`OrchestratorConfig`], built with an
//! env-var-first-then-default idiom: each field reads its own environment
//! variable, falls back to its documented default when unset or unparseable,
//! and is range-checked at construction. An optional TOML file supplies the
//! same keys as a structured alternative, loaded before the environment
//! overlay so environment variables always win.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} out of range: {value} (expected {expected})")]
    OutOfRange {
        field: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseFile {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

fn env_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn clamp_range<T: PartialOrd + Copy>(
    field: &'static str,
    value: T,
    min: T,
    max: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value: "out of documented bounds".to_string(),
            expected,
        });
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Fixed,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential
    }
}

impl std::str::FromStr for BackoffStrategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exponential" => Ok(BackoffStrategy::Exponential),
            "linear" => Ok(BackoffStrategy::Linear),
            "fixed" => Ok(BackoffStrategy::Fixed),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LauncherMode {
    Auto,
    Subprocess,
    Container,
}

impl Default for LauncherMode {
    fn default() -> Self {
        LauncherMode::Auto
    }
}

impl std::str::FromStr for LauncherMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(LauncherMode::Auto),
            "subprocess" => Ok(LauncherMode::Subprocess),
            "container" => Ok(LauncherMode::Container),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    pub count: usize,
    pub timeout_minutes: u64,
    pub spawn_retry_attempts: u32,
    pub spawn_backoff_strategy: BackoffStrategy,
    pub spawn_backoff_base_seconds: u64,
    pub spawn_backoff_max_seconds: u64,
    pub task_stale_timeout_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub heartbeat_stale_threshold: u64,
    pub auto_respawn: bool,
    pub max_respawn_attempts: u32,
    pub retry_attempts: u32,
    pub backoff_strategy: BackoffStrategy,
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: env_var("ORCH_WORKERS_COUNT", 5),
            timeout_minutes: env_var("ORCH_WORKERS_TIMEOUT_MINUTES", 30),
            spawn_retry_attempts: env_var("ORCH_SPAWN_RETRY_ATTEMPTS", 3),
            spawn_backoff_strategy: env_var("ORCH_SPAWN_BACKOFF_STRATEGY", BackoffStrategy::Exponential),
            spawn_backoff_base_seconds: env_var("ORCH_SPAWN_BACKOFF_BASE_SECONDS", 2),
            spawn_backoff_max_seconds: env_var("ORCH_SPAWN_BACKOFF_MAX_SECONDS", 30),
            task_stale_timeout_seconds: env_var("ORCH_TASK_STALE_TIMEOUT_SECONDS", 600),
            heartbeat_interval_seconds: env_var("ORCH_HEARTBEAT_INTERVAL_SECONDS", 30),
            heartbeat_stale_threshold: env_var("ORCH_HEARTBEAT_STALE_THRESHOLD", 120),
            auto_respawn: env_var("ORCH_AUTO_RESPAWN", true),
            max_respawn_attempts: env_var("ORCH_MAX_RESPAWN_ATTEMPTS", 5),
            retry_attempts: env_var("ORCH_RETRY_ATTEMPTS", 3),
            backoff_strategy: env_var("ORCH_BACKOFF_STRATEGY", BackoffStrategy::Exponential),
            backoff_base_seconds: env_var("ORCH_BACKOFF_BASE_SECONDS", 30),
            backoff_max_seconds: env_var("ORCH_BACKOFF_MAX_SECONDS", 300),
        }
    }
}

impl WorkersConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        clamp_range(
            "workers.spawn_retry_attempts",
            self.spawn_retry_attempts,
            0,
            10,
            "0..=10",
        )?;
        clamp_range(
            "workers.task_stale_timeout_seconds",
            self.task_stale_timeout_seconds,
            60,
            3600,
            "60..=3600",
        )?;
        clamp_range(
            "workers.heartbeat_interval_seconds",
            self.heartbeat_interval_seconds,
            5,
            300,
            "5..=300",
        )?;
        clamp_range(
            "workers.heartbeat_stale_threshold",
            self.heartbeat_stale_threshold,
            30,
            600,
            "30..=600",
        )?;
        Ok(())
    }

    /// Spawn-backoff `base_seconds` may exceed `max_seconds`; cap explicitly
    /// at use time rather than rejecting the configuration (Open Question 2).
    pub fn spawn_backoff_delay(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.spawn_backoff_strategy,
            self.spawn_backoff_base_seconds,
            self.spawn_backoff_max_seconds,
            attempt,
        )
    }

    pub fn task_backoff_delay(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.backoff_strategy,
            self.backoff_base_seconds,
            self.backoff_max_seconds,
            attempt,
        )
    }
}

pub fn backoff_delay(
    strategy: BackoffStrategy,
    base_seconds: u64,
    max_seconds: u64,
    attempt: u32,
) -> Duration {
    let raw = match strategy {
        BackoffStrategy::Exponential => base_seconds.saturating_mul(1u64 << attempt.min(20)),
        BackoffStrategy::Linear => base_seconds.saturating_mul((attempt + 1) as u64),
        BackoffStrategy::Fixed => base_seconds,
    };
    Duration::from_secs(raw.min(max_seconds))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    pub enabled: bool,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            enabled: env_var("ORCH_RESILIENCE_ENABLED", true),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsConfig {
    pub range_start: u16,
    pub range_end: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            range_start: env_var("ORCH_PORTS_RANGE_START", 49152),
            range_end: env_var("ORCH_PORTS_RANGE_END", 65535),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    pub container_memory_limit: Option<String>,
    pub container_cpu_limit: Option<String>,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            container_memory_limit: std::env::var("ORCH_RESOURCES_CONTAINER_MEMORY_LIMIT").ok(),
            container_cpu_limit: std::env::var("ORCH_RESOURCES_CONTAINER_CPU_LIMIT").ok(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    pub timeout_seconds: u64,
    pub max_retries: u32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: env_var("ORCH_MERGE_TIMEOUT_SECONDS", 600),
            max_retries: env_var("ORCH_MERGE_MAX_RETRIES", 3),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGateConfig {
    pub name: String,
    pub command: String,
    pub required: bool,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    pub window_size: usize,
    pub failure_rate_threshold: f64,
    pub min_samples: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            window_size: env_var("ORCH_BACKPRESSURE_WINDOW_SIZE", 10),
            failure_rate_threshold: env_var("ORCH_BACKPRESSURE_FAILURE_RATE_THRESHOLD", 0.5),
            min_samples: env_var("ORCH_BACKPRESSURE_MIN_SAMPLES", 3),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Executable (and leading args) used to start a worker; the orchestrator
    /// appends `--worker-id`/`--feature`/`--worktree`/`--branch` and sets the
    /// `WORKER_ID`/`FEATURE`/`BRANCH`/`WORKTREE` env vars documented in the
    /// worker contract. The worker program itself is an opaque subprocess.
    pub worker_command: Vec<String>,
    pub container_image: String,
    pub grace_period_seconds: u64,
    pub log_dir: PathBuf,
    /// Reject feature/branch values containing shell injection characters
    /// before they reach a container exec invocation. Defense-in-depth only
    /// (the container backend never shell-joins these values) — a deployment
    /// that generates feature/branch names outside the recommended pattern
    /// may opt out.
    pub validate_exec: bool,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        let worker_command = env_string("ORCH_WORKER_COMMAND", "zerg-worker");
        Self {
            worker_command: worker_command.split_whitespace().map(str::to_string).collect(),
            container_image: env_string("ORCH_CONTAINER_IMAGE", "zerg-worker:latest"),
            grace_period_seconds: env_var("ORCH_LAUNCHER_GRACE_PERIOD_SECONDS", 10),
            log_dir: PathBuf::from(env_string("ORCH_LOG_DIR", ".zerg/logs")),
            validate_exec: env_var("ORCH_LAUNCHER_VALIDATE_EXEC", true),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: env_var("ORCH_CIRCUIT_FAILURE_THRESHOLD", 5),
            cooldown_seconds: env_var("ORCH_CIRCUIT_COOLDOWN_SECONDS", 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub feature: String,
    pub branch_namespace: String,
    pub target_branch: String,
    pub poll_interval_seconds: u64,
    pub workers: WorkersConfig,
    pub resilience: ResilienceConfig,
    pub ports: PortsConfig,
    pub resources: ResourcesConfig,
    pub merge: MergeConfig,
    pub quality_gates: Vec<QualityGateConfig>,
    pub launcher_mode: LauncherMode,
    pub launcher: LauncherConfig,
    pub backpressure: BackpressureConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub state_dir: PathBuf,
}

impl OrchestratorConfig {
    /// Build configuration for `feature`, optionally layering a TOML file
    /// first (environment variables always win over the file).
    pub fn load(feature: impl Into<String>) -> Result<Self, ConfigError> {
        let mut quality_gates = Vec::new();
        if let Ok(path) = std::env::var("ORCH_CONFIG_PATH") {
            let path = PathBuf::from(path);
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
                path: path.clone(),
                source,
            })?;
            let file: TomlFile =
                toml::from_str(&text).map_err(|source| ConfigError::ParseFile { path, source })?;
            quality_gates = file.quality_gates;
        }

        let config = Self {
            feature: feature.into(),
            branch_namespace: env_string("ORCH_BRANCH_NAMESPACE", ""),
            target_branch: env_string("ORCH_TARGET_BRANCH", "main"),
            poll_interval_seconds: env_var("ORCH_POLL_INTERVAL_SECONDS", 5),
            workers: WorkersConfig::default(),
            resilience: ResilienceConfig::default(),
            ports: PortsConfig::default(),
            resources: ResourcesConfig::default(),
            merge: MergeConfig::default(),
            quality_gates,
            launcher_mode: env_var("ORCH_LAUNCHER_MODE", LauncherMode::Auto),
            launcher: LauncherConfig::default(),
            backpressure: BackpressureConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            state_dir: PathBuf::from(env_string("ORCH_STATE_DIR", ".zerg/state")),
        };
        config.workers.validate()?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

#[derive(Debug, Default, Deserialize)]
struct TomlFile {
    #[serde(default)]
    quality_gates: Vec<QualityGateConfig>,
}
