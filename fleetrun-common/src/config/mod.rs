//! Harness configuration.
//!
//! Values are layered, later layers winning:
//! 1. built-in defaults derived from the project root and build directory
//! 2. an optional TOML file (`--config`)
//! 3. `FLEETRUN_*` environment variables
//! 4. command-line flags, applied by the binary after [`HarnessConfig::load`]

pub mod env;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub use env::{ConfigSource, EnvError, EnvParser, Sourced};

use crate::envvars::Environment;
use crate::topology::time_salt;

/// Default daemon capacity for single-instance topologies (3 GiB).
pub const DEFAULT_DAEMON_SIZE: u64 = 3 * 1024 * 1024 * 1024;
/// Default per-instance capacity inside a fleet (1 GiB).
pub const DEFAULT_FLEET_MEMBER_SIZE: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid environment configuration: {}", format_env_errors(.0))]
    Env(Vec<EnvError>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Names of the external executables the harness drives.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Binaries {
    pub coordination: String,
    pub coordination_ctl: String,
    pub storage_daemon: String,
    pub script_runner: String,
    pub launcher: String,
}

impl Default for Binaries {
    fn default() -> Self {
        Self {
            coordination: "etcd".to_string(),
            coordination_ctl: "etcdctl".to_string(),
            storage_daemon: "vineyardd".to_string(),
            script_runner: "pytest".to_string(),
            launcher: "mpiexec".to_string(),
        }
    }
}

/// Polling, grace and settle intervals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    pub ready_interval: Duration,
    /// `None` waits forever for the coordination service.
    pub coordination_ready_timeout: Option<Duration>,
    /// `None` waits forever for a daemon's IPC socket.
    pub daemon_ready_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
    pub shutdown_poll: Duration,
    /// Pause after each test so daemon-side teardown can finish.
    pub quiesce_delay: Duration,
    /// Fallback pause for fleet registration when no socket is observable.
    pub settle_delay: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            ready_interval: Duration::from_secs(1),
            coordination_ready_timeout: Some(Duration::from_secs(120)),
            daemon_ready_timeout: Some(Duration::from_secs(60)),
            shutdown_grace: Duration::from_secs(5),
            shutdown_poll: Duration::from_millis(50),
            quiesce_delay: Duration::from_secs(1),
            settle_delay: Duration::from_secs(5),
        }
    }
}

/// Storage daemon launch defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonDefaults {
    pub size: u64,
    pub fleet_member_size: u64,
    pub spill_lower_rate: f64,
    pub spill_upper_rate: f64,
}

impl Default for DaemonDefaults {
    fn default() -> Self {
        Self {
            size: DEFAULT_DAEMON_SIZE,
            fleet_member_size: DEFAULT_FLEET_MEMBER_SIZE,
            spill_lower_rate: 0.3,
            spill_upper_rate: 0.8,
        }
    }
}

/// Resolved configuration for one harness run.
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    /// Working directory for test invocations.
    pub project_root: PathBuf,
    pub build_dir: PathBuf,
    /// Where test executables and daemons are looked up before PATH.
    pub executable_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Base path for daemon IPC sockets; fleet members get `.<index>`.
    pub ipc_socket_base: PathBuf,
    pub binaries: Binaries,
    pub timing: Timing,
    pub daemon: DaemonDefaults,
    /// Stream daemon output to the console instead of per-process logs.
    pub verbose: bool,
    /// Directory for captured daemon output.
    pub log_dir: PathBuf,
}

impl HarnessConfig {
    /// Defaults for a project rooted at `project_root`.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        let build_dir = default_build_dir(&project_root);
        let salt = time_salt();
        Self {
            executable_dir: build_dir.join("bin"),
            data_dir: project_root.join("..").join("gstest"),
            ipc_socket_base: std::env::temp_dir().join(format!("fleetrun.ci.{salt}.sock")),
            log_dir: std::env::temp_dir().join(format!("fleetrun-logs-{salt}")),
            project_root,
            build_dir,
            binaries: Binaries::default(),
            timing: Timing::default(),
            daemon: DaemonDefaults::default(),
            verbose: false,
        }
    }

    /// Layer the optional config file and `FLEETRUN_*` variables over defaults.
    pub fn load(env: &Environment, file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut parser = EnvParser::new(env);
        let root = parser
            .get_optional_path("PROJECT_ROOT")
            .value
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let mut config = Self::new(root);
        if let Some(path) = file {
            config.apply_file(&FileConfig::read(path)?);
        }
        config.apply_env(&mut parser);

        let errors = parser.take_errors();
        if !errors.is_empty() {
            return Err(ConfigError::Env(errors));
        }
        config.validate()?;
        debug!(?config, "Resolved harness configuration");
        Ok(config)
    }

    /// Point the config at a different build directory.
    ///
    /// The executable directory follows unless it was set explicitly.
    pub fn set_build_dir(&mut self, build_dir: impl Into<PathBuf>) {
        let build_dir = build_dir.into();
        if self.executable_dir == self.build_dir.join("bin") {
            self.executable_dir = build_dir.join("bin");
        }
        self.build_dir = build_dir;
    }

    /// Directory holding the project's shared libraries.
    pub fn shared_lib_dir(&self) -> PathBuf {
        absolute(&self.build_dir).join("shared-lib")
    }

    /// Path of a data file, or the data directory itself.
    pub fn data_path(&self, name: Option<&str>) -> PathBuf {
        match name {
            Some(name) => self.data_dir.join(name),
            None => self.data_dir.clone(),
        }
    }

    fn apply_file(&mut self, file: &FileConfig) {
        if let Some(root) = &file.project_root {
            self.project_root = root.clone();
        }
        if let Some(dir) = &file.build_dir {
            self.set_build_dir(dir.clone());
        }
        if let Some(dir) = &file.executable_dir {
            self.executable_dir = dir.clone();
        }
        if let Some(dir) = &file.data_dir {
            self.data_dir = dir.clone();
        }
        if let Some(base) = &file.ipc_socket_base {
            self.ipc_socket_base = base.clone();
        }
        if let Some(dir) = &file.log_dir {
            self.log_dir = dir.clone();
        }
        if let Some(binaries) = &file.binaries {
            self.binaries = binaries.clone();
        }
        if let Some(verbose) = file.verbose {
            self.verbose = verbose;
        }

        let timing = &file.timing;
        if let Some(ms) = timing.ready_interval_ms {
            self.timing.ready_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = timing.coordination_ready_timeout_secs {
            self.timing.coordination_ready_timeout = limit(secs);
        }
        if let Some(secs) = timing.daemon_ready_timeout_secs {
            self.timing.daemon_ready_timeout = limit(secs);
        }
        if let Some(ms) = timing.shutdown_grace_ms {
            self.timing.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = timing.quiesce_ms {
            self.timing.quiesce_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = timing.settle_ms {
            self.timing.settle_delay = Duration::from_millis(ms);
        }

        let daemon = &file.daemon;
        if let Some(size) = daemon.size {
            self.daemon.size = size;
        }
        if let Some(size) = daemon.fleet_member_size {
            self.daemon.fleet_member_size = size;
        }
        if let Some(rate) = daemon.spill_lower_rate {
            self.daemon.spill_lower_rate = rate;
        }
        if let Some(rate) = daemon.spill_upper_rate {
            self.daemon.spill_upper_rate = rate;
        }
    }

    fn apply_env(&mut self, parser: &mut EnvParser<'_>) {
        if let Some(dir) = parser.get_optional_path("EXECUTABLE_DIR").value {
            self.executable_dir = dir;
        }
        if let Some(dir) = parser.get_optional_path("DATA_DIR").value {
            self.data_dir = dir;
        }
        if let Some(dir) = parser.get_optional_path("LOG_DIR").value {
            self.log_dir = dir;
        }

        let timing = &mut self.timing;
        let ready = parser.get_limit_secs(
            "READY_TIMEOUT_SECS",
            timing.coordination_ready_timeout,
            24 * 3600,
        );
        if ready.is_from_env() {
            timing.coordination_ready_timeout = ready.value;
            timing.daemon_ready_timeout = ready.value;
        }
        timing.shutdown_grace = parser
            .get_duration_ms("SHUTDOWN_GRACE_MS", timing.shutdown_grace, Duration::from_secs(600))
            .value;
        timing.quiesce_delay = parser
            .get_duration_ms("QUIESCE_MS", timing.quiesce_delay, Duration::from_secs(60))
            .value;
        timing.settle_delay = parser
            .get_duration_ms("SETTLE_MS", timing.settle_delay, Duration::from_secs(600))
            .value;
    }

    /// Check invariants the launch code relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let DaemonDefaults {
            spill_lower_rate: lower,
            spill_upper_rate: upper,
            ..
        } = self.daemon;
        if !(0.0..=1.0).contains(&lower) || !(0.0..=1.0).contains(&upper) || lower >= upper {
            return Err(ConfigError::Invalid(format!(
                "spill rates must satisfy 0 <= lower < upper <= 1 (got {lower}, {upper})"
            )));
        }
        if self.timing.ready_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "ready interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pick the build directory the way a developer checkout is usually laid out:
/// `build/` in the working directory, else `.` for an unpacked artifact tree
/// (it carries `shared-lib/`), else `<project_root>/build`.
pub fn default_build_dir(project_root: &Path) -> PathBuf {
    if Path::new("build").exists() {
        PathBuf::from("build")
    } else if Path::new("shared-lib").exists() {
        PathBuf::from(".")
    } else {
        project_root.join("build")
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

fn limit(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// On-disk TOML layout. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub project_root: Option<PathBuf>,
    pub build_dir: Option<PathBuf>,
    pub executable_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub ipc_socket_base: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub verbose: Option<bool>,
    pub binaries: Option<Binaries>,
    pub timing: FileTiming,
    pub daemon: FileDaemon,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileTiming {
    pub ready_interval_ms: Option<u64>,
    /// `0` disables the limit.
    pub coordination_ready_timeout_secs: Option<u64>,
    /// `0` disables the limit.
    pub daemon_ready_timeout_secs: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
    pub quiesce_ms: Option<u64>,
    pub settle_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileDaemon {
    pub size: Option<u64>,
    pub fleet_member_size: Option<u64>,
    pub spill_lower_rate: Option<f64>,
    pub spill_upper_rate: Option<f64>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, path)
    }

    pub fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
