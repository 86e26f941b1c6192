//! Process supervision.
//!
//! Provides:
//! - Long-running daemons as scoped [`ManagedProcess`] handles that shut the
//!   child down (TERM, bounded grace period, then KILL) when dropped
//! - Synchronous invocations with captured output and exit-code checking
//! - Executable lookup against the build output directory, then PATH

use std::ffi::{OsStr, OsString};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::clock::{SharedClock, system_clock};
use crate::config::HarnessConfig;
use crate::envvars::Environment;
use crate::errors::{HarnessError, HarnessResult};

/// Where a child's stdout/stderr go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputMode {
    /// Share the harness's own stdout/stderr.
    Inherit,
    /// Pipe into memory; only valid for invocations that run to completion.
    Capture,
    /// Append both streams to a file.
    LogFile(PathBuf),
    Discard,
}

/// What to launch and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Bare executable name (resolved at launch) or a path.
    pub program: OsString,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    /// Variables layered over the supervisor's environment.
    pub env_delta: Vec<(OsString, OsString)>,
    /// `None` lets the supervisor pick its default for the launch kind.
    pub output: Option<OutputMode>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env_delta: Vec::new(),
            output: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env_delta.push((key.into(), value.into()));
        self
    }

    pub fn output(mut self, mode: OutputMode) -> Self {
        self.output = Some(mode);
        self
    }

    /// Program and arguments joined for logging.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(OsStr::to_string_lossy)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Lifecycle of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    /// Exited cleanly or was stopped by the supervisor.
    Terminated,
    /// Exited on its own with a failure status.
    Failed,
}

/// Bounds for the two-phase shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    pub grace_period: Duration,
    pub poll_interval: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// How a shutdown concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// The child had already exited before shutdown began.
    AlreadyExited,
    /// The child exited within the grace period after TERM.
    Graceful,
    /// The grace period lapsed and the child was killed.
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub phase: ShutdownPhase,
    pub exit_code: Option<i32>,
    /// Time spent in shutdown, measured on the supervisor's clock.
    pub elapsed: Duration,
}

/// Result of a synchronous invocation.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub program: String,
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Turn a non-zero exit into [`HarnessError::ProcessFailed`].
    pub fn check(self) -> HarnessResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(HarnessError::ProcessFailed {
                stderr: self.stderr_lossy(),
                program: self.program,
                exit_code: self.exit_code,
            })
        }
    }
}

/// Launches processes against an explicit environment.
#[derive(Debug, Clone)]
pub struct Supervisor {
    env: Environment,
    search_dir: PathBuf,
    log_dir: PathBuf,
    verbose: bool,
    shutdown: ShutdownPolicy,
    clock: SharedClock,
}

impl Supervisor {
    pub fn new(config: &HarnessConfig, env: &Environment) -> Self {
        Self {
            env: env.clone(),
            search_dir: config.executable_dir.clone(),
            log_dir: config.log_dir.clone(),
            verbose: config.verbose,
            shutdown: ShutdownPolicy {
                grace_period: config.timing.shutdown_grace,
                poll_interval: config.timing.shutdown_poll,
            },
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown = policy;
        self
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Locate an executable in the search directory, falling back to PATH.
    pub fn resolve(&self, name: &OsStr) -> HarnessResult<PathBuf> {
        resolve_executable(name, &self.search_dir)
    }

    /// Start a long-running process. Dropping the handle stops it.
    pub fn start(&self, name: &str, spec: LaunchSpec) -> HarnessResult<ManagedProcess> {
        let program = self.resolve(&spec.program)?;
        let output = match spec.output.clone() {
            Some(OutputMode::Capture) | None if self.verbose => OutputMode::Inherit,
            // A daemon writing into a pipe nobody drains eventually blocks.
            Some(OutputMode::Capture) | None => OutputMode::LogFile(self.log_dir.join(format!(
                "{}.log",
                sanitize_component(name)
            ))),
            Some(mode) => mode,
        };

        let mut cmd = self.command(&program, &spec);
        let log_path = attach_output(&mut cmd, &output)?;

        info!(name, command = %spec.command_line(), "Spawning process");
        let child = cmd.spawn().map_err(|e| {
            HarnessError::ProcessStartFailed(format!("{}: {}", program.display(), e))
        })?;
        let pid = child.id();
        debug!(name, pid, log = ?log_path, "Process spawned");

        Ok(ManagedProcess {
            name: name.to_string(),
            spec,
            pid,
            started_at: Instant::now(),
            child,
            state: ProcessState::Running,
            exit_code: None,
            stop_requested: false,
            log_path,
            shutdown: self.shutdown,
            clock: self.clock.clone(),
        })
    }

    /// Run to completion and fail on a non-zero exit.
    pub fn run(&self, spec: LaunchSpec) -> HarnessResult<CommandResult> {
        self.execute(spec, None)?.check()
    }

    /// Run to completion, returning the result whatever the exit code.
    ///
    /// With a timeout the child is killed once it elapses and
    /// [`HarnessError::Timeout`] is returned.
    pub fn execute(&self, spec: LaunchSpec, timeout: Option<Duration>) -> HarnessResult<CommandResult> {
        let program = self.resolve(&spec.program)?;
        let output = spec.output.clone().unwrap_or(OutputMode::Capture);
        let mut cmd = self.command(&program, &spec);
        attach_output(&mut cmd, &output)?;

        debug!(command = %spec.command_line(), "Executing");
        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            HarnessError::ProcessStartFailed(format!("{}: {}", program.display(), e))
        })?;

        let stdout_handle = child
            .stdout
            .take()
            .map(|mut stdout| thread::spawn(move || read_all(&mut stdout)));
        let stderr_handle = child
            .stderr
            .take()
            .map(|mut stderr| thread::spawn(move || read_all(&mut stderr)));

        let status = match timeout {
            None => child.wait()?,
            Some(limit) => loop {
                if let Some(status) = child.try_wait()? {
                    break status;
                }
                if start.elapsed() >= limit {
                    let _ = child.kill();
                    let _ = child.wait();
                    join_output(stdout_handle);
                    join_output(stderr_handle);
                    warn!(command = %spec.command_line(), ?limit, "Invocation timed out");
                    return Err(HarnessError::Timeout(limit));
                }
                thread::sleep(Duration::from_millis(10));
            },
        };

        let result = CommandResult {
            program: spec.program.to_string_lossy().into_owned(),
            exit_code: exit_code_of(status),
            stdout: join_output(stdout_handle),
            stderr: join_output(stderr_handle),
            duration: start.elapsed(),
        };
        debug!(
            program = %result.program,
            exit_code = result.exit_code,
            duration_ms = result.duration.as_millis() as u64,
            "Invocation finished"
        );
        Ok(result)
    }

    fn command(&self, program: &Path, spec: &LaunchSpec) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(&spec.args).stdin(Stdio::null());
        self.env.apply_to(&mut cmd);
        cmd.envs(spec.env_delta.iter().map(|(k, v)| (k, v)));
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// A supervised child process. Dropping it runs the two-phase shutdown.
#[derive(Debug)]
pub struct ManagedProcess {
    name: String,
    spec: LaunchSpec,
    pid: u32,
    started_at: Instant,
    child: Child,
    state: ProcessState,
    exit_code: Option<i32>,
    stop_requested: bool,
    log_path: Option<PathBuf>,
    shutdown: ShutdownPolicy,
    clock: SharedClock,
}

impl ManagedProcess {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Current lifecycle state, refreshed with a non-blocking wait.
    pub fn state(&mut self) -> ProcessState {
        if self.state == ProcessState::Running {
            match self.child.try_wait() {
                Ok(Some(status)) => self.record_exit(status),
                Ok(None) => {}
                Err(e) => warn!(name = %self.name, error = %e, "try_wait failed"),
            }
        }
        self.state
    }

    pub fn is_running(&mut self) -> bool {
        self.state() == ProcessState::Running
    }

    /// Fail with [`HarnessError::DaemonExited`] unless the process is alive.
    pub fn ensure_running(&mut self) -> HarnessResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(HarnessError::DaemonExited {
                name: self.name.clone(),
                exit_code: self.exit_code,
            })
        }
    }

    /// Stop the process: TERM, wait up to the grace period, then KILL.
    ///
    /// Calling it again after the process is gone reports `AlreadyExited`.
    pub fn terminate(&mut self) -> HarnessResult<ShutdownReport> {
        let start = self.clock.now();
        let elapsed = |clock: &SharedClock| clock.now().saturating_duration_since(start);

        if self.state() != ProcessState::Running {
            return Ok(ShutdownReport {
                phase: ShutdownPhase::AlreadyExited,
                exit_code: self.exit_code,
                elapsed: Duration::ZERO,
            });
        }

        self.stop_requested = true;
        info!(name = %self.name, pid = self.pid, "Stopping process");
        send_term(&mut self.child);

        let deadline = start + self.shutdown.grace_period;
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.record_exit(status);
                debug!(name = %self.name, code = ?self.exit_code, "Process exited after TERM");
                return Ok(ShutdownReport {
                    phase: ShutdownPhase::Graceful,
                    exit_code: self.exit_code,
                    elapsed: elapsed(&self.clock),
                });
            }
            if self.clock.now() >= deadline {
                break;
            }
            self.clock.sleep(self.shutdown.poll_interval);
        }

        warn!(
            name = %self.name,
            pid = self.pid,
            grace = ?self.shutdown.grace_period,
            "Grace period elapsed; killing process"
        );
        if let Err(e) = self.child.kill() {
            // Raced with a natural exit; wait() below still reaps it.
            debug!(name = %self.name, error = %e, "kill failed");
        }
        let status = self.child.wait()?;
        self.record_exit(status);
        Ok(ShutdownReport {
            phase: ShutdownPhase::Forced,
            exit_code: self.exit_code,
            elapsed: elapsed(&self.clock),
        })
    }

    fn record_exit(&mut self, status: ExitStatus) {
        self.exit_code = status.code();
        self.state = if self.stop_requested || status.success() {
            ProcessState::Terminated
        } else {
            ProcessState::Failed
        };
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            warn!(name = %self.name, pid = self.pid, error = %e, "Failed to stop process");
        }
    }
}

/// Locate `name`: paths are taken as given, bare names are looked up in
/// `search_dir` and then on PATH.
pub fn resolve_executable(name: &OsStr, search_dir: &Path) -> HarnessResult<PathBuf> {
    let not_found = || HarnessError::ExecutableNotFound {
        name: name.to_string_lossy().into_owned(),
        search_dir: search_dir.to_path_buf(),
    };

    let candidate = Path::new(name);
    if candidate.is_absolute() || candidate.components().count() > 1 {
        return if candidate.is_file() {
            Ok(candidate.to_path_buf())
        } else {
            Err(not_found())
        };
    }

    which::which_in(name, Some(search_dir), search_dir)
        .or_else(|_| which::which(name))
        .map_err(|_| not_found())
}

fn attach_output(cmd: &mut Command, output: &OutputMode) -> HarnessResult<Option<PathBuf>> {
    match output {
        OutputMode::Inherit => {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            Ok(None)
        }
        OutputMode::Capture => {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            Ok(None)
        }
        OutputMode::Discard => {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
            Ok(None)
        }
        OutputMode::LogFile(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = File::options().create(true).append(true).open(path)?;
            let err = file.try_clone()?;
            cmd.stdout(Stdio::from(file)).stderr(Stdio::from(err));
            Ok(Some(path.clone()))
        }
    }
}

#[cfg(unix)]
fn send_term(child: &mut Child) {
    match Command::new("kill")
        .arg("-TERM")
        .arg(child.id().to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => {}
        Ok(status) => debug!(pid = child.id(), ?status, "kill -TERM reported failure"),
        Err(e) => debug!(pid = child.id(), error = %e, "Failed to run kill -TERM"),
    }
}

#[cfg(not(unix))]
fn send_term(child: &mut Child) {
    // No graceful signal available; the grace loop will observe the kill.
    let _ = child.kill();
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

fn read_all<R: Read>(reader: &mut R) -> Vec<u8> {
    let mut buffer = Vec::new();
    let _ = reader.read_to_end(&mut buffer);
    buffer
}

fn join_output(handle: Option<thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    match handle {
        Some(handle) => handle.join().unwrap_or_default(),
        None => Vec::new(),
    }
}

pub(crate) fn sanitize_component(raw: &str) -> String {
    let sanitized: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "process".to_string()
    } else {
        sanitized
    }
}
