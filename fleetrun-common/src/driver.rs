//! Test driver.
//!
//! Selects tests by substring filter, builds their command lines (wrapping
//! distributed tests in the launcher), runs them against a live daemon and
//! records every invocation in the run report.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::errors::{HarnessError, HarnessResult};
use crate::process::{CommandResult, LaunchSpec, OutputMode, Supervisor};
use crate::report::{InvocationRecord, ReportSink};

/// Whether `name` is selected by `filters`.
///
/// No filters selects everything; otherwise `name` must contain at least one
/// filter as a substring, so one token can select a family of tests.
pub fn include_test<S: AsRef<str>>(filters: &[S], name: &str) -> bool {
    filters.is_empty() || filters.iter().any(|f| name.contains(f.as_ref()))
}

/// A positional argument for a test executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestArg {
    /// Passed through unchanged.
    Text(String),
    /// Canonical `Debug` rendering of a non-string value.
    Repr(String),
}

impl TestArg {
    /// Render a structured value through `Debug`, so that it reaches the
    /// child unambiguously (`Some(3)`, `[1, 2]`, `1.0`).
    pub fn repr<T: fmt::Debug + ?Sized>(value: &T) -> Self {
        Self::Repr(format!("{value:?}"))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Text(s) | Self::Repr(s) => s,
        }
    }
}

impl From<&str> for TestArg {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for TestArg {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl fmt::Display for TestArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One test case to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestInvocation {
    pub name: String,
    pub args: Vec<TestArg>,
    pub process_count: usize,
    /// Return stdout instead of streaming it.
    pub capture: bool,
}

impl TestInvocation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            process_count: 1,
            capture: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<TestArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn processes(mut self, count: usize) -> Self {
        self.process_count = count.max(1);
        self
    }

    pub fn capture(mut self) -> Self {
        self.capture = true;
        self
    }

    /// Full command line.
    ///
    /// With more than one process: `launcher... -n N --host localhost:N`,
    /// then the executable. Always followed by the IPC socket and the
    /// arguments.
    pub fn argv(&self, launcher: &[OsString], executable: &Path, ipc_socket: &Path) -> Vec<OsString> {
        let mut argv = Vec::with_capacity(launcher.len() + self.args.len() + 6);
        if self.process_count > 1 {
            let n = self.process_count.to_string();
            argv.extend(launcher.iter().cloned());
            argv.extend([
                OsString::from("-n"),
                OsString::from(&n),
                OsString::from("--host"),
                OsString::from(format!("localhost:{n}")),
            ]);
        }
        argv.push(executable.as_os_str().to_owned());
        argv.push(ipc_socket.as_os_str().to_owned());
        argv.extend(self.args.iter().map(|a| OsString::from(a.as_str())));
        argv
    }
}

/// Distributed launcher implementation, told apart by its version banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherFlavor {
    OpenMpi,
    Generic,
}

impl LauncherFlavor {
    pub fn from_version_output(output: &str) -> Self {
        if output.to_lowercase().contains("open") {
            Self::OpenMpi
        } else {
            Self::Generic
        }
    }

    /// Flags that let Open MPI run as root in containers and exit cleanly
    /// without shared-memory single-copy.
    pub fn flags(self) -> &'static [&'static str] {
        match self {
            Self::OpenMpi => &[
                "--allow-run-as-root",
                "-mca",
                "orte_allowed_exit_without_sync",
                "1",
                "-mca",
                "btl_vader_single_copy_mechanism",
                "none",
            ],
            Self::Generic => &[],
        }
    }
}

/// The distributed launcher. Its flavor is probed once, on first use, and
/// clones share the result.
#[derive(Debug, Clone)]
pub struct Launcher {
    program: String,
    flavor: Arc<OnceLock<LauncherFlavor>>,
}

impl Launcher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            flavor: Arc::new(OnceLock::new()),
        }
    }

    /// A launcher whose flavor is already known.
    pub fn with_flavor(program: impl Into<String>, flavor: LauncherFlavor) -> Self {
        let launcher = Self::new(program);
        let _ = launcher.flavor.set(flavor);
        launcher
    }

    pub fn is_detected(&self) -> bool {
        self.flavor.get().is_some()
    }

    pub fn flavor(&self, supervisor: &Supervisor) -> LauncherFlavor {
        *self.flavor.get_or_init(|| {
            let probe = LaunchSpec::new(&self.program).arg("-V");
            let flavor = match supervisor.execute(probe, Some(Duration::from_secs(30))) {
                Ok(result) => LauncherFlavor::from_version_output(&format!(
                    "{}{}",
                    result.stdout_lossy(),
                    result.stderr_lossy()
                )),
                Err(e) => {
                    debug!(launcher = %self.program, error = %e, "Launcher version probe failed");
                    LauncherFlavor::Generic
                }
            };
            info!(launcher = %self.program, ?flavor, "Detected launcher flavor");
            flavor
        })
    }

    /// Launcher program followed by its flavor's flags.
    pub fn command_prefix(&self, supervisor: &Supervisor) -> Vec<OsString> {
        std::iter::once(OsString::from(&self.program))
            .chain(self.flavor(supervisor).flags().iter().map(OsString::from))
            .collect()
    }
}

/// Result of a test that ran.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub name: String,
    pub exit_code: i32,
    pub duration: Duration,
    /// Raw stdout for captured invocations.
    pub stdout: Option<Vec<u8>>,
}

/// A scripted suite run through the script runner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptSuite {
    pub label: String,
    pub paths: Vec<String>,
    /// Each becomes a `-k <keyword>` selection.
    pub keywords: Vec<String>,
    pub extra_args: Vec<String>,
}

impl ScriptSuite {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.paths.push(path.into());
        self
    }

    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords.extend(keywords.into_iter().map(Into::into));
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Runner arguments: verbosity flags, paths, keyword filters, extras.
    pub fn runner_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-s", "-vvv", "--durations=0", "--log-cli-level", "DEBUG"]
            .into_iter()
            .map(String::from)
            .collect();
        args.extend(self.paths.iter().cloned());
        for keyword in &self.keywords {
            args.push("-k".to_string());
            args.push(keyword.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Runs test executables and script suites against one daemon socket.
#[derive(Debug, Clone)]
pub struct TestDriver {
    supervisor: Supervisor,
    project_root: PathBuf,
    script_runner: String,
    filters: Vec<String>,
    ipc_socket: PathBuf,
    quiesce: Duration,
    launcher: Launcher,
    report: ReportSink,
}

impl TestDriver {
    pub fn new(config: &HarnessConfig, supervisor: Supervisor, filters: Vec<String>, report: ReportSink) -> Self {
        Self {
            supervisor,
            project_root: config.project_root.clone(),
            script_runner: config.binaries.script_runner.clone(),
            filters,
            ipc_socket: config.ipc_socket_base.clone(),
            quiesce: config.timing.quiesce_delay,
            launcher: Launcher::new(config.binaries.launcher.clone()),
            report,
        }
    }

    pub fn with_launcher(mut self, launcher: Launcher) -> Self {
        self.launcher = launcher;
        self
    }

    /// Point tests at another daemon's IPC socket.
    pub fn with_ipc_socket(mut self, socket: impl Into<PathBuf>) -> Self {
        self.ipc_socket = socket.into();
        self
    }

    pub fn filters(&self) -> &[String] {
        &self.filters
    }

    pub fn includes(&self, name: &str) -> bool {
        include_test(&self.filters, name)
    }

    pub fn launcher(&self) -> &Launcher {
        &self.launcher
    }

    pub fn report(&self) -> &ReportSink {
        &self.report
    }

    /// Run one test. Filtered-out tests return `Ok(None)`.
    ///
    /// A non-zero exit is an error carrying the test's exit code. After each
    /// test the driver pauses for the quiesce delay, since daemon-side
    /// teardown is asynchronous and exposes no completion signal.
    pub fn run(&self, invocation: &TestInvocation) -> HarnessResult<Option<TestOutcome>> {
        if !self.includes(&invocation.name) {
            debug!(test = %invocation.name, "Filtered out");
            return Ok(None);
        }
        info!(test = %invocation.name, processes = invocation.process_count, "Running test case");

        let executable = self.supervisor.resolve(OsStr::new(&invocation.name))?;
        let prefix = if invocation.process_count > 1 {
            self.launcher.command_prefix(&self.supervisor)
        } else {
            Vec::new()
        };
        let argv = invocation.argv(&prefix, &executable, &self.ipc_socket);
        let output = if invocation.capture {
            OutputMode::Capture
        } else {
            OutputMode::Inherit
        };

        let result = self.invoke(&invocation.name, argv, output)?;
        let outcome = TestOutcome {
            name: invocation.name.clone(),
            exit_code: result.exit_code,
            duration: result.duration,
            stdout: invocation.capture.then_some(result.stdout),
        };
        info!(
            test = %outcome.name,
            duration_ms = outcome.duration.as_millis() as u64,
            "Test case passed"
        );

        self.supervisor.clock().sleep(self.quiesce);
        Ok(Some(outcome))
    }

    /// Run a scripted suite through the script runner in the project root.
    pub fn run_script_suite(&self, suite: &ScriptSuite) -> HarnessResult<TestOutcome> {
        info!(suite = %suite.label, paths = ?suite.paths, "Running script suite");
        let argv = std::iter::once(OsString::from(&self.script_runner))
            .chain(suite.runner_args().into_iter().map(OsString::from))
            .collect();
        let result = self.invoke(&suite.label, argv, OutputMode::Inherit)?;
        info!(
            suite = %suite.label,
            duration_secs = result.duration.as_secs_f64(),
            "Script suite passed"
        );
        Ok(TestOutcome {
            name: suite.label.clone(),
            exit_code: result.exit_code,
            duration: result.duration,
            stdout: None,
        })
    }

    fn invoke(&self, name: &str, argv: Vec<OsString>, output: OutputMode) -> HarnessResult<CommandResult> {
        let record = InvocationRecord::new(
            name,
            argv.iter().map(|a| a.to_string_lossy().into_owned()).collect(),
            Utc::now(),
        );
        let Some((program, args)) = argv.split_first() else {
            return Err(HarnessError::ProcessStartFailed(format!(
                "empty command line for {name}"
            )));
        };
        let spec = LaunchSpec::new(program.clone())
            .args(args.iter().cloned())
            .cwd(&self.project_root)
            .output(output);

        let started = Instant::now();
        match self.supervisor.execute(spec, None) {
            Ok(result) => {
                self.report
                    .record(record.finished(result.duration, result.exit_code));
                result.check().inspect_err(|e| {
                    warn!(name, error = %e, "Invocation failed");
                })
            }
            Err(e) => {
                self.report.record(record.errored(started.elapsed(), &e));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn filter_examples() {
        assert!(include_test(&["alpha", "beta"], "alpha_suite_1"));
        assert!(!include_test(&["gamma"], "alpha_suite_1"));
        assert!(include_test::<&str>(&[], "anything"));
        assert!(include_test(&["rpc"], "rpc_get_object_test"));
        assert!(!include_test(&["rpc"], "remote_buffer_test"));
    }

    proptest! {
        #[test]
        fn any_substring_selects(name in "[a-z_]{1,24}", start in 0usize..24, len in 1usize..8) {
            let start = start.min(name.len() - 1);
            let end = (start + len).min(name.len());
            let filter = name[start..end].to_string();
            prop_assert!(include_test(&[filter], &name));
        }

        #[test]
        fn non_matching_filters_exclude(name in "[a-m]{1,16}", filter in "[n-z]{1,4}") {
            prop_assert!(!include_test(&[filter], &name));
        }
    }

    #[test]
    fn repr_uses_debug_rendering() {
        assert_eq!(TestArg::repr(&3).as_str(), "3");
        assert_eq!(TestArg::repr(&Some(1.5)).as_str(), "Some(1.5)");
        assert_eq!(TestArg::repr(&vec![1, 2]).as_str(), "[1, 2]");
        assert_eq!(TestArg::from("127.0.0.1:9600").as_str(), "127.0.0.1:9600");
    }

    #[test]
    fn single_process_argv_is_executable_socket_args() {
        let argv = TestInvocation::new("rpc_test").arg("127.0.0.1:9600").argv(
            &[OsString::from("mpiexec")],
            Path::new("/build/bin/rpc_test"),
            Path::new("/tmp/ci.sock"),
        );
        let rendered: Vec<_> = argv.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(rendered, ["/build/bin/rpc_test", "/tmp/ci.sock", "127.0.0.1:9600"]);
    }

    #[test]
    fn distributed_argv_is_wrapped_in_launcher() {
        let prefix: Vec<OsString> = std::iter::once("mpiexec")
            .chain(LauncherFlavor::OpenMpi.flags().iter().copied())
            .map(OsString::from)
            .collect();
        let argv = TestInvocation::new("global_object_test")
            .processes(2)
            .arg(TestArg::repr(&42))
            .argv(&prefix, Path::new("/b/global_object_test"), Path::new("/tmp/s"));

        let rendered: Vec<_> = argv.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(
            rendered,
            [
                "mpiexec",
                "--allow-run-as-root",
                "-mca",
                "orte_allowed_exit_without_sync",
                "1",
                "-mca",
                "btl_vader_single_copy_mechanism",
                "none",
                "-n",
                "2",
                "--host",
                "localhost:2",
                "/b/global_object_test",
                "/tmp/s",
                "42",
            ]
        );
    }

    #[test]
    fn launcher_flavor_from_banner() {
        assert_eq!(
            LauncherFlavor::from_version_output("mpiexec (OpenRTE) 4.1.2"),
            LauncherFlavor::OpenMpi
        );
        assert_eq!(
            LauncherFlavor::from_version_output("mpiexec (Open MPI) 4.1.2"),
            LauncherFlavor::OpenMpi
        );
        assert_eq!(
            LauncherFlavor::from_version_output("HYDRA build details:\n    Version: 4.0"),
            LauncherFlavor::Generic
        );
        assert!(LauncherFlavor::Generic.flags().is_empty());
    }

    #[test]
    fn script_suite_args() {
        let suite = ScriptSuite::new("python")
            .path("python/vineyard/core")
            .path("python/vineyard/data")
            .keywords(["array"])
            .arg("--vineyard-ipc-socket=/tmp/s");
        assert_eq!(
            suite.runner_args(),
            [
                "-s",
                "-vvv",
                "--durations=0",
                "--log-cli-level",
                "DEBUG",
                "python/vineyard/core",
                "python/vineyard/data",
                "-k",
                "array",
                "--vineyard-ipc-socket=/tmp/s",
            ]
        );
    }

    #[cfg(unix)]
    mod execution {
        use super::*;
        use crate::clock::ManualClock;
        use crate::envvars::Environment;
        use crate::report::Outcome;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::sync::Arc;

        struct Fixture {
            _dir: tempfile::TempDir,
            config: HarnessConfig,
            clock: Arc<ManualClock>,
        }

        fn fixture(scripts: &[(&str, &str)]) -> Fixture {
            let dir = tempfile::tempdir().unwrap();
            let mut config = HarnessConfig::new(dir.path());
            config.executable_dir = dir.path().join("bin");
            config.log_dir = dir.path().join("logs");
            config.ipc_socket_base = dir.path().join("ci.sock");
            fs::create_dir_all(&config.executable_dir).unwrap();
            for (name, body) in scripts {
                let path = config.executable_dir.join(name);
                fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
                fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            }
            Fixture {
                _dir: dir,
                config,
                clock: Arc::new(ManualClock::new()),
            }
        }

        fn driver(fx: &Fixture, filters: &[&str]) -> TestDriver {
            let supervisor =
                Supervisor::new(&fx.config, &Environment::capture()).with_clock(fx.clock.clone());
            TestDriver::new(
                &fx.config,
                supervisor,
                filters.iter().map(|s| s.to_string()).collect(),
                ReportSink::new(),
            )
        }

        #[test]
        fn capture_returns_stdout_and_quiesces() {
            let fx = fixture(&[("echo_test", r#"echo "$1 $2""#)]);
            let driver = driver(&fx, &[]);
            let outcome = driver
                .run(&TestInvocation::new("echo_test").arg("x").capture())
                .unwrap()
                .unwrap();

            let expected = format!("{} x\n", fx.config.ipc_socket_base.display());
            assert_eq!(outcome.stdout.unwrap(), expected.into_bytes());
            assert_eq!(fx.clock.sleeps(), vec![fx.config.timing.quiesce_delay]);
            assert_eq!(driver.report().finish().passed(), 1);
        }

        #[test]
        fn filtered_tests_do_not_run() {
            let fx = fixture(&[("array_test", "exit 0")]);
            let driver = driver(&fx, &["lru"]);
            assert!(driver.run(&TestInvocation::new("array_test")).unwrap().is_none());
            assert!(driver.report().is_empty());
            assert!(fx.clock.sleeps().is_empty());
        }

        #[test]
        fn failing_test_propagates_exit_code() {
            let fx = fixture(&[("lru_test", "exit 9")]);
            let driver = driver(&fx, &[]);
            let err = driver.run(&TestInvocation::new("lru_test")).unwrap_err();
            assert_eq!(err.exit_code(), 9);

            let report = driver.report().finish();
            let failure = report.first_failure().unwrap();
            assert_eq!(failure.outcome, Outcome::Failed);
            assert_eq!(failure.exit_code, Some(9));
        }

        #[test]
        fn missing_test_executable_is_an_error() {
            let fx = fixture(&[]);
            let err = driver(&fx, &[])
                .run(&TestInvocation::new("no_such_test_binary_xyz"))
                .unwrap_err();
            assert!(matches!(err, HarnessError::ExecutableNotFound { .. }));
        }

        #[test]
        fn launcher_is_probed_only_for_distributed_tests() {
            let fx = fixture(&[
                ("single_test", "exit 0"),
                ("fake-launcher", r#"if [ "$1" = "-V" ]; then echo "mpiexec (Open MPI) 4.1"; exit 0; fi
while [ "$1" != "-n" ]; do shift; done
shift 4
exec "$@""#),
                ("multi_test", "exit 0"),
            ]);
            let driver = driver(&fx, &[]).with_launcher(Launcher::new("fake-launcher"));

            driver.run(&TestInvocation::new("single_test")).unwrap();
            assert!(!driver.launcher().is_detected());

            driver
                .run(&TestInvocation::new("multi_test").processes(2))
                .unwrap();
            assert!(driver.launcher().is_detected());

            let report = driver.report().finish();
            let argv = &report.invocations[1].argv;
            assert_eq!(argv[0], "fake-launcher");
            assert_eq!(argv[1], "--allow-run-as-root");
        }

        #[test]
        fn driver_clones_share_launcher_detection() {
            let fx = fixture(&[
                ("counting-launcher", r#"echo probed >> "$0.count"
echo "mpiexec (Open MPI) 4.1""#),
            ]);
            let count = fx.config.executable_dir.join("counting-launcher.count");
            let driver = driver(&fx, &[]).with_launcher(Launcher::new("counting-launcher"));
            let first = driver.clone();
            let second = driver.clone();

            assert_eq!(first.launcher().flavor(&first.supervisor), LauncherFlavor::OpenMpi);
            assert!(driver.launcher().is_detected());
            assert!(second.launcher().is_detected());
            assert_eq!(second.launcher().flavor(&second.supervisor), LauncherFlavor::OpenMpi);
            assert_eq!(fs::read_to_string(&count).unwrap().lines().count(), 1);
        }

        #[test]
        fn script_suite_runs_in_project_root() {
            let fx = fixture(&[("pytest", r#"pwd > "$FLEETRUN_MARK""#)]);
            let mark = fx.config.project_root.join("mark");
            let mut config = fx.config.clone();
            config.binaries.script_runner = "pytest".to_string();
            let env = Environment::from_vars([
                ("PATH", std::env::var_os("PATH").unwrap_or_default()),
                ("FLEETRUN_MARK", mark.clone().into_os_string()),
            ]);
            let supervisor = Supervisor::new(&config, &env);
            let driver = TestDriver::new(&config, supervisor, Vec::new(), ReportSink::new());

            let outcome = driver
                .run_script_suite(&ScriptSuite::new("python").path("python/core"))
                .unwrap();
            assert_eq!(outcome.exit_code, 0);
            let cwd = fs::read_to_string(&mark).unwrap();
            assert_eq!(
                fs::canonicalize(cwd.trim()).unwrap(),
                fs::canonicalize(&config.project_root).unwrap()
            );
        }
    }
}
