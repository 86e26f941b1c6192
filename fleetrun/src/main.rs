//! fleetrun - integration test runner
//!
//! Brings up coordination and storage daemons, runs the selected suites
//! against them and tears everything down again.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use fleetrun_common::{
    Environment, HarnessConfig, HarnessError, LIBRARY_PATH_VAR, ReportSink, RunReport,
    ScenarioRunner, Supervisor, SuiteSelection, TestDriver, TopologyBuilder,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "fleetrun")]
#[command(author, version, about = "Integration test runner for coordination/storage daemon fleets")]
struct Cli {
    /// Directory where the build artifacts are generated
    #[arg(short, long)]
    build_dir: Option<PathBuf>,

    /// Run native test executables
    #[arg(long)]
    with_cpp: bool,

    /// Run scripted test suites
    #[arg(long)]
    with_python: bool,

    /// Run IO adaptor suites
    #[arg(long)]
    with_io: bool,

    /// Run deployment and scale in/out scenarios
    #[arg(long)]
    with_deployment: bool,

    /// Run object migration variants
    #[arg(long)]
    with_migration: bool,

    /// Run contrib suites (requires --with-python)
    #[arg(long)]
    with_contrib: bool,

    /// Only run tests whose name contains one of these
    #[arg(long, num_args = 0.., action = clap::ArgAction::Append)]
    tests: Vec<String>,

    /// TOML file overriding harness defaults
    #[arg(long, env = "FLEETRUN_CONFIG")]
    config: Option<PathBuf>,

    /// Write a JSON run report here (`-` for stdout)
    #[arg(long)]
    report: Option<PathBuf>,

    /// Stream daemon output and log at debug level
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn selection(&self) -> SuiteSelection {
        SuiteSelection {
            cpp: self.with_cpp,
            python: self.with_python,
            io: self.with_io,
            deployment: self.with_deployment,
            migration: self.with_migration,
            contrib: self.with_contrib,
        }
    }
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let selection = cli.selection();

    if !selection.any() {
        eprintln!(
            "Error: \n\tat least one of --with-{{cpp,python,io,deployment}} needs to be specified\n"
        );
        eprintln!("{}", Cli::command().render_help());
        return ExitCode::from(1);
    }

    init_logging(&cli);

    match run(&cli, &selection) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            let code = err
                .downcast_ref::<HarnessError>()
                .map(HarnessError::exit_code)
                .unwrap_or(1);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn run(cli: &Cli, selection: &SuiteSelection) -> Result<()> {
    let mut env = Environment::capture();
    let mut config =
        HarnessConfig::load(&env, cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = &cli.build_dir {
        config.set_build_dir(dir);
    }
    config.verbose |= cli.verbose;
    if selection.contrib && !selection.python {
        warn!("--with-contrib has no effect without --with-python");
    }

    let shared_libs = config.shared_lib_dir();
    let env = env.with_env([(LIBRARY_PATH_VAR, shared_libs.as_os_str())], true);
    info!(
        build_dir = %config.build_dir.display(),
        executable_dir = %config.executable_dir.display(),
        shared_libs = %shared_libs.display(),
        "Starting test run"
    );

    let report = ReportSink::new();
    let supervisor = Supervisor::new(&config, &env);
    let driver = TestDriver::new(&config, supervisor.clone(), cli.tests.clone(), report.clone());
    let runner = ScenarioRunner::new(TopologyBuilder::new(config, supervisor), driver);

    let outcome = runner.execute(selection);

    let summary = report.finish();
    info!(
        passed = summary.passed(),
        failed = summary.failed(),
        "Test run finished"
    );
    if let Some(path) = &cli.report
        && let Err(e) = write_report(&summary, path)
    {
        warn!(path = %path.display(), error = %e, "Failed to write run report");
    }

    outcome.map_err(anyhow::Error::from)
}

fn write_report(report: &RunReport, path: &Path) -> Result<()> {
    if path == Path::new("-") {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        report.write_json(path)?;
    }
    Ok(())
}
