//! Shared library for the fleetrun integration-test harness.
//!
//! Provisions ephemeral coordination and storage daemons, composes them into
//! cluster topologies, and runs native and scripted test suites against
//! them. Every acquired resource is released on scope exit.

pub mod clock;
pub mod config;
pub mod driver;
pub mod envvars;
pub mod errors;
pub mod ports;
pub mod process;
pub mod readiness;
pub mod report;
pub mod scenario;
pub mod topology;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use config::{ConfigError, HarnessConfig};
pub use driver::{
    Launcher, LauncherFlavor, ScriptSuite, TestArg, TestDriver, TestInvocation, TestOutcome,
    include_test,
};
pub use envvars::{EnvGuard, Environment, EnvironmentSnapshot, LIBRARY_PATH_VAR, LIST_SEPARATOR};
pub use errors::{HarnessError, HarnessResult};
pub use ports::{PortAllocator, PortLease, allocate_port};
pub use process::{
    CommandResult, LaunchSpec, ManagedProcess, OutputMode, ProcessState, ShutdownPhase,
    ShutdownPolicy, ShutdownReport, Supervisor,
};
pub use readiness::{CommandProbe, Probe, ReadinessGate, TcpProbe, UnixSocketProbe, WhileRunning};
pub use report::{InvocationRecord, Outcome, ReportSink, RunReport};
pub use scenario::{ScaleOutcome, ScenarioRunner, SuiteSelection, check_malformed_input, garbage_payloads};
pub use topology::{
    ClusterTopology, CoordinationService, DaemonOptions, Namespace, ReadyMode, SpillConfig,
    StorageDaemon, TopologyBuilder,
};
