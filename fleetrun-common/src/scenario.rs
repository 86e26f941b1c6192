//! Scenario orchestration: which topologies to build, what to run against
//! them, and the scale-in/out and malformed-input scenarios.

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::driver::{ScriptSuite, TestDriver, TestInvocation};
use crate::errors::{HarnessError, HarnessResult};
use crate::process::LaunchSpec;
use crate::readiness::{Probe, TcpProbe};
use crate::topology::{
    ClusterTopology, CoordinationService, DaemonOptions, Namespace, ReadyMode, SpillConfig,
    TopologyBuilder, fleet_socket_base,
};

/// Prefix of every namespace this harness registers.
pub const NAMESPACE_PREFIX: &str = "fleetrun_test";

/// Instances in the scale scenario and the distributed script suites.
pub const DEFAULT_FLEET_SIZE: usize = 4;

/// Spill directory and capacity for the spill test daemon.
pub const SPILL_PATH: &str = "/tmp/spill_path";
pub const SPILL_DAEMON_SIZE: u64 = 2048;

const MALFORMED_INPUT_TEST: &str = "invalid_client_test";

/// A native test executable and whether it takes the daemon's RPC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeCase {
    pub name: &'static str,
    pub needs_rpc: bool,
}

const fn case(name: &'static str) -> NativeCase {
    NativeCase {
        name,
        needs_rpc: false,
    }
}

const fn rpc_case(name: &'static str) -> NativeCase {
    NativeCase {
        name,
        needs_rpc: true,
    }
}

/// Native tests run against a single daemon, in order.
pub const NATIVE_CATALOG: &[NativeCase] = &[
    case("array_test"),
    case("array_two_clients_test"),
    case("arrow_data_structure_test"),
    case("clear_test"),
    case("custom_vector_test"),
    case("dataframe_test"),
    case("deep_copy_test"),
    case("delete_test"),
    case("get_wait_test"),
    case("get_object_test"),
    case("global_object_test"),
    case("hashmap_test"),
    case("id_test"),
    rpc_case("invalid_connect_test"),
    case("large_meta_test"),
    case("list_object_test"),
    case("lru_test"),
    case("mutable_blob_test"),
    case("name_test"),
    case("persist_test"),
    case("plasma_test"),
    case("release_test"),
    rpc_case("remote_buffer_test"),
    rpc_case("rpc_delete_test"),
    rpc_case("rpc_get_object_test"),
    rpc_case("rpc_test"),
    case("scalar_test"),
    case("sequence_test"),
    case("server_status_test"),
    case("session_test"),
    case("signature_test"),
    case("shallow_copy_test"),
    case("shared_memory_test"),
    case("stream_test"),
    case("tensor_test"),
    case("typename_test"),
    case("version_test"),
    case("hosseinmoein_dataframe_test"),
];

const PYTHON_SUITE_PATHS: &[&str] = &[
    "python/vineyard/core",
    "python/vineyard/data",
    "python/vineyard/shared_memory",
];
const IO_SUITE_PATH: &str = "modules/io/python/drivers/io/tests";
const IO_MIGRATION_SUITE_PATH: &str = "modules/io/python/drivers/io/tests/test_migrate_stream.py";
const DEPLOY_SUITE_PATH: &str = "python/vineyard/deploy/tests";
const CONTRIB_ML_SUITE_PATH: &str = "python/vineyard/contrib/ml";
const CONTRIB_DASK_SUITE_PATH: &str = "python/vineyard/contrib/dask";
const IO_FLEET_SIZE: usize = 2;

/// Which suites to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuiteSelection {
    pub cpp: bool,
    pub python: bool,
    pub io: bool,
    pub deployment: bool,
    pub migration: bool,
    pub contrib: bool,
}

impl SuiteSelection {
    /// At least one primary suite is selected; `migration` and `contrib`
    /// only modify others.
    pub fn any(&self) -> bool {
        self.cpp || self.python || self.io || self.deployment
    }
}

/// What the scale scenario observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleOutcome {
    pub namespace: Namespace,
    /// Instances started in the scale-out phase (fleet plus one).
    pub started: usize,
    /// Instances still running after the first one was terminated.
    pub running_after_scale_in: usize,
    /// Keys under the namespace in the coordination service after scale-in.
    pub registered_keys: usize,
    /// Running instances whose RPC port accepted a connection after scale-in.
    pub reachable_after_scale_in: usize,
    /// Instances running at the end of the contention phase.
    pub contention_running: usize,
    /// Every daemon process the scenario launched.
    pub pids: Vec<u32>,
}

/// The garbage fed to a daemon's RPC port.
///
/// Short escalating sequences of a `0x00`/`0x01` lead byte followed by
/// ASCII digits, then runs of `'1'`, `0xFF`, `0x00`, `0x55` and `0xAA` of
/// 1 to 100 000 bytes.
pub fn garbage_payloads() -> Vec<Vec<u8>> {
    let mut payloads = vec![vec![0x01]];
    for n in 1..=6 {
        let mut zeros = vec![0x00];
        zeros.extend(std::iter::repeat_n(b'0', 2 * n - 1));
        zeros.push(b'1');
        payloads.push(zeros);

        let mut ones = vec![0x01];
        ones.extend(b"01".repeat(n));
        payloads.push(ones);
    }
    for byte in [b'1', 0xFF, 0x00, 0x55, 0xAA] {
        for exponent in 0..=5 {
            payloads.push(vec![byte; 10usize.pow(exponent)]);
        }
    }
    payloads
}

/// Write each payload over its own connection to `addr`.
///
/// A refused connection is a robustness failure. The peer closing early
/// (reset, broken pipe) is how a daemon is expected to reject garbage and
/// is only logged.
pub fn send_garbage(addr: SocketAddr, payloads: &[Vec<u8>]) -> HarnessResult<()> {
    for payload in payloads {
        let mut stream = TcpStream::connect_timeout(&addr, Duration::from_secs(5)).map_err(|e| {
            HarnessError::RobustnessFailure(format!("connect to {addr} failed: {e}"))
        })?;
        if let Err(e) = stream.write_all(payload) {
            debug!(%addr, len = payload.len(), error = %e, "Peer dropped garbage connection");
        }
        let _ = stream.shutdown(Shutdown::Both);
    }
    Ok(())
}

/// Send every garbage payload to `addr`, wait `grace`, then require the
/// daemon to still be alive and accepting connections. Returns the number
/// of payloads sent.
///
/// A crash can lag the last write, so liveness is checked only after the
/// grace period has passed on `clock`.
pub fn check_malformed_input<F>(
    addr: SocketAddr,
    clock: &dyn Clock,
    grace: Duration,
    mut ensure_alive: F,
) -> HarnessResult<usize>
where
    F: FnMut() -> HarnessResult<()>,
{
    let payloads = garbage_payloads();
    info!(%addr, payloads = payloads.len(), "Sending malformed input");
    send_garbage(addr, &payloads)?;
    clock.sleep(grace);

    ensure_alive().map_err(|e| match e {
        HarnessError::DaemonExited { name, exit_code } => HarnessError::RobustnessFailure(format!(
            "{name} died after malformed input (exit code {exit_code:?})"
        )),
        other => other,
    })?;
    if !TcpProbe::new(addr).probe()? {
        return Err(HarnessError::RobustnessFailure(format!(
            "{addr} stopped accepting connections after malformed input"
        )));
    }
    Ok(payloads.len())
}

/// Builds topologies and runs suites against them.
pub struct ScenarioRunner {
    builder: TopologyBuilder,
    driver: TestDriver,
}

impl ScenarioRunner {
    pub fn new(builder: TopologyBuilder, driver: TestDriver) -> Self {
        Self { builder, driver }
    }

    pub fn builder(&self) -> &TopologyBuilder {
        &self.builder
    }

    pub fn driver(&self) -> &TestDriver {
        &self.driver
    }

    /// Run every selected suite in the fixed order: native, scripted, IO,
    /// deployment, contrib. The first failure aborts the run.
    pub fn execute(&self, selection: &SuiteSelection) -> HarnessResult<()> {
        if selection.cpp {
            self.run_native_suite()?;
        }
        if selection.python {
            self.with_coordination(|c| self.run_python_suite(c))?;
        }
        if selection.io {
            self.with_coordination(|c| self.run_io_suite(c))?;
            self.with_coordination(|c| self.run_io_distributed_suite(c, selection.migration))?;
        }
        if selection.deployment {
            self.with_coordination(|c| {
                let outcome = self.scale_in_out(c.endpoint(), DEFAULT_FLEET_SIZE, ReadyMode::Wait)?;
                info!(?outcome, "Scale scenario passed");
                Ok(())
            })?;
            if selection.python {
                self.with_coordination(|c| self.run_deploy_suite(c, selection.migration))?;
            }
        }
        if selection.python && selection.contrib {
            self.with_coordination(|c| self.run_contrib_ml_suite(c))?;
            self.with_coordination(|c| self.run_contrib_dask_suite(c))?;
        }
        Ok(())
    }

    /// Run `body` with a fresh coordination service, stopped afterwards.
    pub fn with_coordination<T, F>(&self, body: F) -> HarnessResult<T>
    where
        F: FnOnce(&CoordinationService) -> HarnessResult<T>,
    {
        let service = self.builder.start_coordination_service()?;
        body(&service)
    }

    fn single_daemon(&self, endpoint: &str) -> DaemonOptions {
        DaemonOptions::new(
            endpoint,
            Namespace::time_salted(NAMESPACE_PREFIX),
            self.builder.config().daemon.size,
        )
    }

    fn distributed_fleet(&self, endpoint: &str) -> DaemonOptions {
        DaemonOptions::new(
            endpoint,
            Namespace::time_salted(NAMESPACE_PREFIX),
            self.builder.config().daemon.fleet_member_size,
        )
        .ready(ReadyMode::NoWait)
        .ipc_base(fleet_socket_base())
    }

    /// Native catalog, malformed input and spill test.
    ///
    /// The daemon is pointed at a coordination port nothing listens on, with
    /// ten more ports burned so nothing nearby is handed out afterwards.
    pub fn run_native_suite(&self) -> HarnessResult<()> {
        let ports = self.builder.ports();
        let unstarted = ports.allocate()?;
        ports.skip(10)?;
        let endpoint = format!("http://localhost:{unstarted}");

        {
            let mut daemon = self.builder.start_storage_daemon(&self.single_daemon(&endpoint))?;
            let driver = self.driver.clone().with_ipc_socket(daemon.ipc_socket());
            for case in NATIVE_CATALOG {
                let mut invocation = TestInvocation::new(case.name);
                if case.needs_rpc {
                    invocation = invocation.arg(daemon.rpc_address());
                }
                driver.run(&invocation)?;
            }

            if driver.includes(MALFORMED_INPUT_TEST) {
                let addr = SocketAddr::from(([127, 0, 0, 1], daemon.rpc_port()));
                let clock = self.builder.supervisor().clock();
                let grace = self.builder.config().timing.quiesce_delay;
                check_malformed_input(addr, clock.as_ref(), grace, || daemon.ensure_running())?;
            }
        }

        let defaults = &self.builder.config().daemon;
        let spill = SpillConfig::new(SPILL_PATH, defaults.spill_lower_rate, defaults.spill_upper_rate)?;
        let mut options = self.single_daemon(&endpoint).spill(spill);
        options.size = SPILL_DAEMON_SIZE;
        let daemon = self.builder.start_storage_daemon(&options)?;
        self.driver
            .clone()
            .with_ipc_socket(daemon.ipc_socket())
            .run(&TestInvocation::new("spill_test"))?;
        Ok(())
    }

    /// Core, data and shared-memory script suites against one daemon.
    pub fn run_python_suite(&self, coordination: &CoordinationService) -> HarnessResult<()> {
        let daemon = self
            .builder
            .start_storage_daemon(&self.single_daemon(coordination.endpoint()))?;
        let mut suite = ScriptSuite::new("python").keywords(self.driver.filters().iter().cloned());
        for path in PYTHON_SUITE_PATHS {
            suite = suite.path(*path);
        }
        let suite = suite
            .arg(format!("--vineyard-ipc-socket={}", daemon.ipc_socket().display()))
            .arg(format!("--vineyard-endpoint=localhost:{}", daemon.rpc_port()));
        self.driver.run_script_suite(&suite)?;
        Ok(())
    }

    /// IO adaptor suite against one daemon.
    pub fn run_io_suite(&self, coordination: &CoordinationService) -> HarnessResult<()> {
        let daemon = self
            .builder
            .start_storage_daemon(&self.single_daemon(coordination.endpoint()))?;
        let data_dir = self.builder.config().data_path(None);
        let suite = ScriptSuite::new("io adaptors")
            .path(IO_SUITE_PATH)
            .arg(format!("--vineyard-ipc-socket={}", daemon.ipc_socket().display()))
            .arg(format!("--vineyard-endpoint=localhost:{}", daemon.rpc_port()))
            .arg(format!("--test-dataset={}", data_dir.display()));
        self.driver.run_script_suite(&suite)?;
        Ok(())
    }

    /// Stream migration suite against a two-instance fleet.
    pub fn run_io_distributed_suite(
        &self,
        coordination: &CoordinationService,
        with_migration: bool,
    ) -> HarnessResult<()> {
        let fleet = self
            .builder
            .start_fleet(&self.distributed_fleet(coordination.endpoint()), IO_FLEET_SIZE)?;
        let first_rpc = fleet.rpc_ports().first().copied().ok_or_else(|| {
            HarnessError::InvalidTopology("distributed IO fleet is empty".to_string())
        })?;
        let mut suite = ScriptSuite::new("distributed io adaptors")
            .path(IO_MIGRATION_SUITE_PATH)
            .arg(format!("--vineyard-endpoint=localhost:{first_rpc}"))
            .arg(format!("--vineyard-ipc-sockets={}", fleet.ipc_sockets()));
        if with_migration {
            suite = suite.arg("--with-migration");
        }
        self.driver.run_script_suite(&suite)?;
        Ok(())
    }

    /// Deployment suite against a four-instance fleet.
    pub fn run_deploy_suite(&self, coordination: &CoordinationService, with_migration: bool) -> HarnessResult<()> {
        let fleet = self
            .builder
            .start_fleet(&self.distributed_fleet(coordination.endpoint()), DEFAULT_FLEET_SIZE)?;
        let mut suite = ScriptSuite::new("python distributed")
            .path(DEPLOY_SUITE_PATH)
            .arg(format!("--vineyard-ipc-sockets={}", fleet.ipc_sockets()));
        if with_migration {
            suite = suite.arg("--with-migration");
        }
        self.driver.run_script_suite(&suite)?;
        Ok(())
    }

    pub fn run_contrib_ml_suite(&self, coordination: &CoordinationService) -> HarnessResult<()> {
        let daemon = self
            .builder
            .start_storage_daemon(&self.single_daemon(coordination.endpoint()))?;
        let suite = ScriptSuite::new("python contrib ml")
            .path(CONTRIB_ML_SUITE_PATH)
            .arg(format!("--vineyard-ipc-socket={}", daemon.ipc_socket().display()))
            .arg(format!("--vineyard-endpoint=localhost:{}", daemon.rpc_port()));
        self.driver.run_script_suite(&suite)?;
        Ok(())
    }

    pub fn run_contrib_dask_suite(&self, coordination: &CoordinationService) -> HarnessResult<()> {
        let fleet = self
            .builder
            .start_fleet(&self.distributed_fleet(coordination.endpoint()), DEFAULT_FLEET_SIZE)?;
        let suite = ScriptSuite::new("python contrib dask")
            .path(CONTRIB_DASK_SUITE_PATH)
            .arg(format!("--vineyard-ipc-sockets={}", fleet.ipc_sockets()));
        self.driver.run_script_suite(&suite)?;
        Ok(())
    }

    /// Scale out to `instance_count + 1` instances, scale in by terminating
    /// the first, then restart the fleet without readiness waits so the
    /// instances race to register.
    pub fn scale_in_out(&self, endpoint: &str, instance_count: usize, ready: ReadyMode) -> HarnessResult<ScaleOutcome> {
        let namespace = Namespace::time_salted(NAMESPACE_PREFIX);
        let template = DaemonOptions::new(
            endpoint,
            namespace.clone(),
            self.builder.config().daemon.fleet_member_size,
        )
        .ready(ready);
        let mut pids = Vec::new();

        let (started, running_after_scale_in, registered_keys, reachable_after_scale_in) = {
            let mut fleet = self.builder.start_fleet(&template, instance_count)?;
            self.settle(&mut fleet)?;
            fleet.add_instance()?;
            self.settle(&mut fleet)?;
            pids.extend(fleet.instances().iter().map(|d| d.pid()));

            fleet.terminate_instance(0)?;
            self.settle(&mut fleet)?;
            let running = fleet.running_instances();
            let registered = self.registered_keys(endpoint, &namespace)?;
            let reachable = self.reachable_instances(&mut fleet);
            let started = fleet.len();
            fleet.release();
            (started, running, registered, reachable)
        };
        if running_after_scale_in != instance_count {
            return Err(HarnessError::RobustnessFailure(format!(
                "expected {instance_count} of {} instances running after scale-in, found {running_after_scale_in}",
                instance_count + 1
            )));
        }
        if registered_keys == 0 {
            return Err(HarnessError::RobustnessFailure(format!(
                "nothing registered under {namespace} at {endpoint} after scale-in"
            )));
        }
        if reachable_after_scale_in != instance_count {
            return Err(HarnessError::RobustnessFailure(format!(
                "only {reachable_after_scale_in} of {instance_count} remaining instances answer on their RPC port"
            )));
        }

        let contention = template.ready(ReadyMode::NoWait);
        let contention_running = {
            let mut fleet = self.builder.start_fleet(&contention, instance_count)?;
            pids.extend(fleet.instances().iter().map(|d| d.pid()));
            self.settle(&mut fleet)?;
            fleet.running_instances()
        };
        if contention_running != instance_count {
            return Err(HarnessError::RobustnessFailure(format!(
                "{} of {instance_count} instances died while registering concurrently",
                instance_count - contention_running
            )));
        }

        Ok(ScaleOutcome {
            namespace,
            started,
            running_after_scale_in,
            registered_keys,
            reachable_after_scale_in,
            contention_running,
            pids,
        })
    }

    /// Count the keys registered under `namespace` at `endpoint`.
    fn registered_keys(&self, endpoint: &str, namespace: &Namespace) -> HarnessResult<usize> {
        let spec = LaunchSpec::new(&self.builder.config().binaries.coordination_ctl).args([
            "--endpoints",
            endpoint,
            "get",
            namespace.as_str(),
            "--prefix",
            "--keys-only",
        ]);
        let result = self.builder.supervisor().run(spec)?;
        let keys = result
            .stdout_lossy()
            .lines()
            .filter(|line| !line.trim().is_empty())
            .count();
        debug!(%namespace, keys, "Registered keys");
        Ok(keys)
    }

    /// Number of running instances whose RPC port accepts connections.
    fn reachable_instances(&self, fleet: &mut ClusterTopology) -> usize {
        let gate = self.builder.daemon_gate();
        let mut reachable = 0;
        for position in 0..fleet.len() {
            let Some(daemon) = fleet.instance_mut(position) else {
                continue;
            };
            if !daemon.is_running() {
                continue;
            }
            match daemon.wait_reachable(&gate) {
                Ok(()) => reachable += 1,
                Err(e) => warn!(index = ?daemon.index(), error = %e, "Instance unreachable"),
            }
        }
        reachable
    }

    /// Wait for the fleet to settle.
    ///
    /// Instances whose socket already exists are waited on until they accept
    /// connections. Registration with the coordination service is not
    /// observable, so if any running instance has no socket yet, this falls
    /// back to the configured settle delay.
    pub fn settle(&self, fleet: &mut ClusterTopology) -> HarnessResult<()> {
        let gate = self.builder.daemon_gate();
        let mut unobservable = 0;
        for position in 0..fleet.len() {
            let Some(daemon) = fleet.instance_mut(position) else {
                continue;
            };
            if !daemon.is_running() {
                continue;
            }
            if daemon.ipc_socket().exists() {
                daemon.wait_ready(&gate)?;
            } else {
                unobservable += 1;
            }
        }
        if unobservable > 0 {
            let delay = self.builder.config().timing.settle_delay;
            warn!(unobservable, ?delay, "No readiness signal for some instances; sleeping");
            self.builder.supervisor().clock().sleep(delay);
        }
        Ok(())
    }
}
