//! Cluster topologies: one coordination service plus a fleet of storage
//! daemons sharing its endpoint and a namespace prefix.
//!
//! Every handle here is a scoped acquisition. Dropping a
//! [`ClusterTopology`] stops its instances newest-first and then the
//! coordination service, releasing their ports along the way.

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::errors::{HarnessError, HarnessResult};
use crate::ports::{PortAllocator, PortLease};
use crate::process::{LaunchSpec, ManagedProcess, ProcessState, ShutdownReport, Supervisor};
use crate::readiness::{CommandProbe, ReadinessGate, TcpProbe, UnixSocketProbe, WhileRunning};

/// Wall-clock salt, `<unix seconds>.<microseconds>`, used to keep data
/// directories, sockets and namespaces of concurrent runs apart.
pub fn time_salt() -> String {
    let now = Utc::now();
    format!("{}.{:06}", now.timestamp(), now.timestamp_subsec_micros())
}

/// Socket base for fleets that should not share the single-daemon socket.
pub fn fleet_socket_base() -> PathBuf {
    std::env::temp_dir().join(format!("fleetrun.ci.dist.{}", time_salt()))
}

/// IPC socket of an instance: `base` alone, or `base.<index>` inside a fleet.
pub fn ipc_socket_path(base: &Path, index: Option<usize>) -> PathBuf {
    match index {
        Some(index) => {
            let mut path = OsString::from(base.as_os_str());
            path.push(format!(".{index}"));
            PathBuf::from(path)
        }
        None => base.to_path_buf(),
    }
}

/// Prefix scoping one topology's keys inside the coordination service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// `<prefix>_<time salt>`.
    pub fn time_salted(prefix: &str) -> Self {
        Self(format!("{prefix}_{}", time_salt()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Spill directory and utilization thresholds for a storage daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct SpillConfig {
    pub path: PathBuf,
    pub lower_rate: f64,
    pub upper_rate: f64,
}

impl SpillConfig {
    /// Rates are fractions with `0 <= lower < upper <= 1`.
    pub fn new(path: impl Into<PathBuf>, lower_rate: f64, upper_rate: f64) -> HarnessResult<Self> {
        let in_range = |rate: f64| (0.0..=1.0).contains(&rate);
        if !in_range(lower_rate) || !in_range(upper_rate) || lower_rate >= upper_rate {
            return Err(HarnessError::InvalidTopology(format!(
                "spill rates must satisfy 0 <= lower < upper <= 1 (got {lower_rate}, {upper_rate})"
            )));
        }
        Ok(Self {
            path: path.into(),
            lower_rate,
            upper_rate,
        })
    }
}

/// Whether starting a daemon blocks until its IPC socket accepts
/// connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadyMode {
    #[default]
    Wait,
    /// Return right after spawning; instances may still be registering.
    NoWait,
}

/// How to launch one storage daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonOptions {
    pub endpoint: String,
    pub namespace: Namespace,
    pub size: u64,
    pub index: Option<usize>,
    pub spill: Option<SpillConfig>,
    pub ready: ReadyMode,
    /// Socket base; the configured default when `None`.
    pub ipc_base: Option<PathBuf>,
}

impl DaemonOptions {
    pub fn new(endpoint: impl Into<String>, namespace: Namespace, size: u64) -> Self {
        Self {
            endpoint: endpoint.into(),
            namespace,
            size,
            index: None,
            spill: None,
            ready: ReadyMode::Wait,
            ipc_base: None,
        }
    }

    pub fn index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn spill(mut self, spill: SpillConfig) -> Self {
        self.spill = Some(spill);
        self
    }

    pub fn ready(mut self, ready: ReadyMode) -> Self {
        self.ready = ready;
        self
    }

    pub fn ipc_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.ipc_base = Some(base.into());
        self
    }
}

/// A running coordination service. Dropping it stops the process and
/// removes its data directory.
#[derive(Debug)]
pub struct CoordinationService {
    process: ManagedProcess,
    endpoint: String,
    data_dir: PathBuf,
    client_port: PortLease,
    peer_port: PortLease,
}

impl CoordinationService {
    /// Client endpoint, `http://127.0.0.1:<client port>`.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn client_port(&self) -> u16 {
        self.client_port.port()
    }

    pub fn peer_port(&self) -> u16 {
        self.peer_port.port()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn is_running(&mut self) -> bool {
        self.process.is_running()
    }
}

impl Drop for CoordinationService {
    fn drop(&mut self) {
        if let Err(e) = self.process.terminate() {
            warn!(endpoint = %self.endpoint, error = %e, "Failed to stop coordination service");
        }
        if self.data_dir.exists()
            && let Err(e) = fs::remove_dir_all(&self.data_dir)
        {
            warn!(dir = %self.data_dir.display(), error = %e, "Failed to remove coordination data dir");
        }
    }
}

/// A running storage daemon.
#[derive(Debug)]
pub struct StorageDaemon {
    // Declared first so the process stops before its port lease is released.
    process: ManagedProcess,
    index: Option<usize>,
    ipc_socket: PathBuf,
    rpc_port: PortLease,
    endpoint: String,
    namespace: Namespace,
}

impl StorageDaemon {
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn ipc_socket(&self) -> &Path {
        &self.ipc_socket
    }

    pub fn rpc_port(&self) -> u16 {
        self.rpc_port.port()
    }

    /// `127.0.0.1:<rpc port>`, the form RPC tests take as an argument.
    pub fn rpc_address(&self) -> String {
        format!("127.0.0.1:{}", self.rpc_port.port())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn state(&mut self) -> ProcessState {
        self.process.state()
    }

    pub fn is_running(&mut self) -> bool {
        self.process.is_running()
    }

    pub fn ensure_running(&mut self) -> HarnessResult<()> {
        self.process.ensure_running()
    }

    pub fn terminate(&mut self) -> HarnessResult<ShutdownReport> {
        self.process.terminate()
    }

    /// Block until the IPC socket accepts connections.
    pub fn wait_ready(&mut self, gate: &ReadinessGate) -> HarnessResult<()> {
        let what = format!("storage daemon at {}", self.ipc_socket.display());
        let mut probe = WhileRunning::new(
            &mut self.process,
            UnixSocketProbe::new(self.ipc_socket.clone()),
        );
        gate.wait_ready(&what, &mut probe)?;
        Ok(())
    }

    /// Block until the RPC port accepts connections.
    pub fn wait_reachable(&mut self, gate: &ReadinessGate) -> HarnessResult<()> {
        let addr = SocketAddr::from(([127, 0, 0, 1], self.rpc_port()));
        let what = format!("storage daemon RPC at {addr}");
        let mut probe = WhileRunning::new(&mut self.process, TcpProbe::new(addr));
        gate.wait_ready(&what, &mut probe)?;
        Ok(())
    }
}

/// Launches coordination services, storage daemons and fleets.
#[derive(Clone)]
pub struct TopologyBuilder {
    config: HarnessConfig,
    supervisor: Supervisor,
    ports: PortAllocator,
}

impl TopologyBuilder {
    pub fn new(config: HarnessConfig, supervisor: Supervisor) -> Self {
        Self {
            config,
            supervisor,
            ports: PortAllocator::global().clone(),
        }
    }

    pub fn with_ports(mut self, ports: PortAllocator) -> Self {
        self.ports = ports;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    fn gate(&self, timeout: Option<std::time::Duration>) -> ReadinessGate {
        ReadinessGate::new(
            self.config.timing.ready_interval,
            timeout,
            self.supervisor.clock().clone(),
        )
    }

    /// Daemon readiness gate, also used by scenarios to settle a fleet.
    pub fn daemon_gate(&self) -> ReadinessGate {
        self.gate(self.config.timing.daemon_ready_timeout)
    }

    /// Launch a single-member coordination service and wait until it
    /// answers a key lookup.
    pub fn start_coordination_service(&self) -> HarnessResult<CoordinationService> {
        let client_port = self.ports.allocate()?;
        let peer_port = self.ports.allocate()?;
        let data_dir = scratch_root().join(format!("etcd-{}", time_salt()));
        let peer_url = |host: &str| format!("http://{host}:{peer_port}");
        let client_url = |host: &str| format!("http://{host}:{client_port}");
        let endpoint = client_url("127.0.0.1");

        let spec = LaunchSpec::new(&self.config.binaries.coordination)
            .arg("--data-dir")
            .arg(&data_dir)
            .arg("--listen-peer-urls")
            .arg(peer_url("0.0.0.0"))
            .arg("--listen-client-urls")
            .arg(client_url("0.0.0.0"))
            .arg("--advertise-client-urls")
            .arg(&endpoint)
            .arg("--initial-cluster")
            .arg(format!("default={}", peer_url("127.0.0.1")))
            .arg("--initial-advertise-peer-urls")
            .arg(peer_url("127.0.0.1"));

        let name = format!("{}-{}", self.config.binaries.coordination, client_port);
        let process = self.supervisor.start(&name, spec)?;
        let mut service = CoordinationService {
            process,
            endpoint,
            data_dir,
            client_port,
            peer_port,
        };

        let probe_spec = LaunchSpec::new(&self.config.binaries.coordination_ctl).args([
            "--endpoints",
            service.endpoint.as_str(),
            "get",
            "",
            "--prefix",
            "--limit",
            "1",
        ]);
        let mut probe = WhileRunning::new(
            &mut service.process,
            CommandProbe::new(&self.supervisor, probe_spec),
        );
        self.gate(self.config.timing.coordination_ready_timeout)
            .wait_ready("coordination service", &mut probe)?;

        info!(endpoint = %service.endpoint, "Coordination service ready");
        Ok(service)
    }

    /// Launch one storage daemon registered under `options.namespace`.
    pub fn start_storage_daemon(&self, options: &DaemonOptions) -> HarnessResult<StorageDaemon> {
        let base = options
            .ipc_base
            .as_deref()
            .unwrap_or(&self.config.ipc_socket_base);
        let ipc_socket = ipc_socket_path(base, options.index);
        let spill = match &options.spill {
            Some(spill) => spill.clone(),
            None => SpillConfig::new(
                PathBuf::new(),
                self.config.daemon.spill_lower_rate,
                self.config.daemon.spill_upper_rate,
            )?,
        };
        if ipc_socket.exists() {
            debug!(socket = %ipc_socket.display(), "Removing stale IPC socket");
            fs::remove_file(&ipc_socket)?;
        }

        let rpc_port = self.ports.allocate()?;
        let spec = LaunchSpec::new(&self.config.binaries.storage_daemon)
            .args(["--size".to_string(), options.size.to_string()])
            .arg("--socket")
            .arg(&ipc_socket)
            .args(["--rpc_socket_port".to_string(), rpc_port.to_string()])
            .args(["--etcd_endpoint", options.endpoint.as_str()])
            .args(["--etcd_prefix", options.namespace.as_str()])
            .arg("--spill_path")
            .arg(&spill.path)
            .args([
                "--spill_lower_rate".to_string(),
                spill.lower_rate.to_string(),
                "--spill_upper_rate".to_string(),
                spill.upper_rate.to_string(),
            ]);

        let name = format!("{}-{}", self.config.binaries.storage_daemon, rpc_port);
        let process = self.supervisor.start(&name, spec)?;
        let mut daemon = StorageDaemon {
            process,
            index: options.index,
            ipc_socket,
            rpc_port,
            endpoint: options.endpoint.clone(),
            namespace: options.namespace.clone(),
        };

        if options.ready == ReadyMode::Wait {
            daemon.wait_ready(&self.daemon_gate())?;
        }
        info!(
            index = ?daemon.index,
            socket = %daemon.ipc_socket.display(),
            rpc_port = daemon.rpc_port(),
            namespace = %daemon.namespace,
            "Storage daemon started"
        );
        Ok(daemon)
    }

    /// Start `count` daemons at indices `0..count` sharing one namespace.
    ///
    /// `template.index` is ignored. If any member fails to start, the ones
    /// already running are released newest-first before the error returns.
    pub fn start_fleet(&self, template: &DaemonOptions, count: usize) -> HarnessResult<ClusterTopology> {
        if count == 0 {
            return Err(HarnessError::InvalidTopology(
                "a fleet needs at least one instance".to_string(),
            ));
        }
        let mut topology = ClusterTopology::new(self.clone(), template.clone());
        for _ in 0..count {
            topology.add_instance()?;
        }
        info!(
            count,
            namespace = %topology.namespace(),
            endpoint = %topology.endpoint(),
            "Fleet started"
        );
        Ok(topology)
    }

    /// Start a coordination service and a fleet registered with it.
    pub fn start_cluster(
        &self,
        namespace: Namespace,
        count: usize,
        size: u64,
        ready: ReadyMode,
    ) -> HarnessResult<ClusterTopology> {
        let coordination = self.start_coordination_service()?;
        let template = DaemonOptions::new(coordination.endpoint(), namespace, size).ready(ready);
        let mut topology = self.start_fleet(&template, count)?;
        topology.coordination = Some(coordination);
        Ok(topology)
    }
}

/// Storage daemon instances plus the optional coordination service they
/// share.
///
/// Every instance uses the same endpoint and namespace and IPC sockets are
/// pairwise distinct; both are checked on insertion.
pub struct ClusterTopology {
    builder: TopologyBuilder,
    template: DaemonOptions,
    instances: Vec<StorageDaemon>,
    coordination: Option<CoordinationService>,
    next_index: usize,
}

impl ClusterTopology {
    /// An empty topology whose instances are launched from `template`.
    pub fn new(builder: TopologyBuilder, template: DaemonOptions) -> Self {
        Self {
            builder,
            template,
            instances: Vec::new(),
            coordination: None,
            next_index: 0,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.template.endpoint
    }

    pub fn namespace(&self) -> &Namespace {
        &self.template.namespace
    }

    pub fn coordination(&self) -> Option<&CoordinationService> {
        self.coordination.as_ref()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> &[StorageDaemon] {
        &self.instances
    }

    pub fn instance_mut(&mut self, position: usize) -> Option<&mut StorageDaemon> {
        self.instances.get_mut(position)
    }

    /// Launch one more instance at the next free index.
    pub fn add_instance(&mut self) -> HarnessResult<&mut StorageDaemon> {
        let options = self.template.clone().index(self.next_index);
        let base = options
            .ipc_base
            .clone()
            .unwrap_or_else(|| self.builder.config().ipc_socket_base.clone());
        self.check_socket_free(&ipc_socket_path(&base, options.index))?;

        let daemon = self.builder.start_storage_daemon(&options)?;
        self.insert(daemon)
    }

    /// Adopt a daemon started elsewhere.
    pub fn insert(&mut self, daemon: StorageDaemon) -> HarnessResult<&mut StorageDaemon> {
        if daemon.endpoint != self.template.endpoint || daemon.namespace != self.template.namespace {
            return Err(HarnessError::InvalidTopology(format!(
                "instance registered at {} under {} does not belong to {} under {}",
                daemon.endpoint, daemon.namespace, self.template.endpoint, self.template.namespace
            )));
        }
        self.check_socket_free(&daemon.ipc_socket)?;
        if let Some(index) = daemon.index {
            self.next_index = self.next_index.max(index + 1);
        }
        self.instances.push(daemon);
        let last = self.instances.len() - 1;
        Ok(&mut self.instances[last])
    }

    fn check_socket_free(&self, socket: &Path) -> HarnessResult<()> {
        if self.instances.iter().any(|d| d.ipc_socket == socket) {
            return Err(HarnessError::InvalidTopology(format!(
                "IPC socket {} is already used in this topology",
                socket.display()
            )));
        }
        Ok(())
    }

    /// Stop the instance at `position` (start order). It stays in the
    /// topology in the terminated state.
    pub fn terminate_instance(&mut self, position: usize) -> HarnessResult<ShutdownReport> {
        let count = self.instances.len();
        let daemon = self.instances.get_mut(position).ok_or_else(|| {
            HarnessError::InvalidTopology(format!(
                "no instance at position {position} (topology has {count})"
            ))
        })?;
        info!(index = ?daemon.index, pid = daemon.pid(), "Terminating instance");
        daemon.terminate()
    }

    /// Comma-joined IPC sockets in start order.
    pub fn ipc_sockets(&self) -> String {
        self.instances
            .iter()
            .map(|d| d.ipc_socket.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn rpc_ports(&self) -> Vec<u16> {
        self.instances.iter().map(StorageDaemon::rpc_port).collect()
    }

    /// Number of instances whose process is still alive.
    pub fn running_instances(&mut self) -> usize {
        let mut running = 0;
        for daemon in &mut self.instances {
            if daemon.is_running() {
                running += 1;
            }
        }
        running
    }

    /// Stop everything now, newest instance first, then the coordination
    /// service.
    pub fn release(mut self) {
        self.release_all();
    }

    fn release_all(&mut self) {
        if !self.instances.is_empty() {
            debug!(count = self.instances.len(), namespace = %self.template.namespace, "Releasing fleet");
        }
        while let Some(daemon) = self.instances.pop() {
            drop(daemon);
        }
        self.coordination.take();
    }
}

impl fmt::Debug for ClusterTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterTopology")
            .field("endpoint", &self.template.endpoint)
            .field("namespace", &self.template.namespace)
            .field("instances", &self.instances)
            .field("coordination", &self.coordination)
            .finish()
    }
}

impl Drop for ClusterTopology {
    fn drop(&mut self) {
        self.release_all();
    }
}

fn scratch_root() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if cfg!(target_os = "linux") && shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}
