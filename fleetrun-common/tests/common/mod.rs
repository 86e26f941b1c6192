#![allow(dead_code)]

use std::ffi::OsString;
use std::fs;
use std::io;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use fleetrun_common::{
    Environment, HarnessConfig, ManualClock, PortAllocator, ReportSink, ScenarioRunner,
    Supervisor, TestDriver, TopologyBuilder,
};
use tempfile::TempDir;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_line_number(true),
            )
            .with(filter)
            .init();
    });
}

/// Daemon stand-in: records `<pid> <args>` and sleeps until stopped.
pub const FAKE_DAEMON: &str = r#"echo "$$ $*" >> "$FAKE_ARGS"
exec sleep 60"#;

/// Coordination service stand-in: creates its data directory and idles.
pub const FAKE_ETCD: &str = r#"mkdir -p "$2"
exec sleep 60"#;

/// Coordination client stand-in. Lookups succeed; key listings are logged
/// and answer with `$CTL_KEYS` keys under the requested namespace, which
/// must carry the harness prefix.
pub const FAKE_ETCDCTL: &str = r#"case "$*" in
*--keys-only*)
    echo "$*" >> "$CTL_LOG"
    case "$4" in fleetrun_test_*) ;; *) exit 1 ;; esac
    i=0
    while [ "$i" -lt "${CTL_KEYS:-2}" ]; do
        echo "$4/instances/$i"
        i=$((i + 1))
    done
    ;;
esac
exit 0"#;

/// A scratch build tree with stand-in executables and a virtual clock.
pub struct Sandbox {
    pub dir: TempDir,
    pub config: HarnessConfig,
    pub clock: Arc<ManualClock>,
    pub ports: PortAllocator,
    vars: Vec<(OsString, OsString)>,
}

impl Sandbox {
    pub fn new() -> Self {
        init_test_logging();
        let dir = tempfile::tempdir().unwrap();
        let mut config = HarnessConfig::new(dir.path());
        config.executable_dir = dir.path().join("bin");
        config.log_dir = dir.path().join("logs");
        config.ipc_socket_base = dir.path().join("ci.sock");
        config.daemon.size = 4096;
        config.daemon.fleet_member_size = 1024;
        fs::create_dir_all(&config.executable_dir).unwrap();

        let vars = vec![
            (
                OsString::from("PATH"),
                std::env::var_os("PATH").unwrap_or_default(),
            ),
            (
                OsString::from("FAKE_ARGS"),
                dir.path().join("args.log").into_os_string(),
            ),
            (
                OsString::from("CTL_LOG"),
                dir.path().join("ctl.log").into_os_string(),
            ),
        ];
        Self {
            dir,
            config,
            clock: Arc::new(ManualClock::new()),
            ports: PortAllocator::new(),
            vars,
        }
    }

    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.config.executable_dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn set_var(&mut self, name: &str, value: impl Into<OsString>) {
        self.vars.push((name.into(), value.into()));
    }

    pub fn environment(&self) -> Environment {
        Environment::from_vars(self.vars.iter().cloned())
    }

    pub fn supervisor(&self) -> Supervisor {
        Supervisor::new(&self.config, &self.environment()).with_clock(self.clock.clone())
    }

    pub fn builder(&self) -> TopologyBuilder {
        TopologyBuilder::new(self.config.clone(), self.supervisor()).with_ports(self.ports.clone())
    }

    pub fn runner(&self) -> ScenarioRunner {
        self.runner_with_filters(&[])
    }

    pub fn runner_with_filters(&self, filters: &[&str]) -> ScenarioRunner {
        let filters = filters.iter().map(|f| f.to_string()).collect();
        let driver = TestDriver::new(&self.config, self.supervisor(), filters, ReportSink::new());
        ScenarioRunner::new(self.builder(), driver)
    }

    /// Serve the network side of every stand-in daemon launched from now on.
    pub fn serve_daemon_endpoints(&self) -> DaemonEndpoints {
        DaemonEndpoints::start(self.path("args.log"), Some(self.dir.path().to_path_buf()))
    }

    /// Like [`Sandbox::serve_daemon_endpoints`], but IPC sockets never appear.
    pub fn serve_rpc_ports(&self) -> DaemonEndpoints {
        DaemonEndpoints::start(self.path("args.log"), None)
    }

    /// `(pid, args)` for every stand-in daemon started so far.
    pub fn launches(&self) -> Vec<(u32, String)> {
        let log = fs::read_to_string(self.path("args.log")).unwrap_or_default();
        log.lines()
            .filter_map(|line| {
                let (pid, args) = line.split_once(' ')?;
                Some((pid.parse().ok()?, args.to_string()))
            })
            .collect()
    }

    /// Poll real time until `n` launches are recorded.
    pub fn wait_for_launches(&self, n: usize) -> Vec<(u32, String)> {
        let start = std::time::Instant::now();
        loop {
            let launches = self.launches();
            if launches.len() >= n {
                return launches;
            }
            assert!(
                start.elapsed() < Duration::from_secs(10),
                "expected {n} launches, saw {}",
                launches.len()
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Binds the RPC port of each recorded daemon launch, and its IPC socket
/// when that lives under `root`, draining whatever connects.
pub struct DaemonEndpoints {
    stop: Arc<AtomicBool>,
    rpc_connections: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl DaemonEndpoints {
    fn start(log: PathBuf, root: Option<PathBuf>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let rpc_connections = Arc::new(AtomicUsize::new(0));
        let handle = {
            let stop = Arc::clone(&stop);
            let rpc_connections = Arc::clone(&rpc_connections);
            thread::spawn(move || {
                let mut seen = 0;
                while !stop.load(Ordering::SeqCst) {
                    let contents = fs::read_to_string(&log).unwrap_or_default();
                    let complete: Vec<&str> = contents
                        .split_inclusive('\n')
                        .filter(|line| line.ends_with('\n'))
                        .collect();
                    for line in &complete[seen.min(complete.len())..] {
                        serve_launch(line.trim_end(), root.as_deref(), &rpc_connections);
                    }
                    seen = complete.len();
                    thread::sleep(Duration::from_millis(2));
                }
            })
        };
        Self {
            stop,
            rpc_connections,
            handle: Some(handle),
        }
    }

    /// Connections accepted on RPC ports so far.
    pub fn rpc_connections(&self) -> usize {
        self.rpc_connections.load(Ordering::SeqCst)
    }

    /// Poll real time until at least `n` RPC connections were accepted.
    pub fn wait_for_rpc_connections(&self, n: usize) -> usize {
        let start = std::time::Instant::now();
        while self.rpc_connections() < n && start.elapsed() < Duration::from_secs(10) {
            thread::sleep(Duration::from_millis(10));
        }
        self.rpc_connections()
    }
}

impl Drop for DaemonEndpoints {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve_launch(line: &str, root: Option<&Path>, rpc_connections: &Arc<AtomicUsize>) {
    if let Some(port) = flag_value(line, "--rpc_socket_port").and_then(|p| p.parse::<u16>().ok())
        && let Ok(listener) = TcpListener::bind(("127.0.0.1", port))
    {
        let counter = Arc::clone(rpc_connections);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = io::copy(&mut stream, &mut io::sink());
            }
        });
    }
    if let Some(root) = root
        && let Some(socket) = flag_value(line, "--socket").map(PathBuf::from)
        && socket.starts_with(root)
        && let Ok(listener) = UnixListener::bind(&socket)
    {
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let _ = io::copy(&mut stream, &mut io::sink());
            }
        });
    }
}

pub fn pid_alive(pid: u32) -> bool {
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Value following `flag` in a recorded argument line.
pub fn flag_value<'a>(args: &'a str, flag: &str) -> Option<&'a str> {
    let mut words = args.split(' ');
    words.find(|w| *w == flag)?;
    words.next()
}

pub fn exists(path: &Path) -> bool {
    path.exists()
}
