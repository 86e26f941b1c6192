//! End-to-end checks against real `etcd`, `etcdctl` and `vineyardd`.
//!
//! Ignored by default. Point `FLEETRUN_PROJECT_ROOT` (or
//! `FLEETRUN_EXECUTABLE_DIR`) at a checkout with a build tree and run with
//! `--ignored`.

mod common;

use std::net::SocketAddr;

use common::init_test_logging;
use fleetrun_common::{
    DaemonOptions, Environment, HarnessConfig, Namespace, ReadyMode, ReportSink, ScenarioRunner, Supervisor,
    TestDriver, TopologyBuilder, check_malformed_input, garbage_payloads,
};

fn runner() -> (HarnessConfig, ScenarioRunner) {
    init_test_logging();
    let env = Environment::capture();
    let config = HarnessConfig::load(&env, None).expect("configuration");
    let supervisor = Supervisor::new(&config, &env);
    let driver = TestDriver::new(&config, supervisor.clone(), Vec::new(), ReportSink::new());
    let builder = TopologyBuilder::new(config.clone(), supervisor);
    (config, ScenarioRunner::new(builder, driver))
}

#[test]
#[ignore = "requires etcd and vineyardd"]
fn e2e_cluster_comes_up_and_goes_away() {
    let (config, runner) = runner();
    let mut cluster = runner
        .builder()
        .start_cluster(
            Namespace::time_salted("fleetrun_e2e"),
            3,
            config.daemon.fleet_member_size,
            ReadyMode::Wait,
        )
        .unwrap();

    assert_eq!(cluster.running_instances(), 3);
    for daemon in cluster.instances() {
        assert!(daemon.ipc_socket().exists());
    }
    let sockets: Vec<_> = cluster
        .instances()
        .iter()
        .map(|d| d.ipc_socket().to_path_buf())
        .collect();
    cluster.release();
    assert_eq!(runner.builder().ports().outstanding(), 0);
    for socket in sockets {
        assert!(!socket.exists() || std::os::unix::net::UnixStream::connect(&socket).is_err());
    }
}

#[test]
#[ignore = "requires etcd and vineyardd"]
fn e2e_scale_in_out() {
    let (_, runner) = runner();
    let outcome = runner
        .with_coordination(|c| runner.scale_in_out(c.endpoint(), 4, ReadyMode::Wait))
        .unwrap();
    assert_eq!(outcome.running_after_scale_in, 4);
    assert!(outcome.registered_keys > 0);
    assert_eq!(outcome.reachable_after_scale_in, 4);
    assert_eq!(outcome.contention_running, 4);
}

#[test]
#[ignore = "requires vineyardd"]
fn e2e_daemon_survives_malformed_input() {
    let (config, runner) = runner();
    let builder = runner.builder();
    let unstarted = builder.ports().allocate().unwrap();
    let options = DaemonOptions::new(
        format!("http://localhost:{unstarted}"),
        Namespace::time_salted("fleetrun_e2e"),
        config.daemon.size,
    );
    let mut daemon = builder.start_storage_daemon(&options).unwrap();

    let addr = SocketAddr::from(([127, 0, 0, 1], daemon.rpc_port()));
    let clock = runner.builder().supervisor().clock().clone();
    let grace = config.timing.quiesce_delay;
    let sent = check_malformed_input(addr, clock.as_ref(), grace, || daemon.ensure_running()).unwrap();
    assert_eq!(sent, garbage_payloads().len());
    assert!(daemon.is_running());
}
