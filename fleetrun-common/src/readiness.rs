//! Readiness gate: poll a liveness probe at a fixed interval until it passes.
//!
//! The coordination service comes up within a few seconds, so a plain
//! fixed-interval loop is enough; there is no backoff. A timeout is
//! optional: with `None` the gate blocks until the probe succeeds, leaving
//! the bound to an external CI watchdog.

use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::errors::{HarnessError, HarnessResult};
use crate::process::{LaunchSpec, ManagedProcess, OutputMode, Supervisor};

/// A liveness check.
///
/// `Ok(false)` means "not yet"; `Err` aborts the wait (for example when the
/// probe executable itself is missing).
pub trait Probe {
    fn probe(&mut self) -> HarnessResult<bool>;
}

impl<F> Probe for F
where
    F: FnMut() -> bool,
{
    fn probe(&mut self) -> HarnessResult<bool> {
        Ok(self())
    }
}

/// Ready when a command exits with status 0.
pub struct CommandProbe<'a> {
    supervisor: &'a Supervisor,
    spec: LaunchSpec,
    attempt_timeout: Duration,
}

impl<'a> CommandProbe<'a> {
    pub fn new(supervisor: &'a Supervisor, spec: LaunchSpec) -> Self {
        Self {
            supervisor,
            spec: spec.output(OutputMode::Discard),
            attempt_timeout: Duration::from_secs(10),
        }
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }
}

impl Probe for CommandProbe<'_> {
    fn probe(&mut self) -> HarnessResult<bool> {
        match self
            .supervisor
            .execute(self.spec.clone(), Some(self.attempt_timeout))
        {
            Ok(result) => Ok(result.success()),
            Err(HarnessError::Timeout(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Ready when a TCP connection succeeds.
pub struct TcpProbe {
    addr: SocketAddr,
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(1),
        }
    }
}

impl Probe for TcpProbe {
    fn probe(&mut self) -> HarnessResult<bool> {
        Ok(TcpStream::connect_timeout(&self.addr, self.connect_timeout).is_ok())
    }
}

/// Ready when a Unix domain socket accepts a connection. An existing socket
/// file is not enough: it can linger after a previous daemon died.
pub struct UnixSocketProbe {
    path: PathBuf,
}

impl UnixSocketProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Probe for UnixSocketProbe {
    #[cfg(unix)]
    fn probe(&mut self) -> HarnessResult<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        match std::os::unix::net::UnixStream::connect(&self.path) {
            Ok(_) => Ok(true),
            Err(err) => {
                debug!(path = %self.path.display(), error = %err, "Socket exists but not connectable yet");
                Ok(false)
            }
        }
    }

    #[cfg(not(unix))]
    fn probe(&mut self) -> HarnessResult<bool> {
        Ok(self.path.exists())
    }
}

/// Wraps a probe so the wait aborts with [`HarnessError::DaemonExited`] as
/// soon as the supervised process is gone.
pub struct WhileRunning<'p, P> {
    process: &'p mut ManagedProcess,
    inner: P,
}

impl<'p, P> WhileRunning<'p, P> {
    pub fn new(process: &'p mut ManagedProcess, inner: P) -> Self {
        Self { process, inner }
    }
}

impl<P: Probe> Probe for WhileRunning<'_, P> {
    fn probe(&mut self) -> HarnessResult<bool> {
        self.process.ensure_running()?;
        self.inner.probe()
    }
}

/// Fixed-interval poll-until-success loop.
#[derive(Clone)]
pub struct ReadinessGate {
    interval: Duration,
    timeout: Option<Duration>,
    clock: SharedClock,
}

impl ReadinessGate {
    pub fn new(interval: Duration, timeout: Option<Duration>, clock: SharedClock) -> Self {
        Self {
            interval,
            timeout,
            clock,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Block until `probe` succeeds.
    ///
    /// The first probe runs immediately and every failure is followed by one
    /// interval of sleep, so M failures cost at least M intervals. Returns
    /// the number of failed attempts.
    pub fn wait_ready<P>(&self, what: &str, probe: &mut P) -> HarnessResult<u32>
    where
        P: Probe + ?Sized,
    {
        let start = self.clock.now();
        let mut failures: u32 = 0;
        loop {
            if probe.probe()? {
                let waited = self.clock.now().saturating_duration_since(start);
                info!(what, failures, ?waited, "Ready");
                return Ok(failures);
            }
            failures += 1;

            let waited = self.clock.now().saturating_duration_since(start);
            if let Some(limit) = self.timeout
                && waited >= limit
            {
                warn!(what, failures, ?waited, "Never became ready");
                return Err(HarnessError::NeverReady {
                    what: what.to_string(),
                    waited,
                });
            }
            debug!(what, failures, "Not ready yet; retrying");
            self.clock.sleep(self.interval);
        }
    }
}
