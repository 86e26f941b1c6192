//! TCP port allocation for service endpoints.
//!
//! A port is obtained by binding a transient listener to port 0 and reading
//! back what the OS assigned. The listener is released before the port is
//! handed out, so the consumer must bind it promptly; nothing here retries a
//! consumer-side bind failure.

use std::collections::HashSet;
use std::fmt;
use std::net::TcpListener;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::debug;

use crate::errors::{HarnessError, HarnessResult};

const MAX_ATTEMPTS: usize = 64;

#[derive(Debug, Default)]
struct PortBook {
    /// Every port handed out during this run.
    issued: HashSet<u16>,
    /// Ports whose lease is still alive.
    outstanding: HashSet<u16>,
}

/// Hands out OS-assigned ports, never the same one twice within a run.
#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    book: Arc<Mutex<PortBook>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide allocator shared by every topology in this run.
    pub fn global() -> &'static PortAllocator {
        static GLOBAL: OnceLock<PortAllocator> = OnceLock::new();
        GLOBAL.get_or_init(PortAllocator::new)
    }

    /// Allocate a port that is unbound at the moment of the call.
    pub fn allocate(&self) -> HarnessResult<PortLease> {
        for _ in 0..MAX_ATTEMPTS {
            let port = probe_free_port()?;
            let mut book = self.book.lock().unwrap();
            if !book.issued.insert(port) {
                debug!(port, "OS reassigned an already issued port; probing again");
                continue;
            }
            book.outstanding.insert(port);
            debug!(port, "Allocated port");
            return Ok(PortLease {
                port,
                book: Arc::clone(&self.book),
            });
        }
        Err(HarnessError::PortAllocation(format!(
            "no unused port after {MAX_ATTEMPTS} attempts"
        )))
    }

    /// Burn `count` ports so that nearby numbers are not handed out next.
    pub fn skip(&self, count: usize) -> HarnessResult<()> {
        for _ in 0..count {
            self.allocate()?;
        }
        Ok(())
    }

    /// Number of leases currently alive.
    pub fn outstanding(&self) -> usize {
        self.book.lock().unwrap().outstanding.len()
    }

    /// Number of ports issued since the allocator was created.
    pub fn issued(&self) -> usize {
        self.book.lock().unwrap().issued.len()
    }
}

/// Allocate a port from the process-wide allocator.
pub fn allocate_port() -> HarnessResult<PortLease> {
    PortAllocator::global().allocate()
}

fn probe_free_port() -> HarnessResult<u16> {
    let listener = TcpListener::bind("0.0.0.0:0")
        .map_err(|e| HarnessError::PortAllocation(format!("bind to port 0 failed: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| HarnessError::PortAllocation(format!("local_addr failed: {e}")))?
        .port();
    drop(listener);
    Ok(port)
}

/// An allocated port. Dropping it marks the port as no longer outstanding;
/// the number is still never reissued during this run.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    book: Arc<Mutex<PortBook>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for PortLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.port)
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if let Ok(mut book) = self.book.lock() {
            book.outstanding.remove(&self.port);
        }
    }
}
