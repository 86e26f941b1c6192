//! Error taxonomy for harness operations.
//!
//! Variants fall into four families:
//!
//! | Family       | Variants                                                     |
//! |--------------|--------------------------------------------------------------|
//! | Provisioning | `PortAllocation`, `ProcessStartFailed`, `ExecutableNotFound` |
//! | Readiness    | `NeverReady`, `Timeout`                                      |
//! | Test         | `ProcessFailed`, `DaemonExited`                              |
//! | Robustness   | `RobustnessFailure`                                          |

use std::path::PathBuf;
use std::time::Duration;

use crate::config::ConfigError;

/// Error type for harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Port allocation failed: {0}")]
    PortAllocation(String),

    #[error("Process failed to start: {0}")]
    ProcessStartFailed(String),

    #[error("Executable '{name}' not found (searched {search_dir} and PATH)")]
    ExecutableNotFound { name: String, search_dir: PathBuf },

    #[error("{program} exited with status {exit_code}")]
    ProcessFailed {
        program: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Process timed out after {0:?}")]
    Timeout(Duration),

    #[error("{what} never became ready within {waited:?}")]
    NeverReady { what: String, waited: Duration },

    #[error("Process '{name}' exited unexpectedly (exit code {exit_code:?})")]
    DaemonExited { name: String, exit_code: Option<i32> },

    #[error("Robustness check failed: {0}")]
    RobustnessFailure(String),

    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Exit code the runner should terminate with for this failure.
    ///
    /// A failed child propagates its own code; everything else maps to 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ProcessFailed { exit_code, .. } if *exit_code != 0 => *exit_code,
            _ => 1,
        }
    }
}

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;
