//! Run report: one record per test or script-suite invocation.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::HarnessResult;

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    /// Ran and exited non-zero.
    Failed,
    /// Never produced an exit status (not found, spawn failure, timeout).
    Error,
}

/// A single invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub name: String,
    pub argv: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InvocationRecord {
    pub fn new(name: impl Into<String>, argv: Vec<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            argv,
            started_at,
            duration_ms: 0,
            exit_code: None,
            outcome: Outcome::Error,
            error: None,
        }
    }

    pub fn finished(mut self, duration: Duration, exit_code: i32) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self.exit_code = Some(exit_code);
        self.outcome = if exit_code == 0 {
            Outcome::Passed
        } else {
            Outcome::Failed
        };
        self
    }

    pub fn errored(mut self, duration: Duration, error: impl ToString) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self.outcome = Outcome::Error;
        self.error = Some(error.to_string());
        self
    }
}

/// Everything that ran during one harness execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub invocations: Vec<InvocationRecord>,
}

impl Default for RunReport {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            invocations: Vec::new(),
        }
    }
}

impl RunReport {
    pub fn passed(&self) -> usize {
        self.count(Outcome::Passed)
    }

    pub fn failed(&self) -> usize {
        self.invocations.len() - self.passed()
    }

    fn count(&self, outcome: Outcome) -> usize {
        self.invocations
            .iter()
            .filter(|r| r.outcome == outcome)
            .count()
    }

    /// First invocation that did not pass.
    pub fn first_failure(&self) -> Option<&InvocationRecord> {
        self.invocations
            .iter()
            .find(|r| r.outcome != Outcome::Passed)
    }

    pub fn write_json(&self, path: &Path) -> HarnessResult<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// Shared, append-only handle to a [`RunReport`].
#[derive(Debug, Clone, Default)]
pub struct ReportSink {
    inner: Arc<Mutex<RunReport>>,
}

impl ReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: InvocationRecord) {
        if let Ok(mut report) = self.inner.lock() {
            report.invocations.push(record);
        }
    }

    /// Copy of the report, stamped with the current time as finish time.
    pub fn finish(&self) -> RunReport {
        let mut report = self
            .inner
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default();
        report.finished_at = Some(Utc::now());
        report
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|r| r.invocations.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
