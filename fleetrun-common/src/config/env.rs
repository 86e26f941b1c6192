//! Environment variable parsing with type safety.
//!
//! Reads `FLEETRUN_*` variables from an explicit [`Environment`] rather
//! than the process environment, collecting errors so every bad value is
//! reported at once.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::envvars::Environment;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Value out of valid range.
    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },
}

/// Where a configuration value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Default,
    Environment(String),
}

/// A value tagged with its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> Sourced<T> {
    pub fn from_env(value: T, var: String) -> Self {
        Self {
            value,
            source: ConfigSource::Environment(var),
        }
    }

    pub fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
        }
    }

    pub fn is_from_env(&self) -> bool {
        matches!(self.source, ConfigSource::Environment(_))
    }
}

/// Type-safe environment variable parser.
pub struct EnvParser<'a> {
    env: &'a Environment,
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl<'a> EnvParser<'a> {
    /// Create a new parser with the FLEETRUN_ prefix.
    pub fn new(env: &'a Environment) -> Self {
        Self {
            env,
            prefix: "FLEETRUN_",
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn lookup(&self, var_name: &str) -> Option<String> {
        self.env.get_string(var_name)
    }

    /// Get an optional path; empty values count as unset.
    pub fn get_optional_path(&mut self, name: &str) -> Sourced<Option<PathBuf>> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some(value) if !value.trim().is_empty() => {
                Sourced::from_env(Some(PathBuf::from(value.trim())), var_name)
            }
            _ => Sourced::default_value(None),
        }
    }

    /// Get a u64 value with default and range validation.
    pub fn get_u64_range(&mut self, name: &str, default: u64, min: u64, max: u64) -> Sourced<u64> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some(value) => match value.trim().parse::<u64>() {
                Ok(n) if n >= min && n <= max => Sourced::from_env(n, var_name),
                Ok(n) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: var_name.clone(),
                        value: n.to_string(),
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    Sourced::from_env(default, var_name)
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name.clone(),
                        expected: "unsigned 64-bit integer".to_string(),
                        value,
                    });
                    Sourced::default_value(default)
                }
            },
            None => Sourced::default_value(default),
        }
    }

    /// Get a duration expressed in milliseconds.
    pub fn get_duration_ms(&mut self, name: &str, default: Duration, max: Duration) -> Sourced<Duration> {
        let parsed = self.get_u64_range(
            name,
            default.as_millis() as u64,
            0,
            max.as_millis() as u64,
        );
        Sourced {
            value: Duration::from_millis(parsed.value),
            source: parsed.source,
        }
    }

    /// Get an optional duration in seconds where `0` means "no limit".
    pub fn get_limit_secs(
        &mut self,
        name: &str,
        default: Option<Duration>,
        max_secs: u64,
    ) -> Sourced<Option<Duration>> {
        let default_secs = default.map(|d| d.as_secs()).unwrap_or(0);
        let parsed = self.get_u64_range(name, default_secs, 0, max_secs);
        let value = if !parsed.is_from_env() {
            default
        } else if parsed.value == 0 {
            None
        } else {
            Some(Duration::from_secs(parsed.value))
        };
        Sourced {
            value,
            source: parsed.source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(vars: &[(&str, &str)]) -> Environment {
        Environment::from_vars(vars.iter().copied())
    }

    #[test]
    fn optional_path_reads_prefixed_variable() {
        let env = env(&[("FLEETRUN_EXECUTABLE_DIR", "/opt/build/bin")]);
        let mut parser = EnvParser::new(&env);
        let dir = parser.get_optional_path("EXECUTABLE_DIR");
        assert_eq!(dir.value, Some(PathBuf::from("/opt/build/bin")));
        assert_eq!(
            dir.source,
            ConfigSource::Environment("FLEETRUN_EXECUTABLE_DIR".to_string())
        );
    }

    #[test]
    fn empty_path_counts_as_unset() {
        let env = env(&[("FLEETRUN_DATA_DIR", "  ")]);
        let mut parser = EnvParser::new(&env);
        assert_eq!(parser.get_optional_path("DATA_DIR").value, None);
        assert!(!parser.has_errors());
    }

    #[test]
    fn u64_out_of_range_uses_default_and_records_error() {
        let env = env(&[("FLEETRUN_QUIESCE_MS", "999999999")]);
        let mut parser = EnvParser::new(&env);
        let value = parser.get_duration_ms(
            "QUIESCE_MS",
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
        assert_eq!(value.value, Duration::from_secs(1));
        assert!(matches!(parser.errors(), [EnvError::OutOfRange { .. }]));
    }

    #[test]
    fn u64_garbage_records_invalid_value() {
        let env = env(&[("FLEETRUN_SETTLE_MS", "soon")]);
        let mut parser = EnvParser::new(&env);
        let value = parser.get_u64_range("SETTLE_MS", 5000, 0, 60_000);
        assert_eq!(value.value, 5000);
        assert_eq!(parser.take_errors().len(), 1);
        assert!(!parser.has_errors());
    }

    #[test]
    fn limit_zero_means_unbounded() {
        let env = env(&[("FLEETRUN_READY_TIMEOUT_SECS", "0")]);
        let mut parser = EnvParser::new(&env);
        let limit =
            parser.get_limit_secs("READY_TIMEOUT_SECS", Some(Duration::from_secs(120)), 3600);
        assert_eq!(limit.value, None);
    }

    #[test]
    fn limit_unset_keeps_default() {
        let env = Environment::empty();
        let mut parser = EnvParser::new(&env);
        let limit =
            parser.get_limit_secs("READY_TIMEOUT_SECS", Some(Duration::from_secs(120)), 3600);
        assert_eq!(limit.value, Some(Duration::from_secs(120)));
        assert!(!limit.is_from_env());
    }
}
