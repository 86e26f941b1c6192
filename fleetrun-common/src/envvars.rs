//! Scoped environment overrides.
//!
//! The harness never mutates the process-wide environment. Instead it
//! captures an [`Environment`] once and hands it to every launch. Overrides
//! are applied through [`Environment::with_env`], which returns an
//! [`EnvGuard`] that restores the prior values when dropped. Guards deref to
//! the environment, so nesting looks like:
//!
//! ```ignore
//! let mut env = Environment::capture();
//! let mut outer = env.with_env([("LD_LIBRARY_PATH", "/opt/lib")], true);
//! {
//!     let inner = outer.with_env([("FLEETRUN_DATA_DIR", "/data")], false);
//!     launch(&inner);
//! } // FLEETRUN_DATA_DIR restored here
//! ```

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::ops::{Deref, DerefMut};
use std::process::Command;

/// Separator used when appending to list-valued variables.
#[cfg(windows)]
pub const LIST_SEPARATOR: &str = ";";
#[cfg(not(windows))]
pub const LIST_SEPARATOR: &str = ":";

/// Dynamic-library search path variable for this platform.
#[cfg(target_os = "macos")]
pub const LIBRARY_PATH_VAR: &str = "DYLD_LIBRARY_PATH";
#[cfg(not(target_os = "macos"))]
pub const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

/// Explicit environment consumed by process launches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<OsString, OsString>,
}

impl Environment {
    /// Snapshot the current process environment.
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars_os().collect(),
        }
    }

    /// An environment with no variables.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: impl AsRef<OsStr>) -> Option<&OsStr> {
        self.vars.get(name.as_ref()).map(OsString::as_os_str)
    }

    /// Lossy string view of a variable, for config parsing and logging.
    pub fn get_string(&self, name: impl AsRef<OsStr>) -> Option<String> {
        self.get(name).map(|v| v.to_string_lossy().into_owned())
    }

    pub fn contains(&self, name: impl AsRef<OsStr>) -> bool {
        self.vars.contains_key(name.as_ref())
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    /// Replace the command's environment with this one.
    pub fn apply_to(&self, cmd: &mut Command) {
        cmd.env_clear();
        cmd.envs(&self.vars);
    }

    /// Apply `overrides` until the returned guard is dropped.
    ///
    /// With `append`, a variable that already has a value is extended with
    /// [`LIST_SEPARATOR`] and the new value instead of being replaced.
    pub fn with_env<I, K, V>(&mut self, overrides: I, append: bool) -> EnvGuard<'_>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let mut snapshot = EnvironmentSnapshot::default();
        for (name, value) in overrides {
            let name = name.into();
            let value = value.into();
            let prior = self.vars.get(&name).cloned();
            snapshot.record(&name, prior.clone());

            let next = match prior {
                Some(existing) if append => {
                    let mut joined = existing;
                    joined.push(LIST_SEPARATOR);
                    joined.push(&value);
                    joined
                }
                _ => value,
            };
            self.vars.insert(name, next);
        }
        EnvGuard {
            env: self,
            snapshot,
        }
    }

    fn restore(&mut self, snapshot: &mut EnvironmentSnapshot) {
        for (name, prior) in std::mem::take(&mut snapshot.prior) {
            match prior {
                Some(value) => {
                    self.vars.insert(name, value);
                }
                None => {
                    self.vars.remove(&name);
                }
            }
        }
    }
}

/// Prior values of every variable touched by one override scope.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnvironmentSnapshot {
    prior: BTreeMap<OsString, Option<OsString>>,
}

impl EnvironmentSnapshot {
    fn record(&mut self, name: &OsStr, prior: Option<OsString>) {
        // First recording wins when a scope names the same variable twice.
        self.prior.entry(name.to_os_string()).or_insert(prior);
    }

    pub fn names(&self) -> impl Iterator<Item = &OsStr> {
        self.prior.keys().map(OsString::as_os_str)
    }
}

/// Restores the overridden variables on drop.
#[derive(Debug)]
pub struct EnvGuard<'a> {
    env: &'a mut Environment,
    snapshot: EnvironmentSnapshot,
}

impl EnvGuard<'_> {
    pub fn snapshot(&self) -> &EnvironmentSnapshot {
        &self.snapshot
    }
}

impl Deref for EnvGuard<'_> {
    type Target = Environment;

    fn deref(&self) -> &Environment {
        self.env
    }
}

impl DerefMut for EnvGuard<'_> {
    fn deref_mut(&mut self) -> &mut Environment {
        self.env
    }
}

impl Drop for EnvGuard<'_> {
    fn drop(&mut self) {
        self.env.restore(&mut self.snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn base() -> Environment {
        Environment::from_vars([("PATH", "/usr/bin"), ("HOME", "/root")])
    }

    #[test]
    fn replace_and_restore() {
        let mut env = base();
        {
            let guard = env.with_env([("PATH", "/opt/bin"), ("NEW", "1")], false);
            assert_eq!(guard.get("PATH"), Some(OsStr::new("/opt/bin")));
            assert_eq!(guard.get("NEW"), Some(OsStr::new("1")));
        }
        assert_eq!(env, base());
    }

    #[test]
    fn append_extends_existing_value() {
        let mut env = base();
        let guard = env.with_env([("PATH", "/opt/bin")], true);
        let expected = format!("/usr/bin{LIST_SEPARATOR}/opt/bin");
        assert_eq!(guard.get_string("PATH").unwrap(), expected);
    }

    #[test]
    fn append_to_absent_variable_sets_it() {
        let mut env = base();
        {
            let guard = env.with_env([(LIBRARY_PATH_VAR, "/build/shared-lib")], true);
            assert_eq!(
                guard.get_string(LIBRARY_PATH_VAR).as_deref(),
                Some("/build/shared-lib")
            );
        }
        assert!(!env.contains(LIBRARY_PATH_VAR));
    }

    #[test]
    fn nested_scopes_restore_in_reverse_order() {
        let mut env = base();
        {
            let mut outer = env.with_env([("PATH", "/a")], false);
            {
                let inner = outer.with_env([("PATH", "/b"), ("HOME", "/tmp")], false);
                assert_eq!(inner.get_string("PATH").unwrap(), "/b");
            }
            assert_eq!(outer.get_string("PATH").unwrap(), "/a");
            assert_eq!(outer.get_string("HOME").unwrap(), "/root");
        }
        assert_eq!(env, base());
    }

    #[test]
    fn restores_when_inner_scope_fails() {
        fn failing(env: &mut Environment) -> Result<(), String> {
            let mut outer = env.with_env([("A", "1")], false);
            let _inner = outer.with_env([("B", "2")], true);
            Err("boom".to_string())
        }

        let mut env = base();
        assert!(failing(&mut env).is_err());
        assert_eq!(env, base());
    }

    #[test]
    fn duplicate_names_restore_first_prior_value() {
        let mut env = base();
        {
            let guard = env.with_env([("PATH", "/x"), ("PATH", "/y")], true);
            let sep = LIST_SEPARATOR;
            assert_eq!(guard.get_string("PATH").unwrap(), format!("/usr/bin{sep}/x{sep}/y"));
        }
        assert_eq!(env, base());
    }

    #[test]
    fn apply_to_replaces_command_environment() {
        let env = Environment::from_vars([("ONLY", "this")]);
        let mut cmd = Command::new("true");
        env.apply_to(&mut cmd);
        let vars: Vec<_> = cmd.get_envs().collect();
        assert!(vars.contains(&(OsStr::new("ONLY"), Some(OsStr::new("this")))));
    }

    proptest! {
        #[test]
        fn any_nesting_restores_original(
            scopes in prop::collection::vec(
                (prop::collection::vec(("[A-D]", "[a-z]{0,4}"), 0..4), any::<bool>()),
                0..5,
            )
        ) {
            let mut env = Environment::from_vars([("A", "orig"), ("C", "x")]);
            let original = env.clone();

            fn nest(env: &mut Environment, scopes: &[(Vec<(String, String)>, bool)]) {
                if let Some(((overrides, append), rest)) = scopes.split_first() {
                    let mut guard = env.with_env(overrides.clone(), *append);
                    nest(&mut guard, rest);
                }
            }

            nest(&mut env, &scopes);
            prop_assert_eq!(env, original);
        }
    }
}
