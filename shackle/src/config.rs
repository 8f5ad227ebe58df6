//! Deployment configuration.
//!
//! Every constant that shapes a run (account name, staging location,
//! deadline, resource ceilings, syscall allow-list) lives in [`Config`].
//! Values come from built-in defaults, then an optional JSON file named by
//! `SHACKLE_CONFIG`, then individual environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Context, Error, Result};
use crate::policy::{AllowList, POLICY_VERSION};

/// Environment variable naming an optional JSON configuration file.
pub const ENV_CONFIG: &str = "SHACKLE_CONFIG";

/// Default low-privilege account.
pub const DEFAULT_USER: &str = "hive";

/// Default wall-clock deadline for the jailed program.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest accepted deadline (one day).
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Default address-space ceiling (64 MiB).
pub const DEFAULT_MEMORY_LIMIT: u64 = 64 * 1024 * 1024;

/// Settings for a single supervised run.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Config {
    /// Account the jailed program and the supervisor drop to.
    pub user: String,
    /// Directory under which staging areas are created.
    pub staging_root: PathBuf,
    /// Deadline measured from the start of the relay loop.
    pub timeout: Duration,
    /// `RLIMIT_AS` ceiling in bytes, applied as soft and hard limit.
    pub memory_limit: u64,
    /// `RLIMIT_NPROC` ceiling, applied as soft and hard limit.
    pub max_processes: u64,
    /// Syscall capabilities granted to the jailed program.
    pub allow: AllowList,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user: DEFAULT_USER.to_owned(),
            staging_root: PathBuf::from("/tmp"),
            timeout: DEFAULT_TIMEOUT,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            max_processes: 0,
            allow: AllowList::minimal(),
        }
    }
}

/// On-disk form of [`Config`]; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    user: Option<String>,
    staging_root: Option<PathBuf>,
    timeout_secs: Option<u64>,
    memory_mib: Option<u64>,
    max_processes: Option<u64>,
    allow: Option<AllowList>,
}

impl Config {
    /// Loads defaults, the `SHACKLE_CONFIG` file (if set), then environment
    /// overrides, and validates the result.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var_os(ENV_CONFIG) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file layered over the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).context("read config file")?;
        Self::from_json(&data)
    }

    /// Parses JSON configuration layered over the defaults.
    pub fn from_json(data: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(data).map_err(|e| Error::Config(e.to_string()))?;
        let mut config = Self::default();
        if let Some(user) = file.user {
            config.user = user;
        }
        if let Some(root) = file.staging_root {
            config.staging_root = root;
        }
        if let Some(secs) = file.timeout_secs {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(mib) = file.memory_mib {
            config.memory_limit = mib_to_bytes(mib)?;
        }
        if let Some(n) = file.max_processes {
            config.max_processes = n;
        }
        if let Some(allow) = file.allow {
            config.allow = allow;
        }
        Ok(config)
    }

    /// Applies `SHACKLE_*` overrides using `lookup` to read variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(user) = lookup("SHACKLE_USER") {
            self.user = user;
        }
        if let Some(root) = lookup("SHACKLE_STAGING_ROOT") {
            self.staging_root = PathBuf::from(root);
        }
        if let Some(secs) = lookup("SHACKLE_TIMEOUT_SECS") {
            self.timeout = Duration::from_secs(parse_u64("SHACKLE_TIMEOUT_SECS", &secs)?);
        }
        if let Some(mib) = lookup("SHACKLE_MEMORY_MIB") {
            self.memory_limit = mib_to_bytes(parse_u64("SHACKLE_MEMORY_MIB", &mib)?)?;
        }
        if let Some(n) = lookup("SHACKLE_MAX_PROCS") {
            self.max_processes = parse_u64("SHACKLE_MAX_PROCS", &n)?;
        }
        Ok(())
    }

    /// Rejects settings that cannot produce a working jail.
    pub fn validate(&self) -> Result<()> {
        if self.user.is_empty() {
            return Err(Error::Config("user must not be empty".into()));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("timeout must be non-zero".into()));
        }
        if self.timeout > MAX_TIMEOUT {
            return Err(Error::Config(format!(
                "timeout of {}s exceeds the {}s ceiling",
                self.timeout.as_secs(),
                MAX_TIMEOUT.as_secs()
            )));
        }
        if !self.staging_root.is_absolute() {
            return Err(Error::Config(format!(
                "staging root {} is not absolute",
                self.staging_root.display()
            )));
        }
        if self.allow.version > POLICY_VERSION {
            return Err(Error::Config(format!(
                "allow-list version {} is newer than supported version {}",
                self.allow.version,
                POLICY_VERSION
            )));
        }
        Ok(())
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}={value:?} is not a non-negative integer")))
}

fn mib_to_bytes(mib: u64) -> Result<u64> {
    mib.checked_mul(1024 * 1024)
        .ok_or_else(|| Error::Config(format!("memory limit of {mib} MiB overflows")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::policy::Capability;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_historical_constants() {
        let c = Config::default();
        assert_eq!(c.user, "hive");
        assert_eq!(c.staging_root, PathBuf::from("/tmp"));
        assert_eq!(c.timeout, Duration::from_secs(5));
        assert_eq!(c.memory_limit, 64 * 1024 * 1024);
        assert_eq!(c.max_processes, 0);
        c.validate().unwrap();
    }

    #[test]
    fn json_overrides_selected_fields() {
        let c = Config::from_json(
            r#"{"user":"grader","timeout_secs":2,"memory_mib":16,
                "allow":{"version":1,"capabilities":["read","write","exit","exec"]}}"#,
        )
        .unwrap();
        assert_eq!(c.user, "grader");
        assert_eq!(c.timeout, Duration::from_secs(2));
        assert_eq!(c.memory_limit, 16 * 1024 * 1024);
        assert_eq!(c.staging_root, PathBuf::from("/tmp"));
        assert!(c.allow.allows(Capability::Exec));
        assert!(!c.allow.allows(Capability::Mmap));
    }

    #[test]
    fn json_rejects_unknown_fields() {
        let err = Config::from_json(r#"{"timeout":5}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_overrides_file_values() {
        let mut c = Config::from_json(r#"{"timeout_secs":9}"#).unwrap();
        c.apply_env(env(&[
            ("SHACKLE_TIMEOUT_SECS", "3"),
            ("SHACKLE_STAGING_ROOT", "/var/tmp"),
            ("SHACKLE_MAX_PROCS", "1"),
        ]))
        .unwrap();
        assert_eq!(c.timeout, Duration::from_secs(3));
        assert_eq!(c.staging_root, PathBuf::from("/var/tmp"));
        assert_eq!(c.max_processes, 1);
    }

    #[test]
    fn env_rejects_malformed_numbers() {
        let mut c = Config::default();
        let err = c.apply_env(env(&[("SHACKLE_MEMORY_MIB", "lots")])).unwrap_err();
        assert!(err.to_string().contains("SHACKLE_MEMORY_MIB"));
    }

    #[test]
    fn validate_rejects_zero_timeout_and_relative_root() {
        let mut c = Config {
            timeout: Duration::ZERO,
            ..Config::default()
        };
        assert!(c.validate().is_err());
        c.timeout = DEFAULT_TIMEOUT;
        c.staging_root = PathBuf::from("tmp");
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_timeouts_past_the_ceiling() {
        let c = Config::from_json(r#"{"timeout_secs":18446744073709551615}"#).unwrap();
        let err = c.validate().unwrap_err();
        assert!(err.to_string().contains("ceiling"), "{err}");

        let mut c = Config::default();
        c.apply_env(env(&[("SHACKLE_TIMEOUT_SECS", "86401")])).unwrap();
        assert!(c.validate().is_err());
        c.timeout = MAX_TIMEOUT;
        c.validate().unwrap();
    }

    #[test]
    fn from_file_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shackle.json");
        std::fs::write(&path, r#"{"user":"nobody"}"#).unwrap();
        assert_eq!(Config::from_file(&path).unwrap().user, "nobody");
    }
}
