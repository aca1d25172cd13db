use crate::lock::DEFAULT_LOCK_PATH;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable iptables reads the lock path from
pub const LOCKFILE_ENV: &str = "XTABLES_LOCKFILE";

/// How the kernel backend serialises commits with other xtables users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub lock_path: PathBuf,
    /// Skip the lock entirely (for private network namespaces)
    pub use_lock: bool,
    /// Block until the lock is free instead of failing the commit
    pub wait_for_lock: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
            use_lock: true,
            wait_for_lock: true,
        }
    }
}

impl KernelConfig {
    /// Load from a YAML file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read kernel config from {:?}", path))?;

        let config: KernelConfig =
            serde_yaml::from_str(&content).context("Failed to parse kernel config YAML")?;

        Ok(config.with_env())
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    fn with_env(self) -> Self {
        self.with_lockfile(std::env::var_os(LOCKFILE_ENV).map(PathBuf::from))
    }

    fn with_lockfile(mut self, lockfile: Option<PathBuf>) -> Self {
        if let Some(path) = lockfile.filter(|p| !p.as_os_str().is_empty()) {
            self.lock_path = path;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_fields_take_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "wait_for_lock: false").unwrap();

        let config = KernelConfig::load(file.path()).unwrap();
        assert!(!config.wait_for_lock);
        assert!(config.use_lock);
    }

    #[test]
    fn lockfile_override_wins_over_file() {
        let config = KernelConfig {
            lock_path: PathBuf::from("/tmp/from-file.lock"),
            ..KernelConfig::default()
        }
        .with_lockfile(Some(PathBuf::from("/tmp/from-env.lock")));
        assert_eq!(config.lock_path, PathBuf::from("/tmp/from-env.lock"));

        let untouched = KernelConfig::default().with_lockfile(Some(PathBuf::new()));
        assert_eq!(untouched.lock_path, PathBuf::from(DEFAULT_LOCK_PATH));
    }

    #[test]
    fn unreadable_config_reports_path() {
        let err = KernelConfig::load(Path::new("/nonexistent/ipt.yaml")).unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/ipt.yaml"));
    }
}
