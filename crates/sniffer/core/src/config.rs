// Sniffer
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Sniffer configuration
//!
//! Loaded once at startup from TOML, with `${VAR}` placeholders resolved from
//! the environment during loading. The resulting struct is immutable and is
//! handed to each component behind an `Arc`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sniffer_common::ConfigError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Domains enabled when the configuration does not list any
pub const DEFAULT_DOMAINS: &[&str] = &["security", "documentation", "code_quality"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SnifferConfig {
    pub queues: QueueConfig,
    pub locking: LockConfig,
    pub workers: WorkerConfig,
    pub domains: DomainsConfig,
    pub metrics: MetricsConfig,
    pub paths: PathsConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

/// Channel capacities for the scheduler lanes and the sniffing loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub priority: usize,
    pub domain: usize,
    pub file: usize,
    pub analysis: usize,
    pub file_queue: usize,
    pub domain_queue: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            priority: 64,
            domain: 256,
            file: 256,
            analysis: 256,
            file_queue: 512,
            domain_queue: 512,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub lock_dir: PathBuf,
    pub file_lock_timeout_ms: u64,
    pub check_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_dir: PathBuf::from(".sniffer/locks"),
            file_lock_timeout_ms: 30_000,
            check_interval_ms: 100,
        }
    }
}

impl LockConfig {
    pub fn file_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.file_lock_timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent file-queue workers inside the sniffing loop
    pub file_workers: usize,
    /// Permits for CPU-bound analyzer work
    pub analysis_pool_size: usize,
    /// Pause before relaunching a crashed worker loop
    pub restart_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            file_workers: 1,
            analysis_pool_size: 4,
            restart_delay_ms: 100,
        }
    }
}

impl WorkerConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

/// A domain backed by an external command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalDomainConfig {
    pub command: String,
    /// Arguments; `{file}` is replaced by the target path
    #[serde(default)]
    pub args: Vec<String>,
    /// Regex with one capture group holding a coverage percentage
    #[serde(default)]
    pub coverage_regex: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainsConfig {
    pub enabled: Vec<String>,
    pub external: BTreeMap<String, ExternalDomainConfig>,
}

impl Default for DomainsConfig {
    fn default() -> Self {
        Self {
            enabled: DEFAULT_DOMAINS.iter().map(|d| d.to_string()).collect(),
            external: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub collection_interval_ms: u64,
    /// Consecutive health checks a job may stay active before it counts as stuck
    pub stuck_check_threshold: u32,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            collection_interval_ms: 30_000,
            stuck_check_threshold: 3,
        }
    }
}

impl MetricsConfig {
    pub fn collection_interval(&self) -> Duration {
        Duration::from_millis(self.collection_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub report_dir: PathBuf,
    pub job_root: PathBuf,
    /// Target of whole-repository scans (jobs without files)
    pub workspace_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            report_dir: PathBuf::from("reports"),
            job_root: PathBuf::from(".sniffer/jobs"),
            workspace_root: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_ms: 60_000 }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl SnifferConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse, resolve environment placeholders, and validate
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Self::from_toml_str_with(content, |name| std::env::var(name).ok())
    }

    pub fn from_toml_str_with<F>(content: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut value: toml::Value = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        substitute_value(&mut value, &lookup)?;
        let config: Self = value.try_into().map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Structural validation. Domain resolvability is checked when the
    /// runner registry is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let capacities = [
            ("queues.priority", self.queues.priority),
            ("queues.domain", self.queues.domain),
            ("queues.file", self.queues.file),
            ("queues.analysis", self.queues.analysis),
            ("queues.file_queue", self.queues.file_queue),
            ("queues.domain_queue", self.queues.domain_queue),
            ("workers.file_workers", self.workers.file_workers),
            ("workers.analysis_pool_size", self.workers.analysis_pool_size),
        ];
        for (field, value) in capacities {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }

        if self.locking.check_interval_ms == 0 {
            return Err(ConfigError::invalid("locking.check_interval_ms", "must be greater than zero"));
        }
        if self.locking.check_interval_ms >= self.locking.file_lock_timeout_ms {
            return Err(ConfigError::invalid("locking.check_interval_ms", "must be shorter than locking.file_lock_timeout_ms"));
        }
        if self.metrics.collection_interval_ms == 0 {
            return Err(ConfigError::invalid("metrics.collection_interval_ms", "must be greater than zero"));
        }
        if self.metrics.stuck_check_threshold == 0 {
            return Err(ConfigError::invalid("metrics.stuck_check_threshold", "must be greater than zero"));
        }

        if self.domains.enabled.is_empty() {
            return Err(ConfigError::invalid("domains.enabled", "at least one domain must be enabled"));
        }
        for (i, domain) in self.domains.enabled.iter().enumerate() {
            if domain.trim().is_empty() {
                return Err(ConfigError::invalid("domains.enabled", "domain names must not be empty"));
            }
            if self.domains.enabled[..i].contains(domain) {
                return Err(ConfigError::invalid("domains.enabled", format!("domain `{domain}` is listed twice")));
            }
        }
        for (name, external) in &self.domains.external {
            if external.command.trim().is_empty() {
                return Err(ConfigError::invalid(format!("domains.external.{name}.command"), "must not be empty"));
            }
            if let Some(pattern) = &external.coverage_regex {
                Regex::new(pattern).map_err(|e| ConfigError::invalid(format!("domains.external.{name}.coverage_regex"), e.to_string()))?;
            }
        }

        if self.paths.report_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("paths.report_dir", "must not be empty"));
        }
        if self.paths.job_root.as_os_str().is_empty() {
            return Err(ConfigError::invalid("paths.job_root", "must not be empty"));
        }
        Ok(())
    }
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid"))
}

/// Replace every `${VAR}` in `input` using `lookup`
pub fn substitute_env<F>(input: &str, lookup: &F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let pattern = placeholder_pattern();
    let mut output = String::with_capacity(input.len());
    let mut last = 0;
    for captures in pattern.captures_iter(input) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let value = lookup(name.as_str()).ok_or_else(|| ConfigError::MissingEnvVar(name.as_str().to_string()))?;
        output.push_str(&input[last..whole.start()]);
        output.push_str(&value);
        last = whole.end();
    }
    output.push_str(&input[last..]);
    Ok(output)
}

fn substitute_value<F>(value: &mut toml::Value, lookup: &F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        toml::Value::String(s) => {
            *s = substitute_env(s, lookup)?;
        }
        toml::Value::Array(items) => {
            for item in items {
                substitute_value(item, lookup)?;
            }
        }
        toml::Value::Table(table) => {
            for (_, item) in table.iter_mut() {
                substitute_value(item, lookup)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(name: &str) -> Option<String> {
        match name {
            "REPORT_ROOT" => Some("/tmp/sniffer-reports".to_string()),
            "UNIT_CMD" => Some("pytest".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = SnifferConfig::default();
        config.validate().unwrap();
        assert_eq!(config.domains.enabled, vec!["security", "documentation", "code_quality"]);
        assert_eq!(config.locking.file_lock_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = SnifferConfig::from_toml_str_with(
            r#"
            [locking]
            file_lock_timeout_ms = 500
            check_interval_ms = 10
            "#,
            env,
        )
        .unwrap();
        assert_eq!(config.locking.file_lock_timeout_ms, 500);
        assert_eq!(config.queues, QueueConfig::default());
    }

    #[test]
    fn test_env_substitution_in_nested_values() {
        let config = SnifferConfig::from_toml_str_with(
            r#"
            [paths]
            report_dir = "${REPORT_ROOT}/latest"

            [domains]
            enabled = ["security", "unit"]

            [domains.external.unit]
            command = "${UNIT_CMD}"
            args = ["{file}"]
            "#,
            env,
        )
        .unwrap();
        assert_eq!(config.paths.report_dir, PathBuf::from("/tmp/sniffer-reports/latest"));
        assert_eq!(config.domains.external["unit"].command, "pytest");
        assert_eq!(config.domains.external["unit"].args, vec!["{file}"]);
    }

    #[test]
    fn test_missing_env_var_is_fatal() {
        let err = SnifferConfig::from_toml_str_with("[paths]\nreport_dir = \"${NOPE}\"\n", env).unwrap_err();
        assert_eq!(err, ConfigError::MissingEnvVar("NOPE".to_string()));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = SnifferConfig::default();
        config.queues.file = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field, .. }) if field == "queues.file"));

        let mut config = SnifferConfig::default();
        config.locking.check_interval_ms = config.locking.file_lock_timeout_ms;
        assert!(config.validate().is_err());

        let mut config = SnifferConfig::default();
        config.domains.enabled = vec!["security".into(), "security".into()];
        assert!(config.validate().is_err());

        let mut config = SnifferConfig::default();
        config.domains.enabled.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sniffer.toml");
        let mut config = SnifferConfig::default();
        config.workers.file_workers = 3;
        config.save_to_file(&path).unwrap();

        let loaded = SnifferConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_substitute_env_leaves_plain_text() {
        assert_eq!(substitute_env("no placeholders $HOME", &env).unwrap(), "no placeholders $HOME");
    }
}
