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

//! Domain runners and their registry
//!
//! A [`DomainRunner`] is the only contract the scheduling core has with an
//! analyzer: sniff one path, and optionally turn an analysis into fixes.
//! Runners are looked up by domain name in a [`DomainRegistry`] that is
//! populated once at startup from a fixed constructor table plus the
//! external commands declared in the configuration.

pub mod analyzers;

use async_trait::async_trait;
use sniffer_common::{AnalyzerError, ConfigError, DomainResult, FixSet, SnifferError, SnifferResult};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::config::SnifferConfig;
use analyzers::{CodeQualityRunner, DocumentationRunner, ExternalRunner, SecurityRunner};

/// Analyzer for one domain
#[async_trait]
pub trait DomainRunner: Send + Sync {
    /// Domain name this runner answers for
    fn domain(&self) -> &str;

    /// Analyze a file (or a directory, for whole-repository scans)
    async fn sniff_file(&self, path: &Path) -> Result<DomainResult, AnalyzerError>;

    fn supports_fixes(&self) -> bool {
        false
    }

    /// Turn an analysis into concrete fixes
    async fn generate_fixes(&self, analysis: &DomainResult) -> Result<FixSet, AnalyzerError> {
        let _ = analysis;
        Err(AnalyzerError::Unsupported(format!("{} does not generate fixes", self.domain())))
    }
}

/// Bounded pool for CPU-bound analyzer work
///
/// Work runs on tokio's blocking threads, gated by a semaphore so analyzers
/// cannot starve the scheduling loops.
#[derive(Debug, Clone)]
pub struct AnalysisPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl AnalysisPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn run<F, T>(&self, work: F) -> Result<T, AnalyzerError>
    where
        F: FnOnce() -> Result<T, AnalyzerError> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AnalyzerError::Execution("analysis pool is closed".to_string()))?;

        match tokio::task::spawn_blocking(work).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(AnalyzerError::Panicked(panic_message(e.into_panic().as_ref()))),
            Err(e) => Err(AnalyzerError::Execution(e.to_string())),
        }
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

type RunnerConstructor = fn(&SnifferConfig, &AnalysisPool) -> Result<Arc<dyn DomainRunner>, ConfigError>;

fn security(_: &SnifferConfig, pool: &AnalysisPool) -> Result<Arc<dyn DomainRunner>, ConfigError> {
    Ok(Arc::new(SecurityRunner::new(pool.clone())?))
}

fn documentation(_: &SnifferConfig, pool: &AnalysisPool) -> Result<Arc<dyn DomainRunner>, ConfigError> {
    Ok(Arc::new(DocumentationRunner::new(pool.clone())))
}

fn code_quality(_: &SnifferConfig, pool: &AnalysisPool) -> Result<Arc<dyn DomainRunner>, ConfigError> {
    Ok(Arc::new(CodeQualityRunner::new(pool.clone())))
}

/// Domains with an in-tree analyzer
const BUILTIN_RUNNERS: &[(&str, RunnerConstructor)] = &[("security", security), ("documentation", documentation), ("code_quality", code_quality)];

pub fn builtin_domains() -> impl Iterator<Item = &'static str> {
    BUILTIN_RUNNERS.iter().map(|(name, _)| *name)
}

/// Name-to-runner map, fixed after startup
#[derive(Clone, Default)]
pub struct DomainRegistry {
    runners: BTreeMap<String, Arc<dyn DomainRunner>>,
}

impl fmt::Debug for DomainRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainRegistry").field("domains", &self.runners.keys().collect::<Vec<_>>()).finish()
    }
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build runners for every enabled domain. External command definitions
    /// take precedence over built-in analyzers of the same name.
    pub fn from_config(config: &SnifferConfig, pool: &AnalysisPool) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for domain in &config.domains.enabled {
            let runner: Arc<dyn DomainRunner> = if let Some(external) = config.domains.external.get(domain) {
                Arc::new(ExternalRunner::from_config(domain, external)?)
            } else if let Some((_, constructor)) = BUILTIN_RUNNERS.iter().find(|(name, _)| name == domain) {
                constructor(config, pool)?
            } else {
                return Err(ConfigError::UnregisteredDomain(domain.clone()));
            };
            registry.register(runner);
        }
        Ok(registry)
    }

    /// Add or replace the runner for its domain
    pub fn register(&mut self, runner: Arc<dyn DomainRunner>) {
        self.runners.insert(runner.domain().to_string(), runner);
    }

    pub fn get(&self, domain: &str) -> SnifferResult<Arc<dyn DomainRunner>> {
        self.runners.get(domain).cloned().ok_or_else(|| SnifferError::UnknownDomain(domain.to_string()))
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.runners.contains_key(domain)
    }

    pub fn domains(&self) -> Vec<String> {
        self.runners.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Fail fast on any name without a runner
    pub fn ensure_known<'a, I>(&self, domains: I) -> SnifferResult<()>
    where
        I: IntoIterator<Item = &'a String>,
    {
        for domain in domains {
            if !self.contains(domain) {
                return Err(SnifferError::UnknownDomain(domain.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExternalDomainConfig;

    #[test]
    fn test_registry_from_default_config() {
        let config = SnifferConfig::default();
        let registry = DomainRegistry::from_config(&config, &AnalysisPool::new(2)).unwrap();
        assert_eq!(registry.domains(), vec!["code_quality", "documentation", "security"]);
        assert!(registry.get("security").is_ok());
        assert!(matches!(registry.get("browser"), Err(SnifferError::UnknownDomain(_))));
    }

    #[test]
    fn test_unknown_enabled_domain_fails_fast() {
        let mut config = SnifferConfig::default();
        config.domains.enabled.push("browser".to_string());
        let err = DomainRegistry::from_config(&config, &AnalysisPool::new(1)).unwrap_err();
        assert_eq!(err, ConfigError::UnregisteredDomain("browser".to_string()));
    }

    #[test]
    fn test_external_domain_registers() {
        let mut config = SnifferConfig::default();
        config.domains.enabled.push("unit".to_string());
        config.domains.external.insert(
            "unit".to_string(),
            ExternalDomainConfig {
                command: "true".to_string(),
                args: vec![],
                coverage_regex: None,
                timeout_ms: None,
            },
        );
        let registry = DomainRegistry::from_config(&config, &AnalysisPool::new(1)).unwrap();
        assert_eq!(registry.get("unit").unwrap().domain(), "unit");
        assert!(registry.ensure_known(&["unit".to_string(), "security".to_string()]).is_ok());
        assert!(registry.ensure_known(&["api".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_pool_converts_panics() {
        let pool = AnalysisPool::new(1);
        let err = pool.run::<_, ()>(|| panic!("regex blew up")).await.unwrap_err();
        assert_eq!(err, AnalyzerError::Panicked("regex blew up".to_string()));
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.run(|| Ok(7)).await.unwrap(), 7);
    }
}
