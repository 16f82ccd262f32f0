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

//! Sniffer runtime
//!
//! Wires the job scheduler, the orchestrator, the sniffing loop, the result
//! manager and the health monitor into one [`Sniffer`] service:
//!
//! ```text
//! submit -> JobScheduler -> Orchestrator -> SniffingLoop (FileLock, DomainRunner)
//!                                 |
//!                                 +-> ResultManager (status.json)
//! ```

pub mod health;
pub mod orchestrator;
pub mod results;
pub mod scheduler;
pub mod sniffing;
pub mod supervisor;

pub use health::{HealthMonitor, HealthReport, HealthStatus};
pub use orchestrator::{Orchestrator, aggregate_results};
pub use results::ResultManager;
pub use scheduler::{JobHandler, JobScheduler, QueueKind, SchedulerStatus};
pub use sniffing::{FileResults, SniffingLoop, SniffingStatus};

use sniffer_common::{ConfigError, Job, JobRequest, JobStatusView, SnifferResult};
use sniffer_core::metrics::{MetricsCollector, MetricsSnapshot};
use sniffer_core::runner::{AnalysisPool, DomainRegistry};
use sniffer_core::SnifferConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// The running service
pub struct Sniffer {
    config: Arc<SnifferConfig>,
    registry: Arc<DomainRegistry>,
    metrics: Arc<MetricsCollector>,
    results: Arc<ResultManager>,
    sniffing: Arc<SniffingLoop>,
    scheduler: Arc<JobScheduler>,
    health: Arc<HealthMonitor>,
}

impl Sniffer {
    /// Validate `config`, build the runners for its enabled domains and start
    /// every worker loop. Must be called inside a tokio runtime.
    pub fn start(config: SnifferConfig) -> SnifferResult<Self> {
        config.validate()?;
        let pool = AnalysisPool::new(config.workers.analysis_pool_size);
        let registry = DomainRegistry::from_config(&config, &pool)?;
        Self::start_with_registry(config, registry)
    }

    /// Start with a caller-built registry, which must cover every enabled domain
    pub fn start_with_registry(config: SnifferConfig, registry: DomainRegistry) -> SnifferResult<Self> {
        config.validate()?;
        if let Some(missing) = config.domains.enabled.iter().find(|domain| !registry.contains(domain)) {
            return Err(ConfigError::UnregisteredDomain(missing.clone()).into());
        }

        let config = Arc::new(config);
        let registry = Arc::new(registry);
        let metrics = Arc::new(MetricsCollector::new());
        let results = Arc::new(ResultManager::new(&config.paths.job_root));
        let sniffing = Arc::new(SniffingLoop::start(config.clone(), registry.clone(), metrics.clone()));
        let orchestrator = Arc::new(Orchestrator::new(config.clone(), registry.clone(), sniffing.clone(), results.clone(), metrics.clone()));
        let scheduler = Arc::new(JobScheduler::start(config.clone(), registry.clone(), results.clone(), orchestrator));
        let health = Arc::new(HealthMonitor::new(scheduler.clone(), metrics.clone(), config.metrics.stuck_check_threshold));
        health.start(config.metrics.collection_interval());

        info!("Sniffer started with domains: {}", registry.domains().join(", "));
        Ok(Self {
            config,
            registry,
            metrics,
            results,
            sniffing,
            scheduler,
            health,
        })
    }

    pub fn config(&self) -> &SnifferConfig {
        &self.config
    }

    pub fn domains(&self) -> Vec<String> {
        self.registry.domains()
    }

    pub async fn submit(&self, request: JobRequest) -> SnifferResult<String> {
        self.scheduler.schedule(request).await
    }

    /// Wait for a job to finish; see [`ResultManager::wait_for`]
    pub async fn wait(&self, job_id: &str, timeout: Duration) -> SnifferResult<Job> {
        self.results.wait_for(job_id, timeout).await
    }

    pub fn job(&self, job_id: &str) -> SnifferResult<Job> {
        self.results.load(job_id)
    }

    pub fn job_status(&self, job_id: &str) -> SnifferResult<JobStatusView> {
        self.scheduler.get_job_status(job_id)
    }

    pub fn queue_status(&self) -> SchedulerStatus {
        self.scheduler.get_queue_status()
    }

    pub fn sniffing_status(&self) -> SniffingStatus {
        self.sniffing.status()
    }

    pub fn sniffing(&self) -> &Arc<SniffingLoop> {
        &self.sniffing
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.get_metrics()
    }

    /// Run a health check now
    pub fn health(&self) -> HealthReport {
        self.health.check()
    }

    /// Stop intake, let active jobs finish, then stop every worker
    pub async fn shutdown(&self) {
        self.health.stop().await;
        self.scheduler.stop().await;
        self.sniffing.shutdown().await;
        info!("Sniffer stopped");
    }
}
