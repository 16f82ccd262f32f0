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

//! Health monitoring
//!
//! A component is healthy when its last metrics collection succeeded and it
//! has no job that stayed active across `stuck_check_threshold` consecutive
//! checks. Stuck jobs are reported, never remediated.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sniffer_core::metrics::{MetricsCollector, MetricsSnapshot};
use sniffer_core::runner::panic_message;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::scheduler::JobScheduler;
use crate::supervisor::{Shutdown, triggered};

pub const METRICS_COMPONENT: &str = "metrics";
pub const SCHEDULER_COMPONENT: &str = "scheduler";

/// Anything with a set of in-flight jobs
pub trait ActiveJobSource: Send + Sync {
    fn active_jobs(&self) -> Vec<String>;
}

impl ActiveJobSource for JobScheduler {
    fn active_jobs(&self) -> Vec<String> {
        JobScheduler::active_jobs(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentHealth {
    fn healthy(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    fn unhealthy(name: &str, message: String) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Unhealthy,
            message: Some(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub stuck_jobs: Vec<String>,
    pub active_jobs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSnapshot>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.name == name)
    }
}

pub struct HealthMonitor {
    jobs: Arc<dyn ActiveJobSource>,
    metrics: Arc<MetricsCollector>,
    stuck_threshold: u32,
    /// Consecutive checks each active job has been seen in
    sightings: Mutex<HashMap<String, u32>>,
    last_report: Mutex<Option<HealthReport>>,
    shutdown: Shutdown,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(jobs: Arc<dyn ActiveJobSource>, metrics: Arc<MetricsCollector>, stuck_threshold: u32) -> Self {
        Self {
            jobs,
            metrics,
            stuck_threshold: stuck_threshold.max(1),
            sightings: Mutex::new(HashMap::new()),
            last_report: Mutex::new(None),
            shutdown: Shutdown::new(),
            handle: Mutex::new(None),
        }
    }

    /// Run one health check and remember its report
    pub fn check(&self) -> HealthReport {
        let mut components = Vec::with_capacity(2);

        let metrics = match std::panic::catch_unwind(AssertUnwindSafe(|| self.metrics.get_metrics())) {
            Ok(snapshot) => {
                components.push(ComponentHealth::healthy(METRICS_COMPONENT));
                Some(snapshot)
            }
            Err(panic) => {
                let message = format!("metrics collection failed: {}", panic_message(panic.as_ref()));
                warn!("{}", message);
                components.push(ComponentHealth::unhealthy(METRICS_COMPONENT, message));
                None
            }
        };

        let active = self.jobs.active_jobs();
        let stuck_jobs = {
            let mut sightings = self.sightings.lock();
            sightings.retain(|id, _| active.contains(id));
            for id in &active {
                *sightings.entry(id.clone()).or_insert(0) += 1;
            }
            let mut stuck: Vec<String> = sightings.iter().filter(|(_, seen)| **seen >= self.stuck_threshold).map(|(id, _)| id.clone()).collect();
            stuck.sort();
            stuck
        };

        if stuck_jobs.is_empty() {
            components.push(ComponentHealth::healthy(SCHEDULER_COMPONENT));
        } else {
            let message = format!("{} job(s) active for {} consecutive checks: {}", stuck_jobs.len(), self.stuck_threshold, stuck_jobs.join(", "));
            warn!("{}", message);
            components.push(ComponentHealth::unhealthy(SCHEDULER_COMPONENT, message));
        }

        let status = if components.iter().all(|c| c.status == HealthStatus::Healthy) { HealthStatus::Healthy } else { HealthStatus::Unhealthy };
        let report = HealthReport {
            status,
            components,
            stuck_jobs,
            active_jobs: active.len(),
            metrics,
            checked_at: Utc::now(),
        };
        debug!("Health check: {:?}, {} active job(s)", report.status, report.active_jobs);
        *self.last_report.lock() = Some(report.clone());
        report
    }

    pub fn last_report(&self) -> Option<HealthReport> {
        self.last_report.lock().clone()
    }

    /// Check every `interval` until `stop` is called
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let monitor = Arc::clone(self);
        let mut stop = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = triggered(&mut stop) => break,
                    _ = ticker.tick() => {
                        monitor.check();
                    }
                }
            }
            info!("Health monitor stopped");
        });
        *self.handle.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        self.shutdown.trigger();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeJobs(Mutex<Vec<String>>);

    impl ActiveJobSource for FakeJobs {
        fn active_jobs(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    #[test]
    fn test_job_becomes_stuck_after_threshold() {
        let jobs = Arc::new(FakeJobs::default());
        let monitor = HealthMonitor::new(jobs.clone(), Arc::new(MetricsCollector::new()), 3);

        assert!(monitor.check().is_healthy());
        *jobs.0.lock() = vec!["job-1".to_string()];
        assert!(monitor.check().is_healthy());
        assert!(monitor.check().is_healthy());

        let report = monitor.check();
        assert!(!report.is_healthy());
        assert_eq!(report.stuck_jobs, vec!["job-1"]);
        assert_eq!(report.component(SCHEDULER_COMPONENT).unwrap().status, HealthStatus::Unhealthy);
        assert_eq!(report.component(METRICS_COMPONENT).unwrap().status, HealthStatus::Healthy);
    }

    #[test]
    fn test_draining_resets_sightings() {
        let jobs = Arc::new(FakeJobs::default());
        let monitor = HealthMonitor::new(jobs.clone(), Arc::new(MetricsCollector::new()), 2);

        *jobs.0.lock() = vec!["job-1".to_string()];
        monitor.check();
        jobs.0.lock().clear();
        monitor.check();
        *jobs.0.lock() = vec!["job-1".to_string(), "job-2".to_string()];
        let report = monitor.check();
        assert!(report.is_healthy());
        assert_eq!(report.active_jobs, 2);
        assert_eq!(monitor.last_report().unwrap(), report);
    }

    #[tokio::test]
    async fn test_periodic_checks() {
        let monitor = Arc::new(HealthMonitor::new(Arc::new(FakeJobs::default()), Arc::new(MetricsCollector::new()), 3));
        monitor.start(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(monitor.last_report().is_some());
        monitor.stop().await;
    }
}
