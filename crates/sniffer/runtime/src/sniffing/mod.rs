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

//! Sniffing loop - the file processing engine
//!
//! Files enter through two bounded lanes (high priority and normal). File
//! workers take the lock for a file, run every requested domain against it
//! in turn, release the lock, and hand each domain result to that domain's
//! queue, where a domain worker publishes the report. Publishing never
//! happens under the file lock.

pub mod reports;

use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use sniffer_common::{AnalyzerError, DomainResult, DomainStatus, Priority, SnifferError, SnifferResult, generate_job_id};
use sniffer_core::lock::FileLock;
use sniffer_core::metrics::{Metadata, MetricsCollector};
use sniffer_core::runner::{DomainRegistry, panic_message};
use sniffer_core::SnifferConfig;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::supervisor::{RestartCount, SharedReceiver, Shutdown, shared, spawn_supervised, triggered};
pub use reports::{DomainReport, ReportWriter};

/// Results of one file pass, keyed by domain
pub type FileResults = BTreeMap<String, DomainResult>;

/// A file waiting in a lane
#[derive(Debug)]
pub struct FileRequest {
    pub job_id: String,
    pub file: PathBuf,
    pub domains: Vec<String>,
    pub priority: Priority,
    /// Whether domain results are fanned out for report publishing
    pub publish: bool,
    reply: Option<oneshot::Sender<FileResults>>,
}

struct Lanes {
    high: mpsc::Receiver<FileRequest>,
    normal: mpsc::Receiver<FileRequest>,
}

#[derive(Debug, Clone)]
struct CachedResults {
    results: FileResults,
    stored_at: Instant,
}

/// Depth and capacity of the sniffing loop's channels
#[derive(Debug, Clone, serde::Serialize)]
pub struct SniffingStatus {
    pub high_lane_depth: usize,
    pub normal_lane_depth: usize,
    pub file_queue_capacity: usize,
    pub domain_queue_depths: BTreeMap<String, usize>,
    pub domain_queue_capacity: usize,
    pub cached_files: usize,
    pub worker_restarts: u64,
}

struct Worker {
    config: Arc<SnifferConfig>,
    registry: Arc<DomainRegistry>,
    metrics: Arc<MetricsCollector>,
    cache: DashMap<PathBuf, CachedResults>,
    domain_queues: HashMap<String, mpsc::Sender<DomainReport>>,
}

pub struct SniffingLoop {
    worker: Arc<Worker>,
    high_tx: mpsc::Sender<FileRequest>,
    normal_tx: mpsc::Sender<FileRequest>,
    shutdown: Shutdown,
    restarts: Arc<RestartCount>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl SniffingLoop {
    /// Spawn the file workers and one report worker per registered domain
    pub fn start(config: Arc<SnifferConfig>, registry: Arc<DomainRegistry>, metrics: Arc<MetricsCollector>) -> Self {
        let shutdown = Shutdown::new();
        let restarts = Arc::new(RestartCount::default());
        let restart_delay = config.workers.restart_delay();
        let mut handles = Vec::new();

        let writer = ReportWriter::new(&config.paths.report_dir);
        let mut domain_queues = HashMap::new();
        for domain in registry.domains() {
            let (tx, rx) = mpsc::channel(config.queues.domain_queue);
            domain_queues.insert(domain.clone(), tx);
            let rx = shared(rx);
            let (writer, metrics, stop) = (writer.clone(), metrics.clone(), shutdown.clone());
            handles.push(spawn_supervised(format!("domain:{domain}"), restart_delay, &shutdown, restarts.clone(), move || {
                domain_worker(rx.clone(), writer.clone(), metrics.clone(), stop.clone())
            }));
        }

        let (high_tx, high_rx) = mpsc::channel(config.queues.file_queue);
        let (normal_tx, normal_rx) = mpsc::channel(config.queues.file_queue);
        let lanes = Arc::new(Mutex::new(Lanes { high: high_rx, normal: normal_rx }));

        let worker = Arc::new(Worker {
            config: config.clone(),
            registry,
            metrics,
            cache: DashMap::new(),
            domain_queues,
        });

        for index in 0..config.workers.file_workers {
            let (worker, lanes, stop) = (worker.clone(), lanes.clone(), shutdown.clone());
            handles.push(spawn_supervised(format!("file:{index}"), restart_delay, &shutdown, restarts.clone(), move || {
                file_worker(worker.clone(), lanes.clone(), stop.clone())
            }));
        }

        info!("Sniffing loop started with {} file worker(s) and {} domain queue(s)", config.workers.file_workers, worker.domain_queues.len());

        Self {
            worker,
            high_tx,
            normal_tx,
            shutdown,
            restarts,
            handles: parking_lot::Mutex::new(handles),
        }
    }

    fn lane(&self, priority: Priority) -> (&mpsc::Sender<FileRequest>, &'static str) {
        if priority.is_high() { (&self.high_tx, "high") } else { (&self.normal_tx, "normal") }
    }

    async fn enqueue(&self, request: FileRequest) -> SnifferResult<()> {
        if self.shutdown.is_triggered() {
            return Err(SnifferError::QueueClosed("file".to_string()));
        }
        let (lane, name) = self.lane(request.priority);
        debug!(job_id = %request.job_id, file = %request.file.display(), lane = name, "Queueing file");
        lane.send(request).await.map_err(|_| SnifferError::QueueClosed(format!("file ({name})")))
    }

    /// Queue a file and return immediately with the id of the pass
    pub async fn add_file(&self, file: impl Into<PathBuf>, domains: Vec<String>, priority: Priority) -> SnifferResult<String> {
        let job_id = generate_job_id();
        self.enqueue(FileRequest {
            job_id: job_id.clone(),
            file: file.into(),
            domains,
            priority,
            publish: true,
            reply: None,
        })
        .await?;
        Ok(job_id)
    }

    /// Queue a file for `job_id` and wait for its results
    pub async fn sniff_file(&self, job_id: &str, file: impl Into<PathBuf>, domains: Vec<String>, priority: Priority, publish: bool) -> SnifferResult<FileResults> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(FileRequest {
            job_id: job_id.to_string(),
            file: file.into(),
            domains,
            priority,
            publish,
            reply: Some(tx),
        })
        .await?;
        rx.await.map_err(|_| SnifferError::QueueClosed("file".to_string()))
    }

    /// Last results for `file`, if still within the cache TTL
    pub fn cached_results(&self, file: &Path) -> Option<FileResults> {
        let ttl = self.worker.config.cache.ttl();
        let entry = self.worker.cache.get(file)?;
        (entry.stored_at.elapsed() <= ttl).then(|| entry.results.clone())
    }

    pub fn status(&self) -> SniffingStatus {
        let capacity = self.worker.config.queues.file_queue;
        SniffingStatus {
            high_lane_depth: capacity - self.high_tx.capacity(),
            normal_lane_depth: capacity - self.normal_tx.capacity(),
            file_queue_capacity: capacity,
            domain_queue_depths: self
                .worker
                .domain_queues
                .iter()
                .map(|(domain, tx)| (domain.clone(), tx.max_capacity() - tx.capacity()))
                .collect(),
            domain_queue_capacity: self.worker.config.queues.domain_queue,
            cached_files: self.worker.cache.len(),
            worker_restarts: self.restarts.get(),
        }
    }

    /// Stop every worker. Files still queued are dropped and their callers
    /// get `QueueClosed`.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("Sniffing loop stopped");
    }
}

async fn file_worker(worker: Arc<Worker>, lanes: Arc<Mutex<Lanes>>, shutdown: Shutdown) {
    let mut stop = shutdown.subscribe();
    loop {
        let request = {
            let mut lanes = lanes.lock().await;
            let Lanes { high, normal } = &mut *lanes;
            tokio::select! {
                biased;
                _ = triggered(&mut stop) => None,
                request = high.recv() => request,
                request = normal.recv() => request,
            }
        };
        let Some(request) = request else {
            break;
        };
        worker.process(request).await;
    }
}

async fn domain_worker(rx: SharedReceiver<DomainReport>, writer: ReportWriter, metrics: Arc<MetricsCollector>, shutdown: Shutdown) {
    let mut stop = shutdown.subscribe();
    loop {
        let report = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = triggered(&mut stop) => None,
                report = rx.recv() => report,
            }
        };
        let Some(report) = report else {
            break;
        };

        let timer = metrics.record_start(format!("report:{}", report.result.domain));
        match writer.write(&report).await {
            Ok(path) => {
                debug!("Report written to {}", path.display());
                metrics.record(timer, true);
            }
            Err(e) => {
                warn!("Failed to write {} report for {}: {}", report.result.domain, report.file.display(), e);
                metrics.record(timer, false);
            }
        }
    }
}

impl Worker {
    async fn process(&self, mut request: FileRequest) {
        let timer = self.metrics.record_start("sniff_file");
        let lock = FileLock::from_config(&self.config.locking, &request.file);

        let results = match lock.acquire().await {
            Ok(guard) => {
                let results = self.run_domains(&request.file, &request.domains).await;
                guard.release();
                results
            }
            Err(e) => {
                warn!(job_id = %request.job_id, "Could not lock {}: {}", request.file.display(), e);
                request.domains.iter().map(|domain| (domain.clone(), DomainResult::error(&request.file, domain, e.to_string()))).collect()
            }
        };

        self.cache.insert(
            request.file.clone(),
            CachedResults {
                results: results.clone(),
                stored_at: Instant::now(),
            },
        );

        let success = results.values().all(|r| r.status != DomainStatus::Error);
        let mut metadata = Metadata::new();
        metadata.insert("file".into(), Value::from(request.file.display().to_string()));
        metadata.insert("domains".into(), Value::from(results.len()));
        self.metrics.record_end(timer, success, metadata);

        if request.publish {
            self.fan_out(&request, &results);
        }
        if let Some(reply) = request.reply.take() {
            // caller may have gone away; the result stays in the cache
            let _ = reply.send(results);
        }
    }

    /// Run each domain in turn. Every requested domain yields exactly one
    /// result, a synthetic `error` one if its analyzer failed or panicked.
    async fn run_domains(&self, file: &Path, domains: &[String]) -> FileResults {
        let mut results = FileResults::new();
        for domain in domains {
            let timer = self.metrics.record_start(format!("domain:{domain}"));
            let started = Instant::now();

            let outcome = match self.registry.get(domain) {
                Ok(runner) => match AssertUnwindSafe(runner.sniff_file(file)).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => Err(AnalyzerError::Panicked(panic_message(panic.as_ref()))),
                },
                Err(e) => Err(AnalyzerError::Execution(e.to_string())),
            };

            let mut result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    warn!("Analyzer for domain {} failed on {}: {}", domain, file.display(), e);
                    DomainResult::error(file, domain, e.to_string())
                }
            };
            result.domain = domain.clone();
            if result.duration_ms == 0 {
                result.duration_ms = duration_ms(started.elapsed());
            }
            result.reconcile_status();

            self.metrics.record(timer, result.status != DomainStatus::Error);
            results.insert(domain.clone(), result);
        }
        results
    }

    fn fan_out(&self, request: &FileRequest, results: &FileResults) {
        for (domain, result) in results {
            let Some(queue) = self.domain_queues.get(domain) else {
                continue;
            };
            let report = DomainReport {
                job_id: request.job_id.clone(),
                file: request.file.clone(),
                result: result.clone(),
            };
            if let Err(mpsc::error::TrySendError::Full(report)) = queue.try_send(report) {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let _ = queue.send(report).await;
                });
            }
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sniffer_common::Issue;
    use sniffer_common::Severity;
    use sniffer_core::runner::DomainRunner;

    struct Fixed {
        domain: &'static str,
        issues: usize,
    }

    #[async_trait]
    impl DomainRunner for Fixed {
        fn domain(&self) -> &str {
            self.domain
        }

        async fn sniff_file(&self, path: &Path) -> Result<DomainResult, AnalyzerError> {
            let issues = (0..self.issues).map(|_| Issue::new("finding", Severity::Low, "found").at(path, Some(1))).collect();
            Ok(DomainResult::from_issues(path, self.domain, issues))
        }
    }

    struct Panics;

    #[async_trait]
    impl DomainRunner for Panics {
        fn domain(&self) -> &str {
            "panics"
        }

        async fn sniff_file(&self, _path: &Path) -> Result<DomainResult, AnalyzerError> {
            panic!("analyzer bug")
        }
    }

    fn setup(dir: &Path) -> SniffingLoop {
        let mut config = SnifferConfig::default();
        config.locking.lock_dir = dir.join("locks");
        config.locking.file_lock_timeout_ms = 2_000;
        config.locking.check_interval_ms = 10;
        config.paths.report_dir = dir.join("reports");

        let mut registry = DomainRegistry::new();
        registry.register(Arc::new(Fixed { domain: "clean", issues: 0 }));
        registry.register(Arc::new(Fixed { domain: "dirty", issues: 2 }));
        registry.register(Arc::new(Panics));
        SniffingLoop::start(Arc::new(config), Arc::new(registry), Arc::new(MetricsCollector::new()))
    }

    #[tokio::test]
    async fn test_one_result_per_domain_with_isolated_panic() {
        let dir = tempfile::tempdir().unwrap();
        let sniffing = setup(dir.path());
        let file = dir.path().join("a.py");
        std::fs::write(&file, "x = 1\n").unwrap();

        let domains = vec!["clean".to_string(), "panics".to_string(), "dirty".to_string(), "unknown".to_string()];
        let results = sniffing.sniff_file("job-1", &file, domains, Priority::default(), false).await.unwrap();

        assert_eq!(results.len(), 4);
        assert_eq!(results["clean"].status, DomainStatus::Pass);
        assert_eq!(results["dirty"].status, DomainStatus::Fail);
        assert_eq!(results["panics"].status, DomainStatus::Error);
        assert!(results["panics"].error.as_deref().unwrap().contains("analyzer bug"));
        assert!(results["panics"].issues.is_empty());
        assert_eq!(results["unknown"].status, DomainStatus::Error);

        assert!(sniffing.cached_results(&file).is_some());
        assert!(!FileLock::from_config(&sniffing.worker.config.locking, &file).marker_path().exists());
        sniffing.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_domains_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let sniffing = setup(dir.path());
        let results = sniffing.sniff_file("job-2", dir.path().join("b.py"), vec![], Priority::default(), true).await.unwrap();
        assert!(results.is_empty());
        sniffing.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_file_publishes_reports() {
        let dir = tempfile::tempdir().unwrap();
        let sniffing = setup(dir.path());
        let file = dir.path().join("c.py");
        std::fs::write(&file, "y = 2\n").unwrap();

        let job_id = sniffing.add_file(&file, vec!["dirty".to_string()], Priority::new(9).unwrap()).await.unwrap();
        let report = ReportWriter::new(dir.path().join("reports")).report_path(&DomainReport {
            job_id,
            file: file.clone(),
            result: DomainResult::from_issues(&file, "dirty", vec![]),
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while !report.exists() {
            assert!(Instant::now() < deadline, "report was never written");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sniffing.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_loop_rejects_files() {
        let dir = tempfile::tempdir().unwrap();
        let sniffing = setup(dir.path());
        sniffing.shutdown().await;
        let err = sniffing.add_file("d.py", vec![], Priority::default()).await.unwrap_err();
        assert!(matches!(err, SnifferError::QueueClosed(_)));
    }
}
