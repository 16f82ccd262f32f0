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

//! Job scheduler
//!
//! Jobs are routed to one of four FIFO queues by their shape:
//!
//! - priority >= 8: `priority`
//! - explicit domains: `domain`
//! - explicit files: `file`
//! - anything else: `analysis`
//!
//! Each queue is drained by its own supervised processing loop, so the
//! priority queue is a dedicated lane rather than a preemption mechanism.

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use sniffer_common::{Job, JobRequest, JobStatus, JobStatusView, SnifferError, SnifferResult};
use sniffer_core::SnifferConfig;
use sniffer_core::runner::{DomainRegistry, panic_message};
use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::results::ResultManager;
use crate::supervisor::{RestartCount, SharedReceiver, Shutdown, shared, spawn_supervised, triggered};

/// Whatever runs a dequeued job to completion
///
/// The scheduler marks the job `running` before calling `handle`; the
/// handler is responsible for the terminal transition.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> SnifferResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Priority,
    Domain,
    File,
    Analysis,
}

impl QueueKind {
    pub const ALL: [QueueKind; 4] = [QueueKind::Priority, QueueKind::Domain, QueueKind::File, QueueKind::Analysis];

    /// Static routing of a submission, decided before domain defaults apply
    pub fn classify(request: &JobRequest) -> Self {
        if request.priority.is_high() {
            Self::Priority
        } else if !request.domains.is_empty() {
            Self::Domain
        } else if !request.files.is_empty() {
            Self::File
        } else {
            Self::Analysis
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Priority => "priority",
            Self::Domain => "domain",
            Self::File => "file",
            Self::Analysis => "analysis",
        }
    }

    fn capacity(&self, config: &SnifferConfig) -> usize {
        match self {
            Self::Priority => config.queues.priority,
            Self::Domain => config.queues.domain,
            Self::File => config.queues.file,
            Self::Analysis => config.queues.analysis,
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Queue {
    kind: QueueKind,
    tx: mpsc::Sender<Job>,
    rx: SharedReceiver<Job>,
    capacity: usize,
    enqueued: AtomicU64,
    completed: AtomicU64,
}

#[derive(Debug, Default)]
struct ActiveSet {
    ids: HashSet<String>,
    /// Set by `stop`; jobs dequeued afterwards are dropped, not started
    closed: bool,
}

struct Processor {
    results: Arc<ResultManager>,
    handler: Arc<dyn JobHandler>,
    active: parking_lot::Mutex<ActiveSet>,
    active_count: watch::Sender<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub name: QueueKind,
    pub capacity: usize,
    pub depth: usize,
    pub enqueued: u64,
    pub completed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub accepting: bool,
    pub active_jobs: Vec<String>,
    pub queues: Vec<QueueStatus>,
    pub processor_restarts: u64,
}

pub struct JobScheduler {
    config: Arc<SnifferConfig>,
    registry: Arc<DomainRegistry>,
    queues: Vec<Arc<Queue>>,
    processor: Arc<Processor>,
    accepting: AtomicBool,
    /// Held shared while a submission is recorded and enqueued, exclusively
    /// while intake is closed
    intake: tokio::sync::RwLock<()>,
    shutdown: Shutdown,
    restarts: Arc<RestartCount>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
    /// Create the queues and spawn one supervised processing loop per queue
    pub fn start(config: Arc<SnifferConfig>, registry: Arc<DomainRegistry>, results: Arc<ResultManager>, handler: Arc<dyn JobHandler>) -> Self {
        let (active_count, _) = watch::channel(0);
        let processor = Arc::new(Processor {
            results,
            handler,
            active: parking_lot::Mutex::new(ActiveSet::default()),
            active_count,
        });
        let shutdown = Shutdown::new();
        let restarts = Arc::new(RestartCount::default());

        let mut queues = Vec::with_capacity(QueueKind::ALL.len());
        let mut handles = Vec::with_capacity(QueueKind::ALL.len());
        for kind in QueueKind::ALL {
            let capacity = kind.capacity(&config);
            let (tx, rx) = mpsc::channel(capacity);
            let queue = Arc::new(Queue {
                kind,
                tx,
                rx: shared(rx),
                capacity,
                enqueued: AtomicU64::new(0),
                completed: AtomicU64::new(0),
            });

            let (loop_queue, loop_processor, stop) = (queue.clone(), processor.clone(), shutdown.clone());
            handles.push(spawn_supervised(format!("queue:{kind}"), config.workers.restart_delay(), &shutdown, restarts.clone(), move || {
                queue_loop(loop_queue.clone(), loop_processor.clone(), stop.clone())
            }));
            queues.push(queue);
        }

        info!("Job scheduler started");
        Self {
            config,
            registry,
            queues,
            processor,
            accepting: AtomicBool::new(true),
            intake: tokio::sync::RwLock::new(()),
            shutdown,
            restarts,
            handles: parking_lot::Mutex::new(handles),
        }
    }

    fn queue(&self, kind: QueueKind) -> &Arc<Queue> {
        // queues are created in QueueKind::ALL order
        &self.queues[kind as usize]
    }

    /// Validate a submission, record it as queued and place it on exactly one queue
    #[instrument(skip(self, request), fields(job_type = %request.job_type))]
    pub async fn schedule(&self, request: JobRequest) -> SnifferResult<String> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SnifferError::SchedulerStopped);
        }
        self.registry.ensure_known(&request.domains)?;

        let kind = QueueKind::classify(&request);
        let job = Job::from_request(request, &self.config.domains.enabled);
        let job_id = job.id.clone();
        let queue = self.queue(kind);

        let permit = queue.tx.reserve().await.map_err(|_| SnifferError::QueueClosed(kind.to_string()))?;
        // A full queue may have parked us across a stop
        let _intake = self.intake.read().await;
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SnifferError::SchedulerStopped);
        }
        self.processor.results.insert(job.clone()).await?;
        permit.send(job);
        queue.enqueued.fetch_add(1, Ordering::Relaxed);

        info!("Job {} queued on {} queue", job_id, kind);
        Ok(job_id)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn active_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.processor.active.lock().ids.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Read-only snapshot of every queue
    pub fn get_queue_status(&self) -> SchedulerStatus {
        SchedulerStatus {
            accepting: self.is_accepting(),
            active_jobs: self.active_jobs(),
            queues: self
                .queues
                .iter()
                .map(|queue| QueueStatus {
                    name: queue.kind,
                    capacity: queue.capacity,
                    depth: queue.capacity - queue.tx.capacity(),
                    enqueued: queue.enqueued.load(Ordering::Relaxed),
                    completed: queue.completed.load(Ordering::Relaxed),
                })
                .collect(),
            processor_restarts: self.restarts.get(),
        }
    }

    pub fn get_job_status(&self, job_id: &str) -> SnifferResult<JobStatusView> {
        self.processor.results.status(job_id)
    }

    /// Stop accepting jobs, let active jobs finish, then clear the queues
    ///
    /// No queued job is started once `stop` begins. Waits without a bound;
    /// callers wrap this in their own timeout. Jobs cleared from the queues
    /// keep their `queued` status.
    pub async fn stop(&self) {
        {
            let _intake = self.intake.write().await;
            self.accepting.store(false, Ordering::SeqCst);
        }
        let mut active_count = self.processor.active_count.subscribe();
        {
            let mut active = self.processor.active.lock();
            active.closed = true;
            info!("Job scheduler stopping, {} active job(s)", active.ids.len());
        }

        loop {
            if self.processor.active.lock().ids.is_empty() {
                break;
            }
            if active_count.changed().await.is_err() {
                break;
            }
        }

        self.shutdown.trigger();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        let mut dropped = 0usize;
        for queue in &self.queues {
            let mut rx = queue.rx.lock().await;
            while let Ok(job) = rx.try_recv() {
                warn!("Dropping job {} from {} queue; it stays queued", job.id, queue.kind);
                dropped += 1;
            }
        }
        info!("Job scheduler stopped, {} queued job(s) dropped", dropped);
    }
}

async fn queue_loop(queue: Arc<Queue>, processor: Arc<Processor>, shutdown: Shutdown) {
    let mut stop = shutdown.subscribe();
    loop {
        let job = {
            let mut rx = queue.rx.lock().await;
            tokio::select! {
                biased;
                _ = triggered(&mut stop) => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else {
            break;
        };
        processor.process(&queue, job).await;
    }
}

impl Processor {
    fn activate(&self, job_id: &str) -> bool {
        let mut active = self.active.lock();
        if active.closed {
            return false;
        }
        active.ids.insert(job_id.to_string());
        self.active_count.send_replace(active.ids.len());
        true
    }

    fn deactivate(&self, job_id: &str) {
        let mut active = self.active.lock();
        active.ids.remove(job_id);
        self.active_count.send_replace(active.ids.len());
    }

    async fn process(&self, queue: &Queue, job: Job) {
        let job_id = job.id.clone();
        if !self.activate(&job_id) {
            warn!("Dropping job {} dequeued after stop; it stays queued", job_id);
            return;
        }

        match AssertUnwindSafe(self.run(job)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Job {} failed in {} queue: {}", job_id, queue.kind, e);
                self.fail_unfinished(&job_id, e.to_string()).await;
            }
            Err(panic) => {
                let crash = SnifferError::QueueProcessorCrash {
                    queue: queue.kind.to_string(),
                    reason: panic_message(panic.as_ref()),
                };
                error!("Job {} crashed: {}", job_id, crash);
                self.fail_unfinished(&job_id, crash.to_string()).await;
            }
        }

        self.deactivate(&job_id);
        queue.completed.fetch_add(1, Ordering::Relaxed);
    }

    async fn run(&self, job: Job) -> SnifferResult<()> {
        self.results.mark_running(&job.id).await?;
        self.handler.handle(job).await
    }

    /// Drive a job that did not finish normally to `failed`, through
    /// `running` if it never got there
    async fn fail_unfinished(&self, job_id: &str, error: String) {
        let Some(job) = self.results.get(job_id) else {
            return;
        };
        if job.status.is_terminal() {
            return;
        }
        if job.status == JobStatus::Queued {
            if let Err(e) = self.results.mark_running(job_id).await {
                error!("Could not mark job {} running: {}", job_id, e);
                return;
            }
        }
        if let Err(e) = self.results.fail(job_id, error, job.result).await {
            error!("Could not mark job {} failed: {}", job_id, e);
        }
    }
}
