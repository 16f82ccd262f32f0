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

//! Result manager - owns job records once they leave the scheduler
//!
//! Every status transition is written to `<job_root>/<id>/status.json`
//! (temp file, then rename) so that job status survives a restart.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sniffer_common::{ConsolidatedResult, Job, JobStatus, JobStatusView, SnifferError, SnifferResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

pub const STATUS_FILE: &str = "status.json";

/// In-memory records are readable at any time; writers of one job are
/// serialized by that job's write lock, which is never held by readers.
#[derive(Debug)]
pub struct ResultManager {
    jobs: DashMap<String, Job>,
    writes: DashMap<String, Arc<Mutex<()>>>,
    job_root: PathBuf,
    finished: Notify,
}

impl ResultManager {
    pub fn new(job_root: impl Into<PathBuf>) -> Self {
        Self {
            jobs: DashMap::new(),
            writes: DashMap::new(),
            job_root: job_root.into(),
            finished: Notify::new(),
        }
    }

    pub fn job_root(&self) -> &Path {
        &self.job_root
    }

    /// Directory holding the persisted record of `job_id`
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.job_root.join(dir_name(job_id))
    }

    pub fn status_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join(STATUS_FILE)
    }

    /// Register a freshly queued job
    pub async fn insert(&self, job: Job) -> SnifferResult<()> {
        let write = match self.writes.entry(job.id.clone()) {
            Entry::Occupied(_) => return Err(SnifferError::DuplicateJob(job.id)),
            Entry::Vacant(slot) => Arc::clone(slot.insert(Arc::new(Mutex::new(()))).value()),
        };
        let _write = write.lock().await;

        if let Err(e) = persist(&self.status_path(&job.id), &job).await {
            self.writes.remove(&job.id);
            return Err(e);
        }
        self.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    /// Apply `change` to a job and persist the new state. Nothing is written
    /// if `change` fails.
    async fn update<F>(&self, job_id: &str, change: F) -> SnifferResult<Job>
    where
        F: FnOnce(&mut Job) -> SnifferResult<()>,
    {
        let write = self.writes.get(job_id).map(|w| Arc::clone(w.value())).ok_or_else(|| SnifferError::JobNotFound(job_id.to_string()))?;
        let _write = write.lock().await;

        let mut next = self.get(job_id).ok_or_else(|| SnifferError::JobNotFound(job_id.to_string()))?;
        change(&mut next)?;
        persist(&self.status_path(job_id), &next).await?;
        self.jobs.insert(job_id.to_string(), next.clone());

        info!("Job {} is now {}", job_id, next.status);
        if next.status.is_terminal() {
            self.finished.notify_waiters();
        }
        Ok(next)
    }

    pub async fn mark_running(&self, job_id: &str) -> SnifferResult<Job> {
        self.update(job_id, Job::mark_running).await
    }

    pub async fn complete(&self, job_id: &str, result: ConsolidatedResult) -> SnifferResult<Job> {
        self.update(job_id, |job| job.mark_completed(result)).await
    }

    pub async fn fail(&self, job_id: &str, error: impl Into<String>, result: Option<ConsolidatedResult>) -> SnifferResult<Job> {
        let error = error.into();
        self.update(job_id, |job| job.mark_failed(error, result)).await
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.get(job_id).map(|job| job.clone())
    }

    /// In-memory record, falling back to the persisted one
    pub fn load(&self, job_id: &str) -> SnifferResult<Job> {
        if let Some(job) = self.get(job_id) {
            return Ok(job);
        }
        load_status(&self.status_path(job_id))?.ok_or_else(|| SnifferError::JobNotFound(job_id.to_string()))
    }

    pub fn status(&self, job_id: &str) -> SnifferResult<JobStatusView> {
        self.load(job_id).map(|job| job.status_view())
    }

    pub fn jobs_with_status(&self, status: JobStatus) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.iter().filter(|job| job.status == status).map(|job| job.clone()).collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Wait until `job_id` is completed or failed
    ///
    /// Returns the latest record when `timeout` elapses first; callers check
    /// `status.is_terminal()`.
    pub async fn wait_for(&self, job_id: &str, timeout: Duration) -> SnifferResult<Job> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let job = self.load(job_id)?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!("Timed out waiting for job {}", job_id);
                return self.load(job_id);
            }
        }
    }
}

/// Job ids come from callers; keep them to one safe path component
fn dir_name(job_id: &str) -> String {
    let name: String = job_id.chars().map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' }).collect();
    if name.is_empty() || name.chars().all(|c| c == '.') { format!("_{name}") } else { name }
}

async fn persist(path: &Path, job: &Job) -> SnifferResult<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    tokio::fs::create_dir_all(dir).await?;
    let mut payload = serde_json::to_vec_pretty(job)?;
    payload.push(b'\n');

    let tmp = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&payload).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Read a persisted job record; `Ok(None)` when none exists
pub fn load_status(path: &Path) -> SnifferResult<Option<Job>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
