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

use anyhow::{Context, Result, bail};
use sniffer_common::{Job, JobRequest, JobType, Priority};
use sniffer_runtime::Sniffer;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};

use super::{exit_code, print_job};
use crate::JobArgs;
use crate::config::resolve_config;

/// Run one job to completion and report it
pub async fn run(args: JobArgs, job_type: JobType) -> Result<ExitCode> {
    let config = resolve_config(args.config.clone(), args.report_dir.clone())?;
    let report_dir = config.paths.report_dir.clone();
    let priority = Priority::new(args.priority)?;

    let sniffer = Sniffer::start(config).context("Failed to start the sniffer")?;
    let request = JobRequest::new(job_type).with_files(args.files.iter().cloned()).with_domains(args.domains.iter().cloned()).with_priority(priority);

    let outcome = run_job(&sniffer, request, Duration::from_secs(args.timeout_secs)).await;
    sniffer.shutdown().await;
    let job = outcome?;

    match write_summary(&report_dir, &job) {
        Ok(path) => info!("Summary written to {}", path.display()),
        Err(e) => warn!("Could not write the job summary: {:#}", e),
    }
    print_job(&job, args.json)?;
    Ok(exit_code(&job))
}

async fn run_job(sniffer: &Sniffer, request: JobRequest, timeout: Duration) -> Result<Job> {
    let id = sniffer.submit(request).await.context("Job was rejected")?;
    info!("Submitted job {}", id);

    let job = sniffer.wait(&id, timeout).await?;
    if !job.status.is_terminal() {
        bail!("Job {} still {} after {}s", id, job.status, timeout.as_secs());
    }
    Ok(job)
}

/// Write the consolidated job record to `<report_dir>/summary-<job_id>.json`
pub fn write_summary(report_dir: &Path, job: &Job) -> Result<PathBuf> {
    std::fs::create_dir_all(report_dir).with_context(|| format!("Cannot create {}", report_dir.display()))?;
    let path = report_dir.join(format!("summary-{}.json", job.id));
    let content = serde_json::to_vec_pretty(job)?;
    std::fs::write(&path, content).with_context(|| format!("Cannot write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::succeeded;
    use sniffer_common::JobStatus;

    #[test]
    fn test_summary_lands_in_report_dir() {
        let dir = tempfile::tempdir().unwrap();
        let report_dir = dir.path().join("reports");
        let job = Job::from_request(JobRequest::new(JobType::Sniff).with_id("job-7"), &["security".to_string()]);

        let path = write_summary(&report_dir, &job).unwrap();
        assert_eq!(path, report_dir.join("summary-job-7.json"));
        let saved: Job = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(saved.status, JobStatus::Queued);
        assert_eq!(saved.domains, vec!["security"]);
    }

    #[test]
    fn test_only_completed_jobs_exit_cleanly() {
        let mut job = Job::from_request(JobRequest::new(JobType::Fix), &["security".to_string()]);
        assert!(!succeeded(&job));

        job.mark_running().unwrap();
        let mut failed = job.clone();
        failed.mark_failed("domain `security` reported 1 issue(s)", None).unwrap();
        assert!(!succeeded(&failed));

        job.mark_completed(Default::default()).unwrap();
        assert!(succeeded(&job));
    }
}
