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

//! Job model: submission requests, lifecycle and status views

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{SnifferError, SnifferResult};
use crate::result::ConsolidatedResult;

/// Kind of work a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Run domains and publish per-file reports
    #[default]
    Sniff,
    /// Run domains without publishing per-file reports
    Analyze,
    /// Run domains, then ask fix-capable analyzers for fixes
    Fix,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sniff => "sniff",
            Self::Analyze => "analyze",
            Self::Fix => "fix",
        }
    }

    /// Whether per-file results are fanned out to the domain report queues
    pub fn publishes_reports(&self) -> bool {
        !matches!(self, Self::Analyze)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sniff" => Ok(Self::Sniff),
            "analyze" => Ok(Self::Analyze),
            "fix" => Ok(Self::Fix),
            other => Err(format!("unknown job type `{other}`")),
        }
    }
}

/// Job lifecycle state. Transitions only move forward:
/// `queued -> running -> {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running) | (Self::Running, Self::Completed) | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Job priority in the range 0-9
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const MAX: u8 = 9;
    /// Jobs at or above this priority go to the dedicated priority lane
    pub const HIGH_THRESHOLD: u8 = 8;

    pub fn new(value: u8) -> SnifferResult<Self> {
        if value > Self::MAX {
            return Err(SnifferError::InvalidPriority(value));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn is_high(&self) -> bool {
        self.0 >= Self::HIGH_THRESHOLD
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self(1)
    }
}

impl TryFrom<u8> for Priority {
    type Error = SnifferError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> u8 {
        priority.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generate a time-derived job id. Ids minted in the same microsecond by
/// this process are disambiguated by a sequence suffix.
pub fn generate_job_id() -> String {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("job-{}-{seq}", Utc::now().format("%Y%m%dT%H%M%S%6f"))
}

/// Job submission as received from the presentation layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub job_type: JobType,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
}

impl JobRequest {
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_files<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domains = domains.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Unit of scheduled work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub files: Vec<PathBuf>,
    pub domains: Vec<String>,
    pub priority: Priority,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<ConsolidatedResult>,
    pub error: Option<String>,
}

impl Job {
    /// Create a queued job. An empty domain list in the request falls back to
    /// `default_domains`; duplicates are dropped, first occurrence wins.
    pub fn from_request(request: JobRequest, default_domains: &[String]) -> Self {
        let requested = if request.domains.is_empty() { default_domains.to_vec() } else { request.domains };
        let mut domains: Vec<String> = Vec::with_capacity(requested.len());
        for domain in requested {
            if !domains.contains(&domain) {
                domains.push(domain);
            }
        }

        Self {
            id: request.id.unwrap_or_else(generate_job_id),
            job_type: request.job_type,
            files: request.files,
            domains,
            priority: request.priority,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    fn transition(&mut self, next: JobStatus) -> SnifferResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(SnifferError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_running(&mut self) -> SnifferResult<()> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_completed(&mut self, result: ConsolidatedResult) -> SnifferResult<()> {
        self.transition(JobStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, result: Option<ConsolidatedResult>) -> SnifferResult<()> {
        self.transition(JobStatus::Failed)?;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
        self.result = result;
        Ok(())
    }

    /// Status query payload: `{id, status, timestamp, error?, results?, metrics?}`
    pub fn status_view(&self) -> JobStatusView {
        let timestamp = self.completed_at.or(self.started_at).unwrap_or(self.created_at);
        JobStatusView {
            id: self.id.clone(),
            status: self.status,
            timestamp,
            error: self.error.clone(),
            results: self.result.clone(),
            metrics: self.result.as_ref().map(|r| r.metrics.clone()),
        }
    }
}

/// Read-only projection of a job for status queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: String,
    pub status: JobStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<ConsolidatedResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<crate::result::AggregateMetrics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_only_move_forward() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));

        assert!(!Queued.can_transition_to(Completed));
        assert!(!Queued.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Queued));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Queued));
    }

    #[test]
    fn test_job_cannot_skip_running() {
        let mut job = Job::from_request(JobRequest::new(JobType::Sniff), &["security".to_string()]);
        let err = job.mark_completed(ConsolidatedResult::default()).unwrap_err();
        assert!(matches!(err, SnifferError::InvalidTransition { .. }));
        assert_eq!(job.status, JobStatus::Queued);

        job.mark_running().unwrap();
        assert!(job.started_at.is_some());
        job.mark_failed("boom", None).unwrap();
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert!(job.mark_running().is_err());
    }

    #[test]
    fn test_default_domains_and_dedup() {
        let defaults = vec!["security".to_string(), "documentation".to_string()];
        let job = Job::from_request(JobRequest::new(JobType::Sniff), &defaults);
        assert_eq!(job.domains, defaults);

        let request = JobRequest::new(JobType::Sniff).with_domains(["unit", "security", "unit"]);
        let job = Job::from_request(request, &defaults);
        assert_eq!(job.domains, vec!["unit".to_string(), "security".to_string()]);
    }

    #[test]
    fn test_priority_bounds() {
        assert!(Priority::new(9).is_ok());
        assert!(matches!(Priority::new(10), Err(SnifferError::InvalidPriority(10))));
        assert!(Priority::new(8).unwrap().is_high());
        assert!(!Priority::default().is_high());
        assert_eq!(Priority::default().value(), 1);
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: JobRequest = serde_json::from_str(r#"{"type":"fix","files":["a.py"]}"#).unwrap();
        assert_eq!(request.job_type, JobType::Fix);
        assert_eq!(request.priority, Priority::default());
        assert!(request.domains.is_empty());

        let bad = serde_json::from_str::<JobRequest>(r#"{"type":"sniff","priority":12}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_generated_ids_are_unique_within_process() {
        let a = generate_job_id();
        let b = generate_job_id();
        assert_ne!(a, b);
        assert!(a.starts_with("job-"));
    }
}
