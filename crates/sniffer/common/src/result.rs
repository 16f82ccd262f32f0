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

//! Per-domain and consolidated analysis results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Issue severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Points deducted from a domain score per issue
    pub fn penalty(&self) -> f64 {
        match self {
            Self::Low => 1.0,
            Self::Medium => 5.0,
            Self::High => 10.0,
            Self::Critical => 25.0,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Where an issue was found
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{line}", self.path.display()),
            None => write!(f, "{}", self.path.display()),
        }
    }
}

/// A single finding reported by an analyzer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    #[serde(rename = "type")]
    pub issue_type: String,
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default)]
    pub recommendation: String,
    /// Originating domain; set when issues are consolidated across domains
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl Issue {
    pub fn new(issue_type: impl Into<String>, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            issue_type: issue_type.into(),
            severity,
            description: description.into(),
            location: None,
            recommendation: String::new(),
            domain: None,
        }
    }

    pub fn at(mut self, path: impl Into<PathBuf>, line: Option<usize>) -> Self {
        self.location = Some(Location { path: path.into(), line });
        self
    }

    pub fn recommend(mut self, recommendation: impl Into<String>) -> Self {
        self.recommendation = recommendation.into();
        self
    }
}

/// Outcome of one domain against one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainStatus {
    Pass,
    Fail,
    /// The analyzer itself failed; distinct from a clean pass
    Error,
}

impl fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Output of running one domain against one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainResult {
    pub file_path: PathBuf,
    pub domain: String,
    pub status: DomainStatus,
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Percentage in `[0, 100]`; `None` when the domain has no notion of coverage
    #[serde(default)]
    pub coverage: Option<f64>,
    #[serde(default)]
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DomainResult {
    /// Build a result whose status follows from the issue list
    pub fn from_issues(file_path: impl Into<PathBuf>, domain: impl Into<String>, issues: Vec<Issue>) -> Self {
        let status = if issues.is_empty() { DomainStatus::Pass } else { DomainStatus::Fail };
        Self {
            file_path: file_path.into(),
            domain: domain.into(),
            status,
            issues,
            metrics: BTreeMap::new(),
            coverage: None,
            duration_ms: 0,
            timestamp: Utc::now(),
            error: None,
        }
    }

    /// Synthetic result standing in for an analyzer that could not run
    pub fn error(file_path: impl Into<PathBuf>, domain: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            domain: domain.into(),
            status: DomainStatus::Error,
            issues: Vec::new(),
            metrics: BTreeMap::new(),
            coverage: None,
            duration_ms: 0,
            timestamp: Utc::now(),
            error: Some(message.into()),
        }
    }

    pub fn with_coverage(mut self, coverage: f64) -> Self {
        self.coverage = Some(coverage.clamp(0.0, 100.0));
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Re-derive `status` from `issues` so that `fail` holds iff issues exist.
    /// Error results are left untouched.
    pub fn reconcile_status(&mut self) {
        if self.status != DomainStatus::Error {
            self.status = if self.issues.is_empty() { DomainStatus::Pass } else { DomainStatus::Fail };
        }
        if let Some(coverage) = self.coverage {
            self.coverage = Some(coverage.clamp(0.0, 100.0));
        }
    }
}

/// A proposed source change produced by a fix-capable analyzer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fix {
    pub file_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    pub description: String,
    pub original: String,
    pub replacement: String,
}

/// Fixes produced for one domain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixSet {
    pub fixes: Vec<Fix>,
}

impl FixSet {
    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    pub fn extend(&mut self, other: FixSet) {
        self.fixes.extend(other.fixes);
    }
}

/// Everything one requested domain produced for a job, across all its files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainOutcome {
    pub domain: String,
    pub status: DomainStatus,
    pub results: Vec<DomainResult>,
    pub duration_ms: u64,
    pub coverage: Option<f64>,
    #[serde(default, skip_serializing_if = "FixSet::is_empty")]
    pub fixes: FixSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DomainOutcome {
    /// Fold the per-file results of one domain. Any `error` wins over `fail`,
    /// which wins over `pass`.
    pub fn from_results(domain: impl Into<String>, results: Vec<DomainResult>) -> Self {
        let status = if results.iter().any(|r| r.status == DomainStatus::Error) {
            DomainStatus::Error
        } else if results.iter().any(|r| r.status == DomainStatus::Fail) {
            DomainStatus::Fail
        } else {
            DomainStatus::Pass
        };

        let coverages: Vec<f64> = results.iter().filter_map(|r| r.coverage).collect();
        let coverage = if coverages.is_empty() { None } else { Some(coverages.iter().sum::<f64>() / coverages.len() as f64) };

        Self {
            domain: domain.into(),
            status,
            duration_ms: results.iter().map(|r| r.duration_ms).sum(),
            coverage,
            error: results.iter().find_map(|r| r.error.clone()),
            fixes: FixSet::default(),
            results,
        }
    }

    pub fn issues(&self) -> impl Iterator<Item = &Issue> {
        self.results.iter().flat_map(|r| r.issues.iter())
    }

    /// Score in `[0, 100]`: severity penalties deducted from 100, zero on error
    pub fn score(&self) -> f64 {
        if self.status == DomainStatus::Error {
            return 0.0;
        }
        let penalty: f64 = self.issues().map(|i| i.severity.penalty()).sum();
        (100.0 - penalty).clamp(0.0, 100.0)
    }
}

/// Overall verdict for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsolidatedStatus {
    /// Every attempted domain passed
    #[default]
    Completed,
    /// Domains ran, at least one reported issues
    Failed,
    /// At least one domain could not execute
    Error,
}

impl fmt::Display for ConsolidatedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Job-level metrics derived from domain outcomes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    /// Sum of per-domain durations
    pub duration_ms: u64,
    /// Mean over domains that reported coverage
    pub coverage: Option<f64>,
    pub files: usize,
    pub issue_count: usize,
    pub severity_counts: BTreeMap<Severity, usize>,
}

/// Audit trail attached to a consolidated result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditInfo {
    pub domains_attempted: Vec<String>,
    /// Domain name to "passed without issues"
    pub compliance: BTreeMap<String, bool>,
    /// Latest timestamp among the aggregated domain results
    pub timestamp: Option<DateTime<Utc>>,
}

/// Aggregation of every domain outcome of one job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedResult {
    pub status: ConsolidatedStatus,
    pub domains: Vec<DomainOutcome>,
    pub issues: Vec<Issue>,
    pub scores: BTreeMap<String, f64>,
    pub metrics: AggregateMetrics,
    pub audit_info: AuditInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConsolidatedResult {
    pub fn domain(&self, name: &str) -> Option<&DomainOutcome> {
        self.domains.iter().find(|d| d.domain == name)
    }

    pub fn is_success(&self) -> bool {
        self.status == ConsolidatedStatus::Completed
    }

    /// First message explaining why the job did not complete cleanly
    pub fn failure_summary(&self) -> Option<String> {
        if let Some(error) = &self.error {
            return Some(error.clone());
        }
        self.domains
            .iter()
            .find(|d| d.status == DomainStatus::Fail)
            .map(|d| format!("domain `{}` reported {} issue(s)", d.domain, d.issues().count()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(severity: Severity) -> Issue {
        Issue::new("test", severity, "finding")
    }

    #[test]
    fn test_status_follows_issues() {
        let clean = DomainResult::from_issues("a.py", "security", vec![]);
        assert_eq!(clean.status, DomainStatus::Pass);

        let dirty = DomainResult::from_issues("a.py", "security", vec![issue(Severity::High)]);
        assert_eq!(dirty.status, DomainStatus::Fail);

        let mut inconsistent = clean.clone();
        inconsistent.issues.push(issue(Severity::Low));
        inconsistent.reconcile_status();
        assert_eq!(inconsistent.status, DomainStatus::Fail);

        let mut errored = DomainResult::error("a.py", "security", "boom");
        errored.reconcile_status();
        assert_eq!(errored.status, DomainStatus::Error);
        assert!(errored.issues.is_empty());
    }

    #[test]
    fn test_outcome_folding() {
        let results = vec![
            DomainResult::from_issues("a.py", "documentation", vec![]).with_coverage(80.0),
            DomainResult::from_issues("b.py", "documentation", vec![issue(Severity::Low)]).with_coverage(40.0),
            DomainResult::from_issues("c.py", "documentation", vec![]),
        ];
        let outcome = DomainOutcome::from_results("documentation", results);
        assert_eq!(outcome.status, DomainStatus::Fail);
        assert_eq!(outcome.coverage, Some(60.0));
        assert_eq!(outcome.score(), 99.0);

        let with_error = DomainOutcome::from_results(
            "documentation",
            vec![DomainResult::from_issues("a.py", "documentation", vec![issue(Severity::Low)]), DomainResult::error("b.py", "documentation", "parse failure")],
        );
        assert_eq!(with_error.status, DomainStatus::Error);
        assert_eq!(with_error.error.as_deref(), Some("parse failure"));
        assert_eq!(with_error.score(), 0.0);
    }

    #[test]
    fn test_score_is_clamped() {
        let issues = (0..10).map(|_| issue(Severity::Critical)).collect();
        let outcome = DomainOutcome::from_results("security", vec![DomainResult::from_issues("a.py", "security", issues)]);
        assert_eq!(outcome.score(), 0.0);
    }

    #[test]
    fn test_coverage_clamped_into_range() {
        let result = DomainResult::from_issues("a.py", "unit", vec![]).with_coverage(140.0);
        assert_eq!(result.coverage, Some(100.0));
    }
}
