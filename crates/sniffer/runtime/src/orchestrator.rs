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

//! Orchestrator - runs a job across its domains and aggregates the outcome

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use sniffer_common::{
    AggregateMetrics, AnalyzerError, AuditInfo, ConsolidatedResult, ConsolidatedStatus, DomainOutcome, DomainResult, DomainStatus, FixSet, Job, JobType,
    SnifferResult,
};
use sniffer_core::metrics::{Metadata, MetricsCollector};
use sniffer_core::runner::analyzers::collect_targets;
use sniffer_core::runner::{DomainRegistry, panic_message};
use sniffer_core::SnifferConfig;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::results::ResultManager;
use crate::scheduler::JobHandler;
use crate::sniffing::{FileResults, SniffingLoop};

pub struct Orchestrator {
    config: Arc<SnifferConfig>,
    registry: Arc<DomainRegistry>,
    sniffing: Arc<SniffingLoop>,
    results: Arc<ResultManager>,
    metrics: Arc<MetricsCollector>,
}

impl Orchestrator {
    pub fn new(config: Arc<SnifferConfig>, registry: Arc<DomainRegistry>, sniffing: Arc<SniffingLoop>, results: Arc<ResultManager>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            config,
            registry,
            sniffing,
            results,
            metrics,
        }
    }

    /// Paths a job runs against
    ///
    /// A job without files runs against every source file under the
    /// workspace root, so each file is locked on its own. A workspace that
    /// cannot be listed is handed over whole and reported as an error by
    /// every domain.
    async fn targets(&self, job: &Job) -> Vec<PathBuf> {
        if !job.files.is_empty() {
            return job.files.clone();
        }

        let root = self.config.paths.workspace_root.clone();
        let walk_root = root.clone();
        match tokio::task::spawn_blocking(move || collect_targets(&walk_root)).await {
            Ok(Ok(files)) => {
                info!("Workspace {} holds {} source file(s)", root.display(), files.len());
                files
            }
            Ok(Err(e)) => {
                warn!("Cannot list workspace {}: {}", root.display(), e);
                vec![root]
            }
            Err(e) => {
                warn!("Workspace listing for {} did not finish: {}", root.display(), e);
                vec![root]
            }
        }
    }

    /// Run every requested domain over every file, aggregate, and persist
    ///
    /// The job must already be `running`. Its terminal status is written
    /// through the result manager whether or not the domains passed.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn run_job(&self, job: Job) -> SnifferResult<ConsolidatedResult> {
        let timer = self.metrics.record_start("run_job");
        let targets = self.targets(&job).await;
        let publish = job.job_type.publishes_reports();

        let requested = &job;
        let passes = targets.iter().map(|file| async move {
            match self.sniffing.sniff_file(&requested.id, file, requested.domains.clone(), requested.priority, publish).await {
                Ok(results) => results,
                Err(e) => {
                    warn!("File {} was not processed: {}", file.display(), e);
                    requested.domains.iter().map(|domain| (domain.clone(), DomainResult::error(file, domain, e.to_string()))).collect()
                }
            }
        });
        let per_file: Vec<FileResults> = join_all(passes).await;

        let mut outcomes = Vec::with_capacity(job.domains.len());
        for domain in &job.domains {
            let results: Vec<DomainResult> = per_file.iter().filter_map(|results| results.get(domain).cloned()).collect();
            let mut outcome = DomainOutcome::from_results(domain, results);
            if job.job_type == JobType::Fix {
                outcome.fixes = self.generate_fixes(&outcome).await;
            }
            outcomes.push(outcome);
        }

        let consolidated = aggregate_results(&outcomes);
        let saved = if consolidated.is_success() {
            self.results.complete(&job.id, consolidated.clone()).await
        } else {
            let summary = consolidated.failure_summary().unwrap_or_else(|| format!("job finished with status {}", consolidated.status));
            self.results.fail(&job.id, summary, Some(consolidated.clone())).await
        };

        let mut metadata = Metadata::new();
        metadata.insert("job_id".into(), job.id.clone().into());
        metadata.insert("status".into(), consolidated.status.to_string().into());
        metadata.insert("issues".into(), consolidated.issues.len().into());
        self.metrics.record_end(timer, consolidated.is_success(), metadata);

        saved?;
        info!("Job {} finished: {} ({} issue(s))", job.id, consolidated.status, consolidated.issues.len());
        Ok(consolidated)
    }

    /// Fixes for one domain. Failures are logged and leave the set empty.
    async fn generate_fixes(&self, outcome: &DomainOutcome) -> FixSet {
        let Ok(runner) = self.registry.get(&outcome.domain) else {
            return FixSet::default();
        };
        if !runner.supports_fixes() {
            return FixSet::default();
        }

        let mut fixes = FixSet::default();
        for analysis in outcome.results.iter().filter(|r| r.status != DomainStatus::Error) {
            let generated = match AssertUnwindSafe(runner.generate_fixes(analysis)).catch_unwind().await {
                Ok(generated) => generated,
                Err(panic) => Err(AnalyzerError::Panicked(panic_message(panic.as_ref()))),
            };
            match generated {
                Ok(set) => fixes.extend(set),
                Err(e) => warn!("Fix generation for {} on {} failed: {}", outcome.domain, analysis.file_path.display(), e),
            }
        }
        fixes
    }
}

#[async_trait]
impl JobHandler for Orchestrator {
    async fn handle(&self, job: Job) -> SnifferResult<()> {
        self.run_job(job).await.map(|_| ())
    }
}

/// Fold domain outcomes into one job verdict
///
/// Pure: the same outcomes always produce the same result.
pub fn aggregate_results(outcomes: &[DomainOutcome]) -> ConsolidatedResult {
    let status = if outcomes.iter().all(|o| o.status == DomainStatus::Pass) {
        ConsolidatedStatus::Completed
    } else if outcomes.iter().any(|o| o.status == DomainStatus::Error) {
        ConsolidatedStatus::Error
    } else {
        ConsolidatedStatus::Failed
    };

    let mut issues = Vec::new();
    let mut scores = BTreeMap::new();
    let mut compliance = BTreeMap::new();
    let mut severity_counts = BTreeMap::new();
    let mut files = BTreeSet::new();
    for outcome in outcomes {
        for issue in outcome.issues() {
            let mut issue = issue.clone();
            issue.domain = Some(outcome.domain.clone());
            *severity_counts.entry(issue.severity).or_insert(0) += 1;
            issues.push(issue);
        }
        scores.insert(outcome.domain.clone(), outcome.score());
        compliance.insert(outcome.domain.clone(), outcome.status == DomainStatus::Pass);
        files.extend(outcome.results.iter().map(|r| r.file_path.clone()));
    }

    let coverages: Vec<f64> = outcomes.iter().filter_map(|o| o.coverage).collect();
    let coverage = if coverages.is_empty() { None } else { Some(coverages.iter().sum::<f64>() / coverages.len() as f64) };

    ConsolidatedResult {
        status,
        domains: outcomes.to_vec(),
        metrics: AggregateMetrics {
            duration_ms: outcomes.iter().map(|o| o.duration_ms).sum(),
            coverage,
            files: files.len(),
            issue_count: issues.len(),
            severity_counts,
        },
        issues,
        scores,
        audit_info: AuditInfo {
            domains_attempted: outcomes.iter().map(|o| o.domain.clone()).collect(),
            compliance,
            timestamp: outcomes.iter().flat_map(|o| o.results.iter().map(|r| r.timestamp)).max(),
        },
        error: outcomes.iter().find_map(|o| o.error.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sniffer_common::{Issue, Severity};

    fn outcome(domain: &str, results: Vec<DomainResult>) -> DomainOutcome {
        DomainOutcome::from_results(domain, results)
    }

    #[test]
    fn test_all_pass_completes() {
        let result = aggregate_results(&[outcome("security", vec![DomainResult::from_issues("a.py", "security", vec![])])]);
        assert_eq!(result.status, ConsolidatedStatus::Completed);
        assert!(result.issues.is_empty());
        assert_eq!(result.scores["security"], 100.0);
        assert_eq!(result.audit_info.compliance["security"], true);
    }

    #[test]
    fn test_issues_are_tagged_and_counted() {
        let security = outcome("security", vec![DomainResult::from_issues("a.py", "security", vec![Issue::new("eval", Severity::High, "eval")])]);
        let quality = outcome(
            "code_quality",
            vec![DomainResult::from_issues("b.py", "code_quality", vec![Issue::new("todo", Severity::Low, "todo"), Issue::new("long", Severity::Low, "long")])],
        );
        let result = aggregate_results(&[security, quality]);

        assert_eq!(result.status, ConsolidatedStatus::Failed);
        assert_eq!(result.issues.len(), 3);
        assert_eq!(result.issues[0].domain.as_deref(), Some("security"));
        assert_eq!(result.issues[2].domain.as_deref(), Some("code_quality"));
        assert_eq!(result.metrics.severity_counts[&Severity::Low], 2);
        assert_eq!(result.metrics.files, 2);
        assert_eq!(result.scores["security"], 90.0);
        assert_eq!(result.failure_summary().unwrap(), "domain `security` reported 1 issue(s)");
    }

    #[test]
    fn test_error_wins_and_is_reported() {
        let broken = outcome("unit", vec![DomainResult::error("a.py", "unit", "pytest not found")]);
        let clean = outcome("documentation", vec![DomainResult::from_issues("a.py", "documentation", vec![])]);
        let result = aggregate_results(&[broken, clean]);

        assert_eq!(result.status, ConsolidatedStatus::Error);
        assert_eq!(result.error.as_deref(), Some("pytest not found"));
        assert_eq!(result.domains.len(), 2);
        assert_eq!(result.domain("documentation").unwrap().status, DomainStatus::Pass);
    }

    #[test]
    fn test_coverage_mean_excludes_domains_without_coverage() {
        let documentation = outcome("documentation", vec![DomainResult::from_issues("a.py", "documentation", vec![]).with_coverage(80.0)]);
        let unit = outcome("unit", vec![DomainResult::from_issues("a.py", "unit", vec![]).with_coverage(40.0)]);
        let security = outcome("security", vec![DomainResult::from_issues("a.py", "security", vec![])]);

        let mut first = DomainResult::from_issues("a.py", "x", vec![]);
        first.duration_ms = 5;
        let timed = outcome("x", vec![first]);

        let result = aggregate_results(&[documentation, unit, security, timed]);
        assert_eq!(result.metrics.coverage, Some(60.0));
        assert!(result.metrics.duration_ms >= 5);
    }

    #[test]
    fn test_no_outcomes() {
        let result = aggregate_results(&[]);
        assert_eq!(result.status, ConsolidatedStatus::Completed);
        assert!(result.audit_info.timestamp.is_none());
        assert_eq!(result.metrics.coverage, None);
    }
}
