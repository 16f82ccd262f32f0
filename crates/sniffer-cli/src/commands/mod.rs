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

pub mod install;
pub mod sniff;
pub mod status;

use sniffer_common::{ConsolidatedResult, Job, JobStatus};
use std::process::ExitCode;

/// Issues listed in the human summary before it is cut short
const SUMMARY_ISSUE_LIMIT: usize = 50;

/// Completed means every requested domain passed
pub fn succeeded(job: &Job) -> bool {
    job.status == JobStatus::Completed
}

pub fn exit_code(job: &Job) -> ExitCode {
    if succeeded(job) { ExitCode::SUCCESS } else { ExitCode::from(1) }
}

pub fn print_job(job: &Job, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(job)?);
        return Ok(());
    }

    println!("Job {} ({}): {}", job.id, job.job_type, job.status);
    if let Some(error) = &job.error {
        println!("  Error: {}", error);
    }
    if let Some(result) = &job.result {
        print_result(result);
    }
    Ok(())
}

fn print_result(result: &ConsolidatedResult) {
    println!();
    println!("Domains:");
    for outcome in &result.domains {
        let coverage = outcome.coverage.map(|c| format!(", coverage {:.1}%", c)).unwrap_or_default();
        let fixes = if outcome.fixes.is_empty() { String::new() } else { format!(", {} fix(es)", outcome.fixes.len()) };
        println!("  {:<16} {:<6} score {:>5.1}{}{}", outcome.domain, outcome.status.to_string(), result.scores.get(&outcome.domain).copied().unwrap_or(0.0), coverage, fixes);
    }

    if result.issues.is_empty() {
        return;
    }
    println!();
    println!("Issues ({}):", result.issues.len());
    for issue in result.issues.iter().take(SUMMARY_ISSUE_LIMIT) {
        let location = issue
            .location
            .as_ref()
            .map(|l| match l.line {
                Some(line) => format!("{}:{}", l.path.display(), line),
                None => l.path.display().to_string(),
            })
            .unwrap_or_default();
        println!("  [{:?}] {} {}: {} {}", issue.severity, issue.domain.as_deref().unwrap_or("-"), issue.issue_type, issue.description, location);
    }
    if result.issues.len() > SUMMARY_ISSUE_LIMIT {
        println!("  ... {} more", result.issues.len() - SUMMARY_ISSUE_LIMIT);
    }
}
