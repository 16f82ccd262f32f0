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

//! Domain backed by an external command (test runners, linters)
//!
//! The command passes when it exits with status zero. Any other exit status
//! becomes a single high severity issue carrying the tail of its output.

use async_trait::async_trait;
use regex::Regex;
use sniffer_common::{AnalyzerError, ConfigError, DomainResult, Issue, Severity};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

use crate::config::ExternalDomainConfig;
use crate::runner::DomainRunner;

pub const FILE_PLACEHOLDER: &str = "{file}";

/// Lines of output kept in the failure issue
const OUTPUT_TAIL_LINES: usize = 20;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub struct ExternalRunner {
    domain: String,
    command: String,
    args: Vec<String>,
    coverage: Option<Regex>,
    timeout: Duration,
}

impl ExternalRunner {
    pub fn from_config(domain: &str, config: &ExternalDomainConfig) -> Result<Self, ConfigError> {
        let coverage = config
            .coverage_regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| ConfigError::invalid(format!("domains.external.{domain}.coverage_regex"), e.to_string()))?;
        Ok(Self {
            domain: domain.to_string(),
            command: config.command.clone(),
            args: config.args.clone(),
            coverage,
            timeout: config.timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_TIMEOUT),
        })
    }

    fn build_args(&self, path: &Path) -> Vec<String> {
        let file = path.to_string_lossy();
        self.args.iter().map(|arg| arg.replace(FILE_PLACEHOLDER, &file)).collect()
    }

    fn parse_coverage(&self, output: &str) -> Option<f64> {
        let captures = self.coverage.as_ref()?.captures_iter(output).last()?;
        captures.get(1)?.as_str().trim_end_matches('%').parse().ok()
    }
}

fn tail(output: &str, lines: usize) -> String {
    let all: Vec<&str> = output.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[async_trait]
impl DomainRunner for ExternalRunner {
    fn domain(&self) -> &str {
        &self.domain
    }

    async fn sniff_file(&self, path: &Path) -> Result<DomainResult, AnalyzerError> {
        let started = Instant::now();
        let args = self.build_args(path);
        debug!(domain = %self.domain, command = %self.command, ?args, "Running external analyzer");

        let child = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AnalyzerError::Execution(format!("failed to start `{}`: {e}", self.command)))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(|e| AnalyzerError::Execution(format!("`{}` failed: {e}", self.command)))?,
            Err(_) => return Err(AnalyzerError::Execution(format!("`{}` timed out after {:?}", self.command, self.timeout))),
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        let issues = if output.status.success() {
            Vec::new()
        } else {
            let code = output.status.code().map_or_else(|| "signal".to_string(), |c| c.to_string());
            vec![
                Issue::new("external_check_failed", Severity::High, format!("`{}` exited with {code}:\n{}", self.command, tail(&combined, OUTPUT_TAIL_LINES)))
                    .at(path, None)
                    .recommend(format!("Run `{} {}` locally and fix the reported problems", self.command, args.join(" "))),
            ]
        };

        let mut result = DomainResult::from_issues(path, &self.domain, issues);
        if let Some(code) = output.status.code() {
            result = result.with_metric("exit_code", code as f64);
        }
        if let Some(coverage) = self.parse_coverage(&combined) {
            result = result.with_coverage(coverage);
        }
        result.duration_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use sniffer_common::DomainStatus;

    fn runner(command: &str, args: &[&str], coverage_regex: Option<&str>) -> ExternalRunner {
        let config = ExternalDomainConfig {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            coverage_regex: coverage_regex.map(str::to_string),
            timeout_ms: Some(5_000),
        };
        ExternalRunner::from_config("unit", &config).unwrap()
    }

    #[tokio::test]
    async fn test_zero_exit_passes_with_coverage() {
        let runner = runner("sh", &["-c", "echo 'checked {file}'; echo 'TOTAL coverage: 87.5%'"], Some(r"coverage: ([0-9.]+)%"));
        let result = runner.sniff_file(Path::new("src/app.py")).await.unwrap();
        assert_eq!(result.status, DomainStatus::Pass);
        assert_eq!(result.coverage, Some(87.5));
        assert_eq!(result.domain, "unit");
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_with_output_tail() {
        let runner = runner("sh", &["-c", "echo 'assertion failed in {file}' >&2; exit 3"], None);
        let result = runner.sniff_file(Path::new("tests/test_app.py")).await.unwrap();
        assert_eq!(result.status, DomainStatus::Fail);
        assert_eq!(result.issues.len(), 1);
        assert!(result.issues[0].description.contains("assertion failed in tests/test_app.py"));
        assert_eq!(result.metrics["exit_code"], 3.0);
    }

    #[tokio::test]
    async fn test_missing_command_is_analyzer_error() {
        let runner = runner("definitely-not-a-real-binary-4417", &[], None);
        assert!(matches!(runner.sniff_file(Path::new("a.py")).await, Err(AnalyzerError::Execution(_))));
    }

    #[tokio::test]
    async fn test_timeout() {
        let mut runner = runner("sleep", &["5"], None);
        runner.timeout = Duration::from_millis(50);
        let err = runner.sniff_file(Path::new("a.py")).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_bad_coverage_regex_rejected() {
        let config = ExternalDomainConfig {
            command: "true".to_string(),
            args: vec![],
            coverage_regex: Some("(".to_string()),
            timeout_ms: None,
        };
        assert!(ExternalRunner::from_config("unit", &config).is_err());
    }
}
