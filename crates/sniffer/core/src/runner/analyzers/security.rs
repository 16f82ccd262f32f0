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

//! Pattern based security analyzer

use async_trait::async_trait;
use regex::Regex;
use sniffer_common::{AnalyzerError, ConfigError, DomainResult, Issue, Severity};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use super::{collect_targets, read_source};
use crate::runner::{AnalysisPool, DomainRunner};

pub const DOMAIN: &str = "security";

struct RuleSpec {
    id: &'static str,
    pattern: &'static str,
    severity: Severity,
    description: &'static str,
    recommendation: &'static str,
}

const RULES: &[RuleSpec] = &[
    RuleSpec {
        id: "hardcoded_secret",
        pattern: r#"(?i)\b(password|passwd|secret|api_?key|access_?token|auth_?token)\b\s*[:=]\s*["'][^"'\s]{4,}["']"#,
        severity: Severity::High,
        description: "Hardcoded credential",
        recommendation: "Load credentials from the environment or a secret store",
    },
    RuleSpec {
        id: "aws_access_key",
        pattern: r"\bAKIA[0-9A-Z]{16}\b",
        severity: Severity::Critical,
        description: "AWS access key id in source",
        recommendation: "Revoke the key and load it from the environment",
    },
    RuleSpec {
        id: "private_key",
        pattern: r"-----BEGIN (RSA |EC |DSA |OPENSSH )?PRIVATE KEY-----",
        severity: Severity::Critical,
        description: "Private key material in source",
        recommendation: "Remove the key from the repository and rotate it",
    },
    RuleSpec {
        id: "dynamic_eval",
        pattern: r"\b(eval|exec)\s*\(",
        severity: Severity::High,
        description: "Dynamic code evaluation",
        recommendation: "Avoid evaluating strings as code",
    },
    RuleSpec {
        id: "shell_injection",
        pattern: r"(shell\s*=\s*True|\bos\.system\s*\(|\bos\.popen\s*\()",
        severity: Severity::High,
        description: "Command executed through a shell",
        recommendation: "Pass an argument list and avoid shell interpolation",
    },
    RuleSpec {
        id: "weak_hash",
        pattern: r"(?i)\b(hashlib\.)?(md5|sha1)\s*\(",
        severity: Severity::Medium,
        description: "Weak hash function",
        recommendation: "Use SHA-256 or a dedicated password hash",
    },
    RuleSpec {
        id: "tls_verification_disabled",
        pattern: r"verify\s*=\s*False",
        severity: Severity::High,
        description: "TLS certificate verification disabled",
        recommendation: "Keep certificate verification enabled",
    },
    RuleSpec {
        id: "unsafe_deserialization",
        pattern: r"\b(pickle\.loads?|yaml\.load)\s*\(",
        severity: Severity::High,
        description: "Unsafe deserialization of untrusted data",
        recommendation: "Use a safe loader such as yaml.safe_load or a schema-checked format",
    },
];

struct Rule {
    id: &'static str,
    pattern: Regex,
    severity: Severity,
    description: &'static str,
    recommendation: &'static str,
}

pub struct SecurityRunner {
    rules: Arc<Vec<Rule>>,
    pool: AnalysisPool,
}

impl SecurityRunner {
    pub fn new(pool: AnalysisPool) -> Result<Self, ConfigError> {
        let rules = RULES
            .iter()
            .map(|spec| {
                let pattern = Regex::new(spec.pattern).map_err(|e| ConfigError::invalid(format!("security rule {}", spec.id), e.to_string()))?;
                Ok(Rule {
                    id: spec.id,
                    pattern,
                    severity: spec.severity,
                    description: spec.description,
                    recommendation: spec.recommendation,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self { rules: Arc::new(rules), pool })
    }
}

fn scan(rules: &[Rule], path: &Path) -> Result<DomainResult, AnalyzerError> {
    let started = Instant::now();
    let targets = collect_targets(path)?;
    let mut issues = Vec::new();
    let mut lines_scanned = 0usize;

    for target in &targets {
        let source = read_source(target)?;
        for (index, line) in source.lines().enumerate() {
            lines_scanned += 1;
            let trimmed = line.trim_start();
            if trimmed.starts_with("//") && !trimmed.contains("PRIVATE KEY") {
                continue;
            }
            for rule in rules.iter().filter(|rule| rule.pattern.is_match(line)) {
                issues.push(
                    Issue::new(rule.id, rule.severity, rule.description)
                        .at(target, Some(index + 1))
                        .recommend(rule.recommendation),
                );
            }
        }
    }

    let mut result = DomainResult::from_issues(path, DOMAIN, issues)
        .with_metric("files_scanned", targets.len() as f64)
        .with_metric("lines_scanned", lines_scanned as f64);
    result.duration_ms = started.elapsed().as_millis() as u64;
    Ok(result)
}

#[async_trait]
impl DomainRunner for SecurityRunner {
    fn domain(&self) -> &str {
        DOMAIN
    }

    async fn sniff_file(&self, path: &Path) -> Result<DomainResult, AnalyzerError> {
        let rules = self.rules.clone();
        let path = path.to_path_buf();
        self.pool.run(move || scan(&rules, &path)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sniffer_common::DomainStatus;

    fn runner() -> SecurityRunner {
        SecurityRunner::new(AnalysisPool::new(1)).unwrap()
    }

    #[tokio::test]
    async fn test_clean_file_passes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("clean.py");
        std::fs::write(&file, "def add(a, b):\n    return a + b\n").unwrap();

        let result = runner().sniff_file(&file).await.unwrap();
        assert_eq!(result.status, DomainStatus::Pass);
        assert!(result.issues.is_empty());
        assert_eq!(result.metrics["files_scanned"], 1.0);
    }

    #[tokio::test]
    async fn test_findings_carry_location() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bad.py");
        std::fs::write(&file, "import os\npassword = \"hunter22\"\nos.system(cmd)\nresult = eval(data)\n").unwrap();

        let result = runner().sniff_file(&file).await.unwrap();
        assert_eq!(result.status, DomainStatus::Fail);
        let ids: Vec<_> = result.issues.iter().map(|i| i.issue_type.as_str()).collect();
        assert_eq!(ids, vec!["hardcoded_secret", "shell_injection", "dynamic_eval"]);
        let location = result.issues[0].location.as_ref().unwrap();
        assert_eq!(location.line, Some(2));
        assert_eq!(location.path, file);
    }

    #[tokio::test]
    async fn test_missing_file_is_analyzer_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = runner().sniff_file(&dir.path().join("missing.py")).await.unwrap_err();
        assert!(matches!(err, AnalyzerError::Io { .. }));
    }
}
