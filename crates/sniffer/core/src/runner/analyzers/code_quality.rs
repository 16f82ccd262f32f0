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

//! Code quality analyzer - layout and hygiene checks

use async_trait::async_trait;
use sniffer_common::{AnalyzerError, DomainResult, Fix, FixSet, Issue, Severity};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::{collect_targets, read_source};
use crate::runner::{AnalysisPool, DomainRunner};

pub const DOMAIN: &str = "code_quality";

pub const MAX_LINE_LENGTH: usize = 120;
pub const MAX_FILE_LINES: usize = 1000;

const TRAILING_WHITESPACE: &str = "trailing_whitespace";

fn check_source(path: &Path, source: &str, issues: &mut Vec<Issue>) -> usize {
    let mut line_count = 0;
    for (index, line) in source.lines().enumerate() {
        line_count += 1;
        let line_no = Some(index + 1);

        let width = line.chars().count();
        if width > MAX_LINE_LENGTH {
            issues.push(
                Issue::new("line_too_long", Severity::Low, format!("Line is {width} characters long (limit {MAX_LINE_LENGTH})"))
                    .at(path, line_no)
                    .recommend("Wrap the line"),
            );
        }
        if line.ends_with([' ', '\t']) {
            issues.push(Issue::new(TRAILING_WHITESPACE, Severity::Low, "Trailing whitespace").at(path, line_no).recommend("Strip trailing whitespace"));
        }
        if line.contains("TODO") || line.contains("FIXME") {
            issues.push(Issue::new("todo_marker", Severity::Low, "Unresolved TODO/FIXME marker").at(path, line_no).recommend("Resolve the marker or track it in an issue"));
        }
    }

    if line_count > MAX_FILE_LINES {
        issues.push(
            Issue::new("file_too_long", Severity::Medium, format!("File has {line_count} lines (limit {MAX_FILE_LINES})"))
                .at(path, None)
                .recommend("Split the file into smaller modules"),
        );
    }
    line_count
}

fn analyze(path: &Path) -> Result<DomainResult, AnalyzerError> {
    let started = Instant::now();
    let targets = collect_targets(path)?;
    let mut issues = Vec::new();
    let mut lines = 0usize;
    for target in &targets {
        let source = read_source(target)?;
        lines += check_source(target, &source, &mut issues);
    }

    let mut result = DomainResult::from_issues(path, DOMAIN, issues)
        .with_metric("files_scanned", targets.len() as f64)
        .with_metric("lines_scanned", lines as f64);
    result.duration_ms = started.elapsed().as_millis() as u64;
    Ok(result)
}

/// Fixes for the mechanical findings of `analysis`
fn fixes_for(analysis: &DomainResult) -> Result<FixSet, AnalyzerError> {
    let mut by_file: BTreeMap<PathBuf, Vec<usize>> = BTreeMap::new();
    for issue in analysis.issues.iter().filter(|issue| issue.issue_type == TRAILING_WHITESPACE) {
        if let Some((path, Some(line))) = issue.location.as_ref().map(|l| (&l.path, l.line)) {
            by_file.entry(path.clone()).or_default().push(line);
        }
    }

    let mut fixes = FixSet::default();
    for (path, line_numbers) in by_file {
        let source = read_source(&path)?;
        let lines: Vec<&str> = source.lines().collect();
        for line_no in line_numbers {
            let Some(original) = line_no.checked_sub(1).and_then(|index| lines.get(index)) else {
                continue;
            };
            let replacement = original.trim_end_matches([' ', '\t']);
            if replacement != *original {
                fixes.fixes.push(Fix {
                    file_path: path.clone(),
                    line: Some(line_no),
                    description: "Strip trailing whitespace".to_string(),
                    original: (*original).to_string(),
                    replacement: replacement.to_string(),
                });
            }
        }
    }
    Ok(fixes)
}

pub struct CodeQualityRunner {
    pool: AnalysisPool,
}

impl CodeQualityRunner {
    pub fn new(pool: AnalysisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DomainRunner for CodeQualityRunner {
    fn domain(&self) -> &str {
        DOMAIN
    }

    async fn sniff_file(&self, path: &Path) -> Result<DomainResult, AnalyzerError> {
        let path = path.to_path_buf();
        self.pool.run(move || analyze(&path)).await
    }

    fn supports_fixes(&self) -> bool {
        true
    }

    async fn generate_fixes(&self, analysis: &DomainResult) -> Result<FixSet, AnalyzerError> {
        let analysis = analysis.clone();
        self.pool.run(move || fixes_for(&analysis)).await
    }
}
