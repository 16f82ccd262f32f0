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

//! Documentation coverage analyzer
//!
//! Finds public definitions and checks that each one carries a doc comment
//! in the idiom of its language. Coverage is the documented share of the
//! definitions found, and is absent when a target has no definitions.

use async_trait::async_trait;
use regex::Regex;
use sniffer_common::{AnalyzerError, DomainResult, Issue, Severity};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Instant;

use super::{collect_targets, read_source};
use crate::runner::{AnalysisPool, DomainRunner};

pub const DOMAIN: &str = "documentation";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Language {
    Python,
    Rust,
    Script,
}

impl Language {
    fn of(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "py" => Some(Self::Python),
            "rs" => Some(Self::Rust),
            "js" | "jsx" | "ts" | "tsx" => Some(Self::Script),
            _ => None,
        }
    }

    fn definition(self) -> &'static Regex {
        static PYTHON: OnceLock<Regex> = OnceLock::new();
        static RUST: OnceLock<Regex> = OnceLock::new();
        static SCRIPT: OnceLock<Regex> = OnceLock::new();
        match self {
            Self::Python => PYTHON.get_or_init(|| Regex::new(r"^\s*(?:async\s+)?(?:def|class)\s+([A-Za-z][A-Za-z0-9_]*)").expect("python definition pattern is valid")),
            Self::Rust => RUST.get_or_init(|| {
                Regex::new(r"^\s*pub\s+(?:async\s+)?(?:unsafe\s+)?(?:fn|struct|enum|trait|type|const|static|mod)\s+([A-Za-z_][A-Za-z0-9_]*)").expect("rust definition pattern is valid")
            }),
            Self::Script => SCRIPT.get_or_init(|| {
                Regex::new(r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?(?:function\*?|class)\s+([A-Za-z_$][A-Za-z0-9_$]*)").expect("script definition pattern is valid")
            }),
        }
    }

    fn is_documented(self, lines: &[&str], index: usize) -> bool {
        match self {
            // docstring is the first statement of the body
            Self::Python => lines[index + 1..]
                .iter()
                .map(|line| line.trim())
                .find(|line| !line.is_empty())
                .is_some_and(|line| line.starts_with("\"\"\"") || line.starts_with("'''") || line.starts_with("r\"\"\"")),
            Self::Rust => lines[..index]
                .iter()
                .rev()
                .map(|line| line.trim())
                .find(|line| !line.starts_with("#["))
                .is_some_and(|line| line.starts_with("///") || line.starts_with("#[doc")),
            Self::Script => lines[..index]
                .iter()
                .rev()
                .map(|line| line.trim())
                .find(|line| !line.is_empty())
                .is_some_and(|line| line.ends_with("*/")),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Tally {
    total: usize,
    documented: usize,
}

fn check_source(path: &Path, language: Language, source: &str, issues: &mut Vec<Issue>) -> Tally {
    let lines: Vec<&str> = source.lines().collect();
    let mut tally = Tally::default();
    for (index, line) in lines.iter().enumerate() {
        let Some(captures) = language.definition().captures(line) else {
            continue;
        };
        let name = captures.get(1).map_or("", |m| m.as_str());
        tally.total += 1;
        if language.is_documented(&lines, index) {
            tally.documented += 1;
        } else {
            issues.push(
                Issue::new("missing_documentation", Severity::Low, format!("`{name}` has no documentation"))
                    .at(path, Some(index + 1))
                    .recommend("Add a doc comment describing its purpose"),
            );
        }
    }
    tally
}

fn analyze(path: &Path) -> Result<DomainResult, AnalyzerError> {
    let started = Instant::now();
    let mut issues = Vec::new();
    let mut tally = Tally::default();
    let mut files = 0usize;

    for target in collect_targets(path)? {
        let Some(language) = Language::of(&target) else {
            continue;
        };
        files += 1;
        let source = read_source(&target)?;
        let file_tally = check_source(&target, language, &source, &mut issues);
        tally.total += file_tally.total;
        tally.documented += file_tally.documented;
    }

    let mut result = DomainResult::from_issues(path, DOMAIN, issues)
        .with_metric("files_scanned", files as f64)
        .with_metric("definitions", tally.total as f64)
        .with_metric("documented", tally.documented as f64);
    if tally.total > 0 {
        result = result.with_coverage(tally.documented as f64 * 100.0 / tally.total as f64);
    }
    result.duration_ms = started.elapsed().as_millis() as u64;
    Ok(result)
}

pub struct DocumentationRunner {
    pool: AnalysisPool,
}

impl DocumentationRunner {
    pub fn new(pool: AnalysisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DomainRunner for DocumentationRunner {
    fn domain(&self) -> &str {
        DOMAIN
    }

    async fn sniff_file(&self, path: &Path) -> Result<DomainResult, AnalyzerError> {
        let path = path.to_path_buf();
        self.pool.run(move || analyze(&path)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sniffer_common::DomainStatus;

    #[test]
    fn test_python_docstrings() {
        let source = "def documented():\n    \"\"\"Does things.\"\"\"\n    return 1\n\n\nclass Bare:\n    pass\n";
        let mut issues = Vec::new();
        let tally = check_source(Path::new("m.py"), Language::Python, source, &mut issues);
        assert_eq!(tally, Tally { total: 2, documented: 1 });
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].location.as_ref().unwrap().line, Some(6));
    }

    #[test]
    fn test_rust_doc_comments_skip_attributes() {
        let source = "/// A point\n#[derive(Debug)]\npub struct Point;\n\npub fn bare() {}\nfn private() {}\n";
        let mut issues = Vec::new();
        let tally = check_source(Path::new("lib.rs"), Language::Rust, source, &mut issues);
        assert_eq!(tally, Tally { total: 2, documented: 1 });
        assert!(issues[0].description.contains("bare"));
    }

    #[test]
    fn test_script_block_comments() {
        let source = "/** Adds. */\nexport function add(a, b) { return a + b; }\nclass Widget {}\n";
        let mut issues = Vec::new();
        let tally = check_source(Path::new("a.js"), Language::Script, source, &mut issues);
        assert_eq!(tally, Tally { total: 2, documented: 1 });
    }

    #[tokio::test]
    async fn test_coverage_reported() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("mod.py");
        std::fs::write(&file, "def a():\n    \"\"\"A.\"\"\"\n\ndef b():\n    \"\"\"B.\"\"\"\n").unwrap();

        let result = DocumentationRunner::new(AnalysisPool::new(1)).sniff_file(&file).await.unwrap();
        assert_eq!(result.status, DomainStatus::Pass);
        assert_eq!(result.coverage, Some(100.0));
    }

    #[tokio::test]
    async fn test_no_definitions_has_no_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, "just text\n").unwrap();

        let result = DocumentationRunner::new(AnalysisPool::new(1)).sniff_file(&file).await.unwrap();
        assert_eq!(result.status, DomainStatus::Pass);
        assert_eq!(result.coverage, None);
    }
}
