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

//! Per-domain report publishing

use serde::Serialize;
use sniffer_common::{DomainResult, SnifferResult};
use std::path::{Path, PathBuf};

/// One file's result for one domain, queued for publishing
#[derive(Debug, Clone, Serialize)]
pub struct DomainReport {
    pub job_id: String,
    pub file: PathBuf,
    pub result: DomainResult,
}

/// Writes `<report_dir>/<domain>/<job_id>-<file-slug>.json`
#[derive(Debug, Clone)]
pub struct ReportWriter {
    report_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(report_dir: impl Into<PathBuf>) -> Self {
        Self { report_dir: report_dir.into() }
    }

    pub fn report_path(&self, report: &DomainReport) -> PathBuf {
        self.report_dir
            .join(sanitize(&report.result.domain))
            .join(format!("{}-{}.json", sanitize(&report.job_id), file_slug(&report.file)))
    }

    pub async fn write(&self, report: &DomainReport) -> SnifferResult<PathBuf> {
        let path = self.report_path(report);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(report)?;
        tokio::fs::write(&path, body).await?;
        Ok(path)
    }
}

fn sanitize(value: &str) -> String {
    value.chars().map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' }).collect()
}

/// Flatten a path into a single file-name component
pub fn file_slug(path: &Path) -> String {
    let slug = sanitize(&path.to_string_lossy().replace(['/', '\\'], "_"));
    let slug = slug.trim_matches(|c| c == '_' || c == '.');
    if slug.is_empty() { "root".to_string() } else { slug.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_slug() {
        assert_eq!(file_slug(Path::new("src/app/main.py")), "src_app_main.py");
        assert_eq!(file_slug(Path::new("/abs/path with space.rs")), "abs_path_with_space.rs");
        assert_eq!(file_slug(Path::new(".")), "root");
    }

    #[tokio::test]
    async fn test_write_report() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReportWriter::new(dir.path());
        let report = DomainReport {
            job_id: "job-1".to_string(),
            file: PathBuf::from("src/a.py"),
            result: DomainResult::from_issues("src/a.py", "security", vec![]),
        };

        let path = writer.write(&report).await.unwrap();
        assert_eq!(path, dir.path().join("security").join("job-1-src_a.py.json"));
        let written: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["result"]["status"], "pass");
        assert_eq!(written["job_id"], "job-1");
    }
}
