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

//! Built-in analyzers

pub mod code_quality;
pub mod documentation;
pub mod external;
pub mod security;

pub use code_quality::CodeQualityRunner;
pub use documentation::DocumentationRunner;
pub use external::ExternalRunner;
pub use security::SecurityRunner;

use sniffer_common::AnalyzerError;
use std::path::{Path, PathBuf};

/// Extensions the text analyzers look at when walking a directory
pub const SOURCE_EXTENSIONS: &[&str] = &["py", "rs", "js", "jsx", "ts", "tsx", "go", "java", "rb", "sh", "toml", "yaml", "yml", "json"];

/// Directories never descended into
const SKIPPED_DIRS: &[&str] = &["target", "node_modules", "__pycache__", "venv"];

/// Files to analyze for `path`
///
/// A file is returned as is, whatever its extension. A directory is walked
/// recursively, skipping hidden and build directories, and yields only
/// recognised source files in a stable order.
pub fn collect_targets(path: &Path) -> Result<Vec<PathBuf>, AnalyzerError> {
    let metadata = std::fs::metadata(path).map_err(|e| AnalyzerError::io(path, &e))?;
    if metadata.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut targets = Vec::new();
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|e| AnalyzerError::io(&dir, &e))?;
        for entry in entries {
            let entry = entry.map_err(|e| AnalyzerError::io(&dir, &e))?;
            let entry_path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let file_type = entry.file_type().map_err(|e| AnalyzerError::io(&entry_path, &e))?;

            if file_type.is_dir() {
                if !name.starts_with('.') && !SKIPPED_DIRS.contains(&name.as_ref()) {
                    pending.push(entry_path);
                }
            } else if file_type.is_file() && is_source_file(&entry_path) {
                targets.push(entry_path);
            }
        }
    }
    targets.sort();
    Ok(targets)
}

pub fn is_source_file(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()).is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
}

/// Read a target as text. Non UTF-8 files are decoded lossily.
pub fn read_source(path: &Path) -> Result<String, AnalyzerError> {
    let bytes = std::fs::read(path).map_err(|e| AnalyzerError::io(path, &e))?;
    Ok(match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_skips_hidden_and_build_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src/nested")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::create_dir_all(root.join("target/debug")).unwrap();
        std::fs::write(root.join("src/main.py"), "print(1)\n").unwrap();
        std::fs::write(root.join("src/nested/lib.rs"), "fn main() {}\n").unwrap();
        std::fs::write(root.join("src/notes.bin"), [0u8, 1, 2]).unwrap();
        std::fs::write(root.join(".git/config.toml"), "").unwrap();
        std::fs::write(root.join("target/debug/out.rs"), "").unwrap();

        let targets = collect_targets(root).unwrap();
        assert_eq!(targets, vec![root.join("src/main.py"), root.join("src/nested/lib.rs")]);
    }

    #[test]
    fn test_single_file_is_returned_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("Makefile");
        std::fs::write(&file, "all:\n").unwrap();
        assert_eq!(collect_targets(&file).unwrap(), vec![file]);
    }

    #[test]
    fn test_missing_path_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(collect_targets(&dir.path().join("gone.py")), Err(AnalyzerError::Io { .. })));
    }
}
