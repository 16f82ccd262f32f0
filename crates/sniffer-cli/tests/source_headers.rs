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

//! Every source file in the workspace carries the project license header

use std::path::{Path, PathBuf};

fn rust_sources(dir: &Path, found: &mut Vec<PathBuf>) {
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            rust_sources(&path, found);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            found.push(path);
        }
    }
}

#[test]
fn every_source_file_names_this_project_in_its_header() {
    let crates = Path::new(env!("CARGO_MANIFEST_DIR")).parent().unwrap();
    let mut sources = Vec::new();
    rust_sources(crates, &mut sources);
    assert!(sources.len() > 20);

    for source in sources {
        let content = std::fs::read_to_string(&source).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("// Sniffer"), "{}", source.display());
        assert_eq!(lines.next(), Some("// Copyright (C) 2025 Synerthink"), "{}", source.display());
        assert!(content.contains("GNU Affero General Public License"), "{}", source.display());
    }
}
