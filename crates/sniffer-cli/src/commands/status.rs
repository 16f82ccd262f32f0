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

use anyhow::{Context, Result};
use sniffer_runtime::ResultManager;
use std::path::PathBuf;
use std::process::ExitCode;

use super::{exit_code, print_job};
use crate::config::resolve_config;

/// Print the persisted record of `job_id`. Exits 1 unless it completed.
pub fn show_status(job_id: &str, config: Option<PathBuf>, json: bool) -> Result<ExitCode> {
    let config = resolve_config(config, None)?;
    let results = ResultManager::new(&config.paths.job_root);
    let job = results.load(job_id).with_context(|| format!("No status for job {} under {}", job_id, config.paths.job_root.display()))?;

    print_job(&job, json)?;
    Ok(exit_code(&job))
}
