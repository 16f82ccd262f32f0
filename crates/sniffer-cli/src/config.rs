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
use sniffer_core::SnifferConfig;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CONFIG_ENV: &str = "SNIFFER_CONFIG";
pub const LOCAL_CONFIG: &str = "sniffer.toml";

/// Pick the configuration file: the flag, then `$SNIFFER_CONFIG`, then
/// `sniffer.toml` in `cwd` when it exists
pub fn config_path(cli_config: Option<PathBuf>, env_config: Option<PathBuf>, cwd: &Path) -> Option<PathBuf> {
    cli_config.or(env_config).or_else(|| {
        let local = cwd.join(LOCAL_CONFIG);
        local.is_file().then_some(local)
    })
}

pub fn resolve_config(cli_config: Option<PathBuf>, cli_report_dir: Option<PathBuf>) -> Result<SnifferConfig> {
    let cwd = std::env::current_dir().context("Cannot determine the working directory")?;
    let env_config = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
    load(config_path(cli_config, env_config, &cwd), cli_report_dir)
}

fn load(path: Option<PathBuf>, cli_report_dir: Option<PathBuf>) -> Result<SnifferConfig> {
    let mut config = match path {
        Some(path) => {
            debug!("Loading configuration from {}", path.display());
            SnifferConfig::load_from_file(&path).with_context(|| format!("Invalid configuration {}", path.display()))?
        }
        None => SnifferConfig::default(),
    };

    // CLI report dir overrides the file
    if let Some(report_dir) = cli_report_dir {
        config.paths.report_dir = report_dir;
    }
    Ok(config)
}
