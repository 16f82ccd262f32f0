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

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod config;

use anyhow::Result;
use sniffer_common::{JobType, Priority};
use sniffer_core::logging::{self, LogConfig};

/// Code analysis across security, documentation and quality domains
#[derive(Parser, Debug)]
#[command(name = "sniffer", about = "Multi-domain code sniffer", version)]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags shared by the job-running commands
#[derive(Args, Debug, Clone)]
pub struct JobArgs {
    /// Comma separated files or directories; the workspace root when omitted
    #[arg(long, value_delimiter = ',')]
    pub files: Vec<PathBuf>,

    /// Comma separated domains; every enabled domain when omitted
    #[arg(long, value_delimiter = ',')]
    pub domains: Vec<String>,

    /// Path to configuration file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Report directory (overrides paths.report_dir)
    #[arg(long)]
    pub report_dir: Option<PathBuf>,

    /// Job priority, 0-9; 8 and above takes the priority queue
    #[arg(long, default_value_t = Priority::default().value())]
    pub priority: u8,

    /// Give up waiting for the job after this many seconds
    #[arg(long, default_value_t = 3600)]
    pub timeout_secs: u64,

    /// Print the job record as JSON instead of a summary
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Analyze files and publish per-domain reports
    Sniff(JobArgs),

    /// Analyze files and generate fixes where a domain supports it
    Fix(JobArgs),

    /// Install a git pre-commit hook that sniffs staged files
    Install {
        /// Configuration file the hook passes to `sniffer sniff`
        #[arg(long)]
        config: Option<PathBuf>,

        /// Repository root
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        /// Replace an existing hook not written by sniffer
        #[arg(long)]
        force: bool,
    },

    /// Show the persisted status of a job
    Status {
        /// Job id
        #[arg(long)]
        job: String,

        /// Path to configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(&LogConfig::new().verbose(cli.verbose));

    match cli.command {
        Commands::Sniff(args) => commands::sniff::run(args, JobType::Sniff).await,
        Commands::Fix(args) => commands::sniff::run(args, JobType::Fix).await,
        Commands::Install { config, repo, force } => {
            commands::install::install_hook(&repo, config.as_deref(), force)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status { job, config, json } => commands::status::show_status(&job, config, json),
    }
}
