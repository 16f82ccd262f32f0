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

//! Error taxonomy shared by every sniffer crate

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::job::JobStatus;

/// Result type for sniffer operations
pub type SnifferResult<T> = Result<T, SnifferError>;

/// Failure raised by a domain analyzer while sniffing a file
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalyzerError {
    #[error("Analyzer execution failed: {0}")]
    Execution(String),
    #[error("Analyzer I/O error on {path}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("Analyzer panicked: {0}")]
    Panicked(String),
    #[error("Operation not supported by analyzer: {0}")]
    Unsupported(String),
}

impl AnalyzerError {
    pub fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Invalid or incomplete configuration. Always fatal at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read configuration {path}: {message}")]
    Read { path: PathBuf, message: String },
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
    #[error("Environment variable `{0}` referenced by configuration is not set")]
    MissingEnvVar(String),
    #[error("Invalid configuration value for `{field}`: {reason}")]
    Invalid { field: String, reason: String },
    #[error("Domain `{0}` is enabled but no runner is registered for it")]
    UnregisteredDomain(String),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Top-level error type for scheduling, locking and orchestration
#[derive(Error, Debug)]
pub enum SnifferError {
    #[error("Timed out after {waited:?} waiting for lock on {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),

    #[error("Queue processor `{queue}` crashed: {reason}")]
    QueueProcessorCrash { queue: String, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unknown domain: {0}")]
    UnknownDomain(String),

    #[error("Scheduler is stopped and no longer accepts jobs")]
    SchedulerStopped,

    #[error("Queue `{0}` is closed")]
    QueueClosed(String),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition { job_id: String, from: JobStatus, to: JobStatus },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already exists: {0}")]
    DuplicateJob(String),

    #[error("Priority {0} is out of range (0-9)")]
    InvalidPriority(u8),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SnifferError {
    /// Whether the failure is local to one file or domain and should be
    /// reported as data rather than propagated
    pub fn is_contained(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::Analyzer(_))
    }
}
