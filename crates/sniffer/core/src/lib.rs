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

//! Sniffer core
//!
//! Building blocks shared by the scheduling runtime: configuration, the
//! cross-process file lock, the metrics collector, logging setup, and the
//! domain runners that do the actual analysis.

pub mod config;
pub mod lock;
pub mod logging;
pub mod metrics;
pub mod runner;

pub use config::{DEFAULT_DOMAINS, SnifferConfig};
pub use lock::{FileLock, FileLockGuard, LockMarker};
pub use metrics::{Metadata, MetricsCollector, MetricsSnapshot, OperationSnapshot, OperationTimer};
pub use runner::{AnalysisPool, DomainRegistry, DomainRunner};
